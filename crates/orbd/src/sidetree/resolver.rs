//! DID resolution
//!
//! Resolution walks the published operation log for a suffix in
//! `(txnNumber, opIndex)` order, appends the unpublished tail, and folds
//! the sequence with the pure applier. The fold never suspends; all I/O
//! happens against the local stores.

use crate::storage::{Storage, StorageError};
use orb_core::hashlink;
use orb_core::operation::{
    apply_operations, AnchoredOperation, DidState, DocumentContent, OperationType,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("did not found: {0}")]
    NotFound(String),
    #[error("invalid did: {0}")]
    InvalidDid(String),
    #[error("core error: {0}")]
    Core(#[from] orb_core::Error),
}

/// Summary of one operation in the resolution metadata
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl From<&AnchoredOperation> for OperationSummary {
    fn from(op: &AnchoredOperation) -> Self {
        Self {
            operation_type: op.operation.operation_type,
            transaction_number: op.txn_number,
            anchor: op.anchor.clone(),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Method-specific resolution metadata
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MethodMetadata {
    pub published: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_commitment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_commitment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_origin: Option<String>,
    pub published_operations: Vec<OperationSummary>,
    pub unpublished_operations: Vec<OperationSummary>,
}

/// Document metadata of a resolution result
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub canonical_id: String,
    pub equivalent_id: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub deactivated: bool,
    pub method: MethodMetadata,
}

/// `{document, documentMetadata}` returned to resolution callers
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub did_document: serde_json::Value,
    pub did_document_metadata: DocumentMetadata,
}

/// Resolves DIDs from the local operation stores
pub struct DidResolver {
    storage: Arc<Storage>,
    namespace: String,
}

impl DidResolver {
    pub fn new(storage: Arc<Storage>, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
        }
    }

    /// Extract the suffix from `did:orb:<suffix>`,
    /// `did:orb:<anchor>:<suffix>`, or a bare suffix
    pub fn parse_suffix(&self, did_or_suffix: &str) -> Result<String, ResolverError> {
        if let Some(rest) = did_or_suffix.strip_prefix(&format!("{}:", self.namespace)) {
            let suffix = rest.rsplit(':').next().unwrap_or(rest);
            if suffix.is_empty() {
                return Err(ResolverError::InvalidDid(did_or_suffix.to_string()));
            }
            return Ok(suffix.to_string());
        }
        if did_or_suffix.contains(':') || did_or_suffix.is_empty() {
            return Err(ResolverError::InvalidDid(did_or_suffix.to_string()));
        }
        Ok(did_or_suffix.to_string())
    }

    /// Full ordered operation log for a suffix: published then unpublished
    pub fn operations_for(
        &self,
        suffix: &str,
    ) -> Result<(Vec<AnchoredOperation>, Vec<AnchoredOperation>), ResolverError> {
        Ok((
            self.storage.published_for(suffix)?,
            self.storage.unpublished_for(suffix)?,
        ))
    }

    /// Folded state for a suffix, or None when no create has been seen
    pub fn resolve_state(&self, suffix: &str) -> Result<Option<DidState>, ResolverError> {
        let (published, unpublished) = self.operations_for(suffix)?;
        let mut ops = published;
        ops.extend(unpublished);
        Ok(apply_operations(&ops))
    }

    /// Resolve a DID URI or suffix to a document plus metadata
    pub fn resolve(&self, did_or_suffix: &str) -> Result<ResolutionResult, ResolverError> {
        let suffix = self.parse_suffix(did_or_suffix)?;
        let (published, unpublished) = self.operations_for(&suffix)?;
        if published.is_empty() && unpublished.is_empty() {
            return Err(ResolverError::NotFound(suffix));
        }

        let mut ops = published.clone();
        ops.extend(unpublished.clone());
        let state =
            apply_operations(&ops).ok_or_else(|| ResolverError::NotFound(suffix.clone()))?;

        let interim_id = format!("{}:{suffix}", self.namespace);
        let canonical_id = match &state.last_anchor {
            Some(anchor) => {
                let hash = hashlink::get_resource_hash(anchor)?;
                format!("{}:{hash}:{suffix}", self.namespace)
            }
            None => interim_id.clone(),
        };
        let mut equivalent_id = vec![interim_id];
        if !equivalent_id.contains(&canonical_id) {
            equivalent_id.push(canonical_id.clone());
        }

        Ok(ResolutionResult {
            did_document: render_document(&canonical_id, &state),
            did_document_metadata: DocumentMetadata {
                canonical_id,
                equivalent_id,
                deactivated: state.deactivated,
                method: MethodMetadata {
                    published: state.published,
                    update_commitment: state.update_commitment.clone(),
                    recovery_commitment: state.recovery_commitment.clone(),
                    anchor_origin: state.anchor_origin.clone(),
                    published_operations: published.iter().map(OperationSummary::from).collect(),
                    unpublished_operations: unpublished
                        .iter()
                        .map(OperationSummary::from)
                        .collect(),
                },
            },
        })
    }
}

fn render_document(did: &str, state: &DidState) -> serde_json::Value {
    if state.deactivated {
        return json!({
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": did,
        });
    }
    render_content(did, &state.document)
}

fn render_content(did: &str, content: &DocumentContent) -> serde_json::Value {
    let verification_methods: Vec<serde_json::Value> = content
        .public_keys
        .iter()
        .map(|k| {
            json!({
                "id": format!("{did}#{}", k.id),
                "type": k.key_type,
                "controller": did,
                "publicKeyJwk": k.public_key_jwk,
            })
        })
        .collect();
    let services: Vec<serde_json::Value> = content
        .services
        .iter()
        .map(|s| {
            json!({
                "id": format!("{did}#{}", s.id),
                "type": s.service_type,
                "serviceEndpoint": s.service_endpoint,
            })
        })
        .collect();

    json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": did,
        "verificationMethod": verification_methods,
        "service": services,
    })
}
