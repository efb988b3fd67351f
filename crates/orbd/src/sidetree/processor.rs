//! DID operation processor
//!
//! Two ingest paths converge on the operation stores: caller-submitted
//! operations (parse → validate → queue for the anchor pipeline) and
//! observed anchor events from peers (validate → persist content →
//! record published operations). Both are idempotent; conflicting
//! concurrent writes surface as `Conflict` and the caller retries after
//! the observed state catches up.

use crate::cas::CasResolver;
use crate::pipeline::{PendingOp, PipelineHandle};
use crate::sidetree::resolver::{DidResolver, ResolutionResult, ResolverError};
use crate::stats::{inc, NodeStats};
use crate::storage::{RefKind, Storage, StorageError};
use chrono::{Duration as ChronoDuration, Utc};
use orb_core::canonical::canonical_bytes;
use orb_core::generator::GeneratorRegistry;
use orb_core::hashlink;
use orb_core::linkset::Linkset;
use orb_core::operation::{AnchoredOperation, Operation, OperationType};
use orb_core::vocab::AnchorEvent;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Processor errors, classified per the error taxonomy
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),
    #[error("core error: {0}")]
    Core(#[from] orb_core::Error),
}

impl From<StorageError> for ProcessorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Conflict(msg) => ProcessorError::Conflict(msg),
            other => ProcessorError::Storage(other),
        }
    }
}

impl ProcessorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::Transient(_))
    }
}

/// Processor tuning
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub max_operation_bytes: usize,
    /// Allowed anchor-origin IRIs; empty allows any origin
    pub allowed_origins: Vec<String>,
    /// Accepted skew for anchor event timestamps
    pub anchor_time_delta_secs: i64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_operation_bytes: 8192,
            allowed_origins: Vec::new(),
            anchor_time_delta_secs: 600,
        }
    }
}

/// Outcome of a caller-submitted operation
#[derive(Debug)]
pub enum IngestOutcome {
    /// Create operations resolve eagerly
    Created(Box<ResolutionResult>),
    /// Non-create operations are accepted into the unpublished store
    Queued { suffix: String },
}

/// The DID operation processor
pub struct OperationProcessor {
    storage: Arc<Storage>,
    resolver: Arc<DidResolver>,
    pipeline: PipelineHandle,
    registry: GeneratorRegistry,
    cas: Arc<CasResolver>,
    http: reqwest::Client,
    service_iri: String,
    config: ProcessorConfig,
    stats: Arc<NodeStats>,
}

impl OperationProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        resolver: Arc<DidResolver>,
        pipeline: PipelineHandle,
        registry: GeneratorRegistry,
        cas: Arc<CasResolver>,
        http: reqwest::Client,
        service_iri: impl Into<String>,
        config: ProcessorConfig,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            storage,
            resolver,
            pipeline,
            registry,
            cas,
            http,
            service_iri: service_iri.into(),
            config,
            stats,
        }
    }

    /// Ingest a caller-submitted operation
    pub async fn ingest(&self, op: Operation) -> Result<IngestOutcome, ProcessorError> {
        op.validate(self.config.max_operation_bytes)
            .map_err(|e| ProcessorError::Validation(e.to_string()))?;
        let suffix = op.suffix()?;

        match op.operation_type {
            OperationType::Create => self.validate_create(&op, &suffix)?,
            _ => self.validate_non_create(&op, &suffix).await?,
        }

        let seq = self.storage.generate_seq()?;
        self.storage
            .queue_unpublished(&suffix, &AnchoredOperation::unpublished(op.clone(), seq))?;
        inc(&self.stats.ops_queued);

        self.pipeline
            .queue(PendingOp {
                suffix: suffix.clone(),
                seq,
                operation: op.clone(),
            })
            .await
            .map_err(|_| ProcessorError::Transient("anchor pipeline backlogged".to_string()))?;

        debug!(%suffix, kind = %op.operation_type, "queued operation");
        match op.operation_type {
            OperationType::Create => Ok(IngestOutcome::Created(Box::new(
                self.resolver.resolve(&suffix)?,
            ))),
            _ => Ok(IngestOutcome::Queued { suffix }),
        }
    }

    fn validate_create(&self, op: &Operation, suffix: &str) -> Result<(), ProcessorError> {
        if !self.config.allowed_origins.is_empty() {
            let origin = op
                .suffix_data
                .as_ref()
                .and_then(|sd| sd.anchor_origin.as_deref())
                .ok_or_else(|| {
                    ProcessorError::Validation("anchorOrigin is required".to_string())
                })?;
            if !self.config.allowed_origins.iter().any(|a| a == origin) {
                return Err(ProcessorError::Validation(format!(
                    "anchor origin {origin} is not allowed"
                )));
            }
        }
        if !self.storage.published_for(suffix)?.is_empty()
            || !self.storage.unpublished_for(suffix)?.is_empty()
        {
            return Err(ProcessorError::Conflict(format!(
                "suffix {suffix} already has an operation chain"
            )));
        }
        Ok(())
    }

    async fn validate_non_create(&self, op: &Operation, suffix: &str) -> Result<(), ProcessorError> {
        let state = self
            .resolver
            .resolve_state(suffix)?
            .ok_or_else(|| ProcessorError::NotFound(suffix.to_string()))?;
        if state.deactivated {
            return Err(ProcessorError::Validation(format!(
                "did {suffix} is deactivated"
            )));
        }

        // Only one pending operation of a given type per suffix: a second
        // one is gated on a commitment that the first will rotate
        let pending = self.storage.unpublished_for(suffix)?;
        if pending
            .iter()
            .any(|p| p.operation.operation_type == op.operation_type)
        {
            return Err(ProcessorError::Conflict(format!(
                "a {} operation for {suffix} is already pending; retry after it anchors",
                op.operation_type
            )));
        }

        // Anchor-origin cross-check: when custody lives elsewhere, refuse
        // if our copy is behind the origin's view
        if let Some(origin) = state.anchor_origin.as_deref() {
            if origin != self.service_iri {
                let (published, unpublished) = self.resolver.operations_for(suffix)?;
                let local_total = published.len() + unpublished.len();
                self.check_origin_not_ahead(origin, suffix, local_total)
                    .await?;
            }
        }
        Ok(())
    }

    async fn check_origin_not_ahead(
        &self,
        origin: &str,
        suffix: &str,
        local_total: usize,
    ) -> Result<(), ProcessorError> {
        let Some(endpoint) = host_endpoint(origin) else {
            return Err(ProcessorError::Validation(format!(
                "bad anchor origin {origin}"
            )));
        };
        let url = format!("{endpoint}/identifiers/did:orb:{suffix}");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ProcessorError::Transient(format!("origin fetch failed: {e}")))?;

        // The origin not knowing the DID means we are ahead, which is fine
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(ProcessorError::Transient(format!(
                "origin returned {} for {url}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProcessorError::Transient(format!("origin response unreadable: {e}")))?;
        let method = &body["didDocumentMetadata"]["method"];
        let remote_total = method["publishedOperations"]
            .as_array()
            .map(Vec::len)
            .unwrap_or(0)
            + method["unpublishedOperations"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0);

        if remote_total > local_total {
            return Err(ProcessorError::Conflict(format!(
                "local copy of {suffix} is behind its anchor origin {origin}"
            )));
        }
        Ok(())
    }

    /// Ingest an observed anchor event from a peer (Create/Announce
    /// path). Persists the linkset and content to CAS and records the
    /// embedded operations as published. Idempotent on the linkset hash.
    pub async fn ingest_anchor_event(&self, event: &AnchorEvent) -> Result<usize, ProcessorError> {
        event
            .validate()
            .map_err(|e| ProcessorError::Validation(e.to_string()))?;
        let index = event
            .index
            .as_deref()
            .ok_or_else(|| ProcessorError::Validation("anchor event has no index".to_string()))?;
        let linkset_hash = hashlink::get_resource_hash(index)?;

        if self.storage.has_anchor(&linkset_hash)? {
            debug!(%index, "anchor already ingested");
            return Ok(0);
        }

        if let Some(published) = event.published {
            let skew = Utc::now().signed_duration_since(published);
            let delta = ChronoDuration::seconds(self.config.anchor_time_delta_secs);
            if skew > delta || skew < -delta {
                return Err(ProcessorError::Validation(format!(
                    "anchor time {published} outside the acceptance window"
                )));
            }
        }

        // Learn the author's WebCAS endpoint before any remote fetch
        if let Some(attributed_to) = event.attributed_to.as_deref() {
            if let Some(endpoint) = host_endpoint(attributed_to) {
                self.cas.register_peer(endpoint);
            }
        }

        // Linkset: embedded or fetched through the fallback chain
        let linkset_att = event.linkset_attachment().ok_or_else(|| {
            ProcessorError::Validation("anchor event has no linkset attachment".to_string())
        })?;
        let embedded = linkset_att
            .content_object
            .as_ref()
            .map(canonical_bytes)
            .transpose()?;
        let linkset_bytes = self
            .cas
            .resolve(index, None, embedded.as_deref())
            .await
            .map_err(|e| ProcessorError::Transient(format!("linkset unavailable: {e}")))?;
        let linkset = Linkset::from_bytes(&linkset_bytes)
            .map_err(|e| ProcessorError::Validation(e.to_string()))?;
        let link = linkset.link()?;

        let generator = self
            .registry
            .get(&link.profile)
            .map_err(|e| ProcessorError::Validation(e.to_string()))?;

        // Content object behind the anchor hashlink
        let content_att = event.attachment_for(&link.anchor);
        let content_embedded = content_att
            .and_then(|a| a.content_object.as_ref())
            .map(canonical_bytes)
            .transpose()?;
        let content_bytes = self
            .cas
            .resolve(&link.anchor, None, content_embedded.as_deref())
            .await
            .map_err(|e| ProcessorError::Transient(format!("anchor content unavailable: {e}")))?;
        let content: serde_json::Value = serde_json::from_slice(&content_bytes)
            .map_err(|e| ProcessorError::Validation(format!("bad anchor content: {e}")))?;

        let payload = generator
            .extract_payload(&content, &link.anchor, &event.parent)
            .map_err(|e| ProcessorError::Validation(e.to_string()))?;

        // Every referenced parent anchor must be reachable
        for previous in link.previous_anchors() {
            let prev_hash = hashlink::get_resource_hash(previous)?;
            if self.storage.has_anchor(&prev_hash)? {
                continue;
            }
            self.cas.resolve(previous, None, None).await.map_err(|_| {
                ProcessorError::Validation(format!(
                    "previous anchor {previous} is not reachable"
                ))
            })?;
        }

        let txn = self.storage.next_txn_number()?;
        let anchor_hl = format!("hl:{linkset_hash}");
        let mut recorded = 0usize;
        for (position, op_ref) in payload.operations.iter().enumerate() {
            let Some(operation) = op_ref.operation.clone() else {
                warn!(suffix = %op_ref.suffix, "anchor content omits the operation body");
                continue;
            };
            self.storage.put_published(&AnchoredOperation {
                operation,
                txn_number: Some(txn),
                op_index: position as u64,
                anchor: Some(anchor_hl.clone()),
            })?;
            recorded += 1;
        }

        self.storage.put_anchor_event(&linkset_hash, event)?;
        if let Some(author) = event.attributed_to.as_deref() {
            self.storage
                .add_reference(RefKind::AnchorCredential, author, index)?;
        }

        info!(%index, txn, operations = recorded, "ingested anchor event");
        Ok(recorded)
    }
}

/// `scheme://host[:port]` of a service IRI
pub fn host_endpoint(iri: &str) -> Option<String> {
    let url = Url::parse(iri).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::{CasResolver, CasStore};
    use crate::pipeline::PipelineCommand;
    use orb_core::generator::{AnchorPayload, Generator, OperationReference, DID_ORB_V0_PROFILE};
    use orb_core::keys::KeyPair;
    use orb_core::operation::{
        canonical_multihash, Delta, DocumentContent, DocumentKey, Patch, PublicKeyJwk, SuffixData,
    };
    use orb_core::vocab::{AnchorObject, AnchorObjectTag};
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    const SERVICE: &str = "https://node-a.example/services/orb";

    struct Fixture {
        processor: OperationProcessor,
        storage: Arc<Storage>,
        rx: mpsc::Receiver<PipelineCommand>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let resolver = Arc::new(DidResolver::new(storage.clone(), "did:orb"));
        let (handle, rx) = PipelineHandle::channel(64);
        let cas = Arc::new(CasResolver::new(CasStore::new(storage.clone()), None, None));
        let processor = OperationProcessor::new(
            storage.clone(),
            resolver,
            handle,
            GeneratorRegistry::default(),
            cas,
            reqwest::Client::new(),
            SERVICE,
            ProcessorConfig::default(),
            Arc::new(NodeStats::default()),
        );
        Fixture {
            processor,
            storage,
            rx,
            _dir: dir,
        }
    }

    fn jwk(key: &KeyPair) -> PublicKeyJwk {
        PublicKeyJwk::from_ed25519(&key.public_key())
    }

    fn create_op(seed: u8) -> Operation {
        let update_key = KeyPair::from_seed(&[seed; 32]);
        let recovery_key = KeyPair::from_seed(&[seed + 1; 32]);
        let delta = Delta {
            patches: vec![Patch::Replace {
                document: DocumentContent {
                    public_keys: vec![DocumentKey {
                        id: "key-1".to_string(),
                        key_type: "Ed25519VerificationKey2020".to_string(),
                        purposes: vec!["authentication".to_string()],
                        public_key_jwk: jwk(&update_key),
                    }],
                    services: vec![],
                },
            }],
            update_commitment: jwk(&update_key).commitment().unwrap(),
        };
        Operation {
            operation_type: OperationType::Create,
            did_suffix: None,
            suffix_data: Some(SuffixData {
                delta_hash: canonical_multihash(&delta).unwrap(),
                recovery_commitment: jwk(&recovery_key).commitment().unwrap(),
                anchor_origin: Some(SERVICE.to_string()),
            }),
            delta: Some(delta),
            signed_data: None,
        }
    }

    #[tokio::test]
    async fn test_create_returns_eager_resolution() {
        let mut fx = fixture();
        let op = create_op(1);
        let suffix = op.suffix().unwrap();

        let outcome = fx.processor.ingest(op).await.unwrap();
        match outcome {
            IngestOutcome::Created(result) => {
                assert_eq!(
                    result.did_document_metadata.canonical_id,
                    format!("did:orb:{suffix}")
                );
            }
            other => panic!("expected Created, got {other:?}"),
        }

        // handed to the pipeline
        let cmd = fx.rx.try_recv().unwrap();
        assert!(matches!(cmd, PipelineCommand::Queue(_)));
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let fx = fixture();
        fx.processor.ingest(create_op(1)).await.unwrap();
        let err = fx.processor.ingest(create_op(1)).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_without_create_is_not_found() {
        let fx = fixture();
        let op = Operation {
            operation_type: OperationType::Update,
            did_suffix: Some("EiMissing".to_string()),
            suffix_data: None,
            delta: Some(Delta {
                patches: vec![],
                update_commitment: canonical_multihash(&"x").unwrap(),
            }),
            signed_data: Some("a.b.c".to_string()),
        };
        let err = fx.processor.ingest(op).await.unwrap_err();
        assert!(matches!(err, ProcessorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_disallowed_origin_rejected() {
        let mut fx = fixture();
        fx.processor.config.allowed_origins = vec!["https://trusted.example".to_string()];
        let err = fx.processor.ingest(create_op(1)).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Validation(_)));
    }

    fn build_anchor_event(ops: Vec<Operation>) -> AnchorEvent {
        let generator = orb_core::generator::DidOrbV0;
        let payload = AnchorPayload {
            namespace: "did:orb".to_string(),
            version: 0,
            author: "https://node-b.example/services/orb".to_string(),
            operations: ops
                .into_iter()
                .map(|op| OperationReference {
                    suffix: op.suffix().unwrap(),
                    operation_type: op.operation_type,
                    previous: None,
                    operation: Some(op),
                })
                .collect(),
            parents: vec![],
        };
        let content = generator.create_content(&payload).unwrap();
        let content_bytes = canonical_bytes(&content).unwrap();
        let link = generator.build_link(&payload, &content_bytes);
        let anchor = link.anchor.clone();
        let linkset = Linkset::new(link);
        let linkset_bytes = linkset.canonical_bytes().unwrap();
        let index = hashlink::create(&linkset_bytes);

        let mut event = AnchorEvent::new(index.clone(), "https://node-b.example/services/orb");
        event.published = Some(Utc::now());
        event.attachment.push(AnchorObject {
            tag: AnchorObjectTag::AnchorObject,
            url: index,
            content_object: Some(serde_json::to_value(&linkset).unwrap()),
            generator: Some(DID_ORB_V0_PROFILE.to_string()),
        });
        event.attachment.push(AnchorObject {
            tag: AnchorObjectTag::AnchorObject,
            url: anchor,
            content_object: Some(content),
            generator: Some(DID_ORB_V0_PROFILE.to_string()),
        });
        event
    }

    #[tokio::test]
    async fn test_ingest_anchor_event_records_published_ops() {
        let fx = fixture();
        let op = create_op(3);
        let suffix = op.suffix().unwrap();
        let event = build_anchor_event(vec![op]);

        let recorded = fx.processor.ingest_anchor_event(&event).await.unwrap();
        assert_eq!(recorded, 1);

        let published = fx.storage.published_for(&suffix).unwrap();
        assert_eq!(published.len(), 1);
        assert!(published[0].anchor.is_some());

        // peer endpoint learned from attributedTo
        assert!(fx
            .processor
            .cas
            .peers()
            .contains(&"https://node-b.example".to_string()));

        // second delivery of the same event is a no-op
        let again = fx.processor.ingest_anchor_event(&event).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_stale_anchor_time() {
        let fx = fixture();
        let mut event = build_anchor_event(vec![create_op(5)]);
        event.published = Some(Utc::now() - ChronoDuration::hours(2));

        let err = fx.processor.ingest_anchor_event(&event).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Validation(_)));
    }

    #[test]
    fn test_host_endpoint() {
        assert_eq!(
            host_endpoint("https://node-b.example/services/orb").unwrap(),
            "https://node-b.example"
        );
        assert_eq!(
            host_endpoint("http://localhost:9220/services/orb").unwrap(),
            "http://localhost:9220"
        );
        assert!(host_endpoint("not a url").is_none());
    }
}
