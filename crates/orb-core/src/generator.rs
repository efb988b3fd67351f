//! Anchor content generators
//!
//! A generator is identified by an IRI that pins a schema version, a DID
//! namespace, and a content-object shape. Receivers dispatch on the
//! profile IRI embedded in anchor documents and refuse unknown profiles;
//! older generators stay addressable so version skew is handled by
//! registration, not by changing the core types.

use crate::error::{Error, Result};
use crate::hashlink;
use crate::linkset::{AnchorItem, AnchorLink, Linkset};
use crate::operation::{Operation, OperationType};
use crate::vc::VerifiableCredential;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Profile IRI of the v0 `did:orb` generator
pub const DID_ORB_V0_PROFILE: &str = "https://w3id.org/orb#v0";
/// DID namespace of the v0 generator
pub const DID_ORB_NAMESPACE: &str = "did:orb";

/// The batch payload a generator turns into a content object
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnchorPayload {
    pub namespace: String,
    pub version: u64,
    /// IRI of the originating service
    pub author: String,
    /// Ordered operation references, already sorted by `(suffix, seq)`
    pub operations: Vec<OperationReference>,
    /// Parent anchor hashlinks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// One operation within an anchor payload
///
/// The full operation is embedded so a batch content object is
/// self-contained: peers ingest the operations straight from the
/// anchored content without a side channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationReference {
    pub suffix: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    /// Hashlink of the previously published anchor for this suffix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

impl AnchorPayload {
    /// DID URI for an operation reference under this payload's namespace
    pub fn did_uri(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.namespace)
    }
}

/// Versioned anchor-content codec
pub trait Generator: Send + Sync + std::fmt::Debug {
    /// Profile IRI pinning this generator's schema version
    fn profile(&self) -> &'static str;

    /// DID namespace this generator anchors
    fn namespace(&self) -> &'static str;

    /// Schema version
    fn version(&self) -> u64;

    /// Build the content object for a batch payload
    fn create_content(&self, payload: &AnchorPayload) -> Result<serde_json::Value>;

    /// Recover the payload from a content object fetched by anchor URI
    fn extract_payload(
        &self,
        content: &serde_json::Value,
        anchor: &str,
        parents: &[String],
    ) -> Result<AnchorPayload>;

    /// Validate a credential against the linkset bytes it is bound to
    fn validate_credential(&self, vc: &VerifiableCredential, linkset_bytes: &[u8]) -> Result<()>;

    /// Assemble the anchor link for a payload and its content bytes
    fn build_link(&self, payload: &AnchorPayload, content_bytes: &[u8]) -> AnchorLink {
        AnchorLink {
            anchor: hashlink::create(content_bytes),
            author: payload.author.clone(),
            profile: self.profile().to_string(),
            item: payload
                .operations
                .iter()
                .map(|op| AnchorItem {
                    href: payload.did_uri(&op.suffix),
                    previous: op.previous.clone(),
                })
                .collect(),
            up: payload.parents.clone(),
        }
    }
}

/// The v0 `did:orb` generator: the content object is the payload itself,
/// canonically encoded
#[derive(Debug)]
pub struct DidOrbV0;

impl Generator for DidOrbV0 {
    fn profile(&self) -> &'static str {
        DID_ORB_V0_PROFILE
    }

    fn namespace(&self) -> &'static str {
        DID_ORB_NAMESPACE
    }

    fn version(&self) -> u64 {
        0
    }

    fn create_content(&self, payload: &AnchorPayload) -> Result<serde_json::Value> {
        if payload.namespace != self.namespace() {
            return Err(Error::Validation(format!(
                "namespace {} not handled by {}",
                payload.namespace,
                self.profile()
            )));
        }
        if payload.operations.is_empty() {
            return Err(Error::Validation("empty anchor payload".to_string()));
        }
        Ok(serde_json::to_value(payload)?)
    }

    fn extract_payload(
        &self,
        content: &serde_json::Value,
        anchor: &str,
        parents: &[String],
    ) -> Result<AnchorPayload> {
        let payload: AnchorPayload = serde_json::from_value(content.clone())?;
        if payload.namespace != self.namespace() || payload.version != self.version() {
            return Err(Error::UnknownProfile(format!(
                "{}#v{}",
                payload.namespace, payload.version
            )));
        }

        // Every parent referenced by a non-create item must be announced
        // in the carrier's parent list
        let known: Vec<&str> = parents.iter().map(String::as_str).collect();
        for op in &payload.operations {
            if let Some(prev) = op.previous.as_deref() {
                let prev_hash = hashlink::get_resource_hash(prev)?;
                let announced = known
                    .iter()
                    .any(|p| hashlink::get_resource_hash(p).ok().as_deref() == Some(&prev_hash));
                if !announced {
                    return Err(Error::Validation(format!(
                        "previous anchor {prev} of {} not in parent list",
                        op.suffix
                    )));
                }
            }
        }

        let content_bytes = crate::canonical::canonical_bytes(content)?;
        hashlink::verify(&content_bytes, anchor)?;

        Ok(payload)
    }

    fn validate_credential(&self, vc: &VerifiableCredential, linkset_bytes: &[u8]) -> Result<()> {
        hashlink::verify(linkset_bytes, &vc.credential_subject.href)?;
        if vc.credential_subject.profile != self.profile() {
            return Err(Error::UnknownProfile(vc.credential_subject.profile.clone()));
        }

        let linkset = Linkset::from_bytes(linkset_bytes)?;
        let link = linkset.link()?;
        if hashlink::get_resource_hash(&link.anchor)?
            != hashlink::get_resource_hash(&vc.credential_subject.anchor)?
        {
            return Err(Error::Validation(
                "credential anchor does not match linkset anchor".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry mapping profile IRI to generator
#[derive(Clone)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            generators: HashMap::new(),
        };
        registry.register(Arc::new(DidOrbV0));
        registry
    }
}

impl GeneratorRegistry {
    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        self.generators
            .insert(generator.profile().to_string(), generator);
    }

    /// Look up a generator; unknown profiles are refused
    pub fn get(&self, profile: &str) -> Result<Arc<dyn Generator>> {
        self.generators
            .get(profile)
            .cloned()
            .ok_or_else(|| Error::UnknownProfile(profile.to_string()))
    }

    pub fn profiles(&self) -> Vec<&str> {
        self.generators.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonical_bytes;

    fn sample_payload() -> AnchorPayload {
        AnchorPayload {
            namespace: DID_ORB_NAMESPACE.to_string(),
            version: 0,
            author: "https://node-a.example/services/orb".to_string(),
            operations: vec![
                OperationReference {
                    suffix: "EiAAA".to_string(),
                    operation_type: OperationType::Create,
                    previous: None,
                    operation: None,
                },
                OperationReference {
                    suffix: "EiBBB".to_string(),
                    operation_type: OperationType::Update,
                    previous: Some("hl:uEiDw7dkmrpuZxKCb9hQ5wIKQ7lR9Rd4zahO1f7hwFE99rA".to_string()),
                    operation: None,
                },
            ],
            parents: vec!["hl:uEiDw7dkmrpuZxKCb9hQ5wIKQ7lR9Rd4zahO1f7hwFE99rA".to_string()],
        }
    }

    #[test]
    fn test_content_roundtrip() {
        let generator = DidOrbV0;
        let payload = sample_payload();

        let content = generator.create_content(&payload).unwrap();
        let bytes = canonical_bytes(&content).unwrap();
        let anchor = hashlink::create(&bytes);

        let extracted = generator
            .extract_payload(&content, &anchor, &payload.parents)
            .unwrap();
        assert_eq!(extracted, payload);
    }

    #[test]
    fn test_extract_rejects_wrong_anchor() {
        let generator = DidOrbV0;
        let payload = sample_payload();
        let content = generator.create_content(&payload).unwrap();

        let wrong = hashlink::create(b"unrelated");
        assert!(generator
            .extract_payload(&content, &wrong, &payload.parents)
            .is_err());
    }

    #[test]
    fn test_extract_rejects_unannounced_parent() {
        let generator = DidOrbV0;
        let payload = sample_payload();
        let content = generator.create_content(&payload).unwrap();
        let bytes = canonical_bytes(&content).unwrap();
        let anchor = hashlink::create(&bytes);

        assert!(generator.extract_payload(&content, &anchor, &[]).is_err());
    }

    #[test]
    fn test_registry_refuses_unknown_profile() {
        let registry = GeneratorRegistry::default();
        assert!(registry.get(DID_ORB_V0_PROFILE).is_ok());

        let err = registry.get("https://w3id.org/orb#v9").unwrap_err();
        assert!(matches!(err, Error::UnknownProfile(_)));
    }

    #[test]
    fn test_build_link_preserves_operation_order() {
        let generator = DidOrbV0;
        let payload = sample_payload();
        let content = generator.create_content(&payload).unwrap();
        let bytes = canonical_bytes(&content).unwrap();

        let link = generator.build_link(&payload, &bytes);
        assert_eq!(link.item.len(), 2);
        assert_eq!(link.item[0].href, "did:orb:EiAAA");
        assert_eq!(link.item[1].previous, payload.operations[1].previous);
        assert_eq!(link.up, payload.parents);
    }
}
