//! Anchor linkset
//!
//! The content-addressed document listing the DIDs affected by one
//! batch plus the parent-anchor references. The linkset's canonical
//! bytes are its identity: the credential bound to a batch carries
//! `hashlink(linkset bytes)` as its subject `href`.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::hashlink;
use serde::{Deserialize, Serialize};

/// Wrapper document holding exactly one anchor link per batch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Linkset {
    pub linkset: Vec<AnchorLink>,
}

/// The bundle anchored in one batch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnchorLink {
    /// Hashlink of the generator-produced content object
    pub anchor: String,
    /// IRI of the originating service
    pub author: String,
    /// Generator profile IRI
    pub profile: String,
    /// Ordered DID references affected by the batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<AnchorItem>,
    /// Parent anchor hashlinks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub up: Vec<String>,
}

/// One affected DID within an anchor link
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnchorItem {
    /// DID URI
    pub href: String,
    /// Hashlink of the previously published anchor for this DID;
    /// absent for create operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

impl Linkset {
    pub fn new(link: AnchorLink) -> Self {
        Self {
            linkset: vec![link],
        }
    }

    /// The single anchor link of this batch
    pub fn link(&self) -> Result<&AnchorLink> {
        match self.linkset.as_slice() {
            [link] => Ok(link),
            _ => Err(Error::Validation(format!(
                "linkset must contain exactly one link, got {}",
                self.linkset.len()
            ))),
        }
    }

    /// Canonical bytes of this linkset
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }

    /// Hashlink identity of this linkset
    pub fn hashlink(&self) -> Result<String> {
        Ok(hashlink::create(&self.canonical_bytes()?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let linkset: Linkset = serde_json::from_slice(bytes)?;
        linkset.link()?;
        Ok(linkset)
    }
}

impl AnchorLink {
    /// Check the anchor against the content object's canonical bytes
    pub fn validate_against_content(&self, content_bytes: &[u8]) -> Result<()> {
        hashlink::verify(content_bytes, &self.anchor)
    }

    /// Previous-anchor hashlinks referenced by non-create items, deduped
    pub fn previous_anchors(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for item in &self.item {
            if let Some(prev) = item.previous.as_deref() {
                if !seen.contains(&prev) {
                    seen.push(prev);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_link() -> AnchorLink {
        let content = json!({"operations": [{"suffix": "EiAAA"}]});
        let bytes = canonical_bytes(&content).unwrap();
        AnchorLink {
            anchor: hashlink::create(&bytes),
            author: "https://node-a.example/services/orb".to_string(),
            profile: "https://w3id.org/orb#v0".to_string(),
            item: vec![
                AnchorItem {
                    href: "did:orb:EiAAA".to_string(),
                    previous: None,
                },
                AnchorItem {
                    href: "did:orb:EiBBB".to_string(),
                    previous: Some("hl:uEiParent".to_string()),
                },
            ],
            up: vec![],
        }
    }

    #[test]
    fn test_linkset_identity_is_stable() {
        let ls = Linkset::new(sample_link());
        assert_eq!(ls.hashlink().unwrap(), ls.hashlink().unwrap());
    }

    #[test]
    fn test_single_link_enforced() {
        let mut ls = Linkset::new(sample_link());
        ls.linkset.push(sample_link());
        assert!(ls.link().is_err());

        let bytes = serde_json::to_vec(&ls).unwrap();
        assert!(Linkset::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_roundtrip_preserves_identity() {
        let ls = Linkset::new(sample_link());
        let bytes = ls.canonical_bytes().unwrap();
        let parsed = Linkset::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.hashlink().unwrap(), ls.hashlink().unwrap());
    }

    #[test]
    fn test_previous_anchors_deduped() {
        let mut link = sample_link();
        link.item.push(AnchorItem {
            href: "did:orb:EiCCC".to_string(),
            previous: Some("hl:uEiParent".to_string()),
        });
        assert_eq!(link.previous_anchors(), vec!["hl:uEiParent"]);
    }
}
