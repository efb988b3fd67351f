//! Hashlink codec
//!
//! Content-addressed URIs of the form
//! `hl:<multibase(multihash(bytes))>[:<multibase(metadata)>]`.
//!
//! The multihash algorithm is SHA2-256 (code 0x12); links are emitted
//! with the base64url multibase (prefix `u`), the same encoding that
//! appears in canonical `did:orb:u…:Ei…` identifiers, whose anchor
//! segment is this multihash. Parsing accepts any multibase since the
//! encoding is self-describing; a base58btc link normalizes to the
//! same resource hash. The optional metadata segment carries retrieval
//! hints and MUST NOT participate in equality.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use multibase::Base;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// URI scheme for hashlinks
pub const SCHEME: &str = "hl";
/// Multihash code for SHA2-256
pub const MULTIHASH_SHA2_256: u8 = 0x12;
/// SHA2-256 digest length
pub const MULTIHASH_SHA2_256_LEN: u8 = 0x20;

/// Retrieval hints carried in the metadata segment
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct Metadata {
    url: Vec<String>,
}

/// Compute the SHA2-256 multihash of raw bytes.
pub fn multihash(bytes: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(bytes);
    let mut out = Vec::with_capacity(2 + digest.len());
    out.push(MULTIHASH_SHA2_256);
    out.push(MULTIHASH_SHA2_256_LEN);
    out.extend_from_slice(&digest);
    out
}

/// Multibase-encoded multihash of the given bytes (the resource hash).
pub fn resource_hash(bytes: &[u8]) -> String {
    multibase::encode(Base::Base64Url, multihash(bytes))
}

/// Create a canonical hashlink (no metadata) for the given bytes.
pub fn create(bytes: &[u8]) -> String {
    format!("{SCHEME}:{}", resource_hash(bytes))
}

/// Create a hashlink carrying retrieval hints in the metadata segment.
pub fn create_with_hints(bytes: &[u8], hints: &[String]) -> Result<String> {
    if hints.is_empty() {
        return Ok(create(bytes));
    }
    let meta = Metadata { url: hints.to_vec() };
    let encoded = multibase::encode(Base::Base64Url, canonical_bytes(&meta)?);
    Ok(format!("{SCHEME}:{}:{encoded}", resource_hash(bytes)))
}

/// A parsed hashlink. Equality and hashing ignore the retrieval hints.
#[derive(Clone, Debug, Eq)]
pub struct Hashlink {
    /// Normalized resource hash (base64url multibase of the multihash)
    pub resource_hash: String,
    /// Retrieval hints from the metadata segment, if any
    pub links: Vec<String>,
}

impl PartialEq for Hashlink {
    fn eq(&self, other: &Self) -> bool {
        self.resource_hash == other.resource_hash
    }
}

impl std::hash::Hash for Hashlink {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.resource_hash.hash(state);
    }
}

impl Hashlink {
    /// Canonical `hl:` rendering without metadata.
    pub fn canonical(&self) -> String {
        format!("{SCHEME}:{}", self.resource_hash)
    }
}

fn decode_multihash_segment(segment: &str) -> Result<Vec<u8>> {
    let (_, decoded) =
        multibase::decode(segment).map_err(|e| Error::Multibase(e.to_string()))?;
    if decoded.len() != 2 + MULTIHASH_SHA2_256_LEN as usize
        || decoded[0] != MULTIHASH_SHA2_256
        || decoded[1] != MULTIHASH_SHA2_256_LEN
    {
        return Err(Error::InvalidHashlink(format!(
            "not a SHA2-256 multihash: {segment}"
        )));
    }
    Ok(decoded)
}

/// Parse a hashlink URI into its resource hash and retrieval hints.
///
/// The resource hash is normalized to base64url so links encoded with a
/// different multibase compare equal.
pub fn parse(hl: &str) -> Result<Hashlink> {
    let rest = hl
        .strip_prefix("hl:")
        .ok_or_else(|| Error::InvalidHashlink(hl.to_string()))?;
    let mut parts = rest.splitn(2, ':');
    let hash_segment = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidHashlink(hl.to_string()))?;

    let decoded = decode_multihash_segment(hash_segment)?;
    let resource_hash = multibase::encode(Base::Base64Url, decoded);

    let links = match parts.next() {
        None => Vec::new(),
        Some(meta_segment) => {
            let (_, meta_bytes) = multibase::decode(meta_segment)
                .map_err(|e| Error::Multibase(e.to_string()))?;
            let meta: Metadata = serde_json::from_slice(&meta_bytes)?;
            meta.url
        }
    };

    Ok(Hashlink {
        resource_hash,
        links,
    })
}

/// Extract the normalized resource hash from a hashlink URI.
pub fn get_resource_hash(hl: &str) -> Result<String> {
    parse(hl).map(|h| h.resource_hash)
}

/// Verify that bytes hash to the resource hash of the given hashlink.
pub fn verify(bytes: &[u8], hl: &str) -> Result<()> {
    let parsed = parse(hl)?;
    let computed = resource_hash(bytes);
    if computed != parsed.resource_hash {
        return Err(Error::HashMismatch {
            computed,
            transmitted: parsed.resource_hash,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_parse_roundtrip() {
        let hl = create(b"hello world");
        assert!(hl.starts_with("hl:u"));

        let parsed = parse(&hl).unwrap();
        assert!(parsed.links.is_empty());
        assert_eq!(parsed.canonical(), hl);
    }

    #[test]
    fn test_same_bytes_same_link() {
        assert_eq!(create(b"content"), create(b"content"));
        assert_ne!(create(b"content"), create(b"other"));
    }

    #[test]
    fn test_metadata_excluded_from_equality() {
        let plain = parse(&create(b"content")).unwrap();
        let hinted = parse(
            &create_with_hints(b"content", &["https://node-a.example/cas".to_string()]).unwrap(),
        )
        .unwrap();

        assert_eq!(plain, hinted);
        assert_eq!(hinted.links, vec!["https://node-a.example/cas".to_string()]);
    }

    #[test]
    fn test_verify() {
        let hl = create(b"payload");
        verify(b"payload", &hl).unwrap();

        let err = verify(b"tampered", &hl).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
    }

    #[test]
    fn test_parse_accepts_base58() {
        // Self-describing multibase: a base58btc rendering of the same
        // multihash must normalize to the base64url resource hash.
        let mh = multihash(b"content");
        let b58 = format!("hl:{}", multibase::encode(Base::Base58Btc, &mh));
        let parsed = parse(&b58).unwrap();
        assert_eq!(parsed.resource_hash, resource_hash(b"content"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("not-a-hashlink").is_err());
        assert!(parse("hl:").is_err());
        assert!(parse("hl:u0000").is_err());
    }
}
