//! Content-addressed store and resolver
//!
//! The local store is the sled `cas` tree; the resolver falls back
//! across embedded bytes, hint URLs, peer WebCAS endpoints (round
//! robin), and an IPFS gateway. Every remote retrieval re-hashes the
//! bytes and refuses to persist on mismatch.

use crate::storage::{Storage, StorageError};
use multibase::Base;
use orb_core::hashlink;
use parking_lot::RwLock;
use orb_net::webcas::WebCasClient;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// CAS errors
#[derive(Debug, Error)]
pub enum CasError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("content not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Core(#[from] orb_core::Error),
}

/// Local content-addressed store
#[derive(Clone)]
pub struct CasStore {
    storage: Arc<Storage>,
}

impl CasStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Write bytes and return their hashlink. Idempotent.
    pub fn write(&self, bytes: &[u8]) -> Result<String, CasError> {
        Ok(self.storage.cas_put(bytes)?)
    }

    /// Read bytes by hashlink or bare resource hash
    pub fn read(&self, cas_uri: &str) -> Result<Vec<u8>, CasError> {
        let resource_hash = resource_hash_of(cas_uri)?;
        self.storage
            .cas_get(&resource_hash)?
            .ok_or_else(|| CasError::NotFound(cas_uri.to_string()))
    }

    pub fn contains(&self, cas_uri: &str) -> Result<bool, CasError> {
        Ok(self.storage.cas_has(&resource_hash_of(cas_uri)?)?)
    }
}

fn resource_hash_of(cas_uri: &str) -> Result<String, CasError> {
    if cas_uri.starts_with("hl:") {
        Ok(hashlink::get_resource_hash(cas_uri)?)
    } else {
        // bare multibase resource hash, as it appears in /cas/{hash} paths
        Ok(hashlink::get_resource_hash(&format!("hl:{cas_uri}"))?)
    }
}

/// IPFS gateway fallback. The CID is derived from the multihash: CIDv1,
/// raw codec, base32.
#[derive(Clone)]
pub struct IpfsClient {
    gateway: String,
    http: reqwest::Client,
}

impl IpfsClient {
    pub fn new(gateway: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            gateway: gateway.into(),
            http,
        }
    }

    /// CIDv1 (raw codec 0x55) for the multihash behind a hashlink
    pub fn cid_for(hl: &str) -> Result<String, CasError> {
        let resource_hash = hashlink::get_resource_hash(hl)?;
        let (_, multihash_bytes) = multibase::decode(&resource_hash)
            .map_err(|e| CasError::Core(orb_core::Error::Multibase(e.to_string())))?;
        let mut cid = Vec::with_capacity(2 + multihash_bytes.len());
        cid.push(0x01);
        cid.push(0x55);
        cid.extend_from_slice(&multihash_bytes);
        Ok(multibase::encode(Base::Base32Lower, cid))
    }

    pub async fn fetch(&self, hl: &str) -> Result<Vec<u8>, CasError> {
        let cid = Self::cid_for(hl)?;
        let url = format!("{}/ipfs/{cid}", self.gateway.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CasError::NotFound(format!("{hl}: ipfs fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CasError::NotFound(format!(
                "{hl}: ipfs gateway returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CasError::NotFound(format!("{hl}: ipfs body read failed: {e}")))?
            .to_vec();
        hashlink::verify(&bytes, hl)?;
        Ok(bytes)
    }
}

/// Resolver composing the local store with remote fallbacks
pub struct CasResolver {
    store: CasStore,
    webcas: Option<WebCasClient>,
    /// Peer WebCAS endpoint base URLs, learned from observed anchor
    /// events' `attributedTo` hosts
    peers: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    ipfs: Option<IpfsClient>,
}

impl CasResolver {
    pub fn new(store: CasStore, webcas: Option<WebCasClient>, ipfs: Option<IpfsClient>) -> Self {
        Self {
            store,
            webcas,
            peers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            ipfs,
        }
    }

    pub fn store(&self) -> &CasStore {
        &self.store
    }

    /// Register a peer endpoint for round-robin fallback
    pub fn register_peer(&self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        let mut peers = self.peers.write();
        if !peers.contains(&endpoint) {
            debug!(%endpoint, "registered WebCAS peer");
            peers.push(endpoint);
        }
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    /// Resolve content by hashlink with the full fallback chain:
    /// embedded bytes, local store, hint URL, peer WebCAS endpoints in
    /// round-robin order, then IPFS.
    pub async fn resolve(
        &self,
        cas_uri: &str,
        hint_url: Option<&str>,
        embedded: Option<&[u8]>,
    ) -> Result<Vec<u8>, CasError> {
        // 1. Embedded bytes, verified then persisted
        if let Some(bytes) = embedded.filter(|b| !b.is_empty()) {
            hashlink::verify(bytes, cas_uri)?;
            self.store.write(bytes)?;
            return Ok(bytes.to_vec());
        }

        // 2. Local store
        match self.store.read(cas_uri) {
            Ok(bytes) => return Ok(bytes),
            Err(CasError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // 3. Hint URL
        if let (Some(url), Some(webcas)) = (hint_url, &self.webcas) {
            match webcas.fetch_url(url, cas_uri).await {
                Ok(bytes) => {
                    self.store.write(&bytes)?;
                    return Ok(bytes);
                }
                Err(e) => warn!(%url, %cas_uri, "hint fetch failed: {e}"),
            }
        }

        // 4. Peer WebCAS endpoints, round robin
        if let Some(webcas) = &self.webcas {
            let peers = self.peers();
            if !peers.is_empty() {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
                for i in 0..peers.len() {
                    let endpoint = &peers[(start + i) % peers.len()];
                    match webcas.fetch(endpoint, cas_uri).await {
                        Ok(bytes) => {
                            self.store.write(&bytes)?;
                            return Ok(bytes);
                        }
                        Err(e) => warn!(%endpoint, %cas_uri, "peer fetch failed: {e}"),
                    }
                }
            }
        }

        // 5. IPFS gateway
        if let Some(ipfs) = &self.ipfs {
            match ipfs.fetch(cas_uri).await {
                Ok(bytes) => {
                    self.store.write(&bytes)?;
                    return Ok(bytes);
                }
                Err(e) => warn!(%cas_uri, "ipfs fetch failed: {e}"),
            }
        }

        Err(CasError::NotFound(cas_uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (CasStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        (CasStore::new(storage), dir)
    }

    #[test]
    fn test_read_write_roundtrip() {
        let (cas, _dir) = store();
        let hl = cas.write(b"anchor bytes").unwrap();
        assert_eq!(cas.read(&hl).unwrap(), b"anchor bytes");

        // bare resource hash works too
        let hash = hashlink::get_resource_hash(&hl).unwrap();
        assert_eq!(cas.read(&hash).unwrap(), b"anchor bytes");
    }

    #[test]
    fn test_missing_content_is_not_found() {
        let (cas, _dir) = store();
        let hl = hashlink::create(b"never written");
        assert!(matches!(cas.read(&hl), Err(CasError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolver_verifies_embedded_bytes() {
        let (cas, _dir) = store();
        let resolver = CasResolver::new(cas.clone(), None, None);

        let hl = hashlink::create(b"embedded");
        let bytes = resolver
            .resolve(&hl, None, Some(b"embedded"))
            .await
            .unwrap();
        assert_eq!(bytes, b"embedded");
        // persisted locally on the way through
        assert_eq!(cas.read(&hl).unwrap(), b"embedded");

        let err = resolver
            .resolve(&hl, None, Some(b"poisoned"))
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::Core(orb_core::Error::HashMismatch { .. })));
    }

    #[tokio::test]
    async fn test_resolver_prefers_local() {
        let (cas, _dir) = store();
        let hl = cas.write(b"local").unwrap();
        let resolver = CasResolver::new(cas, None, None);
        assert_eq!(resolver.resolve(&hl, None, None).await.unwrap(), b"local");
    }

    #[test]
    fn test_cid_derivation_is_stable() {
        let hl = hashlink::create(b"content");
        let cid = IpfsClient::cid_for(&hl).unwrap();
        assert!(cid.starts_with('b'));
        assert_eq!(cid, IpfsClient::cid_for(&hl).unwrap());
    }

    #[test]
    fn test_peer_registration_dedups() {
        let (cas, _dir) = store();
        let resolver = CasResolver::new(cas, None, None);
        resolver.register_peer("https://node-b.example");
        resolver.register_peer("https://node-b.example");
        assert_eq!(resolver.peers().len(), 1);
    }
}
