//! WebCAS fetch client
//!
//! Retrieves content-addressed bytes from a peer's `/cas/{hash}`
//! endpoint over signed HTTP. Every fetch re-hashes the response and
//! fails fast on mismatch so a poisoned source can never populate the
//! local store.

use crate::client::{ClientError, SignedClient};
use orb_core::hashlink;
use thiserror::Error;
use tracing::warn;

/// WebCAS errors
#[derive(Debug, Error)]
pub enum WebCasError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("peer {endpoint} returned bytes that do not hash to {requested}")]
    HashMismatch { endpoint: String, requested: String },
    #[error(transparent)]
    Core(#[from] orb_core::Error),
}

impl WebCasError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WebCasError::Client(e) if e.is_transient())
    }
}

/// Client for peer WebCAS endpoints
#[derive(Clone)]
pub struct WebCasClient {
    client: SignedClient,
}

impl WebCasClient {
    pub fn new(client: SignedClient) -> Self {
        Self { client }
    }

    /// URL of a resource on a peer endpoint
    pub fn resource_url(endpoint: &str, resource_hash: &str) -> String {
        format!("{}/cas/{resource_hash}", endpoint.trim_end_matches('/'))
    }

    /// Fetch and verify the content behind a hashlink from one endpoint
    pub async fn fetch(&self, endpoint: &str, hl: &str) -> Result<Vec<u8>, WebCasError> {
        let resource_hash = hashlink::get_resource_hash(hl)?;
        let url = Self::resource_url(endpoint, &resource_hash);
        let bytes = self.client.get_bytes(&url).await?;

        if let Err(e) = hashlink::verify(&bytes, hl) {
            warn!(%endpoint, %hl, "discarding poisoned CAS response: {e}");
            return Err(WebCasError::HashMismatch {
                endpoint: endpoint.to_string(),
                requested: hl.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Fetch and verify from an explicit hint URL
    pub async fn fetch_url(&self, url: &str, hl: &str) -> Result<Vec<u8>, WebCasError> {
        let bytes = self.client.get_bytes(url).await?;
        if let Err(e) = hashlink::verify(&bytes, hl) {
            warn!(%url, %hl, "discarding poisoned CAS response: {e}");
            return Err(WebCasError::HashMismatch {
                endpoint: url.to_string(),
                requested: hl.to_string(),
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_url() {
        assert_eq!(
            WebCasClient::resource_url("https://node-a.example/", "uEiAbc"),
            "https://node-a.example/cas/uEiAbc"
        );
    }
}
