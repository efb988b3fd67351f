//! Signed HTTP client
//!
//! All outbound federation traffic (inbox POSTs, WebCAS fetches, actor
//! lookups on authenticated endpoints) goes through this client, which
//! attaches `Date`, `Digest`, and `Signature` headers per request.

use crate::httpsig::{self, SignatureError};
use orb_core::keys::KeyPair;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Media type for activity bodies
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("url has no host: {0}")]
    NoHost(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
}

impl ClientError {
    /// Whether a retry can be expected to succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

fn host_header(url: &Url) -> Result<String, ClientError> {
    let host = url
        .host_str()
        .ok_or_else(|| ClientError::NoHost(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

/// HTTP client that signs every request with the service key
#[derive(Clone)]
pub struct SignedClient {
    http: reqwest::Client,
    keypair: KeyPair,
    key_id: String,
}

impl SignedClient {
    pub fn new(
        keypair: KeyPair,
        key_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            keypair,
            key_id: key_id.into(),
        })
    }

    /// The underlying pool, for unsigned traffic (public actor lookups)
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    fn signed_headers(
        &self,
        method: &str,
        url: &Url,
        body: &[u8],
    ) -> Result<httpsig::SignedHeaders, ClientError> {
        Ok(httpsig::sign(
            &self.keypair,
            &self.key_id,
            method,
            &path_and_query(url),
            &host_header(url)?,
            body,
        ))
    }

    /// Signed POST with an activity-JSON body; 2xx is success
    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<reqwest::Response, ClientError> {
        let parsed = Url::parse(url)?;
        let headers = self.signed_headers("POST", &parsed, &body)?;

        let response = self
            .http
            .post(parsed)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Accept", ACTIVITY_JSON)
            .header("Date", headers.date)
            .header("Digest", headers.digest)
            .header("Signature", headers.signature)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Signed GET returning the raw body; 2xx is success
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let parsed = Url::parse(url)?;
        let headers = self.signed_headers("GET", &parsed, &[])?;

        let response = self
            .http
            .get(parsed)
            .header("Accept", "application/octet-stream")
            .header("Date", headers.date)
            .header("Digest", headers.digest)
            .header("Signature", headers.signature)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
