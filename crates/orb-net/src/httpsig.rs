//! HTTP Signatures
//!
//! All inbox POSTs and outbound federation requests carry a `Signature`
//! header over `(request-target) host date digest`, with
//! `Digest: SHA-256=base64(sha256(body))`. Verification rejects stale
//! dates and digest mismatches before touching the signature.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use orb_core::keys::KeyPair;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The fixed header set covered by signatures
pub const SIGNED_HEADERS: &str = "(request-target) host date digest";
/// Signature algorithm label
pub const ALGORITHM: &str = "Ed25519";
/// Default acceptance window for the Date header
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

/// Signature errors
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing header: {0}")]
    MissingHeader(String),
    #[error("malformed signature header: {0}")]
    Malformed(String),
    #[error("digest mismatch")]
    DigestMismatch,
    #[error("date outside acceptance window: {0}")]
    StaleDate(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("unsupported header set: {0}")]
    UnsupportedHeaders(String),
    #[error("signature verification failed")]
    VerificationFailed,
    #[error(transparent)]
    Core(#[from] orb_core::Error),
}

/// `Digest` header value for a request body
pub fn digest_header(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

/// RFC 7231 rendering for the `Date` header
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Result<DateTime<Utc>, SignatureError> {
    DateTime::parse_from_rfc2822(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| SignatureError::Malformed(format!("bad date: {value}")))
}

fn signing_string(method: &str, path_and_query: &str, host: &str, date: &str, digest: &str) -> String {
    format!(
        "(request-target): {} {path_and_query}\nhost: {host}\ndate: {date}\ndigest: {digest}",
        method.to_lowercase()
    )
}

/// Headers produced for a signed request
#[derive(Clone, Debug)]
pub struct SignedHeaders {
    pub date: String,
    pub digest: String,
    pub signature: String,
}

/// Sign a request, producing the `Date`, `Digest`, and `Signature`
/// header values
pub fn sign(
    keypair: &KeyPair,
    key_id: &str,
    method: &str,
    path_and_query: &str,
    host: &str,
    body: &[u8],
) -> SignedHeaders {
    let date = http_date(Utc::now());
    let digest = digest_header(body);
    let input = signing_string(method, path_and_query, host, &date, &digest);
    let signature = format!(
        "keyId=\"{key_id}\",algorithm=\"{ALGORITHM}\",headers=\"{SIGNED_HEADERS}\",signature=\"{}\"",
        BASE64.encode(keypair.sign(input.as_bytes()))
    );
    SignedHeaders {
        date,
        digest,
        signature,
    }
}

/// Parsed `Signature` header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureParams {
    pub key_id: String,
    pub algorithm: String,
    pub headers: String,
    pub signature: Vec<u8>,
}

/// Parse a `Signature` header of the form `k="v",k="v",...`
pub fn parse_signature_header(value: &str) -> Result<SignatureParams, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in value.split(',') {
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| SignatureError::Malformed(value.to_string()))?;
        let v = v.trim().trim_matches('"');
        match k.trim() {
            "keyId" => key_id = Some(v.to_string()),
            "algorithm" => algorithm = Some(v.to_string()),
            "headers" => headers = Some(v.to_string()),
            "signature" => {
                signature = Some(
                    BASE64
                        .decode(v)
                        .map_err(|e| SignatureError::Malformed(e.to_string()))?,
                )
            }
            // unknown parameters are ignored
            _ => {}
        }
    }

    Ok(SignatureParams {
        key_id: key_id.ok_or_else(|| SignatureError::Malformed("missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| ALGORITHM.to_string()),
        headers: headers.unwrap_or_else(|| SIGNED_HEADERS.to_string()),
        signature: signature
            .ok_or_else(|| SignatureError::Malformed("missing signature".to_string()))?,
    })
}

/// Verify a signed request against the sender's public key.
///
/// `date_value` and `digest_value` are the received header values; the
/// digest is recomputed from `body` so a poisoned body fails before
/// signature verification.
#[allow(clippy::too_many_arguments)]
pub fn verify(
    params: &SignatureParams,
    public_key: &[u8; 32],
    method: &str,
    path_and_query: &str,
    host: &str,
    date_value: &str,
    digest_value: &str,
    body: &[u8],
) -> Result<(), SignatureError> {
    if !params.algorithm.eq_ignore_ascii_case(ALGORITHM) {
        return Err(SignatureError::UnsupportedAlgorithm(params.algorithm.clone()));
    }
    if params.headers != SIGNED_HEADERS {
        return Err(SignatureError::UnsupportedHeaders(params.headers.clone()));
    }

    if digest_header(body) != digest_value {
        return Err(SignatureError::DigestMismatch);
    }

    let date = parse_http_date(date_value)?;
    let skew = Utc::now().signed_duration_since(date);
    if skew > Duration::seconds(DEFAULT_MAX_SKEW_SECS)
        || skew < Duration::seconds(-DEFAULT_MAX_SKEW_SECS)
    {
        return Err(SignatureError::StaleDate(date_value.to_string()));
    }

    let sig: [u8; 64] = params
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::VerificationFailed)?;
    let input = signing_string(method, path_and_query, host, date_value, digest_value);
    orb_core::keys::verify(public_key, input.as_bytes(), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = KeyPair::from_seed(&[1; 32]);
        let body = br#"{"type":"Follow"}"#;

        let headers = sign(
            &keypair,
            "https://node-a.example/services/orb/keys/main",
            "POST",
            "/services/orb/inbox",
            "node-b.example",
            body,
        );
        let params = parse_signature_header(&headers.signature).unwrap();
        assert_eq!(params.key_id, "https://node-a.example/services/orb/keys/main");

        verify(
            &params,
            &keypair.public_key(),
            "POST",
            "/services/orb/inbox",
            "node-b.example",
            &headers.date,
            &headers.digest,
            body,
        )
        .unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let keypair = KeyPair::from_seed(&[1; 32]);
        let headers = sign(
            &keypair,
            "https://node-a.example/keys/main",
            "POST",
            "/inbox",
            "node-b.example",
            b"original",
        );
        let params = parse_signature_header(&headers.signature).unwrap();

        let err = verify(
            &params,
            &keypair.public_key(),
            "POST",
            "/inbox",
            "node-b.example",
            &headers.date,
            &headers.digest,
            b"tampered",
        )
        .unwrap_err();
        assert!(matches!(err, SignatureError::DigestMismatch));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let keypair = KeyPair::from_seed(&[1; 32]);
        let other = KeyPair::from_seed(&[2; 32]);
        let headers = sign(
            &keypair,
            "https://node-a.example/keys/main",
            "POST",
            "/inbox",
            "node-b.example",
            b"body",
        );
        let params = parse_signature_header(&headers.signature).unwrap();

        let err = verify(
            &params,
            &other.public_key(),
            "POST",
            "/inbox",
            "node-b.example",
            &headers.date,
            &headers.digest,
            b"body",
        )
        .unwrap_err();
        assert!(matches!(err, SignatureError::VerificationFailed));
    }

    #[test]
    fn test_verify_rejects_stale_date() {
        let keypair = KeyPair::from_seed(&[1; 32]);
        let body = b"body";
        let date = http_date(Utc::now() - Duration::hours(2));
        let digest = digest_header(body);
        let input = signing_string("post", "/inbox", "node-b.example", &date, &digest);
        let params = SignatureParams {
            key_id: "https://node-a.example/keys/main".to_string(),
            algorithm: ALGORITHM.to_string(),
            headers: SIGNED_HEADERS.to_string(),
            signature: keypair.sign(input.as_bytes()).to_vec(),
        };

        let err = verify(
            &params,
            &keypair.public_key(),
            "POST",
            "/inbox",
            "node-b.example",
            &date,
            &digest,
            body,
        )
        .unwrap_err();
        assert!(matches!(err, SignatureError::StaleDate(_)));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(parse_signature_header("algorithm=\"Ed25519\"").is_err());
        assert!(parse_signature_header("garbage").is_err());
    }
}
