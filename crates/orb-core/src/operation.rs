//! Sidetree operation model and the pure document applier
//!
//! Operations are user-authored intents over a DID suffix. The suffix
//! for a create is content-derived:
//! `suffix = multihash(canonical(suffixData))`, base64url encoded, which
//! commits to both the delta hash and the recovery commitment. The
//! applier folds an ordered operation log into a document state; it is
//! pure, and a mismatched commitment causes the op to be skipped, never
//! the fold to abort.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::hashlink;
use crate::keys::KeyPair;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// =============================================================================
// MULTIHASH ENCODING (Sidetree style: base64url, no multibase prefix)
// =============================================================================

/// Base64url-encoded SHA2-256 multihash of raw bytes
pub fn encode_multihash(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(hashlink::multihash(bytes))
}

/// Commitment/hash over the canonical form of a value
pub fn canonical_multihash<T: Serialize>(value: &T) -> Result<String> {
    Ok(encode_multihash(&canonical_bytes(value)?))
}

/// Check that a string is a well-formed base64url SHA2-256 multihash
pub fn is_encoded_multihash(s: &str) -> bool {
    match URL_SAFE_NO_PAD.decode(s) {
        Ok(bytes) => {
            bytes.len() == 2 + hashlink::MULTIHASH_SHA2_256_LEN as usize
                && bytes[0] == hashlink::MULTIHASH_SHA2_256
                && bytes[1] == hashlink::MULTIHASH_SHA2_256_LEN
        }
        Err(_) => false,
    }
}

// =============================================================================
// OPERATION TYPES
// =============================================================================

/// Sidetree operation kinds
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Recover,
    Deactivate,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Create => f.write_str("create"),
            OperationType::Update => f.write_str("update"),
            OperationType::Recover => f.write_str("recover"),
            OperationType::Deactivate => f.write_str("deactivate"),
        }
    }
}

/// Minimal JWK; the allowed signature algorithm set is EdDSA over Ed25519
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

impl PublicKeyJwk {
    pub fn from_ed25519(public_key: &[u8; 32]) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(public_key),
        }
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32]> {
        if self.kty != "OKP" || self.crv != "Ed25519" {
            return Err(Error::InvalidPublicKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.x)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| Error::InvalidPublicKey("bad key length".to_string()))
    }

    /// Commitment to this key: multihash over its canonical form
    pub fn commitment(&self) -> Result<String> {
        canonical_multihash(self)
    }
}

/// Create-operation suffix data; hashing it yields the DID suffix
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuffixData {
    /// Multihash of the create delta
    pub delta_hash: String,
    /// Commitment to the next recovery key
    pub recovery_commitment: String,
    /// Service IRI holding long-term custody of this DID's update chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_origin: Option<String>,
}

/// Patch set plus the commitment to the next update key
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub patches: Vec<Patch>,
    pub update_commitment: String,
}

/// Document patch actions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Patch {
    #[serde(rename_all = "camelCase")]
    AddPublicKeys { public_keys: Vec<DocumentKey> },
    #[serde(rename_all = "camelCase")]
    RemovePublicKeys { ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    AddServices { services: Vec<DocumentService> },
    #[serde(rename_all = "camelCase")]
    RemoveServices { ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Replace { document: DocumentContent },
}

/// A verification key within a DID document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub purposes: Vec<String>,
    pub public_key_jwk: PublicKeyJwk,
}

/// A service endpoint within a DID document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: String,
}

/// The replaceable content of a DID document
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<DocumentKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<DocumentService>,
}

// =============================================================================
// SIGNED DATA (compact JWS payloads per operation type)
// =============================================================================

/// Update payload: reveals the update key and commits to the delta
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSignedData {
    pub update_key: PublicKeyJwk,
    pub delta_hash: String,
}

/// Recover payload: reveals the recovery key, rotates it, commits to the delta
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoverSignedData {
    pub recovery_key: PublicKeyJwk,
    pub recovery_commitment: String,
    pub delta_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_origin: Option<String>,
}

/// Deactivate payload: reveals the recovery key for a terminal tombstone
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeactivateSignedData {
    pub did_suffix: String,
    pub recovery_key: PublicKeyJwk,
}

/// Compact JWS with an EdDSA protected header
pub mod jws {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct ProtectedHeader {
        alg: String,
    }

    /// Sign a payload into compact JWS form
    pub fn sign<T: Serialize>(payload: &T, key: &KeyPair) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(canonical_bytes(&ProtectedHeader {
            alg: "EdDSA".to_string(),
        })?);
        let body = URL_SAFE_NO_PAD.encode(canonical_bytes(payload)?);
        let signing_input = format!("{header}.{body}");
        let signature = URL_SAFE_NO_PAD.encode(key.sign(signing_input.as_bytes()));
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Decode the payload without verifying the signature
    pub fn decode_payload<T: DeserializeOwned>(compact: &str) -> Result<T> {
        let (_, body, _) = split(compact)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| Error::Validation(format!("bad JWS payload encoding: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Verify the signature against the given key and decode the payload
    pub fn verify<T: DeserializeOwned>(compact: &str, key: &PublicKeyJwk) -> Result<T> {
        let (header, body, signature) = split(compact)?;

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|e| Error::Validation(format!("bad JWS header encoding: {e}")))?;
        let parsed: ProtectedHeader = serde_json::from_slice(&header_bytes)?;
        if parsed.alg != "EdDSA" {
            return Err(Error::Validation(format!(
                "signature algorithm not allowed: {}",
                parsed.alg
            )));
        }

        let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| Error::Validation(format!("bad JWS signature encoding: {e}")))?
            .try_into()
            .map_err(|_| Error::InvalidSignature)?;

        let signing_input = format!("{header}.{body}");
        crate::keys::verify(
            &key.public_key_bytes()?,
            signing_input.as_bytes(),
            &sig_bytes,
        )?;

        decode_payload(compact)
    }

    fn split(compact: &str) -> Result<(&str, &str, &str)> {
        let mut parts = compact.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(b), Some(s), None) => Ok((h, b, s)),
            _ => Err(Error::Validation("malformed compact JWS".to_string())),
        }
    }
}

// =============================================================================
// OPERATION
// =============================================================================

/// A user-authored DID operation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    /// DID suffix; required for non-create, derived for create
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did_suffix: Option<String>,
    /// Create only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix_data: Option<SuffixData>,
    /// Create, update, recover
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    /// Compact JWS; update, recover, deactivate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_data: Option<String>,
}

impl Operation {
    /// Derive the content-derived suffix for create suffix data
    pub fn unique_suffix(suffix_data: &SuffixData) -> Result<String> {
        canonical_multihash(suffix_data)
    }

    /// The suffix this operation addresses
    pub fn suffix(&self) -> Result<String> {
        match self.operation_type {
            OperationType::Create => {
                let suffix_data = self
                    .suffix_data
                    .as_ref()
                    .ok_or_else(|| Error::MissingField("suffixData".to_string()))?;
                Self::unique_suffix(suffix_data)
            }
            _ => self
                .did_suffix
                .clone()
                .ok_or_else(|| Error::MissingField("didSuffix".to_string())),
        }
    }

    /// Shape validation: required fields per type, well-formed multihash
    /// fields, and the total size cap
    pub fn validate(&self, max_bytes: usize) -> Result<()> {
        let size = canonical_bytes(self)?.len();
        if size > max_bytes {
            return Err(Error::Validation(format!(
                "operation size {size} exceeds cap {max_bytes}"
            )));
        }

        match self.operation_type {
            OperationType::Create => {
                let suffix_data = self
                    .suffix_data
                    .as_ref()
                    .ok_or_else(|| Error::MissingField("suffixData".to_string()))?;
                let delta = self
                    .delta
                    .as_ref()
                    .ok_or_else(|| Error::MissingField("delta".to_string()))?;
                if !is_encoded_multihash(&suffix_data.delta_hash) {
                    return Err(Error::Validation("deltaHash is not a multihash".to_string()));
                }
                if !is_encoded_multihash(&suffix_data.recovery_commitment) {
                    return Err(Error::Validation(
                        "recoveryCommitment is not a multihash".to_string(),
                    ));
                }
                if !is_encoded_multihash(&delta.update_commitment) {
                    return Err(Error::Validation(
                        "updateCommitment is not a multihash".to_string(),
                    ));
                }
            }
            OperationType::Update | OperationType::Recover => {
                if self.did_suffix.is_none() {
                    return Err(Error::MissingField("didSuffix".to_string()));
                }
                if self.signed_data.is_none() {
                    return Err(Error::MissingField("signedData".to_string()));
                }
                let delta = self
                    .delta
                    .as_ref()
                    .ok_or_else(|| Error::MissingField("delta".to_string()))?;
                if !is_encoded_multihash(&delta.update_commitment) {
                    return Err(Error::Validation(
                        "updateCommitment is not a multihash".to_string(),
                    ));
                }
            }
            OperationType::Deactivate => {
                if self.did_suffix.is_none() {
                    return Err(Error::MissingField("didSuffix".to_string()));
                }
                if self.signed_data.is_none() {
                    return Err(Error::MissingField("signedData".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// An operation with its anchor coordinates attached by the pipeline
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnchoredOperation {
    pub operation: Operation,
    /// Anchor transaction number; `None` while unpublished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<u64>,
    /// Position within the batch (published) or ingest sequence (unpublished)
    pub op_index: u64,
    /// Hashlink of the anchor linkset once published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl AnchoredOperation {
    pub fn unpublished(operation: Operation, op_index: u64) -> Self {
        Self {
            operation,
            txn_number: None,
            op_index,
            anchor: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.txn_number.is_some()
    }
}

// =============================================================================
// DOCUMENT STATE & APPLIER
// =============================================================================

/// Folded document state for one suffix
#[derive(Clone, Debug, PartialEq)]
pub struct DidState {
    pub document: DocumentContent,
    pub update_commitment: Option<String>,
    pub recovery_commitment: Option<String>,
    pub anchor_origin: Option<String>,
    pub deactivated: bool,
    /// True once at least one applied operation is anchored
    pub published: bool,
    /// Hashlink of the latest applied published operation's anchor
    pub last_anchor: Option<String>,
    /// Count of operations skipped during the fold
    pub skipped: usize,
}

/// Fold an ordered operation log into a document state.
///
/// Pure over the input slice. The first applicable operation must be a
/// create; invalid operations (bad commitment, bad signature, hash
/// mismatch) are skipped. Applying the same operation twice is a no-op
/// because each applied operation rotates the commitment it was gated on.
pub fn apply_operations(ops: &[AnchoredOperation]) -> Option<DidState> {
    let mut state: Option<DidState> = None;
    let mut skipped = 0usize;

    for op in ops {
        match apply_one(state.as_ref(), op) {
            Ok(next) => state = Some(next),
            Err(_) => skipped += 1,
        }
    }

    state.map(|mut s| {
        s.skipped = skipped;
        s
    })
}

fn apply_one(state: Option<&DidState>, anchored: &AnchoredOperation) -> Result<DidState> {
    let op = &anchored.operation;
    match (state, op.operation_type) {
        (None, OperationType::Create) => apply_create(anchored),
        (None, _) => Err(Error::Validation("first operation must be create".to_string())),
        (Some(prior), _) if prior.deactivated => {
            Err(Error::Validation("document is deactivated".to_string()))
        }
        (Some(_), OperationType::Create) => {
            Err(Error::Validation("duplicate create".to_string()))
        }
        (Some(prior), OperationType::Update) => apply_update(prior, anchored),
        (Some(prior), OperationType::Recover) => apply_recover(prior, anchored),
        (Some(prior), OperationType::Deactivate) => apply_deactivate(prior, anchored),
    }
}

fn delta_checked<'a>(op: &'a Operation, expected_hash: &str) -> Result<&'a Delta> {
    let delta = op
        .delta
        .as_ref()
        .ok_or_else(|| Error::MissingField("delta".to_string()))?;
    let computed = canonical_multihash(delta)?;
    if computed != expected_hash {
        return Err(Error::HashMismatch {
            computed,
            transmitted: expected_hash.to_string(),
        });
    }
    Ok(delta)
}

fn apply_create(anchored: &AnchoredOperation) -> Result<DidState> {
    let op = &anchored.operation;
    let suffix_data = op
        .suffix_data
        .as_ref()
        .ok_or_else(|| Error::MissingField("suffixData".to_string()))?;
    let delta = delta_checked(op, &suffix_data.delta_hash)?;

    let mut document = DocumentContent::default();
    apply_patches(&mut document, &delta.patches);

    Ok(DidState {
        document,
        update_commitment: Some(delta.update_commitment.clone()),
        recovery_commitment: Some(suffix_data.recovery_commitment.clone()),
        anchor_origin: suffix_data.anchor_origin.clone(),
        deactivated: false,
        published: anchored.is_published(),
        last_anchor: anchored.anchor.clone(),
        skipped: 0,
    })
}

fn apply_update(prior: &DidState, anchored: &AnchoredOperation) -> Result<DidState> {
    let op = &anchored.operation;
    let compact = op
        .signed_data
        .as_deref()
        .ok_or_else(|| Error::MissingField("signedData".to_string()))?;

    // Gate on the prior update commitment before trusting the signature
    let revealed: UpdateSignedData = jws::decode_payload(compact)?;
    let expected = prior
        .update_commitment
        .as_deref()
        .ok_or_else(|| Error::Validation("no update commitment".to_string()))?;
    if revealed.update_key.commitment()? != expected {
        return Err(Error::CommitmentMismatch(
            op.did_suffix.clone().unwrap_or_default(),
        ));
    }

    let verified: UpdateSignedData = jws::verify(compact, &revealed.update_key)?;
    let delta = delta_checked(op, &verified.delta_hash)?;

    let mut next = prior.clone();
    apply_patches(&mut next.document, &delta.patches);
    next.update_commitment = Some(delta.update_commitment.clone());
    if anchored.is_published() {
        next.published = true;
        next.last_anchor = anchored.anchor.clone();
    }
    Ok(next)
}

fn apply_recover(prior: &DidState, anchored: &AnchoredOperation) -> Result<DidState> {
    let op = &anchored.operation;
    let compact = op
        .signed_data
        .as_deref()
        .ok_or_else(|| Error::MissingField("signedData".to_string()))?;

    let revealed: RecoverSignedData = jws::decode_payload(compact)?;
    let expected = prior
        .recovery_commitment
        .as_deref()
        .ok_or_else(|| Error::Validation("no recovery commitment".to_string()))?;
    if revealed.recovery_key.commitment()? != expected {
        return Err(Error::CommitmentMismatch(
            op.did_suffix.clone().unwrap_or_default(),
        ));
    }

    let verified: RecoverSignedData = jws::verify(compact, &revealed.recovery_key)?;
    let delta = delta_checked(op, &verified.delta_hash)?;

    // Recovery resets the document rather than patching the old one
    let mut document = DocumentContent::default();
    apply_patches(&mut document, &delta.patches);

    Ok(DidState {
        document,
        update_commitment: Some(delta.update_commitment.clone()),
        recovery_commitment: Some(verified.recovery_commitment),
        anchor_origin: verified.anchor_origin.or_else(|| prior.anchor_origin.clone()),
        deactivated: false,
        published: prior.published || anchored.is_published(),
        last_anchor: anchored.anchor.clone().or_else(|| prior.last_anchor.clone()),
        skipped: 0,
    })
}

fn apply_deactivate(prior: &DidState, anchored: &AnchoredOperation) -> Result<DidState> {
    let op = &anchored.operation;
    let compact = op
        .signed_data
        .as_deref()
        .ok_or_else(|| Error::MissingField("signedData".to_string()))?;

    let revealed: DeactivateSignedData = jws::decode_payload(compact)?;
    let expected = prior
        .recovery_commitment
        .as_deref()
        .ok_or_else(|| Error::Validation("no recovery commitment".to_string()))?;
    if revealed.recovery_key.commitment()? != expected {
        return Err(Error::CommitmentMismatch(
            op.did_suffix.clone().unwrap_or_default(),
        ));
    }
    if Some(revealed.did_suffix.as_str()) != op.did_suffix.as_deref() {
        return Err(Error::Validation("deactivate suffix mismatch".to_string()));
    }

    let verified: DeactivateSignedData = jws::verify(compact, &revealed.recovery_key)?;
    let _ = verified;

    Ok(DidState {
        document: DocumentContent::default(),
        update_commitment: None,
        recovery_commitment: None,
        anchor_origin: prior.anchor_origin.clone(),
        deactivated: true,
        published: prior.published || anchored.is_published(),
        last_anchor: anchored.anchor.clone().or_else(|| prior.last_anchor.clone()),
        skipped: 0,
    })
}

fn apply_patches(document: &mut DocumentContent, patches: &[Patch]) {
    for patch in patches {
        match patch {
            Patch::Replace { document: replacement } => {
                *document = replacement.clone();
            }
            Patch::AddPublicKeys { public_keys } => {
                for key in public_keys {
                    document.public_keys.retain(|k| k.id != key.id);
                    document.public_keys.push(key.clone());
                }
            }
            Patch::RemovePublicKeys { ids } => {
                document.public_keys.retain(|k| !ids.contains(&k.id));
            }
            Patch::AddServices { services } => {
                for service in services {
                    document.services.retain(|s| s.id != service.id);
                    document.services.push(service.clone());
                }
            }
            Patch::RemoveServices { ids } => {
                document.services.retain(|s| !ids.contains(&s.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) struct OpFactory {
        pub update_key: KeyPair,
        pub recovery_key: KeyPair,
    }

    impl OpFactory {
        pub fn new() -> Self {
            Self {
                update_key: KeyPair::from_seed(&[1; 32]),
                recovery_key: KeyPair::from_seed(&[2; 32]),
            }
        }

        fn jwk(key: &KeyPair) -> PublicKeyJwk {
            PublicKeyJwk::from_ed25519(&key.public_key())
        }

        pub fn create(&self) -> Operation {
            let delta = Delta {
                patches: vec![Patch::Replace {
                    document: DocumentContent {
                        public_keys: vec![DocumentKey {
                            id: "key-1".to_string(),
                            key_type: "Ed25519VerificationKey2020".to_string(),
                            purposes: vec!["authentication".to_string()],
                            public_key_jwk: Self::jwk(&self.update_key),
                        }],
                        services: vec![],
                    },
                }],
                update_commitment: Self::jwk(&self.update_key).commitment().unwrap(),
            };
            let suffix_data = SuffixData {
                delta_hash: canonical_multihash(&delta).unwrap(),
                recovery_commitment: Self::jwk(&self.recovery_key).commitment().unwrap(),
                anchor_origin: Some("https://node-a.example/services/orb".to_string()),
            };
            Operation {
                operation_type: OperationType::Create,
                did_suffix: None,
                suffix_data: Some(suffix_data),
                delta: Some(delta),
                signed_data: None,
            }
        }

        /// Update that adds a service; rotates the update key to `next`
        pub fn update(&self, suffix: &str, next: &KeyPair) -> Operation {
            let delta = Delta {
                patches: vec![Patch::AddServices {
                    services: vec![DocumentService {
                        id: "svc-1".to_string(),
                        service_type: "LinkedDomains".to_string(),
                        service_endpoint: "https://svc.example".to_string(),
                    }],
                }],
                update_commitment: Self::jwk(next).commitment().unwrap(),
            };
            let payload = UpdateSignedData {
                update_key: Self::jwk(&self.update_key),
                delta_hash: canonical_multihash(&delta).unwrap(),
            };
            Operation {
                operation_type: OperationType::Update,
                did_suffix: Some(suffix.to_string()),
                suffix_data: None,
                delta: Some(delta),
                signed_data: Some(jws::sign(&payload, &self.update_key).unwrap()),
            }
        }

        pub fn deactivate(&self, suffix: &str) -> Operation {
            let payload = DeactivateSignedData {
                did_suffix: suffix.to_string(),
                recovery_key: Self::jwk(&self.recovery_key),
            };
            Operation {
                operation_type: OperationType::Deactivate,
                did_suffix: Some(suffix.to_string()),
                suffix_data: None,
                delta: None,
                signed_data: Some(jws::sign(&payload, &self.recovery_key).unwrap()),
            }
        }
    }

    #[test]
    fn test_suffix_is_content_derived() {
        let factory = OpFactory::new();
        let create = factory.create();
        let suffix = create.suffix().unwrap();
        assert!(is_encoded_multihash(&suffix));
        assert!(suffix.starts_with("Ei"));

        // deterministic
        assert_eq!(factory.create().suffix().unwrap(), suffix);
    }

    #[test]
    fn test_validate_shapes() {
        let factory = OpFactory::new();
        factory.create().validate(4096).unwrap();

        let mut bad = factory.create();
        bad.suffix_data.as_mut().unwrap().recovery_commitment = "notahash".to_string();
        assert!(bad.validate(4096).is_err());

        assert!(factory.create().validate(8).is_err()); // size cap
    }

    #[test]
    fn test_create_then_update() {
        let factory = OpFactory::new();
        let create = factory.create();
        let suffix = create.suffix().unwrap();
        let next_key = KeyPair::from_seed(&[3; 32]);
        let update = factory.update(&suffix, &next_key);

        let ops = vec![
            AnchoredOperation::unpublished(create, 0),
            AnchoredOperation::unpublished(update, 1),
        ];
        let state = apply_operations(&ops).unwrap();
        assert_eq!(state.document.services.len(), 1);
        assert_eq!(state.skipped, 0);
        assert_eq!(
            state.update_commitment.as_deref().unwrap(),
            &PublicKeyJwk::from_ed25519(&next_key.public_key())
                .commitment()
                .unwrap()
        );
    }

    #[test]
    fn test_replay_is_noop() {
        let factory = OpFactory::new();
        let create = factory.create();
        let suffix = create.suffix().unwrap();
        let next_key = KeyPair::from_seed(&[3; 32]);
        let update = factory.update(&suffix, &next_key);

        let once = apply_operations(&[
            AnchoredOperation::unpublished(create.clone(), 0),
            AnchoredOperation::unpublished(update.clone(), 1),
        ])
        .unwrap();

        // Replaying the update: its revealed key no longer matches the
        // rotated commitment, so it is skipped
        let twice = apply_operations(&[
            AnchoredOperation::unpublished(create, 0),
            AnchoredOperation::unpublished(update.clone(), 1),
            AnchoredOperation::unpublished(update, 2),
        ])
        .unwrap();

        assert_eq!(twice.document, once.document);
        assert_eq!(twice.update_commitment, once.update_commitment);
        assert_eq!(twice.skipped, 1);
    }

    #[test]
    fn test_mismatched_commitment_skips_not_aborts() {
        let factory = OpFactory::new();
        let create = factory.create();
        let suffix = create.suffix().unwrap();

        // forged update signed by an unrelated key
        let intruder = OpFactory {
            update_key: KeyPair::from_seed(&[9; 32]),
            recovery_key: KeyPair::from_seed(&[10; 32]),
        };
        let forged = intruder.update(&suffix, &KeyPair::from_seed(&[11; 32]));
        let honest = factory.update(&suffix, &KeyPair::from_seed(&[3; 32]));

        let state = apply_operations(&[
            AnchoredOperation::unpublished(create, 0),
            AnchoredOperation::unpublished(forged, 1),
            AnchoredOperation::unpublished(honest, 2),
        ])
        .unwrap();

        assert_eq!(state.skipped, 1);
        assert_eq!(state.document.services.len(), 1);
    }

    #[test]
    fn test_deactivate_tombstones() {
        let factory = OpFactory::new();
        let create = factory.create();
        let suffix = create.suffix().unwrap();
        let deactivate = factory.deactivate(&suffix);
        let late_update = factory.update(&suffix, &KeyPair::from_seed(&[3; 32]));

        let state = apply_operations(&[
            AnchoredOperation::unpublished(create, 0),
            AnchoredOperation::unpublished(deactivate, 1),
            AnchoredOperation::unpublished(late_update, 2),
        ])
        .unwrap();

        assert!(state.deactivated);
        assert!(state.document.public_keys.is_empty());
        assert_eq!(state.skipped, 1);
    }

    #[test]
    fn test_first_op_must_be_create() {
        let factory = OpFactory::new();
        let update = factory.update("EiAAA", &KeyPair::from_seed(&[3; 32]));
        assert!(apply_operations(&[AnchoredOperation::unpublished(update, 0)]).is_none());
    }

    #[test]
    fn test_jws_verify_rejects_wrong_key() {
        let signer = KeyPair::from_seed(&[5; 32]);
        let other = KeyPair::from_seed(&[6; 32]);
        let payload = UpdateSignedData {
            update_key: PublicKeyJwk::from_ed25519(&signer.public_key()),
            delta_hash: "x".to_string(),
        };
        let compact = jws::sign(&payload, &signer).unwrap();

        assert!(jws::verify::<UpdateSignedData>(
            &compact,
            &PublicKeyJwk::from_ed25519(&signer.public_key())
        )
        .is_ok());
        assert!(jws::verify::<UpdateSignedData>(
            &compact,
            &PublicKeyJwk::from_ed25519(&other.public_key())
        )
        .is_err());
    }
}
