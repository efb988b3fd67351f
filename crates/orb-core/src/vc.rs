//! Anchor credential issuance and verification
//!
//! The credential binds an anchor linkset by content hash: the subject
//! `href` is the hashlink of the linkset's canonical bytes. The issuer
//! proof is attached at issuance; witness proofs are appended as
//! additional entries without mutating existing ones.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::hashlink;
use crate::keys::{self, KeyPair};
use chrono::{DateTime, Utc};
use multibase::Base;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// W3C credentials context
pub const CREDENTIALS_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";
/// Ed25519 2020 signature suite context
pub const ED25519_2020_CONTEXT: &str = "https://w3id.org/security/suites/ed25519-2020/v1";
/// Proof type emitted by this implementation
pub const PROOF_TYPE_ED25519_2020: &str = "Ed25519Signature2020";

/// The subject of an anchor credential
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSubject {
    /// Hashlink of the generator-produced content object
    pub anchor: String,
    /// Hashlink of the anchor linkset bytes
    pub href: String,
    /// Generator profile IRI
    pub profile: String,
    pub rel: String,
    #[serde(rename = "type")]
    pub subject_type: String,
}

/// A linked-data proof over the credential
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub created: DateTime<Utc>,
    pub verification_method: String,
    pub proof_purpose: String,
    /// Witness domain for countersignatures; absent on the issuer proof
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Multibase (base58btc) Ed25519 signature
    pub proof_value: String,
}

/// A JSON-LD anchor credential
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifiableCredential {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub credential_type: Vec<String>,
    pub issuer: String,
    pub issuance_date: DateTime<Utc>,
    pub credential_subject: CredentialSubject,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proof: Vec<Proof>,
}

impl VerifiableCredential {
    /// Credential without its proofs, for signing-input construction
    fn unsigned(&self) -> VerifiableCredential {
        let mut vc = self.clone();
        vc.proof = Vec::new();
        vc
    }

    /// Witness domains present in the proof set
    pub fn proof_domains(&self) -> Vec<String> {
        self.proof
            .iter()
            .filter_map(|p| p.domain.clone())
            .collect()
    }

    /// Append a proof. Existing entries are never mutated.
    pub fn add_proof(&mut self, proof: Proof) {
        self.proof.push(proof);
    }
}

/// Signing input: SHA-256(canonical proof options) || SHA-256(canonical document)
fn signing_input(vc: &VerifiableCredential, options: &Proof) -> Result<Vec<u8>> {
    let mut options = options.clone();
    options.proof_value = String::new();

    let mut opts_doc = serde_json::to_value(&options)?;
    if let Some(map) = opts_doc.as_object_mut() {
        map.remove("proofValue");
    }

    let doc_hash = Sha256::digest(canonical_bytes(&vc.unsigned())?);
    let opts_hash = Sha256::digest(canonical_bytes(&opts_doc)?);

    let mut input = Vec::with_capacity(64);
    input.extend_from_slice(&opts_hash);
    input.extend_from_slice(&doc_hash);
    Ok(input)
}

fn sign_proof(vc: &VerifiableCredential, mut proof: Proof, key: &KeyPair) -> Result<Proof> {
    let input = signing_input(vc, &proof)?;
    proof.proof_value = multibase::encode(Base::Base58Btc, key.sign(&input));
    Ok(proof)
}

/// Issues anchor credentials and witness countersignatures for one service
#[derive(Clone)]
pub struct CredentialIssuer {
    keypair: KeyPair,
    issuer: String,
    verification_method: String,
}

impl CredentialIssuer {
    pub fn new(keypair: KeyPair, issuer: impl Into<String>, verification_method: impl Into<String>) -> Self {
        Self {
            keypair,
            issuer: issuer.into(),
            verification_method: verification_method.into(),
        }
    }

    pub fn verification_method(&self) -> &str {
        &self.verification_method
    }

    /// Issue an anchor credential over the given linkset bytes
    pub fn issue(
        &self,
        id: impl Into<String>,
        linkset_bytes: &[u8],
        anchor: impl Into<String>,
        profile: impl Into<String>,
    ) -> Result<VerifiableCredential> {
        let mut vc = VerifiableCredential {
            context: vec![
                CREDENTIALS_CONTEXT.to_string(),
                ED25519_2020_CONTEXT.to_string(),
            ],
            id: id.into(),
            credential_type: vec![
                "VerifiableCredential".to_string(),
                "AnchorCredential".to_string(),
            ],
            issuer: self.issuer.clone(),
            issuance_date: Utc::now(),
            credential_subject: CredentialSubject {
                anchor: anchor.into(),
                href: hashlink::create(linkset_bytes),
                profile: profile.into(),
                rel: "linkset".to_string(),
                subject_type: "AnchorLink".to_string(),
            },
            proof: Vec::new(),
        };

        let proof = sign_proof(
            &vc,
            Proof {
                proof_type: PROOF_TYPE_ED25519_2020.to_string(),
                created: Utc::now(),
                verification_method: self.verification_method.clone(),
                proof_purpose: "assertionMethod".to_string(),
                domain: None,
                proof_value: String::new(),
            },
            &self.keypair,
        )?;
        vc.add_proof(proof);
        Ok(vc)
    }

    /// Produce a witness countersignature over an observed credential
    pub fn countersign(&self, vc: &VerifiableCredential, domain: impl Into<String>) -> Result<Proof> {
        sign_proof(
            vc,
            Proof {
                proof_type: PROOF_TYPE_ED25519_2020.to_string(),
                created: Utc::now(),
                verification_method: self.verification_method.clone(),
                proof_purpose: "assertionMethod".to_string(),
                domain: Some(domain.into()),
                proof_value: String::new(),
            },
            &self.keypair,
        )
    }
}

/// Verify one proof against a resolved public key
pub fn verify_proof(
    vc: &VerifiableCredential,
    proof: &Proof,
    public_key: &[u8; 32],
) -> Result<()> {
    if proof.proof_type != PROOF_TYPE_ED25519_2020 {
        return Err(Error::Validation(format!(
            "unsupported proof type: {}",
            proof.proof_type
        )));
    }
    let (_, sig_bytes) =
        multibase::decode(&proof.proof_value).map_err(|e| Error::Multibase(e.to_string()))?;
    let signature: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let input = signing_input(vc, proof)?;
    keys::verify(public_key, &input, &signature)
}

/// Verify the credential against its linkset bytes: every proof must
/// check out, the subject `href` must re-hash the bytes, and the anchor
/// must match the linkset's anchor. Key resolution is delegated so the
/// core stays free of I/O.
pub fn verify_credential(
    vc: &VerifiableCredential,
    linkset_bytes: &[u8],
    resolve_key: impl Fn(&str) -> Option<[u8; 32]>,
) -> Result<()> {
    if vc.proof.is_empty() {
        return Err(Error::MissingField("proof".to_string()));
    }
    if vc.credential_subject.subject_type != "AnchorLink"
        || vc.credential_subject.rel != "linkset"
    {
        return Err(Error::Validation("not an anchor credential subject".to_string()));
    }

    hashlink::verify(linkset_bytes, &vc.credential_subject.href)?;

    let linkset = crate::linkset::Linkset::from_bytes(linkset_bytes)?;
    let link = linkset.link()?;
    if hashlink::get_resource_hash(&link.anchor)?
        != hashlink::get_resource_hash(&vc.credential_subject.anchor)?
    {
        return Err(Error::Validation("credential anchor does not match linkset".to_string()));
    }
    if link.profile != vc.credential_subject.profile {
        return Err(Error::Validation("credential profile does not match linkset".to_string()));
    }

    for proof in &vc.proof {
        let key = resolve_key(&proof.verification_method).ok_or_else(|| {
            Error::InvalidPublicKey(format!(
                "cannot resolve verification method {}",
                proof.verification_method
            ))
        })?;
        verify_proof(vc, proof, &key)?;
    }
    Ok(())
}
