//! Actor documents and retrieval
//!
//! Peers are described by ActivityPub actor documents carrying their
//! public key and collection endpoints. Cross-store cycles are broken by
//! retrieving actors lazily through this retriever rather than
//! materializing an object graph; lookups are cached with a TTL.

use async_trait::async_trait;
use orb_core::keys::decode_public_key_multibase;
use orb_core::vocab::{UrlProperty, ACTIVITY_STREAMS_CONTEXT, ANCHOR_CONTEXT};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Actor retrieval errors
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} fetching {iri}")]
    Status { status: u16, iri: String },
    #[error("invalid actor document: {0}")]
    InvalidDocument(String),
    #[error("key {key_id} not announced by its owner")]
    KeyMismatch { key_id: String },
}

/// Published public key of an actor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyDoc {
    pub id: String,
    pub owner: String,
    pub public_key_multibase: String,
}

/// An ActivityPub service actor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "@context")]
    pub context: UrlProperty,
    pub id: String,
    #[serde(rename = "type")]
    pub actor_type: String,
    pub public_key: PublicKeyDoc,
    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub following: String,
    pub witnesses: String,
    pub witnessing: String,
}

impl Actor {
    /// Build the actor document for a service IRI with derived endpoints
    pub fn for_service(service_iri: &str, public_key_multibase: String) -> Self {
        let base = service_iri.trim_end_matches('/');
        Self {
            context: UrlProperty::Multiple(vec![
                ACTIVITY_STREAMS_CONTEXT.to_string(),
                ANCHOR_CONTEXT.to_string(),
            ]),
            id: base.to_string(),
            actor_type: "Service".to_string(),
            public_key: PublicKeyDoc {
                id: format!("{base}/keys/main"),
                owner: base.to_string(),
                public_key_multibase,
            },
            inbox: format!("{base}/inbox"),
            outbox: format!("{base}/outbox"),
            followers: format!("{base}/followers"),
            following: format!("{base}/following"),
            witnesses: format!("{base}/witnesses"),
            witnessing: format!("{base}/witnessing"),
        }
    }

    /// Decode the announced Ed25519 public key
    pub fn public_key_bytes(&self) -> Result<[u8; 32], ActorError> {
        decode_public_key_multibase(&self.public_key.public_key_multibase)
            .map_err(|e| ActorError::InvalidDocument(e.to_string()))
    }
}

/// Lazily resolves actor documents by IRI
#[async_trait]
pub trait ActorRetriever: Send + Sync {
    async fn get_actor(&self, iri: &str) -> Result<Actor, ActorError>;

    /// Resolve the public key behind a `keyId`, confirming the owner
    /// actually announces it
    async fn resolve_public_key(&self, key_id: &str) -> Result<[u8; 32], ActorError> {
        let owner = key_id.split("/keys/").next().unwrap_or(key_id);
        let actor = self.get_actor(owner).await?;
        if actor.public_key.id != key_id {
            return Err(ActorError::KeyMismatch {
                key_id: key_id.to_string(),
            });
        }
        actor.public_key_bytes()
    }
}

struct CachedActor {
    actor: Actor,
    fetched_at: Instant,
}

/// HTTP actor retriever with a TTL cache
pub struct HttpActorRetriever {
    client: reqwest::Client,
    cache: RwLock<HashMap<String, CachedActor>>,
    ttl: Duration,
}

impl HttpActorRetriever {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn cached(&self, iri: &str) -> Option<Actor> {
        let cache = self.cache.read();
        cache
            .get(iri)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.actor.clone())
    }

    /// Drop a cached entry (e.g. after a key verification failure)
    pub fn invalidate(&self, iri: &str) {
        self.cache.write().remove(iri);
    }
}

#[async_trait]
impl ActorRetriever for HttpActorRetriever {
    async fn get_actor(&self, iri: &str) -> Result<Actor, ActorError> {
        if let Some(actor) = self.cached(iri) {
            return Ok(actor);
        }

        debug!(%iri, "fetching actor document");
        let response = self
            .client
            .get(iri)
            .header("Accept", "application/activity+json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ActorError::Status {
                status: response.status().as_u16(),
                iri: iri.to_string(),
            });
        }
        let actor: Actor = response
            .json()
            .await
            .map_err(|e| ActorError::InvalidDocument(e.to_string()))?;

        self.cache.write().insert(
            iri.to_string(),
            CachedActor {
                actor: actor.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(actor)
    }
}

/// Fixed-map retriever for tests and loopback wiring
pub struct StaticActorRetriever {
    actors: RwLock<HashMap<String, Actor>>,
}

impl StaticActorRetriever {
    pub fn new() -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, actor: Actor) {
        self.actors.write().insert(actor.id.clone(), actor);
    }
}

impl Default for StaticActorRetriever {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActorRetriever for StaticActorRetriever {
    async fn get_actor(&self, iri: &str) -> Result<Actor, ActorError> {
        self.actors
            .read()
            .get(iri)
            .cloned()
            .ok_or_else(|| ActorError::Status {
                status: 404,
                iri: iri.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::keys::KeyPair;

    #[test]
    fn test_actor_document_shape() {
        let keypair = KeyPair::from_seed(&[1; 32]);
        let actor = Actor::for_service(
            "https://node-a.example/services/orb",
            keypair.public_key_multibase(),
        );

        assert_eq!(actor.inbox, "https://node-a.example/services/orb/inbox");
        assert_eq!(
            actor.public_key.id,
            "https://node-a.example/services/orb/keys/main"
        );
        assert_eq!(actor.public_key_bytes().unwrap(), keypair.public_key());

        let json = serde_json::to_value(&actor).unwrap();
        assert_eq!(json["type"], "Service");
        assert!(json["publicKey"]["publicKeyMultibase"]
            .as_str()
            .unwrap()
            .starts_with('z'));
    }

    #[tokio::test]
    async fn test_static_retriever_key_resolution() {
        let keypair = KeyPair::from_seed(&[2; 32]);
        let actor = Actor::for_service(
            "https://node-b.example/services/orb",
            keypair.public_key_multibase(),
        );
        let retriever = StaticActorRetriever::new();
        retriever.insert(actor);

        let key = retriever
            .resolve_public_key("https://node-b.example/services/orb/keys/main")
            .await
            .unwrap();
        assert_eq!(key, keypair.public_key());

        let err = retriever
            .resolve_public_key("https://node-b.example/services/orb/keys/other")
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::KeyMismatch { .. }));
    }
}
