//! Activity inbox and handler state machine
//!
//! Inbound activities are signature-verified at the HTTP layer (401,
//! never enqueued), deduplicated on `activity.id` against the inbox
//! reference set, then dispatched by type. Reference-graph mutations are
//! single-object atomic; a handler that fails after verification is
//! retried from the inbox queue, so every handler is idempotent.

use crate::outbox::{Outbox, OutboxError};
use crate::pipeline::{PipelineError, PipelineHandle};
use crate::sidetree::processor::{OperationProcessor, ProcessorError};
use crate::stats::{inc, NodeStats};
use crate::storage::{RefKind, Storage, StorageError, TAG_INBOX};
use orb_core::canonical::canonical_bytes;
use orb_core::generator::GeneratorRegistry;
use orb_core::hashlink;
use orb_core::linkset::Linkset;
use orb_core::vc::{CredentialIssuer, Proof, VerifiableCredential};
use orb_core::vocab::{Activity, ActivityType, AnchorEvent, ObjectValue, UrlProperty};
use orb_net::actor::ActorRetriever;
use orb_net::httpsig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inbox errors
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("core error: {0}")]
    Core(#[from] orb_core::Error),
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl InboxError {
    fn is_transient(&self) -> bool {
        matches!(self, InboxError::Transient(_))
    }
}

impl From<ProcessorError> for InboxError {
    fn from(e: ProcessorError) -> Self {
        if e.is_transient() {
            InboxError::Transient(e.to_string())
        } else {
            InboxError::Validation(e.to_string())
        }
    }
}

/// Authorization policy for inbound Follow / witness Invite requests
#[derive(Clone, Debug)]
pub enum AuthPolicy {
    AcceptAll,
    AllowList(HashSet<String>),
}

impl AuthPolicy {
    pub fn from_list(list: &[String]) -> Self {
        if list.is_empty() {
            AuthPolicy::AcceptAll
        } else {
            AuthPolicy::AllowList(list.iter().cloned().collect())
        }
    }

    fn allows(&self, actor: &str) -> bool {
        match self {
            AuthPolicy::AcceptAll => true,
            AuthPolicy::AllowList(list) => list.contains(actor),
        }
    }
}

/// Inbox tuning
#[derive(Clone, Debug)]
pub struct InboxConfig {
    pub follower_auth: AuthPolicy,
    pub witness_auth: AuthPolicy,
    /// Countersign observed anchor events from actors we witness
    pub auto_like: bool,
    pub max_retries: u32,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            follower_auth: AuthPolicy::AcceptAll,
            witness_auth: AuthPolicy::AcceptAll,
            auto_like: true,
            max_retries: 3,
        }
    }
}

struct QueuedActivity {
    activity: Activity,
    attempts: u32,
}

/// The activity inbox
pub struct Inbox {
    storage: Arc<Storage>,
    service_iri: String,
    retriever: Arc<dyn ActorRetriever>,
    outbox: Arc<Outbox>,
    processor: Arc<OperationProcessor>,
    pipeline: PipelineHandle,
    issuer: CredentialIssuer,
    registry: GeneratorRegistry,
    config: InboxConfig,
    stats: Arc<NodeStats>,
    tx: mpsc::Sender<QueuedActivity>,
    rx: Mutex<Option<mpsc::Receiver<QueuedActivity>>>,
}

impl Inbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        service_iri: impl Into<String>,
        retriever: Arc<dyn ActorRetriever>,
        outbox: Arc<Outbox>,
        processor: Arc<OperationProcessor>,
        pipeline: PipelineHandle,
        issuer: CredentialIssuer,
        registry: GeneratorRegistry,
        config: InboxConfig,
        stats: Arc<NodeStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            storage,
            service_iri: service_iri.into(),
            retriever,
            outbox,
            processor,
            pipeline,
            issuer,
            registry,
            config,
            stats,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Verify the HTTP signature of an inbox POST and return the actor
    /// IRI owning the signing key. Failures map to 401 and the body is
    /// never enqueued.
    #[allow(clippy::too_many_arguments)]
    pub async fn authenticate(
        &self,
        method: &str,
        path_and_query: &str,
        host: &str,
        date: &str,
        digest: &str,
        signature: &str,
        body: &[u8],
    ) -> Result<String, InboxError> {
        let params = httpsig::parse_signature_header(signature)
            .map_err(|e| InboxError::Unauthorized(e.to_string()))?;
        let key = self
            .retriever
            .resolve_public_key(&params.key_id)
            .await
            .map_err(|e| InboxError::Unauthorized(format!("cannot resolve signing key: {e}")))?;
        httpsig::verify(
            &params, &key, method, path_and_query, host, date, digest, body,
        )
        .map_err(|e| InboxError::Unauthorized(e.to_string()))?;

        let owner = params
            .key_id
            .split("/keys/")
            .next()
            .unwrap_or(&params.key_id)
            .to_string();
        Ok(owner)
    }

    /// Accept a verified activity: dedup on id, persist, enqueue
    pub async fn submit(
        &self,
        activity: Activity,
        authenticated_actor: &str,
    ) -> Result<(), InboxError> {
        if activity.actor != authenticated_actor {
            return Err(InboxError::Unauthorized(format!(
                "activity actor {} does not match signer {authenticated_actor}",
                activity.actor
            )));
        }
        if activity.id.is_empty() {
            return Err(InboxError::Validation("activity has no id".to_string()));
        }

        if !self
            .storage
            .add_reference(RefKind::Inbox, &self.service_iri, &activity.id)?
        {
            inc(&self.stats.inbox_duplicates);
            debug!(id = %activity.id, "duplicate activity dropped");
            return Ok(());
        }
        self.storage.put_activity(&activity, &[TAG_INBOX])?;

        self.tx
            .send(QueuedActivity {
                activity,
                attempts: 0,
            })
            .await
            .map_err(|_| InboxError::Transient("inbox is shutting down".to_string()))
    }

    /// Spawn the queue worker
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let inbox = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut rx = inbox.rx.lock().await.take().expect("spawn called once");
            loop {
                let queued = tokio::select! {
                    queued = rx.recv() => queued,
                    _ = shutdown_rx.recv() => None,
                };
                let Some(mut queued) = queued else { break };

                match inbox.dispatch(&queued.activity).await {
                    Ok(()) => inc(&inbox.stats.inbox_processed),
                    Err(e) if e.is_transient() && queued.attempts + 1 < inbox.config.max_retries => {
                        queued.attempts += 1;
                        warn!(
                            id = %queued.activity.id,
                            attempts = queued.attempts,
                            "handler failed, requeueing: {e}"
                        );
                        let tx = inbox.tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(
                                100 * u64::from(queued.attempts),
                            ))
                            .await;
                            let _ = tx.send(queued).await;
                        });
                    }
                    Err(e) => {
                        warn!(id = %queued.activity.id, "activity rejected: {e}");
                    }
                }
            }
            debug!("inbox worker stopped");
        })
    }

    /// Dispatch one activity by type
    pub async fn dispatch(&self, activity: &Activity) -> Result<(), InboxError> {
        match activity.activity_type {
            ActivityType::Follow => self.handle_follow(activity).await,
            ActivityType::Invite => self.handle_invite(activity).await,
            ActivityType::Undo => self.handle_undo(activity).await,
            ActivityType::Create | ActivityType::Announce => {
                self.handle_anchor_event(activity).await
            }
            ActivityType::Offer => self.handle_offer(activity).await,
            ActivityType::Like => self.handle_like(activity).await,
            ActivityType::Accept => self.handle_accept(activity).await,
            ActivityType::Reject => self.handle_reject(activity),
        }
    }

    // =========================================================================
    // FOLLOW / INVITE
    // =========================================================================

    async fn handle_follow(&self, activity: &Activity) -> Result<(), InboxError> {
        if self.config.follower_auth.allows(&activity.actor) {
            self.storage
                .add_reference(RefKind::Follower, &self.service_iri, &activity.actor)?;
            info!(actor = %activity.actor, "follower added");
            self.reply(ActivityType::Accept, activity).await
        } else {
            info!(actor = %activity.actor, "follow rejected by policy");
            self.reply(ActivityType::Reject, activity).await
        }
    }

    async fn handle_invite(&self, activity: &Activity) -> Result<(), InboxError> {
        if !activity.is_witness_invite() {
            return Err(InboxError::Validation(
                "invite target is not the anchor-witness role".to_string(),
            ));
        }
        if self.config.witness_auth.allows(&activity.actor) {
            self.storage
                .add_reference(RefKind::Witnessing, &self.service_iri, &activity.actor)?;
            info!(actor = %activity.actor, "witnessing added");
            self.reply(ActivityType::Accept, activity).await
        } else {
            info!(actor = %activity.actor, "witness invite rejected by policy");
            self.reply(ActivityType::Reject, activity).await
        }
    }

    /// Accept/Reject reply embedding the original activity
    async fn reply(&self, kind: ActivityType, original: &Activity) -> Result<(), InboxError> {
        let reply = Activity::new(kind, self.service_iri.clone())
            .with_object(ObjectValue::Activity(Box::new(original.clone())))
            .with_to(vec![original.actor.clone()]);
        self.outbox.post(reply).await?;
        Ok(())
    }

    // =========================================================================
    // UNDO
    // =========================================================================

    async fn handle_undo(&self, activity: &Activity) -> Result<(), InboxError> {
        let inner = match activity.object.as_ref() {
            Some(ObjectValue::Activity(inner)) => (**inner).clone(),
            Some(ObjectValue::Iri(id)) => match self.storage.get_activity(id)? {
                Some(stored) => stored,
                None => {
                    debug!(%id, "undo of unknown activity, ignoring");
                    return Ok(());
                }
            },
            _ => {
                return Err(InboxError::Validation(
                    "undo object must be an activity".to_string(),
                ))
            }
        };

        if inner.actor != activity.actor {
            return Err(InboxError::Validation(
                "undo actor does not match the original activity".to_string(),
            ));
        }

        match inner.activity_type {
            ActivityType::Follow => {
                if self.storage.remove_reference(
                    RefKind::Follower,
                    &self.service_iri,
                    &activity.actor,
                )? {
                    info!(actor = %activity.actor, "follower removed");
                }
            }
            ActivityType::Invite => {
                if self.storage.remove_reference(
                    RefKind::Witnessing,
                    &self.service_iri,
                    &activity.actor,
                )? {
                    info!(actor = %activity.actor, "witnessing removed");
                }
            }
            ActivityType::Like => {
                self.storage
                    .remove_reference(RefKind::Like, &self.service_iri, &inner.id)?;
                // already-counted proofs stay; policy evaluation is monotone
            }
            ActivityType::Announce => {
                // informational only: ingested anchor links are append-only
                info!(id = %inner.id, "undo of announce recorded, no retraction");
            }
            other => debug!(kind = %other, "undo has no effect for this type"),
        }
        Ok(())
    }

    // =========================================================================
    // CREATE / ANNOUNCE (anchor event ingest)
    // =========================================================================

    async fn handle_anchor_event(&self, activity: &Activity) -> Result<(), InboxError> {
        let event = activity
            .object
            .as_ref()
            .and_then(ObjectValue::as_anchor_event)
            .ok_or_else(|| {
                InboxError::Validation("activity does not carry an anchor event".to_string())
            })?;

        let following = self
            .storage
            .has_reference(RefKind::Following, &self.service_iri, &activity.actor)?;
        let witnessing = self
            .storage
            .has_reference(RefKind::Witnessing, &self.service_iri, &activity.actor)?;
        if !following && !witnessing {
            return Err(InboxError::Validation(format!(
                "{} is neither followed nor witnessed",
                activity.actor
            )));
        }

        let ingested = self.processor.ingest_anchor_event(event).await?;
        debug!(actor = %activity.actor, operations = ingested, "anchor event ingested");

        // Optional countersign when we are a witness of the sender
        if self.config.auto_like && witnessing {
            if let Err(e) = self.like_event(activity, event).await {
                warn!("countersign failed: {e}");
            }
        }
        Ok(())
    }

    async fn like_event(&self, activity: &Activity, event: &AnchorEvent) -> Result<(), InboxError> {
        let Some(index) = event.index.as_deref() else {
            return Ok(());
        };
        let Some(vc) = credential_from_event(event) else {
            debug!(%index, "anchor event has no embedded credential, skipping like");
            return Ok(());
        };

        let proof = self.issuer.countersign(&vc, self.service_iri.clone())?;
        let like = Activity::new(ActivityType::Like, self.service_iri.clone())
            .with_object(ObjectValue::Iri(index.to_string()))
            .with_result(ObjectValue::Document(
                serde_json::to_value(&proof).map_err(orb_core::Error::from)?,
            ))
            .with_to(vec![activity.actor.clone()]);
        let like_id = self.outbox.post(like).await?;
        self.storage
            .add_reference(RefKind::Liked, &self.service_iri, &like_id)?;
        Ok(())
    }

    // =========================================================================
    // OFFER (witness evaluation)
    // =========================================================================

    async fn handle_offer(&self, activity: &Activity) -> Result<(), InboxError> {
        if !self
            .storage
            .has_reference(RefKind::Witnessing, &self.service_iri, &activity.actor)?
        {
            return Err(InboxError::Validation(format!(
                "{} is not in the witnessing set",
                activity.actor
            )));
        }

        let event = activity
            .object
            .as_ref()
            .and_then(ObjectValue::as_anchor_event)
            .ok_or_else(|| {
                InboxError::Validation("offer does not carry an anchor event".to_string())
            })?;

        match self.evaluate_offer(event) {
            Ok(proof) => {
                let index = event.index.clone().unwrap_or_default();
                let accept = Activity::new(ActivityType::Accept, self.service_iri.clone())
                    .with_object(ObjectValue::Iri(activity.id.clone()))
                    .with_target(UrlProperty::single(index))
                    .with_result(ObjectValue::Document(
                        serde_json::to_value(&proof).map_err(orb_core::Error::from)?,
                    ))
                    .with_to(vec![activity.actor.clone()]);
                self.outbox.post(accept).await?;
                Ok(())
            }
            Err(e) => {
                warn!(actor = %activity.actor, "offer rejected: {e}");
                let reject = Activity::new(ActivityType::Reject, self.service_iri.clone())
                    .with_object(ObjectValue::Iri(activity.id.clone()))
                    .with_to(vec![activity.actor.clone()]);
                self.outbox.post(reject).await?;
                Ok(())
            }
        }
    }

    /// Validate the offered anchor event and produce our countersignature
    fn evaluate_offer(&self, event: &AnchorEvent) -> Result<Proof, InboxError> {
        event
            .validate()
            .map_err(|e| InboxError::Validation(e.to_string()))?;

        let linkset_att = event.linkset_attachment().ok_or_else(|| {
            InboxError::Validation("offer has no embedded linkset".to_string())
        })?;
        let linkset_value = linkset_att.content_object.as_ref().ok_or_else(|| {
            InboxError::Validation("offered linkset is not embedded".to_string())
        })?;
        let linkset_bytes = canonical_bytes(linkset_value)?;
        let linkset = Linkset::from_bytes(&linkset_bytes)?;
        let link = linkset.link()?;

        let generator = self
            .registry
            .get(&link.profile)
            .map_err(|e| InboxError::Validation(e.to_string()))?;

        let vc = credential_from_event(event).ok_or_else(|| {
            InboxError::Validation("offer has no embedded credential".to_string())
        })?;
        generator
            .validate_credential(&vc, &linkset_bytes)
            .map_err(|e| InboxError::Validation(e.to_string()))?;

        Ok(self.issuer.countersign(&vc, self.service_iri.clone())?)
    }

    // =========================================================================
    // LIKE / ACCEPT / REJECT (proof collection)
    // =========================================================================

    async fn handle_like(&self, activity: &Activity) -> Result<(), InboxError> {
        let index = activity.object_iri().ok_or_else(|| {
            InboxError::Validation("like has no object".to_string())
        })?;
        let anchor_hash = hashlink::get_resource_hash(index)
            .map_err(|e| InboxError::Validation(e.to_string()))?;

        self.storage
            .add_reference(RefKind::Like, &self.service_iri, &activity.id)?;

        if let Some(proof) = proof_from_result(activity) {
            self.pipeline
                .witness_proof(anchor_hash, activity.actor.clone(), proof)
                .await?;
        } else if !self.storage.has_anchor(&anchor_hash)? {
            debug!(%index, "like without proof for an unknown anchor");
        }
        Ok(())
    }

    async fn handle_accept(&self, activity: &Activity) -> Result<(), InboxError> {
        // Witness path: Accept of our Offer carries the anchor in target
        // and the proof in result
        if let (Some(target), Some(proof)) = (
            activity.target.as_ref().and_then(UrlProperty::first),
            proof_from_result(activity),
        ) {
            let anchor_hash = hashlink::get_resource_hash(target)
                .map_err(|e| InboxError::Validation(e.to_string()))?;
            self.pipeline
                .witness_proof(anchor_hash, activity.actor.clone(), proof)
                .await?;
            return Ok(());
        }

        // Relationship path: Accept matches an outstanding Follow/Invite
        // we issued
        let original = self.original_of(activity)?.ok_or_else(|| {
            InboxError::Validation("accept does not match an outstanding request".to_string())
        })?;
        if original.actor != self.service_iri {
            return Err(InboxError::Validation(
                "accepted activity was not issued by this service".to_string(),
            ));
        }

        match original.activity_type {
            ActivityType::Follow => {
                self.storage.add_reference(
                    RefKind::Following,
                    &self.service_iri,
                    &activity.actor,
                )?;
                info!(actor = %activity.actor, "following confirmed");
            }
            ActivityType::Invite => {
                self.storage
                    .add_reference(RefKind::Witness, &self.service_iri, &activity.actor)?;
                info!(actor = %activity.actor, "witness confirmed");
            }
            other => {
                debug!(kind = %other, "accept for an unhandled request type");
            }
        }
        Ok(())
    }

    fn handle_reject(&self, activity: &Activity) -> Result<(), InboxError> {
        match self.original_of(activity)? {
            Some(original) => {
                warn!(
                    actor = %activity.actor,
                    kind = %original.activity_type,
                    "request rejected by peer"
                );
            }
            None => debug!(actor = %activity.actor, "reject for unknown request"),
        }
        Ok(())
    }

    /// The stored activity an Accept/Reject refers to
    fn original_of(&self, activity: &Activity) -> Result<Option<Activity>, InboxError> {
        match activity.object.as_ref() {
            Some(ObjectValue::Activity(inner)) => Ok(Some((**inner).clone())),
            Some(ObjectValue::Iri(id)) => Ok(self.storage.get_activity(id)?),
            _ => Ok(None),
        }
    }
}

/// Extract the embedded anchor credential from an anchor event
fn credential_from_event(event: &AnchorEvent) -> Option<VerifiableCredential> {
    for att in &event.attachment {
        if let Some(content) = &att.content_object {
            if content.get("credentialSubject").is_some() {
                if let Ok(vc) = serde_json::from_value::<VerifiableCredential>(content.clone()) {
                    return Some(vc);
                }
            }
        }
    }
    None
}

/// Extract a witness proof from an activity's result position
fn proof_from_result(activity: &Activity) -> Option<Proof> {
    activity
        .result
        .as_ref()
        .and_then(ObjectValue::as_document)
        .and_then(|doc| serde_json::from_value(doc.clone()).ok())
}
