//! Activity outbox
//!
//! `post` persists an activity, resolves its recipients, and queues one
//! delivery message per recipient. A worker pool performs the signed
//! HTTP POSTs; transient failures are requeued through a timing-wheel
//! scheduler with exponential backoff, and messages that exhaust the
//! retry budget are routed to the undeliverable handler. Handlers on
//! the receiving side must be idempotent on `activity.id`; no ordering
//! is promised per recipient or per activity.

use crate::stats::{inc, NodeStats};
use crate::storage::{
    RefKind, Storage, StorageError, UndeliverableRecord, TAG_OUTBOX, TAG_PUBLIC_OUTBOX,
};
use async_trait::async_trait;
use chrono::Utc;
use orb_core::canonical::canonical_bytes;
use orb_core::vocab::{Activity, PUBLIC_IRI};
use orb_net::actor::{ActorError, ActorRetriever};
use orb_net::client::{ClientError, SignedClient};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbox errors
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("core error: {0}")]
    Core(#[from] orb_core::Error),
    #[error("outbox is shutting down")]
    ChannelClosed,
}

/// Delivery failure, classified for retry
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("actor resolution failed: {0}")]
    Actor(#[from] ActorError),
    #[error("delivery failed: {0}")]
    Client(#[from] ClientError),
}

impl DeliveryError {
    fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Client(e) => e.is_transient(),
            DeliveryError::Actor(ActorError::Http(_)) => true,
            DeliveryError::Actor(ActorError::Status { status, .. }) => *status >= 500,
            DeliveryError::Actor(_) => false,
        }
    }
}

/// Transport seam for the signed POST; swapped out in tests
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, inbox_url: &str, body: &[u8]) -> Result<(), ClientError>;
}

/// Production transport over the signed HTTP client
pub struct HttpTransport {
    client: SignedClient,
}

impl HttpTransport {
    pub fn new(client: SignedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(&self, inbox_url: &str, body: &[u8]) -> Result<(), ClientError> {
        self.client.post(inbox_url, body.to_vec()).await.map(|_| ())
    }
}

/// Outbox tuning
#[derive(Clone, Debug)]
pub struct OutboxConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// One queued delivery: an activity body bound for one recipient
#[derive(Clone, Debug)]
struct DeliveryTask {
    activity_id: String,
    /// Recipient actor IRI; the inbox URL is resolved per attempt so a
    /// stale cache entry heals across retries
    recipient: String,
    body: Arc<Vec<u8>>,
    attempts: u32,
}

/// The activity outbox
pub struct Outbox {
    storage: Arc<Storage>,
    service_iri: String,
    retriever: Arc<dyn ActorRetriever>,
    transport: Arc<dyn DeliveryTransport>,
    config: OutboxConfig,
    stats: Arc<NodeStats>,
    ready_tx: mpsc::Sender<DeliveryTask>,
    ready_rx: Mutex<Option<mpsc::Receiver<DeliveryTask>>>,
    retry_tx: mpsc::UnboundedSender<DeliveryTask>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryTask>>>,
    undeliverable_tx: mpsc::UnboundedSender<(DeliveryTask, String)>,
    undeliverable_rx: Mutex<Option<mpsc::UnboundedReceiver<(DeliveryTask, String)>>>,
}

impl Outbox {
    pub fn new(
        storage: Arc<Storage>,
        service_iri: impl Into<String>,
        retriever: Arc<dyn ActorRetriever>,
        transport: Arc<dyn DeliveryTransport>,
        config: OutboxConfig,
        stats: Arc<NodeStats>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(1024);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (undeliverable_tx, undeliverable_rx) = mpsc::unbounded_channel();
        Self {
            storage,
            service_iri: service_iri.into(),
            retriever,
            transport,
            config,
            stats,
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            undeliverable_tx,
            undeliverable_rx: Mutex::new(Some(undeliverable_rx)),
        }
    }

    /// Post an activity: assign an ID if absent, persist it, and queue a
    /// delivery per resolved recipient. Returns the activity IRI.
    pub async fn post(&self, mut activity: Activity) -> Result<String, OutboxError> {
        if activity.id.is_empty() {
            activity.id = format!("{}/activities/{}", self.service_iri, Uuid::new_v4());
        }
        if activity.published.is_none() {
            activity.published = Some(Utc::now());
        }

        let is_public = activity.to.iter().any(|t| t == PUBLIC_IRI);
        let tags: &[&str] = if is_public {
            &[TAG_OUTBOX, TAG_PUBLIC_OUTBOX]
        } else {
            &[TAG_OUTBOX]
        };
        self.storage.put_activity(&activity, tags)?;

        let body = Arc::new(canonical_bytes(&activity)?);
        for recipient in self.resolve_recipients(&activity)? {
            let task = DeliveryTask {
                activity_id: activity.id.clone(),
                recipient,
                body: body.clone(),
                attempts: 0,
            };
            self.ready_tx
                .send(task)
                .await
                .map_err(|_| OutboxError::ChannelClosed)?;
        }

        debug!(id = %activity.id, kind = %activity.activity_type, "posted activity");
        Ok(activity.id)
    }

    /// Expand recipients: drop the public pseudo-IRI, expand local
    /// collections, dedup, and skip ourselves.
    fn resolve_recipients(&self, activity: &Activity) -> Result<Vec<String>, OutboxError> {
        let mut recipients = BTreeSet::new();
        for to in &activity.to {
            if to == PUBLIC_IRI || to == &self.service_iri {
                continue;
            }
            if let Some(kind) = self.local_collection_kind(to) {
                for member in self.storage.references(kind, &self.service_iri)? {
                    if member != self.service_iri {
                        recipients.insert(member);
                    }
                }
            } else {
                recipients.insert(to.clone());
            }
        }
        Ok(recipients.into_iter().collect())
    }

    fn local_collection_kind(&self, iri: &str) -> Option<RefKind> {
        match iri.strip_prefix(self.service_iri.as_str())? {
            "/followers" => Some(RefKind::Follower),
            "/following" => Some(RefKind::Following),
            "/witnesses" => Some(RefKind::Witness),
            "/witnessing" => Some(RefKind::Witnessing),
            _ => None,
        }
    }

    /// Spawn the worker pool, the redelivery scheduler, and the
    /// undeliverable handler
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let ready_rx = self
            .ready_rx
            .try_lock()
            .expect("spawn called once")
            .take()
            .expect("spawn called once");
        let shared_rx = Arc::new(Mutex::new(ready_rx));

        for worker in 0..self.config.worker_count.max(1) {
            let outbox = self.clone();
            let rx = shared_rx.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            _ = shutdown_rx.recv() => None,
                        }
                    };
                    let Some(task) = task else { break };
                    outbox.attempt(task).await;
                }
                debug!(worker, "outbox worker stopped");
            }));
        }

        handles.push(self.spawn_redelivery(shutdown));
        handles.push(self.spawn_undeliverable(shutdown));
        handles
    }

    async fn attempt(&self, mut task: DeliveryTask) {
        match self.deliver_once(&task).await {
            Ok(()) => {
                inc(&self.stats.activities_delivered);
                debug!(id = %task.activity_id, to = %task.recipient, "delivered");
            }
            Err(e) if e.is_transient() && task.attempts + 1 < self.config.max_retries => {
                task.attempts += 1;
                inc(&self.stats.deliveries_retried);
                debug!(
                    id = %task.activity_id,
                    to = %task.recipient,
                    attempts = task.attempts,
                    "delivery failed, requeueing: {e}"
                );
                let _ = self.retry_tx.send(task);
            }
            Err(e) => {
                let _ = self.undeliverable_tx.send((task, e.to_string()));
            }
        }
    }

    async fn deliver_once(&self, task: &DeliveryTask) -> Result<(), DeliveryError> {
        let actor = self.retriever.get_actor(&task.recipient).await?;
        self.transport.deliver(&actor.inbox, &task.body).await?;
        Ok(())
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1) as i32;
        let delay = self.config.initial_backoff.as_secs_f64()
            * self.config.backoff_factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.config.max_backoff.as_secs_f64()))
    }

    fn spawn_redelivery(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let outbox = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut retry_rx = outbox
                .retry_rx
                .lock()
                .await
                .take()
                .expect("spawn called once");
            let mut queue: DelayQueue<DeliveryTask> = DelayQueue::new();

            loop {
                tokio::select! {
                    maybe = retry_rx.recv() => match maybe {
                        Some(task) => {
                            let delay = outbox.backoff(task.attempts);
                            queue.insert(task, delay);
                        }
                        None => break,
                    },
                    Some(expired) = futures::future::poll_fn(|cx| queue.poll_expired(cx)),
                        if !queue.is_empty() =>
                    {
                        if outbox.ready_tx.send(expired.into_inner()).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("redelivery scheduler stopped");
        })
    }

    fn spawn_undeliverable(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let outbox = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut rx = outbox
                .undeliverable_rx
                .lock()
                .await
                .take()
                .expect("spawn called once");

            loop {
                let item = tokio::select! {
                    item = rx.recv() => item,
                    _ = shutdown_rx.recv() => None,
                };
                let Some((task, reason)) = item else { break };
                outbox.handle_undeliverable(task, reason);
            }
            debug!("undeliverable handler stopped");
        })
    }

    fn handle_undeliverable(&self, task: DeliveryTask, reason: String) {
        inc(&self.stats.activities_undeliverable);
        warn!(
            id = %task.activity_id,
            to = %task.recipient,
            attempts = task.attempts,
            "giving up on delivery: {reason}"
        );

        if let Err(e) = self.storage.record_undeliverable(&UndeliverableRecord {
            activity_id: task.activity_id.clone(),
            recipient: task.recipient.clone(),
            reason,
            at: Utc::now(),
        }) {
            warn!("failed to record undeliverable: {e}");
        }

        // A follower that cannot be reached after the full retry budget
        // is treated as stale
        match self
            .storage
            .remove_reference(RefKind::Follower, &self.service_iri, &task.recipient)
        {
            Ok(true) => info!(follower = %task.recipient, "removed stale follower"),
            Ok(false) => {}
            Err(e) => warn!("failed to prune follower: {e}"),
        }
    }
}
