//! Anchor pipeline / batch writer
//!
//! A single-owner actor: all state mutations funnel through its command
//! channel, making the Collecting → Batching → Witnessing → Publishing
//! transitions serial by construction. Operation ingest crosses the
//! boundary over a bounded channel, so a backlogged pipeline applies
//! backpressure to the HTTP layer.
//!
//! A batch is cut when the pending set reaches `max_operations_per_batch`
//! or `batch_timeout` elapses since the first queued operation. Batching
//! is deterministic: operations sort by `(suffix, seq)` and the linkset
//! items preserve that order. Witnessing waits for proofs up to
//! `witness_timeout`; expiry requeues the operations at the head of the
//! next batch.

use crate::monitor::ProofMonitor;
use crate::outbox::{Outbox, OutboxError};
use crate::stats::{inc, NodeStats};
use crate::storage::{RefKind, Storage, StorageError};
use chrono::Utc;
use orb_core::canonical::canonical_bytes;
use orb_core::generator::{
    AnchorPayload, GeneratorRegistry, OperationReference, DID_ORB_NAMESPACE, DID_ORB_V0_PROFILE,
};
use orb_core::hashlink;
use orb_core::linkset::Linkset;
use orb_core::operation::{AnchoredOperation, Operation};
use orb_core::policy::{PolicyExpr, ProofContext, WitnessRole};
use orb_core::vc::{CredentialIssuer, Proof, VerifiableCredential};
use orb_core::vocab::{
    Activity, ActivityType, AnchorEvent, AnchorObject, AnchorObjectTag, ObjectValue,
    ANCHOR_WITNESS_TARGET, PUBLIC_IRI,
};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("core error: {0}")]
    Core(#[from] orb_core::Error),
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("monitor error: {0}")]
    Monitor(#[from] crate::monitor::MonitorError),
    #[error("pipeline channel closed")]
    ChannelClosed,
}

/// An operation waiting to be anchored
#[derive(Clone, Debug)]
pub struct PendingOp {
    pub suffix: String,
    pub seq: u64,
    pub operation: Operation,
}

/// Commands crossing into the pipeline actor
#[derive(Debug)]
pub enum PipelineCommand {
    Queue(PendingOp),
    WitnessProof {
        /// Resource hash of the anchor linkset the proof belongs to
        anchor_hash: String,
        witness: String,
        proof: Proof,
    },
}

/// Bounded sender into the pipeline actor
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
}

impl PipelineHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an operation; awaits when the pipeline is backlogged
    pub async fn queue(&self, op: PendingOp) -> Result<(), PipelineError> {
        self.tx
            .send(PipelineCommand::Queue(op))
            .await
            .map_err(|_| PipelineError::ChannelClosed)
    }

    /// Record a witness proof for a pending anchor
    pub async fn witness_proof(
        &self,
        anchor_hash: String,
        witness: String,
        proof: Proof,
    ) -> Result<(), PipelineError> {
        self.tx
            .send(PipelineCommand::WitnessProof {
                anchor_hash,
                witness,
                proof,
            })
            .await
            .map_err(|_| PipelineError::ChannelClosed)
    }
}

/// Pipeline tuning
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_operations_per_batch: usize,
    pub batch_timeout: Duration,
    pub witness_timeout: Duration,
    /// Statically configured system witnesses
    pub system_witnesses: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_operations_per_batch: 100,
            batch_timeout: Duration::from_secs(1),
            witness_timeout: Duration::from_secs(60),
            system_witnesses: Vec::new(),
        }
    }
}

enum BatchOutcome {
    Completed,
    Expired(Vec<PendingOp>),
    Shutdown,
}

/// The anchor pipeline actor
pub struct AnchorPipeline {
    storage: Arc<Storage>,
    outbox: Arc<Outbox>,
    issuer: CredentialIssuer,
    registry: GeneratorRegistry,
    monitor: Arc<ProofMonitor>,
    service_iri: String,
    config: PipelineConfig,
    stats: Arc<NodeStats>,
    rx: mpsc::Receiver<PipelineCommand>,
}

impl AnchorPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        outbox: Arc<Outbox>,
        issuer: CredentialIssuer,
        registry: GeneratorRegistry,
        monitor: Arc<ProofMonitor>,
        service_iri: impl Into<String>,
        config: PipelineConfig,
        stats: Arc<NodeStats>,
        rx: mpsc::Receiver<PipelineCommand>,
    ) -> Self {
        Self {
            storage,
            outbox,
            issuer,
            registry,
            monitor,
            service_iri: service_iri.into(),
            config,
            stats,
            rx,
        }
    }

    /// Actor loop; owns all pipeline state until shutdown
    pub async fn run(mut self, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();

        // Resume any operations persisted before a restart
        let mut pending: VecDeque<PendingOp> = VecDeque::new();
        let mut seen: HashSet<(String, u64)> = HashSet::new();
        match self.storage.all_unpublished() {
            Ok(ops) => {
                for anchored in ops {
                    if let Ok(suffix) = anchored.operation.suffix() {
                        let op = PendingOp {
                            suffix,
                            seq: anchored.op_index,
                            operation: anchored.operation,
                        };
                        seen.insert((op.suffix.clone(), op.seq));
                        pending.push_back(op);
                    }
                }
            }
            Err(e) => warn!("could not restore unpublished operations: {e}"),
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "restored pending operations");
        }

        let mut batch_deadline: Option<Instant> = if pending.is_empty() {
            None
        } else {
            Some(Instant::now() + self.config.batch_timeout)
        };

        loop {
            let cut_now = pending.len() >= self.config.max_operations_per_batch
                || batch_deadline.map(|d| Instant::now() >= d).unwrap_or(false);

            if cut_now && !pending.is_empty() {
                let take = pending.len().min(self.config.max_operations_per_batch);
                let mut batch: Vec<PendingOp> = pending.drain(..take).collect();
                for op in &batch {
                    seen.remove(&(op.suffix.clone(), op.seq));
                }
                // deterministic batch order
                batch.sort_by(|a, b| (&a.suffix, a.seq).cmp(&(&b.suffix, b.seq)));

                match self
                    .process_batch(batch, &mut pending, &mut seen, &mut shutdown_rx)
                    .await
                {
                    Ok(BatchOutcome::Completed) => {
                        inc(&self.stats.batches_completed);
                    }
                    Ok(BatchOutcome::Expired(ops)) => {
                        error!(operations = ops.len(), "batch expired without witness quorum");
                        inc(&self.stats.batches_expired);
                        // requeue at the head of the next batch
                        for op in ops.into_iter().rev() {
                            seen.insert((op.suffix.clone(), op.seq));
                            pending.push_front(op);
                        }
                    }
                    Ok(BatchOutcome::Shutdown) => break,
                    Err(e) => {
                        error!("batch failed: {e}");
                        inc(&self.stats.batches_expired);
                    }
                }
                batch_deadline = if pending.is_empty() {
                    None
                } else {
                    Some(Instant::now() + self.config.batch_timeout)
                };
                continue;
            }

            let deadline = batch_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(PipelineCommand::Queue(op)) => {
                        if seen.insert((op.suffix.clone(), op.seq)) {
                            pending.push_back(op);
                            if batch_deadline.is_none() {
                                batch_deadline = Some(Instant::now() + self.config.batch_timeout);
                            }
                        }
                    }
                    Some(PipelineCommand::WitnessProof { anchor_hash, .. }) => {
                        debug!(%anchor_hash, "witness proof outside a witnessing window, ignoring");
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if batch_deadline.is_some() => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("anchor pipeline stopped");
    }

    /// Batching → Witnessing → Publishing for one batch
    async fn process_batch(
        &mut self,
        batch: Vec<PendingOp>,
        pending: &mut VecDeque<PendingOp>,
        seen: &mut HashSet<(String, u64)>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<BatchOutcome, PipelineError> {
        let generator = self.registry.get(DID_ORB_V0_PROFILE)?;

        // Build the anchor payload in batch order
        let mut operations = Vec::with_capacity(batch.len());
        let mut parents: Vec<String> = Vec::new();
        for op in &batch {
            let previous = self.storage.latest_anchor(&op.suffix)?;
            if let Some(prev) = previous.as_deref() {
                if !parents.iter().any(|p| p == prev) {
                    parents.push(prev.to_string());
                }
            }
            operations.push(OperationReference {
                suffix: op.suffix.clone(),
                operation_type: op.operation.operation_type,
                previous,
                operation: Some(op.operation.clone()),
            });
        }
        let payload = AnchorPayload {
            namespace: DID_ORB_NAMESPACE.to_string(),
            version: generator.version(),
            author: self.service_iri.clone(),
            operations,
            parents,
        };

        let content = generator.create_content(&payload)?;
        let content_bytes = canonical_bytes(&content)?;
        let link = generator.build_link(&payload, &content_bytes);
        let anchor = link.anchor.clone();
        let linkset = Linkset::new(link);
        let linkset_bytes = linkset.canonical_bytes()?;
        let index = hashlink::create(&linkset_bytes);
        let anchor_hash = hashlink::get_resource_hash(&index)?;

        let mut vc = self.issuer.issue(
            format!("{}/vc/{}", self.service_iri, Uuid::new_v4()),
            &linkset_bytes,
            anchor.clone(),
            generator.profile(),
        )?;

        debug!(batch = batch.len(), %index, "batch sealed");

        // Witnessing
        let batch_witnesses: BTreeSet<String> = self
            .storage
            .references(RefKind::Witness, &self.service_iri)?
            .into_iter()
            .collect();
        let system_witnesses: BTreeSet<String> =
            self.config.system_witnesses.iter().cloned().collect();
        let policy = self.active_policy()?;
        let mut ctx = ProofContext {
            system: system_witnesses.clone(),
            batch: batch_witnesses.clone(),
            proofs: BTreeSet::new(),
        };

        let witness_targets: Vec<String> = batch_witnesses
            .union(&system_witnesses)
            .cloned()
            .collect();
        if !witness_targets.is_empty() {
            let offer_event =
                self.build_event(&linkset, &content, &vc, &index, &anchor, &payload.parents)?;
            let offer = Activity::new(ActivityType::Offer, self.service_iri.clone())
                .with_object(ObjectValue::AnchorEvent(Box::new(offer_event)))
                .with_target(ANCHOR_WITNESS_TARGET)
                .with_to(witness_targets);
            self.outbox.post(offer).await?;
        }

        if !policy.satisfied(&ctx) {
            let deadline = Instant::now() + self.config.witness_timeout;
            loop {
                tokio::select! {
                    cmd = self.rx.recv() => match cmd {
                        Some(PipelineCommand::Queue(op)) => {
                            // collected for the next batch
                            if seen.insert((op.suffix.clone(), op.seq)) {
                                pending.push_back(op);
                            }
                        }
                        Some(PipelineCommand::WitnessProof { anchor_hash: hash, witness, proof }) => {
                            if hash != anchor_hash {
                                debug!(%hash, "proof for a different anchor, ignoring");
                                continue;
                            }
                            debug!(%witness, "witness proof received");
                            vc.add_proof(proof);
                            ctx.proofs.insert(witness);
                            if policy.satisfied(&ctx) {
                                break;
                            }
                        }
                        None => return Err(PipelineError::ChannelClosed),
                    },
                    _ = sleep_until(deadline) => {
                        return Ok(BatchOutcome::Expired(batch));
                    }
                    _ = shutdown_rx.recv() => return Ok(BatchOutcome::Shutdown),
                }
            }
        }

        // Publishing
        self.publish(batch, &linkset, &content_bytes, &linkset_bytes, &vc, &index, &anchor, &anchor_hash, &payload.parents)
            .await?;
        Ok(BatchOutcome::Completed)
    }

    fn active_policy(&self) -> Result<PolicyExpr, PipelineError> {
        match self.storage.witness_policy()? {
            Some(raw) => Ok(raw.parse()?),
            // no policy configured: no witnesses required
            None => Ok(PolicyExpr::OutOf(0, WitnessRole::System)),
        }
    }

    fn build_event(
        &self,
        linkset: &Linkset,
        content: &serde_json::Value,
        vc: &VerifiableCredential,
        index: &str,
        anchor: &str,
        parents: &[String],
    ) -> Result<AnchorEvent, PipelineError> {
        let vc_bytes = canonical_bytes(vc)?;
        let mut event = AnchorEvent::new(index.to_string(), self.service_iri.clone());
        event.published = Some(Utc::now());
        event.parent = parents.to_vec();
        event.attachment.push(AnchorObject {
            tag: AnchorObjectTag::AnchorObject,
            url: index.to_string(),
            content_object: Some(serde_json::to_value(linkset).map_err(orb_core::Error::from)?),
            generator: Some(DID_ORB_V0_PROFILE.to_string()),
        });
        event.attachment.push(AnchorObject {
            tag: AnchorObjectTag::AnchorObject,
            url: anchor.to_string(),
            content_object: Some(content.clone()),
            generator: Some(DID_ORB_V0_PROFILE.to_string()),
        });
        event.attachment.push(AnchorObject {
            tag: AnchorObjectTag::AnchorObject,
            url: hashlink::create(&vc_bytes),
            content_object: Some(serde_json::to_value(vc).map_err(orb_core::Error::from)?),
            generator: None,
        });
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &mut self,
        batch: Vec<PendingOp>,
        linkset: &Linkset,
        content_bytes: &[u8],
        linkset_bytes: &[u8],
        vc: &VerifiableCredential,
        index: &str,
        anchor: &str,
        anchor_hash: &str,
        parents: &[String],
    ) -> Result<(), PipelineError> {
        // Content first, then the linkset that references it
        self.storage.cas_put(content_bytes)?;
        self.storage.cas_put(linkset_bytes)?;
        let vc_bytes = canonical_bytes(vc)?;
        self.storage.cas_put(&vc_bytes)?;

        let content: serde_json::Value =
            serde_json::from_slice(content_bytes).map_err(orb_core::Error::from)?;
        let event = self.build_event(linkset, &content, vc, index, anchor, parents)?;
        self.storage.put_anchor_event(anchor_hash, &event)?;

        // Flip the operations from unpublished to published
        let txn = self.storage.next_txn_number()?;
        for (position, op) in batch.iter().enumerate() {
            self.storage.put_published(&AnchoredOperation {
                operation: op.operation.clone(),
                txn_number: Some(txn),
                op_index: position as u64,
                anchor: Some(index.to_string()),
            })?;
            self.storage.remove_unpublished(&op.suffix, op.seq)?;
        }

        self.monitor.watch(&vc.id, anchor_hash, &vc_bytes)?;

        let announce = Activity::new(ActivityType::Announce, self.service_iri.clone())
            .with_object(ObjectValue::AnchorEvent(Box::new(event)))
            .with_to(vec![
                PUBLIC_IRI.to_string(),
                format!("{}/followers", self.service_iri),
            ]);
        self.outbox.post(announce).await?;

        info!(
            %index,
            txn,
            operations = batch.len(),
            proofs = vc.proof.len(),
            "anchor published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{DeliveryTransport, OutboxConfig};
    use crate::monitor::VctClient;
    use crate::storage::{MonitorStatus, TAG_PUBLIC_OUTBOX};
    use async_trait::async_trait;
    use orb_core::keys::KeyPair;
    use orb_core::operation::{
        canonical_multihash, Delta, DocumentContent, DocumentKey, OperationType, Patch,
        PublicKeyJwk, SuffixData,
    };
    use orb_net::actor::StaticActorRetriever;
    use orb_net::client::ClientError;
    use tempfile::tempdir;

    const SERVICE: &str = "https://node-a.example/services/orb";

    struct NullTransport;

    #[async_trait]
    impl DeliveryTransport for NullTransport {
        async fn deliver(&self, _inbox_url: &str, _body: &[u8]) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct Harness {
        handle: PipelineHandle,
        storage: Arc<Storage>,
        stats: Arc<NodeStats>,
        shutdown: broadcast::Sender<()>,
        _dir: tempfile::TempDir,
    }

    fn start_pipeline(config: PipelineConfig) -> Harness {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let stats = Arc::new(NodeStats::default());
        let (shutdown, _) = broadcast::channel(1);

        let outbox = Arc::new(Outbox::new(
            storage.clone(),
            SERVICE,
            Arc::new(StaticActorRetriever::new()),
            Arc::new(NullTransport),
            OutboxConfig {
                worker_count: 1,
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                backoff_factor: 2.0,
                max_backoff: Duration::from_millis(2),
            },
            stats.clone(),
        ));
        outbox.spawn(&shutdown);

        let keypair = KeyPair::from_seed(&[42; 32]);
        let issuer = CredentialIssuer::new(
            keypair,
            SERVICE.to_string(),
            format!("{SERVICE}/keys/main"),
        );
        let monitor = Arc::new(ProofMonitor::new(
            storage.clone(),
            VctClient::new(reqwest::Client::new()),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            stats.clone(),
        ));

        let (handle, rx) = PipelineHandle::channel(64);
        let pipeline = AnchorPipeline::new(
            storage.clone(),
            outbox,
            issuer,
            GeneratorRegistry::default(),
            monitor,
            SERVICE,
            config,
            stats.clone(),
            rx,
        );
        tokio::spawn(pipeline.run(shutdown.clone()));

        Harness {
            handle,
            storage,
            stats,
            shutdown,
            _dir: dir,
        }
    }

    fn jwk(key: &KeyPair) -> PublicKeyJwk {
        PublicKeyJwk::from_ed25519(&key.public_key())
    }

    fn create_op(seed: u8) -> Operation {
        let update_key = KeyPair::from_seed(&[seed; 32]);
        let recovery_key = KeyPair::from_seed(&[seed + 1; 32]);
        let delta = Delta {
            patches: vec![Patch::Replace {
                document: DocumentContent {
                    public_keys: vec![DocumentKey {
                        id: "key-1".to_string(),
                        key_type: "Ed25519VerificationKey2020".to_string(),
                        purposes: vec!["authentication".to_string()],
                        public_key_jwk: jwk(&update_key),
                    }],
                    services: vec![],
                },
            }],
            update_commitment: jwk(&update_key).commitment().unwrap(),
        };
        Operation {
            operation_type: OperationType::Create,
            did_suffix: None,
            suffix_data: Some(SuffixData {
                delta_hash: canonical_multihash(&delta).unwrap(),
                recovery_commitment: jwk(&recovery_key).commitment().unwrap(),
                anchor_origin: Some(SERVICE.to_string()),
            }),
            delta: Some(delta),
            signed_data: None,
        }
    }

    async fn queue_create(harness: &Harness, seed: u8) -> (String, u64) {
        let op = create_op(seed);
        let suffix = op.suffix().unwrap();
        let seq = harness.storage.generate_seq().unwrap();
        harness
            .storage
            .queue_unpublished(&suffix, &AnchoredOperation::unpublished(op.clone(), seq))
            .unwrap();
        harness
            .handle
            .queue(PendingOp {
                suffix: suffix.clone(),
                seq,
                operation: op,
            })
            .await
            .unwrap();
        (suffix, seq)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_batch_publishes_without_witnesses() {
        let harness = start_pipeline(PipelineConfig {
            max_operations_per_batch: 10,
            batch_timeout: Duration::from_millis(20),
            witness_timeout: Duration::from_millis(200),
            system_witnesses: Vec::new(),
        });
        let (suffix, _) = queue_create(&harness, 1).await;

        let storage = harness.storage.clone();
        wait_until(move || !storage.published_for(&suffix).unwrap().is_empty()).await;
        let stats = harness.stats.clone();
        wait_until(move || {
            stats
                .batches_completed
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        })
        .await;

        // unpublished store is drained
        assert!(harness.storage.all_unpublished().unwrap().is_empty());
        // the announce landed in the public outbox
        assert_eq!(harness.storage.count_by_tag(TAG_PUBLIC_OUTBOX).unwrap(), 1);
        // the credential is being watched
        assert_eq!(
            harness
                .storage
                .monitors_with_status(MonitorStatus::NotConfirmed)
                .unwrap()
                .len(),
            1
        );
        drop(harness.shutdown);
    }

    #[tokio::test]
    async fn test_witness_quorum_reached() {
        let harness = start_pipeline(PipelineConfig {
            max_operations_per_batch: 10,
            batch_timeout: Duration::from_millis(20),
            witness_timeout: Duration::from_secs(10),
            system_witnesses: Vec::new(),
        });
        harness
            .storage
            .set_witness_policy("MinPercent(100,batch)")
            .unwrap();
        harness
            .storage
            .add_reference(
                RefKind::Witness,
                SERVICE,
                "https://node-b.example/services/orb",
            )
            .unwrap();

        let (suffix, _) = queue_create(&harness, 3).await;

        // wait for the offer to be posted, then supply the proof
        let storage = harness.storage.clone();
        wait_until(move || storage.count_by_tag(crate::storage::TAG_OUTBOX).unwrap() >= 1).await;

        let event = wait_for_anchor_index(&harness).await;
        let proof = Proof {
            proof_type: orb_core::vc::PROOF_TYPE_ED25519_2020.to_string(),
            created: Utc::now(),
            verification_method: "https://node-b.example/services/orb/keys/main".to_string(),
            proof_purpose: "assertionMethod".to_string(),
            domain: Some("https://node-b.example/services/orb".to_string()),
            proof_value: "z3MvGcVxzRzzpKF1HA11EjvfPZsN8NAb7kXBRfeUmhMZOf".to_string(),
        };
        harness
            .handle
            .witness_proof(
                event,
                "https://node-b.example/services/orb".to_string(),
                proof,
            )
            .await
            .unwrap();

        let storage = harness.storage.clone();
        wait_until(move || !storage.published_for(&suffix).unwrap().is_empty()).await;
        drop(harness.shutdown);
    }

    /// Pull the pending anchor hash out of the posted Offer activity
    async fn wait_for_anchor_index(harness: &Harness) -> String {
        for _ in 0..1000 {
            let offers = harness
                .storage
                .activities_by_tag(crate::storage::TAG_OUTBOX, 0, 10)
                .unwrap();
            for activity in offers {
                if activity.activity_type == ActivityType::Offer {
                    if let Some(event) = activity.object.as_ref().and_then(|o| o.as_anchor_event())
                    {
                        let index = event.index.clone().unwrap();
                        return hashlink::get_resource_hash(&index).unwrap();
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("offer never posted");
    }

    #[tokio::test]
    async fn test_witness_timeout_expires_and_requeues() {
        let harness = start_pipeline(PipelineConfig {
            max_operations_per_batch: 10,
            batch_timeout: Duration::from_millis(10),
            witness_timeout: Duration::from_millis(50),
            system_witnesses: vec!["https://node-b.example/services/orb".to_string()],
        });
        harness
            .storage
            .set_witness_policy("OutOf(1,system)")
            .unwrap();

        let (suffix, _) = queue_create(&harness, 5).await;

        let stats = harness.stats.clone();
        wait_until(move || {
            stats
                .batches_expired
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        })
        .await;

        // the operation is still unpublished, requeued for the next batch
        assert!(harness.storage.published_for(&suffix).unwrap().is_empty());
        assert!(!harness.storage.all_unpublished().unwrap().is_empty());

        // relax the policy; the retried batch completes
        harness
            .storage
            .set_witness_policy("OutOf(0,system)")
            .unwrap();
        let storage = harness.storage.clone();
        wait_until(move || !storage.published_for(&suffix).unwrap().is_empty()).await;
        drop(harness.shutdown);
    }

    #[tokio::test]
    async fn test_batch_cut_on_size() {
        let harness = start_pipeline(PipelineConfig {
            max_operations_per_batch: 2,
            batch_timeout: Duration::from_secs(3600),
            witness_timeout: Duration::from_millis(100),
            system_witnesses: Vec::new(),
        });

        let (suffix_a, _) = queue_create(&harness, 7).await;
        let (suffix_b, _) = queue_create(&harness, 9).await;

        let storage = harness.storage.clone();
        let a = suffix_a.clone();
        let b = suffix_b.clone();
        wait_until(move || {
            !storage.published_for(&a).unwrap().is_empty()
                && !storage.published_for(&b).unwrap().is_empty()
        })
        .await;

        // both suffixes share one anchor transaction
        let txn_a = harness.storage.published_for(&suffix_a).unwrap()[0].txn_number;
        let txn_b = harness.storage.published_for(&suffix_b).unwrap()[0].txn_number;
        assert_eq!(txn_a, txn_b);
        drop(harness.shutdown);
    }
}
