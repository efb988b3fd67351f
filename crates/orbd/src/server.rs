//! orbd server - component wiring and HTTP surface
//!
//! `Server::new` builds every subsystem from the configuration;
//! `Server::run` spawns the background tasks (outbox workers, inbox
//! worker, anchor pipeline, proof monitor) and serves the HTTP surface
//! until a shutdown signal arrives, then drains and flushes.

use crate::cas::{CasResolver, CasStore, IpfsClient};
use crate::config::Config;
use crate::inbox::{AuthPolicy, Inbox, InboxConfig, InboxError};
use crate::monitor::{ProofMonitor, VctClient};
use crate::outbox::{HttpTransport, Outbox, OutboxConfig};
use crate::pipeline::{AnchorPipeline, PipelineConfig, PipelineHandle};
use crate::sidetree::processor::{IngestOutcome, OperationProcessor, ProcessorConfig, ProcessorError};
use crate::sidetree::resolver::{DidResolver, ResolverError};
use crate::stats::NodeStats;
use crate::storage::{RefKind, Storage, TAG_OUTBOX};
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use orb_core::generator::{GeneratorRegistry, DID_ORB_NAMESPACE};
use orb_core::keys::KeyPair;
use orb_core::operation::Operation;
use orb_core::policy::PolicyExpr;
use orb_core::vc::CredentialIssuer;
use orb_core::vocab::{Activity, ACTIVITY_STREAMS_CONTEXT};
use orb_net::actor::{Actor, ActorRetriever, HttpActorRetriever};
use orb_net::client::SignedClient;
use orb_net::webcas::WebCasClient;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Collection page size
const PAGE_SIZE: usize = 50;
/// Actor cache TTL
const ACTOR_CACHE_TTL: Duration = Duration::from_secs(300);
/// Drain budget per background task at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared handles behind the HTTP surface
pub struct Node {
    pub storage: Arc<Storage>,
    pub cas: Arc<CasResolver>,
    pub resolver: Arc<DidResolver>,
    pub processor: Arc<OperationProcessor>,
    pub inbox: Arc<Inbox>,
    pub outbox: Arc<Outbox>,
    pub monitor: Arc<ProofMonitor>,
    pub pipeline: PipelineHandle,
    pub stats: Arc<NodeStats>,
    pub service_iri: String,
    pub service_name: String,
    pub actor: Actor,
}

impl Node {
    /// Ask a peer to accept us as a follower
    pub async fn follow(&self, actor: &str) -> Result<String, crate::outbox::OutboxError> {
        let activity = Activity::new(
            orb_core::vocab::ActivityType::Follow,
            self.service_iri.clone(),
        )
        .with_object(orb_core::vocab::ObjectValue::Iri(actor.to_string()))
        .with_to(vec![actor.to_string()]);
        self.outbox.post(activity).await
    }

    /// Invite a peer to witness our anchors; their Accept lands them in
    /// the Witness set
    pub async fn invite_witness(
        &self,
        actor: &str,
    ) -> Result<String, crate::outbox::OutboxError> {
        let activity = Activity::new(
            orb_core::vocab::ActivityType::Invite,
            self.service_iri.clone(),
        )
        .with_object(orb_core::vocab::ObjectValue::Iri(actor.to_string()))
        .with_target(orb_core::vocab::ANCHOR_WITNESS_TARGET)
        .with_to(vec![actor.to_string()]);
        self.outbox.post(activity).await
    }
}

/// Server state
pub struct Server {
    config: Config,
    node: Arc<Node>,
    pipeline: Option<AnchorPipeline>,
    shutdown_tx: broadcast::Sender<()>,
}

fn load_or_create_keypair(config: &Config) -> anyhow::Result<KeyPair> {
    if config.key_seed_file.exists() {
        let hex_seed = std::fs::read_to_string(&config.key_seed_file)
            .with_context(|| format!("reading {}", config.key_seed_file.display()))?;
        let bytes = hex::decode(hex_seed.trim()).context("key seed is not hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("key seed must be 32 bytes"))?;
        return Ok(KeyPair::from_seed(&seed));
    }

    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    if let Some(parent) = config.key_seed_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.key_seed_file, hex::encode(seed))
        .with_context(|| format!("writing {}", config.key_seed_file.display()))?;
    info!(path = %config.key_seed_file.display(), "generated new service key seed");
    Ok(KeyPair::from_seed(&seed))
}

impl Server {
    /// Wire every subsystem from the configuration
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let stats = Arc::new(NodeStats::default());
        let service_iri = config.service_iri();
        let keypair = load_or_create_keypair(&config)?;
        let key_id = format!("{service_iri}/keys/main");

        let client = SignedClient::new(keypair.clone(), key_id.clone(), config.publish_timeout())?;
        let retriever: Arc<dyn ActorRetriever> =
            Arc::new(HttpActorRetriever::new(client.http(), ACTOR_CACHE_TTL));

        let ipfs = config
            .ipfs_gateway
            .as_deref()
            .map(|gateway| IpfsClient::new(gateway, client.http()));
        let cas = Arc::new(CasResolver::new(
            CasStore::new(storage.clone()),
            Some(WebCasClient::new(client.clone())),
            ipfs,
        ));

        let outbox = Arc::new(Outbox::new(
            storage.clone(),
            service_iri.clone(),
            retriever.clone(),
            Arc::new(HttpTransport::new(client.clone())),
            OutboxConfig {
                worker_count: config.outbox_workers,
                max_retries: config.max_retries,
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
                backoff_factor: config.backoff_factor,
                max_backoff: Duration::from_millis(config.max_backoff_ms),
            },
            stats.clone(),
        ));

        let issuer = CredentialIssuer::new(keypair.clone(), service_iri.clone(), key_id);
        let registry = GeneratorRegistry::default();

        let monitor = Arc::new(ProofMonitor::new(
            storage.clone(),
            VctClient::new(client.http()),
            Duration::from_millis(config.monitor_interval_ms),
            Duration::from_secs(config.monitor_expiry_secs),
            stats.clone(),
        ));
        if let Some(url) = config.vct_log_url.as_deref() {
            storage.set_active_log(url)?;
        }
        if let Some(policy) = config.witness_policy.as_deref() {
            storage.set_witness_policy(policy)?;
        }

        let (pipeline_handle, pipeline_rx) = PipelineHandle::channel(256);
        let resolver = Arc::new(DidResolver::new(storage.clone(), DID_ORB_NAMESPACE));
        let processor = Arc::new(OperationProcessor::new(
            storage.clone(),
            resolver.clone(),
            pipeline_handle.clone(),
            registry.clone(),
            cas.clone(),
            client.http(),
            service_iri.clone(),
            ProcessorConfig {
                max_operation_bytes: config.max_operation_bytes,
                allowed_origins: config.allowed_origins.clone(),
                anchor_time_delta_secs: config.anchor_time_delta_secs as i64,
            },
            stats.clone(),
        ));

        let inbox = Arc::new(Inbox::new(
            storage.clone(),
            service_iri.clone(),
            retriever,
            outbox.clone(),
            processor.clone(),
            pipeline_handle.clone(),
            issuer.clone(),
            registry.clone(),
            InboxConfig {
                follower_auth: AuthPolicy::from_list(&config.follower_allowlist),
                witness_auth: AuthPolicy::AcceptAll,
                auto_like: config.auto_like,
                max_retries: 3,
            },
            stats.clone(),
        ));

        let pipeline = AnchorPipeline::new(
            storage.clone(),
            outbox.clone(),
            issuer,
            registry,
            monitor.clone(),
            service_iri.clone(),
            PipelineConfig {
                max_operations_per_batch: config.max_operations_per_batch,
                batch_timeout: config.batch_timeout(),
                witness_timeout: config.witness_timeout(),
                system_witnesses: config.system_witnesses.clone(),
            },
            stats.clone(),
            pipeline_rx,
        );

        let actor = Actor::for_service(&service_iri, keypair.public_key_multibase());
        let (shutdown_tx, _) = broadcast::channel(1);

        let node = Arc::new(Node {
            storage,
            cas,
            resolver,
            processor,
            inbox,
            outbox,
            monitor,
            pipeline: pipeline_handle,
            stats,
            service_iri,
            service_name: config.service_name.clone(),
            actor,
        });

        Ok(Self {
            config,
            node,
            pipeline: Some(pipeline),
            shutdown_tx,
        })
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.clone()
    }

    /// Signal shutdown: publishers stop accepting work and drain
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sender used to signal shutdown from outside `run`
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run background tasks and the HTTP surface until shutdown
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            "starting orbd as {} on {}",
            self.node.service_iri, self.config.listen
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.extend(self.node.outbox.spawn(&self.shutdown_tx));
        handles.push(self.node.inbox.spawn(&self.shutdown_tx));
        let pipeline = self.pipeline.take().context("server already running")?;
        handles.push(tokio::spawn(pipeline.run(self.shutdown_tx.clone())));
        handles.push(tokio::spawn(
            self.node.monitor.clone().run(self.shutdown_tx.clone()),
        ));

        let router = build_router(self.node.clone());
        let listener = tokio::net::TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("binding {}", self.config.listen))?;
        info!("listening on {}", self.config.listen);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        // Drain background tasks within the grace window
        let _ = self.shutdown_tx.send(());
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("background task did not drain within the grace window");
            }
        }
        self.node.storage.flush()?;
        info!("orbd stopped");
        Ok(())
    }
}

// =============================================================================
// ROUTES
// =============================================================================

pub fn build_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cas/:hash", get(get_cas))
        .route("/identifiers/:did", get(resolve_did))
        .route("/sidetree/operations", post(post_operation))
        .route("/services/:name", get(get_service))
        .route("/services/:name/keys/:key", get(get_service_key))
        .route("/services/:name/inbox", post(post_inbox))
        .route("/services/:name/outbox", get(get_outbox))
        .route("/services/:name/followers", get(get_followers))
        .route("/services/:name/following", get(get_following))
        .route("/services/:name/witnesses", get(get_witnesses))
        .route("/services/:name/witnessing", get(get_witnessing))
        .route("/log", get(get_log).post(post_log))
        .route("/policy", get(get_policy).post(post_policy))
        .with_state(node)
}

fn inbox_error_response(e: InboxError) -> Response {
    match e {
        InboxError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
        InboxError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        InboxError::Transient(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg).into_response(),
        other => {
            error!("inbox failure: {other}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn processor_error_response(e: ProcessorError) -> Response {
    match e {
        ProcessorError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        ProcessorError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
        ProcessorError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
        ProcessorError::Transient(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg).into_response(),
        other => {
            error!("operation ingest failure: {other}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health(State(node): State<Arc<Node>>) -> Response {
    Json(json!({
        "status": "ok",
        "service": node.service_iri,
        "stats": node.stats.snapshot(),
        "casPeers": node.cas.peers(),
    }))
    .into_response()
}

async fn get_cas(State(node): State<Arc<Node>>, Path(hash): Path<String>) -> Response {
    match node.cas.store().read(&hash) {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(crate::cas::CasError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(crate::cas::CasError::Core(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(e) => {
            error!("cas read failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn resolve_did(State(node): State<Arc<Node>>, Path(did): Path<String>) -> Response {
    match node.resolver.resolve(&did) {
        Ok(result) => Json(result).into_response(),
        Err(ResolverError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(ResolverError::InvalidDid(msg)) => (StatusCode::BAD_REQUEST, msg).into_response(),
        Err(e) => {
            error!("resolution failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn post_operation(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let op: Operation = match serde_json::from_slice(&body) {
        Ok(op) => op,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad operation: {e}")).into_response(),
    };
    match node.processor.ingest(op).await {
        Ok(IngestOutcome::Created(result)) => (StatusCode::OK, Json(*result)).into_response(),
        Ok(IngestOutcome::Queued { suffix }) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "queued", "didSuffix": suffix})),
        )
            .into_response(),
        Err(e) => processor_error_response(e),
    }
}

async fn get_service(State(node): State<Arc<Node>>, Path(name): Path<String>) -> Response {
    if name != node.service_name {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/activity+json")],
        Json(node.actor.clone()),
    )
        .into_response()
}

async fn get_service_key(
    State(node): State<Arc<Node>>,
    Path((name, key)): Path<(String, String)>,
) -> Response {
    if name != node.service_name || format!("{}/keys/{key}", node.service_iri) != node.actor.public_key.id
    {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(node.actor.public_key.clone()).into_response()
}

async fn post_inbox(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if name != node.service_name {
        return StatusCode::NOT_FOUND.into_response();
    }

    let header_value = |key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let signature = header_value("signature");
    if signature.is_empty() {
        return (StatusCode::UNAUTHORIZED, "missing signature header").into_response();
    }

    let actor = match node
        .inbox
        .authenticate(
            "POST",
            &format!("/services/{name}/inbox"),
            &header_value("host"),
            &header_value("date"),
            &header_value("digest"),
            &signature,
            &body,
        )
        .await
    {
        Ok(actor) => actor,
        Err(e) => return inbox_error_response(e),
    };

    let activity = match Activity::from_bytes(&body) {
        Ok(activity) => activity,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad activity: {e}")).into_response(),
    };

    match node.inbox.submit(activity, &actor).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => inbox_error_response(e),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<usize>,
}

async fn get_outbox(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    if name != node.service_name {
        return StatusCode::NOT_FOUND.into_response();
    }
    let collection_id = format!("{}/outbox", node.service_iri);
    let total = match node.storage.count_by_tag(TAG_OUTBOX) {
        Ok(total) => total,
        Err(e) => {
            error!("outbox listing failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match query.page {
        None => Json(collection_envelope(&collection_id, total)).into_response(),
        Some(page) => {
            match node
                .storage
                .activities_by_tag(TAG_OUTBOX, page * PAGE_SIZE, PAGE_SIZE)
            {
                Ok(items) => {
                    let items: Vec<serde_json::Value> = items
                        .iter()
                        .filter_map(|a| serde_json::to_value(a).ok())
                        .collect();
                    Json(collection_page(&collection_id, total, page, items)).into_response()
                }
                Err(e) => {
                    error!("outbox listing failed: {e}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

async fn reference_collection(
    node: &Node,
    name: &str,
    kind: RefKind,
    segment: &str,
    page: Option<usize>,
) -> Response {
    if name != node.service_name {
        return StatusCode::NOT_FOUND.into_response();
    }
    let collection_id = format!("{}/{segment}", node.service_iri);
    let total = match node.storage.reference_count(kind, &node.service_iri) {
        Ok(total) => total,
        Err(e) => {
            error!("collection listing failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match page {
        None => Json(collection_envelope(&collection_id, total)).into_response(),
        Some(page) => {
            match node
                .storage
                .references_page(kind, &node.service_iri, page * PAGE_SIZE, PAGE_SIZE)
            {
                Ok(members) => {
                    let items: Vec<serde_json::Value> =
                        members.into_iter().map(serde_json::Value::String).collect();
                    Json(collection_page(&collection_id, total, page, items)).into_response()
                }
                Err(e) => {
                    error!("collection listing failed: {e}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

async fn get_followers(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    reference_collection(&node, &name, RefKind::Follower, "followers", query.page).await
}

async fn get_following(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    reference_collection(&node, &name, RefKind::Following, "following", query.page).await
}

async fn get_witnesses(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    reference_collection(&node, &name, RefKind::Witness, "witnesses", query.page).await
}

async fn get_witnessing(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    reference_collection(&node, &name, RefKind::Witnessing, "witnessing", query.page).await
}

fn collection_envelope(id: &str, total: usize) -> serde_json::Value {
    json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total,
        "first": format!("{id}?page=0"),
    })
}

fn collection_page(
    id: &str,
    total: usize,
    page: usize,
    items: Vec<serde_json::Value>,
) -> serde_json::Value {
    let mut doc = json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": format!("{id}?page={page}"),
        "type": "OrderedCollectionPage",
        "partOf": id,
        "totalItems": total,
        "orderedItems": items,
    });
    if (page + 1) * PAGE_SIZE < total {
        doc["next"] = json!(format!("{id}?page={}", page + 1));
    }
    doc
}

async fn get_log(State(node): State<Arc<Node>>) -> Response {
    match node.storage.active_log() {
        Ok(Some(url)) => url.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("log lookup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn post_log(State(node): State<Arc<Node>>, body: String) -> Response {
    let url = body.trim();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return (StatusCode::BAD_REQUEST, "log must be an http(s) URL").into_response();
    }
    match node.storage.set_active_log(url) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!("log update failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_policy(State(node): State<Arc<Node>>) -> Response {
    match node.storage.witness_policy() {
        Ok(Some(policy)) => policy.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("policy lookup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn post_policy(State(node): State<Arc<Node>>, body: String) -> Response {
    let raw = body.trim();
    if let Err(e) = raw.parse::<PolicyExpr>() {
        return (StatusCode::BAD_REQUEST, format!("bad policy: {e}")).into_response();
    }
    match node.storage.set_witness_policy(raw) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!("policy update failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
