//! Proof monitor
//!
//! Watches issued anchor credentials until their countersigned inclusion
//! proof shows up in the configured VCT transparency log. Entries are
//! persisted under the `not_confirmed` tag so a restart resumes the
//! watch. The monitor runs one ticker-driven worker and never blocks the
//! anchor pipeline.

use crate::stats::{inc, NodeStats};
use crate::storage::{MonitorRecord, MonitorStatus, Storage, StorageError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Monitor errors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("log fetch failed: {0}")]
    LogFetch(String),
}

/// Signed tree head returned by a VCT log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    pub sha256_root_hash: String,
    pub tree_head_signature: String,
}

/// Inclusion proof for one leaf
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InclusionProof {
    pub leaf_index: u64,
    #[serde(default)]
    pub audit_path: Vec<String>,
}

/// Client for VCT transparency logs
#[derive(Clone)]
pub struct VctClient {
    http: reqwest::Client,
}

impl VctClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn get_sth(&self, log_url: &str) -> Result<SignedTreeHead, MonitorError> {
        let url = format!("{}/v1/get-sth", log_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MonitorError::LogFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MonitorError::LogFetch(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| MonitorError::LogFetch(e.to_string()))
    }

    pub async fn proof_by_hash(
        &self,
        log_url: &str,
        leaf_hash: &str,
        tree_size: u64,
    ) -> Result<InclusionProof, MonitorError> {
        let url = format!(
            "{}/v1/get-proof-by-hash?hash={}&tree_size={tree_size}",
            log_url.trim_end_matches('/'),
            urlencode(leaf_hash)
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MonitorError::LogFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MonitorError::LogFetch(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| MonitorError::LogFetch(e.to_string()))
    }
}

fn urlencode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

/// The proof monitor
pub struct ProofMonitor {
    storage: Arc<Storage>,
    vct: VctClient,
    interval: Duration,
    expiry_period: ChronoDuration,
    stats: Arc<NodeStats>,
}

impl ProofMonitor {
    pub fn new(
        storage: Arc<Storage>,
        vct: VctClient,
        tick_interval: Duration,
        expiry_period: Duration,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            storage,
            vct,
            interval: tick_interval,
            expiry_period: ChronoDuration::from_std(expiry_period)
                .unwrap_or_else(|_| ChronoDuration::seconds(3600)),
            stats,
        }
    }

    /// Start watching a credential until its inclusion proof appears
    pub fn watch(
        &self,
        credential_id: &str,
        anchor: &str,
        vc_bytes: &[u8],
    ) -> Result<(), MonitorError> {
        let record = MonitorRecord {
            credential_id: credential_id.to_string(),
            anchor: anchor.to_string(),
            vc_hash: orb_core::hashlink::resource_hash(vc_bytes),
            leaf_hash: BASE64.encode(Sha256::digest(vc_bytes)),
            expires_at: Utc::now() + self.expiry_period,
            status: MonitorStatus::NotConfirmed,
        };
        self.storage.put_monitor(&record)?;
        debug!(credential = %credential_id, "watching for inclusion proof");
        Ok(())
    }

    /// Ticker loop; runs until shutdown
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("monitor tick failed: {e}");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("proof monitor stopped");
    }

    /// One pass over the unconfirmed queue
    pub async fn tick(&self) -> Result<(), MonitorError> {
        let pending = self.storage.monitors_with_status(MonitorStatus::NotConfirmed)?;
        if pending.is_empty() {
            return Ok(());
        }

        let Some(log_url) = self.storage.active_log()? else {
            // no log configured; entries stay queued
            return Ok(());
        };

        let sth = match self.vct.get_sth(&log_url).await {
            Ok(sth) => sth,
            Err(e) => {
                // transient; try again next tick
                debug!("sth fetch failed: {e}");
                return Ok(());
            }
        };

        if let Ok(Some(mut log_record)) = self.storage.get_log_monitor(&log_url) {
            log_record.sth = serde_json::to_value(&sth).ok();
            let _ = self.storage.put_log_monitor(&log_record);
        }

        let now = Utc::now();
        for record in pending {
            // the credential bytes must still be resolvable locally
            if !self.storage.cas_has(&record.vc_hash)? {
                warn!(credential = %record.credential_id, "credential missing from store, dropping watch");
                self.storage.remove_monitor(&record)?;
                continue;
            }

            if now > record.expires_at {
                error!(
                    credential = %record.credential_id,
                    "inclusion proof did not appear before expiry"
                );
                self.storage.set_monitor_status(&record, MonitorStatus::Expired)?;
                inc(&self.stats.credentials_expired);
                continue;
            }

            match self
                .vct
                .proof_by_hash(&log_url, &record.leaf_hash, sth.tree_size)
                .await
            {
                Ok(proof) if !proof.audit_path.is_empty() => {
                    info!(credential = %record.credential_id, "inclusion proof confirmed");
                    self.storage.set_monitor_status(&record, MonitorStatus::Confirmed)?;
                    inc(&self.stats.credentials_confirmed);
                }
                Ok(_) => {
                    debug!(credential = %record.credential_id, "empty audit path, retrying");
                }
                Err(e) => {
                    // transient HTTP failure keeps the entry queued
                    debug!(credential = %record.credential_id, "proof fetch failed: {e}");
                }
            }
        }
        Ok(())
    }
}
