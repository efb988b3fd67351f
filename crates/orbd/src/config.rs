//! Configuration for orbd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// orbd - Orb DID anchoring daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "orbd")]
#[command(about = "Federated DID anchoring node")]
pub struct Config {
    /// Listen address for the HTTP surface
    #[arg(short, long, default_value = "0.0.0.0:9220")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/orbd")]
    pub data_dir: PathBuf,

    /// Externally reachable base URL of this node
    #[arg(long, env = "ORB_EXTERNAL_URL", default_value = "http://localhost:9220")]
    pub external_url: String,

    /// Service name under /services/{name}
    #[arg(long, env = "ORB_SERVICE_NAME", default_value = "orb")]
    pub service_name: String,

    /// Path to the 32-byte hex key seed; created on first start
    #[arg(long, default_value = "./data/orbd/key.seed")]
    pub key_seed_file: PathBuf,

    /// Maximum operations per anchor batch
    #[arg(long, default_value = "100")]
    pub max_operations_per_batch: usize,

    /// Batch cut timeout in milliseconds since the first queued operation
    #[arg(long, default_value = "1000")]
    pub batch_timeout_ms: u64,

    /// Wall-clock budget for witness proof collection, in seconds
    #[arg(long, default_value = "60")]
    pub witness_timeout_secs: u64,

    /// Witness policy expression (e.g. "MinPercent(100,batch) AND OutOf(1,system)")
    #[arg(long, env = "ORB_WITNESS_POLICY")]
    pub witness_policy: Option<String>,

    /// Statically configured system witness IRIs (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub system_witnesses: Vec<String>,

    /// Allowed anchor-origin IRIs; empty allows any origin
    #[arg(long, value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Actor IRIs allowed to follow this node; empty accepts all
    #[arg(long, value_delimiter = ',')]
    pub follower_allowlist: Vec<String>,

    /// Outbox delivery worker count
    #[arg(long, default_value = "4")]
    pub outbox_workers: usize,

    /// Maximum redelivery attempts per recipient
    #[arg(long, default_value = "5")]
    pub max_retries: u32,

    /// Initial redelivery backoff in milliseconds
    #[arg(long, default_value = "500")]
    pub initial_backoff_ms: u64,

    /// Redelivery backoff multiplier
    #[arg(long, default_value = "2.0")]
    pub backoff_factor: f64,

    /// Maximum redelivery backoff in milliseconds
    #[arg(long, default_value = "60000")]
    pub max_backoff_ms: u64,

    /// Per-recipient publish timeout in milliseconds
    #[arg(long, default_value = "10000")]
    pub publish_timeout_ms: u64,

    /// Proof monitor tick interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub monitor_interval_ms: u64,

    /// How long a credential may stay unconfirmed before expiring, in seconds
    #[arg(long, default_value = "3600")]
    pub monitor_expiry_secs: u64,

    /// VCT transparency log URL
    #[arg(long, env = "ORB_VCT_LOG_URL")]
    pub vct_log_url: Option<String>,

    /// IPFS gateway for CAS fallback (e.g. https://ipfs.io)
    #[arg(long, env = "ORB_IPFS_GATEWAY")]
    pub ipfs_gateway: Option<String>,

    /// Maximum accepted operation size in bytes
    #[arg(long, default_value = "8192")]
    pub max_operation_bytes: usize,

    /// Accepted clock skew for anchor timestamps, in seconds
    #[arg(long, default_value = "600")]
    pub anchor_time_delta_secs: u64,

    /// Countersign observed anchor events from actors we witness
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_like: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// IRI of this node's service actor
    pub fn service_iri(&self) -> String {
        format!(
            "{}/services/{}",
            self.external_url.trim_end_matches('/'),
            self.service_name
        )
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn witness_timeout(&self) -> Duration {
        Duration::from_secs(self.witness_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Validate configuration; violations here are fatal at startup
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.external_url.starts_with("http://") && !self.external_url.starts_with("https://") {
            anyhow::bail!("external URL must be http(s): {}", self.external_url);
        }
        if self.service_name.is_empty() {
            anyhow::bail!("service name cannot be empty");
        }
        if self.max_operations_per_batch == 0 {
            anyhow::bail!("max operations per batch must be positive");
        }
        if self.backoff_factor < 1.0 {
            anyhow::bail!("backoff factor must be >= 1.0");
        }
        if let Some(policy) = &self.witness_policy {
            policy
                .parse::<orb_core::policy::PolicyExpr>()
                .map_err(|e| anyhow::anyhow!("invalid witness policy: {e}"))?;
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("log format must be json or pretty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["orbd"])
    }

    #[test]
    fn test_defaults_validate() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_service_iri() {
        let mut config = base_config();
        config.external_url = "https://node-a.example/".to_string();
        assert_eq!(config.service_iri(), "https://node-a.example/services/orb");
    }

    #[test]
    fn test_bad_policy_is_fatal() {
        let mut config = base_config();
        config.witness_policy = Some("OutOf(1,nowhere)".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_external_url_is_fatal() {
        let mut config = base_config();
        config.external_url = "node-a.example".to_string();
        assert!(config.validate().is_err());
    }
}
