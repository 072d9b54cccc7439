//! Configuration structures for the fedlink server
//!
//! Every recognized option is enumerated here; the server refuses to start
//! on unrecognized or inconsistent values. Validation beyond serde's type
//! checking lives in the server's config loader.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Aggregation strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    /// Sample-count-weighted averaging (McMahan et al.)
    #[default]
    FedAvg,
    /// FedAvg aggregation with client-side proximal regularization
    FedProx,
    /// Control-variate corrected aggregation
    Scaffold,
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationMethod::FedAvg => write!(f, "fedavg"),
            AggregationMethod::FedProx => write!(f, "fedprox"),
            AggregationMethod::Scaffold => write!(f, "scaffold"),
        }
    }
}

/// FedProx-specific parameters.
///
/// `mu` is communicated to clients when a round opens; it never changes the
/// server-side merge formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FedProxConfig {
    /// Proximal term strength broadcast to clients
    pub mu: f64,
}

impl Default for FedProxConfig {
    fn default() -> Self {
        Self { mu: 0.01 }
    }
}

/// Differential privacy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DifferentialPrivacyConfig {
    /// Enable the Gaussian mechanism
    pub enabled: bool,
    /// Privacy budget epsilon
    pub epsilon: f64,
    /// Failure probability delta
    pub delta: f64,
    /// L2 clipping bound applied to every update before aggregation
    pub clip_norm: f64,
}

impl Default for DifferentialPrivacyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            epsilon: 8.0,
            delta: 1e-5,
            clip_norm: 1.0,
        }
    }
}

/// Secure aggregation (pairwise masking) configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureAggregationConfig {
    /// Enable mask-based blinding of client updates
    pub enabled: bool,
    /// Minimum surviving submitters below which the round aborts.
    ///
    /// Dropout policy: masks only cancel over the full participant set, so
    /// a round with fewer survivors than this bound is aborted rather than
    /// attempting mask reconstruction.
    pub min_survivors: usize,
}

impl Default for SecureAggregationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_survivors: 2,
        }
    }
}

/// Round sequencing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundConfig {
    /// Quorum: minimum clients required to aggregate
    pub min_clients: usize,
    /// Maximum accepted submissions per round (bounds buffer memory)
    pub max_clients: usize,
    /// Total round budget; the coordinator stops after this many rounds
    pub rounds: u64,
    /// Per-round deadline in seconds
    pub round_deadline_secs: u64,
    /// Backoff before retrying after an aborted round, in seconds
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Selected aggregation strategy
    #[serde(default)]
    pub aggregation_method: AggregationMethod,
    /// FedProx parameters
    #[serde(default)]
    pub fedprox: FedProxConfig,
    /// Differential privacy parameters
    #[serde(default)]
    pub differential_privacy: DifferentialPrivacyConfig,
    /// Secure aggregation parameters
    #[serde(default)]
    pub secure_aggregation: SecureAggregationConfig,
}

fn default_retry_backoff_secs() -> u64 {
    5
}

impl RoundConfig {
    /// Returns the round deadline as a `Duration`.
    pub fn round_deadline(&self) -> Duration {
        Duration::from_secs(self.round_deadline_secs)
    }

    /// Returns the retry backoff as a `Duration`.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

/// Client registry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Heartbeats older than this window mark a client stale
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    /// Consecutive missed liveness windows before eviction
    #[serde(default = "default_missed_heartbeat_threshold")]
    pub missed_heartbeat_threshold: u32,
    /// Upper bound on tracked clients; longest-idle entries are evicted
    /// first when at capacity
    #[serde(default = "default_max_tracked_clients")]
    pub max_tracked_clients: usize,
}

fn default_liveness_window_secs() -> u64 {
    30
}

fn default_missed_heartbeat_threshold() -> u32 {
    3
}

fn default_max_tracked_clients() -> usize {
    1024
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: default_liveness_window_secs(),
            missed_heartbeat_threshold: default_missed_heartbeat_threshold(),
            max_tracked_clients: default_max_tracked_clients(),
        }
    }
}

impl RegistryConfig {
    /// Returns the liveness window as a `Duration`.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    /// Returns the eviction age: liveness window times the missed threshold.
    pub fn eviction_age(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs * self.missed_heartbeat_threshold as u64)
    }
}

/// Model store parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for durable round checkpoints; in-memory only when unset
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Number of published versions to retain
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    /// Backoff between persistence retries, in seconds
    #[serde(default = "default_persist_retry_secs")]
    pub persist_retry_secs: u64,
}

fn default_max_versions() -> usize {
    100
}

fn default_persist_retry_secs() -> u64 {
    2
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            max_versions: default_max_versions(),
            persist_retry_secs: default_persist_retry_secs(),
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address the client-facing UDP transport binds to
    pub listen_ip: IpAddr,
    /// Port for client messages
    pub listen_port: u16,
    /// Port for the CLI control surface (0 disables it)
    #[serde(default)]
    pub cli_port: u16,
    /// Flattened global model dimension
    pub model_dimension: usize,
    /// Model schema version clients must match
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Round sequencing parameters
    pub round: RoundConfig,
    /// Client registry parameters
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Model store parameters
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_schema_version() -> u32 {
    1
}
