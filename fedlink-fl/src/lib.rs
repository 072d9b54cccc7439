//! Federated-round coordination and aggregation engine
//!
//! This crate is the core of fedlink: it manages a dynamic set of remote
//! clients, drives a multi-round training protocol, and merges per-client
//! model updates into a single global model through a pluggable strategy,
//! optionally via privacy-preserving transforms.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Round Coordinator                            │
//! │   Idle → WaitingForQuorum → Collecting → Aggregating →            │
//! │        → Publishing → Idle        (Aborted on quorum/agg failure) │
//! └───────┬───────────────┬────────────────┬───────────────┬─────────┘
//!         │               │                │               │
//!   ┌─────▼─────┐   ┌─────▼─────┐   ┌──────▼─────┐   ┌─────▼─────┐
//!   │  Client   │   │  Privacy  │   │ Aggregator │   │   Model   │
//!   │ Registry  │   │  Engine   │   │ strategies │   │   Store   │
//!   └───────────┘   └───────────┘   └────────────┘   └───────────┘
//! ```
//!
//! Model parameters are opaque flat `f32` vectors; training itself happens
//! on the clients. The transport and control surface live in
//! `fedlink-server` and talk to this crate through plain method calls and
//! the [`coordinator::CoordinatorEvent`] seam.

pub mod aggregation;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod privacy;
pub mod registry;
pub mod store;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use fedlink_common::types::{ClientId, ModelVersion, RoundId};

pub use aggregation::{Aggregator, FedAvg, FedProx, Scaffold};
pub use coordinator::{CoordinatorEvent, MergeJob, RoundCoordinator, RoundState, StatusSnapshot};
pub use error::FlError;
pub use metrics::{ConvergenceDetector, RoundMetrics, TrainingDashboard};
pub use privacy::{PairwiseMasker, PrivacyEngine};
pub use registry::{ClientRecord, ClientRegistry, ClientStatus};
pub use store::ModelStore;

/// A client's contribution to one round.
///
/// Created on receipt, validated, buffered, and consumed exactly once by
/// the aggregation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    /// Contributing client
    pub client_id: ClientId,
    /// Round this update belongs to
    pub round_id: RoundId,
    /// Flattened parameter vector (masked when secure aggregation is on)
    pub parameters: Vec<f32>,
    /// Number of local samples the update was trained on
    pub sample_count: u64,
    /// Reported control-variate delta (SCAFFOLD only)
    pub control_variate: Option<Vec<f32>>,
    /// Masking session tag (secure aggregation only)
    pub mask_tag: Option<u64>,
    /// Local training loss, reporting only
    pub loss: f32,
}

/// The published global model.
///
/// Immutable once published; each successful round creates a new entity
/// with a version exactly one higher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    /// Strictly increasing version
    pub version: ModelVersion,
    /// Flattened parameter vector
    pub parameters: Vec<f32>,
    /// Average client-reported loss at publication (reporting only)
    pub loss: f32,
    /// Optional evaluation accuracy supplied by the model backend
    pub accuracy: Option<f32>,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at_ms: u64,
}

impl GlobalModel {
    /// Creates the initial model (version 0, zeroed parameters).
    pub fn initial(dimension: usize) -> Self {
        Self {
            version: ModelVersion::new(0),
            parameters: vec![0.0; dimension],
            loss: 0.0,
            accuracy: None,
            created_at_ms: timestamp_now_ms(),
        }
    }

    /// Returns the parameter vector length.
    pub fn dimension(&self) -> usize {
        self.parameters.len()
    }
}

/// Updated control-variate state produced by a SCAFFOLD merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlVariateOutcome {
    /// New running global control variate
    pub global: Vec<f32>,
    /// Per-client control variates for the contributing clients
    pub per_client: Vec<(ClientId, Vec<f32>)>,
}

/// Output of one merge over a round's update buffer.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    /// Merged parameter vector
    pub parameters: Vec<f32>,
    /// Number of contributing clients
    pub contributing_clients: usize,
    /// Total sample weight across contributions
    pub total_weight: u64,
    /// Set when the weighted mean degraded to an unweighted mean because
    /// every contribution reported zero samples
    pub low_confidence: bool,
    /// Average reported loss across contributions
    pub avg_loss: f32,
    /// Control-variate state to commit on publication (SCAFFOLD only)
    pub control_variates: Option<ControlVariateOutcome>,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn timestamp_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
