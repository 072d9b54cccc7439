//! Round metrics and convergence tracking
//!
//! Reporting only; nothing here feeds back into aggregation correctness.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use fedlink_common::types::{ModelVersion, RoundId};

/// Metrics for one completed round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// Round identifier
    pub round_id: RoundId,
    /// Model version published by this round
    pub version: ModelVersion,
    /// Number of contributing clients
    pub contributing_clients: usize,
    /// Total sample weight
    pub total_weight: u64,
    /// Average client-reported loss
    pub avg_loss: f32,
    /// Whether the merge degraded to an unweighted mean
    pub low_confidence: bool,
    /// Round wall time in milliseconds
    pub duration_ms: u64,
}

/// Convergence detector over a moving loss window.
///
/// Convergence is declared when the relative change between the first and
/// second half of the window drops below the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceDetector {
    window_size: usize,
    loss_history: VecDeque<f32>,
    threshold: f32,
}

impl ConvergenceDetector {
    /// Creates a detector with the given window and relative threshold.
    pub fn new(window_size: usize, threshold: f32) -> Self {
        Self {
            window_size,
            loss_history: VecDeque::with_capacity(window_size),
            threshold,
        }
    }

    /// Records a round's average loss.
    pub fn record(&mut self, loss: f32) {
        if self.loss_history.len() >= self.window_size {
            self.loss_history.pop_front();
        }
        self.loss_history.push_back(loss);
    }

    /// True when the loss has flattened over the window.
    pub fn has_converged(&self) -> bool {
        if self.loss_history.len() < self.window_size {
            return false;
        }
        let half = self.window_size / 2;
        let first: f32 = self.loss_history.iter().take(half).sum::<f32>() / half as f32;
        let second: f32 = self.loss_history.iter().skip(half).sum::<f32>()
            / (self.window_size - half) as f32;
        if first == 0.0 {
            return false;
        }
        ((first - second) / first).abs() < self.threshold
    }

    /// Current moving-average loss, if any rounds were recorded.
    pub fn moving_average(&self) -> Option<f32> {
        if self.loss_history.is_empty() {
            None
        } else {
            Some(self.loss_history.iter().sum::<f32>() / self.loss_history.len() as f32)
        }
    }
}

/// Rolling history of round metrics for the control surface.
pub struct TrainingDashboard {
    rounds: Vec<RoundMetrics>,
    convergence: ConvergenceDetector,
    aborted_rounds: u64,
    max_history: usize,
}

impl TrainingDashboard {
    /// Creates a dashboard with the given convergence parameters.
    pub fn new(convergence_window: usize, convergence_threshold: f32, max_history: usize) -> Self {
        Self {
            rounds: Vec::new(),
            convergence: ConvergenceDetector::new(convergence_window, convergence_threshold),
            aborted_rounds: 0,
            max_history,
        }
    }

    /// Records a completed round.
    pub fn record_round(&mut self, metrics: RoundMetrics) {
        self.convergence.record(metrics.avg_loss);
        self.rounds.push(metrics);
        if self.rounds.len() > self.max_history {
            let excess = self.rounds.len() - self.max_history;
            self.rounds.drain(..excess);
        }
    }

    /// Counts an aborted round.
    pub fn record_abort(&mut self) {
        self.aborted_rounds += 1;
    }

    /// Metrics of the most recent completed round.
    pub fn last_round(&self) -> Option<&RoundMetrics> {
        self.rounds.last()
    }

    /// Number of completed rounds retained.
    pub fn completed_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Number of aborted rounds since startup.
    pub fn aborted_rounds(&self) -> u64 {
        self.aborted_rounds
    }

    /// True when the loss history has flattened.
    pub fn has_converged(&self) -> bool {
        self.convergence.has_converged()
    }

    /// Current moving-average loss.
    pub fn moving_average_loss(&self) -> Option<f32> {
        self.convergence.moving_average()
    }
}

impl Default for TrainingDashboard {
    fn default() -> Self {
        Self::new(10, 0.01, 1000)
    }
}
