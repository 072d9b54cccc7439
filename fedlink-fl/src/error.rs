//! Error taxonomy for the coordination engine
//!
//! Per-client errors (`IncompatibleCapability`, `Validation`, `Duplicate`,
//! `UnknownClient`) are isolated and never abort a round; round-level errors (`Quorum`, `Aggregation`)
//! abort only the current round; `Storage` is retried with backoff and is
//! the only class that may stall progress.

use thiserror::Error;

/// Errors produced by the federated-round engine.
#[derive(Debug, Error)]
pub enum FlError {
    /// Client schema/dimension mismatch at registration; client not added.
    #[error("incompatible capability: {0}")]
    IncompatibleCapability(String),

    /// Malformed or wrong-shape update; the update is dropped and the
    /// client retained for future rounds.
    #[error("invalid update: {0}")]
    Validation(String),

    /// Second update from the same client within one round; dropped.
    #[error("duplicate update: {0}")]
    Duplicate(String),

    /// Sender is not registered or not part of the open round.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// Insufficient clients by the round deadline; round aborted, no
    /// version change.
    #[error("quorum not reached: have {have}, need {need}")]
    Quorum {
        /// Clients that acknowledged or submitted
        have: usize,
        /// Required minimum
        need: usize,
    },

    /// Dimension mismatch or non-finite merge output; round aborted, no
    /// version change.
    #[error("aggregation failed: {0}")]
    Aggregation(String),

    /// Persistence failure on publish; the result is held in memory and
    /// retried, the version does not advance until durable.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Operation not valid in the coordinator's current state.
    #[error("invalid state: {0}")]
    State(String),
}

impl FlError {
    /// True for errors that abort the current round.
    pub fn aborts_round(&self) -> bool {
        matches!(self, FlError::Quorum { .. } | FlError::Aggregation(_))
    }
}
