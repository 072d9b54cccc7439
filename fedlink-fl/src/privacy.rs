//! Privacy-preserving transforms
//!
//! Two independent, composable transforms selected by configuration:
//!
//! - **Differential privacy**: every update is clipped to the configured L2
//!   bound before aggregation, and calibrated Gaussian noise is added to
//!   the merged result exactly once per round. The classic Gaussian
//!   mechanism is used: `sigma = clip_norm * sqrt(2 ln(1.25/delta)) /
//!   epsilon`, divided by the contributor count because the published
//!   quantity is a mean with sensitivity `clip_norm / n`.
//!
//! - **Secure aggregation**: clients blind their sample-weighted update
//!   with pairwise masks that sum to zero across the full participant set,
//!   so the coordinator only ever observes the sum of masked vectors,
//!   which equals the true weighted sum. Dropout policy: a round with
//!   fewer submissions than `min_survivors` aborts; no secret-sharing
//!   reconstruction is attempted.

use std::collections::BTreeMap;

use rand::Rng;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use fedlink_common::config::{DifferentialPrivacyConfig, SecureAggregationConfig};
use fedlink_common::types::ClientId;

use crate::{AggregationResult, FlError, ModelUpdate};

/// Noise injection and mask handling for a round.
#[derive(Debug, Clone)]
pub struct PrivacyEngine {
    dp: DifferentialPrivacyConfig,
    secagg: SecureAggregationConfig,
}

impl PrivacyEngine {
    /// Creates an engine for the configured transforms.
    pub fn new(dp: DifferentialPrivacyConfig, secagg: SecureAggregationConfig) -> Self {
        Self { dp, secagg }
    }

    /// True when differential privacy is active.
    pub fn dp_enabled(&self) -> bool {
        self.dp.enabled
    }

    /// True when secure aggregation is active.
    pub fn secure_aggregation_enabled(&self) -> bool {
        self.secagg.enabled
    }

    /// Clips a parameter vector to the configured L2 bound in place.
    ///
    /// No-op when differential privacy is disabled. Masked updates are not
    /// clipped: clipping a blinded vector would destroy mask cancellation,
    /// so configurations enabling both are refused at load time.
    pub fn clip_update(&self, parameters: &mut [f32]) {
        if !self.dp.enabled || self.secagg.enabled {
            return;
        }
        let norm = l2_norm(parameters);
        let bound = self.dp.clip_norm as f32;
        if norm > bound && norm > 0.0 {
            let scale = bound / norm;
            for p in parameters.iter_mut() {
                *p *= scale;
            }
            debug!("clipped update from L2 norm {:.4} to {:.4}", norm, bound);
        }
    }

    /// Noise standard deviation for a mean over `contributors` clipped
    /// contributions (Gaussian mechanism, Dwork & Roth Appendix A).
    pub fn noise_sigma(&self, contributors: usize) -> f64 {
        if !self.dp.enabled || contributors == 0 {
            return 0.0;
        }
        let sensitivity = self.dp.clip_norm / contributors as f64;
        sensitivity * (2.0 * (1.25 / self.dp.delta).ln()).sqrt() / self.dp.epsilon
    }

    /// Adds calibrated Gaussian noise to the merged result, exactly once
    /// per round. Intentionally nondeterministic across repeated runs.
    pub fn apply_noise<R: Rng + ?Sized>(
        &self,
        parameters: &mut [f32],
        contributors: usize,
        rng: &mut R,
    ) -> Result<(), FlError> {
        let sigma = self.noise_sigma(contributors);
        if sigma == 0.0 {
            return Ok(());
        }
        let normal = Normal::new(0.0, sigma)
            .map_err(|e| FlError::Aggregation(format!("noise calibration: {e}")))?;
        for p in parameters.iter_mut() {
            *p += normal.sample(rng) as f32;
        }
        debug!(
            "added Gaussian noise sigma={:.6} over {} contributors",
            sigma, contributors
        );
        Ok(())
    }

    /// Enforces the secure-aggregation dropout policy: fewer survivors
    /// than the configured bound aborts the round.
    pub fn check_survivors(&self, submitted: usize) -> Result<(), FlError> {
        if self.secagg.enabled && submitted < self.secagg.min_survivors {
            return Err(FlError::Quorum {
                have: submitted,
                need: self.secagg.min_survivors,
            });
        }
        Ok(())
    }

    /// Merges masked updates: the sum of blinded, sample-weighted vectors
    /// divided by the total effective weight.
    ///
    /// Clients weight with `max(1, sample_count)` before masking so that a
    /// zero-sample contribution still cancels correctly; the same
    /// effective weight is used here.
    pub fn masked_merge(
        &self,
        updates: &[ModelUpdate],
        dim: usize,
    ) -> Result<AggregationResult, FlError> {
        if updates.is_empty() {
            return Err(FlError::Aggregation("empty update buffer".into()));
        }
        for update in updates {
            if update.parameters.len() != dim {
                return Err(FlError::Aggregation(format!(
                    "masked update from {} has dimension {}, expected {}",
                    update.client_id,
                    update.parameters.len(),
                    dim
                )));
            }
        }

        let total_weight: u64 = updates.iter().map(|u| effective_weight(u.sample_count)).sum();
        let mut merged = vec![0.0f32; dim];
        for update in updates {
            for (slot, p) in merged.iter_mut().zip(update.parameters.iter()) {
                *slot += p;
            }
        }
        for slot in merged.iter_mut() {
            *slot /= total_weight as f32;
        }

        let low_confidence = updates.iter().all(|u| u.sample_count == 0);
        Ok(AggregationResult {
            parameters: merged,
            contributing_clients: updates.len(),
            total_weight,
            low_confidence,
            avg_loss: updates.iter().map(|u| u.loss).sum::<f32>() / updates.len() as f32,
            control_variates: None,
        })
    }
}

fn effective_weight(sample_count: u64) -> u64 {
    sample_count.max(1)
}

fn l2_norm(parameters: &[f32]) -> f32 {
    parameters.iter().map(|p| p * p).sum::<f32>().sqrt()
}

/// Client-side pairwise masking helper.
///
/// Each pair of participants shares a 32-byte seed agreed out of band (key
/// agreement is outside this engine's scope). Both peers expand the seed
/// with ChaCha20 into identical mask streams; the lexicographically
/// smaller client id adds the mask, the larger subtracts it, so masks over
/// the full participant set sum to exactly zero.
pub struct PairwiseMasker {
    own_id: ClientId,
    /// Peer id -> shared pair seed; BTreeMap for deterministic iteration
    pair_seeds: BTreeMap<ClientId, [u8; 32]>,
}

impl PairwiseMasker {
    /// Creates a masker for one participant.
    pub fn new(own_id: ClientId) -> Self {
        Self {
            own_id,
            pair_seeds: BTreeMap::new(),
        }
    }

    /// Registers a peer and the seed shared with it. Both peers must pass
    /// the same seed for their masks to cancel.
    pub fn add_peer(&mut self, peer: ClientId, seed: [u8; 32]) {
        if peer != self.own_id {
            self.pair_seeds.insert(peer, seed);
        }
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.pair_seeds.len()
    }

    /// Blinds a sample-weighted update: returns
    /// `parameters * max(1, sample_count) + sum of signed pairwise masks`.
    pub fn mask_update(&self, parameters: &[f32], sample_count: u64) -> Vec<f32> {
        let weight = effective_weight(sample_count) as f32;
        let mut masked: Vec<f32> = parameters.iter().map(|p| p * weight).collect();

        for (peer, seed) in &self.pair_seeds {
            let mut rng = ChaCha20Rng::from_seed(*seed);
            let add = self.own_id < *peer;
            for slot in masked.iter_mut() {
                let mask = mask_value(&mut rng);
                if add {
                    *slot += mask;
                } else {
                    *slot -= mask;
                }
            }
        }
        masked
    }
}

/// One mask coordinate in [-1, 1), identical for both peers of a pair.
fn mask_value(rng: &mut ChaCha20Rng) -> f32 {
    let raw = rng.next_u32();
    (raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
}
