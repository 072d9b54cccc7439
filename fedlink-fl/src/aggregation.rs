//! Pluggable aggregation strategies
//!
//! A strategy merges a round's update buffer into new global parameters.
//! The variant is selected once at round-open time and fixed for that
//! round. All strategies must produce a result whose dimensionality exactly
//! matches the current global model; violations surface as
//! [`FlError::Aggregation`] and abort the round without publishing.

use std::collections::HashMap;

use tracing::warn;

use fedlink_common::config::AggregationMethod;
use fedlink_common::types::ClientId;

use crate::{AggregationResult, ControlVariateOutcome, FlError, GlobalModel, ModelUpdate};

/// Read-only state a merge may consult.
pub struct MergeContext<'a> {
    /// The current global model
    pub global: &'a GlobalModel,
    /// Running global control variate (SCAFFOLD)
    pub global_cv: Option<&'a [f32]>,
    /// Per-client control variates (SCAFFOLD), keyed by client id
    pub client_cvs: &'a HashMap<ClientId, Vec<f32>>,
}

/// Capability: merge a round's buffer into an [`AggregationResult`].
pub trait Aggregator: Send + Sync {
    /// Strategy name for logs and status output.
    fn name(&self) -> &'static str;

    /// Merges the buffered updates against the current global model.
    fn merge(
        &self,
        updates: &[ModelUpdate],
        ctx: &MergeContext<'_>,
    ) -> Result<AggregationResult, FlError>;
}

/// Builds the strategy for a configured method.
pub fn strategy_for(method: AggregationMethod, mu: f64) -> Box<dyn Aggregator> {
    match method {
        AggregationMethod::FedAvg => Box::new(FedAvg),
        AggregationMethod::FedProx => Box::new(FedProx { mu }),
        AggregationMethod::Scaffold => Box::new(Scaffold),
    }
}

/// Validates a merged vector: exact dimension match and finite values.
pub fn validate_result(parameters: &[f32], expected_dim: usize) -> Result<(), FlError> {
    if parameters.len() != expected_dim {
        return Err(FlError::Aggregation(format!(
            "merged vector has dimension {}, expected {}",
            parameters.len(),
            expected_dim
        )));
    }
    if let Some(idx) = parameters.iter().position(|p| !p.is_finite()) {
        return Err(FlError::Aggregation(format!(
            "non-finite value at parameter index {idx}"
        )));
    }
    Ok(())
}

fn check_buffer(updates: &[ModelUpdate], dim: usize) -> Result<(), FlError> {
    if updates.is_empty() {
        return Err(FlError::Aggregation("empty update buffer".into()));
    }
    for update in updates {
        if update.parameters.len() != dim {
            return Err(FlError::Aggregation(format!(
                "update from {} has dimension {}, expected {}",
                update.client_id,
                update.parameters.len(),
                dim
            )));
        }
    }
    Ok(())
}

fn avg_loss(updates: &[ModelUpdate]) -> f32 {
    updates.iter().map(|u| u.loss).sum::<f32>() / updates.len() as f32
}

/// Sample-weighted mean of per-update vectors selected by `select`.
///
/// Falls back to the unweighted arithmetic mean when every update reports
/// zero samples; the second return value flags that degradation.
fn weighted_mean<F>(updates: &[ModelUpdate], dim: usize, select: F) -> (Vec<f32>, bool)
where
    F: Fn(&ModelUpdate, usize) -> f32,
{
    let total_samples: u64 = updates.iter().map(|u| u.sample_count).sum();
    let mut merged = vec![0.0f32; dim];

    if total_samples == 0 {
        warn!("all updates report zero samples, falling back to unweighted mean");
        let n = updates.len() as f32;
        for update in updates {
            for (i, slot) in merged.iter_mut().enumerate() {
                *slot += select(update, i) / n;
            }
        }
        return (merged, true);
    }

    for update in updates {
        let weight = update.sample_count as f32 / total_samples as f32;
        for (i, slot) in merged.iter_mut().enumerate() {
            *slot += weight * select(update, i);
        }
    }
    (merged, false)
}

/// Sample-count-weighted averaging (McMahan et al., 2017).
pub struct FedAvg;

impl Aggregator for FedAvg {
    fn name(&self) -> &'static str {
        "fedavg"
    }

    fn merge(
        &self,
        updates: &[ModelUpdate],
        ctx: &MergeContext<'_>,
    ) -> Result<AggregationResult, FlError> {
        let dim = ctx.global.dimension();
        check_buffer(updates, dim)?;

        let (parameters, low_confidence) =
            weighted_mean(updates, dim, |u, i| u.parameters[i]);

        Ok(AggregationResult {
            parameters,
            contributing_clients: updates.len(),
            total_weight: updates.iter().map(|u| u.sample_count).sum(),
            low_confidence,
            avg_loss: avg_loss(updates),
            control_variates: None,
        })
    }
}

/// Proximal-aware aggregation (Li et al., 2020).
///
/// The merge arithmetic is identical to FedAvg; `mu` regularizes the
/// clients' local objectives and is communicated at round open, it has no
/// effect here.
pub struct FedProx {
    /// Proximal strength broadcast to clients
    pub mu: f64,
}

impl Aggregator for FedProx {
    fn name(&self) -> &'static str {
        "fedprox"
    }

    fn merge(
        &self,
        updates: &[ModelUpdate],
        ctx: &MergeContext<'_>,
    ) -> Result<AggregationResult, FlError> {
        FedAvg.merge(updates, ctx)
    }
}

/// Control-variate corrected aggregation (Karimireddy et al., 2020).
///
/// New global parameters are the weighted mean of
/// `(update.parameters - client_cv)` plus the running global control
/// variate; the global control variate then moves by the weighted mean of
/// the per-client control-variate deltas reported this round. Clients
/// absent from the round keep their last known control variate.
pub struct Scaffold;

impl Aggregator for Scaffold {
    fn name(&self) -> &'static str {
        "scaffold"
    }

    fn merge(
        &self,
        updates: &[ModelUpdate],
        ctx: &MergeContext<'_>,
    ) -> Result<AggregationResult, FlError> {
        let dim = ctx.global.dimension();
        check_buffer(updates, dim)?;

        for update in updates {
            if let Some(cv) = &update.control_variate {
                if cv.len() != dim {
                    return Err(FlError::Aggregation(format!(
                        "control variate from {} has dimension {}, expected {}",
                        update.client_id,
                        cv.len(),
                        dim
                    )));
                }
            }
        }

        let zeros = vec![0.0f32; dim];
        let global_cv = ctx.global_cv.unwrap_or(&zeros);

        // Weighted mean of drift-corrected parameters.
        let stored_cv = |u: &ModelUpdate| -> &[f32] {
            ctx.client_cvs
                .get(&u.client_id)
                .map(|v| v.as_slice())
                .unwrap_or(&zeros)
        };
        let (mut parameters, low_confidence) =
            weighted_mean(updates, dim, |u, i| u.parameters[i] - stored_cv(u)[i]);
        for (slot, cv) in parameters.iter_mut().zip(global_cv.iter()) {
            *slot += cv;
        }

        // Weighted mean of the reported control-variate deltas; a missing
        // delta contributes zero.
        let (delta_mean, _) = weighted_mean(updates, dim, |u, i| {
            u.control_variate.as_ref().map_or(0.0, |cv| cv[i])
        });
        let new_global_cv: Vec<f32> = global_cv
            .iter()
            .zip(delta_mean.iter())
            .map(|(c, d)| c + d)
            .collect();

        let per_client = updates
            .iter()
            .map(|u| {
                let current = stored_cv(u);
                let next: Vec<f32> = match &u.control_variate {
                    Some(delta) => current.iter().zip(delta.iter()).map(|(c, d)| c + d).collect(),
                    None => current.to_vec(),
                };
                (u.client_id.clone(), next)
            })
            .collect();

        Ok(AggregationResult {
            parameters,
            contributing_clients: updates.len(),
            total_weight: updates.iter().map(|u| u.sample_count).sum(),
            low_confidence,
            avg_loss: avg_loss(updates),
            control_variates: Some(ControlVariateOutcome {
                global: new_global_cv,
                per_client,
            }),
        })
    }
}
