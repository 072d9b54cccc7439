//! Round coordinator
//!
//! The state machine that sequences registration, collection, aggregation
//! and publication:
//!
//! ```text
//! Idle → WaitingForQuorum → Collecting → Aggregating → Publishing → Idle
//!              │                 │
//!              └────► Aborted ◄──┘   (quorum/aggregation failure)
//! ```
//!
//! Rounds are strictly sequential; there is no pipelining of the next
//! round's collection while the current one aggregates, which keeps the
//! global model version and control-variate state unambiguous.
//!
//! The coordinator is a plain service object. It performs no I/O and arms
//! no timers itself; every externally visible effect is emitted as a
//! [`CoordinatorEvent`] for the owning task to execute, and heavy merge
//! work is handed out as a [`MergeJob`] so the task can run it off the
//! message-handling path.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use fedlink_common::config::{AggregationMethod, RoundConfig, ServerConfig};
use fedlink_common::types::{ClientCapabilities, ClientId, ModelVersion, RoundId};

use crate::aggregation::{strategy_for, validate_result, MergeContext};
use crate::metrics::RoundMetrics;
use crate::registry::ClientRegistry;
use crate::store::ModelStore;
use crate::{
    AggregationResult, ControlVariateOutcome, FlError, GlobalModel, ModelUpdate, PrivacyEngine,
    TrainingDashboard,
};

/// State of the current round (or `Idle`/`Aborted` around it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoundState {
    /// No round open
    Idle,
    /// Broadcast sent, waiting for `min_clients` acknowledgements
    WaitingForQuorum,
    /// Accepting model updates
    Collecting,
    /// Merge in progress
    Aggregating,
    /// Result awaiting durable persistence
    Publishing,
    /// Terminal state of a failed round
    Aborted,
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundState::Idle => write!(f, "idle"),
            RoundState::WaitingForQuorum => write!(f, "waiting_for_quorum"),
            RoundState::Collecting => write!(f, "collecting"),
            RoundState::Aggregating => write!(f, "aggregating"),
            RoundState::Publishing => write!(f, "publishing"),
            RoundState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Effects the owning task must carry out.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// Announce a new round to the eligible clients.
    Broadcast {
        /// Round being opened
        round_id: RoundId,
        /// Version of the broadcast model
        model_version: ModelVersion,
        /// Global model parameters
        parameters: Vec<f32>,
        /// Proximal strength for the clients (FedProx only)
        proximal_mu: Option<f64>,
        /// Submission deadline in seconds
        deadline_secs: u64,
        /// Clients to notify
        targets: Vec<ClientId>,
    },
    /// Notify clients that the round was aborted.
    RoundAborted {
        /// Aborted round
        round_id: RoundId,
        /// Abort reason for logs and notifications
        reason: String,
        /// Clients to notify
        targets: Vec<ClientId>,
    },
    /// Arm the round deadline timer.
    ArmDeadline {
        /// Round the timer belongs to
        round_id: RoundId,
        /// Time until expiry
        deadline: Duration,
    },
    /// Cancel the round deadline timer (quorum reached or buffer full).
    CancelDeadline {
        /// Round whose timer is obsolete
        round_id: RoundId,
    },
    /// Run this merge off the message-handling path, then feed the outcome
    /// back through [`RoundCoordinator::complete_merge`].
    MergeReady(MergeJob),
    /// A new global model version was durably published.
    ModelPublished {
        /// Completed round
        round_id: RoundId,
        /// New version
        version: ModelVersion,
    },
    /// Persistence failed; retry [`RoundCoordinator::retry_publish`] after
    /// the backoff.
    RetryPublish {
        /// Time to wait before retrying
        backoff: Duration,
    },
    /// Open the next round after the given backoff (zero means now).
    ScheduleReopen {
        /// Time to wait before reopening
        backoff: Duration,
    },
    /// The configured round budget is exhausted; normal termination.
    TrainingComplete {
        /// Rounds successfully completed
        rounds_completed: u64,
    },
}

/// Read-only snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Current coordinator state
    pub state: RoundState,
    /// Open round id, if any
    pub round_id: Option<RoundId>,
    /// Latest published model version
    pub model_version: ModelVersion,
    /// Registered (non-evicted) clients
    pub registered_clients: usize,
    /// Updates buffered for the open round
    pub buffered_updates: usize,
    /// Successfully completed rounds
    pub rounds_completed: u64,
    /// Configured round budget
    pub rounds_budget: u64,
    /// Aborted rounds since startup
    pub aborted_rounds: u64,
    /// Selected aggregation strategy
    pub aggregation_method: AggregationMethod,
    /// Moving-average loss, if any round completed
    pub avg_loss: Option<f32>,
    /// Whether the loss history has flattened
    pub converged: bool,
}

/// Bookkeeping for the round currently in flight.
struct OpenRound {
    id: RoundId,
    state: RoundState,
    /// Pending set: eligible clients at open time, shrunk by eviction
    eligible: Vec<ClientId>,
    acks: HashSet<ClientId>,
    submitted: HashSet<ClientId>,
    buffer: Vec<ModelUpdate>,
    opened_at: Instant,
}

/// A merge extracted from the coordinator, safe to run on a blocking
/// thread while the coordinator keeps serving registry traffic.
#[derive(Debug)]
pub struct MergeJob {
    round_id: RoundId,
    method: AggregationMethod,
    mu: f64,
    privacy: PrivacyEngine,
    updates: Vec<ModelUpdate>,
    global: GlobalModel,
    global_cv: Option<Vec<f32>>,
    client_cvs: HashMap<ClientId, Vec<f32>>,
}

impl MergeJob {
    /// Round this job belongs to.
    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Number of buffered updates the job will merge.
    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    /// Runs the merge with ambient randomness for the noise draw.
    pub fn run(self) -> Result<AggregationResult, FlError> {
        let mut rng = rand::thread_rng();
        self.run_with_rng(&mut rng)
    }

    /// Runs the merge with a caller-supplied RNG (deterministic tests).
    pub fn run_with_rng<R: Rng + ?Sized>(
        mut self,
        rng: &mut R,
    ) -> Result<AggregationResult, FlError> {
        let dim = self.global.dimension();

        for update in &mut self.updates {
            self.privacy.clip_update(&mut update.parameters);
        }

        let mut result = if self.privacy.secure_aggregation_enabled() {
            self.privacy.masked_merge(&self.updates, dim)?
        } else {
            let strategy = strategy_for(self.method, self.mu);
            let ctx = MergeContext {
                global: &self.global,
                global_cv: self.global_cv.as_deref(),
                client_cvs: &self.client_cvs,
            };
            strategy.merge(&self.updates, &ctx)?
        };

        self.privacy
            .apply_noise(&mut result.parameters, result.contributing_clients, rng)?;
        validate_result(&result.parameters, dim)?;
        Ok(result)
    }
}

/// A publication held in memory until the store accepts it.
struct PendingPublish {
    model: GlobalModel,
    round_id: RoundId,
    outcome: Option<ControlVariateOutcome>,
    metrics: RoundMetrics,
}

/// The federated-round state machine.
pub struct RoundCoordinator {
    round_config: RoundConfig,
    registry: ClientRegistry,
    store: ModelStore,
    dashboard: TrainingDashboard,
    privacy: PrivacyEngine,
    round: Option<OpenRound>,
    next_round_id: RoundId,
    rounds_completed: u64,
    global_cv: Option<Vec<f32>>,
    pending: Option<PendingPublish>,
    persist_backoff: Duration,
}

impl RoundCoordinator {
    /// Builds a coordinator from the server configuration, recovering the
    /// latest published model from the checkpoint store.
    pub fn new(config: &ServerConfig) -> Self {
        let store = ModelStore::recover(config.store.clone(), config.model_dimension);
        let registry = ClientRegistry::new(
            config.registry.clone(),
            config.model_dimension,
            config.schema_version,
        );
        let privacy = PrivacyEngine::new(
            config.round.differential_privacy,
            config.round.secure_aggregation,
        );
        info!(
            "coordinator starting at model {} ({} strategy, {} round budget)",
            store.latest_version(),
            config.round.aggregation_method,
            config.round.rounds
        );
        Self {
            round_config: config.round.clone(),
            registry,
            store,
            dashboard: TrainingDashboard::default(),
            privacy,
            round: None,
            next_round_id: RoundId::new(1),
            rounds_completed: 0,
            global_cv: None,
            pending: None,
            persist_backoff: Duration::from_secs(config.store.persist_retry_secs),
        }
    }

    // ------------------------------------------------------------------
    // Registry passthrough
    // ------------------------------------------------------------------

    /// Registers a client; returns the current model version on success.
    pub fn register_client(
        &mut self,
        id: ClientId,
        capabilities: ClientCapabilities,
    ) -> Result<ModelVersion, FlError> {
        self.registry.register(id, capabilities)?;
        Ok(self.store.latest_version())
    }

    /// Refreshes a client's liveness.
    pub fn heartbeat(&mut self, id: &ClientId) -> bool {
        self.registry.heartbeat(id)
    }

    /// Ages liveness state and prunes evicted clients from the open
    /// round's pending set. Eviction never aborts the round, but it can
    /// complete collection when every remaining eligible client has
    /// already submitted.
    pub fn sweep(&mut self, now: Instant) -> Vec<CoordinatorEvent> {
        let evicted = self.registry.sweep(now);
        if evicted.is_empty() {
            return Vec::new();
        }
        if let Some(round) = self.round.as_mut() {
            round.eligible.retain(|id| !evicted.contains(id));
            for id in &evicted {
                round.acks.remove(id);
            }
            debug!(
                "{}: pending set shrunk to {} after eviction",
                round.id,
                round.eligible.len()
            );
        }
        self.check_collection_complete()
    }

    // ------------------------------------------------------------------
    // Round lifecycle
    // ------------------------------------------------------------------

    /// Opens a new round.
    ///
    /// Fails with [`FlError::State`] while a round is already in flight
    /// (surfaced to manual triggers); emits `TrainingComplete` once the
    /// round budget is exhausted.
    pub fn open_round(&mut self, now: Instant) -> Result<Vec<CoordinatorEvent>, FlError> {
        if self.round.is_some() {
            return Err(FlError::State(format!(
                "round {} still in flight",
                self.current_round_id().unwrap_or_default()
            )));
        }
        if self.rounds_completed >= self.round_config.rounds {
            info!(
                "round budget of {} exhausted, training complete",
                self.round_config.rounds
            );
            return Ok(vec![CoordinatorEvent::TrainingComplete {
                rounds_completed: self.rounds_completed,
            }]);
        }

        let eligible = self.registry.list_eligible(now);
        let round_id = self.next_round_id;
        self.next_round_id = round_id.next();

        let state = if eligible.len() >= self.round_config.min_clients {
            RoundState::Collecting
        } else {
            RoundState::WaitingForQuorum
        };
        info!(
            "{} opened in state {} with {} eligible clients",
            round_id,
            state,
            eligible.len()
        );

        let model = self.store.latest();
        let proximal_mu = match self.round_config.aggregation_method {
            AggregationMethod::FedProx => Some(self.round_config.fedprox.mu),
            _ => None,
        };
        let events = vec![
            CoordinatorEvent::Broadcast {
                round_id,
                model_version: model.version,
                parameters: model.parameters.clone(),
                proximal_mu,
                deadline_secs: self.round_config.round_deadline_secs,
                targets: eligible.clone(),
            },
            CoordinatorEvent::ArmDeadline {
                round_id,
                deadline: self.round_config.round_deadline(),
            },
        ];

        self.round = Some(OpenRound {
            id: round_id,
            state,
            eligible,
            acks: HashSet::new(),
            submitted: HashSet::new(),
            buffer: Vec::new(),
            opened_at: now,
        });
        Ok(events)
    }

    /// Records a participation acknowledgement.
    pub fn client_ack(&mut self, id: &ClientId, round_id: RoundId) -> Vec<CoordinatorEvent> {
        let min_clients = self.round_config.min_clients;
        let Some(round) = self.round.as_mut() else {
            return Vec::new();
        };
        if round.id != round_id || !round.eligible.contains(id) {
            return Vec::new();
        }
        round.acks.insert(id.clone());
        if round.state == RoundState::WaitingForQuorum && round.acks.len() >= min_clients {
            info!("{}: quorum of {} reached, collecting", round.id, min_clients);
            round.state = RoundState::Collecting;
        }
        Vec::new()
    }

    /// Accepts a client's model update into the round buffer.
    ///
    /// Per-client failures are isolated: the error names the reject reason
    /// for the caller to report, the round continues, and the client stays
    /// eligible for future rounds. Completion of the collection phase may
    /// emit a [`CoordinatorEvent::MergeReady`].
    pub fn submit_update(
        &mut self,
        update: ModelUpdate,
    ) -> Result<Vec<CoordinatorEvent>, FlError> {
        if !self.registry.is_known(&update.client_id) {
            return Err(FlError::UnknownClient(format!(
                "update from unregistered client {}",
                update.client_id
            )));
        }
        let dimension = self.store.latest().dimension();
        let scaffold = self.round_config.aggregation_method == AggregationMethod::Scaffold;
        let max_clients = self.round_config.max_clients;

        let Some(round) = self.round.as_mut() else {
            return Err(FlError::State("no open round".into()));
        };
        if update.round_id != round.id {
            return Err(FlError::Validation(format!(
                "update targets {}, open round is {}",
                update.round_id, round.id
            )));
        }
        if !round.eligible.contains(&update.client_id) {
            return Err(FlError::UnknownClient(format!(
                "client {} is not in the pending set of {}",
                update.client_id, round.id
            )));
        }

        // An update is an implicit participation ack; tolerate updates
        // arriving before the explicit ack, including during quorum wait.
        round.acks.insert(update.client_id.clone());
        if round.state == RoundState::WaitingForQuorum
            && round.acks.len() >= self.round_config.min_clients
        {
            round.state = RoundState::Collecting;
        }
        if round.state != RoundState::Collecting {
            return Err(FlError::State(format!(
                "{} is {}, not collecting",
                round.id, round.state
            )));
        }

        if round.submitted.contains(&update.client_id) {
            return Err(FlError::Duplicate(format!(
                "second update from {} in {}",
                update.client_id, round.id
            )));
        }
        if update.parameters.len() != dimension {
            return Err(FlError::Validation(format!(
                "update from {} has dimension {}, expected {}",
                update.client_id,
                update.parameters.len(),
                dimension
            )));
        }
        if scaffold {
            match &update.control_variate {
                Some(cv) if cv.len() == dimension => {}
                Some(cv) => {
                    return Err(FlError::Validation(format!(
                        "control variate from {} has dimension {}, expected {}",
                        update.client_id,
                        cv.len(),
                        dimension
                    )))
                }
                None => {
                    return Err(FlError::Validation(format!(
                        "scaffold round {} requires a control variate",
                        round.id
                    )))
                }
            }
        }
        if self.privacy.secure_aggregation_enabled() && update.mask_tag.is_none() {
            warn!(
                "{}: update from {} carries no mask tag",
                round.id, update.client_id
            );
        }

        debug!(
            "{}: buffered update from {} ({} samples)",
            round.id, update.client_id, update.sample_count
        );
        round.submitted.insert(update.client_id.clone());
        round.buffer.push(update);

        if round.buffer.len() >= max_clients {
            info!("{}: buffer reached max_clients, closing collection", round.id);
        }
        Ok(self.check_collection_complete())
    }

    /// Handles a round deadline expiry. Stale timers (for already-closed
    /// rounds) are ignored.
    pub fn on_deadline(&mut self, round_id: RoundId) -> Vec<CoordinatorEvent> {
        let Some(round) = self.round.as_ref() else {
            debug!("deadline for closed {} ignored", round_id);
            return Vec::new();
        };
        if round.id != round_id {
            debug!("stale deadline for {} ignored", round_id);
            return Vec::new();
        }
        match round.state {
            RoundState::WaitingForQuorum => {
                let have = round.acks.len();
                self.abort_round(FlError::Quorum {
                    have,
                    need: self.round_config.min_clients,
                })
            }
            RoundState::Collecting => {
                if round.buffer.len() >= self.round_config.min_clients {
                    self.begin_merge()
                } else {
                    let have = round.buffer.len();
                    self.abort_round(FlError::Quorum {
                        have,
                        need: self.round_config.min_clients,
                    })
                }
            }
            // Aggregation/publication run to completion regardless.
            _ => Vec::new(),
        }
    }

    /// Feeds the outcome of a [`MergeJob`] back into the state machine.
    pub fn complete_merge(
        &mut self,
        outcome: Result<AggregationResult, FlError>,
    ) -> Vec<CoordinatorEvent> {
        let Some(round) = self.round.as_mut() else {
            warn!("merge outcome for a closed round dropped");
            return Vec::new();
        };
        if round.state != RoundState::Aggregating {
            warn!("merge outcome in state {} dropped", round.state);
            return Vec::new();
        }
        let result = match outcome {
            Ok(result) => result,
            Err(err) => return self.abort_round(err),
        };

        round.state = RoundState::Publishing;
        let version = self.store.latest_version().next();
        let model = GlobalModel {
            version,
            parameters: result.parameters.clone(),
            loss: result.avg_loss,
            accuracy: None,
            created_at_ms: crate::timestamp_now_ms(),
        };
        let metrics = RoundMetrics {
            round_id: round.id,
            version,
            contributing_clients: result.contributing_clients,
            total_weight: result.total_weight,
            avg_loss: result.avg_loss,
            low_confidence: result.low_confidence,
            duration_ms: round.opened_at.elapsed().as_millis() as u64,
        };
        if result.low_confidence {
            warn!("{}: zero total sample weight, result flagged low-confidence", round.id);
        }
        self.pending = Some(PendingPublish {
            model,
            round_id: round.id,
            outcome: result.control_variates,
            metrics,
        });
        self.try_publish()
    }

    /// Retries a publication held back by a storage failure.
    pub fn retry_publish(&mut self) -> Vec<CoordinatorEvent> {
        if self.pending.is_none() {
            return Vec::new();
        }
        self.try_publish()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current coordinator state.
    pub fn state(&self) -> RoundState {
        self.round
            .as_ref()
            .map_or(RoundState::Idle, |round| round.state)
    }

    /// Id of the open round, if any.
    pub fn current_round_id(&self) -> Option<RoundId> {
        self.round.as_ref().map(|round| round.id)
    }

    /// Latest published model.
    pub fn global_model(&self) -> &GlobalModel {
        self.store.latest()
    }

    /// Successfully completed rounds.
    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    /// Registry accessor for the control surface.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Snapshot for status queries, served synchronously from state.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            round_id: self.current_round_id(),
            model_version: self.store.latest_version(),
            registered_clients: self.registry.len(),
            buffered_updates: self.round.as_ref().map_or(0, |r| r.buffer.len()),
            rounds_completed: self.rounds_completed,
            rounds_budget: self.round_config.rounds,
            aborted_rounds: self.dashboard.aborted_rounds(),
            aggregation_method: self.round_config.aggregation_method,
            avg_loss: self.dashboard.moving_average_loss(),
            converged: self.dashboard.has_converged(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Ends collection when every pending client submitted or the buffer
    /// hit `max_clients`, provided quorum is met.
    fn check_collection_complete(&mut self) -> Vec<CoordinatorEvent> {
        let Some(round) = self.round.as_ref() else {
            return Vec::new();
        };
        if round.state != RoundState::Collecting {
            return Vec::new();
        }
        let all_submitted = !round.eligible.is_empty()
            && round.eligible.iter().all(|id| round.submitted.contains(id));
        let buffer_full = round.buffer.len() >= self.round_config.max_clients;
        if (all_submitted || buffer_full) && round.buffer.len() >= self.round_config.min_clients {
            let mut events = vec![CoordinatorEvent::CancelDeadline { round_id: round.id }];
            events.extend(self.begin_merge());
            return events;
        }
        Vec::new()
    }

    /// Transitions into `Aggregating` and hands out the merge job.
    fn begin_merge(&mut self) -> Vec<CoordinatorEvent> {
        let survivors = self
            .round
            .as_ref()
            .map_or(0, |round| round.buffer.len());
        if let Err(err) = self.privacy.check_survivors(survivors) {
            return self.abort_round(err);
        }

        let global = self.store.latest().clone();
        let scaffold = self.round_config.aggregation_method == AggregationMethod::Scaffold;
        let Some(round) = self.round.as_mut() else {
            return Vec::new();
        };
        round.state = RoundState::Aggregating;
        let updates = std::mem::take(&mut round.buffer);
        info!(
            "{}: aggregating {} updates with {}",
            round.id,
            updates.len(),
            self.round_config.aggregation_method
        );

        let client_cvs = if scaffold {
            updates
                .iter()
                .filter_map(|u| {
                    self.registry
                        .control_variate(&u.client_id)
                        .map(|cv| (u.client_id.clone(), cv.clone()))
                })
                .collect()
        } else {
            HashMap::new()
        };

        vec![CoordinatorEvent::MergeReady(MergeJob {
            round_id: round.id,
            method: self.round_config.aggregation_method,
            mu: self.round_config.fedprox.mu,
            privacy: self.privacy.clone(),
            updates,
            global,
            global_cv: self.global_cv.clone(),
            client_cvs,
        })]
    }

    /// Aborts the current round; the last published model stays
    /// authoritative and a fresh round is retried after a backoff.
    fn abort_round(&mut self, err: FlError) -> Vec<CoordinatorEvent> {
        let Some(mut round) = self.round.take() else {
            return Vec::new();
        };
        round.state = RoundState::Aborted;
        warn!("{} aborted: {}", round.id, err);
        self.dashboard.record_abort();
        vec![
            CoordinatorEvent::CancelDeadline { round_id: round.id },
            CoordinatorEvent::RoundAborted {
                round_id: round.id,
                reason: err.to_string(),
                targets: round.eligible,
            },
            CoordinatorEvent::ScheduleReopen {
                backoff: self.round_config.retry_backoff(),
            },
        ]
    }

    /// Attempts the durable publish of a pending result.
    fn try_publish(&mut self) -> Vec<CoordinatorEvent> {
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        match self.store.publish(pending.model.clone(), pending.round_id) {
            Ok(()) => {
                // Durable: commit the round.
                if let Some(outcome) = pending.outcome {
                    for (id, cv) in outcome.per_client {
                        self.registry.set_control_variate(&id, cv);
                    }
                    self.global_cv = Some(outcome.global);
                }
                let version = pending.model.version;
                let round_id = pending.round_id;
                self.dashboard.record_round(pending.metrics);
                self.rounds_completed += 1;
                self.round = None;
                info!("{}: published model {}", round_id, version);

                let next = if self.rounds_completed >= self.round_config.rounds {
                    CoordinatorEvent::TrainingComplete {
                        rounds_completed: self.rounds_completed,
                    }
                } else {
                    CoordinatorEvent::ScheduleReopen {
                        backoff: Duration::ZERO,
                    }
                };
                vec![
                    CoordinatorEvent::ModelPublished { round_id, version },
                    next,
                ]
            }
            Err(err) => {
                // Held in memory; the version does not advance until the
                // write succeeds. Surfaced to the control surface as a
                // stuck round via the Publishing state.
                warn!(
                    "{}: persistence failed ({}), retrying in {:?}",
                    pending.round_id, err, self.persist_backoff
                );
                self.pending = Some(pending);
                vec![CoordinatorEvent::RetryPublish {
                    backoff: self.persist_backoff,
                }]
            }
        }
    }
}
