//! Coordinator task
//!
//! Hosts the round state machine from `fedlink-fl` and translates its
//! emitted events into effects: client notifications through the transport
//! task, cancellable deadline timers, off-task merge execution, and
//! persistence retries. All engine access is serialized through this
//! task's message loop; heavy merges run under `spawn_blocking` and feed
//! their outcome back as a `MergeCompleted` self-message so the loop never
//! stalls on a large parameter vector.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use fedlink_common::timer::DeadlineTimer;
use fedlink_common::types::{ClientId, ClientMessage, RejectReason, RoundId, ServerMessage};
use fedlink_fl::{CoordinatorEvent, FlError, ModelUpdate, RoundCoordinator};

use crate::tasks::{
    AppMessage, ClientSummary, CoordinatorMessage, ServerTaskBase, Task, TaskMessage,
    TransportMessage,
};

/// Liveness sweeps per configured liveness window.
const SWEEPS_PER_WINDOW: u32 = 2;

/// The task driving the round state machine.
pub struct CoordinatorTask {
    task_base: ServerTaskBase,
    engine: RoundCoordinator,
    /// Armed round deadline, cancelled when collection closes early
    deadline: Option<DeadlineTimer>,
    /// Pending reopen/retry timers; kept so shutdown drops cleanly
    reopen: Option<DeadlineTimer>,
    persist_retry: Option<DeadlineTimer>,
    /// Round a merge is in flight for, guards against stale outcomes
    merge_in_flight: Option<RoundId>,
    training_done: bool,
}

impl CoordinatorTask {
    /// Creates the task, recovering engine state from the checkpoint store.
    pub fn new(task_base: ServerTaskBase) -> Self {
        let engine = RoundCoordinator::new(&task_base.config);
        Self {
            task_base,
            engine,
            deadline: None,
            reopen: None,
            persist_retry: None,
            merge_in_flight: None,
            training_done: false,
        }
    }

    /// Maps an engine rejection to the wire-level reject reason.
    fn reject_reason(err: &FlError) -> RejectReason {
        match err {
            FlError::IncompatibleCapability(_) => RejectReason::IncompatibleCapability,
            FlError::Duplicate(_) => RejectReason::DuplicateUpdate,
            FlError::UnknownClient(_) => RejectReason::UnknownClient,
            FlError::State(_) => RejectReason::NoOpenRound,
            _ => RejectReason::InvalidUpdate,
        }
    }

    async fn send_to_client(&self, client_id: ClientId, message: ServerMessage) {
        if let Err(e) = self
            .task_base
            .transport_tx
            .send(TransportMessage::SendToClient { client_id, message })
            .await
        {
            error!("failed to queue client message: {}", e);
        }
    }

    /// Executes the effects the engine asked for.
    async fn handle_events(&mut self, events: Vec<CoordinatorEvent>) {
        for event in events {
            match event {
                CoordinatorEvent::Broadcast {
                    round_id,
                    model_version,
                    parameters,
                    proximal_mu,
                    deadline_secs,
                    targets,
                } => {
                    let message = ServerMessage::ModelBroadcast {
                        round_id,
                        model_version,
                        parameters,
                        proximal_mu,
                        deadline_secs,
                    };
                    if let Err(e) = self
                        .task_base
                        .transport_tx
                        .send(TransportMessage::Broadcast { targets, message })
                        .await
                    {
                        error!("failed to queue round broadcast: {}", e);
                    }
                }
                CoordinatorEvent::RoundAborted {
                    round_id,
                    reason,
                    targets,
                } => {
                    let message = ServerMessage::RoundAbort { round_id, reason };
                    if let Err(e) = self
                        .task_base
                        .transport_tx
                        .send(TransportMessage::Broadcast { targets, message })
                        .await
                    {
                        error!("failed to queue abort notification: {}", e);
                    }
                }
                CoordinatorEvent::ArmDeadline { round_id, deadline } => {
                    let tx = self.task_base.coordinator_tx.sender();
                    self.deadline = Some(DeadlineTimer::start(
                        deadline,
                        tx,
                        TaskMessage::Message(CoordinatorMessage::DeadlineExpired(round_id)),
                    ));
                }
                CoordinatorEvent::CancelDeadline { round_id } => {
                    if let Some(timer) = self.deadline.take() {
                        debug!("{}: deadline cancelled", round_id);
                        timer.cancel();
                    }
                }
                CoordinatorEvent::MergeReady(job) => {
                    let round_id = job.round_id();
                    self.merge_in_flight = Some(round_id);
                    let tx = self.task_base.coordinator_tx.sender();
                    tokio::spawn(async move {
                        let outcome = match tokio::task::spawn_blocking(move || job.run()).await {
                            Ok(result) => result,
                            Err(e) => Err(FlError::Aggregation(format!("merge task failed: {e}"))),
                        };
                        let _ = tx
                            .send(TaskMessage::Message(CoordinatorMessage::MergeCompleted {
                                round_id,
                                outcome,
                            }))
                            .await;
                    });
                }
                CoordinatorEvent::ModelPublished { round_id, version } => {
                    debug!("{}: model {} published", round_id, version);
                }
                CoordinatorEvent::RetryPublish { backoff } => {
                    let tx = self.task_base.coordinator_tx.sender();
                    self.persist_retry = Some(DeadlineTimer::start(
                        backoff,
                        tx,
                        TaskMessage::Message(CoordinatorMessage::RetryPersist),
                    ));
                }
                CoordinatorEvent::ScheduleReopen { backoff } => {
                    let tx = self.task_base.coordinator_tx.sender();
                    self.reopen = Some(DeadlineTimer::start(
                        backoff,
                        tx,
                        TaskMessage::Message(CoordinatorMessage::OpenRound),
                    ));
                }
                CoordinatorEvent::TrainingComplete { rounds_completed } => {
                    info!("training complete after {} rounds", rounds_completed);
                    self.training_done = true;
                    if let Err(e) = self
                        .task_base
                        .app_tx
                        .send(AppMessage::TrainingComplete { rounds_completed })
                        .await
                    {
                        debug!("app task gone during training completion: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_client_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Register {
                client_id,
                capabilities,
            } => match self.engine.register_client(client_id.clone(), capabilities) {
                Ok(model_version) => {
                    self.send_to_client(client_id, ServerMessage::RegisterAccepted { model_version })
                        .await;
                }
                Err(err) => {
                    warn!("registration of {} refused: {}", client_id, err);
                    let reason = Self::reject_reason(&err);
                    self.send_to_client(client_id, ServerMessage::RegisterRejected { reason })
                        .await;
                }
            },
            ClientMessage::Heartbeat { client_id } => {
                if !self.engine.heartbeat(&client_id) {
                    debug!("heartbeat from unknown client {}", client_id);
                }
            }
            ClientMessage::Ack { client_id, round_id } => {
                let events = self.engine.client_ack(&client_id, round_id);
                self.handle_events(events).await;
            }
            ClientMessage::Update {
                client_id,
                round_id,
                parameters,
                sample_count,
                control_variate,
                mask_tag,
                loss,
            } => {
                let update = ModelUpdate {
                    client_id: client_id.clone(),
                    round_id,
                    parameters,
                    sample_count,
                    control_variate,
                    mask_tag,
                    loss,
                };
                match self.engine.submit_update(update) {
                    Ok(events) => {
                        self.send_to_client(client_id, ServerMessage::UpdateAccepted { round_id })
                            .await;
                        self.handle_events(events).await;
                    }
                    Err(err) => {
                        warn!("update from {} rejected: {}", client_id, err);
                        let reason = Self::reject_reason(&err);
                        self.send_to_client(
                            client_id,
                            ServerMessage::UpdateRejected { round_id, reason },
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::FromClient(client_message) => {
                self.handle_client_message(client_message).await;
            }
            CoordinatorMessage::DeadlineExpired(round_id) => {
                let events = self.engine.on_deadline(round_id);
                self.handle_events(events).await;
            }
            CoordinatorMessage::OpenRound => {
                if self.training_done {
                    return;
                }
                match self.engine.open_round(Instant::now()) {
                    Ok(events) => self.handle_events(events).await,
                    Err(err) => debug!("round open skipped: {}", err),
                }
            }
            CoordinatorMessage::MergeCompleted { round_id, outcome } => {
                if self.merge_in_flight.take() != Some(round_id) {
                    warn!("dropping merge outcome for stale {}", round_id);
                    return;
                }
                let events = self.engine.complete_merge(outcome);
                self.handle_events(events).await;
            }
            CoordinatorMessage::RetryPersist => {
                let events = self.engine.retry_publish();
                self.handle_events(events).await;
            }
            CoordinatorMessage::GetStatus { reply } => {
                let _ = reply.send(self.engine.status());
            }
            CoordinatorMessage::GetClients { reply } => {
                let clients = self
                    .engine
                    .registry()
                    .iter()
                    .map(|record| ClientSummary {
                        id: record.id.clone(),
                        status: record.status.to_string(),
                        declared_samples: record.capabilities.declared_samples,
                    })
                    .collect();
                let _ = reply.send(clients);
            }
            CoordinatorMessage::GetModel { reply } => {
                let _ = reply.send(self.engine.global_model().clone());
            }
            CoordinatorMessage::TriggerRound { reply } => {
                if self.training_done {
                    let _ = reply.send(Err("training complete".to_string()));
                    return;
                }
                match self.engine.open_round(Instant::now()) {
                    Ok(events) => {
                        self.handle_events(events).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err.to_string()));
                    }
                }
            }
        }
    }

    fn sweep_period(&self) -> Duration {
        let window = self.task_base.config.registry.liveness_window();
        (window / SWEEPS_PER_WINDOW).max(Duration::from_secs(1))
    }

    fn cancel_timers(&mut self) {
        for timer in [
            self.deadline.take(),
            self.reopen.take(),
            self.persist_retry.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }
}

#[async_trait::async_trait]
impl Task for CoordinatorTask {
    type Message = CoordinatorMessage;

    async fn run(&mut self, mut rx: mpsc::Receiver<TaskMessage<Self::Message>>) {
        info!("coordinator task starting");

        // Kick off the first round once clients have had a chance to
        // register; reuses the abort-backoff path so an empty registry
        // simply retries.
        let tx = self.task_base.coordinator_tx.sender();
        self.reopen = Some(DeadlineTimer::start(
            self.task_base.config.round.retry_backoff(),
            tx,
            TaskMessage::Message(CoordinatorMessage::OpenRound),
        ));

        let mut sweep_timer = tokio::time::interval(self.sweep_period());
        sweep_timer.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(TaskMessage::Message(message)) => {
                            self.handle_message(message).await;
                        }
                        Some(TaskMessage::Shutdown) | None => {
                            info!("coordinator task shutting down");
                            break;
                        }
                    }
                }
                _ = sweep_timer.tick() => {
                    let events = self.engine.sweep(Instant::now());
                    self.handle_events(events).await;
                }
            }
        }

        self.cancel_timers();
    }
}
