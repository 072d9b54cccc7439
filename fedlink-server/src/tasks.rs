//! Server task framework
//!
//! The server runs as a small set of actor-style async tasks communicating
//! over typed message channels:
//! - **App task**: CLI control surface, status reporting, process lifecycle
//! - **Coordinator task**: round state machine, registry, aggregation
//! - **Transport task**: client-facing UDP endpoint and address book
//!
//! Each task processes a `TaskMessage<T>` stream and exits on `Shutdown`.
//! The `TaskManager` tracks lifecycle state and coordinates graceful
//! shutdown with a bounded timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use fedlink_common::config::ServerConfig;
use fedlink_common::types::{ClientId, ClientMessage, RoundId, ServerMessage};
use fedlink_fl::{AggregationResult, FlError, GlobalModel, StatusSnapshot};

/// Message envelope wrapping task payloads with control signals.
#[derive(Debug)]
pub enum TaskMessage<T> {
    /// Regular message payload
    Message(T),
    /// Shutdown signal; the task terminates gracefully
    Shutdown,
}

impl<T> TaskMessage<T> {
    /// Wraps a payload.
    pub fn message(msg: T) -> Self {
        TaskMessage::Message(msg)
    }

    /// Creates a shutdown signal.
    pub fn shutdown() -> Self {
        TaskMessage::Shutdown
    }

    /// True if this is a shutdown signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TaskMessage::Shutdown)
    }

    /// Returns the payload, or `None` for shutdown.
    pub fn into_message(self) -> Option<T> {
        match self {
            TaskMessage::Message(msg) => Some(msg),
            TaskMessage::Shutdown => None,
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Instantiated, not yet running
    #[default]
    Created,
    /// Processing messages
    Running,
    /// Shutdown signalled, cleaning up
    Stopping,
    /// Terminated gracefully
    Stopped,
    /// Terminated with an error
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Created => write!(f, "Created"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Stopping => write!(f, "Stopping"),
            TaskState::Stopped => write!(f, "Stopped"),
            TaskState::Failed => write!(f, "Failed"),
        }
    }
}

/// Identifiers for the server's tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// Application task
    App,
    /// Round coordinator task
    Coordinator,
    /// Client transport task
    Transport,
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskId::App => write!(f, "App"),
            TaskId::Coordinator => write!(f, "Coordinator"),
            TaskId::Transport => write!(f, "Transport"),
        }
    }
}

/// Information about a running task.
#[derive(Debug)]
pub struct TaskInfo {
    /// Task identifier
    pub id: TaskId,
    /// Current state
    pub state: TaskState,
    /// When the task was started
    pub started_at: Option<Instant>,
    /// When the task stopped
    pub stopped_at: Option<Instant>,
    /// Error message if the task failed
    pub error: Option<String>,
}

/// Base trait for the server tasks.
///
/// Tasks are async actors that process messages from their receive channel
/// until they see `TaskMessage::Shutdown`.
#[async_trait::async_trait]
pub trait Task: Send + 'static {
    /// The message type this task processes.
    type Message: Send;

    /// Runs the task's main loop until shutdown.
    async fn run(&mut self, rx: mpsc::Receiver<TaskMessage<Self::Message>>);
}

// ============================================================================
// Message types
// ============================================================================

/// A summary row for the CLI client list.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientSummary {
    /// Client identifier
    pub id: ClientId,
    /// Liveness status
    pub status: String,
    /// Advisory sample count declared at registration
    pub declared_samples: u64,
}

/// Messages for the Coordinator task.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Decoded client message forwarded by the transport task
    FromClient(ClientMessage),
    /// Round deadline timer fired
    DeadlineExpired(RoundId),
    /// Open the next round (startup, post-publish, or abort backoff)
    OpenRound,
    /// A merge running off-task finished
    MergeCompleted {
        /// Round the merge belonged to
        round_id: RoundId,
        /// Merge outcome
        outcome: Result<AggregationResult, FlError>,
    },
    /// Retry a publication held back by a storage failure
    RetryPersist,
    /// Status query from the App task
    GetStatus {
        /// Reply channel
        reply: oneshot::Sender<StatusSnapshot>,
    },
    /// Client list query from the App task
    GetClients {
        /// Reply channel
        reply: oneshot::Sender<Vec<ClientSummary>>,
    },
    /// Latest model query from the App task
    GetModel {
        /// Reply channel
        reply: oneshot::Sender<GlobalModel>,
    },
    /// Manual round trigger from the CLI
    TriggerRound {
        /// Reply channel; `Err` carries the refusal reason
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Messages for the Transport task.
#[derive(Debug)]
pub enum TransportMessage {
    /// Send a server message to a single known client
    SendToClient {
        /// Destination client
        client_id: ClientId,
        /// Message to deliver
        message: ServerMessage,
    },
    /// Send the same server message to several known clients
    Broadcast {
        /// Destination clients
        targets: Vec<ClientId>,
        /// Message to deliver
        message: ServerMessage,
    },
    /// Reply to an address directly (pre-registration rejections)
    SendToAddr {
        /// Destination address
        addr: SocketAddr,
        /// Message to deliver
        message: ServerMessage,
    },
}

/// Messages for the App task.
#[derive(Debug)]
pub enum AppMessage {
    /// CLI command received on the control socket
    CliCommand {
        /// Command string
        command: String,
        /// Where to send the response
        response_addr: SocketAddr,
    },
    /// The coordinator exhausted its round budget
    TrainingComplete {
        /// Rounds successfully completed
        rounds_completed: u64,
    },
}

// ============================================================================
// Task handles and base
// ============================================================================

/// Handle for sending messages to a task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    tx: mpsc::Sender<TaskMessage<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> TaskHandle<T> {
    /// Creates a handle from a sender.
    pub fn new(tx: mpsc::Sender<TaskMessage<T>>) -> Self {
        Self { tx }
    }

    /// Sends a message to the task.
    pub async fn send(&self, msg: T) -> Result<(), mpsc::error::SendError<TaskMessage<T>>> {
        self.tx.send(TaskMessage::Message(msg)).await
    }

    /// Sends a shutdown signal to the task.
    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<TaskMessage<T>>> {
        self.tx.send(TaskMessage::Shutdown).await
    }

    /// Returns the raw sender, for timers that deliver into this task.
    pub fn sender(&self) -> mpsc::Sender<TaskMessage<T>> {
        self.tx.clone()
    }

    /// True if the task channel is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Shared handles for inter-task communication.
///
/// Every task receives a clone and can message any other task.
#[derive(Clone)]
pub struct ServerTaskBase {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Handle to the App task
    pub app_tx: TaskHandle<AppMessage>,
    /// Handle to the Coordinator task
    pub coordinator_tx: TaskHandle<CoordinatorMessage>,
    /// Handle to the Transport task
    pub transport_tx: TaskHandle<TransportMessage>,
}

impl ServerTaskBase {
    /// Creates the task base and per-task receivers.
    pub fn new(
        config: ServerConfig,
        channel_capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<TaskMessage<AppMessage>>,
        mpsc::Receiver<TaskMessage<CoordinatorMessage>>,
        mpsc::Receiver<TaskMessage<TransportMessage>>,
    ) {
        let (app_tx, app_rx) = mpsc::channel(channel_capacity);
        let (coordinator_tx, coordinator_rx) = mpsc::channel(channel_capacity);
        let (transport_tx, transport_rx) = mpsc::channel(channel_capacity);

        let base = Self {
            config: Arc::new(config),
            app_tx: TaskHandle::new(app_tx),
            coordinator_tx: TaskHandle::new(coordinator_tx),
            transport_tx: TaskHandle::new(transport_tx),
        };

        (base, app_rx, coordinator_rx, transport_rx)
    }

    /// Sends shutdown signals to all tasks. Errors are ignored; a closed
    /// channel means the task already exited.
    pub async fn shutdown_all(&self) {
        let _ = self.app_tx.shutdown().await;
        let _ = self.coordinator_tx.shutdown().await;
        let _ = self.transport_tx.shutdown().await;
    }
}

/// Default channel capacity for task message queues.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default shutdown timeout in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Task manager
// ============================================================================

/// Error type for task operations.
#[derive(Debug, Clone)]
pub struct TaskError {
    /// Task that failed
    pub task_id: TaskId,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task {} error: {}", self.task_id, self.message)
    }
}

impl std::error::Error for TaskError {}

/// Tracks lifecycle state for all server tasks and coordinates shutdown.
pub struct TaskManager {
    task_base: ServerTaskBase,
    task_states: HashMap<TaskId, TaskInfo>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    join_handles: HashMap<TaskId, JoinHandle<Result<(), TaskError>>>,
}

impl TaskManager {
    /// Creates a manager plus per-task receivers.
    pub fn new(
        config: ServerConfig,
        channel_capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<TaskMessage<AppMessage>>,
        mpsc::Receiver<TaskMessage<CoordinatorMessage>>,
        mpsc::Receiver<TaskMessage<TransportMessage>>,
    ) {
        let (task_base, app_rx, coordinator_rx, transport_rx) =
            ServerTaskBase::new(config, channel_capacity);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut task_states = HashMap::new();
        for task_id in [TaskId::App, TaskId::Coordinator, TaskId::Transport] {
            task_states.insert(
                task_id,
                TaskInfo {
                    id: task_id,
                    state: TaskState::Created,
                    started_at: None,
                    stopped_at: None,
                    error: None,
                },
            );
        }

        let manager = Self {
            task_base,
            task_states,
            shutdown_tx,
            shutdown_rx,
            join_handles: HashMap::new(),
        };

        (manager, app_rx, coordinator_rx, transport_rx)
    }

    /// Returns a clone of the task base.
    pub fn task_base(&self) -> ServerTaskBase {
        self.task_base.clone()
    }

    /// Returns a receiver for the shutdown signal.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Current state of a task.
    pub fn get_task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.task_states.get(&task_id).map(|info| info.state)
    }

    /// Information about a task.
    pub fn get_task_info(&self, task_id: TaskId) -> Option<&TaskInfo> {
        self.task_states.get(&task_id)
    }

    /// True if any task has failed.
    pub fn any_task_failed(&self) -> bool {
        self.task_states
            .values()
            .any(|info| info.state == TaskState::Failed)
    }

    /// Marks a task as started.
    pub fn mark_task_started(&mut self, task_id: TaskId) {
        if let Some(info) = self.task_states.get_mut(&task_id) {
            info.state = TaskState::Running;
            info.started_at = Some(Instant::now());
        }
    }

    /// Marks a task as stopped.
    pub fn mark_task_stopped(&mut self, task_id: TaskId) {
        if let Some(info) = self.task_states.get_mut(&task_id) {
            info.state = TaskState::Stopped;
            info.stopped_at = Some(Instant::now());
        }
    }

    /// Marks a task as failed with an error message.
    pub fn mark_task_failed(&mut self, task_id: TaskId, error: String) {
        if let Some(info) = self.task_states.get_mut(&task_id) {
            info.state = TaskState::Failed;
            info.stopped_at = Some(Instant::now());
            info.error = Some(error);
        }
    }

    /// Registers a join handle for a spawned task.
    pub fn register_task_handle(
        &mut self,
        task_id: TaskId,
        handle: JoinHandle<Result<(), TaskError>>,
    ) {
        self.join_handles.insert(task_id, handle);
    }

    /// Initiates graceful shutdown and waits for the tasks, with a bounded
    /// timeout per task.
    pub async fn shutdown(&mut self) -> Result<(), TaskError> {
        let _ = self.shutdown_tx.send(true);

        for info in self.task_states.values_mut() {
            if info.state == TaskState::Running {
                info.state = TaskState::Stopping;
            }
        }

        self.task_base.shutdown_all().await;

        let timeout = tokio::time::Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS);
        let deadline = tokio::time::Instant::now() + timeout;

        let handles: Vec<_> = self.join_handles.drain().collect();
        let mut results: Vec<(TaskId, Result<(), String>)> = Vec::new();

        for (task_id, handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let result = match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e.message),
                Ok(Err(_join_error)) => Err("Task panicked".to_string()),
                Err(_timeout) => Err("Shutdown timeout".to_string()),
            };
            results.push((task_id, result));
        }

        for (task_id, result) in results {
            match result {
                Ok(()) => self.mark_task_stopped(task_id),
                Err(msg) => self.mark_task_failed(task_id, msg),
            }
        }

        if self.any_task_failed() {
            let failed: Vec<_> = self
                .task_states
                .values()
                .filter(|info| info.state == TaskState::Failed)
                .map(|info| {
                    format!(
                        "{}: {}",
                        info.id,
                        info.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            return Err(TaskError {
                task_id: TaskId::App,
                message: format!("Tasks failed during shutdown: {}", failed.join(", ")),
            });
        }

        Ok(())
    }

    /// Summary of all task states.
    pub fn status_summary(&self) -> Vec<(TaskId, TaskState)> {
        self.task_states
            .iter()
            .map(|(id, info)| (*id, info.state))
            .collect()
    }
}
