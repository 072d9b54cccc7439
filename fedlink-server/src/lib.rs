//! fedlink-server - Federated learning coordination server
//!
//! This crate hosts the server runtime for fedlink. It wires the round
//! engine from `fedlink-fl` into an actor-based task model where each
//! component runs as an independent async task communicating via typed
//! message channels:
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                     server                        │
//! │  ┌─────────┐   ┌─────────────┐   ┌───────────┐   │
//! │  │   App   │   │ Coordinator │   │ Transport │   │
//! │  │  Task   │   │    Task     │   │   Task    │   │
//! │  └────┬────┘   └──────┬──────┘   └─────┬─────┘   │
//! │       └───────────────┴────────────────┘         │
//! └───────────┼──────────────────────────┼───────────┘
//!             ▼                          ▼
//!        operator CLI               clients (UDP)
//! ```
//!
//! - The **transport task** owns the client-facing UDP socket, decodes
//!   datagrams and routes them to the coordinator.
//! - The **coordinator task** drives the round state machine (quorum,
//!   collection, aggregation, publication) and offloads merges to
//!   blocking threads.
//! - The **app task** serves the operator control surface (`status`,
//!   `clients`, `model`, `trigger-round`).
//!
//! Tasks are managed by `TaskManager` which tracks state, propagates
//! shutdown and waits for the tasks with a bounded timeout.

pub mod app;
pub mod coordinator;
pub mod tasks;
pub mod transport;

pub use app::{
    load_and_validate_server_config, load_server_config, load_server_config_from_str,
    validate_server_config, AppTask, ConfigError, ConfigValidationError, CtlMessage,
    CtlMessageType, CtlServer, CtlServerError, CTL_BUFFER_SIZE, CTL_MAGIC, CTL_MIN_LENGTH,
    CTL_VERSION,
};

pub use coordinator::CoordinatorTask;

pub use transport::TransportTask;

pub use tasks::{
    AppMessage, ClientSummary, CoordinatorMessage, ServerTaskBase, Task, TaskError, TaskHandle,
    TaskId, TaskInfo, TaskManager, TaskMessage, TaskState, TransportMessage,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
