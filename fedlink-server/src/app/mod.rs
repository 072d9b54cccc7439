//! Application task module
//!
//! Configuration loading and validation plus the operator control surface:
//! a UDP command server for `status`, `clients`, `model` and
//! `trigger-round`, answered with JSON rendered from coordinator state.

mod cli_server;
mod config_loader;
mod task;

pub use cli_server::{
    CtlMessage, CtlMessageType, CtlServer, CtlServerError, CTL_BUFFER_SIZE, CTL_MAGIC,
    CTL_MIN_LENGTH, CTL_VERSION,
};

pub use config_loader::{
    load_and_validate_server_config, load_server_config, load_server_config_from_str,
    validate_server_config, ConfigError, ConfigValidationError,
};

pub use task::AppTask;
