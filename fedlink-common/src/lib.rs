//! Common types and utilities for fedlink
//!
//! This crate provides the shared types, configuration structures, wire
//! messages and utilities used across the fedlink crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::{
    AggregationMethod, DifferentialPrivacyConfig, FedProxConfig, RegistryConfig, RoundConfig,
    SecureAggregationConfig, ServerConfig, StoreConfig,
};
pub use error::Error;
pub use logging::{init_logging, init_logging_with_filter, LogLevel};
pub use timer::DeadlineTimer;
pub use transport::UdpTransport;
pub use types::{
    ClientCapabilities, ClientId, ClientMessage, ModelVersion, RejectReason, RoundId,
    ServerMessage,
};
