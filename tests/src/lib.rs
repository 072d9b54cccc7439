//! Integration test framework for fedlink
//!
//! This crate provides test utilities and mock components for integration
//! testing of the fedlink coordination server.
//!
//! # Components
//!
//! - [`mock_client`] - Mock training client speaking the UDP protocol
//! - [`test_fixtures`] - Server configuration and spawn helpers
//! - [`test_utils`] - Logging setup, timeouts and condition polling
//!
//! # Test Categories
//!
//! 1. **Round Lifecycle Tests** - Full rounds, quorum aborts, versioning
//! 2. **Client Protocol Tests** - Registration and update validation on the wire
//! 3. **Control Surface Tests** - Operator command server

pub mod mock_client;
pub mod test_fixtures;
pub mod test_utils;

pub use mock_client::MockClient;
pub use test_fixtures::{spawn_server, ServerFixture, TestConfigBuilder};
pub use test_utils::{
    init_test_logging, wait_for_condition, TestResult, DEFAULT_POLL_INTERVAL,
    DEFAULT_TEST_TIMEOUT,
};
