//! Server fixtures for integration tests
//!
//! Builds configurations with test-friendly timings and spawns the real
//! server tasks on ephemeral ports.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tempfile::TempDir;
use tokio::sync::oneshot;

use fedlink_common::config::{
    AggregationMethod, DifferentialPrivacyConfig, FedProxConfig, RegistryConfig, RoundConfig,
    SecureAggregationConfig, ServerConfig, StoreConfig,
};
use fedlink_fl::StatusSnapshot;
use fedlink_server::{
    AppTask, CoordinatorMessage, CoordinatorTask, ServerTaskBase, Task, TransportTask,
    DEFAULT_CHANNEL_CAPACITY,
};

use crate::test_utils::TestResult;

/// Builder for test server configurations.
///
/// Defaults: dimension 4, quorum 2..4, 3 rounds, 2s deadline, 1s reopen
/// backoff, FedAvg, privacy features off, in-memory store.
pub struct TestConfigBuilder {
    model_dimension: usize,
    min_clients: usize,
    max_clients: usize,
    rounds: u64,
    round_deadline_secs: u64,
    aggregation_method: AggregationMethod,
    checkpoint_dir: Option<std::path::PathBuf>,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self {
            model_dimension: 4,
            min_clients: 2,
            max_clients: 4,
            rounds: 3,
            round_deadline_secs: 2,
            aggregation_method: AggregationMethod::FedAvg,
            checkpoint_dir: None,
        }
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_dimension(mut self, dimension: usize) -> Self {
        self.model_dimension = dimension;
        self
    }

    pub fn quorum(mut self, min: usize, max: usize) -> Self {
        self.min_clients = min;
        self.max_clients = max;
        self
    }

    pub fn rounds(mut self, rounds: u64) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn deadline_secs(mut self, secs: u64) -> Self {
        self.round_deadline_secs = secs;
        self
    }

    pub fn aggregation_method(mut self, method: AggregationMethod) -> Self {
        self.aggregation_method = method;
        self
    }

    pub fn checkpoint_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.checkpoint_dir = Some(dir);
        self
    }

    pub fn build(self) -> ServerConfig {
        ServerConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            cli_port: 0,
            model_dimension: self.model_dimension,
            schema_version: 1,
            round: RoundConfig {
                min_clients: self.min_clients,
                max_clients: self.max_clients,
                rounds: self.rounds,
                round_deadline_secs: self.round_deadline_secs,
                retry_backoff_secs: 1,
                aggregation_method: self.aggregation_method,
                fedprox: FedProxConfig::default(),
                differential_privacy: DifferentialPrivacyConfig::default(),
                secure_aggregation: SecureAggregationConfig::default(),
            },
            registry: RegistryConfig::default(),
            store: StoreConfig {
                checkpoint_dir: self.checkpoint_dir,
                max_versions: 100,
                persist_retry_secs: 1,
            },
        }
    }
}

/// A running server with its tasks spawned on ephemeral ports.
pub struct ServerFixture {
    /// Shared task handles, usable for direct coordinator queries
    pub task_base: ServerTaskBase,
    /// Client-facing UDP address
    pub server_addr: SocketAddr,
    /// Control surface address, if enabled
    pub ctl_addr: Option<SocketAddr>,
    /// Keeps the checkpoint directory alive for the fixture's lifetime
    pub checkpoint_dir: Option<TempDir>,
}

impl ServerFixture {
    /// Queries the coordinator for a status snapshot.
    pub async fn status(&self) -> TestResult<StatusSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_base
            .coordinator_tx
            .send(CoordinatorMessage::GetStatus { reply: reply_tx })
            .await?;
        Ok(reply_rx.await?)
    }

    /// Signals all tasks to shut down.
    pub async fn shutdown(&self) {
        self.task_base.shutdown_all().await;
    }
}

/// Spawns transport, coordinator and (optionally) app tasks for the given
/// configuration and returns the fixture with resolved addresses.
pub async fn spawn_server(
    config: ServerConfig,
    with_ctl: bool,
    checkpoint_dir: Option<TempDir>,
) -> TestResult<ServerFixture> {
    let (task_base, app_rx, coordinator_rx, transport_rx) =
        ServerTaskBase::new(config, DEFAULT_CHANNEL_CAPACITY);

    let mut transport_task = TransportTask::new(task_base.clone()).await?;
    let server_addr = transport_task.local_addr()?;
    tokio::spawn(async move { transport_task.run(transport_rx).await });

    let mut coordinator_task = CoordinatorTask::new(task_base.clone());
    tokio::spawn(async move { coordinator_task.run(coordinator_rx).await });

    let ctl_addr = if with_ctl {
        let mut app_task = AppTask::new(task_base.clone());
        let port = app_task.init_ctl_server().await?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        tokio::spawn(async move { app_task.run(app_rx).await });
        Some(addr)
    } else {
        let mut app_task = AppTask::new_without_ctl(task_base.clone());
        tokio::spawn(async move { app_task.run(app_rx).await });
        None
    };

    Ok(ServerFixture {
        task_base,
        server_addr,
        ctl_addr,
        checkpoint_dir,
    })
}
