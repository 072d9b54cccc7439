//! fedlink coordination server
//!
//! Main binary for the federated learning server. It handles:
//! - CLI argument parsing
//! - Configuration loading and validation
//! - Task spawning and lifecycle management
//! - Graceful shutdown handling
//!
//! # Usage
//!
//! ```bash
//! fedlink-server -c config/server.yaml
//! ```

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fedlink_server::{
    load_and_validate_server_config, AppTask, CoordinatorTask, Task, TaskError, TaskId,
    TaskManager, TransportTask, DEFAULT_CHANNEL_CAPACITY,
};

/// fedlink - federated learning coordination server
#[derive(Parser, Debug)]
#[command(name = "fedlink-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_file: String,

    /// Disable the operator control interface
    #[arg(short = 'l', long = "disable-cmd")]
    disable_cmd: bool,
}

/// Application state for the server.
struct ServerApp {
    task_manager: TaskManager,
    shutdown_rx: watch::Receiver<bool>,
}

impl ServerApp {
    /// Loads configuration, binds sockets and spawns the tasks.
    async fn new(config_path: &str, disable_cmd: bool) -> Result<Self> {
        info!("Loading configuration from: {}", config_path);
        let config = load_and_validate_server_config(config_path)
            .with_context(|| format!("Failed to load configuration from {config_path}"))?;

        info!(
            "Configuration loaded: listen={}:{}, model_dimension={}, aggregation={}",
            config.listen_ip,
            config.listen_port,
            config.model_dimension,
            config.round.aggregation_method
        );
        info!(
            "Round parameters: quorum={}..{}, budget={} rounds, deadline={}s",
            config.round.min_clients,
            config.round.max_clients,
            config.round.rounds,
            config.round.round_deadline_secs
        );

        let (mut task_manager, app_rx, coordinator_rx, transport_rx) =
            TaskManager::new(config, DEFAULT_CHANNEL_CAPACITY);

        let task_base = task_manager.task_base();
        let shutdown_rx = task_manager.shutdown_receiver();

        // Transport binds first so a port conflict fails startup instead of
        // a running task.
        let mut transport_task = TransportTask::new(task_base.clone())
            .await
            .context("Failed to bind client transport")?;
        let transport_handle = tokio::spawn(async move {
            transport_task.run(transport_rx).await;
            Ok::<(), TaskError>(())
        });
        task_manager.register_task_handle(TaskId::Transport, transport_handle);
        task_manager.mark_task_started(TaskId::Transport);
        info!("Transport task spawned");

        let mut coordinator_task = CoordinatorTask::new(task_base.clone());
        let coordinator_handle = tokio::spawn(async move {
            coordinator_task.run(coordinator_rx).await;
            Ok::<(), TaskError>(())
        });
        task_manager.register_task_handle(TaskId::Coordinator, coordinator_handle);
        task_manager.mark_task_started(TaskId::Coordinator);
        info!("Coordinator task spawned");

        let app_task_base = task_base.clone();
        let app_handle = tokio::spawn(async move {
            let mut app_task = if disable_cmd {
                AppTask::new_without_ctl(app_task_base)
            } else {
                let mut task = AppTask::new(app_task_base);
                match task.init_ctl_server().await {
                    Ok(port) => {
                        if port > 0 {
                            info!("Control server listening on port {}", port);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to initialize control server: {}", e);
                    }
                }
                task
            };
            app_task.run(app_rx).await;
            Ok::<(), TaskError>(())
        });
        task_manager.register_task_handle(TaskId::App, app_handle);
        task_manager.mark_task_started(TaskId::App);
        info!("App task spawned");

        Ok(Self {
            task_manager,
            shutdown_rx,
        })
    }

    /// Runs until Ctrl+C or an internal shutdown signal.
    async fn run(&mut self) -> Result<()> {
        info!("Server started, waiting for shutdown signal...");

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = async {
                loop {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    self.shutdown_rx.changed().await.ok();
                }
            } => {
                info!("Received shutdown signal from task manager");
            }
        }

        Ok(())
    }

    /// Performs graceful shutdown of all tasks.
    async fn shutdown(mut self) -> Result<()> {
        info!("Initiating graceful shutdown...");
        match self.task_manager.shutdown().await {
            Ok(()) => {
                info!("All tasks shut down successfully");
                Ok(())
            }
            Err(e) => {
                warn!("Some tasks failed during shutdown: {}", e);
                Ok(())
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    fedlink_common::logging::init_logging(fedlink_common::logging::LogLevel::Info);

    let args = Args::parse();

    println!("fedlink - federated learning coordination server");
    println!("================================================");

    match run_server(args).await {
        Ok(()) => {
            info!("Server exited successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: Args) -> Result<()> {
    let mut app = ServerApp::new(&args.config_file, args.disable_cmd).await?;
    app.run().await?;
    app.shutdown().await?;
    Ok(())
}
