//! Application task
//!
//! Hosts the operator control surface. Commands arrive over the UDP
//! control server, are resolved against the coordinator task through
//! oneshot queries, and the answers go back as JSON payloads.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::app::{CtlServer, CtlServerError};
use crate::tasks::{AppMessage, CoordinatorMessage, ServerTaskBase, Task, TaskMessage};

/// Poll interval for the control socket.
const CTL_POLL_INTERVAL_MS: u64 = 100;

/// Commands the control surface understands.
const COMMAND_USAGE: &str = "commands: status | clients | model | trigger-round";

/// The task serving operator commands.
pub struct AppTask {
    task_base: ServerTaskBase,
    ctl_server: Option<CtlServer>,
    ctl_enabled: bool,
    /// Set once the round budget is exhausted
    rounds_completed: Option<u64>,
}

impl AppTask {
    /// Creates the app task. The control server binds later via
    /// [`init_ctl_server`](Self::init_ctl_server).
    pub fn new(task_base: ServerTaskBase) -> Self {
        Self {
            task_base,
            ctl_server: None,
            ctl_enabled: true,
            rounds_completed: None,
        }
    }

    /// Creates the app task with the control surface disabled.
    pub fn new_without_ctl(task_base: ServerTaskBase) -> Self {
        Self {
            task_base,
            ctl_server: None,
            ctl_enabled: false,
            rounds_completed: None,
        }
    }

    /// Binds the control server and returns its port, or 0 when disabled.
    pub async fn init_ctl_server(&mut self) -> Result<u16, CtlServerError> {
        if !self.ctl_enabled {
            return Ok(0);
        }
        let bind_addr = SocketAddr::new(self.task_base.config.listen_ip, self.task_base.config.cli_port);
        let server = CtlServer::new(bind_addr).await?;
        let port = server.local_addr()?.port();
        self.ctl_server = Some(server);
        Ok(port)
    }

    /// Returns the control server port, or 0 if disabled.
    pub fn ctl_port(&self) -> u16 {
        self.ctl_server
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Resolves one command line to a JSON (or plain text) response.
    async fn handle_command(&mut self, command: &str) -> Result<String, String> {
        match command.trim() {
            "status" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.query(CoordinatorMessage::GetStatus { reply: reply_tx }).await?;
                let status = reply_rx.await.map_err(|_| "coordinator unavailable".to_string())?;
                serde_json::to_string_pretty(&status).map_err(|e| e.to_string())
            }
            "clients" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.query(CoordinatorMessage::GetClients { reply: reply_tx }).await?;
                let clients = reply_rx.await.map_err(|_| "coordinator unavailable".to_string())?;
                serde_json::to_string_pretty(&clients).map_err(|e| e.to_string())
            }
            "model" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.query(CoordinatorMessage::GetModel { reply: reply_tx }).await?;
                let model = reply_rx.await.map_err(|_| "coordinator unavailable".to_string())?;
                serde_json::to_string_pretty(&model).map_err(|e| e.to_string())
            }
            "trigger-round" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.query(CoordinatorMessage::TriggerRound { reply: reply_tx }).await?;
                match reply_rx.await.map_err(|_| "coordinator unavailable".to_string())? {
                    Ok(()) => Ok("round opened".to_string()),
                    Err(e) => Err(e),
                }
            }
            "" => Err(COMMAND_USAGE.to_string()),
            other => Err(format!("unknown command '{other}'; {COMMAND_USAGE}")),
        }
    }

    async fn query(&self, msg: CoordinatorMessage) -> Result<(), String> {
        self.task_base
            .coordinator_tx
            .send(msg)
            .await
            .map_err(|e| format!("coordinator unavailable: {e}"))
    }

    /// Handles a command and delivers the response to `response_addr`.
    async fn dispatch_command(&mut self, command: String, response_addr: SocketAddr) {
        debug!("control command: {}", command);
        let outcome = self.handle_command(&command).await;
        let Some(server) = &self.ctl_server else {
            return;
        };
        let result = match outcome {
            Ok(value) => server.send_result(value, response_addr).await,
            Err(value) => server.send_error(value, response_addr).await,
        };
        if let Err(e) = result {
            warn!("failed to send control response: {}", e);
        }
    }

    /// Polls the control socket for an incoming command.
    async fn poll_ctl_server(&mut self) {
        let msg = match &self.ctl_server {
            Some(server) => match server.try_receive() {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("control server error: {}", e);
                    None
                }
            },
            None => None,
        };
        if let Some(msg) = msg {
            if let Some(addr) = msg.client_addr {
                self.dispatch_command(msg.value, addr).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl Task for AppTask {
    type Message = AppMessage;

    async fn run(&mut self, mut rx: mpsc::Receiver<TaskMessage<Self::Message>>) {
        info!("app task starting");
        if let Some(server) = &self.ctl_server {
            if let Ok(addr) = server.local_addr() {
                info!("control surface listening on {}", addr);
            }
        }

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(TaskMessage::Message(AppMessage::CliCommand { command, response_addr })) => {
                            self.dispatch_command(command, response_addr).await;
                        }
                        Some(TaskMessage::Message(AppMessage::TrainingComplete { rounds_completed })) => {
                            info!("round budget exhausted after {} rounds; serving queries only", rounds_completed);
                            self.rounds_completed = Some(rounds_completed);
                        }
                        Some(TaskMessage::Shutdown) | None => {
                            info!("app task shutting down");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(CTL_POLL_INTERVAL_MS)) => {
                    self.poll_ctl_server().await;
                }
            }
        }
    }
}
