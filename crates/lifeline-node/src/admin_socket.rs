//! Unix socket server for admin commands.
//!
//! Each connection speaks newline-delimited JSON: one [`AdminCommand`] per
//! line in, one [`AdminResponse`] per line out. Commands are forwarded to
//! the service loop, which owns all heartbeat state.

use std::path::{Path, PathBuf};

use lifeline_heartbeat::Answer;
use lifeline_mesh::Status;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// A command plus the slot its response goes into.
pub type AdminRequest = (AdminCommand, oneshot::Sender<AdminResponse>);

/// Admin command sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Affirm the current status
    CheckIn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Set and broadcast a new status
    SetStatus {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Change the check-in window
    SetInterval { interval: String },
    /// Clear missed check-ins and restart the countdown
    ResetDeadMan,
    /// Track and dial a peer, by id (+ optional address) or connection code
    AddPeer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    RemovePeer { peer_id: String },
    /// Register a four-member cell
    RegisterGroup { members: Vec<String> },
    SetGroupActive { group_id: String, active: bool },
    ListGroups,
    ValidateTopology,
    /// Feed one accelerometer sample
    AddSample { x: f64, y: f64, z: f64 },
    Coherence,
    DailyCheckIn { answers: Vec<Answer> },
    DailySummary,
    SetEscalation {
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
        #[serde(default)]
        include_location: bool,
    },
    ExportLog,
    ExportDaily,
    /// Our own shareable connection code
    ConnectionCode,
    /// Full state view
    State,
    /// Ping (health check)
    Ping,
}

/// Response from admin command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    Data { data: serde_json::Value },
    Pong,
}

impl AdminResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Ok {
            message: message.into(),
        }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }

    pub fn data<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self::Data { data },
            Err(e) => Self::error(e),
        }
    }
}

/// Admin socket server.
pub struct AdminSocket {
    socket_path: PathBuf,
    commands: mpsc::Sender<AdminRequest>,
}

impl AdminSocket {
    pub fn new(socket_path: impl Into<PathBuf>, commands: mpsc::Sender<AdminRequest>) -> Self {
        Self {
            socket_path: socket_path.into(),
            commands,
        }
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        // Remove existing socket file if present
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {}", self.socket_path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, commands).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, commands: mpsc::Sender<AdminRequest>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => forward(cmd, &commands).await,
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

async fn forward(command: AdminCommand, commands: &mpsc::Sender<AdminRequest>) -> AdminResponse {
    let (reply, response) = oneshot::channel();
    if commands.send((command, reply)).await.is_err() {
        return AdminResponse::error("node is shutting down");
    }
    response
        .await
        .unwrap_or_else(|_| AdminResponse::error("node dropped the command"))
}
