//! Connection and execution status of a kernel.
//!
//! A kernel connection has two independent status axes: whether the
//! transport is live (`ConnectionStatus`) and what the kernel process reports
//! on iopub (`ExecutionStatus`). Status widgets consume a single collapsed
//! "display state" derived from both.

use serde::{Deserialize, Serialize};

/// Transport-level status of a kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not live yet, or attempting to reconnect.
    #[default]
    Connecting,
    /// The connection is live.
    Connected,
    /// The connection is permanently down.
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Kernel-reported execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Unknown,
    Starting,
    Idle,
    Busy,
    Terminating,
    Restarting,
    Autorestarting,
    Dead,
}

impl ExecutionStatus {
    /// Whether this status means the kernel process is being replaced.
    pub fn is_restarting(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Restarting | ExecutionStatus::Autorestarting
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Unknown => "unknown",
            ExecutionStatus::Starting => "starting",
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Busy => "busy",
            ExecutionStatus::Terminating => "terminating",
            ExecutionStatus::Restarting => "restarting",
            ExecutionStatus::Autorestarting => "autorestarting",
            ExecutionStatus::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

/// Collapse the two status axes into the display state string.
///
/// `connecting` and `disconnected` hide the execution status entirely;
/// a live connection shows `connected-<execution status>`.
pub fn display_state(connection: ConnectionStatus, execution: ExecutionStatus) -> String {
    match connection {
        ConnectionStatus::Connecting | ConnectionStatus::Disconnected => connection.to_string(),
        ConnectionStatus::Connected => format!("{}-{}", connection, execution),
    }
}

/// The connection-state projection owned by one kernel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectionState {
    pub connection_status: ConnectionStatus,
    pub execution_status: ExecutionStatus,
}

impl ConnectionState {
    pub fn new(connection_status: ConnectionStatus, execution_status: ExecutionStatus) -> Self {
        Self {
            connection_status,
            execution_status,
        }
    }

    pub fn display_state(&self) -> String {
        display_state(self.connection_status, self.execution_status)
    }
}
