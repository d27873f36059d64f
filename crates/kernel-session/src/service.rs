//! Capability interfaces consumed by the kernel handle.
//!
//! These are the seams between session lifecycle logic and whatever actually
//! talks to kernels: the local runtimelib backend, the scriptable mock, or a
//! caller-provided remote transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::message::KernelMessage;
use crate::status::{ConnectionStatus, ExecutionStatus};

/// Identity of a running kernel as listed by a kernel manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
}

/// Document type a session is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelType {
    #[default]
    Notebook,
    File,
}

impl std::fmt::Display for KernelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelType::Notebook => write!(f, "notebook"),
            KernelType::File => write!(f, "file"),
        }
    }
}

/// Which kernel a new session binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSelector {
    /// Launch a new kernel from the named kernelspec.
    New { spec_name: String },
    /// Attach to a kernel that is already running.
    Existing(KernelModel),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub name: String,
    pub path: String,
    pub kernel_type: KernelType,
    pub kernel: KernelSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub path: String,
    pub name: String,
    pub kernel_type: KernelType,
    pub kernel: KernelModel,
}

/// A started session and its live kernel connection.
#[derive(Clone)]
pub struct Session {
    pub model: SessionModel,
    pub kernel: Arc<dyn KernelConnection>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.model)
            .field("kernel_id", &self.kernel.id())
            .finish()
    }
}

/// Subset of a `kernel_info_reply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KernelInfo {
    pub implementation: String,
    pub language: String,
    pub banner: String,
}

/// Available kernelspec, as listed by a kernelspec manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

/// The `execute_request` fields sent to a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

/// A live connection to one kernel.
///
/// Implementations publish every iopub and shell message on a single
/// broadcast stream, in the order each socket delivered them. Consumers
/// filter by parent `msg_id`.
#[async_trait]
pub trait KernelConnection: Send + Sync {
    fn id(&self) -> String;

    /// Client id of the current connection. May change across restarts.
    fn client_id(&self) -> String;

    /// Kernelspec name.
    fn name(&self) -> String;

    fn connection_status(&self) -> ConnectionStatus;

    fn status(&self) -> ExecutionStatus;

    fn subscribe_connection_status(&self) -> broadcast::Receiver<ConnectionStatus>;

    fn subscribe_status(&self) -> broadcast::Receiver<ExecutionStatus>;

    fn subscribe_messages(&self) -> broadcast::Receiver<KernelMessage>;

    /// Send an `execute_request`, returning its `msg_id`.
    async fn request_execute(&self, request: ExecutionRequest) -> Result<String>;

    async fn interrupt(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn info(&self) -> Result<KernelInfo>;

    /// Release the connection. Never fails; safe to call repeatedly.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

#[async_trait]
pub trait KernelManager: Send + Sync {
    async fn ready(&self) -> Result<()>;

    async fn refresh_running(&self) -> Result<()>;

    /// Running kernels as of the last refresh.
    fn running(&self) -> Vec<KernelModel>;
}

#[async_trait]
pub trait KernelSpecManager: Send + Sync {
    async fn ready(&self) -> Result<()>;

    fn default_name(&self) -> Option<String>;

    fn specs(&self) -> Vec<KernelSpecInfo>;
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn ready(&self) -> Result<()>;

    async fn start_new(&self, options: SessionOptions) -> Result<Session>;
}

/// The three managers a kernel service exposes.
#[derive(Clone)]
pub struct ServiceManager {
    pub kernels: Arc<dyn KernelManager>,
    pub kernelspecs: Arc<dyn KernelSpecManager>,
    pub sessions: Arc<dyn SessionManager>,
}

impl ServiceManager {
    pub fn new(
        kernels: Arc<dyn KernelManager>,
        kernelspecs: Arc<dyn KernelSpecManager>,
        sessions: Arc<dyn SessionManager>,
    ) -> Self {
        Self {
            kernels,
            kernelspecs,
            sessions,
        }
    }

    /// Wait until all three managers are usable.
    pub async fn ready(&self) -> Result<()> {
        self.kernels.ready().await?;
        self.kernelspecs.ready().await?;
        self.sessions.ready().await
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager").finish_non_exhaustive()
    }
}
