//! Kernel services backed by local kernel processes.
//!
//! Kernels are launched from installed kernelspecs via runtimelib, with a
//! connection file in the Jupyter runtime directory. Each connection keeps
//! an iopub reader and a shell reader task that translate wire messages into
//! [`KernelMessage`]s and publish them on a broadcast channel.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use runtimelib::DealerSendConnection;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DEFAULT_KERNEL_NAME;
use crate::error::{KernelSessionError, Result};
use crate::message::{Channel, KernelMessage, MessageContent};
use crate::service::{
    ExecutionRequest, KernelConnection, KernelInfo, KernelManager, KernelModel, KernelSelector,
    KernelSpecInfo, KernelSpecManager, ServiceManager, Session, SessionManager, SessionModel,
    SessionOptions,
};
use crate::status::{ConnectionStatus, ExecutionStatus};

const MESSAGE_CAPACITY: usize = 1024;
const STATUS_CAPACITY: usize = 64;
const STARTUP_DELAY: Duration = Duration::from_millis(500);
const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a [`ServiceManager`] whose kernels run as local processes.
pub fn local_services() -> ServiceManager {
    let registry = Arc::new(LocalRegistry::default());
    ServiceManager::new(
        Arc::new(LocalKernelManager {
            registry: registry.clone(),
        }),
        Arc::new(LocalKernelSpecManager::default()),
        Arc::new(LocalSessionManager { registry }),
    )
}

/// Kernels launched by this process, keyed by kernel id.
#[derive(Default)]
struct LocalRegistry {
    kernels: Mutex<HashMap<String, Arc<LocalKernelConnection>>>,
}

impl LocalRegistry {
    fn insert(&self, kernel: Arc<LocalKernelConnection>) {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kernel.id.clone(), kernel);
    }

    fn get(&self, id: &str) -> Option<Arc<LocalKernelConnection>> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn prune(&self) {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, kernel| !kernel.is_disposed());
    }

    fn models(&self) -> Vec<KernelModel> {
        let mut models: Vec<KernelModel> = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|kernel| !kernel.is_disposed())
            .map(|kernel| KernelModel {
                id: kernel.id.clone(),
                name: kernel.name.clone(),
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

pub struct LocalKernelManager {
    registry: Arc<LocalRegistry>,
}

#[async_trait]
impl KernelManager for LocalKernelManager {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn refresh_running(&self) -> Result<()> {
        self.registry.prune();
        Ok(())
    }

    fn running(&self) -> Vec<KernelModel> {
        self.registry.models()
    }
}

/// Lists installed kernelspecs once and caches them.
#[derive(Default)]
pub struct LocalKernelSpecManager {
    specs: Mutex<Option<Vec<KernelSpecInfo>>>,
}

#[async_trait]
impl KernelSpecManager for LocalKernelSpecManager {
    async fn ready(&self) -> Result<()> {
        let loaded = self
            .specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if loaded {
            return Ok(());
        }

        let mut specs: Vec<KernelSpecInfo> = runtimelib::list_kernelspecs()
            .await
            .into_iter()
            .map(|spec| KernelSpecInfo {
                name: spec.kernel_name,
                display_name: spec.kernelspec.display_name,
                language: spec.kernelspec.language,
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("[local-kernel] Found {} kernelspecs", specs.len());

        *self.specs.lock().unwrap_or_else(PoisonError::into_inner) = Some(specs);
        Ok(())
    }

    fn default_name(&self) -> Option<String> {
        default_spec_name(&self.specs())
    }

    fn specs(&self) -> Vec<KernelSpecInfo> {
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }
}

/// Prefer the stock Python kernel, otherwise the first installed spec.
fn default_spec_name(specs: &[KernelSpecInfo]) -> Option<String> {
    specs
        .iter()
        .find(|spec| spec.name == DEFAULT_KERNEL_NAME)
        .or_else(|| specs.first())
        .map(|spec| spec.name.clone())
}

pub struct LocalSessionManager {
    registry: Arc<LocalRegistry>,
}

#[async_trait]
impl SessionManager for LocalSessionManager {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn start_new(&self, options: SessionOptions) -> Result<Session> {
        let kernel = match &options.kernel {
            KernelSelector::New { spec_name } => {
                let kernel = LocalKernelConnection::launch(spec_name).await?;
                self.registry.insert(kernel.clone());
                kernel
            }
            KernelSelector::Existing(model) => self
                .registry
                .get(&model.id)
                .filter(|kernel| !kernel.is_disposed())
                .ok_or_else(|| {
                    KernelSessionError::NotFound(format!("running kernel {}", model.id))
                })?,
        };

        let model = SessionModel {
            id: Uuid::new_v4().to_string(),
            path: options.path,
            name: options.name,
            kernel_type: options.kernel_type,
            kernel: KernelModel {
                id: kernel.id.clone(),
                name: kernel.name.clone(),
            },
        };
        Ok(Session {
            model,
            kernel: kernel as Arc<dyn KernelConnection>,
        })
    }
}

/// A kernel process plus the client sockets talking to it.
pub struct LocalKernelConnection {
    id: String,
    name: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    /// Client session id, regenerated on every (re)connect.
    session_id: Mutex<String>,
    process: Mutex<Option<Child>>,
    shell_writer: tokio::sync::Mutex<Option<DealerSendConnection>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pending_info: Arc<Mutex<HashMap<String, oneshot::Sender<KernelInfo>>>>,
    connection_status: Mutex<ConnectionStatus>,
    status: Arc<Mutex<ExecutionStatus>>,
    connection_tx: broadcast::Sender<ConnectionStatus>,
    status_tx: broadcast::Sender<ExecutionStatus>,
    messages_tx: broadcast::Sender<KernelMessage>,
    disposed: AtomicBool,
}

impl LocalKernelConnection {
    /// Launch a kernel from the named kernelspec and connect to it.
    pub async fn launch(spec_name: &str) -> Result<Arc<Self>> {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5)
            .await
            .context("reserving kernel ports")?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(spec_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(connection_file_name(&id));
        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        let kernel = Self::new(id, spec_name, connection_info, connection_file);

        info!(
            "[local-kernel] Starting {} kernel {} at {:?}",
            spec_name, kernel.id, kernel.connection_file
        );
        if let Err(e) = kernel.start_process().await {
            kernel.dispose();
            return Err(e.into());
        }
        if let Err(e) = kernel.connect().await {
            error!("[local-kernel] Kernel {} did not come up: {:#}", kernel.id, e);
            kernel.dispose();
            return Err(e.into());
        }

        kernel.set_status(ExecutionStatus::Idle);
        kernel.set_connection_status(ConnectionStatus::Connected);
        info!("[local-kernel] Kernel {} ready", kernel.id);
        Ok(kernel)
    }

    /// A connection in the `Connecting` state with no process behind it yet.
    fn new(
        id: String,
        spec_name: &str,
        connection_info: ConnectionInfo,
        connection_file: PathBuf,
    ) -> Arc<Self> {
        let (connection_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (messages_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        Arc::new(Self {
            id,
            name: spec_name.to_string(),
            connection_info,
            connection_file,
            session_id: Mutex::new(String::new()),
            process: Mutex::new(None),
            shell_writer: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            pending_info: Arc::new(Mutex::new(HashMap::new())),
            connection_status: Mutex::new(ConnectionStatus::Connecting),
            status: Arc::new(Mutex::new(ExecutionStatus::Starting)),
            connection_tx,
            status_tx,
            messages_tx,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    async fn start_process(&self) -> anyhow::Result<()> {
        let kernelspec = runtimelib::find_kernelspec(&self.name)
            .await
            .with_context(|| format!("finding kernelspec {}", self.name))?;
        let mut cmd = kernelspec.command(
            &self.connection_file,
            Some(Stdio::null()),
            Some(Stdio::null()),
        )?;
        let process = cmd.kill_on_drop(true).spawn()?;
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(process);

        tokio::time::sleep(STARTUP_DELAY).await;
        Ok(())
    }

    /// Open iopub and shell, verify the kernel answers `kernel_info`, and
    /// start the reader tasks.
    async fn connect(&self) -> anyhow::Result<()> {
        let session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(&self.connection_info, "", &session_id)
                .await?;
        let messages_tx = self.messages_tx.clone();
        let status_tx = self.status_tx.clone();
        let status = self.status.clone();
        let kernel_id = self.id.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        let message = KernelMessage::from_jupyter(&message, Channel::Iopub);
                        if let MessageContent::Status { execution_state } = &message.content {
                            let changed = {
                                let mut current =
                                    status.lock().unwrap_or_else(PoisonError::into_inner);
                                let changed = *current != *execution_state;
                                *current = *execution_state;
                                changed
                            };
                            if changed {
                                let _ = status_tx.send(*execution_state);
                            }
                        }
                        let _ = messages_tx.send(message);
                    }
                    Err(e) => {
                        error!("[local-kernel] {} iopub read error: {}", kernel_id, e);
                        break;
                    }
                }
            }
        });
        self.track(iopub_task);

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &self.connection_info,
            &session_id,
            identity,
        )
        .await?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        match tokio::time::timeout(KERNEL_INFO_TIMEOUT, shell.read()).await {
            Ok(Ok(reply)) => {
                debug!(
                    "[local-kernel] {} alive: got {} reply",
                    self.id, reply.header.msg_type
                );
            }
            Ok(Err(e)) => return Err(anyhow!("Kernel did not respond: {}", e)),
            Err(_) => {
                return Err(anyhow!(
                    "Kernel did not respond within {}s",
                    KERNEL_INFO_TIMEOUT.as_secs()
                ))
            }
        }

        let (writer, mut reader) = shell.split();
        let messages_tx = self.messages_tx.clone();
        let pending_info = self.pending_info.clone();
        let kernel_id = self.id.clone();
        let shell_task = tokio::spawn(async move {
            loop {
                match reader.read().await {
                    Ok(message) => {
                        if let JupyterMessageContent::KernelInfoReply(reply) = &message.content {
                            let sender = message.parent_header.as_ref().and_then(|parent| {
                                pending_info
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .remove(&parent.msg_id)
                            });
                            if let Some(sender) = sender {
                                match serde_json::to_value(reply) {
                                    Ok(value) => {
                                        let _ = sender.send(kernel_info_from_value(&value));
                                    }
                                    Err(e) => warn!(
                                        "[local-kernel] {} unreadable kernel_info_reply: {}",
                                        kernel_id, e
                                    ),
                                }
                            }
                            continue;
                        }
                        let _ = messages_tx
                            .send(KernelMessage::from_jupyter(&message, Channel::Shell));
                    }
                    Err(e) => {
                        error!("[local-kernel] {} shell read error: {}", kernel_id, e);
                        break;
                    }
                }
            }
        });
        self.track(shell_task);

        *self.shell_writer.lock().await = Some(writer);
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = session_id;
        Ok(())
    }

    async fn send_shell(&self, message: JupyterMessage) -> Result<()> {
        let mut writer = self.shell_writer.lock().await;
        let writer = writer.as_mut().ok_or(KernelSessionError::NotReady)?;
        writer
            .send(message)
            .await
            .map_err(|e| KernelSessionError::Transport(format!("sending on shell: {}", e)))
    }

    async fn send_control(&self, message: JupyterMessage) -> anyhow::Result<()> {
        let session_id = self.client_id();
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &session_id)
                .await?;
        control.send(message).await?;
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    fn take_process(&self) -> Option<Child> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn stop_process(&self) {
        if let Some(mut process) = self.take_process() {
            if let Err(e) = process.kill().await {
                debug!("[local-kernel] {} kill failed: {}", self.id, e);
            }
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(KernelSessionError::KernelShutdown);
        }
        Ok(())
    }

    fn set_connection_status(&self, next: ConnectionStatus) {
        let changed = {
            let mut current = self
                .connection_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = *current != next;
            *current = next;
            changed
        };
        if changed {
            let _ = self.connection_tx.send(next);
        }
    }

    fn set_status(&self, next: ExecutionStatus) {
        let changed = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *current != next;
            *current = next;
            changed
        };
        if changed {
            let _ = self.status_tx.send(next);
        }
    }
}

fn connection_file_name(kernel_id: &str) -> String {
    format!("kernel-session-{}.json", kernel_id)
}

/// Pull the fields we surface out of a serialized `kernel_info_reply`.
fn kernel_info_from_value(value: &Value) -> KernelInfo {
    let text = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    KernelInfo {
        implementation: text(value.get("implementation")),
        language: text(value.pointer("/language_info/name")),
        banner: text(value.get("banner")),
    }
}

#[async_trait]
impl KernelConnection for LocalKernelConnection {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn client_id(&self) -> String {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self
            .connection_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> ExecutionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe_connection_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.connection_tx.subscribe()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<KernelMessage> {
        self.messages_tx.subscribe()
    }

    async fn request_execute(&self, request: ExecutionRequest) -> Result<String> {
        self.ensure_live()?;

        let message: JupyterMessage = ExecuteRequest {
            code: request.code,
            silent: request.silent,
            store_history: request.store_history,
            user_expressions: None,
            allow_stdin: request.allow_stdin,
            stop_on_error: request.stop_on_error,
        }
        .into();
        let msg_id = message.header.msg_id.clone();

        self.send_shell(message).await?;
        debug!("[local-kernel] {} sent execute_request {}", self.id, msg_id);
        Ok(msg_id)
    }

    async fn interrupt(&self) -> Result<()> {
        self.ensure_live()?;
        self.send_control(InterruptRequest {}.into()).await?;
        info!("[local-kernel] Sent interrupt_request to {}", self.id);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.ensure_live()?;
        info!("[local-kernel] Restarting {}", self.id);

        self.set_status(ExecutionStatus::Restarting);
        self.set_connection_status(ConnectionStatus::Connecting);
        self.abort_tasks();
        *self.shell_writer.lock().await = None;
        self.stop_process().await;

        if let Err(e) = self.start_process().await {
            error!("[local-kernel] Kernel {} did not restart: {:#}", self.id, e);
            self.set_status(ExecutionStatus::Dead);
            self.set_connection_status(ConnectionStatus::Disconnected);
            return Err(e.into());
        }
        if let Err(e) = self.connect().await {
            self.set_status(ExecutionStatus::Dead);
            self.set_connection_status(ConnectionStatus::Disconnected);
            return Err(e.into());
        }

        self.set_connection_status(ConnectionStatus::Connected);
        self.set_status(ExecutionStatus::Idle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        info!("[local-kernel] Shutting down {}", self.id);

        let request: JupyterMessage = ShutdownRequest { restart: false }.into();
        if let Err(e) = self.send_shell(request).await {
            debug!("[local-kernel] {} shutdown_request not sent: {}", self.id, e);
        }
        self.abort_tasks();
        *self.shell_writer.lock().await = None;
        self.stop_process().await;
        tokio::fs::remove_file(&self.connection_file).await.ok();

        self.set_status(ExecutionStatus::Dead);
        self.set_connection_status(ConnectionStatus::Disconnected);
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn info(&self) -> Result<KernelInfo> {
        self.ensure_live()?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        let (tx, rx) = oneshot::channel();
        self.pending_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.header.msg_id.clone(), tx);

        self.send_shell(request).await?;
        match tokio::time::timeout(KERNEL_INFO_TIMEOUT, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(KernelSessionError::Transport(
                "shell reader dropped".to_string(),
            )),
            Err(_) => Err(KernelSessionError::Timeout(KERNEL_INFO_TIMEOUT)),
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_tasks();
        if let Some(mut process) = self.take_process() {
            let _ = process.start_kill();
        }
        if let Err(e) = std::fs::remove_file(&self.connection_file) {
            debug!(
                "[local-kernel] Could not remove {:?}: {}",
                self.connection_file, e
            );
        }
        self.set_connection_status(ConnectionStatus::Disconnected);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for LocalKernelConnection {
    fn drop(&mut self) {
        self.abort_tasks();
        if !self.is_disposed() {
            std::fs::remove_file(&self.connection_file).ok();
        }
    }
}
