//! Scriptable in-memory kernel service.
//!
//! Stands in for a kernel server in tests and demos. Each execute request is
//! answered by a responder that returns a script of iopub/shell messages and
//! delays; the mock stamps every scripted message with the request's
//! `msg_id` as parent and publishes it from a background task.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{KernelSessionError, Result};
use crate::message::{
    Channel, KernelMessage, MessageContent, MimeBundle, ReplyStatus, StreamName,
};
use crate::service::{
    ExecutionRequest, KernelConnection, KernelInfo, KernelManager, KernelModel, KernelSelector,
    KernelSpecInfo, KernelSpecManager, ServiceManager, Session, SessionManager, SessionModel,
    SessionOptions,
};
use crate::status::{ConnectionStatus, ExecutionStatus};

const MESSAGE_CAPACITY: usize = 1024;
const STATUS_CAPACITY: usize = 64;

/// One step of a scripted kernel response.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Iopub(MessageContent),
    Shell(MessageContent),
    Delay(Duration),
}

fn plain(text: &str) -> MimeBundle {
    let mut bundle = MimeBundle::new();
    bundle.insert("text/plain".to_string(), json!(text));
    bundle
}

impl Scripted {
    pub fn status(execution_state: ExecutionStatus) -> Self {
        Scripted::Iopub(MessageContent::Status { execution_state })
    }

    pub fn stream(name: StreamName, text: &str) -> Self {
        Scripted::Iopub(MessageContent::Stream {
            name,
            text: text.to_string(),
        })
    }

    pub fn execute_result(text: &str) -> Self {
        Scripted::Iopub(MessageContent::ExecuteResult {
            data: plain(text),
            metadata: MimeBundle::new(),
            execution_count: None,
        })
    }

    pub fn display_data(text: &str, display_id: Option<&str>) -> Self {
        Scripted::Iopub(MessageContent::DisplayData {
            data: plain(text),
            metadata: MimeBundle::new(),
            display_id: display_id.map(String::from),
        })
    }

    pub fn update_display_data(text: &str, display_id: &str) -> Self {
        Scripted::Iopub(MessageContent::UpdateDisplayData {
            data: plain(text),
            metadata: MimeBundle::new(),
            display_id: display_id.to_string(),
        })
    }

    pub fn error(ename: &str, evalue: &str, traceback: Vec<String>) -> Self {
        Scripted::Iopub(MessageContent::Error {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback,
        })
    }

    pub fn clear_output(wait: bool) -> Self {
        Scripted::Iopub(MessageContent::ClearOutput { wait })
    }

    pub fn reply(status: ReplyStatus) -> Self {
        Scripted::Shell(MessageContent::ExecuteReply {
            status,
            execution_count: None,
            pages: Vec::new(),
            ename: None,
            evalue: None,
            traceback: Vec::new(),
        })
    }

    pub fn reply_ok() -> Self {
        Self::reply(ReplyStatus::Ok)
    }

    pub fn reply_error(ename: &str, evalue: &str, traceback: Vec<String>) -> Self {
        Scripted::Shell(MessageContent::ExecuteReply {
            status: ReplyStatus::Error,
            execution_count: None,
            pages: Vec::new(),
            ename: Some(ename.to_string()),
            evalue: Some(evalue.to_string()),
            traceback,
        })
    }

    pub fn reply_with_page(text: &str) -> Self {
        Scripted::Shell(MessageContent::ExecuteReply {
            status: ReplyStatus::Ok,
            execution_count: None,
            pages: vec![plain(text)],
            ename: None,
            evalue: None,
            traceback: Vec::new(),
        })
    }

    pub fn delay(millis: u64) -> Self {
        Scripted::Delay(Duration::from_millis(millis))
    }
}

/// Produces the script answering one execute request.
pub type Responder = Arc<dyn Fn(&ExecutionRequest) -> Vec<Scripted> + Send + Sync>;

fn default_script(_request: &ExecutionRequest) -> Vec<Scripted> {
    vec![
        Scripted::status(ExecutionStatus::Busy),
        Scripted::reply_ok(),
        Scripted::status(ExecutionStatus::Idle),
    ]
}

/// In-memory `KernelConnection`.
pub struct MockKernelConnection {
    me: Weak<MockKernelConnection>,
    id: String,
    name: String,
    client_id: Mutex<String>,
    connection_status: Mutex<ConnectionStatus>,
    status: Mutex<ExecutionStatus>,
    connection_tx: broadcast::Sender<ConnectionStatus>,
    status_tx: broadcast::Sender<ExecutionStatus>,
    messages_tx: broadcast::Sender<KernelMessage>,
    responder: Mutex<Responder>,
    requests: Mutex<Vec<ExecutionRequest>>,
    execution_count: AtomicI64,
    interrupts: AtomicUsize,
    restarts: AtomicUsize,
    shutdowns: AtomicUsize,
    disposed: AtomicBool,
    info: KernelInfo,
}

impl std::fmt::Debug for MockKernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockKernelConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MockKernelConnection {
    pub fn new(id: &str, name: &str, connection_status: ConnectionStatus) -> Arc<Self> {
        let (connection_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (messages_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        let execution_status = match connection_status {
            ConnectionStatus::Connected => ExecutionStatus::Idle,
            _ => ExecutionStatus::Unknown,
        };
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: id.to_string(),
            name: name.to_string(),
            client_id: Mutex::new(Uuid::new_v4().to_string()),
            connection_status: Mutex::new(connection_status),
            status: Mutex::new(execution_status),
            connection_tx,
            status_tx,
            messages_tx,
            responder: Mutex::new(Arc::new(default_script) as Responder),
            requests: Mutex::new(Vec::new()),
            execution_count: AtomicI64::new(0),
            interrupts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            info: KernelInfo {
                implementation: "mock".to_string(),
                language: "python".to_string(),
                banner: "Mock kernel".to_string(),
            },
        })
    }

    /// A connected kernel with a fresh id.
    pub fn connected(name: &str) -> Arc<Self> {
        Self::new(&Uuid::new_v4().to_string(), name, ConnectionStatus::Connected)
    }

    pub fn respond_with(
        &self,
        responder: impl Fn(&ExecutionRequest) -> Vec<Scripted> + Send + Sync + 'static,
    ) {
        self.set_responder(Arc::new(responder));
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = responder;
    }

    /// Execute requests received so far.
    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Report a connection status. Always announced, even when unchanged.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        *self
            .connection_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
        let _ = self.connection_tx.send(status);
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        let _ = self.status_tx.send(status);
    }

    /// Publish a message as-is.
    pub fn emit(&self, message: KernelMessage) {
        if let MessageContent::Status { execution_state } = &message.content {
            self.set_status(*execution_state);
        }
        let _ = self.messages_tx.send(message);
    }

    /// Emits `script` as children of `msg_id`, yielding between messages. A
    /// script that never reports `idle` gets one appended at the end.
    async fn play(&self, msg_id: String, execution_count: i64, mut script: Vec<Scripted>) {
        let reports_idle = script.iter().any(|step| {
            matches!(
                step,
                Scripted::Iopub(MessageContent::Status {
                    execution_state: ExecutionStatus::Idle
                })
            )
        });
        if !reports_idle {
            script.push(Scripted::status(ExecutionStatus::Idle));
        }
        for step in script {
            let (channel, mut content) = match step {
                Scripted::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Scripted::Iopub(content) => (Channel::Iopub, content),
                Scripted::Shell(content) => (Channel::Shell, content),
            };
            match &mut content {
                MessageContent::ExecuteReply {
                    execution_count: count @ None,
                    ..
                }
                | MessageContent::ExecuteResult {
                    execution_count: count @ None,
                    ..
                } => *count = Some(execution_count),
                _ => {}
            }
            let msg_type = content.msg_type();
            self.emit(KernelMessage::new(channel, msg_type, content).child_of(&msg_id));
            tokio::task::yield_now().await;
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(KernelSessionError::KernelShutdown);
        }
        Ok(())
    }
}

#[async_trait]
impl KernelConnection for MockKernelConnection {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn client_id(&self) -> String {
        self.client_id
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
        if self.connection_status() != ConnectionStatus::Connected {
            return Err(KernelSessionError::NotReady);
        }

        let msg_id = Uuid::new_v4().to_string();
        let script = {
            let responder = self
                .responder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            responder(&request)
        };
        let execution_count = if request.store_history && !request.silent {
            self.execution_count.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.execution_count.load(Ordering::SeqCst)
        };
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        if let Some(me) = self.me.upgrade() {
            let parent = msg_id.clone();
            tokio::spawn(async move { me.play(parent, execution_count, script).await });
        }
        Ok(msg_id)
    }

    async fn interrupt(&self) -> Result<()> {
        self.ensure_live()?;
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Restart keeps the kernel id, issues a new client id and re-announces
    /// the connection.
    async fn restart(&self) -> Result<()> {
        self.ensure_live()?;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.set_status(ExecutionStatus::Restarting);
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) =
            Uuid::new_v4().to_string();
        self.execution_count.store(0, Ordering::SeqCst);
        self.set_connection_status(ConnectionStatus::Connected);
        self.set_status(ExecutionStatus::Idle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.ensure_live()?;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.set_status(ExecutionStatus::Dead);
        self.set_connection_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn info(&self) -> Result<KernelInfo> {
        self.ensure_live()?;
        Ok(self.info.clone())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.connection_status() != ConnectionStatus::Disconnected {
            self.set_connection_status(ConnectionStatus::Disconnected);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct MockKernelManager {
    running: Mutex<Vec<KernelModel>>,
    refreshes: AtomicUsize,
}

impl MockKernelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_running(&self, model: KernelModel) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(model);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelManager for MockKernelManager {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn refresh_running(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn running(&self) -> Vec<KernelModel> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
pub struct MockKernelSpecManager {
    specs: Vec<KernelSpecInfo>,
}

impl Default for MockKernelSpecManager {
    fn default() -> Self {
        Self {
            specs: vec![KernelSpecInfo {
                name: "python3".to_string(),
                display_name: "Python 3".to_string(),
                language: "python".to_string(),
            }],
        }
    }
}

#[async_trait]
impl KernelSpecManager for MockKernelSpecManager {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn default_name(&self) -> Option<String> {
        self.specs.first().map(|spec| spec.name.clone())
    }

    fn specs(&self) -> Vec<KernelSpecInfo> {
        self.specs.clone()
    }
}

/// Session manager that creates `MockKernelConnection`s.
pub struct MockSessionManager {
    started: Mutex<Vec<SessionOptions>>,
    connections: Mutex<Vec<Arc<MockKernelConnection>>>,
    responder: Mutex<Option<Responder>>,
    auto_connect: AtomicBool,
    start_error: Mutex<Option<KernelSessionError>>,
}

impl Default for MockSessionManager {
    fn default() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            auto_connect: AtomicBool::new(true),
            start_error: Mutex::new(None),
        }
    }
}

impl MockSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responder installed on every connection created from now on.
    pub fn respond_with(
        &self,
        responder: impl Fn(&ExecutionRequest) -> Vec<Scripted> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(responder));
    }

    /// When false, new connections stay `connecting` until told otherwise.
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.auto_connect.store(auto_connect, Ordering::SeqCst);
    }

    /// Make the next `start_new` fail with `error`.
    pub fn fail_next_start(&self, error: KernelSessionError) {
        *self.start_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn started(&self) -> Vec<SessionOptions> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockKernelConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockKernelConnection>> {
        self.connections().last().cloned()
    }
}

#[async_trait]
impl SessionManager for MockSessionManager {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn start_new(&self, options: SessionOptions) -> Result<Session> {
        if let Some(error) = self
            .start_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(error);
        }

        let kernel = match &options.kernel {
            KernelSelector::New { spec_name } => KernelModel {
                id: Uuid::new_v4().to_string(),
                name: spec_name.clone(),
            },
            KernelSelector::Existing(model) => model.clone(),
        };
        let status = if self.auto_connect.load(Ordering::SeqCst) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Connecting
        };
        let connection = MockKernelConnection::new(&kernel.id, &kernel.name, status);
        if let Some(responder) = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            connection.set_responder(responder);
        }

        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options.clone());
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());

        Ok(Session {
            model: SessionModel {
                id: Uuid::new_v4().to_string(),
                path: options.path,
                name: options.name,
                kernel_type: options.kernel_type,
                kernel,
            },
            kernel: connection,
        })
    }
}

/// The three mock managers, kept typed for test control.
#[derive(Clone)]
pub struct MockServices {
    pub kernels: Arc<MockKernelManager>,
    pub kernelspecs: Arc<MockKernelSpecManager>,
    pub sessions: Arc<MockSessionManager>,
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServices {
    pub fn new() -> Self {
        Self {
            kernels: Arc::new(MockKernelManager::new()),
            kernelspecs: Arc::new(MockKernelSpecManager::default()),
            sessions: Arc::new(MockSessionManager::new()),
        }
    }

    pub fn service_manager(&self) -> ServiceManager {
        ServiceManager::new(
            self.kernels.clone(),
            self.kernelspecs.clone(),
            self.sessions.clone(),
        )
    }
}
