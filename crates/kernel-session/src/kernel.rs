//! Kernel handle: one kernel session and its lifecycle.
//!
//! A `Kernel` starts its session in a background task as soon as it is
//! created. `ready()` resolves the first time the connection reports
//! `connected` (after any init code ran) and stays resolved across restarts.
//! Executions can only be started once ready; shutting the handle down makes
//! it permanently unusable and settles every pending execution.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{KernelSessionError, Result};
use crate::executor::{ExecuteOptions, ExecutorContext, KernelExecutor, DEFAULT_EXECUTION_TIMEOUT};
use crate::reconnect::{reconnection_key, MemoryReconnectionStore, ReconnectionStore};
use crate::service::{
    KernelConnection, KernelInfo, KernelModel, KernelSelector, KernelType, ServiceManager,
    SessionOptions,
};
use crate::status::{ConnectionState, ConnectionStatus, ExecutionStatus};
use crate::store::StateStore;

const EVENT_CAPACITY: usize = 64;

/// Everything needed to construct a `Kernel`.
#[derive(Clone)]
pub struct KernelOptions {
    pub services: ServiceManager,
    /// Session name.
    pub kernel_name: String,
    pub kernel_spec_name: String,
    pub kernel_type: KernelType,
    /// Attach to this running kernel instead of launching one.
    pub kernel_model: Option<KernelModel>,
    /// Session path. Defaults to the remembered path for the kernelspec.
    pub path: Option<String>,
    pub reconnection: Arc<dyn ReconnectionStore>,
    pub store: Arc<StateStore>,
    pub init_code: Option<String>,
    pub execution_timeout: Option<Duration>,
}

impl KernelOptions {
    pub fn new(services: ServiceManager, kernel_spec_name: impl Into<String>) -> Self {
        let kernel_spec_name = kernel_spec_name.into();
        Self {
            services,
            kernel_name: kernel_spec_name.clone(),
            kernel_spec_name,
            kernel_type: KernelType::Notebook,
            kernel_model: None,
            path: None,
            reconnection: Arc::new(MemoryReconnectionStore::new()),
            store: Arc::new(StateStore::new()),
            init_code: None,
            execution_timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
        }
    }
}

/// Identity of a ready kernel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelIdentity {
    pub id: String,
    pub client_id: String,
    pub session_id: String,
    pub path: String,
    pub kernel_spec_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// The collapsed connection state changed.
    StateChanged(ConnectionState),
    /// The kernel process is being replaced.
    Restarted,
    Ready,
}

#[derive(Default)]
struct SessionSlot {
    connection: Option<Arc<dyn KernelConnection>>,
    id: String,
    client_id: String,
    session_id: String,
    path: String,
    info: Option<KernelInfo>,
    state: ConnectionState,
    ready_started: bool,
}

pub struct Kernel {
    kernel_name: String,
    kernel_spec_name: String,
    kernel_type: KernelType,
    kernel_model: Option<KernelModel>,
    explicit_path: Option<String>,
    services: ServiceManager,
    reconnection: Arc<dyn ReconnectionStore>,
    store: Arc<StateStore>,
    init_code: Option<String>,
    execution_timeout: Option<Duration>,
    slot: RwLock<SessionSlot>,
    ready: watch::Sender<Option<Result<()>>>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<KernelEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Create the handle and start its session in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: KernelOptions) -> Arc<Self> {
        let (ready, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let kernel = Arc::new(Self {
            kernel_name: options.kernel_name,
            kernel_spec_name: options.kernel_spec_name,
            kernel_type: options.kernel_type,
            kernel_model: options.kernel_model,
            explicit_path: options.path,
            services: options.services,
            reconnection: options.reconnection,
            store: options.store,
            init_code: options.init_code,
            execution_timeout: options.execution_timeout,
            slot: RwLock::new(SessionSlot::default()),
            ready,
            shutdown,
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let starter = kernel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = starter.clone().start().await {
                log::error!(
                    "[kernel] Failed to start {} session: {}",
                    starter.kernel_spec_name,
                    e
                );
                starter.settle_ready(Err(e));
                starter.update_state(|state| state.connection_status = ConnectionStatus::Disconnected);
            }
        });
        kernel.track(handle);
        kernel
    }

    /// Keep `handle` for `shutdown` to abort. Once shut down, tracked tasks
    /// are aborted immediately.
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(handle);
        if self.is_shut_down() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        self.services.ready().await?;

        let options = match &self.kernel_model {
            Some(model) => {
                self.services.kernels.refresh_running().await?;
                let existing = self
                    .services
                    .kernels
                    .running()
                    .into_iter()
                    .find(|running| running.id == model.id)
                    .ok_or_else(|| {
                        KernelSessionError::NotFound(format!("running kernel {}", model.id))
                    })?;
                log::info!(
                    "[kernel] Creating a session to existing kernel {} ({})",
                    existing.id,
                    existing.name
                );
                SessionOptions {
                    name: existing.name.clone(),
                    path: format!("kernel-{}", existing.id),
                    kernel_type: KernelType::Notebook,
                    kernel: KernelSelector::Existing(existing),
                }
            }
            None => SessionOptions {
                name: self.kernel_name.clone(),
                path: self.session_path(),
                kernel_type: self.kernel_type,
                kernel: KernelSelector::New {
                    spec_name: self.kernel_spec_name.clone(),
                },
            },
        };

        let session = self.services.sessions.start_new(options).await?;
        let connection = session.kernel.clone();

        // Subscribe before reading the current status so no change is lost.
        let connection_rx = connection.subscribe_connection_status();
        let status_rx = connection.subscribe_status();
        let installed = {
            // `shutdown` raises its flag before taking the slot, so checking
            // under the write lock either installs a connection it will take
            // or sees the flag.
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if self.is_shut_down() {
                false
            } else {
                slot.connection = Some(connection.clone());
                slot.id = connection.id();
                slot.session_id = session.model.id.clone();
                slot.path = session.model.path.clone();
                true
            }
        };
        if !installed {
            log::info!(
                "[kernel] Shut down while starting, releasing kernel {}",
                connection.id()
            );
            connection.dispose();
            return Err(KernelSessionError::KernelShutdown);
        }
        log::info!(
            "[kernel] Session {} started for kernel {} at {}",
            session.model.id,
            connection.id(),
            session.model.path
        );

        let watcher = tokio::spawn(watch_connection(
            Arc::downgrade(&self),
            connection.clone(),
            connection_rx,
            status_rx,
        ));
        self.track(watcher);
        if self.is_shut_down() {
            return Err(KernelSessionError::KernelShutdown);
        }

        self.on_execution_status(connection.status());
        self.on_connection_status(&connection, connection.connection_status());
        Ok(())
    }

    /// Explicit path, else the remembered one, else a fresh path that is
    /// remembered for next time.
    fn session_path(&self) -> String {
        if let Some(path) = &self.explicit_path {
            return path.clone();
        }
        let key = reconnection_key(&self.kernel_spec_name);
        if let Some(path) = self.reconnection.get(&key) {
            return path;
        }
        let path = format!("path-{}", Uuid::new_v4());
        if let Err(e) = self.reconnection.set(&key, &path) {
            log::warn!("[kernel] Could not remember session path: {}", e);
        }
        path
    }

    fn on_connection_status(self: &Arc<Self>, connection: &Arc<dyn KernelConnection>, status: ConnectionStatus) {
        if self.is_shut_down() {
            return;
        }
        let start_ready = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if status == ConnectionStatus::Connected {
                // A restart may hand out a new client id.
                slot.client_id = connection.client_id();
                slot.id = connection.id();
            }
            let first = status == ConnectionStatus::Connected && !slot.ready_started;
            if first {
                slot.ready_started = true;
            }
            first
        };
        self.update_state(|state| state.connection_status = status);

        if start_ready {
            let kernel = self.clone();
            let connection = connection.clone();
            let handle = tokio::spawn(async move { kernel.become_ready(connection).await });
            self.track(handle);
        }
    }

    fn on_execution_status(&self, status: ExecutionStatus) {
        let previous = self.connection_state().execution_status;
        self.update_state(|state| state.execution_status = status);
        if status.is_restarting() && !previous.is_restarting() {
            log::info!("[kernel] Kernel {} is restarting", self.kernel_spec_name);
            let _ = self.events.send(KernelEvent::Restarted);
        }
    }

    async fn become_ready(&self, connection: Arc<dyn KernelConnection>) {
        if let Some(code) = self.init_code.as_deref().filter(|c| !c.trim().is_empty()) {
            let executor = KernelExecutor::spawn(
                connection.clone(),
                code,
                ExecuteOptions {
                    store_history: false,
                    ..ExecuteOptions::default()
                },
                self.executor_context(),
            );
            match executor.done().await {
                Ok(_) => log::debug!("[kernel] Init code ran"),
                Err(e) => log::warn!("[kernel] Init code failed: {}", e.report()),
            }
        }

        if self.settle_ready(Ok(())) {
            let _ = self.events.send(KernelEvent::Ready);
            log::info!("[kernel] Kernel ready: {}", self);
        }
    }

    /// Resolve the ready signal once. Returns whether this call resolved it.
    fn settle_ready(&self, result: Result<()>) -> bool {
        self.ready.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        })
    }

    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        let (before, after, id) = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            let before = slot.state;
            f(&mut slot.state);
            if self.is_shut_down() {
                slot.state.connection_status = ConnectionStatus::Disconnected;
            }
            (before, slot.state, slot.id.clone())
        };
        if before != after {
            log::debug!("[kernel] {} -> {}", before.display_state(), after.display_state());
            if !id.is_empty() {
                self.store.set_kernel_state(&id, after);
            }
            let _ = self.events.send(KernelEvent::StateChanged(after));
        }
    }

    fn executor_context(&self) -> ExecutorContext {
        ExecutorContext {
            store: self.store.clone(),
            timeout: self.execution_timeout,
            shutdown: self.shutdown.subscribe(),
        }
    }

    /// Wait until the kernel is usable. Resolves once; later calls return
    /// the same result immediately.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(KernelSessionError::KernelShutdown))
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.ready.borrow(), Some(Ok(())))
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Start executing `code`.
    ///
    /// Returns `None` unless the kernel is ready, connected and not shut down.
    pub fn execute(&self, code: &str, options: ExecuteOptions) -> Option<KernelExecutor> {
        if !self.is_ready() || self.is_shut_down() {
            return None;
        }
        let connection = self.connection()?;
        if connection.connection_status() != ConnectionStatus::Connected || connection.is_disposed() {
            return None;
        }
        Some(KernelExecutor::spawn(
            connection,
            code,
            options,
            self.executor_context(),
        ))
    }

    fn live_connection(&self) -> Result<Arc<dyn KernelConnection>> {
        if self.is_shut_down() {
            return Err(KernelSessionError::KernelShutdown);
        }
        self.connection().ok_or(KernelSessionError::NotReady)
    }

    /// Ask the kernel to interrupt. Pending executions still wait for their
    /// reply or timeout.
    pub async fn interrupt(&self) -> Result<()> {
        self.live_connection()?.interrupt().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.live_connection()?.restart().await
    }

    /// Shut the kernel down and release the connection.
    ///
    /// Idempotent: later calls return `Ok` without doing anything.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        log::info!("[kernel] Shutting down {}", self.kernel_spec_name);
        self.settle_ready(Err(KernelSessionError::KernelShutdown));

        let connection = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connection
            .take();

        let result = match connection {
            Some(connection) => {
                let result = connection.shutdown().await;
                connection.dispose();
                result
            }
            None => Ok(()),
        };

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.update_state(|state| state.connection_status = ConnectionStatus::Disconnected);

        if let Err(e) = &result {
            log::warn!("[kernel] Kernel shutdown request failed: {}", e);
        }
        result
    }

    /// Kernel info, fetched once and cached.
    pub async fn info(&self) -> Result<KernelInfo> {
        if let Some(info) = self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .info
            .clone()
        {
            return Ok(info);
        }
        let info = self.live_connection()?.info().await?;
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .info = Some(info.clone());
        Ok(info)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> Option<Arc<dyn KernelConnection>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connection
            .clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn display_state(&self) -> String {
        self.connection_state().display_state()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn kernel_spec_name(&self) -> &str {
        &self.kernel_spec_name
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn kernel_type(&self) -> KernelType {
        self.kernel_type
    }

    pub fn reconnection_key(&self) -> String {
        reconnection_key(&self.kernel_spec_name)
    }

    fn identity_field(&self, f: impl FnOnce(&SessionSlot) -> String) -> Option<String> {
        if !self.is_ready() {
            return None;
        }
        Some(f(&self.slot.read().unwrap_or_else(PoisonError::into_inner)))
    }

    pub fn id(&self) -> Option<String> {
        self.identity_field(|s| s.id.clone())
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity_field(|s| s.client_id.clone())
    }

    pub fn session_id(&self) -> Option<String> {
        self.identity_field(|s| s.session_id.clone())
    }

    pub fn path(&self) -> Option<String> {
        self.identity_field(|s| s.path.clone())
    }

    pub fn identity(&self) -> Option<KernelIdentity> {
        if !self.is_ready() {
            return None;
        }
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        Some(KernelIdentity {
            id: slot.id.clone(),
            client_id: slot.client_id.clone(),
            session_id: slot.session_id.clone(),
            path: slot.path.clone(),
            kernel_spec_name: self.kernel_spec_name.clone(),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        json!({
            "path": slot.path,
            "id": slot.id,
            "client_id": slot.client_id,
            "session_id": slot.session_id,
            "kernel_spec_name": self.kernel_spec_name,
            "kernel_info": slot.info,
        })
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        write!(
            f,
            "id:{} - client_id:{} - session_id:{} - path:{}",
            slot.id, slot.client_id, slot.session_id, slot.path
        )
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("kernel_spec_name", &self.kernel_spec_name)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if let Some(connection) = self
            .slot
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .connection
            .take()
        {
            connection.dispose();
        }
    }
}

async fn watch_connection(
    kernel: Weak<Kernel>,
    connection: Arc<dyn KernelConnection>,
    mut connection_rx: broadcast::Receiver<ConnectionStatus>,
    mut status_rx: broadcast::Receiver<ExecutionStatus>,
) {
    use broadcast::error::RecvError;

    loop {
        tokio::select! {
            biased;
            received = connection_rx.recv() => {
                let status = match received {
                    Ok(status) => status,
                    Err(RecvError::Lagged(_)) => connection.connection_status(),
                    Err(RecvError::Closed) => break,
                };
                let Some(kernel) = kernel.upgrade() else { break };
                kernel.on_connection_status(&connection, status);
            }
            received = status_rx.recv() => {
                let status = match received {
                    Ok(status) => status,
                    Err(RecvError::Lagged(_)) => connection.status(),
                    Err(RecvError::Closed) => break,
                };
                let Some(kernel) = kernel.upgrade() else { break };
                kernel.on_execution_status(status);
            }
        }
    }
    log::debug!("[kernel] Stopped watching kernel {}", connection.id());
}
