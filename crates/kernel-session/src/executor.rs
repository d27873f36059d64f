//! Execution coordinator: one execute request and everything it produces.
//!
//! A `KernelExecutor` subscribes to the kernel's message stream, sends an
//! `execute_request`, then routes messages whose parent is that request into
//! its `OutputAccumulator` until both the matching `execute_reply` and the
//! kernel's `idle` status for the request have arrived. The outcome is
//! published once, together with a terminal `ExecutionPhase`.
//!
//! Settling happens on the first of:
//! - the reply (success, error or aborted)
//! - the timeout guard
//! - the owning kernel handle shutting down
//! - the message stream closing or dropping messages

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::error::{KernelSessionError, Result};
use crate::message::{Channel, KernelMessage, MessageContent, ReplyStatus};
use crate::outputs::{OutputAccumulator, OutputRecord};
use crate::phase::{ExecutionPhase, PhaseTracker};
use crate::service::{ExecutionRequest, KernelConnection};
use crate::store::StateStore;

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Inspects a message before the executor handles it. For iopub messages,
/// returning `false` stops processing of that message: later hooks and the
/// executor's own handling are skipped. Shell hooks only observe; their
/// return value is ignored so the reply always settles the execution.
pub type MessageHook = Arc<dyn Fn(&KernelMessage) -> bool + Send + Sync>;

/// Per-call execution options.
#[derive(Clone)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub stop_on_error: bool,
    pub store_history: bool,
    /// Input requests are not answered; kept for the request payload only.
    pub allow_stdin: bool,
    /// Resolve `done()` with `Ok` even when the kernel reports an error.
    pub suppress_code_execution_errors: bool,
    /// Key under which the request and outputs are published to the store.
    pub source_id: Option<String>,
    /// Overrides the kernel's execution timeout.
    pub timeout: Option<Duration>,
    /// Settle only after both the reply and the `idle` status for this
    /// request. When false, the reply alone settles and later iopub output
    /// is dropped.
    pub wait_for_idle: bool,
    pub iopub_hooks: Vec<MessageHook>,
    pub shell_hooks: Vec<MessageHook>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            stop_on_error: true,
            store_history: true,
            allow_stdin: false,
            suppress_code_execution_errors: false,
            source_id: None,
            timeout: None,
            wait_for_idle: true,
            iopub_hooks: Vec::new(),
            shell_hooks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("silent", &self.silent)
            .field("stop_on_error", &self.stop_on_error)
            .field("store_history", &self.store_history)
            .field("allow_stdin", &self.allow_stdin)
            .field(
                "suppress_code_execution_errors",
                &self.suppress_code_execution_errors,
            )
            .field("source_id", &self.source_id)
            .field("timeout", &self.timeout)
            .field("wait_for_idle", &self.wait_for_idle)
            .field("iopub_hooks", &self.iopub_hooks.len())
            .field("shell_hooks", &self.shell_hooks.len())
            .finish()
    }
}

impl ExecuteOptions {
    fn to_request(&self, code: &str) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            silent: self.silent,
            store_history: self.store_history,
            allow_stdin: self.allow_stdin,
            stop_on_error: self.stop_on_error,
        }
    }
}

/// Settled result of an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub phase: ExecutionPhase,
    pub execution_count: Option<i64>,
    /// The kernel-reported error, kept here when errors are suppressed.
    pub error: Option<KernelSessionError>,
}

/// What the owning kernel handle hands to each executor.
#[derive(Clone)]
pub(crate) struct ExecutorContext {
    pub store: Arc<StateStore>,
    pub timeout: Option<Duration>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Reply {
    status: ReplyStatus,
    execution_count: Option<i64>,
    ename: Option<String>,
    evalue: Option<String>,
    traceback: Vec<String>,
}

#[derive(Default)]
struct Hooks {
    iopub: Vec<MessageHook>,
    shell: Vec<MessageHook>,
}

struct Inner {
    code: String,
    kernel_id: String,
    source_id: Option<String>,
    suppress_errors: bool,
    outputs: OutputAccumulator,
    phase: PhaseTracker,
    msg_id: OnceLock<String>,
    hooks: Mutex<Hooks>,
    store: Arc<StateStore>,
    settled: watch::Sender<Option<Result<ExecutionOutcome>>>,
}

/// Handle to one execution. Cheap to clone; all clones observe the same run.
#[derive(Clone)]
pub struct KernelExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KernelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelExecutor")
            .field("kernel_id", &self.inner.kernel_id)
            .field("msg_id", &self.inner.msg_id.get())
            .field("phase", &self.inner.phase.phase())
            .finish()
    }
}

impl KernelExecutor {
    /// Start executing `code` on `connection` in a background task.
    pub(crate) fn spawn(
        connection: Arc<dyn KernelConnection>,
        code: &str,
        options: ExecuteOptions,
        context: ExecutorContext,
    ) -> Self {
        let (settled, _rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            code: code.to_string(),
            kernel_id: connection.id(),
            source_id: options.source_id.clone(),
            suppress_errors: options.suppress_code_execution_errors,
            outputs: OutputAccumulator::new(),
            phase: PhaseTracker::new(),
            msg_id: OnceLock::new(),
            hooks: Mutex::new(Hooks {
                iopub: options.iopub_hooks.clone(),
                shell: options.shell_hooks.clone(),
            }),
            store: context.store.clone(),
            settled,
        });

        if let Some(source_id) = &inner.source_id {
            inner.store.set_execute_request(source_id, code);
            inner.store.clear_outputs(source_id);
        }
        inner
            .store
            .set_execution_phase(&inner.kernel_id, ExecutionPhase::Running);

        // Subscribe before the request goes out so no reply can be missed.
        let messages = connection.subscribe_messages();
        let request = options.to_request(code);
        let timeout = options.timeout.or(context.timeout);

        tokio::spawn(run(
            inner.clone(),
            connection,
            request,
            messages,
            timeout,
            options.wait_for_idle,
            context.shutdown,
        ));

        Self { inner }
    }

    pub fn code(&self) -> &str {
        &self.inner.code
    }

    /// `msg_id` of the execute request, once sent.
    pub fn msg_id(&self) -> Option<String> {
        self.inner.msg_id.get().cloned()
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.inner.phase.phase()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ExecutionPhase> {
        self.inner.phase.subscribe()
    }

    pub fn outputs(&self) -> Vec<OutputRecord> {
        self.inner.outputs.snapshot()
    }

    pub fn accumulator(&self) -> &OutputAccumulator {
        &self.inner.outputs
    }

    /// Change counter of the outputs; bumped on every accumulator change.
    pub fn subscribe_outputs(&self) -> watch::Receiver<u64> {
        self.inner.outputs.subscribe()
    }

    /// Wait for the execution to settle. Can be awaited any number of times.
    ///
    /// Kernel-reported errors resolve `Err(Execution)` unless
    /// `suppress_code_execution_errors` was set, in which case they are
    /// carried on the outcome. Timeouts and shutdown are always errors.
    pub async fn done(&self) -> Result<ExecutionOutcome> {
        let mut rx = self.inner.settled.subscribe();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(KernelSessionError::KernelShutdown))
    }

    /// Plain-text rendering of the outputs once settled.
    pub async fn result(&self) -> Result<String> {
        self.done().await?;
        Ok(self.inner.outputs.text())
    }

    /// Drop hooks and previous outputs.
    pub fn clear(&self) {
        {
            let mut hooks = self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            hooks.iopub.clear();
            hooks.shell.clear();
        }
        self.inner.outputs.clear();
        self.inner.publish_outputs();
    }
}

async fn run(
    inner: Arc<Inner>,
    connection: Arc<dyn KernelConnection>,
    request: ExecutionRequest,
    mut messages: broadcast::Receiver<KernelMessage>,
    timeout: Option<Duration>,
    wait_for_idle: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let execution = async {
        let msg_id = connection.request_execute(request).await?;
        log::debug!(
            "[executor] Sent execute_request {} to kernel {}",
            msg_id,
            inner.kernel_id
        );
        let _ = inner.msg_id.set(msg_id.clone());
        inner.pump(&mut messages, &msg_id, wait_for_idle).await
    };

    let guarded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => Err(KernelSessionError::Timeout(limit)),
            },
            None => execution.await,
        }
    };

    let result = tokio::select! {
        result = guarded => result,
        _ = async {
            // A dropped handle counts as shut down.
            let _ = shutdown.wait_for(|down| *down).await;
        } => Err(KernelSessionError::KernelShutdown),
    };

    inner.complete(result);
}

impl Inner {
    async fn pump(
        &self,
        messages: &mut broadcast::Receiver<KernelMessage>,
        msg_id: &str,
        wait_for_idle: bool,
    ) -> Result<Reply> {
        let mut reply = None;
        let mut idle = false;

        loop {
            let message = match messages.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "[executor] Missed {} messages for request {}",
                        skipped,
                        msg_id
                    );
                    return Err(KernelSessionError::Transport(format!(
                        "missed {} kernel messages for request {}",
                        skipped, msg_id
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(KernelSessionError::Transport(
                        "kernel message stream closed".to_string(),
                    ));
                }
            };

            if !message.is_child_of(msg_id) || !self.run_hooks(&message) {
                continue;
            }

            match message.channel {
                Channel::Iopub => {
                    if let MessageContent::Status { execution_state } = &message.content {
                        self.store
                            .set_execution_status(&self.kernel_id, *execution_state);
                        if *execution_state == crate::status::ExecutionStatus::Idle {
                            idle = true;
                        }
                    } else {
                        self.handle_iopub(&message);
                    }
                }
                Channel::Shell => {
                    if let Some(r) = self.handle_reply(&message) {
                        reply = Some(r);
                    }
                }
            }

            if reply.is_some() && (!wait_for_idle || idle) {
                break;
            }
        }

        reply.ok_or_else(|| KernelSessionError::Transport("no execute_reply".to_string()))
    }

    fn run_hooks(&self, message: &KernelMessage) -> bool {
        let hooks = {
            let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            match message.channel {
                Channel::Iopub => hooks.iopub.clone(),
                Channel::Shell => hooks.shell.clone(),
            }
        };
        match message.channel {
            Channel::Iopub => hooks.iter().all(|hook| hook(message)),
            Channel::Shell => {
                for hook in &hooks {
                    hook(message);
                }
                true
            }
        }
    }

    fn handle_iopub(&self, message: &KernelMessage) {
        match &message.content {
            MessageContent::ClearOutput { wait: true } => {
                self.outputs.clear_wait();
            }
            MessageContent::ClearOutput { wait: false } => {
                self.outputs.clear();
                self.publish_outputs();
            }
            content => match OutputRecord::from_content(content) {
                Some(record) => {
                    log::debug!("[executor] {} for {:?}", message.msg_type, self.msg_id.get());
                    self.outputs.append(record);
                    self.publish_outputs();
                }
                None => {
                    log::debug!("[executor] Ignoring iopub {}", message.msg_type);
                }
            },
        }
    }

    fn handle_reply(&self, message: &KernelMessage) -> Option<Reply> {
        let MessageContent::ExecuteReply {
            status,
            execution_count,
            pages,
            ename,
            evalue,
            traceback,
        } = &message.content
        else {
            log::debug!("[executor] Ignoring shell {}", message.msg_type);
            return None;
        };

        // Pager payloads (IPython `?`) are shown as display_data.
        if !pages.is_empty() {
            for page in pages {
                self.outputs.append(OutputRecord::display_data(page.clone()));
            }
            self.publish_outputs();
        }

        Some(Reply {
            status: *status,
            execution_count: *execution_count,
            ename: ename.clone(),
            evalue: evalue.clone(),
            traceback: traceback.clone(),
        })
    }

    fn last_error_record(&self) -> Option<KernelSessionError> {
        self.outputs.snapshot().into_iter().rev().find_map(|r| match r {
            OutputRecord::Error {
                ename,
                evalue,
                traceback,
            } => Some(KernelSessionError::execution(ename, evalue, traceback)),
            _ => None,
        })
    }

    fn reply_error(&self, reply: &Reply) -> KernelSessionError {
        if reply.status == ReplyStatus::Aborted {
            return KernelSessionError::execution(
                "ExecutionAborted",
                "Execution aborted",
                Vec::new(),
            );
        }
        self.last_error_record().unwrap_or_else(|| {
            KernelSessionError::execution(
                reply.ename.clone().unwrap_or_else(|| "Error".to_string()),
                reply.evalue.clone().unwrap_or_default(),
                reply.traceback.clone(),
            )
        })
    }

    fn complete(&self, result: Result<Reply>) {
        let (phase, settled) = match result {
            Ok(reply) if reply.status == ReplyStatus::Ok => {
                let phase = if self.outputs.has_stderr() {
                    ExecutionPhase::CompletedWithWarning
                } else {
                    ExecutionPhase::Completed
                };
                let outcome = ExecutionOutcome {
                    phase,
                    execution_count: reply.execution_count,
                    error: None,
                };
                (phase, Ok(outcome))
            }
            Ok(reply) => {
                let error = self.reply_error(&reply);
                if !self.outputs.has_error() {
                    if let KernelSessionError::Execution {
                        ename,
                        evalue,
                        traceback,
                    } = &error
                    {
                        self.outputs.append(OutputRecord::Error {
                            ename: ename.clone(),
                            evalue: evalue.clone(),
                            traceback: traceback.clone(),
                        });
                        self.publish_outputs();
                    }
                }
                log::info!("[executor] Execution failed: {}", error);
                let phase = ExecutionPhase::CompletedWithError;
                let settled = if self.suppress_errors {
                    Ok(ExecutionOutcome {
                        phase,
                        execution_count: reply.execution_count,
                        error: Some(error),
                    })
                } else {
                    Err(error)
                };
                (phase, settled)
            }
            Err(error) => {
                log::warn!(
                    "[executor] Execution on kernel {} ended: {}",
                    self.kernel_id,
                    error
                );
                (ExecutionPhase::CompletedWithError, Err(error))
            }
        };

        {
            let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            hooks.iopub.clear();
            hooks.shell.clear();
        }

        if self.phase.finish(phase) {
            self.store.set_execution_phase(&self.kernel_id, phase);
        }
        self.publish_outputs();
        self.settled.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(settled);
            true
        });
    }

    fn publish_outputs(&self) {
        if let Some(source_id) = &self.source_id {
            self.store.set_outputs(source_id, self.outputs.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamName;
    use crate::mock::{MockKernelConnection, Scripted};
    use crate::status::ExecutionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(store: Arc<StateStore>) -> (ExecutorContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            ExecutorContext {
                store,
                timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
                shutdown: rx,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn test_execute_result_completes() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| {
            vec![
                Scripted::status(ExecutionStatus::Busy),
                Scripted::execute_result("2"),
                Scripted::reply_ok(),
                Scripted::status(ExecutionStatus::Idle),
            ]
        });
        let store = Arc::new(StateStore::new());
        let (context, _shutdown) = context(store.clone());

        let executor = KernelExecutor::spawn(
            connection.clone(),
            "1+1",
            ExecuteOptions::default(),
            context,
        );
        let outcome = executor.done().await.unwrap();

        assert_eq!(outcome.phase, ExecutionPhase::Completed);
        assert_eq!(executor.result().await.unwrap(), "2");
        assert_eq!(
            store.select_execution_phase(&connection.id()),
            Some(ExecutionPhase::Completed)
        );
        assert_eq!(connection.requests()[0].code, "1+1");
    }

    #[tokio::test]
    async fn test_stderr_completes_with_warning() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| {
            vec![
                Scripted::stream(StreamName::Stderr, "DeprecationWarning\n"),
                Scripted::reply_ok(),
            ]
        });
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let executor =
            KernelExecutor::spawn(connection, "warn()", ExecuteOptions::default(), context);
        let outcome = executor.done().await.unwrap();
        assert_eq!(outcome.phase, ExecutionPhase::CompletedWithWarning);
    }

    #[tokio::test]
    async fn test_error_reply_without_error_output_synthesizes_record() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| vec![Scripted::reply_error("NameError", "x", vec![])]);
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let executor = KernelExecutor::spawn(connection, "x", ExecuteOptions::default(), context);
        let err = executor.done().await.unwrap_err();

        assert_eq!(err, KernelSessionError::execution("NameError", "x", vec![]));
        assert_eq!(executor.outputs().len(), 1);
        assert_eq!(executor.outputs()[0].output_type(), "error");
        assert_eq!(executor.phase(), ExecutionPhase::CompletedWithError);
    }

    #[tokio::test]
    async fn test_aborted_reply() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| vec![Scripted::reply(ReplyStatus::Aborted)]);
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let executor = KernelExecutor::spawn(connection, "x", ExecuteOptions::default(), context);
        match executor.done().await {
            Err(KernelSessionError::Execution { ename, .. }) => {
                assert_eq!(ename, "ExecutionAborted")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_settles_with_error_phase() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| vec![Scripted::status(ExecutionStatus::Busy)]);
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let options = ExecuteOptions {
            timeout: Some(Duration::from_millis(50)),
            ..ExecuteOptions::default()
        };
        let executor = KernelExecutor::spawn(connection, "while True: pass", options, context);

        assert_eq!(
            executor.done().await,
            Err(KernelSessionError::Timeout(Duration::from_millis(50)))
        );
        assert_eq!(executor.phase(), ExecutionPhase::CompletedWithError);
    }

    #[tokio::test]
    async fn test_shutdown_settles_pending_execution() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| Vec::new());
        let (mut context, shutdown) = context(Arc::new(StateStore::new()));
        context.timeout = None;

        let executor = KernelExecutor::spawn(connection, "sleep()", ExecuteOptions::default(), context);
        tokio::task::yield_now().await;
        shutdown.send(true).unwrap();

        assert_eq!(executor.done().await, Err(KernelSessionError::KernelShutdown));
        assert_eq!(executor.phase(), ExecutionPhase::CompletedWithError);
    }

    #[tokio::test]
    async fn test_hook_returning_false_skips_message() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| {
            vec![
                Scripted::stream(StreamName::Stdout, "hidden"),
                Scripted::stream(StreamName::Stdout, "shown"),
                Scripted::reply_ok(),
            ]
        });
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let seen = Arc::new(AtomicUsize::new(0));
        let hook: MessageHook = {
            let seen = seen.clone();
            Arc::new(move |message: &KernelMessage| match &message.content {
                MessageContent::Stream { text, .. } => {
                    seen.fetch_add(1, Ordering::SeqCst);
                    text != "hidden"
                }
                _ => true,
            })
        };
        let options = ExecuteOptions {
            iopub_hooks: vec![hook],
            ..ExecuteOptions::default()
        };

        let executor = KernelExecutor::spawn(connection, "print()", options, context);
        executor.done().await.unwrap();

        assert_eq!(executor.result().await.unwrap(), "shown");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_output_wait_and_page_payload() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| {
            vec![
                Scripted::stream(StreamName::Stdout, "old"),
                Scripted::clear_output(true),
                Scripted::stream(StreamName::Stdout, "new"),
                Scripted::reply_with_page("Docstring"),
            ]
        });
        let store = Arc::new(StateStore::new());
        let (context, _shutdown) = context(store.clone());

        let options = ExecuteOptions {
            source_id: Some("cell-1".to_string()),
            ..ExecuteOptions::default()
        };
        let executor = KernelExecutor::spawn(connection, "len?", options, context);
        executor.done().await.unwrap();

        let records = executor.outputs();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].output_type(), "display_data");
        assert_eq!(executor.result().await.unwrap(), "new\nDocstring");
        assert_eq!(store.select_outputs("cell-1"), Some(records));
        assert_eq!(store.select_execute("cell-1").as_deref(), Some("len?"));
    }

    #[tokio::test]
    async fn test_output_after_reply_is_collected_by_default() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| {
            vec![
                Scripted::status(ExecutionStatus::Busy),
                Scripted::reply_ok(),
                Scripted::execute_result("2"),
                Scripted::status(ExecutionStatus::Idle),
            ]
        });
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let executor =
            KernelExecutor::spawn(connection, "1+1", ExecuteOptions::default(), context);
        let outcome = executor.done().await.unwrap();

        assert_eq!(outcome.phase, ExecutionPhase::Completed);
        assert_eq!(executor.outputs().len(), 1);
        assert_eq!(executor.result().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_reply_only_settles_before_idle() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| {
            vec![
                Scripted::reply_ok(),
                Scripted::delay(10_000),
                Scripted::status(ExecutionStatus::Idle),
            ]
        });
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let options = ExecuteOptions {
            wait_for_idle: false,
            timeout: Some(Duration::from_secs(5)),
            ..ExecuteOptions::default()
        };
        let executor = KernelExecutor::spawn(connection, "pass", options, context);
        let outcome = executor.done().await.unwrap();
        assert_eq!(outcome.phase, ExecutionPhase::Completed);
    }

    #[tokio::test]
    async fn test_shell_hook_cannot_hold_back_reply() {
        let connection = MockKernelConnection::connected("python3");
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let replies = Arc::new(AtomicUsize::new(0));
        let hook: MessageHook = {
            let replies = replies.clone();
            Arc::new(move |_: &KernelMessage| {
                replies.fetch_add(1, Ordering::SeqCst);
                false
            })
        };
        let options = ExecuteOptions {
            shell_hooks: vec![hook],
            timeout: Some(Duration::from_millis(500)),
            ..ExecuteOptions::default()
        };
        let executor = KernelExecutor::spawn(connection, "pass", options, context);

        let outcome = executor.done().await.unwrap();
        assert_eq!(outcome.phase, ExecutionPhase::Completed);
        assert_eq!(replies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_messages_settle_with_transport_error() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| Vec::new());
        let (mut context, _shutdown) = context(Arc::new(StateStore::new()));
        context.timeout = None;

        let executor =
            KernelExecutor::spawn(connection.clone(), "noisy()", ExecuteOptions::default(), context);
        let msg_id = loop {
            if let Some(msg_id) = executor.msg_id() {
                break msg_id;
            }
            tokio::task::yield_now().await;
        };
        tokio::task::yield_now().await;

        for i in 0..3000 {
            let content = MessageContent::Stream {
                name: StreamName::Stdout,
                text: format!("{}\n", i),
            };
            connection.emit(KernelMessage::new(Channel::Iopub, "stream", content).child_of(&msg_id));
        }

        assert!(matches!(
            executor.done().await,
            Err(KernelSessionError::Transport(_))
        ));
        assert_eq!(executor.phase(), ExecutionPhase::CompletedWithError);
    }

    #[tokio::test]
    async fn test_done_can_be_awaited_concurrently() {
        let connection = MockKernelConnection::connected("python3");
        connection.respond_with(|_| vec![Scripted::delay(20), Scripted::reply_ok()]);
        let (context, _shutdown) = context(Arc::new(StateStore::new()));

        let executor = KernelExecutor::spawn(connection, "pass", ExecuteOptions::default(), context);
        let other = executor.clone();
        let (a, b) = tokio::join!(executor.done(), other.done());
        assert_eq!(a, b);
        assert!(a.is_ok());
    }
}
