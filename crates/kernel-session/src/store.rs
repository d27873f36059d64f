//! Keyed read models shared between executions and their observers.
//!
//! Three maps live in a `StateStore`:
//! - sessions keyed by `source_id` (source text, execute request, grade,
//!   dataset)
//! - kernels keyed by kernel id (connection state, last execution phase)
//! - outputs keyed by `source_id` (snapshot of the latest execution's records)
//!
//! Entries are created lazily on first write and updated field by field with
//! last-write-wins semantics. Nothing is evicted unless `evict` is called.
//! Every write is announced on a broadcast channel; late subscribers do not
//! see earlier events and should read the current value with a selector.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::outputs::OutputRecord;
use crate::phase::ExecutionPhase;
use crate::status::{ConnectionState, ConnectionStatus, ExecutionStatus};

const EVENT_CAPACITY: usize = 256;

/// Outcome of grading an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grade {
    pub success: bool,
    pub message: String,
}

/// Per-source session fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub source: Option<String>,
    pub execute: Option<String>,
    pub grade: Option<Grade>,
    pub dataset: Option<Value>,
}

/// Per-kernel read model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelState {
    pub connection_status: ConnectionStatus,
    pub execution_status: ExecutionStatus,
    /// Phase of the most recent execution on this kernel.
    pub execution_phase: Option<ExecutionPhase>,
}

impl KernelState {
    pub fn display_state(&self) -> String {
        crate::status::display_state(self.connection_status, self.execution_status)
    }
}

/// Change notification. Carries the key only; read the value with a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Session { source_id: String },
    Kernel { kernel_id: String },
    Outputs { source_id: String },
    Evicted { source_id: String },
}

pub struct StateStore {
    sessions: RwLock<HashMap<String, SessionState>>,
    kernels: RwLock<HashMap<String, KernelState>>,
    outputs: RwLock<HashMap<String, Vec<OutputRecord>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            kernels: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn update_session(&self, source_id: &str, f: impl FnOnce(&mut SessionState)) {
        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            f(sessions.entry(source_id.to_string()).or_default());
        }
        self.emit(StoreEvent::Session {
            source_id: source_id.to_string(),
        });
    }

    fn read_session<T>(&self, source_id: &str, f: impl FnOnce(&SessionState) -> Option<T>) -> Option<T> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(source_id).and_then(f)
    }

    pub fn set_source(&self, source_id: &str, source: impl Into<String>) {
        let source = source.into();
        self.update_session(source_id, |s| s.source = Some(source));
    }

    pub fn set_execute_request(&self, source_id: &str, code: impl Into<String>) {
        let code = code.into();
        self.update_session(source_id, |s| s.execute = Some(code));
    }

    pub fn set_grade(&self, source_id: &str, grade: Grade) {
        self.update_session(source_id, |s| s.grade = Some(grade));
    }

    pub fn set_dataset(&self, source_id: &str, dataset: Value) {
        self.update_session(source_id, |s| s.dataset = Some(dataset));
    }

    pub fn select_source(&self, source_id: &str) -> Option<String> {
        self.read_session(source_id, |s| s.source.clone())
    }

    pub fn select_execute(&self, source_id: &str) -> Option<String> {
        self.read_session(source_id, |s| s.execute.clone())
    }

    pub fn select_grade(&self, source_id: &str) -> Option<Grade> {
        self.read_session(source_id, |s| s.grade.clone())
    }

    pub fn select_dataset(&self, source_id: &str) -> Option<Value> {
        self.read_session(source_id, |s| s.dataset.clone())
    }

    pub fn select_session(&self, source_id: &str) -> Option<SessionState> {
        self.read_session(source_id, |s| Some(s.clone()))
    }

    fn update_kernel(&self, kernel_id: &str, f: impl FnOnce(&mut KernelState)) {
        {
            let mut kernels = self.kernels.write().unwrap_or_else(PoisonError::into_inner);
            f(kernels.entry(kernel_id.to_string()).or_default());
        }
        self.emit(StoreEvent::Kernel {
            kernel_id: kernel_id.to_string(),
        });
    }

    pub fn set_kernel_state(&self, kernel_id: &str, state: ConnectionState) {
        self.update_kernel(kernel_id, |k| {
            k.connection_status = state.connection_status;
            k.execution_status = state.execution_status;
        });
    }

    pub fn set_execution_status(&self, kernel_id: &str, status: ExecutionStatus) {
        self.update_kernel(kernel_id, |k| k.execution_status = status);
    }

    pub fn select_kernel_state(&self, kernel_id: &str) -> Option<KernelState> {
        let kernels = self.kernels.read().unwrap_or_else(PoisonError::into_inner);
        kernels.get(kernel_id).copied()
    }

    pub fn set_execution_phase(&self, kernel_id: &str, phase: ExecutionPhase) {
        self.update_kernel(kernel_id, |k| k.execution_phase = Some(phase));
    }

    pub fn select_execution_phase(&self, kernel_id: &str) -> Option<ExecutionPhase> {
        self.select_kernel_state(kernel_id)
            .and_then(|k| k.execution_phase)
    }

    pub fn set_outputs(&self, source_id: &str, outputs: Vec<OutputRecord>) {
        {
            let mut map = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
            map.insert(source_id.to_string(), outputs);
        }
        self.emit(StoreEvent::Outputs {
            source_id: source_id.to_string(),
        });
    }

    pub fn select_outputs(&self, source_id: &str) -> Option<Vec<OutputRecord>> {
        let map = self.outputs.read().unwrap_or_else(PoisonError::into_inner);
        map.get(source_id).cloned()
    }

    pub fn clear_outputs(&self, source_id: &str) {
        self.set_outputs(source_id, Vec::new());
    }

    /// Drop the session and outputs entries for `source_id`.
    pub fn evict(&self, source_id: &str) -> bool {
        let removed_session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)
            .is_some();
        let removed_outputs = self
            .outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)
            .is_some();

        let removed = removed_session || removed_outputs;
        if removed {
            self.emit(StoreEvent::Evicted {
                source_id: source_id.to_string(),
            });
        }
        removed
    }
}
