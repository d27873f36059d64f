//! Ordered output records of one execution.
//!
//! An `OutputAccumulator` is written by exactly one execution coordinator and
//! read by any number of observers. Readers take snapshots (clones) and watch
//! a version counter that is bumped on every change.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::error::Result;
use crate::message::{MessageContent, MimeBundle, StreamName};

/// One output produced by an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        data: MimeBundle,
        metadata: MimeBundle,
        execution_count: Option<i64>,
    },
    DisplayData {
        data: MimeBundle,
        metadata: MimeBundle,
        /// Transient; not part of the document form.
        display_id: Option<String>,
    },
    UpdateDisplayData {
        data: MimeBundle,
        metadata: MimeBundle,
        display_id: String,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputRecord {
    pub fn output_type(&self) -> &'static str {
        match self {
            OutputRecord::Stream { .. } => "stream",
            OutputRecord::ExecuteResult { .. } => "execute_result",
            OutputRecord::DisplayData { .. } => "display_data",
            OutputRecord::UpdateDisplayData { .. } => "update_display_data",
            OutputRecord::Error { .. } => "error",
        }
    }

    pub fn display_data(data: MimeBundle) -> Self {
        OutputRecord::DisplayData {
            data,
            metadata: MimeBundle::new(),
            display_id: None,
        }
    }

    /// The output record carried by a message, if it carries one.
    pub fn from_content(content: &MessageContent) -> Option<Self> {
        let record = match content.clone() {
            MessageContent::Stream { name, text } => OutputRecord::Stream { name, text },
            MessageContent::ExecuteResult {
                data,
                metadata,
                execution_count,
            } => OutputRecord::ExecuteResult {
                data,
                metadata,
                execution_count,
            },
            MessageContent::DisplayData {
                data,
                metadata,
                display_id,
            } => OutputRecord::DisplayData {
                data,
                metadata,
                display_id,
            },
            MessageContent::UpdateDisplayData {
                data,
                metadata,
                display_id,
            } => OutputRecord::UpdateDisplayData {
                data,
                metadata,
                display_id,
            },
            MessageContent::Error {
                ename,
                evalue,
                traceback,
            } => OutputRecord::Error {
                ename,
                evalue,
                traceback,
            },
            _ => return None,
        };
        Some(record)
    }

    /// nbformat output JSON.
    pub fn to_json(&self) -> Value {
        match self {
            OutputRecord::Stream { name, text } => json!({
                "output_type": "stream",
                "name": name,
                "text": text
            }),
            OutputRecord::ExecuteResult {
                data,
                metadata,
                execution_count,
            } => json!({
                "output_type": "execute_result",
                "data": data,
                "metadata": metadata,
                "execution_count": execution_count
            }),
            // nbformat has no update_display_data output; it is stored as the
            // display it updates.
            OutputRecord::DisplayData { data, metadata, .. }
            | OutputRecord::UpdateDisplayData { data, metadata, .. } => json!({
                "output_type": "display_data",
                "data": data,
                "metadata": metadata
            }),
            OutputRecord::Error {
                ename,
                evalue,
                traceback,
            } => json!({
                "output_type": "error",
                "ename": ename,
                "evalue": evalue,
                "traceback": traceback
            }),
        }
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let output: NbOutput = serde_json::from_value(value)?;
        Ok(output.into())
    }

    fn plain_text(&self) -> Option<String> {
        match self {
            OutputRecord::Stream { text, .. } => Some(text.clone()),
            OutputRecord::ExecuteResult { data, .. }
            | OutputRecord::DisplayData { data, .. }
            | OutputRecord::UpdateDisplayData { data, .. } => {
                data.get("text/plain").map(multiline_value)
            }
            OutputRecord::Error { .. } => None,
        }
    }
}

/// nbformat stores multiline strings either whole or as a list of lines.
#[derive(Deserialize)]
#[serde(untagged)]
enum MultilineText {
    Whole(String),
    Lines(Vec<String>),
}

impl From<MultilineText> for String {
    fn from(text: MultilineText) -> Self {
        match text {
            MultilineText::Whole(s) => s,
            MultilineText::Lines(lines) => lines.concat(),
        }
    }
}

fn multiline_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().filter_map(|l| l.as_str()).collect(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
enum NbOutput {
    Stream {
        name: StreamName,
        text: MultilineText,
    },
    ExecuteResult {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
        #[serde(default)]
        execution_count: Option<i64>,
    },
    DisplayData {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl From<NbOutput> for OutputRecord {
    fn from(output: NbOutput) -> Self {
        match output {
            NbOutput::Stream { name, text } => OutputRecord::Stream {
                name,
                text: text.into(),
            },
            NbOutput::ExecuteResult {
                data,
                metadata,
                execution_count,
            } => OutputRecord::ExecuteResult {
                data,
                metadata,
                execution_count,
            },
            NbOutput::DisplayData { data, metadata } => OutputRecord::DisplayData {
                data,
                metadata,
                display_id: None,
            },
            NbOutput::Error {
                ename,
                evalue,
                traceback,
            } => OutputRecord::Error {
                ename,
                evalue,
                traceback,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    records: Vec<OutputRecord>,
    /// Set by `clear_output(wait=true)`; the next output clears first.
    pending_clear: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<Records>,
    version: watch::Sender<u64>,
}

/// Ordered, observable list of output records.
#[derive(Debug, Clone)]
pub struct OutputAccumulator {
    inner: Arc<Inner>,
}

impl Default for OutputAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputAccumulator {
    pub fn new() -> Self {
        let (version, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Records::default()),
                version,
            }),
        }
    }

    fn with_records<R>(&self, f: impl FnOnce(&mut Records) -> (bool, R)) -> R {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (changed, result) = f(&mut state);
        if changed {
            // Bumped while the lock is held so observers never see a version
            // without its records.
            self.inner.version.send_modify(|v| *v += 1);
        }
        result
    }

    /// Append a record in arrival order.
    ///
    /// An `UpdateDisplayData` record is routed to `replace_display_data`.
    pub fn append(&self, record: OutputRecord) {
        if let OutputRecord::UpdateDisplayData { display_id, .. } = &record {
            let display_id = display_id.clone();
            self.replace_display_data(&display_id, record);
            return;
        }
        self.with_records(|state| {
            if state.pending_clear {
                state.records.clear();
                state.pending_clear = false;
            }
            state.records.push(record);
            (true, ())
        });
    }

    /// Overwrite the most recent `DisplayData` with `display_id` in place.
    ///
    /// Returns false, and leaves the records untouched, when no display has
    /// that id.
    pub fn replace_display_data(&self, display_id: &str, record: OutputRecord) -> bool {
        let (data, metadata) = match record {
            OutputRecord::DisplayData { data, metadata, .. }
            | OutputRecord::UpdateDisplayData { data, metadata, .. }
            | OutputRecord::ExecuteResult { data, metadata, .. } => (data, metadata),
            other => {
                log::warn!(
                    "[outputs] Cannot update display {} with {} output",
                    display_id,
                    other.output_type()
                );
                return false;
            }
        };

        let replaced = self.with_records(|state| {
            let target = state.records.iter_mut().rev().find(|r| {
                matches!(r, OutputRecord::DisplayData { display_id: Some(id), .. } if id == display_id)
            });
            match target {
                Some(target) => {
                    *target = OutputRecord::DisplayData {
                        data,
                        metadata,
                        display_id: Some(display_id.to_string()),
                    };
                    (true, true)
                }
                None => (false, false),
            }
        });

        if !replaced {
            log::warn!(
                "[outputs] No display_data with display_id {} to update",
                display_id
            );
        }
        replaced
    }

    /// Remove all records. Observers are notified before this returns.
    pub fn clear(&self) {
        self.with_records(|state| {
            state.records.clear();
            state.pending_clear = false;
            (true, ())
        });
    }

    /// Clear when the next output arrives (`clear_output` with `wait=true`).
    pub fn clear_wait(&self) {
        self.with_records(|state| {
            state.pending_clear = true;
            (false, ())
        });
    }

    pub fn snapshot(&self) -> Vec<OutputRecord> {
        self.with_records(|state| (false, state.records.clone()))
    }

    pub fn len(&self) -> usize {
        self.with_records(|state| (false, state.records.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of changes so far.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Watch the change counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Whether any stderr stream output was recorded.
    pub fn has_stderr(&self) -> bool {
        self.with_records(|state| {
            let found = state.records.iter().any(|r| {
                matches!(
                    r,
                    OutputRecord::Stream {
                        name: StreamName::Stderr,
                        ..
                    }
                )
            });
            (false, found)
        })
    }

    pub fn has_error(&self) -> bool {
        self.with_records(|state| {
            let found = state
                .records
                .iter()
                .any(|r| matches!(r, OutputRecord::Error { .. }));
            (false, found)
        })
    }

    /// Stream text and `text/plain` representations joined in order.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for record in self.snapshot() {
            let is_stream = matches!(record, OutputRecord::Stream { .. });
            if let Some(piece) = record.plain_text() {
                if !is_stream && !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&piece);
            }
        }
        text
    }

    /// The records as an nbformat `outputs` array.
    pub fn to_json(&self) -> Value {
        Value::Array(self.snapshot().iter().map(OutputRecord::to_json).collect())
    }

    /// Build an accumulator from an nbformat `outputs` array.
    pub fn from_json(value: Value) -> Result<Self> {
        let outputs: Vec<Value> = serde_json::from_value(value)?;
        let accumulator = Self::new();
        {
            let mut state = accumulator
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for output in outputs {
                state.records.push(OutputRecord::from_json(output)?);
            }
        }
        Ok(accumulator)
    }
}
