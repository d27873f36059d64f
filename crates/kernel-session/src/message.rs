//! Closed model of the kernel messages this crate consumes.
//!
//! Kernel messages are loosely typed JSON on the wire. Only the message kinds
//! that drive execution and output tracking are modelled; everything else
//! becomes `MessageContent::Unknown` and is ignored by consumers.
//!
//! Two entry points produce `KernelMessage` values:
//! - `KernelMessage::from_jupyter` for transports built on `jupyter_protocol`
//!   (the local ZeroMQ backend)
//! - `MessageContent::from_type_and_content` for transports that hand over
//!   raw `msg_type` + JSON content (websocket bridges, in-process kernels)

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::status::ExecutionStatus;

/// MIME type -> content, or metadata key -> value.
pub type MimeBundle = Map<String, Value>;

/// The kernel socket a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Iopub,
    Shell,
}

/// Stream name for `stream` outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamName::Stdout => write!(f, "stdout"),
            StreamName::Stderr => write!(f, "stderr"),
        }
    }
}

/// Status field of an `execute_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    #[serde(alias = "abort")]
    Aborted,
}

/// Content of the message kinds consumed by the execution coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
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
    ClearOutput {
        wait: bool,
    },
    Status {
        execution_state: ExecutionStatus,
    },
    ExecuteReply {
        status: ReplyStatus,
        execution_count: Option<i64>,
        /// `data` bundles of `page` payloads (IPython `?` / `??` help).
        pages: Vec<MimeBundle>,
        ename: Option<String>,
        evalue: Option<String>,
        traceback: Vec<String>,
    },
    Unknown,
}

#[derive(Deserialize)]
struct StreamWire {
    name: StreamName,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct TransientWire {
    #[serde(default)]
    display_id: Option<String>,
}

#[derive(Deserialize)]
struct DataWire {
    #[serde(default)]
    data: MimeBundle,
    #[serde(default)]
    metadata: MimeBundle,
    #[serde(default)]
    execution_count: Option<i64>,
    #[serde(default)]
    transient: Option<TransientWire>,
}

#[derive(Deserialize)]
struct ErrorWire {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct ClearOutputWire {
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
struct StatusWire {
    execution_state: ExecutionStatus,
}

#[derive(Deserialize)]
struct ExecuteReplyWire {
    status: ReplyStatus,
    #[serde(default)]
    execution_count: Option<i64>,
    #[serde(default)]
    payload: Vec<Value>,
    #[serde(default)]
    ename: Option<String>,
    #[serde(default)]
    evalue: Option<String>,
    #[serde(default)]
    traceback: Vec<String>,
}

impl MessageContent {
    /// Wire `msg_type` for this content.
    pub fn msg_type(&self) -> &'static str {
        match self {
            MessageContent::Stream { .. } => "stream",
            MessageContent::ExecuteResult { .. } => "execute_result",
            MessageContent::DisplayData { .. } => "display_data",
            MessageContent::UpdateDisplayData { .. } => "update_display_data",
            MessageContent::Error { .. } => "error",
            MessageContent::ClearOutput { .. } => "clear_output",
            MessageContent::Status { .. } => "status",
            MessageContent::ExecuteReply { .. } => "execute_reply",
            MessageContent::Unknown => "unknown",
        }
    }

    /// Parse wire JSON content for the given `msg_type`.
    ///
    /// Unmodelled message types yield `Unknown`; a modelled type whose
    /// content does not match the expected shape is an error.
    pub fn from_type_and_content(msg_type: &str, content: Value) -> serde_json::Result<Self> {
        let parsed = match msg_type {
            "stream" => {
                let wire: StreamWire = serde_json::from_value(content)?;
                MessageContent::Stream {
                    name: wire.name,
                    text: wire.text,
                }
            }
            "execute_result" => {
                let wire: DataWire = serde_json::from_value(content)?;
                MessageContent::ExecuteResult {
                    data: wire.data,
                    metadata: wire.metadata,
                    execution_count: wire.execution_count,
                }
            }
            "display_data" => {
                let wire: DataWire = serde_json::from_value(content)?;
                MessageContent::DisplayData {
                    data: wire.data,
                    metadata: wire.metadata,
                    display_id: wire.transient.and_then(|t| t.display_id),
                }
            }
            "update_display_data" => {
                let wire: DataWire = serde_json::from_value(content)?;
                let display_id = wire
                    .transient
                    .and_then(|t| t.display_id)
                    .ok_or_else(|| {
                        serde::de::Error::custom("update_display_data without transient.display_id")
                    })?;
                MessageContent::UpdateDisplayData {
                    data: wire.data,
                    metadata: wire.metadata,
                    display_id,
                }
            }
            "error" => {
                let wire: ErrorWire = serde_json::from_value(content)?;
                MessageContent::Error {
                    ename: wire.ename,
                    evalue: wire.evalue,
                    traceback: wire.traceback,
                }
            }
            "clear_output" => {
                let wire: ClearOutputWire = serde_json::from_value(content)?;
                MessageContent::ClearOutput { wait: wire.wait }
            }
            "status" => {
                let wire: StatusWire = serde_json::from_value(content)?;
                MessageContent::Status {
                    execution_state: wire.execution_state,
                }
            }
            "execute_reply" => {
                let wire: ExecuteReplyWire = serde_json::from_value(content)?;
                let pages = wire
                    .payload
                    .iter()
                    .filter(|p| p.get("source").and_then(|s| s.as_str()) == Some("page"))
                    .filter_map(|p| p.get("data").and_then(|d| d.as_object()).cloned())
                    .collect();
                MessageContent::ExecuteReply {
                    status: wire.status,
                    execution_count: wire.execution_count,
                    pages,
                    ename: wire.ename,
                    evalue: wire.evalue,
                    traceback: wire.traceback,
                }
            }
            _ => MessageContent::Unknown,
        };
        Ok(parsed)
    }
}

/// A kernel message reduced to what the execution lifecycle needs.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    pub msg_id: String,
    pub msg_type: String,
    /// `msg_id` of the request this message answers, if any.
    pub parent_msg_id: Option<String>,
    pub channel: Channel,
    pub content: MessageContent,
}

impl KernelMessage {
    /// Build a message with a fresh `msg_id` and no parent.
    pub fn new(channel: Channel, msg_type: impl Into<String>, content: MessageContent) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            parent_msg_id: None,
            channel,
            content,
        }
    }

    /// Parse a message from its `msg_type` and raw JSON content.
    pub fn from_wire(
        channel: Channel,
        msg_type: &str,
        parent_msg_id: Option<String>,
        content: Value,
    ) -> serde_json::Result<Self> {
        let content = MessageContent::from_type_and_content(msg_type, content)?;
        Ok(Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            parent_msg_id,
            channel,
            content,
        })
    }

    /// Mark this message as a response to the request `parent_msg_id`.
    pub fn child_of(mut self, parent_msg_id: &str) -> Self {
        self.parent_msg_id = Some(parent_msg_id.to_string());
        self
    }

    pub fn is_child_of(&self, msg_id: &str) -> bool {
        self.parent_msg_id.as_deref() == Some(msg_id)
    }

    /// Convert a `jupyter_protocol` message read from `channel`.
    pub fn from_jupyter(message: &JupyterMessage, channel: Channel) -> Self {
        let content = match &message.content {
            JupyterMessageContent::StreamContent(stream) => MessageContent::Stream {
                name: match stream.name {
                    jupyter_protocol::Stdio::Stdout => StreamName::Stdout,
                    jupyter_protocol::Stdio::Stderr => StreamName::Stderr,
                },
                text: stream.text.clone(),
            },
            JupyterMessageContent::DisplayData(data) => MessageContent::DisplayData {
                data: to_bundle(&data.data),
                metadata: to_bundle(&data.metadata),
                display_id: data
                    .transient
                    .as_ref()
                    .and_then(|transient| transient.display_id.clone()),
            },
            JupyterMessageContent::ExecuteResult(result) => MessageContent::ExecuteResult {
                data: to_bundle(&result.data),
                metadata: to_bundle(&result.metadata),
                execution_count: Some(result.execution_count.0 as i64),
            },
            JupyterMessageContent::ErrorOutput(error) => MessageContent::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            },
            JupyterMessageContent::UpdateDisplayData(update) => {
                match update.transient.display_id.clone() {
                    Some(display_id) => MessageContent::UpdateDisplayData {
                        data: to_bundle(&update.data),
                        metadata: to_bundle(&update.metadata),
                        display_id,
                    },
                    None => MessageContent::Unknown,
                }
            }
            JupyterMessageContent::Status(status) => MessageContent::Status {
                execution_state: match status.execution_state {
                    jupyter_protocol::ExecutionState::Busy => ExecutionStatus::Busy,
                    jupyter_protocol::ExecutionState::Idle => ExecutionStatus::Idle,
                    jupyter_protocol::ExecutionState::Starting => ExecutionStatus::Starting,
                    jupyter_protocol::ExecutionState::Restarting => ExecutionStatus::Restarting,
                    jupyter_protocol::ExecutionState::Terminating => ExecutionStatus::Terminating,
                    jupyter_protocol::ExecutionState::Dead => ExecutionStatus::Dead,
                    _ => ExecutionStatus::Unknown,
                },
            },
            // The wire shape of these is stable; go through JSON rather than
            // depending on every field of the protocol structs.
            JupyterMessageContent::ClearOutput(clear) => {
                wire_content(&message.header.msg_type, clear)
            }
            JupyterMessageContent::ExecuteReply(reply) => {
                wire_content(&message.header.msg_type, reply)
            }
            _ => MessageContent::Unknown,
        };

        Self {
            msg_id: message.header.msg_id.clone(),
            msg_type: message.header.msg_type.clone(),
            parent_msg_id: message.parent_header.as_ref().map(|h| h.msg_id.clone()),
            channel,
            content,
        }
    }
}

fn to_bundle<T: Serialize>(value: &T) -> MimeBundle {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => MimeBundle::new(),
    }
}

fn wire_content<T: Serialize>(msg_type: &str, content: &T) -> MessageContent {
    serde_json::to_value(content)
        .and_then(|value| MessageContent::from_type_and_content(msg_type, value))
        .unwrap_or_else(|e| {
            log::warn!("[message] Dropping malformed {} content: {}", msg_type, e);
            MessageContent::Unknown
        })
}
