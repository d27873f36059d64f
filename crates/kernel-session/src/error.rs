//! Error types for kernel session operations.

use std::time::Duration;

/// Errors surfaced by provisioning, kernel control and execution.
///
/// The type is `Clone` so a single settled execution result can be handed to
/// every task awaiting it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelSessionError {
    /// Contradictory provisioning options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A requested running kernel (by id or index) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The kernel has no live connection yet.
    #[error("Kernel is not ready")]
    NotReady,

    /// The kernel replied to an execute request with an error.
    #[error("{ename}: {evalue}")]
    Execution {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },

    /// The execution timeout guard fired before the kernel replied.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The kernel handle was shut down.
    #[error("Kernel has been shut down")]
    KernelShutdown,

    /// Network, socket or process failure talking to the kernel service.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The settings file could not be read or written.
    #[error("Settings error: {0}")]
    Settings(String),

    /// JSON that does not have the expected shape.
    #[error("Invalid JSON: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, KernelSessionError>;

impl KernelSessionError {
    pub fn execution(
        ename: impl Into<String>,
        evalue: impl Into<String>,
        traceback: Vec<String>,
    ) -> Self {
        KernelSessionError::Execution {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback,
        }
    }

    /// Render an execution error the way a console shows it: the
    /// `ename: evalue` line followed by the traceback.
    pub fn report(&self) -> String {
        match self {
            KernelSessionError::Execution {
                ename,
                evalue,
                traceback,
            } => {
                let mut report = format!("{}: {}", ename, evalue);
                for line in traceback {
                    report.push('\n');
                    report.push_str(line);
                }
                report
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for KernelSessionError {
    fn from(err: std::io::Error) -> Self {
        KernelSessionError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for KernelSessionError {
    fn from(err: serde_json::Error) -> Self {
        KernelSessionError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for KernelSessionError {
    fn from(err: anyhow::Error) -> Self {
        KernelSessionError::Transport(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for KernelSessionError {
    fn from(err: reqwest::Error) -> Self {
        KernelSessionError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_display() {
        let err = KernelSessionError::execution("ValueError", "boom", vec![]);
        assert_eq!(err.to_string(), "ValueError: boom");
    }

    #[test]
    fn test_report_includes_traceback() {
        let err = KernelSessionError::execution(
            "ValueError",
            "boom",
            vec!["line 1".to_string(), "line 2".to_string()],
        );
        assert_eq!(err.report(), "ValueError: boom\nline 1\nline 2");
    }

    #[test]
    fn test_report_for_other_errors() {
        assert_eq!(
            KernelSessionError::KernelShutdown.report(),
            "Kernel has been shut down"
        );
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err: KernelSessionError = anyhow::anyhow!("socket closed")
            .context("reading iopub")
            .into();
        assert_eq!(
            err,
            KernelSessionError::Transport("reading iopub: socket closed".to_string())
        );
    }
}
