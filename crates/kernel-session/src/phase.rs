//! Execution phase state machine.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Phase of one execution. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Running,
    Completed,
    CompletedWithError,
    CompletedWithWarning,
}

impl ExecutionPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionPhase::Running)
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionPhase::Running => "running",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::CompletedWithError => "completed_with_error",
            ExecutionPhase::CompletedWithWarning => "completed_with_warning",
        };
        write!(f, "{}", s)
    }
}

/// Holds the phase of a single execution and lets observers watch it.
///
/// Starts in `Running` and accepts exactly one terminal transition. Every
/// execution gets its own tracker; trackers are never reset.
#[derive(Debug)]
pub struct PhaseTracker {
    tx: watch::Sender<ExecutionPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ExecutionPhase::Running);
        Self { tx }
    }

    pub fn phase(&self) -> ExecutionPhase {
        *self.tx.borrow()
    }

    /// Move to `terminal`. Returns false (and logs) when the tracker already
    /// settled or when `terminal` is `Running`.
    pub fn finish(&self, terminal: ExecutionPhase) -> bool {
        if !terminal.is_terminal() {
            log::warn!("[executor] Ignoring transition back to {}", terminal);
            return false;
        }

        let mut settled = None;
        let changed = self.tx.send_if_modified(|phase| {
            if phase.is_terminal() {
                settled = Some(*phase);
                false
            } else {
                *phase = terminal;
                true
            }
        });

        if let Some(current) = settled {
            log::warn!(
                "[executor] Rejected phase transition {} -> {}",
                current,
                terminal
            );
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionPhase> {
        self.tx.subscribe()
    }

    /// Wait for the terminal phase.
    pub async fn settled(&self) -> ExecutionPhase {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let settled = match rx.wait_for(|phase| phase.is_terminal()).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        };
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        let tracker = PhaseTracker::new();
        assert_eq!(tracker.phase(), ExecutionPhase::Running);
        assert!(!tracker.phase().is_terminal());
    }

    #[test]
    fn test_single_terminal_transition() {
        let tracker = PhaseTracker::new();
        assert!(tracker.finish(ExecutionPhase::CompletedWithWarning));
        assert!(!tracker.finish(ExecutionPhase::Completed));
        assert!(!tracker.finish(ExecutionPhase::CompletedWithError));
        assert_eq!(tracker.phase(), ExecutionPhase::CompletedWithWarning);
    }

    #[test]
    fn test_cannot_return_to_running() {
        let tracker = PhaseTracker::new();
        assert!(!tracker.finish(ExecutionPhase::Running));
        assert!(tracker.finish(ExecutionPhase::Completed));
        assert!(!tracker.finish(ExecutionPhase::Running));
        assert_eq!(tracker.phase(), ExecutionPhase::Completed);
    }

    #[test]
    fn test_serialization_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExecutionPhase::CompletedWithError).unwrap(),
            "\"completed_with_error\""
        );
        assert_eq!(ExecutionPhase::CompletedWithWarning.to_string(), "completed_with_warning");
    }

    #[tokio::test]
    async fn test_observer_sees_terminal_phase_once() {
        let tracker = PhaseTracker::new();
        let mut rx = tracker.subscribe();
        assert_eq!(*rx.borrow_and_update(), ExecutionPhase::Running);

        tracker.finish(ExecutionPhase::Completed);
        tracker.finish(ExecutionPhase::CompletedWithError);

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ExecutionPhase::Completed);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_settled_waits_for_terminal() {
        let tracker = std::sync::Arc::new(PhaseTracker::new());
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.settled().await })
        };
        tokio::task::yield_now().await;
        tracker.finish(ExecutionPhase::CompletedWithError);
        assert_eq!(waiter.await.unwrap(), ExecutionPhase::CompletedWithError);
    }
}
