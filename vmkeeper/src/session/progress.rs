use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{MachineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressState {
    Running { percent: u32 },
    Completed,
    Failed(String),
    Canceled,
}

impl ProgressState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

struct Inner {
    description: String,
    cancelable: bool,
    tx: watch::Sender<ProgressState>,
}

/// Completion handle for a long-running operation.
///
/// The first terminal state wins; later completions and failures are
/// ignored. Cancellation is best-effort: the worker polls
/// [`is_canceled`](Self::is_canceled) between steps.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("description", &self.inner.description)
            .field("state", &self.state())
            .finish()
    }
}

impl Progress {
    pub fn new(description: impl Into<String>, cancelable: bool) -> Self {
        let (tx, _) = watch::channel(ProgressState::Running { percent: 0 });
        Self {
            inner: Arc::new(Inner {
                description: description.into(),
                cancelable,
                tx,
            }),
        }
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn state(&self) -> ProgressState {
        self.inner.tx.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.tx.borrow().is_terminal()
    }

    pub fn is_canceled(&self) -> bool {
        *self.inner.tx.borrow() == ProgressState::Canceled
    }

    pub fn set_percent(&self, percent: u32) {
        self.inner.tx.send_if_modified(|s| match s {
            ProgressState::Running { percent: p } if *p != percent.min(100) => {
                *p = percent.min(100);
                true
            }
            _ => false,
        });
    }

    fn finish(&self, terminal: ProgressState) -> bool {
        self.inner.tx.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            *s = terminal;
            true
        })
    }

    /// Returns false if the progress had already finished.
    pub fn complete(&self) -> bool {
        self.finish(ProgressState::Completed)
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.finish(ProgressState::Failed(message.into()))
    }

    pub fn cancel(&self) -> Result<()> {
        if !self.inner.cancelable {
            return Err(MachineError::InvalidState(format!(
                "operation '{}' cannot be canceled",
                self.inner.description
            )));
        }
        self.finish(ProgressState::Canceled);
        Ok(())
    }

    /// Wait for a terminal state and return it.
    pub async fn wait(&self) -> ProgressState {
        let mut rx = self.inner.tx.subscribe();
        let terminal = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`.
            Err(_) => self.state(),
        };
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_terminal_state_wins() {
        let p = Progress::new("launching", false);
        p.set_percent(40);
        assert_eq!(p.state(), ProgressState::Running { percent: 40 });
        assert!(p.fail("exit code 1"));
        assert!(!p.complete());
        assert_eq!(p.wait().await, ProgressState::Failed("exit code 1".into()));
    }

    #[tokio::test]
    async fn wait_observes_completion_from_worker() {
        let p = Progress::new("creating diffs", true);
        let worker = p.clone();
        tokio::spawn(async move {
            worker.set_percent(50);
            worker.complete();
        });
        assert_eq!(p.wait().await, ProgressState::Completed);
        assert!(p.is_completed());
    }

    #[test]
    fn cancel_requires_cancelable() {
        let p = Progress::new("spawn", false);
        assert!(p.cancel().unwrap_err().is_invalid_state());
        let c = Progress::new("delete", true);
        c.cancel().unwrap();
        assert!(c.is_canceled());
        assert!(!c.complete());
    }
}
