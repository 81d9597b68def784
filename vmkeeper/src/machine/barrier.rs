use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::{MachineError, Result};

#[derive(Debug, Default)]
struct Counters {
    dependents: usize,
    drainers: usize,
}

/// Counted guard against lifecycle state changes.
///
/// Operations that assume the state stays put hold a [`StateDependencyGuard`].
/// A state change first announces a drain, which makes new dependents fail,
/// then waits (without the machine lock) for the count to reach zero.
#[derive(Debug, Default)]
pub struct StateBarrier {
    counters: Mutex<Counters>,
    idle: Notify,
}

impl StateBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        // The counters stay consistent even if a holder panicked.
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a dependent. Refused while a state change is pending.
    pub fn add(self: &Arc<Self>) -> Result<StateDependencyGuard> {
        let mut c = self.counters();
        if c.drainers > 0 {
            return Err(MachineError::InvalidState(
                "a machine state change is in progress".into(),
            ));
        }
        c.dependents += 1;
        Ok(StateDependencyGuard {
            barrier: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut c = self.counters();
        debug_assert!(c.dependents > 0);
        c.dependents = c.dependents.saturating_sub(1);
        if c.dependents == 0 {
            self.idle.notify_waiters();
        }
    }

    pub fn dependents(&self) -> usize {
        self.counters().dependents
    }

    pub fn is_draining(&self) -> bool {
        self.counters().drainers > 0
    }

    /// Block new dependents and wait until the existing ones are gone.
    /// The returned guard keeps new dependents out until dropped.
    pub async fn drain(self: &Arc<Self>) -> DrainGuard {
        self.counters().drainers += 1;
        let guard = DrainGuard {
            barrier: Arc::clone(self),
        };
        loop {
            // Register interest before checking so a release in between is not lost.
            let notified = self.idle.notified();
            if self.counters().dependents == 0 {
                return guard;
            }
            notified.await;
        }
    }
}

/// Held while an operation depends on the machine state not changing.
#[derive(Debug)]
pub struct StateDependencyGuard {
    barrier: Arc<StateBarrier>,
}

impl Drop for StateDependencyGuard {
    fn drop(&mut self) {
        self.barrier.release();
    }
}

/// Held by a pending state change.
#[derive(Debug)]
pub struct DrainGuard {
    barrier: Arc<StateBarrier>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut c = self.barrier.counters();
        c.drainers = c.drainers.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn guards_count_dependents() {
        let barrier = StateBarrier::new();
        let a = barrier.add().unwrap();
        let b = barrier.add().unwrap();
        assert_eq!(barrier.dependents(), 2);
        drop(a);
        assert_eq!(barrier.dependents(), 1);
        drop(b);
        assert_eq!(barrier.dependents(), 0);
    }

    #[tokio::test]
    async fn drain_without_dependents_is_immediate() {
        let barrier = StateBarrier::new();
        let guard = barrier.drain().await;
        assert!(barrier.is_draining());
        drop(guard);
        assert!(!barrier.is_draining());
    }

    #[tokio::test]
    async fn drain_rejects_new_dependents_and_waits() {
        let barrier = StateBarrier::new();
        let dep = barrier.add().unwrap();

        let b2 = Arc::clone(&barrier);
        let drainer = tokio::spawn(async move {
            let _guard = b2.drain().await;
            b2.dependents()
        });

        // Let the drainer announce itself.
        for _ in 0..50 {
            if barrier.is_draining() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(barrier.is_draining());
        let err = barrier.add().unwrap_err();
        assert!(err.is_invalid_state());
        assert!(!drainer.is_finished());

        drop(dep);
        let remaining = tokio::time::timeout(Duration::from_secs(5), drainer)
            .await
            .expect("drain did not finish")
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(!barrier.is_draining());
        assert!(barrier.add().is_ok());
    }
}
