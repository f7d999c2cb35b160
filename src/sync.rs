//! One-shot signal primitive
//!
//! A `Gate<T>` resolves at most once and can be awaited by any number of
//! readers, before or after resolution. Used as the rendezvous point for
//! target readiness and session close.

use tokio::sync::watch;

/// A resolve-once, readable-many signal.
///
/// `resolve` wins exactly once; later calls are no-ops. `wait` completes
/// immediately if the gate is already resolved, otherwise it suspends
/// until resolution. Cloning shares the same underlying gate.
#[derive(Clone)]
pub struct Gate<T: Clone + Send + Sync + 'static> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Gate<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the gate. Returns true if this call was the one that
    /// resolved it, false if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(value.clone());
                true
            }
        })
    }

    /// The resolved value, if any, without waiting.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the gate resolves and return the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender half lives in self, so changed() cannot error.
            if rx.changed().await.is_err() {
                unreachable!("gate sender dropped while waiting on it");
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Gate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Gate").field(&self.peek()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let gate: Gate<bool> = Gate::new();
        assert!(!gate.is_resolved());
        assert!(gate.resolve(true));
        assert!(!gate.resolve(false));
        assert_eq!(gate.peek(), Some(true));
    }

    #[tokio::test]
    async fn test_wait_after_resolve() {
        let gate: Gate<u32> = Gate::new();
        gate.resolve(7);
        assert_eq!(gate.wait().await, 7);
    }

    #[tokio::test]
    async fn test_many_waiters() {
        let gate: Gate<String> = Gate::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.wait().await }));
        }
        tokio::task::yield_now().await;
        gate.resolve("done".to_string());
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "done");
        }
    }
}
