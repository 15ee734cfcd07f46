//! A single-settle deferred value.
//!
//! The stream's completion hook resolves the run final, and abort paths may
//! race it. The settled flag makes the first resolution win and every later
//! attempt a no-op, so the final resolves exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// The settling half of a deferred.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
    settled: AtomicBool,
}

/// The awaiting half of a deferred.
#[derive(Debug)]
pub struct Promise<T> {
    rx: oneshot::Receiver<T>,
}

/// Create a linked deferred/promise pair.
#[must_use]
pub fn deferred<T>() -> (Arc<Deferred<T>>, Promise<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Arc::new(Deferred {
            tx: Mutex::new(Some(tx)),
            settled: AtomicBool::new(false),
        }),
        Promise { rx },
    )
}

impl<T> Deferred<T> {
    /// Settle the deferred. Returns `true` if this call won; later calls
    /// are no-ops.
    pub fn settle(&self, value: T) -> bool {
        if self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(tx) = self.tx.lock().expect("deferred lock").take() {
            // A dropped promise is fine; the value simply has no audience.
            let _ = tx.send(value);
        }
        true
    }

    /// Whether the deferred has been settled.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

impl<T> Promise<T> {
    /// Wait for the value. Returns `None` only if the deferred was dropped
    /// without settling, which indicates a task bug.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_settle_wins() {
        let (deferred, promise) = deferred::<u32>();
        assert!(deferred.settle(1));
        assert!(!deferred.settle(2));
        assert!(deferred.is_settled());
        assert_eq!(promise.wait().await, Some(1));
    }

    #[tokio::test]
    async fn dropped_deferred_yields_none() {
        let (deferred, promise) = deferred::<u32>();
        drop(deferred);
        assert_eq!(promise.wait().await, None);
    }

    #[tokio::test]
    async fn settle_after_promise_dropped_is_harmless() {
        let (deferred, promise) = deferred::<u32>();
        drop(promise);
        assert!(deferred.settle(7));
    }
}
