/// Write serialization queue for internal bookkeeping.
///
/// Collection registration, storage-token bootstrap and collection removal
/// all read-modify-write the internal metadata store. Running them through
/// one [`WriteQueue`] keeps them from interleaving when several are requested
/// at once.
///
/// Admission order is fixed when [`WriteQueue::locked_run`] is called, not
/// when the returned future is first polled. Every operation runs on its own
/// task, so once admitted it always runs to completion, even if the caller
/// drops the future. Ordinary document reads and writes do not go through
/// the queue.
use crate::error::{ReactiveError, ReactiveResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};

/// FIFO queue of mutually exclusive async operations.
#[derive(Clone, Default)]
pub struct WriteQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    /// Completion signal of the most recently admitted operation.
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    pending: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending count when an operation finishes, however it ends.
struct PendingGuard {
    inner: Arc<QueueInner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` after every previously admitted operation has finished.
    ///
    /// The operation is admitted (and spawned) right away, before the
    /// returned future is polled, so call order is execution order. Must be
    /// called from within a Tokio runtime.
    ///
    /// The operation's error is returned to this caller only; it does not
    /// affect later operations. A panic inside `op` is reported as
    /// [`ReactiveError::Internal`].
    pub fn locked_run<F, Fut, T>(&self, op: F) -> BoxFuture<'static, ReactiveResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ReactiveResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = {
            let mut tail = self
                .inner
                .tail
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.inner.pending.fetch_add(1, Ordering::SeqCst);
            tail.replace(done_rx)
        };

        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            let _done = done_tx;
            if let Some(previous) = previous {
                // Err means the previous operation's task is gone; either way
                // it no longer runs.
                let _ = previous.await;
            }
            op().await
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ReactiveError::Internal(format!(
                    "queued operation failed: {}",
                    e
                ))),
            }
        }
        .boxed()
    }

    /// Number of operations admitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until no operation is pending or running.
    pub async fn await_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("pending", &self.pending())
            .finish()
    }
}
