//! Operation completion
//!
//! Every dispatched operation owns one [`Slot`]: the caller's callback, taken
//! out exactly once by whichever of response, error, timeout or cancellation
//! gets there first. Callbacks run on pipeline I/O threads, never on the
//! thread that dispatched the operation.
//!
//! Synchronous callers pair a callback with a [`Waiter`] via [`channel`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::error::{MemdError, Result};

/// Boxed completion callback
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Resolve-once holder of a completion callback
pub struct Slot<T> {
    callback: Mutex<Option<Callback<T>>>,
}

impl<T: Send + 'static> Slot<T> {
    pub fn new(callback: impl FnOnce(Result<T>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Invoke the callback if nobody has yet; returns whether this call did
    pub fn resolve(&self, result: Result<T>) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    tracing::error!("Completion callback panicked");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Type-erased view of a slot, used by pipelines and handles
pub trait Resolvable: Send + Sync {
    /// Whether the operation already completed (or was abandoned)
    fn is_resolved(&self) -> bool;

    /// Resolve with [`MemdError::Cancelled`] if still pending
    fn cancel(&self) -> bool;
}

impl<T: Send + 'static> Resolvable for Slot<T> {
    fn is_resolved(&self) -> bool {
        Slot::is_resolved(self)
    }

    fn cancel(&self) -> bool {
        self.resolve(Err(MemdError::Cancelled))
    }
}

/// Handle to a dispatched operation
///
/// Dropping the handle does not cancel the operation.
#[derive(Clone)]
pub struct PendingOp {
    state: Arc<dyn Resolvable>,
}

impl PendingOp {
    pub(crate) fn new(state: Arc<dyn Resolvable>) -> Self {
        Self { state }
    }

    /// Abandon interest in the result
    ///
    /// The callback is invoked with [`MemdError::Cancelled`] unless it already
    /// ran. The request may still complete on the server.
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_resolved()
    }
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Blocking receiver for one operation result
pub struct Waiter<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Waiter<T> {
    /// Block until the result arrives
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(MemdError::Cancelled))
    }

    /// Block until the result arrives or `timeout` elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(MemdError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(MemdError::Cancelled),
        }
    }

    /// Non-blocking poll
    pub fn try_result(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

/// Create a callback / waiter pair
///
/// If the callback is dropped without being invoked (the dispatch call itself
/// failed) the waiter yields [`MemdError::Cancelled`].
pub fn channel<T: Send + 'static>() -> (impl FnOnce(Result<T>) + Send + 'static, Waiter<T>) {
    let (tx, rx) = channel::bounded(1);
    let callback = move |result: Result<T>| {
        let _ = tx.send(result);
    };
    (callback, Waiter { rx })
}
