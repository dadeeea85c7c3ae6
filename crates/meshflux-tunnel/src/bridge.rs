//! Blocking bridge from synchronous engine callbacks into async OS calls
//!
//! Engine callbacks run on the engine's own threads and must return a value
//! synchronously, while applying network settings is asynchronous. A
//! [`PendingOperation`] launches one future on the runtime and lets the
//! calling thread block until it completes.

use crate::error::{Result, TunnelError};
use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// A single launched operation. Consumed by [`PendingOperation::wait`], so it
/// cannot be awaited twice.
#[must_use = "an operation that is never waited on runs detached"]
pub struct PendingOperation<T> {
    result_rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> PendingOperation<T> {
    /// Spawn `operation` on `handle`. The future starts running immediately.
    pub fn launch<F>(handle: &Handle, operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        handle.spawn(async move {
            let _ = result_tx.send(operation.await);
        });
        Self { result_rx }
    }

    /// Block the current thread until the operation finished.
    ///
    /// The operation's own error is returned as is; an operation that
    /// panicked or was cancelled yields [`TunnelError::BridgeAborted`].
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async task; call it from a plain
    /// thread or from `spawn_blocking`.
    pub fn wait(self) -> Result<T> {
        self.result_rx
            .blocking_recv()
            .map_err(|_| TunnelError::BridgeAborted)?
    }
}

/// Runs async operations to completion for callers that cannot suspend
#[derive(Clone, Debug)]
pub struct BlockingBridge {
    handle: Handle,
}

impl BlockingBridge {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bridge onto the runtime of the calling context, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Launch `operation` once and block until it completes
    pub fn run<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        PendingOperation::launch(&self.handle, operation).wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_returns_value() {
        let bridge = BlockingBridge::current().unwrap();

        let value = tokio::task::spawn_blocking(move || {
            bridge.run(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(42)
            })
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_propagates_error() {
        let bridge = BlockingBridge::current().unwrap();

        let result = tokio::task::spawn_blocking(move || {
            bridge.run(async {
                Err::<(), _>(TunnelError::OsSettingsRejected("denied".to_string()))
            })
        })
        .await
        .unwrap();

        match result {
            Err(TunnelError::OsSettingsRejected(msg)) => assert_eq!(msg, "denied"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_operation_is_aborted() {
        let bridge = BlockingBridge::current().unwrap();

        let result = tokio::task::spawn_blocking(move || {
            bridge.run::<(), _>(async { panic!("operation failed hard") })
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(TunnelError::BridgeAborted)));
    }

    #[test]
    fn test_operation_launched_exactly_once() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let bridge = BlockingBridge::new(runtime.handle().clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bridge
            .run(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
