//! Connection scopes.
//!
//! Every connection attempt owns one [`ConnectionScope`]. Tasks spawned into
//! it stop together when the scope is closed, and the first failure inside
//! the scope is reported once to whoever owns the attempt.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Result;
use crate::transport::Transport;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// An uncaught failure inside a connection scope.
#[derive(Debug, Clone)]
pub struct ScopeFailure {
    /// The transport the scope belongs to.
    pub transport: Transport,
    /// The scope that failed.
    pub scope_id: u64,
    /// What went wrong.
    pub message: String,
}

struct ScopeInner {
    transport: Transport,
    id: u64,
    token: CancellationToken,
    failed: AtomicBool,
    failure_tx: Option<mpsc::UnboundedSender<ScopeFailure>>,
}

/// A cancellation-scoped task group for one connection attempt.
#[derive(Clone)]
pub struct ConnectionScope {
    inner: Arc<ScopeInner>,
}

impl ConnectionScope {
    /// Create a scope whose failures are sent to `failure_tx`.
    pub fn new(transport: Transport, failure_tx: mpsc::UnboundedSender<ScopeFailure>) -> Self {
        Self::build(transport, Some(failure_tx))
    }

    /// Create a scope whose failures are only logged.
    pub fn detached(transport: Transport) -> Self {
        Self::build(transport, None)
    }

    fn build(
        transport: Transport,
        failure_tx: Option<mpsc::UnboundedSender<ScopeFailure>>,
    ) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                transport,
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                token: CancellationToken::new(),
                failed: AtomicBool::new(false),
                failure_tx,
            }),
        }
    }

    /// The transport this scope belongs to.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Unique id of this scope.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Token cancelled when the scope closes.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Check if the scope has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Close the scope, stopping every task spawned into it.
    pub fn close(&self) {
        if !self.inner.token.is_cancelled() {
            debug!("Closing connection scope {} for {}", self.id(), self.transport());
            self.inner.token.cancel();
        }
    }

    /// Spawn a task that stops when the scope closes.
    ///
    /// A panic inside the task is caught and reported as a scope failure.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scope = self.clone();
        tokio::spawn(async move {
            let token = scope.token().clone();
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Task {} stopped with its scope", name);
                }
                result = AssertUnwindSafe(future).catch_unwind() => {
                    if let Err(panic) = result {
                        scope.report_failure(format!("{} panicked: {}", name, panic_message(&*panic)));
                    }
                }
            }
        })
    }

    /// Spawn a task whose error is reported as a scope failure.
    pub fn spawn_fallible<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let scope = self.clone();
        self.spawn(name, async move {
            if let Err(e) = future.await {
                scope.report_failure(format!("{} failed: {}", name, e));
            }
        })
    }

    /// Report a failure. Only the first report per scope is forwarded.
    ///
    /// Returns true if this call was the first.
    pub fn report_failure(&self, message: impl Into<String>) -> bool {
        if self
            .inner
            .failed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ignoring further failure in scope {}", self.id());
            return false;
        }

        let message = message.into();
        error!(
            "Uncaught failure in connection to {}: {}",
            self.transport(),
            message
        );

        if let Some(tx) = &self.inner.failure_tx {
            let _ = tx.send(ScopeFailure {
                transport: self.transport().clone(),
                scope_id: self.id(),
                message,
            });
        }
        true
    }

    /// Check if a failure has been reported.
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("transport", self.transport())
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    fn transport() -> Transport {
        Transport::ble("AA:BB:CC:DD:EE:FF", "Pebble")
    }

    #[tokio::test]
    async fn test_close_stops_tasks() {
        let scope = ConnectionScope::detached(transport());
        let handle = scope.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        scope.close();
        handle.await.unwrap();
        assert!(scope.is_closed());
    }

    #[tokio::test]
    async fn test_panic_is_reported_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scope = ConnectionScope::new(transport(), tx);

        scope.spawn("first", async { panic!("boom"); }).await.unwrap();
        scope
            .spawn_fallible("second", async { Err(Error::ConnectionLost) })
            .await
            .unwrap();

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.scope_id, scope.id());
        assert!(failure.message.contains("boom"));
        assert!(rx.try_recv().is_err());
        assert!(scope.has_failed());
    }

    #[test]
    fn test_scope_ids_are_unique() {
        let a = ConnectionScope::detached(transport());
        let b = ConnectionScope::detached(transport());
        assert_ne!(a.id(), b.id());
    }
}
