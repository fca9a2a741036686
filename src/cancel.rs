//! Cause-aware cancellation.
//!
//! A [`CancelSource`] / [`CancelToken`] pair built on `tokio::sync::watch`.
//! Cancelling attaches an optional [`Cause`] explaining why; only the first
//! cancellation takes effect. Tokens are cheap to clone and hand to hook
//! tasks, mirroring how the runner threads a shutdown reason through the
//! graph.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// A cheaply cloneable error value explaining why an operation was cancelled
/// or why shutdown began.
#[derive(Clone)]
pub struct Cause(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Cause {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    pub fn from_boxed(err: crate::error::BoxError) -> Self {
        Self(Arc::from(err))
    }

    /// Returns the underlying error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref()
    }

    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Cancellation without an explicit cause.
#[derive(Clone, Copy, Debug, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Cause attached when a start timeout elapses before the hook became ready.
#[derive(Clone, Copy, Debug, Error)]
#[error("start deadline exceeded")]
pub struct DeadlineExceeded;

/// Cause attached when an OS shutdown signal triggered the cancellation.
#[derive(Clone, Copy, Debug, Error)]
#[error("shutdown signal received")]
pub struct SignalReceived;

#[derive(Clone)]
enum CancelState {
    Active,
    Cancelled(Option<Cause>),
}

/// The cancelling half. Dropping the source without cancelling leaves its
/// tokens pending forever.
pub struct CancelSource {
    tx: watch::Sender<CancelState>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CancelState::Active);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancels without a cause. Returns `false` if already cancelled.
    pub fn cancel(&self) -> bool {
        self.cancel_opt(None)
    }

    /// Cancels with the given cause. Only the first cancellation wins; a
    /// later call cannot replace the cause.
    pub fn cancel_with(&self, cause: Cause) -> bool {
        self.cancel_opt(Some(cause))
    }

    fn cancel_opt(&self, cause: Option<Cause>) -> bool {
        let mut cause = cause;
        self.tx.send_if_modified(|state| match state {
            CancelState::Active => {
                *state = CancelState::Cancelled(cause.take());
                true
            }
            CancelState::Cancelled(_) => false,
        })
    }

    /// Spawns a watchdog that cancels with `cause` after `timeout`, unless
    /// something else cancels first. Must be called inside a tokio runtime.
    pub(crate) fn cancel_after(&self, timeout: Duration, cause: Cause) {
        let tx = self.tx.clone();
        let token = self.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    tx.send_if_modified(|state| match state {
                        CancelState::Active => {
                            *state = CancelState::Cancelled(Some(cause));
                            true
                        }
                        CancelState::Cancelled(_) => false,
                    });
                }
                _ = token.cancelled() => {}
            }
        });
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing half, passed into hook operations.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<CancelState>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(CancelState::Active);
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.rx.borrow(), CancelState::Cancelled(_))
    }

    /// The cause attached to the cancellation, if any yet.
    pub fn cause(&self) -> Option<Cause> {
        match &*self.rx.borrow() {
            CancelState::Cancelled(cause) => cause.clone(),
            CancelState::Active => None,
        }
    }

    /// Resolves once the token is cancelled. If the source is dropped
    /// without cancelling, pends forever.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let waited_err = rx
            .wait_for(|state| matches!(state, CancelState::Cancelled(_)))
            .await
            .is_err();
        if waited_err {
            std::future::pending::<()>().await;
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Resolves when the process receives SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM signal");
        }
    }
}
