//! The four user-facing lifecycle hook shapes.
//!
//! All of them are async traits taken as `Arc<dyn …>` trait objects; async
//! closures can be used instead of full implementations through the
//! `add_*_fn` builder methods.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::cancel::CancelToken;
use crate::error::BoxError;

/// A component that must finish starting before its dependents may start.
///
/// Typical starters run DB migrations, check schemas or establish
/// connections. `start` should block until the component is usable and
/// return an error if it cannot start; when `ctx` is cancelled the starter
/// should abort and return promptly. A starter may be combined with a
/// [`Closer`] in the same hook.
#[async_trait]
pub trait Starter: Send + Sync + 'static {
    async fn start(&self, ctx: CancelToken) -> Result<(), BoxError>;
}

/// A component that must be stopped gracefully before its dependencies stop.
///
/// `close` is only invoked if the paired start succeeded. It should block
/// until the component has released its resources.
#[async_trait]
pub trait Closer: Send + Sync + 'static {
    async fn close(&self);
}

/// A long-running component expressed as a single blocking `run`.
///
/// Starting is considered instantaneous; the hook is ready as soon as `run`
/// has been spawned. `run` should block until the work completes or `ctx` is
/// cancelled, returning an error to trigger shutdown of the whole graph.
/// Returning `Ok` means the component finished on its own and does not want
/// to stop anyone else (overridable with
/// [`ok_run_result_as_error`](crate::LifecycleBuilder::ok_run_result_as_error)).
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    async fn run(&self, ctx: CancelToken) -> Result<(), BoxError>;
}

/// A long-running component that signals readiness explicitly.
///
/// Like [`Runnable`], but dependents are held back until `ready` is
/// notified. An HTTP server would notify after binding its listener and keep
/// running until `ctx` is cancelled.
#[async_trait]
pub trait ReadinessRunnable: Send + Sync + 'static {
    async fn run(&self, ctx: CancelToken, ready: ReadySignal) -> Result<(), BoxError>;
}

/// Handle through which a [`ReadinessRunnable`] reports that it no longer
/// blocks its dependents from starting. Notifying more than once is
/// harmless.
#[derive(Clone)]
pub struct ReadySignal {
    notify: Arc<Notify>,
}

impl ReadySignal {
    pub(crate) fn new() -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (
            Self {
                notify: notify.clone(),
            },
            notify,
        )
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }
}

pub(crate) struct FnStarter<F>(pub F);

#[async_trait]
impl<F, Fut> Starter for FnStarter<F>
where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn start(&self, ctx: CancelToken) -> Result<(), BoxError> {
        (self.0)(ctx).await
    }
}

pub(crate) struct FnCloser<F>(pub F);

#[async_trait]
impl<F, Fut> Closer for FnCloser<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn close(&self) {
        (self.0)().await
    }
}

pub(crate) struct FnRunnable<F>(pub F);

#[async_trait]
impl<F, Fut> Runnable for FnRunnable<F>
where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn run(&self, ctx: CancelToken) -> Result<(), BoxError> {
        (self.0)(ctx).await
    }
}

pub(crate) struct FnReadinessRunnable<F>(pub F);

#[async_trait]
impl<F, Fut> ReadinessRunnable for FnReadinessRunnable<F>
where
    F: Fn(CancelToken, ReadySignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn run(&self, ctx: CancelToken, ready: ReadySignal) -> Result<(), BoxError> {
        (self.0)(ctx, ready).await
    }
}
