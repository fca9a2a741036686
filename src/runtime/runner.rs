//! Building and running the lifecycle of a resolved component graph.

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::{CancelSource, CancelToken, Cause, SignalReceived};
use crate::error::BoxError;
use crate::resolver::node::{ComponentNode, NodeRef, RegState};
use crate::resolver::registry::{in_provider_context, registry};
use crate::runtime::error::{BuildError, RunError};
use crate::runtime::graph::{HookInfo, LcGraph};
use crate::runtime::listener::{Listeners, RunnerListener};
use crate::runtime::session::Session;

#[derive(Clone)]
pub(crate) struct RunnerConfig {
    pub start_timeout: Option<Duration>,
    pub ok_result_as_error: bool,
    pub listeners: Listeners,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            start_timeout: None,
            ok_result_as_error: false,
            listeners: Listeners::default(),
        }
    }
}

/// Configures and builds a [`Runner`].
#[derive(Default)]
pub struct RunnerBuilder {
    cfg: RunnerConfig,
}

impl RunnerBuilder {
    /// Default start timeout applied to every starter and readiness
    /// runnable that has no per-hook timeout.
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.start_timeout = Some(timeout);
        self
    }

    /// Treat an `Ok` run result of any runnable as a failure that triggers
    /// shutdown.
    pub fn ok_run_result_as_error(mut self) -> Self {
        self.cfg.ok_result_as_error = true;
        self
    }

    /// Subscribes a listener to the hooks' lifecycle events.
    pub fn listener(mut self, listener: impl RunnerListener + 'static) -> Self {
        self.cfg.listeners.0.push(Arc::new(listener));
        self
    }

    /// Resolves the root components through `provider` and builds the
    /// lifecycle graph over everything it reached.
    #[track_caller]
    pub fn build<F>(self, provider: F) -> Result<Runner, BuildError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_build(move || {
            provider();
            Ok(())
        })
    }

    /// Like [`build`](Self::build), but the provider may fail.
    #[track_caller]
    pub fn try_build<F>(self, provider: F) -> Result<Runner, BuildError>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        let at = Location::caller();
        if in_provider_context() {
            return Err(BuildError::InProviderContext { at });
        }

        let root = ComponentNode::new(Box::new(provider), at, "runner");
        let node: NodeRef = root.clone();
        // a fresh root chain: late-inits run before this returns
        registry().on_get_component(&node, at);

        if let Some(err) = node.memoized_error() {
            if err.has_user_panic() {
                std::panic::panic_any(err);
            }
            return Err(BuildError::Provide(err));
        }

        let graph = if node.reg_state() == RegState::WithHooks {
            LcGraph::build(&node).map_err(BuildError::LifecycleCycle)?
        } else {
            // nothing lifecycle-aware was reached: a no-op runner
            LcGraph::empty()
        };
        tracing::info!(hooks = graph.len(), "runner built");
        Ok(Runner {
            graph: Arc::new(graph),
            cfg: self.cfg,
            is_running: AtomicBool::new(false),
        })
    }
}

/// Starts, supervises and gracefully shuts down the lifecycle hooks of a
/// component graph, in an order consistent with the observed dependencies.
pub struct Runner {
    graph: Arc<LcGraph>,
    cfg: RunnerConfig,
    is_running: AtomicBool,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("is_running", &self.is_running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    /// Shorthand for `Runner::builder().build(provider)`.
    #[track_caller]
    pub fn new<F>(provider: F) -> Result<Runner, BuildError>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::builder().build(provider)
    }

    /// Runs the graph: starts hooks from the leaves up, calls `on_ready`
    /// once everything signalled readiness, then serves until a hook fails,
    /// `ctx` is cancelled, or every runnable finished cleanly; finally closes
    /// hooks from the roots down.
    ///
    /// Returns `Ok(())` when all runnables finished cleanly, the first
    /// [`RunError::HookFailed`], or [`RunError::Cancelled`] when `ctx` was
    /// cancelled. Calling `run` while a previous invocation has not returned
    /// yields [`RunError::AlreadyRunning`].
    pub async fn run<F>(&self, ctx: CancelToken, on_ready: F) -> Result<(), RunError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.is_running);
        let session = Session::new(
            self.graph.clone(),
            self.cfg.clone(),
            Some(Box::new(on_ready)),
        );
        session.run(ctx).await
    }

    /// Like [`run`](Self::run) with a context cancelled by SIGINT/SIGTERM,
    /// attaching a [`SignalReceived`] cause.
    pub async fn run_with_signals<F>(&self, on_ready: F) -> Result<(), RunError>
    where
        F: FnOnce() + Send + 'static,
    {
        let signal_cancel = CancelSource::new();
        let token = signal_cancel.token();
        let stop = CancelSource::new();
        let stop_token = stop.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = crate::cancel::shutdown_signal() => {
                    signal_cancel.cancel_with(Cause::new(SignalReceived));
                }
                _ = stop_token.cancelled() => {}
            }
        });
        let result = self.run(token, on_ready).await;
        stop.cancel();
        result
    }

    /// The hooks no other hook depends on, for debugging and logging. Walk
    /// [`HookNode::depends_on`] to traverse the whole lifecycle graph.
    pub fn root_lifecycle_hooks(&self) -> Vec<HookNode> {
        self.graph
            .roots
            .iter()
            .map(|&idx| HookNode {
                graph: self.graph.clone(),
                idx,
            })
            .collect()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One node of the lifecycle graph, exposed for observability.
#[derive(Clone)]
pub struct HookNode {
    graph: Arc<LcGraph>,
    idx: usize,
}

impl HookNode {
    pub fn info(&self) -> &HookInfo {
        &self.graph.nodes[self.idx].info
    }

    /// The hooks this one depends on (they become ready first, close later).
    pub fn depends_on(&self) -> Vec<HookNode> {
        self.graph.nodes[self.idx]
            .depends_on
            .iter()
            .map(|&idx| HookNode {
                graph: self.graph.clone(),
                idx,
            })
            .collect()
    }
}

impl fmt::Debug for HookNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.info(), f)
    }
}
