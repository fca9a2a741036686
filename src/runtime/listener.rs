//! Observing hook lifecycle events during a session.

use std::sync::Arc;

use crate::cancel::Cause;
use crate::runtime::graph::HookInfo;

/// Subscriber for the lifecycle events of hooks managed by a runner.
///
/// All methods are invoked synchronously on the session's event loop; keep
/// them fast. Every method has a no-op default, so implementors subscribe to
/// the subset they care about.
pub trait RunnerListener: Send + Sync {
    /// The runner is about to run the hook's start phase (or its run task
    /// for the run shapes).
    fn on_start(&self, hook: &HookInfo) {
        let _ = hook;
    }

    /// The hook no longer blocks its dependents from starting.
    fn on_ready(&self, hook: &HookInfo) {
        let _ = hook;
    }

    /// The runner closes the hook. For the run shapes this corresponds to
    /// cancelling the run context. `cause` is absent when the graph winds
    /// down without a failure.
    fn on_close(&self, hook: &HookInfo, cause: Option<&Cause>) {
        let _ = (hook, cause);
    }

    /// The hook finished entirely: its start failed, or its wait phase
    /// returned. `result` is the failure, absent on success.
    fn on_done(&self, hook: &HookInfo, result: Option<&Cause>) {
        let _ = (hook, result);
    }

    /// Shutdown of the session began. Emitted exactly once per session.
    fn on_shutdown(&self, cause: &Cause) {
        let _ = cause;
    }
}

impl<T: RunnerListener + ?Sized> RunnerListener for Arc<T> {
    fn on_start(&self, hook: &HookInfo) {
        (**self).on_start(hook);
    }

    fn on_ready(&self, hook: &HookInfo) {
        (**self).on_ready(hook);
    }

    fn on_close(&self, hook: &HookInfo, cause: Option<&Cause>) {
        (**self).on_close(hook, cause);
    }

    fn on_done(&self, hook: &HookInfo, result: Option<&Cause>) {
        (**self).on_done(hook, result);
    }

    fn on_shutdown(&self, cause: &Cause) {
        (**self).on_shutdown(cause);
    }
}

/// Fan-out over the registered listeners.
#[derive(Clone, Default)]
pub(crate) struct Listeners(pub(crate) Vec<Arc<dyn RunnerListener>>);

impl Listeners {
    pub(crate) fn on_start(&self, hook: &HookInfo) {
        for listener in &self.0 {
            listener.on_start(hook);
        }
    }

    pub(crate) fn on_ready(&self, hook: &HookInfo) {
        for listener in &self.0 {
            listener.on_ready(hook);
        }
    }

    pub(crate) fn on_close(&self, hook: &HookInfo, cause: Option<&Cause>) {
        for listener in &self.0 {
            listener.on_close(hook, cause);
        }
    }

    pub(crate) fn on_done(&self, hook: &HookInfo, result: Option<&Cause>) {
        for listener in &self.0 {
            listener.on_done(hook, result);
        }
    }

    pub(crate) fn on_shutdown(&self, cause: &Cause) {
        for listener in &self.0 {
            listener.on_shutdown(cause);
        }
    }
}
