//! The unified lifecycle hook record and the builder obtained from
//! [`use_lifecycle`].
//!
//! Every hook shape is normalized into three optional roles: a starter, a
//! waiter (blocks until the hook's main work finishes) and a closer. The
//! adapters for [`Runnable`] and [`ReadinessRunnable`] fill all three from a
//! single spawned task; the runner consults trusted-async hints to avoid
//! spawning tasks for operations that cannot block.

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cancel::{CancelToken, Cause};
use crate::error::BoxError;
use crate::info::Tag;
use crate::lifecycle::adapters::{PhasedReadinessRunnable, PhasedRunnable};
use crate::lifecycle::traits::{
    Closer, FnCloser, FnReadinessRunnable, FnRunnable, FnStarter, ReadinessRunnable, ReadySignal,
    Runnable, Starter,
};
use crate::resolver::registry::registry;

/// Which user shape a hook was built from. Shown in errors and listener
/// events.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HookKind {
    Starter,
    Closer,
    StarterCloser,
    Runnable,
    ReadinessRunnable,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::Starter => "Starter",
            HookKind::Closer => "Closer",
            HookKind::StarterCloser => "Starter/Closer",
            HookKind::Runnable => "Runnable",
            HookKind::ReadinessRunnable => "ReadinessRunnable",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct StarterCfg {
    pub start_timeout: Option<Duration>,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct WaiterCfg {
    pub ok_result_as_error: bool,
}

pub(crate) enum StarterRole {
    /// User starter, may block arbitrarily long.
    User(Arc<dyn Starter>),
    /// Blocks until the runnable signals readiness.
    Readiness(Arc<PhasedReadinessRunnable>),
    /// Spawning the run task cannot fail or block.
    Spawned(Arc<PhasedRunnable>),
}

pub(crate) enum WaiterRole {
    Readiness(Arc<PhasedReadinessRunnable>),
    Spawned(Arc<PhasedRunnable>),
}

pub(crate) enum CloserRole {
    /// User closer, may block; runs as its own task.
    User(Arc<dyn Closer>),
    /// Cancelling the run context, guaranteed non-blocking.
    Readiness(Arc<PhasedReadinessRunnable>),
    Spawned(Arc<PhasedRunnable>),
}

pub(crate) struct LifecycleHook {
    pub(crate) registered_at: &'static Location<'static>,
    pub(crate) tag: Option<Tag>,
    pub(crate) kind: HookKind,
    pub(crate) starter: Option<StarterRole>,
    pub(crate) starter_cfg: StarterCfg,
    pub(crate) waiter: Option<WaiterRole>,
    pub(crate) waiter_cfg: WaiterCfg,
    pub(crate) closer: Option<CloserRole>,
}

impl LifecycleHook {
    pub(crate) fn has_closer(&self) -> bool {
        self.closer.is_some()
    }

    pub(crate) fn is_trusted_async_starter(&self) -> bool {
        matches!(self.starter, Some(StarterRole::Spawned(_)))
    }

    pub(crate) fn is_trusted_async_closer(&self) -> bool {
        matches!(
            self.closer,
            Some(CloserRole::Readiness(_) | CloserRole::Spawned(_))
        )
    }

    /// Inline start for trusted-async starters.
    pub(crate) fn start_now(&self) -> Result<(), BoxError> {
        match &self.starter {
            Some(StarterRole::Spawned(phased)) => phased.start_now(),
            _ => {
                debug_assert!(false, "start_now on a hook without a trusted-async starter");
                Ok(())
            }
        }
    }

    pub(crate) async fn start(&self, ctx: CancelToken) -> Result<(), BoxError> {
        match &self.starter {
            Some(StarterRole::User(starter)) => starter.start(ctx).await,
            Some(StarterRole::Readiness(phased)) => phased.start(ctx).await,
            Some(StarterRole::Spawned(phased)) => phased.start_now(),
            None => Ok(()),
        }
    }

    pub(crate) async fn wait(&self) -> Result<(), BoxError> {
        match &self.waiter {
            Some(WaiterRole::Readiness(phased)) => phased.wait().await,
            Some(WaiterRole::Spawned(phased)) => phased.wait().await,
            None => Ok(()),
        }
    }

    /// Inline close for trusted-async closers.
    pub(crate) fn close_now(&self, cause: Option<Cause>) {
        match &self.closer {
            Some(CloserRole::Readiness(phased)) => phased.close_now(cause),
            Some(CloserRole::Spawned(phased)) => phased.close_now(cause),
            _ => debug_assert!(false, "close_now on a hook without a trusted-async closer"),
        }
    }

    pub(crate) async fn close(&self, cause: Option<Cause>) {
        match &self.closer {
            Some(CloserRole::User(closer)) => closer.close().await,
            Some(CloserRole::Readiness(phased)) => phased.close_now(cause),
            Some(CloserRole::Spawned(phased)) => phased.close_now(cause),
            None => {}
        }
    }
}

/// Mutable builder state collected during a constructor run. Hooks are
/// materialized from it when the owning component finalizes.
pub(crate) struct HookSpec {
    registered_at: &'static Location<'static>,
    tag: Option<Tag>,
    starter: Option<Arc<dyn Starter>>,
    closer: Option<Arc<dyn Closer>>,
    runnable: Option<Arc<dyn Runnable>>,
    readiness: Option<Arc<dyn ReadinessRunnable>>,
    start_timeout: Option<Duration>,
    ok_result_as_error: bool,
    materialized: bool,
}

impl HookSpec {
    pub(crate) fn new(registered_at: &'static Location<'static>) -> Self {
        Self {
            registered_at,
            tag: None,
            starter: None,
            closer: None,
            runnable: None,
            readiness: None,
            start_timeout: None,
            ok_result_as_error: false,
            materialized: false,
        }
    }

    /// Builds the hook if any role was added. An untouched builder
    /// contributes nothing.
    pub(crate) fn take_hook(&mut self) -> Option<Arc<LifecycleHook>> {
        self.materialized = true;
        let starter_cfg = StarterCfg {
            start_timeout: self.start_timeout,
        };
        let waiter_cfg = WaiterCfg {
            ok_result_as_error: self.ok_result_as_error,
        };

        if let Some(readiness) = self.readiness.take() {
            let phased = PhasedReadinessRunnable::new(readiness);
            return Some(Arc::new(LifecycleHook {
                registered_at: self.registered_at,
                tag: self.tag.take(),
                kind: HookKind::ReadinessRunnable,
                starter: Some(StarterRole::Readiness(phased.clone())),
                starter_cfg,
                waiter: Some(WaiterRole::Readiness(phased.clone())),
                waiter_cfg,
                closer: Some(CloserRole::Readiness(phased)),
            }));
        }
        if let Some(runnable) = self.runnable.take() {
            let phased = PhasedRunnable::new(runnable);
            return Some(Arc::new(LifecycleHook {
                registered_at: self.registered_at,
                tag: self.tag.take(),
                kind: HookKind::Runnable,
                starter: Some(StarterRole::Spawned(phased.clone())),
                starter_cfg: StarterCfg::default(),
                waiter: Some(WaiterRole::Spawned(phased.clone())),
                waiter_cfg,
                closer: Some(CloserRole::Spawned(phased)),
            }));
        }

        let starter = self.starter.take();
        let closer = self.closer.take();
        let kind = match (&starter, &closer) {
            (Some(_), Some(_)) => HookKind::StarterCloser,
            (Some(_), None) => HookKind::Starter,
            (None, Some(_)) => HookKind::Closer,
            (None, None) => return None,
        };
        Some(Arc::new(LifecycleHook {
            registered_at: self.registered_at,
            tag: self.tag.take(),
            kind,
            starter: starter.map(StarterRole::User),
            starter_cfg,
            waiter: None,
            waiter_cfg,
            closer: closer.map(CloserRole::User),
        }))
    }

    fn check_no_run_shape(&self) {
        if self.runnable.is_some() {
            panic!("runnable already added to this lifecycle builder");
        }
        if self.readiness.is_some() {
            panic!("readiness runnable already added to this lifecycle builder");
        }
    }

    fn check_can_add_run_shape(&self) {
        self.check_no_run_shape();
        if self.starter.is_some() {
            panic!("starter already added to this lifecycle builder");
        }
        if self.closer.is_some() {
            panic!("closer already added to this lifecycle builder");
        }
    }

    fn check_live(&self) {
        if self.materialized {
            panic!("lifecycle builder used after its provider finished");
        }
    }
}

/// Registers a lifecycle hook builder on the component whose constructor is
/// currently running.
///
/// May be called multiple times per component; each call creates an
/// independent sibling hook sharing the component's dependencies and
/// dependents. Two separate `use_lifecycle` calls are not equivalent to one
/// call with both roles: siblings have no mutual ordering.
///
/// # Panics
///
/// Panics when called outside a provider context.
#[track_caller]
pub fn use_lifecycle() -> LifecycleBuilder {
    match registry().add_lifecycle_spec(Location::caller()) {
        Some(spec) => LifecycleBuilder { spec },
        None => panic!("use_lifecycle must be called inside a provider function"),
    }
}

/// Fluent builder for one lifecycle hook. Obtained from [`use_lifecycle`].
///
/// Exactly one of the shapes can be added: a starter and/or closer pair, a
/// runnable, or a readiness runnable. Adding conflicting shapes panics.
pub struct LifecycleBuilder {
    spec: Arc<Mutex<HookSpec>>,
}

impl LifecycleBuilder {
    fn with_spec<R>(&self, f: impl FnOnce(&mut HookSpec) -> R) -> R {
        let mut spec = self.spec.lock().unwrap_or_else(PoisonError::into_inner);
        spec.check_live();
        f(&mut spec)
    }

    pub fn add_starter(&self, starter: impl Starter) -> &Self {
        self.with_spec(|spec| {
            spec.check_no_run_shape();
            if spec.starter.is_some() {
                panic!("starter already added to this lifecycle builder");
            }
            spec.starter = Some(Arc::new(starter));
        });
        self
    }

    pub fn add_start_fn<F, Fut>(&self, start: F) -> &Self
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add_starter(FnStarter(start))
    }

    pub fn add_closer(&self, closer: impl Closer) -> &Self {
        self.with_spec(|spec| {
            spec.check_no_run_shape();
            if spec.closer.is_some() {
                panic!("closer already added to this lifecycle builder");
            }
            spec.closer = Some(Arc::new(closer));
        });
        self
    }

    pub fn add_close_fn<F, Fut>(&self, close: F) -> &Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_closer(FnCloser(close))
    }

    pub fn add_runnable(&self, runnable: impl Runnable) -> &Self {
        self.with_spec(|spec| {
            spec.check_can_add_run_shape();
            spec.runnable = Some(Arc::new(runnable));
        });
        self
    }

    pub fn add_run_fn<F, Fut>(&self, run: F) -> &Self
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add_runnable(FnRunnable(run))
    }

    pub fn add_readiness_runnable(&self, runnable: impl ReadinessRunnable) -> &Self {
        self.with_spec(|spec| {
            spec.check_can_add_run_shape();
            spec.readiness = Some(Arc::new(runnable));
        });
        self
    }

    pub fn add_readiness_run_fn<F, Fut>(&self, run: F) -> &Self
    where
        F: Fn(CancelToken, ReadySignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add_readiness_runnable(FnReadinessRunnable(run))
    }

    /// Caps the time the hook's start phase has to become ready. Applies to
    /// starters and readiness runnables; overrides the runner-wide default.
    pub fn start_timeout(&self, timeout: Duration) -> &Self {
        self.with_spec(|spec| spec.start_timeout = Some(timeout));
        self
    }

    /// Treat an `Ok` run result as a failure that triggers shutdown. Applies
    /// to runnables and readiness runnables; a runner-wide setting ORs with
    /// this one.
    pub fn ok_run_result_as_error(&self) -> &Self {
        self.with_spec(|spec| spec.ok_result_as_error = true);
        self
    }

    /// Tags the hook for listener events, independently of the component
    /// tag.
    pub fn tag<V>(&self, value: V) -> &Self
    where
        V: fmt::Debug + Send + Sync + 'static,
    {
        self.with_spec(|spec| spec.tag = Some(Tag::new(value)));
        self
    }
}
