//! The lazy singleton node wrapping one user constructor.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{BoxError, CycleTrace, ProvideError};
use crate::info::{ComponentId, ComponentInfo, Tag};
use crate::lifecycle::hook::LifecycleHook;

/// Type-erased handle to a component node, shared by the registry, the
/// pending-node bookkeeping and the lifecycle graph builder.
pub(crate) type NodeRef = Arc<dyn AnyNode>;

/// Registration state of a node once its resolution finished.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RegState {
    Unregistered,
    /// The node or some transitive dependency contributes a lifecycle hook.
    WithHooks,
    /// Neither the node nor its dependencies carry hooks, so future accessor
    /// calls can skip edge tracking entirely.
    NoHooks,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Providing {
    NotStarted,
    InProgress,
    Provided,
}

/// Outcome of running (or re-reading) a node's constructor.
pub(crate) enum ProvidingOutcome {
    Ok,
    Failed(ProvideError),
    Panicked(Box<dyn Any + Send>),
}

pub(crate) trait AnyNode: Send + Sync + 'static {
    fn id(&self) -> ComponentId;
    fn info(&self) -> ComponentInfo;
    fn set_tag(&self, tag: Tag);

    /// Fast path readable outside the resolver lock.
    fn is_registered(&self) -> bool;
    fn reg_state(&self) -> RegState;

    fn lifecycle_hooks(&self) -> Vec<Arc<LifecycleHook>>;
    fn depends_on(&self) -> Vec<NodeRef>;
    fn provided_value_any(&self) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Runs the constructor if it has not run yet, memoizing the result.
    /// A call while the node is `InProgress` is a re-entry through the
    /// resolution stack: the cycle produced by `make_cycle` is memoized
    /// unless the in-flight outer call later overrides it (a tolerated
    /// cycle).
    fn start_providing(&self, make_cycle: &dyn Fn() -> CycleTrace) -> ProvidingOutcome;

    /// Finalizes the node when its last frame leaves the resolver.
    fn set_reg_result(
        &self,
        reg_err: Option<ProvideError>,
        depends_on: Vec<NodeRef>,
        hooks: Vec<Arc<LifecycleHook>>,
        has_own_or_transitive_hooks: bool,
    );

    fn memoized_error(&self) -> Option<ProvideError>;
}

pub(crate) struct ComponentNode<T> {
    id: ComponentId,
    type_name: &'static str,
    ctor_kind: &'static str,
    defined_at: &'static Location<'static>,
    tag: Mutex<Option<Tag>>,
    is_registered: AtomicBool,
    state: Mutex<NodeState<T>>,
}

struct NodeState<T> {
    reg_state: RegState,
    providing: Providing,
    // released after the single call
    constructor: Option<Box<dyn FnOnce() -> Result<T, BoxError> + Send>>,
    value: Option<T>,
    error: Option<ProvideError>,
    depends_on: Vec<NodeRef>,
    hooks: Vec<Arc<LifecycleHook>>,
}

impl<T> ComponentNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        constructor: Box<dyn FnOnce() -> Result<T, BoxError> + Send>,
        defined_at: &'static Location<'static>,
        ctor_kind: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: crate::resolver::registry::registry().allocate_id(),
            type_name: std::any::type_name::<T>(),
            ctor_kind,
            defined_at,
            tag: Mutex::new(None),
            is_registered: AtomicBool::new(false),
            state: Mutex::new(NodeState {
                reg_state: RegState::Unregistered,
                providing: Providing::NotStarted,
                constructor: Some(constructor),
                value: None,
                error: None,
                depends_on: Vec::new(),
                hooks: Vec::new(),
            }),
        })
    }

    /// The memoized outcome. Valid once providing finished; both parts are
    /// identical across calls.
    pub(crate) fn memoized(&self) -> (Option<T>, Option<ProvideError>) {
        let st = self.lock_state();
        (st.value.clone(), st.error.clone())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> AnyNode for ComponentNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> ComponentId {
        self.id
    }

    fn info(&self) -> ComponentInfo {
        ComponentInfo {
            id: self.id,
            type_name: self.type_name,
            ctor_kind: self.ctor_kind,
            defined_at: self.defined_at,
            tag: self.tag.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    fn set_tag(&self, tag: Tag) {
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner) = Some(tag);
    }

    fn is_registered(&self) -> bool {
        self.is_registered.load(Ordering::Acquire)
    }

    fn reg_state(&self) -> RegState {
        self.lock_state().reg_state
    }

    fn lifecycle_hooks(&self) -> Vec<Arc<LifecycleHook>> {
        self.lock_state().hooks.clone()
    }

    fn depends_on(&self) -> Vec<NodeRef> {
        self.lock_state().depends_on.clone()
    }

    fn provided_value_any(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        let st = self.lock_state();
        st.value
            .as_ref()
            .map(|v| Arc::new(v.clone()) as Arc<dyn Any + Send + Sync>)
    }

    fn start_providing(&self, make_cycle: &dyn Fn() -> CycleTrace) -> ProvidingOutcome {
        let mut st = self.lock_state();
        match st.providing {
            Providing::InProgress => {
                // re-entered through the stack while the constructor runs.
                // The error can only be produced once; memoize it so every
                // later accessor sees the same cycle, unless the outer call
                // tolerates it and overrides the outcome below.
                if st.error.is_none() {
                    drop(st);
                    let trace = make_cycle();
                    st = self.lock_state();
                    if st.error.is_none() {
                        st.error = Some(ProvideError::Cyclic(trace));
                    }
                }
                st.providing = Providing::Provided;
                ProvidingOutcome::Failed(st.error.clone().expect("cycle error just memoized"))
            }
            Providing::Provided => match st.error.clone() {
                Some(err) => ProvidingOutcome::Failed(err),
                None => ProvidingOutcome::Ok,
            },
            Providing::NotStarted => {
                st.providing = Providing::InProgress;
                let ctor = st
                    .constructor
                    .take()
                    .expect("constructor must be present before the first call");
                drop(st);

                let result = catch_unwind(AssertUnwindSafe(ctor));

                let mut st = self.lock_state();
                st.providing = Providing::Provided;
                match result {
                    Ok(Ok(value)) => {
                        // overrides a cycle error recorded by a nested
                        // re-entry: the constructor chose to proceed without
                        // the cyclic dependency, so the node is functional
                        st.value = Some(value);
                        st.error = None;
                        ProvidingOutcome::Ok
                    }
                    Ok(Err(err)) => {
                        // an error propagated from a dependency accessor is
                        // memoized as-is so dependents keep observing its
                        // original shape (a cycle stays a cycle)
                        let err = match err.downcast::<ProvideError>() {
                            Ok(inner) => *inner,
                            Err(err) => {
                                let frame = crate::error::TraceFrame {
                                    component: self.info(),
                                    late_init: None,
                                    entered_from: None,
                                };
                                ProvideError::user(frame, err)
                            }
                        };
                        st.error = Some(err.clone());
                        ProvidingOutcome::Failed(err)
                    }
                    Err(payload) => ProvidingOutcome::Panicked(payload),
                }
            }
        }
    }

    fn set_reg_result(
        &self,
        reg_err: Option<ProvideError>,
        depends_on: Vec<NodeRef>,
        hooks: Vec<Arc<LifecycleHook>>,
        has_own_or_transitive_hooks: bool,
    ) {
        debug_assert!(
            !self.is_registered(),
            "node {} is already registered",
            self.id
        );
        let mut st = self.lock_state();
        if let Some(err) = reg_err {
            // the error slot may already hold a cycle or constructor error;
            // the first one recorded stays authoritative
            if st.error.is_none() {
                st.error = Some(err);
            }
        }
        st.depends_on = depends_on;
        st.hooks = hooks;
        st.reg_state = if has_own_or_transitive_hooks {
            RegState::WithHooks
        } else {
            RegState::NoHooks
        };
        drop(st);
        self.is_registered.store(true, Ordering::Release);
    }

    fn memoized_error(&self) -> Option<ProvideError> {
        self.lock_state().error.clone()
    }
}
