//! The process-wide registry serializing root resolution chains.
//!
//! Only one root accessor call may resolve at a time: roots queue on the
//! `root_gate` mutex, the crate's rendition of an empty-stack permit. Once a
//! chain is running, every mutation of the shared state happens from the
//! thread holding the gate, so the inner state lock is never contended; it
//! only makes the structure safe to hand between consecutive root callers.
//!
//! Whether an accessor call is nested inside a running constructor is decided
//! by a thread-local marker instead of stack inspection. A consequence,
//! shared with the reference behavior: constructors must not call accessors
//! from tasks or threads they spawn, or those calls queue behind the gate the
//! constructor itself is holding.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use crate::error::{CycleTrace, ProvideError, TraceFrame};
use crate::info::{ComponentId, Tag};
use crate::lifecycle::hook::HookSpec;
use crate::resolver::frames::{LateInitFn, NodeFrames};
use crate::resolver::node::{NodeRef, ProvidingOutcome, RegState};
use crate::resolver::pending::PendingNodes;

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

pub(crate) fn registry() -> &'static Registry {
    &GLOBAL
}

thread_local! {
    static IN_PROVIDER_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// True while a constructor or late-init callback runs on this thread.
pub(crate) fn in_provider_context() -> bool {
    IN_PROVIDER_CONTEXT.with(Cell::get)
}

struct ChainGuard;

impl ChainGuard {
    fn enter() -> Self {
        IN_PROVIDER_CONTEXT.with(|c| c.set(true));
        ChainGuard
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        IN_PROVIDER_CONTEXT.with(|c| c.set(false));
    }
}

pub(crate) struct ResolverState {
    pub frames: NodeFrames,
    pub pending: PendingNodes,
}

pub(crate) struct Registry {
    next_id: AtomicU64,
    root_gate: Mutex<()>,
    state: Mutex<ResolverState>,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            root_gate: Mutex::new(()),
            state: Mutex::new(ResolverState {
                frames: NodeFrames::new(),
                pending: PendingNodes::new(),
            }),
        }
    }

    pub(crate) fn allocate_id(&self) -> ComponentId {
        ComponentId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry point for every accessor call. Returns the dependent node whose
    /// constructor requested this component, if the call was nested.
    pub(crate) fn on_get_component(
        &self,
        node: &NodeRef,
        call_site: &'static Location<'static>,
    ) -> Option<NodeRef> {
        if in_provider_context() {
            let dependent = {
                let st = self.lock_state();
                st.frames.top().map(|frame| frame.node().clone())
            };
            if node.reg_state() == RegState::NoHooks {
                // already provided with no reachable hooks: nothing to track
                return dependent;
            }
            self.resolve_frame(node.clone(), Some(call_site));
            dependent
        } else {
            if node.is_registered() {
                // avoids queuing on the gate for an already memoized node
                return None;
            }
            let _gate = self
                .root_gate
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if node.is_registered() {
                // registered while this caller waited for the gate
                return None;
            }
            let _chain = ChainGuard::enter();
            tracing::debug!(component = %node.info(), "root resolution started");
            self.resolve_frame(node.clone(), None);
            // the gate guard drops only after the whole chain, including
            // queued late-inits, has unwound
            None
        }
    }

    fn resolve_frame(&self, node: NodeRef, entered_from: Option<&'static Location<'static>>) {
        {
            let mut st = self.lock_state();
            let dependent = st.frames.top().map(|frame| frame.node().clone());
            st.pending.add(dependent.as_ref(), &node, entered_from);
            st.frames.push_provider(node.clone(), entered_from);
        }

        let make_cycle = || {
            let st = self.lock_state();
            cycle_trace_from_stack(&st.frames, node.id())
        };
        let outcome = node.start_providing(&make_cycle);

        let (frame_err, report_to_node) = match outcome {
            ProvidingOutcome::Ok => (None, false),
            ProvidingOutcome::Failed(err) => {
                // the node memoized its own failure already; the wrapped form
                // only travels to dependents that were waiting on this node
                let frame = TraceFrame {
                    component: node.info(),
                    late_init: None,
                    entered_from,
                };
                (Some(ProvideError::wrap_frame(frame, err)), false)
            }
            ProvidingOutcome::Panicked(payload) => {
                let frame = TraceFrame {
                    component: node.info(),
                    late_init: None,
                    entered_from,
                };
                (Some(ProvideError::from_panic(frame, payload)), true)
            }
        };

        let stack_emptied = {
            let mut st = self.lock_state();
            let (frame, is_last) = st.frames.pop_top(frame_err.is_some());
            debug_assert_eq!(frame.node().id(), node.id());
            match &frame_err {
                None => {
                    if is_last {
                        st.pending.on_last_frame_popped_ok(&node);
                    }
                }
                Some(err) => st.pending.on_frame_err(&node, err.clone(), report_to_node),
            }
            st.frames.stack_len() == 0
        };

        if stack_emptied {
            self.drain_late_inits();
        }
    }

    /// Runs queued late-init callbacks one by one after the stack unwound
    /// from a root call. Each executes in the same single-writer context as a
    /// constructor and may enqueue further late-inits.
    fn drain_late_inits(&self) {
        loop {
            let (callback, trace, node) = {
                let mut st = self.lock_state();
                if st.frames.late_init_queue_len() == 0 {
                    break;
                }
                st.frames.pop_queued_late_init_to_stack()
            };

            let result = catch_unwind(AssertUnwindSafe(callback));
            let frame_err = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(ProvideError::late_init(trace.clone(), err)),
                Err(payload) => Some(ProvideError::from_panic(trace.clone(), payload)),
            };

            let mut st = self.lock_state();
            let (_, is_last) = st.frames.pop_top(frame_err.is_some());
            if is_last {
                match frame_err {
                    Some(err) => st.pending.on_late_init_frame_err(&node, err),
                    None => st.pending.on_last_frame_popped_ok(&node),
                }
            }
        }
    }

    /// Id of the component whose constructor or late-init is currently
    /// running, if any.
    pub(crate) fn current_component_id(&self) -> Option<ComponentId> {
        if !in_provider_context() {
            return None;
        }
        let st = self.lock_state();
        st.frames.top().map(|frame| frame.node().id())
    }

    /// Tags the currently providing component. Returns false outside a
    /// provider context.
    pub(crate) fn set_current_tag(&self, tag: Tag) -> bool {
        if !in_provider_context() {
            return false;
        }
        let node = {
            let st = self.lock_state();
            match st.frames.top() {
                Some(frame) => frame.node().clone(),
                None => return false,
            }
        };
        node.set_tag(tag);
        true
    }

    /// Registers a hook builder on the currently providing node. Returns
    /// `None` outside a provider context.
    pub(crate) fn add_lifecycle_spec(
        &self,
        registered_at: &'static Location<'static>,
    ) -> Option<Arc<Mutex<HookSpec>>> {
        if !in_provider_context() {
            return None;
        }
        let mut st = self.lock_state();
        let node = st.frames.top()?.node().clone();
        let spec = Arc::new(Mutex::new(HookSpec::new(registered_at)));
        st.pending.add_hook_spec(&node, spec.clone());
        Some(spec)
    }

    /// Enqueues a late-init callback bound to the currently providing node.
    /// Returns false outside a provider context.
    pub(crate) fn push_late_init(
        &self,
        callback: LateInitFn,
        registered_at: &'static Location<'static>,
    ) -> bool {
        if !in_provider_context() {
            return false;
        }
        let mut st = self.lock_state();
        if st.frames.top().is_none() {
            return false;
        }
        st.frames.push_late_init(callback, registered_at);
        true
    }
}

/// Walks the stack from the top (the re-entered node's fresh frame) down to
/// the previous frame of the same node, collecting the path that forms the
/// cycle.
fn cycle_trace_from_stack(frames: &NodeFrames, reentered: ComponentId) -> CycleTrace {
    let mut collected = Vec::new();
    for frame in frames.iter_from_top() {
        if !collected.is_empty() && frame.node().id() == reentered {
            break;
        }
        collected.push(frame.trace_frame());
    }
    CycleTrace { frames: collected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provide;

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let a = registry().allocate_id();
        let b = registry().allocate_id();
        assert!(a.get() > 0);
        assert!(b.get() > a.get());
    }

    #[test]
    fn provider_context_is_visible_inside_constructors() {
        assert!(!in_provider_context());
        let component = provide(|| {
            assert!(in_provider_context());
            7u32
        });
        assert_eq!(component.get(), 7);
        assert!(!in_provider_context());
    }

    #[test]
    fn root_chains_serialize_on_the_gate() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let active = Arc::new(AtomicUsize::new(0));
        let overlap_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let active = active.clone();
            let overlap_seen = overlap_seen.clone();
            handles.push(std::thread::spawn(move || {
                let component = provide(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst);
                    if now > 0 {
                        overlap_seen.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    1u8
                });
                component.get()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(
            overlap_seen.load(Ordering::SeqCst),
            0,
            "two root constructors ran concurrently"
        );
    }
}
