//! Bookkeeping for nodes whose resolution is still in flight: observed
//! edges, collected hook builders and the cascade that finalizes nodes once
//! all of their frames (and their dependencies' frames) are gone.

use std::collections::{HashMap, HashSet};
use std::panic::Location;
use std::sync::{Arc, Mutex};

use crate::error::{ProvideError, TraceFrame};
use crate::info::ComponentId;
use crate::lifecycle::hook::{HookSpec, LifecycleHook};
use crate::resolver::node::{NodeRef, RegState};

struct DependentEdge {
    node: NodeRef,
    /// Call-site inside the dependent's constructor that requested this node.
    called_from: Option<&'static Location<'static>>,
}

struct PendingRecord {
    node: NodeRef,
    depends_on: HashMap<ComponentId, NodeRef>,
    dependents: HashMap<ComponentId, DependentEdge>,
    hook_specs: Vec<Arc<Mutex<HookSpec>>>,
    hooks: Vec<Arc<LifecycleHook>>,
    /// `None` while the node's own frames are still on the stack or in the
    /// late-init queue; afterwards the number of dependencies directly or
    /// transitively still awaiting their own frames.
    waits_for_deps: Option<usize>,
    has_own_or_transitive_hooks: bool,
}

impl PendingRecord {
    fn new(node: NodeRef) -> Self {
        Self {
            node,
            depends_on: HashMap::new(),
            dependents: HashMap::new(),
            hook_specs: Vec::new(),
            hooks: Vec::new(),
            waits_for_deps: None,
            has_own_or_transitive_hooks: false,
        }
    }
}

struct RemoveArgs {
    id: ComponentId,
    reg_err: Option<ProvideError>,
    is_late_init_err: bool,
    report_to_node: bool,
}

#[derive(Default)]
pub(crate) struct PendingNodes {
    records: HashMap<ComponentId, PendingRecord>,
}

impl PendingNodes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records the directed edge dependent -> dependency. A missing dependent
    /// record means it was already removed after an earlier failure; the edge
    /// is dropped then.
    pub(crate) fn add(
        &mut self,
        dependent: Option<&NodeRef>,
        dependency: &NodeRef,
        called_from: Option<&'static Location<'static>>,
    ) {
        match dependency.reg_state() {
            RegState::Unregistered => {
                let dep_id = dependency.id();
                self.records
                    .entry(dep_id)
                    .or_insert_with(|| PendingRecord::new(dependency.clone()));
                if let Some(dependent) = dependent {
                    let dependent_id = dependent.id();
                    if self.records.contains_key(&dependent_id) {
                        if let Some(rec) = self.records.get_mut(&dep_id) {
                            rec.dependents.insert(
                                dependent_id,
                                DependentEdge {
                                    node: dependent.clone(),
                                    called_from,
                                },
                            );
                        }
                        if let Some(rec) = self.records.get_mut(&dependent_id) {
                            rec.depends_on.insert(dep_id, dependency.clone());
                        }
                    }
                }
            }
            RegState::WithHooks => {
                // already registered with hooks: only the dependent side needs
                // the edge, and it inherits reachability of hooks
                if let Some(dependent) = dependent {
                    if let Some(rec) = self.records.get_mut(&dependent.id()) {
                        rec.depends_on.insert(dependency.id(), dependency.clone());
                        rec.has_own_or_transitive_hooks = true;
                    }
                }
            }
            RegState::NoHooks => {
                // the registry short-circuits these before reaching here
                debug_assert!(false, "hook-free registered node reached pending bookkeeping");
            }
        }
    }

    pub(crate) fn add_hook_spec(&mut self, node: &NodeRef, spec: Arc<Mutex<HookSpec>>) {
        let rec = self
            .records
            .get_mut(&node.id())
            .expect("currently resolving node has no pending record");
        // reachability of hooks is decided at finalization; a builder may
        // stay empty and contribute nothing
        rec.hook_specs.push(spec);
    }

    /// Called when the last frame of a node is popped with no error: compute
    /// how many dependencies are still awaiting their own frames, materialize
    /// hooks from the collected builders, and finalize the node if nothing is
    /// left to wait for.
    pub(crate) fn on_last_frame_popped_ok(&mut self, node: &NodeRef) {
        let id = node.id();
        if !self.records.contains_key(&id) {
            // already removed by an error on a deeper frame
            debug_assert!(node.reg_state() != RegState::Unregistered);
            return;
        }

        let dep_nodes: Vec<NodeRef> = self.records[&id].depends_on.values().cloned().collect();
        let mut waits = 0;
        for dep in &dep_nodes {
            let mut visited = HashSet::new();
            visited.insert(id);
            waits += self.count_waiting(dep, &mut visited);
        }

        let rec = self.records.get_mut(&id).expect("record checked above");
        rec.waits_for_deps = Some(waits);
        let specs = std::mem::take(&mut rec.hook_specs);
        for spec in specs {
            let hook = spec
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take_hook();
            if let Some(hook) = hook {
                rec.hooks.push(hook);
            }
        }
        if !rec.hooks.is_empty() {
            rec.has_own_or_transitive_hooks = true;
        }

        if waits == 0 {
            self.remove(RemoveArgs {
                id,
                reg_err: None,
                is_late_init_err: false,
                report_to_node: false,
            });
        }
    }

    /// Called when a node's frame popped with an error. `report_to_node` is
    /// false when the node already memoized its own failure.
    pub(crate) fn on_frame_err(&mut self, node: &NodeRef, err: ProvideError, report_to_node: bool) {
        self.remove(RemoveArgs {
            id: node.id(),
            reg_err: Some(err),
            is_late_init_err: false,
            report_to_node,
        });
    }

    /// A late-init callback failed. Unlike constructor errors this cascades
    /// to every dependent that already captured the node: they had no chance
    /// to reject the failed dependency.
    pub(crate) fn on_late_init_frame_err(&mut self, node: &NodeRef, err: ProvideError) {
        self.remove(RemoveArgs {
            id: node.id(),
            reg_err: Some(err),
            is_late_init_err: true,
            report_to_node: true,
        });
    }

    /// Number of dependencies of `node` that are directly or transitively
    /// still awaiting their own frames. Dependencies that only wait through
    /// nodes already visited (a cycle back into the caller) do not count.
    fn count_waiting(&self, node: &NodeRef, visited: &mut HashSet<ComponentId>) -> usize {
        if !visited.insert(node.id()) {
            return 0;
        }
        let Some(rec) = self.records.get(&node.id()) else {
            // already received its registration result
            return 0;
        };
        match rec.waits_for_deps {
            None => 1,
            Some(0) => 0,
            Some(expected) => {
                let mut count = 0;
                for dep in rec.depends_on.values() {
                    count += self.count_waiting(dep, visited);
                    if count >= expected {
                        debug_assert!(count <= expected);
                        break;
                    }
                }
                count
            }
        }
    }

    fn node_has_reachable_hooks(
        &self,
        node: &NodeRef,
        visited: &mut HashSet<ComponentId>,
    ) -> bool {
        if !visited.insert(node.id()) {
            return false;
        }
        let Some(rec) = self.records.get(&node.id()) else {
            return node.reg_state() == RegState::WithHooks;
        };
        if rec.has_own_or_transitive_hooks || !rec.hooks.is_empty() {
            return true;
        }
        rec.depends_on
            .values()
            .any(|dep| self.node_has_reachable_hooks(dep, visited))
    }

    fn remove(&mut self, args: RemoveArgs) {
        let Some(mut rec) = self.records.remove(&args.id) else {
            // stops cyclic removal
            return;
        };

        for dep_id in rec.depends_on.keys() {
            if let Some(dep_rec) = self.records.get_mut(dep_id) {
                dep_rec.dependents.remove(&args.id);
            }
        }

        let mut cascades = Vec::new();
        for (dependent_id, edge) in &rec.dependents {
            let Some(dependent_rec) = self.records.get_mut(dependent_id) else {
                // already removed recursively
                continue;
            };
            if args.reg_err.is_some() {
                // the dependent must not end up depending on the failed node
                dependent_rec.depends_on.remove(&args.id);
            }
            let Some(waits) = dependent_rec.waits_for_deps else {
                // the dependent's own frames are still running: it may still
                // tolerate the failure, and a late-init error cannot concern
                // it yet
                continue;
            };
            debug_assert!(waits > 0, "dependent with zero waits still pending");
            let waits = waits.saturating_sub(1);
            dependent_rec.waits_for_deps = Some(waits);

            if args.is_late_init_err || waits == 0 {
                let reg_err = if args.is_late_init_err {
                    args.reg_err
                        .as_ref()
                        .map(|err| tailor_late_init_err(&edge.node, edge.called_from, err))
                } else {
                    args.reg_err.clone()
                };
                cascades.push(RemoveArgs {
                    id: *dependent_id,
                    reg_err,
                    is_late_init_err: args.is_late_init_err,
                    report_to_node: true,
                });
            }
        }

        if args.reg_err.is_some() {
            rec.hook_specs.clear();
            rec.hooks.clear();
            rec.depends_on.clear();
            rec.has_own_or_transitive_hooks = false;
        } else if !rec.has_own_or_transitive_hooks {
            let mut visited = HashSet::new();
            visited.insert(args.id);
            let deps: Vec<NodeRef> = rec.depends_on.values().cloned().collect();
            rec.has_own_or_transitive_hooks = deps
                .iter()
                .any(|dep| self.node_has_reachable_hooks(dep, &mut visited));
        }

        // a self-edge left behind by a tolerated cycle is dropped here
        let depends_on: Vec<NodeRef> = rec
            .depends_on
            .iter()
            .filter(|(id, _)| **id != args.id)
            .map(|(_, node)| node.clone())
            .collect();

        let err_to_report = if args.report_to_node {
            args.reg_err.clone()
        } else {
            None
        };
        if args.reg_err.is_some() {
            tracing::debug!(component = %rec.node.info(), "component registration failed");
        } else {
            tracing::debug!(
                component = %rec.node.info(),
                hooks = rec.hooks.len(),
                deps = depends_on.len(),
                "component registered"
            );
        }
        rec.node.set_reg_result(
            err_to_report,
            depends_on,
            rec.hooks.clone(),
            rec.has_own_or_transitive_hooks,
        );

        for cascade in cascades {
            self.remove(cascade);
        }
    }
}

/// Reconstructs the dependent's frame on top of the failed late-init chain
/// so the error reads from the dependent's point of view.
fn tailor_late_init_err(
    dependent: &NodeRef,
    called_from: Option<&'static Location<'static>>,
    err: &ProvideError,
) -> ProvideError {
    match err {
        ProvideError::Registration(failure) => {
            let mut failure = failure.clone();
            failure.push_frame(TraceFrame {
                component: dependent.info(),
                late_init: None,
                entered_from: called_from,
            });
            ProvideError::Registration(failure)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::node::ComponentNode;
    use std::panic::Location;

    fn node(v: u32) -> NodeRef {
        ComponentNode::new(Box::new(move || Ok(v)), Location::caller(), "provide")
    }

    #[test]
    fn lone_node_finalizes_on_last_frame() {
        let mut pending = PendingNodes::new();
        let n = node(1);
        pending.add(None, &n, None);
        pending.on_last_frame_popped_ok(&n);
        assert!(pending.is_empty());
        assert!(n.is_registered());
        assert_eq!(n.reg_state(), RegState::NoHooks);
    }

    #[test]
    fn dependent_waits_for_pending_dependency() {
        let mut pending = PendingNodes::new();
        let a = node(1);
        let b = node(2);
        // b's provider is entered from a's frame; a's frames finish first
        pending.add(None, &a, None);
        pending.add(Some(&a), &b, Some(Location::caller()));
        // b still awaits its own frames when a's last frame pops
        pending.on_last_frame_popped_ok(&a);
        assert!(!a.is_registered());
        pending.on_last_frame_popped_ok(&b);
        assert!(b.is_registered());
        assert!(a.is_registered());
        assert!(pending.is_empty());
        assert_eq!(a.depends_on().len(), 1);
    }

    #[test]
    fn failed_dependency_is_dropped_from_tolerant_dependent() {
        let mut pending = PendingNodes::new();
        let a = node(1);
        let b = node(2);
        pending.add(None, &a, None);
        pending.add(Some(&a), &b, Some(Location::caller()));
        // b fails while a's own frames are still running: a may tolerate it
        let frame = TraceFrame {
            component: b.info(),
            late_init: None,
            entered_from: None,
        };
        let err = ProvideError::user(frame, "db down".into());
        pending.on_frame_err(&b, err, false);
        assert!(b.is_registered(), "failed node still gets a reg result");
        assert!(!a.is_registered(), "a decides its own fate later");
        pending.on_last_frame_popped_ok(&a);
        assert!(a.is_registered());
        assert!(a.depends_on().is_empty(), "edge to the failed dep is gone");
        assert!(a.memoized_error().is_none());
    }

    #[test]
    fn late_init_error_cascades_to_finished_dependents() {
        let mut pending = PendingNodes::new();
        let a = node(1);
        let b = node(2);
        pending.add(None, &a, None);
        pending.add(Some(&a), &b, Some(Location::caller()));
        // both constructors returned; b still owes a late-init
        pending.on_last_frame_popped_ok(&a);
        let frame = TraceFrame {
            component: b.info(),
            late_init: None,
            entered_from: None,
        };
        let err = ProvideError::late_init(frame, "late wiring failed".into());
        pending.on_late_init_frame_err(&b, err);
        assert!(pending.is_empty());
        assert!(a.is_registered());
        let a_err = a.memoized_error().expect("a must be cascaded");
        let frames = a_err.registration().unwrap().frames();
        assert_eq!(frames.len(), 2, "chain gains the dependent frame");
    }
}
