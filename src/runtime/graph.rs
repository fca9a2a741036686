//! Collapsing the component graph into the lifecycle-hook graph.
//!
//! A depth-first traversal of component dependencies produces one graph node
//! per lifecycle hook. Components without hooks dissolve into transitive
//! edges. A construction cycle is tolerated as long as at most one
//! hook-bearing component sits on it; two or more make a start order
//! impossible.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::info::{ComponentId, ComponentInfo, Tag};
use crate::lifecycle::hook::{HookKind, LifecycleHook};
use crate::resolver::node::NodeRef;
use crate::runtime::error::LifecycleCyclePath;

/// Identity and metadata of one lifecycle hook, as seen by listeners,
/// errors and [`HookNode`](crate::HookNode) observers.
#[derive(Clone)]
pub struct HookInfo {
    pub(crate) hook: Arc<LifecycleHook>,
    pub(crate) component: ComponentInfo,
    pub(crate) value: Option<Arc<dyn Any + Send + Sync>>,
}

impl HookInfo {
    /// Identity of the hook, stable for the lifetime of the runner.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.hook) as *const () as usize
    }

    pub fn kind(&self) -> HookKind {
        self.hook.kind
    }

    /// The hook-level tag set through the lifecycle builder.
    pub fn tag(&self) -> Option<&Tag> {
        self.hook.tag.as_ref()
    }

    pub fn registered_at(&self) -> &'static Location<'static> {
        self.hook.registered_at
    }

    /// The component owning this hook.
    pub fn component(&self) -> &ComponentInfo {
        &self.component
    }

    /// The provided component value, when it is of type `T`.
    pub fn component_value_as<T>(&self) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.value.as_ref()?.downcast_ref::<T>().cloned()
    }
}

impl fmt::Display for HookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hook.kind)?;
        if let Some(tag) = &self.hook.tag {
            write!(f, " (tag: {tag})")?;
        }
        write!(
            f,
            " registered at {} in {}",
            self.hook.registered_at, self.component
        )
    }
}

impl fmt::Debug for HookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub(crate) struct LcNode {
    pub hook: Arc<LifecycleHook>,
    pub info: HookInfo,
    pub depends_on: Vec<usize>,
    pub dependents: Vec<usize>,
}

pub(crate) struct LcGraph {
    pub nodes: Vec<LcNode>,
    pub roots: Vec<usize>,
    pub leaves: Vec<usize>,
}

impl LcGraph {
    pub(crate) fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            leaves: Vec::new(),
        }
    }

    pub(crate) fn build(root: &NodeRef) -> Result<Self, LifecycleCyclePath> {
        let mut builder = Builder {
            temp: HashSet::new(),
            perm: HashSet::new(),
            visiting: Vec::new(),
            transitive: HashMap::new(),
            pre_created: HashMap::new(),
            nodes: Vec::new(),
        };
        builder.visit(root)?;
        debug_assert!(
            builder.pre_created.is_empty(),
            "pre-created hook nodes left unfilled after the traversal"
        );

        let mut nodes = builder.nodes;
        for idx in 0..nodes.len() {
            let deps = nodes[idx].depends_on.clone();
            for dep in deps {
                nodes[dep].dependents.push(idx);
            }
        }
        let mut roots = Vec::new();
        let mut leaves = Vec::new();
        for (idx, node) in nodes.iter().enumerate() {
            if node.dependents.is_empty() {
                roots.push(idx);
            }
            if node.depends_on.is_empty() {
                leaves.push(idx);
            }
        }
        debug_assert!(nodes.is_empty() || (!roots.is_empty() && !leaves.is_empty()));
        Ok(Self {
            nodes,
            roots,
            leaves,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

struct Builder {
    /// Nodes on the active traversal path.
    temp: HashSet<ComponentId>,
    /// Nodes whose traversal finished.
    perm: HashSet<ComponentId>,
    visiting: Vec<NodeRef>,
    /// Component -> lifecycle nodes reachable through it (own or via
    /// hook-free dependencies).
    transitive: HashMap<ComponentId, Vec<usize>>,
    /// Hook nodes created at the second visit of a tolerated cycle; their
    /// `depends_on` is filled when the first visit completes.
    pre_created: HashMap<ComponentId, Vec<usize>>,
    nodes: Vec<LcNode>,
}

impl Builder {
    fn visit(&mut self, node: &NodeRef) -> Result<(), LifecycleCyclePath> {
        self.visiting.push(node.clone());
        let result = self.visit_inner(node);
        self.visiting.pop();
        result
    }

    fn visit_inner(&mut self, node: &NodeRef) -> Result<(), LifecycleCyclePath> {
        let id = node.id();
        if self.perm.contains(&id) {
            return Ok(());
        }
        if self.temp.contains(&id) {
            // a construction cycle. It only rules out a start order when two
            // or more hook-bearing components sit on it; otherwise the
            // cycling components do not constrain each other's hooks.
            let mut hook_bearing = usize::from(!node.lifecycle_hooks().is_empty());
            if hook_bearing <= 1 {
                for candidate in self.visiting.iter().rev().skip(1) {
                    if candidate.id() == id {
                        break;
                    }
                    if !candidate.lifecycle_hooks().is_empty() {
                        hook_bearing += 1;
                        if hook_bearing > 1 {
                            break;
                        }
                    }
                }
            }
            if hook_bearing > 1 {
                return Err(self.cycle_path(id));
            }
            if !node.lifecycle_hooks().is_empty() {
                // second visit: pre-create the hook nodes so dependents pick
                // them up; their own dependencies are known only when the
                // first visit completes
                let own = self.create_lc_nodes(node, &[]);
                self.pre_created.insert(id, own);
            }
            return Ok(());
        }

        self.temp.insert(id);
        let deps = node.depends_on();
        for dep in &deps {
            self.visit(dep)?;
        }
        self.temp.remove(&id);
        self.perm.insert(id);

        // union of the dependencies' reachable hook nodes, excluding this
        // component's own (a self-loop through a tolerated cycle)
        let mut depends_on = Vec::new();
        let mut seen = HashSet::new();
        for dep in &deps {
            if let Some(reachable) = self.transitive.get(&dep.id()) {
                for &lc_idx in reachable {
                    if self.nodes[lc_idx].info.component.id() == id {
                        continue;
                    }
                    if seen.insert(lc_idx) {
                        depends_on.push(lc_idx);
                    }
                }
            }
        }

        if !node.lifecycle_hooks().is_empty() {
            if let Some(own) = self.pre_created.remove(&id) {
                for &idx in &own {
                    self.nodes[idx].depends_on = depends_on.clone();
                }
            } else {
                self.create_lc_nodes(node, &depends_on);
            }
        } else if !depends_on.is_empty() {
            self.transitive.insert(id, depends_on);
        }
        Ok(())
    }

    /// One graph node per hook; siblings of the same component share the
    /// dependency set and have no mutual ordering.
    fn create_lc_nodes(&mut self, node: &NodeRef, depends_on: &[usize]) -> Vec<usize> {
        let hooks = node.lifecycle_hooks();
        let component = node.info();
        let value = node.provided_value_any();
        let mut own = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let idx = self.nodes.len();
            self.nodes.push(LcNode {
                info: HookInfo {
                    hook: hook.clone(),
                    component: component.clone(),
                    value: value.clone(),
                },
                hook,
                depends_on: depends_on.to_vec(),
                dependents: Vec::new(),
            });
            own.push(idx);
        }
        self.transitive.insert(node.id(), own.clone());
        own
    }

    fn cycle_path(&self, reentered: ComponentId) -> LifecycleCyclePath {
        // the root-most entry adds nothing to the picture
        let stack = self
            .visiting
            .iter()
            .skip(1)
            .map(|node| node.info())
            .collect();
        LifecycleCyclePath {
            stack,
            marked: reentered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::use_lifecycle;
    use crate::provide;

    fn hooked(label: &'static str) -> crate::Component<&'static str> {
        provide(move || {
            use_lifecycle().add_start_fn(|_ctx| async { Ok(()) }).tag(label);
            label
        })
    }

    #[test]
    fn chain_produces_one_node_per_hook_with_edges() {
        let a = hooked("a");
        let b = {
            let a = a.clone();
            provide(move || {
                use_lifecycle().add_start_fn(|_ctx| async { Ok(()) });
                a.get()
            })
        };
        b.get();
        let graph = LcGraph::build(&b.node_ref()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.roots.len(), 1);
        assert_eq!(graph.leaves.len(), 1);
        let root = &graph.nodes[graph.roots[0]];
        assert_eq!(root.depends_on.len(), 1);
    }

    #[test]
    fn hook_free_component_dissolves_into_transitive_edges() {
        let a = hooked("a");
        let middle = {
            let a = a.clone();
            provide(move || a.get())
        };
        let b = {
            let middle = middle.clone();
            provide(move || {
                use_lifecycle().add_start_fn(|_ctx| async { Ok(()) });
                middle.get()
            })
        };
        b.get();
        let graph = LcGraph::build(&b.node_ref()).unwrap();
        assert_eq!(graph.len(), 2, "the hook-free middle adds no node");
        let root = &graph.nodes[graph.roots[0]];
        assert_eq!(root.depends_on.len(), 1, "edge passes through the middle");
    }

    #[test]
    fn sibling_hooks_share_dependencies() {
        let a = hooked("a");
        let b = {
            let a = a.clone();
            provide(move || {
                use_lifecycle().add_start_fn(|_ctx| async { Ok(()) });
                use_lifecycle().add_close_fn(|| async {});
                a.get()
            })
        };
        b.get();
        let graph = LcGraph::build(&b.node_ref()).unwrap();
        assert_eq!(graph.len(), 3, "two sibling hooks plus the dependency");
        let siblings: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| !n.depends_on.is_empty())
            .collect();
        assert_eq!(siblings.len(), 2);
        assert_eq!(siblings[0].depends_on, siblings[1].depends_on);
    }

    #[test]
    fn empty_lifecycle_builder_contributes_nothing() {
        let component = provide(|| {
            let _ = use_lifecycle();
            1u8
        });
        component.get();
        let graph = LcGraph::build(&component.node_ref()).unwrap();
        assert_eq!(graph.len(), 0);
    }
}
