//! Defining components and accessing them through lazy singleton accessors.

use std::panic::Location;
use std::sync::Arc;

use crate::error::{BoxError, ProvideError};
use crate::info::{ComponentId, Tag};
use crate::resolver::node::{AnyNode, ComponentNode, NodeRef};
use crate::resolver::registry::registry;

/// Defines a component whose constructor cannot fail.
///
/// The constructor runs lazily, at most once, on the first accessor call.
/// Calls to other accessors made inside the constructor are observed by the
/// resolver and become dependency edges.
///
/// # Example
///
/// ```rust,no_run
/// use armature::provide;
/// use std::sync::{Arc, LazyLock};
///
/// struct Config { addr: String }
/// struct Server { config: Arc<Config> }
///
/// static CONFIG: LazyLock<armature::Component<Arc<Config>>> =
///     LazyLock::new(|| provide(|| Arc::new(Config { addr: "0.0.0.0:80".into() })));
///
/// static SERVER: LazyLock<armature::Component<Arc<Server>>> =
///     LazyLock::new(|| provide(|| Arc::new(Server { config: CONFIG.get() })));
/// ```
#[track_caller]
pub fn provide<T, F>(constructor: F) -> Component<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Component {
        node: ComponentNode::new(
            Box::new(move || Ok(constructor())),
            Location::caller(),
            "provide",
        ),
    }
}

/// Defines a component whose constructor may fail with an error.
///
/// The error is memoized together with the (absent) value and returned from
/// [`Component::try_get`] on every call. A dependent constructor may catch it
/// and proceed without the dependency; no edge is recorded in that case.
#[track_caller]
pub fn provide_with_error<T, F, E>(constructor: F) -> Component<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
    E: Into<BoxError>,
{
    Component {
        node: ComponentNode::new(
            Box::new(move || constructor().map_err(Into::into)),
            Location::caller(),
            "provide_with_error",
        ),
    }
}

/// The accessor for a component: a cloneable handle whose `get`/`try_get`
/// return the memoized singleton, constructing it on first use.
///
/// Accessors are cheap to clone and safe to stash in `LazyLock` statics or
/// move into other constructors.
pub struct Component<T> {
    node: Arc<ComponentNode<T>>,
}

impl<T> Clone for Component<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> Component<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns the component, resolving it first if needed.
    ///
    /// Returns an error when the constructor (or one of its late-inits)
    /// failed, or when a construction cycle was detected. Failures caused by
    /// a panic in user code re-panic instead, carrying the structured
    /// [`ProvideError`] as payload.
    #[track_caller]
    pub fn try_get(&self) -> Result<T, ProvideError> {
        let node: NodeRef = self.node.clone();
        let dependent = registry().on_get_component(&node, Location::caller());
        let (value, error) = self.node.memoized();
        match error {
            None => Ok(value.expect("resolved component has neither value nor error")),
            Some(err) => {
                let err = err.tailored_for(dependent.map(|d| d.id()));
                if err.has_user_panic() {
                    std::panic::panic_any(err);
                }
                Err(err)
            }
        }
    }

    /// Returns the component, resolving it first if needed. Panics with the
    /// structured [`ProvideError`] on any failure.
    #[track_caller]
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => std::panic::panic_any(err),
        }
    }

    /// The id assigned to this component at definition time.
    pub fn id(&self) -> ComponentId {
        self.node.id()
    }

    #[cfg(test)]
    pub(crate) fn node_ref(&self) -> NodeRef {
        self.node.clone()
    }
}

/// Returns the id of the component whose constructor is currently running,
/// or `None` outside a provider context.
pub fn use_component_id() -> Option<ComponentId> {
    registry().current_component_id()
}

/// Tags the component whose constructor is currently running. The tag shows
/// up in errors and runner listener events.
///
/// # Panics
///
/// Panics when called outside a provider context.
pub fn use_tag<V>(value: V)
where
    V: std::fmt::Debug + Send + Sync + 'static,
{
    if !registry().set_current_tag(Tag::new(value)) {
        panic!("use_tag must be called inside a provider function");
    }
}
