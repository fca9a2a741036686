//! Component identity and metadata shared by the resolver and the runner.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Process-unique identifier of a component definition.
///
/// Ids come from a monotonically increasing counter and are assigned when the
/// component is defined with [`provide`](crate::provide) or
/// [`provide_with_error`](crate::provide_with_error). They are never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ComponentId(pub(crate) u64);

impl ComponentId {
    /// Returns the raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opaque user-supplied marker attached to a component or a lifecycle hook
/// for observability.
///
/// The `Debug` rendering of the value is captured at construction time so the
/// tag stays printable in errors and listener events; the value itself remains
/// downcastable.
#[derive(Clone)]
pub struct Tag {
    repr: Arc<str>,
    value: Arc<dyn Any + Send + Sync>,
}

impl Tag {
    pub fn new<T>(value: T) -> Self
    where
        T: fmt::Debug + Send + Sync + 'static,
    {
        Self {
            repr: format!("{value:?}").into(),
            value: Arc::new(value),
        }
    }

    /// Returns the tagged value if it is of type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.repr)
    }
}

/// Identity of a component: its id, provided value type, defining call-site
/// and constructor flavor. Carried by errors, listener events and hook nodes.
#[derive(Clone)]
pub struct ComponentInfo {
    pub(crate) id: ComponentId,
    pub(crate) type_name: &'static str,
    pub(crate) ctor_kind: &'static str,
    pub(crate) defined_at: &'static Location<'static>,
    pub(crate) tag: Option<Tag>,
}

impl ComponentInfo {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Name of the type the component's constructor provides.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The call-site where the component was defined.
    pub fn defined_at(&self) -> &'static Location<'static> {
        self.defined_at
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }
}

impl fmt::Display for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.ctor_kind, self.id)?;
        if let Some(tag) = &self.tag {
            write!(f, ", tag: {tag}")?;
        }
        write!(f, ") {} @ {}", self.type_name, self.defined_at)
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
