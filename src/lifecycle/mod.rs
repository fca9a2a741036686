//! Lifecycle hooks: the user-facing shapes, the builder registered from
//! constructors, and the adapters normalizing everything into the
//! start / wait / close roles the runner drives.

pub(crate) mod adapters;
pub(crate) mod hook;
pub(crate) mod traits;

pub use hook::{use_lifecycle, HookKind, LifecycleBuilder};
pub use traits::{Closer, ReadinessRunnable, ReadySignal, Runnable, Starter};
