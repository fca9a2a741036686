//! # Armature
//!
//! Lazy, graph-aware dependency injection with a lifecycle runner for Rust.
//!
//! Armature builds the dependency graph of your application by observation:
//! constructors are plain closures, and any accessor call made while another
//! constructor runs becomes a dependency edge. The same graph then drives
//! the runtime lifecycle, starting components after their dependencies are
//! ready and shutting them down before their dependencies close.
//!
//! ## Features
//!
//! - **Lazy singletons**: each component is constructed at most once, on
//!   first access, with memoized results
//! - **Inferred edges**: no registration lists; the resolver watches nested
//!   accessor calls
//! - **Construction cycles**: detected and reported with the full path, or
//!   broken explicitly with late-init callbacks
//! - **Lifecycle orchestration**: starters, closers and long-running
//!   components start in topological order, shut down in reverse, with
//!   failure propagation, start timeouts and cause-aware cancellation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use armature::{provide, use_lifecycle, Component, Runner};
//! use std::sync::{Arc, LazyLock};
//!
//! struct Db;
//! struct Server { db: Arc<Db> }
//!
//! static DB: LazyLock<Component<Arc<Db>>> = LazyLock::new(|| {
//!     provide(|| {
//!         use_lifecycle().add_close_fn(|| async {
//!             // flush the pool
//!         });
//!         Arc::new(Db)
//!     })
//! });
//!
//! static SERVER: LazyLock<Component<Arc<Server>>> = LazyLock::new(|| {
//!     provide(|| {
//!         let server = Arc::new(Server { db: DB.get() });
//!         use_lifecycle().add_readiness_run_fn(|ctx, ready| async move {
//!             ready.notify();
//!             ctx.cancelled().await;
//!             Ok(())
//!         });
//!         server
//!     })
//! });
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = Runner::new(|| {
//!         SERVER.get();
//!     })
//!     .expect("graph is well formed");
//!
//!     runner
//!         .run_with_signals(|| println!("serving"))
//!         .await
//!         .expect("clean shutdown");
//! }
//! ```

pub mod cancel;
pub mod component;
pub mod error;
pub mod info;
pub mod late_init;
pub mod lifecycle;
pub(crate) mod resolver;
pub mod runtime;

// Re-export core types
pub use cancel::{CancelSource, CancelToken, Cancelled, Cause, DeadlineExceeded, SignalReceived};
pub use component::{provide, provide_with_error, use_component_id, use_tag, Component};
pub use error::{BoxError, CycleTrace, ProvideError, RegistrationFailure, TraceFrame};
pub use info::{ComponentId, ComponentInfo, Tag};
pub use late_init::{
    use_late_init, use_late_init_with_error, use_late_ref, use_late_ref_with_error, LateRef,
};
pub use lifecycle::{
    use_lifecycle, Closer, HookKind, LifecycleBuilder, ReadinessRunnable, ReadySignal, Runnable,
    Starter,
};
pub use runtime::{
    BuildError, HookInfo, HookNode, LifecycleCyclePath, LifecyclePhase, RunError, Runner,
    RunnerBuilder, RunnerListener, UnexpectedOkRunResult,
};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;

/// Prelude module for convenient imports
///
/// ```
/// use armature::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cancel::{CancelToken, Cause};
    pub use crate::component::{provide, provide_with_error, Component};
    pub use crate::error::{BoxError, ProvideError};
    pub use crate::late_init::{use_late_init, use_late_init_with_error, use_late_ref, LateRef};
    pub use crate::lifecycle::{
        use_lifecycle, Closer, ReadinessRunnable, ReadySignal, Runnable, Starter,
    };
    pub use crate::runtime::{RunError, Runner, RunnerListener};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
