//! Errors produced while building and running the lifecycle graph.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::cancel::Cause;
use crate::error::ProvideError;
use crate::info::{ComponentId, ComponentInfo};
use crate::runtime::graph::HookInfo;

/// The lifecycle phase in which a hook failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifecyclePhase {
    Start,
    Wait,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecyclePhase::Start => "start",
            LifecyclePhase::Wait => "wait",
        })
    }
}

/// Distinguished cause used when a runnable returned `Ok` while configured
/// to treat that as an error.
#[derive(Clone, Copy, Debug, Error)]
#[error("unexpected Ok run result")]
pub struct UnexpectedOkRunResult;

/// Error returned from [`Runner::run`](crate::Runner::run).
#[derive(Clone, Debug, Error)]
pub enum RunError {
    /// A hook's start or wait phase returned an error; the session shut the
    /// graph down.
    #[error("{phase} of {hook} failed: {cause}")]
    HookFailed {
        hook: HookInfo,
        phase: LifecyclePhase,
        cause: Cause,
    },
    /// The run context was cancelled (by a signal or a user cause).
    #[error("run cancelled: {cause}")]
    Cancelled { cause: Cause },
    /// `run` was called while a previous invocation had not returned.
    #[error("runner is already running")]
    AlreadyRunning,
}

impl RunError {
    /// The failed hook, phase and cause, when the error is a hook failure.
    pub fn hook_failure(&self) -> Option<(&HookInfo, LifecyclePhase, &Cause)> {
        match self {
            RunError::HookFailed { hook, phase, cause } => Some((hook, *phase, cause)),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled { .. })
    }
}

/// The path through the component graph on which two hook-bearing nodes
/// form a cycle, making a start order impossible.
#[derive(Clone)]
pub struct LifecycleCyclePath {
    pub(crate) stack: Vec<ComponentInfo>,
    pub(crate) marked: ComponentId,
}

impl LifecycleCyclePath {
    pub fn components(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.stack.iter()
    }
}

impl fmt::Display for LifecycleCyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cyclic dependency between lifecycle components:")?;
        for component in self.stack.iter().rev() {
            let marker = if component.id() == self.marked {
                "-> "
            } else {
                "   "
            };
            writeln!(f, " {marker}{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for LifecycleCyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error returned when constructing a [`Runner`](crate::Runner).
#[derive(Debug, Error)]
pub enum BuildError {
    /// Runners cannot be built from inside a constructor.
    #[error("runner must not be created inside a provider function (at {at})")]
    InProviderContext { at: &'static Location<'static> },
    /// The lifecycle graph contains an impossible cycle.
    #[error("{0}")]
    LifecycleCycle(LifecycleCyclePath),
    /// Resolving the root components failed.
    #[error("root provider failed: {0}")]
    Provide(ProvideError),
}
