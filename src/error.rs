//! Errors produced while resolving the component graph.
//!
//! Resolution errors are memoized on the failed component and re-surfaced to
//! every accessor call for it, so all of them are cheaply cloneable with
//! `Arc`-backed payloads.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use thiserror::Error;

use crate::info::{ComponentId, ComponentInfo};

/// The boxed error type accepted from user constructors, late-init callbacks
/// and lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One hop of a resolution trace: the component whose constructor (or
/// late-init callback) the resolver was inside, and the user call-site that
/// entered it.
#[derive(Clone)]
pub struct TraceFrame {
    pub(crate) component: ComponentInfo,
    pub(crate) late_init: Option<LateInitAt>,
    pub(crate) entered_from: Option<&'static Location<'static>>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LateInitAt {
    pub seq: u32,
    pub registered_at: &'static Location<'static>,
}

impl TraceFrame {
    pub fn component(&self) -> &ComponentInfo {
        &self.component
    }
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(li) = &self.late_init {
            write!(
                f,
                "late-init {} of {} registered at {}",
                li.seq, self.component, li.registered_at
            )?;
        } else {
            write!(f, "{}", self.component)?;
        }
        if let Some(site) = self.entered_from {
            write!(f, " (called from {site})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The path of constructor frames forming a construction cycle.
///
/// `frames[0]` is the component whose constructor was re-entered; the rest
/// walk back through its dependents to the frame that closed the cycle.
#[derive(Clone, Debug)]
pub struct CycleTrace {
    pub(crate) frames: Vec<TraceFrame>,
}

impl CycleTrace {
    /// Components on the cycle, starting from the re-entered one.
    pub fn components(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.frames.iter().map(|f| &f.component)
    }

    /// Re-roots the cycle so it starts at `id`, if `id` is on the cycle.
    /// Lets each dependent observe the cycle from its own position.
    pub(crate) fn tailored_for(&self, id: ComponentId) -> Option<CycleTrace> {
        let pos = self.frames.iter().position(|f| f.component.id == id)?;
        let mut frames = Vec::with_capacity(self.frames.len());
        frames.extend_from_slice(&self.frames[pos..]);
        frames.extend_from_slice(&self.frames[..pos]);
        Some(CycleTrace { frames })
    }
}

impl fmt::Display for CycleTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return write!(f, "cyclic dependency");
        }
        writeln!(f, "cyclic dependency; use_late_init can break the cycle:")?;
        for (i, frame) in self.frames.iter().enumerate() {
            let marker = if i == 0 { "-> " } else { "   " };
            writeln!(f, " {marker}{frame}")?;
        }
        write!(f, " -> back to {}", self.frames[0].component)
    }
}

/// What actually went wrong inside the failed frame.
#[derive(Clone, Debug)]
pub(crate) enum FailureCause {
    /// The constructor returned an error.
    User(Arc<BoxError>),
    /// A late-init callback returned an error.
    LateInit(Arc<BoxError>),
    /// User code panicked; the payload rendering is preserved.
    Panic(Arc<str>),
    /// The panic payload was itself a resolution error thrown by a nested
    /// accessor.
    Wrapped(Box<ProvideError>),
}

/// A failed registration: the constructor or late-init callback that failed,
/// plus the chain of dependent frames that required it.
///
/// `frames[0]` is the failure site; subsequent frames walk outward to the
/// accessor call that triggered the resolution.
#[derive(Clone, Debug)]
pub struct RegistrationFailure {
    pub(crate) frames: Vec<TraceFrame>,
    pub(crate) cause: FailureCause,
}

impl RegistrationFailure {
    /// The frame chain from the failure site outward.
    pub fn frames(&self) -> &[TraceFrame] {
        &self.frames
    }

    /// The underlying user error, if the failure was an error return rather
    /// than a panic.
    pub fn source_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match &self.cause {
            FailureCause::User(e) | FailureCause::LateInit(e) => Some(&***e),
            FailureCause::Panic(_) => None,
            FailureCause::Wrapped(inner) => inner.registration().and_then(|r| r.source_error()),
        }
    }

    /// The preserved panic payload rendering, if the failure was a panic in
    /// user code.
    pub fn panic_message(&self) -> Option<&str> {
        match &self.cause {
            FailureCause::Panic(msg) => Some(msg),
            FailureCause::Wrapped(inner) => inner.registration().and_then(|r| r.panic_message()),
            _ => None,
        }
    }

    pub(crate) fn push_frame(&mut self, frame: TraceFrame) {
        self.frames.push(frame);
    }

    pub(crate) fn has_user_panic(&self) -> bool {
        match &self.cause {
            FailureCause::Panic(_) => true,
            FailureCause::Wrapped(inner) => inner.has_user_panic(),
            _ => false,
        }
    }
}

impl fmt::Display for RegistrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "component registration failed")?;
        for (i, frame) in self.frames.iter().enumerate() {
            let marker = if i == 0 { "in " } else { "required by " };
            writeln!(f, "  {marker}{frame}")?;
        }
        match &self.cause {
            FailureCause::User(e) | FailureCause::LateInit(e) => write!(f, "caused by: {e}"),
            FailureCause::Panic(msg) => write!(f, "caused by panic: {msg}"),
            FailureCause::Wrapped(inner) => write!(f, "caused by: {inner}"),
        }
    }
}

/// Error surfaced by component accessors.
///
/// Cloned out of the memoized state of the failed component, so repeated
/// accessor calls observe the same failure.
#[derive(Clone, Debug, Error)]
pub enum ProvideError {
    /// A constructor re-entered a component that was still being provided.
    #[error("{0}")]
    Cyclic(CycleTrace),
    /// A constructor or late-init callback failed with an error or a panic.
    #[error("{0}")]
    Registration(RegistrationFailure),
}

impl ProvideError {
    pub fn is_cyclic(&self) -> bool {
        matches!(self, ProvideError::Cyclic(_))
    }

    pub fn registration(&self) -> Option<&RegistrationFailure> {
        match self {
            ProvideError::Registration(r) => Some(r),
            ProvideError::Cyclic(_) => None,
        }
    }

    pub(crate) fn user(frame: TraceFrame, err: BoxError) -> Self {
        ProvideError::Registration(RegistrationFailure {
            frames: vec![frame],
            cause: FailureCause::User(Arc::new(err)),
        })
    }

    pub(crate) fn late_init(frame: TraceFrame, err: BoxError) -> Self {
        ProvideError::Registration(RegistrationFailure {
            frames: vec![frame],
            cause: FailureCause::LateInit(Arc::new(err)),
        })
    }

    /// Wraps an already memoized failure with the frame that observed it,
    /// for reporting to dependents whose resolution relied on this node.
    pub(crate) fn wrap_frame(frame: TraceFrame, inner: ProvideError) -> Self {
        ProvideError::Registration(RegistrationFailure {
            frames: vec![frame],
            cause: FailureCause::Wrapped(Box::new(inner)),
        })
    }

    /// Converts a caught panic payload into a registration failure for the
    /// given frame. Payloads that are themselves resolution errors (thrown by
    /// a nested accessor) are wrapped instead of stringified, preserving the
    /// user-panic marker.
    pub(crate) fn from_panic(frame: TraceFrame, payload: Box<dyn std::any::Any + Send>) -> Self {
        let cause = match payload.downcast::<ProvideError>() {
            Ok(inner) => FailureCause::Wrapped(inner),
            Err(payload) => FailureCause::Panic(panic_repr(&*payload).into()),
        };
        ProvideError::Registration(RegistrationFailure {
            frames: vec![frame],
            cause,
        })
    }

    /// True when the failure originates from a panic in user code. Such
    /// errors re-panic out of both accessor flavors instead of being
    /// returned.
    pub(crate) fn has_user_panic(&self) -> bool {
        match self {
            ProvideError::Registration(r) => r.has_user_panic(),
            ProvideError::Cyclic(_) => false,
        }
    }

    /// Adjusts the error for the dependent that observes it: cycles are
    /// re-rooted at the dependent's own frame when it sits on the cycle.
    pub(crate) fn tailored_for(self, dependent: Option<ComponentId>) -> Self {
        match (&self, dependent) {
            (ProvideError::Cyclic(trace), Some(id)) => match trace.tailored_for(id) {
                Some(rotated) => ProvideError::Cyclic(rotated),
                None => self,
            },
            _ => self,
        }
    }
}

fn panic_repr(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<opaque panic payload>".to_owned()
    }
}
