//! Deferred initialization callbacks, the escape hatch for construction
//! cycles.
//!
//! A late-init registered inside a constructor runs after the resolution
//! stack unwinds to its root and before the root accessor returns, in the
//! same single-writer context as a constructor. Dependencies requested from
//! a late-init are fully resolved by then.

use std::panic::Location;
use std::sync::{Arc, OnceLock};

use crate::error::BoxError;
use crate::resolver::registry::registry;

/// Registers a late-init callback bound to the currently providing
/// component.
///
/// # Panics
///
/// Panics when called outside a provider context.
#[track_caller]
pub fn use_late_init<F>(callback: F)
where
    F: FnOnce() + Send + 'static,
{
    let registered_at = Location::caller();
    if !registry().push_late_init(
        Box::new(move || {
            callback();
            Ok(())
        }),
        registered_at,
    ) {
        panic!("use_late_init must be called inside a provider function");
    }
}

/// Like [`use_late_init`], but the callback may fail.
///
/// A failing late-init marks the owning component as failed and cascades the
/// failure to every dependent that already captured it: they cannot know
/// retroactively that their reference is now invalid.
#[track_caller]
pub fn use_late_init_with_error<F>(callback: F)
where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    let registered_at = Location::caller();
    if !registry().push_late_init(Box::new(callback), registered_at) {
        panic!("use_late_init_with_error must be called inside a provider function");
    }
}

/// A stable handle to a value that is constructed during late-init.
///
/// Hand the handle to dependencies immediately; read it once the root
/// accessor has returned. Reading before the late-init ran yields `None`
/// from [`try_get`](LateRef::try_get) (there are no implicit zero values to
/// fall back to).
pub struct LateRef<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> Clone for LateRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> LateRef<T> {
    pub fn try_get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// # Panics
    ///
    /// Panics when the late-init has not filled the value yet.
    pub fn get(&self) -> &T {
        self.cell
            .get()
            .expect("late-initialized value read before its late-init ran")
    }
}

/// Returns a stable [`LateRef`] now and fills it with the constructed value
/// during late-init. Keeps the familiar constructor-function pattern usable
/// on both sides of a cycle.
#[track_caller]
pub fn use_late_ref<T, F>(constructor: F) -> LateRef<T>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let cell = Arc::new(OnceLock::new());
    let filled = cell.clone();
    use_late_init(move || {
        let _ = filled.set(constructor());
    });
    LateRef { cell }
}

/// Fallible variant of [`use_late_ref`].
#[track_caller]
pub fn use_late_ref_with_error<T, F, E>(constructor: F) -> LateRef<T>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
    E: Into<BoxError>,
{
    let cell = Arc::new(OnceLock::new());
    let filled = cell.clone();
    use_late_init_with_error(move || {
        let value = constructor().map_err(Into::into)?;
        let _ = filled.set(value);
        Ok(())
    });
    LateRef { cell }
}
