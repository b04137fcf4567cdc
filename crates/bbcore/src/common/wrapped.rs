use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Shared `Arc<Mutex<T>>` handle of the controller state.
///
/// Never hold the guard returned by [`WrappedArcMutex::lock`] across an `.await` point
/// or while waiting for an external process.
#[derive(Default, Debug)]
pub struct WrappedArcMutex<T: ?Sized> {
    inner: Arc<Mutex<T>>,
}

impl<T> WrappedArcMutex<T> {
    /// Create a new wrapped instance. This is not called `new` so that you may implement
    /// your own function `new`.
    #[inline]
    pub fn wrap(t: T) -> Self {
        WrappedArcMutex {
            inner: Arc::new(Mutex::new(t)),
        }
    }
}

impl<T: ?Sized> WrappedArcMutex<T> {
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T: ?Sized> Clone for WrappedArcMutex<T> {
    #[inline]
    fn clone(&self) -> Self {
        WrappedArcMutex {
            inner: self.inner.clone(),
        }
    }
}
