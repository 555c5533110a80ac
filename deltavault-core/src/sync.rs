/*!
Scoped exclusive access to shared mutable contexts.

[`ThreadSafeContextWrapper`] hands out a [`ContextGuard`] that dereferences to
the wrapped value and releases the lock when dropped, whether the scope ends
normally, through `?`, or by unwinding. Clones share the same context.
*/

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Mutex-backed wrapper giving a context exclusive-access semantics
#[derive(Debug, Default)]
pub struct ThreadSafeContextWrapper<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for ThreadSafeContextWrapper<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ThreadSafeContextWrapper<T> {
    pub fn new(context: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    /// Block until the context is free and lock it
    pub fn lock(&self) -> ContextGuard<'_, T> {
        let guard = self.inner.lock();
        trace!("context lock acquired");
        ContextGuard { guard }
    }

    /// Lock without blocking
    pub fn try_lock(&self) -> Option<ContextGuard<'_, T>> {
        self.inner.try_lock().map(|guard| ContextGuard { guard })
    }

    /// Lock, giving up after `timeout`
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ContextGuard<'_, T>> {
        self.inner
            .try_lock_for(timeout)
            .map(|guard| ContextGuard { guard })
    }

    /// Run `f` with exclusive access and return its result
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Unwrap the context if this is the last handle
    pub fn into_inner(self) -> Result<T, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

/// Exclusive access to a wrapped context; unlocks on drop
pub struct ContextGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for ContextGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ContextGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ContextGuard<'_, T> {
    fn drop(&mut self) {
        trace!("context lock released");
    }
}
