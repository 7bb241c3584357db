//! Shared, hot-swappable handle to a trait object.
//!
//! Policy stores and the auditor can be replaced while the executor runs,
//! for example when a license is applied. Readers take a cheap `Arc` snapshot
//! so a swap never affects an evaluation that already started.

use parking_lot::RwLock;
use std::sync::Arc;

pub struct Swappable<T: ?Sized> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T: ?Sized> Clone for Swappable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Swappable<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Current value
    pub fn load(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    /// Replace the value for every clone of this handle
    pub fn store(&self, value: Arc<T>) {
        *self.inner.write() = value;
    }
}
