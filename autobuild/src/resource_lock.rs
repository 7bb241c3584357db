//! Named resource locks
//!
//! The executor takes one lock per workspace before re-reading its state, so
//! no two evaluations of the same workspace overlap, whether they come from
//! this process or a peer sharing the datastore.
//!
//! # Key Features
//!
//! - **Non-blocking**: `try_lock` returns `None` immediately when the resource is held
//! - **Scoped**: the returned guard releases the lock when dropped
//! - **Pluggable**: in-process locks here, lease rows in `database::LeaseLocks`
//!
//! # Usage
//!
//! ```ignore
//! let Some(_guard) = locks.try_lock("autobuild:<workspace id>").await? else {
//!     return Ok(None); // someone else is evaluating it
//! };
//! // evaluate, commit...
//! // guard dropped here, lock released
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

#[async_trait]
pub trait ResourceLocks: Send + Sync {
    /// Take the lock on `resource` if it is free.
    async fn try_lock(&self, resource: &str) -> Result<Option<ResourceGuard>>;
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Held lock; released on drop
pub struct ResourceGuard {
    resource: String,
    release: Option<Release>,
}

impl ResourceGuard {
    pub fn new(resource: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            resource: resource.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.resource)
            .finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// In-process locks, enough for a single executor instance.
#[derive(Clone, Default)]
pub struct LocalResourceLocks {
    held: Arc<Mutex<HashMap<String, DateTime<Utc>>>>, // resource -> acquired at
}

impl LocalResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.held.lock().contains_key(resource)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

#[async_trait]
impl ResourceLocks for LocalResourceLocks {
    #[instrument(skip_all, fields(resource = %resource))]
    async fn try_lock(&self, resource: &str) -> Result<Option<ResourceGuard>> {
        {
            let mut held = self.held.lock();
            if let Some(acquired_at) = held.get(resource) {
                debug!("Resource {} held since {}", resource, acquired_at);
                return Ok(None);
            }
            held.insert(resource.to_string(), Utc::now());
        }

        let held = self.held.clone();
        let key = resource.to_string();
        Ok(Some(ResourceGuard::new(resource, move || {
            held.lock().remove(&key);
        })))
    }
}
