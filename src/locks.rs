//! Per-project write locks.
//!
//! One async mutex per `project_id`, created lazily on first use. The map
//! itself sits behind a short-lived `parking_lot` lock, so creation happens
//! exactly once per key. The returned guard is owned: it releases on every
//! exit path, including early `?` returns and panics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one project write.
pub type ProjectGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock();
        map.entry(project_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> ProjectGuard {
        self.lock_for(key).lock_owned().await
    }

    /// Number of projects that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
