use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-VM async locks serialising lifecycle operations on the same id.
#[derive(Clone, Default)]
pub struct VmLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, vm_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(vm_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted VM.
    pub fn forget(&self, vm_id: i64) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&vm_id);
        }
    }
}
