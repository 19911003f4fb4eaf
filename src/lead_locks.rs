//! Per-lead async locks.
//!
//! Webhook writes and scheduled writes to the same lead must not interleave
//! their read-modify-write cycles. The table only keeps weak handles, so an
//! entry lives exactly as long as someone holds or waits on its lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Table size below which dead entries are left alone.
const MIN_PRUNE_AT: usize = 1024;

#[derive(Clone, Default)]
pub struct LeadLocks {
    table: Arc<StdMutex<LockTable>>,
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<Uuid, Weak<Mutex<()>>>,
    prune_at: usize,
}

impl LeadLocks {
    fn lock_for(&self, lead_id: Uuid) -> Arc<Mutex<()>> {
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(lock) = table.locks.get(&lead_id).and_then(Weak::upgrade) {
            return lock;
        }

        if table.locks.len() >= table.prune_at.max(MIN_PRUNE_AT) {
            table.locks.retain(|_, lock| lock.strong_count() > 0);
            table.prune_at = table.locks.len() * 2;
        }
        let lock = Arc::new(Mutex::new(()));
        table.locks.insert(lead_id, Arc::downgrade(&lock));
        lock
    }

    /// Waits for exclusive access to `lead_id`. Hold the guard across the whole
    /// read-modify-write.
    pub async fn acquire(&self, lead_id: Uuid) -> OwnedMutexGuard<()> {
        self.lock_for(lead_id).lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        match self.table.lock() {
            Ok(guard) => guard.locks.len(),
            Err(poisoned) => poisoned.into_inner().locks.len(),
        }
    }
}
