use std::{collections::BTreeSet, sync::Arc, sync::Mutex};

use crate::error::{Error, Result};

/// Issues the small numeric identities that every per-instance derived name
/// (IP, MAC, tap, control socket) hangs off. Identities are handed out
/// smallest-first as [`IdentityLease`]s; an identity returns to the pool
/// only when its lease is dropped, so it can never be reissued while a
/// live instance still references it.
pub struct IdentityAllocator {
    free: Mutex<BTreeSet<u8>>,
}

/// Exclusive hold on one identity. Dropping the lease is the only way the
/// identity gets back into the pool.
pub struct IdentityLease {
    value: u8,
    pool: Arc<IdentityAllocator>,
}

impl IdentityLease {
    pub fn value(&self) -> u8 {
        self.value
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        self.pool.release(self.value);
    }
}

impl IdentityAllocator {
    pub fn new(first: u8, last: u8) -> Self {
        Self {
            free: Mutex::new((first..=last).collect()),
        }
    }

    pub fn allocate(self: &Arc<Self>) -> Result<IdentityLease> {
        let mut free = self.free.lock().expect("identity allocator poisoned");
        let value = free.pop_first().ok_or(Error::PoolExhausted)?;
        Ok(IdentityLease {
            value,
            pool: self.clone(),
        })
    }

    fn release(&self, identity: u8) {
        let mut free = self.free.lock().expect("identity allocator poisoned");
        free.insert(identity);
    }
}
