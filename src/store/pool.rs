//! A fixed pool of store handles for parallel replication workers.

use super::{Handle, Store};
use crate::error::Result;

use std::sync::{Mutex, MutexGuard};

/// A fixed-size pool of store handles. Workers check out a handle by a
/// monotonic index taken modulo the pool size, so concurrent transactions
/// distribute across handles. The checkout is held for the duration of one
/// replication transaction and released on drop.
pub struct Pool {
    slots: Vec<Mutex<Box<dyn Handle>>>,
}

impl Pool {
    /// Creates a pool of `size` handles onto the given store.
    pub fn new(store: &dyn Store, size: usize) -> Self {
        assert!(size > 0, "pool must have at least one handle");
        Self { slots: (0..size).map(|_| Mutex::new(store.handle())).collect() }
    }

    /// Returns the number of handles in the pool.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Checks out the handle at `index` modulo the pool size, blocking while
    /// it is in use.
    pub fn handle(&self, index: u64) -> Result<MutexGuard<'_, Box<dyn Handle>>> {
        Ok(self.slots[(index % self.slots.len() as u64) as usize].lock()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Memory;
    use super::*;

    #[test]
    fn indexes_wrap_around() -> Result<()> {
        let store = Memory::new();
        let pool = Pool::new(&store, 2);
        assert_eq!(pool.size(), 2);

        // Index 0 and 2 share a slot; holding 0 doesn't block 1.
        let zero = pool.handle(0)?;
        let _one = pool.handle(1)?;
        drop(zero);
        let _two = pool.handle(2)?;
        Ok(())
    }
}
