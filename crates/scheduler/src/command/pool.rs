//! Recycling pool of command records.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{Result, SchedError};

use super::Command;

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<Box<Command>>,
    allocated: usize,
}

/// Slab of command records addressed by a stable pool index.
///
/// A record is either free in the pool or owned by exactly one holder
/// (a submitter, the ingress queue or the scheduler loop); ownership moves
/// with the `Box`, so a released record cannot be touched by its last owner.
#[derive(Debug)]
pub struct CommandPool {
    inner: Mutex<PoolInner>,
    limit: usize,
}

impl CommandPool {
    /// Pool that allocates at most `limit` records.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            limit,
        }
    }

    /// Pop a recycled record, or allocate a fresh one.
    pub fn acquire(&self) -> Result<Box<Command>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut cmd) = inner.free.pop() {
            cmd.renew();
            return Ok(cmd);
        }
        if inner.allocated >= self.limit {
            return Err(SchedError::OutOfMemory);
        }
        // Reserve the free-list entry now so release never allocates.
        let wanted = inner.allocated + 1;
        inner
            .free
            .try_reserve(wanted)
            .map_err(|_| SchedError::OutOfMemory)?;
        let index = inner.allocated as u32;
        inner.allocated += 1;
        debug!(index, "allocated command record");
        Ok(Box::new(Command::new(index)))
    }

    /// Return a finished record to the free set.
    pub fn release(&self, mut cmd: Box<Command>) {
        debug_assert!(cmd.buffer.is_none(), "buffer must be released before recycling");
        cmd.buffer = None;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.free.push(cmd);
    }

    /// Records ever allocated.
    pub fn allocated(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocated
    }

    /// Records waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .len()
    }

    /// Records currently owned outside the pool.
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.allocated - inner.free.len()
    }
}
