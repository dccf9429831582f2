//! Ephemeral port pool.
//!
//! The table of ports is private to the pool; callers only allocate and
//! release. All access goes through one mutex, so allocation and release are
//! atomic with respect to each other.

use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no ports available")]
    NoPortsAvailable,
}

/// Fixed, pre-sized table of candidate ports.
#[derive(Debug)]
pub struct PortPool {
    first: u16,
    in_use: Mutex<Vec<bool>>,
}

impl PortPool {
    /// An empty range yields a pool that never allocates.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let (first, last) = (*range.start(), *range.end());
        let size = if first <= last {
            usize::from(last) - usize::from(first) + 1
        } else {
            0
        };
        Self {
            first,
            in_use: Mutex::new(vec![false; size]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.in_use.lock().len()
    }

    /// Number of ports currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.lock().iter().filter(|used| **used).count()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.slot(port, self.capacity()).is_some()
    }

    /// Reserve the lowest free port.
    pub fn allocate(&self) -> Result<u16, PoolError> {
        let mut table = self.in_use.lock();
        let idx = table
            .iter()
            .position(|used| !used)
            .ok_or(PoolError::NoPortsAvailable)?;
        table[idx] = true;
        Ok(self.first + idx as u16)
    }

    /// Return a port to the pool.
    ///
    /// Idempotent: releasing a free port, or one outside the pool, is a no-op.
    /// Returns whether the port was actually in use.
    pub fn release(&self, port: u16) -> bool {
        let mut table = self.in_use.lock();
        match self.slot(port, table.len()) {
            Some(idx) => std::mem::replace(&mut table[idx], false),
            None => false,
        }
    }

    /// Reserve a port that is released again when the lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, PoolError> {
        let port = self.allocate()?;
        Ok(PortLease {
            pool: Arc::clone(self),
            port,
        })
    }

    fn slot(&self, port: u16, size: usize) -> Option<usize> {
        let idx = usize::from(port.checked_sub(self.first)?);
        (idx < size).then_some(idx)
    }
}

/// A reserved port. Dropping the lease releases it.
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}
