//! Fallible allocation of fixed-size counter blocks.
//!
//! Every trie block holds a [`BlockLease`] for as long as it is alive, so
//! `BlockPool::live_blocks` always reflects the number of blocks reachable
//! from tables and handles of one realm.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{AccountError, Result};

/// Entries per block (one address byte).
pub const FANOUT: usize = 256;

/// Live-block bookkeeping for one realm, with an optional upper bound.
#[derive(Debug)]
pub struct BlockPool {
    live: AtomicUsize,
    limit: Option<usize>,
}

impl BlockPool {
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(BlockPool {
            live: AtomicUsize::new(0),
            limit,
        })
    }

    /// Number of blocks currently allocated.
    pub fn live_blocks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Reserve one block against the budget.
    pub(crate) fn lease(self: &Arc<Self>) -> Result<BlockLease> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match self.limit {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            })
            .map_err(|_| AccountError::OutOfMemory)?;
        Ok(BlockLease {
            pool: Arc::clone(self),
        })
    }
}

/// Accounting token owned by an allocated block; released on drop.
#[derive(Debug)]
pub(crate) struct BlockLease {
    pool: Arc<BlockPool>,
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Allocate a boxed array without aborting on allocator failure.
pub(crate) fn try_boxed_array<T, const N: usize>(fill: impl FnMut() -> T) -> Result<Box<[T; N]>> {
    let mut items = Vec::new();
    items
        .try_reserve_exact(N)
        .map_err(|_| AccountError::OutOfMemory)?;
    items.resize_with(N, fill);
    items
        .into_boxed_slice()
        .try_into()
        .map_err(|_| AccountError::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_tracks_live_blocks() {
        let pool = BlockPool::new(None);
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_eq!(pool.live_blocks(), 2);
        drop(a);
        assert_eq!(pool.live_blocks(), 1);
        drop(b);
        assert_eq!(pool.live_blocks(), 0);
    }

    #[test]
    fn test_limit_refuses_lease() {
        let pool = BlockPool::new(Some(1));
        let held = pool.lease().unwrap();
        assert!(matches!(pool.lease(), Err(AccountError::OutOfMemory)));
        drop(held);
        assert!(pool.lease().is_ok());
    }

    #[test]
    fn test_try_boxed_array() {
        let block: Box<[u64; FANOUT]> = try_boxed_array(|| 0).unwrap();
        assert_eq!(block.len(), FANOUT);
        assert!(block.iter().all(|v| *v == 0));
    }
}
