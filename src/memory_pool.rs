use std::sync::Mutex;

use tracing::{debug, trace};

/// One fixed-size block handed out by a [`MemoryPool`]. The block keeps its pool
///  slot index so the pool can verify it on release.
pub struct PoolBlock {
    index: usize,
    buf: Vec<u8>,
}

impl PoolBlock {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// A bounded pool of `buffer_size` pre-allocated blocks of `block_size` bytes each,
///  handed out LIFO.
///
/// The pool never grows: `acquire` on an exhausted pool returns `None`, making
///  overload visible to the caller instead of turning into unbounded allocation.
pub struct MemoryPool {
    block_size: usize,
    buffer_size: usize,
    free: Mutex<FreeList>,
}

struct FreeList {
    /// LIFO stack of free blocks; initialized so the first `acquire` hands out
    ///  slot index 0
    stack: Vec<PoolBlock>,
    is_free: Vec<bool>,
}

impl MemoryPool {
    pub fn new(block_size: usize, buffer_size: usize) -> MemoryPool {
        let stack = (0..buffer_size)
            .rev()
            .map(|index| PoolBlock {
                index,
                buf: vec![0; block_size],
            })
            .collect();

        MemoryPool {
            block_size,
            buffer_size,
            free: Mutex::new(FreeList {
                stack,
                is_free: vec![true; buffer_size],
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn num_available(&self) -> usize {
        self.free.lock().unwrap().stack.len()
    }

    pub fn acquire(&self) -> Option<PoolBlock> {
        let mut free = self.free.lock().unwrap();
        match free.stack.pop() {
            Some(block) => {
                free.is_free[block.index] = false;
                trace!("handing out pool block {}", block.index);
                Some(block)
            }
            None => {
                debug!("pool of {} blocks is exhausted", self.buffer_size);
                None
            }
        }
    }

    /// Returns a block to the free stack. Blocks that do not belong to this pool
    ///  (wrong capacity, out-of-range index) or are already free are ignored.
    pub fn release(&self, block: PoolBlock) {
        if block.index >= self.buffer_size || block.buf.len() != self.block_size {
            debug!(
                "ignoring release of foreign block (index {}, size {})",
                block.index,
                block.buf.len()
            );
            return;
        }

        let mut free = self.free.lock().unwrap();
        if free.is_free[block.index] {
            debug!("ignoring double release of block {}", block.index);
            return;
        }
        free.is_free[block.index] = true;
        free.stack.push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_acquire_is_block_zero() {
        let pool = MemoryPool::new(16, 4);
        assert_eq!(pool.acquire().unwrap().index(), 0);
        assert_eq!(pool.acquire().unwrap().index(), 1);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = MemoryPool::new(16, 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.num_available(), 0);

        let b_index = b.index();
        pool.release(b);

        // LIFO: the most recently released block is handed out first
        assert_eq!(pool.acquire().unwrap().index(), b_index);

        pool.release(a);
        assert_eq!(pool.num_available(), 1);
    }

    #[test]
    fn test_blocks_are_zeroed_and_sized() {
        let pool = MemoryPool::new(8, 1);
        let block = pool.acquire().unwrap();
        assert_eq!(block.as_slice(), &[0u8; 8]);
    }

    #[test]
    fn test_writes_survive_until_release() {
        let pool = MemoryPool::new(4, 1);

        let mut block = pool.acquire().unwrap();
        block.as_mut_slice().copy_from_slice(b"abcd");
        assert_eq!(block.as_slice(), b"abcd");
        pool.release(block);
    }

    #[test]
    fn test_foreign_release_ignored() {
        let pool = MemoryPool::new(16, 2);
        let other_pool = MemoryPool::new(32, 2);

        let foreign = other_pool.acquire().unwrap();
        pool.release(foreign);

        // the pool is still at its configured bound
        assert_eq!(pool.num_available(), 2);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let small = MemoryPool::new(16, 1);
        let large = MemoryPool::new(16, 3);

        large.acquire().unwrap();
        large.acquire().unwrap();
        let block_2 = large.acquire().unwrap();

        small.acquire().unwrap();
        small.release(block_2);
        assert_eq!(small.num_available(), 0);
    }

    #[test]
    fn test_double_release_guard() {
        let pool_a = MemoryPool::new(16, 2);
        let pool_b = MemoryPool::new(16, 2);

        // same shape, same index - but its twin in pool_a was never acquired
        let block_from_b = pool_b.acquire().unwrap();
        pool_a.release(block_from_b);

        assert_eq!(pool_a.num_available(), 2);
    }
}
