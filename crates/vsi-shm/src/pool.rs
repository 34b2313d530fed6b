//! Fixed-size node pool in the system segment.
//!
//! B-tree nodes need backing storage, but the variable-size allocator keeps
//! its own free chunks *in* B-trees. Routing node allocation through that
//! allocator would deadlock the very first insert, so index nodes come from
//! this self-contained pool instead: equal-size blocks threaded into a
//! singly-linked free list at bootstrap. Pops and pushes are O(1) under the
//! system segment mutex. There is no splitting and no coalescing.

use std::cell::UnsafeCell;

use crate::END_OF_LIST;
use crate::segment::{Segment, SysHeader};

/// Size of one pool block. Must hold a B-tree node.
pub const NODE_SIZE: usize = 256;

#[repr(C)]
struct PoolList {
    head: u64,
    tail: u64,
    count: u64,
}

/// Free-list state embedded in [`SysHeader`], guarded by the system segment
/// mutex.
#[repr(C)]
pub struct PoolState {
    inner: UnsafeCell<PoolList>,
}

// SAFETY: only touched under the system segment mutex.
unsafe impl Send for PoolState {}
unsafe impl Sync for PoolState {}

impl PoolState {
    /// Write an empty free list.
    ///
    /// # Safety
    ///
    /// First-time initialization only, with exclusive segment ownership.
    pub(crate) unsafe fn init_empty(this: *mut PoolState) {
        // SAFETY: exclusive ownership during init.
        unsafe {
            (*this).inner.get().write(PoolList {
                head: END_OF_LIST,
                tail: END_OF_LIST,
                count: 0,
            });
        }
    }
}

/// View of the node pool for one attached process.
#[derive(Clone, Copy)]
pub struct NodePool<'a> {
    sys: &'a Segment,
}

impl<'a> NodePool<'a> {
    pub fn new(sys: &'a Segment) -> Self {
        Self { sys }
    }

    pub(crate) fn segment(&self) -> &'a Segment {
        self.sys
    }

    fn header(&self) -> &'a SysHeader {
        // SAFETY: offset 0 of a validated system segment holds the header.
        unsafe { self.sys.get::<SysHeader>(0) }
    }

    #[allow(clippy::mut_from_ref)]
    fn list_mut(&self) -> &mut PoolList {
        // SAFETY: callers hold the system segment mutex.
        unsafe { &mut *self.header().pool.inner.get() }
    }

    // The link to the next free block lives in the block's first 8 bytes.
    unsafe fn read_next(&self, block: u64) -> u64 {
        // SAFETY: block is a pool offset validated by check_range.
        unsafe { *self.sys.get::<u64>(block) }
    }

    unsafe fn write_next(&self, block: u64, next: u64) {
        // SAFETY: block is a pool offset validated by check_range.
        unsafe {
            *self.sys.get_mut::<u64>(block) = next;
        }
    }

    /// Thread the whole block area into the free list.
    ///
    /// # Safety
    ///
    /// First-time initialization only, before the segment is published.
    pub unsafe fn bootstrap(&self) {
        let base = SysHeader::pool_base();
        let len = self.sys.len() as u64;
        let count = (len.saturating_sub(base)) / NODE_SIZE as u64;

        for i in 0..count {
            let block = base + i * NODE_SIZE as u64;
            let next = if i + 1 < count {
                block + NODE_SIZE as u64
            } else {
                END_OF_LIST
            };
            // SAFETY: block is inside the mapped pool area.
            unsafe { self.write_next(block, next) };
        }

        let list = self.list_mut();
        if count == 0 {
            list.head = END_OF_LIST;
            list.tail = END_OF_LIST;
        } else {
            list.head = base;
            list.tail = base + (count - 1) * NODE_SIZE as u64;
        }
        list.count = count;
    }

    /// Pop one block. Returns `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<u64> {
        let _guard = self.header().mutex.lock();
        let list = self.list_mut();
        if list.head == END_OF_LIST {
            return None;
        }
        let block = list.head;
        // SAFETY: a listed block is inside the pool area.
        list.head = unsafe { self.read_next(block) };
        if list.head == END_OF_LIST {
            list.tail = END_OF_LIST;
        }
        list.count -= 1;
        Some(block)
    }

    /// Push a block back onto the free list.
    pub fn free(&self, block: u64) {
        self.sys.check_range(block, NODE_SIZE);
        let _guard = self.header().mutex.lock();
        let list = self.list_mut();
        // SAFETY: range checked above.
        unsafe { self.write_next(block, list.head) };
        if list.head == END_OF_LIST {
            list.tail = block;
        }
        list.head = block;
        list.count += 1;
    }

    /// Number of free blocks.
    pub fn free_count(&self) -> u64 {
        let _guard = self.header().mutex.lock();
        self.list_mut().count
    }
}
