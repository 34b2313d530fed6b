//! Shared-memory substrate for the vehicle signal interface.
//!
//! Two file-backed segments, mapped by every participating process:
//!
//! * the **user segment** holds variable-size payload chunks managed by an
//!   embedded best-fit allocator ([`alloc`]);
//! * the **system segment** holds a fixed-size node pool ([`pool`]) backing
//!   the process-shared B-trees ([`btree`]) that index both free chunks and
//!   the records of the signal layer above.
//!
//! Every cross-process reference is a byte offset from a segment base.
//! Synchronization uses process-shared pthread primitives ([`sync`])
//! embedded directly in the mapped memory.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod btree;
pub mod pool;
pub mod segment;
pub mod shm;
pub mod sync;

pub use alloc::{AllocStats, Allocator, CHUNK_HEADER_SIZE};
pub use btree::{Btree, BtreeError, BtreeHeader, KeyDef, KeyField, Probe, ProbePart};
pub use pool::{NODE_SIZE, NodePool};
pub use segment::{Segment, SegmentError, SysHeader, UserHeader};
pub use shm::{Shm, ShmConfig};
pub use sync::{
    Acquire, Deadline, SharedCondvar, SharedMutex, SharedMutexGuard, SignalSem, deadline_after,
    deadline_expired,
};

/// Sentinel offset terminating every in-segment linked structure.
pub const END_OF_LIST: u64 = u64::MAX;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
