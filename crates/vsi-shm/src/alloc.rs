//! Variable-size allocator for the user segment.
//!
//! Chunks are header-prefixed spans carved out of the user segment. Free
//! chunks are indexed twice: a tree keyed on (size, offset) gives O(log n)
//! best-fit, and a tree keyed on offset gives O(log n) neighbor lookup for
//! coalescing. In-use chunks appear in neither tree; ownership is exactly
//! "present in the trees or handed to a caller".
//!
//! All mutation happens under the user segment mutex. A chunk whose marker
//! is neither `FREE` nor `USED`, or whose self-offset disagrees with where
//! it was found, means the segment is corrupt, and the process aborts.

use std::mem::offset_of;

use crate::btree::{Btree, BtreeError, KeyDef, KeyField, Probe, ProbePart};
use crate::pool::NodePool;
use crate::segment::{Segment, SysHeader, UserHeader};

/// Marker magic for a free chunk.
pub const MARKER_FREE: [u8; 4] = *b"FREE";

/// Marker magic for an in-use chunk.
pub const MARKER_USED: [u8; 4] = *b"USED";

/// Chunk kind tag for user-segment payload chunks.
pub const CHUNK_KIND_USER: u32 = 0;

/// Splitting a best-fit hit is only worthwhile when the remainder exceeds
/// this many bytes; smaller tails stay attached to the allocation.
pub const SPLIT_THRESHOLD: u64 = 64;

/// Chunk granularity. Sizes and offsets are multiples of this.
pub const CHUNK_ALIGN: u64 = 8;

/// Header prefixed to every chunk. The payload starts immediately after.
#[repr(C)]
pub struct ChunkHeader {
    /// `FREE` or `USED`.
    pub marker: [u8; 4],
    /// Chunk kind, [`CHUNK_KIND_USER`] for everything in this segment.
    pub kind: u32,
    /// Total chunk size including this header, multiple of 8.
    pub size: u64,
    /// The chunk's own offset from the segment base.
    pub offset: u64,
}

/// Size of [`ChunkHeader`]; also the payload's offset within a chunk.
pub const CHUNK_HEADER_SIZE: u64 = size_of::<ChunkHeader>() as u64;

static_assertions::const_assert_eq!(size_of::<ChunkHeader>(), 24);
static_assertions::const_assert_eq!(CHUNK_HEADER_SIZE % CHUNK_ALIGN, 0);

/// Key definition for the (size, offset) tree. The offset part makes keys
/// of equal-sized chunks unique, which best-fit and removal both rely on.
const BY_SIZE_KEY: KeyDef = KeyDef::two(
    KeyField::U64(offset_of!(ChunkHeader, size)),
    KeyField::U64(offset_of!(ChunkHeader, offset)),
);

/// Key definition for the offset tree.
const BY_OFFSET_KEY: KeyDef = KeyDef::one(KeyField::U64(offset_of!(ChunkHeader, offset)));

/// Per-process allocator view over the user segment.
#[derive(Clone, Copy)]
pub struct Allocator<'a> {
    user: &'a Segment,
    sys: &'a Segment,
}

impl<'a> Allocator<'a> {
    pub fn new(user: &'a Segment, sys: &'a Segment) -> Self {
        Self { user, sys }
    }

    fn user_header(&self) -> &'a UserHeader {
        // SAFETY: offset 0 of a validated user segment holds the header.
        unsafe { self.user.get::<UserHeader>(0) }
    }

    fn sys_header(&self) -> &'a SysHeader {
        // SAFETY: offset 0 of a validated system segment holds the header.
        unsafe { self.sys.get::<SysHeader>(0) }
    }

    fn by_size(&self) -> Btree<'a> {
        Btree::new(
            &self.sys_header().by_size,
            NodePool::new(self.sys),
            self.user,
            BY_SIZE_KEY,
        )
    }

    fn by_offset(&self) -> Btree<'a> {
        Btree::new(
            &self.sys_header().by_offset,
            NodePool::new(self.sys),
            self.user,
            BY_OFFSET_KEY,
        )
    }

    fn header_at(&self, offset: u64) -> *mut ChunkHeader {
        self.user.check_range(offset, size_of::<ChunkHeader>());
        // SAFETY: range checked.
        unsafe { self.user.ptr_at(offset) as *mut ChunkHeader }
    }

    /// Abort unless the chunk at `offset` carries `expected` and a matching
    /// self-offset.
    fn expect_marker(&self, offset: u64, expected: [u8; 4]) {
        let h = self.header_at(offset);
        // SAFETY: header_at checked the range.
        let (marker, self_offset) = unsafe { ((*h).marker, (*h).offset) };
        if marker != expected || self_offset != offset {
            panic!(
                "corrupt chunk at {}: marker {:?}, self-offset {}",
                offset, marker, self_offset
            );
        }
    }

    fn remove_free_chunk(&self, offset: u64, size: u64) {
        let from_size = self.by_size().remove(&Probe::two(
            ProbePart::U64(size),
            ProbePart::U64(offset),
        ));
        let from_offset = self.by_offset().remove(&Probe::one(ProbePart::U64(offset)));
        if from_size != Some(offset) || from_offset != Some(offset) {
            panic!("corrupt allocator index: free chunk {} not in both trees", offset);
        }
    }

    fn insert_free_chunk(&self, offset: u64) -> Result<(), BtreeError> {
        self.by_size().insert(offset)?;
        if let Err(e) = self.by_offset().insert(offset) {
            // Keep the trees consistent before reporting failure.
            let probe = self.by_size().record_key(offset);
            self.by_size().remove(&probe);
            return Err(e);
        }
        Ok(())
    }

    /// Round a payload length up to the chunk size that carries it.
    pub fn chunk_size_for(len: usize) -> u64 {
        crate::align_up(len + CHUNK_HEADER_SIZE as usize, CHUNK_ALIGN as usize) as u64
    }

    /// Allocate a chunk whose payload holds at least `len` bytes. Returns
    /// the payload offset, or `None` when no free chunk is large enough.
    pub fn alloc(&self, len: usize) -> Option<u64> {
        let needed = Self::chunk_size_for(len);
        let _guard = self.user_header().mutex.lock();

        let chunk = self
            .by_size()
            .ceil(&Probe::two(ProbePart::U64(needed), ProbePart::U64(0)))?;
        self.expect_marker(chunk, MARKER_FREE);

        let h = self.header_at(chunk);
        // SAFETY: range checked; segment mutex held.
        let total = unsafe { (*h).size };
        self.remove_free_chunk(chunk, total);

        let mut take = total;
        if total - needed > SPLIT_THRESHOLD {
            let rem_offset = chunk + needed;
            let rem = self.header_at(rem_offset);
            // SAFETY: the remainder lies inside the chunk we just removed.
            unsafe {
                (*rem).marker = MARKER_FREE;
                (*rem).kind = CHUNK_KIND_USER;
                (*rem).size = total - needed;
                (*rem).offset = rem_offset;
            }
            match self.insert_free_chunk(rem_offset) {
                Ok(()) => take = needed,
                Err(BtreeError::OutOfNodes) => {
                    // Index full: hand out the whole chunk instead of losing
                    // track of the tail.
                    tracing::warn!(chunk = rem_offset, "index node pool exhausted, not splitting");
                    // SAFETY: as above.
                    unsafe {
                        (*rem).marker = [0; 4];
                    }
                }
                Err(BtreeError::Duplicate) => {
                    panic!("corrupt allocator index: split remainder {} already present", rem_offset)
                }
            }
        }

        // SAFETY: as above.
        unsafe {
            (*h).marker = MARKER_USED;
            (*h).size = take;
        }
        Some(chunk + CHUNK_HEADER_SIZE)
    }

    /// Release the chunk owning `payload`, coalescing with free neighbors.
    pub fn free(&self, payload: u64) {
        let Some(offset) = payload.checked_sub(CHUNK_HEADER_SIZE) else {
            panic!("corrupt free: payload offset {} has no header", payload);
        };
        let _guard = self.user_header().mutex.lock();
        self.expect_marker(offset, MARKER_USED);

        let mut start = offset;
        // SAFETY: marker checked; segment mutex held.
        let mut size = unsafe { (*self.header_at(offset)).size };

        // Forward: absorb an immediately following free chunk.
        let next = offset + size;
        if next + CHUNK_HEADER_SIZE <= self.user.len() as u64 {
            let nh = self.header_at(next);
            // SAFETY: range checked above.
            let (nmarker, nsize, noffset) = unsafe { ((*nh).marker, (*nh).size, (*nh).offset) };
            match nmarker {
                MARKER_FREE => {
                    if noffset != next {
                        panic!("corrupt chunk at {}: self-offset {}", next, noffset);
                    }
                    self.remove_free_chunk(next, nsize);
                    size += nsize;
                    // SAFETY: as above.
                    unsafe {
                        (*nh).marker = [0; 4];
                    }
                }
                MARKER_USED => {}
                other => panic!("corrupt chunk at {}: marker {:?}", next, other),
            }
        }

        // Backward: extend an immediately preceding free chunk.
        if let Some(prev) = self.by_offset().below(&Probe::one(ProbePart::U64(start))) {
            self.expect_marker(prev, MARKER_FREE);
            let ph = self.header_at(prev);
            // SAFETY: marker checked.
            let psize = unsafe { (*ph).size };
            if prev + psize == start {
                self.remove_free_chunk(prev, psize);
                // SAFETY: as above.
                unsafe {
                    (*self.header_at(start)).marker = [0; 4];
                }
                start = prev;
                size += psize;
            }
        }

        let h = self.header_at(start);
        // SAFETY: as above.
        unsafe {
            (*h).marker = MARKER_FREE;
            (*h).kind = CHUNK_KIND_USER;
            (*h).size = size;
            (*h).offset = start;
        }
        match self.insert_free_chunk(start) {
            Ok(()) => {}
            Err(BtreeError::OutOfNodes) => {
                // Unindexable free space would break the adjacency
                // invariant; keep the chunk accounted as in-use instead.
                tracing::warn!(chunk = start, "index node pool exhausted, leaking chunk");
                // SAFETY: as above.
                unsafe {
                    (*h).marker = MARKER_USED;
                }
            }
            Err(BtreeError::Duplicate) => {
                panic!("corrupt allocator index: freed chunk {} already present", start)
            }
        }
    }

    /// Write the initial free chunk covering the whole chunk area and index
    /// it.
    ///
    /// # Safety
    ///
    /// First-time segment initialization only.
    pub unsafe fn bootstrap(&self) -> Result<(), BtreeError> {
        let base = UserHeader::chunks_base();
        let len = crate::align_down(self.user.len(), CHUNK_ALIGN as usize) as u64;
        assert!(
            len > base + CHUNK_HEADER_SIZE,
            "user segment too small for any chunk"
        );
        let h = self.header_at(base);
        // SAFETY: exclusive ownership during init.
        unsafe {
            (*h).marker = MARKER_FREE;
            (*h).kind = CHUNK_KIND_USER;
            (*h).size = len - base;
            (*h).offset = base;
        }
        self.insert_free_chunk(base)
    }

    /// Walk the chunk area and tally both populations, verifying along the
    /// way that every chunk is 8-aligned and self-consistent.
    pub fn stats(&self) -> AllocStats {
        let _guard = self.user_header().mutex.lock();
        let base = UserHeader::chunks_base();
        let end = crate::align_down(self.user.len(), CHUNK_ALIGN as usize) as u64;

        let mut stats = AllocStats::default();
        let mut cursor = base;
        while cursor < end {
            let h = self.header_at(cursor);
            // SAFETY: cursor stays on chunk boundaries inside the area.
            let (marker, size, offset) = unsafe { ((*h).marker, (*h).size, (*h).offset) };
            if offset != cursor || size == 0 || size % CHUNK_ALIGN != 0 {
                panic!("corrupt chunk at {}: size {}, self-offset {}", cursor, size, offset);
            }
            match marker {
                MARKER_FREE => {
                    stats.free_chunks += 1;
                    stats.free_bytes += size;
                }
                MARKER_USED => {
                    stats.used_chunks += 1;
                    stats.used_bytes += size;
                }
                other => panic!("corrupt chunk at {}: marker {:?}", cursor, other),
            }
            cursor += size;
        }
        stats
    }
}

/// Chunk population snapshot, for diagnostics and invariant tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub free_chunks: u64,
    pub free_bytes: u64,
    pub used_chunks: u64,
    pub used_bytes: u64,
}

impl std::fmt::Display for AllocStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunks: {} free ({} B), {} in use ({} B)",
            self.free_chunks, self.free_bytes, self.used_chunks, self.used_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{Shm, ShmConfig};

    fn test_shm(tag: &str) -> Shm {
        let dir = std::env::temp_dir();
        let cfg = ShmConfig {
            user_path: dir.join(format!("vsi_al_user_{}_{}", tag, std::process::id())),
            sys_path: dir.join(format!("vsi_al_sys_{}_{}", tag, std::process::id())),
            user_len: 1024 * 1024,
            sys_len: 1024 * 1024,
        };
        Shm::create(&cfg).unwrap()
    }

    fn cleanup(shm: Shm) {
        let user = shm.user().path().to_path_buf();
        let sys = shm.sys().path().to_path_buf();
        drop(shm);
        std::fs::remove_file(user).ok();
        std::fs::remove_file(sys).ok();
    }

    #[test]
    fn alloc_aligns_and_frees() {
        let shm = test_shm("basic");
        let a = shm.allocator();

        let initial = a.stats();
        assert_eq!(initial.used_chunks, 0);
        assert_eq!(initial.free_chunks, 1);

        let p = a.alloc(100).unwrap();
        assert_eq!(p % CHUNK_ALIGN, 0);
        let s = a.stats();
        assert_eq!(s.used_chunks, 1);
        assert_eq!(s.free_bytes + s.used_bytes, initial.free_bytes);

        a.free(p);
        assert_eq!(a.stats(), initial);
        cleanup(shm);
    }

    #[test]
    fn coalescing_leaves_no_adjacent_free_chunks() {
        let shm = test_shm("coalesce");
        let a = shm.allocator();
        let initial = a.stats();

        let ptrs: Vec<u64> = (0..8).map(|i| a.alloc(64 * (i + 1)).unwrap()).collect();

        // Free in an interleaved order so both directions of coalescing run.
        for &i in &[1usize, 3, 5, 7, 0, 2, 4, 6] {
            a.free(ptrs[i]);
            let s = a.stats();
            // stats() itself asserts chunk-walk consistency; additionally
            // no two free neighbors may remain.
            assert_eq!(s.free_bytes + s.used_bytes, initial.free_bytes);
        }

        // Everything freed: one chunk spans the whole area again.
        let end = a.stats();
        assert_eq!(end.free_chunks, 1);
        assert_eq!(end.used_chunks, 0);
        assert_eq!(end.free_bytes, initial.free_bytes);
        cleanup(shm);
    }

    #[test]
    fn best_fit_reuses_exact_hole() {
        let shm = test_shm("bestfit");
        let a = shm.allocator();

        let keep1 = a.alloc(512).unwrap();
        let hole = a.alloc(256).unwrap();
        let keep2 = a.alloc(512).unwrap();
        a.free(hole);

        // A request that fits the hole exactly must land in it.
        let again = a.alloc(256).unwrap();
        assert_eq!(again, hole);

        a.free(keep1);
        a.free(keep2);
        a.free(again);
        assert_eq!(a.stats().free_chunks, 1);
        cleanup(shm);
    }

    #[test]
    fn exhaustion_returns_none() {
        let shm = test_shm("oom");
        let a = shm.allocator();
        assert!(a.alloc(8 * 1024 * 1024).is_none());
        cleanup(shm);
    }

    #[test]
    #[should_panic(expected = "corrupt")]
    fn double_free_panics() {
        let shm = test_shm("dfree");
        let a = shm.allocator();
        let p = a.alloc(64).unwrap();
        a.free(p);

        let user = shm.user().path().to_path_buf();
        let sys = shm.sys().path().to_path_buf();
        std::fs::remove_file(user).ok();
        std::fs::remove_file(sys).ok();

        a.free(p);
    }

    #[test]
    fn stress_interleaved() {
        let shm = test_shm("stress");
        let a = shm.allocator();
        let initial = a.stats();

        // Deterministic pseudo-random sizes in [8, 4096].
        let mut state = 0x2545F491u64;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            8 + (state % 4089) as usize
        };

        let mut live: Vec<u64> = Vec::new();
        for round in 0..10_000 {
            if round % 3 == 2 && !live.is_empty() {
                let idx = round % live.len();
                a.free(live.swap_remove(idx));
            } else if let Some(p) = a.alloc(rand()) {
                live.push(p);
            } else if let Some(p) = live.pop() {
                a.free(p);
            }
        }
        for p in live.drain(..) {
            a.free(p);
        }

        let end = a.stats();
        assert_eq!(end.used_chunks, 0);
        assert_eq!(end.free_chunks, 1);
        assert_eq!(end.free_bytes, initial.free_bytes);
        cleanup(shm);
    }
}
