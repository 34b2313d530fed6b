//! Process-shared B-tree over pool nodes.
//!
//! An ordered multi-field index usable from any attached process. Nodes are
//! fixed 256-byte blocks from the system-segment pool ([`crate::pool`]);
//! entries are offsets of records living in the record segment (normally the
//! user segment). The tree never stores keys directly: a [`KeyDef`] names up
//! to two typed fields *inside* each record, and comparisons re-read those
//! fields through the segment base. That keeps entries pointer-free and lets
//! processes with different mappings walk the same tree.
//!
//! Every operation runs under the tree's own recursive process-shared mutex.
//! Lookups come in three flavors: exact [`get`](Btree::get), the least entry
//! at or above a probe ([`ceil`](Btree::ceil), used for best-fit allocation),
//! and the greatest entry strictly below a probe ([`below`](Btree::below),
//! used for coalescing).

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::io;

use crate::END_OF_LIST;
use crate::pool::{NODE_SIZE, NodePool};
use crate::segment::Segment;
use crate::sync::SharedMutex;

/// Minimum degree. Nodes hold between `MIN_KEYS` and `MAX_KEYS` entries
/// (except the root, which may hold fewer).
const MIN_DEGREE: usize = 8;
const MAX_KEYS: usize = 2 * MIN_DEGREE - 1;
const MIN_KEYS: usize = MIN_DEGREE - 1;

#[repr(C)]
struct Node {
    key_count: u16,
    leaf: u16,
    _pad: u32,
    /// Record offsets, ordered by their extracted keys.
    records: [u64; MAX_KEYS],
    /// Child node offsets; `key_count + 1` are live on interior nodes.
    children: [u64; MAX_KEYS + 1],
}

const _: () = assert!(size_of::<Node>() == 256);
const _: () = assert!(size_of::<Node>() <= NODE_SIZE);

#[repr(C)]
struct TreeState {
    root: u64,
    len: u64,
}

/// Tree root and entry count, embedded in a segment header next to the
/// tree's mutex.
#[repr(C)]
pub struct BtreeHeader {
    pub mutex: SharedMutex,
    state: UnsafeCell<TreeState>,
}

// SAFETY: state is only touched under the embedded mutex.
unsafe impl Send for BtreeHeader {}
unsafe impl Sync for BtreeHeader {}

impl BtreeHeader {
    /// Initialize an empty tree in place.
    ///
    /// # Safety
    ///
    /// First-time segment initialization only.
    pub unsafe fn init(this: *mut BtreeHeader) -> io::Result<()> {
        // SAFETY: forwarded contract.
        unsafe {
            SharedMutex::init(&raw mut (*this).mutex)?;
            (*this).state.get().write(TreeState {
                root: END_OF_LIST,
                len: 0,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Key definitions and probes
// =============================================================================

/// One typed key field, located by its byte offset inside the record.
#[derive(Clone, Copy, Debug)]
pub enum KeyField {
    U32(usize),
    U64(usize),
    /// A `u64` field holding the offset of a NUL-terminated string in the
    /// record segment. Compared bytewise.
    Name(usize),
}

/// A composite key: one or two fields compared lexicographically.
#[derive(Clone, Copy, Debug)]
pub struct KeyDef {
    first: KeyField,
    second: Option<KeyField>,
}

impl KeyDef {
    pub const fn one(first: KeyField) -> Self {
        Self {
            first,
            second: None,
        }
    }

    pub const fn two(first: KeyField, second: KeyField) -> Self {
        Self {
            first,
            second: Some(second),
        }
    }
}

/// One probe value, matching the shape of the corresponding [`KeyField`].
#[derive(Clone, Copy, Debug)]
pub enum ProbePart<'a> {
    U32(u32),
    U64(u64),
    Str(&'a [u8]),
}

/// A lookup key. A probe may carry fewer parts than the tree's [`KeyDef`];
/// the missing part compares equal, which turns `get` into a prefix match
/// and `ceil`/`below` into range endpoints.
#[derive(Clone, Copy, Debug)]
pub struct Probe<'a> {
    first: ProbePart<'a>,
    second: Option<ProbePart<'a>>,
}

impl<'a> Probe<'a> {
    pub const fn one(first: ProbePart<'a>) -> Self {
        Self {
            first,
            second: None,
        }
    }

    pub const fn two(first: ProbePart<'a>, second: ProbePart<'a>) -> Self {
        Self {
            first,
            second: Some(second),
        }
    }
}

fn cmp_parts(a: &ProbePart<'_>, b: &ProbePart<'_>) -> Ordering {
    match (a, b) {
        (ProbePart::U32(x), ProbePart::U32(y)) => x.cmp(y),
        (ProbePart::U64(x), ProbePart::U64(y)) => x.cmp(y),
        (ProbePart::Str(x), ProbePart::Str(y)) => x.cmp(y),
        _ => panic!("corrupt index: probe shape does not match key definition"),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from tree mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtreeError {
    /// An entry with an equal key already exists.
    Duplicate,
    /// The node pool is exhausted.
    OutOfNodes,
}

impl std::fmt::Display for BtreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate key"),
            Self::OutOfNodes => write!(f, "node pool exhausted"),
        }
    }
}

impl std::error::Error for BtreeError {}

// =============================================================================
// Tree view
// =============================================================================

/// Per-process view of one shared tree.
#[derive(Clone, Copy)]
pub struct Btree<'a> {
    header: &'a BtreeHeader,
    pool: NodePool<'a>,
    records: &'a Segment,
    def: KeyDef,
}

impl<'a> Btree<'a> {
    pub fn new(
        header: &'a BtreeHeader,
        pool: NodePool<'a>,
        records: &'a Segment,
        def: KeyDef,
    ) -> Self {
        Self {
            header,
            pool,
            records,
            def,
        }
    }

    // ---- state accessors (single-expression borrows under the tree mutex)

    fn root(&self) -> u64 {
        // SAFETY: callers hold the tree mutex.
        unsafe { (*self.header.state.get()).root }
    }

    fn set_root(&self, root: u64) {
        // SAFETY: callers hold the tree mutex.
        unsafe { (*self.header.state.get()).root = root }
    }

    fn add_len(&self, delta: i64) {
        // SAFETY: callers hold the tree mutex.
        unsafe {
            let st = &mut *self.header.state.get();
            st.len = st.len.wrapping_add_signed(delta);
        }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        let _guard = self.header.mutex.lock();
        // SAFETY: mutex held.
        unsafe { (*self.header.state.get()).len }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- node access

    fn node_ptr(&self, off: u64) -> *mut Node {
        self.pool.segment().check_range(off, size_of::<Node>());
        // SAFETY: range checked.
        unsafe { self.pool.segment().ptr_at(off) as *mut Node }
    }

    fn key_count(&self, off: u64) -> usize {
        // SAFETY: node offsets come from the tree itself.
        unsafe { (*self.node_ptr(off)).key_count as usize }
    }

    fn is_leaf(&self, off: u64) -> bool {
        // SAFETY: as above.
        unsafe { (*self.node_ptr(off)).leaf != 0 }
    }

    fn record_at(&self, off: u64, i: usize) -> u64 {
        // SAFETY: as above.
        unsafe { (*self.node_ptr(off)).records[i] }
    }

    fn child_at(&self, off: u64, i: usize) -> u64 {
        // SAFETY: as above.
        unsafe { (*self.node_ptr(off)).children[i] }
    }

    fn alloc_node(&self, leaf: bool) -> Result<u64, BtreeError> {
        let off = self.pool.alloc().ok_or(BtreeError::OutOfNodes)?;
        let n = self.node_ptr(off);
        // SAFETY: fresh block, exclusively ours until linked into the tree.
        unsafe {
            (*n).key_count = 0;
            (*n).leaf = leaf as u16;
            (*n)._pad = 0;
        }
        Ok(off)
    }

    // ---- key comparison

    fn field_part(&self, rec: u64, field: KeyField) -> ProbePart<'a> {
        match field {
            // SAFETY: record offsets were validated when inserted; fields
            // are plain integers inside the record.
            KeyField::U32(off) => ProbePart::U32(unsafe { *self.records.get::<u32>(rec + off as u64) }),
            KeyField::U64(off) => ProbePart::U64(unsafe { *self.records.get::<u64>(rec + off as u64) }),
            KeyField::Name(off) => {
                // SAFETY: as above; the string offset was written with its NUL.
                let s = unsafe { *self.records.get::<u64>(rec + off as u64) };
                ProbePart::Str(unsafe { self.records.cstr_bytes(s) })
            }
        }
    }

    /// Extract a record's key as a probe.
    pub fn record_key(&self, rec: u64) -> Probe<'a> {
        Probe {
            first: self.field_part(rec, self.def.first),
            second: self.def.second.map(|f| self.field_part(rec, f)),
        }
    }

    /// Compare `probe` against the key of `rec`.
    fn cmp_probe(&self, probe: &Probe<'_>, rec: u64) -> Ordering {
        let first = self.field_part(rec, self.def.first);
        match cmp_parts(&probe.first, &first) {
            Ordering::Equal => {}
            other => return other,
        }
        match (probe.second, self.def.second) {
            (Some(p), Some(f)) => cmp_parts(&p, &self.field_part(rec, f)),
            _ => Ordering::Equal,
        }
    }

    fn cmp_records(&self, a: u64, b: u64) -> Ordering {
        let probe = self.record_key(a);
        self.cmp_probe(&probe, b)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Exact lookup. Returns the record offset.
    pub fn get(&self, probe: &Probe<'_>) -> Option<u64> {
        let _guard = self.header.mutex.lock();
        let mut cur = self.root();
        while cur != END_OF_LIST {
            let count = self.key_count(cur);
            let mut i = 0;
            while i < count {
                match self.cmp_probe(probe, self.record_at(cur, i)) {
                    Ordering::Greater => i += 1,
                    Ordering::Equal => return Some(self.record_at(cur, i)),
                    Ordering::Less => break,
                }
            }
            if self.is_leaf(cur) {
                return None;
            }
            cur = self.child_at(cur, i);
        }
        None
    }

    /// Least entry with key at or above `probe`.
    pub fn ceil(&self, probe: &Probe<'_>) -> Option<u64> {
        let _guard = self.header.mutex.lock();
        let mut best = None;
        let mut cur = self.root();
        while cur != END_OF_LIST {
            let count = self.key_count(cur);
            let mut i = 0;
            while i < count && self.cmp_probe(probe, self.record_at(cur, i)) == Ordering::Greater {
                i += 1;
            }
            if i < count {
                let rec = self.record_at(cur, i);
                if self.cmp_probe(probe, rec) == Ordering::Equal {
                    return Some(rec);
                }
                best = Some(rec);
            }
            if self.is_leaf(cur) {
                break;
            }
            cur = self.child_at(cur, i);
        }
        best
    }

    /// Greatest entry with key strictly below `probe`.
    pub fn below(&self, probe: &Probe<'_>) -> Option<u64> {
        let _guard = self.header.mutex.lock();
        let mut best = None;
        let mut cur = self.root();
        while cur != END_OF_LIST {
            let count = self.key_count(cur);
            // records[..i] are strictly below the probe.
            let mut i = count;
            while i > 0 && self.cmp_probe(probe, self.record_at(cur, i - 1)) != Ordering::Greater {
                i -= 1;
            }
            if i > 0 {
                best = Some(self.record_at(cur, i - 1));
            }
            if self.is_leaf(cur) {
                break;
            }
            cur = self.child_at(cur, i);
        }
        best
    }

    /// In-order traversal, ascending key order.
    pub fn traverse<F: FnMut(u64)>(&self, mut f: F) {
        let _guard = self.header.mutex.lock();
        let root = self.root();
        if root != END_OF_LIST {
            self.walk(root, &mut f);
        }
    }

    fn walk<F: FnMut(u64)>(&self, x: u64, f: &mut F) {
        let count = self.key_count(x);
        let leaf = self.is_leaf(x);
        for i in 0..count {
            if !leaf {
                self.walk(self.child_at(x, i), f);
            }
            f(self.record_at(x, i));
        }
        if !leaf {
            self.walk(self.child_at(x, count), f);
        }
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert `rec`, keyed by the fields named in the tree's [`KeyDef`].
    pub fn insert(&self, rec: u64) -> Result<(), BtreeError> {
        let _guard = self.header.mutex.lock();

        if self.root() == END_OF_LIST {
            let root = self.alloc_node(true)?;
            let n = self.node_ptr(root);
            // SAFETY: fresh node, tree mutex held.
            unsafe {
                (*n).records[0] = rec;
                (*n).key_count = 1;
            }
            self.set_root(root);
            self.add_len(1);
            return Ok(());
        }

        if self.key_count(self.root()) == MAX_KEYS {
            let old_root = self.root();
            let new_root = self.alloc_node(false)?;
            // SAFETY: fresh node, tree mutex held.
            unsafe {
                (*self.node_ptr(new_root)).children[0] = old_root;
            }
            self.split_child(new_root, 0)?;
            self.set_root(new_root);
        }

        let mut cur = self.root();
        loop {
            let count = self.key_count(cur);
            let mut i = 0;
            while i < count {
                match self.cmp_records(rec, self.record_at(cur, i)) {
                    Ordering::Greater => i += 1,
                    Ordering::Equal => return Err(BtreeError::Duplicate),
                    Ordering::Less => break,
                }
            }

            if self.is_leaf(cur) {
                let n = self.node_ptr(cur);
                // SAFETY: tree mutex held; count < MAX_KEYS by the
                // preemptive splits on the way down.
                unsafe {
                    (*n).records.copy_within(i..count, i + 1);
                    (*n).records[i] = rec;
                    (*n).key_count = (count + 1) as u16;
                }
                self.add_len(1);
                return Ok(());
            }

            let mut child = self.child_at(cur, i);
            if self.key_count(child) == MAX_KEYS {
                self.split_child(cur, i)?;
                // The median moved up into slot i; re-aim.
                match self.cmp_records(rec, self.record_at(cur, i)) {
                    Ordering::Greater => child = self.child_at(cur, i + 1),
                    Ordering::Equal => return Err(BtreeError::Duplicate),
                    Ordering::Less => child = self.child_at(cur, i),
                }
            }
            cur = child;
        }
    }

    /// Split the full child at `parent.children[idx]`, moving its median key
    /// up into the parent.
    fn split_child(&self, parent: u64, idx: usize) -> Result<(), BtreeError> {
        let child = self.child_at(parent, idx);
        debug_assert_eq!(self.key_count(child), MAX_KEYS);

        let leaf = self.is_leaf(child);
        let right = self.alloc_node(leaf)?;

        let cp = self.node_ptr(child);
        let rp = self.node_ptr(right);
        let pp = self.node_ptr(parent);

        // SAFETY: three distinct nodes, tree mutex held.
        unsafe {
            // Upper MIN_KEYS entries move to the new right node.
            (&mut (*rp).records)[..MIN_KEYS].copy_from_slice(&(&(*cp).records)[MIN_DEGREE..MAX_KEYS]);
            if !leaf {
                (&mut (*rp).children)[..MIN_DEGREE]
                    .copy_from_slice(&(&(*cp).children)[MIN_DEGREE..MAX_KEYS + 1]);
            }
            (*rp).key_count = MIN_KEYS as u16;

            let median = (*cp).records[MIN_KEYS];
            (*cp).key_count = MIN_KEYS as u16;

            // Shift the parent open at idx.
            let pcount = (*pp).key_count as usize;
            (*pp).records.copy_within(idx..pcount, idx + 1);
            (*pp).children.copy_within(idx + 1..pcount + 1, idx + 2);
            (*pp).records[idx] = median;
            (*pp).children[idx + 1] = right;
            (*pp).key_count = (pcount + 1) as u16;
        }
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove the entry matching `probe`, returning its record offset.
    pub fn remove(&self, probe: &Probe<'_>) -> Option<u64> {
        let _guard = self.header.mutex.lock();
        let root = self.root();
        if root == END_OF_LIST {
            return None;
        }

        let removed = self.remove_from(root, probe);

        // The root is allowed to underflow; collapse it when it empties.
        let root = self.root();
        if self.key_count(root) == 0 {
            if self.is_leaf(root) {
                self.set_root(END_OF_LIST);
            } else {
                self.set_root(self.child_at(root, 0));
            }
            self.pool.free(root);
        }

        if removed.is_some() {
            self.add_len(-1);
        }
        removed
    }

    fn remove_from(&self, x: u64, probe: &Probe<'_>) -> Option<u64> {
        let count = self.key_count(x);
        let mut i = 0;
        while i < count && self.cmp_probe(probe, self.record_at(x, i)) == Ordering::Greater {
            i += 1;
        }
        let found = i < count && self.cmp_probe(probe, self.record_at(x, i)) == Ordering::Equal;

        if found {
            let rec = self.record_at(x, i);
            if self.is_leaf(x) {
                let n = self.node_ptr(x);
                // SAFETY: tree mutex held.
                unsafe {
                    (*n).records.copy_within(i + 1..count, i);
                    (*n).key_count = (count - 1) as u16;
                }
                return Some(rec);
            }

            let left = self.child_at(x, i);
            let right = self.child_at(x, i + 1);
            if self.key_count(left) > MIN_KEYS {
                // Replace with the predecessor and delete it below.
                let pred = self.max_record(left);
                // SAFETY: tree mutex held.
                unsafe {
                    (*self.node_ptr(x)).records[i] = pred;
                }
                let pred_key = self.record_key(pred);
                self.remove_from(left, &pred_key);
                Some(rec)
            } else if self.key_count(right) > MIN_KEYS {
                let succ = self.min_record(right);
                // SAFETY: tree mutex held.
                unsafe {
                    (*self.node_ptr(x)).records[i] = succ;
                }
                let succ_key = self.record_key(succ);
                self.remove_from(right, &succ_key);
                Some(rec)
            } else {
                // Both neighbors minimal: merge around the key and recurse.
                self.merge_children(x, i);
                self.remove_from(left, probe)
            }
        } else {
            if self.is_leaf(x) {
                return None;
            }
            let child = self.ensure_child(x, i);
            self.remove_from(child, probe)
        }
    }

    /// Guarantee `x.children[idx]` holds more than `MIN_KEYS` entries before
    /// descending into it, borrowing from a sibling or merging. Returns the
    /// (possibly replaced) child to descend into.
    fn ensure_child(&self, x: u64, idx: usize) -> u64 {
        let child = self.child_at(x, idx);
        if self.key_count(child) > MIN_KEYS {
            return child;
        }
        let count = self.key_count(x);

        if idx > 0 && self.key_count(self.child_at(x, idx - 1)) > MIN_KEYS {
            self.rotate_right(x, idx - 1);
            return child;
        }
        if idx < count && self.key_count(self.child_at(x, idx + 1)) > MIN_KEYS {
            self.rotate_left(x, idx);
            return child;
        }

        if idx < count {
            self.merge_children(x, idx);
            child
        } else {
            self.merge_children(x, idx - 1);
            self.child_at(x, idx - 1)
        }
    }

    /// Move the last entry of `x.children[i]` up into `x.records[i]` and the
    /// old separator down into the front of `x.children[i + 1]`.
    fn rotate_right(&self, x: u64, i: usize) {
        let left = self.child_at(x, i);
        let right = self.child_at(x, i + 1);
        let lp = self.node_ptr(left);
        let rp = self.node_ptr(right);
        let xp = self.node_ptr(x);

        // SAFETY: three distinct nodes, tree mutex held.
        unsafe {
            let lcount = (*lp).key_count as usize;
            let rcount = (*rp).key_count as usize;

            (*rp).records.copy_within(0..rcount, 1);
            (*rp).records[0] = (*xp).records[i];
            if (*rp).leaf == 0 {
                (*rp).children.copy_within(0..rcount + 1, 1);
                (*rp).children[0] = (*lp).children[lcount];
            }
            (*rp).key_count = (rcount + 1) as u16;

            (*xp).records[i] = (*lp).records[lcount - 1];
            (*lp).key_count = (lcount - 1) as u16;
        }
    }

    /// Mirror of [`rotate_right`](Self::rotate_right): first entry of
    /// `x.children[i + 1]` feeds `x.records[i]`.
    fn rotate_left(&self, x: u64, i: usize) {
        let left = self.child_at(x, i);
        let right = self.child_at(x, i + 1);
        let lp = self.node_ptr(left);
        let rp = self.node_ptr(right);
        let xp = self.node_ptr(x);

        // SAFETY: three distinct nodes, tree mutex held.
        unsafe {
            let lcount = (*lp).key_count as usize;
            let rcount = (*rp).key_count as usize;

            (*lp).records[lcount] = (*xp).records[i];
            if (*lp).leaf == 0 {
                (*lp).children[lcount + 1] = (*rp).children[0];
            }
            (*lp).key_count = (lcount + 1) as u16;

            (*xp).records[i] = (*rp).records[0];
            (*rp).records.copy_within(1..rcount, 0);
            if (*rp).leaf == 0 {
                (*rp).children.copy_within(1..rcount + 1, 0);
            }
            (*rp).key_count = (rcount - 1) as u16;
        }
    }

    /// Merge `x.records[i]` and `x.children[i + 1]` into `x.children[i]`,
    /// freeing the emptied right node.
    fn merge_children(&self, x: u64, i: usize) {
        let left = self.child_at(x, i);
        let right = self.child_at(x, i + 1);
        let lp = self.node_ptr(left);
        let rp = self.node_ptr(right);
        let xp = self.node_ptr(x);

        // SAFETY: three distinct nodes, tree mutex held.
        unsafe {
            let lcount = (*lp).key_count as usize;
            let rcount = (*rp).key_count as usize;
            debug_assert!(lcount + rcount + 1 <= MAX_KEYS);

            (*lp).records[lcount] = (*xp).records[i];
            (&mut (*lp).records)[lcount + 1..lcount + 1 + rcount]
                .copy_from_slice(&(&(*rp).records)[..rcount]);
            if (*lp).leaf == 0 {
                (&mut (*lp).children)[lcount + 1..lcount + 2 + rcount]
                    .copy_from_slice(&(&(*rp).children)[..rcount + 1]);
            }
            (*lp).key_count = (lcount + 1 + rcount) as u16;

            let xcount = (*xp).key_count as usize;
            (*xp).records.copy_within(i + 1..xcount, i);
            (*xp).children.copy_within(i + 2..xcount + 1, i + 1);
            (*xp).key_count = (xcount - 1) as u16;
        }

        self.pool.free(right);
    }

    fn max_record(&self, mut x: u64) -> u64 {
        while !self.is_leaf(x) {
            x = self.child_at(x, self.key_count(x));
        }
        self.record_at(x, self.key_count(x) - 1)
    }

    fn min_record(&self, mut x: u64) -> u64 {
        while !self.is_leaf(x) {
            x = self.child_at(x, 0);
        }
        self.record_at(x, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{Shm, ShmConfig};

    fn test_shm(tag: &str) -> Shm {
        let dir = std::env::temp_dir();
        let cfg = ShmConfig {
            user_path: dir.join(format!("vsi_bt_user_{}_{}", tag, std::process::id())),
            sys_path: dir.join(format!("vsi_bt_sys_{}_{}", tag, std::process::id())),
            user_len: 1024 * 1024,
            sys_len: 512 * 1024,
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

    // Test records: a bare u64 key written straight into the chunk area,
    // well past anything the bootstrap touches.
    const REC_BASE: u64 = 512 * 1024;

    fn put_rec(shm: &Shm, i: u64, key: u64) -> u64 {
        let off = REC_BASE + i * 16;
        unsafe {
            *shm.user().get_mut::<u64>(off) = key;
        }
        off
    }

    fn tree(shm: &Shm) -> Btree<'_> {
        // Borrow the (otherwise unused) id-index header for a scratch tree.
        Btree::new(
            &shm.user_header().id_index,
            NodePool::new(shm.sys()),
            shm.user(),
            KeyDef::one(KeyField::U64(0)),
        )
    }

    fn keys_in_order(t: &Btree<'_>, shm: &Shm) -> Vec<u64> {
        let mut out = Vec::new();
        t.traverse(|rec| {
            out.push(unsafe { *shm.user().get::<u64>(rec) });
        });
        out
    }

    #[test]
    fn insert_get_traverse() {
        let shm = test_shm("igt");
        let t = tree(&shm);

        // A permuted insertion order that forces several splits.
        let n = 300u64;
        for i in 0..n {
            let key = (i * 7919) % 104729;
            t.insert(put_rec(&shm, i, key)).unwrap();
        }
        assert_eq!(t.len(), n);

        for i in 0..n {
            let key = (i * 7919) % 104729;
            let rec = t.get(&Probe::one(ProbePart::U64(key))).unwrap();
            assert_eq!(unsafe { *shm.user().get::<u64>(rec) }, key);
        }
        assert!(t.get(&Probe::one(ProbePart::U64(104729))).is_none());

        let keys = keys_in_order(&t, &shm);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), n as usize);

        cleanup(shm);
    }

    #[test]
    fn duplicate_rejected() {
        let shm = test_shm("dup");
        let t = tree(&shm);
        t.insert(put_rec(&shm, 0, 42)).unwrap();
        assert_eq!(
            t.insert(put_rec(&shm, 1, 42)),
            Err(BtreeError::Duplicate)
        );
        assert_eq!(t.len(), 1);
        cleanup(shm);
    }

    #[test]
    fn ceil_and_below() {
        let shm = test_shm("cb");
        let t = tree(&shm);
        for (i, key) in [10u64, 20, 30, 40, 50].iter().enumerate() {
            t.insert(put_rec(&shm, i as u64, *key)).unwrap();
        }

        let key_of = |rec: u64| unsafe { *shm.user().get::<u64>(rec) };

        assert_eq!(t.ceil(&Probe::one(ProbePart::U64(25))).map(key_of), Some(30));
        assert_eq!(t.ceil(&Probe::one(ProbePart::U64(30))).map(key_of), Some(30));
        assert_eq!(t.ceil(&Probe::one(ProbePart::U64(5))).map(key_of), Some(10));
        assert_eq!(t.ceil(&Probe::one(ProbePart::U64(51))), None);

        assert_eq!(t.below(&Probe::one(ProbePart::U64(25))).map(key_of), Some(20));
        assert_eq!(t.below(&Probe::one(ProbePart::U64(30))).map(key_of), Some(20));
        assert_eq!(t.below(&Probe::one(ProbePart::U64(10))), None);
        assert_eq!(t.below(&Probe::one(ProbePart::U64(1000))).map(key_of), Some(50));

        cleanup(shm);
    }

    #[test]
    fn remove_all_orders() {
        let shm = test_shm("rm");
        let t = tree(&shm);

        let n = 300u64;
        for i in 0..n {
            t.insert(put_rec(&shm, i, i)).unwrap();
        }

        // Remove odd keys first, then evens in descending order, exercising
        // leaf removal, rotations, and merges.
        for key in (1..n).step_by(2) {
            let rec = t.remove(&Probe::one(ProbePart::U64(key))).unwrap();
            assert_eq!(unsafe { *shm.user().get::<u64>(rec) }, key);
        }
        assert_eq!(t.len(), n / 2);
        for key in (0..n).step_by(2) {
            assert!(t.get(&Probe::one(ProbePart::U64(key))).is_some());
        }

        for key in (0..n as usize).step_by(2).rev() {
            assert!(t.remove(&Probe::one(ProbePart::U64(key as u64))).is_some());
        }
        assert_eq!(t.len(), 0);
        assert!(t.get(&Probe::one(ProbePart::U64(0))).is_none());
        assert!(t.remove(&Probe::one(ProbePart::U64(0))).is_none());

        // The tree must hand every node back to the pool.
        let free_after = NodePool::new(shm.sys()).free_count();
        t.insert(put_rec(&shm, 0, 7)).unwrap();
        assert_eq!(NodePool::new(shm.sys()).free_count(), free_after - 1);

        cleanup(shm);
    }

    #[test]
    fn composite_name_key() {
        let shm = test_shm("name");
        // Record layout: { u32 domain, u32 pad, u64 name_offset }.
        let def = KeyDef::two(KeyField::U32(0), KeyField::Name(8));
        let t = Btree::new(
            &shm.user_header().name_index,
            NodePool::new(shm.sys()),
            shm.user(),
            def,
        );

        let names: [&[u8]; 3] = [b"brake", b"speed", b"throttle"];
        let mut str_off = REC_BASE + 4096;
        for (i, name) in names.iter().enumerate() {
            unsafe {
                shm.user()
                    .bytes_mut(str_off, name.len())
                    .copy_from_slice(name);
                *shm.user().get_mut::<u8>(str_off + name.len() as u64) = 0;
            }
            let rec = REC_BASE + 8192 + i as u64 * 16;
            unsafe {
                *shm.user().get_mut::<u32>(rec) = 1;
                *shm.user().get_mut::<u32>(rec + 4) = 0;
                *shm.user().get_mut::<u64>(rec + 8) = str_off;
            }
            t.insert(rec).unwrap();
            str_off += 64;
        }

        let rec = t
            .get(&Probe::two(ProbePart::U32(1), ProbePart::Str(b"speed")))
            .unwrap();
        assert_eq!(unsafe { *shm.user().get::<u32>(rec) }, 1);
        assert!(
            t.get(&Probe::two(ProbePart::U32(1), ProbePart::Str(b"turn")))
                .is_none()
        );
        assert!(
            t.get(&Probe::two(ProbePart::U32(2), ProbePart::Str(b"speed")))
                .is_none()
        );

        cleanup(shm);
    }
}
