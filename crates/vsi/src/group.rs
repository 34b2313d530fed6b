//! Signal groups and collective retrieval.
//!
//! A group is an ordered membership list of signal-list references. Members
//! reference their signal lists by offset and never own them: deleting a
//! group or removing a member leaves all signal data in place.
//!
//! The blocking collective operations spawn one worker thread per member.
//! `listen_all` joins every worker; `listen_any` lets the first worker that
//! receives a sample claim a process-local flag, after which the losers
//! observe the claim and bow out without consuming anything. That claim
//! check is the cooperative replacement for thread cancellation: a worker
//! parked on its list's condition variable re-checks the flag on every
//! wakeup and on a short wait slice.

use std::cell::UnsafeCell;
use std::io;
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, Ordering};

use vsi_shm::{
    Acquire, Btree, Deadline, END_OF_LIST, KeyDef, KeyField, Probe, ProbePart, SharedMutex, Shm,
};

use crate::error::{Error, Result};
use crate::signal::{FetchMode, fetch, flush, list_at};
use crate::types::{DomainId, GroupId, MemberFetch, SignalId};

/// Per-group record living in the user segment.
#[repr(C)]
pub struct GroupList {
    pub group_id: u32,
    _pad: u32,
    state: UnsafeCell<GroupState>,
    pub mutex: SharedMutex,
}

#[repr(C)]
struct GroupState {
    head: u64,
    tail: u64,
    count: u32,
    _pad: u32,
}

/// One membership record: a link and the referenced signal list.
#[repr(C)]
struct GroupMember {
    next: u64,
    list: u64,
}

const GROUP_KEY: KeyDef = KeyDef::one(KeyField::U32(offset_of!(GroupList, group_id)));

impl GroupList {
    /// # Safety
    ///
    /// `this` must point at an exclusively owned, correctly sized
    /// allocation inside the user segment.
    unsafe fn init(this: *mut GroupList, group_id: u32) -> io::Result<()> {
        // SAFETY: exclusive ownership during creation.
        unsafe {
            (*this).group_id = group_id;
            (*this)._pad = 0;
            (*this).state.get().write(GroupState {
                head: END_OF_LIST,
                tail: END_OF_LIST,
                count: 0,
                _pad: 0,
            });
            SharedMutex::init(&raw mut (*this).mutex)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut GroupState {
        // SAFETY: callers hold the group mutex.
        unsafe { &mut *self.state.get() }
    }
}

fn group_index(shm: &Shm) -> Btree<'_> {
    Btree::new(
        &shm.user_header().group_index,
        shm.node_pool(),
        shm.user(),
        GROUP_KEY,
    )
}

fn group_at(shm: &Shm, offset: u64) -> &GroupList {
    // SAFETY: group offsets come from the group index.
    unsafe { shm.user().get::<GroupList>(offset) }
}

fn find_group(shm: &Shm, gid: GroupId) -> Result<u64> {
    group_index(shm)
        .get(&Probe::one(ProbePart::U32(gid)))
        .ok_or(Error::NotFound)
}

/// Create an empty group. Fails if the id is taken.
pub(crate) fn create_group(shm: &Shm, gid: GroupId) -> Result<()> {
    let idx = group_index(shm);
    let _guard = shm.user_header().group_index.mutex.lock();
    if idx.get(&Probe::one(ProbePart::U32(gid))).is_some() {
        return Err(Error::AlreadyExists);
    }
    let off = shm
        .allocator()
        .alloc(size_of::<GroupList>())
        .ok_or(Error::NoMemory)?;
    // SAFETY: freshly allocated, correctly sized, exclusively ours.
    if unsafe { GroupList::init(shm.user().ptr_at(off) as *mut GroupList, gid) }.is_err() {
        shm.allocator().free(off);
        return Err(Error::NoMemory);
    }
    match idx.insert(off) {
        Ok(()) => {
            tracing::debug!(group = gid, "created signal group");
            Ok(())
        }
        Err(e) => {
            shm.allocator().free(off);
            Err(e.into())
        }
    }
}

/// Delete a group: free its member records and unindex it. Signal data is
/// untouched.
pub(crate) fn delete_group(shm: &Shm, gid: GroupId) -> Result<()> {
    let off = {
        let idx = group_index(shm);
        let _guard = shm.user_header().group_index.mutex.lock();
        idx.remove(&Probe::one(ProbePart::U32(gid)))
            .ok_or(Error::NotFound)?
    };

    let group = group_at(shm, off);
    let mut doomed = Vec::new();
    {
        let _guard = group.mutex.lock();
        let state = group.state_mut();
        let mut cursor = state.head;
        while cursor != END_OF_LIST {
            doomed.push(cursor);
            // SAFETY: chain offsets are live member records; lock held.
            cursor = unsafe { shm.user().get::<GroupMember>(cursor).next };
        }
        state.head = END_OF_LIST;
        state.tail = END_OF_LIST;
        state.count = 0;
    }
    for m in doomed {
        shm.allocator().free(m);
    }
    shm.allocator().free(off);
    tracing::debug!(group = gid, "deleted signal group");
    Ok(())
}

/// Append (domain, signal) to the group, creating the signal list if it
/// does not exist yet.
pub(crate) fn add_member(
    shm: &Shm,
    gid: GroupId,
    domain: DomainId,
    signal: SignalId,
) -> Result<()> {
    let goff = find_group(shm, gid)?;
    let list_off = crate::index::find_or_create_list(shm, domain, signal)?;

    let m_off = shm
        .allocator()
        .alloc(size_of::<GroupMember>())
        .ok_or(Error::NoMemory)?;
    // SAFETY: freshly allocated, exclusively ours until linked.
    unsafe {
        let m = shm.user().get_mut::<GroupMember>(m_off);
        m.next = END_OF_LIST;
        m.list = list_off;
    }

    let group = group_at(shm, goff);
    let _guard = group.mutex.lock();
    let state = group.state_mut();
    if state.tail != END_OF_LIST {
        // SAFETY: tail is a live member record; group lock held.
        unsafe {
            shm.user().get_mut::<GroupMember>(state.tail).next = m_off;
        }
    }
    if state.head == END_OF_LIST {
        state.head = m_off;
    }
    state.tail = m_off;
    state.count += 1;
    Ok(())
}

/// Unlink and free the first member referencing (domain, signal).
pub(crate) fn remove_member(
    shm: &Shm,
    gid: GroupId,
    domain: DomainId,
    signal: SignalId,
) -> Result<()> {
    let goff = find_group(shm, gid)?;
    let list_off = crate::index::find_list(shm, domain, signal).ok_or(Error::NotFound)?;

    let group = group_at(shm, goff);
    let removed = {
        let _guard = group.mutex.lock();
        let state = group.state_mut();
        let mut prev = END_OF_LIST;
        let mut cursor = state.head;
        loop {
            if cursor == END_OF_LIST {
                break None;
            }
            // SAFETY: chain offsets are live member records; lock held.
            let (next, list) = unsafe {
                let m = shm.user().get::<GroupMember>(cursor);
                (m.next, m.list)
            };
            if list == list_off {
                if prev == END_OF_LIST {
                    state.head = next;
                } else {
                    // SAFETY: prev is a live member record; lock held.
                    unsafe {
                        shm.user().get_mut::<GroupMember>(prev).next = next;
                    }
                }
                if state.tail == cursor {
                    state.tail = prev;
                }
                state.count -= 1;
                break Some(cursor);
            }
            prev = cursor;
            cursor = next;
        }
    };

    match removed {
        Some(m) => {
            shm.allocator().free(m);
            Ok(())
        }
        None => Err(Error::NotFound),
    }
}

/// Snapshot the membership as signal-list offsets, in insertion order.
pub(crate) fn members(shm: &Shm, gid: GroupId) -> Result<Vec<u64>> {
    let goff = find_group(shm, gid)?;
    let group = group_at(shm, goff);
    let _guard = group.mutex.lock();
    let mut out = Vec::with_capacity(group.state_mut().count as usize);
    let mut cursor = group.state_mut().head;
    while cursor != END_OF_LIST {
        // SAFETY: chain offsets are live member records; lock held.
        let m = unsafe { shm.user().get::<GroupMember>(cursor) };
        out.push(m.list);
        cursor = m.next;
    }
    Ok(out)
}

/// Fetch from every member. Non-blocking calls record per-member status;
/// blocking calls run one worker per member and join them all.
pub(crate) fn collective_fetch(
    shm: &Shm,
    gid: GroupId,
    mode: FetchMode,
    wait: bool,
    deadline: Option<&Deadline>,
) -> Result<Vec<MemberFetch>> {
    let lists = members(shm, gid)?;

    let one = |list_off: u64, result| {
        let list = list_at(shm, list_off);
        MemberFetch {
            domain: list.domain,
            signal: list.signal,
            result,
        }
    };

    if !wait {
        return Ok(lists
            .iter()
            .map(|&l| one(l, fetch(shm, l, mode, false, None)))
            .collect());
    }

    Ok(std::thread::scope(|s| {
        let handles: Vec<_> = lists
            .iter()
            .map(|&l| s.spawn(move || fetch(shm, l, mode, true, deadline)))
            .collect();
        lists
            .iter()
            .zip(handles)
            .map(|(&l, h)| one(l, h.join().expect("group fetch worker panicked")))
            .collect()
    }))
}

/// Flush every member's signal list.
pub(crate) fn flush_group(shm: &Shm, gid: GroupId) -> Result<()> {
    for list_off in members(shm, gid)? {
        flush(shm, list_off)?;
    }
    Ok(())
}

/// Block until any member receives a sample; return which one fired.
///
/// One worker per member performs a claim-gated blocking fetch. Exactly one
/// worker consumes a sample and wins; the rest observe the claim and exit
/// without touching their lists.
pub(crate) fn listen_any(
    shm: &Shm,
    gid: GroupId,
    deadline: Option<&Deadline>,
) -> Result<(DomainId, SignalId)> {
    let lists = members(shm, gid)?;
    if lists.is_empty() {
        return Err(Error::Invalid);
    }

    let claimed = AtomicBool::new(false);
    let claimed = &claimed;

    let winner = std::thread::scope(|s| {
        let handles: Vec<_> = lists
            .iter()
            .map(|&l| s.spawn(move || listen_worker(shm, l, deadline, claimed)))
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().expect("listen worker panicked"))
            .next()
    });

    winner.ok_or(Error::TimedOut)
}

fn listen_worker(
    shm: &Shm,
    list_off: u64,
    deadline: Option<&Deadline>,
    claimed: &AtomicBool,
) -> Option<(DomainId, SignalId)> {
    let list = list_at(shm, list_off);
    let mut guard = list.sem.lock();
    loop {
        let outcome = list
            .sem
            .acquire_cancellable(&mut guard, deadline, || claimed.load(Ordering::Acquire));
        match outcome {
            Acquire::Taken => {}
            Acquire::TimedOut | Acquire::Cancelled => return None,
        }

        let sample = crate::signal::head_of(list, &mut guard);
        if sample == END_OF_LIST {
            // Flush raced our wakeup; the credit died with the data.
            continue;
        }

        if claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another member fired first. Give the credit back so the
            // sample we did not take stays fetchable.
            list.sem.post(&mut guard);
            return None;
        }

        let unlinked = crate::signal::consume_head(shm, list, &mut guard);
        drop(guard);
        if let Some(off) = unlinked {
            shm.allocator().free(off);
        }
        return Some((list.domain, list.signal));
    }
}
