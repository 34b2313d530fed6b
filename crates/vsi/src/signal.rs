//! Signal lists: the per-(domain, signal) sample FIFOs.
//!
//! A signal list is a shared-memory record holding a chain of sample
//! records plus its wait state. Samples are spliced in at the tail and
//! consumed from the head; `fetch_newest` peeks at the tail without ever
//! unlinking. When several consumers are parked on the same list, each one
//! is handed a copy of the sample at the head and removal is deferred until
//! the last of them has read it.
//!
//! Lock discipline: the allocator (which takes the segment mutex) is never
//! entered while a signal list's mutex is held. Publishing allocates the
//! sample first; consuming and flushing collect offsets under the lock and
//! free them after releasing it.

use std::cell::UnsafeCell;
use std::io;

use bytes::Bytes;
use vsi_shm::{Acquire, Deadline, END_OF_LIST, SharedMutexGuard, Shm, SignalSem};

use crate::error::{Error, Result};

/// Per-(domain, signal) record living in the user segment.
///
/// `domain` and `signal` are immutable after creation; `private_id` and
/// `name` are written by `define` under the index locks; the chain state is
/// guarded by the embedded semaphore's mutex.
#[repr(C)]
pub struct SignalList {
    pub domain: u32,
    pub signal: u32,
    pub private_id: u32,
    _pad: u32,
    /// Offset of the NUL-terminated signal name, 0 when unnamed.
    pub name: u64,
    state: UnsafeCell<ListState>,
    pub sem: SignalSem,
}

#[repr(C)]
struct ListState {
    /// Oldest sample, or `END_OF_LIST`.
    head: u64,
    /// Newest sample, or `END_OF_LIST`.
    tail: u64,
    count: u32,
    _pad: u32,
    total_bytes: u64,
}

impl SignalList {
    /// Initialize a freshly allocated record in place.
    ///
    /// # Safety
    ///
    /// `this` must point at an exclusively owned, correctly sized
    /// allocation inside the user segment.
    pub unsafe fn init(this: *mut SignalList, domain: u32, signal: u32) -> io::Result<()> {
        // SAFETY: exclusive ownership during creation.
        unsafe {
            (*this).domain = domain;
            (*this).signal = signal;
            (*this).private_id = 0;
            (*this)._pad = 0;
            (*this).name = 0;
            (*this).state.get().write(ListState {
                head: END_OF_LIST,
                tail: END_OF_LIST,
                count: 0,
                _pad: 0,
                total_bytes: 0,
            });
            SignalSem::init(&raw mut (*this).sem)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut ListState {
        // SAFETY: callers hold the semaphore mutex.
        unsafe { &mut *self.state.get() }
    }

    /// Number of samples currently enqueued. Takes the list lock.
    pub fn sample_count(&self) -> u32 {
        let _guard = self.sem.lock();
        self.state_mut().count
    }

    /// Sum of enqueued payload bytes. Takes the list lock.
    pub fn total_bytes(&self) -> u64 {
        let _guard = self.sem.lock();
        self.state_mut().total_bytes
    }
}

/// Header of one sample record; the payload follows immediately.
#[repr(C)]
pub struct SampleHeader {
    next: u64,
    len: u32,
    _pad: u32,
}

const SAMPLE_HEADER_SIZE: u64 = size_of::<SampleHeader>() as u64;

/// Which end of the chain a fetch reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Read and (for the last waiter) remove the head.
    Oldest,
    /// Read the tail, never remove.
    Newest,
}

/// Shared reference to the list record at `offset`.
pub(crate) fn list_at(shm: &Shm, offset: u64) -> &SignalList {
    // SAFETY: list offsets come from the indices, which only hold records
    // created by `SignalList::init`.
    unsafe { shm.user().get::<SignalList>(offset) }
}

/// Publish one sample at the tail of the list.
pub(crate) fn publish(shm: &Shm, list_off: u64, data: &[u8]) -> Result<()> {
    // Allocate and fill the record before touching the list lock.
    let sample = shm
        .allocator()
        .alloc((SAMPLE_HEADER_SIZE as usize) + data.len())
        .ok_or(Error::NoMemory)?;
    // SAFETY: freshly allocated chunk, exclusively ours until spliced in.
    unsafe {
        let h = shm.user().get_mut::<SampleHeader>(sample);
        h.next = END_OF_LIST;
        h.len = data.len() as u32;
        h._pad = 0;
        shm.user()
            .bytes_mut(sample + SAMPLE_HEADER_SIZE, data.len())
            .copy_from_slice(data);
    }

    let list = list_at(shm, list_off);
    let mut guard = list.sem.lock();
    let state = list.state_mut();
    if state.tail != END_OF_LIST {
        // SAFETY: tail is a live sample record; we hold the list lock.
        unsafe {
            shm.user().get_mut::<SampleHeader>(state.tail).next = sample;
        }
    }
    if state.head == END_OF_LIST {
        state.head = sample;
    }
    state.tail = sample;
    state.count += 1;
    state.total_bytes += data.len() as u64;
    list.sem.post(&mut guard);
    drop(guard);

    tracing::trace!(
        domain = list.domain,
        signal = list.signal,
        len = data.len(),
        "published sample"
    );
    Ok(())
}

/// Fetch one sample.
///
/// Non-blocking calls return [`Error::NoData`] on an empty list. Blocking
/// calls run the waiter protocol: park until a message credit arrives, and
/// in oldest mode consume it and unlink the head if no other waiter is
/// still parked. Peeks, blocking or not, leave the credit in place so the
/// sample stays paired with it for a later consuming fetch. `deadline`
/// bounds blocking calls; `None` waits forever.
pub(crate) fn fetch(
    shm: &Shm,
    list_off: u64,
    mode: FetchMode,
    wait: bool,
    deadline: Option<&Deadline>,
) -> Result<Bytes> {
    let list = list_at(shm, list_off);
    let mut guard = list.sem.lock();

    if wait {
        loop {
            match mode {
                // Consuming fetch: take the credit that pays for the
                // removal below.
                FetchMode::Oldest => match list.sem.acquire(&mut guard, deadline) {
                    Acquire::Taken => {}
                    Acquire::TimedOut => return Err(Error::TimedOut),
                    Acquire::Cancelled => unreachable!("no cancel predicate"),
                },
                // Peek: wake with the waiter protocol but leave the credit
                // for whoever eventually removes the sample.
                FetchMode::Newest => {
                    if !list.sem.wait_message(&mut guard, deadline) {
                        return Err(Error::TimedOut);
                    }
                }
            }
            if list.state_mut().head != END_OF_LIST {
                break;
            }
            // Woken but the chain is empty: a flush raced us. Park again.
        }
    } else {
        if list.state_mut().head == END_OF_LIST {
            return Err(Error::NoData);
        }
        if mode == FetchMode::Oldest {
            // Keep the credit count aligned with the sample count; the
            // removal below is what this credit paid for.
            list.sem.try_acquire(&mut guard);
        }
    }

    let state = list.state_mut();
    let sample = match mode {
        FetchMode::Oldest => state.head,
        FetchMode::Newest => state.tail,
    };
    // SAFETY: chain offsets are live sample records; list lock held.
    let (next, len) = unsafe {
        let h = shm.user().get::<SampleHeader>(sample);
        (h.next, h.len as usize)
    };
    // SAFETY: the payload sits right after the header.
    let data =
        Bytes::copy_from_slice(unsafe { shm.user().bytes(sample + SAMPLE_HEADER_SIZE, len) });

    let mut unlinked = None;
    if mode == FetchMode::Oldest && list.sem.waiters(&mut guard) == 0 {
        let state = list.state_mut();
        state.head = next;
        if state.head == END_OF_LIST {
            state.tail = END_OF_LIST;
        }
        state.count -= 1;
        state.total_bytes -= len as u64;
        unlinked = Some(sample);
    }
    drop(guard);

    // Free outside the list lock; the allocator takes the segment mutex.
    if let Some(off) = unlinked {
        shm.allocator().free(off);
    }
    Ok(data)
}

/// Chain head, for callers already holding the list lock.
pub(crate) fn head_of(list: &SignalList, _guard: &mut SharedMutexGuard<'_>) -> u64 {
    list.state_mut().head
}

/// The tail end of a blocking oldest-fetch: unlink the head sample when no
/// other waiter remains. The caller frees the returned offset after
/// dropping the lock.
pub(crate) fn consume_head(
    shm: &Shm,
    list: &SignalList,
    guard: &mut SharedMutexGuard<'_>,
) -> Option<u64> {
    if list.sem.waiters(guard) != 0 {
        return None;
    }
    let state = list.state_mut();
    let sample = state.head;
    debug_assert_ne!(sample, END_OF_LIST);
    // SAFETY: chain offsets are live sample records; list lock held.
    let (next, len) = unsafe {
        let h = shm.user().get::<SampleHeader>(sample);
        (h.next, h.len as usize)
    };
    state.head = next;
    if state.head == END_OF_LIST {
        state.tail = END_OF_LIST;
    }
    state.count -= 1;
    state.total_bytes -= len as u64;
    Some(sample)
}

/// Drop every queued sample and wake all waiters so they re-check.
pub(crate) fn flush(shm: &Shm, list_off: u64) -> Result<()> {
    let list = list_at(shm, list_off);
    let mut doomed = Vec::new();
    {
        let mut guard = list.sem.lock();
        let state = list.state_mut();
        let mut cursor = state.head;
        while cursor != END_OF_LIST {
            doomed.push(cursor);
            // SAFETY: chain offsets are live sample records; lock held.
            cursor = unsafe { shm.user().get::<SampleHeader>(cursor).next };
        }
        state.head = END_OF_LIST;
        state.tail = END_OF_LIST;
        state.count = 0;
        state.total_bytes = 0;
        list.sem.reset(&mut guard);
        list.sem.wake_all(&mut guard);
    }
    let flushed = doomed.len();
    for off in doomed {
        shm.allocator().free(off);
    }
    tracing::debug!(
        domain = list.domain,
        signal = list.signal,
        flushed,
        "flushed signal list"
    );
    Ok(())
}
