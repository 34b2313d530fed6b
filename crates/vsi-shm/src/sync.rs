//! Process-shared synchronization primitives.
//!
//! Everything in this module lives *inside* a mapped segment and is shared by
//! every process attached to it. The primitives wrap pthread objects whose
//! attributes are set to `PTHREAD_PROCESS_SHARED`; mutexes are additionally
//! recursive so that index code may re-enter a lock it already holds.
//!
//! [`SignalSem`] is the "message count with waiters" primitive used by signal
//! lists. It is not a counting semaphore: `post` increments a message count
//! and signals a condition variable, `acquire` parks the caller until the
//! count is positive while tracking how many waiters are present. The waiter
//! count is what lets a consumer decide whether it is the last reader of a
//! broadcast sample.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

/// An absolute `CLOCK_MONOTONIC` timestamp used for timed waits.
pub type Deadline = libc::timespec;

/// Compute the absolute monotonic deadline `timeout` from now.
pub fn deadline_after(timeout: Duration) -> Deadline {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }
    let total_nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec
            + timeout.as_secs() as libc::time_t
            + (total_nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: total_nsec % 1_000_000_000,
    }
}

/// Returns true if `deadline` has already passed.
pub fn deadline_expired(deadline: &Deadline) -> bool {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }
    (now.tv_sec, now.tv_nsec) >= (deadline.tv_sec, deadline.tv_nsec)
}

// =============================================================================
// SharedMutex
// =============================================================================

/// A process-shared, recursive mutex embedded in a mapped segment.
///
/// The mutex must be initialized in place exactly once (by the process that
/// creates the segment) before any other process locks it.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the pthread mutex is explicitly process-shared; any thread (in any
// attached process) may lock it.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize the mutex in place with process-shared, recursive
    /// attributes.
    ///
    /// # Safety
    ///
    /// `this` must point to writable, properly aligned memory that no other
    /// process or thread is concurrently using, and must be initialized only
    /// once per segment lifetime.
    pub unsafe fn init(this: *mut SharedMutex) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer; init/set/destroy are paired.
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutexattr_settype(
                attr.as_mut_ptr(),
                libc::PTHREAD_MUTEX_RECURSIVE,
            ))?;
            let rc = libc::pthread_mutex_init((*this).inner.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            check(rc)?;
        }
        Ok(())
    }

    /// Lock the mutex, returning a guard that unlocks on drop.
    pub fn lock(&self) -> SharedMutexGuard<'_> {
        // SAFETY: the mutex was initialized before the segment was published.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc != 0 {
            panic!("pthread_mutex_lock failed: {}", io::Error::from_raw_os_error(rc));
        }
        SharedMutexGuard {
            mutex: self,
            _not_send: std::marker::PhantomData,
        }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

/// RAII guard for [`SharedMutex`]. Unlocks on drop, including during panics.
///
/// Not `Send`: pthread requires the unlocking thread to be the one that
/// locked.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<'a> Drop for SharedMutexGuard<'a> {
    fn drop(&mut self) {
        // SAFETY: we hold the lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed");
    }
}

// =============================================================================
// SharedCondvar
// =============================================================================

/// A process-shared condition variable embedded in a mapped segment.
///
/// Timed waits measure against `CLOCK_MONOTONIC`, so wall-clock adjustments
/// do not disturb timeouts.
#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: explicitly process-shared, see SharedMutex.
unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initialize the condition variable in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedCondvar) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer; init/set/destroy are paired.
        unsafe {
            check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            check(libc::pthread_condattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_condattr_setclock(
                attr.as_mut_ptr(),
                libc::CLOCK_MONOTONIC,
            ))?;
            let rc = libc::pthread_cond_init((*this).inner.get(), attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            check(rc)?;
        }
        Ok(())
    }

    /// Block on the condition variable, releasing the guarded mutex while
    /// suspended. The mutex is re-acquired before this returns.
    pub fn wait(&self, guard: &mut SharedMutexGuard<'_>) {
        // SAFETY: the guard proves the mutex is held by this thread.
        let rc = unsafe { libc::pthread_cond_wait(self.inner.get(), guard.mutex.raw()) };
        if rc != 0 {
            panic!("pthread_cond_wait failed: {}", io::Error::from_raw_os_error(rc));
        }
    }

    /// As [`wait`](Self::wait) but gives up at `deadline`. Returns true if
    /// the wait timed out.
    pub fn wait_until(&self, guard: &mut SharedMutexGuard<'_>, deadline: &Deadline) -> bool {
        // SAFETY: the guard proves the mutex is held by this thread.
        let rc =
            unsafe { libc::pthread_cond_timedwait(self.inner.get(), guard.mutex.raw(), deadline) };
        match rc {
            0 => false,
            libc::ETIMEDOUT => true,
            _ => panic!(
                "pthread_cond_timedwait failed: {}",
                io::Error::from_raw_os_error(rc)
            ),
        }
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        // SAFETY: initialized before publication.
        let rc = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        debug_assert_eq!(rc, 0);
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        // SAFETY: initialized before publication.
        let rc = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        debug_assert_eq!(rc, 0);
    }
}

// =============================================================================
// SignalSem
// =============================================================================

#[repr(C)]
struct SemCounts {
    message_count: u32,
    waiter_count: u32,
}

/// Outcome of [`SignalSem::acquire`] and
/// [`SignalSem::acquire_cancellable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A message credit was taken.
    Taken,
    /// The deadline passed before a credit became available.
    TimedOut,
    /// The cancel predicate fired before a credit became available.
    Cancelled,
}

/// The per-signal-list wait primitive: a message count and a waiter count
/// guarded by one process-shared mutex and condition variable.
///
/// The mutex doubles as the signal list's lock; list mutations happen under
/// the same guard that the count operations take.
#[repr(C)]
pub struct SignalSem {
    mutex: SharedMutex,
    cond: SharedCondvar,
    counts: UnsafeCell<SemCounts>,
}

// SAFETY: counts are only touched while the embedded mutex is held.
unsafe impl Send for SignalSem {}
unsafe impl Sync for SignalSem {}

impl SignalSem {
    /// Initialize the semaphore in place with zero counts.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SignalSem) -> io::Result<()> {
        // SAFETY: forwarded contract.
        unsafe {
            SharedMutex::init(&raw mut (*this).mutex)?;
            SharedCondvar::init(&raw mut (*this).cond)?;
            (*this).counts.get().write(SemCounts {
                message_count: 0,
                waiter_count: 0,
            });
        }
        Ok(())
    }

    /// Lock the owning list. All other methods require the returned guard.
    pub fn lock(&self) -> SharedMutexGuard<'_> {
        self.mutex.lock()
    }

    fn counts_mut(&self, _guard: &mut SharedMutexGuard<'_>) -> &mut SemCounts {
        // SAFETY: the guard serializes access to the counts.
        unsafe { &mut *self.counts.get() }
    }

    /// Add one message credit and wake one waiter.
    pub fn post(&self, guard: &mut SharedMutexGuard<'_>) {
        self.counts_mut(guard).message_count += 1;
        self.cond.notify_one();
    }

    /// Wake every waiter without changing the counts. Used by flush so that
    /// parked consumers re-check their predicate.
    pub fn wake_all(&self, _guard: &mut SharedMutexGuard<'_>) {
        self.cond.notify_all();
    }

    /// Block until a message credit is available, then consume it.
    ///
    /// Increments the waiter count for the duration of the wait so that the
    /// caller can observe, via [`waiters`](Self::waiters), whether other
    /// consumers are still parked on the same list.
    pub fn acquire(
        &self,
        guard: &mut SharedMutexGuard<'_>,
        deadline: Option<&Deadline>,
    ) -> Acquire {
        self.counts_mut(guard).waiter_count += 1;
        loop {
            if self.counts_mut(guard).message_count > 0 {
                break;
            }
            match deadline {
                None => self.cond.wait(guard),
                Some(d) => {
                    if self.cond.wait_until(guard, d) {
                        self.counts_mut(guard).waiter_count -= 1;
                        return Acquire::TimedOut;
                    }
                }
            }
        }
        let counts = self.counts_mut(guard);
        counts.message_count -= 1;
        counts.waiter_count -= 1;
        Acquire::Taken
    }

    /// Park until a message credit exists, without consuming it. Returns
    /// false if the deadline passed first.
    ///
    /// Used by blocking peeks: they must wake with the waiter protocol but
    /// remove nothing, so the credit stays paired with its sample for a
    /// later consuming fetch.
    pub fn wait_message(
        &self,
        guard: &mut SharedMutexGuard<'_>,
        deadline: Option<&Deadline>,
    ) -> bool {
        self.counts_mut(guard).waiter_count += 1;
        loop {
            if self.counts_mut(guard).message_count > 0 {
                break;
            }
            match deadline {
                None => self.cond.wait(guard),
                Some(d) => {
                    if self.cond.wait_until(guard, d) {
                        self.counts_mut(guard).waiter_count -= 1;
                        return false;
                    }
                }
            }
        }
        self.counts_mut(guard).waiter_count -= 1;
        // A notify_one may have been aimed at a consuming waiter; pass it
        // on since this caller takes nothing.
        self.cond.notify_one();
        true
    }

    /// As [`acquire`](Self::acquire), but additionally gives up when
    /// `cancelled` reports true. The predicate is re-checked on every
    /// wakeup; a canceller must broadcast the condition variable (via
    /// [`wake_all`](Self::wake_all)) after flipping its flag.
    ///
    /// Waits are sliced so that a missed broadcast cannot park the caller
    /// forever between flag checks.
    pub fn acquire_cancellable(
        &self,
        guard: &mut SharedMutexGuard<'_>,
        deadline: Option<&Deadline>,
        mut cancelled: impl FnMut() -> bool,
    ) -> Acquire {
        const SLICE: Duration = Duration::from_millis(50);

        self.counts_mut(guard).waiter_count += 1;
        loop {
            if cancelled() {
                self.counts_mut(guard).waiter_count -= 1;
                return Acquire::Cancelled;
            }
            if self.counts_mut(guard).message_count > 0 {
                break;
            }
            if let Some(d) = deadline
                && deadline_expired(d)
            {
                self.counts_mut(guard).waiter_count -= 1;
                return Acquire::TimedOut;
            }
            let slice_end = deadline_after(SLICE);
            let wake_at = match deadline {
                Some(d) if (d.tv_sec, d.tv_nsec) < (slice_end.tv_sec, slice_end.tv_nsec) => d,
                _ => &slice_end,
            };
            self.cond.wait_until(guard, wake_at);
        }
        let counts = self.counts_mut(guard);
        counts.message_count -= 1;
        counts.waiter_count -= 1;
        Acquire::Taken
    }

    /// Consume a message credit if one is available, without blocking.
    pub fn try_acquire(&self, guard: &mut SharedMutexGuard<'_>) -> bool {
        let counts = self.counts_mut(guard);
        if counts.message_count > 0 {
            counts.message_count -= 1;
            true
        } else {
            false
        }
    }

    /// Number of consumers currently parked in [`acquire`](Self::acquire).
    pub fn waiters(&self, guard: &mut SharedMutexGuard<'_>) -> u32 {
        self.counts_mut(guard).waiter_count
    }

    /// Current message credit count.
    pub fn messages(&self, guard: &mut SharedMutexGuard<'_>) -> u32 {
        self.counts_mut(guard).message_count
    }

    /// Drop all message credits. Used by flush.
    pub fn reset(&self, guard: &mut SharedMutexGuard<'_>) {
        self.counts_mut(guard).message_count = 0;
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    // Tests allocate primitives on the heap; in production they live inside
    // a mapped segment. The init contract is identical.
    fn boxed_sem() -> Arc<SemBox> {
        let mut b = Box::new(MaybeUninit::<SignalSem>::uninit());
        unsafe {
            SignalSem::init(b.as_mut_ptr()).unwrap();
        }
        Arc::new(SemBox(b))
    }

    struct SemBox(Box<MaybeUninit<SignalSem>>);
    impl SemBox {
        fn sem(&self) -> &SignalSem {
            unsafe { self.0.assume_init_ref() }
        }
    }

    #[test]
    fn post_then_acquire() {
        let b = boxed_sem();
        let sem = b.sem();
        let mut guard = sem.lock();
        sem.post(&mut guard);
        assert_eq!(sem.messages(&mut guard), 1);
        assert_eq!(sem.acquire(&mut guard, None), Acquire::Taken);
        assert_eq!(sem.messages(&mut guard), 0);
        assert_eq!(sem.waiters(&mut guard), 0);
    }

    #[test]
    fn try_acquire_empty() {
        let b = boxed_sem();
        let sem = b.sem();
        let mut guard = sem.lock();
        assert!(!sem.try_acquire(&mut guard));
        sem.post(&mut guard);
        assert!(sem.try_acquire(&mut guard));
        assert!(!sem.try_acquire(&mut guard));
    }

    #[test]
    fn wait_message_leaves_credit() {
        let b = boxed_sem();
        let sem = b.sem();
        let mut guard = sem.lock();
        sem.post(&mut guard);

        assert!(sem.wait_message(&mut guard, None));
        assert_eq!(sem.messages(&mut guard), 1);
        assert_eq!(sem.waiters(&mut guard), 0);

        // The credit is still there for a consuming acquire.
        assert_eq!(sem.acquire(&mut guard, None), Acquire::Taken);
        assert_eq!(sem.messages(&mut guard), 0);

        let deadline = deadline_after(Duration::from_millis(50));
        assert!(!sem.wait_message(&mut guard, Some(&deadline)));
        assert_eq!(sem.waiters(&mut guard), 0);
    }

    #[test]
    fn acquire_times_out() {
        let b = boxed_sem();
        let sem = b.sem();
        let start = Instant::now();
        let deadline = deadline_after(Duration::from_millis(50));
        let mut guard = sem.lock();
        assert_eq!(sem.acquire(&mut guard, Some(&deadline)), Acquire::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(sem.waiters(&mut guard), 0);
    }

    #[test]
    fn cross_thread_handoff() {
        let b = boxed_sem();
        let woken = Arc::new(AtomicU32::new(0));

        let consumer = {
            let b = Arc::clone(&b);
            let woken = Arc::clone(&woken);
            std::thread::spawn(move || {
                let sem = b.sem();
                let mut guard = sem.lock();
                assert_eq!(sem.acquire(&mut guard, None), Acquire::Taken);
                woken.store(1, Ordering::Release);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(woken.load(Ordering::Acquire), 0);

        {
            let sem = b.sem();
            let mut guard = sem.lock();
            sem.post(&mut guard);
        }

        consumer.join().unwrap();
        assert_eq!(woken.load(Ordering::Acquire), 1);
    }
}
