//! Reentrant exclusive lock with fair and non-fair admission.
//!
//! [`ReentrantLock`] interprets the synchronizer's state word as a hold
//! count: zero means unlocked, `n > 0` means `n` nested holds by the owner
//! thread recorded beside it. In non-fair mode an arriving thread may barge
//! past queued waiters when the lock happens to be free; in fair mode it
//! defers to the queue.
//!
//! The lock guards a protocol rather than a value: `lock` and `unlock` are
//! explicit, and [`unlock`](ReentrantLock::unlock) by a thread that does not
//! hold the lock reports [`Error::MonitorState`]. The blocking collections
//! in this crate are built directly on this surface.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::synchronizer::{Condition, SyncCore, SyncOps, Synchronizer};
use crate::thread::{self, Thread, ThreadId};

struct LockCore {
    sync: Synchronizer,
    /// Packed [`ThreadId`] of the owner; zero when unlocked.
    owner: AtomicU64,
    fair: bool,
}

impl LockCore {
    fn owner_raw(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    /// Barging acquisition: used by non-fair mode and by `try_lock`, which
    /// barges even on a fair lock.
    fn nonfair_try_acquire(&self, sync: &Synchronizer, acquires: i32) -> bool {
        let current = thread::current_id().as_u64();
        let c = sync.state();
        if c == 0 {
            if sync.cas_state(0, acquires) {
                self.owner.store(current, Ordering::Relaxed);
                return true;
            }
        } else if self.owner_raw() == current {
            let next = match c.checked_add(acquires) {
                Some(n) => n,
                None => panic!("reentrant lock hold count overflow"),
            };
            sync.set_state(next);
            return true;
        }
        false
    }
}

impl SyncOps for LockCore {
    fn try_acquire(&self, sync: &Synchronizer, acquires: i32) -> bool {
        if !self.fair {
            return self.nonfair_try_acquire(sync, acquires);
        }
        let current = thread::current_id().as_u64();
        let c = sync.state();
        if c == 0 {
            if !sync.has_queued_predecessors() && sync.cas_state(0, acquires) {
                self.owner.store(current, Ordering::Relaxed);
                return true;
            }
        } else if self.owner_raw() == current {
            let next = match c.checked_add(acquires) {
                Some(n) => n,
                None => panic!("reentrant lock hold count overflow"),
            };
            sync.set_state(next);
            return true;
        }
        false
    }

    fn try_release(&self, sync: &Synchronizer, releases: i32) -> Result<bool> {
        if self.owner_raw() != thread::current_id().as_u64() {
            return Err(Error::MonitorState(
                "unlock of a lock the current thread does not hold",
            ));
        }
        let c = sync.state() - releases;
        if c == 0 {
            self.owner.store(0, Ordering::Relaxed);
            sync.set_state(0);
            Ok(true)
        } else {
            sync.set_state(c);
            Ok(false)
        }
    }

    fn is_held_exclusively(&self, _sync: &Synchronizer) -> bool {
        self.owner_raw() == thread::current_id().as_u64()
    }
}

impl SyncCore for LockCore {
    fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }
}

/// A reentrant mutual-exclusion lock.
///
/// # Panics
///
/// `lock` and its variants panic if one thread nests more than `i32::MAX`
/// holds, which no real program reaches.
pub struct ReentrantLock {
    core: Arc<LockCore>,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantLock {
    /// Create a non-fair lock.
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    /// Create a lock with the given admission policy.
    pub fn with_fairness(fair: bool) -> Self {
        ReentrantLock {
            core: Arc::new(LockCore {
                sync: Synchronizer::new(),
                owner: AtomicU64::new(0),
                fair,
            }),
        }
    }

    /// Acquire the lock, parking until available. Reentrant: the owner may
    /// call this again and must balance every call with `unlock`.
    pub fn lock(&self) {
        self.core.sync.acquire(&*self.core, 1);
    }

    /// Acquire the lock unless the current thread is interrupted.
    pub fn lock_interruptibly(&self) -> Result<()> {
        self.core.sync.acquire_interruptibly(&*self.core, 1)
    }

    /// Acquire the lock only if it is immediately available. Barges even on
    /// a fair lock.
    pub fn try_lock(&self) -> bool {
        self.core.nonfair_try_acquire(&self.core.sync, 1)
    }

    /// Acquire the lock within `timeout`. `Ok(false)` when it elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.core.sync.try_acquire_for(&*self.core, 1, timeout)
    }

    /// Release one hold. [`Error::MonitorState`] if the current thread does
    /// not own the lock.
    pub fn unlock(&self) -> Result<()> {
        self.core.sync.release(&*self.core, 1).map(drop)
    }

    /// Create a condition bound to this lock.
    pub fn new_condition(&self) -> Condition {
        Condition::new(self.core.clone() as Arc<dyn SyncCore>)
    }

    /// Whether this lock admits waiters fairly.
    pub fn is_fair(&self) -> bool {
        self.core.fair
    }

    /// Whether any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.core.sync.state() != 0
    }

    /// Whether the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.core.is_held_exclusively(&self.core.sync)
    }

    /// Number of holds by the calling thread; zero when not the owner.
    pub fn hold_count(&self) -> i32 {
        if self.is_held_by_current_thread() {
            self.core.sync.state()
        } else {
            0
        }
    }

    /// Identity of the owning thread, if any. Weakly consistent.
    pub fn owner_id(&self) -> Option<ThreadId> {
        ThreadId::from_u64(self.core.owner_raw())
    }

    /// Whether threads are queued waiting for this lock.
    pub fn has_queued_threads(&self) -> bool {
        self.core.sync.has_queued_threads()
    }

    /// Whether the given thread is queued waiting for this lock.
    pub fn has_queued_thread(&self, thread: &Thread) -> bool {
        self.core.sync.is_queued(thread)
    }

    /// An estimate of the number of queued waiters.
    pub fn queue_length(&self) -> usize {
        self.core.sync.queue_length()
    }

    /// The queued waiters. Best-effort snapshot.
    pub fn queued_threads(&self) -> Vec<Thread> {
        self.core.sync.queued_threads()
    }

    /// Whether `condition` has waiters. [`Error::InvalidArgument`] if the
    /// condition belongs to another lock; requires the lock to be held.
    pub fn has_waiters(&self, condition: &Condition) -> Result<bool> {
        self.check_condition(condition)?;
        condition.has_waiters()
    }

    /// Estimated number of waiters on `condition`. Same requirements as
    /// [`has_waiters`](Self::has_waiters).
    pub fn wait_queue_length(&self, condition: &Condition) -> Result<usize> {
        self.check_condition(condition)?;
        condition.wait_queue_length()
    }

    fn check_condition(&self, condition: &Condition) -> Result<()> {
        if condition.belongs_to(&self.core.sync) {
            Ok(())
        } else {
            Err(Error::InvalidArgument("condition is not bound to this lock"))
        }
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("fair", &self.core.fair)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_lock_unlock() {
        let lock = ReentrantLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_reentrancy() {
        let lock = ReentrantLock::new();
        lock.lock();
        lock.lock();
        lock.lock();
        assert_eq!(lock.hold_count(), 3);
        lock.unlock().unwrap();
        assert_eq!(lock.hold_count(), 2);
        assert!(lock.is_locked());
        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
        assert_eq!(lock.hold_count(), 0);
    }

    #[test]
    fn test_unlock_by_non_owner() {
        let lock = Arc::new(ReentrantLock::new());
        lock.lock();
        let lock2 = lock.clone();
        let err = std::thread::spawn(move || lock2.unlock())
            .join()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::MonitorState(_)));
        lock.unlock().unwrap();
    }

    #[test]
    fn test_unlock_unheld() {
        let lock = ReentrantLock::new();
        assert!(lock.unlock().is_err());
    }

    #[test]
    fn test_try_lock() {
        let lock = Arc::new(ReentrantLock::new());
        assert!(lock.try_lock());

        let lock2 = lock.clone();
        let contended = std::thread::spawn(move || lock2.try_lock())
            .join()
            .unwrap();
        assert!(!contended);

        // Reentrant try_lock succeeds for the owner.
        assert!(lock.try_lock());
        lock.unlock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn test_try_lock_for_times_out() {
        let lock = Arc::new(ReentrantLock::new());
        lock.lock();
        let lock2 = lock.clone();
        let acquired = std::thread::spawn(move || {
            lock2.try_lock_for(Duration::from_millis(30)).unwrap()
        })
        .join()
        .unwrap();
        assert!(!acquired);
        lock.unlock().unwrap();
    }

    #[test]
    fn test_lock_interruptibly_interrupted() {
        let lock = Arc::new(ReentrantLock::new());
        lock.lock();

        let lock2 = lock.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            tx.send(Thread::current()).unwrap();
            lock2.lock_interruptibly()
        });
        let waiter = rx.recv().unwrap();
        while !lock.has_queued_thread(&waiter) {
            std::thread::yield_now();
        }
        waiter.interrupt();
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
        lock.unlock().unwrap();
    }

    #[test]
    fn test_owner_id() {
        let lock = ReentrantLock::new();
        assert!(lock.owner_id().is_none());
        lock.lock();
        assert_eq!(lock.owner_id(), Some(thread::current_id()));
        lock.unlock().unwrap();
        assert!(lock.owner_id().is_none());
    }

    #[test]
    fn test_fair_handoff_order() {
        let lock = Arc::new(ReentrantLock::with_fairness(true));
        assert!(lock.is_fair());
        lock.lock();

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for name in ["b", "c"] {
            let thread_lock = lock.clone();
            let tx = tx.clone();
            let expected = handles.len() + 1;
            handles.push(std::thread::spawn(move || {
                // Wait until all earlier waiters are queued so arrival
                // order is deterministic.
                while thread_lock.queue_length() < expected - 1 {
                    std::thread::yield_now();
                }
                thread_lock.lock();
                tx.send(name).unwrap();
                thread_lock.unlock().unwrap();
            }));
            while lock.queue_length() < expected {
                std::thread::yield_now();
            }
        }

        lock.unlock().unwrap();
        assert_eq!(rx.recv().unwrap(), "b");
        assert_eq!(rx.recv().unwrap(), "c");
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_condition_signal_wakes_waiter() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());

        let lock2 = lock.clone();
        let cond2 = cond.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            lock2.lock();
            cond2.await_().unwrap();
            // The lock is reacquired before await returns.
            assert!(lock2.is_held_by_current_thread());
            tx.send(()).unwrap();
            lock2.unlock().unwrap();
        });

        // Wait until the waiter has released the lock into the condition.
        loop {
            lock.lock();
            let waiting = lock.has_waiters(&cond).unwrap();
            if waiting {
                break;
            }
            lock.unlock().unwrap();
            std::thread::yield_now();
        }
        assert!(rx.try_recv().is_err());
        cond.signal().unwrap();
        lock.unlock().unwrap();

        rx.recv().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_condition_await_restores_hold_count() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());

        let lock2 = lock.clone();
        let cond2 = cond.clone();
        let handle = std::thread::spawn(move || {
            lock2.lock();
            lock2.lock();
            assert_eq!(lock2.hold_count(), 2);
            cond2.await_().unwrap();
            assert_eq!(lock2.hold_count(), 2);
            lock2.unlock().unwrap();
            lock2.unlock().unwrap();
        });

        loop {
            lock.lock();
            if lock.has_waiters(&cond).unwrap() {
                break;
            }
            lock.unlock().unwrap();
            std::thread::yield_now();
        }
        cond.signal_all().unwrap();
        lock.unlock().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_condition_await_for_times_out() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock();
        let start = Instant::now();
        let remaining = cond.await_for(Duration::from_millis(30)).unwrap();
        assert!(remaining.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_condition_await_until_times_out() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(cond.await_until(deadline), Err(Error::Timeout));
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_condition_without_lock_is_error() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        assert!(matches!(cond.await_(), Err(Error::MonitorState(_))));
        assert!(matches!(cond.signal(), Err(Error::MonitorState(_))));
    }

    #[test]
    fn test_foreign_condition_rejected() {
        let lock = ReentrantLock::new();
        let other = ReentrantLock::new();
        let cond = other.new_condition();
        lock.lock();
        assert_eq!(
            lock.has_waiters(&cond),
            Err(Error::InvalidArgument("condition is not bound to this lock"))
        );
        lock.unlock().unwrap();
    }

    #[test]
    fn test_condition_signal_fifo_order() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());
        let (tx, rx) = mpsc::channel();

        let mut handles = Vec::new();
        for i in 0..3 {
            let worker_lock = lock.clone();
            let worker_cond = cond.clone();
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                worker_lock.lock();
                worker_cond.await_().unwrap();
                tx.send(i).unwrap();
                worker_lock.unlock().unwrap();
            }));
            // Serialise arrival so the wait queue order is i = 0, 1, 2.
            loop {
                lock.lock();
                let queued = cond.wait_queue_length().unwrap();
                lock.unlock().unwrap();
                if queued == i + 1 {
                    break;
                }
                std::thread::yield_now();
            }
        }

        for expected in 0..3 {
            lock.lock();
            cond.signal().unwrap();
            lock.unlock().unwrap();
            assert_eq!(rx.recv().unwrap(), expected);
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_interrupt_during_await() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());

        let lock2 = lock.clone();
        let cond2 = cond.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            tx.send(Thread::current()).unwrap();
            lock2.lock();
            let result = cond2.await_();
            // Whatever happened, the lock was reacquired.
            assert!(lock2.is_held_by_current_thread());
            lock2.unlock().unwrap();
            result
        });
        let waiter = rx.recv().unwrap();
        loop {
            lock.lock();
            let waiting = lock.has_waiters(&cond).unwrap();
            lock.unlock().unwrap();
            if waiting {
                break;
            }
            std::thread::yield_now();
        }
        waiter.interrupt();
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
    }
}
