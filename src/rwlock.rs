//! Reentrant read/write lock.
//!
//! The synchronizer's state word is split in two: the upper 16 bits count
//! outstanding read holds across all threads, the lower 16 bits count the
//! writer's reentrant holds. Per-thread read reentrancy is tracked in
//! thread-local storage keyed by a per-lock id, so a thread can take the
//! read lock recursively and a release by a thread holding nothing is
//! detected and reported.
//!
//! A thread holding the write lock may take the read lock and then release
//! the write lock, retaining its read hold (downgrade). The reverse —
//! acquiring the write lock while holding only read locks — deadlocks and
//! must not be attempted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::synchronizer::{Condition, SyncCore, SyncOps, Synchronizer};
use crate::thread::{self, ThreadId};

const SHARED_SHIFT: u32 = 16;
const SHARED_UNIT: i32 = 1 << SHARED_SHIFT;
const MAX_COUNT: i32 = (1 << SHARED_SHIFT) - 1;
const EXCLUSIVE_MASK: i32 = (1 << SHARED_SHIFT) - 1;

/// Outstanding read holds packed into `state`.
fn shared_count(c: i32) -> i32 {
    ((c as u32) >> SHARED_SHIFT) as i32
}

/// The writer's reentrant holds packed into `state`.
fn exclusive_count(c: i32) -> i32 {
    c & EXCLUSIVE_MASK
}

thread_local! {
    /// Read-hold counts of the calling thread, keyed by lock id.
    static READ_HOLDS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

fn read_holds_get(lock_id: u64) -> usize {
    READ_HOLDS.with(|h| h.borrow().get(&lock_id).copied().unwrap_or(0))
}

fn read_holds_inc(lock_id: u64) {
    READ_HOLDS.with(|h| *h.borrow_mut().entry(lock_id).or_insert(0) += 1);
}

fn read_holds_dec(lock_id: u64) -> Result<()> {
    READ_HOLDS.with(|h| {
        let mut holds = h.borrow_mut();
        match holds.get_mut(&lock_id) {
            Some(n) if *n > 1 => {
                *n -= 1;
                Ok(())
            }
            Some(_) => {
                holds.remove(&lock_id);
                Ok(())
            }
            None => Err(Error::MonitorState(
                "read unlock without a matching read lock on this thread",
            )),
        }
    })
}

struct RwCore {
    sync: Synchronizer,
    /// Packed [`ThreadId`] of the writer; zero when no writer.
    owner: AtomicU64,
    fair: bool,
    /// Key for the thread-local read-hold table.
    id: u64,
}

impl RwCore {
    fn owner_raw(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    fn writer_should_block(&self, sync: &Synchronizer) -> bool {
        self.fair && sync.has_queued_predecessors()
    }

    fn reader_should_block(&self, sync: &Synchronizer) -> bool {
        if self.fair {
            sync.has_queued_predecessors()
        } else {
            // Keep barging readers from starving a queued writer.
            sync.apparently_first_queued_is_exclusive()
        }
    }

    fn full_try_acquire_shared(&self, sync: &Synchronizer, current: u64) -> i32 {
        loop {
            let c = sync.state();
            if exclusive_count(c) != 0 {
                if self.owner_raw() != current {
                    return -1;
                }
                // Holding the write lock: downgrade path, fall through.
            } else if self.reader_should_block(sync) && read_holds_get(self.id) == 0 {
                // A fresh (non-reentrant) read defers to the queue.
                return -1;
            }
            if shared_count(c) == MAX_COUNT {
                panic!("read lock count overflow");
            }
            if sync.cas_state(c, c + SHARED_UNIT) {
                read_holds_inc(self.id);
                return 1;
            }
        }
    }

    /// Barging read acquisition used by `ReadLock::try_lock`.
    fn try_read_lock(&self, sync: &Synchronizer) -> bool {
        let current = thread::current_id().as_u64();
        loop {
            let c = sync.state();
            if exclusive_count(c) != 0 && self.owner_raw() != current {
                return false;
            }
            if shared_count(c) == MAX_COUNT {
                panic!("read lock count overflow");
            }
            if sync.cas_state(c, c + SHARED_UNIT) {
                read_holds_inc(self.id);
                return true;
            }
        }
    }

    /// Barging write acquisition used by `WriteLock::try_lock`.
    fn try_write_lock(&self, sync: &Synchronizer) -> bool {
        let current = thread::current_id().as_u64();
        let c = sync.state();
        if c != 0 {
            let w = exclusive_count(c);
            if w == 0 || self.owner_raw() != current {
                return false;
            }
            if w == MAX_COUNT {
                panic!("write lock hold count overflow");
            }
        }
        if sync.cas_state(c, c + 1) {
            self.owner.store(current, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl SyncOps for RwCore {
    fn try_acquire(&self, sync: &Synchronizer, acquires: i32) -> bool {
        let current = thread::current_id().as_u64();
        let c = sync.state();
        let w = exclusive_count(c);
        if c != 0 {
            // Readers present, or another thread writes: fail. The owner
            // reenters below.
            if w == 0 || self.owner_raw() != current {
                return false;
            }
            if w + exclusive_count(acquires) > MAX_COUNT {
                panic!("write lock hold count overflow");
            }
            sync.set_state(c + acquires);
            return true;
        }
        if self.writer_should_block(sync) || !sync.cas_state(c, c + acquires) {
            return false;
        }
        self.owner.store(current, Ordering::Relaxed);
        true
    }

    fn try_release(&self, sync: &Synchronizer, releases: i32) -> Result<bool> {
        if !self.is_held_exclusively(sync) {
            return Err(Error::MonitorState(
                "write unlock by a thread that does not hold the write lock",
            ));
        }
        let nextc = sync.state() - releases;
        let free = exclusive_count(nextc) == 0;
        if free {
            self.owner.store(0, Ordering::Relaxed);
        }
        sync.set_state(nextc);
        Ok(free)
    }

    fn try_acquire_shared(&self, sync: &Synchronizer, _arg: i32) -> i32 {
        let current = thread::current_id().as_u64();
        let c = sync.state();
        if exclusive_count(c) != 0 && self.owner_raw() != current {
            return -1;
        }
        let r = shared_count(c);
        if !self.reader_should_block(sync) && r < MAX_COUNT && sync.cas_state(c, c + SHARED_UNIT) {
            read_holds_inc(self.id);
            return 1;
        }
        self.full_try_acquire_shared(sync, current)
    }

    fn try_release_shared(&self, sync: &Synchronizer, _arg: i32) -> Result<bool> {
        read_holds_dec(self.id)?;
        loop {
            let c = sync.state();
            let nextc = c - SHARED_UNIT;
            if sync.cas_state(c, nextc) {
                // Only the release that drops the last hold of any kind can
                // let a waiting writer in.
                return Ok(nextc == 0);
            }
        }
    }

    fn is_held_exclusively(&self, sync: &Synchronizer) -> bool {
        exclusive_count(sync.state()) != 0 && self.owner_raw() == thread::current_id().as_u64()
    }
}

impl SyncCore for RwCore {
    fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }
}

/// A reentrant shared-readers / exclusive-writer lock.
///
/// Obtain the two faces through [`read`](ReentrantRwLock::read) and
/// [`write`](ReentrantRwLock::write).
///
/// # Panics
///
/// Acquisitions panic when a 16-bit hold count would overflow: more than
/// 65535 simultaneous read holds or write reentries.
pub struct ReentrantRwLock {
    core: Arc<RwCore>,
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantRwLock {
    /// Create a non-fair read/write lock.
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    /// Create a read/write lock with the given admission policy.
    pub fn with_fairness(fair: bool) -> Self {
        static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);
        ReentrantRwLock {
            core: Arc::new(RwCore {
                sync: Synchronizer::new(),
                owner: AtomicU64::new(0),
                fair,
                id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// The shared-read face of this lock.
    pub fn read(&self) -> ReadLock<'_> {
        ReadLock { lock: self }
    }

    /// The exclusive-write face of this lock.
    pub fn write(&self) -> WriteLock<'_> {
        WriteLock { lock: self }
    }

    /// Whether this lock admits waiters fairly.
    pub fn is_fair(&self) -> bool {
        self.core.fair
    }

    /// Number of read holds across all threads.
    pub fn read_count(&self) -> i32 {
        shared_count(self.core.sync.state())
    }

    /// Number of reentrant read holds by the calling thread.
    pub fn read_hold_count(&self) -> usize {
        read_holds_get(self.core.id)
    }

    /// Whether any thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        exclusive_count(self.core.sync.state()) != 0
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.core.is_held_exclusively(&self.core.sync)
    }

    /// Number of reentrant write holds by the calling thread.
    pub fn write_hold_count(&self) -> i32 {
        if self.is_write_locked_by_current_thread() {
            exclusive_count(self.core.sync.state())
        } else {
            0
        }
    }

    /// Identity of the writing thread, if any. Weakly consistent.
    pub fn owner_id(&self) -> Option<ThreadId> {
        ThreadId::from_u64(self.core.owner_raw())
    }

    /// Whether threads are queued waiting for either face.
    pub fn has_queued_threads(&self) -> bool {
        self.core.sync.has_queued_threads()
    }

    /// An estimate of the number of queued waiters.
    pub fn queue_length(&self) -> usize {
        self.core.sync.queue_length()
    }
}

impl fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.core.sync.state();
        f.debug_struct("ReentrantRwLock")
            .field("fair", &self.core.fair)
            .field("readers", &shared_count(c))
            .field("write_holds", &exclusive_count(c))
            .finish()
    }
}

/// The shared face of a [`ReentrantRwLock`].
#[derive(Clone, Copy)]
pub struct ReadLock<'a> {
    lock: &'a ReentrantRwLock,
}

impl ReadLock<'_> {
    /// Acquire a read hold, parking while a writer is active.
    pub fn lock(&self) {
        let core = &self.lock.core;
        core.sync.acquire_shared(&**core, 1);
    }

    /// Acquire a read hold unless the current thread is interrupted.
    pub fn lock_interruptibly(&self) -> Result<()> {
        let core = &self.lock.core;
        core.sync.acquire_shared_interruptibly(&**core, 1)
    }

    /// Acquire a read hold only if immediately available. Barges past
    /// queued writers even on a fair lock.
    pub fn try_lock(&self) -> bool {
        let core = &self.lock.core;
        core.try_read_lock(&core.sync)
    }

    /// Acquire a read hold within `timeout`. `Ok(false)` when it elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        let core = &self.lock.core;
        core.sync.try_acquire_shared_for(&**core, 1, timeout)
    }

    /// Release one read hold. [`Error::MonitorState`] if the calling
    /// thread holds none.
    pub fn unlock(&self) -> Result<()> {
        let core = &self.lock.core;
        core.sync.release_shared(&**core, 1).map(drop)
    }
}

impl fmt::Debug for ReadLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLock")
            .field("readers", &self.lock.read_count())
            .finish()
    }
}

/// The exclusive face of a [`ReentrantRwLock`].
#[derive(Clone, Copy)]
pub struct WriteLock<'a> {
    lock: &'a ReentrantRwLock,
}

impl WriteLock<'_> {
    /// Acquire the write lock, parking until no readers or other writer
    /// remain. Reentrant for the owning thread.
    pub fn lock(&self) {
        let core = &self.lock.core;
        core.sync.acquire(&**core, 1);
    }

    /// Acquire the write lock unless the current thread is interrupted.
    pub fn lock_interruptibly(&self) -> Result<()> {
        let core = &self.lock.core;
        core.sync.acquire_interruptibly(&**core, 1)
    }

    /// Acquire the write lock only if immediately available. Barges even
    /// on a fair lock.
    pub fn try_lock(&self) -> bool {
        let core = &self.lock.core;
        core.try_write_lock(&core.sync)
    }

    /// Acquire the write lock within `timeout`. `Ok(false)` when it
    /// elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        let core = &self.lock.core;
        core.sync.try_acquire_for(&**core, 1, timeout)
    }

    /// Release one write hold. [`Error::MonitorState`] if the calling
    /// thread is not the writer.
    pub fn unlock(&self) -> Result<()> {
        let core = &self.lock.core;
        core.sync.release(&**core, 1).map(drop)
    }

    /// Create a condition bound to the write lock.
    pub fn new_condition(&self) -> Condition {
        Condition::new(self.lock.core.clone() as Arc<dyn SyncCore>)
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock.is_write_locked_by_current_thread()
    }

    /// Number of write holds by the calling thread.
    pub fn hold_count(&self) -> i32 {
        self.lock.write_hold_count()
    }
}

impl fmt::Debug for WriteLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLock")
            .field("locked", &self.lock.is_write_locked())
            .finish()
    }
}
