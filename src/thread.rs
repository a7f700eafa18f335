//! Thread identity, interrupt delivery, and parking.
//!
//! The synchronizer needs three things from the runtime: a handle that
//! identifies a thread and can wake it, a per-thread interrupt flag that a
//! blocked thread consults when it wakes, and a parking primitive with a
//! single pending permit. The standard library provides parking; this module
//! adds the identity and the interrupt flag on top of it.
//!
//! [`Thread`] handles are cheap to clone and compare by identity. Interrupts
//! are cooperative: [`Thread::interrupt`] sets the flag and unparks the
//! target, and every blocking operation in this crate checks the flag on
//! entry and after each wakeup.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread as sys;
use std::time::Instant;

/// Crate-assigned thread identity, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        match NonZeroU64::new(raw) {
            Some(id) => ThreadId(id),
            // 2^64 thread spawns cannot be reached in practice.
            None => panic!("thread id space exhausted"),
        }
    }

    /// The identity as a raw integer, for owner fields packed into atomics.
    pub(crate) fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Rebuild an identity from a packed owner field; zero means no owner.
    pub(crate) fn from_u64(raw: u64) -> Option<ThreadId> {
        NonZeroU64::new(raw).map(ThreadId)
    }
}

pub(crate) struct Inner {
    id: ThreadId,
    sys: sys::Thread,
    interrupted: AtomicBool,
}

impl Inner {
    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn unpark(&self) {
        self.sys.unpark();
    }
}

/// A handle to a thread, usable as an owner token and a wakeup target.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

thread_local! {
    static CURRENT: Thread = Thread {
        inner: Arc::new(Inner {
            id: ThreadId::next(),
            sys: sys::current(),
            interrupted: AtomicBool::new(false),
        }),
    };
}

impl Thread {
    /// The handle of the calling thread.
    pub fn current() -> Thread {
        CURRENT.with(Thread::clone)
    }

    /// This thread's identity.
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// The OS-level thread name, when one was set at spawn.
    pub fn name(&self) -> Option<&str> {
        self.inner.sys.name()
    }

    /// Grant the thread its park permit, waking it if it is parked.
    pub fn unpark(&self) {
        self.inner.sys.unpark();
    }

    /// Set the interrupt flag and wake the thread.
    ///
    /// The target observes the interrupt the next time it checks the flag,
    /// which every blocking operation in this crate does on entry and after
    /// each wakeup.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.sys.unpark();
    }

    /// Whether the interrupt flag is set. Does not clear it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Thread {
        Thread { inner }
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Thread {}

impl std::hash::Hash for Thread {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .finish()
    }
}

/// The calling thread's identity without cloning a handle.
pub fn current_id() -> ThreadId {
    CURRENT.with(|t| t.inner.id)
}

/// Read and clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|t| t.inner.interrupted.swap(false, Ordering::AcqRel))
}

/// Park the calling thread until unparked. Spurious returns are permitted;
/// a permit granted before the call returns immediately.
pub fn park() {
    sys::park();
}

/// Park the calling thread until unparked or the deadline passes.
pub fn park_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        sys::park_timeout(deadline - now);
    }
}
