//! Count-down latch: a one-shot gate over the synchronizer's shared mode.
//!
//! The state word holds the remaining count. Waiters acquire in shared
//! mode, which succeeds only once the count reaches zero; each
//! [`count_down`](CountDownLatch::count_down) is a shared release. When the
//! count hits zero the release propagates through the wait queue and every
//! waiter proceeds. The latch cannot be reset.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::synchronizer::{SyncOps, Synchronizer};

struct LatchCore {
    sync: Synchronizer,
}

impl SyncOps for LatchCore {
    fn try_acquire_shared(&self, sync: &Synchronizer, _arg: i32) -> i32 {
        if sync.state() == 0 {
            1
        } else {
            -1
        }
    }

    fn try_release_shared(&self, sync: &Synchronizer, _arg: i32) -> Result<bool> {
        loop {
            let c = sync.state();
            if c == 0 {
                return Ok(false);
            }
            if sync.cas_state(c, c - 1) {
                return Ok(c == 1);
            }
        }
    }
}

/// A latch that opens once its count reaches zero.
pub struct CountDownLatch {
    core: Arc<LatchCore>,
}

impl CountDownLatch {
    /// Create a latch that opens after `count` calls to
    /// [`count_down`](Self::count_down).
    ///
    /// # Panics
    ///
    /// Panics when `count` exceeds `i32::MAX`.
    pub fn new(count: usize) -> Self {
        assert!(count <= i32::MAX as usize, "latch count exceeds i32::MAX");
        let core = LatchCore {
            sync: Synchronizer::new(),
        };
        core.sync.set_state(count as i32);
        CountDownLatch {
            core: Arc::new(core),
        }
    }

    /// The remaining count.
    pub fn count(&self) -> usize {
        self.core.sync.state() as usize
    }

    /// Decrement the count, opening the latch when it reaches zero.
    /// Counting down an open latch has no effect.
    pub fn count_down(&self) {
        // The latch's shared release never reports an error.
        let _ = self.core.sync.release_shared(&*self.core, 1);
    }

    /// Block until the latch opens. Interruptible.
    pub fn await_(&self) -> Result<()> {
        self.core.sync.acquire_shared_interruptibly(&*self.core, 1)
    }

    /// Block until the latch opens or `timeout` elapses. `Ok(false)` when
    /// the timeout wins.
    pub fn await_for(&self, timeout: Duration) -> Result<bool> {
        self.core
            .sync
            .try_acquire_shared_for(&*self.core, 1, timeout)
    }
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &self.count())
            .finish()
    }
}
