//! Queued synchronizer: the blocking engine under every lock in the crate.
//!
//! A [`Synchronizer`] pairs a single 32-bit atomic `state` word with a FIFO
//! queue of parked waiter nodes. What the state *means* is decided by the
//! [`SyncOps`] implementation plugged into it: a mutex interprets it as a
//! hold count, the read/write lock packs two 16-bit counts into it, a latch
//! treats it as the remaining count. The engine owns everything else: the
//! enqueue protocol, parking and wakeup, cancellation, timeouts, interrupt
//! delivery, and the condition queues.
//!
//! Waiter nodes are reference-counted. The `prev` chain toward the head is
//! the strong, authoritative path; `next` links are weak hints used to find
//! the successor quickly, with a backward scan from the tail as the
//! fallback. New nodes are appended tail-first with a compare-and-swap
//! loop; a sentinel head is installed lazily on first contention.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwapOption, ArcSwapWeak};
use crossbeam_utils::Backoff;

use crate::error::{Error, Result};
use crate::thread::{self, Thread, ThreadId};

/// Waiting in exclusive or shared mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The waiter wants the resource exclusively.
    Exclusive,
    /// The waiter shares the resource with other shared holders.
    Shared,
}

/// Node is cancelled; terminal, skipped by every traversal.
const CANCELLED: i32 = 1;
/// Successor of this node needs an unpark on release.
const SIGNAL: i32 = -1;
/// Node sits on a condition queue.
const CONDITION: i32 = -2;
/// A shared release should propagate to further shared waiters.
const PROPAGATE: i32 = -3;

/// Timeouts shorter than this spin instead of parking.
const SPIN_FOR_TIMEOUT_THRESHOLD: Duration = Duration::from_micros(1);

pub(crate) struct WaitNode {
    mode: Mode,
    status: AtomicI32,
    waiter: ArcSwapOption<thread::Inner>,
    /// Strong link toward the head; the authoritative path.
    prev: ArcSwapOption<WaitNode>,
    /// Weak hint toward the tail.
    next: ArcSwapWeak<WaitNode>,
    /// Chain link while the node sits on a condition queue.
    next_waiter: ArcSwapOption<WaitNode>,
}

impl WaitNode {
    fn new(mode: Mode, thread: Thread) -> Self {
        WaitNode {
            mode,
            status: AtomicI32::new(0),
            waiter: ArcSwapOption::from(Some(thread.inner().clone())),
            prev: ArcSwapOption::empty(),
            next: ArcSwapWeak::new(Weak::new()),
            next_waiter: ArcSwapOption::empty(),
        }
    }

    fn sentinel() -> Self {
        WaitNode {
            mode: Mode::Exclusive,
            status: AtomicI32::new(0),
            waiter: ArcSwapOption::empty(),
            prev: ArcSwapOption::empty(),
            next: ArcSwapWeak::new(Weak::new()),
            next_waiter: ArcSwapOption::empty(),
        }
    }

    fn for_condition(thread: Thread) -> Self {
        let node = WaitNode::new(Mode::Exclusive, thread);
        node.status.store(CONDITION, Ordering::SeqCst);
        node
    }

    fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::SeqCst) > 0
    }

    fn waiter_id(&self) -> Option<ThreadId> {
        self.waiter.load_full().map(|w| w.id())
    }

    fn unpark_waiter(&self) {
        if let Some(w) = self.waiter.load_full() {
            w.unpark();
        }
    }
}

fn opt_ptr(node: Option<&Arc<WaitNode>>) -> *const WaitNode {
    node.map_or(ptr::null(), Arc::as_ptr)
}

fn same_node(a: Option<&Arc<WaitNode>>, b: Option<&Arc<WaitNode>>) -> bool {
    opt_ptr(a) == opt_ptr(b)
}

/// The five primitives a synchronizer subclass supplies.
///
/// Implementations interpret the engine's `state` word through the accessors
/// on [`Synchronizer`] ([`state`](Synchronizer::state),
/// [`cas_state`](Synchronizer::cas_state),
/// [`set_state`](Synchronizer::set_state)). Each primitive must be
/// non-blocking; the engine does all queuing and parking.
///
/// A mode a given synchronizer does not support keeps the default
/// implementation, which panics if ever reached. Unrecoverable misuse
/// (overflowing a hold count past its field width) also panics;
/// recoverable protocol violations are reported as [`Error::MonitorState`].
pub trait SyncOps: Send + Sync {
    /// Attempt to acquire in exclusive mode. `true` on success.
    fn try_acquire(&self, sync: &Synchronizer, arg: i32) -> bool {
        let _ = (sync, arg);
        panic!("exclusive acquisition is not supported by this synchronizer");
    }

    /// Attempt to release in exclusive mode. `Ok(true)` when fully released
    /// so a successor may be signalled.
    fn try_release(&self, sync: &Synchronizer, arg: i32) -> Result<bool> {
        let _ = (sync, arg);
        panic!("exclusive release is not supported by this synchronizer");
    }

    /// Attempt to acquire in shared mode. Negative on failure; zero when
    /// successful but no further shared acquisition can succeed; positive
    /// when successful and propagation may help.
    fn try_acquire_shared(&self, sync: &Synchronizer, arg: i32) -> i32 {
        let _ = (sync, arg);
        panic!("shared acquisition is not supported by this synchronizer");
    }

    /// Attempt to release in shared mode. `Ok(true)` when the release may
    /// permit a waiting acquisition to succeed.
    fn try_release_shared(&self, sync: &Synchronizer, arg: i32) -> Result<bool> {
        let _ = (sync, arg);
        panic!("shared release is not supported by this synchronizer");
    }

    /// Whether the resource is held exclusively by the calling thread.
    /// Consulted by condition queues only.
    fn is_held_exclusively(&self, sync: &Synchronizer) -> bool {
        let _ = sync;
        panic!("exclusive holds are not supported by this synchronizer");
    }
}

/// A [`SyncOps`] implementation that can also hand out its engine, so
/// conditions and facades can reach the queue they operate on.
pub trait SyncCore: SyncOps {
    /// The synchronizer whose state and queue this core drives.
    fn synchronizer(&self) -> &Synchronizer;
}

/// FIFO wait queue plus the atomic state word. See the module docs.
pub struct Synchronizer {
    state: AtomicI32,
    head: ArcSwapOption<WaitNode>,
    tail: ArcSwapOption<WaitNode>,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("state", &self.state())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

impl Synchronizer {
    /// Create an engine with state zero and an empty queue.
    pub fn new() -> Self {
        Synchronizer {
            state: AtomicI32::new(0),
            head: ArcSwapOption::empty(),
            tail: ArcSwapOption::empty(),
        }
    }

    /// Current value of the state word.
    #[inline]
    pub fn state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    /// Unconditionally set the state word. Only safe under the exclusive
    /// protocol of the owning [`SyncOps`].
    #[inline]
    pub fn set_state(&self, value: i32) {
        self.state.store(value, Ordering::SeqCst);
    }

    /// Compare-and-set the state word.
    #[inline]
    pub fn cas_state(&self, current: i32, new: i32) -> bool {
        self.state
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // --- queue plumbing ---------------------------------------------------

    fn is_head(&self, node: &Arc<WaitNode>) -> bool {
        same_node(self.head.load_full().as_ref(), Some(node))
    }

    fn is_tail(&self, node: &Arc<WaitNode>) -> bool {
        same_node(self.tail.load_full().as_ref(), Some(node))
    }

    /// Append `node` tail-first, initialising the sentinel head on first
    /// contention. Returns the node's predecessor.
    fn enq(&self, node: &Arc<WaitNode>) -> Arc<WaitNode> {
        let backoff = Backoff::new();
        loop {
            match self.tail.load_full() {
                None => {
                    let none: Option<Arc<WaitNode>> = None;
                    let sentinel = Arc::new(WaitNode::sentinel());
                    let prev = self.head.compare_and_swap(&none, Some(sentinel.clone()));
                    if (*prev).is_none() {
                        self.tail.store(Some(sentinel));
                    }
                }
                Some(t) => {
                    node.prev.store(Some(t.clone()));
                    let current = Some(t.clone());
                    let prev = self.tail.compare_and_swap(&current, Some(node.clone()));
                    if same_node((*prev).as_ref(), current.as_ref()) {
                        t.next.store(Arc::downgrade(node));
                        return t;
                    }
                    backoff.spin();
                }
            }
        }
    }

    fn add_waiter(&self, mode: Mode) -> Arc<WaitNode> {
        let node = Arc::new(WaitNode::new(mode, Thread::current()));
        self.enq(&node);
        node
    }

    /// Install `node` as the new head. Called only by the thread that just
    /// acquired through it.
    fn set_head(&self, node: &Arc<WaitNode>) {
        self.head.store(Some(node.clone()));
        node.waiter.store(None);
        node.prev.store(None);
    }

    fn predecessor(node: &Arc<WaitNode>) -> Arc<WaitNode> {
        match node.prev.load_full() {
            Some(p) => p,
            // An enqueued node keeps a predecessor until its own set_head.
            None => unreachable!("enqueued node has no predecessor"),
        }
    }

    /// Wake the closest non-cancelled successor of `node`, using the weak
    /// `next` hint first and falling back to a backward scan from the tail.
    fn unpark_successor(&self, node: &Arc<WaitNode>) {
        let ws = node.status.load(Ordering::SeqCst);
        if ws < 0 {
            let _ = node
                .status
                .compare_exchange(ws, 0, Ordering::SeqCst, Ordering::SeqCst);
        }

        let mut succ = node.next.load_full().upgrade();
        if succ.as_ref().map_or(true, |s| s.is_cancelled()) {
            succ = None;
            let mut t = self.tail.load_full();
            while let Some(n) = t {
                if Arc::ptr_eq(&n, node) {
                    break;
                }
                if !n.is_cancelled() {
                    succ = Some(n.clone());
                }
                t = n.prev.load_full();
            }
        }
        if let Some(s) = succ {
            s.unpark_waiter();
        }
    }

    /// Release propagation for shared mode: wake the head's successor and
    /// keep going while the head keeps changing under us.
    fn do_release_shared(&self) {
        loop {
            let h = self.head.load_full();
            if let Some(ref head) = h {
                if !self.is_tail(head) {
                    let ws = head.status.load(Ordering::SeqCst);
                    if ws == SIGNAL {
                        if head
                            .status
                            .compare_exchange(SIGNAL, 0, Ordering::SeqCst, Ordering::SeqCst)
                            .is_err()
                        {
                            continue;
                        }
                        self.unpark_successor(head);
                    } else if ws == 0
                        && head
                            .status
                            .compare_exchange(0, PROPAGATE, Ordering::SeqCst, Ordering::SeqCst)
                            .is_err()
                    {
                        continue;
                    }
                }
            }
            if same_node(self.head.load_full().as_ref(), h.as_ref()) {
                return;
            }
        }
    }

    fn set_head_and_propagate(&self, node: &Arc<WaitNode>, propagate: i32) {
        let old_head = self.head.load_full();
        self.set_head(node);

        let should = propagate > 0
            || old_head
                .as_ref()
                .map_or(true, |h| h.status.load(Ordering::SeqCst) < 0)
            || self
                .head
                .load_full()
                .map_or(true, |h| h.status.load(Ordering::SeqCst) < 0);
        if should {
            match node.next.load_full().upgrade() {
                None => self.do_release_shared(),
                Some(s) if s.mode == Mode::Shared => self.do_release_shared(),
                Some(_) => {}
            }
        }
    }

    /// Decide whether the current thread may park: only once its
    /// predecessor has promised a signal. Splices out cancelled
    /// predecessors on the way.
    fn should_park_after_failed_acquire(
        &self,
        pred: &Arc<WaitNode>,
        node: &Arc<WaitNode>,
    ) -> bool {
        let ws = pred.status.load(Ordering::SeqCst);
        if ws == SIGNAL {
            return true;
        }
        if ws > 0 {
            let mut p = pred.clone();
            while p.is_cancelled() {
                match p.prev.load_full() {
                    Some(pp) => p = pp,
                    None => break,
                }
            }
            node.prev.store(Some(p.clone()));
            p.next.store(Arc::downgrade(node));
        } else {
            let _ = pred
                .status
                .compare_exchange(ws, SIGNAL, Ordering::SeqCst, Ordering::SeqCst);
        }
        false
    }

    /// Abandon an in-progress acquisition: mark the node cancelled, splice
    /// it out where possible, and make sure a successor still gets woken.
    fn cancel_acquire(&self, node: &Arc<WaitNode>) {
        node.waiter.store(None);

        let mut pred = match node.prev.load_full() {
            Some(p) => p,
            None => return,
        };
        while pred.is_cancelled() {
            match pred.prev.load_full() {
                Some(pp) => {
                    node.prev.store(Some(pp.clone()));
                    pred = pp;
                }
                None => break,
            }
        }
        let pred_next = pred.next.load_full();

        node.status.store(CANCELLED, Ordering::SeqCst);

        let unlinked_tail = self.is_tail(node) && {
            let current = Some(node.clone());
            let prev = self.tail.compare_and_swap(&current, Some(pred.clone()));
            same_node((*prev).as_ref(), current.as_ref())
        };
        if unlinked_tail {
            let _ = pred.next.compare_and_swap(&pred_next, Weak::new());
        } else {
            let pred_handles_signal = !self.is_head(&pred) && {
                let ws = pred.status.load(Ordering::SeqCst);
                let signalling = ws == SIGNAL
                    || (ws <= 0
                        && pred
                            .status
                            .compare_exchange(ws, SIGNAL, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok());
                signalling && pred.waiter.load_full().is_some()
            };
            if pred_handles_signal {
                if let Some(next) = node.next.load_full().upgrade() {
                    if !next.is_cancelled() {
                        let _ = pred.next.compare_and_swap(&pred_next, Arc::downgrade(&next));
                    }
                }
            } else {
                self.unpark_successor(node);
            }
        }
        // Detached marker, mirrored by is_on_sync_queue.
        node.next.store(Arc::downgrade(node));
    }

    // --- exclusive acquisition -------------------------------------------

    /// Acquire exclusively, parking until granted. Not interruptible: an
    /// interrupt observed while parked is re-asserted on the thread after
    /// the acquisition completes.
    pub fn acquire(&self, ops: &(impl SyncOps + ?Sized), arg: i32) {
        if !ops.try_acquire(self, arg) {
            let node = self.add_waiter(Mode::Exclusive);
            if self.acquire_queued(ops, &node, arg) {
                Thread::current().interrupt();
            }
        }
    }

    /// Core acquire loop for a node already on the queue. Returns whether
    /// an interrupt arrived while waiting. Also used by condition
    /// reacquisition.
    pub(crate) fn acquire_queued(
        &self,
        ops: &(impl SyncOps + ?Sized),
        node: &Arc<WaitNode>,
        arg: i32,
    ) -> bool {
        let mut interrupted = false;
        loop {
            let pred = Self::predecessor(node);
            if self.is_head(&pred) && ops.try_acquire(self, arg) {
                self.set_head(node);
                pred.next.store(Weak::new());
                return interrupted;
            }
            if self.should_park_after_failed_acquire(&pred, node) {
                thread::park();
                if thread::interrupted() {
                    interrupted = true;
                }
            }
        }
    }

    /// Acquire exclusively; surface [`Error::Interrupted`] if the thread is
    /// interrupted before or while waiting.
    pub fn acquire_interruptibly(&self, ops: &(impl SyncOps + ?Sized), arg: i32) -> Result<()> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        if ops.try_acquire(self, arg) {
            return Ok(());
        }
        let node = self.add_waiter(Mode::Exclusive);
        let result = (|| loop {
            let pred = Self::predecessor(&node);
            if self.is_head(&pred) && ops.try_acquire(self, arg) {
                self.set_head(&node);
                pred.next.store(Weak::new());
                return Ok(());
            }
            if self.should_park_after_failed_acquire(&pred, &node) {
                thread::park();
                if thread::interrupted() {
                    return Err(Error::Interrupted);
                }
            }
        })();
        if result.is_err() {
            self.cancel_acquire(&node);
        }
        result
    }

    /// Bounded exclusive acquire. `Ok(false)` when the timeout elapses.
    pub fn try_acquire_for(
        &self,
        ops: &(impl SyncOps + ?Sized),
        arg: i32,
        timeout: Duration,
    ) -> Result<bool> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        if ops.try_acquire(self, arg) {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        let node = self.add_waiter(Mode::Exclusive);
        let result = (|| loop {
            let pred = Self::predecessor(&node);
            if self.is_head(&pred) && ops.try_acquire(self, arg) {
                self.set_head(&node);
                pred.next.store(Weak::new());
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if self.should_park_after_failed_acquire(&pred, &node)
                && deadline - now > SPIN_FOR_TIMEOUT_THRESHOLD
            {
                thread::park_until(deadline);
            }
            if thread::interrupted() {
                return Err(Error::Interrupted);
            }
        })();
        match result {
            Ok(true) => Ok(true),
            other => {
                self.cancel_acquire(&node);
                other
            }
        }
    }

    /// Release exclusively; wake the head's successor when fully released.
    pub fn release(&self, ops: &(impl SyncOps + ?Sized), arg: i32) -> Result<bool> {
        if ops.try_release(self, arg)? {
            if let Some(h) = self.head.load_full() {
                if h.status.load(Ordering::SeqCst) != 0 {
                    self.unpark_successor(&h);
                }
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // --- shared acquisition ----------------------------------------------

    /// Acquire in shared mode, parking until granted. Not interruptible.
    pub fn acquire_shared(&self, ops: &(impl SyncOps + ?Sized), arg: i32) {
        if ops.try_acquire_shared(self, arg) < 0 {
            let node = self.add_waiter(Mode::Shared);
            let mut interrupted = false;
            loop {
                let pred = Self::predecessor(&node);
                if self.is_head(&pred) {
                    let r = ops.try_acquire_shared(self, arg);
                    if r >= 0 {
                        self.set_head_and_propagate(&node, r);
                        pred.next.store(Weak::new());
                        break;
                    }
                }
                if self.should_park_after_failed_acquire(&pred, &node) {
                    thread::park();
                    if thread::interrupted() {
                        interrupted = true;
                    }
                }
            }
            if interrupted {
                Thread::current().interrupt();
            }
        }
    }

    /// Shared acquire that surfaces interrupts.
    pub fn acquire_shared_interruptibly(
        &self,
        ops: &(impl SyncOps + ?Sized),
        arg: i32,
    ) -> Result<()> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        if ops.try_acquire_shared(self, arg) >= 0 {
            return Ok(());
        }
        let node = self.add_waiter(Mode::Shared);
        let result = (|| loop {
            let pred = Self::predecessor(&node);
            if self.is_head(&pred) {
                let r = ops.try_acquire_shared(self, arg);
                if r >= 0 {
                    self.set_head_and_propagate(&node, r);
                    pred.next.store(Weak::new());
                    return Ok(());
                }
            }
            if self.should_park_after_failed_acquire(&pred, &node) {
                thread::park();
                if thread::interrupted() {
                    return Err(Error::Interrupted);
                }
            }
        })();
        if result.is_err() {
            self.cancel_acquire(&node);
        }
        result
    }

    /// Bounded shared acquire. `Ok(false)` when the timeout elapses.
    pub fn try_acquire_shared_for(
        &self,
        ops: &(impl SyncOps + ?Sized),
        arg: i32,
        timeout: Duration,
    ) -> Result<bool> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        if ops.try_acquire_shared(self, arg) >= 0 {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        let node = self.add_waiter(Mode::Shared);
        let result = (|| loop {
            let pred = Self::predecessor(&node);
            if self.is_head(&pred) {
                let r = ops.try_acquire_shared(self, arg);
                if r >= 0 {
                    self.set_head_and_propagate(&node, r);
                    pred.next.store(Weak::new());
                    return Ok(true);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if self.should_park_after_failed_acquire(&pred, &node)
                && deadline - now > SPIN_FOR_TIMEOUT_THRESHOLD
            {
                thread::park_until(deadline);
            }
            if thread::interrupted() {
                return Err(Error::Interrupted);
            }
        })();
        match result {
            Ok(true) => Ok(true),
            other => {
                self.cancel_acquire(&node);
                other
            }
        }
    }

    /// Release in shared mode; propagate to waiting acquirers when allowed.
    pub fn release_shared(&self, ops: &(impl SyncOps + ?Sized), arg: i32) -> Result<bool> {
        if ops.try_release_shared(self, arg)? {
            self.do_release_shared();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // --- queue introspection ---------------------------------------------

    /// Whether any thread is waiting to acquire. Weakly consistent.
    pub fn has_queued_threads(&self) -> bool {
        !same_node(
            self.head.load_full().as_ref(),
            self.tail.load_full().as_ref(),
        )
    }

    /// Whether any thread has ever contended on this synchronizer.
    pub fn has_contended(&self) -> bool {
        self.head.load_full().is_some()
    }

    /// Number of threads currently waiting. Weakly consistent.
    pub fn queue_length(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.tail.load_full();
        while let Some(node) = cursor {
            if node.waiter.load_full().is_some() {
                n += 1;
            }
            cursor = node.prev.load_full();
        }
        n
    }

    fn collect_queued(&self, filter: Option<Mode>) -> Vec<Thread> {
        let mut out = Vec::new();
        let mut cursor = self.tail.load_full();
        while let Some(node) = cursor {
            if filter.map_or(true, |m| node.mode == m) {
                if let Some(w) = node.waiter.load_full() {
                    out.push(Thread::from_inner(w));
                }
            }
            cursor = node.prev.load_full();
        }
        out
    }

    /// The threads currently waiting, in no guaranteed order.
    pub fn queued_threads(&self) -> Vec<Thread> {
        self.collect_queued(None)
    }

    /// The threads waiting in exclusive mode.
    pub fn exclusive_queued_threads(&self) -> Vec<Thread> {
        self.collect_queued(Some(Mode::Exclusive))
    }

    /// The threads waiting in shared mode.
    pub fn shared_queued_threads(&self) -> Vec<Thread> {
        self.collect_queued(Some(Mode::Shared))
    }

    /// Whether the given thread is on the wait queue.
    pub fn is_queued(&self, thread: &Thread) -> bool {
        let mut cursor = self.tail.load_full();
        while let Some(node) = cursor {
            if node.waiter_id() == Some(thread.id()) {
                return true;
            }
            cursor = node.prev.load_full();
        }
        false
    }

    /// The thread that has waited longest, if any.
    pub fn first_queued_thread(&self) -> Option<Thread> {
        if let Some(h) = self.head.load_full() {
            if let Some(s) = h.next.load_full().upgrade() {
                if !s.is_cancelled() {
                    if let Some(w) = s.waiter.load_full() {
                        return Some(Thread::from_inner(w));
                    }
                }
            }
        }
        // Hint missing or stale: the node closest to the head wins.
        let head_ptr = opt_ptr(self.head.load_full().as_ref());
        let mut result = None;
        let mut cursor = self.tail.load_full();
        while let Some(node) = cursor {
            if Arc::as_ptr(&node) == head_ptr {
                break;
            }
            if let Some(w) = node.waiter.load_full() {
                result = Some(Thread::from_inner(w));
            }
            cursor = node.prev.load_full();
        }
        result
    }

    /// Whether a thread other than the caller has waited longer than the
    /// caller would have. Fair acquirers consult this before barging.
    pub fn has_queued_predecessors(&self) -> bool {
        let tail = self.tail.load_full();
        let head = self.head.load_full();
        if same_node(head.as_ref(), tail.as_ref()) {
            return false;
        }
        let Some(head) = head else { return false };
        match head.next.load_full().upgrade() {
            None => true,
            Some(s) => s.waiter_id() != Some(thread::current_id()),
        }
    }

    /// Heuristic used by the non-fair read lock: does an exclusive waiter
    /// head the queue?
    pub(crate) fn apparently_first_queued_is_exclusive(&self) -> bool {
        if let Some(h) = self.head.load_full() {
            if let Some(s) = h.next.load_full().upgrade() {
                return s.mode == Mode::Exclusive && s.waiter.load_full().is_some();
            }
        }
        false
    }

    // --- condition transfer ----------------------------------------------

    /// Whether a node that started on a condition queue has moved to the
    /// sync queue.
    pub(crate) fn is_on_sync_queue(&self, node: &Arc<WaitNode>) -> bool {
        if node.status.load(Ordering::SeqCst) == CONDITION || node.prev.load_full().is_none() {
            return false;
        }
        if let Some(n) = node.next.load_full().upgrade() {
            if !Arc::ptr_eq(&n, node) {
                return true;
            }
        }
        self.find_node_from_tail(node)
    }

    fn find_node_from_tail(&self, node: &Arc<WaitNode>) -> bool {
        let mut cursor = self.tail.load_full();
        while let Some(n) = cursor {
            if Arc::ptr_eq(&n, node) {
                return true;
            }
            cursor = n.prev.load_full();
        }
        false
    }

    /// Move a signalled node from its condition queue onto the sync queue.
    /// `false` if the waiter cancelled before the signal.
    pub(crate) fn transfer_for_signal(&self, node: &Arc<WaitNode>) -> bool {
        if node
            .status
            .compare_exchange(CONDITION, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let pred = self.enq(node);
        let ws = pred.status.load(Ordering::SeqCst);
        if ws > 0
            || pred
                .status
                .compare_exchange(ws, SIGNAL, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            node.unpark_waiter();
        }
        true
    }

    /// After a cancelled wait (interrupt or timeout), move the node onto
    /// the sync queue. `true` if the cancellation beat any signal.
    pub(crate) fn transfer_after_cancelled_wait(&self, node: &Arc<WaitNode>) -> bool {
        if node
            .status
            .compare_exchange(CONDITION, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.enq(node);
            return true;
        }
        // A signal is mid-transfer; wait for the enqueue to land.
        while !self.is_on_sync_queue(node) {
            std::thread::yield_now();
        }
        false
    }
}

/// How an interrupt observed during a condition wait is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptMode {
    None,
    /// Re-assert the flag after reacquiring; the signal won the race.
    Reinterrupt,
    /// Surface [`Error::Interrupted`]; the interrupt won.
    Throw,
}

/// A wait-set bound to one exclusive synchronizer, obtained from a lock's
/// `new_condition`.
///
/// Every operation requires the calling thread to hold the associated lock
/// exclusively; violations report [`Error::MonitorState`]. Signals are
/// delivered in FIFO order of the condition queue.
pub struct Condition {
    core: Arc<dyn SyncCore>,
    first_waiter: ArcSwapOption<WaitNode>,
    last_waiter: ArcSwapOption<WaitNode>,
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition").finish_non_exhaustive()
    }
}

impl Condition {
    pub(crate) fn new(core: Arc<dyn SyncCore>) -> Condition {
        Condition {
            core,
            first_waiter: ArcSwapOption::empty(),
            last_waiter: ArcSwapOption::empty(),
        }
    }

    fn sync(&self) -> &Synchronizer {
        self.core.synchronizer()
    }

    /// Whether this condition was created by the lock driving `sync`.
    pub(crate) fn belongs_to(&self, sync: &Synchronizer) -> bool {
        ptr::eq(self.sync(), sync)
    }

    fn check_owned(&self) -> Result<()> {
        if self.core.is_held_exclusively(self.sync()) {
            Ok(())
        } else {
            Err(Error::MonitorState(
                "condition used without holding its lock",
            ))
        }
    }

    /// Add the current thread to the condition queue. Lock must be held.
    fn add_condition_waiter(&self) -> Result<Arc<WaitNode>> {
        self.check_owned()?;
        let mut last = self.last_waiter.load_full();
        if last
            .as_ref()
            .map_or(false, |n| n.status.load(Ordering::SeqCst) != CONDITION)
        {
            self.unlink_cancelled_waiters();
            last = self.last_waiter.load_full();
        }
        let node = Arc::new(WaitNode::for_condition(Thread::current()));
        match last {
            Some(last) => last.next_waiter.store(Some(node.clone())),
            None => self.first_waiter.store(Some(node.clone())),
        }
        self.last_waiter.store(Some(node.clone()));
        Ok(node)
    }

    /// Release the lock completely (all reentrant holds) and remember the
    /// count for reacquisition.
    fn fully_release(&self, node: &Arc<WaitNode>) -> Result<i32> {
        let sync = self.sync();
        let saved = sync.state();
        match sync.release(self.core.as_ref(), saved) {
            Ok(true) => Ok(saved),
            Ok(false) => {
                node.status.store(CANCELLED, Ordering::SeqCst);
                Err(Error::MonitorState(
                    "await on a condition whose lock is not held",
                ))
            }
            Err(e) => {
                node.status.store(CANCELLED, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn check_interrupt_while_waiting(&self, node: &Arc<WaitNode>) -> InterruptMode {
        if thread::interrupted() {
            if self.sync().transfer_after_cancelled_wait(node) {
                InterruptMode::Throw
            } else {
                InterruptMode::Reinterrupt
            }
        } else {
            InterruptMode::None
        }
    }

    fn report_interrupt(&self, mode: InterruptMode) -> Result<()> {
        match mode {
            InterruptMode::Throw => Err(Error::Interrupted),
            InterruptMode::Reinterrupt => {
                Thread::current().interrupt();
                Ok(())
            }
            InterruptMode::None => Ok(()),
        }
    }

    fn finish_wait(
        &self,
        node: &Arc<WaitNode>,
        saved: i32,
        mut mode: InterruptMode,
    ) -> InterruptMode {
        if self.sync().acquire_queued(self.core.as_ref(), node, saved)
            && mode != InterruptMode::Throw
        {
            mode = InterruptMode::Reinterrupt;
        }
        if node.next_waiter.load_full().is_some() {
            self.unlink_cancelled_waiters();
        }
        mode
    }

    /// Block until signalled. Reacquires the lock with its saved hold count
    /// before returning. Interruptible.
    pub fn await_(&self) -> Result<()> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        let node = self.add_condition_waiter()?;
        let saved = self.fully_release(&node)?;
        let mut mode = InterruptMode::None;
        while !self.sync().is_on_sync_queue(&node) {
            thread::park();
            mode = self.check_interrupt_while_waiting(&node);
            if mode != InterruptMode::None {
                break;
            }
        }
        let mode = self.finish_wait(&node, saved, mode);
        self.report_interrupt(mode)
    }

    /// Block until signalled, deferring interrupts: an interrupt observed
    /// while waiting is re-asserted after reacquisition instead of being
    /// surfaced.
    pub fn await_uninterruptibly(&self) -> Result<()> {
        let node = self.add_condition_waiter()?;
        let saved = self.fully_release(&node)?;
        let mut interrupted = false;
        while !self.sync().is_on_sync_queue(&node) {
            thread::park();
            if thread::interrupted() {
                interrupted = true;
            }
        }
        if self.sync().acquire_queued(self.core.as_ref(), &node, saved) || interrupted {
            Thread::current().interrupt();
        }
        Ok(())
    }

    /// Block until signalled or `timeout` elapses. Returns the remaining
    /// time when signalled, `None` on timeout. The lock is reacquired in
    /// both cases.
    pub fn await_for(&self, timeout: Duration) -> Result<Option<Duration>> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        let node = self.add_condition_waiter()?;
        let saved = self.fully_release(&node)?;
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let mut mode = InterruptMode::None;
        while !self.sync().is_on_sync_queue(&node) {
            let now = Instant::now();
            if now >= deadline {
                timed_out = self.sync().transfer_after_cancelled_wait(&node);
                break;
            }
            if deadline - now > SPIN_FOR_TIMEOUT_THRESHOLD {
                thread::park_until(deadline);
            }
            mode = self.check_interrupt_while_waiting(&node);
            if mode != InterruptMode::None {
                break;
            }
        }
        let mode = self.finish_wait(&node, saved, mode);
        self.report_interrupt(mode)?;
        if timed_out {
            Ok(None)
        } else {
            Ok(Some(deadline.saturating_duration_since(Instant::now())))
        }
    }

    /// Block until signalled or the deadline passes; [`Error::Timeout`] on
    /// expiry. The lock is reacquired before either return.
    pub fn await_until(&self, deadline: Instant) -> Result<()> {
        if thread::interrupted() {
            return Err(Error::Interrupted);
        }
        let node = self.add_condition_waiter()?;
        let saved = self.fully_release(&node)?;
        let mut timed_out = false;
        let mut mode = InterruptMode::None;
        while !self.sync().is_on_sync_queue(&node) {
            if Instant::now() >= deadline {
                timed_out = self.sync().transfer_after_cancelled_wait(&node);
                break;
            }
            thread::park_until(deadline);
            mode = self.check_interrupt_while_waiting(&node);
            if mode != InterruptMode::None {
                break;
            }
        }
        let mode = self.finish_wait(&node, saved, mode);
        self.report_interrupt(mode)?;
        if timed_out {
            Err(Error::Timeout)
        } else {
            Ok(())
        }
    }

    /// Wake the longest-waiting waiter, moving it to the sync queue.
    pub fn signal(&self) -> Result<()> {
        self.check_owned()?;
        if let Some(first) = self.first_waiter.load_full() {
            self.do_signal(first);
        }
        Ok(())
    }

    /// Wake every waiter.
    pub fn signal_all(&self) -> Result<()> {
        self.check_owned()?;
        if let Some(first) = self.first_waiter.load_full() {
            self.first_waiter.store(None);
            self.last_waiter.store(None);
            let mut cursor = first;
            loop {
                let next = cursor.next_waiter.load_full();
                cursor.next_waiter.store(None);
                let _ = self.sync().transfer_for_signal(&cursor);
                match next {
                    Some(n) => cursor = n,
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn do_signal(&self, mut first: Arc<WaitNode>) {
        loop {
            let next = first.next_waiter.load_full();
            self.first_waiter.store(next.clone());
            if next.is_none() {
                self.last_waiter.store(None);
            }
            first.next_waiter.store(None);
            if self.sync().transfer_for_signal(&first) {
                return;
            }
            match self.first_waiter.load_full() {
                Some(f) => first = f,
                None => return,
            }
        }
    }

    /// Drop cancelled nodes from the condition list. Lock must be held.
    fn unlink_cancelled_waiters(&self) {
        let mut cursor = self.first_waiter.load_full();
        let mut trail: Option<Arc<WaitNode>> = None;
        while let Some(node) = cursor {
            let next = node.next_waiter.load_full();
            if node.status.load(Ordering::SeqCst) != CONDITION {
                node.next_waiter.store(None);
                match &trail {
                    None => self.first_waiter.store(next.clone()),
                    Some(t) => t.next_waiter.store(next.clone()),
                }
                if next.is_none() {
                    self.last_waiter.store(trail.clone());
                }
            } else {
                trail = Some(node);
            }
            cursor = next;
        }
    }

    /// Whether any thread waits on this condition. Lock must be held.
    pub fn has_waiters(&self) -> Result<bool> {
        self.check_owned()?;
        let mut cursor = self.first_waiter.load_full();
        while let Some(node) = cursor {
            if node.status.load(Ordering::SeqCst) == CONDITION {
                return Ok(true);
            }
            cursor = node.next_waiter.load_full();
        }
        Ok(false)
    }

    /// An estimate of the number of waiters. Lock must be held.
    pub fn wait_queue_length(&self) -> Result<usize> {
        self.check_owned()?;
        let mut n = 0;
        let mut cursor = self.first_waiter.load_full();
        while let Some(node) = cursor {
            if node.status.load(Ordering::SeqCst) == CONDITION {
                n += 1;
            }
            cursor = node.next_waiter.load_full();
        }
        Ok(n)
    }
}
