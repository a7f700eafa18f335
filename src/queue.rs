//! Bounded FIFO blocking queue on the two-lock algorithm.
//!
//! The put side and the take side each own a lock with an associated
//! condition (`not_full` / `not_empty`), and the shared element count is an
//! atomic so neither side normally touches the other's lock. Cascading
//! signals keep wakeups flowing: a put that leaves room signals the next
//! put, a take that leaves elements signals the next take, and only the
//! edge transitions (empty to non-empty, full to not-full) cross sides.
//!
//! Nodes form a singly-linked list behind a sentinel head whose item slot
//! is empty. `head` is guarded by the take lock, `last` by the put lock;
//! operations that touch both ends take both locks, put lock first.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::error::Result;
use crate::lock::ReentrantLock;
use crate::synchronizer::Condition;

struct Node<T> {
    item: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn alloc(item: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }))
    }
}

fn unlock(lock: &ReentrantLock) {
    let released = lock.unlock();
    debug_assert!(released.is_ok());
}

/// A bounded blocking FIFO queue of owned elements.
///
/// `put`/`take` block, `offer`/`poll` do not, and the `_for` variants wait
/// against an absolute deadline re-armed across spurious wakeups. Insertion
/// methods give the element back when they cannot enqueue it.
///
/// # Panics
///
/// [`with_capacity`](Self::with_capacity) panics on a capacity of zero.
pub struct LinkedBlockingQueue<T> {
    capacity: usize,
    count: CachePadded<AtomicUsize>,
    /// Sentinel node; guarded by `take_lock`.
    head: UnsafeCell<*mut Node<T>>,
    /// Guarded by `put_lock`.
    last: UnsafeCell<*mut Node<T>>,
    take_lock: CachePadded<ReentrantLock>,
    not_empty: Condition,
    put_lock: CachePadded<ReentrantLock>,
    not_full: Condition,
}

// The raw node pointers are only touched under the endpoint locks.
unsafe impl<T: Send> Send for LinkedBlockingQueue<T> {}
unsafe impl<T: Send> Sync for LinkedBlockingQueue<T> {}

impl<T> Default for LinkedBlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedBlockingQueue<T> {
    /// Create a queue bounded only by memory.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Create a queue holding at most `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let put_lock = CachePadded::new(ReentrantLock::new());
        let not_full = put_lock.new_condition();
        let take_lock = CachePadded::new(ReentrantLock::new());
        let not_empty = take_lock.new_condition();
        let sentinel = Node::<T>::alloc(None);
        LinkedBlockingQueue {
            capacity,
            count: CachePadded::new(AtomicUsize::new(0)),
            head: UnsafeCell::new(sentinel),
            last: UnsafeCell::new(sentinel),
            take_lock,
            not_empty,
            put_lock,
            not_full,
        }
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of elements.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many elements fit before a `put` would block. Advisory only.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Link `node` at the tail. Put lock held.
    unsafe fn enqueue(&self, node: *mut Node<T>) {
        let last = self.last.get();
        (**last).next = node;
        *last = node;
    }

    /// Unlink and return the item behind the sentinel. Take lock held and
    /// the queue known non-empty.
    unsafe fn dequeue(&self) -> T {
        let head_slot = self.head.get();
        let old_head = *head_slot;
        let first = (*old_head).next;
        drop(Box::from_raw(old_head));
        *head_slot = first;
        match (*first).item.take() {
            Some(item) => item,
            None => unreachable!("non-sentinel queue node without an item"),
        }
    }

    fn signal_not_empty(&self) {
        self.take_lock.lock();
        let signalled = self.not_empty.signal();
        debug_assert!(signalled.is_ok());
        unlock(&self.take_lock);
    }

    fn signal_not_full(&self) {
        self.put_lock.lock();
        let signalled = self.not_full.signal();
        debug_assert!(signalled.is_ok());
        unlock(&self.put_lock);
    }

    fn fully_lock(&self) {
        self.put_lock.lock();
        self.take_lock.lock();
    }

    fn fully_unlock(&self) {
        unlock(&self.take_lock);
        unlock(&self.put_lock);
    }

    /// Insert, blocking while the queue is full. On
    /// [`Error::Interrupted`](crate::Error::Interrupted) the element was
    /// not enqueued and is dropped.
    pub fn put(&self, item: T) -> Result<()> {
        self.put_lock.lock_interruptibly()?;
        let result = (|| {
            while self.count.load(Ordering::SeqCst) == self.capacity {
                self.not_full.await_()?;
            }
            unsafe { self.enqueue(Node::alloc(Some(item))) };
            let c = self.count.fetch_add(1, Ordering::SeqCst);
            if c + 1 < self.capacity {
                let signalled = self.not_full.signal();
                debug_assert!(signalled.is_ok());
            }
            Ok(c)
        })();
        unlock(&self.put_lock);
        let c = result?;
        if c == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Insert only if the queue has room; the element comes back in `Err`
    /// when it does not.
    pub fn offer(&self, item: T) -> core::result::Result<(), T> {
        if self.count.load(Ordering::SeqCst) == self.capacity {
            return Err(item);
        }
        self.put_lock.lock();
        let outcome = if self.count.load(Ordering::SeqCst) < self.capacity {
            unsafe { self.enqueue(Node::alloc(Some(item))) };
            let c = self.count.fetch_add(1, Ordering::SeqCst);
            if c + 1 < self.capacity {
                let signalled = self.not_full.signal();
                debug_assert!(signalled.is_ok());
            }
            Ok(c)
        } else {
            Err(item)
        };
        unlock(&self.put_lock);
        match outcome {
            Ok(c) => {
                if c == 0 {
                    self.signal_not_empty();
                }
                Ok(())
            }
            Err(item) => Err(item),
        }
    }

    /// Insert, waiting up to `timeout` for room. `Ok(Err(item))` hands the
    /// element back when the deadline passes.
    pub fn offer_for(
        &self,
        item: T,
        timeout: Duration,
    ) -> Result<core::result::Result<(), T>> {
        let deadline = Instant::now() + timeout;
        self.put_lock.lock_interruptibly()?;
        let result = (|| {
            loop {
                if self.count.load(Ordering::SeqCst) < self.capacity {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Err(item));
                }
                self.not_full.await_for(deadline - now)?;
            }
            unsafe { self.enqueue(Node::alloc(Some(item))) };
            let c = self.count.fetch_add(1, Ordering::SeqCst);
            if c + 1 < self.capacity {
                let signalled = self.not_full.signal();
                debug_assert!(signalled.is_ok());
            }
            Ok(Ok(c))
        })();
        unlock(&self.put_lock);
        match result? {
            Ok(c) => {
                if c == 0 {
                    self.signal_not_empty();
                }
                Ok(Ok(()))
            }
            Err(item) => Ok(Err(item)),
        }
    }

    /// Remove the head, blocking while the queue is empty.
    pub fn take(&self) -> Result<T> {
        self.take_lock.lock_interruptibly()?;
        let result = (|| {
            while self.count.load(Ordering::SeqCst) == 0 {
                self.not_empty.await_()?;
            }
            let item = unsafe { self.dequeue() };
            let c = self.count.fetch_sub(1, Ordering::SeqCst);
            if c > 1 {
                let signalled = self.not_empty.signal();
                debug_assert!(signalled.is_ok());
            }
            Ok((item, c))
        })();
        unlock(&self.take_lock);
        let (item, c) = result?;
        if c == self.capacity {
            self.signal_not_full();
        }
        Ok(item)
    }

    /// Remove the head if one is present.
    pub fn poll(&self) -> Option<T> {
        if self.count.load(Ordering::SeqCst) == 0 {
            return None;
        }
        self.take_lock.lock();
        let outcome = if self.count.load(Ordering::SeqCst) > 0 {
            let item = unsafe { self.dequeue() };
            let c = self.count.fetch_sub(1, Ordering::SeqCst);
            if c > 1 {
                let signalled = self.not_empty.signal();
                debug_assert!(signalled.is_ok());
            }
            Some((item, c))
        } else {
            None
        };
        unlock(&self.take_lock);
        outcome.map(|(item, c)| {
            if c == self.capacity {
                self.signal_not_full();
            }
            item
        })
    }

    /// Remove the head, waiting up to `timeout` for an element.
    pub fn poll_for(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        self.take_lock.lock_interruptibly()?;
        let result = (|| {
            loop {
                if self.count.load(Ordering::SeqCst) > 0 {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                self.not_empty.await_for(deadline - now)?;
            }
            let item = unsafe { self.dequeue() };
            let c = self.count.fetch_sub(1, Ordering::SeqCst);
            if c > 1 {
                let signalled = self.not_empty.signal();
                debug_assert!(signalled.is_ok());
            }
            Ok(Some((item, c)))
        })();
        unlock(&self.take_lock);
        match result? {
            Some((item, c)) => {
                if c == self.capacity {
                    self.signal_not_full();
                }
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Move up to `max` elements into `sink`, holding only the take lock.
    /// Returns the number moved.
    pub fn drain_to_limit(&self, sink: &mut Vec<T>, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        self.take_lock.lock();
        let mut wake_putters = false;
        let n = max.min(self.count.load(Ordering::SeqCst));
        for _ in 0..n {
            sink.push(unsafe { self.dequeue() });
        }
        if n > 0 {
            let c = self.count.fetch_sub(n, Ordering::SeqCst);
            wake_putters = c == self.capacity;
        }
        unlock(&self.take_lock);
        if wake_putters {
            self.signal_not_full();
        }
        n
    }

    /// Move every element into `sink`.
    pub fn drain_to(&self, sink: &mut Vec<T>) -> usize {
        self.drain_to_limit(sink, usize::MAX)
    }

    /// Discard every element. Signals one waiting putter when the queue
    /// was full.
    pub fn clear(&self) {
        self.fully_lock();
        unsafe {
            let head = *self.head.get();
            let mut p = (*head).next;
            (*head).next = ptr::null_mut();
            *self.last.get() = head;
            while !p.is_null() {
                let next = (*p).next;
                drop(Box::from_raw(p));
                p = next;
            }
        }
        let c = self.count.swap(0, Ordering::SeqCst);
        if c == self.capacity {
            let signalled = self.not_full.signal();
            debug_assert!(signalled.is_ok());
        }
        self.fully_unlock();
    }
}

impl<T: Clone> LinkedBlockingQueue<T> {
    /// The head element without removing it.
    pub fn peek(&self) -> Option<T> {
        if self.count.load(Ordering::SeqCst) == 0 {
            return None;
        }
        self.take_lock.lock();
        let item = unsafe {
            let first = (**self.head.get()).next;
            if first.is_null() {
                None
            } else {
                (*first).item.clone()
            }
        };
        unlock(&self.take_lock);
        item
    }

    /// Copy the contents in queue order, holding both locks.
    pub fn to_vec(&self) -> Vec<T> {
        self.fully_lock();
        let mut out = Vec::with_capacity(self.count.load(Ordering::SeqCst));
        unsafe {
            let mut p = (**self.head.get()).next;
            while !p.is_null() {
                if let Some(item) = (*p).item.clone() {
                    out.push(item);
                }
                p = (*p).next;
            }
        }
        self.fully_unlock();
        out
    }

    /// Iterate over a fully-locked snapshot of the queue.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        self.to_vec().into_iter()
    }
}

impl<T: PartialEq> LinkedBlockingQueue<T> {
    /// Whether any element equals `item`, holding both locks.
    pub fn contains(&self, item: &T) -> bool {
        self.fully_lock();
        let found = unsafe {
            let mut p = (**self.head.get()).next;
            loop {
                if p.is_null() {
                    break false;
                }
                if (*p).item.as_ref() == Some(item) {
                    break true;
                }
                p = (*p).next;
            }
        };
        self.fully_unlock();
        found
    }

    /// Remove the first element equal to `item`, holding both locks.
    pub fn remove(&self, item: &T) -> bool {
        self.fully_lock();
        let mut wake_putters = false;
        let removed = unsafe {
            let mut trail = *self.head.get();
            let mut p = (*trail).next;
            loop {
                if p.is_null() {
                    break false;
                }
                if (*p).item.as_ref() == Some(item) {
                    (*trail).next = (*p).next;
                    if *self.last.get() == p {
                        *self.last.get() = trail;
                    }
                    drop(Box::from_raw(p));
                    let c = self.count.fetch_sub(1, Ordering::SeqCst);
                    wake_putters = c == self.capacity;
                    break true;
                }
                trail = p;
                p = (*p).next;
            }
        };
        if wake_putters {
            let signalled = self.not_full.signal();
            debug_assert!(signalled.is_ok());
        }
        self.fully_unlock();
        removed
    }
}

impl<T> Drop for LinkedBlockingQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let mut p = *self.head.get();
            while !p.is_null() {
                let next = (*p).next;
                drop(Box::from_raw(p));
                p = next;
            }
        }
    }
}

impl<T> fmt::Debug for LinkedBlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedBlockingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::thread::Thread;
    use static_assertions::assert_impl_all;
    use std::sync::mpsc;
    use std::sync::Arc;

    assert_impl_all!(LinkedBlockingQueue<String>: Send, Sync);

    #[test]
    fn test_put_take_serial() {
        let q = LinkedBlockingQueue::with_capacity(4);
        q.put(1).unwrap();
        q.put(2).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.take().unwrap(), 1);
        assert_eq!(q.take().unwrap(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let q = LinkedBlockingQueue::new();
        for i in 0..100 {
            q.put(i).unwrap();
        }
        for i in 0..100 {
            assert_eq!(q.take().unwrap(), i);
        }
    }

    #[test]
    fn test_offer_full_returns_item() {
        let q = LinkedBlockingQueue::with_capacity(1);
        assert!(q.offer(1).is_ok());
        assert_eq!(q.offer(2), Err(2));
        assert_eq!(q.remaining_capacity(), 0);
        assert_eq!(q.poll(), Some(1));
        assert!(q.offer(3).is_ok());
    }

    #[test]
    fn test_poll_empty() {
        let q: LinkedBlockingQueue<i32> = LinkedBlockingQueue::with_capacity(1);
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn test_poll_for_times_out() {
        let q: LinkedBlockingQueue<i32> = LinkedBlockingQueue::with_capacity(1);
        let got = q.poll_for(Duration::from_millis(30)).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_offer_for_times_out_and_returns_item() {
        let q = LinkedBlockingQueue::with_capacity(1);
        q.put(1).unwrap();
        let outcome = q.offer_for(2, Duration::from_millis(30)).unwrap();
        assert_eq!(outcome, Err(2));
    }

    #[test]
    fn test_backpressure_unblocks_put() {
        let q = Arc::new(LinkedBlockingQueue::with_capacity(2));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            q2.put(1).unwrap();
            q2.put(2).unwrap();
            // Queue is full here; this put must block until a take.
            q2.put(3).unwrap();
        });

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(q.take().unwrap(), 1);
        handle.join().unwrap();
        assert_eq!(q.to_vec(), vec![2, 3]);
        assert_eq!(q.take().unwrap(), 2);
        assert_eq!(q.to_vec(), vec![3]);
    }

    #[test]
    fn test_take_blocks_until_put() {
        let q: Arc<LinkedBlockingQueue<i32>> = Arc::new(LinkedBlockingQueue::with_capacity(1));
        let q2 = q.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let item = q2.take().unwrap();
            tx.send(item).unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
        q.put(42).unwrap();
        assert_eq!(rx.recv().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_interrupt_during_take() {
        let q: Arc<LinkedBlockingQueue<i32>> = Arc::new(LinkedBlockingQueue::with_capacity(1));
        let q2 = q.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            tx.send(Thread::current()).unwrap();
            q2.take()
        });
        let taker = rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        taker.interrupt();
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
        // The queue still works after the cancelled take.
        q.put(1).unwrap();
        assert_eq!(q.take().unwrap(), 1);
    }

    #[test]
    fn test_remove_interior_and_tail() {
        let q = LinkedBlockingQueue::with_capacity(4);
        q.put(1).unwrap();
        q.put(2).unwrap();
        q.put(3).unwrap();

        assert!(q.remove(&2));
        assert!(!q.remove(&2));
        assert_eq!(q.to_vec(), vec![1, 3]);

        // Removing the tail must re-point `last` so puts still work.
        assert!(q.remove(&3));
        q.put(4).unwrap();
        assert_eq!(q.to_vec(), vec![1, 4]);
    }

    #[test]
    fn test_remove_full_queue_wakes_putter() {
        let q = Arc::new(LinkedBlockingQueue::with_capacity(1));
        q.put(1).unwrap();
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.put(2));
        std::thread::sleep(Duration::from_millis(10));
        assert!(q.remove(&1));
        handle.join().unwrap().unwrap();
        assert_eq!(q.to_vec(), vec![2]);
    }

    #[test]
    fn test_clear_wakes_putter() {
        let q = Arc::new(LinkedBlockingQueue::with_capacity(2));
        q.put(1).unwrap();
        q.put(2).unwrap();
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.put(3));
        std::thread::sleep(Duration::from_millis(10));
        q.clear();
        handle.join().unwrap().unwrap();
        assert_eq!(q.to_vec(), vec![3]);
    }

    #[test]
    fn test_drain_to() {
        let q = LinkedBlockingQueue::with_capacity(8);
        for i in 0..5 {
            q.put(i).unwrap();
        }
        let mut sink = Vec::new();
        assert_eq!(q.drain_to_limit(&mut sink, 3), 3);
        assert_eq!(sink, vec![0, 1, 2]);
        assert_eq!(q.len(), 2);
        assert_eq!(q.drain_to(&mut sink), 2);
        assert_eq!(sink, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_peek_and_contains() {
        let q = LinkedBlockingQueue::with_capacity(4);
        assert_eq!(q.peek(), None);
        q.put("a").unwrap();
        q.put("b").unwrap();
        assert_eq!(q.peek(), Some("a"));
        assert_eq!(q.len(), 2);
        assert!(q.contains(&"b"));
        assert!(!q.contains(&"c"));
    }

    #[test]
    fn test_producer_consumer_stress() {
        const PRODUCERS: usize = 3;
        const PER_PRODUCER: usize = 1000;
        let q: Arc<LinkedBlockingQueue<usize>> = Arc::new(LinkedBlockingQueue::with_capacity(8));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.put(p * PER_PRODUCER + i).unwrap();
                }
            }));
        }

        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let mut sum = 0usize;
                for _ in 0..PRODUCERS * PER_PRODUCER {
                    sum += q.take().unwrap();
                }
                sum
            })
        };

        for h in producers {
            h.join().unwrap();
        }
        let expected: usize = (0..PRODUCERS * PER_PRODUCER).sum();
        assert_eq!(consumer.join().unwrap(), expected);
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn test_zero_capacity_panics() {
        let _ = LinkedBlockingQueue::<i32>::with_capacity(0);
    }
}
