//! Copy-on-write list: snapshot readers, mutation under a lock.
//!
//! A single atomically-published array reference plus a writer lock. Every
//! mutation clones the current array, edits the copy, and publishes the new
//! reference; readers and iterators hold the reference they loaded and are
//! immune to later changes. Suited to read-mostly collections such as
//! listener registries.
//!
//! Failed mutations never republish the array, so a [`sub_list`]
//! (CopyOnWriteList::sub_list) view can detect real changes by comparing
//! array identities.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::{Error, Result};
use crate::lock::ReentrantLock;

fn unlock(lock: &ReentrantLock) {
    let released = lock.unlock();
    debug_assert!(released.is_ok());
}

/// A list whose readers observe an immutable snapshot.
pub struct CopyOnWriteList<T> {
    lock: ReentrantLock,
    array: ArcSwap<Vec<T>>,
}

impl<T> CopyOnWriteList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        CopyOnWriteList {
            lock: ReentrantLock::new(),
            array: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// The current snapshot. The returned array never changes.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.array.load_full()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.array.load().len()
    }

    /// Whether the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> CopyOnWriteList<T> {
    /// The element at `index`, if in bounds.
    pub fn get(&self, index: usize) -> Option<T> {
        self.array.load().get(index).cloned()
    }

    /// The first element, if any.
    pub fn first(&self) -> Option<T> {
        self.array.load().first().cloned()
    }

    /// The last element, if any.
    pub fn last(&self) -> Option<T> {
        self.array.load().last().cloned()
    }

    /// Copy the current contents.
    pub fn to_vec(&self) -> Vec<T> {
        (*self.snapshot()).clone()
    }

    /// Append an element.
    pub fn add(&self, element: T) {
        self.lock.lock();
        let mut new = (*self.array.load_full()).clone();
        new.push(element);
        self.array.store(Arc::new(new));
        unlock(&self.lock);
    }

    /// Insert an element at `index`, shifting the suffix.
    pub fn insert(&self, index: usize, element: T) -> Result<()> {
        self.lock.lock();
        let current = self.array.load_full();
        let result = if index > current.len() {
            Err(Error::IndexOutOfBounds {
                index,
                len: current.len(),
            })
        } else {
            let mut new = (*current).clone();
            new.insert(index, element);
            self.array.store(Arc::new(new));
            Ok(())
        };
        unlock(&self.lock);
        result
    }

    /// Append every element from `iter`.
    pub fn add_all<I: IntoIterator<Item = T>>(&self, iter: I) {
        self.lock.lock();
        let mut new = (*self.array.load_full()).clone();
        new.extend(iter);
        self.array.store(Arc::new(new));
        unlock(&self.lock);
    }

    /// Replace the element at `index`, returning the old one.
    pub fn set(&self, index: usize, element: T) -> Result<T> {
        self.lock.lock();
        let current = self.array.load_full();
        let result = if index >= current.len() {
            Err(Error::IndexOutOfBounds {
                index,
                len: current.len(),
            })
        } else {
            let mut new = (*current).clone();
            let old = std::mem::replace(&mut new[index], element);
            self.array.store(Arc::new(new));
            Ok(old)
        };
        unlock(&self.lock);
        result
    }

    /// Remove and return the element at `index`.
    pub fn remove_index(&self, index: usize) -> Result<T> {
        self.lock.lock();
        let current = self.array.load_full();
        let result = if index >= current.len() {
            Err(Error::IndexOutOfBounds {
                index,
                len: current.len(),
            })
        } else {
            let mut new = (*current).clone();
            let old = new.remove(index);
            self.array.store(Arc::new(new));
            Ok(old)
        };
        unlock(&self.lock);
        result
    }

    /// Remove every element.
    pub fn clear(&self) {
        self.lock.lock();
        self.array.store(Arc::new(Vec::new()));
        unlock(&self.lock);
    }

    /// Iterate over a frozen snapshot. Later mutations are invisible; the
    /// iterator supports no removal or insertion.
    pub fn iter(&self) -> CowIter<T> {
        CowIter {
            snapshot: self.snapshot(),
            index: 0,
        }
    }

    /// Bidirectional cursor over a frozen snapshot, starting at `index`
    /// (which may equal the length to start at the end).
    pub fn list_iter(&self, index: usize) -> Result<ListIter<T>> {
        let snapshot = self.snapshot();
        if index > snapshot.len() {
            return Err(Error::IndexOutOfBounds {
                index,
                len: snapshot.len(),
            });
        }
        Ok(ListIter {
            snapshot,
            cursor: index,
        })
    }

    /// A view of `[from, to)` that fails with
    /// [`Error::ConcurrentModification`] once the parent's array changes
    /// beneath it.
    pub fn sub_list(&self, from: usize, to: usize) -> Result<SubList<'_, T>> {
        let snapshot = self.snapshot();
        if from > to || to > snapshot.len() {
            return Err(Error::IndexOutOfBounds {
                index: to,
                len: snapshot.len(),
            });
        }
        Ok(SubList {
            list: self,
            expected: snapshot,
            offset: from,
            len: to - from,
        })
    }
}

impl<T: Clone + PartialEq> CopyOnWriteList<T> {
    /// Whether any element equals `element`.
    pub fn contains(&self, element: &T) -> bool {
        self.array.load().contains(element)
    }

    /// Index of the first element equal to `element`.
    pub fn index_of(&self, element: &T) -> Option<usize> {
        self.array.load().iter().position(|e| e == element)
    }

    /// Index of the last element equal to `element`.
    pub fn last_index_of(&self, element: &T) -> Option<usize> {
        self.array.load().iter().rposition(|e| e == element)
    }

    /// Append `element` only when no equal element is present. Returns
    /// whether the list changed.
    pub fn add_if_absent(&self, element: T) -> bool {
        self.lock.lock();
        let current = self.array.load_full();
        let added = if current.contains(&element) {
            false
        } else {
            let mut new = (*current).clone();
            new.push(element);
            self.array.store(Arc::new(new));
            true
        };
        unlock(&self.lock);
        added
    }

    /// Append each element from `iter` that is absent, in order. Returns
    /// how many were added.
    pub fn add_all_absent<I: IntoIterator<Item = T>>(&self, iter: I) -> usize {
        self.lock.lock();
        let current = self.array.load_full();
        let mut new = (*current).clone();
        let before = new.len();
        for element in iter {
            if !new.contains(&element) {
                new.push(element);
            }
        }
        let added = new.len() - before;
        if added > 0 {
            self.array.store(Arc::new(new));
        }
        unlock(&self.lock);
        added
    }

    /// Remove the first element equal to `element`. Returns whether the
    /// list changed.
    pub fn remove(&self, element: &T) -> bool {
        self.lock.lock();
        let current = self.array.load_full();
        let removed = match current.iter().position(|e| e == element) {
            Some(index) => {
                let mut new = (*current).clone();
                new.remove(index);
                self.array.store(Arc::new(new));
                true
            }
            None => false,
        };
        unlock(&self.lock);
        removed
    }

    /// Remove every element equal to one in `elements`. Returns whether
    /// the list changed.
    pub fn remove_all(&self, elements: &[T]) -> bool {
        self.lock.lock();
        let current = self.array.load_full();
        let new: Vec<T> = current
            .iter()
            .filter(|e| !elements.contains(e))
            .cloned()
            .collect();
        let changed = new.len() != current.len();
        if changed {
            self.array.store(Arc::new(new));
        }
        unlock(&self.lock);
        changed
    }

    /// Keep only elements equal to one in `elements`. Returns whether the
    /// list changed.
    pub fn retain_all(&self, elements: &[T]) -> bool {
        self.lock.lock();
        let current = self.array.load_full();
        let new: Vec<T> = current
            .iter()
            .filter(|e| elements.contains(e))
            .cloned()
            .collect();
        let changed = new.len() != current.len();
        if changed {
            self.array.store(Arc::new(new));
        }
        unlock(&self.lock);
        changed
    }
}

impl<T> Default for CopyOnWriteList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FromIterator<T> for CopyOnWriteList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        CopyOnWriteList {
            lock: ReentrantLock::new(),
            array: ArcSwap::from_pointee(iter.into_iter().collect()),
        }
    }
}

impl<T: Clone> Extend<T> for CopyOnWriteList<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.add_all(iter);
    }
}

impl<T: fmt::Debug> fmt::Debug for CopyOnWriteList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.array.load().iter()).finish()
    }
}

impl<T: PartialEq> PartialEq for CopyOnWriteList<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.array.load_full() == *other.array.load_full()
    }
}

/// Snapshot iterator over a [`CopyOnWriteList`].
pub struct CowIter<T> {
    snapshot: Arc<Vec<T>>,
    index: usize,
}

impl<T: Clone> Iterator for CowIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.snapshot.get(self.index).cloned()?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for CowIter<T> {}

/// Bidirectional snapshot cursor over a [`CopyOnWriteList`].
pub struct ListIter<T> {
    snapshot: Arc<Vec<T>>,
    cursor: usize,
}

impl<T: Clone> ListIter<T> {
    /// Whether a forward step has an element.
    pub fn has_next(&self) -> bool {
        self.cursor < self.snapshot.len()
    }

    /// The next element, stepping forward.
    pub fn next(&mut self) -> Option<T> {
        let item = self.snapshot.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(item)
    }

    /// Whether a backward step has an element.
    pub fn has_previous(&self) -> bool {
        self.cursor > 0
    }

    /// The previous element, stepping backward.
    pub fn previous(&mut self) -> Option<T> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.snapshot.get(self.cursor).cloned()
    }

    /// Index a forward step would return.
    pub fn next_index(&self) -> usize {
        self.cursor
    }

    /// Index a backward step would return, or `None` at the start.
    pub fn previous_index(&self) -> Option<usize> {
        self.cursor.checked_sub(1)
    }
}

/// A range view of a [`CopyOnWriteList`] that detects parent mutation.
///
/// Every operation first verifies that the parent still publishes the array
/// the view was created against and reports
/// [`Error::ConcurrentModification`] otherwise. The view's own mutations
/// re-anchor it to the array they publish.
pub struct SubList<'a, T> {
    list: &'a CopyOnWriteList<T>,
    expected: Arc<Vec<T>>,
    offset: usize,
    len: usize,
}

impl<T: Clone> SubList<'_, T> {
    fn check(&self) -> Result<()> {
        if Arc::ptr_eq(&self.expected, &self.list.array.load_full()) {
            Ok(())
        } else {
            Err(Error::ConcurrentModification)
        }
    }

    /// Number of elements in the view.
    pub fn len(&self) -> Result<usize> {
        self.check()?;
        Ok(self.len)
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The element at `index` within the view.
    pub fn get(&self, index: usize) -> Result<T> {
        self.check()?;
        if index >= self.len {
            return Err(Error::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        Ok(self.expected[self.offset + index].clone())
    }

    /// Replace the element at `index` within the view, writing through to
    /// the parent list.
    pub fn set(&mut self, index: usize, element: T) -> Result<T> {
        if index >= self.len {
            return Err(Error::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        self.list.lock.lock();
        let result = (|| {
            self.check()?;
            let mut new = (*self.expected).clone();
            let old = std::mem::replace(&mut new[self.offset + index], element);
            let new = Arc::new(new);
            self.list.array.store(new.clone());
            self.expected = new;
            Ok(old)
        })();
        unlock(&self.list.lock);
        result
    }

    /// Copy the view's contents.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.check()?;
        Ok(self.expected[self.offset..self.offset + self.len].to_vec())
    }

    /// Iterate over the view's frozen contents.
    pub fn iter(&self) -> Result<std::vec::IntoIter<T>> {
        Ok(self.to_vec()?.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(CopyOnWriteList<String>: Send, Sync);

    #[test]
    fn test_add_get() {
        let list = CopyOnWriteList::new();
        list.add(1);
        list.add(2);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0), Some(1));
        assert_eq!(list.get(1), Some(2));
        assert_eq!(list.get(2), None);
        assert_eq!(list.first(), Some(1));
        assert_eq!(list.last(), Some(2));
    }

    #[test]
    fn test_iterator_isolated_from_writes() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3]);

        let iter = list.iter();
        list.add(4);

        assert_eq!(iter.collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_insert_and_bounds() {
        let list = CopyOnWriteList::new();
        list.add(1);
        list.add(3);
        list.insert(1, 2).unwrap();
        assert_eq!(list.to_vec(), vec![1, 2, 3]);
        assert_eq!(
            list.insert(5, 9),
            Err(Error::IndexOutOfBounds { index: 5, len: 3 })
        );
    }

    #[test]
    fn test_set_returns_old() {
        let list = CopyOnWriteList::new();
        list.add("a");
        assert_eq!(list.set(0, "b").unwrap(), "a");
        assert_eq!(list.get(0), Some("b"));
        assert!(matches!(
            list.set(3, "c"),
            Err(Error::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_remove_by_index_and_value() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3, 2]);
        assert_eq!(list.remove_index(0).unwrap(), 1);
        assert!(list.remove(&2));
        assert_eq!(list.to_vec(), vec![3, 2]);
        assert!(!list.remove(&9));
    }

    #[test]
    fn test_add_if_absent() {
        let list = CopyOnWriteList::new();
        assert!(list.add_if_absent(1));
        assert!(!list.add_if_absent(1));
        assert_eq!(list.add_all_absent([1, 2, 3, 2]), 2);
        assert_eq!(list.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_all_retain_all() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3, 4, 5]);
        assert!(list.remove_all(&[2, 4]));
        assert_eq!(list.to_vec(), vec![1, 3, 5]);
        assert!(list.retain_all(&[3, 5]));
        assert_eq!(list.to_vec(), vec![3, 5]);
        assert!(!list.retain_all(&[3, 5]));
    }

    #[test]
    fn test_index_of() {
        let list = CopyOnWriteList::new();
        list.add_all(["a", "b", "a"]);
        assert_eq!(list.index_of(&"a"), Some(0));
        assert_eq!(list.last_index_of(&"a"), Some(2));
        assert_eq!(list.index_of(&"z"), None);
        assert!(list.contains(&"b"));
    }

    #[test]
    fn test_clear() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3]);
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn test_list_iter_bidirectional() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3]);
        let mut it = list.list_iter(0).unwrap();
        assert!(it.has_next());
        assert_eq!(it.next(), Some(1));
        assert_eq!(it.next(), Some(2));
        assert_eq!(it.previous(), Some(2));
        assert_eq!(it.next_index(), 1);
        assert_eq!(it.previous_index(), Some(0));

        let mut tail = list.list_iter(3).unwrap();
        assert!(!tail.has_next());
        assert_eq!(tail.previous(), Some(3));

        assert!(list.list_iter(4).is_err());
    }

    #[test]
    fn test_sub_list_reads_and_writes() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3, 4, 5]);
        let mut view = list.sub_list(1, 4).unwrap();
        assert_eq!(view.len().unwrap(), 3);
        assert_eq!(view.get(0).unwrap(), 2);
        assert_eq!(view.to_vec().unwrap(), vec![2, 3, 4]);

        // The view's own write re-anchors it.
        assert_eq!(view.set(1, 9).unwrap(), 3);
        assert_eq!(view.get(1).unwrap(), 9);
        assert_eq!(list.to_vec(), vec![1, 2, 9, 4, 5]);
    }

    #[test]
    fn test_sub_list_detects_parent_mutation() {
        let list = CopyOnWriteList::new();
        list.add_all([1, 2, 3]);
        let view = list.sub_list(0, 2).unwrap();
        list.add(4);
        assert_eq!(view.get(0), Err(Error::ConcurrentModification));
        assert_eq!(view.len(), Err(Error::ConcurrentModification));
    }

    #[test]
    fn test_eq_and_debug() {
        let a: CopyOnWriteList<i32> = [1, 2].into_iter().collect();
        let b: CopyOnWriteList<i32> = [1, 2].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(format!("{a:?}"), "[1, 2]");
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let list: std::sync::Arc<CopyOnWriteList<usize>> =
            std::sync::Arc::new(CopyOnWriteList::new());
        let mut handles = Vec::new();
        for t in 0..2 {
            let list = list.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    list.add(t * 1000 + i);
                }
            }));
        }
        for _ in 0..2 {
            let list = list.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    // Snapshots are internally consistent at all times.
                    let snap = list.snapshot();
                    let len = snap.len();
                    assert_eq!(snap.iter().count(), len);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.len(), 400);
    }
}
