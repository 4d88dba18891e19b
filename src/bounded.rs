//! Fixed-capacity vector.
//!
//! [`BoundedVec`] is the container every launcher collection is built on.
//! It allocates its full capacity up front and refuses to grow beyond it:
//! operations that would exceed the bound return [`Error::NoMemory`] and
//! leave the contents untouched.
//!
//! Borrowed views are plain slices ([`BoundedVec::as_slice`]), so a view can
//! never outlive the vector that owns the items.

use crate::error::{Error, Result};
use std::ops::Deref;

/// Vector with a hard capacity bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T> {
    items: Vec<T>,
    capacity: usize,
    what: &'static str,
}

impl<T> BoundedVec<T> {
    /// Creates an empty vector holding at most `capacity` items.
    ///
    /// `what` names the collection in capacity errors.
    pub fn new(what: &'static str, capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            what,
        }
    }

    /// Builds a bounded vector from a slice, failing if it does not fit.
    pub fn from_slice(what: &'static str, capacity: usize, items: &[T]) -> Result<Self>
    where
        T: Clone,
    {
        let mut v = Self::new(what, capacity);
        v.extend_from_slice(items)?;
        Ok(v)
    }

    /// Returns the capacity bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if no more items fit.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Appends an item.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.is_full() {
            return Err(self.no_memory());
        }
        self.items.push(item);
        Ok(())
    }

    /// Appends all items of a slice, or none of them if they do not fit.
    pub fn extend_from_slice(&mut self, items: &[T]) -> Result<()>
    where
        T: Clone,
    {
        if self.items.len() + items.len() > self.capacity {
            return Err(self.no_memory());
        }
        self.items.extend_from_slice(items);
        Ok(())
    }

    /// Returns the first item matching the predicate.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.items.iter().find(|item| pred(item))
    }

    /// Returns a mutable reference to the first item matching the predicate.
    pub fn find_mut(&mut self, pred: impl Fn(&T) -> bool) -> Option<&mut T> {
        self.items.iter_mut().find(|item| pred(item))
    }

    /// Removes and returns the first item matching the predicate.
    pub fn remove_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let pos = self.items.iter().position(pred)?;
        Some(self.items.remove(pos))
    }

    /// Keeps only the items matching the predicate.
    pub fn retain(&mut self, pred: impl FnMut(&T) -> bool) {
        self.items.retain(pred);
    }

    /// Sorts in place with a key extractor.
    pub fn sort_by_key<K: Ord>(&mut self, f: impl FnMut(&T) -> K) {
        self.items.sort_by_key(f);
    }

    /// Removes all items, keeping the capacity.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Returns a borrowed view of the items.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Consumes the vector and returns its items.
    pub fn into_inner(self) -> Vec<T> {
        self.items
    }

    fn no_memory(&self) -> Error {
        Error::NoMemory {
            what: self.what.to_string(),
            capacity: self.capacity,
        }
    }
}

impl<T> Deref for BoundedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<'a, T> IntoIterator for &'a BoundedVec<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> IntoIterator for BoundedVec<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_until_full() {
        let mut v = BoundedVec::new("numbers", 2);
        v.push(1).unwrap();
        v.push(2).unwrap();
        assert!(v.is_full());

        let err = v.push(3).unwrap_err();
        assert!(matches!(err, Error::NoMemory { capacity: 2, .. }));
        assert_eq!(v.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_extend_is_all_or_nothing() {
        let mut v = BoundedVec::new("numbers", 3);
        v.push(1).unwrap();

        assert!(v.extend_from_slice(&[2, 3, 4]).is_err());
        assert_eq!(v.len(), 1);

        v.extend_from_slice(&[2, 3]).unwrap();
        assert_eq!(v.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_find_and_remove() {
        let mut v = BoundedVec::from_slice("numbers", 4, &[5, 6, 7]).unwrap();

        assert_eq!(v.find(|n| *n > 5), Some(&6));
        assert_eq!(v.remove_first(|n| *n == 6), Some(6));
        assert_eq!(v.remove_first(|n| *n == 6), None);
        assert_eq!(v.as_slice(), &[5, 7]);
    }

    #[test]
    fn test_zero_capacity() {
        let mut v: BoundedVec<u8> = BoundedVec::new("empty", 0);
        assert!(v.is_full());
        assert!(v.push(1).is_err());
        assert!(v.is_empty());
    }
}
