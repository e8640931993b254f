use std::fmt::Debug;
use std::slice;

use crate::BitSet;

pub const SPARSE_MAX: usize = 8;

/// A fixed-size bitset type with a sparse representation and a maximum of
/// `SPARSE_MAX` elements. The elements are stored as a sorted `Vec` with no
/// duplicates.
///
/// This type is used by `HybridBitSet`; do not use directly.
pub struct SparseBitSet<T> {
    pub(crate) elems: Vec<T>,
}

impl<T: Clone> Clone for SparseBitSet<T> {
    fn clone(&self) -> Self {
        Self { elems: self.elems.clone() }
    }

    fn clone_from(&mut self, source: &Self) {
        self.elems.clone_from(&source.elems);
    }
}

impl<T: Debug> Debug for SparseBitSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.elems.iter()).finish()
    }
}

impl<T> SparseBitSet<T> {
    pub fn new_empty() -> Self {
        Self { elems: Vec::with_capacity(SPARSE_MAX) }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn clear(&mut self) {
        self.elems.clear()
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.elems.iter()
    }
}

impl<T: Into<usize> + Copy> SparseBitSet<T> {
    pub fn insert(&mut self, elem: T) -> bool {
        let changed = if let Some(i) = self.elems.iter().position(|&e| e.into() >= elem.into()) {
            if self.elems[i].into() == elem.into() {
                // `elem` is already in the set
                false
            } else {
                // `elem` is smaller than one or more existing elements.
                self.elems.insert(i, elem);
                true
            }
        } else {
            // `elem` is larger than all existing elements.
            self.elems.push(elem);
            true
        };
        debug_assert!(self.len() <= SPARSE_MAX);
        changed
    }

    pub fn remove(&mut self, elem: T) -> bool {
        if let Some(i) = self.elems.iter().position(|&e| e.into() == elem.into()) {
            self.elems.remove(i);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, elem: T) -> bool {
        self.elems.iter().any(|&e| e.into() == elem.into())
    }
}

impl<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> SparseBitSet<T> {
    pub fn to_dense(&self, domain_size: usize) -> BitSet<T> {
        let mut dense = BitSet::new_empty(domain_size);
        for &elem in &self.elems {
            dense.insert(elem);
        }
        dense
    }

    /// Union into a dense set; returns `true` if `dense` changed.
    pub fn union_into(&self, dense: &mut BitSet<T>) -> bool {
        let mut changed = false;
        for &elem in &self.elems {
            changed |= dense.insert(elem);
        }
        changed
    }

    /// Subtract from a dense set; returns `true` if `dense` changed.
    pub fn subtract_from(&self, dense: &mut BitSet<T>) -> bool {
        let mut changed = false;
        for &elem in &self.elems {
            changed |= dense.remove(elem);
        }
        changed
    }
}
