use std::fmt::{self, Debug};

use crate::sparse::SPARSE_MAX;
use crate::{BitIter, BitSet, SparseBitSet};

/// A bitset with a mixed representation, using `SparseBitSet` for small and
/// `BitSet` for large sets.
///
/// This type is especially efficient for sets that typically have a small
/// number of elements, but a large `domain_size`, and are cleared frequently.
///
/// `T` is an index type, typically a newtyped `u32` IR entity.
pub enum HybridBitSet<T> {
    Sparse(SparseBitSet<T>),
    Dense(BitSet<T>),
}

impl<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> Clone for HybridBitSet<T> {
    fn clone(&self) -> Self {
        match self {
            HybridBitSet::Sparse(set) => HybridBitSet::Sparse(set.clone()),
            HybridBitSet::Dense(set) => HybridBitSet::Dense(set.clone()),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        match (self, source) {
            (HybridBitSet::Sparse(dst), HybridBitSet::Sparse(src)) => dst.clone_from(src),
            (HybridBitSet::Dense(dst), HybridBitSet::Dense(src)) => dst.clone_from(src),
            (dst, src) => *dst = src.clone(),
        }
    }
}

impl<T> Default for HybridBitSet<T> {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> fmt::Debug for HybridBitSet<T> {
    fn fmt(&self, w: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sparse(set) => set.fmt(w),
            Self::Dense(set) => set.fmt(w),
        }
    }
}

impl<T> HybridBitSet<T> {
    pub const fn new_empty() -> Self {
        HybridBitSet::Sparse(SparseBitSet { elems: Vec::new() })
    }
}

impl<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> HybridBitSet<T> {
    pub fn clear(&mut self) {
        *self = HybridBitSet::new_empty();
    }

    pub fn contains(&self, elem: T) -> bool {
        match self {
            HybridBitSet::Sparse(sparse) => sparse.contains(elem),
            HybridBitSet::Dense(dense) => dense.contains(elem),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            HybridBitSet::Sparse(sparse) => sparse.is_empty(),
            HybridBitSet::Dense(dense) => dense.is_empty(),
        }
    }

    /// Insert an element into the set, growing a dense representation if
    /// `elem` lies outside its current domain.
    pub fn insert_growable(&mut self, elem: T, domain_size: usize) -> bool {
        if let HybridBitSet::Dense(dense) = self {
            dense.ensure(elem.into() + 1);
        }
        self.insert(elem, domain_size)
    }

    pub fn insert(&mut self, elem: T, domain_size: usize) -> bool {
        match self {
            HybridBitSet::Sparse(sparse) if sparse.len() < SPARSE_MAX => {
                // The set is sparse and has space for `elem`.
                sparse.insert(elem)
            }
            HybridBitSet::Sparse(sparse) if sparse.contains(elem) => {
                // The set is sparse and does not have space for `elem`, but
                // that doesn't matter because `elem` is already present.
                false
            }
            HybridBitSet::Sparse(sparse) => {
                // The set is sparse and full. The element cannot be inserted
                // as a sparse element; promote to dense.
                let mut dense = sparse.to_dense(domain_size);
                let changed = dense.insert(elem);
                assert!(changed);
                *self = HybridBitSet::Dense(dense);
                changed
            }
            HybridBitSet::Dense(dense) => dense.insert(elem),
        }
    }

    pub fn remove(&mut self, elem: T) -> bool {
        // Note: we currently don't bother going from Dense back to Sparse.
        match self {
            HybridBitSet::Sparse(sparse) => sparse.remove(elem),
            HybridBitSet::Dense(dense) => dense.remove(elem),
        }
    }

    /// Sets `self = self | other` and returns `true` if `self` changed.
    pub fn union(&mut self, other: &HybridBitSet<T>, domain_size: usize) -> bool {
        match other {
            HybridBitSet::Sparse(other) => {
                let mut changed = false;
                for elem in other.iter() {
                    changed |= self.insert(*elem, domain_size);
                }
                changed
            }
            HybridBitSet::Dense(other) => match self {
                HybridBitSet::Sparse(sparse) => {
                    let mut dense = other.clone();
                    dense.ensure(domain_size);
                    sparse.union_into(&mut dense);
                    // `self` changed iff `other` contributed elements beyond
                    // the old sparse contents.
                    let changed = dense.count() != sparse.len();
                    *self = HybridBitSet::Dense(dense);
                    changed
                }
                HybridBitSet::Dense(dense) => {
                    dense.ensure(other.domain_size());
                    let mut other = other.clone();
                    other.ensure(dense.domain_size());
                    dense.union(&other)
                }
            },
        }
    }

    /// Sets `self = self - other` and returns `true` if `self` changed.
    pub fn subtract(&mut self, other: &HybridBitSet<T>) -> bool {
        match self {
            HybridBitSet::Sparse(sparse) => {
                let mut changed = false;
                sparse.elems.retain(|elem| {
                    let remove = other.contains(*elem);
                    changed |= remove;
                    !remove
                });
                changed
            }
            HybridBitSet::Dense(dense) => {
                let mut changed = false;
                for elem in other.iter() {
                    if elem.into() < dense.domain_size() {
                        changed |= dense.remove(elem);
                    }
                }
                changed
            }
        }
    }

    /// Keep only the elements also contained in `other`.
    pub fn intersect(&mut self, other: &HybridBitSet<T>) {
        match self {
            HybridBitSet::Sparse(sparse) => {
                sparse.elems.retain(|elem| other.contains(*elem));
            }
            HybridBitSet::Dense(dense) => match other {
                HybridBitSet::Sparse(other) => {
                    *self = HybridBitSet::Sparse(SparseBitSet {
                        elems: other.iter().copied().filter(|e| dense.contains(*e)).collect(),
                    });
                }
                HybridBitSet::Dense(other) => {
                    dense.intersect(other);
                }
            },
        }
    }

    pub fn iter(&self) -> HybridIter<'_, T> {
        match self {
            HybridBitSet::Sparse(sparse) => HybridIter::Sparse(sparse.iter()),
            HybridBitSet::Dense(dense) => HybridIter::Dense(dense.iter()),
        }
    }
}

pub enum HybridIter<'a, T: From<usize>> {
    Sparse(std::slice::Iter<'a, T>),
    Dense(BitIter<'a, T>),
}

impl<'a, T: From<usize> + Copy> Iterator for HybridIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self {
            HybridIter::Sparse(sparse) => sparse.next().copied(),
            HybridIter::Dense(dense) => dense.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_to_dense() {
        let mut set: HybridBitSet<usize> = HybridBitSet::new_empty();
        for i in 0..SPARSE_MAX {
            assert!(set.insert(i * 2, 64));
        }
        assert!(matches!(set, HybridBitSet::Sparse(_)));
        assert!(set.insert(63, 64));
        assert!(matches!(set, HybridBitSet::Dense(_)));
        assert_eq!(set.iter().count(), SPARSE_MAX + 1);
        assert!(set.contains(63));
    }

    #[test]
    fn union_and_subtract() {
        let mut a: HybridBitSet<usize> = HybridBitSet::new_empty();
        let mut b: HybridBitSet<usize> = HybridBitSet::new_empty();
        a.insert(1, 32);
        b.insert(1, 32);
        b.insert(9, 32);
        assert!(a.union(&b, 32));
        assert!(!a.union(&b, 32));
        assert!(a.subtract(&b));
        assert!(a.is_empty());
    }
}
