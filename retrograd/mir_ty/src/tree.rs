//! The type lattice: `ConcreteType` scalars and byte-offset `TypeTree`s.
//!
//! A `TypeTree` maps *offset paths* to scalar classifications. The empty
//! path classifies the value itself; a path `[a]` classifies byte `a` of the
//! memory behind the value (which must then be a pointer); `[a, b]`
//! classifies byte `b` behind the pointer stored at byte `a`, and so on. The
//! pseudo-offset `-1` stands for "every offset".

use std::fmt;

use smallvec::SmallVec;

use crate::TypeError;

#[cfg(test)]
mod tests;

/// Byte offset wildcard: the entry applies at every offset.
pub const UNIFORM: i64 = -1;

/// Width of one value slot in bytes; also the stride used when the wildcard
/// offset has to be expanded to concrete offsets.
pub const SLOT: i64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FloatWidth {
    Half,
    Single,
    Double,
    Extended,
    Quad,
}

impl FloatWidth {
    pub fn bytes(self) -> i64 {
        match self {
            FloatWidth::Half => 2,
            FloatWidth::Single => 4,
            FloatWidth::Double => 8,
            FloatWidth::Extended => 10,
            FloatWidth::Quad => 16,
        }
    }
}

/// Scalar classification of one byte range.
///
/// `Anything` is the top of the lattice: compatible with every concrete
/// classification (it arises from zero and undef bit patterns). `Unknown` is
/// the bottom: no information yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConcreteType {
    Unknown,
    Anything,
    Integer,
    Pointer,
    Float(FloatWidth),
}

impl ConcreteType {
    pub const DOUBLE: ConcreteType = ConcreteType::Float(FloatWidth::Double);

    pub fn is_known(self) -> bool {
        self != ConcreteType::Unknown
    }

    pub fn is_float(self) -> Option<FloatWidth> {
        match self {
            ConcreteType::Float(width) => Some(width),
            _ => None,
        }
    }

    /// Could a value of this classification be a pointer?
    pub fn is_possible_pointer(self) -> bool {
        matches!(self, ConcreteType::Unknown | ConcreteType::Anything | ConcreteType::Pointer)
    }

    /// Merge (∧): refine `self` with `other`; both must agree. `Unknown`
    /// defers to the other side, `Anything` is compatible with everything.
    pub fn and_in(self, other: ConcreteType) -> Result<ConcreteType, TypeError> {
        use ConcreteType::*;
        match (self, other) {
            (a, b) if a == b => Ok(a),
            (Unknown, b) => Ok(b),
            (a, Unknown) => Ok(a),
            (Anything, b) => Ok(b),
            (a, Anything) => Ok(a),
            (a, b) => Err(TypeError::TypeConflict { lhs: a, rhs: b }),
        }
    }

    /// Join (∨): monotone non-decreasing, the meet with `Anything` acting
    /// as the absorbing top. Two disagreeing concrete classifications are a
    /// proven contradiction and signal a conflict instead of widening.
    pub fn or_in(self, other: ConcreteType) -> Result<ConcreteType, TypeError> {
        use ConcreteType::*;
        match (self, other) {
            (a, b) if a == b => Ok(a),
            (Unknown, b) => Ok(b),
            (a, Unknown) => Ok(a),
            (Anything, _) | (_, Anything) => Ok(Anything),
            (a, b) => Err(TypeError::TypeConflict { lhs: a, rhs: b }),
        }
    }
}

impl fmt::Display for ConcreteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcreteType::Unknown => write!(f, "unknown"),
            ConcreteType::Anything => write!(f, "anything"),
            ConcreteType::Integer => write!(f, "int"),
            ConcreteType::Pointer => write!(f, "ptr"),
            ConcreteType::Float(FloatWidth::Half) => write!(f, "f16"),
            ConcreteType::Float(FloatWidth::Single) => write!(f, "f32"),
            ConcreteType::Float(FloatWidth::Double) => write!(f, "f64"),
            ConcreteType::Float(FloatWidth::Extended) => write!(f, "f80"),
            ConcreteType::Float(FloatWidth::Quad) => write!(f, "f128"),
        }
    }
}

pub type Offsets = SmallVec<[i64; 2]>;

/// A finite map from offset paths to concrete types; the value of the type
/// analysis lattice.
///
/// Entries are kept sorted by path and never map to `Unknown` (absence of an
/// entry is `Unknown`).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeTree {
    entries: Vec<(Offsets, ConcreteType)>,
}

impl TypeTree {
    pub fn new() -> TypeTree {
        TypeTree::default()
    }

    /// A tree classifying the value itself (empty path).
    pub fn scalar(ct: ConcreteType) -> TypeTree {
        let mut res = TypeTree::new();
        res.insert(Offsets::new(), ct);
        res
    }

    /// A pointer whose every pointee byte is `ct`.
    pub fn pointer_to(ct: ConcreteType) -> TypeTree {
        let mut res = TypeTree::scalar(ConcreteType::Pointer);
        res.insert(Offsets::from_slice(&[UNIFORM]), ct);
        res
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[i64], ConcreteType)> + '_ {
        self.entries.iter().map(|(path, ct)| (path.as_slice(), *ct))
    }

    fn insert(&mut self, path: Offsets, ct: ConcreteType) {
        if ct == ConcreteType::Unknown {
            return;
        }
        match self.entries.binary_search_by(|(p, _)| p.cmp(&path)) {
            Ok(pos) => self.entries[pos].1 = ct,
            Err(pos) => self.entries.insert(pos, (path, ct)),
        }
    }

    fn get(&self, path: &[i64]) -> ConcreteType {
        match self.entries.binary_search_by(|(p, _)| p.as_slice().cmp(path)) {
            Ok(pos) => self.entries[pos].1,
            Err(_) => ConcreteType::Unknown,
        }
    }

    /// The classification of the value itself.
    pub fn data0(&self) -> ConcreteType {
        self.get(&[])
    }

    /// The classification of pointee byte `offset`, falling back to the
    /// uniform entry.
    pub fn at_offset(&self, offset: i64) -> ConcreteType {
        let concrete = self.get(&[offset]);
        if concrete.is_known() {
            concrete
        } else {
            self.get(&[UNIFORM])
        }
    }

    /// Join `other` into `self`; returns `true` if `self` changed.
    ///
    /// A sequence of `or_in` calls is non-decreasing under the lattice
    /// order and therefore reaches a fixed point; a contradiction between
    /// concrete entries at the same offset is a [`TypeError::TypeConflict`].
    pub fn or_in(&mut self, other: &TypeTree) -> Result<bool, TypeError> {
        let mut changed = false;
        for (path, ct) in &other.entries {
            let old = self.get(path);
            // A wildcard entry at the same depth participates in the join so
            // that concrete offsets never contradict their `-1` sibling.
            let base = if old.is_known() { old } else { self.uniform_sibling(path) };
            let new = base.or_in(*ct)?;
            if new != old {
                self.insert(path.clone(), new);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Meet `other` into `self`; refinements must agree, a contradiction is
    /// a `TypeConflict`.
    pub fn and_in(&mut self, other: &TypeTree) -> Result<bool, TypeError> {
        let mut changed = false;
        for (path, ct) in &other.entries {
            let old = self.get(path);
            let new = old.and_in(*ct)?;
            if new != old {
                self.insert(path.clone(), new);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn uniform_sibling(&self, path: &[i64]) -> ConcreteType {
        if path.is_empty() || path[path.len() - 1] == UNIFORM {
            return ConcreteType::Unknown;
        }
        let mut sibling: Offsets = path.into();
        *sibling.last_mut().unwrap() = UNIFORM;
        self.get(&sibling)
    }

    /// Wrap the entire tree under a single prefix offset.
    pub fn only(&self, offset: i64) -> TypeTree {
        let mut res = TypeTree::new();
        for (path, ct) in &self.entries {
            let mut new_path = Offsets::with_capacity(path.len() + 1);
            new_path.push(offset);
            new_path.extend_from_slice(path);
            res.insert(new_path, *ct);
        }
        res
    }

    /// Select the half-open byte range `[start, start + size)` of the first
    /// offset, drop the rest, and relabel by `new_offset - start`.
    /// `size == -1` means unbounded.
    ///
    /// The wildcard distributes through a shift only when nothing moves;
    /// otherwise it downgrades to the concrete offsets of the selected range
    /// when `size` is finite and is dropped when it is not.
    pub fn shift_indices(&self, start: i64, size: i64, new_offset: i64) -> TypeTree {
        let mut res = TypeTree::new();
        for (path, ct) in &self.entries {
            let Some((&first, rest)) = path.split_first() else {
                // The scalar classification of the value does not survive
                // re-addressing.
                continue;
            };
            if first == UNIFORM {
                if start == 0 && new_offset == 0 && size < 0 {
                    res.insert(path.clone(), *ct);
                } else if size >= 0 {
                    for idx in (0..size).step_by(SLOT as usize) {
                        let mut new_path: Offsets = rest.into();
                        new_path.insert(0, idx + new_offset);
                        res.insert(new_path, *ct);
                    }
                }
                continue;
            }
            if first < start || (size >= 0 && first >= start + size) {
                continue;
            }
            let mut new_path: Offsets = rest.into();
            new_path.insert(0, first - start + new_offset);
            res.insert(new_path, *ct);
        }
        res
    }

    /// The tree of the pointee loaded through this pointer, `size` bytes
    /// wide. Entries beyond the loaded range are projected away and the
    /// wildcard is normalized into the loaded slot.
    pub fn lookup(&self, size: i64) -> TypeTree {
        let mut res = TypeTree::new();
        for (path, ct) in &self.entries {
            let Some((&first, rest)) = path.split_first() else { continue };
            if first == UNIFORM || (0 <= first && first < size) {
                res.insert(rest.into(), *ct);
            }
        }
        res
    }

    /// Drop `Anything` entries so that joining with this tree cannot mask a
    /// refinement.
    pub fn purge_anything(&self) -> TypeTree {
        let mut res = self.clone();
        res.entries.retain(|(_, ct)| *ct != ConcreteType::Anything);
        res
    }

    /// Keep only the entries that apply at every offset.
    pub fn keep_minus_one(&self) -> TypeTree {
        let mut res = self.clone();
        res.entries.retain(|(path, _)| matches!(path.first(), Some(&UNIFORM)));
        res
    }

    /// Truncate pointee ranges to `[0, size)`.
    pub fn at_most(&self, size: i64) -> TypeTree {
        let mut res = self.clone();
        res.entries
            .retain(|(path, _)| matches!(path.first(), None | Some(&UNIFORM)) || path[0] < size);
        res
    }

    /// Remove pointee entries in `[lo, hi)`; `total` bounds the wildcard
    /// expansion of the remainder.
    pub fn clear(&self, lo: i64, hi: i64, total: i64) -> TypeTree {
        let mut res = TypeTree::new();
        for (path, ct) in self.canonicalize_value(total).entries {
            match path.first() {
                Some(&first) if lo <= first && first < hi => continue,
                _ => res.insert(path, ct),
            }
        }
        res
    }

    /// Expand wildcard pointee entries to concrete offsets in `[0, size)`.
    pub fn canonicalize_value(&self, size: i64) -> TypeTree {
        let mut res = TypeTree::new();
        for (path, ct) in &self.entries {
            match path.split_first() {
                Some((&UNIFORM, rest)) => {
                    for idx in (0..size).step_by(SLOT as usize) {
                        let mut new_path: Offsets = rest.into();
                        new_path.insert(0, idx);
                        res.insert(new_path, *ct);
                    }
                }
                _ => res.insert(path.clone(), *ct),
            }
        }
        res
    }

    /// Prune entries incompatible with the destination of a bit
    /// reinterpretation; the payload bits survive a cast, the
    /// classification of the value itself does not.
    pub fn keep_for_cast(&self, dst: ConcreteType) -> TypeTree {
        let mut res = TypeTree::new();
        for (path, ct) in &self.entries {
            if path.is_empty() {
                // The value's own classification is replaced by the cast
                // destination unless that loses a refinement to `Anything`.
                if ct.and_in(dst).is_ok() {
                    res.insert(path.clone(), dst);
                }
            } else {
                res.insert(path.clone(), *ct);
            }
        }
        res
    }
}

impl fmt::Debug for TypeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (path, ct)) in self.entries.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}: {}", path.as_slice(), ct)?;
        }
        write!(f, "}}")
    }
}
