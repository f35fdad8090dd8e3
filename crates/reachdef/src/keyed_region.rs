use crate::definition::Definition;
use rustc_hash::FxHashSet;
use std::{collections::BTreeMap, rc::Rc};

/// An ordered map from byte offsets to sized, possibly overlapping objects.
///
/// Installing an object kills every prior entry that the new range fully
/// covers; entries that only partially overlap stay reachable at their
/// original offsets. Overlap aliasing is deliberately tolerated; precision
/// there is not a goal of the analysis.
#[derive(Debug, Clone, Default)]
pub struct KeyedRegion {
    objects: BTreeMap<u64, FxHashSet<Rc<Definition>>>,
    /// Largest object size ever installed; bounds the backward scan of
    /// offset queries.
    max_size: u64,
}

impl KeyedRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `object` over `[offset, offset + size)`, killing prior
    /// entries fully covered by that range.
    pub fn set_object(&mut self, offset: u64, object: Rc<Definition>, size: u64) {
        self.kill_covered(offset, size);
        self.objects.entry(offset).or_default().insert(object);
        self.max_size = self.max_size.max(size);
    }

    /// Removes every object whose extent lies fully inside
    /// `[offset, offset + size)`.
    pub fn kill_covered(&mut self, offset: u64, size: u64) {
        let end = offset.saturating_add(size);

        let mut emptied = Vec::new();
        for (&base, bucket) in self.objects.range_mut(offset..end) {
            bucket.retain(|obj| base.saturating_add(obj.size()) > end);
            if bucket.is_empty() {
                emptied.push(base);
            }
        }
        for base in emptied {
            self.objects.remove(&base);
        }
    }

    /// All objects whose extent contains `offset`.
    pub fn get_objects_by_offset(&self, offset: u64) -> FxHashSet<Rc<Definition>> {
        let lo = offset.saturating_sub(self.max_size.saturating_sub(1));

        let mut res = FxHashSet::default();
        for (&base, bucket) in self.objects.range(lo..=offset) {
            for obj in bucket {
                if base.saturating_add(obj.size()) > offset {
                    res.insert(obj.clone());
                }
            }
        }
        res
    }

    /// Pointwise union with another region.
    pub fn merge(&mut self, other: &KeyedRegion) {
        for (&base, bucket) in &other.objects {
            self.objects
                .entry(base)
                .or_default()
                .extend(bucket.iter().cloned());
        }
        self.max_size = self.max_size.max(other.max_size);
    }

    /// An independent copy. Stored definitions are shared (they are
    /// immutable), but mutating either region never affects the other.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.values().map(FxHashSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Definition>> {
        self.objects.values().flatten()
    }
}

impl PartialEq for KeyedRegion {
    fn eq(&self, other: &Self) -> bool {
        // max_size is a scan bound, not part of the contents
        self.objects == other.objects
    }
}

impl Eq for KeyedRegion {}

#[cfg(test)]
mod test {
    use super::KeyedRegion;
    use crate::{
        atom::{Atom, MemoryLocation},
        code_location::CodeLocation,
        data::{DataSet, Value},
        definition::Definition,
    };
    use std::rc::Rc;

    fn def(offset: u64, size: u64, value: u64) -> Rc<Definition> {
        Rc::new(Definition::new(
            Atom::Memory(MemoryLocation::new(offset, size)),
            CodeLocation::External,
            DataSet::singleton(Value::Int(value), (size * 8) as u32),
        ))
    }

    #[test]
    fn covered_entries_are_replaced() {
        let mut region = KeyedRegion::new();
        region.set_object(0, def(0, 4, 1), 4);
        region.set_object(0, def(0, 8, 2), 8);

        let at_zero = region.get_objects_by_offset(0);
        assert_eq!(at_zero.len(), 1);
        assert!(at_zero.iter().all(|d| d.data.as_int() == Some(2)));
    }

    #[test]
    fn partially_overlapping_entries_survive() {
        let mut region = KeyedRegion::new();
        region.set_object(0, def(0, 8, 1), 8);
        // narrower write: the old 8-byte entry is not fully covered
        region.set_object(0, def(0, 4, 2), 4);

        assert_eq!(region.get_objects_by_offset(0).len(), 2);
        // only the wide entry extends past offset 4
        let tail = region.get_objects_by_offset(6);
        assert_eq!(tail.len(), 1);
        assert!(tail.iter().all(|d| d.data.as_int() == Some(1)));
    }

    #[test]
    fn straddling_entries_survive_a_wide_write() {
        let mut region = KeyedRegion::new();
        region.set_object(6, def(6, 4, 1), 4);
        region.set_object(0, def(0, 8, 2), 8);

        // [6, 10) pokes out of [0, 8) and must still be reachable
        assert_eq!(region.get_objects_by_offset(9).len(), 1);
        assert_eq!(region.get_objects_by_offset(6).len(), 2);
    }

    #[test]
    fn kill_covered_removes_without_adding() {
        let mut region = KeyedRegion::new();
        region.set_object(0, def(0, 8, 1), 8);
        region.kill_covered(0, 8);

        assert!(region.get_objects_by_offset(0).is_empty());
        assert_eq!(region.len(), 0);
    }

    #[test]
    fn copies_are_independent() {
        let mut region = KeyedRegion::new();
        region.set_object(0, def(0, 8, 1), 8);

        let copy = region.copy();
        region.set_object(16, def(16, 8, 2), 8);

        assert_eq!(copy.len(), 1);
        assert_eq!(region.len(), 2);
        assert!(copy.get_objects_by_offset(16).is_empty());
    }

    #[test]
    fn merge_unions_pointwise() {
        let mut a = KeyedRegion::new();
        a.set_object(0, def(0, 8, 1), 8);
        let mut b = KeyedRegion::new();
        b.set_object(0, def(0, 8, 2), 8);
        b.set_object(16, def(16, 4, 3), 4);

        a.merge(&b);
        assert_eq!(a.get_objects_by_offset(0).len(), 2);
        assert_eq!(a.get_objects_by_offset(16).len(), 1);
    }
}
