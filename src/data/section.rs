//! Section: field data storage over an entity atlas.
//!
//! The `Section<V>` type couples an [`Atlas`] (mapping entities to slices in a
//! contiguous array) with a `Vec<V>` holding the actual values. The mesh keeps
//! one section per registered field; entities gain a slice when they enter a
//! part the field is restricted to and lose it when destroyed.

use crate::data::atlas::Atlas;
use crate::topology::point::EntityId;

#[derive(Clone, Debug, Default)]
pub struct Section<V> {
    atlas: Atlas,
    data: Vec<V>,
}

impl<V: Clone + Default> Section<V> {
    pub fn new() -> Self {
        Section {
            atlas: Atlas::default(),
            data: Vec::new(),
        }
    }

    pub fn atlas(&self) -> &Atlas {
        &self.atlas
    }

    #[inline]
    pub fn contains(&self, p: EntityId) -> bool {
        self.atlas.contains(p)
    }

    /// Read-only view of the slice for `p`, if registered.
    #[inline]
    pub fn restrict(&self, p: EntityId) -> Option<&[V]> {
        let (offset, len) = self.atlas.get(p)?;
        Some(&self.data[offset..offset + len])
    }

    #[inline]
    pub fn restrict_mut(&mut self, p: EntityId) -> Option<&mut [V]> {
        let (offset, len) = self.atlas.get(p)?;
        Some(&mut self.data[offset..offset + len])
    }

    /// Register `p` with `len` default-initialized values. Already registered
    /// entities keep their values.
    pub fn add_point(&mut self, p: EntityId, len: usize) {
        if self.atlas.try_insert(p, len).is_some() {
            self.data.resize(self.atlas.total_len(), V::default());
        }
    }

    /// Overwrite the slice at `p`. Returns `false` when `p` is not registered
    /// or the lengths differ.
    pub fn set(&mut self, p: EntityId, val: &[V]) -> bool {
        match self.restrict_mut(p) {
            Some(target) if target.len() == val.len() => {
                target.clone_from_slice(val);
                true
            }
            _ => false,
        }
    }

    /// Remove `p`, keeping the remaining slices contiguous.
    pub fn remove_point(&mut self, p: EntityId) {
        let Some((offset, len)) = self.atlas.remove_point(p) else {
            return;
        };
        self.data.drain(offset..offset + len);
    }

    /// Iterate over `(EntityId, &[V])` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &[V])> {
        self.atlas.points().filter_map(move |p| self.restrict(p).map(|s| (p, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[test]
    fn set_and_restrict() {
        let mut s = Section::<f64>::new();
        s.add_point(id(4), 2);
        assert_eq!(s.restrict(id(4)), Some(&[0.0, 0.0][..]));
        assert!(s.set(id(4), &[1.0, 2.0]));
        assert!(!s.set(id(4), &[1.0]));
        assert!(!s.set(id(5), &[1.0, 2.0]));
        assert_eq!(s.restrict(id(4)), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn remove_keeps_other_values() {
        let mut s = Section::<f64>::new();
        for (i, v) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
            s.add_point(id(i), 1);
            s.set(id(i), &[v]);
        }
        s.remove_point(id(2));
        assert_eq!(s.restrict(id(3)), Some(&[3.0][..]));
        assert_eq!(s.iter().count(), 2);
    }
}
