//! Atlas: mapping mesh entities to contiguous slices in a flat data array.
//!
//! The `Atlas` struct provides a bijective mapping between entity ids and
//! sub-slices of a flat data buffer. Every registered field of the
//! collaborator mesh keeps one atlas per field so that all component values
//! of the field live in a single `Vec`.

use crate::debug_invariants::{DebugInvariants, InvariantViolation};
use crate::topology::cache::InvalidateCache;
use crate::topology::point::EntityId;
use std::collections::HashMap;

/// `Atlas` maintains:
/// - a lookup `map` from each entity to its `(offset, len)` in the data buffer,
/// - an `order` vector preserving insertion order for deterministic iteration,
/// - and `total_len` tracking the next free offset.
///
/// # Invariants
///
/// - Each entity appears exactly once in `order`.
/// - `map` contains precisely the keys listed in `order`.
/// - Every slice has `len > 0`.
/// - Offsets are contiguous in insertion order and `total_len` equals the sum
///   of all lengths.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Atlas {
    map: HashMap<EntityId, (usize, usize)>,
    order: Vec<EntityId>,
    total_len: usize,
}

impl InvalidateCache for Atlas {
    fn invalidate_cache(&mut self) {}
}

impl Atlas {
    /// Insert a brand-new entity with a slice of length `len`.
    ///
    /// Returns the starting offset, or `None` if `len == 0` or the entity is
    /// already present.
    ///
    /// # Complexity
    /// Amortized **O(1)**.
    pub fn try_insert(&mut self, p: EntityId, len: usize) -> Option<usize> {
        if len == 0 || self.map.contains_key(&p) {
            return None;
        }
        let offset = self.total_len;
        self.map.insert(p, (offset, len));
        self.order.push(p);
        self.total_len += len;
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        self.debug_assert_invariants();
        Some(offset)
    }

    #[inline]
    pub fn get(&self, p: EntityId) -> Option<(usize, usize)> {
        self.map.get(&p).copied()
    }

    #[inline]
    pub fn contains(&self, p: EntityId) -> bool {
        self.map.contains_key(&p)
    }

    /// Number of registered entities (not the number of values).
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Registered entities in insertion order.
    pub fn points(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.order.iter().copied()
    }

    /// Remove an entity and its slice, recomputing all offsets.
    ///
    /// Returns the removed slice descriptor.
    ///
    /// # Complexity
    /// **O(n)** to rebuild offsets. Preserves relative order of the
    /// remaining entities.
    pub fn remove_point(&mut self, p: EntityId) -> Option<(usize, usize)> {
        let removed = self.map.remove(&p)?;
        self.order.retain(|&x| x != p);
        let mut next = 0usize;
        for &pt in &self.order {
            if let Some(span) = self.map.get_mut(&pt) {
                span.0 = next;
                next += span.1;
            }
        }
        self.total_len = next;
        InvalidateCache::invalidate_cache(self);
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        self.debug_assert_invariants();
        Some(removed)
    }
}

impl DebugInvariants for Atlas {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Atlas invalid");
    }

    fn validate_invariants(&self) -> Result<(), InvariantViolation> {
        if self.order.len() != self.map.len() {
            return Err(InvariantViolation(format!(
                "atlas order has {} entries but map has {}",
                self.order.len(),
                self.map.len()
            )));
        }
        let mut expected = 0usize;
        for &p in &self.order {
            let Some(&(off, len)) = self.map.get(&p) else {
                return Err(InvariantViolation(format!("entity {p} missing from atlas map")));
            };
            if len == 0 || off != expected {
                return Err(InvariantViolation(format!(
                    "entity {p} has slice ({off},{len}), expected offset {expected}"
                )));
            }
            expected += len;
        }
        if expected != self.total_len {
            return Err(InvariantViolation(format!(
                "atlas total_len {} != sum of lengths {expected}",
                self.total_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[test]
    fn insert_and_lookup() {
        let mut a = Atlas::default();
        assert_eq!(a.try_insert(id(1), 3), Some(0));
        assert_eq!(a.try_insert(id(2), 5), Some(3));
        assert_eq!(a.try_insert(id(2), 1), None);
        assert_eq!(a.try_insert(id(3), 0), None);
        assert_eq!(a.get(id(2)), Some((3, 5)));
        assert_eq!(a.total_len(), 8);
    }

    #[test]
    fn remove_compacts_offsets() {
        let mut a = Atlas::default();
        a.try_insert(id(1), 2);
        a.try_insert(id(2), 2);
        a.try_insert(id(3), 2);
        assert_eq!(a.remove_point(id(2)), Some((2, 2)));
        assert_eq!(a.get(id(3)), Some((2, 2)));
        assert_eq!(a.points().collect::<Vec<_>>(), vec![id(1), id(3)]);
        assert!(a.validate_invariants().is_ok());
        assert_eq!(a.remove_point(id(2)), None);
    }
}
