//! Periodic node identification.
//!
//! A [`PeriodicNodeMap`] records which mesh nodes are tied together by
//! periodic constraints. Pairs are symmetric: registering `(a, b)` makes `b`
//! a partner of `a` and `a` a partner of `b`. Node classifications computed on
//! one side of a periodic boundary are shipped to the ranks owning the partner
//! side, so lookups are by node id and must be deterministic.

use crate::topology::point::EntityId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeriodicNodeMap {
    partners: BTreeMap<EntityId, BTreeSet<EntityId>>,
}

impl PeriodicNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from a list of node pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (EntityId, EntityId)>,
    {
        let mut map = Self::default();
        for (a, b) in pairs {
            map.add_pair(a, b);
        }
        map
    }

    /// Register a periodic pair in both directions. A node paired with itself
    /// is ignored.
    pub fn add_pair(&mut self, a: EntityId, b: EntityId) {
        if a == b {
            return;
        }
        self.partners.entry(a).or_default().insert(b);
        self.partners.entry(b).or_default().insert(a);
    }

    pub fn is_empty(&self) -> bool {
        self.partners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partners.len()
    }

    pub fn clear(&mut self) {
        self.partners.clear();
    }

    /// Direct partners of `node` in ascending id order.
    pub fn partners(&self, node: EntityId) -> impl Iterator<Item = EntityId> + '_ {
        self.partners.get(&node).into_iter().flatten().copied()
    }

    pub fn has_partners(&self, node: EntityId) -> bool {
        self.partners.contains_key(&node)
    }

    /// `node` followed by its direct partners.
    pub fn equivalents(&self, node: EntityId) -> Vec<EntityId> {
        std::iter::once(node).chain(self.partners(node)).collect()
    }

    /// All registered nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.partners.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[test]
    fn pairs_are_symmetric() {
        let map = PeriodicNodeMap::from_pairs([(id(1), id(5)), (id(1), id(9))]);
        assert_eq!(map.partners(id(1)).collect::<Vec<_>>(), vec![id(5), id(9)]);
        assert_eq!(map.partners(id(9)).collect::<Vec<_>>(), vec![id(1)]);
        assert_eq!(map.equivalents(id(5)), vec![id(5), id(1)]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn self_pair_is_ignored() {
        let mut map = PeriodicNodeMap::new();
        map.add_pair(id(3), id(3));
        assert!(map.is_empty());
        assert_eq!(map.equivalents(id(3)), vec![id(3)]);
    }
}
