//! Ownership and sharing metadata for mesh entities.
//!
//! The [`EntityOwnership`] table records, per entity, the owning rank and the
//! other ranks that hold a copy of it. Only nodes on partition boundaries are
//! shared in practice; entities without an entry are owned locally and not
//! shared.

use crate::topology::point::EntityId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OwnershipEntry {
    pub owner: usize,
    /// Other ranks holding a copy (never includes the local rank).
    pub sharers: BTreeSet<usize>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EntityOwnership {
    my_rank: usize,
    entries: BTreeMap<EntityId, OwnershipEntry>,
}

impl EntityOwnership {
    pub fn new(my_rank: usize) -> Self {
        Self {
            my_rank,
            entries: BTreeMap::new(),
        }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Record that `id` is shared with `sharers` and owned by the lowest rank
    /// among them and this rank.
    pub fn set_shared<I>(&mut self, id: EntityId, sharers: I)
    where
        I: IntoIterator<Item = usize>,
    {
        let sharers: BTreeSet<usize> = sharers.into_iter().filter(|&p| p != self.my_rank).collect();
        if sharers.is_empty() {
            self.entries.remove(&id);
            return;
        }
        let owner = sharers.iter().copied().chain([self.my_rank]).min().unwrap_or(self.my_rank);
        self.entries.insert(id, OwnershipEntry { owner, sharers });
    }

    /// Add one sharing rank, keeping the smallest rank as owner.
    pub fn add_sharer(&mut self, id: EntityId, rank: usize) {
        if rank == self.my_rank {
            return;
        }
        let my_rank = self.my_rank;
        let entry = self.entries.entry(id).or_insert_with(|| OwnershipEntry {
            owner: my_rank,
            sharers: BTreeSet::new(),
        });
        entry.sharers.insert(rank);
        entry.owner = entry.owner.min(rank);
    }

    pub fn remove(&mut self, id: EntityId) {
        self.entries.remove(&id);
    }

    pub fn entry(&self, id: EntityId) -> Option<&OwnershipEntry> {
        self.entries.get(&id)
    }

    pub fn owner(&self, id: EntityId) -> usize {
        self.entries.get(&id).map_or(self.my_rank, |e| e.owner)
    }

    pub fn is_locally_owned(&self, id: EntityId) -> bool {
        self.owner(id) == self.my_rank
    }

    pub fn is_shared(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Sharing ranks of `id`, excluding this rank.
    pub fn sharers(&self, id: EntityId) -> impl Iterator<Item = usize> + '_ {
        self.entries.get(&id).into_iter().flat_map(|e| e.sharers.iter().copied())
    }

    /// Iterate over all shared entities.
    pub fn shared(&self) -> impl Iterator<Item = (EntityId, &OwnershipEntry)> {
        self.entries.iter().map(|(&id, e)| (id, e))
    }
}
