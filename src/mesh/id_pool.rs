//! Collective entity id generation.
//!
//! New ids are drawn above the global high-water mark of each entity rank and
//! interleaved by rank (`base + 1 + rank + size * i`), so ranks never collide
//! and no id is handed out twice within a run, even after entities are
//! destroyed.

use crate::algs::collectives::global_max_scalar;
use crate::algs::communicator::Communicator;
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityRank};

/// 32/64-bit id policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdPolicy {
    /// Fail if a generated id does not fit in 32 bits.
    pub assert_32bit: bool,
    /// Start generated ids above the 32-bit range.
    pub force_64bit: bool,
}

#[derive(Clone, Debug, Default)]
pub struct EntityIdPool {
    high_water: [u64; 3],
    policy: IdPolicy,
}

fn rank_index(rank: EntityRank) -> usize {
    match rank {
        EntityRank::Node => 0,
        EntityRank::Side => 1,
        EntityRank::Element => 2,
    }
}

impl EntityIdPool {
    pub fn new(policy: IdPolicy) -> Self {
        Self {
            high_water: [0; 3],
            policy,
        }
    }

    pub fn policy(&self) -> IdPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: IdPolicy) {
        self.policy = policy;
    }

    /// Record an id declared by the caller.
    pub fn note_id(&mut self, rank: EntityRank, id: EntityId) {
        let hw = &mut self.high_water[rank_index(rank)];
        *hw = (*hw).max(id.get());
    }

    /// Generate `count` fresh ids. Collective: every rank must call it, with
    /// its own (possibly zero) count.
    pub fn generate<C: Communicator>(
        &mut self,
        comm: &C,
        rank: EntityRank,
        count: usize,
    ) -> Result<Vec<EntityId>, CdMeshError> {
        let idx = rank_index(rank);
        let mut base = global_max_scalar(comm, self.high_water[idx])?;
        if self.policy.force_64bit && base < u64::from(u32::MAX) {
            base = u64::from(u32::MAX);
        }
        let (me, size) = (comm.rank() as u64, comm.size().max(1) as u64);
        let ids = (0..count as u64)
            .map(|i| base + 1 + me + size * i)
            .map(|raw| {
                if self.policy.assert_32bit && raw > u64::from(u32::MAX) {
                    Err(CdMeshError::IdOverflow(raw))
                } else {
                    EntityId::new(raw)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(last) = ids.last() {
            self.high_water[idx] = self.high_water[idx].max(last.get());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_ids_follow_high_water() {
        let mut pool = EntityIdPool::default();
        pool.note_id(EntityRank::Node, EntityId::new(10).unwrap());
        let ids = pool.generate(&NoComm, EntityRank::Node, 3).unwrap();
        assert_eq!(ids.iter().map(|i| i.get()).collect::<Vec<_>>(), vec![11, 12, 13]);
        let next = pool.generate(&NoComm, EntityRank::Node, 1).unwrap();
        assert_eq!(next[0].get(), 14);
        let elems = pool.generate(&NoComm, EntityRank::Element, 1).unwrap();
        assert_eq!(elems[0].get(), 1);
    }

    #[test]
    fn policy_limits() {
        let mut pool = EntityIdPool::new(IdPolicy {
            assert_32bit: false,
            force_64bit: true,
        });
        let ids = pool.generate(&NoComm, EntityRank::Side, 1).unwrap();
        assert!(ids[0].get() > u64::from(u32::MAX));

        let mut pool = EntityIdPool::new(IdPolicy {
            assert_32bit: true,
            force_64bit: true,
        });
        assert!(matches!(
            pool.generate(&NoComm, EntityRank::Side, 1),
            Err(CdMeshError::IdOverflow(_))
        ));
    }

    #[test]
    fn ranks_interleave() {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let mut pool = EntityIdPool::default();
                    pool.note_id(EntityRank::Node, EntityId::new(4 + comm.rank() as u64).unwrap());
                    pool.generate(&comm, EntityRank::Node, 2).unwrap()
                })
            })
            .collect();
        let all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|i| i.get())
            .collect();
        assert_eq!(all, vec![6, 8, 7, 9]);
    }
}
