//! Parallel and periodic consistency of per-node decomposition values.
//!
//! Signs and scores are computed independently on every rank that holds a
//! node. [`sync_node_values`] makes them agree: first across periodic
//! partners, then across the ranks sharing the node's mesh ancestors. Nodes
//! are addressed by their [`ChildNodeAncestry`], so child nodes without mesh
//! entities take part as well.

use crate::algs::collectives::is_true_on_any;
use crate::algs::comm_sparse::{CommBuffer, CommSparse};
use crate::algs::communicator::CommTag;
use crate::cdfem::ancestry::{ChildNodeAncestry, common_sharers};
use crate::cdfem::node::{NodeArena, NodeIdx, SubElementNode};
use crate::mesh::MeshBulk;
use crate::mesh_error::CdMeshError;
use crate::topology::periodic::PeriodicNodeMap;
use crate::topology::point::{EntityId, EntityKey};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// A per-node value that can be exchanged and merged.
pub trait SyncValue: Copy + Default + PartialEq + Debug {
    const TAG: CommTag;

    fn pack(&self, buf: &mut CommBuffer);
    fn unpack(buf: &mut CommBuffer) -> Result<Self, CdMeshError>;
    /// Merge two views of the same node; must be commutative.
    fn combine(self, other: Self) -> Self;
    fn get(node: &SubElementNode) -> Option<Self>;
    fn set(node: &mut SubElementNode, value: Self);
}

/// Side of the current interface: -1, 0 or +1.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSign(pub i32);

impl NodeSign {
    pub fn is_on_interface(self) -> bool {
        self.0 == 0
    }
}

impl SyncValue for NodeSign {
    const TAG: CommTag = CommTag::new(0x0f00);

    fn pack(&self, buf: &mut CommBuffer) {
        buf.pack_i32(self.0);
    }

    fn unpack(buf: &mut CommBuffer) -> Result<Self, CdMeshError> {
        Ok(NodeSign(buf.unpack_i32()?))
    }

    /// A node on the interface anywhere is on it everywhere.
    fn combine(self, other: Self) -> Self {
        if self.0 == 0 || other.0 == 0 {
            NodeSign(0)
        } else {
            NodeSign(self.0.min(other.0))
        }
    }

    fn get(node: &SubElementNode) -> Option<Self> {
        node.sign
    }

    fn set(node: &mut SubElementNode, value: Self) {
        node.sign = Some(value);
    }
}

/// Quality of cutting through a node: 1 at an edge midpoint, 0 at an end.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NodeScore(pub f64);

impl SyncValue for NodeScore {
    const TAG: CommTag = CommTag::new(0x0f20);

    fn pack(&self, buf: &mut CommBuffer) {
        buf.pack_f64(self.0);
    }

    fn unpack(buf: &mut CommBuffer) -> Result<Self, CdMeshError> {
        Ok(NodeScore(buf.unpack_f64()?))
    }

    fn combine(self, other: Self) -> Self {
        NodeScore(self.0.min(other.0))
    }

    fn get(node: &SubElementNode) -> Option<Self> {
        node.score
    }

    fn set(node: &mut SubElementNode, value: Self) {
        node.score = Some(value);
    }
}

fn merge<T: SyncValue>(arena: &mut NodeArena, idx: NodeIdx, value: T) {
    let node = arena.get_mut(idx);
    let merged = match T::get(node) {
        Some(v) => v.combine(value),
        None => value,
    };
    T::set(node, merged);
}

/// Make `T` agree across periodic partners and sharing ranks. Collective.
pub fn sync_node_values<T: SyncValue, M: MeshBulk>(
    mesh: &M,
    arena: &mut NodeArena,
    periodic: &PeriodicNodeMap,
) -> Result<(), CdMeshError> {
    if is_true_on_any(mesh.comm(), !periodic.is_empty())? {
        sync_periodic::<T, M>(mesh, arena, periodic)?;
    }
    if mesh.parallel_size() > 1 {
        sync_shared::<T, M>(mesh, arena)?;
    }
    Ok(())
}

/// Owners of the leaves, or every rank when a leaf is unknown here.
fn periodic_destinations<M: MeshBulk>(mesh: &M, leaves: &BTreeSet<EntityId>) -> BTreeSet<usize> {
    let mut dest = BTreeSet::new();
    for &n in leaves {
        let key = EntityKey::node(n);
        if !mesh.is_valid(key) {
            return (0..mesh.parallel_size()).collect();
        }
        dest.insert(mesh.owner_rank(key));
    }
    dest
}

fn sync_periodic<T: SyncValue, M: MeshBulk>(
    mesh: &M,
    arena: &mut NodeArena,
    periodic: &PeriodicNodeMap,
) -> Result<(), CdMeshError> {
    let me = mesh.parallel_rank();
    let parallel = mesh.parallel_size() > 1;
    let mut local: Vec<(NodeIdx, T)> = Vec::new();
    let received = {
        let mut sparse = CommSparse::new(mesh.comm());
        for idx in arena.indices() {
            let Some(value) = T::get(arena.get(idx)) else {
                continue;
            };
            let ancestry = ChildNodeAncestry::from_node(arena, idx);
            for eq in ancestry.periodic_equivalents(periodic) {
                if let Some(other) = eq.resolve(arena) {
                    local.push((other, value));
                }
                if !parallel {
                    continue;
                }
                for p in periodic_destinations(mesh, &eq.leaf_mesh_nodes()) {
                    if p != me {
                        let buf = sparse.send_buffer(p);
                        eq.pack(buf);
                        value.pack(buf);
                    }
                }
            }
        }
        sparse.communicate(T::TAG.offset(8))?
    };
    for (idx, value) in local {
        merge(arena, idx, value);
    }
    for (_, mut buf) in received {
        while buf.remaining() {
            let ancestry = ChildNodeAncestry::unpack(&mut buf)?;
            let value = T::unpack(&mut buf)?;
            if let Some(idx) = ancestry.resolve(arena) {
                merge(arena, idx, value);
            }
        }
    }
    Ok(())
}

fn sync_shared<T: SyncValue, M: MeshBulk>(mesh: &M, arena: &mut NodeArena) -> Result<(), CdMeshError> {
    let received = {
        let mut sparse = CommSparse::new(mesh.comm());
        for idx in arena.indices() {
            let Some(value) = T::get(arena.get(idx)) else {
                continue;
            };
            let Some(dest) = common_sharers(mesh, &arena.leaf_mesh_nodes(idx)) else {
                continue;
            };
            let ancestry = ChildNodeAncestry::from_node(arena, idx);
            for p in dest {
                let buf = sparse.send_buffer(p);
                ancestry.pack(buf);
                value.pack(buf);
            }
        }
        sparse.communicate(T::TAG)?
    };
    for (_, mut buf) in received {
        while buf.remaining() {
            let ancestry = ChildNodeAncestry::unpack(&mut buf)?;
            let value = T::unpack(&mut buf)?;
            if let Some(idx) = ancestry.resolve(arena) {
                merge(arena, idx, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    use crate::mesh::{BulkData, MetaData};
    use crate::topology::cell_type::Topology;
    use serial_test::serial;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[test]
    fn sign_combination() {
        assert_eq!(NodeSign(1).combine(NodeSign(0)), NodeSign(0));
        assert_eq!(NodeSign(1).combine(NodeSign(-1)), NodeSign(-1));
        assert_eq!(NodeSign(1).combine(NodeSign(1)), NodeSign(1));
        assert_eq!(NodeScore(0.4).combine(NodeScore(0.2)), NodeScore(0.2));
    }

    #[test]
    fn periodic_partners_agree_locally() {
        let mesh = BulkData::new(MetaData::new(1), NoComm);
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(5), [4.0, 0.0, 0.0]);
        arena.get_mut(a).sign = Some(NodeSign(1));
        arena.get_mut(b).sign = Some(NodeSign(0));
        let periodic = PeriodicNodeMap::from_pairs([(id(1), id(5))]);
        sync_node_values::<NodeSign, _>(&mesh, &mut arena, &periodic).unwrap();
        assert_eq!(arena.get(a).sign, Some(NodeSign(0)));
        assert_eq!(arena.get(b).sign, Some(NodeSign(0)));
    }

    #[test]
    #[serial]
    fn shared_edge_node_scores_agree() {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let me = comm.rank();
                    let mut mesh = BulkData::new(MetaData::new(1), comm);
                    mesh.modification_begin().unwrap();
                    mesh.declare_node(id(1), &[]).unwrap();
                    mesh.declare_node(id(2), &[]).unwrap();
                    mesh.declare_element(id(1 + me as u64), Topology::Line2, &[id(1), id(2)], &[])
                        .unwrap();
                    mesh.set_sharing(EntityKey::node(id(1)), &[1 - me]);
                    mesh.set_sharing(EntityKey::node(id(2)), &[1 - me]);
                    mesh.modification_end().unwrap();

                    let mut arena = NodeArena::new();
                    let a = arena.add_mesh_node(id(1), [0.0; 3]);
                    let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
                    let m = arena.create_edge_node(a, b, 0.5);
                    arena.get_mut(m).score = Some(NodeScore(if me == 0 { 0.8 } else { 0.3 }));
                    sync_node_values::<NodeScore, _>(&mesh, &mut arena, &PeriodicNodeMap::new()).unwrap();
                    arena.get(m).score.map(|s| s.0)
                })
            })
            .collect();
        let out: Vec<Option<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(out, vec![Some(0.3), Some(0.3)]);
    }
}
