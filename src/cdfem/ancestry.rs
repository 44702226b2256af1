//! Portable description of how a child node derives from mesh nodes.
//!
//! A [`ChildNodeAncestry`] is the pre-order flattening of a node's parent
//! tree into [`WireAncestryLink`]s. It can be shipped to another rank and
//! resolved there against that rank's [`NodeArena`], which is how ranks agree
//! on edge nodes created on shared edges and how the sign and score syncs
//! address nodes that have no mesh entity yet.

use crate::algs::comm_sparse::{CommBuffer, CommSparse};
use crate::algs::communicator::CommTag;
use crate::algs::wire::WireAncestryLink;
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind};
use crate::mesh::{MeshBulk, MeshQueryExt};
use crate::mesh_error::CdMeshError;
use crate::topology::periodic::PeriodicNodeMap;
use crate::topology::point::{EntityId, EntityKey};
use itertools::Itertools;
use std::collections::BTreeSet;

const HANGING_EDGE_TAG: CommTag = CommTag::new(0x0f40);

#[derive(Clone, Debug, PartialEq)]
pub struct ChildNodeAncestry {
    links: Vec<WireAncestryLink>,
}

impl ChildNodeAncestry {
    pub fn from_node(arena: &NodeArena, idx: NodeIdx) -> Self {
        let mut links = Vec::new();
        push_links(arena, idx, 1.0, &mut links);
        Self { links }
    }

    pub fn links(&self) -> &[WireAncestryLink] {
        &self.links
    }

    /// Same key as [`NodeArena::ancestry_key`] for the node it came from.
    /// Midside markers are not carried, since only intersection nodes travel.
    pub fn key(&self) -> Vec<u64> {
        let mut key = Vec::with_capacity(self.links.len() + 1);
        for l in &self.links {
            if l.nparents() == 0 {
                key.push(l.id());
            } else {
                key.push(0);
                key.push(l.nparents() as u64);
            }
        }
        key
    }

    /// Mesh nodes the ancestry ends in.
    pub fn leaf_mesh_nodes(&self) -> BTreeSet<EntityId> {
        self.links
            .iter()
            .filter(|l| l.nparents() == 0)
            .filter_map(|l| EntityId::from_raw_opt(l.id()))
            .collect()
    }

    /// The matching node in `arena`, if every ancestor exists there.
    pub fn resolve(&self, arena: &NodeArena) -> Option<NodeIdx> {
        let mut pos = 0;
        let idx = resolve_from(&self.links, &mut pos, arena)?;
        (pos == self.links.len()).then_some(idx)
    }

    /// Ancestries obtained by replacing leaf mesh nodes with their periodic
    /// partners, excluding the unchanged ancestry.
    pub fn periodic_equivalents(&self, periodic: &PeriodicNodeMap) -> Vec<ChildNodeAncestry> {
        let leaf_positions: Vec<usize> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.nparents() == 0)
            .map(|(i, _)| i)
            .collect();
        let choices: Vec<Vec<u64>> = leaf_positions
            .iter()
            .map(|&i| {
                let raw = self.links[i].id();
                EntityId::from_raw_opt(raw)
                    .map(|id| periodic.equivalents(id).into_iter().map(EntityId::get).collect())
                    .unwrap_or_else(|| vec![raw])
            })
            .collect();
        if choices.iter().all(|c| c.len() <= 1) {
            return Vec::new();
        }
        choices
            .into_iter()
            .multi_cartesian_product()
            .filter_map(|ids| {
                let mut links = self.links.clone();
                let mut changed = false;
                for (&i, &id) in leaf_positions.iter().zip(&ids) {
                    if links[i].id() != id {
                        links[i] = WireAncestryLink::mesh_node(id, links[i].weight());
                        changed = true;
                    }
                }
                changed.then_some(ChildNodeAncestry { links })
            })
            .collect()
    }

    pub fn pack(&self, buf: &mut CommBuffer) {
        buf.pack_records(&self.links);
    }

    pub fn unpack(buf: &mut CommBuffer) -> Result<Self, CdMeshError> {
        let links: Vec<WireAncestryLink> = buf.unpack_records()?;
        if links.is_empty() {
            return Err(CdMeshError::MalformedMessage {
                neighbor: buf.source(),
                reason: "empty child node ancestry".to_owned(),
            });
        }
        Ok(Self { links })
    }
}

fn push_links(arena: &NodeArena, idx: NodeIdx, weight: f64, links: &mut Vec<WireAncestryLink>) {
    let node = arena.get(idx);
    match (&node.kind, node.entity) {
        (NodeKind::Mesh, Some(id)) => links.push(WireAncestryLink::mesh_node(id.get(), weight)),
        (kind, _) => {
            let parents = kind.parents();
            links.push(WireAncestryLink::child(parents.len(), weight));
            for (&p, w) in parents.iter().zip(kind.weights()) {
                push_links(arena, p, w, links);
            }
        }
    }
}

fn resolve_from(links: &[WireAncestryLink], pos: &mut usize, arena: &NodeArena) -> Option<NodeIdx> {
    let link = links.get(*pos)?;
    *pos += 1;
    let n = link.nparents();
    if n == 0 {
        return arena.mesh_node(EntityId::from_raw_opt(link.id())?);
    }
    let mut parents = Vec::with_capacity(n);
    for _ in 0..n {
        parents.push(resolve_from(links, pos, arena)?);
    }
    if n == 2 {
        arena
            .edge_child(parents[0], parents[1])
            .or_else(|| arena.child_of(&parents))
    } else {
        arena.child_of(&parents)
    }
}

/// Create edge nodes that other ranks placed on edges this rank shares.
///
/// Every rank sends the ancestry of its edge nodes whose parents are shared
/// to the ranks sharing all of the node's mesh ancestors. The receiver builds
/// the node when both parents exist locally and the parents still form an
/// uncut edge of one of its leaf subelements, as reported by `is_leaf_edge`.
/// Collective.
pub fn build_parallel_hanging_edge_nodes<M, F>(
    mesh: &M,
    arena: &mut NodeArena,
    is_leaf_edge: F,
) -> Result<Vec<NodeIdx>, CdMeshError>
where
    M: MeshBulk,
    F: Fn(NodeIdx, NodeIdx) -> bool,
{
    let me = mesh.parallel_rank();
    let received = {
        let mut sparse = CommSparse::new(mesh.comm());
        for idx in arena.indices() {
            if !matches!(arena.get(idx).kind, NodeKind::Edge { .. }) {
                continue;
            }
            let leaves = arena.leaf_mesh_nodes(idx);
            let Some(dest) = common_sharers(mesh, &leaves) else {
                continue;
            };
            let ancestry = ChildNodeAncestry::from_node(arena, idx);
            for p in dest.into_iter().filter(|&p| p != me) {
                ancestry.pack(sparse.send_buffer(p));
            }
        }
        sparse.communicate(HANGING_EDGE_TAG)?
    };

    let mut created = Vec::new();
    for (_, mut buf) in received {
        while buf.remaining() {
            let ancestry = ChildNodeAncestry::unpack(&mut buf)?;
            if ancestry.resolve(arena).is_some() {
                continue;
            }
            let links = ancestry.links();
            let mut pos = 1;
            let Some(a) = resolve_from(links, &mut pos, arena) else {
                continue;
            };
            let position = links.get(pos).map_or(0.5, WireAncestryLink::weight);
            let Some(b) = resolve_from(links, &mut pos, arena) else {
                continue;
            };
            if !is_leaf_edge(a, b) {
                continue;
            }
            let idx = arena.create_edge_node(a, b, position);
            log::trace!("built hanging edge node {:?} from a remote ancestry", idx);
            created.push(idx);
        }
    }
    Ok(created)
}

/// Ranks sharing every node of `nodes`, or `None` if some node is not shared.
pub(crate) fn common_sharers<M: MeshBulk>(mesh: &M, nodes: &BTreeSet<EntityId>) -> Option<BTreeSet<usize>> {
    let mut common: Option<BTreeSet<usize>> = None;
    for &n in nodes {
        let key = EntityKey::node(n);
        if !mesh.is_valid(key) || !mesh.is_shared(key) {
            return None;
        }
        let procs: BTreeSet<usize> = mesh.sharing_procs(key).into_iter().collect();
        common = Some(match common {
            None => procs,
            Some(c) => c.intersection(&procs).copied().collect(),
        });
    }
    common.filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn arena_with_edge() -> (NodeArena, NodeIdx, NodeIdx, NodeIdx) {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        let m = arena.create_edge_node(a, b, 0.3);
        (arena, a, b, m)
    }

    #[test]
    fn ancestry_resolves_in_another_arena() {
        let (arena, _, _, m) = arena_with_edge();
        let ancestry = ChildNodeAncestry::from_node(&arena, m);
        assert_eq!(ancestry.key(), arena.ancestry_key(m));
        assert_eq!(ancestry.resolve(&arena), Some(m));

        let mut other = NodeArena::new();
        let b = other.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        assert_eq!(ancestry.resolve(&other), None);
        let a = other.add_mesh_node(id(1), [0.0; 3]);
        let m2 = other.create_edge_node(b, a, 0.7);
        assert_eq!(ancestry.resolve(&other), Some(m2));
        assert_eq!(ancestry.leaf_mesh_nodes(), BTreeSet::from([id(1), id(2)]));
    }

    #[test]
    fn second_parent_weight_is_the_position() {
        let (arena, _, _, m) = arena_with_edge();
        let ancestry = ChildNodeAncestry::from_node(&arena, m);
        let links = ancestry.links();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].nparents(), 2);
        assert!((links[2].weight() - 0.3).abs() < 1e-15);
    }

    #[test]
    fn periodic_substitutions_exclude_original() {
        let (arena, _, _, m) = arena_with_edge();
        let ancestry = ChildNodeAncestry::from_node(&arena, m);
        let periodic = PeriodicNodeMap::from_pairs([(id(1), id(11)), (id(2), id(12))]);
        let eq = ancestry.periodic_equivalents(&periodic);
        assert_eq!(eq.len(), 3);
        assert!(eq.iter().all(|e| e.key() != ancestry.key()));
        assert!(eq.iter().any(|e| e.leaf_mesh_nodes() == BTreeSet::from([id(11), id(12)])));
        assert!(ancestry.periodic_equivalents(&PeriodicNodeMap::new()).is_empty());
    }

    #[test]
    fn pack_unpack() {
        let (arena, _, _, m) = arena_with_edge();
        let ancestry = ChildNodeAncestry::from_node(&arena, m);
        let mut buf = CommBuffer::new();
        ancestry.pack(&mut buf);
        let mut rx = CommBuffer::from_bytes(0, buf.as_bytes().to_vec());
        assert_eq!(ChildNodeAncestry::unpack(&mut rx).unwrap(), ancestry);
    }
}
