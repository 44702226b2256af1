//! Arena of decomposition nodes.
//!
//! Every node of a decomposition generation lives in one [`NodeArena`] and is
//! referred to by its [`NodeIdx`]. Mesh nodes wrap an existing mesh entity;
//! every other node is defined by its parents and weights and gets a mesh
//! entity only when the mesh is modified.
//!
//! The arena memoizes edge nodes by their (sorted) parent pair and face/
//! interior child nodes by their sorted parent set, so asking twice for the
//! node between the same parents returns the same index. The caches are
//! explicit and are dropped with [`InvalidateCache::invalidate_cache`] when
//! the generation is cleared.

use crate::cdfem::sync::{NodeScore, NodeSign};
use crate::geometry::metrics::weighted_point;
use crate::topology::cache::InvalidateCache;
use crate::topology::point::EntityId;
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Index of a node in its [`NodeArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(u32);

impl NodeIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a node was created.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// Node of the background mesh.
    Mesh,
    /// Intersection on the segment between two nodes, `position` measured
    /// from the first parent.
    Edge { parents: [NodeIdx; 2], position: f64 },
    /// Midside node of a quadratic subelement edge.
    MidSide { parents: [NodeIdx; 2] },
    /// Node on a face, or at an interface meeting point on a face.
    Child { parents: Vec<NodeIdx>, weights: Vec<f64> },
    /// Interior point of an element; never shared between elements.
    Steiner { parents: Vec<NodeIdx>, weights: Vec<f64> },
}

impl NodeKind {
    pub fn parents(&self) -> &[NodeIdx] {
        match self {
            NodeKind::Mesh => &[],
            NodeKind::Edge { parents, .. } | NodeKind::MidSide { parents } => parents,
            NodeKind::Child { parents, .. } | NodeKind::Steiner { parents, .. } => parents,
        }
    }

    pub fn weights(&self) -> Vec<f64> {
        match self {
            NodeKind::Mesh => Vec::new(),
            NodeKind::Edge { position, .. } => vec![1.0 - position, *position],
            NodeKind::MidSide { .. } => vec![0.5, 0.5],
            NodeKind::Child { weights, .. } | NodeKind::Steiner { weights, .. } => weights.clone(),
        }
    }

    pub fn is_mesh_node(&self) -> bool {
        matches!(self, NodeKind::Mesh)
    }

    /// Whether the node can be rebuilt from the parent ids stored on its
    /// entity after a restart.
    pub fn is_restorable(&self) -> bool {
        matches!(self, NodeKind::Edge { .. })
    }
}

#[derive(Clone, Debug)]
pub struct SubElementNode {
    pub kind: NodeKind,
    pub coords: [f64; 3],
    /// Mesh entity, once one exists.
    pub entity: Option<EntityId>,
    /// Sign with respect to the interface being processed.
    pub sign: Option<NodeSign>,
    /// How well a cut through this node avoids slivers.
    pub score: Option<NodeScore>,
    /// Level sets whose interfaces were snapped onto this node.
    pub captured_domains: BTreeSet<u32>,
    /// Whether the node's fields were already prolonged.
    pub prolonged: bool,
}

impl SubElementNode {
    fn new(kind: NodeKind, coords: [f64; 3], entity: Option<EntityId>) -> Self {
        Self {
            kind,
            coords,
            entity,
            sign: None,
            score: None,
            captured_domains: BTreeSet::new(),
            prolonged: false,
        }
    }

    pub fn is_mesh_node(&self) -> bool {
        self.kind.is_mesh_node()
    }
}

fn sorted_pair(a: NodeIdx, b: NodeIdx) -> [NodeIdx; 2] {
    if a <= b { [a, b] } else { [b, a] }
}

#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    nodes: Vec<SubElementNode>,
    mesh_nodes: HashMap<EntityId, NodeIdx>,
    edge_nodes: HashMap<[NodeIdx; 2], NodeIdx>,
    child_nodes: HashMap<Vec<NodeIdx>, NodeIdx>,
    midside_nodes: HashMap<[NodeIdx; 2], NodeIdx>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: NodeIdx) -> &SubElementNode {
        &self.nodes[idx.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: NodeIdx) -> &mut SubElementNode {
        &mut self.nodes[idx.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &SubElementNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIdx(i as u32), n))
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIdx> {
        (0..self.nodes.len() as u32).map(NodeIdx)
    }

    fn push(&mut self, node: SubElementNode) -> NodeIdx {
        let idx = NodeIdx(self.nodes.len() as u32);
        self.nodes.push(node);
        idx
    }

    pub fn mesh_node(&self, entity: EntityId) -> Option<NodeIdx> {
        self.mesh_nodes.get(&entity).copied()
    }

    /// Arena node of a mesh entity, created on first use.
    pub fn add_mesh_node(&mut self, entity: EntityId, coords: [f64; 3]) -> NodeIdx {
        if let Some(&idx) = self.mesh_nodes.get(&entity) {
            return idx;
        }
        let idx = self.push(SubElementNode::new(NodeKind::Mesh, coords, Some(entity)));
        self.mesh_nodes.insert(entity, idx);
        idx
    }

    /// Existing edge node between `a` and `b`, in either order.
    pub fn edge_child(&self, a: NodeIdx, b: NodeIdx) -> Option<NodeIdx> {
        self.edge_nodes.get(&sorted_pair(a, b)).copied()
    }

    /// Existing quadratic midside node between `a` and `b`.
    pub fn midside_child(&self, a: NodeIdx, b: NodeIdx) -> Option<NodeIdx> {
        self.midside_nodes.get(&sorted_pair(a, b)).copied()
    }

    /// Existing face or interior child of exactly `parents`.
    pub fn child_of(&self, parents: &[NodeIdx]) -> Option<NodeIdx> {
        let mut key = parents.to_vec();
        key.sort_unstable();
        self.child_nodes.get(&key).copied()
    }

    /// Intersection node on the segment `a -> b` at `position` from `a`.
    ///
    /// Parents are stored in canonical order (by ancestry key), so the node
    /// is identical whichever element creates it first.
    pub fn create_edge_node(&mut self, a: NodeIdx, b: NodeIdx, position: f64) -> NodeIdx {
        if let Some(idx) = self.edge_child(a, b) {
            return idx;
        }
        let (parents, position) = if self.ancestry_key(a) <= self.ancestry_key(b) {
            ([a, b], position)
        } else {
            ([b, a], 1.0 - position)
        };
        let coords = weighted_point(
            &[self.get(parents[0]).coords, self.get(parents[1]).coords],
            &[1.0 - position, position],
        );
        let idx = self.push(SubElementNode::new(NodeKind::Edge { parents, position }, coords, None));
        self.edge_nodes.insert(sorted_pair(a, b), idx);
        idx
    }

    /// Midside node of the quadratic edge `a - b`. `entity` is the midside
    /// node already present in the mesh, if any.
    pub fn create_midside_node(&mut self, a: NodeIdx, b: NodeIdx, entity: Option<EntityId>) -> NodeIdx {
        let key = sorted_pair(a, b);
        if let Some(&idx) = self.midside_nodes.get(&key) {
            if entity.is_some() && self.get(idx).entity.is_none() {
                self.get_mut(idx).entity = entity;
            }
            return idx;
        }
        let parents = if self.ancestry_key(a) <= self.ancestry_key(b) { [a, b] } else { [b, a] };
        let coords = weighted_point(&[self.get(a).coords, self.get(b).coords], &[0.5, 0.5]);
        let idx = self.push(SubElementNode::new(NodeKind::MidSide { parents }, coords, entity));
        self.midside_nodes.insert(key, idx);
        idx
    }

    /// Child node of a face (or of three or more nodes in general), shared
    /// between the elements containing those parents.
    pub fn create_child_node(&mut self, parents: &[NodeIdx], weights: &[f64]) -> NodeIdx {
        if let Some(idx) = self.child_of(parents) {
            return idx;
        }
        let mut pairs: Vec<(Vec<u64>, NodeIdx, f64)> = parents
            .iter()
            .zip(weights)
            .map(|(&p, &w)| (self.ancestry_key(p), p, w))
            .collect();
        pairs.sort_by(|x, y| x.0.cmp(&y.0));
        let parents: Vec<NodeIdx> = pairs.iter().map(|p| p.1).collect();
        let weights: Vec<f64> = pairs.iter().map(|p| p.2).collect();
        let coords = self.weighted_coords(&parents, &weights);
        let mut key = parents.clone();
        key.sort_unstable();
        let idx = self.push(SubElementNode::new(NodeKind::Child { parents, weights }, coords, None));
        self.child_nodes.insert(key, idx);
        idx
    }

    /// Interior node of one element. Never memoized.
    pub fn create_steiner_node(&mut self, parents: &[NodeIdx], weights: &[f64]) -> NodeIdx {
        let coords = self.weighted_coords(parents, weights);
        self.push(SubElementNode::new(
            NodeKind::Steiner {
                parents: parents.to_vec(),
                weights: weights.to_vec(),
            },
            coords,
            None,
        ))
    }

    fn weighted_coords(&self, parents: &[NodeIdx], weights: &[f64]) -> [f64; 3] {
        let pts: Vec<[f64; 3]> = parents.iter().map(|&p| self.get(p).coords).collect();
        weighted_point(&pts, weights)
    }

    /// The node as a weighted combination of mesh nodes, one entry per mesh
    /// node, sorted by id.
    pub fn stencil(&self, idx: NodeIdx) -> Vec<(EntityId, f64)> {
        let mut acc: Vec<(EntityId, f64)> = Vec::new();
        self.accumulate_stencil(idx, 1.0, &mut acc);
        acc.sort_by_key(|e| e.0);
        let mut merged: Vec<(EntityId, f64)> = Vec::with_capacity(acc.len());
        for (id, w) in acc {
            match merged.last_mut() {
                Some(last) if last.0 == id => last.1 += w,
                _ => merged.push((id, w)),
            }
        }
        merged
    }

    fn accumulate_stencil(&self, idx: NodeIdx, weight: f64, out: &mut Vec<(EntityId, f64)>) {
        let node = self.get(idx);
        match (&node.kind, node.entity) {
            (NodeKind::Mesh, Some(id)) => out.push((id, weight)),
            (kind, _) => {
                for (&p, w) in kind.parents().iter().zip(kind.weights()) {
                    self.accumulate_stencil(p, weight * w, out);
                }
            }
        }
    }

    /// Canonical key of the node's ancestry: `[id]` for a mesh node, or
    /// `[0, nparents]` followed by the keys of the parents. Weights are left
    /// out so the key is exact on every rank.
    pub fn ancestry_key(&self, idx: NodeIdx) -> Vec<u64> {
        let mut key = Vec::new();
        self.append_ancestry_key(idx, &mut key);
        key
    }

    fn append_ancestry_key(&self, idx: NodeIdx, key: &mut Vec<u64>) {
        let node = self.get(idx);
        match (&node.kind, node.entity) {
            (NodeKind::Mesh, Some(id)) => key.push(id.get()),
            (kind, _) => {
                let parents = kind.parents();
                // Midside nodes carry a marker so they never collide with an
                // edge node of the same parents.
                key.push(if matches!(kind, NodeKind::MidSide { .. }) { u64::MAX } else { 0 });
                key.push(parents.len() as u64);
                for &p in parents {
                    self.append_ancestry_key(p, key);
                }
            }
        }
    }

    /// Mesh nodes the node ultimately derives from.
    pub fn leaf_mesh_nodes(&self, idx: NodeIdx) -> BTreeSet<EntityId> {
        self.stencil(idx).into_iter().map(|(id, _)| id).collect()
    }

    /// Forget signs and scores before the next interface.
    pub fn clear_signs_and_scores(&mut self) {
        for n in &mut self.nodes {
            n.sign = None;
            n.score = None;
        }
    }

    pub fn clear_prolongation_state(&mut self) {
        for n in &mut self.nodes {
            n.prolonged = false;
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.invalidate_cache();
    }
}

impl InvalidateCache for NodeArena {
    fn invalidate_cache(&mut self) {
        self.mesh_nodes.clear();
        self.edge_nodes.clear();
        self.child_nodes.clear();
        self.midside_nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[test]
    fn edge_nodes_are_memoized_in_either_order() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(7), [0.0, 0.0, 0.0]);
        let b = arena.add_mesh_node(id(3), [1.0, 0.0, 0.0]);
        let m = arena.create_edge_node(a, b, 0.25);
        assert_eq!(arena.create_edge_node(b, a, 0.75), m);
        assert_eq!(arena.edge_child(b, a), Some(m));
        // Parents are stored lowest ancestry key first.
        match &arena.get(m).kind {
            NodeKind::Edge { parents, position } => {
                assert_eq!(*parents, [b, a]);
                assert!((position - 0.75).abs() < 1e-15);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!((arena.get(m).coords[0] - 0.25).abs() < 1e-15);
        assert_eq!(arena.ancestry_key(m), vec![0, 2, 3, 7]);
    }

    #[test]
    fn stencil_of_nested_children() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        let c = arena.add_mesh_node(id(3), [0.0, 1.0, 0.0]);
        let ab = arena.create_edge_node(a, b, 0.5);
        let f = arena.create_child_node(&[ab, c], &[0.5, 0.5]);
        let s = arena.stencil(f);
        assert_eq!(s, vec![(id(1), 0.25), (id(2), 0.25), (id(3), 0.5)]);
        assert_eq!(arena.child_of(&[c, ab]), Some(f));
        assert_eq!(arena.leaf_mesh_nodes(f), BTreeSet::from([id(1), id(2), id(3)]));
    }

    #[test]
    fn steiner_nodes_are_never_shared() {
        let mut arena = NodeArena::new();
        let p: Vec<NodeIdx> = (1..=3).map(|i| arena.add_mesh_node(id(i), [i as f64, 0.0, 0.0])).collect();
        let w = [1.0 / 3.0; 3];
        let s1 = arena.create_steiner_node(&p, &w);
        let s2 = arena.create_steiner_node(&p, &w);
        assert_ne!(s1, s2);
        assert!(!arena.get(s1).kind.is_restorable());
    }

    #[test]
    fn midside_keys_differ_from_edge_keys() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [2.0, 0.0, 0.0]);
        let e = arena.create_edge_node(a, b, 0.5);
        let m = arena.create_midside_node(a, b, None);
        assert_ne!(e, m);
        assert_ne!(arena.ancestry_key(e), arena.ancestry_key(m));
        assert_eq!(arena.create_midside_node(b, a, Some(id(9))), m);
        assert_eq!(arena.get(m).entity, Some(id(9)));
    }

    #[test]
    fn invalidated_caches_forget_nodes() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        arena.create_edge_node(a, b, 0.5);
        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.mesh_node(id(1)), None);
    }
}
