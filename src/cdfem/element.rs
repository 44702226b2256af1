//! Background elements and their conformal subelement trees.
//!
//! A [`MeshElement`] wraps one nonconformal element of the mesh. When an
//! interface cuts it, it is triangulated into a tree of [`SubElement`]s whose
//! leaves form the conformal decomposition. All splits follow one rule: a
//! leaf is split by a node lying on one of its edges, faces or in its
//! interior, and each child replaces one vertex of the supporting feature by
//! that node. Children inherit the leaf's orientation and record which side
//! of the background element each of their own sides lies on.

use crate::cdfem::interface_geometry::InterfaceGeometry;
use crate::cdfem::node::{NodeArena, NodeIdx};
use crate::cdfem::phase::{InterfaceId, PhaseTag};
use crate::geometry::metrics::{dot, signed_volume, sub, weighted_point};
use crate::topology::cell_type::Topology;
use crate::topology::point::EntityId;
use std::collections::BTreeSet;

const BARYCENTRIC_TOL: f64 = 1e-10;

#[derive(Clone, Debug)]
pub struct SubElement {
    pub topology: Topology,
    /// Full connectivity, midside nodes included for quadratic topologies.
    pub nodes: Vec<NodeIdx>,
    /// Per side, the side of the background element it lies on.
    pub parent_side_ids: Vec<Option<usize>>,
    pub phase: PhaseTag,
    pub entity: Option<EntityId>,
    pub children: Vec<SubElement>,
}

impl SubElement {
    pub fn new(topology: Topology, nodes: Vec<NodeIdx>, parent_side_ids: Vec<Option<usize>>, phase: PhaseTag) -> Self {
        Self {
            topology,
            nodes,
            parent_side_ids,
            phase,
            entity: None,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn vertices(&self) -> &[NodeIdx] {
        &self.nodes[..self.topology.num_vertices()]
    }

    pub fn leaves(&self) -> Vec<&SubElement> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a SubElement>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for c in &self.children {
                c.collect_leaves(out);
            }
        }
    }

    pub fn for_each_leaf_mut<F: FnMut(&mut SubElement)>(&mut self, f: &mut F) {
        if self.is_leaf() {
            f(self);
        } else {
            for c in &mut self.children {
                c.for_each_leaf_mut(f);
            }
        }
    }

    /// Split this leaf by `node`, which lies in the span of the local
    /// vertices `support`. One child is created per index in `replaced`.
    pub fn split(&mut self, node: NodeIdx, replaced: &[usize], support: &[usize]) {
        debug_assert!(self.is_leaf() && !self.topology.is_quadratic());
        let topo = self.topology;
        let sides: Vec<BTreeSet<usize>> = (0..topo.num_sides())
            .map(|s| topo.side_vertices(s).iter().copied().collect())
            .collect();
        for &r in replaced {
            let mut nodes = self.nodes.clone();
            nodes[r] = node;
            let parent_side_ids = (0..topo.num_sides())
                .map(|s| {
                    let span: BTreeSet<usize> = topo
                        .side_vertices(s)
                        .iter()
                        .flat_map(|&i| if i == r { support.to_vec() } else { vec![i] })
                        .collect();
                    sides
                        .iter()
                        .position(|p| *p == span)
                        .and_then(|p| self.parent_side_ids[p])
                })
                .collect();
            self.children.push(SubElement::new(topo, nodes, parent_side_ids, self.phase.clone()));
        }
    }

    /// The split that resolves a node already created on one of this leaf's
    /// edges (best score first, then lowest ancestry key) or faces.
    fn find_hanging_split(&self, arena: &NodeArena) -> Option<(NodeIdx, Vec<usize>, Vec<usize>)> {
        let topo = self.topology;
        let mut best: Option<(f64, Vec<u64>, NodeIdx, usize, usize)> = None;
        for e in topo.edges() {
            let (i, j) = (e[0], e[1]);
            let Some(m) = arena.edge_child(self.nodes[i], self.nodes[j]) else {
                continue;
            };
            let score = arena.get(m).score.map_or(0.0, |s| s.0);
            let key = arena.ancestry_key(m);
            let better = match &best {
                None => true,
                Some((bs, bk, ..)) => score > *bs || (score == *bs && key < *bk),
            };
            if better {
                best = Some((score, key, m, i, j));
            }
        }
        if let Some((_, _, m, i, j)) = best {
            return Some((m, vec![j, i], vec![i, j]));
        }
        if topo.dimension() == 3 {
            for s in 0..topo.num_sides() {
                let verts = topo.side_vertices(s);
                let face: Vec<NodeIdx> = verts.iter().map(|&v| self.nodes[v]).collect();
                if let Some(f) = arena.child_of(&face) {
                    return Some((f, verts.to_vec(), verts.to_vec()));
                }
            }
        }
        None
    }

    /// Split leaves until no leaf has a node on one of its edges or faces.
    pub fn resolve_hanging(&mut self, arena: &NodeArena) {
        if self.is_leaf() {
            let Some((node, replaced, support)) = self.find_hanging_split(arena) else {
                return;
            };
            self.split(node, &replaced, &support);
        }
        for c in &mut self.children {
            c.resolve_hanging(arena);
        }
    }

    /// Whether `a - b` is one of this subelement's edges.
    pub fn has_edge(&self, a: NodeIdx, b: NodeIdx) -> bool {
        self.topology
            .edges()
            .iter()
            .any(|e| {
                let (x, y) = (self.nodes[e[0]], self.nodes[e[1]]);
                (x == a && y == b) || (x == b && y == a)
            })
    }
}

/// Barycentric coordinates of `p` in the simplex `verts`.
fn barycentric(topology: Topology, verts: &[[f64; 3]], p: [f64; 3]) -> Vec<f64> {
    match topology.dimension() {
        1 => {
            let d = sub(verts[1], verts[0]);
            let len2 = dot(d, d);
            if len2 <= 0.0 {
                return vec![1.0, 0.0];
            }
            let t = dot(sub(p, verts[0]), d) / len2;
            vec![1.0 - t, t]
        }
        2 => {
            let area = |a: [f64; 3], b: [f64; 3], c: [f64; 3]| (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            let total = area(verts[0], verts[1], verts[2]);
            if total == 0.0 {
                return vec![1.0, 0.0, 0.0];
            }
            vec![
                area(p, verts[1], verts[2]) / total,
                area(verts[0], p, verts[2]) / total,
                area(verts[0], verts[1], p) / total,
            ]
        }
        _ => {
            let total = signed_volume(verts[0], verts[1], verts[2], verts[3]);
            if total == 0.0 {
                return vec![1.0, 0.0, 0.0, 0.0];
            }
            vec![
                signed_volume(p, verts[1], verts[2], verts[3]) / total,
                signed_volume(verts[0], p, verts[2], verts[3]) / total,
                signed_volume(verts[0], verts[1], p, verts[3]) / total,
                signed_volume(verts[0], verts[1], verts[2], p) / total,
            ]
        }
    }
}

/// Comparable summary of an element's decomposition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElementSignature {
    Uncut(PhaseTag),
    /// Sorted `(vertex ancestry keys, phase)` of every leaf.
    Cut(Vec<(Vec<Vec<u64>>, PhaseTag)>),
}

/// One nonconformal element of the mesh with its decomposition.
#[derive(Clone, Debug)]
pub struct MeshElement {
    pub entity: EntityId,
    pub topology: Topology,
    /// Full connectivity, as in the mesh.
    pub nodes: Vec<NodeIdx>,
    /// Phase of the whole element when it is not cut.
    pub phase: PhaseTag,
    pub cutting_interfaces: Vec<InterfaceId>,
    /// Roots of the subelement trees; empty when not triangulated.
    pub subelements: Vec<SubElement>,
}

impl MeshElement {
    pub fn new(entity: EntityId, topology: Topology, nodes: Vec<NodeIdx>) -> Self {
        Self {
            entity,
            topology,
            nodes,
            phase: PhaseTag::new(),
            cutting_interfaces: Vec::new(),
            subelements: Vec::new(),
        }
    }

    pub fn vertices(&self) -> &[NodeIdx] {
        &self.nodes[..self.topology.num_vertices()]
    }

    /// Mesh entities of the vertices.
    pub fn vertex_entities(&self, arena: &NodeArena) -> Vec<EntityId> {
        self.vertices().iter().filter_map(|&n| arena.get(n).entity).collect()
    }

    pub fn have_subelements(&self) -> bool {
        !self.subelements.is_empty()
    }

    pub fn leaves(&self) -> Vec<&SubElement> {
        self.subelements.iter().flat_map(|s| s.leaves()).collect()
    }

    pub fn for_each_leaf_mut<F: FnMut(&mut SubElement)>(&mut self, mut f: F) {
        for s in &mut self.subelements {
            s.for_each_leaf_mut(&mut f);
        }
    }

    /// Cut, but decomposed into a single leaf that coincides with the
    /// element itself.
    pub fn is_single_coincident(&self) -> bool {
        let leaves = self.leaves();
        if leaves.len() != 1 {
            return false;
        }
        let leaf: BTreeSet<NodeIdx> = leaves[0].vertices().iter().copied().collect();
        let own: BTreeSet<NodeIdx> = self.vertices().iter().copied().collect();
        leaf == own
    }

    /// Whether the leaves of the element belong to more than one phase.
    pub fn have_interface(&self) -> bool {
        let leaves = self.leaves();
        leaves.windows(2).any(|w| w[0].phase != w[1].phase)
    }

    /// Replace any previous decomposition by a single root covering the
    /// element, then resolve the interior meeting points of its interfaces.
    pub fn triangulate<G: InterfaceGeometry>(&mut self, arena: &mut NodeArena, geometry: &G) {
        self.subelements.clear();
        if self.cutting_interfaces.is_empty() {
            return;
        }
        let base = self.topology.base_topology();
        let root = SubElement::new(
            base,
            self.vertices().to_vec(),
            (0..base.num_sides()).map(Some).collect(),
            self.phase.clone(),
        );
        self.subelements.push(root);

        let vertex_entities = self.vertex_entities(arena);
        let points = geometry.interior_intersection_points(&vertex_entities, &self.cutting_interfaces);
        let coords: Vec<[f64; 3]> = self.vertices().iter().map(|&n| arena.get(n).coords).collect();
        for point in points {
            let p = weighted_point(&coords, &point.weights);
            self.insert_interior_point(arena, p);
        }
    }

    fn insert_interior_point(&mut self, arena: &mut NodeArena, p: [f64; 3]) {
        for root in &mut self.subelements {
            if insert_point(root, arena, p) {
                return;
            }
        }
    }

    /// Split leaves that have nodes on their edges or faces.
    pub fn resolve_hanging(&mut self, arena: &NodeArena) {
        for s in &mut self.subelements {
            s.resolve_hanging(arena);
        }
    }

    /// Give every linear leaf a single quadratic child for quadratic
    /// elements. Edges along the element's own edges reuse its midside nodes.
    pub fn build_quadratic_subelements(&mut self, arena: &mut NodeArena) {
        if !self.topology.is_quadratic() {
            return;
        }
        let topology = self.topology;
        let base = topology.base_topology();
        let element_nodes = self.nodes.clone();
        let vertices: Vec<NodeIdx> = element_nodes[..base.num_vertices()].to_vec();
        self.for_each_leaf_mut(|leaf| {
            if leaf.topology.is_quadratic() {
                return;
            }
            let mut nodes = leaf.vertices().to_vec();
            for e in leaf.topology.edges() {
                let (a, b) = (leaf.nodes[e[0]], leaf.nodes[e[1]]);
                let existing = match (vertices.iter().position(|&v| v == a), vertices.iter().position(|&v| v == b)) {
                    (Some(ia), Some(ib)) => base
                        .edge_between(ia, ib)
                        .map(|edge| element_nodes[topology.edge_midside_node(edge)]),
                    _ => None,
                };
                nodes.push(existing.unwrap_or_else(|| arena.create_midside_node(a, b, None)));
            }
            let child = SubElement::new(
                leaf.topology.quadratic_topology(),
                nodes,
                leaf.parent_side_ids.clone(),
                leaf.phase.clone(),
            );
            leaf.children.push(child);
        });
    }

    /// Phase of every leaf, from the averaged stencil of its vertices.
    pub fn determine_leaf_phases<G: InterfaceGeometry>(&mut self, arena: &NodeArena, geometry: &G) {
        self.for_each_leaf_mut(|leaf| {
            let verts = leaf.vertices();
            let w = 1.0 / verts.len() as f64;
            let mut stencil: Vec<(EntityId, f64)> = Vec::new();
            for &v in verts {
                for (id, x) in arena.stencil(v) {
                    match stencil.iter_mut().find(|(e, _)| *e == id) {
                        Some(entry) => entry.1 += w * x,
                        None => stencil.push((id, w * x)),
                    }
                }
            }
            leaf.phase = geometry.phase_at(&stencil);
        });
        // The linear parent of a quadratic leaf takes the leaf's phase.
        for root in &mut self.subelements {
            lift_phase_from_quadratic(root);
        }
    }

    pub fn signature(&self, arena: &NodeArena) -> ElementSignature {
        if !self.have_subelements() {
            return ElementSignature::Uncut(self.phase.clone());
        }
        if self.is_single_coincident() {
            return ElementSignature::Uncut(self.leaves()[0].phase.clone());
        }
        let mut leaves: Vec<(Vec<Vec<u64>>, PhaseTag)> = self
            .leaves()
            .into_iter()
            .map(|leaf| {
                let mut keys: Vec<Vec<u64>> = leaf.vertices().iter().map(|&v| arena.ancestry_key(v)).collect();
                keys.sort();
                (keys, leaf.phase.clone())
            })
            .collect();
        leaves.sort();
        ElementSignature::Cut(leaves)
    }
}

fn lift_phase_from_quadratic(sub: &mut SubElement) {
    for c in &mut sub.children {
        lift_phase_from_quadratic(c);
    }
    if let [only] = sub.children.as_slice() {
        if only.is_leaf() && only.topology.is_quadratic() && only.topology.base_topology() == sub.topology {
            sub.phase = only.phase.clone();
        }
    }
}

/// Split the leaf of `sub` containing `p` at `p`.
fn insert_point(sub: &mut SubElement, arena: &mut NodeArena, p: [f64; 3]) -> bool {
    if !sub.is_leaf() {
        return sub.children.iter_mut().any(|c| insert_point(c, arena, p));
    }
    let verts: Vec<[f64; 3]> = sub.vertices().iter().map(|&n| arena.get(n).coords).collect();
    let w = barycentric(sub.topology, &verts, p);
    if w.iter().any(|&x| x < -BARYCENTRIC_TOL) {
        return false;
    }
    let support: Vec<usize> = (0..w.len()).filter(|&i| w[i] > BARYCENTRIC_TOL).collect();
    let total: f64 = support.iter().map(|&i| w[i]).sum();
    let weights: Vec<f64> = support.iter().map(|&i| w[i] / total).collect();
    let parents: Vec<NodeIdx> = support.iter().map(|&i| sub.nodes[i]).collect();
    let node = match support.len() {
        0 | 1 => return true,
        2 => arena.create_edge_node(parents[0], parents[1], weights[1]),
        n if n == sub.topology.num_vertices() => arena.create_steiner_node(&parents, &weights),
        _ => arena.create_child_node(&parents, &weights),
    };
    let replaced: Vec<usize> = support.iter().rev().copied().collect();
    sub.split(node, &replaced, &support);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::metrics::simplex_measure;
    use crate::cdfem::phase::SurfaceId;
    use crate::topology::point::EntityId;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn measure(arena: &NodeArena, sub: &SubElement) -> f64 {
        let verts: Vec<[f64; 3]> = sub.vertices().iter().map(|&n| arena.get(n).coords).collect();
        simplex_measure(sub.topology, &verts)
    }

    #[test]
    fn line_split_keeps_orientation_and_sides() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        let m = arena.create_edge_node(a, b, 0.3);
        let mut root = SubElement::new(Topology::Line2, vec![a, b], vec![Some(0), Some(1)], PhaseTag::new());
        root.resolve_hanging(&arena);
        let leaves = root.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].nodes, vec![a, m]);
        assert_eq!(leaves[1].nodes, vec![m, b]);
        assert_eq!(leaves[0].parent_side_ids, vec![Some(0), None]);
        assert_eq!(leaves[1].parent_side_ids, vec![None, Some(1)]);
    }

    #[test]
    fn tri_edge_split_partitions_area() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        let c = arena.add_mesh_node(id(3), [0.0, 1.0, 0.0]);
        arena.create_edge_node(a, b, 0.4);
        arena.create_edge_node(a, c, 0.4);
        let mut root = SubElement::new(Topology::Tri3, vec![a, b, c], (0..3).map(Some).collect(), PhaseTag::new());
        let total = measure(&arena, &root);
        root.resolve_hanging(&arena);
        let leaves = root.leaves();
        assert_eq!(leaves.len(), 3);
        let sum: f64 = leaves.iter().map(|l| measure(&arena, l)).sum();
        assert!((sum - total).abs() < 1e-14);
        // Every child side on the background boundary remembers its side.
        for leaf in &leaves {
            let on_boundary = leaf.parent_side_ids.iter().filter(|p| p.is_some()).count();
            assert!(on_boundary >= 1);
        }
    }

    #[test]
    fn tet_face_node_gives_three_children() {
        let mut arena = NodeArena::new();
        let v: Vec<NodeIdx> = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
            .iter()
            .enumerate()
            .map(|(i, &x)| arena.add_mesh_node(id(i as u64 + 1), x))
            .collect();
        let face = Topology::Tet4.side_vertices(3);
        let parents: Vec<NodeIdx> = face.iter().map(|&i| v[i]).collect();
        arena.create_child_node(&parents, &[1.0 / 3.0; 3]);
        let mut root = SubElement::new(Topology::Tet4, v.clone(), (0..4).map(Some).collect(), PhaseTag::new());
        let total = measure(&arena, &root);
        root.resolve_hanging(&arena);
        let leaves = root.leaves();
        assert_eq!(leaves.len(), 3);
        let sum: f64 = leaves.iter().map(|l| measure(&arena, l)).sum();
        assert!((sum - total).abs() < 1e-14);
        // The face side of each child still lies on the background face.
        assert!(leaves.iter().all(|l| l.parent_side_ids.contains(&Some(3))));
    }

    #[test]
    fn quadratic_children_reuse_element_midside_nodes() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        let mid = arena.add_mesh_node(id(3), [0.5, 0.0, 0.0]);
        let mut elem = MeshElement::new(id(10), Topology::Line3, vec![a, b, mid]);
        elem.subelements.push(SubElement::new(Topology::Line2, vec![a, b], vec![Some(0), Some(1)], PhaseTag::new()));
        elem.build_quadratic_subelements(&mut arena);
        let leaves = elem.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].topology, Topology::Line3);
        assert_eq!(leaves[0].nodes, vec![a, b, mid]);
        assert!(elem.is_single_coincident());
    }

    #[test]
    fn quadratic_leaves_keep_their_phase() {
        let mut arena = NodeArena::new();
        let a = arena.add_mesh_node(id(1), [0.0; 3]);
        let b = arena.add_mesh_node(id(2), [1.0, 0.0, 0.0]);
        let mid = arena.add_mesh_node(id(3), [0.5, 0.0, 0.0]);
        let mut elem = MeshElement::new(id(10), Topology::Line3, vec![a, b, mid]);
        let mut root = SubElement::new(Topology::Line2, vec![a, b], vec![Some(0), Some(1)], PhaseTag::new());
        arena.create_edge_node(a, b, 0.3);
        root.resolve_hanging(&arena);
        elem.subelements.push(root);
        elem.build_quadratic_subelements(&mut arena);
        assert_eq!(elem.leaves().len(), 2);

        let mut sign = -1;
        elem.for_each_leaf_mut(|leaf| {
            leaf.phase = PhaseTag::with(SurfaceId(0), sign);
            sign = -sign;
        });
        for root in &mut elem.subelements {
            lift_phase_from_quadratic(root);
        }
        let leaves = elem.leaves();
        assert!(leaves.iter().all(|l| l.topology == Topology::Line3 && !l.phase.is_empty()));
        assert_ne!(leaves[0].phase, leaves[1].phase);
        for linear in &elem.subelements[0].children {
            assert_eq!(linear.phase, linear.children[0].phase);
        }
    }
}
