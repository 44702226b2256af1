//! One generation of the conformal decomposition.
//!
//! A [`CdMesh`] owns the node arena and the [`MeshElement`]s built from the
//! nonconformal elements of the decomposed blocks. Building a generation is
//! a fixed pipeline: [`generate_nonconformal_elements`], cutting interface
//! detection, [`triangulate`], [`decompose`], then the mesh modification and
//! field prolongation implemented in the sibling modules.
//!
//! A generation may hold the previous one in `old`, which supplies entity ids
//! for identical nodes and elements and the stashed field data. The chain is
//! at most two deep: the previous generation's own `old` is dropped when it
//! is attached.
//!
//! [`generate_nonconformal_elements`]: CdMesh::generate_nonconformal_elements
//! [`triangulate`]: CdMesh::triangulate
//! [`decompose`]: CdMesh::decompose

use crate::algs::collectives::is_true_on_any;
use crate::cdfem::ancestry::build_parallel_hanging_edge_nodes;
use crate::cdfem::config::CdfemConfig;
use crate::cdfem::element::{ElementSignature, MeshElement};
use crate::cdfem::interface_geometry::{InterfaceGeometry, all_interface_ids};
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind};
use crate::cdfem::phase::{CdfemParts, InterfaceId, PhaseSupport};
use crate::cdfem::prolongation::ProlongationStore;
use crate::cdfem::snap::NodeToCapturedDomainsMap;
use crate::cdfem::sync::{NodeScore, NodeSign, sync_node_values};
use crate::mesh::{MeshBulk, MeshQueryExt, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::cache::InvalidateCache;
use crate::topology::periodic::PeriodicNodeMap;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use hashbrown::HashSet;
use once_cell::unsync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cut quality of an intersection at `position` along its edge.
pub(crate) fn edge_node_score(position: f64) -> NodeScore {
    NodeScore(1.0 - (1.0 - 2.0 * position).abs())
}

pub struct CdMesh {
    pub(crate) config: Arc<CdfemConfig>,
    pub(crate) phase_support: Arc<PhaseSupport>,
    pub(crate) parts: CdfemParts,
    pub(crate) nodes: NodeArena,
    /// Sorted by entity id.
    pub(crate) elements: Vec<MeshElement>,
    pub(crate) periodic: PeriodicNodeMap,
    /// Step whose field data is stashed in `prolongation`, -1 for none.
    pub(crate) stash_step_count: i64,
    pub(crate) prolongation: ProlongationStore,
    /// Leaf element entity to the index of its parent in `elements`.
    child_index: OnceCell<BTreeMap<EntityId, usize>>,
    pub(crate) old: Option<Box<CdMesh>>,
}

impl std::fmt::Debug for CdMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdMesh")
            .field("nodes", &self.nodes.len())
            .field("elements", &self.elements.len())
            .field("stash_step_count", &self.stash_step_count)
            .field("has_old", &self.old.is_some())
            .finish()
    }
}

impl CdMesh {
    pub fn new(config: Arc<CdfemConfig>, phase_support: Arc<PhaseSupport>, parts: CdfemParts) -> Self {
        Self {
            config,
            phase_support,
            parts,
            nodes: NodeArena::new(),
            elements: Vec::new(),
            periodic: PeriodicNodeMap::new(),
            stash_step_count: -1,
            prolongation: ProlongationStore::default(),
            child_index: OnceCell::new(),
            old: None,
        }
    }

    /// Attach the previous generation, dropping whatever it held on to.
    pub fn set_old(&mut self, old: Option<Box<CdMesh>>) {
        self.old = old.map(|mut o| {
            o.old = None;
            o
        });
    }

    pub fn old(&self) -> Option<&CdMesh> {
        self.old.as_deref()
    }

    pub fn parts(&self) -> &CdfemParts {
        &self.parts
    }

    pub fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    pub fn elements(&self) -> &[MeshElement] {
        &self.elements
    }

    pub fn stash_step_count(&self) -> i64 {
        self.stash_step_count
    }

    pub fn set_periodic_node_pairs<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (EntityId, EntityId)>,
    {
        self.periodic = PeriodicNodeMap::from_pairs(pairs);
    }

    /// Nonconformal elements of the decomposed blocks: parents, and active
    /// elements that are not children.
    pub fn decomposed_element_selector(&self) -> Selector {
        let p = &self.parts;
        self.phase_support.all_decomposed_blocks_selector()
            & (Selector::from(p.parent) | (Selector::from(p.active) & !Selector::from(p.child)))
    }

    /// Build one [`MeshElement`] per locally owned nonconformal element.
    pub fn generate_nonconformal_elements<M: MeshBulk>(&mut self, mesh: &M) {
        self.nodes.clear();
        self.elements.clear();
        self.invalidate_cache();
        let selector = self.decomposed_element_selector();
        for id in mesh.selected_entities(EntityRank::Element, &selector) {
            let key = EntityKey::element(id);
            let Some(topology) = mesh.topology(key) else {
                continue;
            };
            if !mesh.is_locally_owned(key) {
                continue;
            }
            if !topology.is_supported_element() {
                log::warn!("element {id} has unsupported topology {}; not decomposed", topology.name());
                continue;
            }
            let nodes: Vec<NodeIdx> = mesh
                .entity_nodes(key)
                .iter()
                .map(|&n| self.nodes.add_mesh_node(n, mesh.coordinates(n)))
                .collect();
            self.elements.push(MeshElement::new(id, topology, nodes));
        }
        log::debug!(
            "generated {} nonconformal elements with {} nodes",
            self.elements.len(),
            self.nodes.len()
        );
    }

    pub fn find_mesh_element(&self, id: EntityId) -> Option<&MeshElement> {
        self.element_index(id).map(|i| &self.elements[i])
    }

    pub(crate) fn element_index(&self, id: EntityId) -> Option<usize> {
        self.elements.binary_search_by_key(&id, |e| e.entity).ok()
    }

    /// Parent element of the leaf element entity `child`.
    pub fn find_child_parent(&self, child: EntityId) -> Option<&MeshElement> {
        let index = self.child_index.get_or_init(|| {
            let mut map = BTreeMap::new();
            for (i, elem) in self.elements.iter().enumerate() {
                for leaf in elem.leaves() {
                    if let Some(e) = leaf.entity {
                        map.insert(e, i);
                    }
                }
            }
            map
        });
        index.get(&child).map(|&i| &self.elements[i])
    }

    /// Record the captured level sets on the arena's mesh nodes.
    pub fn set_captured_domains(&mut self, captured: &NodeToCapturedDomainsMap) {
        for (&id, domains) in captured {
            if let Some(idx) = self.nodes.mesh_node(id) {
                self.nodes.get_mut(idx).captured_domains = domains.clone();
            }
        }
    }

    /// Interfaces crossing each element; uncut elements get their phase.
    pub fn set_cutting_interfaces_and_uncut_phases<G: InterfaceGeometry>(&mut self, geometry: &G) {
        let arena = &self.nodes;
        for elem in &mut self.elements {
            let verts = elem.vertex_entities(arena);
            elem.cutting_interfaces = geometry.element_cutting_interfaces(&verts);
            if elem.cutting_interfaces.is_empty() {
                elem.phase = geometry.uncut_element_phase(&verts);
            }
        }
    }

    /// Interfaces cutting an element on any rank, in the order of
    /// [`all_interface_ids`]. Collective.
    pub fn active_interface_ids<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &M,
        geometry: &G,
    ) -> Result<Vec<InterfaceId>, CdMeshError> {
        let mut active = Vec::new();
        for interface in all_interface_ids(geometry) {
            let local = self.elements.iter().any(|e| e.cutting_interfaces.contains(&interface));
            if is_true_on_any(mesh.comm(), local)? {
                active.push(interface);
            }
        }
        Ok(active)
    }

    pub fn triangulate<G: InterfaceGeometry>(&mut self, geometry: &G) {
        for elem in &mut self.elements {
            elem.triangulate(&mut self.nodes, geometry);
        }
    }

    /// Cut the subelements by every interface in turn. Collective.
    ///
    /// Each interface is handled over all elements before the next one, so
    /// the work is proportional to the number of interfaces times the number
    /// of elements, whether or not an element is cut by a given interface.
    pub fn decompose<M: MeshBulk, G: InterfaceGeometry>(&mut self, mesh: &M, geometry: &G) -> Result<(), CdMeshError> {
        for interface in self.active_interface_ids(mesh, geometry)? {
            self.decompose_interface(mesh, geometry, interface)?;
        }
        for elem in &mut self.elements {
            elem.build_quadratic_subelements(&mut self.nodes);
        }
        let arena = &self.nodes;
        for elem in &mut self.elements {
            if elem.have_subelements() {
                elem.determine_leaf_phases(arena, geometry);
            }
        }
        self.invalidate_cache();
        Ok(())
    }

    fn decompose_interface<M: MeshBulk, G: InterfaceGeometry>(
        &mut self,
        mesh: &M,
        geometry: &G,
        interface: InterfaceId,
    ) -> Result<(), CdMeshError> {
        self.nodes.clear_signs_and_scores();
        self.determine_node_signs(geometry, interface);
        sync_node_values::<NodeSign, M>(mesh, &mut self.nodes, &self.periodic)?;

        let created = self.cut_leaf_edges(geometry, interface);
        sync_node_values::<NodeScore, M>(mesh, &mut self.nodes, &self.periodic)?;

        let mut hanging = 0;
        if mesh.parallel_size() > 1 {
            let leaf_edges = self.leaf_edges();
            let built = build_parallel_hanging_edge_nodes(mesh, &mut self.nodes, |a, b| {
                let key = if a <= b { [a, b] } else { [b, a] };
                leaf_edges.contains(&key)
            })?;
            hanging = built.len();
            for idx in built {
                let position = match self.nodes.get(idx).kind {
                    NodeKind::Edge { position, .. } => position,
                    _ => 0.5,
                };
                let node = self.nodes.get_mut(idx);
                node.sign = Some(NodeSign(0));
                node.score = Some(edge_node_score(position));
            }
        }

        let arena = &self.nodes;
        for elem in &mut self.elements {
            if elem.have_subelements() {
                elem.resolve_hanging(arena);
            }
        }
        log::debug!("interface {interface}: {created} edge nodes, {hanging} from other ranks");
        Ok(())
    }

    fn determine_node_signs<G: InterfaceGeometry>(&mut self, geometry: &G, interface: InterfaceId) {
        let arena = &mut self.nodes;
        for elem in self.elements.iter().filter(|e| e.cutting_interfaces.contains(&interface)) {
            for leaf in elem.leaves() {
                for &v in leaf.vertices() {
                    if arena.get(v).sign.is_some() {
                        continue;
                    }
                    let sign = geometry.interface_sign(interface, &arena.stencil(v));
                    arena.get_mut(v).sign = Some(NodeSign(sign));
                }
            }
        }
    }

    /// Create an edge node on every leaf edge whose ends lie on opposite
    /// sides of `interface`.
    fn cut_leaf_edges<G: InterfaceGeometry>(&mut self, geometry: &G, interface: InterfaceId) -> usize {
        let mut cuts: Vec<(NodeIdx, NodeIdx)> = Vec::new();
        for elem in self.elements.iter().filter(|e| e.cutting_interfaces.contains(&interface)) {
            for leaf in elem.leaves() {
                for e in leaf.topology.edges() {
                    let (a, b) = (leaf.nodes[e[0]], leaf.nodes[e[1]]);
                    let (Some(sa), Some(sb)) = (self.nodes.get(a).sign, self.nodes.get(b).sign) else {
                        continue;
                    };
                    if sa.0 * sb.0 < 0 && self.nodes.edge_child(a, b).is_none() {
                        cuts.push((a, b));
                    }
                }
            }
        }
        let mut created = 0;
        for (a, b) in cuts {
            if self.nodes.edge_child(a, b).is_some() {
                continue;
            }
            let (sa, sb) = (self.nodes.stencil(a), self.nodes.stencil(b));
            let Some(position) = geometry.edge_crossing_position(interface, &sa, &sb) else {
                continue;
            };
            let idx = self.nodes.create_edge_node(a, b, position);
            let node = self.nodes.get_mut(idx);
            node.sign = Some(NodeSign(0));
            node.score = Some(edge_node_score(position));
            created += 1;
        }
        created
    }

    fn leaf_edges(&self) -> HashSet<[NodeIdx; 2]> {
        let mut out = HashSet::new();
        for elem in &self.elements {
            for leaf in elem.leaves() {
                for e in leaf.topology.edges() {
                    let (a, b) = (leaf.nodes[e[0]], leaf.nodes[e[1]]);
                    out.insert(if a <= b { [a, b] } else { [b, a] });
                }
            }
        }
        out
    }

    /// Per element, a comparable summary of its decomposition.
    pub fn signatures(&self) -> Vec<(EntityId, ElementSignature)> {
        self.elements
            .iter()
            .map(|e| (e.entity, e.signature(&self.nodes)))
            .collect()
    }
}

impl InvalidateCache for CdMesh {
    fn invalidate_cache(&mut self) {
        self.child_index = OnceCell::new();
    }
}
