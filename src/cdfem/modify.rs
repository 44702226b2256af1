//! Writing a decomposed generation into the mesh.
//!
//! [`CdMesh::modify_mesh`] reuses what it can: child nodes whose ancestry
//! matches a node of the previous generation keep its entity, and leaves whose
//! node entities already span a child element keep that element. Whatever is
//! missing is created inside one modification bracket, old children no longer
//! used are destroyed, interface sides are added in a second bracket and side
//! and node parts are refreshed in a third.

use crate::algs::collectives::is_true_on_any;
use crate::algs::comm_sparse::CommSparse;
use crate::algs::communicator::CommTag;
use crate::cdfem::ancestry::common_sharers;
use crate::cdfem::cdmesh::CdMesh;
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind};
use crate::cdfem::part_rules::{
    PartChange, SideNeighborhood, determine_child_conformal_parts, determine_conformal_parts,
    determine_element_side_parts, determine_nonconformal_parts, element_io_part_changed, is_removable_child_part,
};
use crate::cdfem::phase::{CdfemParts, PhaseSupport, PhaseTag};
use crate::mesh::sharing::{SharedKeyRequest, assign_shared_ids};
use crate::mesh::{MeshBulk, MeshQueryExt, MetaData, PartId, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::cache::InvalidateCache;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet};

const SHARING_TAG: CommTag = CommTag::new(0x1100);
const SIDE_INFO_TAG: CommTag = CommTag::new(0x1110);
const NODE_ACTIVE_TAG: CommTag = CommTag::new(0x1120);

/// A side to create on side `ordinal` of `element`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideRequest {
    pub element: EntityId,
    pub ordinal: usize,
    pub parts: BTreeSet<PartId>,
}

/// Node of `to` with the same ancestry as `idx` in `from`.
pub(crate) fn find_equivalent_node(from: &NodeArena, idx: NodeIdx, to: &NodeArena) -> Option<NodeIdx> {
    let node = from.get(idx);
    match &node.kind {
        NodeKind::Mesh => to.mesh_node(node.entity?),
        NodeKind::Edge { parents, .. } => {
            let a = find_equivalent_node(from, parents[0], to)?;
            let b = find_equivalent_node(from, parents[1], to)?;
            to.edge_child(a, b)
        }
        NodeKind::MidSide { parents } => {
            let a = find_equivalent_node(from, parents[0], to)?;
            let b = find_equivalent_node(from, parents[1], to)?;
            to.midside_child(a, b)
        }
        NodeKind::Child { parents, .. } => {
            let mapped = parents
                .iter()
                .map(|&p| find_equivalent_node(from, p, to))
                .collect::<Option<Vec<_>>>()?;
            to.child_of(&mapped)
        }
        NodeKind::Steiner { .. } => None,
    }
}

/// Give the active part to every element of the decomposed blocks that is
/// neither a parent nor a child yet, and to its nodes.
pub(crate) fn activate_initial_mesh<M: MeshBulk>(
    mesh: &mut M,
    phase_support: &PhaseSupport,
    parts: &CdfemParts,
) -> Result<(), CdMeshError> {
    let selector = phase_support.all_decomposed_blocks_selector()
        & !Selector::from(parts.parent)
        & !Selector::from(parts.child)
        & !Selector::from(parts.active);
    let elements = mesh.selected_entities(EntityRank::Element, &selector);
    let local = !elements.is_empty();
    if !is_true_on_any(mesh.comm(), local)? {
        return Ok(());
    }
    mesh.modification_begin()?;
    let mut nodes = BTreeSet::new();
    for e in elements {
        let key = EntityKey::element(e);
        nodes.extend(mesh.entity_nodes(key).iter().copied());
        mesh.change_entity_parts(key, &[parts.active], &[])?;
    }
    for n in nodes {
        mesh.change_entity_parts(EntityKey::node(n), &[parts.active], &[])?;
    }
    mesh.modification_end()
}

/// Side-rank parts of `side` that its children inherit.
fn inheritable_side_parts(meta: &MetaData, ps: &PhaseSupport, current: &BTreeSet<PartId>) -> BTreeSet<PartId> {
    current
        .iter()
        .copied()
        .filter(|&p| {
            let part = meta.part(p);
            part.primary_rank == Some(EntityRank::Side)
                && (part.io || ps.is_decomposed(p))
                && !ps.is_interface(p)
        })
        .collect()
}

/// Desired parts of an uncut element of `phase`.
fn uncut_element_change(
    meta: &MetaData,
    ps: &PhaseSupport,
    parts: &CdfemParts,
    current: &BTreeSet<PartId>,
    phase: &PhaseTag,
) -> PartChange {
    let mut change = determine_conformal_parts(meta, ps, current, EntityRank::Element, phase);
    change.add.insert(parts.active);
    change.remove.insert(parts.parent);
    change.remove.insert(parts.child);
    change.normalized(current)
}

pub(crate) fn apply_change<M: MeshBulk>(mesh: &mut M, key: EntityKey, change: &PartChange) -> Result<(), CdMeshError> {
    if change.is_empty() {
        return Ok(());
    }
    mesh.change_entity_parts(key, &change.add_vec(), &change.remove_vec())
}

impl CdMesh {
    /// Bring the mesh in line with this generation. Returns whether the mesh
    /// was modified. Collective.
    pub fn modify_mesh<M: MeshBulk>(&mut self, mesh: &mut M) -> Result<bool, CdMeshError> {
        self.set_entities_for_identical_nodes(&*mesh);
        let all_set = self.set_entities_for_existing_child_elements(&*mesh);
        let unused = self.unused_old_child_elements(&*mesh);
        let element_changes = self.element_part_changes(&*mesh);
        let local = !all_set || !unused.is_empty() || element_changes.iter().any(|(_, c)| !c.is_empty());
        if !is_true_on_any(mesh.comm(), local)? {
            log::debug!("decomposition unchanged; mesh left as is");
            return Ok(false);
        }

        let node_ids = self.assign_node_ids(mesh)?;
        let num_new_elements = self.count_new_leaves();
        let element_ids = mesh.generate_new_ids(EntityRank::Element, num_new_elements)?;

        mesh.modification_begin()?;
        self.create_node_entities(mesh, &node_ids)?;
        let mut side_requests = self.create_element_and_side_entities(mesh, element_ids, &element_changes)?;
        delete_unused_entities(mesh, &unused)?;
        mesh.modification_end()?;
        prune_stale_sharing(mesh, EntityRank::Node)?;
        prune_stale_sharing(mesh, EntityRank::Side)?;

        self.add_possible_interface_sides(&*mesh, &mut side_requests);
        batch_create_sides(mesh, &side_requests)?;

        let side_changes = self.determine_side_part_changes(&*mesh)?;
        let node_changes = self.determine_node_activation(&*mesh)?;
        mesh.modification_begin()?;
        for (key, change) in side_changes.iter().chain(&node_changes) {
            apply_change(mesh, *key, change)?;
        }
        mesh.modification_end()?;

        if mesh.has_complete_local_view() {
            self.check_element_side_parts(&*mesh);
        }
        self.invalidate_cache();
        log::info!(
            "mesh modified: {} new nodes, {} new elements, {} unused children removed",
            node_ids.len(),
            num_new_elements,
            unused.len()
        );
        Ok(true)
    }

    fn set_entities_for_identical_nodes<M: MeshBulk>(&mut self, mesh: &M) {
        let Some(old) = self.old.as_deref() else {
            return;
        };
        let indices: Vec<NodeIdx> = self.nodes.indices().collect();
        for idx in indices {
            if self.nodes.get(idx).entity.is_some() {
                continue;
            }
            let entity = find_equivalent_node(&self.nodes, idx, &old.nodes)
                .and_then(|o| old.nodes.get(o).entity)
                .filter(|&e| mesh.is_valid(EntityKey::node(e)));
            if let Some(e) = entity {
                self.nodes.get_mut(idx).entity = Some(e);
            }
        }
    }

    /// Attach leaves to existing elements spanning exactly their nodes.
    /// Returns whether every leaf ended up with an entity and every node
    /// with one too.
    fn set_entities_for_existing_child_elements<M: MeshBulk>(&mut self, mesh: &M) -> bool {
        let arena = &self.nodes;
        let child = self.parts.child;
        let mut all_set = true;
        for elem in &mut self.elements {
            if !elem.have_subelements() {
                continue;
            }
            if elem.is_single_coincident() {
                let parent = elem.entity;
                elem.for_each_leaf_mut(|leaf| leaf.entity = Some(parent));
                continue;
            }
            elem.for_each_leaf_mut(|leaf| {
                leaf.entity = None;
                let conn: Option<Vec<EntityId>> = leaf.nodes.iter().map(|&n| arena.get(n).entity).collect();
                let Some(conn) = conn else {
                    all_set = false;
                    return;
                };
                leaf.entity = mesh
                    .entities_through_relations(&conn, EntityRank::Element)
                    .into_iter()
                    .find(|&e| {
                        let key = EntityKey::element(e);
                        mesh.topology(key) == Some(leaf.topology)
                            && mesh.entity_nodes(key) == conn.as_slice()
                            && mesh.has_part(key, child)
                    });
                all_set &= leaf.entity.is_some();
            });
        }
        self.invalidate_cache();
        all_set
    }

    fn unused_old_child_elements<M: MeshBulk>(&self, mesh: &M) -> Vec<EntityId> {
        let selector = self.phase_support.all_decomposed_blocks_selector() & Selector::from(self.parts.child);
        mesh.selected_entities(EntityRank::Element, &selector)
            .into_iter()
            .filter(|&e| mesh.is_locally_owned(EntityKey::element(e)) && self.find_child_parent(e).is_none())
            .collect()
    }

    fn element_part_changes<M: MeshBulk>(&self, mesh: &M) -> Vec<(EntityKey, PartChange)> {
        let meta = mesh.meta();
        let ps = &*self.phase_support;
        self.elements
            .iter()
            .map(|elem| {
                let key = EntityKey::element(elem.entity);
                let current = mesh.parts(key);
                let change = if elem.have_subelements() && !elem.is_single_coincident() {
                    determine_nonconformal_parts(meta, ps, &self.parts, &current, EntityRank::Element)
                        .normalized(&current)
                } else {
                    let phase = elem.leaves().first().map_or(&elem.phase, |l| &l.phase);
                    if element_io_part_changed(meta, ps, &self.parts, &current, phase) {
                        uncut_element_change(meta, ps, &self.parts, &current, phase)
                    } else {
                        PartChange::default()
                    }
                };
                (key, change)
            })
            .collect()
    }

    /// Ids for the nodes that still have no entity, agreed with the ranks
    /// sharing their ancestors. Collective.
    fn assign_node_ids<M: MeshBulk>(&mut self, mesh: &mut M) -> Result<Vec<(NodeIdx, Vec<usize>)>, CdMeshError> {
        let pending: Vec<NodeIdx> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.entity.is_none())
            .map(|(i, _)| i)
            .collect();
        let requests: Vec<SharedKeyRequest> = pending
            .iter()
            .map(|&idx| SharedKeyRequest {
                key: self.nodes.ancestry_key(idx),
                candidates: common_sharers(&*mesh, &self.nodes.leaf_mesh_nodes(idx))
                    .map(|s| s.into_iter().collect())
                    .unwrap_or_default(),
            })
            .collect();
        let resolved = assign_shared_ids(mesh, EntityRank::Node, &requests)?;
        Ok(pending
            .into_iter()
            .zip(resolved)
            .map(|(idx, r)| {
                self.nodes.get_mut(idx).entity = Some(r.id);
                (idx, r.sharers)
            })
            .collect())
    }

    fn create_node_entities<M: MeshBulk>(&self, mesh: &mut M, created: &[(NodeIdx, Vec<usize>)]) -> Result<(), CdMeshError> {
        let edge_node_parts = [self.parts.active, self.parts.child_edge_node];
        let midside_parts = [self.parts.active];
        for (idx, sharers) in created {
            let node = self.nodes.get(*idx);
            let Some(id) = node.entity else {
                continue;
            };
            let parts: &[PartId] = if matches!(node.kind, NodeKind::MidSide { .. }) {
                &midside_parts
            } else {
                &edge_node_parts
            };
            mesh.declare_node(id, parts)?;
            if !sharers.is_empty() {
                mesh.set_sharing(EntityKey::node(id), sharers);
            }
            if !mesh.is_locally_owned(EntityKey::node(id)) || matches!(node.kind, NodeKind::MidSide { .. }) {
                continue;
            }
            let parents: Vec<EntityId> = node
                .kind
                .parents()
                .iter()
                .filter_map(|&p| self.nodes.get(p).entity)
                .collect();
            if parents.len() != 2 {
                log::debug!("node {id} has {} parents and cannot be restored on restart", parents.len());
            }
            if let (Some(first), Some(last)) = (parents.first(), parents.last()) {
                if let Some(vals) = mesh.field_values_mut(self.parts.parent_node_ids, EntityKey::node(id)) {
                    vals[0] = first.get() as f64;
                    vals[1] = last.get() as f64;
                }
            }
        }
        for (_, node) in self.nodes.iter() {
            if let (false, Some(id)) = (node.is_mesh_node(), node.entity) {
                mesh.set_coordinates(id, node.coords);
            }
        }
        Ok(())
    }

    fn count_new_leaves(&self) -> usize {
        self.elements
            .iter()
            .filter(|e| e.have_subelements() && !e.is_single_coincident())
            .map(|e| e.leaves().iter().filter(|l| l.entity.is_none()).count())
            .sum()
    }

    fn create_element_and_side_entities<M: MeshBulk>(
        &mut self,
        mesh: &mut M,
        ids: Vec<EntityId>,
        changes: &[(EntityKey, PartChange)],
    ) -> Result<Vec<SideRequest>, CdMeshError> {
        let arena = &self.nodes;
        let ps = &*self.phase_support;
        let parts = self.parts;
        let build_internal_sides = self.config.build_internal_sides;
        let mut ids = ids.into_iter();
        let mut side_requests = Vec::new();
        let mut result = Ok(());

        for (elem, (key, change)) in self.elements.iter_mut().zip(changes) {
            if elem.have_subelements() && !elem.is_single_coincident() {
                let parent = elem.entity;
                let parent_parts = mesh.parts(*key);
                elem.for_each_leaf_mut(|leaf| {
                    if result.is_err() {
                        return;
                    }
                    let conn: Vec<EntityId> = leaf.nodes.iter().filter_map(|&n| arena.get(n).entity).collect();
                    let desired = determine_child_conformal_parts(
                        mesh.meta(),
                        ps,
                        &parts,
                        leaf.topology,
                        &parent_parts,
                        EntityRank::Element,
                        &leaf.phase,
                    );
                    let outcome = match leaf.entity {
                        None => match ids.next() {
                            Some(id) => {
                                leaf.entity = Some(id);
                                let desired: Vec<PartId> = desired.iter().copied().collect();
                                mesh.declare_element(id, leaf.topology, &conn, &desired)
                            }
                            None => Err(CdMeshError::IncompatibleDeclaration("too few generated element ids".to_owned())),
                        },
                        Some(existing) => {
                            let k = EntityKey::element(existing);
                            let current = mesh.parts(k);
                            let mut change = PartChange {
                                add: desired.clone(),
                                remove: current
                                    .iter()
                                    .copied()
                                    .filter(|&p| {
                                        mesh.meta().part(p).primary_rank != Some(EntityRank::Node)
                                            && is_removable_child_part(mesh.meta(), ps, &parts, p)
                                            && !desired.contains(&p)
                                    })
                                    .collect(),
                            };
                            change = change.normalized(&current);
                            apply_change(mesh, k, &change)
                        }
                    };
                    if let Err(e) = outcome {
                        result = Err(e);
                        return;
                    }
                    let Some(child) = leaf.entity else {
                        return;
                    };
                    for (ordinal, parent_side) in leaf.parent_side_ids.iter().enumerate() {
                        match parent_side {
                            Some(ps_ord) => {
                                let nodes = mesh.element_side_nodes(parent, *ps_ord);
                                let Some(side) = mesh.find_side(&nodes) else {
                                    continue;
                                };
                                let inherited = inheritable_side_parts(mesh.meta(), ps, &mesh.parts(EntityKey::side(side)));
                                if inherited.is_empty() {
                                    continue;
                                }
                                let side_parts = determine_child_conformal_parts(
                                    mesh.meta(),
                                    ps,
                                    &parts,
                                    leaf.topology.side_topology(),
                                    &inherited,
                                    EntityRank::Side,
                                    &leaf.phase,
                                );
                                side_requests.push(SideRequest {
                                    element: child,
                                    ordinal,
                                    parts: side_parts,
                                });
                            }
                            None if build_internal_sides => {
                                side_requests.push(SideRequest {
                                    element: child,
                                    ordinal,
                                    parts: BTreeSet::from([parts.internal_side]),
                                });
                            }
                            None => {}
                        }
                    }
                });
                std::mem::replace(&mut result, Ok(()))?;
            }
            apply_change(mesh, *key, change)?;
        }
        self.invalidate_cache();
        Ok(side_requests)
    }

    /// Sides of active elements whose nodes all touch two or more conformal
    /// volume parts. Some of them lie inside one phase; their parts are
    /// sorted out with the other sides.
    fn add_possible_interface_sides<M: MeshBulk>(&self, mesh: &M, requests: &mut Vec<SideRequest>) {
        let meta = mesh.meta();
        let selector = self.phase_support.all_decomposed_blocks_selector() & Selector::from(self.parts.active);
        for elem in mesh.selected_entities(EntityRank::Element, &selector) {
            let key = EntityKey::element(elem);
            let Some(topology) = mesh.topology(key) else {
                continue;
            };
            if !mesh.is_locally_owned(key) {
                continue;
            }
            for ordinal in 0..topology.num_sides() {
                let nodes = mesh.element_side_nodes(elem, ordinal);
                let mut common: Option<BTreeSet<PartId>> = None;
                for &n in &nodes {
                    let conformal: BTreeSet<PartId> = mesh
                        .parts(EntityKey::node(n))
                        .into_iter()
                        .filter(|&p| {
                            self.phase_support.is_conformal(p) && meta.part(p).primary_rank == Some(EntityRank::Element)
                        })
                        .collect();
                    common = Some(match common {
                        None => conformal,
                        Some(c) => c.intersection(&conformal).copied().collect(),
                    });
                }
                if common.is_some_and(|c| c.len() > 1) {
                    let side_topology = topology.side_topology();
                    requests.push(SideRequest {
                        element: elem,
                        ordinal,
                        parts: meta.topology_part(side_topology).into_iter().collect(),
                    });
                }
            }
        }
    }

    /// Part changes of every side touching the decomposed blocks, with the
    /// adjacent element parts combined over the sharing ranks. Collective.
    pub(crate) fn determine_side_part_changes<M: MeshBulk>(&self, mesh: &M) -> Result<Vec<(EntityKey, PartChange)>, CdMeshError> {
        let blocks = self.phase_support.all_decomposed_blocks_selector();
        let mut around: BTreeMap<EntityId, SideNeighborhood> = BTreeMap::new();
        for side in mesh.entity_ids(EntityRank::Side) {
            let elements = mesh.side_elements(side);
            if !elements.iter().any(|&e| mesh.in_selector(EntityKey::element(e), &blocks)) {
                continue;
            }
            let mut info = SideNeighborhood::default();
            for e in elements {
                let key = EntityKey::element(e);
                let parts = mesh.parts(key);
                info.any_active |= parts.contains(&self.parts.active);
                info.element_parts.extend(
                    parts
                        .into_iter()
                        .filter(|&p| mesh.meta().part(p).primary_rank == Some(EntityRank::Element)),
                );
            }
            around.insert(side, info);
        }

        if mesh.parallel_size() > 1 {
            let received = {
                let mut sparse = CommSparse::new(mesh.comm());
                for (&side, info) in &around {
                    for p in mesh.sharing_procs(EntityKey::side(side)) {
                        let buf = sparse.send_buffer(p);
                        buf.pack_u64(side.get());
                        buf.pack_bool(info.any_active);
                        buf.pack_usize(info.element_parts.len());
                        for part in &info.element_parts {
                            buf.pack_u32(part.0);
                        }
                    }
                }
                sparse.communicate(SIDE_INFO_TAG)?
            };
            for (_, mut buf) in received {
                while buf.remaining() {
                    let side = EntityId::new(buf.unpack_u64()?)?;
                    let active = buf.unpack_bool()?;
                    let n = buf.unpack_usize()?;
                    let mut remote = BTreeSet::new();
                    for _ in 0..n {
                        remote.insert(PartId(buf.unpack_u32()?));
                    }
                    if let Some(info) = around.get_mut(&side) {
                        info.any_active |= active;
                        info.element_parts.extend(remote);
                    }
                }
            }
        }

        Ok(around
            .into_iter()
            .map(|(side, info)| {
                let key = EntityKey::side(side);
                let current = mesh.parts(key);
                let change = determine_element_side_parts(mesh.meta(), &self.phase_support, &self.parts, &current, &info);
                (key, change)
            })
            .filter(|(_, c)| !c.is_empty())
            .collect())
    }

    /// A node is active when any element using it is. Collective.
    pub(crate) fn determine_node_activation<M: MeshBulk>(&self, mesh: &M) -> Result<Vec<(EntityKey, PartChange)>, CdMeshError> {
        let blocks = self.phase_support.all_decomposed_blocks_selector();
        let mut active: BTreeMap<EntityId, bool> = BTreeMap::new();
        for elem in mesh.selected_entities(EntityRank::Element, &blocks) {
            let is_active = mesh.has_part(EntityKey::element(elem), self.parts.active);
            for &n in mesh.entity_nodes(EntityKey::element(elem)) {
                *active.entry(n).or_default() |= is_active;
            }
        }
        if mesh.parallel_size() > 1 {
            let received = {
                let mut sparse = CommSparse::new(mesh.comm());
                for (&n, &a) in &active {
                    for p in mesh.sharing_procs(EntityKey::node(n)) {
                        let buf = sparse.send_buffer(p);
                        buf.pack_u64(n.get());
                        buf.pack_bool(a);
                    }
                }
                sparse.communicate(NODE_ACTIVE_TAG)?
            };
            for (_, mut buf) in received {
                while buf.remaining() {
                    let n = EntityId::new(buf.unpack_u64()?)?;
                    let a = buf.unpack_bool()?;
                    if let Some(v) = active.get_mut(&n) {
                        *v |= a;
                    }
                }
            }
        }
        Ok(active
            .into_iter()
            .filter_map(|(n, a)| {
                let key = EntityKey::node(n);
                let has = mesh.has_part(key, self.parts.active);
                let mut change = PartChange::default();
                match (a, has) {
                    (true, false) => {
                        change.add.insert(self.parts.active);
                    }
                    (false, true) => {
                        change.remove.insert(self.parts.active);
                    }
                    _ => return None,
                }
                Some((key, change))
            })
            .collect())
    }

    /// Every active side between two active elements of different phases
    /// must carry their interface part.
    pub(crate) fn check_element_side_parts<M: MeshBulk>(&self, mesh: &M) {
        let ps = &*self.phase_support;
        for side in mesh.entity_ids(EntityRank::Side) {
            let key = EntityKey::side(side);
            let side_parts = mesh.parts(key);
            if !side_parts.contains(&self.parts.active) {
                continue;
            }
            let mut conformal = BTreeSet::new();
            for e in mesh.side_elements(side) {
                let parts = mesh.parts(EntityKey::element(e));
                if !parts.contains(&self.parts.active) {
                    continue;
                }
                conformal.extend(
                    parts
                        .into_iter()
                        .filter(|&p| ps.is_conformal(p) && mesh.meta().part(p).primary_rank == Some(EntityRank::Element)),
                );
            }
            crate::cdfem_require!(
                conformal.len() <= 2,
                "side {side} touches {} conformal volume parts",
                conformal.len()
            );
            let c: Vec<PartId> = conformal.into_iter().collect();
            if c.len() == 2 && ps.iopart_phase(c[0]) != ps.iopart_phase(c[1]) {
                if let Some(iface) = ps.find_interface_part(c[0], c[1]) {
                    crate::cdfem_require!(
                        side_parts.contains(&iface),
                        "side {side} between two phases is missing its interface part"
                    );
                }
            }
        }
    }
}

/// Destroy unused child elements, then sides and nodes they leave behind.
fn delete_unused_entities<M: MeshBulk>(mesh: &mut M, unused: &[EntityId]) -> Result<(), CdMeshError> {
    let mut nodes: BTreeSet<EntityId> = BTreeSet::new();
    for &e in unused {
        let key = EntityKey::element(e);
        nodes.extend(mesh.entity_nodes(key).iter().copied());
        mesh.destroy_entity(key)?;
    }
    let sides: BTreeSet<EntityId> = nodes
        .iter()
        .flat_map(|&n| mesh.node_upward(n, EntityRank::Side))
        .collect();
    for s in sides {
        if mesh.side_elements(s).is_empty() {
            let key = EntityKey::side(s);
            nodes.extend(mesh.entity_nodes(key).iter().copied());
            mesh.destroy_entity(key)?;
        }
    }
    for n in nodes {
        if mesh.node_upward(n, EntityRank::Element).is_empty() && mesh.node_upward(n, EntityRank::Side).is_empty() {
            mesh.destroy_entity(EntityKey::node(n))?;
        }
    }
    Ok(())
}

/// Drop sharing ranks that no longer hold a copy of the entity. Collective.
fn prune_stale_sharing<M: MeshBulk>(mesh: &mut M, rank: EntityRank) -> Result<(), CdMeshError> {
    if mesh.parallel_size() == 1 {
        return Ok(());
    }
    let shared: Vec<(EntityId, Vec<usize>)> = mesh
        .entity_ids(rank)
        .into_iter()
        .map(|id| (id, mesh.sharing_procs(EntityKey::new(rank, id))))
        .filter(|(_, procs)| !procs.is_empty())
        .collect();
    let received = {
        let mut sparse = CommSparse::new(mesh.comm());
        for (id, procs) in &shared {
            for &p in procs {
                sparse.send_buffer(p).pack_u64(id.get());
            }
        }
        sparse.communicate(SHARING_TAG.offset(rank as u16))?
    };
    let mut held: BTreeMap<usize, BTreeSet<u64>> = BTreeMap::new();
    for (src, mut buf) in received {
        let ids = held.entry(src).or_default();
        while buf.remaining() {
            ids.insert(buf.unpack_u64()?);
        }
    }
    for (id, procs) in shared {
        let keep: Vec<usize> = procs
            .iter()
            .copied()
            .filter(|p| held.get(p).is_some_and(|ids| ids.contains(&id.get())))
            .collect();
        if keep.len() != procs.len() {
            mesh.set_sharing(EntityKey::new(rank, id), &keep);
        }
    }
    Ok(())
}

/// Create the requested sides that do not exist yet, agreeing on ids with
/// the ranks sharing their nodes. Existing sides get the requested parts.
/// Collective.
fn batch_create_sides<M: MeshBulk>(mesh: &mut M, requests: &[SideRequest]) -> Result<(), CdMeshError> {
    let mut existing: Vec<(EntityId, BTreeSet<PartId>)> = Vec::new();
    let mut missing: BTreeMap<Vec<u64>, (Vec<EntityId>, crate::topology::cell_type::Topology, BTreeSet<PartId>)> =
        BTreeMap::new();
    for req in requests {
        let key = EntityKey::element(req.element);
        let Some(topology) = mesh.topology(key) else {
            continue;
        };
        let nodes = mesh.element_side_nodes(req.element, req.ordinal);
        if let Some(side) = mesh.find_side(&nodes) {
            existing.push((side, req.parts.clone()));
            continue;
        }
        let mut sorted: Vec<u64> = nodes.iter().map(|n| n.get()).collect();
        sorted.sort_unstable();
        missing
            .entry(sorted)
            .or_insert_with(|| (nodes, topology.side_topology(), BTreeSet::new()))
            .2
            .extend(req.parts.iter().copied());
    }

    let keys: Vec<(Vec<u64>, (Vec<EntityId>, crate::topology::cell_type::Topology, BTreeSet<PartId>))> =
        missing.into_iter().collect();
    let shared_requests: Vec<SharedKeyRequest> = keys
        .iter()
        .map(|(key, (nodes, _, _))| SharedKeyRequest {
            key: key.clone(),
            candidates: common_sharers(&*mesh, &nodes.iter().copied().collect::<BTreeSet<_>>())
                .map(|s| s.into_iter().collect())
                .unwrap_or_default(),
        })
        .collect();
    let resolved = assign_shared_ids(mesh, EntityRank::Side, &shared_requests)?;

    mesh.modification_begin()?;
    for ((_, (nodes, topology, parts)), r) in keys.iter().zip(&resolved) {
        let parts: Vec<PartId> = parts.iter().copied().collect();
        mesh.declare_side(r.id, *topology, nodes, &parts)?;
        if !r.sharers.is_empty() {
            mesh.set_sharing(EntityKey::side(r.id), &r.sharers);
        }
    }
    for (side, parts) in existing {
        let parts: Vec<PartId> = parts.into_iter().collect();
        mesh.change_entity_parts(EntityKey::side(side), &parts, &[])?;
    }
    mesh.modification_end()?;
    log::debug!("created {} sides", resolved.len());
    Ok(())
}
