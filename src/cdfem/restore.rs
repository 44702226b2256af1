//! Rebuilding the decomposition of a mesh that already holds child elements.
//!
//! After a restart or a rebalance only the mesh survives. Child elements are
//! recognized by their edge nodes, whose two parent node ids live in the
//! `parent_node_ids` field; following those ids recursively gives back the
//! edge node ancestry and the parent element, so the subelement hierarchy
//! can be rebuilt without cutting anything.

use crate::algs::collectives::is_true_on_any;
use crate::cdfem::cdmesh::CdMesh;
use crate::cdfem::element::SubElement;
use crate::cdfem::modify::apply_change;
use crate::cdfem::node::NodeIdx;
use crate::cdfem::phase::PhaseTag;
use crate::geometry::metrics::distance_squared;
use crate::mesh::{MeshBulk, MeshQueryExt, PartId, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::cache::InvalidateCache;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet};

/// Add and remove the same parts on every entity of `entities`, inside a
/// bracket opened only when some rank has work. Collective.
fn batch_change_entity_parts<M: MeshBulk>(
    mesh: &mut M,
    entities: &[EntityKey],
    add: &[PartId],
    remove: &[PartId],
) -> Result<(), CdMeshError> {
    if !is_true_on_any(mesh.comm(), !entities.is_empty())? {
        return Ok(());
    }
    mesh.modification_begin()?;
    for &key in entities {
        mesh.change_entity_parts(key, add, remove)?;
    }
    mesh.modification_end()
}

fn edge_node_parent_ids<M: MeshBulk>(mesh: &M, field: crate::mesh::FieldId, node: EntityId) -> Option<[EntityId; 2]> {
    let vals = mesh.field_values(field, EntityKey::node(node))?;
    let a = EntityId::from_raw_opt(*vals.first()? as u64)?;
    let b = EntityId::from_raw_opt(*vals.get(1)? as u64)?;
    Some([a, b])
}

/// Relative position of `x` between `a` and `b`.
fn child_position(a: [f64; 3], b: [f64; 3], x: [f64; 3]) -> f64 {
    let length = distance_squared(a, b).sqrt();
    if length == 0.0 {
        return 0.5;
    }
    (distance_squared(a, x).sqrt() / length).clamp(0.0, 1.0)
}

impl CdMesh {
    fn is_child_edge_node<M: MeshBulk>(&self, mesh: &M, node: EntityId) -> bool {
        mesh.has_part(EntityKey::node(node), self.parts.child_edge_node)
    }

    /// Background mesh nodes `node` descends from.
    fn root_nodes<M: MeshBulk>(&self, mesh: &M, node: EntityId, out: &mut BTreeSet<EntityId>) {
        if self.is_child_edge_node(mesh, node) {
            if let Some(parents) = edge_node_parent_ids(mesh, self.parts.parent_node_ids, node) {
                for p in parents {
                    self.root_nodes(mesh, p, out);
                }
                return;
            }
        }
        out.insert(node);
    }

    /// Element of the background mesh that the child element `elem` was
    /// cut from.
    pub fn parent_element<M: MeshBulk>(&self, mesh: &M, elem: EntityId) -> Option<EntityId> {
        let key = EntityKey::element(elem);
        let num_vertices = mesh.topology(key)?.num_vertices();
        let mut roots = BTreeSet::new();
        for &n in &mesh.entity_nodes(key)[..num_vertices] {
            self.root_nodes(mesh, n, &mut roots);
        }
        let roots: Vec<EntityId> = roots.into_iter().collect();
        let parent = mesh
            .entities_through_relations(&roots, EntityRank::Element)
            .into_iter()
            .find(|&e| e != elem && !mesh.has_part(EntityKey::element(e), self.parts.child));
        if parent.is_none() {
            log::warn!("no parent element found for element {elem}");
        }
        parent
    }

    /// Put elements that use child edge nodes in the child part. Collective.
    pub fn rebuild_child_part<M: MeshBulk>(&self, mesh: &mut M) -> Result<(), CdMeshError> {
        let ps = &self.phase_support;
        let nonconformal = Selector::any_of(
            mesh.meta()
                .parts()
                .iter()
                .map(|p| p.id)
                .filter(|&p| ps.is_nonconformal(p)),
        );
        let selector = ps.all_decomposed_blocks_selector() & !Selector::from(self.parts.child) & !nonconformal;
        let wrong: Vec<EntityKey> = mesh
            .selected_entities(EntityRank::Element, &selector)
            .into_iter()
            .map(EntityKey::element)
            .filter(|&k| mesh.is_locally_owned(k))
            .filter(|&k| mesh.entity_nodes(k).iter().any(|&n| self.is_child_edge_node(&*mesh, n)))
            .collect();
        batch_change_entity_parts(mesh, &wrong, &[self.parts.child], &[])
    }

    /// Parents of child elements become inactive parents; every other element
    /// of the decomposed blocks is active. Nonconformal sides are inactive.
    /// Collective.
    pub fn rebuild_parent_and_active_parts<M: MeshBulk>(&self, mesh: &mut M) -> Result<(), CdMeshError> {
        let p = self.parts;
        let children = mesh.selected_entities(EntityRank::Element, &Selector::from(p.child));
        let mut parents = BTreeSet::new();
        for child in children {
            if !mesh.is_locally_owned(EntityKey::element(child)) {
                continue;
            }
            let parent = self.parent_element(&*mesh, child);
            crate::cdfem_require!(parent.is_some(), "child element {child} has no parent element");
            parents.extend(parent);
        }
        let wrong_parents: Vec<EntityKey> = parents
            .into_iter()
            .map(EntityKey::element)
            .filter(|&k| mesh.has_part(k, p.active) || !mesh.has_part(k, p.parent))
            .collect();
        batch_change_entity_parts(mesh, &wrong_parents, &[p.parent], &[p.active])?;

        let inactive_leaves = self.phase_support.all_decomposed_blocks_selector()
            & !Selector::from(p.parent)
            & !Selector::from(p.active);
        let wrong_leaves: Vec<EntityKey> = mesh
            .selected_entities(EntityRank::Element, &inactive_leaves)
            .into_iter()
            .map(EntityKey::element)
            .filter(|&k| mesh.is_locally_owned(k))
            .collect();
        batch_change_entity_parts(mesh, &wrong_leaves, &[p.active], &[])?;

        let ps = &self.phase_support;
        let nonconformal_sides = Selector::any_of(
            mesh.meta()
                .parts()
                .iter()
                .map(|p| p.id)
                .filter(|&part| ps.is_nonconformal(part) && mesh.meta().part(part).primary_rank == Some(EntityRank::Side)),
        );
        let wrong_sides: Vec<EntityKey> = mesh
            .selected_entities(EntityRank::Side, &(Selector::from(p.active) & nonconformal_sides))
            .into_iter()
            .map(EntityKey::side)
            .filter(|&k| mesh.is_locally_owned(k))
            .collect();
        batch_change_entity_parts(mesh, &wrong_sides, &[], &[p.active])
    }

    fn element_phase<M: MeshBulk>(&self, mesh: &M, elem: EntityId) -> PhaseTag {
        mesh.parts(EntityKey::element(elem))
            .into_iter()
            .find_map(|p| self.phase_support.iopart_phase(p).cloned())
            .unwrap_or_default()
    }

    /// Arena node of the mesh node `node`, rebuilding edge node ancestry from
    /// the stored parent ids.
    fn find_or_build_edge_node<M: MeshBulk>(
        &mut self,
        mesh: &M,
        node: EntityId,
        by_id: &mut BTreeMap<EntityId, NodeIdx>,
    ) -> Option<NodeIdx> {
        if let Some(&idx) = by_id.get(&node) {
            return Some(idx);
        }
        let Some([p0, p1]) = edge_node_parent_ids(mesh, self.parts.parent_node_ids, node) else {
            log::warn!("node {node} has no parent ids and cannot be restored");
            return None;
        };
        let a = self.find_or_build_edge_node(mesh, p0, by_id)?;
        let b = self.find_or_build_edge_node(mesh, p1, by_id)?;
        let position = child_position(self.nodes.get(a).coords, self.nodes.get(b).coords, mesh.coordinates(node));
        let idx = self.nodes.create_edge_node(a, b, position);
        let restored = self.nodes.get_mut(idx);
        restored.entity = Some(node);
        restored.coords = mesh.coordinates(node);
        by_id.insert(node, idx);
        Some(idx)
    }

    /// Attach every locally owned child element to its nonconformal element.
    /// Uncut elements get the phase of their conformal part.
    pub fn restore_subelements<M: MeshBulk>(&mut self, mesh: &M) -> Result<(), CdMeshError> {
        let mut by_id: BTreeMap<EntityId, NodeIdx> = self
            .nodes
            .iter()
            .filter_map(|(idx, n)| n.entity.map(|e| (e, idx)))
            .collect();
        let children = mesh.selected_entities(EntityRank::Element, &Selector::from(self.parts.child));
        let mut restored = 0usize;
        for child in children {
            let key = EntityKey::element(child);
            if !mesh.is_locally_owned(key) {
                continue;
            }
            let Some(topology) = mesh.topology(key) else {
                continue;
            };
            let parent = self.parent_element(mesh, child);
            crate::cdfem_require!(parent.is_some(), "child element {child} has no parent element");
            let Some(elem_index) = parent.and_then(|p| self.element_index(p)) else {
                crate::cdfem_require!(false, "parent of child element {child} is not a nonconformal element");
                continue;
            };

            let base = topology.base_topology();
            let conn = mesh.entity_nodes(key).to_vec();
            let mut vertices = Vec::with_capacity(base.num_vertices());
            for &n in &conn[..base.num_vertices()] {
                let Some(idx) = self.find_or_build_edge_node(mesh, n, &mut by_id) else {
                    return Err(CdMeshError::MissingEntity {
                        rank: EntityRank::Node,
                        id: n,
                    });
                };
                vertices.push(idx);
            }
            let phase = self.element_phase(mesh, child);
            let mut subelement = SubElement::new(base, vertices.clone(), vec![None; base.num_sides()], phase.clone());
            if topology.is_quadratic() {
                let mut nodes = vertices.clone();
                for (e, edge) in base.edges().iter().enumerate() {
                    let entity = conn[topology.edge_midside_node(e)];
                    let mid = self.nodes.create_midside_node(vertices[edge[0]], vertices[edge[1]], Some(entity));
                    by_id.insert(entity, mid);
                    nodes.push(mid);
                }
                let mut quadratic = SubElement::new(topology, nodes, vec![None; base.num_sides()], phase);
                quadratic.entity = Some(child);
                subelement.children.push(quadratic);
            } else {
                subelement.entity = Some(child);
            }
            self.elements[elem_index].subelements.push(subelement);
            restored += 1;
        }

        for i in 0..self.elements.len() {
            if !self.elements[i].have_subelements() {
                let entity = self.elements[i].entity;
                self.elements[i].phase = self.element_phase(mesh, entity);
            }
        }
        self.invalidate_cache();
        log::debug!("restored {restored} child elements");
        Ok(())
    }

    /// Refresh node activation and side parts from the element parts.
    /// Collective.
    pub(crate) fn update_side_and_node_parts<M: MeshBulk>(&self, mesh: &mut M) -> Result<(), CdMeshError> {
        let node_changes = self.determine_node_activation(&*mesh)?;
        let side_changes = self.determine_side_part_changes(&*mesh)?;
        mesh.modification_begin()?;
        for (key, change) in node_changes.iter().chain(&side_changes) {
            apply_change(mesh, *key, change)?;
        }
        mesh.modification_end()
    }

    /// Destroy inactive sides that no parent element holds on to. Collective.
    fn delete_extraneous_inactive_sides<M: MeshBulk>(&self, mesh: &mut M) -> Result<(), CdMeshError> {
        let sides: Vec<EntityId> = mesh
            .selected_entities(EntityRank::Side, &!Selector::from(self.parts.active))
            .into_iter()
            .filter(|&s| {
                !mesh
                    .side_elements(s)
                    .into_iter()
                    .any(|e| mesh.has_part(EntityKey::element(e), self.parts.parent))
            })
            .collect();
        if !is_true_on_any(mesh.comm(), !sides.is_empty())? {
            return Ok(());
        }
        mesh.modification_begin()?;
        for s in &sides {
            mesh.destroy_entity(EntityKey::side(*s))?;
        }
        mesh.modification_end()?;
        log::debug!("deleted {} inactive sides", sides.len());
        Ok(())
    }

    /// Rebuild this generation from a mesh read back from a restart file.
    /// Collective.
    pub fn rebuild_from_restart_mesh<M: MeshBulk>(&mut self, mesh: &mut M) -> Result<(), CdMeshError> {
        self.rebuild_child_part(mesh)?;
        self.rebuild_parent_and_active_parts(mesh)?;
        self.generate_nonconformal_elements(&*mesh);
        self.restore_subelements(&*mesh)?;
        self.update_side_and_node_parts(mesh)?;
        self.delete_extraneous_inactive_sides(mesh)
    }

    /// Rebuild this generation from the current mesh after its elements
    /// moved between ranks.
    pub fn rebuild_after_rebalance<M: MeshBulk>(&mut self, mesh: &M) -> Result<(), CdMeshError> {
        self.prolongation.clear();
        self.generate_nonconformal_elements(mesh);
        self.restore_subelements(mesh)
    }
}
