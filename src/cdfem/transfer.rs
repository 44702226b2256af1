//! Carrying field data from one generation to the next.
//!
//! Before the mesh is modified, the previous generation stashes node values
//! around everything that changes, the values of every element it owns, and
//! its interface sides as facets. Once the new entities exist, each new node
//! takes its values from (in order) its own stashed data when it did not
//! move, the parent stencil for interpolated fields, the closest old facet
//! carrying its fields, or the closest stashed node. On more than one rank the
//! facets are shipped to the ranks whose padded node box they touch; the
//! padding grows until no rank misses a facet and the CDFEM displacements fit
//! inside it.

use crate::algs::collectives::{global_max_scalar, is_true_on_any};
use crate::algs::comm_sparse::CommSparse;
use crate::algs::communicator::CommTag;
use crate::cdfem::cdmesh::CdMesh;
use crate::cdfem::cfl::maximum_cdfem_displacement;
use crate::cdfem::diagnostics::{entity_measure, max_element_size};
use crate::cdfem::element::MeshElement;
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind};
use crate::cdfem::prolongation::{
    FacetLookup, FieldValues, ProlongationElementData, ProlongationFields, ProlongationNodeData, ProlongationStore,
};
use crate::geometry::bounding_box::BoundingBox;
use crate::geometry::metrics::{distance_squared, norm};
use crate::mesh::{FieldId, MeshBulk, MeshQueryExt, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::BTreeSet;

const STASH_TAG: CommTag = CommTag::new(0x1200);
const MAX_PADDING_PASSES: usize = 50;

fn same_position(a: [f64; 3], b: [f64; 3]) -> bool {
    let tol = 1e-12 * (1.0 + norm(a));
    distance_squared(a, b) <= tol * tol
}

fn stash_values<M: MeshBulk>(mesh: &M, key: EntityKey, fields: &[FieldId]) -> FieldValues {
    fields
        .iter()
        .filter_map(|&f| mesh.field_values(f, key).map(|v| (f, v.to_vec())))
        .collect()
}

fn write_values<M: MeshBulk>(mesh: &mut M, key: EntityKey, values: &FieldValues) {
    for (&f, v) in values {
        if let Some(dst) = mesh.field_values_mut(f, key) {
            if dst.len() == v.len() {
                dst.copy_from_slice(v);
            }
        }
    }
}

/// Fields of `candidates` defined on the entity.
fn defined_fields<M: MeshBulk>(mesh: &M, key: EntityKey, candidates: &[FieldId]) -> Vec<FieldId> {
    candidates
        .iter()
        .copied()
        .filter(|&f| mesh.field_values(f, key).is_some())
        .collect()
}

/// Outcome of prolonging one node.
enum NodeOutcome {
    Done,
    MissingRemote,
    Failed,
}

fn prolongate_node<M: MeshBulk>(
    mesh: &mut M,
    arena: &NodeArena,
    idx: NodeIdx,
    store: &ProlongationStore,
    fields: &ProlongationFields,
) -> NodeOutcome {
    let node = arena.get(idx);
    let Some(id) = node.entity else {
        return NodeOutcome::Done;
    };
    let key = EntityKey::node(id);
    let x = mesh.coordinates(id);
    let needed = defined_fields(&*mesh, key, &fields.node);
    if needed.is_empty() {
        return NodeOutcome::Done;
    }

    let own = store.node(id);
    if let Some(data) = own.filter(|d| same_position(d.coords, x) && d.has_fields(&needed)) {
        let values: FieldValues = needed.iter().filter_map(|f| data.fields.get(f).map(|v| (*f, v.clone()))).collect();
        write_values(mesh, key, &values);
        return NodeOutcome::Done;
    }
    if node.is_mesh_node() && own.is_none() {
        // Unchanged region: the mesh already holds the right values.
        return NodeOutcome::Done;
    }

    let mut remaining = needed.clone();
    if !node.is_mesh_node() && !fields.interpolation.is_empty() {
        let stencil = arena.stencil(idx);
        let mut interpolated = FieldValues::new();
        for &f in needed.iter().filter(|f| fields.interpolation.contains(f)) {
            let mut acc: Option<Vec<f64>> = None;
            let mut complete = true;
            for &(parent, w) in &stencil {
                let value = store
                    .node(parent)
                    .and_then(|d| d.fields.get(&f).cloned())
                    .or_else(|| mesh.field_values(f, EntityKey::node(parent)).map(<[f64]>::to_vec));
                let Some(v) = value else {
                    complete = false;
                    break;
                };
                let a = acc.get_or_insert_with(|| vec![0.0; v.len()]);
                for (ai, vi) in a.iter_mut().zip(&v) {
                    *ai += w * vi;
                }
            }
            if let (true, Some(a)) = (complete, acc) {
                interpolated.insert(f, a);
            }
        }
        remaining.retain(|f| !interpolated.contains_key(f));
        write_values(mesh, key, &interpolated);
        if remaining.is_empty() {
            return NodeOutcome::Done;
        }
    }

    match store.find_facet_values(&remaining, &x) {
        FacetLookup::Found(values) => {
            write_values(mesh, key, &values);
            NodeOutcome::Done
        }
        FacetLookup::MissingRemote => NodeOutcome::MissingRemote,
        FacetLookup::Unavailable => match store.nearest_node(&remaining, &x) {
            Some(data) => {
                let values: FieldValues =
                    remaining.iter().filter_map(|f| data.fields.get(f).map(|v| (*f, v.clone()))).collect();
                write_values(mesh, key, &values);
                NodeOutcome::Done
            }
            None => {
                log::warn!("no prolongation source found for node {id} at {x:?}");
                NodeOutcome::Failed
            }
        },
    }
}

impl CdMesh {
    /// Make sure a previous generation exists and stash its field data
    /// against this generation. Collective.
    pub(crate) fn build_and_stash_old_mesh<M: MeshBulk>(&mut self, mesh: &M, step_count: i64) -> Result<(), CdMeshError> {
        let fields = ProlongationFields::from_config(mesh.meta(), &self.config, &self.parts)?;
        let step = match self.old {
            Some(_) => step_count,
            None => {
                let mut old = CdMesh::new(self.config.clone(), self.phase_support.clone(), self.parts);
                old.generate_nonconformal_elements(mesh);
                self.old = Some(Box::new(old));
                -1
            }
        };
        if let Some(old) = self.old.as_deref_mut() {
            old.stash_field_data(mesh, step, &self.elements, &fields)?;
        }
        Ok(())
    }

    /// Snapshot the field data of this (old) generation. `new_elements` are
    /// the elements of the generation about to replace it. Collective.
    pub(crate) fn stash_field_data<M: MeshBulk>(
        &mut self,
        mesh: &M,
        step_count: i64,
        new_elements: &[MeshElement],
        fields: &ProlongationFields,
    ) -> Result<(), CdMeshError> {
        self.stash_step_count = step_count;
        self.prolongation.clear();
        let node_fields: Vec<FieldId> = fields
            .node
            .iter()
            .chain(&fields.interpolation)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut nodes = self.changed_nodes(mesh, new_elements)?;
        let child = Selector::from(self.parts.child);
        for e in mesh.selected_entities(EntityRank::Element, &child) {
            let key = EntityKey::element(e);
            if mesh.is_locally_owned(key) {
                nodes.extend(mesh.entity_nodes(key).iter().copied());
            }
        }
        nodes.extend(self.inter_block_nodes(mesh));

        for n in nodes {
            let key = EntityKey::node(n);
            if !mesh.is_valid(key) || !mesh.has_part(key, self.parts.active) {
                continue;
            }
            self.prolongation.insert_node(ProlongationNodeData {
                id: n,
                coords: mesh.coordinates(n),
                fields: stash_values(mesh, key, &node_fields),
            });
        }

        for side in self.interface_facet_sides(mesh) {
            self.prolongation.add_facet(mesh.entity_nodes(EntityKey::side(side)).to_vec());
        }
        self.stash_element_field_data(mesh, &fields.element);
        log::debug!(
            "stashed {} nodes and {} facets at step {step_count}",
            self.prolongation.num_nodes(),
            self.prolongation.num_facets()
        );
        Ok(())
    }

    /// Nodes of new elements that are cut or changed phase, completed with
    /// the ones other ranks report for shared nodes. Collective.
    fn changed_nodes<M: MeshBulk>(&self, mesh: &M, new_elements: &[MeshElement]) -> Result<BTreeSet<EntityId>, CdMeshError> {
        let mut nodes = BTreeSet::new();
        for elem in new_elements {
            let changed = elem.have_subelements()
                || self.find_mesh_element(elem.entity).is_none_or(|old| old.phase != elem.phase);
            if changed {
                nodes.extend(mesh.entity_nodes(EntityKey::element(elem.entity)).iter().copied());
            }
        }
        if mesh.parallel_size() > 1 {
            let received = {
                let mut sparse = CommSparse::new(mesh.comm());
                for &n in &nodes {
                    for p in mesh.sharing_procs(EntityKey::node(n)) {
                        sparse.send_buffer(p).pack_u64(n.get());
                    }
                }
                sparse.communicate(STASH_TAG)?
            };
            for (_, mut buf) in received {
                while buf.remaining() {
                    nodes.insert(EntityId::new(buf.unpack_u64()?)?);
                }
            }
        }
        Ok(nodes)
    }

    /// Active nodes on or shared with this rank that touch more than one
    /// volume io part.
    fn inter_block_nodes<M: MeshBulk>(&self, mesh: &M) -> Vec<EntityId> {
        let meta = mesh.meta();
        mesh.selected_entities(EntityRank::Node, &Selector::from(self.parts.active))
            .into_iter()
            .filter(|&n| {
                let key = EntityKey::node(n);
                if !(mesh.is_locally_owned(key) || mesh.is_shared(key)) {
                    return false;
                }
                mesh.parts(key)
                    .into_iter()
                    .filter(|&p| {
                        let part = meta.part(p);
                        part.primary_rank == Some(EntityRank::Element) && part.io && !self.phase_support.is_nonconformal(p)
                    })
                    .count()
                    > 1
            })
            .collect()
    }

    /// Active, locally owned sides between two conformal volume parts.
    fn interface_facet_sides<M: MeshBulk>(&self, mesh: &M) -> Vec<EntityId> {
        let meta = mesh.meta();
        mesh.selected_entities(EntityRank::Side, &Selector::from(self.parts.active))
            .into_iter()
            .filter(|&s| {
                let key = EntityKey::side(s);
                mesh.is_locally_owned(key)
                    && mesh
                        .parts(key)
                        .into_iter()
                        .filter(|&p| {
                            meta.part(p).primary_rank == Some(EntityRank::Element) && self.phase_support.is_conformal(p)
                        })
                        .count()
                        > 1
            })
            .collect()
    }

    fn stash_element_field_data<M: MeshBulk>(&mut self, mesh: &M, fields: &[FieldId]) {
        if fields.is_empty() {
            return;
        }
        let mut stashed = Vec::new();
        for elem in &self.elements {
            let leaf_entities: Vec<EntityId> = if elem.have_subelements() && !elem.is_single_coincident() {
                elem.leaves().iter().filter_map(|l| l.entity).collect()
            } else {
                Vec::new()
            };
            let children: Vec<ProlongationElementData> = leaf_entities
                .into_iter()
                .filter(|&e| mesh.is_valid(EntityKey::element(e)))
                .map(|e| {
                    let key = EntityKey::element(e);
                    ProlongationElementData {
                        id: e,
                        measure: entity_measure(mesh, key),
                        fields: stash_values(mesh, key, fields),
                    }
                })
                .collect();
            if children.is_empty() {
                let key = EntityKey::element(elem.entity);
                stashed.push(ProlongationElementData {
                    id: elem.entity,
                    measure: entity_measure(mesh, key),
                    fields: stash_values(mesh, key, fields),
                });
            } else {
                stashed.extend(ProlongationElementData::average(elem.entity, &children));
                stashed.extend(children);
            }
        }
        for data in stashed {
            self.prolongation.insert_element(data);
        }
    }

    /// Fill the fields of this generation's nodes and elements from the
    /// stashed previous generation. Collective.
    pub fn prolongate_fields<M: MeshBulk>(&mut self, mesh: &mut M) -> Result<(), CdMeshError> {
        let fields = ProlongationFields::from_config(mesh.meta(), &self.config, &self.parts)?;
        let Some(old) = self.old.as_deref_mut() else {
            return Ok(());
        };

        let mut target = BoundingBox::default();
        for (_, node) in self.nodes.iter() {
            target.accommodate(&node.coords);
        }
        if target.is_empty() {
            target.accommodate(&[0.0; 3]);
        }
        let guess_and_check = old.stash_step_count >= 0 && mesh.parallel_size() > 1;
        let mut padding = 0.0;
        if guess_and_check {
            let blocks = self.phase_support.all_decomposed_blocks_selector();
            let max_size = global_max_scalar(mesh.comm(), max_element_size(&*mesh, &blocks))?;
            padding = self.config.prolongation_initial_padding * max_size;
            target.pad(padding);
        } else {
            target.pad_epsilon();
        }

        let active = self.parts.active;
        let indices: Vec<_> = self.nodes.indices().collect();
        for pass in 0.. {
            let targets = target.gather(mesh.comm())?;
            old.prolongation.communicate_facets(mesh.comm(), &targets)?;
            old.prolongation.build_trees(mesh.comm())?;

            let mut missing = false;
            let mut failed = 0usize;
            for &idx in &indices {
                let node = self.nodes.get(idx);
                let Some(id) = node.entity else {
                    continue;
                };
                if node.prolonged || !mesh.has_part(EntityKey::node(id), active) {
                    continue;
                }
                match prolongate_node(mesh, &self.nodes, idx, &old.prolongation, &fields) {
                    NodeOutcome::Done => self.nodes.get_mut(idx).prolonged = true,
                    NodeOutcome::MissingRemote => missing = true,
                    NodeOutcome::Failed => failed += 1,
                }
            }
            if failed > 0 {
                log::warn!("prolongation failed for {failed} nodes");
            }

            let missing = is_true_on_any(mesh.comm(), missing)?;
            let max_displacement = maximum_cdfem_displacement(&*mesh, &self.config)?;
            if !guess_and_check || !(missing || max_displacement > padding) {
                break;
            }
            if pass + 1 >= MAX_PADDING_PASSES {
                log::warn!("prolongation padding still insufficient after {MAX_PADDING_PASSES} passes");
                break;
            }
            let growth = self.config.prolongation_padding_growth;
            let grown = (growth * max_displacement).max(growth * padding);
            log::info!("redoing prolongation with padding {grown}");
            target.pad(grown - padding);
            padding = grown;
            old.prolongation.remove_communicated_facets();
            self.nodes.clear_prolongation_state();
        }

        self.rebase_cdfem_displacements(mesh);
        self.prolongate_element_fields(mesh, &fields.element);

        let mut all_fields = fields.node.clone();
        all_fields.extend(&fields.interpolation);
        all_fields.extend(&fields.element);
        all_fields.sort_unstable();
        all_fields.dedup();
        mesh.communicate_field_data(&all_fields)
    }

    /// Shift every CDFEM displacement state so the old state is zero.
    fn rebase_cdfem_displacements<M: MeshBulk>(&self, mesh: &mut M) {
        let meta = mesh.meta();
        let (Some(current), Some(old)) = (
            self.config.cdfem_displacements_field.as_deref().and_then(|n| meta.get_field(n)),
            self.config.cdfem_displacements_old_field.as_deref().and_then(|n| meta.get_field(n)),
        ) else {
            return;
        };
        for n in mesh.entity_ids(EntityRank::Node) {
            let key = EntityKey::node(n);
            let Some(base) = mesh.field_values(old, key).map(<[f64]>::to_vec) else {
                continue;
            };
            for f in [current, old] {
                if let Some(v) = mesh.field_values_mut(f, key) {
                    for (x, b) in v.iter_mut().zip(&base) {
                        *x -= b;
                    }
                }
            }
        }
    }

    fn prolongate_element_fields<M: MeshBulk>(&self, mesh: &mut M, fields: &[FieldId]) {
        let Some(old) = self.old.as_deref() else {
            return;
        };
        if fields.is_empty() {
            return;
        }
        let store = &old.prolongation;
        for elem in &self.elements {
            let parent = store.element(elem.entity);
            let targets: Vec<EntityId> = if elem.have_subelements() {
                elem.leaves().iter().filter_map(|l| l.entity).collect()
            } else {
                vec![elem.entity]
            };
            for e in targets {
                let Some(data) = store.element(e).or(parent) else {
                    continue;
                };
                write_values(mesh, EntityKey::element(e), &data.fields);
            }
        }
    }

    /// After snapping moved nodes of the mesh, move the child nodes of this
    /// generation that descend from them and interpolate their fields.
    pub(crate) fn interpolate_snapped_children<M: MeshBulk>(&self, mesh: &mut M, snapped: &BTreeSet<EntityId>) {
        if snapped.is_empty() {
            return;
        }
        let node_fields: Vec<FieldId> = mesh
            .meta()
            .fields()
            .iter()
            .filter(|f| f.rank == EntityRank::Node && f.id != mesh.meta().coordinates_field() && f.id != self.parts.parent_node_ids)
            .map(|f| f.id)
            .collect();
        for (idx, node) in self.nodes.iter() {
            let Some(id) = node.entity else {
                continue;
            };
            if matches!(node.kind, NodeKind::Mesh) || self.nodes.leaf_mesh_nodes(idx).is_disjoint(snapped) {
                continue;
            }
            let stencil = self.nodes.stencil(idx);
            let mut x = [0.0; 3];
            for &(p, w) in &stencil {
                let px = mesh.coordinates(p);
                for d in 0..3 {
                    x[d] += w * px[d];
                }
            }
            mesh.set_coordinates(id, x);
            let mut values = FieldValues::new();
            for &f in &node_fields {
                let mut acc: Option<Vec<f64>> = None;
                for &(p, w) in &stencil {
                    let Some(v) = mesh.field_values(f, EntityKey::node(p)) else {
                        acc = None;
                        break;
                    };
                    let a = acc.get_or_insert_with(|| vec![0.0; v.len()]);
                    for (ai, vi) in a.iter_mut().zip(v) {
                        *ai += w * vi;
                    }
                }
                if let Some(a) = acc {
                    values.insert(f, a);
                }
            }
            write_values(mesh, EntityKey::node(id), &values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_compare_with_relative_tolerance() {
        assert!(same_position([1e6, 0.0, 0.0], [1e6 + 1e-7, 0.0, 0.0]));
        assert!(!same_position([0.0; 3], [1e-9, 0.0, 0.0]));
    }
}
