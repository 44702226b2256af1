//! Reports on a decomposed mesh: conformal volumes and interface areas,
//! element quality, and a dump of the decomposition for debugging.

use crate::algs::collectives::{global_max, global_min, global_sum};
use crate::cdfem::cdmesh::CdMesh;
use crate::geometry::metrics::{max_edge_length, simplex_measure};
use crate::geometry::quality::{QualitySummary, simplex_quality};
use crate::mesh::{MeshBulk, MeshQueryExt, PartId, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityKey, EntityRank};

fn vertex_coordinates<M: MeshBulk>(mesh: &M, key: EntityKey) -> Option<(crate::topology::cell_type::Topology, Vec<[f64; 3]>)> {
    let topology = mesh.topology(key)?.base_topology();
    let coords = mesh.entity_nodes(key)[..topology.num_vertices()]
        .iter()
        .map(|&n| mesh.coordinates(n))
        .collect();
    Some((topology, coords))
}

/// Length, area or volume of an element or side, from its vertices.
pub(crate) fn entity_measure<M: MeshBulk>(mesh: &M, key: EntityKey) -> f64 {
    vertex_coordinates(mesh, key).map_or(0.0, |(t, x)| simplex_measure(t, &x))
}

/// Longest element edge among the local elements of `selector`.
pub(crate) fn max_element_size<M: MeshBulk>(mesh: &M, selector: &Selector) -> f64 {
    mesh.selected_entities(EntityRank::Element, selector)
        .into_iter()
        .filter_map(|e| vertex_coordinates(mesh, EntityKey::element(e)))
        .map(|(t, x)| max_edge_length(t, &x))
        .fold(0.0, f64::max)
}

fn sum_measures<M: MeshBulk>(mesh: &M, rank: EntityRank, selector: &Selector) -> f64 {
    mesh.selected_entities(rank, selector)
        .into_iter()
        .map(|id| EntityKey::new(rank, id))
        .filter(|&k| mesh.is_locally_owned(k))
        .map(|k| entity_measure(mesh, k))
        .sum()
}

impl CdMesh {
    /// Global volume of every conformal volume part and area of every
    /// interface part, over active entities. Collective.
    pub fn conformal_volumes_and_surface_areas<M: MeshBulk>(&self, mesh: &M) -> Result<Vec<(PartId, f64)>, CdMeshError> {
        let active = Selector::from(self.parts.active);
        let mut parts: Vec<(PartId, EntityRank)> = self
            .phase_support
            .conformal_parts(EntityRank::Element)
            .into_iter()
            .map(|p| (p, EntityRank::Element))
            .collect();
        parts.extend(self.phase_support.interface_parts().map(|p| (p, EntityRank::Side)));
        let local: Vec<f64> = parts
            .iter()
            .map(|&(p, rank)| sum_measures(mesh, rank, &(Selector::from(p) & active.clone())))
            .collect();
        let global = global_sum(mesh.comm(), &local)?;
        Ok(parts.into_iter().map(|(p, _)| p).zip(global).collect())
    }

    /// Log the conformal volumes and interface areas. Collective.
    pub fn print_conformal_volumes_and_surface_areas<M: MeshBulk>(&self, mesh: &M) -> Result<(), CdMeshError> {
        for (part, measure) in self.conformal_volumes_and_surface_areas(mesh)? {
            let kind = if self.phase_support.is_interface(part) { "Area" } else { "Volume" };
            log::info!("{kind} of part {}: {measure:.6e}", mesh.meta().part(part).name);
        }
        Ok(())
    }

    /// Quality of the active elements of the decomposed blocks, reduced over
    /// all ranks. Collective.
    pub fn element_quality<M: MeshBulk>(&self, mesh: &M) -> Result<QualitySummary, CdMeshError> {
        let selector = self.phase_support.all_decomposed_blocks_selector() & Selector::from(self.parts.active);
        let mut local = QualitySummary::default();
        for e in mesh.selected_entities(EntityRank::Element, &selector) {
            let key = EntityKey::element(e);
            if !mesh.is_locally_owned(key) {
                continue;
            }
            if let Some((t, x)) = vertex_coordinates(mesh, key) {
                local.accumulate(simplex_quality(t, &x));
            }
        }
        let min = global_min(mesh.comm(), &[local.min])?[0];
        let max = global_max(mesh.comm(), &[local.max])?[0];
        let count = global_sum(mesh.comm(), &[local.count as u64])?[0];
        Ok(QualitySummary {
            min,
            max,
            count: count as usize,
        })
    }

    /// Log the element quality summary. Collective.
    pub fn print_element_quality<M: MeshBulk>(&self, mesh: &M) -> Result<(), CdMeshError> {
        let q = self.element_quality(mesh)?;
        log::info!(
            "element quality over {} elements: min {:.4}, max {:.4}, ratio {:.4}",
            q.count,
            q.min,
            q.max,
            q.min_max_ratio()
        );
        Ok(())
    }

    /// Dump elements, subelements and nodes at debug level.
    pub fn debug_dump(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        for elem in &self.elements {
            log::debug!(
                "element {} {} phase {:?} interfaces {:?}",
                elem.entity,
                elem.topology.name(),
                elem.phase,
                elem.cutting_interfaces
            );
            for leaf in elem.leaves() {
                let ids: Vec<Option<EntityId>> = leaf.nodes.iter().map(|&n| self.nodes.get(n).entity).collect();
                log::debug!(
                    "  subelement {:?} {} nodes {:?} phase {:?}",
                    leaf.entity,
                    leaf.topology.name(),
                    ids,
                    leaf.phase
                );
            }
        }
        for (idx, node) in self.nodes.iter() {
            log::debug!(
                "node {} entity {:?} at {:?} ancestry {:?} sign {:?} score {:?}",
                idx.index(),
                node.entity,
                node.coords,
                self.nodes.ancestry_key(idx),
                node.sign,
                node.score
            );
        }
    }
}
