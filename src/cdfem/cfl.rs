//! Interface CFL estimate.
//!
//! The CFL number of an interface side is its displacement normal to the
//! side divided by a length scale; the mesh CFL is the largest positive
//! value over every interface side of every rank.

use crate::algs::collectives::{global_max_scalar, global_sum};
use crate::cdfem::cdmesh::CdMesh;
use crate::cdfem::config::{CdfemConfig, CflLengthScale};
use crate::cdfem::diagnostics::entity_measure;
use crate::geometry::metrics::{dot, scale, side_normal};
use crate::mesh::{FieldId, MeshBulk, MeshQueryExt, MetaData, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::BTreeSet;

/// Average over the side's nodes of the vector field `field`, skipping nodes
/// that do not carry it.
pub fn side_average_of_vector<M: MeshBulk>(mesh: &M, field: FieldId, side: EntityId) -> [f64; 3] {
    let mut avg = [0.0; 3];
    let mut count = 0usize;
    for &n in mesh.entity_nodes(EntityKey::side(side)) {
        if let Some(v) = mesh.field_values(field, EntityKey::node(n)) {
            for (a, x) in avg.iter_mut().zip(v) {
                *a += x;
            }
            count += 1;
        }
    }
    if count > 0 { scale(avg, 1.0 / count as f64) } else { avg }
}

/// Field holding the current CDFEM displacements, if configured.
pub(crate) fn cdfem_displacements_field(meta: &MetaData, config: &CdfemConfig) -> Option<FieldId> {
    config.cdfem_displacements_field.as_deref().and_then(|n| meta.get_field(n))
}

/// Largest CDFEM displacement magnitude over all ranks; 0 when no
/// displacement field is configured. Collective.
pub fn maximum_cdfem_displacement<M: MeshBulk>(mesh: &M, config: &CdfemConfig) -> Result<f64, CdMeshError> {
    let mut local = 0.0f64;
    if let Some(field) = cdfem_displacements_field(mesh.meta(), config) {
        for n in mesh.entity_ids(EntityRank::Node) {
            if let Some(v) = mesh.field_values(field, EntityKey::node(n)) {
                local = local.max(v.iter().map(|x| x * x).sum::<f64>());
            }
        }
    }
    Ok(global_max_scalar(mesh.comm(), local)?.sqrt())
}

impl CdMesh {
    fn interface_side_selector(&self) -> Selector {
        Selector::any_of(self.phase_support.interface_parts())
    }

    /// Active, locally owned conformal volume elements adjacent to `side`.
    fn conformal_neighbors<M: MeshBulk>(&self, mesh: &M, side: EntityId) -> Vec<EntityId> {
        mesh.side_elements(side)
            .into_iter()
            .filter(|&e| {
                let key = EntityKey::element(e);
                mesh.has_part(key, self.parts.active)
                    && mesh.is_locally_owned(key)
                    && mesh
                        .parts(key)
                        .into_iter()
                        .any(|p| self.phase_support.is_conformal(p))
            })
            .collect()
    }

    fn local_length_scale<M: MeshBulk>(&self, mesh: &M, side: EntityId) -> f64 {
        let dim = mesh.meta().spatial_dimension() as f64;
        let min_volume = self
            .conformal_neighbors(mesh, side)
            .into_iter()
            .map(|e| entity_measure(mesh, EntityKey::element(e)))
            .filter(|&v| v > 0.0)
            .fold(f64::INFINITY, f64::min);
        if min_volume.is_finite() { min_volume.powf(1.0 / dim) } else { 0.0 }
    }

    /// Mean element size over the conformal elements touching an interface,
    /// on every rank. Collective.
    fn l1_norm_length_scale<M: MeshBulk>(&self, mesh: &M) -> Result<f64, CdMeshError> {
        let dim = mesh.meta().spatial_dimension() as f64;
        let elements: BTreeSet<EntityId> = mesh
            .selected_entities(EntityRank::Side, &self.interface_side_selector())
            .into_iter()
            .flat_map(|s| self.conformal_neighbors(mesh, s))
            .collect();
        let sum: f64 = elements
            .iter()
            .map(|&e| entity_measure(mesh, EntityKey::element(e)).powf(1.0 / dim))
            .sum();
        let global = global_sum(mesh.comm(), &[sum, elements.len() as f64])?;
        Ok(if global[1] > 0.0 { global[0] / global[1] } else { 0.0 })
    }

    /// Largest interface CFL number for the side displacements given by
    /// `side_displacement`. Collective.
    pub fn compute_cdfem_cfl<M, F>(&self, mesh: &M, side_displacement: F) -> Result<f64, CdMeshError>
    where
        M: MeshBulk,
        F: Fn(&M, EntityId) -> [f64; 3],
    {
        let l1_norm = match self.config.cfl_length_scale {
            CflLengthScale::L1Norm => {
                let l = self.l1_norm_length_scale(mesh)?;
                log::info!("using L1 norm length scale {l} for the interface CFL");
                Some(l)
            }
            _ => None,
        };
        let mut cfl = 0.0f64;
        for side in mesh.selected_entities(EntityRank::Side, &self.interface_side_selector()) {
            let key = EntityKey::side(side);
            let Some(topology) = mesh.topology(key) else {
                continue;
            };
            let verts: Vec<[f64; 3]> = mesh.entity_nodes(key)[..topology.num_vertices()]
                .iter()
                .map(|&n| mesh.coordinates(n))
                .collect();
            let normal = side_normal(topology.base_topology(), &verts);
            let length = match self.config.cfl_length_scale {
                CflLengthScale::Constant => self.config.constant_length_scale,
                CflLengthScale::LocalLength => self.local_length_scale(mesh, side),
                CflLengthScale::L1Norm => l1_norm.unwrap_or(0.0),
            };
            if length == 0.0 {
                continue;
            }
            let side_cfl = dot(side_displacement(mesh, side), normal) / length;
            if side_cfl > 0.0 {
                cfl = cfl.max(side_cfl);
            }
        }
        global_max_scalar(mesh.comm(), cfl)
    }

    /// Interface CFL from the CDFEM displacement field. Collective.
    pub fn compute_cdfem_displacement_cfl<M: MeshBulk>(&self, mesh: &M) -> Result<f64, CdMeshError> {
        let Some(field) = cdfem_displacements_field(mesh.meta(), &self.config) else {
            return global_max_scalar(mesh.comm(), 0.0);
        };
        self.compute_cdfem_cfl(mesh, |m, side| side_average_of_vector(m, field, side))
    }

    /// Interface CFL for the velocity field `velocity` over a step `dt`.
    /// Collective.
    pub fn compute_interface_velocity_cfl<M: MeshBulk>(&self, mesh: &M, velocity: FieldId, dt: f64) -> Result<f64, CdMeshError> {
        self.compute_cdfem_cfl(mesh, |m, side| scale(side_average_of_vector(m, velocity, side), dt))
    }

    /// Largest CDFEM displacement magnitude. Collective.
    pub fn get_maximum_cdfem_displacement<M: MeshBulk>(&self, mesh: &M) -> Result<f64, CdMeshError> {
        maximum_cdfem_displacement(mesh, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::metrics::norm;

    #[test]
    fn displacement_normal_component() {
        let normal = side_normal(crate::topology::cell_type::Topology::Line2, &[[0.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert!((norm(normal) - 1.0).abs() < 1e-14);
        assert!((dot([0.3, 0.0, 0.0], normal) - 0.3).abs() < 1e-14);
    }
}
