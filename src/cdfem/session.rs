//! The decomposition session owned by the time-stepping driver.
//!
//! [`DecompositionSession`] holds the live generation (which holds at most
//! one predecessor) and runs the full pipeline on request: snapping,
//! geometry preparation, cutting, mesh modification and field prolongation.
//! Every method taking a mesh is collective.

use crate::algs::collectives::is_true_on_any;
use crate::cdfem::cdmesh::CdMesh;
use crate::cdfem::config::CdfemConfig;
use crate::cdfem::interface_geometry::InterfaceGeometry;
use crate::cdfem::modify::activate_initial_mesh;
use crate::cdfem::phase::{CdfemParts, PhaseSupport};
use crate::cdfem::snap::{NodeToCapturedDomainsMap, Snapper, ThresholdSnapper, sync_captured_domains};
use crate::geometry::metrics::sub;
use crate::mesh::{MeshBulk, MeshQueryExt};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// What a call to [`DecompositionSession::decompose_mesh`] changed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DecompositionStatus(u8);

impl DecompositionStatus {
    pub const NONE: Self = Self(0);
    /// Snapping moved mesh nodes.
    pub const COORDINATES_MAY_BE_MODIFIED: Self = Self(1);
    /// Entities were created, destroyed or changed parts.
    pub const MESH_MODIFIED: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DecompositionStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DecompositionStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

pub struct DecompositionSession<S: Snapper = ThresholdSnapper> {
    config: Arc<CdfemConfig>,
    phase_support: Arc<PhaseSupport>,
    parts: CdfemParts,
    snapper: S,
    current: Option<CdMesh>,
}

impl DecompositionSession<ThresholdSnapper> {
    /// Session snapping with the tolerances of `config`.
    pub fn new(config: CdfemConfig, phase_support: PhaseSupport, parts: CdfemParts) -> Self {
        let snapper = ThresholdSnapper {
            tolerance: config.snapping_tolerance,
            quality_threshold: config.snap_quality_threshold,
        };
        Self::with_snapper(config, phase_support, parts, snapper)
    }
}

impl<S: Snapper> DecompositionSession<S> {
    pub fn with_snapper(config: CdfemConfig, phase_support: PhaseSupport, parts: CdfemParts, snapper: S) -> Self {
        Self {
            config: Arc::new(config),
            phase_support: Arc::new(phase_support),
            parts,
            snapper,
            current: None,
        }
    }

    pub fn config(&self) -> &CdfemConfig {
        &self.config
    }

    pub fn phase_support(&self) -> &PhaseSupport {
        &self.phase_support
    }

    pub fn parts(&self) -> &CdfemParts {
        &self.parts
    }

    /// The live generation, if the mesh was ever decomposed.
    pub fn current(&self) -> Option<&CdMesh> {
        self.current.as_ref()
    }

    fn new_generation(&self) -> CdMesh {
        CdMesh::new(self.config.clone(), self.phase_support.clone(), self.parts)
    }

    /// Locally owned nonconformal elements of the decomposed blocks.
    fn owned_nonconformal_elements<M: MeshBulk>(&self, mesh: &M, generation: &CdMesh) -> Vec<EntityId> {
        mesh.selected_entities(EntityRank::Element, &generation.decomposed_element_selector())
            .into_iter()
            .filter(|&e| mesh.is_locally_owned(EntityKey::element(e)))
            .collect()
    }

    /// Snap the mesh to the interfaces and decide the captured domains.
    /// Returns the captured domains and the nodes that moved.
    fn snap<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &mut M,
        geometry: &mut G,
        generation: &CdMesh,
        move_nodes: bool,
    ) -> Result<(NodeToCapturedDomainsMap, BTreeSet<EntityId>), CdMeshError> {
        let selector = generation.decomposed_element_selector();
        let elements = self.owned_nonconformal_elements(&*mesh, generation);
        geometry.prepare_to_process_elements(&*mesh, &selector, &NodeToCapturedDomainsMap::new())?;

        let mut captured = NodeToCapturedDomainsMap::new();
        let mut moved = BTreeSet::new();
        if move_nodes && self.config.snaps_to_interface() {
            let before: BTreeMap<EntityId, [f64; 3]> = elements
                .iter()
                .flat_map(|&e| mesh.entity_nodes(EntityKey::element(e)).to_vec())
                .map(|n| (n, mesh.coordinates(n)))
                .collect();
            captured = self.snapper.snap_to_interface(mesh, &*geometry, &elements)?;
            moved.extend(captured.keys().copied());
            self.record_snap_displacements(mesh, &before, &moved);
            geometry.prepare_to_process_elements(&*mesh, &selector, &captured)?;
        }
        for (node, domains) in self.snapper.snap_to_node(&*mesh, &*geometry, &elements)? {
            captured.entry(node).or_default().extend(domains);
        }
        sync_captured_domains(&*mesh, &mut captured)?;
        geometry.apply_captured_domains(&captured);
        Ok((captured, moved))
    }

    fn record_snap_displacements<M: MeshBulk>(
        &self,
        mesh: &mut M,
        before: &BTreeMap<EntityId, [f64; 3]>,
        moved: &BTreeSet<EntityId>,
    ) {
        let Some(field) = self
            .config
            .snap_displacements_field
            .as_deref()
            .and_then(|n| mesh.meta().get_field(n))
        else {
            return;
        };
        for &n in moved {
            let Some(&x0) = before.get(&n) else {
                continue;
            };
            let d = sub(mesh.coordinates(n), x0);
            if let Some(v) = mesh.field_values_mut(field, EntityKey::node(n)) {
                for (vi, di) in v.iter_mut().zip(d) {
                    *vi += di;
                }
            }
        }
    }

    /// Run the decomposition pipeline up to, not including, mesh modification.
    fn build_generation<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &M,
        geometry: &G,
        generation: &mut CdMesh,
        captured: &NodeToCapturedDomainsMap,
    ) -> Result<(), CdMeshError> {
        generation.generate_nonconformal_elements(mesh);
        generation.set_captured_domains(captured);
        generation.set_cutting_interfaces_and_uncut_phases(geometry);
        generation.triangulate(geometry);
        generation.decompose(mesh, geometry)
    }

    /// Decompose the mesh for the interfaces of `geometry`, replacing the
    /// live generation. `periodic_pairs` lists node pairs identified across
    /// periodic boundaries.
    pub fn decompose_mesh<M, G, I>(
        &mut self,
        mesh: &mut M,
        geometry: &mut G,
        step_count: i64,
        periodic_pairs: I,
    ) -> Result<DecompositionStatus, CdMeshError>
    where
        M: MeshBulk,
        G: InterfaceGeometry,
        I: IntoIterator<Item = (EntityId, EntityId)>,
    {
        let mut status = DecompositionStatus::NONE;
        if self.current.is_none() {
            activate_initial_mesh(mesh, &self.phase_support, &self.parts)?;
        }

        let mut generation = self.new_generation();
        generation.set_periodic_node_pairs(periodic_pairs);
        generation.set_old(self.current.take().map(Box::new));

        let (captured, moved) = self.snap(mesh, geometry, &generation, true)?;
        if is_true_on_any(mesh.comm(), !moved.is_empty())? {
            status |= DecompositionStatus::COORDINATES_MAY_BE_MODIFIED;
            if let Some(old) = generation.old.as_deref() {
                old.interpolate_snapped_children(mesh, &moved);
            }
        }

        self.build_generation(&*mesh, &*geometry, &mut generation, &captured)?;
        generation.build_and_stash_old_mesh(&*mesh, step_count)?;
        if generation.modify_mesh(mesh)? {
            status |= DecompositionStatus::MESH_MODIFIED;
        }
        generation.prolongate_fields(mesh)?;

        generation.print_conformal_volumes_and_surface_areas(&*mesh)?;
        generation.print_element_quality(&*mesh)?;
        if self.config.debug_output {
            generation.debug_dump();
        }
        self.current = Some(generation);
        Ok(status)
    }

    /// Whether decomposing now would change any element's decomposition.
    /// Snapping to the interface is not applied, so nodes it would move do
    /// not count as a change.
    pub fn decomposition_needs_update<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &mut M,
        geometry: &mut G,
    ) -> Result<bool, CdMeshError> {
        let Some(current) = self.current.as_ref() else {
            return Ok(true);
        };
        let mut scratch = self.new_generation();
        let (captured, _) = self.snap(mesh, geometry, &scratch, false)?;
        self.build_generation(&*mesh, &*geometry, &mut scratch, &captured)?;
        let changed = scratch.signatures() != current.signatures();
        if changed {
            log::debug!("decomposition changed on rank {}", mesh.parallel_rank());
        }
        is_true_on_any(mesh.comm(), changed)
    }

    /// Rebuild the live generation from the mesh when `step_count` is being
    /// repeated after a failed step.
    pub fn handle_possible_failed_time_step<M: MeshBulk>(&mut self, mesh: &M, step_count: i64) -> Result<(), CdMeshError> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        let failed = current.old().is_some_and(|o| o.stash_step_count() == step_count);
        if failed {
            log::info!("step {step_count} is being repeated; restoring the decomposition from the mesh");
            current.set_old(None);
            current.rebuild_after_rebalance(mesh)?;
        }
        Ok(())
    }

    /// Rebuild the live generation after elements moved between ranks.
    pub fn rebuild_after_rebalance<M: MeshBulk>(&mut self, mesh: &M) -> Result<(), CdMeshError> {
        if let Some(current) = self.current.as_mut() {
            current.set_old(None);
            current.rebuild_after_rebalance(mesh)?;
        }
        Ok(())
    }

    /// Replace the live generation with one rebuilt from a restart mesh.
    pub fn rebuild_from_restart_mesh<M: MeshBulk>(&mut self, mesh: &mut M) -> Result<(), CdMeshError> {
        let mut generation = self.new_generation();
        generation.rebuild_from_restart_mesh(mesh)?;
        self.current = Some(generation);
        Ok(())
    }

    /// Largest interface CFL number from the CDFEM displacements.
    pub fn compute_cdfem_cfl<M: MeshBulk>(&self, mesh: &M) -> Result<f64, CdMeshError> {
        match &self.current {
            Some(current) => current.compute_cdfem_displacement_cfl(mesh),
            None => self.new_generation().compute_cdfem_displacement_cfl(mesh),
        }
    }

    pub fn get_maximum_cdfem_displacement<M: MeshBulk>(&self, mesh: &M) -> Result<f64, CdMeshError> {
        crate::cdfem::cfl::maximum_cdfem_displacement(mesh, &self.config)
    }

    /// Forget every generation.
    pub fn clear(&mut self) {
        self.current = None;
    }
}
