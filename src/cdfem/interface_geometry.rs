//! The level set collaborator.
//!
//! The decomposition never evaluates level sets itself. It asks an
//! [`InterfaceGeometry`] which interfaces cut an element, on which side of an
//! interface a point lies, where an interface crosses an edge and which phase
//! a point belongs to. Points are given as stencils: weighted combinations of
//! mesh nodes, so child nodes can be classified before they exist in the mesh.

use crate::cdfem::phase::{InterfaceId, PhaseTag, SurfaceId};
use crate::cdfem::snap::NodeToCapturedDomainsMap;
use crate::mesh::{MeshBulk, MeshQueryExt, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::HashMap;

/// Weighted combination of mesh nodes; weights sum to one.
pub type NodeStencil = [(EntityId, f64)];

/// An interior point where several interfaces meet inside an element.
#[derive(Clone, Debug, PartialEq)]
pub struct InteriorPoint {
    /// Barycentric weights over the element's vertices.
    pub weights: Vec<f64>,
}

pub trait InterfaceGeometry {
    /// Level set surfaces, indexed by the ids used in [`InterfaceId`].
    fn surface_ids(&self) -> &[SurfaceId];

    /// Whether every phase is the region where its own level set is smallest.
    fn one_levelset_per_phase(&self) -> bool;

    /// Cache whatever the element queries below need for the elements of
    /// `selector`. `captured` holds nodes already moved onto interfaces.
    fn prepare_to_process_elements<M: MeshBulk>(
        &mut self,
        mesh: &M,
        selector: &Selector,
        captured: &NodeToCapturedDomainsMap,
    ) -> Result<(), CdMeshError>;

    /// Treat the captured nodes as lying on the interfaces of their domains.
    fn apply_captured_domains(&mut self, captured: &NodeToCapturedDomainsMap);

    /// Interfaces crossing the simplex with vertices `vertices`.
    fn element_cutting_interfaces(&self, vertices: &[EntityId]) -> Vec<InterfaceId>;

    /// Phase of an element no interface crosses.
    fn uncut_element_phase(&self, vertices: &[EntityId]) -> PhaseTag;

    /// Side of `interface` the point lies on: -1, 0 (on it) or +1.
    fn interface_sign(&self, interface: InterfaceId, point: &NodeStencil) -> i32;

    /// Crossing of `interface` along the segment `a -> b`, as a fraction of the
    /// segment from `a`, if the endpoints lie strictly on opposite sides.
    fn edge_crossing_position(&self, interface: InterfaceId, a: &NodeStencil, b: &NodeStencil) -> Option<f64>;

    /// Phase of a point strictly inside a region.
    fn phase_at(&self, point: &NodeStencil) -> PhaseTag;

    /// Points inside the element where interfaces meet and which the
    /// decomposition must resolve with interior nodes.
    fn interior_intersection_points(&self, _vertices: &[EntityId], _interfaces: &[InterfaceId]) -> Vec<InteriorPoint> {
        Vec::new()
    }
}

/// Every interface the geometry can produce: one per surface, or one per
/// pair of surfaces in one-level-set-per-phase mode.
pub fn all_interface_ids<G: InterfaceGeometry + ?Sized>(geometry: &G) -> Vec<InterfaceId> {
    let n = geometry.surface_ids().len() as u32;
    if n < 2 || !geometry.one_levelset_per_phase() {
        (0..n).map(|i| InterfaceId::new(i, i)).collect()
    } else {
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| InterfaceId::new(i, j)))
            .collect()
    }
}

/// Level set indices whose phases an interface separates.
pub fn interface_level_sets(interface: InterfaceId) -> Vec<u32> {
    if interface.is_single_level_set() {
        vec![interface.first()]
    } else {
        vec![interface.first(), interface.second()]
    }
}

/// Level sets stored as nodal fields, one scalar field per surface.
#[derive(Clone, Debug)]
pub struct NodalLevelSetGeometry {
    fields: Vec<String>,
    surfaces: Vec<SurfaceId>,
    one_ls_per_phase: bool,
    values: HashMap<EntityId, Vec<f64>>,
}

impl NodalLevelSetGeometry {
    /// One level set whose sign separates two phases.
    pub fn single(field: &str) -> Self {
        Self::new(&[field], false)
    }

    /// One level set per phase.
    pub fn per_phase(fields: &[&str]) -> Self {
        Self::new(fields, true)
    }

    fn new(fields: &[&str], one_ls_per_phase: bool) -> Self {
        Self {
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            surfaces: (0..fields.len() as u32).map(SurfaceId).collect(),
            one_ls_per_phase,
            values: HashMap::new(),
        }
    }

    fn level_set(&self, ls: u32, point: &NodeStencil) -> f64 {
        point
            .iter()
            .map(|(n, w)| w * self.values.get(n).and_then(|v| v.get(ls as usize)).copied().unwrap_or(0.0))
            .sum()
    }

    fn interface_value(&self, interface: InterfaceId, point: &NodeStencil) -> f64 {
        if interface.is_single_level_set() {
            self.level_set(interface.first(), point)
        } else {
            self.level_set(interface.first(), point) - self.level_set(interface.second(), point)
        }
    }

    /// Whether the point, where the two level sets of `interface` are
    /// equal, lies on the boundary of their phases rather than inside a third.
    fn separates_phases(&self, interface: InterfaceId, point: &NodeStencil) -> bool {
        if !self.one_ls_per_phase || interface.is_single_level_set() {
            return true;
        }
        let (i, j) = (interface.first(), interface.second());
        let on = 0.5 * (self.level_set(i, point) + self.level_set(j, point));
        (0..self.surfaces.len() as u32)
            .filter(|&k| k != i && k != j)
            .all(|k| self.level_set(k, point) >= on)
    }

    fn vertex_stencil(vertices: &[EntityId]) -> Vec<(EntityId, f64)> {
        let w = 1.0 / vertices.len().max(1) as f64;
        vertices.iter().map(|&v| (v, w)).collect()
    }
}

fn sign_of(v: f64) -> i32 {
    if v < 0.0 {
        -1
    } else if v > 0.0 {
        1
    } else {
        0
    }
}

impl InterfaceGeometry for NodalLevelSetGeometry {
    fn surface_ids(&self) -> &[SurfaceId] {
        &self.surfaces
    }

    fn one_levelset_per_phase(&self) -> bool {
        self.one_ls_per_phase
    }

    fn prepare_to_process_elements<M: MeshBulk>(
        &mut self,
        mesh: &M,
        selector: &Selector,
        captured: &NodeToCapturedDomainsMap,
    ) -> Result<(), CdMeshError> {
        let fields = self
            .fields
            .iter()
            .map(|f| mesh.meta().require_field(f))
            .collect::<Result<Vec<_>, _>>()?;
        self.values.clear();
        for elem in mesh.selected_entities(EntityRank::Element, selector) {
            for &node in mesh.entity_nodes(EntityKey::element(elem)) {
                self.values.entry(node).or_insert_with(|| {
                    fields
                        .iter()
                        .map(|&f| {
                            mesh.field_values(f, EntityKey::node(node))
                                .and_then(|v| v.first().copied())
                                .unwrap_or(0.0)
                        })
                        .collect()
                });
            }
        }
        self.apply_captured_domains(captured);
        Ok(())
    }

    fn apply_captured_domains(&mut self, captured: &NodeToCapturedDomainsMap) {
        for (node, domains) in captured {
            let Some(vals) = self.values.get_mut(node) else {
                continue;
            };
            if self.one_ls_per_phase {
                let m = domains
                    .iter()
                    .filter_map(|&ls| vals.get(ls as usize).copied())
                    .fold(f64::INFINITY, f64::min);
                for &ls in domains {
                    if let Some(v) = vals.get_mut(ls as usize) {
                        *v = m;
                    }
                }
            } else {
                for &ls in domains {
                    if let Some(v) = vals.get_mut(ls as usize) {
                        *v = 0.0;
                    }
                }
            }
        }
    }

    fn element_cutting_interfaces(&self, vertices: &[EntityId]) -> Vec<InterfaceId> {
        all_interface_ids(self)
            .into_iter()
            .filter(|&iface| {
                vertices.iter().enumerate().any(|(k, &a)| {
                    vertices[k + 1..]
                        .iter()
                        .any(|&b| self.edge_crossing_position(iface, &[(a, 1.0)], &[(b, 1.0)]).is_some())
                })
            })
            .collect()
    }

    fn uncut_element_phase(&self, vertices: &[EntityId]) -> PhaseTag {
        if self.one_ls_per_phase {
            return self.phase_at(&Self::vertex_stencil(vertices));
        }
        // Use a vertex value when one is off the interface; the centroid may
        // sit on it for elements with a zero vertex.
        let mut tag = PhaseTag::new();
        for (ls, &s) in self.surfaces.iter().enumerate() {
            let sign = vertices
                .iter()
                .map(|&v| sign_of(self.level_set(ls as u32, &[(v, 1.0)])))
                .find(|&sg| sg != 0)
                .unwrap_or(1);
            tag.add(s, sign as i8);
        }
        tag
    }

    fn interface_sign(&self, interface: InterfaceId, point: &NodeStencil) -> i32 {
        sign_of(self.interface_value(interface, point))
    }

    fn edge_crossing_position(&self, interface: InterfaceId, a: &NodeStencil, b: &NodeStencil) -> Option<f64> {
        let da = self.interface_value(interface, a);
        let db = self.interface_value(interface, b);
        if sign_of(da) * sign_of(db) >= 0 {
            return None;
        }
        let t = (da / (da - db)).clamp(0.0, 1.0);
        let crossing: Vec<(EntityId, f64)> = a
            .iter()
            .map(|&(n, w)| (n, w * (1.0 - t)))
            .chain(b.iter().map(|&(n, w)| (n, w * t)))
            .collect();
        self.separates_phases(interface, &crossing).then_some(t)
    }

    fn phase_at(&self, point: &NodeStencil) -> PhaseTag {
        if self.one_ls_per_phase {
            let best = (0..self.surfaces.len() as u32)
                .map(|ls| (ls, self.level_set(ls, point)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(ls, _)| ls);
            return PhaseTag::with(SurfaceId(best), -1);
        }
        let mut tag = PhaseTag::new();
        for (ls, &s) in self.surfaces.iter().enumerate() {
            let v = self.level_set(ls as u32, point);
            tag.add(s, if v < 0.0 { -1 } else { 1 });
        }
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::mesh::{BulkData, MetaData};
    use crate::topology::cell_type::Topology;
    use std::collections::BTreeSet;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn bar(values: [f64; 2]) -> BulkData<NoComm> {
        let mut meta = MetaData::new(1);
        let block = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        let ls = meta.declare_field("LS", EntityRank::Node, 1).unwrap();
        let mut mesh = BulkData::new(meta, NoComm);
        mesh.modification_begin().unwrap();
        mesh.declare_node(id(1), &[]).unwrap();
        mesh.declare_node(id(2), &[]).unwrap();
        mesh.declare_element(id(1), Topology::Line2, &[id(1), id(2)], &[block]).unwrap();
        mesh.modification_end().unwrap();
        for (n, v) in [(1, values[0]), (2, values[1])] {
            mesh.field_values_mut(ls, EntityKey::node(id(n))).unwrap()[0] = v;
        }
        mesh
    }

    #[test]
    fn single_level_set_queries() {
        let mesh = bar([-0.3, 0.7]);
        let mut geom = NodalLevelSetGeometry::single("LS");
        geom.prepare_to_process_elements(&mesh, &Selector::All, &NodeToCapturedDomainsMap::new())
            .unwrap();
        let iface = InterfaceId::new(0, 0);
        assert_eq!(geom.element_cutting_interfaces(&[id(1), id(2)]), vec![iface]);
        let pos = geom.edge_crossing_position(iface, &[(id(1), 1.0)], &[(id(2), 1.0)]).unwrap();
        assert!((pos - 0.3).abs() < 1e-12);
        assert_eq!(geom.interface_sign(iface, &[(id(1), 0.5), (id(2), 0.5)]), 1);
        assert_eq!(geom.phase_at(&[(id(1), 1.0)]), PhaseTag::with(SurfaceId(0), -1));
    }

    #[test]
    fn captured_node_sits_on_interface() {
        let mesh = bar([-0.001, 0.999]);
        let mut geom = NodalLevelSetGeometry::single("LS");
        let mut captured = NodeToCapturedDomainsMap::new();
        captured.insert(id(1), BTreeSet::from([0]));
        geom.prepare_to_process_elements(&mesh, &Selector::All, &captured).unwrap();
        assert!(geom.element_cutting_interfaces(&[id(1), id(2)]).is_empty());
        assert_eq!(geom.interface_sign(InterfaceId::new(0, 0), &[(id(1), 1.0)]), 0);
        assert_eq!(geom.uncut_element_phase(&[id(1), id(2)]), PhaseTag::with(SurfaceId(0), 1));
    }

    #[test]
    fn pairwise_interfaces() {
        let geom = NodalLevelSetGeometry::per_phase(&["LS0", "LS1", "LS2"]);
        assert_eq!(
            all_interface_ids(&geom),
            vec![InterfaceId::new(0, 1), InterfaceId::new(0, 2), InterfaceId::new(1, 2)]
        );
        assert_eq!(interface_level_sets(InterfaceId::new(0, 2)), vec![0, 2]);
        assert_eq!(all_interface_ids(&NodalLevelSetGeometry::single("LS")), vec![InterfaceId::new(0, 0)]);
    }

    fn three_phase_bar() -> BulkData<NoComm> {
        let mut meta = MetaData::new(1);
        let block = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        let fields: Vec<_> = ["LS0", "LS1", "LS2"]
            .iter()
            .map(|f| meta.declare_field(f, EntityRank::Node, 1).unwrap())
            .collect();
        let mut mesh = BulkData::new(meta, NoComm);
        mesh.modification_begin().unwrap();
        for n in 1..=3 {
            mesh.declare_node(id(n), &[]).unwrap();
        }
        mesh.declare_element(id(1), Topology::Line2, &[id(1), id(2)], &[block]).unwrap();
        mesh.declare_element(id(2), Topology::Line2, &[id(2), id(3)], &[block]).unwrap();
        mesh.modification_end().unwrap();
        let values = [[0.0, 1.0, 3.0], [1.0, 2.0, 1.0], [5.0, 0.5, -1.0]];
        for (f, vals) in fields.iter().zip(values) {
            for (n, v) in (1..=3).zip(vals) {
                mesh.field_values_mut(*f, EntityKey::node(id(n))).unwrap()[0] = v;
            }
        }
        mesh
    }

    #[test]
    fn crossings_inside_a_third_phase_do_not_cut() {
        let mesh = three_phase_bar();
        let mut geom = NodalLevelSetGeometry::per_phase(&["LS0", "LS1", "LS2"]);
        geom.prepare_to_process_elements(&mesh, &Selector::All, &NodeToCapturedDomainsMap::new())
            .unwrap();

        // LS0 - LS1 changes sign over element 2, but LS2 is lowest there.
        assert!(geom.element_cutting_interfaces(&[id(2), id(3)]).is_empty());
        assert_eq!(geom.uncut_element_phase(&[id(2), id(3)]), PhaseTag::with(SurfaceId(2), -1));
        assert_eq!(
            geom.edge_crossing_position(InterfaceId::new(0, 1), &[(id(2), 1.0)], &[(id(3), 1.0)]),
            None
        );

        assert_eq!(geom.element_cutting_interfaces(&[id(1), id(2)]), vec![InterfaceId::new(0, 2)]);
        let t = geom
            .edge_crossing_position(InterfaceId::new(0, 2), &[(id(1), 1.0)], &[(id(2), 1.0)])
            .unwrap();
        assert!((t - 5.0 / 5.5).abs() < 1e-12);
    }
}
