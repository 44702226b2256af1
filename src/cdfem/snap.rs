//! Snapping of near-degenerate intersections.
//!
//! An intersection very close to an existing node would create a sliver
//! subelement. A [`Snapper`] resolves such intersections either by moving the
//! node onto the interface (when the adjacent elements keep an acceptable
//! quality) or by capturing the intersection at the node. Either way the
//! node is recorded in a [`NodeToCapturedDomainsMap`] with the level sets
//! whose interfaces now pass through it.

use crate::algs::comm_sparse::CommSparse;
use crate::algs::communicator::{CommTag, Communicator};
use crate::cdfem::interface_geometry::{InterfaceGeometry, all_interface_ids, interface_level_sets};
use crate::geometry::metrics::{add, scale, sub};
use crate::geometry::quality::simplex_quality;
use crate::mesh::{MeshBulk, MeshQueryExt};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet};

const CAPTURE_TAG: CommTag = CommTag::new(0x0e00);

/// Mesh node to the level sets captured at it.
pub type NodeToCapturedDomainsMap = BTreeMap<EntityId, BTreeSet<u32>>;

pub trait Snapper {
    /// Capture intersections lying within tolerance of a node of `elements`.
    fn snap_to_node<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &M,
        geometry: &G,
        elements: &[EntityId],
    ) -> Result<NodeToCapturedDomainsMap, CdMeshError>;

    /// Move nodes onto nearby interfaces where quality allows. Only the
    /// mesh coordinates change.
    fn snap_to_interface<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        _mesh: &mut M,
        _geometry: &G,
        _elements: &[EntityId],
    ) -> Result<NodeToCapturedDomainsMap, CdMeshError> {
        Ok(NodeToCapturedDomainsMap::new())
    }
}

/// Snaps intersections closer than `tolerance` (relative to the edge length)
/// to an edge endpoint.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ThresholdSnapper {
    pub tolerance: f64,
    pub quality_threshold: f64,
}

impl Default for ThresholdSnapper {
    fn default() -> Self {
        Self {
            tolerance: 1e-2,
            quality_threshold: 0.1,
        }
    }
}

struct SnapCandidate {
    node: EntityId,
    target: [f64; 3],
    /// Relative distance along the edge.
    fraction: f64,
    domains: Vec<u32>,
}

impl ThresholdSnapper {
    fn candidates<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &M,
        geometry: &G,
        elements: &[EntityId],
    ) -> Vec<SnapCandidate> {
        let interfaces = all_interface_ids(geometry);
        let mut out = Vec::new();
        for &elem in elements {
            let key = EntityKey::element(elem);
            let Some(topo) = mesh.topology(key) else {
                continue;
            };
            let conn = mesh.entity_nodes(key);
            for e in topo.base_topology().edges() {
                let (a, b) = (conn[e[0]], conn[e[1]]);
                for &iface in &interfaces {
                    let Some(pos) = geometry.edge_crossing_position(iface, &[(a, 1.0)], &[(b, 1.0)]) else {
                        continue;
                    };
                    let (node, fraction) = if pos < self.tolerance {
                        (a, pos)
                    } else if pos > 1.0 - self.tolerance {
                        (b, 1.0 - pos)
                    } else {
                        continue;
                    };
                    let (xa, xb) = (mesh.coordinates(a), mesh.coordinates(b));
                    out.push(SnapCandidate {
                        node,
                        target: add(xa, scale(sub(xb, xa), pos)),
                        fraction,
                        domains: interface_level_sets(iface),
                    });
                }
            }
        }
        out
    }
}

impl Snapper for ThresholdSnapper {
    fn snap_to_node<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &M,
        geometry: &G,
        elements: &[EntityId],
    ) -> Result<NodeToCapturedDomainsMap, CdMeshError> {
        let mut captured = NodeToCapturedDomainsMap::new();
        for c in self.candidates(mesh, geometry, elements) {
            captured.entry(c.node).or_default().extend(c.domains);
        }
        sync_captured_domains(mesh, &mut captured)?;
        Ok(captured)
    }

    fn snap_to_interface<M: MeshBulk, G: InterfaceGeometry>(
        &self,
        mesh: &mut M,
        geometry: &G,
        elements: &[EntityId],
    ) -> Result<NodeToCapturedDomainsMap, CdMeshError> {
        // Closest candidate per node; shared nodes are left to snap_to_node.
        let mut best: BTreeMap<EntityId, SnapCandidate> = BTreeMap::new();
        for c in self.candidates(&*mesh, geometry, elements) {
            if mesh.is_shared(EntityKey::node(c.node)) {
                continue;
            }
            match best.get(&c.node) {
                Some(b) if b.fraction <= c.fraction => {}
                _ => {
                    best.insert(c.node, c);
                }
            }
        }

        let mut captured = NodeToCapturedDomainsMap::new();
        for (node, c) in best {
            let original = mesh.coordinates(node);
            mesh.set_coordinates(node, c.target);
            let ok = mesh.node_upward(node, EntityRank::Element).into_iter().all(|elem| {
                let key = EntityKey::element(elem);
                let Some(topo) = mesh.topology(key) else {
                    return true;
                };
                let base = topo.base_topology();
                let verts: Vec<[f64; 3]> = mesh.entity_nodes(key)[..base.num_vertices()]
                    .iter()
                    .map(|&n| mesh.coordinates(n))
                    .collect();
                simplex_quality(base, &verts) >= self.quality_threshold
            });
            if ok {
                log::trace!("snapped node {node} onto interface (fraction {:.3e})", c.fraction);
                captured.entry(node).or_default().extend(c.domains);
            } else {
                mesh.set_coordinates(node, original);
            }
        }
        Ok(captured)
    }
}

/// Union the captured domains of shared nodes over their sharing ranks.
pub fn sync_captured_domains<M: MeshBulk>(mesh: &M, captured: &mut NodeToCapturedDomainsMap) -> Result<(), CdMeshError> {
    if mesh.comm().is_serial() {
        return Ok(());
    }
    let mut sparse = CommSparse::new(mesh.comm());
    for (&node, domains) in captured.iter() {
        for p in mesh.sharing_procs(EntityKey::node(node)) {
            let buf = sparse.send_buffer(p);
            buf.pack_u64(node.get());
            buf.pack_usize(domains.len());
            for &d in domains {
                buf.pack_u32(d);
            }
        }
    }
    for (_, mut buf) in sparse.communicate(CAPTURE_TAG)? {
        while buf.remaining() {
            let node = EntityId::new(buf.unpack_u64()?)?;
            let n = buf.unpack_usize()?;
            let entry = captured.entry(node).or_default();
            for _ in 0..n {
                entry.insert(buf.unpack_u32()?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::cdfem::interface_geometry::NodalLevelSetGeometry;
    use crate::mesh::{BulkData, MetaData, Selector};
    use crate::topology::cell_type::Topology;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn bar(ls_values: [f64; 3]) -> BulkData<NoComm> {
        let mut meta = MetaData::new(1);
        let block = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        let ls = meta.declare_field("LS", EntityRank::Node, 1).unwrap();
        let mut mesh = BulkData::new(meta, NoComm);
        mesh.modification_begin().unwrap();
        for n in 1..=3 {
            mesh.declare_node(id(n), &[]).unwrap();
        }
        mesh.declare_element(id(1), Topology::Line2, &[id(1), id(2)], &[block]).unwrap();
        mesh.declare_element(id(2), Topology::Line2, &[id(2), id(3)], &[block]).unwrap();
        mesh.modification_end().unwrap();
        for (n, v) in ls_values.iter().enumerate() {
            let node = id(n as u64 + 1);
            mesh.set_coordinates(node, [n as f64, 0.0, 0.0]);
            mesh.field_values_mut(ls, EntityKey::node(node)).unwrap()[0] = *v;
        }
        mesh
    }

    #[test]
    fn near_intersection_is_captured_by_node() {
        let mesh = bar([-0.995, 0.005, 1.005]);
        let mut geom = NodalLevelSetGeometry::single("LS");
        geom.prepare_to_process_elements(&mesh, &Selector::All, &NodeToCapturedDomainsMap::new())
            .unwrap();
        let snapper = ThresholdSnapper::default();
        let captured = snapper.snap_to_node(&mesh, &geom, &[id(1), id(2)]).unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[&id(2)], BTreeSet::from([0]));
    }

    #[test]
    fn snap_to_interface_moves_node() {
        let mut mesh = bar([-0.995, 0.005, 1.005]);
        let mut geom = NodalLevelSetGeometry::single("LS");
        geom.prepare_to_process_elements(&mesh, &Selector::All, &NodeToCapturedDomainsMap::new())
            .unwrap();
        let snapper = ThresholdSnapper::default();
        let captured = snapper.snap_to_interface(&mut mesh, &geom, &[id(1), id(2)]).unwrap();
        assert!(captured.contains_key(&id(2)));
        assert!((mesh.coordinates(id(2))[0] - 0.995).abs() < 1e-12);
    }
}
