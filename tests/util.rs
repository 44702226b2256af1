#![allow(dead_code)]
use cdmesh::{
    algs::communicator::Communicator,
    cdfem::{CdfemConfig, CdfemParts, DecompositionSession, NodalLevelSetGeometry, PhaseSupport},
    mesh::{BulkData, FieldId, MeshBulk, MeshQueryExt, MetaData, PartId},
    topology::{cell_type::Topology, point::EntityId, point::EntityKey, point::EntityRank},
};

pub fn eid(u: u64) -> EntityId {
    EntityId::new(u).unwrap()
}

pub fn no_periodic() -> Vec<(EntityId, EntityId)> {
    Vec::new()
}

/// A mesh with one decomposed block, a level set and the fields used to
/// check prolongation.
pub struct Fixture<C: Communicator> {
    pub mesh: BulkData<C>,
    pub session: DecompositionSession,
    pub geometry: NodalLevelSetGeometry,
    pub ls: FieldId,
    pub temperature: FieldId,
    pub pressure: FieldId,
    /// Three component nodal vector field named `displacement`.
    pub displacement: FieldId,
}

impl<C: Communicator> Fixture<C> {
    pub fn part(&self, name: &str) -> PartId {
        self.mesh.meta().get_part(name).unwrap()
    }

    pub fn decompose(&mut self, step: i64) -> cdmesh::cdfem::DecompositionStatus {
        self.session
            .decompose_mesh(&mut self.mesh, &mut self.geometry, step, no_periodic())
            .unwrap()
    }

    pub fn needs_update(&mut self) -> bool {
        self.session
            .decomposition_needs_update(&mut self.mesh, &mut self.geometry)
            .unwrap()
    }

    pub fn set_ls(&mut self, node: u64, value: f64) {
        self.mesh.field_values_mut(self.ls, EntityKey::node(eid(node))).unwrap()[0] = value;
    }

    /// Global measure of the named part over active entities.
    pub fn measure(&self, name: &str) -> f64 {
        let part = self.part(name);
        self.session
            .current()
            .unwrap()
            .conformal_volumes_and_surface_areas(&self.mesh)
            .unwrap()
            .into_iter()
            .find(|(p, _)| *p == part)
            .map(|(_, m)| m)
            .unwrap()
    }

    pub fn elements_in(&self, name: &str) -> Vec<EntityId> {
        let part = self.part(name);
        self.mesh
            .entity_ids(EntityRank::Element)
            .into_iter()
            .filter(|&e| self.mesh.has_part(EntityKey::element(e), part))
            .collect()
    }

    pub fn has_part(&self, key: EntityKey, name: &str) -> bool {
        self.mesh.has_part(key, self.part(name))
    }
}

/// Nodes as `(id, coordinates, level set)`, elements as `(id, nodes)`,
/// shared nodes as `(id, other ranks)`.
pub fn build<C: Communicator>(
    comm: C,
    dim: usize,
    topology: Topology,
    nodes: &[(u64, [f64; 3], f64)],
    elements: &[(u64, Vec<u64>)],
    shared: &[(u64, Vec<usize>)],
    config: CdfemConfig,
) -> Fixture<C> {
    let nodes: Vec<(u64, [f64; 3], Vec<f64>)> = nodes.iter().map(|&(n, x, v)| (n, x, vec![v])).collect();
    build_with_phases(comm, dim, topology, &[], &nodes, elements, shared, config)
}

/// Like [`build`], with one level set per phase when `phases` is not empty.
/// Node level sets are listed per phase, in the order of `phases`.
#[allow(clippy::too_many_arguments)]
pub fn build_with_phases<C: Communicator>(
    comm: C,
    dim: usize,
    topology: Topology,
    phases: &[&str],
    nodes: &[(u64, [f64; 3], Vec<f64>)],
    elements: &[(u64, Vec<u64>)],
    shared: &[(u64, Vec<usize>)],
    config: CdfemConfig,
) -> Fixture<C> {
    let names: Vec<String> = if phases.is_empty() {
        vec!["LS".to_owned()]
    } else {
        phases.iter().map(|p| format!("LS_{p}")).collect()
    };
    let mut meta = MetaData::new(dim);
    let block = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
    let ls_fields: Vec<FieldId> = names
        .iter()
        .map(|n| meta.declare_field(n, EntityRank::Node, 1).unwrap())
        .collect();
    let temperature = meta.declare_field("temperature", EntityRank::Node, 1).unwrap();
    let pressure = meta.declare_field("pressure", EntityRank::Element, 1).unwrap();
    let displacement = meta.declare_field("displacement", EntityRank::Node, 3).unwrap();
    let mut ps = if phases.is_empty() {
        PhaseSupport::single_level_set("A", "B")
    } else {
        PhaseSupport::level_set_per_phase(phases)
    };
    ps.decompose_block(&mut meta, "block_1").unwrap();
    let parts = CdfemParts::declare(&mut meta).unwrap();

    let mut mesh = BulkData::new(meta, comm);
    mesh.modification_begin().unwrap();
    for (n, _, _) in nodes {
        mesh.declare_node(eid(*n), &[]).unwrap();
    }
    for (e, conn) in elements {
        let conn: Vec<EntityId> = conn.iter().map(|&n| eid(n)).collect();
        mesh.declare_element(eid(*e), topology, &conn, &[block]).unwrap();
    }
    mesh.modification_end().unwrap();
    for (n, procs) in shared {
        mesh.set_sharing(EntityKey::node(eid(*n)), procs);
    }
    for (n, x, values) in nodes {
        mesh.set_coordinates(eid(*n), *x);
        for (&f, &v) in ls_fields.iter().zip(values) {
            mesh.field_values_mut(f, EntityKey::node(eid(*n))).unwrap()[0] = v;
        }
    }

    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let geometry = if phases.is_empty() {
        NodalLevelSetGeometry::single(name_refs[0])
    } else {
        NodalLevelSetGeometry::per_phase(&name_refs)
    };
    Fixture {
        mesh,
        session: DecompositionSession::new(config, ps, parts),
        geometry,
        ls: ls_fields[0],
        temperature,
        pressure,
        displacement,
    }
}

/// Bar of unit elements along x with the given nodal level set values.
pub fn bar<C: Communicator>(comm: C, ls: &[f64]) -> Fixture<C> {
    let nodes: Vec<(u64, [f64; 3], f64)> = ls
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u64 + 1, [i as f64, 0.0, 0.0], v))
        .collect();
    let elements: Vec<(u64, Vec<u64>)> = (1..ls.len() as u64).map(|e| (e, vec![e, e + 1])).collect();
    build(comm, 1, Topology::Line2, &nodes, &elements, &[], CdfemConfig::default())
}

/// Unit square split along the diagonal from (1,0) to (0,1), with the
/// level set `x - offset`.
pub fn square<C: Communicator>(comm: C, offset: f64) -> Fixture<C> {
    let pts = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
    let nodes: Vec<(u64, [f64; 3], f64)> = pts
        .iter()
        .enumerate()
        .map(|(i, &x)| (i as u64 + 1, x, x[0] - offset))
        .collect();
    let elements = vec![(1, vec![1, 2, 3]), (2, vec![2, 4, 3])];
    build(comm, 2, Topology::Tri3, &nodes, &elements, &[], CdfemConfig::default())
}

/// Unit tetrahedron with the level set `x - offset`.
pub fn tet<C: Communicator>(comm: C, offset: f64) -> Fixture<C> {
    let pts = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let nodes: Vec<(u64, [f64; 3], f64)> = pts
        .iter()
        .enumerate()
        .map(|(i, &x)| (i as u64 + 1, x, x[0] - offset))
        .collect();
    build(comm, 3, Topology::Tet4, &nodes, &[(1, vec![1, 2, 3, 4])], &[], CdfemConfig::default())
}

pub fn assert_close(got: f64, want: f64) {
    assert!((got - want).abs() < 1e-10, "got {got}, want {want}");
}

/// Three node Line3 element on [0, 1], midside node 3 at 0.5, with the level
/// set `x - offset`.
pub fn quadratic_bar<C: Communicator>(comm: C, offset: f64) -> Fixture<C> {
    let nodes: Vec<(u64, [f64; 3], f64)> = [(1, 0.0), (2, 1.0), (3, 0.5)]
        .iter()
        .map(|&(n, x)| (n, [x, 0.0, 0.0], x - offset))
        .collect();
    build(comm, 1, Topology::Line3, &nodes, &[(1, vec![1, 2, 3])], &[], CdfemConfig::default())
}

/// Unit right triangle as a Tri6 with the level set `x - offset`.
pub fn quadratic_triangle<C: Communicator>(comm: C, offset: f64) -> Fixture<C> {
    let pts = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.5, 0.0, 0.0],
        [0.5, 0.5, 0.0],
        [0.0, 0.5, 0.0],
    ];
    let nodes: Vec<(u64, [f64; 3], f64)> = pts
        .iter()
        .enumerate()
        .map(|(i, &x)| (i as u64 + 1, x, x[0] - offset))
        .collect();
    build(comm, 2, Topology::Tri6, &nodes, &[(1, vec![1, 2, 3, 4, 5, 6])], &[], CdfemConfig::default())
}

/// Bar of unit elements with one level set per phase `P0`, `P1`, `P2`;
/// `ls[k]` holds the nodal values of the level set of phase k.
pub fn three_phase_bar<C: Communicator>(comm: C, ls: [&[f64]; 3]) -> Fixture<C> {
    let nodes: Vec<(u64, [f64; 3], Vec<f64>)> = (0..ls[0].len())
        .map(|i| (i as u64 + 1, [i as f64, 0.0, 0.0], ls.iter().map(|l| l[i]).collect()))
        .collect();
    let elements: Vec<(u64, Vec<u64>)> = (1..ls[0].len() as u64).map(|e| (e, vec![e, e + 1])).collect();
    build_with_phases(comm, 1, Topology::Line2, &["P0", "P1", "P2"], &nodes, &elements, &[], CdfemConfig::default())
}
