mod util;

use cdmesh::algs::communicator::NoComm;
use cdmesh::cdfem::CdfemConfig;
use cdmesh::mesh::{MeshBulk, MeshQueryExt};
use cdmesh::topology::cell_type::Topology;
use cdmesh::topology::point::{EntityId, EntityKey, EntityRank};
use util::*;

fn set_node_field(fx: &mut Fixture<NoComm>, f: impl Fn(f64) -> f64) {
    for n in fx.mesh.entity_ids(EntityRank::Node) {
        let x = fx.mesh.coordinates(n)[0];
        fx.mesh.field_values_mut(fx.temperature, EntityKey::node(n)).unwrap()[0] = f(x);
    }
}

fn temperature(fx: &Fixture<NoComm>, n: EntityId) -> f64 {
    fx.mesh.field_values(fx.temperature, EntityKey::node(n)).unwrap()[0]
}

fn pressure(fx: &Fixture<NoComm>, e: EntityId) -> f64 {
    fx.mesh.field_values(fx.pressure, EntityKey::element(e)).unwrap()[0]
}

fn new_nodes(fx: &Fixture<NoComm>, background: u64) -> Vec<EntityId> {
    fx.mesh
        .entity_ids(EntityRank::Node)
        .into_iter()
        .filter(|n| n.get() > background)
        .collect()
}

#[test]
fn uniform_field_reaches_new_nodes() {
    let mut fx = bar(NoComm, &[-0.3, 0.7, 1.7]);
    set_node_field(&mut fx, |_| 5.0);
    fx.decompose(0);
    let created = new_nodes(&fx, 3);
    assert_eq!(created.len(), 1);
    assert_close(temperature(&fx, created[0]), 5.0);
    for n in 1..=3 {
        assert_close(temperature(&fx, eid(n)), 5.0);
    }
}

#[test]
fn interpolation_fields_follow_the_edge_position() {
    let config = CdfemConfig {
        interpolation_fields: vec!["temperature".to_string()],
        ..CdfemConfig::default()
    };
    let nodes = [
        (1, [0.0, 0.0, 0.0], -0.3),
        (2, [1.0, 0.0, 0.0], 0.7),
        (3, [2.0, 0.0, 0.0], 1.7),
    ];
    let elements = [(1, vec![1, 2]), (2, vec![2, 3])];
    let mut fx = build(NoComm, 1, Topology::Line2, &nodes, &elements, &[], config);
    set_node_field(&mut fx, |x| 10.0 * x);
    fx.decompose(0);
    let created = new_nodes(&fx, 3);
    assert_eq!(created.len(), 1);
    assert_close(temperature(&fx, created[0]), 3.0);
    assert_close(temperature(&fx, eid(2)), 10.0);
}

#[test]
fn children_inherit_their_parent_element_values() {
    let mut fx = bar(NoComm, &[-0.3, 0.7, 1.7]);
    fx.mesh.field_values_mut(fx.pressure, EntityKey::element(eid(1))).unwrap()[0] = 7.0;
    fx.mesh.field_values_mut(fx.pressure, EntityKey::element(eid(2))).unwrap()[0] = 9.0;
    fx.decompose(0);

    let children = fx.elements_in("CDFEM_CHILD_CONTEXT_BIT");
    assert_eq!(children.len(), 2);
    for c in children {
        assert_close(pressure(&fx, c), 7.0);
    }
    assert_close(pressure(&fx, eid(2)), 9.0);
}

#[test]
fn values_survive_a_redecomposition() {
    let mut fx = bar(NoComm, &[-0.3, 0.7, 1.7]);
    set_node_field(&mut fx, |_| 2.5);
    fx.mesh.field_values_mut(fx.pressure, EntityKey::element(eid(2))).unwrap()[0] = 4.0;
    fx.decompose(0);
    fx.set_ls(3, -1.7);
    fx.decompose(1);

    assert!(fx.has_part(EntityKey::element(eid(2)), "CDFEM_PARENT_CONTEXT_BIT"));
    for n in fx.mesh.entity_ids(EntityRank::Node) {
        assert_close(temperature(&fx, n), 2.5);
    }
    let second_children: Vec<EntityId> = fx
        .session
        .current()
        .unwrap()
        .find_mesh_element(eid(2))
        .unwrap()
        .leaves()
        .iter()
        .filter_map(|l| l.entity)
        .collect();
    assert_eq!(second_children.len(), 2);
    for c in second_children {
        assert_close(pressure(&fx, c), 4.0);
    }
}
