mod util;

use cdmesh::algs::communicator::{Communicator, RayonComm};
use cdmesh::cdfem::CdfemConfig;
use cdmesh::cdfem::snap::{NodeToCapturedDomainsMap, sync_captured_domains};
use cdmesh::mesh::{MeshBulk, MeshQueryExt};
use cdmesh::topology::cell_type::Topology;
use cdmesh::topology::point::{EntityKey, EntityRank};
use serial_test::serial;
use std::collections::BTreeSet;
use util::*;

/// Four node bar over two ranks: rank 0 owns elements 1 and 2, rank 1 owns
/// element 3, node 3 is shared.
fn split_bar(comm: RayonComm, ls: [f64; 4]) -> Fixture<RayonComm> {
    split_bar_with(comm, ls, CdfemConfig::default())
}

fn split_bar_with(comm: RayonComm, ls: [f64; 4], config: CdfemConfig) -> Fixture<RayonComm> {
    let node = |n: u64| (n, [(n - 1) as f64, 0.0, 0.0], ls[n as usize - 1]);
    let (nodes, elements) = if comm.rank() == 0 {
        (vec![node(1), node(2), node(3)], vec![(1, vec![1, 2]), (2, vec![2, 3])])
    } else {
        (vec![node(3), node(4)], vec![(3, vec![3, 4])])
    };
    let other = 1 - comm.rank();
    build(comm, 1, Topology::Line2, &nodes, &elements, &[(3, vec![other])], config)
}

#[test]
fn cut_on_one_rank_is_seen_by_both() {
    let results: Vec<(f64, f64, usize)> = std::thread::scope(|s| {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let mut fx = split_bar(comm, [-1.0, -0.5, 0.5, 1.5]);
                    fx.decompose(0);
                    let children = fx.elements_in("CDFEM_CHILD_CONTEXT_BIT").len();
                    (fx.measure("block_1_A"), fx.measure("block_1_B"), children)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for &(a, b, _) in &results {
        assert_close(a, 1.5);
        assert_close(b, 1.5);
    }
    assert_eq!(results[0].2, 2);
    assert_eq!(results[1].2, 0);
}

#[test]
fn shared_node_keeps_one_owner() {
    let owners: Vec<(usize, bool)> = std::thread::scope(|s| {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let mut fx = split_bar(comm, [-1.0, -0.5, 0.5, 1.5]);
                    fx.decompose(0);
                    let key = EntityKey::node(eid(3));
                    (fx.mesh.owner_rank(key), fx.mesh.is_shared(key))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(owners, vec![(0, true), (0, true)]);
}

#[test]
#[serial]
fn captured_domains_are_unioned_over_sharers() {
    let maps: Vec<NodeToCapturedDomainsMap> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                s.spawn(move || {
                    let fx = split_bar(RayonComm::new(rank, 2), [-1.0, -0.5, 0.5, 1.5]);
                    let mut captured = NodeToCapturedDomainsMap::new();
                    if rank == 1 {
                        captured.insert(eid(3), BTreeSet::from([0]));
                        captured.insert(eid(4), BTreeSet::from([0]));
                    }
                    sync_captured_domains(&fx.mesh, &mut captured).unwrap();
                    captured
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(maps[0].get(&eid(3)), Some(&BTreeSet::from([0])));
    assert!(!maps[0].contains_key(&eid(4)));
    assert_eq!(maps[1].len(), 2);
}

#[test]
fn uncut_ranks_stay_untouched() {
    let counts: Vec<usize> = std::thread::scope(|s| {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let mut fx = split_bar(comm, [1.0, 1.5, 2.0, 2.5]);
                    fx.decompose(0);
                    assert!(!fx.needs_update());
                    fx.mesh.entity_ids(EntityRank::Node).len()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(counts, vec![3, 2]);
}

/// Moves the interface from rank 0's element 2 into rank 1's element 3. The
/// new node on rank 1 is closest to the old interface node, which only rank 0
/// holds, so its value has to be shipped over; a small padding forces the
/// search box to grow until it reaches it.
#[test]
fn moved_interface_takes_values_from_the_other_rank() {
    for padding in [3.0, 0.1] {
        let config = CdfemConfig {
            nodal_fields: vec!["temperature".to_string()],
            prolongation_initial_padding: padding,
            ..CdfemConfig::default()
        };
        let results: Vec<(f64, f64, Vec<f64>)> = std::thread::scope(|s| {
            let handles: Vec<_> = RayonComm::world(2)
                .into_iter()
                .map(|comm| {
                    let config = config.clone();
                    s.spawn(move || {
                        let mut fx = split_bar_with(comm, [-1.0, -0.5, 0.5, 1.5], config);
                        fx.decompose(0);
                        for n in fx.mesh.entity_ids(EntityRank::Node) {
                            let x = fx.mesh.coordinates(n)[0];
                            fx.mesh.field_values_mut(fx.temperature, EntityKey::node(n)).unwrap()[0] = 10.0 * x;
                        }

                        let ls = [-1.0, -1.0, -0.5, 0.5];
                        for n in fx.mesh.entity_ids(EntityRank::Node).into_iter().filter(|n| n.get() <= 4) {
                            fx.set_ls(n.get(), ls[n.get() as usize - 1]);
                        }
                        fx.decompose(1);

                        let created: Vec<f64> = fx
                            .mesh
                            .entity_ids(EntityRank::Node)
                            .into_iter()
                            .filter(|n| n.get() > 4)
                            .map(|n| fx.mesh.field_values(fx.temperature, EntityKey::node(n)).unwrap()[0])
                            .collect();
                        (fx.measure("block_1_A"), fx.measure("block_1_B"), created)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (a, b, _) in &results {
            assert_close(*a, 2.5);
            assert_close(*b, 0.5);
        }
        assert!(results[0].2.is_empty());
        assert_eq!(results[1].2.len(), 1);
        assert_close(results[1].2[0], 15.0);
    }
}

