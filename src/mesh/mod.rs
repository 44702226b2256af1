//! The distributed mesh the decomposition operates on.
//!
//! The decomposition consumes the mesh only through [`MeshBulk`]: entity
//! creation and destruction inside modification brackets, part membership,
//! connectivity, field data, ownership/sharing and collective id generation.
//! [`MeshQueryExt`] layers the derived queries on top of any implementation.
//! [`BulkData`] is the in-memory implementation shipped with the crate.

pub mod bulk;
pub mod id_pool;
pub mod meta;
pub mod sharing;

pub use bulk::BulkData;
pub use id_pool::{EntityIdPool, IdPolicy};
pub use meta::{FieldId, FieldSpec, MetaData, Part, PartId, Selector};

use crate::algs::communicator::Communicator;
use crate::mesh_error::CdMeshError;
use crate::topology::cell_type::Topology;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::BTreeSet;

/// Capability set required from the mesh collaborator.
pub trait MeshBulk {
    type Comm: Communicator;

    fn meta(&self) -> &MetaData;
    fn comm(&self) -> &Self::Comm;

    fn parallel_rank(&self) -> usize {
        self.comm().rank()
    }

    fn parallel_size(&self) -> usize {
        self.comm().size()
    }

    fn is_valid(&self, key: EntityKey) -> bool;

    /// All local entity ids of `rank`, ascending.
    fn entity_ids(&self, rank: EntityRank) -> Vec<EntityId>;

    fn topology(&self, key: EntityKey) -> Option<Topology>;

    /// Ordered node connectivity (empty for nodes and unknown entities).
    fn entity_nodes(&self, key: EntityKey) -> &[EntityId];

    /// Entities of `rank` (Side or Element) connected to `node`, ascending.
    fn node_upward(&self, node: EntityId, rank: EntityRank) -> Vec<EntityId>;

    /// Explicit and induced part membership.
    fn parts(&self, key: EntityKey) -> BTreeSet<PartId>;

    fn owner_rank(&self, key: EntityKey) -> usize;

    /// Other ranks holding a copy of `key`, ascending.
    fn sharing_procs(&self, key: EntityKey) -> Vec<usize>;

    /// Field values on `key`, or `None` if the field is not defined there.
    fn field_values(&self, field: FieldId, key: EntityKey) -> Option<&[f64]>;

    fn field_values_mut(&mut self, field: FieldId, key: EntityKey) -> Option<&mut [f64]>;

    /// Whether every element touching a locally owned entity is present
    /// locally (serial runs or an aura ghosting layer).
    fn has_complete_local_view(&self) -> bool;

    fn in_modifiable_state(&self) -> bool;

    fn modification_begin(&mut self) -> Result<(), CdMeshError>;
    fn modification_end(&mut self) -> Result<(), CdMeshError>;

    fn declare_node(&mut self, id: EntityId, parts: &[PartId]) -> Result<(), CdMeshError>;

    fn declare_element(
        &mut self,
        id: EntityId,
        topology: Topology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<(), CdMeshError>;

    fn declare_side(
        &mut self,
        id: EntityId,
        topology: Topology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<(), CdMeshError>;

    fn destroy_entity(&mut self, key: EntityKey) -> Result<(), CdMeshError>;

    fn change_entity_parts(
        &mut self,
        key: EntityKey,
        add: &[PartId],
        remove: &[PartId],
    ) -> Result<(), CdMeshError>;

    /// Replace the sharing ranks of `key`; the lowest rank becomes owner.
    fn set_sharing(&mut self, key: EntityKey, procs: &[usize]);

    /// Collective id generation.
    fn generate_new_ids(&mut self, rank: EntityRank, count: usize) -> Result<Vec<EntityId>, CdMeshError>;

    /// Copy owned values of `fields` to every sharing rank. Collective.
    fn communicate_field_data(&mut self, fields: &[FieldId]) -> Result<(), CdMeshError>;
}

/// Derived queries available on every [`MeshBulk`].
pub trait MeshQueryExt: MeshBulk {
    fn in_selector(&self, key: EntityKey, sel: &Selector) -> bool {
        sel.contains(&self.parts(key))
    }

    fn has_part(&self, key: EntityKey, part: PartId) -> bool {
        self.parts(key).contains(&part)
    }

    /// Local entities of `rank` selected by `sel`, ascending.
    fn selected_entities(&self, rank: EntityRank, sel: &Selector) -> Vec<EntityId> {
        self.entity_ids(rank)
            .into_iter()
            .filter(|&id| self.in_selector(EntityKey::new(rank, id), sel))
            .collect()
    }

    fn is_locally_owned(&self, key: EntityKey) -> bool {
        self.owner_rank(key) == self.parallel_rank()
    }

    fn is_shared(&self, key: EntityKey) -> bool {
        !self.sharing_procs(key).is_empty()
    }

    /// Entities of `rank` whose connectivity contains every node in `nodes`.
    fn entities_through_relations(&self, nodes: &[EntityId], rank: EntityRank) -> Vec<EntityId> {
        let Some((&first, rest)) = nodes.split_first() else {
            return Vec::new();
        };
        if rank == EntityRank::Node {
            return if rest.iter().all(|&n| n == first) { vec![first] } else { Vec::new() };
        }
        self.node_upward(first, rank)
            .into_iter()
            .filter(|&id| {
                let conn = self.entity_nodes(EntityKey::new(rank, id));
                rest.iter().all(|n| conn.contains(n))
            })
            .collect()
    }

    fn coordinates(&self, node: EntityId) -> [f64; 3] {
        let mut x = [0.0; 3];
        if let Some(vals) = self.field_values(self.meta().coordinates_field(), EntityKey::node(node)) {
            for (d, v) in vals.iter().take(3).enumerate() {
                x[d] = *v;
            }
        }
        x
    }

    fn set_coordinates(&mut self, node: EntityId, x: [f64; 3]) {
        let dim = self.meta().spatial_dimension();
        let coords = self.meta().coordinates_field();
        if let Some(vals) = self.field_values_mut(coords, EntityKey::node(node)) {
            vals[..dim].copy_from_slice(&x[..dim]);
        }
    }

    /// Nodes of side `ordinal` of `elem`, including midside nodes.
    fn element_side_nodes(&self, elem: EntityId, ordinal: usize) -> Vec<EntityId> {
        let key = EntityKey::element(elem);
        let (Some(topo), conn) = (self.topology(key), self.entity_nodes(key)) else {
            return Vec::new();
        };
        topo.side_nodes(ordinal).into_iter().map(|i| conn[i]).collect()
    }

    /// Existing side entity with exactly the given node set.
    fn find_side(&self, side_nodes: &[EntityId]) -> Option<EntityId> {
        let wanted: BTreeSet<EntityId> = side_nodes.iter().copied().collect();
        self.entities_through_relations(side_nodes, EntityRank::Side)
            .into_iter()
            .find(|&s| {
                let have: BTreeSet<EntityId> =
                    self.entity_nodes(EntityKey::side(s)).iter().copied().collect();
                have == wanted
            })
    }

    /// Elements connected to side `side`.
    fn side_elements(&self, side: EntityId) -> Vec<EntityId> {
        let nodes = self.entity_nodes(EntityKey::side(side)).to_vec();
        self.entities_through_relations(&nodes, EntityRank::Element)
    }

    /// Whether `elem` has `side` as one of its sides, and at which ordinal.
    fn side_ordinal(&self, elem: EntityId, side: EntityId) -> Option<usize> {
        let topo = self.topology(EntityKey::element(elem))?;
        let wanted: BTreeSet<EntityId> = self.entity_nodes(EntityKey::side(side)).iter().copied().collect();
        (0..topo.num_sides()).find(|&ord| {
            let nodes: BTreeSet<EntityId> = self.element_side_nodes(elem, ord).into_iter().collect();
            nodes == wanted
        })
    }
}

impl<M: MeshBulk + ?Sized> MeshQueryExt for M {}
