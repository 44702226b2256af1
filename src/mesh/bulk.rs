//! In-memory distributed mesh.
//!
//! Each rank holds its own `BulkData`: the entities it owns plus the copies
//! of shared nodes and sides on its partition boundary. There is no ghosting
//! layer, so [`has_complete_local_view`](MeshBulk::has_complete_local_view)
//! holds only on a single rank.

use crate::algs::comm_sparse::CommSparse;
use crate::algs::communicator::{CommTag, Communicator};
use crate::data::section::Section;
use crate::mesh::id_pool::{EntityIdPool, IdPolicy};
use crate::mesh::meta::{FieldId, MetaData, PartId};
use crate::mesh::MeshBulk;
use crate::mesh_error::CdMeshError;
use crate::topology::cell_type::Topology;
use crate::topology::ownership::EntityOwnership;
use crate::topology::point::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const FIELD_COMM_TAG: CommTag = CommTag::new(0x0b00);
const MAX_ZERO_COMPONENTS: usize = 64;

#[derive(Clone, Debug, Default)]
struct EntityRecord {
    topology: Option<Topology>,
    nodes: Vec<EntityId>,
    parts: BTreeSet<PartId>,
}

fn rank_index(rank: EntityRank) -> usize {
    match rank {
        EntityRank::Node => 0,
        EntityRank::Side => 1,
        EntityRank::Element => 2,
    }
}

pub struct BulkData<C: Communicator> {
    meta: MetaData,
    comm: C,
    records: [BTreeMap<EntityId, EntityRecord>; 3],
    upward: HashMap<EntityId, BTreeSet<EntityKey>>,
    ownership: [EntityOwnership; 3],
    fields: Vec<Section<f64>>,
    zeros: Vec<f64>,
    in_modification: bool,
    touched: BTreeSet<EntityKey>,
    id_pool: EntityIdPool,
}

impl<C: Communicator> BulkData<C> {
    pub fn new(meta: MetaData, comm: C) -> Self {
        let me = comm.rank();
        Self {
            meta,
            comm,
            records: Default::default(),
            upward: HashMap::new(),
            ownership: [EntityOwnership::new(me), EntityOwnership::new(me), EntityOwnership::new(me)],
            fields: Vec::new(),
            zeros: vec![0.0; MAX_ZERO_COMPONENTS],
            in_modification: false,
            touched: BTreeSet::new(),
            id_pool: EntityIdPool::default(),
        }
    }

    pub fn with_id_policy(mut self, policy: IdPolicy) -> Self {
        self.id_pool.set_policy(policy);
        self
    }

    /// Parts and fields may be declared until entities reference them.
    pub fn meta_mut(&mut self) -> &mut MetaData {
        &mut self.meta
    }

    pub fn num_entities(&self, rank: EntityRank) -> usize {
        self.records[rank_index(rank)].len()
    }

    fn record(&self, key: EntityKey) -> Option<&EntityRecord> {
        self.records[rank_index(key.rank)].get(&key.id)
    }

    fn require_modification(&self) -> Result<(), CdMeshError> {
        if self.in_modification {
            Ok(())
        } else {
            Err(CdMeshError::ModificationNotInProgress)
        }
    }

    fn insert_record(&mut self, key: EntityKey, record: EntityRecord) -> Result<(), CdMeshError> {
        self.require_modification()?;
        let map = &mut self.records[rank_index(key.rank)];
        if map.contains_key(&key.id) {
            return Err(CdMeshError::DuplicateEntity {
                rank: key.rank,
                id: key.id,
            });
        }
        for n in &record.nodes {
            self.upward.entry(*n).or_default().insert(key);
        }
        map.insert(key.id, record);
        self.id_pool.note_id(key.rank, key.id);
        self.mark_touched(key);
        Ok(())
    }

    fn check_connectivity(&self, topology: Topology, nodes: &[EntityId]) -> Result<(), CdMeshError> {
        if nodes.len() != topology.num_nodes() {
            return Err(CdMeshError::ConnectivityMismatch {
                topology: topology.name(),
                expected: topology.num_nodes(),
                found: nodes.len(),
            });
        }
        for &n in nodes {
            if self.record(EntityKey::node(n)).is_none() {
                return Err(CdMeshError::MissingEntity {
                    rank: EntityRank::Node,
                    id: n,
                });
            }
        }
        Ok(())
    }

    /// Entities whose field storage may change with `key`'s parts.
    fn mark_touched(&mut self, key: EntityKey) {
        self.touched.insert(key);
        if let Some(rec) = self.records[rank_index(key.rank)].get(&key.id) {
            for &n in &rec.nodes {
                self.touched.insert(EntityKey::node(n));
                if key.rank == EntityRank::Element {
                    for up in self.upward.get(&n).into_iter().flatten() {
                        if up.rank == EntityRank::Side {
                            self.touched.insert(*up);
                        }
                    }
                }
            }
        }
    }

    /// Drop stored values of fields no longer defined on `key`.
    fn refresh_field_storage(&mut self, key: EntityKey) {
        let parts = self.parts(key);
        let exists = self.is_valid(key);
        for (idx, section) in self.fields.iter_mut().enumerate() {
            if !section.contains(key.id) {
                continue;
            }
            let field = FieldId(idx as u32);
            if self.meta.field(field).rank != key.rank {
                continue;
            }
            if !exists || !self.meta.field_defined_on(field, key.rank, &parts) {
                section.remove_point(key.id);
            }
        }
    }

    fn induced_parts(&self, key: EntityKey, out: &mut BTreeSet<PartId>) {
        let mut higher: BTreeSet<EntityKey> = BTreeSet::new();
        match key.rank {
            EntityRank::Node => {
                higher.extend(self.upward.get(&key.id).into_iter().flatten().copied());
            }
            EntityRank::Side => {
                if let Some(rec) = self.record(key) {
                    if let Some((first, rest)) = rec.nodes.split_first() {
                        for up in self.upward.get(first).into_iter().flatten() {
                            if up.rank != EntityRank::Element {
                                continue;
                            }
                            let conn = self.record(*up).map(|r| r.nodes.as_slice()).unwrap_or(&[]);
                            if rest.iter().all(|n| conn.contains(n)) {
                                higher.insert(*up);
                            }
                        }
                    }
                }
            }
            EntityRank::Element => {}
        }
        for up in higher {
            if let Some(rec) = self.record(up) {
                out.extend(
                    rec.parts
                        .iter()
                        .copied()
                        .filter(|&p| self.meta.part(p).primary_rank == Some(up.rank)),
                );
            }
        }
    }
}

impl<C: Communicator> MeshBulk for BulkData<C> {
    type Comm = C;

    fn meta(&self) -> &MetaData {
        &self.meta
    }

    fn comm(&self) -> &C {
        &self.comm
    }

    fn is_valid(&self, key: EntityKey) -> bool {
        self.record(key).is_some()
    }

    fn entity_ids(&self, rank: EntityRank) -> Vec<EntityId> {
        self.records[rank_index(rank)].keys().copied().collect()
    }

    fn topology(&self, key: EntityKey) -> Option<Topology> {
        self.record(key).and_then(|r| r.topology)
    }

    fn entity_nodes(&self, key: EntityKey) -> &[EntityId] {
        self.record(key).map(|r| r.nodes.as_slice()).unwrap_or(&[])
    }

    fn node_upward(&self, node: EntityId, rank: EntityRank) -> Vec<EntityId> {
        self.upward
            .get(&node)
            .into_iter()
            .flatten()
            .filter(|k| k.rank == rank)
            .map(|k| k.id)
            .collect()
    }

    fn parts(&self, key: EntityKey) -> BTreeSet<PartId> {
        let mut out = match self.record(key) {
            Some(rec) => rec.parts.clone(),
            None => return BTreeSet::new(),
        };
        self.induced_parts(key, &mut out);
        out
    }

    fn owner_rank(&self, key: EntityKey) -> usize {
        self.ownership[rank_index(key.rank)].owner(key.id)
    }

    fn sharing_procs(&self, key: EntityKey) -> Vec<usize> {
        self.ownership[rank_index(key.rank)].sharers(key.id).collect()
    }

    fn field_values(&self, field: FieldId, key: EntityKey) -> Option<&[f64]> {
        if !self.is_valid(key) || !self.meta.field_defined_on(field, key.rank, &self.parts(key)) {
            return None;
        }
        let n = self.meta.field(field).components;
        match self.fields.get(field.0 as usize).and_then(|s| s.restrict(key.id)) {
            Some(vals) => Some(vals),
            None if n <= MAX_ZERO_COMPONENTS => Some(&self.zeros[..n]),
            None => None,
        }
    }

    fn field_values_mut(&mut self, field: FieldId, key: EntityKey) -> Option<&mut [f64]> {
        if !self.is_valid(key) || !self.meta.field_defined_on(field, key.rank, &self.parts(key)) {
            return None;
        }
        let n = self.meta.field(field).components;
        let idx = field.0 as usize;
        if self.fields.len() <= idx {
            self.fields.resize_with(idx + 1, Section::new);
        }
        let section = &mut self.fields[idx];
        section.add_point(key.id, n);
        section.restrict_mut(key.id)
    }

    fn has_complete_local_view(&self) -> bool {
        self.comm.is_serial()
    }

    fn in_modifiable_state(&self) -> bool {
        self.in_modification
    }

    fn modification_begin(&mut self) -> Result<(), CdMeshError> {
        if self.in_modification {
            return Err(CdMeshError::ModificationInProgress);
        }
        self.in_modification = true;
        Ok(())
    }

    fn modification_end(&mut self) -> Result<(), CdMeshError> {
        self.require_modification()?;
        let touched = std::mem::take(&mut self.touched);
        for key in touched {
            self.refresh_field_storage(key);
        }
        self.in_modification = false;
        Ok(())
    }

    fn declare_node(&mut self, id: EntityId, parts: &[PartId]) -> Result<(), CdMeshError> {
        let record = EntityRecord {
            topology: None,
            nodes: Vec::new(),
            parts: parts.iter().copied().collect(),
        };
        self.insert_record(EntityKey::node(id), record)
    }

    fn declare_element(
        &mut self,
        id: EntityId,
        topology: Topology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<(), CdMeshError> {
        self.check_connectivity(topology, nodes)?;
        let record = EntityRecord {
            topology: Some(topology),
            nodes: nodes.to_vec(),
            parts: parts.iter().copied().collect(),
        };
        self.insert_record(EntityKey::element(id), record)
    }

    fn declare_side(
        &mut self,
        id: EntityId,
        topology: Topology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<(), CdMeshError> {
        self.check_connectivity(topology, nodes)?;
        let record = EntityRecord {
            topology: Some(topology),
            nodes: nodes.to_vec(),
            parts: parts.iter().copied().collect(),
        };
        self.insert_record(EntityKey::side(id), record)
    }

    fn destroy_entity(&mut self, key: EntityKey) -> Result<(), CdMeshError> {
        self.require_modification()?;
        if self.record(key).is_none() {
            return Err(CdMeshError::MissingEntity {
                rank: key.rank,
                id: key.id,
            });
        }
        if key.rank == EntityRank::Node && self.upward.get(&key.id).is_some_and(|u| !u.is_empty()) {
            return Err(CdMeshError::EntityHasRelations {
                rank: key.rank,
                id: key.id,
            });
        }
        self.mark_touched(key);
        let Some(rec) = self.records[rank_index(key.rank)].remove(&key.id) else {
            return Ok(());
        };
        for n in &rec.nodes {
            if let Some(up) = self.upward.get_mut(n) {
                up.remove(&key);
                if up.is_empty() {
                    self.upward.remove(n);
                }
            }
        }
        self.ownership[rank_index(key.rank)].remove(key.id);
        Ok(())
    }

    fn change_entity_parts(
        &mut self,
        key: EntityKey,
        add: &[PartId],
        remove: &[PartId],
    ) -> Result<(), CdMeshError> {
        self.require_modification()?;
        let rec = self.records[rank_index(key.rank)]
            .get_mut(&key.id)
            .ok_or(CdMeshError::MissingEntity {
                rank: key.rank,
                id: key.id,
            })?;
        for p in remove {
            rec.parts.remove(p);
        }
        rec.parts.extend(add.iter().copied());
        self.mark_touched(key);
        Ok(())
    }

    fn set_sharing(&mut self, key: EntityKey, procs: &[usize]) {
        self.ownership[rank_index(key.rank)].set_shared(key.id, procs.iter().copied());
    }

    fn generate_new_ids(&mut self, rank: EntityRank, count: usize) -> Result<Vec<EntityId>, CdMeshError> {
        self.id_pool.generate(&self.comm, rank, count)
    }

    fn communicate_field_data(&mut self, fields: &[FieldId]) -> Result<(), CdMeshError> {
        if self.comm.is_serial() {
            return Ok(());
        }
        let me = self.comm.rank();
        let mut outgoing: BTreeMap<usize, Vec<(EntityKey, Vec<Option<Vec<f64>>>)>> = BTreeMap::new();
        for rank in EntityRank::ALL {
            for (id, entry) in self.ownership[rank_index(rank)].shared() {
                if entry.owner != me {
                    continue;
                }
                let key = EntityKey::new(rank, id);
                let vals: Vec<Option<Vec<f64>>> = fields
                    .iter()
                    .map(|&f| self.field_values(f, key).map(<[f64]>::to_vec))
                    .collect();
                for &p in &entry.sharers {
                    outgoing.entry(p).or_default().push((key, vals.clone()));
                }
            }
        }

        let received = {
            let mut sparse = CommSparse::new(&self.comm);
            for (p, items) in &outgoing {
                let buf = sparse.send_buffer(*p);
                buf.pack_usize(items.len());
                for (key, vals) in items {
                    buf.pack_u8(rank_index(key.rank) as u8);
                    buf.pack_u64(key.id.get());
                    for v in vals {
                        buf.pack_bool(v.is_some());
                        if let Some(v) = v {
                            buf.pack_f64_slice(v);
                        }
                    }
                }
            }
            sparse.communicate(FIELD_COMM_TAG)?
        };

        for (_, mut buf) in received {
            let n = buf.unpack_usize()?;
            for _ in 0..n {
                let rank = EntityRank::ALL[buf.unpack_u8()? as usize % 3];
                let id = EntityId::new(buf.unpack_u64()?)?;
                let key = EntityKey::new(rank, id);
                for &f in fields {
                    if !buf.unpack_bool()? {
                        continue;
                    }
                    let vals = buf.unpack_f64_vec()?;
                    if let Some(dst) = self.field_values_mut(f, key) {
                        if dst.len() == vals.len() {
                            dst.copy_from_slice(&vals);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::mesh::MeshQueryExt;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn two_tris() -> (BulkData<NoComm>, PartId) {
        let mut meta = MetaData::new(2);
        let block = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        let mut mesh = BulkData::new(meta, NoComm);
        mesh.modification_begin().unwrap();
        for (n, x) in [(1, [0.0, 0.0]), (2, [1.0, 0.0]), (3, [0.0, 1.0]), (4, [1.0, 1.0])] {
            mesh.declare_node(id(n), &[]).unwrap();
            mesh.set_coordinates(id(n), [x[0], x[1], 0.0]);
        }
        mesh.declare_element(id(1), Topology::Tri3, &[id(1), id(2), id(3)], &[block]).unwrap();
        mesh.declare_element(id(2), Topology::Tri3, &[id(2), id(4), id(3)], &[block]).unwrap();
        mesh.modification_end().unwrap();
        (mesh, block)
    }

    #[test]
    fn brackets_are_enforced() {
        let (mut mesh, _) = two_tris();
        assert_eq!(mesh.declare_node(id(9), &[]), Err(CdMeshError::ModificationNotInProgress));
        mesh.modification_begin().unwrap();
        assert_eq!(mesh.modification_begin(), Err(CdMeshError::ModificationInProgress));
        assert!(matches!(
            mesh.destroy_entity(EntityKey::node(id(2))),
            Err(CdMeshError::EntityHasRelations { .. })
        ));
        mesh.modification_end().unwrap();
    }

    #[test]
    fn induced_membership_and_relations() {
        let (mut mesh, block) = two_tris();
        assert!(mesh.has_part(EntityKey::node(id(2)), block));
        assert_eq!(mesh.entities_through_relations(&[id(2), id(3)], EntityRank::Element), vec![id(1), id(2)]);
        mesh.modification_begin().unwrap();
        mesh.declare_side(id(1), Topology::Line2, &[id(2), id(3)], &[]).unwrap();
        mesh.modification_end().unwrap();
        assert_eq!(mesh.find_side(&[id(3), id(2)]), Some(id(1)));
        assert_eq!(mesh.side_elements(id(1)), vec![id(1), id(2)]);
        assert_eq!(mesh.side_ordinal(id(1), id(1)), Some(1));
        assert!(mesh.has_part(EntityKey::side(id(1)), block));
    }

    #[test]
    fn restricted_field_storage_follows_parts() {
        let (mut mesh, block) = two_tris();
        let phase = mesh.meta_mut().declare_io_part("block_1_A", EntityRank::Element).unwrap();
        let f = mesh.meta_mut().declare_field("temperature", EntityRank::Node, 1).unwrap();
        mesh.meta_mut().put_field_on_part(f, phase);
        assert!(mesh.field_values(f, EntityKey::node(id(1))).is_none());

        mesh.modification_begin().unwrap();
        mesh.change_entity_parts(EntityKey::element(id(1)), &[phase], &[block]).unwrap();
        mesh.modification_end().unwrap();
        mesh.field_values_mut(f, EntityKey::node(id(1))).unwrap()[0] = 5.0;
        assert_eq!(mesh.field_values(f, EntityKey::node(id(1))), Some(&[5.0][..]));
        assert!(mesh.field_values(f, EntityKey::node(id(4))).is_none());

        mesh.modification_begin().unwrap();
        mesh.change_entity_parts(EntityKey::element(id(1)), &[block], &[phase]).unwrap();
        mesh.change_entity_parts(EntityKey::element(id(1)), &[phase], &[block]).unwrap();
        mesh.modification_end().unwrap();
        assert_eq!(mesh.field_values(f, EntityKey::node(id(1))), Some(&[5.0][..]));
    }

    #[test]
    fn coordinates_round_trip() {
        let (mesh, _) = two_tris();
        assert_eq!(mesh.coordinates(id(4)), [1.0, 1.0, 0.0]);
        assert_eq!(mesh.selected_entities(EntityRank::Node, &crate::mesh::Selector::All).len(), 4);
    }
}
