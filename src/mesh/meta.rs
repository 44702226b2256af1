//! Part and field registries plus boolean part selectors.

use crate::mesh_error::CdMeshError;
use crate::topology::cell_type::Topology;
use crate::topology::point::EntityRank;
use std::collections::{BTreeSet, HashMap};
use std::ops::{BitAnd, BitOr, Not};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PartId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct FieldId(pub u32);

#[derive(Clone, Debug)]
pub struct Part {
    pub id: PartId,
    pub name: String,
    /// Entities of this rank induce membership on their downward entities.
    pub primary_rank: Option<EntityRank>,
    /// Blocks and sidesets that belong in output files.
    pub io: bool,
    pub topology: Option<Topology>,
}

#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub id: FieldId,
    pub name: String,
    pub rank: EntityRank,
    pub components: usize,
    /// Parts the field is defined on; empty means every entity of `rank`.
    pub restriction: BTreeSet<PartId>,
}

#[derive(Clone, Debug)]
pub struct MetaData {
    spatial_dim: usize,
    parts: Vec<Part>,
    part_by_name: HashMap<String, PartId>,
    fields: Vec<FieldSpec>,
    field_by_name: HashMap<String, FieldId>,
    coordinates: FieldId,
}

impl MetaData {
    pub fn new(spatial_dim: usize) -> Self {
        let mut meta = MetaData {
            spatial_dim,
            parts: Vec::new(),
            part_by_name: HashMap::new(),
            fields: Vec::new(),
            field_by_name: HashMap::new(),
            coordinates: FieldId(0),
        };
        meta.coordinates = meta.register_field("coordinates", EntityRank::Node, spatial_dim);
        meta
    }

    pub fn spatial_dimension(&self) -> usize {
        self.spatial_dim
    }

    pub fn coordinates_field(&self) -> FieldId {
        self.coordinates
    }

    fn register_field(&mut self, name: &str, rank: EntityRank, components: usize) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldSpec {
            id,
            name: name.to_owned(),
            rank,
            components,
            restriction: BTreeSet::new(),
        });
        self.field_by_name.insert(name.to_owned(), id);
        id
    }

    /// Declare (or look up) a part. Redeclaring with a different primary rank
    /// is an error.
    pub fn declare_part(&mut self, name: &str, primary_rank: Option<EntityRank>) -> Result<PartId, CdMeshError> {
        if let Some(&id) = self.part_by_name.get(name) {
            let existing = &self.parts[id.0 as usize];
            if primary_rank.is_some() && existing.primary_rank != primary_rank {
                return Err(CdMeshError::IncompatibleDeclaration(name.to_owned()));
            }
            return Ok(id);
        }
        let id = PartId(self.parts.len() as u32);
        self.parts.push(Part {
            id,
            name: name.to_owned(),
            primary_rank,
            io: false,
            topology: None,
        });
        self.part_by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Declare an output block or sideset.
    pub fn declare_io_part(&mut self, name: &str, rank: EntityRank) -> Result<PartId, CdMeshError> {
        let id = self.declare_part(name, Some(rank))?;
        self.parts[id.0 as usize].io = true;
        Ok(id)
    }

    /// Declare the topology root part for `topology` (e.g. `FEM_ROOT_CELL_TOPOLOGY_PART_Tri3`).
    pub fn declare_topology_part(&mut self, topology: Topology, rank: EntityRank) -> Result<PartId, CdMeshError> {
        let name = format!("FEM_ROOT_CELL_TOPOLOGY_PART_{}", topology.name());
        let id = self.declare_part(&name, Some(rank))?;
        self.parts[id.0 as usize].topology = Some(topology);
        Ok(id)
    }

    pub fn topology_part(&self, topology: Topology) -> Option<PartId> {
        self.get_part(&format!("FEM_ROOT_CELL_TOPOLOGY_PART_{}", topology.name()))
    }

    pub fn declare_field(&mut self, name: &str, rank: EntityRank, components: usize) -> Result<FieldId, CdMeshError> {
        if let Some(&id) = self.field_by_name.get(name) {
            let f = &self.fields[id.0 as usize];
            if f.rank != rank || f.components != components {
                return Err(CdMeshError::IncompatibleDeclaration(name.to_owned()));
            }
            return Ok(id);
        }
        Ok(self.register_field(name, rank, components))
    }

    /// Restrict `field` to `part` (in addition to earlier restrictions).
    pub fn put_field_on_part(&mut self, field: FieldId, part: PartId) {
        self.fields[field.0 as usize].restriction.insert(part);
    }

    pub fn part(&self, id: PartId) -> &Part {
        &self.parts[id.0 as usize]
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn get_part(&self, name: &str) -> Option<PartId> {
        self.part_by_name.get(name).copied()
    }

    pub fn require_part(&self, name: &str) -> Result<PartId, CdMeshError> {
        self.get_part(name).ok_or_else(|| CdMeshError::UnknownPart(name.to_owned()))
    }

    pub fn field(&self, id: FieldId) -> &FieldSpec {
        &self.fields[id.0 as usize]
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get_field(&self, name: &str) -> Option<FieldId> {
        self.field_by_name.get(name).copied()
    }

    pub fn require_field(&self, name: &str) -> Result<FieldId, CdMeshError> {
        self.get_field(name).ok_or_else(|| CdMeshError::UnknownField(name.to_owned()))
    }

    /// Whether `field` is defined on an entity of `rank` with `parts`.
    pub fn field_defined_on(&self, field: FieldId, rank: EntityRank, parts: &BTreeSet<PartId>) -> bool {
        let spec = self.field(field);
        spec.rank == rank && (spec.restriction.is_empty() || !spec.restriction.is_disjoint(parts))
    }
}

/// Boolean predicate over part membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    All,
    Nothing,
    Part(PartId),
    Union(Vec<Selector>),
    Intersection(Vec<Selector>),
    Complement(Box<Selector>),
}

impl Selector {
    pub fn contains(&self, parts: &BTreeSet<PartId>) -> bool {
        match self {
            Selector::All => true,
            Selector::Nothing => false,
            Selector::Part(p) => parts.contains(p),
            Selector::Union(v) => v.iter().any(|s| s.contains(parts)),
            Selector::Intersection(v) => v.iter().all(|s| s.contains(parts)),
            Selector::Complement(s) => !s.contains(parts),
        }
    }

    /// Union of the given parts (`Nothing` when empty).
    pub fn any_of<I: IntoIterator<Item = PartId>>(parts: I) -> Selector {
        let v: Vec<Selector> = parts.into_iter().map(Selector::Part).collect();
        if v.is_empty() { Selector::Nothing } else { Selector::Union(v) }
    }
}

impl From<PartId> for Selector {
    fn from(p: PartId) -> Self {
        Selector::Part(p)
    }
}

impl BitOr for Selector {
    type Output = Selector;
    fn bitor(self, rhs: Selector) -> Selector {
        Selector::Union(vec![self, rhs])
    }
}

impl BitAnd for Selector {
    type Output = Selector;
    fn bitand(self, rhs: Selector) -> Selector {
        Selector::Intersection(vec![self, rhs])
    }
}

impl Not for Selector {
    type Output = Selector;
    fn not(self) -> Selector {
        Selector::Complement(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_idempotent() {
        let mut meta = MetaData::new(2);
        let a = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        assert_eq!(meta.declare_part("block_1", None).unwrap(), a);
        assert!(meta.declare_part("block_1", Some(EntityRank::Side)).is_err());
        assert!(meta.part(a).io);
    }

    #[test]
    fn selector_algebra() {
        let parts: BTreeSet<PartId> = [PartId(1), PartId(3)].into_iter().collect();
        let sel = (Selector::Part(PartId(1)) | Selector::Part(PartId(2))) & !Selector::Part(PartId(4));
        assert!(sel.contains(&parts));
        assert!(!Selector::any_of([PartId(2)]).contains(&parts));
        assert!(!Selector::any_of(std::iter::empty()).contains(&parts));
    }

    #[test]
    fn field_restriction() {
        let mut meta = MetaData::new(1);
        let p = meta.declare_io_part("block_1_A", EntityRank::Element).unwrap();
        let f = meta.declare_field("temperature", EntityRank::Node, 1).unwrap();
        assert!(meta.field_defined_on(f, EntityRank::Node, &BTreeSet::new()));
        meta.put_field_on_part(f, p);
        assert!(!meta.field_defined_on(f, EntityRank::Node, &BTreeSet::new()));
        assert!(meta.field_defined_on(f, EntityRank::Node, &[p].into_iter().collect()));
        assert!(!meta.field_defined_on(f, EntityRank::Element, &[p].into_iter().collect()));
    }
}
