//! Phases, interfaces and the part scheme of decomposed blocks.
//!
//! Every decomposed block `B` gets
//! - a nonconformal part `B_nonconformal` holding cut parent elements,
//! - one conformal io part `B_<phase>` per phase,
//! - one interface side part `surface_B_<phaseA>_<phaseB>` per ordered pair
//!   of distinct phases.
//!
//! Decomposed sidesets `S` get `S_nonconformal` and `S_<phase>` likewise.
//! [`CdfemParts`] holds the bookkeeping parts shared by all blocks.

use crate::mesh::{FieldId, MetaData, PartId, Selector};
use crate::mesh_error::CdMeshError;
use crate::topology::cell_type::Topology;
use crate::topology::point::EntityRank;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Index of a level set surface in the geometry's surface list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

/// One interface: a single level set zero crossing `(i, i)`, or the boundary
/// between the phases of level sets `i < j`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId {
    first: u32,
    second: u32,
}

impl InterfaceId {
    pub fn new(a: u32, b: u32) -> Self {
        Self {
            first: a.min(b),
            second: a.max(b),
        }
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn second(&self) -> u32 {
        self.second
    }

    pub fn is_single_level_set(&self) -> bool {
        self.first == self.second
    }

    pub fn to_wire(self) -> u64 {
        (u64::from(self.first) << 32) | u64::from(self.second)
    }

    pub fn from_wire(v: u64) -> Self {
        Self::new((v >> 32) as u32, v as u32)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.first, self.second)
    }
}

/// Set of `(surface, sign)` pairs classifying a region.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseTag(BTreeSet<(SurfaceId, i8)>);

impl PhaseTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(surface: SurfaceId, sign: i8) -> Self {
        let mut t = Self::new();
        t.add(surface, sign);
        t
    }

    pub fn add(&mut self, surface: SurfaceId, sign: i8) {
        self.0.insert((surface, sign));
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every entry of `other` is also in `self`.
    pub fn contains(&self, other: &PhaseTag) -> bool {
        other.0.is_subset(&self.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceId, i8)> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (s, sign)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}{}", s.0, if *sign < 0 { '-' } else { '+' })?;
        }
        f.write_str("}")
    }
}

#[derive(Clone, Debug)]
pub struct PhaseInfo {
    pub name: String,
    pub tag: PhaseTag,
}

#[derive(Clone, Debug)]
struct DecomposedPart {
    rank: EntityRank,
    nonconformal: PartId,
    conformal: Vec<PartId>,
}

/// Registry of phases and of the parts derived from decomposed blocks and
/// sidesets.
#[derive(Clone, Debug, Default)]
pub struct PhaseSupport {
    one_ls_per_phase: bool,
    phases: Vec<PhaseInfo>,
    decomposed: BTreeMap<PartId, DecomposedPart>,
    conformal: HashMap<PartId, (PartId, usize)>,
    nonconformal: HashMap<PartId, PartId>,
    interfaces: BTreeMap<(PartId, PartId), PartId>,
    interface_parts: BTreeSet<PartId>,
}

impl PhaseSupport {
    pub fn new(one_ls_per_phase: bool) -> Self {
        Self {
            one_ls_per_phase,
            ..Self::default()
        }
    }

    /// Two phases split by the sign of one level set.
    pub fn single_level_set(negative: &str, positive: &str) -> Self {
        let mut ps = Self::new(false);
        ps.add_phase(negative, PhaseTag::with(SurfaceId(0), -1));
        ps.add_phase(positive, PhaseTag::with(SurfaceId(0), 1));
        ps
    }

    /// One phase per level set; a point belongs to the level set with the
    /// smallest value.
    pub fn level_set_per_phase(names: &[&str]) -> Self {
        let mut ps = Self::new(true);
        for (i, name) in names.iter().enumerate() {
            ps.add_phase(name, PhaseTag::with(SurfaceId(i as u32), -1));
        }
        ps
    }

    pub fn add_phase(&mut self, name: &str, tag: PhaseTag) -> usize {
        self.phases.push(PhaseInfo {
            name: name.to_owned(),
            tag,
        });
        self.phases.len() - 1
    }

    pub fn one_levelset_per_phase(&self) -> bool {
        self.one_ls_per_phase
    }

    pub fn phases(&self) -> &[PhaseInfo] {
        &self.phases
    }

    /// Declare the derived parts of the element block `block`.
    pub fn decompose_block(&mut self, meta: &mut MetaData, block: &str) -> Result<(), CdMeshError> {
        let base = meta.require_part(block)?;
        if meta.part(base).primary_rank != Some(EntityRank::Element) {
            return Err(CdMeshError::IncompatibleDeclaration(block.to_owned()));
        }
        self.declare_derived(meta, base, block, EntityRank::Element)?;
        let conformal = self.decomposed[&base].conformal.clone();
        for (a, &pa) in conformal.iter().enumerate() {
            for (b, &pb) in conformal.iter().enumerate() {
                if a == b {
                    continue;
                }
                let name = format!("surface_{block}_{}_{}", self.phases[a].name, self.phases[b].name);
                let surf = meta.declare_io_part(&name, EntityRank::Side)?;
                self.interfaces.insert((pa, pb), surf);
                self.interface_parts.insert(surf);
            }
        }
        Ok(())
    }

    /// Declare the derived parts of the sideset `sideset`.
    pub fn decompose_sideset(&mut self, meta: &mut MetaData, sideset: &str) -> Result<(), CdMeshError> {
        let base = meta.require_part(sideset)?;
        if meta.part(base).primary_rank != Some(EntityRank::Side) {
            return Err(CdMeshError::IncompatibleDeclaration(sideset.to_owned()));
        }
        self.declare_derived(meta, base, sideset, EntityRank::Side)
    }

    fn declare_derived(
        &mut self,
        meta: &mut MetaData,
        base: PartId,
        name: &str,
        rank: EntityRank,
    ) -> Result<(), CdMeshError> {
        let nonconformal = meta.declare_part(&format!("{name}_nonconformal"), Some(rank))?;
        let mut conformal = Vec::with_capacity(self.phases.len());
        for (i, phase) in self.phases.iter().enumerate() {
            let p = meta.declare_io_part(&format!("{name}_{}", phase.name), rank)?;
            self.conformal.insert(p, (base, i));
            conformal.push(p);
        }
        self.nonconformal.insert(nonconformal, base);
        self.decomposed.insert(
            base,
            DecomposedPart {
                rank,
                nonconformal,
                conformal,
            },
        );
        Ok(())
    }

    /// Original block or sideset a derived part belongs to.
    pub fn base_part(&self, part: PartId) -> Option<PartId> {
        if self.decomposed.contains_key(&part) {
            Some(part)
        } else if let Some(&(base, _)) = self.conformal.get(&part) {
            Some(base)
        } else {
            self.nonconformal.get(&part).copied()
        }
    }

    /// Whether `part` is a decomposed block or sideset, or derived from one.
    pub fn is_decomposed(&self, part: PartId) -> bool {
        self.base_part(part).is_some()
    }

    pub fn is_conformal(&self, part: PartId) -> bool {
        self.conformal.contains_key(&part)
    }

    pub fn is_nonconformal(&self, part: PartId) -> bool {
        self.nonconformal.contains_key(&part)
    }

    pub fn is_interface(&self, part: PartId) -> bool {
        self.interface_parts.contains(&part)
    }

    pub fn interface_parts(&self) -> impl Iterator<Item = PartId> + '_ {
        self.interface_parts.iter().copied()
    }

    /// Conformal parts of `rank`, in block then phase order.
    pub fn conformal_parts(&self, rank: EntityRank) -> Vec<PartId> {
        self.decomposed
            .values()
            .filter(|d| d.rank == rank)
            .flat_map(|d| d.conformal.iter().copied())
            .collect()
    }

    /// Index of the first phase whose tag is contained in `phase`.
    pub fn phase_index(&self, phase: &PhaseTag) -> Option<usize> {
        self.phases.iter().position(|p| phase.contains(&p.tag))
    }

    /// The conformal part of `part`'s block for `phase`, or `part` itself when
    /// it is not decomposed or no phase matches.
    pub fn find_conformal_io_part(&self, part: PartId, phase: &PhaseTag) -> PartId {
        let (Some(base), Some(idx)) = (self.base_part(part), self.phase_index(phase)) else {
            return part;
        };
        self.decomposed[&base].conformal.get(idx).copied().unwrap_or(part)
    }

    pub fn find_nonconformal_part(&self, part: PartId) -> PartId {
        self.base_part(part)
            .map_or(part, |base| self.decomposed[&base].nonconformal)
    }

    /// Interface side part between conformal volume parts `a` and `b`.
    pub fn find_interface_part(&self, a: PartId, b: PartId) -> Option<PartId> {
        self.interfaces.get(&(a, b)).copied()
    }

    /// Phase represented by a conformal part.
    pub fn iopart_phase(&self, part: PartId) -> Option<&PhaseTag> {
        self.conformal.get(&part).map(|&(_, i)| &self.phases[i].tag)
    }

    /// Elements of the decomposed blocks in any of their states.
    pub fn all_decomposed_blocks_selector(&self) -> Selector {
        let parts = self
            .decomposed
            .iter()
            .filter(|(_, d)| d.rank == EntityRank::Element)
            .flat_map(|(&base, d)| std::iter::once(base).chain([d.nonconformal]).chain(d.conformal.iter().copied()));
        Selector::any_of(parts)
    }
}

/// Bookkeeping parts and fields shared by every decomposed block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CdfemParts {
    pub active: PartId,
    pub parent: PartId,
    pub child: PartId,
    pub child_edge_node: PartId,
    pub block_boundary: PartId,
    pub internal_side: PartId,
    /// Two-component node field holding the parent node ids of edge nodes.
    pub parent_node_ids: FieldId,
}

impl CdfemParts {
    /// Declare the parts, the topology root parts of the spatial dimension and
    /// the restart field.
    pub fn declare(meta: &mut MetaData) -> Result<Self, CdMeshError> {
        let dim = meta.spatial_dimension();
        let (elements, sides): (&[Topology], &[Topology]) = match dim {
            1 => (&[Topology::Line2, Topology::Line3], &[Topology::Point]),
            2 => (&[Topology::Tri3, Topology::Tri6], &[Topology::Line2, Topology::Line3]),
            _ => (&[Topology::Tet4, Topology::Tet10], &[Topology::Tri3, Topology::Tri6]),
        };
        for &t in elements {
            meta.declare_topology_part(t, EntityRank::Element)?;
        }
        for &t in sides {
            meta.declare_topology_part(t, EntityRank::Side)?;
        }
        Ok(Self {
            active: meta.declare_part("ACTIVE_CONTEXT_BIT", None)?,
            parent: meta.declare_part("CDFEM_PARENT_CONTEXT_BIT", Some(EntityRank::Element))?,
            child: meta.declare_part("CDFEM_CHILD_CONTEXT_BIT", Some(EntityRank::Element))?,
            child_edge_node: meta.declare_part("CDFEM_CHILD_EDGE_NODE_PART", Some(EntityRank::Node))?,
            block_boundary: meta.declare_part("CDFEM_BLOCK_BOUNDARY", Some(EntityRank::Side))?,
            internal_side: meta.declare_part("CDFEM_INTERNAL_SIDE", Some(EntityRank::Side))?,
            parent_node_ids: meta.declare_field("CDFEM_PARENT_NODE_IDS", EntityRank::Node, 2)?,
        })
    }

    /// Parts a child element inherits from its parent when present there.
    pub fn attribute_parts(&self) -> [PartId; 2] {
        [self.active, self.block_boundary]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MetaData, PhaseSupport, PartId) {
        let mut meta = MetaData::new(2);
        let block = meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        meta.declare_io_part("surface_1", EntityRank::Side).unwrap();
        let mut ps = PhaseSupport::single_level_set("A", "B");
        ps.decompose_block(&mut meta, "block_1").unwrap();
        ps.decompose_sideset(&mut meta, "surface_1").unwrap();
        (meta, ps, block)
    }

    #[test]
    fn part_naming_scheme() {
        let (meta, ps, block) = setup();
        let a = meta.get_part("block_1_A").unwrap();
        let b = meta.get_part("block_1_B").unwrap();
        let nc = meta.get_part("block_1_nonconformal").unwrap();
        let neg = PhaseTag::with(SurfaceId(0), -1);
        let pos = PhaseTag::with(SurfaceId(0), 1);

        assert_eq!(ps.find_conformal_io_part(block, &neg), a);
        assert_eq!(ps.find_conformal_io_part(a, &pos), b);
        assert_eq!(ps.find_conformal_io_part(nc, &pos), b);
        assert_eq!(ps.find_nonconformal_part(b), nc);
        assert_eq!(ps.iopart_phase(b), Some(&pos));
        assert!(ps.is_conformal(a) && ps.is_nonconformal(nc) && !ps.is_conformal(block));

        let ab = ps.find_interface_part(a, b).unwrap();
        assert_eq!(meta.part(ab).name, "surface_block_1_A_B");
        assert!(ps.is_interface(ab));
        assert_eq!(ps.interface_parts().count(), 2);

        let ss = meta.get_part("surface_1").unwrap();
        assert_eq!(meta.part(ps.find_conformal_io_part(ss, &neg)).name, "surface_1_A");
        assert_eq!(ps.conformal_parts(EntityRank::Element), vec![a, b]);
    }

    #[test]
    fn undecomposed_parts_pass_through() {
        let (mut meta, ps, _) = setup();
        let other = meta.declare_io_part("block_2", EntityRank::Element).unwrap();
        let neg = PhaseTag::with(SurfaceId(0), -1);
        assert_eq!(ps.find_conformal_io_part(other, &neg), other);
        assert_eq!(ps.find_conformal_io_part(other, &PhaseTag::new()), other);
        assert!(!ps.all_decomposed_blocks_selector().contains(&[other].into_iter().collect()));
    }

    #[test]
    fn phase_tag_containment() {
        let mut both = PhaseTag::with(SurfaceId(0), -1);
        both.add(SurfaceId(1), 1);
        assert!(both.contains(&PhaseTag::with(SurfaceId(1), 1)));
        assert!(!PhaseTag::with(SurfaceId(1), 1).contains(&both));
        assert_eq!(both.to_string(), "{0-,1+}");
        let id = InterfaceId::new(3, 1);
        assert_eq!((id.first(), id.second()), (1, 3));
        assert_eq!(InterfaceId::from_wire(id.to_wire()), id);
    }

    #[test]
    fn bookkeeping_parts() {
        let mut meta = MetaData::new(3);
        let parts = CdfemParts::declare(&mut meta).unwrap();
        assert_eq!(meta.part(parts.child).primary_rank, Some(EntityRank::Element));
        assert!(meta.topology_part(Topology::Tet10).is_some());
        assert_eq!(meta.field(parts.parent_node_ids).components, 2);
        assert_eq!(CdfemParts::declare(&mut meta).unwrap(), parts);
    }
}
