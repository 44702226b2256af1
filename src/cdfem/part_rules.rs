//! Part membership rules of decomposed entities.
//!
//! Pure functions from current part sets to `(add, remove)` changes, so the
//! rules can be applied to entities of any rank and tested without a mesh.

use crate::cdfem::phase::{CdfemParts, PhaseSupport, PhaseTag};
use crate::mesh::{MetaData, PartId};
use crate::topology::cell_type::Topology;
use crate::topology::point::EntityRank;
use std::collections::BTreeSet;

/// Part changes to apply to one entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartChange {
    pub add: BTreeSet<PartId>,
    pub remove: BTreeSet<PartId>,
}

impl PartChange {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Drop removals that are also additions and changes that are no-ops
    /// for `current`.
    pub fn normalized(mut self, current: &BTreeSet<PartId>) -> Self {
        self.remove.retain(|p| !self.add.contains(p) && current.contains(p));
        self.add.retain(|p| !current.contains(p));
        self
    }

    pub fn add_vec(&self) -> Vec<PartId> {
        self.add.iter().copied().collect()
    }

    pub fn remove_vec(&self) -> Vec<PartId> {
        self.remove.iter().copied().collect()
    }
}

fn has_rank(meta: &MetaData, part: PartId, rank: EntityRank) -> bool {
    meta.part(part).primary_rank == Some(rank)
}

fn is_io_or_decomposed(meta: &MetaData, ps: &PhaseSupport, part: PartId) -> bool {
    meta.part(part).io || ps.is_decomposed(part)
}

/// Move every io or decomposed part of `rank` to its conformal part for
/// `phase`. Parts already conformal for `phase` stay in `add`, so changes for
/// several phases can be merged before normalizing.
pub fn determine_conformal_parts(
    meta: &MetaData,
    ps: &PhaseSupport,
    current: &BTreeSet<PartId>,
    rank: EntityRank,
    phase: &PhaseTag,
) -> PartChange {
    let mut change = PartChange::default();
    for &part in current {
        if !has_rank(meta, part, rank) || !is_io_or_decomposed(meta, ps, part) || ps.is_interface(part) {
            continue;
        }
        let conformal = ps.find_conformal_io_part(part, phase);
        change.add.insert(conformal);
        if conformal != part {
            change.remove.insert(part);
        }
    }
    change
}

/// Move every decomposed part of `rank` to its nonconformal part and
/// deactivate; elements also become parents.
pub fn determine_nonconformal_parts(
    meta: &MetaData,
    ps: &PhaseSupport,
    parts: &CdfemParts,
    current: &BTreeSet<PartId>,
    rank: EntityRank,
) -> PartChange {
    let mut change = PartChange::default();
    for &part in current {
        if !has_rank(meta, part, rank) || !ps.is_decomposed(part) || ps.is_interface(part) {
            continue;
        }
        let nonconformal = ps.find_nonconformal_part(part);
        if nonconformal != part {
            change.add.insert(nonconformal);
            change.remove.insert(part);
        }
    }
    change.remove.insert(parts.active);
    if rank == EntityRank::Element {
        change.add.insert(parts.parent);
        change.remove.insert(parts.child);
    }
    change
}

/// Parts of a new child entity of `rank` with `topology` whose parent holds
/// `parent_parts`.
pub fn determine_child_conformal_parts(
    meta: &MetaData,
    ps: &PhaseSupport,
    parts: &CdfemParts,
    topology: Topology,
    parent_parts: &BTreeSet<PartId>,
    rank: EntityRank,
    phase: &PhaseTag,
) -> BTreeSet<PartId> {
    let mut out = BTreeSet::new();
    let attributes = parts.attribute_parts();
    for &part in parent_parts {
        if has_rank(meta, part, rank) && is_io_or_decomposed(meta, ps, part) && !ps.is_interface(part) {
            out.insert(ps.find_conformal_io_part(part, phase));
        } else if attributes.contains(&part) {
            out.insert(part);
        }
    }
    if let Some(t) = meta.topology_part(topology) {
        out.insert(t);
    }
    if rank == EntityRank::Element {
        out.insert(parts.child);
    }
    out.insert(parts.active);
    out
}

/// Parts a reused child entity may lose when its part set is recomputed.
pub fn is_removable_child_part(meta: &MetaData, ps: &PhaseSupport, parts: &CdfemParts, part: PartId) -> bool {
    is_io_or_decomposed(meta, ps, part)
        || part == parts.active
        || part == parts.parent
        || part == parts.child
        || part == parts.block_boundary
}

/// Whether an uncut element with `current` parts needs new parts for
/// `phase`.
pub fn element_io_part_changed(
    meta: &MetaData,
    ps: &PhaseSupport,
    parts: &CdfemParts,
    current: &BTreeSet<PartId>,
    phase: &PhaseTag,
) -> bool {
    if !current.contains(&parts.active) || current.contains(&parts.parent) {
        return true;
    }
    current.iter().any(|&part| {
        has_rank(meta, part, EntityRank::Element)
            && is_io_or_decomposed(meta, ps, part)
            && (ps.is_nonconformal(part) || ps.find_conformal_io_part(part, phase) != part)
    })
}

/// What a side sees of the elements around it (on every rank).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SideNeighborhood {
    /// Element-rank parts of the adjacent elements.
    pub element_parts: BTreeSet<PartId>,
    pub any_active: bool,
}

/// Parts of a side from the elements around it: nonconformal parts when only
/// parents touch it, conformal parts per adjacent phase, interface parts
/// between two phases and the block boundary part between two blocks.
pub fn determine_element_side_parts(
    meta: &MetaData,
    ps: &PhaseSupport,
    parts: &CdfemParts,
    side_parts: &BTreeSet<PartId>,
    around: &SideNeighborhood,
) -> PartChange {
    let conformal: Vec<PartId> = around.element_parts.iter().copied().filter(|&p| ps.is_conformal(p)).collect();
    let nonconformal = around.element_parts.iter().any(|&p| ps.is_nonconformal(p));
    crate::cdfem_require!(
        conformal.len() <= 2,
        "side touches {} conformal volume parts, at most 2 are allowed",
        conformal.len()
    );

    let mut change = PartChange::default();
    let blocks: BTreeSet<PartId> = around
        .element_parts
        .iter()
        .copied()
        .filter(|&p| meta.part(p).io && !ps.is_nonconformal(p))
        .map(|p| ps.base_part(p).unwrap_or(p))
        .collect();
    if blocks.len() > 1 {
        change.add.insert(parts.block_boundary);
    } else {
        change.remove.insert(parts.block_boundary);
    }

    if conformal.is_empty() {
        if nonconformal {
            let nc = determine_nonconformal_parts(meta, ps, parts, side_parts, EntityRank::Side);
            change.add.extend(nc.add);
            change.remove.extend(nc.remove);
        } else if around.any_active {
            change.add.insert(parts.active);
        } else {
            change.remove.insert(parts.active);
        }
        return change.normalized(side_parts);
    }

    let phases: Vec<PhaseTag> = conformal.iter().filter_map(|&p| ps.iopart_phase(p).cloned()).collect();
    if conformal.len() == 2 && phases.len() == 2 && phases[0] != phases[1] {
        change.add.extend(ps.find_interface_part(conformal[0], conformal[1]));
        change.add.extend(ps.find_interface_part(conformal[1], conformal[0]));
    }
    for &p in side_parts {
        if ps.is_interface(p) && !change.add.contains(&p) {
            change.remove.insert(p);
        }
    }
    for phase in &phases {
        let c = determine_conformal_parts(meta, ps, side_parts, EntityRank::Side, phase);
        change.add.extend(c.add);
        change.remove.extend(c.remove);
    }
    if around.any_active {
        change.add.insert(parts.active);
    } else {
        change.remove.insert(parts.active);
    }
    change.normalized(side_parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdfem::phase::SurfaceId;

    struct Setup {
        meta: MetaData,
        ps: PhaseSupport,
        parts: CdfemParts,
    }

    fn setup() -> Setup {
        let mut meta = MetaData::new(2);
        meta.declare_io_part("block_1", EntityRank::Element).unwrap();
        meta.declare_io_part("block_2", EntityRank::Element).unwrap();
        meta.declare_io_part("surface_1", EntityRank::Side).unwrap();
        let mut ps = PhaseSupport::single_level_set("A", "B");
        ps.decompose_block(&mut meta, "block_1").unwrap();
        ps.decompose_sideset(&mut meta, "surface_1").unwrap();
        let parts = CdfemParts::declare(&mut meta).unwrap();
        Setup { meta, ps, parts }
    }

    fn part(s: &Setup, name: &str) -> PartId {
        s.meta.get_part(name).unwrap()
    }

    fn neg() -> PhaseTag {
        PhaseTag::with(SurfaceId(0), -1)
    }

    fn pos() -> PhaseTag {
        PhaseTag::with(SurfaceId(0), 1)
    }

    #[test]
    fn parent_becomes_nonconformal() {
        let s = setup();
        let current = BTreeSet::from([part(&s, "block_1"), s.parts.active]);
        let c = determine_nonconformal_parts(&s.meta, &s.ps, &s.parts, &current, EntityRank::Element)
            .normalized(&current);
        assert_eq!(c.add, BTreeSet::from([part(&s, "block_1_nonconformal"), s.parts.parent]));
        assert_eq!(c.remove, BTreeSet::from([part(&s, "block_1"), s.parts.active]));
    }

    #[test]
    fn child_parts_follow_the_parent() {
        let s = setup();
        let parent = BTreeSet::from([part(&s, "block_1"), s.parts.active, s.parts.parent]);
        let child = determine_child_conformal_parts(
            &s.meta,
            &s.ps,
            &s.parts,
            Topology::Tri3,
            &parent,
            EntityRank::Element,
            &pos(),
        );
        assert!(child.contains(&part(&s, "block_1_B")));
        assert!(child.contains(&s.parts.child) && child.contains(&s.parts.active));
        assert!(!child.contains(&s.parts.parent) && !child.contains(&part(&s, "block_1")));
        assert!(child.contains(&s.meta.topology_part(Topology::Tri3).unwrap()));
    }

    #[test]
    fn uncut_element_change_detection() {
        let s = setup();
        let a = part(&s, "block_1_A");
        let current = BTreeSet::from([a, s.parts.active]);
        assert!(!element_io_part_changed(&s.meta, &s.ps, &s.parts, &current, &neg()));
        assert!(element_io_part_changed(&s.meta, &s.ps, &s.parts, &current, &pos()));
        let undecomposed = BTreeSet::from([part(&s, "block_2"), s.parts.active]);
        assert!(!element_io_part_changed(&s.meta, &s.ps, &s.parts, &undecomposed, &pos()));
    }

    #[test]
    fn side_between_phases_is_an_interface() {
        let s = setup();
        let (a, b) = (part(&s, "block_1_A"), part(&s, "block_1_B"));
        let around = SideNeighborhood {
            element_parts: BTreeSet::from([a, b]),
            any_active: true,
        };
        let c = determine_element_side_parts(&s.meta, &s.ps, &s.parts, &BTreeSet::new(), &around);
        let ab = s.ps.find_interface_part(a, b).unwrap();
        let ba = s.ps.find_interface_part(b, a).unwrap();
        assert!(c.add.contains(&ab) && c.add.contains(&ba) && c.add.contains(&s.parts.active));
        assert!(!c.add.contains(&s.parts.block_boundary));
    }

    #[test]
    fn stale_interface_parts_are_removed() {
        let s = setup();
        let (a, b) = (part(&s, "block_1_A"), part(&s, "block_1_B"));
        let ab = s.ps.find_interface_part(a, b).unwrap();
        let ss = part(&s, "surface_1");
        let current = BTreeSet::from([ab, ss, s.parts.active]);
        let around = SideNeighborhood {
            element_parts: BTreeSet::from([a]),
            any_active: true,
        };
        let c = determine_element_side_parts(&s.meta, &s.ps, &s.parts, &current, &around);
        assert!(c.remove.contains(&ab) && c.remove.contains(&ss));
        assert_eq!(c.add, BTreeSet::from([part(&s, "surface_1_A")]));
    }

    #[test]
    fn parent_only_side_is_nonconformal_and_inactive() {
        let s = setup();
        let ss = part(&s, "surface_1");
        let current = BTreeSet::from([ss, s.parts.active]);
        let around = SideNeighborhood {
            element_parts: BTreeSet::from([part(&s, "block_1_nonconformal"), s.parts.parent]),
            any_active: false,
        };
        let c = determine_element_side_parts(&s.meta, &s.ps, &s.parts, &current, &around);
        assert_eq!(c.add, BTreeSet::from([part(&s, "surface_1_nonconformal")]));
        assert_eq!(c.remove, BTreeSet::from([ss, s.parts.active]));
    }

    #[test]
    fn block_boundary_between_blocks() {
        let s = setup();
        let around = SideNeighborhood {
            element_parts: BTreeSet::from([part(&s, "block_1_A"), part(&s, "block_2")]),
            any_active: true,
        };
        let c = determine_element_side_parts(&s.meta, &s.ps, &s.parts, &BTreeSet::new(), &around);
        assert!(c.add.contains(&s.parts.block_boundary));
    }
}
