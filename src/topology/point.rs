//! `EntityId`: a strong, zero-cost handle for mesh entities
//!
//! Every node, side and element of the collaborator mesh is addressed by a
//! globally unique identifier within its rank. `EntityId` wraps a nonzero
//! `u64` so that 0 stays reserved as an invalid or sentinel value, which is
//! also how absent parents are encoded in restart fields and on the wire.
//!
//! This module provides:
//! - A transparent `EntityId` newtype around `NonZeroU64`.
//! - [`EntityRank`], the three entity ranks the decomposition works with.
//! - [`EntityKey`], the `(rank, id)` pair that identifies an entity uniquely.

use crate::mesh_error::CdMeshError;
use std::{fmt, num::NonZeroU64};

/// Identifier of a mesh entity within its [`EntityRank`].
///
/// # Memory layout
/// This type is `repr(transparent)`, meaning it has the same ABI and
/// alignment as its single field (`NonZeroU64`) and travels on the wire
/// exactly like a `u64`.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct EntityId(NonZeroU64);

impl EntityId {
    /// Creates a new `EntityId` from a raw `u64` value.
    ///
    /// # Errors
    /// Returns [`CdMeshError::InvalidEntityId`] if `raw == 0`.
    ///
    /// # Example
    /// ```rust
    /// # use cdmesh::topology::point::EntityId;
    /// let p = EntityId::new(1).unwrap();
    /// assert_eq!(p.get(), 1);
    /// assert!(EntityId::new(0).is_err());
    /// ```
    #[inline]
    pub fn new(raw: u64) -> Result<Self, CdMeshError> {
        NonZeroU64::new(raw)
            .map(EntityId)
            .ok_or(CdMeshError::InvalidEntityId)
    }

    /// Decode an optional id where 0 means "none".
    #[inline]
    pub fn from_raw_opt(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(EntityId)
    }

    /// Returns the inner `u64` value of this `EntityId`.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityId").field(&self.get()).finish()
    }
}

/// Prints only the raw integer.
impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Provide MPI compatibility: `EntityId` can be sent over MPI as a `u64`.
#[cfg(feature = "mpi-support")]
unsafe impl mpi::datatype::Equivalence for EntityId {
    type Out = <u64 as mpi::datatype::Equivalence>::Out;

    fn equivalent_datatype() -> Self::Out {
        u64::equivalent_datatype()
    }
}

/// Entity ranks understood by the decomposition.
///
/// Sides are the codimension-one entities of the elements: points for 1D
/// elements, segments for 2D, triangles for 3D.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum EntityRank {
    Node,
    Side,
    Element,
}

impl EntityRank {
    pub const ALL: [EntityRank; 3] = [EntityRank::Node, EntityRank::Side, EntityRank::Element];
}

/// Rank-qualified entity identifier.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct EntityKey {
    pub rank: EntityRank,
    pub id: EntityId,
}

impl EntityKey {
    #[inline]
    pub const fn new(rank: EntityRank, id: EntityId) -> Self {
        Self { rank, id }
    }

    #[inline]
    pub const fn node(id: EntityId) -> Self {
        Self::new(EntityRank::Node, id)
    }

    #[inline]
    pub const fn side(id: EntityId) -> Self {
        Self::new(EntityRank::Side, id)
    }

    #[inline]
    pub const fn element(id: EntityId) -> Self {
        Self::new(EntityRank::Element, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.rank, self.id)
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(EntityId, u64);
    assert_eq_size!(Option<EntityId>, u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        assert_eq!(EntityId::new(0), Err(CdMeshError::InvalidEntityId));
        assert!(EntityId::from_raw_opt(0).is_none());
    }

    #[test]
    fn display_and_debug() {
        let p = EntityId::new(42).unwrap();
        assert_eq!(format!("{p}"), "42");
        assert_eq!(format!("{p:?}"), "EntityId(42)");
        assert_eq!(format!("{}", EntityKey::node(p)), "Node[42]");
    }

    #[test]
    fn keys_order_by_rank_then_id() {
        let a = EntityKey::node(EntityId::new(9).unwrap());
        let b = EntityKey::element(EntityId::new(1).unwrap());
        assert!(a < b);
    }

    #[test]
    fn serde_is_transparent() {
        let p = EntityId::new(7).unwrap();
        let s = serde_json::to_string(&p).unwrap();
        assert_eq!(s, "7");
        let back: EntityId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, p);
    }
}
