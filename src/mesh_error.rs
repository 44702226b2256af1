//! CdMeshError: Unified error type for cdmesh public APIs
//!
//! Recoverable failures of the mesh collaborator, the communication layer and
//! the wire codecs are reported through this type. Topology corruption detected
//! during decomposition is not recoverable and goes through
//! [`cdfem_require!`](crate::cdfem_require) instead.

use crate::topology::point::{EntityId, EntityRank};
use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for cdmesh operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CdMeshError {
    /// Attempted to construct an EntityId with a zero value (invalid).
    #[error("EntityId must be non-zero (0 is reserved as invalid/sentinel)")]
    InvalidEntityId,
    /// Referenced an entity that is not present on this rank.
    #[error("{rank:?} entity {id} not found")]
    MissingEntity { rank: EntityRank, id: EntityId },
    /// Tried to declare an entity whose key already exists.
    #[error("{rank:?} entity {id} already exists")]
    DuplicateEntity { rank: EntityRank, id: EntityId },
    /// Entity still referenced by higher-rank entities.
    #[error("{rank:?} entity {id} is still connected to other entities")]
    EntityHasRelations { rank: EntityRank, id: EntityId },
    /// Unknown part name.
    #[error("part `{0}` is not registered")]
    UnknownPart(String),
    /// Unknown field name.
    #[error("field `{0}` is not registered")]
    UnknownField(String),
    /// Part or field declared twice with incompatible attributes.
    #[error("`{0}` is already declared with different attributes")]
    IncompatibleDeclaration(String),
    /// Field slice length did not match the registered component count.
    #[error("field `{field}` expects {expected} components, got {found}")]
    FieldLengthMismatch {
        field: String,
        expected: usize,
        found: usize,
    },
    /// Element connectivity does not match its topology.
    #[error("topology {topology} expects {expected} nodes, got {found}")]
    ConnectivityMismatch {
        topology: &'static str,
        expected: usize,
        found: usize,
    },
    /// `modification_begin` called while a modification cycle is open.
    #[error("mesh modification already in progress")]
    ModificationInProgress,
    /// Mutation attempted outside a modification cycle.
    #[error("mesh modification not in progress")]
    ModificationNotInProgress,
    /// Generated entity id would not fit the configured 32-bit policy.
    #[error("entity id {0} exceeds the 32-bit id range")]
    IdOverflow(u64),
    /// Communication with a neighbor failed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: CommFailure,
    },
    /// A received buffer could not be decoded.
    #[error("malformed message from rank {neighbor}: {reason}")]
    MalformedMessage { neighbor: usize, reason: String },
}

/// Detail payload of [`CdMeshError::CommError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommFailure(pub String);

impl From<String> for CommFailure {
    fn from(msg: String) -> Self {
        CommFailure(msg)
    }
}

impl From<&str> for CommFailure {
    fn from(msg: &str) -> Self {
        CommFailure(msg.to_owned())
    }
}
