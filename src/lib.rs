#![cfg_attr(docsrs, feature(doc_cfg))]
//! # cdmesh
//!
//! cdmesh decomposes a distributed simplex mesh conformally to one or more
//! implicit interfaces. Elements crossed by an interface are replaced by
//! child elements whose faces follow it, the children take the parts of the
//! phase they lie in, and sides along the interface join interface parts.
//! Field data is carried from one decomposition to the next.
//!
//! ## Features
//! - Conformal decomposition of 1D bars, 2D triangles and 3D tetrahedra,
//!   linear or quadratic
//! - Single level set or one level set per phase interfaces
//! - Snapping of near-degenerate intersections to nodes or onto interfaces
//! - Mesh modification with parallel-consistent entity ids and part membership
//! - Prolongation of nodal and element fields across generations, with a
//!   facet search shipped between ranks
//! - Restart and rebalance reconstruction from parent-id fields
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Usage
//! Declare the parts of the decomposed blocks with
//! [`PhaseSupport`](cdfem::PhaseSupport) and [`CdfemParts`](cdfem::CdfemParts),
//! build a [`BulkData`](mesh::BulkData) (or implement
//! [`MeshBulk`](mesh::MeshBulk) for your own mesh), and call
//! [`DecompositionSession::decompose_mesh`](cdfem::DecompositionSession::decompose_mesh)
//! every time the interface moves.
//!
//! ```toml
//! [dependencies]
//! cdmesh = "0.3"
//! # features = ["mpi-support"]
//! ```

pub mod algs;
pub mod cdfem;
pub mod data;
pub mod debug_invariants;
pub mod geometry;
pub mod mesh;
pub mod mesh_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use mesh_error::CdMeshError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::cdfem::{
        CdMesh, CdfemConfig, CdfemParts, DecompositionSession, DecompositionStatus, InterfaceGeometry,
        NodalLevelSetGeometry, PhaseSupport, PhaseTag, Snapper, ThresholdSnapper,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::mesh::{BulkData, FieldId, MeshBulk, MeshQueryExt, MetaData, PartId, Selector};
    pub use crate::mesh_error::CdMeshError;
    pub use crate::topology::cell_type::Topology;
    pub use crate::topology::point::{EntityId, EntityKey, EntityRank};
}
