//! Conformal decomposition of a finite element mesh by level set interfaces.
//!
//! Elements of the decomposed blocks that an interface crosses are replaced
//! in the mesh by child elements whose faces follow the interface; each child
//! carries the parts of the phase it lies in. [`DecompositionSession`] drives
//! one decomposition per call, with [`CdMesh`] holding the per-generation
//! state.

pub mod ancestry;
pub mod cdmesh;
pub mod cfl;
pub mod config;
pub mod diagnostics;
pub mod element;
pub mod interface_geometry;
pub mod modify;
pub mod node;
pub mod part_rules;
pub mod phase;
pub mod prolongation;
pub mod restore;
pub mod session;
pub mod snap;
pub mod sync;
pub mod transfer;

pub use cdmesh::CdMesh;
pub use config::{CdfemConfig, CflLengthScale, EdgeDegeneracyHandling};
pub use element::{ElementSignature, MeshElement, SubElement};
pub use interface_geometry::{InterfaceGeometry, NodalLevelSetGeometry};
pub use node::{NodeArena, NodeIdx, NodeKind, SubElementNode};
pub use phase::{CdfemParts, InterfaceId, PhaseSupport, PhaseTag};
pub use session::{DecompositionSession, DecompositionStatus};
pub use snap::{NodeToCapturedDomainsMap, Snapper, ThresholdSnapper};
