//! Message passing: communicators, sparse point-to-point exchange,
//! collectives and the wire records they carry.

pub mod collectives;
pub mod comm_sparse;
pub mod communicator;
pub mod wire;

pub use comm_sparse::{CommBuffer, CommSparse};
pub use communicator::{CommTag, Communicator, NoComm, RayonComm};
