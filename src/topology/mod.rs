//! Entity identities, cell topologies, ownership and periodic node pairs.

pub mod cache;
pub mod cell_type;
pub mod ownership;
pub mod periodic;
pub mod point;

pub use cache::InvalidateCache;
pub use cell_type::Topology;
pub use point::{EntityId, EntityKey, EntityRank};
