//! Field storage: an atlas of per-entity slices over one flat array.

pub mod atlas;
pub mod section;

pub use atlas::Atlas;
pub use section::Section;
