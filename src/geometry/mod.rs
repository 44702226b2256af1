//! Geometric utilities for the decomposition.
//!
//! Measures and normals of simplices, element quality, bounding boxes,
//! closest points on facets and a bounding volume hierarchy used by the
//! prolongation search.

pub mod bounding_box;
pub mod facet;
pub mod metrics;
pub mod quality;
pub mod search_tree;

pub use bounding_box::BoundingBox;
pub use facet::{FacetProjection, closest_point};
pub use search_tree::SearchTree;
