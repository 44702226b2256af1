//! Decomposition policy knobs.
//!
//! `CdfemConfig` is plain data: the embedding application builds it (or
//! deserializes it from its own input deck) and hands it to the
//! [`DecompositionSession`](crate::cdfem::session::DecompositionSession).

use crate::mesh::IdPolicy;
use serde::{Deserialize, Serialize};

/// How intersections that fall very close to existing nodes are handled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeDegeneracyHandling {
    /// Capture the intersection by the nearby node.
    #[default]
    SnapToNode,
    /// Move nodes onto the interface where element quality allows, then
    /// capture what remains by nearby nodes.
    SnapToInterfaceWhenQualityAllowsThenSnapToNode,
}

/// Length used to normalize interface displacement in the CFL estimate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CflLengthScale {
    #[default]
    Constant,
    /// Smallest adjacent element size, per interface side.
    LocalLength,
    /// Average size of all elements adjacent to the interface.
    L1Norm,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdfemConfig {
    pub edge_degeneracy_handling: EdgeDegeneracyHandling,
    /// Relative edge position below which an intersection is captured by the
    /// closer endpoint.
    pub snapping_tolerance: f64,
    /// Minimum element quality a snap to the interface may leave behind.
    pub snap_quality_threshold: f64,
    /// Nodal fields carried onto the new mesh; empty means every node field
    /// other than the coordinates and the restart parent ids.
    pub nodal_fields: Vec<String>,
    /// Nodal fields interpolated from the parent stencil on new child nodes
    /// instead of being taken from the nearest old facet.
    pub interpolation_fields: Vec<String>,
    /// Element fields carried onto the new mesh; empty means every one.
    pub element_fields: Vec<String>,
    pub cdfem_displacements_field: Option<String>,
    pub cdfem_displacements_old_field: Option<String>,
    pub snap_displacements_field: Option<String>,
    /// Create sides on subelement faces internal to a parent element.
    pub build_internal_sides: bool,
    pub cfl_length_scale: CflLengthScale,
    pub constant_length_scale: f64,
    pub assert_32bit_ids: bool,
    pub force_64bit_ids: bool,
    /// Search padding, as a multiple of the largest element, used on the first
    /// prolongation pass when a stashed generation exists.
    pub prolongation_initial_padding: f64,
    /// Padding, as a multiple of the largest CDFEM displacement, used when the
    /// prolongation pass is retried.
    pub prolongation_padding_growth: f64,
    pub debug_output: bool,
}

impl Default for CdfemConfig {
    fn default() -> Self {
        Self {
            edge_degeneracy_handling: EdgeDegeneracyHandling::default(),
            snapping_tolerance: 1e-2,
            snap_quality_threshold: 0.1,
            nodal_fields: Vec::new(),
            interpolation_fields: Vec::new(),
            element_fields: Vec::new(),
            cdfem_displacements_field: None,
            cdfem_displacements_old_field: None,
            snap_displacements_field: None,
            build_internal_sides: false,
            cfl_length_scale: CflLengthScale::default(),
            constant_length_scale: 1.0,
            assert_32bit_ids: false,
            force_64bit_ids: false,
            prolongation_initial_padding: 3.0,
            prolongation_padding_growth: 1.5,
            debug_output: false,
        }
    }
}

impl CdfemConfig {
    pub fn id_policy(&self) -> IdPolicy {
        IdPolicy {
            assert_32bit: self.assert_32bit_ids,
            force_64bit: self.force_64bit_ids,
        }
    }

    pub fn snaps_to_interface(&self) -> bool {
        self.edge_degeneracy_handling == EdgeDegeneracyHandling::SnapToInterfaceWhenQualityAllowsThenSnapToNode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: CdfemConfig = serde_json::from_str(
            r#"{ "edge_degeneracy_handling": "SnapToInterfaceWhenQualityAllowsThenSnapToNode",
                 "cfl_length_scale": "L1Norm",
                 "interpolation_fields": ["temperature"] }"#,
        )
        .unwrap();
        assert!(cfg.snaps_to_interface());
        assert_eq!(cfg.cfl_length_scale, CflLengthScale::L1Norm);
        assert_eq!(cfg.prolongation_padding_growth, 1.5);
        assert_eq!(cfg.interpolation_fields, vec!["temperature".to_owned()]);
        assert!(!cfg.id_policy().assert_32bit);
    }
}
