//! Element quality for decomposed simplices.
//!
//! The quality of a simplex is its measure divided by the measure of the
//! regular simplex whose edge equals the simplex's longest edge. It is 1 for
//! regular simplices and tends to 0 for slivers. A whole decomposition is
//! summarized by the minimum and maximum over its active elements.

use crate::geometry::metrics::{max_edge_length, simplex_measure};
use crate::topology::cell_type::Topology;

const EPS: f64 = 1e-300;

/// Quality in `[0, 1]`; degenerate simplices score 0.
pub fn simplex_quality(topology: Topology, vertices: &[[f64; 3]]) -> f64 {
    let h = max_edge_length(topology, vertices);
    if h <= EPS {
        return 0.0;
    }
    let measure = simplex_measure(topology, vertices);
    let regular = match topology.dimension() {
        0 => return 1.0,
        1 => h,
        2 => 3f64.sqrt() / 4.0 * h * h,
        _ => h * h * h / (6.0 * 2f64.sqrt()),
    };
    (measure / regular).min(1.0)
}

/// Running minimum/maximum quality over a set of elements.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct QualitySummary {
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl Default for QualitySummary {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: 0.0,
            count: 0,
        }
    }
}

impl QualitySummary {
    pub fn accumulate(&mut self, quality: f64) {
        self.min = self.min.min(quality);
        self.max = self.max.max(quality);
        self.count += 1;
    }

    /// Ratio of the worst to the best element, 1 when empty.
    pub fn min_max_ratio(&self) -> f64 {
        if self.count == 0 || self.max <= EPS {
            1.0
        } else {
            self.min / self.max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_simplices_score_one() {
        let tri = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.5, 3f64.sqrt() / 2.0, 0.0]];
        assert!((simplex_quality(Topology::Tri3, &tri) - 1.0).abs() < 1e-12);
        let flat = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        assert_eq!(simplex_quality(Topology::Tri3, &flat), 0.0);
    }

    #[test]
    fn summary_tracks_extremes() {
        let mut s = QualitySummary::default();
        assert_eq!(s.min_max_ratio(), 1.0);
        s.accumulate(0.25);
        s.accumulate(0.5);
        assert_eq!(s.count, 2);
        assert!((s.min_max_ratio() - 0.5).abs() < 1e-15);
    }
}
