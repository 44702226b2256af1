//! Axis-aligned bounding boxes.

use crate::algs::collectives::all_gather;
use crate::algs::communicator::Communicator;
use crate::mesh_error::CdMeshError;
use crate::geometry::metrics::distance_squared;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }
}

impl BoundingBox {
    pub fn from_points<'a, I: IntoIterator<Item = &'a [f64; 3]>>(points: I) -> Self {
        let mut b = Self::default();
        for p in points {
            b.accommodate(p);
        }
        b
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|d| self.min[d] > self.max[d])
    }

    pub fn accommodate(&mut self, p: &[f64; 3]) {
        for d in 0..3 {
            self.min[d] = self.min[d].min(p[d]);
            self.max[d] = self.max[d].max(p[d]);
        }
    }

    pub fn accommodate_box(&mut self, other: &BoundingBox) {
        if !other.is_empty() {
            self.accommodate(&other.min);
            self.accommodate(&other.max);
        }
    }

    /// Grow by `amount` in every direction. Empty boxes stay empty.
    pub fn pad(&mut self, amount: f64) {
        if self.is_empty() {
            return;
        }
        for d in 0..3 {
            self.min[d] -= amount;
            self.max[d] += amount;
        }
    }

    /// Grow by a relative round-off amount so touching boxes overlap.
    pub fn pad_epsilon(&mut self) {
        let extent = (0..3).map(|d| self.max[d] - self.min[d]).fold(1.0, f64::max);
        self.pad(1e-12 * extent);
    }

    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        (0..3).all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    /// Axis with the largest extent.
    pub fn longest_axis(&self) -> usize {
        (0..3)
            .max_by(|&a, &b| (self.max[a] - self.min[a]).total_cmp(&(self.max[b] - self.min[b])))
            .unwrap_or(0)
    }

    /// Squared distance from `p` to the closest point of the box.
    pub fn min_distance_squared(&self, p: &[f64; 3]) -> f64 {
        let q: [f64; 3] = std::array::from_fn(|d| p[d].clamp(self.min[d], self.max[d]));
        distance_squared(*p, q)
    }

    /// Squared distance from `p` to the farthest corner of the box.
    pub fn max_distance_squared(&self, p: &[f64; 3]) -> f64 {
        (0..3)
            .map(|d| {
                let a = (p[d] - self.min[d]).abs().max((p[d] - self.max[d]).abs());
                a * a
            })
            .sum()
    }

    fn to_wire(self) -> [f64; 6] {
        [self.min[0], self.min[1], self.min[2], self.max[0], self.max[1], self.max[2]]
    }

    fn from_wire(w: [f64; 6]) -> Self {
        Self {
            min: [w[0], w[1], w[2]],
            max: [w[3], w[4], w[5]],
        }
    }

    /// Every rank's box, indexed by rank. Collective.
    pub fn gather<C: Communicator>(&self, comm: &C) -> Result<Vec<BoundingBox>, CdMeshError> {
        let all = all_gather(comm, &[self.to_wire()])?;
        Ok(all
            .into_iter()
            .map(|v| v.first().copied().map_or_else(BoundingBox::default, BoundingBox::from_wire))
            .collect())
    }
}
