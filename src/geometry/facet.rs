//! Closest-point queries on point, segment and triangle facets.
//!
//! Facets are the sides of the previous decomposition's interface; the
//! prolongation search needs the closest point and its barycentric weights
//! so that nodal values can be interpolated there.

use crate::geometry::bounding_box::BoundingBox;
use crate::geometry::metrics::{add, distance_squared, dot, scale, sub};

/// Closest point on a facet together with its barycentric weights.
#[derive(Clone, Debug, PartialEq)]
pub struct FacetProjection {
    pub point: [f64; 3],
    pub weights: Vec<f64>,
    pub distance_squared: f64,
}

/// Project `p` onto the simplex spanned by `vertices` (1, 2 or 3 points).
pub fn closest_point(vertices: &[[f64; 3]], p: &[f64; 3]) -> FacetProjection {
    let weights = match vertices.len() {
        0 => Vec::new(),
        1 => vec![1.0],
        2 => segment_weights(vertices[0], vertices[1], *p).to_vec(),
        _ => triangle_weights(vertices[0], vertices[1], vertices[2], *p).to_vec(),
    };
    let point = vertices
        .iter()
        .zip(&weights)
        .fold([0.0; 3], |acc, (v, &w)| add(acc, scale(*v, w)));
    FacetProjection {
        point,
        distance_squared: if vertices.is_empty() { f64::INFINITY } else { distance_squared(point, *p) },
        weights,
    }
}

pub fn facet_bounding_box(vertices: &[[f64; 3]]) -> BoundingBox {
    BoundingBox::from_points(vertices)
}

fn segment_weights(a: [f64; 3], b: [f64; 3], p: [f64; 3]) -> [f64; 2] {
    let ab = sub(b, a);
    let len2 = dot(ab, ab);
    if len2 <= 0.0 {
        return [1.0, 0.0];
    }
    let t = (dot(sub(p, a), ab) / len2).clamp(0.0, 1.0);
    [1.0 - t, t]
}

// Region tests on the Voronoi regions of the triangle's features.
fn triangle_weights(a: [f64; 3], b: [f64; 3], c: [f64; 3], p: [f64; 3]) -> [f64; 3] {
    let ab = sub(b, a);
    let ac = sub(c, a);
    let ap = sub(p, a);
    let d1 = dot(ab, ap);
    let d2 = dot(ac, ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return [1.0, 0.0, 0.0];
    }

    let bp = sub(p, b);
    let d3 = dot(ab, bp);
    let d4 = dot(ac, bp);
    if d3 >= 0.0 && d4 <= d3 {
        return [0.0, 1.0, 0.0];
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return [1.0 - v, v, 0.0];
    }

    let cp = sub(p, c);
    let d5 = dot(ab, cp);
    let d6 = dot(ac, cp);
    if d6 >= 0.0 && d5 <= d6 {
        return [0.0, 0.0, 1.0];
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return [1.0 - w, 0.0, w];
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return [0.0, 1.0 - w, w];
    }

    let denom = va + vb + vc;
    if denom.abs() <= f64::MIN_POSITIVE {
        return [1.0, 0.0, 0.0];
    }
    let v = vb / denom;
    let w = vc / denom;
    [1.0 - v - w, v, w]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TRI: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

    #[test]
    fn triangle_regions() {
        let above = closest_point(&TRI, &[0.25, 0.25, 2.0]);
        assert!((above.distance_squared - 4.0).abs() < 1e-12);
        assert!((above.weights[1] - 0.25).abs() < 1e-12);

        let corner = closest_point(&TRI, &[-1.0, -1.0, 0.0]);
        assert_eq!(corner.weights, vec![1.0, 0.0, 0.0]);

        let hyp = closest_point(&TRI, &[1.0, 1.0, 0.0]);
        assert!((hyp.point[0] - 0.5).abs() < 1e-12 && (hyp.point[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn segment_and_point() {
        let seg = closest_point(&TRI[..2], &[2.0, 1.0, 0.0]);
        assert_eq!(seg.weights, vec![0.0, 1.0]);
        assert_eq!(seg.distance_squared, 2.0);
        let pt = closest_point(&TRI[..1], &[0.0, 3.0, 0.0]);
        assert_eq!(pt.distance_squared, 9.0);
    }

    proptest! {
        #[test]
        fn projection_is_no_farther_than_any_vertex(
            x in -3.0f64..3.0, y in -3.0f64..3.0, z in -1.0f64..1.0
        ) {
            let p = [x, y, z];
            let proj = closest_point(&TRI, &p);
            let sum: f64 = proj.weights.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            prop_assert!(proj.weights.iter().all(|&w| w >= -1e-12));
            for v in &TRI {
                prop_assert!(proj.distance_squared <= distance_squared(*v, p) + 1e-9);
            }
        }
    }
}
