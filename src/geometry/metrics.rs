//! Measures of simplices and their sides.
//!
//! Vertex orderings follow [`Topology`]: segments `[v0, v1]`, triangles
//! `[v0, v1, v2]` counter-clockwise, tetrahedra `[v0, v1, v2, v3]` with positive
//! orientation. Quadratic topologies are measured through their vertices.

use crate::topology::cell_type::Topology;

const EPS: f64 = 1e-300;

/// Length, area or volume of a simplex (unsigned).
pub fn simplex_measure(topology: Topology, vertices: &[[f64; 3]]) -> f64 {
    match topology.dimension() {
        0 => 1.0,
        1 => norm(sub(vertices[1], vertices[0])),
        2 => 0.5 * norm(cross(sub(vertices[1], vertices[0]), sub(vertices[2], vertices[0]))),
        _ => signed_volume(vertices[0], vertices[1], vertices[2], vertices[3]).abs(),
    }
}

/// Longest vertex-to-vertex edge.
pub fn max_edge_length(topology: Topology, vertices: &[[f64; 3]]) -> f64 {
    topology
        .edges()
        .iter()
        .map(|e| norm(sub(vertices[e[1]], vertices[e[0]])))
        .fold(0.0, f64::max)
}

pub fn centroid(points: &[[f64; 3]]) -> [f64; 3] {
    if points.is_empty() {
        return [0.0; 3];
    }
    let mut c = [0.0; 3];
    for p in points {
        c = add(c, *p);
    }
    scale(c, 1.0 / points.len() as f64)
}

/// Unit normal of a side given by its vertices.
///
/// Sides of a 1D element have the +x normal; sides of triangles use
/// `(dy, -dx)`, which points outward for counter-clockwise triangles; sides of
/// tetrahedra use the right-hand rule on their vertex ordering.
pub fn side_normal(side_topology: Topology, vertices: &[[f64; 3]]) -> [f64; 3] {
    let n = match side_topology.dimension() {
        0 => return [1.0, 0.0, 0.0],
        1 => {
            let d = sub(vertices[1], vertices[0]);
            [d[1], -d[0], 0.0]
        }
        _ => cross(sub(vertices[1], vertices[0]), sub(vertices[2], vertices[0])),
    };
    let len = norm(n);
    if len <= EPS { [0.0; 3] } else { scale(n, 1.0 / len) }
}

/// Affine combination `sum_i w_i x_i`.
pub fn weighted_point(points: &[[f64; 3]], weights: &[f64]) -> [f64; 3] {
    points
        .iter()
        .zip(weights)
        .fold([0.0; 3], |acc, (p, &w)| add(acc, scale(*p, w)))
}

pub(crate) fn signed_volume(a: [f64; 3], b: [f64; 3], c: [f64; 3], d: [f64; 3]) -> f64 {
    dot(sub(b, a), cross(sub(c, a), sub(d, a))) / 6.0
}

pub(crate) fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub(crate) fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

pub(crate) fn distance_squared(a: [f64; 3], b: [f64; 3]) -> f64 {
    let d = sub(a, b);
    dot(d, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn measures() {
        let tri = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert!(approx(simplex_measure(Topology::Tri3, &tri), 0.5));
        let tet = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert!(approx(simplex_measure(Topology::Tet4, &tet), 1.0 / 6.0));
        assert!(approx(simplex_measure(Topology::Line2, &tri[..2]), 1.0));
        assert!(approx(max_edge_length(Topology::Tri3, &tri), 2f64.sqrt()));
    }

    #[test]
    fn side_normals_point_outward() {
        let tet = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let side: Vec<[f64; 3]> = Topology::Tet4.side_vertices(0).iter().map(|&i| tet[i]).collect();
        let n = side_normal(Topology::Tri3, &side);
        assert!(approx(n[1], -1.0));

        let tri = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let n = side_normal(Topology::Line2, &tri[..2]);
        assert!(approx(n[1], -1.0));
    }

    #[test]
    fn weighted_point_is_affine() {
        let p = weighted_point(&[[0.0, 0.0, 0.0], [2.0, 4.0, 0.0]], &[0.75, 0.25]);
        assert!(approx(p[0], 0.5) && approx(p[1], 1.0));
    }
}
