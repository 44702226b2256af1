//! Simplex topologies handled by the decomposition.
//!
//! Node numbering, edge numbering and side numbering follow the usual
//! exodus conventions: vertices first, then one midside node per edge in edge
//! order. Sides are listed by their vertices with outward orientation.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topology {
    /// 0D side of a 1D element.
    Point,
    Line2,
    Line3,
    Tri3,
    Tri6,
    Tet4,
    Tet10,
}

const LINE_EDGES: [[usize; 2]; 1] = [[0, 1]];
const TRI_EDGES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [1, 2], [2, 0], [0, 3], [1, 3], [2, 3]];

const LINE_SIDES: [&[usize]; 2] = [&[0], &[1]];
const TRI_SIDES: [&[usize]; 3] = [&[0, 1], &[1, 2], &[2, 0]];
const TET_SIDES: [&[usize]; 4] = [&[0, 1, 3], &[1, 2, 3], &[0, 3, 2], &[0, 2, 1]];

const REF_LINE: [[f64; 3]; 2] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
const REF_TRI: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
const REF_TET: [[f64; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
];

impl Topology {
    pub fn name(self) -> &'static str {
        match self {
            Topology::Point => "Point",
            Topology::Line2 => "Line2",
            Topology::Line3 => "Line3",
            Topology::Tri3 => "Tri3",
            Topology::Tri6 => "Tri6",
            Topology::Tet4 => "Tet4",
            Topology::Tet10 => "Tet10",
        }
    }

    /// Topological dimension.
    pub fn dimension(self) -> usize {
        match self {
            Topology::Point => 0,
            Topology::Line2 | Topology::Line3 => 1,
            Topology::Tri3 | Topology::Tri6 => 2,
            Topology::Tet4 | Topology::Tet10 => 3,
        }
    }

    pub fn num_vertices(self) -> usize {
        self.dimension() + 1
    }

    pub fn num_nodes(self) -> usize {
        if self.is_quadratic() {
            self.num_vertices() + self.num_edges()
        } else {
            self.num_vertices()
        }
    }

    pub fn is_quadratic(self) -> bool {
        matches!(self, Topology::Line3 | Topology::Tri6 | Topology::Tet10)
    }

    /// Linear counterpart (vertices only).
    pub fn base_topology(self) -> Topology {
        match self {
            Topology::Line3 => Topology::Line2,
            Topology::Tri6 => Topology::Tri3,
            Topology::Tet10 => Topology::Tet4,
            t => t,
        }
    }

    /// Quadratic counterpart of a linear topology.
    pub fn quadratic_topology(self) -> Topology {
        match self {
            Topology::Line2 => Topology::Line3,
            Topology::Tri3 => Topology::Tri6,
            Topology::Tet4 => Topology::Tet10,
            t => t,
        }
    }

    /// Topologies the decomposition can cut.
    pub fn is_supported_element(self) -> bool {
        !matches!(self, Topology::Point)
    }

    pub fn edges(self) -> &'static [[usize; 2]] {
        match self.dimension() {
            0 => &[],
            1 => &LINE_EDGES,
            2 => &TRI_EDGES,
            _ => &TET_EDGES,
        }
    }

    pub fn num_edges(self) -> usize {
        self.edges().len()
    }

    /// Local index of the midside node of edge `edge` in the quadratic
    /// counterpart of this topology.
    pub fn edge_midside_node(self, edge: usize) -> usize {
        self.num_vertices() + edge
    }

    /// Edge ordinal joining two local vertices, if any.
    pub fn edge_between(self, a: usize, b: usize) -> Option<usize> {
        self.edges()
            .iter()
            .position(|e| (e[0] == a && e[1] == b) || (e[0] == b && e[1] == a))
    }

    pub fn num_sides(self) -> usize {
        match self.dimension() {
            0 => 0,
            d => d + 1,
        }
    }

    /// Vertices of side `side`, in outward orientation.
    pub fn side_vertices(self, side: usize) -> &'static [usize] {
        match self.dimension() {
            1 => LINE_SIDES[side],
            2 => TRI_SIDES[side],
            3 => TET_SIDES[side],
            _ => &[],
        }
    }

    /// All local nodes of side `side`, including midside nodes for quadratic
    /// topologies.
    pub fn side_nodes(self, side: usize) -> Vec<usize> {
        let verts = self.side_vertices(side);
        let mut nodes = verts.to_vec();
        if self.is_quadratic() && verts.len() > 1 {
            let side_topo = self.side_topology();
            for e in side_topo.edges() {
                let (a, b) = (verts[e[0]], verts[e[1]]);
                if let Some(edge) = self.edge_between(a, b) {
                    nodes.push(self.edge_midside_node(edge));
                }
            }
        }
        nodes
    }

    pub fn side_topology(self) -> Topology {
        match self {
            Topology::Point => Topology::Point,
            Topology::Line2 | Topology::Line3 => Topology::Point,
            Topology::Tri3 => Topology::Line2,
            Topology::Tri6 => Topology::Line3,
            Topology::Tet4 => Topology::Tri3,
            Topology::Tet10 => Topology::Tri6,
        }
    }

    /// Parametric coordinates of the vertices.
    pub fn vertex_parametric_coords(self) -> &'static [[f64; 3]] {
        match self.dimension() {
            0 => &REF_LINE[..1],
            1 => &REF_LINE,
            2 => &REF_TRI,
            _ => &REF_TET,
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_counts() {
        assert_eq!(Topology::Line3.num_nodes(), 3);
        assert_eq!(Topology::Tri6.num_nodes(), 6);
        assert_eq!(Topology::Tet10.num_nodes(), 10);
        assert_eq!(Topology::Tet4.num_sides(), 4);
        assert_eq!(Topology::Point.num_sides(), 0);
    }

    #[test]
    fn tet_sides_cover_each_edge_twice() {
        let mut count = [0usize; 6];
        for s in 0..4 {
            let v = Topology::Tet4.side_vertices(s);
            for i in 0..3 {
                let e = Topology::Tet4.edge_between(v[i], v[(i + 1) % 3]).unwrap();
                count[e] += 1;
            }
        }
        assert!(count.iter().all(|&c| c == 2));
    }

    #[test]
    fn quadratic_side_nodes() {
        assert_eq!(Topology::Tri6.side_nodes(1), vec![1, 2, 4]);
        assert_eq!(Topology::Tet10.side_nodes(0), vec![0, 1, 3, 4, 8, 7]);
        assert_eq!(Topology::Line3.side_nodes(1), vec![1]);
    }
}
