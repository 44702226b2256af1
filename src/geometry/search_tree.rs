//! Bounding volume hierarchy for nearest-entity candidate searches.
//!
//! [`SearchTree::find_closest_entities`] does not compute exact distances:
//! it returns every entity whose box could hold the closest point, that is
//! every box whose minimum distance to the query does not exceed the smallest
//! maximum distance over all boxes. Callers then evaluate the exact distance on
//! this short list.

use crate::geometry::bounding_box::BoundingBox;

const LEAF_SIZE: usize = 4;

#[derive(Clone, Debug)]
struct TreeNode {
    bbox: BoundingBox,
    /// Children for inner nodes, item range for leaves.
    kind: NodeKind,
}

#[derive(Clone, Debug)]
enum NodeKind {
    Inner { left: usize, right: usize },
    Leaf { start: usize, end: usize },
}

#[derive(Clone, Debug)]
pub struct SearchTree<T> {
    items: Vec<(BoundingBox, T)>,
    nodes: Vec<TreeNode>,
}

impl<T> SearchTree<T> {
    pub fn new(mut items: Vec<(BoundingBox, T)>) -> Self {
        let mut nodes = Vec::new();
        if !items.is_empty() {
            let n = items.len();
            build(&mut items, 0, n, &mut nodes);
        }
        Self { items, nodes }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.nodes.first().map(|n| n.bbox).unwrap_or_default()
    }

    /// Candidate entities for the closest-point query at `p`.
    pub fn find_closest_entities(&self, p: &[f64; 3]) -> Vec<&T> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let mut bound = f64::INFINITY;
        self.tighten_bound(0, p, &mut bound);

        let mut out = Vec::new();
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if node.bbox.min_distance_squared(p) > bound {
                continue;
            }
            match node.kind {
                NodeKind::Inner { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
                NodeKind::Leaf { start, end } => {
                    out.extend(
                        self.items[start..end]
                            .iter()
                            .filter(|(b, _)| b.min_distance_squared(p) <= bound)
                            .map(|(_, t)| t),
                    );
                }
            }
        }
        out
    }

    fn tighten_bound(&self, i: usize, p: &[f64; 3], bound: &mut f64) {
        let node = &self.nodes[i];
        if node.bbox.min_distance_squared(p) > *bound {
            return;
        }
        match node.kind {
            NodeKind::Inner { left, right } => {
                let dl = self.nodes[left].bbox.min_distance_squared(p);
                let dr = self.nodes[right].bbox.min_distance_squared(p);
                let (first, second) = if dl <= dr { (left, right) } else { (right, left) };
                self.tighten_bound(first, p, bound);
                self.tighten_bound(second, p, bound);
            }
            NodeKind::Leaf { start, end } => {
                for (b, _) in &self.items[start..end] {
                    *bound = bound.min(b.max_distance_squared(p));
                }
            }
        }
    }
}

fn build<T>(items: &mut [(BoundingBox, T)], start: usize, end: usize, nodes: &mut Vec<TreeNode>) -> usize {
    let mut bbox = BoundingBox::default();
    for (b, _) in &items[start..end] {
        bbox.accommodate_box(b);
    }
    let index = nodes.len();
    nodes.push(TreeNode {
        bbox,
        kind: NodeKind::Leaf { start, end },
    });
    if end - start <= LEAF_SIZE {
        return index;
    }

    let axis = bbox.longest_axis();
    items[start..end].sort_by(|a, b| a.0.center()[axis].total_cmp(&b.0.center()[axis]));
    let mid = start + (end - start) / 2;
    let left = build(items, start, mid, nodes);
    let right = build(items, mid, end, nodes);
    nodes[index].kind = NodeKind::Inner { left, right };
    index
}
