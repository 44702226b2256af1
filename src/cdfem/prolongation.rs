//! Field data stashed from the previous decomposition.
//!
//! Before the mesh is modified, the values of the prolonged fields are copied
//! into a [`ProlongationStore`]: per node, per element, and the interface
//! sides of the old decomposition as [`ProlongationFacet`]s. After the
//! modification, new nodes take their values from the closest old facet
//! carrying the same field set. Facets live on the rank that stashed them and
//! are shipped to the ranks whose new nodes may be close to them.

use crate::algs::collectives::all_gather;
use crate::algs::comm_sparse::{CommBuffer, CommSparse};
use crate::algs::communicator::{CommTag, Communicator};
use crate::cdfem::config::CdfemConfig;
use crate::cdfem::phase::CdfemParts;
use crate::geometry::bounding_box::BoundingBox;
use crate::geometry::facet::{closest_point, facet_bounding_box};
use crate::geometry::metrics::distance_squared;
use crate::geometry::search_tree::SearchTree;
use crate::mesh::{FieldId, MetaData};
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityRank};
use std::collections::{BTreeMap, BTreeSet};

const FACET_TAG: CommTag = CommTag::new(0x1000);

/// Which fields are carried from one generation to the next.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProlongationFields {
    pub node: Vec<FieldId>,
    /// Node fields interpolated from the parent stencil on child nodes.
    pub interpolation: Vec<FieldId>,
    pub element: Vec<FieldId>,
}

impl ProlongationFields {
    pub fn from_config(meta: &MetaData, config: &CdfemConfig, parts: &CdfemParts) -> Result<Self, CdMeshError> {
        let excluded = [meta.coordinates_field(), parts.parent_node_ids];
        let select = |names: &[String], rank: EntityRank| -> Result<Vec<FieldId>, CdMeshError> {
            if names.is_empty() {
                return Ok((0..meta.fields().len() as u32)
                    .map(FieldId)
                    .filter(|&f| meta.field(f).rank == rank && !excluded.contains(&f))
                    .collect());
            }
            names.iter().map(|n| meta.require_field(n)).collect()
        };
        let node = select(&config.nodal_fields, EntityRank::Node)?;
        let interpolation = config
            .interpolation_fields
            .iter()
            .map(|n| meta.require_field(n))
            .collect::<Result<Vec<_>, _>>()?;
        let element = select(&config.element_fields, EntityRank::Element)?;
        Ok(Self {
            node,
            interpolation,
            element,
        })
    }
}

/// Values of the prolonged fields defined on one entity.
pub type FieldValues = BTreeMap<FieldId, Vec<f64>>;

fn pack_fields(buf: &mut CommBuffer, fields: &FieldValues) {
    buf.pack_usize(fields.len());
    for (f, v) in fields {
        buf.pack_u32(f.0);
        buf.pack_f64_slice(v);
    }
}

fn unpack_fields(buf: &mut CommBuffer) -> Result<FieldValues, CdMeshError> {
    let n = buf.unpack_usize()?;
    let mut out = FieldValues::new();
    for _ in 0..n {
        let f = FieldId(buf.unpack_u32()?);
        out.insert(f, buf.unpack_f64_vec()?);
    }
    Ok(out)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProlongationNodeData {
    pub id: EntityId,
    pub coords: [f64; 3],
    pub fields: FieldValues,
}

impl ProlongationNodeData {
    fn pack(&self, buf: &mut CommBuffer) {
        buf.pack_u64(self.id.get());
        buf.pack_f64_slice(&self.coords);
        pack_fields(buf, &self.fields);
    }

    fn unpack(buf: &mut CommBuffer) -> Result<Self, CdMeshError> {
        let id = EntityId::new(buf.unpack_u64()?)?;
        let c = buf.unpack_f64_vec()?;
        let mut coords = [0.0; 3];
        for (dst, src) in coords.iter_mut().zip(&c) {
            *dst = *src;
        }
        Ok(Self {
            id,
            coords,
            fields: unpack_fields(buf)?,
        })
    }

    pub fn has_fields(&self, fields: &[FieldId]) -> bool {
        fields.iter().all(|f| self.fields.contains_key(f))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProlongationElementData {
    pub id: EntityId,
    pub measure: f64,
    pub fields: FieldValues,
}

impl ProlongationElementData {
    /// Measure-weighted average of several elements' values, over the fields
    /// all of them carry.
    pub fn average<'a, I: IntoIterator<Item = &'a ProlongationElementData>>(id: EntityId, items: I) -> Option<Self> {
        let items: Vec<&ProlongationElementData> = items.into_iter().collect();
        let first = items.first()?;
        let total: f64 = items.iter().map(|e| e.measure).sum();
        let mut fields = FieldValues::new();
        for (f, v) in &first.fields {
            if !items.iter().all(|e| e.fields.get(f).is_some_and(|w| w.len() == v.len())) {
                continue;
            }
            let mut acc = vec![0.0; v.len()];
            for e in &items {
                let w = if total > 0.0 { e.measure / total } else { 1.0 / items.len() as f64 };
                for (a, x) in acc.iter_mut().zip(&e.fields[f]) {
                    *a += w * x;
                }
            }
            fields.insert(*f, acc);
        }
        Some(Self {
            id,
            measure: total,
            fields,
        })
    }
}

/// An old interface side, referring to nodes of the store.
#[derive(Clone, Debug, PartialEq)]
pub struct ProlongationFacet {
    pub nodes: Vec<EntityId>,
    /// Fields carried by every node of the facet.
    pub common_fields: Vec<FieldId>,
    pub bbox: BoundingBox,
}

/// Outcome of a facet lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum FacetLookup {
    Found(FieldValues),
    /// Some rank holds facets with these fields, but none reached this rank.
    MissingRemote,
    /// No rank holds facets with these fields.
    Unavailable,
}

#[derive(Debug, Default)]
pub struct ProlongationStore {
    nodes: BTreeMap<EntityId, ProlongationNodeData>,
    remote_nodes: BTreeSet<EntityId>,
    elements: BTreeMap<EntityId, ProlongationElementData>,
    facets: Vec<ProlongationFacet>,
    local_facets: usize,
    trees: BTreeMap<Vec<FieldId>, SearchTree<usize>>,
    node_trees: BTreeMap<Vec<FieldId>, SearchTree<EntityId>>,
    global_keys: BTreeSet<Vec<FieldId>>,
}

impl ProlongationStore {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.elements.is_empty()
    }

    pub fn insert_node(&mut self, data: ProlongationNodeData) {
        self.nodes.insert(data.id, data);
    }

    pub fn insert_element(&mut self, data: ProlongationElementData) {
        self.elements.insert(data.id, data);
    }

    pub fn node(&self, id: EntityId) -> Option<&ProlongationNodeData> {
        self.nodes.get(&id)
    }

    pub fn element(&self, id: EntityId) -> Option<&ProlongationElementData> {
        self.elements.get(&id)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_facets(&self) -> usize {
        self.facets.len()
    }

    /// Stash a facet over already stashed nodes. Facets whose nodes share
    /// no field are dropped.
    pub fn add_facet(&mut self, nodes: Vec<EntityId>) {
        let data: Vec<&ProlongationNodeData> = nodes.iter().filter_map(|n| self.nodes.get(n)).collect();
        if data.len() != nodes.len() || data.is_empty() {
            return;
        }
        let common_fields: Vec<FieldId> = data[0]
            .fields
            .keys()
            .copied()
            .filter(|f| data.iter().all(|d| d.fields.contains_key(f)))
            .collect();
        if common_fields.is_empty() {
            return;
        }
        let coords: Vec<[f64; 3]> = data.iter().map(|d| d.coords).collect();
        let bbox = facet_bounding_box(&coords);
        debug_assert_eq!(self.local_facets, self.facets.len());
        self.facets.push(ProlongationFacet {
            nodes,
            common_fields,
            bbox,
        });
        self.local_facets = self.facets.len();
    }

    /// Send every local facet, with its nodes, to the ranks whose target box
    /// it overlaps. Collective.
    pub fn communicate_facets<C: Communicator>(&mut self, comm: &C, targets: &[BoundingBox]) -> Result<(), CdMeshError> {
        if comm.is_serial() {
            return Ok(());
        }
        let me = comm.rank();
        let received = {
            let mut sparse = CommSparse::new(comm);
            for facet in &self.facets[..self.local_facets] {
                for (p, target) in targets.iter().enumerate() {
                    if p == me || !facet.bbox.overlaps(target) {
                        continue;
                    }
                    let buf = sparse.send_buffer(p);
                    buf.pack_usize(facet.nodes.len());
                    for n in &facet.nodes {
                        if let Some(data) = self.nodes.get(n) {
                            data.pack(buf);
                        }
                    }
                }
            }
            sparse.communicate(FACET_TAG)?
        };
        for (_, mut buf) in received {
            while buf.remaining() {
                let n = buf.unpack_usize()?;
                let mut nodes = Vec::with_capacity(n);
                for _ in 0..n {
                    let data = ProlongationNodeData::unpack(&mut buf)?;
                    nodes.push(data.id);
                    if !self.nodes.contains_key(&data.id) {
                        self.remote_nodes.insert(data.id);
                        self.nodes.insert(data.id, data);
                    }
                }
                self.push_received_facet(nodes);
            }
        }
        Ok(())
    }

    fn push_received_facet(&mut self, nodes: Vec<EntityId>) {
        let data: Vec<&ProlongationNodeData> = nodes.iter().filter_map(|n| self.nodes.get(n)).collect();
        let Some(first) = data.first() else {
            return;
        };
        let common_fields: Vec<FieldId> = first
            .fields
            .keys()
            .copied()
            .filter(|f| data.iter().all(|d| d.fields.contains_key(f)))
            .collect();
        let coords: Vec<[f64; 3]> = data.iter().map(|d| d.coords).collect();
        let bbox = facet_bounding_box(&coords);
        self.facets.push(ProlongationFacet {
            nodes,
            common_fields,
            bbox,
        });
    }

    /// Forget facets and nodes received from other ranks.
    pub fn remove_communicated_facets(&mut self) {
        self.facets.truncate(self.local_facets);
        for id in std::mem::take(&mut self.remote_nodes) {
            self.nodes.remove(&id);
        }
        self.trees.clear();
        self.node_trees.clear();
    }

    /// One search tree per facet field set, with the field sets of every
    /// rank known, and one per node field set. Collective.
    pub fn build_trees<C: Communicator>(&mut self, comm: &C) -> Result<(), CdMeshError> {
        let mut grouped: BTreeMap<Vec<FieldId>, Vec<(BoundingBox, usize)>> = BTreeMap::new();
        for (i, f) in self.facets.iter().enumerate() {
            grouped.entry(f.common_fields.clone()).or_default().push((f.bbox, i));
        }
        let mut encoded: Vec<u32> = Vec::new();
        for key in grouped.keys() {
            encoded.push(key.len() as u32);
            encoded.extend(key.iter().map(|f| f.0));
        }
        self.global_keys.clear();
        for theirs in all_gather(comm, &encoded)? {
            let mut it = theirs.into_iter();
            while let Some(n) = it.next() {
                let key: Vec<FieldId> = it.by_ref().take(n as usize).map(FieldId).collect();
                self.global_keys.insert(key);
            }
        }
        let mut node_groups: BTreeMap<Vec<FieldId>, Vec<(BoundingBox, EntityId)>> = BTreeMap::new();
        for (&id, d) in &self.nodes {
            let key: Vec<FieldId> = d.fields.keys().copied().collect();
            node_groups.entry(key).or_default().push((BoundingBox::from_points([&d.coords]), id));
        }
        #[cfg(feature = "rayon")]
        let (trees, node_trees): (BTreeMap<_, _>, BTreeMap<_, _>) = {
            use rayon::prelude::*;
            rayon::join(
                || grouped.into_par_iter().map(|(k, items)| (k, SearchTree::new(items))).collect(),
                || node_groups.into_par_iter().map(|(k, items)| (k, SearchTree::new(items))).collect(),
            )
        };
        #[cfg(not(feature = "rayon"))]
        let (trees, node_trees): (BTreeMap<_, _>, BTreeMap<_, _>) = (
            grouped.into_iter().map(|(k, items)| (k, SearchTree::new(items))).collect(),
            node_groups.into_iter().map(|(k, items)| (k, SearchTree::new(items))).collect(),
        );
        self.trees = trees;
        self.node_trees = node_trees;
        Ok(())
    }

    /// Values interpolated at the closest point of the closest facet whose
    /// field set contains `fields`.
    pub fn find_facet_values(&self, fields: &[FieldId], x: &[f64; 3]) -> FacetLookup {
        let covers = |key: &[FieldId]| fields.iter().all(|f| key.contains(f));
        let mut best: Option<(f64, &ProlongationFacet, Vec<f64>)> = None;
        let mut searched = false;
        for (_, tree) in self.trees.iter().filter(|(k, t)| covers(k) && !t.is_empty()) {
            searched = true;
            for &&i in &tree.find_closest_entities(x) {
                let facet = &self.facets[i];
                let coords: Vec<[f64; 3]> =
                    facet.nodes.iter().filter_map(|n| self.nodes.get(n)).map(|d| d.coords).collect();
                if coords.len() != facet.nodes.len() {
                    continue;
                }
                let proj = closest_point(&coords, x);
                if best.as_ref().is_none_or(|b| proj.distance_squared < b.0) {
                    best = Some((proj.distance_squared, facet, proj.weights));
                }
            }
        }
        if !searched {
            return if self.global_keys.iter().any(|k| covers(k)) {
                FacetLookup::MissingRemote
            } else {
                FacetLookup::Unavailable
            };
        }
        let Some((_, facet, weights)) = best else {
            return FacetLookup::Unavailable;
        };
        let mut out = FieldValues::new();
        for &f in fields {
            let mut acc: Option<Vec<f64>> = None;
            for (n, &w) in facet.nodes.iter().zip(&weights) {
                let Some(v) = self.nodes.get(n).and_then(|d| d.fields.get(&f)) else {
                    continue;
                };
                let a = acc.get_or_insert_with(|| vec![0.0; v.len()]);
                for (ai, vi) in a.iter_mut().zip(v) {
                    *ai += w * vi;
                }
            }
            if let Some(a) = acc {
                out.insert(f, a);
            }
        }
        FacetLookup::Found(out)
    }

    /// Closest stashed node carrying every field of `fields`, lowest id on
    /// ties. Only nodes present at the last [`Self::build_trees`] are found.
    pub fn nearest_node(&self, fields: &[FieldId], x: &[f64; 3]) -> Option<&ProlongationNodeData> {
        let covers = |key: &[FieldId]| fields.iter().all(|f| key.contains(f));
        self.node_trees
            .iter()
            .filter(|(k, t)| covers(k) && !t.is_empty())
            .flat_map(|(_, tree)| tree.find_closest_entities(x))
            .filter_map(|id| self.nodes.get(id))
            .map(|d| (distance_squared(d.coords, *x), d))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id.cmp(&b.1.id)))
            .map(|(_, d)| d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn node(raw: u64, x: f64, t: f64) -> ProlongationNodeData {
        ProlongationNodeData {
            id: id(raw),
            coords: [x, 0.0, 0.0],
            fields: FieldValues::from([(FieldId(3), vec![t])]),
        }
    }

    #[test]
    fn facet_interpolation() {
        let mut store = ProlongationStore::default();
        store.insert_node(node(1, 0.0, 10.0));
        store.insert_node(node(2, 2.0, 20.0));
        store.add_facet(vec![id(1), id(2)]);
        store.build_trees(&NoComm).unwrap();
        match store.find_facet_values(&[FieldId(3)], &[0.5, 1.0, 0.0]) {
            FacetLookup::Found(v) => assert!((v[&FieldId(3)][0] - 12.5).abs() < 1e-12),
            other => panic!("unexpected lookup {other:?}"),
        }
        assert_eq!(store.find_facet_values(&[FieldId(4)], &[0.0; 3]), FacetLookup::Unavailable);
    }

    #[test]
    fn nearest_node_requires_fields() {
        let mut store = ProlongationStore::default();
        store.insert_node(node(1, 0.0, 1.0));
        store.insert_node(ProlongationNodeData {
            id: id(2),
            coords: [0.1, 0.0, 0.0],
            fields: FieldValues::new(),
        });
        assert_eq!(store.nearest_node(&[FieldId(3)], &[0.2, 0.0, 0.0]), None);
        store.build_trees(&NoComm).unwrap();
        assert_eq!(store.nearest_node(&[FieldId(3)], &[0.2, 0.0, 0.0]).map(|d| d.id), Some(id(1)));
        assert_eq!(store.nearest_node(&[], &[0.2, 0.0, 0.0]).map(|d| d.id), Some(id(2)));
    }

    #[test]
    fn element_average_is_measure_weighted() {
        let a = ProlongationElementData {
            id: id(1),
            measure: 1.0,
            fields: FieldValues::from([(FieldId(5), vec![1.0])]),
        };
        let b = ProlongationElementData {
            id: id(2),
            measure: 3.0,
            fields: FieldValues::from([(FieldId(5), vec![5.0])]),
        };
        let avg = ProlongationElementData::average(id(9), [&a, &b]).unwrap();
        assert!((avg.fields[&FieldId(5)][0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn nearest_node_matches_a_full_scan() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(11);
        let mut store = ProlongationStore::default();
        for raw in 1..=200 {
            let coords = [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
            let mut fields = FieldValues::from([(FieldId(3), vec![raw as f64])]);
            if raw % 3 == 0 {
                fields.insert(FieldId(4), vec![0.0]);
            }
            store.insert_node(ProlongationNodeData { id: id(raw), coords, fields });
        }
        store.build_trees(&NoComm).unwrap();

        for _ in 0..50 {
            let x = [rng.gen_range(-1.5..1.5), rng.gen_range(-1.5..1.5), rng.gen_range(-1.5..1.5)];
            for fields in [vec![FieldId(3)], vec![FieldId(3), FieldId(4)]] {
                let want = store
                    .nodes
                    .values()
                    .filter(|d| d.has_fields(&fields))
                    .min_by(|a, b| distance_squared(a.coords, x).total_cmp(&distance_squared(b.coords, x)))
                    .map(|d| d.id);
                assert_eq!(store.nearest_node(&fields, &x).map(|d| d.id), want);
            }
        }
    }
}
