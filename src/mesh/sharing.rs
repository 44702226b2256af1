//! Shared entity creation.
//!
//! Entities created independently on several ranks (edge nodes on a cut edge
//! of the partition boundary, sides spanning shared nodes) must end up with
//! the same id everywhere. Each request carries a canonical key and the ranks
//! that could possibly hold the same key. Ranks first announce their keys to
//! those candidates, which fixes the true sharing set; the lowest rank of
//! that set then draws the id from the collective pool and ships it to the
//! others.

use crate::algs::comm_sparse::{CommBuffer, CommSparse};
use crate::algs::communicator::CommTag;
use crate::mesh::MeshBulk;
use crate::mesh_error::CdMeshError;
use crate::topology::point::{EntityId, EntityRank};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const ANNOUNCE_TAG: CommTag = CommTag::new(0x0d00);
const ASSIGN_TAG: CommTag = CommTag::new(0x0d10);

/// One entity this rank wants to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedKeyRequest {
    /// Canonical key, identical on every rank that creates the entity.
    pub key: Vec<u64>,
    /// Ranks that may hold the same key (the local rank is ignored).
    pub candidates: Vec<usize>,
}

impl SharedKeyRequest {
    pub fn local(key: Vec<u64>) -> Self {
        Self {
            key,
            candidates: Vec::new(),
        }
    }
}

/// Outcome of [`assign_shared_ids`] for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub id: EntityId,
    /// Other ranks that created the same key.
    pub sharers: Vec<usize>,
}

fn pack_key(buf: &mut CommBuffer, key: &[u64]) {
    buf.pack_usize(key.len());
    for &k in key {
        buf.pack_u64(k);
    }
}

fn unpack_key(buf: &mut CommBuffer) -> Result<Vec<u64>, CdMeshError> {
    let n = buf.unpack_usize()?;
    (0..n).map(|_| buf.unpack_u64()).collect()
}

/// Resolve ids and sharing for `requests`. Collective over the mesh
/// communicator, even with no requests.
pub fn assign_shared_ids<M: MeshBulk>(
    mesh: &mut M,
    rank: EntityRank,
    requests: &[SharedKeyRequest],
) -> Result<Vec<ResolvedEntity>, CdMeshError> {
    let me = mesh.parallel_rank();

    let holders = {
        let mut sparse = CommSparse::new(mesh.comm());
        for req in requests {
            for &p in req.candidates.iter().filter(|&&p| p != me) {
                pack_key(sparse.send_buffer(p), &req.key);
            }
        }
        let mut holders: HashMap<Vec<u64>, BTreeSet<usize>> = HashMap::new();
        for (src, mut buf) in sparse.communicate(ANNOUNCE_TAG)? {
            while buf.remaining() {
                holders.entry(unpack_key(&mut buf)?).or_default().insert(src);
            }
        }
        holders
    };

    let sharers: Vec<Vec<usize>> = requests
        .iter()
        .map(|req| {
            let held = holders.get(&req.key);
            let mut procs: Vec<usize> = req
                .candidates
                .iter()
                .copied()
                .filter(|&p| p != me && held.is_some_and(|h| h.contains(&p)))
                .collect();
            procs.sort_unstable();
            procs.dedup();
            procs
        })
        .collect();

    let owned: Vec<usize> = (0..requests.len())
        .filter(|&i| sharers[i].first().is_none_or(|&lowest| lowest > me))
        .collect();
    let fresh = mesh.generate_new_ids(rank, owned.len())?;

    let mut ids: Vec<Option<EntityId>> = vec![None; requests.len()];
    let received = {
        let mut sparse = CommSparse::new(mesh.comm());
        for (&i, &id) in owned.iter().zip(&fresh) {
            ids[i] = Some(id);
            for &p in &sharers[i] {
                let buf = sparse.send_buffer(p);
                pack_key(buf, &requests[i].key);
                buf.pack_u64(id.get());
            }
        }
        let mut received: HashMap<Vec<u64>, BTreeMap<usize, EntityId>> = HashMap::new();
        for (src, mut buf) in sparse.communicate(ASSIGN_TAG)? {
            while buf.remaining() {
                let key = unpack_key(&mut buf)?;
                let id = EntityId::new(buf.unpack_u64()?)?;
                received.entry(key).or_default().insert(src, id);
            }
        }
        received
    };

    // The id from the lowest sender wins, even over one drawn locally.
    for (i, req) in requests.iter().enumerate() {
        if let Some((&src, &id)) = received.get(&req.key).and_then(|m| m.iter().next()) {
            if src < me || ids[i].is_none() {
                ids[i] = Some(id);
            }
        }
    }

    ids.into_iter()
        .zip(sharers)
        .zip(requests)
        .map(|((id, sharers), req)| match id {
            Some(id) => Ok(ResolvedEntity { id, sharers }),
            None => Err(CdMeshError::MalformedMessage {
                neighbor: sharers.first().copied().unwrap_or(me),
                reason: format!("no id received for shared key {:?}", req.key),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    use crate::mesh::{BulkData, MetaData};

    #[test]
    fn serial_requests_are_all_local() {
        let mut mesh = BulkData::new(MetaData::new(2), NoComm);
        let reqs = vec![
            SharedKeyRequest::local(vec![1, 2]),
            SharedKeyRequest {
                key: vec![3, 4],
                candidates: vec![1],
            },
        ];
        let out = assign_shared_ids(&mut mesh, EntityRank::Node, &reqs).unwrap();
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].id, out[1].id);
        assert!(out.iter().all(|r| r.sharers.is_empty()));
    }

    #[test]
    fn two_ranks_agree_on_shared_key() {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let me = comm.rank();
                    let other = 1 - me;
                    let mut mesh = BulkData::new(MetaData::new(2), comm);
                    let reqs = vec![
                        SharedKeyRequest {
                            key: vec![10, 20],
                            candidates: vec![other],
                        },
                        // Each rank holds a key the other does not.
                        SharedKeyRequest {
                            key: vec![30 + me as u64],
                            candidates: vec![other],
                        },
                    ];
                    assign_shared_ids(&mut mesh, EntityRank::Node, &reqs).unwrap()
                })
            })
            .collect();
        let out: Vec<Vec<ResolvedEntity>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(out[0][0].id, out[1][0].id);
        assert_eq!(out[0][0].sharers, vec![1]);
        assert_eq!(out[1][0].sharers, vec![0]);
        assert!(out[0][1].sharers.is_empty());
        assert!(out[1][1].sharers.is_empty());
        assert_ne!(out[0][1].id, out[1][1].id);
    }
}
