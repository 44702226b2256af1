//! Global reductions built on the sparse exchange.
//!
//! Every rank must call the same collectives in the same order. The
//! implementation gathers each rank's contribution on every rank and reduces
//! locally in rank order, so all ranks obtain bitwise identical results.

use crate::algs::comm_sparse::CommSparse;
use crate::algs::communicator::{CommTag, Communicator};
use crate::mesh_error::CdMeshError;
use bytemuck::Pod;
use num_traits::Num;

const COLLECTIVE_TAG: CommTag = CommTag::new(0x0c00);

/// Gather every rank's `local` slice on every rank, indexed by rank.
pub fn all_gather<C: Communicator, T: Pod>(comm: &C, local: &[T]) -> Result<Vec<Vec<T>>, CdMeshError> {
    let size = comm.size();
    let mut sparse = CommSparse::new(comm);
    for p in 0..size {
        let buf = sparse.send_buffer(p);
        buf.pack_u8(1);
        buf.pack_records(local);
    }
    let mut received = sparse.communicate(COLLECTIVE_TAG)?;
    let mut out = Vec::with_capacity(size);
    for p in 0..size {
        let vals = match received.get_mut(&p) {
            Some(buf) => {
                buf.unpack_u8()?;
                buf.unpack_records::<T>()?
            }
            None => {
                return Err(CdMeshError::CommError {
                    neighbor: p,
                    source: "missing contribution to all_gather".into(),
                });
            }
        };
        out.push(vals);
    }
    Ok(out)
}

/// Element-wise global sum.
pub fn global_sum<C: Communicator, T: Pod + Num>(comm: &C, local: &[T]) -> Result<Vec<T>, CdMeshError> {
    reduce(comm, local, |a, b| a + b)
}

/// Element-wise global maximum.
pub fn global_max<C: Communicator, T: Pod + PartialOrd>(comm: &C, local: &[T]) -> Result<Vec<T>, CdMeshError> {
    reduce(comm, local, |a, b| if b > a { b } else { a })
}

/// Element-wise global minimum.
pub fn global_min<C: Communicator, T: Pod + PartialOrd>(comm: &C, local: &[T]) -> Result<Vec<T>, CdMeshError> {
    reduce(comm, local, |a, b| if b < a { b } else { a })
}

pub fn global_sum_scalar<C: Communicator, T: Pod + Num>(comm: &C, local: T) -> Result<T, CdMeshError> {
    Ok(global_sum(comm, &[local])?[0])
}

pub fn global_max_scalar<C: Communicator, T: Pod + PartialOrd>(comm: &C, local: T) -> Result<T, CdMeshError> {
    Ok(global_max(comm, &[local])?[0])
}

pub fn is_true_on_any<C: Communicator>(comm: &C, local: bool) -> Result<bool, CdMeshError> {
    Ok(global_max_scalar(comm, local as u8)? != 0)
}

pub fn is_true_on_all<C: Communicator>(comm: &C, local: bool) -> Result<bool, CdMeshError> {
    Ok(global_min(comm, &[local as u8])?[0] != 0)
}

fn reduce<C, T, F>(comm: &C, local: &[T], op: F) -> Result<Vec<T>, CdMeshError>
where
    C: Communicator,
    T: Pod,
    F: Fn(T, T) -> T,
{
    if comm.is_serial() {
        return Ok(local.to_vec());
    }
    let gathered = all_gather(comm, local)?;
    let mut acc: Option<Vec<T>> = None;
    for (rank, vals) in gathered.into_iter().enumerate() {
        if vals.len() != local.len() {
            return Err(CdMeshError::MalformedMessage {
                neighbor: rank,
                reason: format!("reduction of {} values, got {}", local.len(), vals.len()),
            });
        }
        acc = Some(match acc {
            None => vals,
            Some(a) => a.into_iter().zip(vals).map(|(x, y)| op(x, y)).collect(),
        });
    }
    Ok(acc.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_reductions_are_identity() {
        assert_eq!(global_sum(&NoComm, &[1.5f64, 2.0]).unwrap(), vec![1.5, 2.0]);
        assert!(is_true_on_any(&NoComm, true).unwrap());
        assert!(!is_true_on_all(&NoComm, false).unwrap());
    }

    #[test]
    fn four_rank_reductions() {
        let handles: Vec<_> = RayonComm::world(4)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let r = comm.rank();
                    let sum = global_sum_scalar(&comm, r as u64).unwrap();
                    let max = global_max_scalar(&comm, r as f64 * 0.5).unwrap();
                    let any = is_true_on_any(&comm, r == 2).unwrap();
                    let all = is_true_on_all(&comm, r != 2).unwrap();
                    let gathered = all_gather(&comm, &vec![r as u32; r]).unwrap();
                    (sum, max, any, all, gathered.iter().map(Vec::len).collect::<Vec<_>>())
                })
            })
            .collect();
        for h in handles {
            let (sum, max, any, all, lens) = h.join().unwrap();
            assert_eq!(sum, 6);
            assert_eq!(max, 1.5);
            assert!(any);
            assert!(!all);
            assert_eq!(lens, vec![0, 1, 2, 3]);
        }
    }
}
