//! Two-phase sparse point-to-point exchange.
//!
//! Every rank packs one [`CommBuffer`] per destination, then
//! [`CommSparse::communicate`] runs
//! 1. a size pass: every rank tells every other rank how many bytes it will
//!    send (zero for most pairs), and
//! 2. a payload pass: only non-empty messages are posted and received.
//!
//! Both passes drain every posted send and receive handle before returning,
//! even if an error is detected part way through.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WIRE_VERSION, WireCount, WireHdr, cast_slice, cast_slice_mut};
use crate::mesh_error::CdMeshError;
use bytemuck::{Pod, Zeroable};
use std::collections::{BTreeMap, HashMap};

/// Growable byte buffer with little-endian pack/unpack helpers.
#[derive(Clone, Debug, Default)]
pub struct CommBuffer {
    data: Vec<u8>,
    cursor: usize,
    source: usize,
}

impl CommBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap bytes received from `source` for unpacking.
    pub fn from_bytes(source: usize, data: Vec<u8>) -> Self {
        Self {
            data,
            cursor: 0,
            source,
        }
    }

    pub fn source(&self) -> usize {
        self.source
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Whether unread bytes remain.
    pub fn remaining(&self) -> bool {
        self.cursor < self.data.len()
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn pack_bool(&mut self, v: bool) {
        self.data.push(v as u8);
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn pack_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn pack_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn pack_f64(&mut self, v: f64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn pack_usize(&mut self, v: usize) {
        self.pack_u64(v as u64);
    }

    pub fn pack_f64_slice(&mut self, v: &[f64]) {
        self.pack_usize(v.len());
        for &x in v {
            self.pack_f64(x);
        }
    }

    /// Append fixed-layout wire records (already little-endian encoded).
    pub fn pack_records<T: Pod>(&mut self, records: &[T]) {
        self.pack_usize(records.len());
        self.data.extend_from_slice(cast_slice(records));
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CdMeshError> {
        if self.cursor + n > self.data.len() {
            return Err(CdMeshError::MalformedMessage {
                neighbor: self.source,
                reason: format!(
                    "buffer underflow: need {n} bytes at offset {}, have {}",
                    self.cursor,
                    self.data.len()
                ),
            });
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.data[start..start + n])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CdMeshError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, CdMeshError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn unpack_bool(&mut self) -> Result<bool, CdMeshError> {
        Ok(self.unpack_u8()? != 0)
    }

    pub fn unpack_u32(&mut self) -> Result<u32, CdMeshError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, CdMeshError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn unpack_i32(&mut self) -> Result<i32, CdMeshError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn unpack_f64(&mut self) -> Result<f64, CdMeshError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn unpack_usize(&mut self) -> Result<usize, CdMeshError> {
        Ok(self.unpack_u64()? as usize)
    }

    pub fn unpack_f64_vec(&mut self) -> Result<Vec<f64>, CdMeshError> {
        let n = self.unpack_usize()?;
        (0..n).map(|_| self.unpack_f64()).collect()
    }

    pub fn unpack_records<T: Pod>(&mut self) -> Result<Vec<T>, CdMeshError> {
        let n = self.unpack_usize()?;
        let bytes = self.take(n * std::mem::size_of::<T>())?;
        let mut out = vec![T::zeroed(); n];
        cast_slice_mut(&mut out).copy_from_slice(bytes);
        Ok(out)
    }
}

/// Sparse all-to-all exchange of per-destination buffers.
pub struct CommSparse<'a, C: Communicator> {
    comm: &'a C,
    send: BTreeMap<usize, CommBuffer>,
}

impl<'a, C: Communicator> CommSparse<'a, C> {
    pub fn new(comm: &'a C) -> Self {
        Self {
            comm,
            send: BTreeMap::new(),
        }
    }

    pub fn comm(&self) -> &'a C {
        self.comm
    }

    /// Buffer of messages destined for `proc`. Sending to the local rank is
    /// allowed and bypasses the communicator.
    pub fn send_buffer(&mut self, proc: usize) -> &mut CommBuffer {
        self.send.entry(proc).or_default()
    }

    /// Exchange all packed buffers. Returns the non-empty buffers received,
    /// keyed by source rank, in ascending rank order.
    pub fn communicate(mut self, tag: CommTag) -> Result<BTreeMap<usize, CommBuffer>, CdMeshError> {
        let me = self.comm.rank();
        let mut received = BTreeMap::new();
        if let Some(local) = self.send.remove(&me) {
            if !local.is_empty() {
                received.insert(me, CommBuffer::from_bytes(me, local.data));
            }
        }
        if self.comm.is_serial() {
            return Ok(received);
        }

        let peers: Vec<usize> = (0..self.comm.size()).filter(|&p| p != me).collect();
        let outgoing: BTreeMap<usize, Vec<u8>> = self
            .send
            .into_iter()
            .filter(|(p, b)| !b.is_empty() && *p != me)
            .map(|(p, b)| {
                let mut framed = Vec::with_capacity(b.len() + std::mem::size_of::<WireHdr>());
                framed.extend_from_slice(cast_slice(std::slice::from_ref(&WireHdr::new(tag.as_u16()))));
                framed.extend_from_slice(&b.data);
                (p, framed)
            })
            .collect();

        let counts: HashMap<usize, usize> = outgoing.iter().map(|(&p, b)| (p, b.len())).collect();
        let sizes = exchange_sizes_symmetric(&counts, self.comm, tag, &peers)?;
        let payloads = exchange_payloads(&outgoing, &sizes, self.comm, tag.offset(1))?;

        for (src, bytes) in payloads {
            let hdr_len = std::mem::size_of::<WireHdr>();
            if bytes.len() < hdr_len {
                return Err(CdMeshError::MalformedMessage {
                    neighbor: src,
                    reason: format!("message of {} bytes has no header", bytes.len()),
                });
            }
            let mut hdr = WireHdr::zeroed();
            cast_slice_mut(std::slice::from_mut(&mut hdr)).copy_from_slice(&bytes[..hdr_len]);
            if hdr.version() != WIRE_VERSION || hdr.kind() != tag.as_u16() {
                return Err(CdMeshError::MalformedMessage {
                    neighbor: src,
                    reason: format!(
                        "header version {} kind {:#x}, expected version {WIRE_VERSION} kind {:#x}",
                        hdr.version(),
                        hdr.kind(),
                        tag.as_u16()
                    ),
                });
            }
            received.insert(src, CommBuffer::from_bytes(src, bytes[hdr_len..].to_vec()));
        }
        Ok(received)
    }
}

/// Stage 1: tell every peer how many bytes to expect (zero included) and
/// learn the same from them. Returns `peer -> byte count` for every peer.
pub fn exchange_sizes_symmetric<C: Communicator>(
    counts: &HashMap<usize, usize>,
    comm: &C,
    tag: CommTag,
    peers: &[usize],
) -> Result<HashMap<usize, u32>, CdMeshError> {
    let mut recv_size: Vec<(usize, C::RecvHandle)> = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(nbr, tag.as_u16(), cast_slice_mut(std::slice::from_mut(&mut cnt)));
        recv_size.push((nbr, h));
    }

    let mut pending_sends = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let count = WireCount::new(counts.get(&nbr).copied().unwrap_or(0));
        pending_sends.push(comm.isend(nbr, tag.as_u16(), cast_slice(std::slice::from_ref(&count))));
    }

    let mut sizes_in = HashMap::new();
    let mut maybe_err = None;
    for (nbr, h) in recv_size {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                if maybe_err.is_none() {
                    let mut cnt = WireCount::new(0);
                    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                    sizes_in.insert(nbr, cnt.get() as u32);
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(CdMeshError::CommError {
                    neighbor: nbr,
                    source: format!(
                        "expected {} bytes for size header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    )
                    .into(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(CdMeshError::CommError {
                    neighbor: nbr,
                    source: format!("failed to receive size from rank {nbr}").into(),
                });
            }
            _ => {}
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(sizes_in),
    }
}

/// Stage 2: move the payloads whose sizes were agreed in stage 1.
pub fn exchange_payloads<C: Communicator>(
    outgoing: &BTreeMap<usize, Vec<u8>>,
    sizes: &HashMap<usize, u32>,
    comm: &C,
    tag: CommTag,
) -> Result<BTreeMap<usize, Vec<u8>>, CdMeshError> {
    let mut recvs: Vec<(usize, usize, C::RecvHandle)> = Vec::new();
    let mut sources: Vec<(usize, u32)> = sizes.iter().map(|(&p, &n)| (p, n)).filter(|&(_, n)| n > 0).collect();
    sources.sort_unstable();
    for (nbr, n) in sources {
        let mut buf = vec![0u8; n as usize];
        let h = comm.irecv(nbr, tag.as_u16(), &mut buf);
        recvs.push((nbr, n as usize, h));
    }

    let mut pending_sends = Vec::with_capacity(outgoing.len());
    for (&nbr, bytes) in outgoing {
        pending_sends.push(comm.isend(nbr, tag.as_u16(), bytes));
    }

    let mut out = BTreeMap::new();
    let mut maybe_err = None;
    for (nbr, expected, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == expected => {
                if maybe_err.is_none() {
                    out.insert(nbr, data);
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(CdMeshError::CommError {
                    neighbor: nbr,
                    source: format!("expected {expected} payload bytes, got {}", data.len()).into(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(CdMeshError::CommError {
                    neighbor: nbr,
                    source: format!("failed to receive payload from rank {nbr}").into(),
                });
            }
            _ => {}
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn pack_unpack_mixed() {
        let mut b = CommBuffer::new();
        b.pack_u64(7);
        b.pack_f64(-0.25);
        b.pack_i32(-1);
        b.pack_f64_slice(&[1.0, 2.0]);
        let mut r = CommBuffer::from_bytes(0, b.as_bytes().to_vec());
        assert_eq!(r.unpack_u64().unwrap(), 7);
        assert_eq!(r.unpack_f64().unwrap(), -0.25);
        assert_eq!(r.unpack_i32().unwrap(), -1);
        assert_eq!(r.unpack_f64_vec().unwrap(), vec![1.0, 2.0]);
        assert!(!r.remaining());
        assert!(matches!(r.unpack_u32(), Err(CdMeshError::MalformedMessage { .. })));
    }

    #[test]
    fn serial_self_send() {
        let comm = NoComm;
        let mut sparse = CommSparse::new(&comm);
        sparse.send_buffer(0).pack_u32(11);
        let recv = sparse.communicate(CommTag::new(0x20)).unwrap();
        let mut b = recv.get(&0).cloned().unwrap();
        assert_eq!(b.unpack_u32().unwrap(), 11);
    }

    #[test]
    fn three_rank_ring() {
        let world = RayonComm::world(3);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let me = comm.rank();
                    let mut sparse = CommSparse::new(&comm);
                    sparse.send_buffer((me + 1) % 3).pack_usize(me);
                    let recv = sparse.communicate(CommTag::new(0x30)).unwrap();
                    assert_eq!(recv.len(), 1);
                    let (&src, buf) = recv.iter().next().unwrap();
                    let mut buf = buf.clone();
                    assert_eq!(src, (me + 2) % 3);
                    assert_eq!(buf.unpack_usize().unwrap(), src);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
