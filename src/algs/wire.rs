//! Fixed, versioned, little-endian wire types for the exchange paths.

use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

/// Byte count of the message that follows in the payload pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// One link of a flattened (pre-order) child node ancestry.
///
/// A mesh node is encoded by its non-zero entity id and no parents. A child
/// node is encoded by `id == 0` and its parent count, followed by the links of
/// each parent in order. `weight_bits` holds the `f64` bit pattern of the
/// node's weight in its parent's stencil (1.0 for the root).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireAncestryLink {
    pub id_le: u64,
    pub nparents_le: u32,
    pub _pad: u32,
    pub weight_bits_le: u64,
}

impl WireAncestryLink {
    pub fn mesh_node(id: u64, weight: f64) -> Self {
        Self {
            id_le: id.to_le(),
            nparents_le: 0,
            _pad: 0,
            weight_bits_le: weight.to_bits().to_le(),
        }
    }
    pub fn child(nparents: usize, weight: f64) -> Self {
        Self {
            id_le: 0,
            nparents_le: (nparents as u32).to_le(),
            _pad: 0,
            weight_bits_le: weight.to_bits().to_le(),
        }
    }
    pub fn id(&self) -> u64 {
        u64::from_le(self.id_le)
    }
    pub fn nparents(&self) -> usize {
        u32::from_le(self.nparents_le) as usize
    }
    pub fn weight(&self) -> f64 {
        f64::from_bits(u64::from_le(self.weight_bits_le))
    }
}

// ===== Compile-time sanity checks =========================================

const _: () = {
    assert!(size_of::<WireHdr>() == 8);
    assert!(size_of::<WireCount>() == 4);
    assert!(size_of::<WireAncestryLink>() == 24);
    assert!(align_of::<WireAncestryLink>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_link_bits() {
        let v = [WireAncestryLink::child(2, 1.0), WireAncestryLink::mesh_node(17, 0.3)];
        let bytes = cast_slice(&v).to_vec();
        let mut out = [WireAncestryLink::zeroed(); 2];
        cast_slice_mut(&mut out).copy_from_slice(&bytes);
        assert_eq!(out[0].id(), 0);
        assert_eq!(out[0].nparents(), 2);
        assert_eq!(out[1].id(), 17);
        assert_eq!(out[1].weight(), 0.3);
    }

    #[test]
    fn version_guard() {
        let hdr = WireHdr::new(3);
        assert_eq!(hdr.version(), WIRE_VERSION);
        assert_eq!(hdr.kind(), 3);
    }
}
