//! Fixed, little-endian control records exchanged by channels and streams.
//!
//! Payload bytes travel as-is; only the small headers that frame them are
//! defined here. Every record is `Pod` so it can be sent through a
//! [`Buffer`](crate::data::buffer::Buffer) of `u8` without copying.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Length prefix of one channel frame. `len == 0` marks end of stream.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FrameLen {
    pub len_le: u64,
}

impl FrameLen {
    pub fn new(len: usize) -> Self {
        Self {
            len_le: (len as u64).to_le(),
        }
    }
    pub fn end() -> Self {
        Self::new(0)
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.len_le) as usize
    }
    pub fn is_end(&self) -> bool {
        self.get() == 0
    }
}

/// Broadcast once when a collective stream opens, before any data.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct OpenStatus {
    pub version_le: u16,
    pub ok_le: u16,
    pub reserved_le: u32,
}

impl OpenStatus {
    pub fn new(ok: bool) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            ok_le: (ok as u16).to_le(),
            reserved_le: 0,
        }
    }
    pub fn ok(&self) -> bool {
        u16::from_le(self.ok_le) != 0
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

/// Header of one broadcast stream chunk.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ChunkHeader {
    pub len_le: u64,
    pub flags_le: u32,
    pub _pad: u32,
}

impl ChunkHeader {
    /// The source is exhausted after this chunk.
    pub const EOF: u32 = 0x1;
    /// The root failed to read; no payload follows.
    pub const ERROR: u32 = 0x2;

    pub fn data(len: usize, eof: bool) -> Self {
        let flags = if eof { Self::EOF } else { 0 };
        Self {
            len_le: (len as u64).to_le(),
            flags_le: flags.to_le(),
            _pad: 0,
        }
    }
    pub fn error() -> Self {
        Self {
            len_le: 0,
            flags_le: Self::ERROR.to_le(),
            _pad: 0,
        }
    }
    pub fn len(&self) -> usize {
        u64::from_le(self.len_le) as usize
    }
    pub fn is_eof(&self) -> bool {
        u32::from_le(self.flags_le) & Self::EOF != 0
    }
    pub fn is_error(&self) -> bool {
        u32::from_le(self.flags_le) & Self::ERROR != 0
    }
}

const_assert_eq!(size_of::<FrameLen>(), 8);
const_assert_eq!(size_of::<OpenStatus>(), 8);
const_assert_eq!(size_of::<ChunkHeader>(), 16);
const_assert_eq!(align_of::<ChunkHeader>(), 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_header_flags() {
        let h = ChunkHeader::data(42, true);
        let bytes = cast_slice(std::slice::from_ref(&h)).to_vec();
        let mut out = [ChunkHeader::zeroed()];
        cast_slice_mut(&mut out).copy_from_slice(&bytes);
        assert_eq!(out[0].len(), 42);
        assert!(out[0].is_eof());
        assert!(!out[0].is_error());
        assert!(ChunkHeader::error().is_error());
    }

    #[test]
    fn frame_end_marker() {
        assert!(FrameLen::end().is_end());
        assert_eq!(FrameLen::new(9).get(), 9);
    }

    #[test]
    fn version_guard() {
        let st = OpenStatus::new(true);
        assert_eq!(st.version(), WIRE_VERSION);
        assert!(st.ok());
        assert!(!OpenStatus::new(false).ok());
    }
}
