//! Typed, non-owning views over contiguous memory.
//!
//! A [`Buffer`] (read-only) or [`BufferMut`] (writable) is the unit of data
//! moved by every send, receive and collective call. It never owns memory:
//! it is a byte slice plus an [`ElemType`] tag that fixes the element stride.
//! Views are built from typed slices of an [`Element`] type, so the caller's
//! memory always outlives the operation by construction.
//!
//! [`OwnedBuffer`] is the owning counterpart used by non-blocking operations,
//! whose payload must survive until the request completes.

use crate::data::opcode::Opcode;
use crate::mp_error::MpError;
use bytemuck::Pod;
use num_traits::{One, Zero};
use std::fmt;

/// Element type carried by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    U8,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElemType {
    /// Every supported element type.
    pub const ALL: [ElemType; 7] = [
        ElemType::U8,
        ElemType::I32,
        ElemType::U32,
        ElemType::I64,
        ElemType::U64,
        ElemType::F32,
        ElemType::F64,
    ];

    /// Size of one element in bytes (the buffer stride).
    pub const fn size(self) -> usize {
        match self {
            ElemType::U8 => 1,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
        }
    }

    pub const fn is_integer(self) -> bool {
        !matches!(self, ElemType::F32 | ElemType::F64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElemType::U8 => "u8",
            ElemType::I32 => "i32",
            ElemType::U32 => "u32",
            ElemType::I64 => "i64",
            ElemType::U64 => "u64",
            ElemType::F32 => "f32",
            ElemType::F64 => "f64",
        }
    }

    /// Number of whole elements in `len` bytes.
    pub fn elements_in(self, len: usize) -> Result<usize, MpError> {
        if len % self.size() == 0 {
            Ok(len / self.size())
        } else {
            Err(MpError::MisalignedBytes { len, elem: self })
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run `$body` with `$T` bound to the Rust type behind an [`ElemType`].
macro_rules! with_elem_type {
    ($elem:expr, |$T:ident| $body:expr) => {
        match $elem {
            $crate::data::buffer::ElemType::U8 => {
                type $T = u8;
                $body
            }
            $crate::data::buffer::ElemType::I32 => {
                type $T = i32;
                $body
            }
            $crate::data::buffer::ElemType::U32 => {
                type $T = u32;
                $body
            }
            $crate::data::buffer::ElemType::I64 => {
                type $T = i64;
                $body
            }
            $crate::data::buffer::ElemType::U64 => {
                type $T = u64;
                $body
            }
            $crate::data::buffer::ElemType::F32 => {
                type $T = f32;
                $body
            }
            $crate::data::buffer::ElemType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}
pub(crate) use with_elem_type;

mod sealed {
    pub trait Sealed {}
}

/// A plain-old-data type that can travel through a [`Context`](crate::context::Context).
///
/// Sealed: implemented for `u8, i32, u32, i64, u64, f32, f64`.
pub trait Element: Pod + Send + Sync + PartialOrd + fmt::Debug + sealed::Sealed {
    const TYPE: ElemType;

    /// Apply `op` to two elements, `None` if `op` is undefined for the type.
    #[doc(hidden)]
    fn combine(op: Opcode, a: Self, b: Self) -> Option<Self>;
}

fn logical<T: Zero + One>(flag: bool) -> T {
    if flag { T::one() } else { T::zero() }
}

macro_rules! int_element {
    ($($t:ty => $tag:ident),* $(,)?) => {$(
        impl sealed::Sealed for $t {}
        impl Element for $t {
            const TYPE: ElemType = ElemType::$tag;
            #[inline]
            fn combine(op: Opcode, a: Self, b: Self) -> Option<Self> {
                Some(match op {
                    Opcode::Sum => a.wrapping_add(b),
                    Opcode::Prod => a.wrapping_mul(b),
                    Opcode::Min => a.min(b),
                    Opcode::Max => a.max(b),
                    Opcode::Bor => a | b,
                    Opcode::Band => a & b,
                    Opcode::Lor => logical(!a.is_zero() || !b.is_zero()),
                    Opcode::Land => logical(!a.is_zero() && !b.is_zero()),
                })
            }
        }
    )*};
}

macro_rules! float_element {
    ($($t:ty => $tag:ident),* $(,)?) => {$(
        impl sealed::Sealed for $t {}
        impl Element for $t {
            const TYPE: ElemType = ElemType::$tag;
            #[inline]
            fn combine(op: Opcode, a: Self, b: Self) -> Option<Self> {
                match op {
                    Opcode::Sum => Some(a + b),
                    Opcode::Prod => Some(a * b),
                    Opcode::Min => Some(a.min(b)),
                    Opcode::Max => Some(a.max(b)),
                    Opcode::Bor | Opcode::Band | Opcode::Lor | Opcode::Land => None,
                }
            }
        }
    )*};
}

int_element!(u8 => U8, i32 => I32, u32 => U32, i64 => I64, u64 => U64);
float_element!(f32 => F32, f64 => F64);

/// Read-only typed view.
#[derive(Clone, Copy)]
pub struct Buffer<'a> {
    bytes: &'a [u8],
    elem: ElemType,
}

impl<'a> Buffer<'a> {
    pub fn from_slice<T: Element>(data: &'a [T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice(data),
            elem: T::TYPE,
        }
    }

    /// View raw bytes as elements of `elem`.
    ///
    /// # Errors
    /// `MisalignedBytes` if `bytes.len()` is not a multiple of the element size.
    pub fn from_bytes(bytes: &'a [u8], elem: ElemType) -> Result<Self, MpError> {
        elem.elements_in(bytes.len())?;
        Ok(Self { bytes, elem })
    }

    pub fn empty(elem: ElemType) -> Self {
        Self { bytes: &[], elem }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.elem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn elem_type(&self) -> ElemType {
        self.elem
    }

    pub fn elem_size(&self) -> usize {
        self.elem.size()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Copy the elements out as `T`, checking the element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, MpError> {
        decode(self.bytes, self.elem)
    }

    pub fn to_owned_buffer(&self) -> OwnedBuffer {
        OwnedBuffer {
            bytes: self.bytes.to_vec(),
            elem: self.elem,
        }
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("elem", &self.elem)
            .field("len", &self.len())
            .finish()
    }
}

impl<'a, T: Element> From<&'a [T]> for Buffer<'a> {
    fn from(data: &'a [T]) -> Self {
        Buffer::from_slice(data)
    }
}

/// Writable typed view.
pub struct BufferMut<'a> {
    bytes: &'a mut [u8],
    elem: ElemType,
}

impl<'a> BufferMut<'a> {
    pub fn from_slice<T: Element>(data: &'a mut [T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice_mut(data),
            elem: T::TYPE,
        }
    }

    pub fn from_bytes(bytes: &'a mut [u8], elem: ElemType) -> Result<Self, MpError> {
        elem.elements_in(bytes.len())?;
        Ok(Self { bytes, elem })
    }

    pub fn empty(elem: ElemType) -> Self {
        Self {
            bytes: &mut [],
            elem,
        }
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.elem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn elem_type(&self) -> ElemType {
        self.elem
    }

    pub fn elem_size(&self) -> usize {
        self.elem.size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    pub fn as_buffer(&self) -> Buffer<'_> {
        Buffer {
            bytes: self.bytes,
            elem: self.elem,
        }
    }

    /// Shorter-lived view of the same memory.
    pub fn reborrow(&mut self) -> BufferMut<'_> {
        BufferMut {
            bytes: self.bytes,
            elem: self.elem,
        }
    }

    /// Copy a message of `elem` elements into the front of this buffer and
    /// return the element count written.
    ///
    /// # Errors
    /// `TypeMismatch` on differing element types, `Truncated` if the message
    /// is longer than the buffer (`from` names the sending rank).
    pub(crate) fn fill(
        &mut self,
        bytes: &[u8],
        elem: ElemType,
        from: usize,
    ) -> Result<usize, MpError> {
        if elem != self.elem {
            return Err(MpError::TypeMismatch {
                expected: self.elem,
                actual: elem,
            });
        }
        let sent = elem.elements_in(bytes.len())?;
        if bytes.len() > self.bytes.len() {
            return Err(MpError::Truncated {
                from,
                sent,
                capacity: self.len(),
            });
        }
        self.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(sent)
    }

    /// Overwrite the whole buffer with `src`, which must match exactly.
    pub fn copy_from(&mut self, src: Buffer<'_>) -> Result<(), MpError> {
        if src.elem != self.elem {
            return Err(MpError::TypeMismatch {
                expected: self.elem,
                actual: src.elem,
            });
        }
        if src.bytes.len() != self.bytes.len() {
            return Err(MpError::LengthMismatch {
                what: "buffer copy",
                expected: self.len(),
                actual: src.len(),
            });
        }
        self.bytes.copy_from_slice(src.bytes);
        Ok(())
    }
}

impl fmt::Debug for BufferMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMut")
            .field("elem", &self.elem)
            .field("len", &self.len())
            .finish()
    }
}

impl<'a, T: Element> From<&'a mut [T]> for BufferMut<'a> {
    fn from(data: &'a mut [T]) -> Self {
        BufferMut::from_slice(data)
    }
}

/// Owned payload of a non-blocking operation.
#[derive(Clone, PartialEq, Eq)]
pub struct OwnedBuffer {
    bytes: Vec<u8>,
    elem: ElemType,
}

impl OwnedBuffer {
    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        Self {
            bytes: bytemuck::cast_slice(&data).to_vec(),
            elem: T::TYPE,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, elem: ElemType) -> Result<Self, MpError> {
        elem.elements_in(bytes.len())?;
        Ok(Self { bytes, elem })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.elem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn elem_type(&self) -> ElemType {
        self.elem
    }

    pub fn as_buffer(&self) -> Buffer<'_> {
        Buffer {
            bytes: &self.bytes,
            elem: self.elem,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, MpError> {
        decode(&self.bytes, self.elem)
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("elem", &self.elem)
            .field("len", &self.len())
            .finish()
    }
}

/// Decode possibly unaligned bytes into a typed vector.
fn decode<T: Element>(bytes: &[u8], elem: ElemType) -> Result<Vec<T>, MpError> {
    if elem != T::TYPE {
        return Err(MpError::TypeMismatch {
            expected: T::TYPE,
            actual: elem,
        });
    }
    Ok(bytes
        .chunks_exact(elem.size())
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect())
}
