//! Reduction operators for `reduce` / `all_reduce`.

use crate::data::buffer::{ElemType, Element, with_elem_type};
use crate::mp_error::MpError;
use std::fmt;

/// Elementwise reduction operator.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Sum = 0,
    Prod = 1,
    Min = 2,
    Max = 3,
    /// Bitwise or (integers only).
    Bor = 4,
    /// Bitwise and (integers only).
    Band = 5,
    /// Logical or (integers only, result is 0 or 1).
    Lor = 6,
    /// Logical and (integers only, result is 0 or 1).
    Land = 7,
}

impl Opcode {
    pub const ALL: [Opcode; 8] = [
        Opcode::Sum,
        Opcode::Prod,
        Opcode::Min,
        Opcode::Max,
        Opcode::Bor,
        Opcode::Band,
        Opcode::Lor,
        Opcode::Land,
    ];

    /// Whether the operator is defined for `elem`.
    pub fn supports(self, elem: ElemType) -> bool {
        match self {
            Opcode::Sum | Opcode::Prod | Opcode::Min | Opcode::Max => true,
            Opcode::Bor | Opcode::Band | Opcode::Lor | Opcode::Land => elem.is_integer(),
        }
    }

    pub(crate) fn check(self, elem: ElemType) -> Result<(), MpError> {
        if self.supports(elem) {
            Ok(())
        } else {
            Err(MpError::OpcodeNotSupported { op: self, elem })
        }
    }

    /// Combine two values.
    ///
    /// ```
    /// use mp_runtime::data::opcode::Opcode;
    /// assert_eq!(Opcode::Max.apply(3i64, 9).unwrap(), 9);
    /// assert_eq!(Opcode::Land.apply(5u32, 0).unwrap(), 0);
    /// assert!(Opcode::Bor.apply(1.0f64, 2.0).is_err());
    /// ```
    pub fn apply<T: Element>(self, a: T, b: T) -> Result<T, MpError> {
        T::combine(self, a, b).ok_or(MpError::OpcodeNotSupported {
            op: self,
            elem: T::TYPE,
        })
    }

    /// Left fold over `values`; `None` for an empty slice.
    pub fn fold<T: Element>(self, values: &[T]) -> Result<Option<T>, MpError> {
        let mut it = values.iter().copied();
        let Some(first) = it.next() else {
            return Ok(None);
        };
        it.try_fold(first, |acc, v| self.apply(acc, v)).map(Some)
    }

    /// `acc[i] = acc[i] op other[i]` over raw element bytes.
    pub(crate) fn fold_bytes(
        self,
        elem: ElemType,
        acc: &mut [u8],
        other: &[u8],
    ) -> Result<(), MpError> {
        debug_assert_eq!(acc.len(), other.len());
        with_elem_type!(elem, |T| fold_typed::<T>(self, acc, other))
    }
}

fn fold_typed<T: Element>(op: Opcode, acc: &mut [u8], other: &[u8]) -> Result<(), MpError> {
    let sz = std::mem::size_of::<T>();
    for (a, b) in acc.chunks_exact_mut(sz).zip(other.chunks_exact(sz)) {
        let x: T = bytemuck::pod_read_unaligned(a);
        let y: T = bytemuck::pod_read_unaligned(b);
        let z = op.apply(x, y)?;
        a.copy_from_slice(bytemuck::bytes_of(&z));
    }
    Ok(())
}

impl TryFrom<u8> for Opcode {
    type Error = MpError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .get(raw as usize)
            .copied()
            .ok_or(MpError::UnknownOpcode(raw))
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

/// Diagnostic name of an opcode.
pub fn opcode_name(op: Opcode) -> &'static str {
    match op {
        Opcode::Sum => "SUM",
        Opcode::Prod => "PROD",
        Opcode::Min => "MIN",
        Opcode::Max => "MAX",
        Opcode::Bor => "BOR",
        Opcode::Band => "BAND",
        Opcode::Lor => "LOR",
        Opcode::Land => "LAND",
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(opcode_name(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_round_trip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(u8::from(op)).unwrap(), op);
        }
        assert!(matches!(Opcode::try_from(8), Err(MpError::UnknownOpcode(8))));
        assert!(matches!(Opcode::try_from(255), Err(MpError::UnknownOpcode(255))));
    }

    #[test]
    fn names() {
        assert_eq!(opcode_name(Opcode::Sum), "SUM");
        assert_eq!(Opcode::Land.to_string(), "LAND");
    }

    #[test]
    fn integer_semantics() {
        assert_eq!(Opcode::Sum.apply(u8::MAX, 1).unwrap(), 0);
        assert_eq!(Opcode::Bor.apply(0b0101u32, 0b0011).unwrap(), 0b0111);
        assert_eq!(Opcode::Band.apply(0b0101u32, 0b0011).unwrap(), 0b0001);
        assert_eq!(Opcode::Lor.apply(0i32, -3).unwrap(), 1);
        assert_eq!(Opcode::Land.apply(2i64, 0).unwrap(), 0);
        assert_eq!(Opcode::Min.apply(-4i32, 2).unwrap(), -4);
    }

    #[test]
    fn float_rejects_bitwise() {
        assert!(!Opcode::Bor.supports(ElemType::F32));
        assert!(matches!(
            Opcode::Lor.apply(1.0f32, 0.0),
            Err(MpError::OpcodeNotSupported { .. })
        ));
        assert_eq!(Opcode::Prod.apply(1.5f64, 2.0).unwrap(), 3.0);
    }

    #[test]
    fn fold_bytes_elementwise() {
        let mut acc = [1i32, 5, -2];
        let other = [4i32, 3, 7];
        Opcode::Max
            .fold_bytes(
                ElemType::I32,
                bytemuck::cast_slice_mut(&mut acc),
                bytemuck::cast_slice(&other),
            )
            .unwrap();
        assert_eq!(acc, [4, 5, 7]);
    }
}
