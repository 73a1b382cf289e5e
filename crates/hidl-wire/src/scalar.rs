//! Scalar element codecs
//!
//! All scalars travel little-endian. Inside blobs they are packed at their
//! natural size; in the inline data stream every scalar occupies at least
//! one 4-byte slot (see [`crate::WireBuffer`]).
//!
//! | HIDL type | Rust type | Size |
//! |-----------|-----------|------|
//! | bool      | bool      | 1    |
//! | int8_t    | i8        | 1    |
//! | uint8_t   | u8        | 1    |
//! | int16_t   | i16       | 2    |
//! | uint16_t  | u16       | 2    |
//! | int32_t   | i32       | 4    |
//! | uint32_t  | u32       | 4    |
//! | int64_t   | i64       | 8    |
//! | uint64_t  | u64       | 8    |
//! | float     | f32       | 4    |
//! | double    | f64       | 8    |

use crate::{Result, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Debug;

/// Element type tag for scalar arrays and vectors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ScalarKind {
    /// Encoded size of one element
    pub const fn size(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
        }
    }
}

/// A fixed-size value that can be packed into blobs and vectors
pub trait Scalar: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const KIND: ScalarKind;
    const SIZE: usize;

    fn put<B: BufMut>(self, buf: &mut B);

    /// Caller guarantees `buf.remaining() >= Self::SIZE`
    fn get<B: Buf>(buf: &mut B) -> Self;

    /// Pack a slice into contiguous little-endian bytes
    fn encode_slice(values: &[Self]) -> Bytes {
        let mut out = BytesMut::with_capacity(values.len() * Self::SIZE);
        for value in values {
            value.put(&mut out);
        }
        out.freeze()
    }

    /// Unpack contiguous little-endian bytes
    fn decode_slice(mut bytes: &[u8]) -> Result<Vec<Self>> {
        if bytes.len() % Self::SIZE != 0 {
            return Err(WireError::protocol(format!(
                "{} bytes is not a whole number of {:?} elements",
                bytes.len(),
                Self::KIND
            )));
        }
        let mut out = Vec::with_capacity(bytes.len() / Self::SIZE);
        while bytes.has_remaining() {
            out.push(Self::get(&mut bytes));
        }
        Ok(out)
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $kind:ident, $size:expr, $put:ident, $get:ident) => {
        impl Scalar for $ty {
            const KIND: ScalarKind = ScalarKind::$kind;
            const SIZE: usize = $size;

            #[inline]
            fn put<B: BufMut>(self, buf: &mut B) {
                buf.$put(self);
            }

            #[inline]
            fn get<B: Buf>(buf: &mut B) -> Self {
                buf.$get()
            }
        }
    };
}

impl_scalar!(i8, I8, 1, put_i8, get_i8);
impl_scalar!(u8, U8, 1, put_u8, get_u8);
impl_scalar!(i16, I16, 2, put_i16_le, get_i16_le);
impl_scalar!(u16, U16, 2, put_u16_le, get_u16_le);
impl_scalar!(i32, I32, 4, put_i32_le, get_i32_le);
impl_scalar!(u32, U32, 4, put_u32_le, get_u32_le);
impl_scalar!(i64, I64, 8, put_i64_le, get_i64_le);
impl_scalar!(u64, U64, 8, put_u64_le, get_u64_le);
impl_scalar!(f32, F32, 4, put_f32_le, get_f32_le);
impl_scalar!(f64, F64, 8, put_f64_le, get_f64_le);

impl Scalar for bool {
    const KIND: ScalarKind = ScalarKind::Bool;
    const SIZE: usize = 1;

    #[inline]
    fn put<B: BufMut>(self, buf: &mut B) {
        buf.put_u8(self as u8);
    }

    #[inline]
    fn get<B: Buf>(buf: &mut B) -> Self {
        buf.get_u8() != 0
    }
}
