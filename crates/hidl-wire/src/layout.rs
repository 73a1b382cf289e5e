//! Fixed header layouts shared by both sides of the boundary
//!
//! Strings, vectors and handles are never sent inline. Each one is a
//! 16-byte header whose first 8 bytes are a pointer slot; the payload
//! travels as a separate buffer embedded at that slot.
//!
//! ```text
//! string / vector header          handle header
//! +0  pointer slot (8)            +0  pointer slot (8)
//! +8  element count u32           +8  owns handle u8
//! +12 owns buffer u8              +9  padding
//! +13 padding
//! ```

/// Size of a pointer slot inside a blob
pub const POINTER_SIZE: usize = 8;

/// Size of a string header
pub const STRING_HEADER_SIZE: usize = 16;

/// Size of a vector header
pub const VEC_HEADER_SIZE: usize = 16;

/// Size of a handle header
pub const HANDLE_HEADER_SIZE: usize = 16;

/// Offset of the pointer slot in every header
pub const HEADER_BUFFER_OFFSET: usize = 0;

/// Offset of the element count in string and vector headers
pub const HEADER_SIZE_OFFSET: usize = 8;

/// Offset of the ownership flag in string and vector headers
pub const HEADER_OWNS_OFFSET: usize = 12;

/// Offset of the ownership flag in handle headers
pub const HANDLE_OWNS_OFFSET: usize = 8;

/// Calculate padding needed to align `position` to `alignment`
#[inline]
pub fn align_padding(position: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return 0;
    }
    match position % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

/// Round `len` up to a multiple of `alignment`
#[inline]
pub fn align_up(len: usize, alignment: usize) -> usize {
    len + align_padding(len, alignment)
}
