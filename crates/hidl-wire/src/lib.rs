//! HIDL wire runtime
//!
//! This crate provides the data layer of the hwbinder transport: how
//! structured values are laid out in a transaction and how nested regions
//! reference each other.
//!
//! # Wire Format
//!
//! A transaction is a [`WireBuffer`] with two parts:
//! - an inline data stream of little-endian scalars, each padded to a
//!   4-byte slot
//! - an object table of buffers, native handles and binder references,
//!   addressed by [`WireHandle`]
//!
//! Buffers may be embedded at a pointer slot inside a previously written
//! buffer. In the flat encoding that slot carries the child's handle; in
//! memory the edge lives in the table and the slot stays zero.
//!
//! Strings, vectors and native handles use 16-byte headers (see
//! [`layout`]) whose pointer slot at offset 0 references the payload.

mod blob;
mod error;
pub mod layout;
mod native_handle;
mod scalar;
mod wire;

pub use blob::{Blob, BlobKind, ExternalRef};
pub use error::{Result, WireError};
pub use native_handle::{
    NativeHandle, RawDescriptor, NATIVE_HANDLE_HEADER_SIZE, NATIVE_HANDLE_MAX_FDS,
    NATIVE_HANDLE_MAX_INTS, NATIVE_HANDLE_VERSION,
};
pub use scalar::{Scalar, ScalarKind};
pub use wire::{
    BinderObject, DecodeLimits, ParentRef, WireBuffer, WireHandle, WireObject,
    DEFAULT_MAX_OBJECTS, DEFAULT_MAX_WIRE_SIZE, OBJECT_HEADER_SIZE, WIRE_HEADER_SIZE, WIRE_MAGIC,
};

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
