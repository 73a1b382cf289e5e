//! Native descriptor bundles
//!
//! A native handle is a table of OS descriptors followed by opaque integers.
//! On the wire it uses the `native_handle_t` layout:
//!
//! ```text
//! version  i32   (size of the header, always 12)
//! num_fds  i32
//! num_ints i32
//! data     i32[num_fds + num_ints]
//! ```
//!
//! Dropping a [`NativeHandle`] frees the table only. Descriptors are never
//! duplicated or closed by this crate.

use crate::{Result, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Raw OS descriptor value
pub type RawDescriptor = i32;

/// `version` field of the header
pub const NATIVE_HANDLE_VERSION: i32 = 12;

/// Header size in bytes
pub const NATIVE_HANDLE_HEADER_SIZE: usize = 12;

/// Maximum number of descriptors in one bundle
pub const NATIVE_HANDLE_MAX_FDS: usize = 1024;

/// Maximum number of integers in one bundle
pub const NATIVE_HANDLE_MAX_INTS: usize = 1024;

/// Descriptor-count-tagged integer payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeHandle {
    fds: Vec<RawDescriptor>,
    ints: Vec<i32>,
}

impl NativeHandle {
    /// Build a handle from descriptors and integers
    pub fn new(fds: Vec<RawDescriptor>, ints: Vec<i32>) -> Result<Self> {
        check_counts(fds.len(), ints.len())?;
        Ok(Self { fds, ints })
    }

    /// Allocate an empty table able to hold the given counts
    ///
    /// Counts beyond the bundle limits are a malformed request; a refused
    /// allocation is reported separately as [`WireError::Allocation`].
    pub fn with_capacity(num_fds: usize, num_ints: usize) -> Result<Self> {
        check_counts(num_fds, num_ints)?;
        let mut fds = Vec::new();
        fds.try_reserve_exact(num_fds)
            .map_err(|e| WireError::Allocation(format!("descriptor table: {}", e)))?;
        let mut ints = Vec::new();
        ints.try_reserve_exact(num_ints)
            .map_err(|e| WireError::Allocation(format!("integer table: {}", e)))?;
        Ok(Self { fds, ints })
    }

    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    pub fn num_ints(&self) -> usize {
        self.ints.len()
    }

    pub fn fds(&self) -> &[RawDescriptor] {
        &self.fds
    }

    pub fn ints(&self) -> &[i32] {
        &self.ints
    }

    pub fn push_fd(&mut self, fd: RawDescriptor) -> Result<()> {
        check_counts(self.fds.len() + 1, self.ints.len())?;
        self.fds.push(fd);
        Ok(())
    }

    pub fn push_int(&mut self, value: i32) -> Result<()> {
        check_counts(self.fds.len(), self.ints.len() + 1)?;
        self.ints.push(value);
        Ok(())
    }

    /// Size of the `native_handle_t` image
    pub fn encoded_len(&self) -> usize {
        NATIVE_HANDLE_HEADER_SIZE + 4 * (self.fds.len() + self.ints.len())
    }

    /// Produce the `native_handle_t` image
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i32_le(NATIVE_HANDLE_VERSION);
        buf.put_i32_le(self.fds.len() as i32);
        buf.put_i32_le(self.ints.len() as i32);
        for fd in &self.fds {
            buf.put_i32_le(*fd);
        }
        for value in &self.ints {
            buf.put_i32_le(*value);
        }
        buf.freeze()
    }

    /// Parse a `native_handle_t` image
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NATIVE_HANDLE_HEADER_SIZE {
            return Err(WireError::Underflow {
                needed: NATIVE_HANDLE_HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let version = bytes.get_i32_le();
        if version != NATIVE_HANDLE_VERSION {
            return Err(WireError::protocol(format!(
                "native handle version {} (expected {})",
                version, NATIVE_HANDLE_VERSION
            )));
        }
        let num_fds = bytes.get_i32_le();
        let num_ints = bytes.get_i32_le();
        if num_fds < 0 || num_ints < 0 {
            return Err(WireError::protocol(format!(
                "negative native handle counts ({}, {})",
                num_fds, num_ints
            )));
        }
        let (num_fds, num_ints) = (num_fds as usize, num_ints as usize);
        check_counts(num_fds, num_ints)?;

        let needed = 4 * (num_fds + num_ints);
        if bytes.len() != needed {
            return Err(WireError::protocol(format!(
                "native handle payload is {} bytes, header describes {}",
                bytes.len(),
                needed
            )));
        }

        let mut handle = Self::with_capacity(num_fds, num_ints)?;
        for _ in 0..num_fds {
            handle.fds.push(bytes.get_i32_le());
        }
        for _ in 0..num_ints {
            handle.ints.push(bytes.get_i32_le());
        }
        Ok(handle)
    }
}

fn check_counts(num_fds: usize, num_ints: usize) -> Result<()> {
    if num_fds > NATIVE_HANDLE_MAX_FDS || num_ints > NATIVE_HANDLE_MAX_INTS {
        return Err(WireError::protocol(format!(
            "native handle too large: {} fds, {} ints",
            num_fds, num_ints
        )));
    }
    Ok(())
}
