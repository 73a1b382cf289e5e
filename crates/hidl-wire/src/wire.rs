//! Scatter-gather wire buffer
//!
//! A [`WireBuffer`] has two parts:
//!
//! - the inline data stream: scalars, each padded to a 4-byte slot, and
//!   8-byte references to top-level objects
//! - the object table: buffers, native handles and binder references; an
//!   object's index in the table is its [`WireHandle`]
//!
//! Embedded buffers are not referenced from the inline stream. They hang
//! off a parent buffer at a pointer-slot offset and are reached through the
//! object table, so a reader walks the same tree the writer built.
//!
//! # Flat encoding
//!
//! ```text
//! magic u32 | data_len u32 | object_count u32 | reserved u32
//! data[data_len], padded to 8
//! per object:
//!   kind u32 | flags u32 | parent_handle u32 | reserved u32
//!   parent_offset u64 | length u64
//!   payload[length], padded to 8
//! ```
//!
//! When encoding, the pointer slot of every parent is patched with the
//! child's handle. Decoding checks that parents precede their children,
//! that every slot lies inside its parent and that it carries the handle of
//! the child embedded there.

use crate::layout::{align_padding, align_up, POINTER_SIZE};
use crate::{NativeHandle, Result, Scalar, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Magic value at the start of an encoded wire buffer ("HWPC")
pub const WIRE_MAGIC: u32 = 0x4857_5043;

/// Size of the encoded buffer header
pub const WIRE_HEADER_SIZE: usize = 16;

/// Size of each encoded object header
pub const OBJECT_HEADER_SIZE: usize = 32;

/// Default upper bound for an encoded buffer
pub const DEFAULT_MAX_WIRE_SIZE: usize = 1024 * 1024;

/// Default upper bound for the object table
pub const DEFAULT_MAX_OBJECTS: usize = 4096;

const INLINE_SLOT: usize = 4;
const OBJECT_REF_TAG: u32 = 0x7362_6f68;
const OBJECT_REF_SIZE: usize = 8;

const KIND_BUFFER: u32 = 1;
const KIND_NATIVE_HANDLE: u32 = 2;
const KIND_BINDER: u32 = 3;

const FLAG_HAS_PARENT: u32 = 0x1;
const FLAG_LOCAL: u32 = 0x2;

/// Transport-assigned reference to an object in the wire buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireHandle(pub u32);

impl WireHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WireHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Location of an embedded object inside its parent buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentRef {
    pub handle: WireHandle,
    pub offset: usize,
}

impl ParentRef {
    pub fn new(handle: WireHandle, offset: usize) -> Self {
        Self { handle, offset }
    }
}

/// Strong reference to a transaction target
///
/// `local` is set by the transport on delivery when the target lives in the
/// receiving process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BinderObject {
    pub target: u64,
    pub local: bool,
}

/// Entry of the object table
#[derive(Clone, Debug, PartialEq)]
pub enum WireObject {
    Buffer {
        parent: Option<ParentRef>,
        data: Bytes,
    },
    NativeHandle {
        parent: Option<ParentRef>,
        handle: NativeHandle,
    },
    Binder(BinderObject),
}

impl WireObject {
    pub fn parent(&self) -> Option<ParentRef> {
        match self {
            WireObject::Buffer { parent, .. } | WireObject::NativeHandle { parent, .. } => *parent,
            WireObject::Binder(_) => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            WireObject::Buffer { .. } => "buffer",
            WireObject::NativeHandle { .. } => "native handle",
            WireObject::Binder(_) => "binder",
        }
    }
}

/// Allocation limits applied while decoding untrusted bytes
#[derive(Clone, Copy, Debug)]
pub struct DecodeLimits {
    pub max_size: usize,
    pub max_objects: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_WIRE_SIZE,
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }
}

/// Inline data stream plus object table for one transaction
#[derive(Clone, Debug, Default)]
pub struct WireBuffer {
    data: BytesMut,
    position: usize,
    objects: Vec<WireObject>,
    children: BTreeMap<(WireHandle, usize), WireHandle>,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written to the inline stream
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Read cursor in the inline stream
    pub fn data_position(&self) -> usize {
        self.position
    }

    /// Bytes left to read in the inline stream
    pub fn data_avail(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn set_data_position(&mut self, position: usize) -> Result<()> {
        if position > self.data.len() {
            return Err(WireError::Range {
                offset: position,
                len: 0,
                length: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    /// Drop all contents and move the cursor back to 0
    pub fn rewind(&mut self) {
        self.data.clear();
        self.position = 0;
        self.objects.clear();
        self.children.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.objects.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> &[WireObject] {
        &self.objects
    }

    pub fn object(&self, handle: WireHandle) -> Result<&WireObject> {
        self.objects
            .get(handle.index())
            .ok_or_else(|| WireError::protocol(format!("no object for handle {}", handle)))
    }

    /// Payload of the buffer written under `handle`
    pub fn buffer(&self, handle: WireHandle) -> Result<&Bytes> {
        match self.object(handle)? {
            WireObject::Buffer { data, .. } => Ok(data),
            other => Err(WireError::protocol(format!(
                "handle {} is a {}, not a buffer",
                handle,
                other.kind_name()
            ))),
        }
    }

    /// Handle of the object embedded at `offset` inside `parent`
    pub fn child(&self, parent: WireHandle, offset: usize) -> Option<WireHandle> {
        self.children.get(&(parent, offset)).copied()
    }

    /// Objects embedded inside `parent`, ordered by offset
    pub fn children(&self, parent: WireHandle) -> impl Iterator<Item = (usize, WireHandle)> + '_ {
        self.children
            .range((parent, 0)..=(parent, usize::MAX))
            .map(|(&(_, offset), &child)| (offset, child))
    }

    /// Binder references, for transports that translate them on delivery
    pub fn binders_mut(&mut self) -> impl Iterator<Item = &mut BinderObject> + '_ {
        self.objects.iter_mut().filter_map(|object| match object {
            WireObject::Binder(binder) => Some(binder),
            _ => None,
        })
    }

    // Inline stream

    /// Append a scalar, padded to a 4-byte slot
    pub fn write_scalar<T: Scalar>(&mut self, value: T) {
        value.put(&mut self.data);
        self.data.put_bytes(0, align_padding(T::SIZE, INLINE_SLOT));
    }

    /// Read the scalar at the cursor
    pub fn read_scalar<T: Scalar>(&mut self) -> Result<T> {
        let slot = align_up(T::SIZE, INLINE_SLOT);
        let have = self.data_avail();
        if have < slot {
            return Err(WireError::Underflow { needed: slot, have });
        }
        let mut cursor = &self.data[self.position..self.position + T::SIZE];
        let value = T::get(&mut cursor);
        self.position += slot;
        Ok(value)
    }

    // Object table

    /// Write a top-level buffer
    pub fn write_buffer(&mut self, data: Bytes) -> Result<WireHandle> {
        self.push_object(WireObject::Buffer { parent: None, data })
    }

    /// Write a buffer embedded at `parent_offset` inside `parent`
    ///
    /// The parent must already be written, must be a buffer, and the
    /// pointer slot at `parent_offset` must lie inside it and be unused.
    pub fn write_embedded_buffer(
        &mut self,
        data: Bytes,
        parent: WireHandle,
        parent_offset: usize,
    ) -> Result<WireHandle> {
        let parent = ParentRef::new(parent, parent_offset);
        self.check_parent(parent)?;
        self.push_object(WireObject::Buffer {
            parent: Some(parent),
            data,
        })
    }

    /// Write a descriptor bundle, top-level or embedded
    pub fn write_native_handle(
        &mut self,
        handle: NativeHandle,
        parent: Option<ParentRef>,
    ) -> Result<WireHandle> {
        if let Some(parent) = parent {
            self.check_parent(parent)?;
        }
        self.push_object(WireObject::NativeHandle { parent, handle })
    }

    /// Write a strong reference
    pub fn write_binder(&mut self, binder: BinderObject) -> Result<WireHandle> {
        self.push_object(WireObject::Binder(binder))
    }

    /// Read the next top-level buffer
    pub fn read_buffer(&mut self) -> Result<(WireHandle, Bytes)> {
        let start = self.position;
        let handle = self.read_object_ref()?;
        match &self.objects[handle.index()] {
            WireObject::Buffer { parent: None, data } => Ok((handle, data.clone())),
            other => {
                let kind = other.kind_name();
                self.position = start;
                Err(WireError::protocol(format!(
                    "expected top-level buffer at {}, found {}",
                    handle, kind
                )))
            }
        }
    }

    /// Read the next top-level native handle
    pub fn read_native_handle(&mut self) -> Result<(WireHandle, NativeHandle)> {
        let start = self.position;
        let handle = self.read_object_ref()?;
        match &self.objects[handle.index()] {
            WireObject::NativeHandle {
                parent: None,
                handle: native,
            } => Ok((handle, native.clone())),
            other => {
                let kind = other.kind_name();
                self.position = start;
                Err(WireError::protocol(format!(
                    "expected native handle at {}, found {}",
                    handle, kind
                )))
            }
        }
    }

    /// Read the next strong reference
    pub fn read_binder(&mut self) -> Result<BinderObject> {
        let start = self.position;
        let handle = self.read_object_ref()?;
        match &self.objects[handle.index()] {
            WireObject::Binder(binder) => Ok(*binder),
            other => {
                let kind = other.kind_name();
                self.position = start;
                Err(WireError::protocol(format!(
                    "expected binder at {}, found {}",
                    handle, kind
                )))
            }
        }
    }

    fn read_object_ref(&mut self) -> Result<WireHandle> {
        let have = self.data_avail();
        if have < OBJECT_REF_SIZE {
            return Err(WireError::Underflow {
                needed: OBJECT_REF_SIZE,
                have,
            });
        }
        let mut cursor = &self.data[self.position..self.position + OBJECT_REF_SIZE];
        let tag = cursor.get_u32_le();
        let handle = WireHandle(cursor.get_u32_le());
        if tag != OBJECT_REF_TAG {
            return Err(WireError::protocol(format!(
                "expected object reference at position {}",
                self.position
            )));
        }
        if handle.index() >= self.objects.len() {
            return Err(WireError::protocol(format!(
                "object reference {} out of range ({} objects)",
                handle,
                self.objects.len()
            )));
        }
        self.position += OBJECT_REF_SIZE;
        Ok(handle)
    }

    fn check_parent(&self, parent: ParentRef) -> Result<()> {
        match self.objects.get(parent.handle.index()) {
            Some(WireObject::Buffer { data, .. }) => {
                let fits = parent
                    .offset
                    .checked_add(POINTER_SIZE)
                    .is_some_and(|end| end <= data.len());
                if !fits {
                    return Err(WireError::Range {
                        offset: parent.offset,
                        len: POINTER_SIZE,
                        length: data.len(),
                    });
                }
                if self.children.contains_key(&(parent.handle, parent.offset)) {
                    return Err(WireError::protocol(format!(
                        "slot {} of {} already embeds an object",
                        parent.offset, parent.handle
                    )));
                }
                let lower = parent.offset.saturating_sub(POINTER_SIZE - 1);
                let upper = parent.offset + POINTER_SIZE;
                if let Some(((_, clash), _)) = self
                    .children
                    .range((parent.handle, lower)..(parent.handle, upper))
                    .next()
                {
                    return Err(WireError::protocol(format!(
                        "slot {} of {} overlaps the slot at {}",
                        parent.offset, parent.handle, clash
                    )));
                }
                Ok(())
            }
            Some(other) => Err(WireError::unsupported(format!(
                "{} objects cannot embed other objects",
                other.kind_name()
            ))),
            None => Err(WireError::protocol(format!(
                "parent {} has not been written",
                parent.handle
            ))),
        }
    }

    fn push_object(&mut self, object: WireObject) -> Result<WireHandle> {
        let handle = self.register_object(object)?;
        if self.objects[handle.index()].parent().is_none() {
            self.data.put_u32_le(OBJECT_REF_TAG);
            self.data.put_u32_le(handle.0);
        }
        Ok(handle)
    }

    fn register_object(&mut self, object: WireObject) -> Result<WireHandle> {
        let index = u32::try_from(self.objects.len())
            .map_err(|_| WireError::Allocation("object table is full".to_string()))?;
        let handle = WireHandle(index);
        if let Some(parent) = object.parent() {
            self.children.insert((parent.handle, parent.offset), handle);
        }
        self.objects.push(object);
        Ok(handle)
    }

    // Flat encoding

    /// Size of [`WireBuffer::encode`]'s output
    pub fn encoded_len(&self) -> usize {
        let objects: usize = self
            .objects
            .iter()
            .map(|object| {
                let payload = match object {
                    WireObject::Buffer { data, .. } => data.len(),
                    WireObject::NativeHandle { handle, .. } => handle.encoded_len(),
                    WireObject::Binder(_) => 8,
                };
                OBJECT_HEADER_SIZE + align_up(payload, 8)
            })
            .sum();
        WIRE_HEADER_SIZE + align_up(self.data.len(), 8) + objects
    }

    /// Flatten into the byte image handed to the transport
    ///
    /// Fails when the inline stream or the object table is too large for
    /// the 32-bit header fields.
    pub fn encode(&self) -> Result<Bytes> {
        let data_len = u32::try_from(self.data.len()).map_err(|_| {
            WireError::Allocation(format!("{} inline bytes do not fit the header", self.data.len()))
        })?;
        let object_count = u32::try_from(self.objects.len()).map_err(|_| {
            WireError::Allocation(format!("{} objects do not fit the header", self.objects.len()))
        })?;

        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u32_le(WIRE_MAGIC);
        out.put_u32_le(data_len);
        out.put_u32_le(object_count);
        out.put_u32_le(0);
        out.put_slice(&self.data);
        out.put_bytes(0, align_padding(self.data.len(), 8));

        for (index, object) in self.objects.iter().enumerate() {
            let parent = object.parent();
            let mut flags = if parent.is_some() { FLAG_HAS_PARENT } else { 0 };
            let (kind, payload) = match object {
                WireObject::Buffer { data, .. } => (KIND_BUFFER, data.clone()),
                WireObject::NativeHandle { handle, .. } => (KIND_NATIVE_HANDLE, handle.encode()),
                WireObject::Binder(binder) => {
                    if binder.local {
                        flags |= FLAG_LOCAL;
                    }
                    (KIND_BINDER, Bytes::copy_from_slice(&binder.target.to_le_bytes()))
                }
            };

            out.put_u32_le(kind);
            out.put_u32_le(flags);
            out.put_u32_le(parent.map_or(0, |p| p.handle.0));
            out.put_u32_le(0);
            out.put_u64_le(parent.map_or(0, |p| p.offset as u64));
            out.put_u64_le(payload.len() as u64);

            let start = out.len();
            out.put_slice(&payload);
            for (offset, child) in self.children(WireHandle(index as u32)) {
                let slot = start + offset;
                out[slot..slot + POINTER_SIZE].copy_from_slice(&(child.0 as u64).to_le_bytes());
            }
            out.put_bytes(0, align_padding(payload.len(), 8));
        }

        Ok(out.freeze())
    }

    /// Rebuild a wire buffer from its flat image
    pub fn decode(bytes: Bytes, limits: &DecodeLimits) -> Result<Self> {
        if bytes.len() > limits.max_size {
            return Err(WireError::Allocation(format!(
                "wire buffer of {} bytes exceeds limit {}",
                bytes.len(),
                limits.max_size
            )));
        }

        let mut buf = bytes;
        ensure_remaining(&buf, WIRE_HEADER_SIZE)?;
        let magic = buf.get_u32_le();
        if magic != WIRE_MAGIC {
            return Err(WireError::protocol(format!("bad magic 0x{:08x}", magic)));
        }
        let data_len = buf.get_u32_le() as usize;
        let object_count = buf.get_u32_le() as usize;
        let _reserved = buf.get_u32_le();

        if object_count > limits.max_objects {
            return Err(WireError::Allocation(format!(
                "{} objects exceeds limit {}",
                object_count, limits.max_objects
            )));
        }

        let padded = align_up(data_len, 8);
        ensure_remaining(&buf, padded)?;
        let data = BytesMut::from(&buf[..data_len]);
        buf.advance(padded);

        let mut wire = WireBuffer {
            data,
            position: 0,
            objects: Vec::with_capacity(object_count),
            children: BTreeMap::new(),
        };

        for index in 0..object_count {
            ensure_remaining(&buf, OBJECT_HEADER_SIZE)?;
            let kind = buf.get_u32_le();
            let flags = buf.get_u32_le();
            let parent_handle = WireHandle(buf.get_u32_le());
            let _reserved = buf.get_u32_le();
            let parent_offset = usize::try_from(buf.get_u64_le())
                .map_err(|_| WireError::protocol("parent offset overflows usize"))?;
            let length = usize::try_from(buf.get_u64_le())
                .map_err(|_| WireError::protocol("object length overflows usize"))?;

            // bound by what is left before padding so a forged length
            // cannot overflow the alignment
            ensure_remaining(&buf, length)?;
            let padded = align_up(length, 8);
            ensure_remaining(&buf, padded)?;
            let payload = buf.copy_to_bytes(length);
            buf.advance(padded - length);

            let parent = if flags & FLAG_HAS_PARENT != 0 {
                let parent = ParentRef::new(parent_handle, parent_offset);
                wire.check_embedding(parent, index)?;
                Some(parent)
            } else {
                None
            };

            let object = match kind {
                KIND_BUFFER => WireObject::Buffer {
                    parent,
                    data: payload,
                },
                KIND_NATIVE_HANDLE => WireObject::NativeHandle {
                    parent,
                    handle: NativeHandle::decode(&payload)?,
                },
                KIND_BINDER => {
                    if parent.is_some() {
                        return Err(WireError::protocol("binder objects cannot be embedded"));
                    }
                    if payload.len() != 8 {
                        return Err(WireError::protocol(format!(
                            "binder payload is {} bytes",
                            payload.len()
                        )));
                    }
                    WireObject::Binder(BinderObject {
                        target: (&payload[..]).get_u64_le(),
                        local: flags & FLAG_LOCAL != 0,
                    })
                }
                other => {
                    return Err(WireError::protocol(format!("unknown object kind {}", other)));
                }
            };
            wire.register_object(object)?;
        }

        if buf.has_remaining() {
            return Err(WireError::protocol(format!(
                "{} trailing bytes after object table",
                buf.remaining()
            )));
        }
        trace!(
            data_len,
            objects = wire.objects.len(),
            "decoded wire buffer"
        );
        Ok(wire)
    }

    fn check_embedding(&self, parent: ParentRef, index: usize) -> Result<()> {
        if parent.handle.index() >= index {
            return Err(WireError::protocol(format!(
                "object #{} names parent {} which does not precede it",
                index, parent.handle
            )));
        }
        self.check_parent(parent)?;
        let data = self.buffer(parent.handle)?;
        let mut slot = &data[parent.offset..parent.offset + POINTER_SIZE];
        let recorded = slot.get_u64_le();
        if recorded != index as u64 {
            return Err(WireError::protocol(format!(
                "slot {} of {} holds {}, expected #{}",
                parent.offset, parent.handle, recorded, index
            )));
        }
        Ok(())
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(WireError::Underflow {
            needed,
            have: buf.remaining(),
        });
    }
    Ok(())
}
