//! Blob object graph
//!
//! A [`Blob`] is a fixed-extent byte region that owns a tree of child blobs,
//! each hung off a pointer slot in its parent. The slot itself carries no
//! address: in-process readers resolve a child with [`Blob::child`], and the
//! wire form carries the child's [`WireHandle`] in the slot.
//!
//! Serialization writes the blob, then each child embedded at
//! `(parent_handle, offset)`, depth first. Parents therefore always reach the
//! wire before their children.

use crate::layout::{
    HANDLE_HEADER_SIZE, HANDLE_OWNS_OFFSET, HEADER_BUFFER_OFFSET, HEADER_OWNS_OFFSET,
    HEADER_SIZE_OFFSET, POINTER_SIZE, STRING_HEADER_SIZE,
};
use crate::{NativeHandle, ParentRef, Result, Scalar, WireBuffer, WireError, WireHandle, WireObject};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// What a blob's bytes describe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    /// Plain bytes, possibly with embedded children
    Generic,
    /// A descriptor bundle; never has children
    NativeHandle,
}

/// Owner of bytes a blob borrows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalRef {
    /// An object in a received wire buffer
    Wire(WireHandle),
    /// An allocation held by some other registry, identified by token
    Token(u64),
}

#[derive(Clone, Debug)]
enum Storage {
    Owned(BytesMut),
    Borrowed { data: Bytes, owner: ExternalRef },
}

/// Relocatable typed memory region with owned children
#[derive(Clone, Debug)]
pub struct Blob {
    storage: Storage,
    kind: Option<BlobKind>,
    native: Option<NativeHandle>,
    sub_blobs: BTreeMap<usize, Blob>,
}

impl Blob {
    /// Allocate `size` zeroed bytes
    ///
    /// A zero-sized blob may later be bound to external bytes with
    /// [`Blob::bind_external`].
    pub fn new(size: usize) -> Self {
        Self {
            storage: Storage::Owned(BytesMut::zeroed(size)),
            kind: None,
            native: None,
            sub_blobs: BTreeMap::new(),
        }
    }

    /// Wrap a descriptor bundle
    pub fn from_native_handle(handle: NativeHandle) -> Self {
        let mut blob = Self::new(0);
        blob.storage = Storage::Owned(BytesMut::from(&handle.encode()[..]));
        blob.kind = Some(BlobKind::NativeHandle);
        blob.native = Some(handle);
        blob
    }

    /// Point an empty blob at bytes owned elsewhere
    ///
    /// Only a blob created with `new(0)` that has never held data can be
    /// bound. The blob never frees `data`; it only keeps a reference to it.
    pub fn bind_external(&mut self, data: Bytes, owner: ExternalRef) -> Result<()> {
        let unbound_empty = match &self.storage {
            Storage::Owned(bytes) => bytes.is_empty(),
            Storage::Borrowed { .. } => {
                return Err(WireError::unsupported("blob is already bound"));
            }
        };
        if !unbound_empty || !self.sub_blobs.is_empty() || self.native.is_some() {
            return Err(WireError::unsupported(
                "only an empty blob can be bound to external data",
            ));
        }
        self.storage = Storage::Borrowed { data, owner };
        Ok(())
    }

    /// Fix the blob's kind; allowed once
    pub fn set_kind(&mut self, kind: BlobKind) -> Result<()> {
        if let Some(current) = self.kind {
            return Err(WireError::KindAlreadySet(current));
        }
        if kind == BlobKind::NativeHandle && self.native.is_none() {
            return Err(WireError::unsupported(
                "use Blob::from_native_handle for descriptor bundles",
            ));
        }
        self.kind = Some(kind);
        Ok(())
    }

    pub fn kind(&self) -> BlobKind {
        self.kind.unwrap_or(BlobKind::Generic)
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the bytes belong to someone else
    pub fn is_borrowed(&self) -> bool {
        matches!(self.storage, Storage::Borrowed { .. })
    }

    pub fn external(&self) -> Option<ExternalRef> {
        match &self.storage {
            Storage::Borrowed { owner, .. } => Some(*owner),
            Storage::Owned(_) => None,
        }
    }

    /// Wire handle of a blob read from a wire buffer
    pub fn handle(&self) -> Option<WireHandle> {
        match self.external() {
            Some(ExternalRef::Wire(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(bytes) => bytes,
            Storage::Borrowed { data, .. } => data,
        }
    }

    pub fn native_handle(&self) -> Option<&NativeHandle> {
        self.native.as_ref()
    }

    /// Bounds-checked read
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = self.check_range(offset, len)?;
        Ok(&self.bytes()[offset..end])
    }

    /// Bounds-checked write into an owned generic blob
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = self.check_range(offset, bytes.len())?;
        self.owned_mut()?[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn get<T: Scalar>(&self, offset: usize) -> Result<T> {
        let mut bytes = self.read(offset, T::SIZE)?;
        Ok(T::get(&mut bytes))
    }

    pub fn put<T: Scalar>(&mut self, offset: usize, value: T) -> Result<()> {
        let mut encoded = [0u8; 8];
        let mut cursor = &mut encoded[..T::SIZE];
        value.put(&mut cursor);
        self.write(offset, &encoded[..T::SIZE])
    }

    /// Read `count` consecutive scalars
    pub fn get_scalars<T: Scalar>(&self, offset: usize, count: usize) -> Result<Vec<T>> {
        let len = count
            .checked_mul(T::SIZE)
            .ok_or_else(|| WireError::protocol("scalar array length overflows"))?;
        T::decode_slice(self.read(offset, len)?)
    }

    /// Write consecutive scalars
    pub fn put_scalars<T: Scalar>(&mut self, offset: usize, values: &[T]) -> Result<()> {
        self.write(offset, &T::encode_slice(values))
    }

    /// Hang `child` off the pointer slot at `offset`
    ///
    /// Replaces any child already at that slot. The child is reached through
    /// [`Blob::child`], not through the slot; owned slots are zeroed, bound
    /// ones are left as they are.
    pub fn attach_child(&mut self, offset: usize, child: Blob) -> Result<()> {
        if self.kind() == BlobKind::NativeHandle {
            return Err(WireError::unsupported(
                "native handle blobs cannot embed sub-blobs",
            ));
        }
        let end = self.check_range(offset, POINTER_SIZE)?;
        let lower = offset.saturating_sub(POINTER_SIZE - 1);
        if let Some(clash) = self
            .sub_blobs
            .range(lower..end)
            .map(|(slot, _)| *slot)
            .find(|slot| *slot != offset)
        {
            return Err(WireError::unsupported(format!(
                "pointer slot at {} overlaps the slot at {}",
                offset, clash
            )));
        }
        if let Storage::Owned(bytes) = &mut self.storage {
            bytes[offset..end].fill(0);
        }
        self.sub_blobs.insert(offset, child);
        Ok(())
    }

    /// Alias of [`Blob::attach_child`]
    pub fn put_blob(&mut self, offset: usize, child: Blob) -> Result<()> {
        self.attach_child(offset, child)
    }

    pub fn child(&self, offset: usize) -> Option<&Blob> {
        self.sub_blobs.get(&offset)
    }

    pub fn children(&self) -> impl Iterator<Item = (usize, &Blob)> + '_ {
        self.sub_blobs.iter().map(|(offset, blob)| (*offset, blob))
    }

    /// Store a string header at `offset` with the text as a child
    pub fn put_string(&mut self, offset: usize, value: &str) -> Result<()> {
        let mut text = BytesMut::with_capacity(value.len() + 1);
        text.extend_from_slice(value.as_bytes());
        text.extend_from_slice(&[0]);
        let mut child = Blob::new(0);
        child.storage = Storage::Owned(text);
        self.put_string_blob(offset, value.len(), child)
    }

    /// Store a string header whose text is already in `text` (NUL included)
    pub fn put_string_blob(&mut self, offset: usize, len: usize, text: Blob) -> Result<()> {
        self.check_range(offset, STRING_HEADER_SIZE)?;
        let count = u32::try_from(len)
            .map_err(|_| WireError::protocol(format!("string of {} bytes is too long", len)))?;
        self.put(offset + HEADER_SIZE_OFFSET, count)?;
        self.put(offset + HEADER_OWNS_OFFSET, false)?;
        self.attach_child(offset + HEADER_BUFFER_OFFSET, text)
    }

    /// Read the string whose header is at `offset`
    pub fn get_string(&self, offset: usize) -> Result<String> {
        let len = self.get::<u32>(offset + HEADER_SIZE_OFFSET)? as usize;
        let text = self
            .child(offset + HEADER_BUFFER_OFFSET)
            .ok_or_else(|| WireError::protocol(format!("no string buffer at offset {}", offset)))?;
        let bytes = text.read(0, len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Store a handle header at `offset` with the bundle as a child
    pub fn put_native_handle(&mut self, offset: usize, handle: NativeHandle) -> Result<()> {
        self.check_range(offset, HANDLE_HEADER_SIZE)?;
        self.put(offset + HANDLE_OWNS_OFFSET, false)?;
        self.attach_child(offset + HEADER_BUFFER_OFFSET, Blob::from_native_handle(handle))
    }

    /// Read the bundle whose header is at `offset`; `None` for a null handle
    pub fn get_native_handle(&self, offset: usize) -> Result<Option<NativeHandle>> {
        self.check_range(offset, HANDLE_HEADER_SIZE)?;
        match self.child(offset + HEADER_BUFFER_OFFSET) {
            None => Ok(None),
            Some(child) => match child.native_handle() {
                Some(handle) => Ok(Some(handle.clone())),
                None => Err(WireError::protocol(format!(
                    "child at offset {} is not a native handle",
                    offset
                ))),
            },
        }
    }

    /// Write this blob and its subtree, returning this blob's handle
    pub fn serialize(&mut self, wire: &mut WireBuffer, parent: Option<ParentRef>) -> Result<WireHandle> {
        let kind = *self.kind.get_or_insert(BlobKind::Generic);
        match kind {
            BlobKind::NativeHandle => {
                if !self.sub_blobs.is_empty() {
                    return Err(WireError::unsupported(
                        "native handle blobs cannot embed sub-blobs",
                    ));
                }
                let handle = self
                    .native
                    .clone()
                    .ok_or_else(|| WireError::protocol("native handle blob without a bundle"))?;
                wire.write_native_handle(handle, parent)
            }
            BlobKind::Generic => {
                let data = match &self.storage {
                    Storage::Owned(bytes) => Bytes::copy_from_slice(bytes),
                    Storage::Borrowed { data, .. } => data.clone(),
                };
                let handle = match parent {
                    None => wire.write_buffer(data)?,
                    Some(parent) => wire.write_embedded_buffer(data, parent.handle, parent.offset)?,
                };
                for (offset, child) in self.sub_blobs.iter_mut() {
                    child.serialize(wire, Some(ParentRef::new(handle, *offset)))?;
                }
                Ok(handle)
            }
        }
    }

    /// Build a read-only view of the object at `handle` and everything
    /// embedded beneath it
    pub fn from_wire(wire: &WireBuffer, handle: WireHandle) -> Result<Self> {
        let mut blob = match wire.object(handle)? {
            WireObject::Buffer { data, .. } => Blob {
                storage: Storage::Borrowed {
                    data: data.clone(),
                    owner: ExternalRef::Wire(handle),
                },
                kind: Some(BlobKind::Generic),
                native: None,
                sub_blobs: BTreeMap::new(),
            },
            WireObject::NativeHandle { handle: native, .. } => Blob {
                storage: Storage::Borrowed {
                    data: native.encode(),
                    owner: ExternalRef::Wire(handle),
                },
                kind: Some(BlobKind::NativeHandle),
                native: Some(native.clone()),
                sub_blobs: BTreeMap::new(),
            },
            WireObject::Binder(_) => {
                return Err(WireError::protocol(format!(
                    "handle {} is a binder, not a blob",
                    handle
                )));
            }
        };

        // Children always carry larger handles than their parent, so this
        // recursion terminates.
        for (offset, child) in wire.children(handle) {
            blob.sub_blobs.insert(offset, Blob::from_wire(wire, child)?);
        }
        Ok(blob)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<usize> {
        let length = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= length => Ok(end),
            _ => Err(WireError::Range {
                offset,
                len,
                length,
            }),
        }
    }

    fn owned_mut(&mut self) -> Result<&mut BytesMut> {
        if self.kind() == BlobKind::NativeHandle {
            return Err(WireError::unsupported("native handle blobs are immutable"));
        }
        match &mut self.storage {
            Storage::Owned(bytes) => Ok(bytes),
            Storage::Borrowed { .. } => Err(WireError::unsupported("blob is bound to external data")),
        }
    }

    fn same_bytes_outside_slots(&self, other: &Blob) -> bool {
        let (a, b) = (self.bytes(), other.bytes());
        if a.len() != b.len() {
            return false;
        }
        let mut start = 0;
        for offset in self.sub_blobs.keys() {
            if *offset >= start && a[start..*offset] != b[start..*offset] {
                return false;
            }
            start = start.max(offset + POINTER_SIZE);
        }
        a[start..] == b[start..]
    }
}

/// Structural equality
///
/// Pointer slots are transport-relative and are not compared; the children
/// hanging off them are.
impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
            && self.native == other.native
            && self.sub_blobs.len() == other.sub_blobs.len()
            && self.sub_blobs.keys().eq(other.sub_blobs.keys())
            && self.same_bytes_outside_slots(other)
            && self.sub_blobs.values().eq(other.sub_blobs.values())
    }
}
