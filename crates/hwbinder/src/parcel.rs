//! Transaction buffers
//!
//! A [`Parcel`] wraps one [`WireBuffer`] for one call. Scalars go straight
//! into the inline stream. Strings, vectors and descriptor bundles are
//! pinned through the parcel's [`Arena`] and written as small blob trees: a
//! 16-byte header buffer with the payload embedded at its pointer slot.
//!
//! Two-way calls install a reply channel on the reply parcel; [`Parcel::send`]
//! ships the contents exactly once.

use crate::arena::Arena;
use crate::error::{BinderError, Result};
use crate::handle_bridge;
use crate::host::{HostArray, HostRef, HostRuntime};
use crate::proxy::RemoteProxy;
use crate::status::Status;
use crate::transport::{ReplyChannel, TargetId, Transport};
use bytes::Bytes;
use hidl_wire::layout::{
    HANDLE_HEADER_SIZE, HEADER_BUFFER_OFFSET, HEADER_OWNS_OFFSET, HEADER_SIZE_OFFSET,
    STRING_HEADER_SIZE, VEC_HEADER_SIZE,
};
use hidl_wire::{
    BinderObject, Blob, DecodeLimits, ExternalRef, NativeHandle, Scalar, WireBuffer, WireHandle,
};
use std::sync::Arc;
use tracing::{debug, warn};

enum WireSlot<'a> {
    Owned(WireBuffer),
    Borrowed(&'a mut WireBuffer),
    Detached,
}

enum ReplyState {
    Unavailable,
    Unreplied(ReplyChannel),
    Replied,
}

/// Read/write wrapper around one wire buffer
pub struct Parcel<'a> {
    wire: WireSlot<'a>,
    arena: Arena,
    host: Arc<dyn HostRuntime>,
    transport: Option<Arc<dyn Transport>>,
    reply: ReplyState,
}

impl std::fmt::Debug for Parcel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parcel").finish_non_exhaustive()
    }
}

macro_rules! scalar_accessors {
    ($($write:ident, $read:ident, $ty:ty;)*) => {
        $(
            pub fn $write(&mut self, value: $ty) -> Result<()> {
                self.wire_mut()?.write_scalar(value);
                Ok(())
            }

            pub fn $read(&mut self) -> Result<$ty> {
                Ok(self.wire_mut()?.read_scalar::<$ty>()?)
            }
        )*
    };
}

impl Parcel<'static> {
    /// Parcel owning a fresh, empty wire buffer
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self::with_slot(WireSlot::Owned(WireBuffer::new()), host)
    }

    /// Parcel with no buffer; attach one before use
    pub fn detached(host: Arc<dyn HostRuntime>) -> Self {
        Self::with_slot(WireSlot::Detached, host)
    }

    /// Parcel owning an existing wire buffer
    pub fn from_wire(wire: WireBuffer, host: Arc<dyn HostRuntime>) -> Self {
        Self::with_slot(WireSlot::Owned(wire), host)
    }
}

impl<'a> Parcel<'a> {
    /// Parcel over a buffer someone else owns; the buffer is never freed here
    pub fn borrowed(wire: &'a mut WireBuffer, host: Arc<dyn HostRuntime>) -> Self {
        Self::with_slot(WireSlot::Borrowed(wire), host)
    }

    fn with_slot(wire: WireSlot<'a>, host: Arc<dyn HostRuntime>) -> Self {
        Self {
            wire,
            arena: Arena::new(),
            host,
            transport: None,
            reply: ReplyState::Unavailable,
        }
    }

    /// Transport used to turn received references into proxies
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    /// Replace the buffer with one this parcel owns
    pub fn attach_owned(&mut self, wire: WireBuffer) {
        self.wire = WireSlot::Owned(wire);
    }

    /// Replace the buffer with a borrowed one
    pub fn attach_borrowed(&mut self, wire: &'a mut WireBuffer) {
        self.wire = WireSlot::Borrowed(wire);
    }

    /// Drop the buffer reference, returning the buffer if it was owned
    pub fn detach(&mut self) -> Option<WireBuffer> {
        match std::mem::replace(&mut self.wire, WireSlot::Detached) {
            WireSlot::Owned(wire) => Some(wire),
            WireSlot::Borrowed(_) | WireSlot::Detached => None,
        }
    }

    pub fn owns_buffer(&self) -> bool {
        matches!(self.wire, WireSlot::Owned(_))
    }

    pub fn wire(&self) -> Result<&WireBuffer> {
        match &self.wire {
            WireSlot::Owned(wire) => Ok(wire),
            WireSlot::Borrowed(wire) => Ok(&**wire),
            WireSlot::Detached => Err(BinderError::Status(Status::NoInit)),
        }
    }

    pub fn wire_mut(&mut self) -> Result<&mut WireBuffer> {
        match &mut self.wire {
            WireSlot::Owned(wire) => Ok(wire),
            WireSlot::Borrowed(wire) => Ok(&mut **wire),
            WireSlot::Detached => Err(BinderError::Status(Status::NoInit)),
        }
    }

    /// Flat image for the transport
    pub fn encode(&self) -> Result<Bytes> {
        Ok(self.wire()?.encode()?)
    }

    /// Replace the contents with a received flat image
    pub fn set_encoded(&mut self, bytes: Bytes, limits: &DecodeLimits) -> Result<()> {
        let wire = WireBuffer::decode(bytes, limits)?;
        match &mut self.wire {
            WireSlot::Borrowed(target) => **target = wire,
            slot => *slot = WireSlot::Owned(wire),
        }
        Ok(())
    }

    pub fn data_size(&self) -> Result<usize> {
        Ok(self.wire()?.data_size())
    }

    pub fn data_position(&self) -> Result<usize> {
        Ok(self.wire()?.data_position())
    }

    pub fn set_data_position(&mut self, position: usize) -> Result<()> {
        Ok(self.wire_mut()?.set_data_position(position)?)
    }

    /// Clear the contents and move the cursor to 0
    pub fn rewind(&mut self) -> Result<()> {
        self.wire_mut()?.rewind();
        Ok(())
    }

    /// Release everything pinned so far
    pub fn release_temporary_storage(&mut self) -> usize {
        self.arena.release(self.host.as_ref())
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    // Scalars

    scalar_accessors! {
        write_bool, read_bool, bool;
        write_i8, read_i8, i8;
        write_u8, read_u8, u8;
        write_i16, read_i16, i16;
        write_u16, read_u16, u16;
        write_i32, read_i32, i32;
        write_u32, read_u32, u32;
        write_i64, read_i64, i64;
        write_u64, read_u64, u64;
        write_float, read_float, f32;
        write_double, read_double, f64;
    }

    pub fn write_status(&mut self, status: Status) -> Result<()> {
        self.write_i32(status.code())
    }

    /// Read a status and turn anything but OK into an error
    pub fn verify_success(&mut self) -> Result<()> {
        let status = Status::from_code(self.read_i32()?);
        if status.is_ok() {
            Ok(())
        } else {
            Err(BinderError::Status(status))
        }
    }

    // Strings

    /// Write a host string, pinned until the arena is released
    pub fn write_string(&mut self, value: &HostRef) -> Result<()> {
        let view = self.arena.borrow_string(self.host.as_ref(), value)?;
        let mut text = Blob::new(0);
        text.bind_external(view.data().clone(), ExternalRef::Token(value.id()))?;

        let mut header = Blob::new(STRING_HEADER_SIZE);
        header.put_string_blob(0, view.len(), text)?;
        header.serialize(self.wire_mut()?, None)?;
        Ok(())
    }

    /// Write a Rust string through a fresh host string
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        let object = self.host.new_string(value)?;
        self.write_string(&object)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let header = self.read_buffer(STRING_HEADER_SIZE)?;
        Ok(header.get_string(0)?)
    }

    /// Read a string into a new host object
    pub fn read_host_string(&mut self) -> Result<HostRef> {
        let value = self.read_string()?;
        self.host.new_string(&value)
    }

    pub fn write_interface_token(&mut self, descriptor: &str) -> Result<()> {
        self.write_str(descriptor)
    }

    /// Check the interface token written by the caller
    pub fn enforce_interface(&mut self, descriptor: &str) -> Result<()> {
        let token = self.read_string()?;
        if token != descriptor {
            warn!(expected = descriptor, received = %token, "interface token mismatch");
            return Err(BinderError::Status(Status::BadType));
        }
        Ok(())
    }

    // Vectors

    /// Write a host array of `T`, pinned until the arena is released
    pub fn write_vector<T: Scalar>(&mut self, array: &HostRef) -> Result<()> {
        let view = self
            .arena
            .borrow_primitive_array::<T>(self.host.as_ref(), array)?;
        let mut elements = Blob::new(0);
        elements.bind_external(view.data, ExternalRef::Token(array.id()))?;

        let mut header = Blob::new(VEC_HEADER_SIZE);
        header.put(HEADER_SIZE_OFFSET, vector_len(view.len)?)?;
        header.put(HEADER_OWNS_OFFSET, false)?;
        header.attach_child(HEADER_BUFFER_OFFSET, elements)?;
        header.serialize(self.wire_mut()?, None)?;
        Ok(())
    }

    /// Write a slice through a fresh host array
    pub fn write_slice<T: Scalar>(&mut self, values: &[T]) -> Result<()> {
        let array = self.host.new_array(HostArray::from_slice(values))?;
        self.write_vector::<T>(&array)
    }

    pub fn read_vector<T: Scalar>(&mut self) -> Result<Vec<T>> {
        let header = self.read_buffer(VEC_HEADER_SIZE)?;
        let count = header.get::<u32>(HEADER_SIZE_OFFSET)? as usize;
        let elements = header
            .child(HEADER_BUFFER_OFFSET)
            .ok_or_else(|| BinderError::protocol("vector without element buffer"))?;
        if elements.len() != count.saturating_mul(T::SIZE) {
            return Err(BinderError::protocol(format!(
                "vector of {} {:?} carries {} bytes",
                count,
                T::KIND,
                elements.len()
            )));
        }
        Ok(elements.get_scalars::<T>(0, count)?)
    }

    /// Read a vector into a new host array
    pub fn read_host_vector<T: Scalar>(&mut self) -> Result<HostRef> {
        let values = self.read_vector::<T>()?;
        self.host.new_array(HostArray::from_slice(&values))
    }

    /// Write a vector of host strings
    ///
    /// Element headers are built in a raw slab and the pinned views are
    /// kept in a string array slab, both released with the arena.
    pub fn write_string_vector(&mut self, values: &[HostRef]) -> Result<()> {
        let count = values.len();
        let headers_len = count
            .checked_mul(STRING_HEADER_SIZE)
            .ok_or_else(|| BinderError::Allocation(format!("{} string headers", count)))?;
        let headers = self.arena.alloc_raw(headers_len)?;
        let views = self.arena.alloc_string_array(count)?;

        for (index, value) in values.iter().enumerate() {
            let view = self.arena.borrow_string(self.host.as_ref(), value)?;
            let len = vector_len(view.len())?;
            let raw = self.arena.raw_mut(headers)?;
            let base = index * STRING_HEADER_SIZE;
            raw[base + HEADER_SIZE_OFFSET..base + HEADER_SIZE_OFFSET + 4]
                .copy_from_slice(&len.to_le_bytes());
            self.arena.string_array_mut(views)?[index] = view;
        }

        let mut elements = Blob::new(0);
        elements.bind_external(
            self.arena.freeze_raw(headers)?,
            ExternalRef::Token(headers.token()),
        )?;
        let slab = self.arena.string_array_mut(views)?;
        for (index, (view, value)) in slab.iter().zip(values).enumerate() {
            let mut text = Blob::new(0);
            text.bind_external(view.data().clone(), ExternalRef::Token(value.id()))?;
            elements.attach_child(index * STRING_HEADER_SIZE + HEADER_BUFFER_OFFSET, text)?;
        }

        let mut header = Blob::new(VEC_HEADER_SIZE);
        header.put(HEADER_SIZE_OFFSET, vector_len(count)?)?;
        header.put(HEADER_OWNS_OFFSET, false)?;
        header.attach_child(HEADER_BUFFER_OFFSET, elements)?;
        header.serialize(self.wire_mut()?, None)?;
        Ok(())
    }

    /// Write Rust strings through fresh host strings
    pub fn write_str_vector(&mut self, values: &[&str]) -> Result<()> {
        let objects = values
            .iter()
            .map(|value| self.host.new_string(value))
            .collect::<Result<Vec<_>>>()?;
        self.write_string_vector(&objects)
    }

    pub fn read_string_vector(&mut self) -> Result<Vec<String>> {
        let header = self.read_buffer(VEC_HEADER_SIZE)?;
        let count = header.get::<u32>(HEADER_SIZE_OFFSET)? as usize;
        let elements = header
            .child(HEADER_BUFFER_OFFSET)
            .ok_or_else(|| BinderError::protocol("string vector without element buffer"))?;
        if elements.len() != count.saturating_mul(STRING_HEADER_SIZE) {
            return Err(BinderError::protocol(format!(
                "string vector of {} carries {} header bytes",
                count,
                elements.len()
            )));
        }
        (0..count)
            .map(|index| Ok(elements.get_string(index * STRING_HEADER_SIZE)?))
            .collect()
    }

    // Descriptor bundles

    /// Write an optional descriptor bundle; descriptors are not duplicated
    pub fn write_native_handle(&mut self, handle: Option<&HostRef>) -> Result<()> {
        let Some(object) = handle else {
            return self.write_bool(false);
        };
        let bundle = self.arena.borrow_handle_bundle(object)?;
        self.write_bool(true)?;
        self.wire_mut()?
            .write_native_handle(NativeHandle::clone(&bundle), None)?;
        Ok(())
    }

    pub fn read_native_handle(&mut self) -> Result<Option<HostRef>> {
        if !self.read_bool()? {
            return Ok(None);
        }
        let (_, native) = self.wire_mut()?.read_native_handle()?;
        handle_bridge::to_bridged(&native, self.host.as_ref()).map(Some)
    }

    pub fn write_native_handle_vector(&mut self, handles: &[Option<HostRef>]) -> Result<()> {
        let count = handles.len();
        let elements_len = count
            .checked_mul(HANDLE_HEADER_SIZE)
            .ok_or_else(|| BinderError::Allocation(format!("{} handle headers", count)))?;
        let mut elements = Blob::new(elements_len);
        for (index, handle) in handles.iter().enumerate() {
            if let Some(object) = handle {
                let bundle = self.arena.borrow_handle_bundle(object)?;
                elements.put_native_handle(index * HANDLE_HEADER_SIZE, NativeHandle::clone(&bundle))?;
            }
        }

        let mut header = Blob::new(VEC_HEADER_SIZE);
        header.put(HEADER_SIZE_OFFSET, vector_len(count)?)?;
        header.put(HEADER_OWNS_OFFSET, false)?;
        header.attach_child(HEADER_BUFFER_OFFSET, elements)?;
        header.serialize(self.wire_mut()?, None)?;
        Ok(())
    }

    pub fn read_native_handle_vector(&mut self) -> Result<Vec<Option<HostRef>>> {
        let header = self.read_buffer(VEC_HEADER_SIZE)?;
        let count = header.get::<u32>(HEADER_SIZE_OFFSET)? as usize;
        let elements = header
            .child(HEADER_BUFFER_OFFSET)
            .ok_or_else(|| BinderError::protocol("handle vector without element buffer"))?;
        if elements.len() != count.saturating_mul(HANDLE_HEADER_SIZE) {
            return Err(BinderError::protocol(format!(
                "handle vector of {} carries {} header bytes",
                count,
                elements.len()
            )));
        }
        (0..count)
            .map(|index| {
                match elements.get_native_handle(index * HANDLE_HEADER_SIZE)? {
                    Some(native) => handle_bridge::to_bridged(&native, self.host.as_ref()).map(Some),
                    None => Ok(None),
                }
            })
            .collect()
    }

    // Blobs

    /// Serialize a blob tree as a top-level buffer
    pub fn write_buffer(&mut self, blob: &mut Blob) -> Result<WireHandle> {
        Ok(blob.serialize(self.wire_mut()?, None)?)
    }

    /// Read the next top-level buffer, which must be `expected_size` bytes
    pub fn read_buffer(&mut self, expected_size: usize) -> Result<Blob> {
        let wire = self.wire_mut()?;
        let (handle, data) = wire.read_buffer()?;
        if data.len() != expected_size {
            return Err(BinderError::protocol(format!(
                "buffer {} is {} bytes, expected {}",
                handle,
                data.len(),
                expected_size
            )));
        }
        Ok(Blob::from_wire(wire, handle)?)
    }

    /// Read the buffer embedded at `offset` inside `parent`
    pub fn read_embedded_buffer(
        &self,
        expected_size: usize,
        parent: WireHandle,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<Blob>> {
        let wire = self.wire()?;
        let Some(handle) = wire.child(parent, offset) else {
            if nullable {
                return Ok(None);
            }
            return Err(BinderError::protocol(format!(
                "missing buffer at offset {} of {}",
                offset, parent
            )));
        };
        let blob = Blob::from_wire(wire, handle)?;
        if blob.len() != expected_size {
            return Err(BinderError::protocol(format!(
                "embedded buffer {} is {} bytes, expected {}",
                handle,
                blob.len(),
                expected_size
            )));
        }
        Ok(Some(blob))
    }

    // References

    /// Hand a reference to an endpoint or proxy to the peer
    pub fn write_strong_reference(&mut self, target: TargetId) -> Result<()> {
        self.wire_mut()?.write_binder(BinderObject {
            target: target.as_u64(),
            local: false,
        })?;
        Ok(())
    }

    /// Read a reference to a remote target
    ///
    /// References to targets in this process are rejected.
    pub fn read_strong_reference(&mut self) -> Result<RemoteProxy> {
        let binder = self.wire_mut()?.read_binder()?;
        let target = TargetId::from_u64(binder.target);
        if binder.local {
            warn!(%target, "rejected local binder reference");
            return Err(BinderError::unsupported(format!(
                "{} is a local object and cannot be used through a proxy",
                target
            )));
        }
        let transport = self
            .transport
            .clone()
            .ok_or(BinderError::Status(Status::NoInit))?;
        Ok(RemoteProxy::new(target, transport))
    }

    // Reply protocol

    pub fn set_reply_channel(&mut self, channel: ReplyChannel) {
        self.reply = ReplyState::Unreplied(channel);
    }

    pub fn has_reply_channel(&self) -> bool {
        matches!(self.reply, ReplyState::Unreplied(_))
    }

    pub fn replied(&self) -> bool {
        matches!(self.reply, ReplyState::Replied)
    }

    /// Ship the current contents to the caller
    ///
    /// Allowed once, and only on a parcel with a reply channel.
    pub fn send(&mut self) -> Result<()> {
        match &self.reply {
            ReplyState::Replied => return Err(BinderError::AlreadyReplied),
            ReplyState::Unavailable => {
                return Err(BinderError::unsupported("parcel has no reply channel"));
            }
            ReplyState::Unreplied(_) => {}
        }
        self.wire()?;
        let ReplyState::Unreplied(channel) = std::mem::replace(&mut self.reply, ReplyState::Replied)
        else {
            return Err(BinderError::AlreadyReplied);
        };
        let wire = self.wire()?;
        debug!(size = wire.data_size(), objects = wire.object_count(), "sending reply");
        let delivered = channel(Status::Ok, wire);
        if delivered.is_ok() {
            Ok(())
        } else {
            warn!(status = %delivered, "reply could not be delivered");
            Err(BinderError::Status(delivered))
        }
    }

    /// Report a failed transaction: clear the contents and ship `status`
    /// with an empty reply. Does nothing once a reply was sent.
    pub(crate) fn fail_reply(&mut self, status: Status) {
        if !self.has_reply_channel() {
            return;
        }
        let ReplyState::Unreplied(channel) = std::mem::replace(&mut self.reply, ReplyState::Replied)
        else {
            return;
        };
        let empty = WireBuffer::new();
        let wire = match self.wire_mut() {
            Ok(wire) => {
                wire.rewind();
                &*wire
            }
            Err(_) => &empty,
        };
        let delivered = channel(status, wire);
        if !delivered.is_ok() {
            warn!(status = %delivered, "failure reply could not be delivered");
        }
    }
}

impl Drop for Parcel<'_> {
    fn drop(&mut self) {
        self.arena.release(self.host.as_ref());
    }
}

fn vector_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| BinderError::protocol(format!("{} elements is too many", len)))
}
