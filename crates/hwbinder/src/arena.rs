//! Per-transaction ephemeral storage
//!
//! An [`Arena`] keeps host memory pinned and temporary slabs alive while a
//! parcel is being written or read. Nothing is released on scope exit:
//! [`Arena::release`] needs the host runtime to unpin borrowed objects, so
//! the owner calls it explicitly when the transaction ends.
//!
//! Entries are torn down newest first. A slab allocated to back another
//! temporary is always released after the temporary that refers to it.

use crate::error::{BinderError, Result};
use crate::handle_bridge;
use crate::host::{HostRef, HostRuntime};
use bytes::{Bytes, BytesMut};
use hidl_wire::{NativeHandle, Scalar, ScalarKind};
use std::sync::Arc;
use tracing::{error, trace};

/// Pinned string bytes, NUL included
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringView {
    data: Bytes,
}

impl StringView {
    pub fn new(value: &str) -> Self {
        let mut data = BytesMut::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.extend_from_slice(&[0]);
        Self {
            data: data.freeze(),
        }
    }

    /// Length without the trailing NUL
    pub fn len(&self) -> usize {
        self.data.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes including the trailing NUL
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Pinned primitive array
#[derive(Clone, Debug)]
pub struct ArrayView {
    pub kind: ScalarKind,
    pub len: usize,
    pub data: Bytes,
}

/// Index of an owned slab in an arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaSlot {
    index: usize,
    epoch: u64,
}

impl ArenaSlot {
    /// Opaque token naming this slot in a [`hidl_wire::ExternalRef`]
    pub fn token(self) -> u64 {
        (self.epoch << 32) | self.index as u64
    }
}

/// What an arena entry holds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    StringArraySlab,
    RawSlab,
    BorrowedString,
    BorrowedPrimitiveArray(ScalarKind),
    BorrowedHandleSlab,
    OwnedHandle,
}

enum RawData {
    Open(Vec<u8>),
    Frozen(Bytes),
}

enum Entry {
    StringArraySlab(Vec<StringView>),
    RawSlab(RawData),
    BorrowedString(HostRef),
    BorrowedPrimitiveArray(ScalarKind, HostRef),
    BorrowedHandleSlab(HostRef, Arc<NativeHandle>),
    OwnedHandle(Arc<NativeHandle>),
}

impl Entry {
    fn kind(&self) -> EntryKind {
        match self {
            Entry::StringArraySlab(_) => EntryKind::StringArraySlab,
            Entry::RawSlab(_) => EntryKind::RawSlab,
            Entry::BorrowedString(_) => EntryKind::BorrowedString,
            Entry::BorrowedPrimitiveArray(kind, _) => EntryKind::BorrowedPrimitiveArray(*kind),
            Entry::BorrowedHandleSlab(..) => EntryKind::BorrowedHandleSlab,
            Entry::OwnedHandle(_) => EntryKind::OwnedHandle,
        }
    }
}

/// Allocation registry for one transaction
#[derive(Default)]
pub struct Arena {
    entries: Vec<Entry>,
    epoch: u64,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Kinds of the live entries, oldest first
    pub fn entry_kinds(&self) -> Vec<EntryKind> {
        self.entries.iter().map(Entry::kind).collect()
    }

    fn push(&mut self, entry: Entry) -> Result<ArenaSlot> {
        self.entries
            .try_reserve(1)
            .map_err(|e| BinderError::Allocation(format!("arena registry: {}", e)))?;
        let slot = ArenaSlot {
            index: self.entries.len(),
            epoch: self.epoch,
        };
        self.entries.push(entry);
        Ok(slot)
    }

    fn entry_mut(&mut self, slot: ArenaSlot) -> Result<&mut Entry> {
        if slot.epoch != self.epoch {
            return Err(BinderError::unsupported("arena slot outlived its transaction"));
        }
        self.entries
            .get_mut(slot.index)
            .ok_or_else(|| BinderError::protocol(format!("no arena entry {}", slot.index)))
    }

    /// Zeroed scratch block owned by the arena
    pub fn alloc_raw(&mut self, size: usize) -> Result<ArenaSlot> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|e| BinderError::Allocation(format!("raw slab of {} bytes: {}", size, e)))?;
        block.resize(size, 0);
        self.push(Entry::RawSlab(RawData::Open(block)))
    }

    /// Mutable access to a raw block that has not been frozen
    pub fn raw_mut(&mut self, slot: ArenaSlot) -> Result<&mut [u8]> {
        match self.entry_mut(slot)? {
            Entry::RawSlab(RawData::Open(block)) => Ok(&mut block[..]),
            Entry::RawSlab(RawData::Frozen(_)) => {
                Err(BinderError::unsupported("raw slab is already frozen"))
            }
            _ => Err(BinderError::protocol("arena entry is not a raw slab")),
        }
    }

    /// Seal a raw block and share it; the arena keeps it alive
    pub fn freeze_raw(&mut self, slot: ArenaSlot) -> Result<Bytes> {
        let entry = self.entry_mut(slot)?;
        let frozen = match &mut *entry {
            Entry::RawSlab(RawData::Frozen(bytes)) => return Ok(bytes.clone()),
            Entry::RawSlab(RawData::Open(block)) => Bytes::from(std::mem::take(block)),
            _ => return Err(BinderError::protocol("arena entry is not a raw slab")),
        };
        *entry = Entry::RawSlab(RawData::Frozen(frozen.clone()));
        Ok(frozen)
    }

    /// Pin a host string until release
    pub fn borrow_string(&mut self, host: &dyn HostRuntime, object: &HostRef) -> Result<StringView> {
        if object.as_str().is_none() {
            return Err(BinderError::protocol("host object is not a string"));
        }
        self.entries
            .try_reserve(1)
            .map_err(|e| BinderError::Allocation(format!("arena registry: {}", e)))?;
        let data = host.pin(object)?;
        self.push(Entry::BorrowedString(object.clone()))?;
        Ok(StringView { data })
    }

    /// Pin a host array of `T` until release
    pub fn borrow_primitive_array<T: Scalar>(
        &mut self,
        host: &dyn HostRuntime,
        object: &HostRef,
    ) -> Result<ArrayView> {
        let array = object
            .as_array()
            .ok_or_else(|| BinderError::protocol("host object is not an array"))?;
        if array.kind() != T::KIND {
            return Err(BinderError::protocol(format!(
                "array holds {:?}, expected {:?}",
                array.kind(),
                T::KIND
            )));
        }
        self.entries
            .try_reserve(1)
            .map_err(|e| BinderError::Allocation(format!("arena registry: {}", e)))?;
        let data = host.pin(object)?;
        self.push(Entry::BorrowedPrimitiveArray(T::KIND, object.clone()))?;
        Ok(ArrayView {
            kind: T::KIND,
            len: array.len(),
            data,
        })
    }

    /// Slab of `n` empty string views
    pub fn alloc_string_array(&mut self, n: usize) -> Result<ArenaSlot> {
        let mut views = Vec::new();
        views
            .try_reserve_exact(n)
            .map_err(|e| BinderError::Allocation(format!("string array of {}: {}", n, e)))?;
        views.resize_with(n, StringView::default);
        self.push(Entry::StringArraySlab(views))
    }

    pub fn string_array_mut(&mut self, slot: ArenaSlot) -> Result<&mut [StringView]> {
        match self.entry_mut(slot)? {
            Entry::StringArraySlab(views) => Ok(&mut views[..]),
            _ => Err(BinderError::protocol("arena entry is not a string array")),
        }
    }

    /// Bridge a host descriptor bundle into a native one kept until release
    pub fn borrow_handle_bundle(&mut self, object: &HostRef) -> Result<Arc<NativeHandle>> {
        handle_bridge::from_bridged(object, Some(self))
    }

    pub(crate) fn hold_bridged_handle(
        &mut self,
        object: &HostRef,
        bundle: NativeHandle,
    ) -> Result<Arc<NativeHandle>> {
        let bundle = Arc::new(bundle);
        self.push(Entry::BorrowedHandleSlab(object.clone(), bundle.clone()))?;
        Ok(bundle)
    }

    /// Keep a bundle the arena itself created
    pub fn adopt_handle(&mut self, bundle: NativeHandle) -> Result<Arc<NativeHandle>> {
        let bundle = Arc::new(bundle);
        self.push(Entry::OwnedHandle(bundle.clone()))?;
        Ok(bundle)
    }

    /// Tear down every entry, newest first
    ///
    /// Returns the number of entries released; a second call releases
    /// nothing. Slots handed out before the call become invalid.
    pub fn release(&mut self, host: &dyn HostRuntime) -> usize {
        let count = self.entries.len();
        while let Some(entry) = self.entries.pop() {
            let kind = entry.kind();
            match entry {
                Entry::BorrowedString(object) | Entry::BorrowedPrimitiveArray(_, object) => {
                    host.unpin(&object);
                }
                // Bundles free their table only; descriptors stay open.
                Entry::BorrowedHandleSlab(_, bundle) | Entry::OwnedHandle(bundle) => drop(bundle),
                Entry::StringArraySlab(views) => drop(views),
                Entry::RawSlab(_) => {}
            }
            trace!(?kind, "released arena entry");
        }
        if count > 0 {
            self.epoch += 1;
        }
        count
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        error!(
            entries = self.entries.len(),
            "arena dropped without release; host pins leak"
        );
        if cfg!(debug_assertions) && !std::thread::panicking() {
            panic!("arena dropped with {} live entries", self.entries.len());
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("entries", &self.entry_kinds())
            .field("epoch", &self.epoch)
            .finish()
    }
}
