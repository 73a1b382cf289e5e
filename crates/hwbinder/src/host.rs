//! Host object system contract
//!
//! Strings, arrays and descriptor bundles handed to a parcel belong to the
//! host runtime. A parcel never copies them eagerly: it pins their backing
//! memory for the duration of a transaction and unpins it when the arena is
//! released.
//!
//! [`ManagedHeap`] is a reference host that records pin traffic, used by the
//! demo service and the tests.

use crate::error::{BinderError, Result};
use bytes::Bytes;
use hidl_wire::{RawDescriptor, Scalar, ScalarKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Host-side descriptor bundle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostNativeHandle {
    pub fds: Vec<RawDescriptor>,
    pub ints: Vec<i32>,
}

/// Host-owned primitive array, stored packed little-endian
#[derive(Clone, Debug, PartialEq)]
pub struct HostArray {
    kind: ScalarKind,
    len: usize,
    data: Bytes,
}

impl HostArray {
    pub fn from_slice<T: Scalar>(values: &[T]) -> Self {
        Self {
            kind: T::KIND,
            len: values.len(),
            data: T::encode_slice(values),
        }
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Typed copy of the elements
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        if T::KIND != self.kind {
            return Err(BinderError::protocol(format!(
                "array holds {:?}, not {:?}",
                self.kind,
                T::KIND
            )));
        }
        Ok(T::decode_slice(&self.data)?)
    }
}

/// Value held by a host object
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    /// Stored with a trailing NUL
    String(Bytes),
    Array(HostArray),
    NativeHandle(HostNativeHandle),
}

#[derive(Debug)]
pub struct HostObject {
    id: u64,
    value: HostValue,
}

/// Counted reference to a host object
#[derive(Clone, Debug)]
pub struct HostRef(Arc<HostObject>);

impl HostRef {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn value(&self) -> &HostValue {
        &self.0.value
    }

    /// Text of a string object, without the trailing NUL
    pub fn as_str(&self) -> Option<&str> {
        match &self.0.value {
            HostValue::String(bytes) => {
                let text = &bytes[..bytes.len().saturating_sub(1)];
                std::str::from_utf8(text).ok()
            }
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&HostArray> {
        match &self.0.value {
            HostValue::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_native_handle(&self) -> Option<&HostNativeHandle> {
        match &self.0.value {
            HostValue::NativeHandle(handle) => Some(handle),
            _ => None,
        }
    }
}

/// The runtime that owns rich objects on the host side of the boundary
pub trait HostRuntime: Send + Sync {
    fn new_string(&self, value: &str) -> Result<HostRef>;

    fn new_array(&self, array: HostArray) -> Result<HostRef>;

    fn new_native_handle(&self, handle: HostNativeHandle) -> Result<HostRef>;

    /// Pin an object's backing memory and return a view of it
    ///
    /// Strings are returned with their trailing NUL. Every successful pin
    /// must be matched by one [`HostRuntime::unpin`].
    fn pin(&self, object: &HostRef) -> Result<Bytes>;

    fn unpin(&self, object: &HostRef);

    /// Whether two references denote the same host object
    fn same_object(&self, a: &HostRef, b: &HostRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0) || a.id() == b.id()
    }
}

/// Pin traffic recorded by [`ManagedHeap`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapEvent {
    Pinned(u64),
    Unpinned(u64),
}

/// Reference host runtime
#[derive(Debug, Default)]
pub struct ManagedHeap {
    next_id: AtomicU64,
    pins: Mutex<HashMap<u64, usize>>,
    events: Mutex<Vec<HeapEvent>>,
}

impl ManagedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, value: HostValue) -> HostRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        HostRef(Arc::new(HostObject { id, value }))
    }

    /// Current pin count of an object
    pub fn pin_count(&self, object: &HostRef) -> usize {
        self.pins.lock().get(&object.id()).copied().unwrap_or(0)
    }

    /// Objects with at least one outstanding pin
    pub fn outstanding_pins(&self) -> usize {
        self.pins.lock().len()
    }

    pub fn events(&self) -> Vec<HeapEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }
}

impl HostRuntime for ManagedHeap {
    fn new_string(&self, value: &str) -> Result<HostRef> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(value.len() + 1)
            .map_err(|e| BinderError::Allocation(format!("host string: {}", e)))?;
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        Ok(self.allocate(HostValue::String(Bytes::from(bytes))))
    }

    fn new_array(&self, array: HostArray) -> Result<HostRef> {
        Ok(self.allocate(HostValue::Array(array)))
    }

    fn new_native_handle(&self, handle: HostNativeHandle) -> Result<HostRef> {
        Ok(self.allocate(HostValue::NativeHandle(handle)))
    }

    fn pin(&self, object: &HostRef) -> Result<Bytes> {
        let view = match object.value() {
            HostValue::String(bytes) => bytes.clone(),
            HostValue::Array(array) => array.data.clone(),
            HostValue::NativeHandle(_) => {
                return Err(BinderError::unsupported(
                    "descriptor bundles are bridged, not pinned",
                ));
            }
        };
        *self.pins.lock().entry(object.id()).or_insert(0) += 1;
        self.events.lock().push(HeapEvent::Pinned(object.id()));
        Ok(view)
    }

    fn unpin(&self, object: &HostRef) {
        let mut pins = self.pins.lock();
        match pins.get_mut(&object.id()) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    pins.remove(&object.id());
                }
                self.events.lock().push(HeapEvent::Unpinned(object.id()));
            }
            None => warn!(object = object.id(), "unpin of an object that is not pinned"),
        }
    }
}
