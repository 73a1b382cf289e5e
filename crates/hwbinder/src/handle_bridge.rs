//! Descriptor bundle bridge
//!
//! Converts between the host's [`HostNativeHandle`] and the wire's
//! [`NativeHandle`]. Only the (descriptor, integer) tables are copied.
//! Descriptors are never duplicated and never closed here.

use crate::arena::Arena;
use crate::error::{BinderError, Result};
use crate::host::{HostNativeHandle, HostRef, HostRuntime};
use hidl_wire::NativeHandle;
use std::sync::Arc;

/// Copy a native bundle into a new host object
pub fn to_bridged(native: &NativeHandle, host: &dyn HostRuntime) -> Result<HostRef> {
    let mut fds = Vec::new();
    let mut ints = Vec::new();
    fds.try_reserve_exact(native.num_fds())
        .and_then(|_| ints.try_reserve_exact(native.num_ints()))
        .map_err(|e| BinderError::Allocation(format!("host descriptor table: {}", e)))?;
    fds.extend_from_slice(native.fds());
    ints.extend_from_slice(native.ints());
    host.new_native_handle(HostNativeHandle { fds, ints })
}

/// Build a native bundle from a host object
///
/// With an arena the bundle is registered there and released with it;
/// without one the caller owns the table. Counts beyond the bundle limits
/// or a non-handle object are malformed input; a refused table allocation
/// is reported as [`BinderError::Allocation`].
pub fn from_bridged(portable: &HostRef, arena: Option<&mut Arena>) -> Result<Arc<NativeHandle>> {
    let source = portable
        .as_native_handle()
        .ok_or_else(|| BinderError::protocol("host object is not a descriptor bundle"))?;

    let mut bundle = NativeHandle::with_capacity(source.fds.len(), source.ints.len())?;
    for fd in &source.fds {
        bundle.push_fd(*fd)?;
    }
    for value in &source.ints {
        bundle.push_int(*value)?;
    }

    match arena {
        Some(arena) => arena.hold_bridged_handle(portable, bundle),
        None => Ok(Arc::new(bundle)),
    }
}
