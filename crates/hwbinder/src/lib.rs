//! hwbinder remote invocation
//!
//! This crate moves HIDL calls between processes: parcels marshal managed
//! values into wire buffers, endpoints dispatch incoming transactions to
//! handlers, and remote proxies send calls and track the death of the
//! process behind them.
//!
//! # Features
//!
//! - [`Parcel`] readers and writers for scalars, strings, vectors,
//!   native handles, blob trees and binder references
//! - Per-call [`Arena`] that pins borrowed managed data until release
//! - [`Endpoint`] dispatch with exactly-once replies and contained
//!   handler failures
//! - [`RemoteProxy`] with death recipients
//! - [`LoopbackDriver`], an in-process transport with thread pools
//!
//! # Example
//!
//! ```no_run
//! use hwbinder::{
//!     BinderConfig, Endpoint, Handler, LoopbackDriver, ManagedHeap, Parcel, RemoteProxy,
//!     Result, TransactFlags, Transport,
//! };
//! use std::sync::Arc;
//!
//! struct Doubler;
//!
//! impl Handler for Doubler {
//!     fn on_transact(
//!         &self,
//!         _code: u32,
//!         data: &mut Parcel<'_>,
//!         reply: Option<&mut Parcel<'_>>,
//!         _flags: TransactFlags,
//!     ) -> Result<()> {
//!         let value = data.read_i32()?;
//!         if let Some(reply) = reply {
//!             reply.write_i32(value * 2)?;
//!             reply.send()?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let driver = LoopbackDriver::new();
//! let heap = Arc::new(ManagedHeap::new());
//!
//! let server = driver.spawn_process(BinderConfig::default().with_max_threads(2));
//! let endpoint = Arc::new(Endpoint::new(Arc::new(Doubler), heap.clone()));
//! let target = endpoint.register(server.as_ref()).unwrap();
//! server.start_threadpool().unwrap();
//!
//! let client = driver.spawn_process(BinderConfig::default());
//! let proxy = RemoteProxy::new(target, client.clone());
//! let mut data = Parcel::new(heap.clone());
//! data.write_i32(21).unwrap();
//! let mut reply = Parcel::new(heap);
//! proxy.transact(1, &data, Some(&mut reply), TransactFlags::NONE).unwrap();
//! assert_eq!(reply.read_i32().unwrap(), 42);
//! ```

pub mod arena;
pub mod config;
pub mod death;
pub mod endpoint;
pub mod error;
pub mod handle_bridge;
pub mod host;
pub mod loopback;
pub mod parcel;
pub mod proxy;
pub mod stats;
pub mod status;
pub mod transport;

pub use arena::{Arena, ArenaSlot, ArrayView, EntryKind, StringView};
pub use config::BinderConfig;
pub use death::{DeathListRegistry, DeathRecipient, DeathRecipientList, DeathRecord};
pub use endpoint::{Endpoint, Handler};
pub use error::{BinderError, Result};
pub use host::{
    HeapEvent, HostArray, HostNativeHandle, HostObject, HostRef, HostRuntime, HostValue,
    ManagedHeap,
};
pub use loopback::{LoopbackDriver, LoopbackProcess};
pub use parcel::Parcel;
pub use proxy::RemoteProxy;
pub use stats::{DispatchStats, DispatchStatsSnapshot};
pub use status::{wire_error_to_caller_error, CallerError, Status};
pub use transport::{
    DeathNotifier, IncomingTransaction, ReplyChannel, TargetId, TransactFlags, TransactReply,
    TransactionTarget, Transport,
};

/// Re-export the wire layer
pub use hidl_wire;
