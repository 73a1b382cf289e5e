//! Transport contract
//!
//! The transport moves encoded wire buffers between processes and owns the
//! worker threads that deliver them. It is consumed through [`Transport`];
//! [`crate::loopback`] provides an in-process implementation.

use crate::death::DeathListRegistry;
use crate::error::Result;
use crate::status::Status;
use bytes::Bytes;
use hidl_wire::{DecodeLimits, WireBuffer};
use std::fmt;
use std::sync::Arc;

/// Transaction flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TransactFlags(pub u32);

impl TransactFlags {
    /// Bit 0: no reply expected or allowed
    pub const ONEWAY: TransactFlags = TransactFlags(0x1);
    pub const NONE: TransactFlags = TransactFlags(0);

    pub fn is_oneway(self) -> bool {
        self.0 & Self::ONEWAY.0 != 0
    }
}

/// Identity of a transaction target: the hosting process and a node in it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId {
    pub process: u32,
    pub node: u32,
}

impl TargetId {
    pub fn new(process: u32, node: u32) -> Self {
        Self { process, node }
    }

    pub fn as_u64(self) -> u64 {
        ((self.process as u64) << 32) | self.node as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            process: (raw >> 32) as u32,
            node: raw as u32,
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process, self.node)
    }
}

/// Outcome of a transaction as seen by the caller
#[derive(Clone, Debug)]
pub struct TransactReply {
    pub status: Status,
    /// Encoded reply; empty for one-way calls and failed transactions
    pub data: Bytes,
}

impl TransactReply {
    pub fn empty(status: Status) -> Self {
        Self {
            status,
            data: Bytes::new(),
        }
    }
}

/// One-shot callback that ships a reply to the caller
///
/// Receives the status to report and the reply contents; returns the
/// transport status of the delivery.
pub type ReplyChannel = Box<dyn FnOnce(Status, &WireBuffer) -> Status + Send>;

/// A transaction handed to a target by a transport worker
pub struct IncomingTransaction<'a> {
    pub code: u32,
    pub flags: TransactFlags,
    pub data: &'a mut WireBuffer,
    /// Present for two-way calls only
    pub reply: Option<(&'a mut WireBuffer, ReplyChannel)>,
    /// Transport the transaction arrived on
    pub transport: Arc<dyn Transport>,
}

/// Something the transport can deliver transactions to
pub trait TransactionTarget: Send + Sync {
    /// Handle one transaction; the returned status is for bookkeeping only,
    /// replies go through the reply channel
    fn on_transaction(&self, txn: IncomingTransaction<'_>) -> Status;
}

/// Receiver of death notifications for a remote target
pub trait DeathNotifier: Send + Sync {
    fn binder_died(&self, target: TargetId);
}

/// Point-to-point transaction transport
pub trait Transport: Send + Sync {
    /// Identity of the process this transport serves
    fn process_id(&self) -> u32;

    /// Make a target reachable; returns its identity
    fn register_handler(&self, target: Arc<dyn TransactionTarget>) -> Result<TargetId>;

    /// Send an encoded transaction
    ///
    /// Blocks until the reply arrives for two-way calls and returns once
    /// the transaction is queued for one-way calls. Transport failures are
    /// errors; a status reported by the target is in the reply.
    fn transact(
        &self,
        target: TargetId,
        code: u32,
        data: Bytes,
        flags: TransactFlags,
    ) -> Result<TransactReply>;

    /// Ask to be told when `target`'s process dies
    fn link_death(&self, target: TargetId, notifier: Arc<dyn DeathNotifier>) -> Result<()>;

    /// Cancel a previous [`Transport::link_death`]
    fn unlink_death(&self, target: TargetId, notifier: &Arc<dyn DeathNotifier>) -> Result<()>;

    fn configure_threadpool(&self, max_threads: usize, caller_joins: bool) -> Result<()>;

    fn start_threadpool(&self) -> Result<()>;

    /// Serve transactions on the calling thread until shutdown
    fn join_threadpool(&self);

    /// Limits for decoding received buffers
    fn decode_limits(&self) -> DecodeLimits;

    /// Death lists shared by this transport's proxies
    fn death_lists(&self) -> &DeathListRegistry;

    fn is_local(&self, target: TargetId) -> bool {
        target.process == self.process_id()
    }
}

/// Compare notifiers by identity
pub(crate) fn same_notifier(a: &Arc<dyn DeathNotifier>, b: &Arc<dyn DeathNotifier>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
