//! Binder endpoint: dispatching transactions to handlers
//!
//! The transport hands each incoming transaction to an [`Endpoint`], which
//! wraps the buffers in parcels and calls its [`Handler`]. Per transaction:
//!
//! ```text
//! Received -> one-way: Invoked -> Done
//!          -> two-way: Invoked -> Replied    -> Done
//!                              -> NotReplied -> Rewound, UNKNOWN_ERROR -> Done
//! ```
//!
//! Handler errors and panics stop here: they are logged and reported to
//! the caller as a status, never unwound into the transport thread.

use crate::error::{BinderError, Result};
use crate::host::HostRuntime;
use crate::parcel::Parcel;
use crate::stats::DispatchStats;
use crate::status::Status;
use crate::transport::{IncomingTransaction, TargetId, TransactFlags, TransactionTarget, Transport};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Service logic behind an endpoint
pub trait Handler: Send + Sync {
    /// Handle one call
    ///
    /// `reply` is present for two-way calls only; the handler must call
    /// [`Parcel::send`] on it exactly once.
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel<'_>,
        reply: Option<&mut Parcel<'_>>,
        flags: TransactFlags,
    ) -> Result<()>;
}

/// Dispatcher binding a handler to the transport
pub struct Endpoint {
    handler: Arc<dyn Handler>,
    host: Arc<dyn HostRuntime>,
    stats: Arc<DispatchStats>,
}

impl Endpoint {
    pub fn new(handler: Arc<dyn Handler>, host: Arc<dyn HostRuntime>) -> Self {
        Self {
            handler,
            host,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Register with a transport; the endpoint is reachable from then on
    pub fn register(self: Arc<Self>, transport: &dyn Transport) -> Result<TargetId> {
        let target = transport.register_handler(self)?;
        debug!(%target, "endpoint registered");
        Ok(target)
    }

    fn invoke(
        &self,
        code: u32,
        data: &mut Parcel<'_>,
        reply: Option<&mut Parcel<'_>>,
        flags: TransactFlags,
    ) -> Status {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_transact(code, data, reply, flags)
        }));
        match outcome {
            Ok(Ok(())) => Status::Ok,
            Ok(Err(err)) => {
                DispatchStats::bump(&self.stats.handler_errors);
                error!(code, error = %err, "handler failed");
                handler_status(&err)
            }
            Err(payload) => {
                DispatchStats::bump(&self.stats.handler_errors);
                error!(code, panic = panic_message(payload.as_ref()), "handler panicked");
                Status::UnknownError
            }
        }
    }
}

impl TransactionTarget for Endpoint {
    fn on_transaction(&self, txn: IncomingTransaction<'_>) -> Status {
        let IncomingTransaction {
            code,
            flags,
            data,
            reply,
            transport,
        } = txn;

        DispatchStats::bump(&self.stats.transactions_received);
        DispatchStats::add(&self.stats.bytes_received, data.data_size());
        if flags.is_oneway() {
            DispatchStats::bump(&self.stats.oneway_received);
        }
        debug!(code, oneway = flags.is_oneway(), "dispatching transaction");

        let mut request = Parcel::borrowed(data, self.host.clone()).with_transport(transport.clone());
        let mut response = match reply {
            Some((wire, channel)) if !flags.is_oneway() => {
                let mut parcel = Parcel::borrowed(wire, self.host.clone()).with_transport(transport);
                parcel.set_reply_channel(channel);
                Some(parcel)
            }
            _ => None,
        };

        let mut status = self.invoke(code, &mut request, response.as_mut(), flags);

        if let Some(reply) = response.as_mut() {
            if reply.replied() {
                DispatchStats::bump(&self.stats.replies_sent);
                DispatchStats::add(&self.stats.bytes_sent, reply.data_size().unwrap_or(0));
                if !status.is_ok() {
                    // the caller already holds an OK reply; this status stays local
                    DispatchStats::bump(&self.stats.errors_after_reply);
                    warn!(code, %status, "handler failed after sending its reply");
                }
            } else {
                if status.is_ok() {
                    warn!(code, "two-way transaction returned without a reply");
                    status = Status::UnknownError;
                }
                DispatchStats::bump(&self.stats.unreplied);
                reply.fail_reply(status);
            }
        }

        // The buffers belong to the transport: release what the parcels
        // pinned and let go of the buffers without freeing them.
        request.release_temporary_storage();
        request.detach();
        if let Some(mut reply) = response {
            reply.release_temporary_storage();
            reply.detach();
        }
        status
    }
}

fn handler_status(err: &BinderError) -> Status {
    match err.status() {
        Status::Ok => Status::UnknownError,
        status => status,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
