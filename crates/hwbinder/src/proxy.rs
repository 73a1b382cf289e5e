//! Remote proxies
//!
//! A [`RemoteProxy`] forwards transactions to a target in another process
//! and manages the death recipients linked through it. Proxies compare and
//! hash by target identity, so two proxies for the same remote object are
//! equal; on one transport they also share their death recipients.

use crate::death::{DeathRecipient, DeathRecipientList};
use crate::error::{BinderError, Result};
use crate::parcel::Parcel;
use crate::status::Status;
use crate::transport::{DeathNotifier, TargetId, TransactFlags, Transport};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client-side handle to a remote target
#[derive(Clone)]
pub struct RemoteProxy {
    target: TargetId,
    transport: Arc<dyn Transport>,
    deaths: Arc<DeathRecipientList>,
}

impl RemoteProxy {
    pub fn new(target: TargetId, transport: Arc<dyn Transport>) -> Self {
        let deaths = transport.death_lists().list_for(target);
        Self {
            target,
            transport,
            deaths,
        }
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn death_recipients(&self) -> &Arc<DeathRecipientList> {
        &self.deaths
    }

    /// Send `data` to the target
    ///
    /// For two-way calls the reply, if any, lands in `reply`, and a
    /// non-OK status from the target is returned as
    /// [`BinderError::Status`]. One-way calls return once queued.
    pub fn transact(
        &self,
        code: u32,
        data: &Parcel<'_>,
        reply: Option<&mut Parcel<'_>>,
        flags: TransactFlags,
    ) -> Result<()> {
        let bytes = data.encode()?;
        debug!(
            target = %self.target,
            code,
            size = bytes.len(),
            oneway = flags.is_oneway(),
            "transact"
        );
        let response = self.transport.transact(self.target, code, bytes, flags)?;
        if flags.is_oneway() {
            return Ok(());
        }

        if let Some(reply) = reply {
            if response.data.is_empty() {
                reply.rewind()?;
            } else {
                reply.set_encoded(response.data, &self.transport.decode_limits())?;
            }
            reply.set_transport(self.transport.clone());
        }

        if response.status.is_ok() {
            Ok(())
        } else {
            Err(BinderError::Status(response.status))
        }
    }

    /// Ask for `recipient` to be told when the target dies
    ///
    /// Local targets never die remotely, so linking them succeeds without
    /// doing anything. Returns false when the transport refuses the link;
    /// the record is gone again by then.
    pub fn link_death(&self, recipient: Arc<dyn DeathRecipient>, cookie: u64) -> bool {
        if self.transport.is_local(self.target) {
            return true;
        }
        let record = self.deaths.add(recipient, cookie);
        let notifier: Arc<dyn DeathNotifier> = record.clone();
        match self.transport.link_death(self.target, notifier) {
            Ok(()) => true,
            Err(err) => {
                warn!(target = %self.target, error = %err, "link_death refused");
                record.clear_reference();
                false
            }
        }
    }

    /// Cancel the newest link for `recipient`
    ///
    /// A target that already died counts as unlinked. Returns
    /// [`BinderError::NotFound`] when no such link exists.
    pub fn unlink_death(&self, recipient: &Arc<dyn DeathRecipient>) -> Result<()> {
        let record = self.deaths.find(recipient).ok_or_else(|| {
            BinderError::NotFound(format!("no death link to {}", self.target))
        })?;
        let notifier: Arc<dyn DeathNotifier> = record.clone();
        match self.transport.unlink_death(self.target, &notifier) {
            Ok(()) | Err(BinderError::Status(Status::DeadObject)) => {
                record.clear_reference();
                Ok(())
            }
            Err(err) => {
                warn!(target = %self.target, error = %err, "unlink_death failed");
                Err(BinderError::NotFound(format!(
                    "death link to {} does not exist",
                    self.target
                )))
            }
        }
    }
}

impl PartialEq for RemoteProxy {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
    }
}

impl Eq for RemoteProxy {}

impl Hash for RemoteProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("target", &self.target)
            .field("death_recipients", &self.deaths.len())
            .finish()
    }
}
