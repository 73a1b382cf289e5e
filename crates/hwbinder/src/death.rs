//! Death notification bookkeeping
//!
//! Every [`RemoteProxy`](crate::RemoteProxy) a transport hands out for one
//! target shares a [`DeathRecipientList`], looked up through the transport's
//! [`DeathListRegistry`]. A link made through one proxy can therefore be
//! cancelled through any equal one.
//! Linking a recipient creates a [`DeathRecord`] that the transport calls
//! back when the remote process dies.
//!
//! A record starts with a strong reference to the recipient. Once the
//! death notification has fired, the record keeps only a weak one, so the
//! recipient can go away while the record stays findable until it is
//! unlinked.
//!
//! Lock order: list, then record.

use crate::error::Result;
use crate::transport::{DeathNotifier, TargetId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Listener told when a linked remote target dies
pub trait DeathRecipient: Send + Sync {
    fn service_died(&self, cookie: u64, who: TargetId) -> Result<()>;
}

enum RecipientRef {
    Strong(Arc<dyn DeathRecipient>),
    Weak(Weak<dyn DeathRecipient>),
    Cleared,
}

/// A linked recipient and its cookie
pub struct DeathRecord {
    recipient: Mutex<RecipientRef>,
    cookie: u64,
    list: Weak<DeathRecipientList>,
}

fn data_ptr<T: ?Sized>(ptr: *const T) -> *const () {
    ptr as *const ()
}

impl DeathRecord {
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Whether only a weak reference to the recipient remains
    pub fn is_weak(&self) -> bool {
        matches!(*self.recipient.lock(), RecipientRef::Weak(_))
    }

    fn matches(&self, recipient: &Arc<dyn DeathRecipient>) -> bool {
        let wanted = data_ptr(Arc::as_ptr(recipient));
        match &*self.recipient.lock() {
            RecipientRef::Strong(held) => data_ptr(Arc::as_ptr(held)) == wanted,
            RecipientRef::Weak(held) => data_ptr(held.as_ptr()) == wanted,
            RecipientRef::Cleared => false,
        }
    }

    fn demote(&self) {
        let mut recipient = self.recipient.lock();
        if let RecipientRef::Strong(held) = &*recipient {
            *recipient = RecipientRef::Weak(Arc::downgrade(held));
        }
    }

    /// Drop the recipient and leave the list
    pub(crate) fn clear_reference(self: &Arc<Self>) {
        match self.list.upgrade() {
            Some(list) => {
                let mut records = list.records.lock();
                *self.recipient.lock() = RecipientRef::Cleared;
                records.retain(|record| !Arc::ptr_eq(record, self));
            }
            None => *self.recipient.lock() = RecipientRef::Cleared,
        }
    }
}

impl DeathNotifier for DeathRecord {
    fn binder_died(&self, target: TargetId) {
        let recipient = match &*self.recipient.lock() {
            RecipientRef::Strong(held) => Some(held.clone()),
            RecipientRef::Weak(held) => held.upgrade(),
            RecipientRef::Cleared => None,
        };

        if let Some(recipient) = recipient {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                recipient.service_died(self.cookie, target)
            }));
            match outcome {
                Ok(Ok(())) => debug!(%target, cookie = self.cookie, "death notification delivered"),
                Ok(Err(err)) => {
                    error!(%target, cookie = self.cookie, error = %err, "death recipient failed")
                }
                Err(_) => error!(%target, cookie = self.cookie, "death recipient panicked"),
            }
        }

        match self.list.upgrade() {
            Some(list) => {
                let _records = list.records.lock();
                self.demote();
            }
            None => self.demote(),
        }
    }
}

/// Recipients linked through one proxy
#[derive(Default)]
pub struct DeathRecipientList {
    records: Mutex<Vec<Arc<DeathRecord>>>,
}

impl DeathRecipientList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register a record holding `recipient` strongly
    pub fn add(self: &Arc<Self>, recipient: Arc<dyn DeathRecipient>, cookie: u64) -> Arc<DeathRecord> {
        let record = Arc::new(DeathRecord {
            recipient: Mutex::new(RecipientRef::Strong(recipient)),
            cookie,
            list: Arc::downgrade(self),
        });
        self.records.lock().push(record.clone());
        record
    }

    pub fn remove(&self, record: &Arc<DeathRecord>) {
        self.records.lock().retain(|held| !Arc::ptr_eq(held, record));
    }

    /// Most recently added record for `recipient`, strong or weak
    pub fn find(&self, recipient: &Arc<dyn DeathRecipient>) -> Option<Arc<DeathRecord>> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|record| record.matches(recipient))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Per-transport map from target to the death list its proxies share
#[derive(Default)]
pub struct DeathListRegistry {
    lists: Mutex<HashMap<TargetId, Weak<DeathRecipientList>>>,
}

impl DeathListRegistry {
    /// The live list for `target`, created when no proxy holds one
    pub fn list_for(&self, target: TargetId) -> Arc<DeathRecipientList> {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get(&target).and_then(Weak::upgrade) {
            return list;
        }
        lists.retain(|_, list| list.strong_count() > 0);
        let list = DeathRecipientList::new();
        lists.insert(target, Arc::downgrade(&list));
        list
    }

    /// Targets with a live list
    pub fn len(&self) -> usize {
        self.lists
            .lock()
            .values()
            .filter(|list| list.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DeathRecipientList {
    fn drop(&mut self) {
        for record in self.records.get_mut().iter() {
            warn!(cookie = record.cookie, "death recipient still linked at teardown");
        }
    }
}
