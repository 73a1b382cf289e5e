//! In-process loopback transport
//!
//! [`LoopbackDriver`] stands in for the kernel driver: it hosts a set of
//! simulated processes and routes transactions between them. Every
//! transaction is encoded by the sender and decoded by the receiving
//! process, so handlers only ever see what crossed the flat wire format.
//!
//! Each [`LoopbackProcess`] has one work queue. Its pool threads, and a
//! caller that joins the pool, take turns pulling work from the queue.
//! A two-way caller blocks until the reply channel fires.
//!
//! Killing a process closes its queue, drops its nodes, and delivers death
//! notifications on a dedicated thread.

use crate::config::BinderConfig;
use crate::death::DeathListRegistry;
use crate::error::{BinderError, Result};
use crate::status::Status;
use crate::transport::{
    same_notifier, DeathNotifier, IncomingTransaction, ReplyChannel, TargetId, TransactFlags,
    TransactReply, TransactionTarget, Transport,
};
use bytes::Bytes;
use hidl_wire::{DecodeLimits, WireBuffer};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// One queued transaction
struct Work {
    node: u32,
    code: u32,
    flags: TransactFlags,
    data: Bytes,
    reply: Option<oneshot::Sender<TransactReply>>,
}

/// Driver-side state of a process
struct ProcessState {
    pid: u32,
    alive: AtomicBool,
    nodes: RwLock<HashMap<u32, Arc<dyn TransactionTarget>>>,
    next_node: AtomicU32,
    sender: Mutex<Option<mpsc::UnboundedSender<Work>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Work>>,
}

impl ProcessState {
    fn new(pid: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pid,
            alive: AtomicBool::new(true),
            nodes: RwLock::new(HashMap::new()),
            next_node: AtomicU32::new(1),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(rx),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn enqueue(&self, work: Work) -> Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => tx
                .send(work)
                .map_err(|_| BinderError::Status(Status::DeadObject)),
            None => Err(BinderError::Status(Status::DeadObject)),
        }
    }

    /// Stop accepting work and fail whatever is still queued
    fn close(&self) {
        self.sender.lock().take();
        // A worker parked in the queue drains it itself.
        if let Some(mut rx) = self.receiver.try_lock() {
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!(pid = self.pid, dropped, "dropped queued transactions");
            }
        }
    }
}

struct DeathLink {
    target: TargetId,
    watcher: u32,
    notifier: Arc<dyn DeathNotifier>,
}

struct DriverInner {
    processes: RwLock<HashMap<u32, Arc<ProcessState>>>,
    /// Also serializes link/unlink against process death
    links: Mutex<Vec<DeathLink>>,
    next_pid: AtomicU32,
}

impl DriverInner {
    fn process(&self, pid: u32) -> Result<Arc<ProcessState>> {
        self.processes
            .read()
            .get(&pid)
            .cloned()
            .ok_or(BinderError::Status(Status::NameNotFound))
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let state = self.process(pid)?;
        let fired: Vec<DeathLink> = {
            let mut links = self.links.lock();
            if !state.alive.swap(false, Ordering::SeqCst) {
                debug!(pid, "process already dead");
                return Ok(());
            }
            let (fired, kept): (Vec<_>, Vec<_>) = links
                .drain(..)
                .filter(|link| link.watcher != pid)
                .partition(|link| link.target.process == pid);
            *links = kept;
            fired
        };

        state.close();
        state.nodes.write().clear();
        info!(pid, notifications = fired.len(), "process died");

        if !fired.is_empty() {
            thread::Builder::new()
                .name(format!("hwbinder-death:{}", pid))
                .spawn(move || {
                    for link in fired {
                        link.notifier.binder_died(link.target);
                    }
                })
                .map_err(|err| {
                    BinderError::Allocation(format!("death notification thread: {}", err))
                })?;
        }
        Ok(())
    }
}

/// In-process stand-in for the binder driver
#[derive(Clone)]
pub struct LoopbackDriver {
    inner: Arc<DriverInner>,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DriverInner {
                processes: RwLock::new(HashMap::new()),
                links: Mutex::new(Vec::new()),
                next_pid: AtomicU32::new(1),
            }),
        }
    }

    /// Start a new simulated process
    pub fn spawn_process(&self, config: BinderConfig) -> Arc<LoopbackProcess> {
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(ProcessState::new(pid));
        self.inner.processes.write().insert(pid, state.clone());
        debug!(pid, max_threads = config.max_threads, "process started");

        Arc::new_cyclic(|me| LoopbackProcess {
            state,
            driver: self.inner.clone(),
            config: Mutex::new(config),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            death_lists: DeathListRegistry::default(),
            me: me.clone(),
        })
    }

    /// Kill a process: its nodes go away, calls into it fail with
    /// `DEAD_OBJECT` and linked death recipients are notified
    pub fn kill(&self, pid: u32) -> Result<()> {
        self.inner.kill(pid)
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.inner
            .process(pid)
            .map(|state| state.is_alive())
            .unwrap_or(false)
    }

    /// Number of death links currently registered
    pub fn death_link_count(&self) -> usize {
        self.inner.links.lock().len()
    }
}

/// One simulated process and its thread pool
pub struct LoopbackProcess {
    state: Arc<ProcessState>,
    driver: Arc<DriverInner>,
    config: Mutex<BinderConfig>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    death_lists: DeathListRegistry,
    me: Weak<LoopbackProcess>,
}

impl LoopbackProcess {
    pub fn pid(&self) -> u32 {
        self.state.pid
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn config(&self) -> BinderConfig {
        self.config.lock().clone()
    }

    /// Handle one queued transaction on the calling thread, if any
    pub fn poll_once(&self) -> bool {
        let work = match self.state.receiver.try_lock() {
            Some(mut rx) => rx.try_recv().ok(),
            None => None,
        };
        match (work, self.me.upgrade()) {
            (Some(work), Some(process)) => {
                process.dispatch(work);
                true
            }
            _ => false,
        }
    }

    /// Stop serving: close the queue and wait for the pool threads
    pub fn shutdown(&self) {
        self.state.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(pid = self.pid(), "worker thread panicked");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, work: Work) {
        let Work {
            node,
            code,
            flags,
            data,
            reply,
        } = work;
        let pid = self.pid();

        if !self.is_alive() {
            // dropping the reply sender fails the caller with DEAD_OBJECT
            trace!(pid, node, "dropping transaction for dead process");
            return;
        }

        let target = self.state.nodes.read().get(&node).cloned();
        let Some(target) = target else {
            warn!(pid, node, code, "transaction for unknown node");
            if let Some(tx) = reply {
                let _ = tx.send(TransactReply::empty(Status::NameNotFound));
            }
            return;
        };

        let mut wire = match WireBuffer::decode(data, &self.decode_limits()) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(pid, node, code, error = %err, "rejected malformed transaction");
                if let Some(tx) = reply {
                    let _ = tx.send(TransactReply::empty(Status::BadValue));
                }
                return;
            }
        };
        mark_local_binders(&mut wire, pid);

        let channel: Option<ReplyChannel> = match reply {
            Some(tx) if !flags.is_oneway() => {
                Some(Box::new(move |status: Status, wire: &WireBuffer| {
                    let reply = if status.is_ok() {
                        match wire.encode() {
                            Ok(data) => TransactReply { status, data },
                            Err(err) => {
                                warn!(error = %err, "reply does not encode");
                                TransactReply::empty(Status::FailedTransaction)
                            }
                        }
                    } else {
                        TransactReply::empty(status)
                    };
                    match tx.send(reply) {
                        Ok(()) => Status::Ok,
                        Err(_) => Status::DeadObject,
                    }
                }))
            }
            _ => None,
        };

        let mut reply_wire = WireBuffer::new();
        let reply = match channel {
            Some(channel) => Some((&mut reply_wire, channel)),
            None => None,
        };
        let transport: Arc<dyn Transport> = self.clone();
        let status = target.on_transaction(IncomingTransaction {
            code,
            flags,
            data: &mut wire,
            reply,
            transport,
        });
        trace!(pid, node, code, %status, "transaction done");
    }

    fn receive_reply(&self, reply: TransactReply) -> Result<TransactReply> {
        if reply.data.is_empty() {
            return Ok(reply);
        }
        let mut wire = WireBuffer::decode(reply.data.clone(), &self.decode_limits())?;
        if mark_local_binders(&mut wire, self.pid()) {
            Ok(TransactReply {
                status: reply.status,
                data: wire.encode()?,
            })
        } else {
            Ok(reply)
        }
    }
}

/// Flag references that point back into `pid`; returns whether any changed
fn mark_local_binders(wire: &mut WireBuffer, pid: u32) -> bool {
    let mut changed = false;
    for binder in wire.binders_mut() {
        let local = TargetId::from_u64(binder.target).process == pid;
        if binder.local != local {
            binder.local = local;
            changed = true;
        }
    }
    changed
}

fn serve(state: &ProcessState, me: &Weak<LoopbackProcess>) {
    debug!(pid = state.pid, "worker started");
    loop {
        let work = state.receiver.lock().blocking_recv();
        let Some(work) = work else { break };
        let Some(process) = me.upgrade() else { break };
        process.dispatch(work);
    }
    debug!(pid = state.pid, "worker stopped");
}

impl Transport for LoopbackProcess {
    fn process_id(&self) -> u32 {
        self.pid()
    }

    fn register_handler(&self, target: Arc<dyn TransactionTarget>) -> Result<TargetId> {
        if !self.is_alive() {
            return Err(BinderError::Status(Status::DeadObject));
        }
        let node = self.state.next_node.fetch_add(1, Ordering::SeqCst);
        self.state.nodes.write().insert(node, target);
        Ok(TargetId::new(self.pid(), node))
    }

    fn transact(
        &self,
        target: TargetId,
        code: u32,
        data: Bytes,
        flags: TransactFlags,
    ) -> Result<TransactReply> {
        let state = self.driver.process(target.process)?;
        if !state.is_alive() {
            return Err(BinderError::Status(Status::DeadObject));
        }
        trace!(from = self.pid(), %target, code, size = data.len(), "queueing transaction");

        if flags.is_oneway() {
            state.enqueue(Work {
                node: target.node,
                code,
                flags,
                data,
                reply: None,
            })?;
            return Ok(TransactReply::empty(Status::Ok));
        }

        let (tx, rx) = oneshot::channel();
        state.enqueue(Work {
            node: target.node,
            code,
            flags,
            data,
            reply: Some(tx),
        })?;
        match rx.blocking_recv() {
            Ok(reply) => self.receive_reply(reply),
            Err(_) if state.is_alive() => Ok(TransactReply::empty(Status::UnknownError)),
            Err(_) => Err(BinderError::Status(Status::DeadObject)),
        }
    }

    fn link_death(&self, target: TargetId, notifier: Arc<dyn DeathNotifier>) -> Result<()> {
        if self.is_local(target) {
            return Err(BinderError::unsupported("cannot link to death of a local target"));
        }
        let state = self.driver.process(target.process)?;
        let mut links = self.driver.links.lock();
        if !state.is_alive() {
            return Err(BinderError::Status(Status::DeadObject));
        }
        links.push(DeathLink {
            target,
            watcher: self.pid(),
            notifier,
        });
        debug!(watcher = self.pid(), %target, "death link registered");
        Ok(())
    }

    fn unlink_death(&self, target: TargetId, notifier: &Arc<dyn DeathNotifier>) -> Result<()> {
        let state = self.driver.process(target.process)?;
        let mut links = self.driver.links.lock();
        let position = links.iter().rposition(|link| {
            link.target == target
                && link.watcher == self.pid()
                && same_notifier(&link.notifier, notifier)
        });
        match position {
            Some(index) => {
                links.remove(index);
                Ok(())
            }
            None if !state.is_alive() => Err(BinderError::Status(Status::DeadObject)),
            None => Err(BinderError::Status(Status::NameNotFound)),
        }
    }

    fn configure_threadpool(&self, max_threads: usize, caller_joins: bool) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(BinderError::unsupported(
                "thread pool is already running",
            ));
        }
        let mut config = self.config.lock();
        config.max_threads = max_threads;
        config.caller_joins = caller_joins;
        Ok(())
    }

    fn start_threadpool(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(pid = self.pid(), "thread pool already started");
            return Ok(());
        }
        let threads = self.config.lock().spawned_threads();
        let mut workers = self.workers.lock();
        for index in 0..threads {
            let state = self.state.clone();
            let me = self.me.clone();
            let worker = thread::Builder::new()
                .name(format!("hwbinder:{}_{}", self.pid(), index))
                .spawn(move || serve(&state, &me))
                .map_err(|err| BinderError::Allocation(format!("worker thread: {}", err)))?;
            workers.push(worker);
        }
        info!(pid = self.pid(), threads, "thread pool started");
        Ok(())
    }

    fn join_threadpool(&self) {
        serve(&self.state, &self.me);
    }

    fn death_lists(&self) -> &DeathListRegistry {
        &self.death_lists
    }

    fn decode_limits(&self) -> DecodeLimits {
        self.config.lock().decode_limits()
    }
}

impl Drop for LoopbackProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            if let Err(err) = self.driver.kill(self.pid()) {
                warn!(pid = self.pid(), error = %err, "process teardown failed");
            }
        }
        self.shutdown();
    }
}
