//! Common utilities for integration tests
//!
//! Spins up a service process and a client process on one loopback driver,
//! plus the handlers and counters the scenarios share.

#![allow(dead_code)]

use hwbinder::{
    BinderConfig, BinderError, Endpoint, Handler, LoopbackDriver, LoopbackProcess, ManagedHeap,
    Parcel, RemoteProxy, Result, TargetId, TransactFlags, Transport,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const ECHO_DESCRIPTOR: &str = "test.echo@1.0::IEcho";

/// Echo the request string back
pub const OP_ECHO: u32 = 1;
/// Return without replying
pub const OP_SILENT: u32 = 2;
/// Fail with a handler error
pub const OP_FAIL: u32 = 3;
/// Reply twice; the second send reports back through the next reply
pub const OP_DOUBLE_SEND: u32 = 4;

/// Initialize logging for tests; repeated calls are harmless
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` passes
///
/// Server-side bookkeeping finishes after the reply reaches the caller, so
/// counters are read through this.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Driver, heap and one registered service
pub struct TestService {
    pub driver: LoopbackDriver,
    pub heap: Arc<ManagedHeap>,
    pub server: Arc<LoopbackProcess>,
    pub client: Arc<LoopbackProcess>,
    pub endpoint: Arc<Endpoint>,
    pub target: TargetId,
}

impl TestService {
    /// Register `handler` in a fresh server process with `threads` workers
    pub fn start(handler: Arc<dyn Handler>, threads: usize) -> Self {
        let driver = LoopbackDriver::new();
        let heap = Arc::new(ManagedHeap::new());
        let server = driver.spawn_process(BinderConfig::default().with_max_threads(threads));
        let endpoint = Arc::new(Endpoint::new(handler, heap.clone()));
        let target = endpoint.clone().register(server.as_ref()).unwrap();
        server.start_threadpool().unwrap();
        let client = driver.spawn_process(BinderConfig::default());
        Self {
            driver,
            heap,
            server,
            client,
            endpoint,
            target,
        }
    }

    pub fn proxy(&self) -> RemoteProxy {
        RemoteProxy::new(self.target, self.client.clone())
    }

    pub fn parcel(&self) -> Parcel<'static> {
        Parcel::new(self.heap.clone())
    }

    /// Two-way call carrying the interface token and one string
    pub fn call_str(&self, proxy: &RemoteProxy, code: u32, text: &str) -> Result<Parcel<'static>> {
        let mut data = self.parcel();
        data.write_interface_token(ECHO_DESCRIPTOR)?;
        data.write_str(text)?;
        let mut reply = self.parcel();
        proxy.transact(code, &data, Some(&mut reply), TransactFlags::NONE)?;
        Ok(reply)
    }
}

struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(u32, &mut Parcel<'_>, Option<&mut Parcel<'_>>) -> Result<()> + Send + Sync,
{
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel<'_>,
        reply: Option<&mut Parcel<'_>>,
        _flags: TransactFlags,
    ) -> Result<()> {
        (self.0)(code, data, reply)
    }
}

/// Handler built from a closure
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(u32, &mut Parcel<'_>, Option<&mut Parcel<'_>>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Take the reply parcel of a two-way call
pub fn expect_reply<'r, 'p>(reply: Option<&'r mut Parcel<'p>>) -> Result<&'r mut Parcel<'p>> {
    reply.ok_or_else(|| BinderError::handler("two-way call expected"))
}

/// Echo service with optional per-call delay
#[derive(Default)]
pub struct EchoHandler {
    pub delay: Option<Duration>,
    pub calls: AtomicU64,
    /// Outcome of the second `send()` in [`OP_DOUBLE_SEND`]
    pub second_send: Mutex<Option<String>>,
}

impl EchoHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

impl Handler for EchoHandler {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel<'_>,
        reply: Option<&mut Parcel<'_>>,
        _flags: TransactFlags,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        data.enforce_interface(ECHO_DESCRIPTOR)?;
        let text = data.read_string()?;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let Some(reply) = reply else {
            return Ok(());
        };
        match code {
            OP_ECHO => {
                reply.write_str(&text)?;
                reply.send()
            }
            OP_SILENT => Ok(()),
            OP_FAIL => Err(BinderError::handler(format!("refusing {}", text))),
            OP_DOUBLE_SEND => {
                reply.write_str(&text)?;
                reply.send()?;
                let second = reply.send();
                *self.second_send.lock() = second.err().map(|err| err.to_string());
                Ok(())
            }
            other => Err(BinderError::handler(format!("unknown code {}", other))),
        }
    }
}

/// Thread-safe statistics collector
#[derive(Default)]
pub struct ConcurrentStats {
    success: AtomicU64,
    failure: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        let us = latency.as_micros() as u64;
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let count = self.success_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / count)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed))
    }
}
