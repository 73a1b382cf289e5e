//! hwbinder Echo Service Example
//!
//! Runs a server and a client as two processes on the loopback driver and
//! exercises three operations:
//!
//! ```text
//! code 0  NULL     two-way, empty reply
//! code 1  ECHO     string in, same string out
//! code 2  REVERSE  vec<u8> in, reversed vec<u8> out
//! ```
//!
//! Every request starts with the interface token, which the server checks
//! before reading arguments.
//!
//! Usage:
//!   cargo run -p hwbinder-echo-service -- --threads 4 --calls 100

use clap::Parser;
use hwbinder::{
    BinderConfig, BinderError, DeathRecipient, Endpoint, Handler, LoopbackDriver, ManagedHeap,
    Parcel, RemoteProxy, Result, TargetId, TransactFlags, Transport,
};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const ECHO_DESCRIPTOR: &str = "demo.echo@1.0::IEcho";

const OP_NULL: u32 = 0;
const OP_ECHO: u32 = 1;
const OP_REVERSE: u32 = 2;

#[derive(Parser)]
#[command(name = "hwbinder-echo-service")]
#[command(about = "Echo service over the loopback hwbinder transport")]
struct Args {
    /// Server thread pool size
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Concurrent echo calls to issue
    #[arg(short, long, default_value = "32")]
    calls: usize,

    /// Bytes in each REVERSE payload
    #[arg(short, long, default_value = "256")]
    payload: usize,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

struct EchoService;

impl Handler for EchoService {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel<'_>,
        reply: Option<&mut Parcel<'_>>,
        _flags: TransactFlags,
    ) -> Result<()> {
        data.enforce_interface(ECHO_DESCRIPTOR)?;
        let reply = reply.ok_or_else(|| BinderError::handler("echo calls are two-way"))?;
        match code {
            OP_NULL => {}
            OP_ECHO => {
                let text = data.read_string()?;
                info!("ECHO called with {} bytes", text.len());
                reply.write_str(&text)?;
            }
            OP_REVERSE => {
                let mut bytes = data.read_vector::<u8>()?;
                info!("REVERSE called with {} bytes", bytes.len());
                bytes.reverse();
                reply.write_slice(&bytes)?;
            }
            other => return Err(BinderError::handler(format!("unknown code {}", other))),
        }
        reply.send()
    }
}

struct ShutdownLogger;

impl DeathRecipient for ShutdownLogger {
    fn service_died(&self, cookie: u64, who: TargetId) -> Result<()> {
        info!(cookie, %who, "echo service went away");
        Ok(())
    }
}

fn call(
    proxy: &RemoteProxy,
    heap: &Arc<ManagedHeap>,
    code: u32,
    fill: impl FnOnce(&mut Parcel<'_>) -> Result<()>,
) -> Result<Parcel<'static>> {
    let mut data = Parcel::new(heap.clone());
    data.write_interface_token(ECHO_DESCRIPTOR)?;
    fill(&mut data)?;
    let mut reply = Parcel::new(heap.clone());
    proxy.transact(code, &data, Some(&mut reply), TransactFlags::NONE)?;
    Ok(reply)
}

fn run_client(proxy: &RemoteProxy, heap: &Arc<ManagedHeap>, args: &Args) -> Result<()> {
    info!("Test 1: NULL");
    call(proxy, heap, OP_NULL, |_| Ok(()))?;

    info!("Test 2: ECHO 'Hello, hwbinder!'");
    let mut reply = call(proxy, heap, OP_ECHO, |data| data.write_str("Hello, hwbinder!"))?;
    let echoed = reply.read_string()?;
    assert_eq!(echoed, "Hello, hwbinder!");

    info!("Test 3: REVERSE {} bytes", args.payload);
    let payload: Vec<u8> = (0..args.payload).map(|i| i as u8).collect();
    let mut reply = call(proxy, heap, OP_REVERSE, |data| data.write_slice(&payload))?;
    let reversed = reply.read_vector::<u8>()?;
    assert!(reversed.iter().eq(payload.iter().rev()));

    info!("Test 4: {} concurrent ECHO calls", args.calls);
    let start = Instant::now();
    let workers: Vec<_> = (0..args.calls)
        .map(|id| {
            let proxy = proxy.clone();
            let heap = heap.clone();
            thread::spawn(move || -> Result<bool> {
                let text = format!("request_{}", id);
                let mut reply = call(&proxy, &heap, OP_ECHO, |data| data.write_str(&text))?;
                Ok(reply.read_string()? == text)
            })
        })
        .collect();
    let mut matched = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(true)) => matched += 1,
            Ok(Ok(false)) => warn!("echo mismatch"),
            Ok(Err(err)) => warn!(error = %err, "echo failed"),
            Err(_) => warn!("client thread panicked"),
        }
    }
    info!("{}/{} echoes matched in {:?}", matched, args.calls, start.elapsed());
    if matched != args.calls {
        return Err(BinderError::handler("some echoes did not match"));
    }
    Ok(())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let driver = LoopbackDriver::new();
    let heap = Arc::new(ManagedHeap::new());

    let server = driver.spawn_process(BinderConfig::default());
    server.configure_threadpool(args.threads, false)?;
    let endpoint = Arc::new(Endpoint::new(Arc::new(EchoService), heap.clone()));
    let stats = endpoint.stats().clone();
    let target = endpoint.register(server.as_ref())?;
    server.start_threadpool()?;
    info!(%target, threads = args.threads, "echo service registered");

    let client = driver.spawn_process(BinderConfig::default());
    let proxy = RemoteProxy::new(target, client.clone());
    let logger: Arc<dyn DeathRecipient> = Arc::new(ShutdownLogger);
    proxy.link_death(logger.clone(), 1);

    run_client(&proxy, &heap, &args)?;

    let snapshot = stats.snapshot();
    info!(
        transactions = snapshot.transactions_received,
        replies = snapshot.replies_sent,
        bytes_in = snapshot.bytes_received,
        bytes_out = snapshot.bytes_sent,
        "server statistics"
    );

    driver.kill(server.pid())?;
    server.shutdown();
    // the notification runs on its own thread; unlink whether or not it has
    if let Err(err) = proxy.unlink_death(&logger) {
        warn!(error = %err, "unlink after shutdown");
    }
    assert_eq!(heap.outstanding_pins(), 0);
    info!("All tests passed!");
    Ok(())
}
