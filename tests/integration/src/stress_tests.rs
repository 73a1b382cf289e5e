//! Stress Tests - Concurrent Transactions on a Fixed Pool
//!
//! These tests push many simultaneous two-way calls through small worker
//! pools and check that:
//! - Every call gets exactly its own reply
//! - No reply carries another transaction's data
//! - Pinned host memory is all released afterwards

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Barrier;

use common::*;

/// Test: 100 simultaneous calls on a 4-thread pool against a handler that
/// sleeps before its single send
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_replies_do_not_bleed() {
    init_logging();

    const NUM_CALLS: usize = 100;

    let handler = Arc::new(EchoHandler::with_delay(Duration::from_millis(20)));
    let service = Arc::new(TestService::start(handler.clone(), 4));
    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(NUM_CALLS));

    let mut calls = Vec::with_capacity(NUM_CALLS);
    for call_id in 0..NUM_CALLS {
        let service = service.clone();
        let stats = stats.clone();
        let barrier = barrier.clone();

        calls.push(tokio::spawn(async move {
            // Wait for every caller to be ready
            barrier.wait().await;

            let outcome = tokio::task::spawn_blocking(move || {
                let payload = format!("call_{}_{}", call_id, "x".repeat(call_id % 17));
                let start = Instant::now();
                let proxy = service.proxy();
                let result = service
                    .call_str(&proxy, OP_ECHO, &payload)
                    .and_then(|mut reply| reply.read_string());
                match result {
                    Ok(echoed) if echoed == payload => stats.record_success(start.elapsed()),
                    Ok(echoed) => {
                        eprintln!("call {} got {:?}, expected {:?}", call_id, echoed, payload);
                        stats.record_failure();
                    }
                    Err(e) => {
                        eprintln!("call {} failed: {}", call_id, e);
                        stats.record_failure();
                    }
                }
            })
            .await;
            assert!(outcome.is_ok(), "call {} panicked", call_id);
        }));
    }

    for result in join_all(calls).await {
        result.unwrap();
    }

    println!("\n=== Concurrent Reply Test Results ===");
    println!("Successful: {}", stats.success_count());
    println!("Failed: {}", stats.failure_count());
    println!("Avg latency: {:?}", stats.avg_latency());
    println!("Max latency: {:?}", stats.max_latency());

    assert_eq!(stats.success_count(), NUM_CALLS as u64);
    assert_eq!(stats.failure_count(), 0);

    let endpoint_stats = service.endpoint.stats().clone();
    assert!(wait_until(Duration::from_secs(5), || {
        endpoint_stats.snapshot().replies_sent == NUM_CALLS as u64
    }));
    let snapshot = endpoint_stats.snapshot();
    assert_eq!(snapshot.transactions_received, NUM_CALLS as u64);
    assert_eq!(snapshot.unreplied, 0);
    assert!(wait_until(Duration::from_secs(5), || {
        service.heap.outstanding_pins() == 0
    }));
}

/// Test: several clients in different processes share one service
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_client_processes() {
    init_logging();

    const NUM_CLIENTS: usize = 8;
    const REQUESTS_PER_CLIENT: usize = 25;

    let service = Arc::new(TestService::start(Arc::new(EchoHandler::default()), 2));
    let stats = Arc::new(ConcurrentStats::new());

    let mut clients = Vec::new();
    for client_id in 0..NUM_CLIENTS {
        let service = service.clone();
        let stats = stats.clone();
        clients.push(tokio::task::spawn_blocking(move || {
            let process = service.driver.spawn_process(hwbinder::BinderConfig::default());
            let proxy = hwbinder::RemoteProxy::new(service.target, process.clone());
            for req_id in 0..REQUESTS_PER_CLIENT {
                let payload = format!("client_{}_request_{}", client_id, req_id);
                let start = Instant::now();
                match service
                    .call_str(&proxy, OP_ECHO, &payload)
                    .and_then(|mut reply| reply.read_string())
                {
                    Ok(echoed) if echoed == payload => stats.record_success(start.elapsed()),
                    _ => stats.record_failure(),
                }
            }
        }));
    }
    join_all(clients).await;

    let total_expected = (NUM_CLIENTS * REQUESTS_PER_CLIENT) as u64;
    println!("\n=== Many Clients Test Results ===");
    println!("Total expected: {}", total_expected);
    println!("Successful: {}", stats.success_count());
    println!("Avg latency: {:?}", stats.avg_latency());

    assert_eq!(stats.success_count(), total_expected);
}

/// Test: a burst of one-way calls is fully delivered
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oneway_burst() {
    init_logging();

    const NUM_CALLS: u64 = 500;

    let handler = Arc::new(EchoHandler::default());
    let service = Arc::new(TestService::start(handler.clone(), 3));

    let sender = service.clone();
    tokio::task::spawn_blocking(move || {
        let proxy = sender.proxy();
        for i in 0..NUM_CALLS {
            let mut data = sender.parcel();
            data.write_interface_token(ECHO_DESCRIPTOR).unwrap();
            data.write_str(&format!("oneway_{}", i)).unwrap();
            proxy
                .transact(OP_ECHO, &data, None, hwbinder::TransactFlags::ONEWAY)
                .unwrap();
        }
    })
    .await
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while handler.calls.load(std::sync::atomic::Ordering::SeqCst) < NUM_CALLS {
        assert!(Instant::now() < deadline, "one-way calls were lost");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.endpoint.stats().snapshot().oneway_received, NUM_CALLS);
}
