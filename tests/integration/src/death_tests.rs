//! Death Tests - Linking, Firing and Unlinking Recipients
//!
//! These tests kill service processes under live proxies and check:
//! - Linked recipients hear about the death exactly once
//! - Fired records stay findable until unlinked
//! - Failing or panicking recipients do not disturb the notifier
//! - Proxy identity follows the target

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use hwbinder::{
    BinderConfig, BinderError, DeathRecipient, Endpoint, LoopbackDriver, RemoteProxy, Result,
    TargetId, Transport,
};
use parking_lot::Mutex;

/// Recipient that records every notification it gets
#[derive(Default)]
struct Recorder {
    deaths: Mutex<Vec<(u64, TargetId)>>,
    fail: bool,
    panic: bool,
}

impl DeathRecipient for Recorder {
    fn service_died(&self, cookie: u64, who: TargetId) -> Result<()> {
        self.deaths.lock().push((cookie, who));
        if self.panic {
            panic!("recipient blew up");
        }
        if self.fail {
            return Err(BinderError::handler("recipient failed"));
        }
        Ok(())
    }
}

fn recorder() -> (Arc<Recorder>, Arc<dyn DeathRecipient>) {
    let recorder = Arc::new(Recorder::default());
    let dynamic: Arc<dyn DeathRecipient> = recorder.clone();
    (recorder, dynamic)
}

/// Test: link and unlink without a death leave nothing behind
#[test]
fn test_link_then_unlink() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let proxy = service.proxy();
    let (recorder, r) = recorder();

    assert!(proxy.link_death(r.clone(), 11));
    assert_eq!(proxy.death_recipients().len(), 1);
    assert_eq!(service.driver.death_link_count(), 1);

    proxy.unlink_death(&r).unwrap();
    assert!(proxy.death_recipients().is_empty());
    assert_eq!(service.driver.death_link_count(), 0);

    // Nothing fires after the unlink
    service.driver.kill(service.server.pid()).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(recorder.deaths.lock().is_empty());
}

/// Test: unlinking a recipient that was never linked is not found
#[test]
fn test_unlink_unknown_recipient() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let proxy = service.proxy();
    let (_, linked) = recorder();
    let (_, stranger) = recorder();

    assert!(proxy.link_death(linked.clone(), 1));
    let err = proxy.unlink_death(&stranger).unwrap_err();
    assert!(matches!(err, BinderError::NotFound(_)));
    assert_eq!(proxy.death_recipients().len(), 1);

    proxy.unlink_death(&linked).unwrap();
}

/// Test: a death fires once with the cookie and target, and the record is
/// found by weak identity afterwards
#[test]
fn test_fired_record_stays_until_unlinked() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let proxy = service.proxy();
    let (recorder, r) = recorder();
    assert!(proxy.link_death(r.clone(), 42));

    service.driver.kill(service.server.pid()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !recorder.deaths.lock().is_empty()
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        proxy.death_recipients().find(&r).is_some_and(|record| record.is_weak())
    }));
    assert_eq!(*recorder.deaths.lock(), vec![(42, service.target)]);

    // The proxy no longer keeps the recipient alive
    drop(r);
    assert!(wait_until(Duration::from_secs(5), || {
        Arc::strong_count(&recorder) == 1
    }));

    let r: Arc<dyn DeathRecipient> = recorder.clone();
    proxy.unlink_death(&r).unwrap();
    assert!(proxy.death_recipients().is_empty());

    // A second kill is a no-op
    service.driver.kill(service.server.pid()).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.deaths.lock().len(), 1);
}

/// Test: every linked recipient hears the death even when some fail or panic
#[test]
fn test_failing_recipients_are_contained() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let proxy = service.proxy();

    let failing = Arc::new(Recorder {
        fail: true,
        ..Recorder::default()
    });
    let panicking = Arc::new(Recorder {
        panic: true,
        ..Recorder::default()
    });
    let (healthy, healthy_dyn) = recorder();
    let failing_dyn: Arc<dyn DeathRecipient> = failing.clone();
    let panicking_dyn: Arc<dyn DeathRecipient> = panicking.clone();

    assert!(proxy.link_death(failing_dyn.clone(), 1));
    assert!(proxy.link_death(panicking_dyn.clone(), 2));
    assert!(proxy.link_death(healthy_dyn.clone(), 3));

    service.driver.kill(service.server.pid()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        proxy
            .death_recipients()
            .find(&healthy_dyn)
            .is_some_and(|record| record.is_weak())
    }));

    assert_eq!(failing.deaths.lock().len(), 1);
    assert_eq!(panicking.deaths.lock().len(), 1);
    assert_eq!(*healthy.deaths.lock(), vec![(3, service.target)]);
    for r in [&failing_dyn, &panicking_dyn, &healthy_dyn] {
        assert!(proxy.death_recipients().find(r).unwrap().is_weak());
        proxy.unlink_death(r).unwrap();
    }
    assert!(proxy.death_recipients().is_empty());
}

/// Test: calls to a killed service fail with a dead object status
#[test]
fn test_calls_after_death_fail() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let proxy = service.proxy();
    let mut reply = service.call_str(&proxy, OP_ECHO, "alive").unwrap();
    assert_eq!(reply.read_string().unwrap(), "alive");

    service.driver.kill(service.server.pid()).unwrap();
    assert!(!service.driver.is_alive(service.server.pid()));
    let err = service.call_str(&proxy, OP_ECHO, "dead").unwrap_err();
    assert_eq!(err.status(), hwbinder::Status::DeadObject);

    // Linking to the dead target is refused and leaves no record
    let (_, r) = recorder();
    assert!(!proxy.link_death(r.clone(), 0));
    assert!(proxy.death_recipients().is_empty());
}

/// Test: a target in the proxy's own process links as a no-op
#[test]
fn test_local_target_link_is_noop() {
    init_logging();

    let driver = LoopbackDriver::new();
    let heap = Arc::new(hwbinder::ManagedHeap::new());
    let process = driver.spawn_process(BinderConfig::default());
    let target = Arc::new(Endpoint::new(Arc::new(EchoHandler::default()), heap))
        .register(process.as_ref())
        .unwrap();
    assert!(process.is_local(target));

    let proxy = RemoteProxy::new(target, process.clone());
    let (_, r) = recorder();
    assert!(proxy.link_death(r, 5));
    assert!(proxy.death_recipients().is_empty());
    assert_eq!(driver.death_link_count(), 0);
}

/// Test: proxies compare and hash by target
#[test]
fn test_proxy_identity_follows_target() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let other_client = service.driver.spawn_process(BinderConfig::default());

    let a = service.proxy();
    let b = RemoteProxy::new(service.target, other_client.clone());
    let c = RemoteProxy::new(
        TargetId::new(service.target.process, service.target.node + 1),
        other_client,
    );
    assert_eq!(a, b);
    assert_ne!(a, c);

    let set: HashSet<RemoteProxy> = [a.clone(), b, c].into_iter().collect();
    assert_eq!(set.len(), 2);
    assert!(set.contains(&a));
}

/// Test: a recipient linked through two proxies is told once per link
#[test]
fn test_two_links_fire_twice() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let first = service.proxy();
    let second = service.proxy();
    let (recorder, r) = recorder();
    assert!(first.link_death(r.clone(), 1));
    assert!(second.link_death(r.clone(), 2));
    assert_eq!(service.driver.death_link_count(), 2);

    service.driver.kill(service.server.pid()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.deaths.lock().len() == 2
    }));
    let mut cookies: Vec<u64> = recorder.deaths.lock().iter().map(|(c, _)| *c).collect();
    cookies.sort_unstable();
    assert_eq!(cookies, vec![1, 2]);
    assert_eq!(service.driver.death_link_count(), 0);

    // Both proxies see both records
    assert!(wait_until(Duration::from_secs(5), || {
        second.death_recipients().find(&r).is_some_and(|rec| rec.is_weak())
    }));
    assert_eq!(first.death_recipients().len(), 2);
    first.unlink_death(&r).unwrap();
    assert_eq!(second.death_recipients().len(), 1);
    second.unlink_death(&r).unwrap();
    assert!(first.death_recipients().is_empty());
}

/// Test: a link made through one proxy is cancelled through an equal one
#[test]
fn test_unlink_through_equal_proxy() {
    init_logging();

    let service = TestService::start(Arc::new(EchoHandler::default()), 1);
    let (recorder, r) = recorder();
    let a = service.proxy();
    let b = service.proxy();
    assert_eq!(a, b);

    assert!(a.link_death(r.clone(), 8));
    assert!(Arc::ptr_eq(a.death_recipients(), b.death_recipients()));
    assert_eq!(service.driver.death_link_count(), 1);

    b.unlink_death(&r).unwrap();
    assert!(a.death_recipients().is_empty());
    assert_eq!(service.driver.death_link_count(), 0);

    // A proxy made after the others are gone starts with an empty list
    drop((a, b));
    let c = service.proxy();
    assert!(c.death_recipients().is_empty());
    assert!(matches!(c.unlink_death(&r), Err(BinderError::NotFound(_))));

    service.driver.kill(service.server.pid()).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(recorder.deaths.lock().is_empty());
}
