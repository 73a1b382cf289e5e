//! Arena Tests - Pin Lifetimes Around Transactions
//!
//! These tests watch the host heap while parcels pin and release memory:
//! - Release runs newest first and only once
//! - Slots do not survive a release
//! - Both sides of a call leave no pins behind

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hwbinder::{
    Arena, BinderError, EntryKind, HeapEvent, HostArray, HostNativeHandle, HostRuntime,
    ManagedHeap, Parcel, TransactFlags,
};
use hidl_wire::ScalarKind;

/// Test: a parcel unpins in reverse order of pinning, exactly once
#[test]
fn test_parcel_release_is_lifo_and_once() {
    init_logging();

    let heap = Arc::new(ManagedHeap::new());
    let first = heap.new_string("first").unwrap();
    let second = heap.new_array(HostArray::from_slice(&[1u16, 2, 3])).unwrap();
    let third = heap.new_string("third").unwrap();

    let mut parcel = Parcel::new(heap.clone());
    parcel.write_string(&first).unwrap();
    parcel.write_vector::<u16>(&second).unwrap();
    parcel.write_string(&third).unwrap();
    assert_eq!(
        parcel.arena().entry_kinds(),
        vec![
            EntryKind::BorrowedString,
            EntryKind::BorrowedPrimitiveArray(ScalarKind::U16),
            EntryKind::BorrowedString,
        ]
    );
    assert_eq!(heap.outstanding_pins(), 3);

    assert_eq!(parcel.release_temporary_storage(), 3);
    assert_eq!(
        heap.events(),
        vec![
            HeapEvent::Pinned(first.id()),
            HeapEvent::Pinned(second.id()),
            HeapEvent::Pinned(third.id()),
            HeapEvent::Unpinned(third.id()),
            HeapEvent::Unpinned(second.id()),
            HeapEvent::Unpinned(first.id()),
        ]
    );

    // Nothing left to release
    assert_eq!(parcel.release_temporary_storage(), 0);
    assert_eq!(heap.events().len(), 6);
    assert_eq!(heap.outstanding_pins(), 0);
}

/// Test: dropping a parcel releases its pins
#[test]
fn test_drop_releases_pins() {
    init_logging();

    let heap = Arc::new(ManagedHeap::new());
    let text = heap.new_string("held").unwrap();
    {
        let mut parcel = Parcel::new(heap.clone());
        parcel.write_string(&text).unwrap();
        parcel.write_string(&text).unwrap();
        assert_eq!(heap.pin_count(&text), 2);
    }
    assert_eq!(heap.pin_count(&text), 0);
}

/// Test: a slot from before a release is refused afterwards
#[test]
fn test_stale_slot_is_rejected() {
    init_logging();

    let heap = ManagedHeap::new();
    let mut arena = Arena::new();
    let old = arena.alloc_raw(16).unwrap();
    arena.raw_mut(old).unwrap()[0] = 0xAB;
    assert_eq!(arena.release(&heap), 1);

    let err = arena.raw_mut(old).unwrap_err();
    assert!(matches!(err, BinderError::UnsupportedOperation(_)));

    // The next transaction's slot at the same index is a different slot
    let fresh = arena.alloc_raw(16).unwrap();
    assert_ne!(fresh.token(), old.token());
    assert_eq!(arena.raw_mut(fresh).unwrap()[0], 0);
    arena.release(&heap);
}

/// Test: a string vector keeps its header slab and views until release
#[test]
fn test_string_vector_slabs() {
    init_logging();

    let heap = Arc::new(ManagedHeap::new());
    let names = vec![
        heap.new_string("a").unwrap(),
        heap.new_string("bb").unwrap(),
    ];
    let mut parcel = Parcel::new(heap.clone());
    parcel.write_string_vector(&names).unwrap();

    let kinds = parcel.arena().entry_kinds();
    assert_eq!(&kinds[..2], &[EntryKind::RawSlab, EntryKind::StringArraySlab]);
    assert_eq!(
        kinds.iter().filter(|k| **k == EntryKind::BorrowedString).count(),
        2
    );
    assert_eq!(heap.outstanding_pins(), 2);

    parcel.release_temporary_storage();
    assert_eq!(heap.outstanding_pins(), 0);
}

/// Test: descriptor bundles are bridged, held by the arena, and never pinned
#[test]
fn test_handle_bundle_is_bridged_not_pinned() {
    init_logging();

    let heap = Arc::new(ManagedHeap::new());
    let bundle = heap
        .new_native_handle(HostNativeHandle {
            fds: vec![9, 10],
            ints: vec![1],
        })
        .unwrap();
    let mut parcel = Parcel::new(heap.clone());
    parcel.write_native_handle(Some(&bundle)).unwrap();

    assert_eq!(
        parcel.arena().entry_kinds(),
        vec![EntryKind::BorrowedHandleSlab]
    );
    assert!(heap.events().is_empty());
    assert_eq!(parcel.release_temporary_storage(), 1);
}

/// Test: pins taken by a handler for its reply are gone once the call is done
#[test]
fn test_server_pins_released_after_reply() {
    init_logging();

    let service = TestService::start(
        handler_fn(|_code, _data, reply| {
            let reply = expect_reply(reply)?;
            let greeting = reply.host().new_string("greetings")?;
            let numbers = reply.host().new_array(HostArray::from_slice(&[4i64, 5]))?;
            reply.write_string(&greeting)?;
            reply.write_vector::<i64>(&numbers)?;
            reply.send()
        }),
        2,
    );

    for _ in 0..10 {
        let data = service.parcel();
        let mut reply = service.parcel();
        service
            .proxy()
            .transact(1, &data, Some(&mut reply), TransactFlags::NONE)
            .unwrap();
        assert_eq!(reply.read_string().unwrap(), "greetings");
        assert_eq!(reply.read_vector::<i64>().unwrap(), vec![4, 5]);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        service.heap.outstanding_pins() == 0
    }));
    let events = service.heap.events();
    let pinned = events
        .iter()
        .filter(|e| matches!(e, HeapEvent::Pinned(_)))
        .count();
    let unpinned = events
        .iter()
        .filter(|e| matches!(e, HeapEvent::Unpinned(_)))
        .count();
    assert_eq!(pinned, 20);
    assert_eq!(pinned, unpinned);
}
