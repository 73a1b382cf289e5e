//! Object Graph Tests - Nested Values Across the Wire
//!
//! These tests send structured values between two processes and check
//! what the receiving handler sees:
//! - Vectors, strings and blobs with embedded descriptor bundles
//! - Multi-level blob trees read back through embedded-buffer lookups
//! - String and handle vectors
//! - Malformed reads turned into statuses for the caller

mod common;

use common::*;
use hidl_wire::{Blob, NativeHandle, WireObject};
use hwbinder::{
    BinderError, CallerError, HostNativeHandle, HostRuntime, Status, TransactFlags,
};

const OUTER_SIZE: usize = 32;
const HANDLE_OFFSET: usize = 16;
const MARKER: u32 = 0x00C0_FFEE;

/// Test: vector, string and a blob with a bundle at offset 16 reach the peer
#[test]
fn test_vector_string_and_nested_handle() {
    init_logging();

    let service = TestService::start(
        handler_fn(|_code, data, reply| {
            let values = data.read_vector::<i32>()?;
            let text = data.read_string()?;
            let outer = data.read_buffer(OUTER_SIZE)?;
            let marker = outer.get::<u32>(0)?;
            let bundle = outer
                .get_native_handle(HANDLE_OFFSET)?
                .ok_or_else(|| BinderError::handler("missing bundle"))?;

            let reply = expect_reply(reply)?;
            reply.write_slice(&values)?;
            reply.write_str(&text)?;
            reply.write_u32(marker)?;
            reply.write_u32(bundle.num_fds() as u32)?;
            reply.write_u32(bundle.num_ints() as u32)?;
            reply.write_i32(bundle.fds().first().copied().unwrap_or(-1))?;
            reply.send()
        }),
        1,
    );

    let mut data = service.parcel();
    data.write_slice(&[7i32, -8, 9]).unwrap();
    data.write_str("abc").unwrap();
    let mut outer = Blob::new(OUTER_SIZE);
    outer.put(0, MARKER).unwrap();
    outer
        .put_native_handle(HANDLE_OFFSET, NativeHandle::new(vec![5], vec![]).unwrap())
        .unwrap();
    let outer_handle = data.write_buffer(&mut outer).unwrap();

    // The bundle hangs off the outer buffer's slot in the object table
    let wire = data.wire().unwrap();
    let child = wire.child(outer_handle, HANDLE_OFFSET).unwrap();
    assert!(matches!(
        wire.object(child).unwrap(),
        WireObject::NativeHandle { .. }
    ));

    let mut reply = service.parcel();
    service
        .proxy()
        .transact(1, &data, Some(&mut reply), TransactFlags::NONE)
        .unwrap();

    assert_eq!(reply.read_vector::<i32>().unwrap(), vec![7, -8, 9]);
    assert_eq!(reply.read_string().unwrap(), "abc");
    assert_eq!(reply.read_u32().unwrap(), MARKER);
    assert_eq!(reply.read_u32().unwrap(), 1);
    assert_eq!(reply.read_u32().unwrap(), 0);
    assert_eq!(reply.read_i32().unwrap(), 5);
}

/// Test: a three-level tree is reachable through embedded-buffer reads
#[test]
fn test_embedded_buffer_lookup() {
    init_logging();

    let service = TestService::start(
        handler_fn(|_code, data, reply| {
            let outer = data.read_buffer(24)?;
            let parent = outer
                .handle()
                .ok_or_else(|| BinderError::handler("outer blob has no handle"))?;
            let middle = data
                .read_embedded_buffer(16, parent, 0, false)?
                .ok_or_else(|| BinderError::handler("missing middle blob"))?;
            let absent = data.read_embedded_buffer(16, parent, 8, true)?;
            let depth = outer.get::<u64>(16)?;

            let reply = expect_reply(reply)?;
            reply.write_str(&middle.get_string(0)?)?;
            reply.write_bool(absent.is_none())?;
            reply.write_u64(depth)?;
            reply.send()
        }),
        1,
    );

    let mut middle = Blob::new(16);
    middle.put_string(0, "leaf").unwrap();
    let mut outer = Blob::new(24);
    outer.put(16, 3u64).unwrap();
    outer.attach_child(0, middle).unwrap();

    let mut data = service.parcel();
    data.write_buffer(&mut outer).unwrap();
    let mut reply = service.parcel();
    service
        .proxy()
        .transact(1, &data, Some(&mut reply), TransactFlags::NONE)
        .unwrap();

    assert_eq!(reply.read_string().unwrap(), "leaf");
    assert!(reply.read_bool().unwrap());
    assert_eq!(reply.read_u64().unwrap(), 3);
}

/// Test: string vectors and descriptor bundle vectors survive the trip
#[test]
fn test_string_and_handle_vectors() {
    init_logging();

    let service = TestService::start(
        handler_fn(|_code, data, reply| {
            let names = data.read_string_vector()?;
            let handles = data.read_native_handle_vector()?;

            let reply = expect_reply(reply)?;
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            reply.write_str_vector(&refs)?;
            reply.write_native_handle_vector(&handles)?;
            reply.send()
        }),
        1,
    );

    let heap = service.heap.clone();
    let first = heap
        .new_native_handle(HostNativeHandle {
            fds: vec![3, 4],
            ints: vec![42],
        })
        .unwrap();

    let mut data = service.parcel();
    data.write_str_vector(&["camera", "", "audio"]).unwrap();
    data.write_native_handle_vector(&[Some(first), None]).unwrap();
    let mut reply = service.parcel();
    service
        .proxy()
        .transact(1, &data, Some(&mut reply), TransactFlags::NONE)
        .unwrap();

    assert_eq!(
        reply.read_string_vector().unwrap(),
        vec!["camera".to_string(), String::new(), "audio".to_string()]
    );
    let handles = reply.read_native_handle_vector().unwrap();
    assert_eq!(handles.len(), 2);
    let bundle = handles[0].as_ref().unwrap().as_native_handle().unwrap();
    assert_eq!(bundle.fds, vec![3, 4]);
    assert_eq!(bundle.ints, vec![42]);
    assert!(handles[1].is_none());
}

/// Test: a buffer of the wrong size is reported as a bad value
#[test]
fn test_size_mismatch_reaches_caller() {
    init_logging();

    let service = TestService::start(
        handler_fn(|_code, data, reply| {
            data.read_buffer(8)?;
            expect_reply(reply)?.send()
        }),
        1,
    );

    let mut data = service.parcel();
    data.write_buffer(&mut Blob::new(OUTER_SIZE)).unwrap();
    let mut reply = service.parcel();
    let err = service
        .proxy()
        .transact(1, &data, Some(&mut reply), TransactFlags::NONE)
        .unwrap_err();

    assert_eq!(err.status(), Status::BadValue);
    assert_eq!(err.caller_error(), CallerError::IllegalArgument);
    assert_eq!(reply.data_position().unwrap(), 0);
    assert_eq!(service.endpoint.stats().snapshot().handler_errors, 1);
}

/// Test: optional top-level bundles keep their presence flag
#[test]
fn test_optional_native_handle() {
    init_logging();

    let service = TestService::start(
        handler_fn(|_code, data, reply| {
            let present = data.read_native_handle()?;
            let absent = data.read_native_handle()?;
            let reply = expect_reply(reply)?;
            reply.write_native_handle(present.as_ref())?;
            reply.write_bool(absent.is_none())?;
            reply.send()
        }),
        1,
    );

    let bundle = service
        .heap
        .new_native_handle(HostNativeHandle {
            fds: vec![11],
            ints: vec![],
        })
        .unwrap();
    let mut data = service.parcel();
    data.write_native_handle(Some(&bundle)).unwrap();
    data.write_native_handle(None).unwrap();
    let mut reply = service.parcel();
    service
        .proxy()
        .transact(1, &data, Some(&mut reply), TransactFlags::NONE)
        .unwrap();

    let echoed = reply.read_native_handle().unwrap().unwrap();
    assert_eq!(echoed.as_native_handle().unwrap().fds, vec![11]);
    assert!(reply.read_bool().unwrap());
}
