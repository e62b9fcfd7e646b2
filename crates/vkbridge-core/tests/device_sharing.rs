//! Device multiplexing behavior across create/destroy cycles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use vkbridge_core::device_table::{DeviceFns, DeviceTable};
use vkbridge_core::forward::Pfn;

unsafe extern "C" fn noop() {}

fn stub_fns() -> Arc<DeviceFns> {
    let fns = DeviceFns::load(|_name| {
        Some(unsafe { std::mem::transmute::<*const (), Pfn>(noop as *const ()) })
    })
    .expect("stub resolver provides every entry point");
    Arc::new(fns)
}

#[test]
fn test_shared_device_created_once() {
    let table = DeviceTable::new();
    let created = AtomicU32::new(0);

    let make = || {
        created.fetch_add(1, Ordering::SeqCst);
        Ok((0x1000, stub_fns()))
    };
    let first = table.acquire(7, true, make).expect("first create");
    let second = table
        .acquire(7, true, || panic!("second acquire must not create"))
        .expect("second acquire");
    let third = table
        .acquire(7, true, || panic!("third acquire must not create"))
        .expect("third acquire");

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(first.real, 0x1000);
    assert_eq!(second.real, first.real);
    assert_eq!(third.real, first.real);
    assert_eq!(table.live_refs(0x1000), 3);
}

#[test]
fn test_release_destroys_only_on_last_reference() {
    let table = DeviceTable::new();
    for _ in 0..3 {
        table
            .acquire(7, true, || Ok((0x2000, stub_fns())))
            .expect("acquire");
    }

    let destroyed = AtomicU32::new(0);
    let destroy = |_: &DeviceFns| {
        destroyed.fetch_add(1, Ordering::SeqCst);
    };
    assert!(!table.release(0x2000, destroy));
    assert!(!table.release(0x2000, destroy));
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);

    assert!(table.release(0x2000, destroy));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(table.live_refs(0x2000), 0);
    assert!(table.lookup(0x2000).is_none());
}

#[test]
fn test_unshared_mode_creates_per_call() {
    let table = DeviceTable::new();
    let next = AtomicU32::new(0);

    let mut reals = Vec::new();
    for _ in 0..2 {
        let info = table
            .acquire(7, false, || {
                let real = 0x3000 + u64::from(next.fetch_add(1, Ordering::SeqCst));
                Ok((real, stub_fns()))
            })
            .expect("acquire");
        reals.push(info.real);
    }
    assert_ne!(reals[0], reals[1]);
    assert_eq!(table.live_refs(reals[0]), 1);
    assert_eq!(table.live_refs(reals[1]), 1);

    let destroyed = AtomicU32::new(0);
    for real in reals {
        assert!(table.release(real, |_| {
            destroyed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_release_of_unknown_device_is_ignored() {
    let table = DeviceTable::new();
    assert!(!table.release(0xdead, |_| panic!("nothing to destroy")));
}
