//! Byte range cache behaviour over a remote object

mod common;

use bytes::Bytes;
use common::{CountingIOManager, INJECTED_ERROR_CODE};
use openvds_pager::data_view::DataRequestInfo;
use openvds_pager::io::WriteObjectOptions;
use openvds_pager::{DataProvider, DataViewManager, DataViewManagerConfig, IoDispatcher};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const OBJECT_SIZE: u64 = 4096;

fn object_manager(io: &Arc<CountingIOManager>, prefetch_limit: u64) -> Arc<DataViewManager> {
    let dispatcher = Arc::new(IoDispatcher::new(io.clone(), 2).unwrap());
    let data: Vec<u8> = (0..OBJECT_SIZE).map(|i| (i % 253) as u8).collect();
    assert!(dispatcher
        .write_object("blob", WriteObjectOptions::default(), Bytes::from(data), None)
        .wait_for_finish());

    let provider = Arc::new(DataProvider::object(dispatcher, "blob"));
    let config = DataViewManagerConfig {
        prefetch_limit,
        sub_fetch_size: 1024,
    };
    DataViewManager::new(provider, config)
}

#[test]
fn test_concurrent_acquires_fetch_once() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 0);
    io.set_read_delay(Duration::from_millis(50));

    let handles: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| manager.acquire_view(100, 500, true).unwrap()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(io.reads(), 1);
    let key = DataRequestInfo::new(100, 500);
    assert_eq!(manager.ref_count(key), 8);
    for handle in &handles {
        assert_eq!(handle.data().unwrap()[0], 100);
    }
    let stats = manager.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);

    drop(handles);
    assert!(!manager.is_resident(key));
}

#[test]
fn test_large_views_are_split_into_sub_fetches() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 0);

    let view = manager.acquire_view(0, OBJECT_SIZE, true).unwrap();
    let data = view.data().unwrap();
    assert_eq!(data.len() as u64, OBJECT_SIZE);
    assert_eq!(data[1000], (1000 % 253) as u8);
    assert_eq!(io.reads(), 4);
}

#[test]
fn test_prefetch_admits_up_to_budget() {
    let io = CountingIOManager::new();
    // Room for floor(1000 / 300) = 3 views of 300 bytes
    let manager = object_manager(&io, 1000);
    manager.add_data_requests((0..10).map(|i| DataRequestInfo::new(i * 300, 300)));

    let stats = manager.stats();
    assert_eq!(stats.prefetch_admitted, 3);
    assert_eq!(stats.prefetch_usage, 900);
    assert_eq!(stats.pending_prefetch, 7);

    // Acquiring a prefetched view reuses its fetch
    let view = manager.acquire_view(300, 300, false).unwrap();
    assert_eq!(view.data().unwrap()[0], (300 % 253) as u8);
    assert_eq!(manager.stats().hits, 1);
}

#[test]
fn test_oversized_prefetch_is_skipped() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 1000);
    manager.add_data_requests([DataRequestInfo::new(0, 2000), DataRequestInfo::new(0, 100)]);

    let stats = manager.stats();
    assert_eq!(stats.prefetch_admitted, 1);
    assert!(!manager.is_resident(DataRequestInfo::new(0, 2000)));
    assert!(manager.is_resident(DataRequestInfo::new(0, 100)));
}

#[test]
fn test_overlapping_ranges_are_separate_views() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 0);

    let a = manager.acquire_view(0, 200, true).unwrap();
    let b = manager.acquire_view(100, 200, true).unwrap();
    let c = manager.acquire_view(0, 100, true).unwrap();
    assert_eq!(manager.stats().resident_views, 3);
    assert_eq!(a.data().unwrap()[100], b.data().unwrap()[0]);
    assert_eq!(&a.data().unwrap()[..100], &c.data().unwrap()[..]);
    assert_eq!(io.reads(), 3);
}

#[test]
fn test_failed_fetch_is_sticky_until_cleared() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 0);
    io.fail_next_reads(1);

    let view = manager.acquire_view(0, 64, true).unwrap();
    assert_eq!(view.data().unwrap_err().code(), INJECTED_ERROR_CODE);
    drop(view);

    let err = manager.acquire_view(0, 64, true).unwrap_err();
    assert_eq!(err.code(), INJECTED_ERROR_CODE);
    assert_eq!(manager.failure(DataRequestInfo::new(0, 64)).map(|e| e.code()), Some(INJECTED_ERROR_CODE));

    manager.clear_failures();
    let view = manager.acquire_view(0, 64, true).unwrap();
    assert_eq!(view.data().unwrap().len(), 64);
}

#[test]
fn test_dropping_in_flight_view_keeps_key_readable() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 0);
    io.set_read_delay(Duration::from_millis(200));

    let view = manager.acquire_view(0, 64, true).unwrap();
    thread::sleep(Duration::from_millis(20));
    drop(view);
    thread::sleep(Duration::from_millis(300));

    let key = DataRequestInfo::new(0, 64);
    assert!(manager.failure(key).is_none());
    let view = manager.acquire_view(0, 64, true).unwrap();
    assert_eq!(view.data().unwrap()[10], 10);
}

#[test]
fn test_retired_prefetch_can_be_acquired_again() {
    let io = CountingIOManager::new();
    let manager = object_manager(&io, 1000);
    io.set_read_delay(Duration::from_millis(200));

    let key = DataRequestInfo::new(200, 64);
    manager.add_data_requests([key]);
    assert!(manager.is_resident(key));
    manager.retire_all_views();
    assert!(!manager.is_resident(key));
    thread::sleep(Duration::from_millis(300));

    assert!(manager.failure(key).is_none());
    let view = manager.acquire_view(200, 64, true).unwrap();
    assert_eq!(view.data().unwrap()[0], 200);
}
