//! Page lifecycle tests against an instrumented in-memory backend

mod common;

use common::{init_tracing, margin_layout, CountingIOManager, INJECTED_ERROR_CODE};
use openvds_pager::{
    AccessMode, Components, DimensionGroup, Format, PageBuffer, PageState, VdsConfig, VdsError, VolumeDataAccess,
    VolumeDataPageAccessor,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn group() -> DimensionGroup {
    DimensionGroup::from_indices(&[0, 1]).unwrap()
}

fn create_volume(io: &Arc<CountingIOManager>, config: VdsConfig) -> VolumeDataAccess {
    VolumeDataAccess::with_io_manager(io.clone(), margin_layout(), config).unwrap()
}

fn reopen(io: &Arc<CountingIOManager>) -> VolumeDataAccess {
    VolumeDataAccess::open_with_io_manager(io.clone(), VdsConfig::default()).unwrap()
}

fn accessor(vds: &VolumeDataAccess, mode: AccessMode) -> VolumeDataPageAccessor {
    vds.create_page_accessor(group(), 0, 0, None, mode).unwrap()
}

/// Fill every chunk with a recognizable pattern and commit
fn write_pattern(vds: &VolumeDataAccess) -> Vec<Vec<u8>> {
    let accessor = accessor(vds, AccessMode::Create);
    let mut expected = Vec::new();
    for chunk in 0..accessor.chunk_count() {
        let page = accessor.create_page(chunk).unwrap();
        assert_eq!(page.state(), PageState::Created);
        let mut buffer = page.writable_buffer().unwrap();
        for (i, value) in buffer.as_mut_slice::<u8>().unwrap().iter_mut().enumerate() {
            *value = (i as u64 * 7 + chunk) as u8;
        }
        expected.push(buffer.as_bytes().to_vec());
    }
    accessor.commit().unwrap();
    assert_eq!(accessor.stats().pages_written, 3);
    expected
}

#[test]
fn test_committed_pages_read_back_identically() {
    init_tracing();
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let expected = write_pattern(&vds);

    let reader = reopen(&io);
    let accessor = accessor(&reader, AccessMode::ReadOnly);
    for (chunk, bytes) in expected.iter().enumerate() {
        let page = accessor.read_page(chunk as u64).unwrap();
        assert_eq!(page.state(), PageState::Ready);
        assert_eq!(page.buffer().unwrap().as_bytes(), &bytes[..]);
    }

    let again = accessor.read_page(0).unwrap();
    assert_eq!(again.buffer().unwrap().as_bytes(), &expected[0][..]);
    let stats = accessor.stats();
    assert_eq!(stats.pages_read, 3);
    assert_eq!(stats.pages_found, 1);
}

#[test]
fn test_page_geometry() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let accessor = accessor(&vds, AccessMode::Create);
    assert_eq!(accessor.chunk_count(), 3);
    assert_eq!(accessor.num_samples(), [100, 20, 1, 1, 1, 1]);
    assert_eq!(accessor.chunk_index(&[40, 3]).unwrap(), 1);

    let page = accessor.create_page(1).unwrap();
    let (min, max) = page.min_max();
    assert_eq!((min[0], max[0]), (32, 68));
    let (min, max) = page.min_max_excluding_margin();
    assert_eq!((min[0], max[0]), (34, 66));
    assert_eq!(page.shape(), [36, 20, 1, 1, 1, 1]);
    assert!(page.buffer().unwrap().as_bytes().iter().all(|b| *b == 0));
}

#[test]
fn test_concurrent_readers_share_one_fetch() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    write_pattern(&vds);

    let reader = reopen(&io);
    let accessor = accessor(&reader, AccessMode::ReadOnly);
    io.set_read_delay(Duration::from_millis(50));
    let reads_before = io.reads();

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let page = accessor.read_page(2).unwrap();
                assert_eq!(page.state(), PageState::Ready);
            });
        }
    });

    assert_eq!(io.reads() - reads_before, 1);
    assert_eq!(accessor.stats().pages_read, 1);
    assert_eq!(accessor.stats().pages_found, 7);
}

#[test]
fn test_failed_read_is_retried() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let expected = write_pattern(&vds);

    let reader = reopen(&io);
    let accessor = accessor(&reader, AccessMode::ReadOnly);
    io.fail_next_reads(1);

    let page = accessor.prepare_read_page(0).unwrap();
    let err = page.wait().unwrap_err();
    assert_eq!(err.code(), INJECTED_ERROR_CODE);
    assert_eq!(page.state(), PageState::Error);
    assert_eq!(page.error().map(|e| e.code()), Some(INJECTED_ERROR_CODE));
    assert!(page.buffer().is_err());
    drop(page);

    let page = accessor.read_page(0).unwrap();
    assert_eq!(page.state(), PageState::Ready);
    assert_eq!(page.buffer().unwrap().as_bytes(), &expected[0][..]);
}

#[test]
fn test_missing_chunk_reports_not_found() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let accessor = accessor(&vds, AccessMode::ReadWrite);
    let err = accessor.read_page(1).unwrap_err();
    assert_eq!(err.code(), openvds_pager::error::NOT_FOUND_CODE);

    // An errored page can be created instead
    let page = accessor.create_page(1).unwrap();
    assert_eq!(page.state(), PageState::Created);
}

#[test]
fn test_all_pages_pinned_blocks_then_fails() {
    let io = CountingIOManager::new();
    let config = VdsConfig {
        max_pages: 2,
        page_wait_timeout_ms: 200,
        ..VdsConfig::default()
    };
    let vds = create_volume(&io, config);
    let accessor = accessor(&vds, AccessMode::Create);

    let first = accessor.create_page(0).unwrap();
    let _second = accessor.create_page(1).unwrap();

    let start = Instant::now();
    let err = accessor.create_page(2).unwrap_err();
    assert!(matches!(err, VdsError::ResourceLimit(_)));
    assert!(start.elapsed() >= Duration::from_millis(200));

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(first);
    });
    let third = accessor.create_page(2).unwrap();
    releaser.join().unwrap();

    // The oldest unpinned page was uploaded to make room
    assert_eq!(third.chunk_index(), 2);
    let stats = accessor.stats();
    assert_eq!(stats.resident_pages, 2);
    assert_eq!(stats.pages_written, 1);

    drop(third);
    accessor.commit().unwrap();
    assert_eq!(accessor.stats().pages_written, 3);

    let reader = reopen(&io);
    let accessor = reader.create_page_accessor(group(), 0, 0, None, AccessMode::ReadOnly).unwrap();
    for chunk in 0..3 {
        assert!(accessor.read_page(chunk).is_ok());
    }
}

#[test]
fn test_set_max_pages_evicts_unpinned_pages() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    write_pattern(&vds);

    let reader = reopen(&io);
    let accessor = accessor(&reader, AccessMode::ReadOnly);
    let pinned = accessor.read_page(0).unwrap();
    for chunk in 1..3 {
        accessor.read_page(chunk).unwrap();
    }
    assert_eq!(accessor.stats().resident_pages, 3);

    accessor.set_max_pages(1).unwrap();
    assert_eq!(accessor.stats().resident_pages, 1);
    assert_eq!(pinned.state(), PageState::Ready);
    assert!(accessor.set_max_pages(0).is_err());
}

#[test]
fn test_read_only_pages_reject_writes() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    write_pattern(&vds);

    let reader = reopen(&io);
    let accessor = accessor(&reader, AccessMode::ReadOnly);
    let page = accessor.read_page(0).unwrap();
    assert!(matches!(page.writable_buffer(), Err(VdsError::State(_))));
    let (min, max) = page.min_max();
    assert!(matches!(page.update_written_region(&min, &max), Err(VdsError::State(_))));
    assert!(matches!(accessor.create_page(0), Err(VdsError::State(_))));
}

#[test]
fn test_written_region_must_stay_inside_page() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let accessor = accessor(&vds, AccessMode::Create);
    let page = accessor.create_page(0).unwrap();

    let err = page
        .update_written_region(&[0, 0, 0, 0, 0, 0], &[37, 20, 1, 1, 1, 1])
        .unwrap_err();
    assert!(matches!(err, VdsError::IndexOutOfRange(_)));
    page.update_written_region(&[0, 0, 0, 0, 0, 0], &[36, 20, 1, 1, 1, 1])
        .unwrap();
}

#[test]
fn test_creating_a_resident_page_fails() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let accessor = accessor(&vds, AccessMode::Create);
    let _page = accessor.create_page(0).unwrap();
    assert!(matches!(accessor.create_page(0), Err(VdsError::State(_))));
    assert!(matches!(accessor.create_page(3), Err(VdsError::IndexOutOfRange(_))));
}

#[test]
fn test_commit_copies_written_region_into_neighbour_margins() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let accessor = accessor(&vds, AccessMode::Create);
    {
        let left = accessor.create_page(0).unwrap();
        left.writable_buffer().unwrap().as_mut_slice::<u8>().unwrap().fill(7);
        let (min, max) = left.min_max_excluding_margin();
        left.update_written_region(&min, &max).unwrap();
        let _right = accessor.create_page(1).unwrap();
    }
    accessor.commit().unwrap();

    let reader = reopen(&io);
    let accessor = reader.create_page_accessor(group(), 0, 0, None, AccessMode::ReadOnly).unwrap();
    let right = accessor.read_page(1).unwrap();
    let buffer = right.buffer().unwrap();
    let pitch = buffer.pitch();
    let bytes = buffer.as_slice::<u8>().unwrap();
    for y in [0, 5, 19] {
        // Voxels 32 and 33 belong to chunk 0 and sit in the negative margin of chunk 1
        assert_eq!(bytes[y * pitch[1]], 7);
        assert_eq!(bytes[1 + y * pitch[1]], 7);
        assert_eq!(bytes[2 + y * pitch[1]], 0);
    }
}

#[test]
fn test_region_round_trip_updates_margins() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let value = |x: usize, y: usize| (x * 3 + y) as u8;

    let min = [10, 5, 0, 0, 0, 0];
    let max = [50, 15, 1, 1, 1, 1];
    let mut region = PageBuffer::zeroed(Format::U8, Components::One, [40, 10, 1, 1, 1, 1]);
    {
        let values = region.as_mut_slice::<u8>().unwrap();
        for y in 5..15 {
            for x in 10..50 {
                values[(x - 10) + 40 * (y - 5)] = value(x, y);
            }
        }
    }

    let writer = accessor(&vds, AccessMode::Create);
    writer.write_region(&min, &max, &region).unwrap();
    writer.commit().unwrap();

    let reader = reopen(&io);
    let accessor = accessor(&reader, AccessMode::ReadOnly);
    assert_eq!(accessor.read_region(&min, &max).unwrap(), region);

    // Voxel 34 lies in the positive margin of chunk 0, voxel 32 in the
    // negative margin of chunk 1
    let left = accessor.read_page(0).unwrap();
    let left = left.buffer().unwrap();
    assert_eq!(left.as_slice::<u8>().unwrap()[34 + 36 * 7], value(34, 7));
    let right = accessor.read_page(1).unwrap();
    let right = right.buffer().unwrap();
    assert_eq!(right.as_slice::<u8>().unwrap()[36 * 7], value(32, 7));
}

#[test]
fn test_region_shape_must_match() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let writer = accessor(&vds, AccessMode::Create);
    let region = PageBuffer::zeroed(Format::U8, Components::One, [4, 4, 1, 1, 1, 1]);
    let err = writer
        .write_region(&[0, 0, 0, 0, 0, 0], &[5, 4, 1, 1, 1, 1], &region)
        .unwrap_err();
    assert!(matches!(err, VdsError::InvalidArgument(_)));
    let err = writer.read_region(&[0, 0, 0, 0, 0, 0], &[101, 4, 1, 1, 1, 1]).unwrap_err();
    assert!(matches!(err, VdsError::IndexOutOfRange(_)));
}

#[test]
fn test_ndarray_views_follow_page_layout() {
    let io = CountingIOManager::new();
    let vds = create_volume(&io, VdsConfig::default());
    let accessor = accessor(&vds, AccessMode::Create);
    let page = accessor.create_page(0).unwrap();

    page.with_view_mut::<u8, _>(|mut view| {
        assert_eq!(view.shape(), &[36, 20, 1, 1, 1, 1]);
        view[&[3, 2, 0, 0, 0, 0][..]] = 42;
    })
    .unwrap();
    let value = page.with_view::<u8, _>(|view| view[&[3, 2, 0, 0, 0, 0][..]]).unwrap();
    assert_eq!(value, 42);
    assert_eq!(page.buffer().unwrap().as_slice::<u8>().unwrap()[3 + 36 * 2], 42);
    assert!(page.with_view::<f32, _>(|_| ()).is_err());
}
