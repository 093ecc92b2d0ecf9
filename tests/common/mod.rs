//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use openvds_pager::io::{IOManager, InMemoryIOManager, ObjectData, ObjectInfo, StorageBackend, WriteObjectOptions};
use openvds_pager::{
    AxisDescriptor, BrickSize, ChannelDescriptor, Format, LayoutDescriptor, Result, ValueRange, VdsError,
    VolumeDataLayout,
};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Vendor code reported by injected read failures
pub const INJECTED_ERROR_CODE: i32 = 503;

/// In-memory backend that counts calls and can slow down or fail reads
#[derive(Default)]
pub struct CountingIOManager {
    inner: InMemoryIOManager,
    reads: AtomicUsize,
    heads: AtomicUsize,
    writes: AtomicUsize,
    read_delay_ms: AtomicU64,
    failing_reads: AtomicUsize,
}

impl CountingIOManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delay every read by `delay`
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `count` reads with [`INJECTED_ERROR_CODE`]
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.inner.object_count()
    }
}

#[async_trait]
impl IOManager for CountingIOManager {
    async fn read_object(&self, name: &str, range: Option<Range<u64>>) -> Result<ObjectData> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let fail = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(VdsError::io(INJECTED_ERROR_CODE, format!("Injected failure reading {}", name)));
        }
        self.inner.read_object(name, range).await
    }

    async fn write_object(&self, name: &str, options: &WriteObjectOptions, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_object(name, options, data).await
    }

    async fn head(&self, name: &str) -> Result<ObjectInfo> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.inner.head(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::InMemory
    }
}

/// 100 x 20 voxels of `U8` in bricks of 32 with margins of 2, giving three
/// chunks along dimension 0:
///
/// | chunk | with margins | without margins |
/// |-------|--------------|-----------------|
/// | 0     | 0..36        | 0..34           |
/// | 1     | 32..68       | 34..66          |
/// | 2     | 64..100      | 66..100         |
pub fn margin_layout() -> VolumeDataLayout {
    VolumeDataLayout::new(
        vec![
            AxisDescriptor::new(100, "Sample", "ms", 0.0, 396.0),
            AxisDescriptor::new(20, "Trace", "", 1.0, 20.0),
        ],
        vec![ChannelDescriptor::new(Format::U8, "Amplitude", ValueRange::new(0.0, 255.0))],
        LayoutDescriptor::new(BrickSize::Size32).with_margins(2, 2),
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
