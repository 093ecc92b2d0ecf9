//! Page accessor: the resident page list of one layer

use crate::buffer::{copy_region, PageBuffer};
use crate::dimension_group::MAX_DIMENSIONALITY;
use crate::error::{Result, VdsError, NOT_FOUND_CODE};
use crate::layer::VolumeDataLayer;
use crate::layout::VolumeDataLayout;
use crate::page::{AccessMode, Page, PageSlot, PageState};
use crate::partition::{lod_size, IndexArray, VolumeDataPartition};
use crate::request::Request;
use crate::store::VolumeDataStore;
use crate::types::ChannelDescriptor;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Page counters of one accessor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageAccessorStats {
    /// Requests served by a resident page
    pub pages_found: u64,
    /// Chunks fetched and decoded
    pub pages_read: u64,
    /// Pages encoded and uploaded
    pub pages_written: u64,
    pub resident_pages: usize,
}

struct PageEntry {
    slot: Arc<PageSlot>,
    pins: usize,
}

struct PageList {
    /// Least recently used first
    entries: Vec<PageEntry>,
    max_pages: usize,
    /// Uploads of evicted pages, waited for by the next commit
    write_backs: Vec<(u64, Request<()>)>,
}

pub(crate) struct AccessorShared {
    layout: Arc<VolumeDataLayout>,
    layer: Arc<VolumeDataLayer>,
    store: Arc<VolumeDataStore>,
    mode: AccessMode,
    wait_timeout: Duration,
    lod_shift: [u32; MAX_DIMENSIONALITY],
    pages: Mutex<PageList>,
    page_released: Condvar,
    pages_found: AtomicU64,
    pages_read: AtomicU64,
    pages_written: AtomicU64,
}

impl AccessorShared {
    pub(crate) fn mode(&self) -> AccessMode {
        self.mode
    }

    pub(crate) fn record_page_read(&self) {
        self.pages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unpin(&self, slot: &Arc<PageSlot>) {
        let mut list = self.pages.lock();
        if let Some(entry) = list.entries.iter_mut().find(|e| Arc::ptr_eq(&e.slot, slot)) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        self.page_released.notify_all();
    }

    fn partition(&self) -> &VolumeDataPartition {
        self.layer.partition()
    }

    fn empty_buffer(&self) -> PageBuffer {
        PageBuffer::zeroed(self.layer.format(), self.layer.components(), [0; MAX_DIMENSIONALITY])
    }

    fn new_slot(&self, chunk: u64, create: bool) -> Result<PageSlot> {
        let partition = self.partition();
        let bounds = partition.chunk_min_max(chunk, true)?;
        let bounds_excluding_margin = partition.chunk_min_max(chunk, false)?;
        let shape = partition.chunk_voxel_shape(chunk)?;
        let (buffer, state, read) = self.initial_contents(chunk, shape, create);
        Ok(PageSlot::new(
            chunk,
            bounds,
            bounds_excluding_margin,
            self.lod_shift,
            buffer,
            state,
            read,
        ))
    }

    fn initial_contents(
        &self,
        chunk: u64,
        shape: IndexArray,
        create: bool,
    ) -> (PageBuffer, PageState, Option<Request<PageBuffer>>) {
        if create {
            let buffer = PageBuffer::zeroed(self.layer.format(), self.layer.components(), shape);
            return (buffer, PageState::Created, None);
        }
        let store = Arc::clone(&self.store);
        let layer = Arc::clone(&self.layer);
        let read = self.store.dispatcher().spawn_blocking(move || {
            let view = store.acquire_chunk_view(&layer, chunk)?;
            let data = view.data()?;
            store.codec().decode_chunk(
                &data,
                layer.format(),
                layer.components(),
                layer.dimension_group(),
                &shape,
            )
        });
        (self.empty_buffer(), PageState::Reading, Some(read))
    }

    /// Find or insert the page of `chunk` and pin it
    fn pin_page(self: &Arc<Self>, chunk: u64, create: bool) -> Result<Page> {
        if create && !self.mode.is_writable() {
            return Err(VdsError::State(
                "Cannot create pages with a read-only accessor".to_string(),
            ));
        }
        let total = self.partition().total_chunk_count();
        if chunk >= total {
            return Err(VdsError::IndexOutOfRange(format!(
                "Chunk {} is out of range, the layer has {} chunks",
                chunk, total
            )));
        }

        let mut list = self.pages.lock();
        if let Some(position) = list.entries.iter().position(|e| e.slot.chunk == chunk) {
            let mut entry = list.entries.remove(position);
            let slot = Arc::clone(&entry.slot);
            if slot.state() == PageState::Error {
                let (buffer, state, read) = self.initial_contents(chunk, slot.shape, create);
                slot.restart(buffer, state, read);
            } else if create {
                list.entries.insert(position, entry);
                return Err(VdsError::State(format!("Page {} already exists", chunk)));
            } else {
                self.pages_found.fetch_add(1, Ordering::Relaxed);
            }
            entry.pins += 1;
            list.entries.push(entry);
            return Ok(Page::new(slot, Arc::clone(self)));
        }

        self.make_room(&mut list)?;

        // A page evicted earlier may still be uploading
        if let Some((_, upload)) = list.write_backs.iter().rev().find(|(c, _)| *c == chunk) {
            upload.wait_for_finish();
        }

        let slot = Arc::new(self.new_slot(chunk, create)?);
        list.entries.push(PageEntry {
            slot: Arc::clone(&slot),
            pins: 1,
        });
        Ok(Page::new(slot, Arc::clone(self)))
    }

    /// Evict unpinned pages, oldest first, until a new page fits. Blocks
    /// while every page is pinned.
    fn make_room(&self, list: &mut MutexGuard<'_, PageList>) -> Result<()> {
        let deadline = Instant::now() + self.wait_timeout;
        while list.entries.len() >= list.max_pages {
            if let Some(position) = list.entries.iter().position(|e| e.pins == 0) {
                self.evict(list, position)?;
                continue;
            }
            tracing::debug!("All {} pages are pinned, waiting for a release", list.entries.len());
            if self.page_released.wait_until(list, deadline).timed_out() {
                return Err(VdsError::ResourceLimit(format!(
                    "No page was released within {:?} ({} pages pinned)",
                    self.wait_timeout,
                    list.entries.len()
                )));
            }
        }
        Ok(())
    }

    fn evict(&self, list: &mut PageList, position: usize) -> Result<()> {
        let slot = Arc::clone(&list.entries[position].slot);
        if slot.status.lock().needs_commit() {
            self.copy_margins(list, &slot);
            let upload = self.write_back(&slot)?;
            list.write_backs.push((slot.chunk, upload));
        } else {
            slot.cancel_read();
        }
        list.entries.remove(position);
        tracing::trace!("Evicted page {}", slot.chunk);
        Ok(())
    }

    /// Propagate the written region of `source` into every overlapping
    /// resident page
    fn copy_margins(&self, list: &PageList, source: &Arc<PageSlot>) {
        if source.status.lock().written.is_none() {
            return;
        }
        for entry in &list.entries {
            if Arc::ptr_eq(&entry.slot, source) {
                continue;
            }
            if entry.slot.wait().unwrap_or(false) {
                self.record_page_read();
            }
            if let Err(e) = source.copy_margin_to(&entry.slot, &self.lod_shift) {
                tracing::warn!(
                    "Copying margin of page {} into page {} failed: {}",
                    source.chunk,
                    entry.slot.chunk,
                    e
                );
            }
        }
    }

    fn write_back(&self, slot: &PageSlot) -> Result<Request<()>> {
        let encoded = {
            let buffer = slot.buffer.read();
            self.store.codec().encode_chunk(
                &buffer,
                self.layer.dimension_group(),
                self.layer.compression_method(),
                self.layer.compression_tolerance(),
            )?
        };
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        Ok(self.store.write_chunk(&self.layer, slot.chunk, encoded.into()))
    }
}

/// Reads, creates and commits the pages of one layer.
///
/// At most `max_pages` pages are resident. When the list is full the oldest
/// unpinned page is evicted (dirty pages are uploaded first); when every page
/// is pinned, creating or reading another page blocks until one is released.
pub struct VolumeDataPageAccessor {
    shared: Arc<AccessorShared>,
}

impl VolumeDataPageAccessor {
    pub(crate) fn new(
        layout: Arc<VolumeDataLayout>,
        layer: VolumeDataLayer,
        store: Arc<VolumeDataStore>,
        mode: AccessMode,
        max_pages: usize,
        wait_timeout: Duration,
    ) -> Result<Self> {
        if max_pages == 0 {
            return Err(VdsError::InvalidArgument("max_pages must be at least 1".to_string()));
        }
        let mut lod_shift = [0; MAX_DIMENSIONALITY];
        for (d, shift) in lod_shift.iter_mut().enumerate() {
            *shift = layer.partition().lod_shift(d);
        }
        tracing::debug!(
            "Page accessor for {} ({:?}, {} pages)",
            layer.name(),
            mode,
            max_pages
        );
        Ok(Self {
            shared: Arc::new(AccessorShared {
                layout,
                layer: Arc::new(layer),
                store,
                mode,
                wait_timeout,
                lod_shift,
                pages: Mutex::new(PageList {
                    entries: Vec::new(),
                    max_pages,
                    write_backs: Vec::new(),
                }),
                page_released: Condvar::new(),
                pages_found: AtomicU64::new(0),
                pages_read: AtomicU64::new(0),
                pages_written: AtomicU64::new(0),
            }),
        })
    }

    pub fn layout(&self) -> &Arc<VolumeDataLayout> {
        &self.shared.layout
    }

    pub fn layer(&self) -> &VolumeDataLayer {
        &self.shared.layer
    }

    pub fn access_mode(&self) -> AccessMode {
        self.shared.mode
    }

    pub fn lod(&self) -> u32 {
        self.shared.layer.lod()
    }

    pub fn channel_index(&self) -> usize {
        self.shared.layer.channel_index()
    }

    pub fn channel_descriptor(&self) -> &ChannelDescriptor {
        self.shared.layer.channel_descriptor()
    }

    /// Samples per dimension at this accessor's LOD
    pub fn num_samples(&self) -> IndexArray {
        let partition = self.shared.partition();
        let mut samples = [1; MAX_DIMENSIONALITY];
        for (d, count) in samples.iter_mut().enumerate() {
            *count = lod_size(0, partition.num_samples(d) as i64, partition.lod_shift(d), true) as usize;
        }
        samples
    }

    pub fn chunk_count(&self) -> u64 {
        self.shared.partition().total_chunk_count()
    }

    pub fn chunk_min_max(&self, chunk: u64) -> Result<(IndexArray, IndexArray)> {
        self.shared.partition().chunk_min_max(chunk, true)
    }

    pub fn chunk_min_max_excluding_margin(&self, chunk: u64) -> Result<(IndexArray, IndexArray)> {
        self.shared.partition().chunk_min_max(chunk, false)
    }

    /// Chunk containing the voxel at `position`
    pub fn chunk_index(&self, position: &[usize]) -> Result<u64> {
        self.shared.partition().chunk_index_from_position(position)
    }

    pub fn chunks_in_region(&self, min: &IndexArray, max: &IndexArray) -> Result<Vec<u64>> {
        self.shared.partition().chunks_in_region(min, max)
    }

    pub fn max_pages(&self) -> usize {
        self.shared.pages.lock().max_pages
    }

    /// Change the page limit. Unpinned pages beyond the new limit are
    /// evicted right away.
    pub fn set_max_pages(&self, max_pages: usize) -> Result<()> {
        if max_pages == 0 {
            return Err(VdsError::InvalidArgument("max_pages must be at least 1".to_string()));
        }
        let mut list = self.shared.pages.lock();
        list.max_pages = max_pages;
        while list.entries.len() > max_pages {
            match list.entries.iter().position(|e| e.pins == 0) {
                Some(position) => self.shared.evict(&mut list, position)?,
                None => break,
            }
        }
        Ok(())
    }

    /// New zero-filled page for `chunk`, margins included
    pub fn create_page(&self, chunk: u64) -> Result<Page> {
        self.shared.pin_page(chunk, true)
    }

    /// Start reading `chunk` without waiting; see [`Page::wait`]
    pub fn prepare_read_page(&self, chunk: u64) -> Result<Page> {
        self.shared.pin_page(chunk, false)
    }

    /// Read `chunk`, blocking until it is decoded. A failed read leaves the
    /// page in the error state until the chunk is read again.
    pub fn read_page(&self, chunk: u64) -> Result<Page> {
        let page = self.prepare_read_page(chunk)?;
        page.wait()?;
        Ok(page)
    }

    /// Read the chunk containing the voxel at `position`
    pub fn read_page_at_position(&self, position: &[usize]) -> Result<Page> {
        let chunk = self.chunk_index(position)?;
        self.read_page(chunk)
    }

    /// Upload every page changed since the last commit and wait for the
    /// uploads. Pages whose upload fails stay dirty and the first error is
    /// returned.
    pub fn commit(&self) -> Result<()> {
        let shared = &self.shared;
        let mut list = shared.pages.lock();

        for entry in &list.entries {
            if entry.slot.wait().unwrap_or(false) {
                shared.record_page_read();
            }
        }
        for entry in &list.entries {
            shared.copy_margins(&list, &entry.slot);
        }

        let mut first_error = None;
        let mut uploads = Vec::new();
        for entry in &list.entries {
            let slot = &entry.slot;
            let previous = {
                let mut status = slot.status.lock();
                if !status.needs_commit() {
                    continue;
                }
                std::mem::replace(&mut status.state, PageState::Committing)
            };
            match shared.write_back(slot) {
                Ok(upload) => uploads.push((Arc::clone(slot), previous, upload)),
                Err(e) => {
                    slot.status.lock().state = previous;
                    first_error.get_or_insert(e);
                }
            }
        }

        for (chunk, upload) in list.write_backs.drain(..) {
            if !upload.wait_for_finish() {
                if let Some(e) = upload.error() {
                    tracing::warn!("Upload of evicted page {} failed: {}", chunk, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        let committed = uploads.len();
        for (slot, previous, upload) in uploads {
            let mut status = slot.status.lock();
            if upload.wait_for_finish() {
                status.state = PageState::Ready;
                status.written = None;
                status.copied_to.clear();
            } else {
                status.state = previous;
                if let Some(e) = upload.error() {
                    tracing::warn!("Upload of page {} failed: {}", slot.chunk, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(list);

        tracing::debug!("Committed {} pages of {}", committed, shared.layer.name());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Check a region given in samples of this accessor's LOD and return it
    /// in voxel coordinates
    fn region_voxels(&self, min: &IndexArray, max: &IndexArray) -> Result<(IndexArray, IndexArray)> {
        let samples = self.num_samples();
        let mut voxel_min = [0; MAX_DIMENSIONALITY];
        let mut voxel_max = [1; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            if min[d] >= max[d] || max[d] > samples[d] {
                return Err(VdsError::IndexOutOfRange(format!(
                    "Region {}..{} in dimension {} is empty or outside 0..{}",
                    min[d], max[d], d, samples[d]
                )));
            }
            let shift = self.shared.lod_shift[d];
            voxel_min[d] = min[d] << shift;
            voxel_max[d] = ((max[d] - 1) << shift) + 1;
        }
        Ok((voxel_min, voxel_max))
    }

    /// Copy the samples `[min, max)` (in samples of this accessor's LOD)
    /// into a dense buffer
    pub fn read_region(&self, min: &IndexArray, max: &IndexArray) -> Result<PageBuffer> {
        let (voxel_min, voxel_max) = self.region_voxels(min, max)?;
        let mut shape = [1; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            shape[d] = max[d] - min[d];
        }
        let layer = &self.shared.layer;
        let mut region = PageBuffer::zeroed(layer.format(), layer.components(), shape);

        for chunk in self.chunks_in_region(&voxel_min, &voxel_max)? {
            let (owned_min, owned_max) = self.chunk_min_max_excluding_margin(chunk)?;
            let Some((lo, hi)) = self.owned_samples(&owned_min, &owned_max, min, max) else {
                continue;
            };
            let page = self.read_page(chunk)?;
            let buffer = page.buffer()?;
            let (page_origin, region_origin, size) = self.copy_extent(&page, &lo, &hi, min);
            copy_region(&buffer, &page_origin, &mut region, &region_origin, &size)?;
        }
        Ok(region)
    }

    /// Write a dense buffer to the samples `[min, max)` (in samples of this
    /// accessor's LOD), including the margins of every affected page.
    /// Chunks that do not exist yet are created.
    pub fn write_region(&self, min: &IndexArray, max: &IndexArray, data: &PageBuffer) -> Result<()> {
        let (voxel_min, voxel_max) = self.region_voxels(min, max)?;
        for d in 0..MAX_DIMENSIONALITY {
            if data.shape()[d] != max[d] - min[d] {
                return Err(VdsError::InvalidArgument(format!(
                    "Buffer shape {:?} does not match region {:?}..{:?}",
                    data.shape(),
                    min,
                    max
                )));
            }
        }

        // Pages whose margins reach into the region
        let partition = self.shared.partition();
        let mut search_min = voxel_min;
        let mut search_max = voxel_max;
        for d in partition.dimension_group().dimensions() {
            let margin = partition.negative_margin(d) + partition.positive_margin(d);
            search_min[d] = search_min[d].saturating_sub(margin);
            search_max[d] = (search_max[d] + margin).min(partition.num_samples(d));
        }

        for chunk in self.chunks_in_region(&search_min, &search_max)? {
            let (page_min, page_max) = self.chunk_min_max(chunk)?;
            let shape = partition.chunk_voxel_shape(chunk)?;
            let mut lo = [0; MAX_DIMENSIONALITY];
            let mut hi = [0; MAX_DIMENSIONALITY];
            let mut overlaps = true;
            for d in 0..MAX_DIMENSIONALITY {
                let first = page_min[d] >> self.shared.lod_shift[d];
                lo[d] = first.max(min[d]);
                hi[d] = (first + shape[d]).min(max[d]);
                overlaps &= lo[d] < hi[d];
            }
            if !overlaps {
                continue;
            }

            let page = match self.read_page(chunk) {
                Ok(page) => page,
                Err(VdsError::Io { code, .. }) if code == NOT_FOUND_CODE => self.create_page(chunk)?,
                Err(e) => return Err(e),
            };
            let (page_origin, region_origin, size) = self.copy_extent(&page, &lo, &hi, min);
            {
                let mut buffer = page.writable_buffer()?;
                copy_region(data, &region_origin, &mut buffer, &page_origin, &size)?;
            }

            let mut written_min = [0; MAX_DIMENSIONALITY];
            let mut written_max = [0; MAX_DIMENSIONALITY];
            for d in 0..MAX_DIMENSIONALITY {
                let shift = self.shared.lod_shift[d];
                written_min[d] = (lo[d] << shift).max(page_min[d]);
                written_max[d] = (hi[d] << shift).min(page_max[d]);
            }
            page.update_written_region(&written_min, &written_max)?;
        }
        Ok(())
    }

    /// Samples owned by a chunk (each sample belongs to the chunk owning its
    /// first voxel), clipped to `[min, max)`
    fn owned_samples(
        &self,
        owned_min: &IndexArray,
        owned_max: &IndexArray,
        min: &IndexArray,
        max: &IndexArray,
    ) -> Option<(IndexArray, IndexArray)> {
        let mut lo = [0; MAX_DIMENSIONALITY];
        let mut hi = [0; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            let shift = self.shared.lod_shift[d];
            let round_up = (1usize << shift) - 1;
            lo[d] = ((owned_min[d] + round_up) >> shift).max(min[d]);
            hi[d] = ((owned_max[d] + round_up) >> shift).min(max[d]);
            if lo[d] >= hi[d] {
                return None;
            }
        }
        Some((lo, hi))
    }

    fn copy_extent(
        &self,
        page: &Page,
        lo: &IndexArray,
        hi: &IndexArray,
        region_min: &IndexArray,
    ) -> (IndexArray, IndexArray, IndexArray) {
        let (page_min, _) = page.min_max();
        let mut page_origin = [0; MAX_DIMENSIONALITY];
        let mut region_origin = [0; MAX_DIMENSIONALITY];
        let mut size = [0; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            page_origin[d] = lo[d] - (page_min[d] >> self.shared.lod_shift[d]);
            region_origin[d] = lo[d] - region_min[d];
            size[d] = hi[d] - lo[d];
        }
        (page_origin, region_origin, size)
    }

    pub fn stats(&self) -> PageAccessorStats {
        PageAccessorStats {
            pages_found: self.shared.pages_found.load(Ordering::Relaxed),
            pages_read: self.shared.pages_read.load(Ordering::Relaxed),
            pages_written: self.shared.pages_written.load(Ordering::Relaxed),
            resident_pages: self.shared.pages.lock().entries.len(),
        }
    }
}

impl Drop for VolumeDataPageAccessor {
    fn drop(&mut self) {
        let list = self.shared.pages.lock();
        let dirty = list
            .entries
            .iter()
            .filter(|e| e.slot.status.lock().needs_commit())
            .count();
        if dirty > 0 {
            tracing::warn!(
                "Page accessor for {} dropped with {} uncommitted pages",
                self.shared.layer.name(),
                dirty
            );
        }
    }
}

impl std::fmt::Debug for VolumeDataPageAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDataPageAccessor")
            .field("layer", &self.shared.layer.name())
            .field("mode", &self.shared.mode)
            .field("stats", &self.stats())
            .finish()
    }
}
