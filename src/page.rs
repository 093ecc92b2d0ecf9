//! Pages: decoded chunks held by a page accessor

use crate::buffer::{PageBuffer, VoxelValue};
use crate::dimension_group::MAX_DIMENSIONALITY;
use crate::error::{Result, VdsError};
use crate::page_accessor::AccessorShared;
use crate::partition::IndexArray;
use crate::request::Request;
use ndarray::{ArrayViewD, ArrayViewMutD};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// What an accessor may do with its pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Pages can only be read
    ReadOnly,
    /// Existing chunks can be read and modified
    ReadWrite,
    /// Chunks are created from scratch (reading existing chunks is allowed)
    Create,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Lifecycle state of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Zero-filled page that has never been committed
    Created,
    /// The chunk is being fetched and decoded
    Reading,
    /// Buffer is valid and matches storage
    Ready,
    /// Buffer has changes not yet committed
    Dirty,
    /// Changes are being uploaded
    Committing,
    /// The handle was released
    Released,
    /// Reading the chunk failed
    Error,
}

pub(crate) struct SlotStatus {
    pub(crate) state: PageState,
    pub(crate) error: Option<VdsError>,
    pub(crate) read: Option<Request<PageBuffer>>,
    /// Written region in voxel coordinates, used to update the margins of
    /// neighbouring pages
    pub(crate) written: Option<(IndexArray, IndexArray)>,
    pub(crate) copied_to: Vec<u64>,
}

impl SlotStatus {
    pub(crate) fn needs_commit(&self) -> bool {
        matches!(self.state, PageState::Created | PageState::Dirty)
    }
}

/// Chunk geometry and data shared by every handle to one page.
///
/// Lock order is `status` before `buffer`.
pub(crate) struct PageSlot {
    pub(crate) chunk: u64,
    pub(crate) min: IndexArray,
    pub(crate) max: IndexArray,
    pub(crate) min_excluding_margin: IndexArray,
    pub(crate) max_excluding_margin: IndexArray,
    /// First LOD sample held by the buffer in each dimension
    pub(crate) sample_min: IndexArray,
    pub(crate) shape: IndexArray,
    pub(crate) buffer: RwLock<PageBuffer>,
    pub(crate) status: Mutex<SlotStatus>,
}

impl PageSlot {
    pub(crate) fn new(
        chunk: u64,
        bounds: (IndexArray, IndexArray),
        bounds_excluding_margin: (IndexArray, IndexArray),
        lod_shift: [u32; MAX_DIMENSIONALITY],
        buffer: PageBuffer,
        state: PageState,
        read: Option<Request<PageBuffer>>,
    ) -> Self {
        let shape = *buffer.shape();
        let mut sample_min = [0; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            sample_min[d] = bounds.0[d] >> lod_shift[d];
        }
        Self {
            chunk,
            min: bounds.0,
            max: bounds.1,
            min_excluding_margin: bounds_excluding_margin.0,
            max_excluding_margin: bounds_excluding_margin.1,
            sample_min,
            shape,
            buffer: RwLock::new(buffer),
            status: Mutex::new(SlotStatus {
                state,
                error: None,
                read,
                written: None,
                copied_to: Vec::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> PageState {
        self.status.lock().state
    }

    /// Wait for a pending read and install its result. Returns true when
    /// this call installed the decoded buffer.
    pub(crate) fn wait(&self) -> Result<bool> {
        let pending = {
            let status = self.status.lock();
            match status.state {
                PageState::Reading => status.read.clone(),
                PageState::Error => return Err(stored_error(&status)),
                _ => return Ok(false),
            }
        };
        if let Some(request) = pending {
            request.wait_for_finish();
        }

        let mut status = self.status.lock();
        if status.state != PageState::Reading {
            return match status.state {
                PageState::Error => Err(stored_error(&status)),
                _ => Ok(false),
            };
        }
        let outcome = match status.read.take() {
            Some(request) => request.take(),
            None => Err(VdsError::State(format!("Page {} has no read in flight", self.chunk))),
        };
        match outcome {
            Ok(buffer) => {
                *self.buffer.write() = buffer;
                status.state = PageState::Ready;
                tracing::trace!("Page {} ready", self.chunk);
                Ok(true)
            }
            Err(e) => {
                tracing::debug!("Reading page {} failed: {}", self.chunk, e);
                status.error = Some(e.clone());
                status.state = PageState::Error;
                Err(e)
            }
        }
    }

    /// Start over after a failed read
    pub(crate) fn restart(&self, buffer: PageBuffer, state: PageState, read: Option<Request<PageBuffer>>) {
        let mut status = self.status.lock();
        *self.buffer.write() = buffer;
        status.state = state;
        status.error = None;
        status.read = read;
        status.written = None;
        status.copied_to.clear();
    }

    /// Cancel a read nobody is waiting for anymore
    pub(crate) fn cancel_read(&self) {
        if let Some(request) = self.status.lock().read.as_ref() {
            request.cancel();
        }
    }

    fn check_in_bounds(&self, min: &IndexArray, max: &IndexArray) -> Result<()> {
        for d in 0..MAX_DIMENSIONALITY {
            if min[d] >= max[d] || min[d] < self.min[d] || max[d] > self.max[d] {
                return Err(VdsError::IndexOutOfRange(format!(
                    "Written region {}..{} in dimension {} is outside page {} ({}..{})",
                    min[d], max[d], d, self.chunk, self.min[d], self.max[d]
                )));
            }
        }
        Ok(())
    }

    /// Copy the written region of this page into the margin of `target`.
    /// Returns false when there was nothing to copy.
    pub(crate) fn copy_margin_to(&self, target: &PageSlot, lod_shift: &[u32; MAX_DIMENSIONALITY]) -> Result<bool> {
        if std::ptr::eq(self, target) {
            return Ok(false);
        }
        let (written_min, written_max) = {
            let status = self.status.lock();
            match status.written {
                Some(written) if !status.copied_to.contains(&target.chunk) => written,
                _ => return Ok(false),
            }
        };

        let mut source_origin = [0; MAX_DIMENSIONALITY];
        let mut target_origin = [0; MAX_DIMENSIONALITY];
        let mut size = [0; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            let shift = lod_shift[d];
            let lo = (written_min[d] >> shift).max(target.sample_min[d]);
            let hi = (((written_max[d] - 1) >> shift) + 1).min(target.sample_min[d] + target.shape[d]);
            if lo >= hi {
                return Ok(false);
            }
            source_origin[d] = lo - self.sample_min[d];
            target_origin[d] = lo - target.sample_min[d];
            size[d] = hi - lo;
        }

        if !matches!(
            target.state(),
            PageState::Created | PageState::Ready | PageState::Dirty
        ) {
            return Ok(false);
        }
        {
            let source = self.buffer.read();
            let mut destination = target.buffer.write();
            crate::buffer::copy_region(&source, &source_origin, &mut destination, &target_origin, &size)?;
        }
        {
            let mut target_status = target.status.lock();
            if target_status.state == PageState::Ready {
                target_status.state = PageState::Dirty;
            }
        }

        self.status.lock().copied_to.push(target.chunk);
        Ok(true)
    }
}

fn stored_error(status: &SlotStatus) -> VdsError {
    status
        .error
        .clone()
        .unwrap_or_else(|| VdsError::State("Page is in error state".to_string()))
}

/// A pinned page of a [`VolumeDataPageAccessor`](crate::VolumeDataPageAccessor).
///
/// The page stays resident while the handle is held. Releasing a dirty page
/// leaves it with the accessor until the next commit.
pub struct Page {
    slot: Arc<PageSlot>,
    accessor: Arc<AccessorShared>,
    released: bool,
}

impl Page {
    pub(crate) fn new(slot: Arc<PageSlot>, accessor: Arc<AccessorShared>) -> Self {
        Self {
            slot,
            accessor,
            released: false,
        }
    }

    pub fn state(&self) -> PageState {
        if self.released {
            PageState::Released
        } else {
            self.slot.state()
        }
    }

    pub fn chunk_index(&self) -> u64 {
        self.slot.chunk
    }

    /// Voxel bounds of the page buffer, margins included
    pub fn min_max(&self) -> (IndexArray, IndexArray) {
        (self.slot.min, self.slot.max)
    }

    pub fn min_max_excluding_margin(&self) -> (IndexArray, IndexArray) {
        (self.slot.min_excluding_margin, self.slot.max_excluding_margin)
    }

    /// Buffer shape in LOD samples
    pub fn shape(&self) -> IndexArray {
        self.slot.shape
    }

    /// Block until the chunk has been read
    pub fn wait(&self) -> Result<()> {
        self.check_held()?;
        if self.slot.wait()? {
            self.accessor.record_page_read();
        }
        Ok(())
    }

    /// Error of a failed read
    pub fn error(&self) -> Option<VdsError> {
        self.slot.status.lock().error.clone()
    }

    fn check_held(&self) -> Result<()> {
        if self.released {
            return Err(VdsError::State(format!("Page {} was released", self.slot.chunk)));
        }
        Ok(())
    }

    /// The decoded buffer. Use [`PageBuffer::pitch`] to address voxels.
    pub fn buffer(&self) -> Result<RwLockReadGuard<'_, PageBuffer>> {
        self.wait()?;
        Ok(self.slot.buffer.read())
    }

    /// Writable access to the buffer; the page becomes dirty
    pub fn writable_buffer(&self) -> Result<RwLockWriteGuard<'_, PageBuffer>> {
        self.check_writable()?;
        self.wait()?;
        let mut status = self.slot.status.lock();
        if status.state == PageState::Ready {
            status.state = PageState::Dirty;
        }
        let buffer = self.slot.buffer.write();
        drop(status);
        Ok(buffer)
    }

    fn check_writable(&self) -> Result<()> {
        if !self.accessor.mode().is_writable() {
            return Err(VdsError::State(
                "Cannot write to a page of a read-only accessor".to_string(),
            ));
        }
        Ok(())
    }

    /// Record that the voxels `[min, max)` were modified
    pub fn update_written_region(&self, min: &IndexArray, max: &IndexArray) -> Result<()> {
        self.check_held()?;
        self.check_writable()?;
        self.slot.check_in_bounds(min, max)?;
        self.slot.wait()?;

        let mut status = self.slot.status.lock();
        status.written = Some(match status.written {
            Some((old_min, old_max)) => {
                let mut new_min = *min;
                let mut new_max = *max;
                for d in 0..MAX_DIMENSIONALITY {
                    new_min[d] = new_min[d].min(old_min[d]);
                    new_max[d] = new_max[d].max(old_max[d]);
                }
                (new_min, new_max)
            }
            None => (*min, *max),
        });
        status.copied_to.clear();
        if status.state != PageState::Created {
            status.state = PageState::Dirty;
        }
        Ok(())
    }

    /// Run `f` with an ndarray view of the buffer
    pub fn with_view<T: VoxelValue, R>(&self, f: impl FnOnce(ArrayViewD<'_, T>) -> R) -> Result<R> {
        let buffer = self.buffer()?;
        let view = buffer.view::<T>()?;
        Ok(f(view))
    }

    /// Run `f` with a mutable ndarray view of the buffer
    pub fn with_view_mut<T: VoxelValue, R>(&self, f: impl FnOnce(ArrayViewMutD<'_, T>) -> R) -> Result<R> {
        let mut buffer = self.writable_buffer()?;
        let view = buffer.view_mut::<T>()?;
        Ok(f(view))
    }

    /// Drop this handle's pin. Also done on drop.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.accessor.unpin(&self.slot);
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("chunk", &self.slot.chunk)
            .field("state", &self.state())
            .finish()
    }
}
