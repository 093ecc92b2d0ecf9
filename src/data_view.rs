//! Reference counted cache of byte ranges read through a [`DataProvider`]
//!
//! A [`DataViewManager`] hands out [`DataViewHandle`]s keyed by exact
//! `(offset, size)`. Holders of the same key share one view and one fetch. A
//! view lives exactly as long as some handle holds it, or until a prefetched
//! view that nobody acquired is retired. There is no LRU eviction.
//!
//! Lock order: the manager's index lock is never held while a view's own
//! lock is taken or while fetches are started.

use crate::data_provider::DataProvider;
use crate::error::{Result, VdsError};
use crate::request::Request;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// Default upper bound for one sub-fetch of a remote view
pub const DEFAULT_SUB_FETCH_SIZE: u64 = 1 << 23;

/// Key of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRequestInfo {
    pub offset: u64,
    pub size: u64,
}

impl DataRequestInfo {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

enum ViewState {
    /// Nothing requested yet
    Idle,
    /// Sub-fetches in flight, in offset order
    Fetching(Vec<Request<Bytes>>),
    Ready(Bytes),
    Failed(VdsError),
}

type FailureSink = Box<dyn Fn(DataRequestInfo, VdsError) + Send + Sync>;

/// A realized (or realizing) byte range
pub struct DataView {
    key: DataRequestInfo,
    provider: Arc<DataProvider>,
    sub_fetch_size: u64,
    state: Mutex<ViewState>,
    on_failure: Option<Arc<FailureSink>>,
}

impl DataView {
    fn new(
        key: DataRequestInfo,
        provider: Arc<DataProvider>,
        sub_fetch_size: u64,
        on_failure: Option<Arc<FailureSink>>,
    ) -> Self {
        Self {
            key,
            provider,
            sub_fetch_size: sub_fetch_size.max(1),
            state: Mutex::new(ViewState::Idle),
            on_failure,
        }
    }

    /// Offset of the view in the file or object
    pub fn pos(&self) -> u64 {
        self.key.offset
    }

    pub fn size(&self) -> u64 {
        self.key.size
    }

    pub fn key(&self) -> DataRequestInfo {
        self.key
    }

    /// True once the bytes are available
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), ViewState::Ready(_))
    }

    fn issue_fetches(&self) -> Vec<Request<Bytes>> {
        let mut requests = Vec::new();
        let end = self.key.offset + self.key.size;
        let mut offset = self.key.offset;
        loop {
            let size = self.sub_fetch_size.min(end - offset);
            let request = self.provider.fetch(offset, size);
            if let Some(sink) = &self.on_failure {
                let sink = Arc::clone(sink);
                let key = self.key;
                request.on_complete(Box::new(move |outcome| {
                    if let Err(e) = outcome {
                        sink(key, e);
                    }
                }));
            }
            requests.push(request);
            offset += size;
            if offset >= end {
                break;
            }
        }
        tracing::trace!(
            "Issued {} fetches for {} bytes at {}",
            requests.len(),
            self.key.size,
            self.key.offset
        );
        requests
    }

    /// Leave the `Idle` state: remote views issue their fetches, local views
    /// are read right away.
    fn realize(&self, state: &mut ViewState) {
        if !matches!(*state, ViewState::Idle) {
            return;
        }
        *state = if self.provider.is_remote() {
            ViewState::Fetching(self.issue_fetches())
        } else {
            match self.provider.read_bytes(self.key.offset, self.key.size) {
                Ok(data) => ViewState::Ready(data),
                Err(e) => {
                    if let Some(sink) = &self.on_failure {
                        sink(self.key, e.clone());
                    }
                    ViewState::Failed(e)
                }
            }
        };
    }

    /// Populate the view without waiting for remote fetches
    fn start(&self) {
        let mut state = self.state.lock();
        self.realize(&mut *state);
    }

    /// The bytes of the view, blocking until every sub-fetch has completed
    pub fn data(&self) -> Result<Bytes> {
        let mut state = self.state.lock();
        self.realize(&mut *state);

        if let ViewState::Fetching(requests) = &*state {
            let assembled = assemble(requests, self.key.size);
            *state = match assembled {
                Ok(data) => ViewState::Ready(data),
                Err(e) => {
                    // Completion callbacks may still be running
                    if let Some(sink) = &self.on_failure {
                        sink(self.key, e.clone());
                    }
                    ViewState::Failed(e)
                }
            };
        }

        match &*state {
            ViewState::Ready(data) => Ok(data.clone()),
            ViewState::Failed(e) => Err(e.clone()),
            _ => Err(VdsError::State("View was not realized".to_string())),
        }
    }
}

fn assemble(requests: &[Request<Bytes>], size: u64) -> Result<Bytes> {
    if let [single] = requests {
        return single.result();
    }
    let mut buffer = BytesMut::with_capacity(size as usize);
    for request in requests {
        buffer.extend_from_slice(&request.result()?);
    }
    Ok(buffer.freeze())
}

impl Drop for DataView {
    fn drop(&mut self) {
        if let ViewState::Fetching(requests) = &*self.state.lock() {
            for request in requests.iter().filter(|r| !r.is_done()) {
                request.cancel();
            }
        }
    }
}

/// Settings of a [`DataViewManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataViewManagerConfig {
    /// Budget for prefetched bytes
    pub prefetch_limit: u64,
    /// Largest single fetch issued for a remote view
    pub sub_fetch_size: u64,
}

impl Default for DataViewManagerConfig {
    fn default() -> Self {
        Self {
            prefetch_limit: 256 << 20,
            sub_fetch_size: DEFAULT_SUB_FETCH_SIZE,
        }
    }
}

/// Counters describing cache behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewManagerStats {
    pub hits: u64,
    pub misses: u64,
    pub prefetch_admitted: u64,
    /// Bytes of admitted prefetch views still resident
    pub prefetch_usage: u64,
    pub resident_views: usize,
    pub pending_prefetch: usize,
}

struct ViewEntry {
    view: Arc<DataView>,
    refs: usize,
    /// Admitted from the prefetch queue and counted against the budget
    prefetched: bool,
}

#[derive(Default)]
struct ManagerState {
    views: BTreeMap<DataRequestInfo, ViewEntry>,
    pending: VecDeque<DataRequestInfo>,
    usage: u64,
    failed: HashMap<DataRequestInfo, VdsError>,
    stats: ViewManagerStats,
}

/// Deduplicating, memory bounded cache of views over one provider
pub struct DataViewManager {
    provider: Arc<DataProvider>,
    config: DataViewManagerConfig,
    state: Mutex<ManagerState>,
    failure_sink: Arc<FailureSink>,
}

impl DataViewManager {
    pub fn new(provider: Arc<DataProvider>, config: DataViewManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<DataViewManager>| {
            let weak = weak.clone();
            let sink: FailureSink = Box::new(move |key, error| {
                if let Some(manager) = weak.upgrade() {
                    manager.record_failure(key, error);
                }
            });
            Self {
                provider,
                config,
                state: Mutex::new(ManagerState::default()),
                failure_sink: Arc::new(sink),
            }
        })
    }

    pub fn provider(&self) -> &Arc<DataProvider> {
        &self.provider
    }

    pub fn config(&self) -> DataViewManagerConfig {
        self.config
    }

    fn record_failure(&self, key: DataRequestInfo, error: VdsError) {
        // Released and retired views cancel their fetches; the key stays readable
        if matches!(error, VdsError::Canceled(_)) {
            return;
        }
        let mut state = self.state.lock();
        if state.failed.contains_key(&key) {
            return;
        }
        tracing::warn!(
            "Fetch of {} bytes at {} from {} failed: {}",
            key.size,
            key.offset,
            self.provider.file_or_object_name(),
            error
        );
        state.failed.insert(key, error);
    }

    /// Error recorded for `key`, if a fetch of it failed
    pub fn failure(&self, key: DataRequestInfo) -> Option<VdsError> {
        self.state.lock().failed.get(&key).cloned()
    }

    /// Forget every recorded failure so the keys can be fetched again
    pub fn clear_failures(&self) {
        self.state.lock().failed.clear();
    }

    /// Get a shared view of `[offset, offset + size)`.
    ///
    /// An existing view for the exact key is shared, otherwise a new one is
    /// created. With `populate` the fetch starts now (a local file is read
    /// before returning), otherwise on first access. Fails immediately if a fetch of this key failed before.
    pub fn acquire_view(self: &Arc<Self>, offset: u64, size: u64, populate: bool) -> Result<DataViewHandle> {
        if size == 0 {
            return Err(VdsError::InvalidArgument("Cannot view an empty range".to_string()));
        }
        let key = DataRequestInfo::new(offset, size);

        let view = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(error) = state.failed.get(&key) {
                return Err(error.clone());
            }
            match state.views.get_mut(&key) {
                Some(entry) => {
                    entry.refs += 1;
                    let view = Arc::clone(&entry.view);
                    state.stats.hits += 1;
                    view
                }
                None => {
                    let view = Arc::new(self.new_view(key));
                    state.views.insert(
                        key,
                        ViewEntry {
                            view: Arc::clone(&view),
                            refs: 1,
                            prefetched: false,
                        },
                    );
                    state.stats.misses += 1;
                    view
                }
            }
        };

        if populate {
            view.start();
        }

        Ok(DataViewHandle {
            view,
            manager: Arc::clone(self),
        })
    }

    fn new_view(&self, key: DataRequestInfo) -> DataView {
        DataView::new(
            key,
            Arc::clone(&self.provider),
            self.config.sub_fetch_size,
            Some(Arc::clone(&self.failure_sink)),
        )
    }

    fn add_ref(&self, key: DataRequestInfo) {
        if let Some(entry) = self.state.lock().views.get_mut(&key) {
            entry.refs += 1;
        }
    }

    fn release(&self, key: DataRequestInfo) {
        let started = {
            let mut state = self.state.lock();
            let remove = match state.views.get_mut(&key) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            };
            if !remove {
                return;
            }
            if let Some(entry) = state.views.remove(&key) {
                if entry.prefetched {
                    state.usage -= key.size;
                }
            }
            self.admit_prefetch(&mut state)
        };
        for view in started {
            view.start();
        }
    }

    /// Queue ranges to prefetch, in order. Admission stops at the budget and
    /// resumes whenever views are released.
    pub fn add_data_requests(&self, requests: impl IntoIterator<Item = DataRequestInfo>) {
        let started = {
            let mut state = self.state.lock();
            state.pending.extend(requests);
            self.admit_prefetch(&mut state)
        };
        for view in started {
            view.start();
        }
    }

    /// Admit queued requests while they fit in the budget. Returns the new
    /// views; the caller starts them after dropping the lock.
    fn admit_prefetch(&self, state: &mut ManagerState) -> Vec<Arc<DataView>> {
        let mut started = Vec::new();
        while let Some(&key) = state.pending.front() {
            if state.views.contains_key(&key) || state.failed.contains_key(&key) {
                state.pending.pop_front();
                continue;
            }
            if key.size > self.config.prefetch_limit {
                tracing::debug!("Skipping prefetch of {} bytes, larger than the budget", key.size);
                state.pending.pop_front();
                continue;
            }
            if state.usage + key.size > self.config.prefetch_limit {
                break;
            }
            state.pending.pop_front();

            let view = Arc::new(self.new_view(key));
            state.views.insert(
                key,
                ViewEntry {
                    view: Arc::clone(&view),
                    refs: 0,
                    prefetched: true,
                },
            );
            state.usage += key.size;
            state.stats.prefetch_admitted += 1;
            started.push(view);
        }
        started
    }

    /// Drop prefetched views nobody has acquired whose key sorts before `key`
    pub fn retire_views_before(&self, key: DataRequestInfo) {
        self.retire(|k| *k < key);
    }

    /// Drop every prefetched view nobody has acquired, and the queue
    pub fn retire_all_views(&self) {
        self.state.lock().pending.clear();
        self.retire(|_| true);
    }

    fn retire(&self, filter: impl Fn(&DataRequestInfo) -> bool) {
        let mut retired = Vec::new();
        let started = {
            let mut state = self.state.lock();
            let keys: Vec<DataRequestInfo> = state
                .views
                .iter()
                .filter(|(k, e)| e.refs == 0 && filter(k))
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                if let Some(entry) = state.views.remove(&key) {
                    if entry.prefetched {
                        state.usage -= key.size;
                    }
                    retired.push(entry);
                }
            }
            self.admit_prefetch(&mut state)
        };
        // Views are dropped (and their fetches canceled) outside the lock
        drop(retired);
        for view in started {
            view.start();
        }
    }

    pub fn stats(&self) -> ViewManagerStats {
        let state = self.state.lock();
        ViewManagerStats {
            prefetch_usage: state.usage,
            resident_views: state.views.len(),
            pending_prefetch: state.pending.len(),
            ..state.stats
        }
    }

    /// Current reference count of `key`, 0 when not resident
    pub fn ref_count(&self, key: DataRequestInfo) -> usize {
        self.state.lock().views.get(&key).map_or(0, |e| e.refs)
    }

    pub fn is_resident(&self, key: DataRequestInfo) -> bool {
        self.state.lock().views.contains_key(&key)
    }
}

impl std::fmt::Debug for DataViewManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataViewManager")
            .field("provider", &self.provider)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Shared ownership of one view. Cloning adds a reference; dropping the
/// last handle removes the view from its manager.
pub struct DataViewHandle {
    view: Arc<DataView>,
    manager: Arc<DataViewManager>,
}

impl DataViewHandle {
    /// The view's bytes, blocking until they are available
    pub fn data(&self) -> Result<Bytes> {
        self.view.data()
    }

    pub fn pos(&self) -> u64 {
        self.view.pos()
    }

    pub fn size(&self) -> u64 {
        self.view.size()
    }

    pub fn key(&self) -> DataRequestInfo {
        self.view.key()
    }

    pub fn is_ready(&self) -> bool {
        self.view.is_ready()
    }

    pub fn manager(&self) -> &Arc<DataViewManager> {
        &self.manager
    }
}

impl Clone for DataViewHandle {
    fn clone(&self) -> Self {
        self.manager.add_ref(self.view.key());
        Self {
            view: Arc::clone(&self.view),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl Drop for DataViewHandle {
    fn drop(&mut self) {
        self.manager.release(self.view.key());
    }
}

impl std::fmt::Debug for DataViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataViewHandle")
            .field("key", &self.view.key())
            .finish()
    }
}
