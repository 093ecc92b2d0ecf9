//! Handles to asynchronous I/O and the dispatcher that runs them
//!
//! Every transfer runs as a future on a tokio runtime owned by (or lent to)
//! an [`IoDispatcher`]. Application threads never touch the runtime directly:
//! they hold a [`Request`] and block on it with
//! [`wait_for_finish`](Request::wait_for_finish) or poll
//! [`is_done`](Request::is_done).

use crate::error::{Result, VdsError};
use crate::io::{IOManager, ObjectData, ObjectInfo, WriteObjectOptions};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Success,
    Failure,
    Canceled,
}

/// Called once when a request completes, with the error if it did not succeed
pub type CompletionCallback = Box<dyn FnOnce(std::result::Result<(), VdsError>) + Send>;

struct Completion<T> {
    state: RequestState,
    result: Option<Result<T>>,
    callbacks: Vec<CompletionCallback>,
}

struct Shared<T> {
    completion: Mutex<Completion<T>>,
    finished: Condvar,
    cancel_requested: AtomicBool,
}

impl<T> Shared<T> {
    fn complete(&self, result: Result<T>) {
        let callbacks = {
            let mut completion = self.completion.lock();
            if completion.state != RequestState::Pending {
                return;
            }
            let canceled = self.cancel_requested.load(Ordering::Acquire);
            let result = match result {
                Ok(_) if canceled => Err(VdsError::Canceled("Request was canceled".to_string())),
                other => other,
            };
            completion.state = match &result {
                Ok(_) => RequestState::Success,
                Err(VdsError::Canceled(_)) => RequestState::Canceled,
                Err(_) => RequestState::Failure,
            };
            completion.result = Some(result);
            self.finished.notify_all();
            std::mem::take(&mut completion.callbacks)
        };

        let outcome = self.outcome();
        for callback in callbacks {
            callback(outcome.clone());
        }
    }

    fn outcome(&self) -> std::result::Result<(), VdsError> {
        match &self.completion.lock().result {
            Some(Err(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }
}

/// Handle to an asynchronous operation producing a `T`
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("state", &self.state()).finish()
    }
}

impl<T> Request<T> {
    fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                completion: Mutex::new(Completion {
                    state: RequestState::Pending,
                    result: None,
                    callbacks: Vec::new(),
                }),
                finished: Condvar::new(),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    /// A request that has already finished with `result`
    pub fn completed(result: Result<T>) -> Self {
        let request = Self::pending();
        request.shared.complete(result);
        request
    }

    pub fn state(&self) -> RequestState {
        self.shared.completion.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state() != RequestState::Pending
    }

    /// Block until the request has finished. Returns true on success.
    pub fn wait_for_finish(&self) -> bool {
        let mut completion = self.shared.completion.lock();
        while completion.state == RequestState::Pending {
            self.shared.finished.wait(&mut completion);
        }
        completion.state == RequestState::Success
    }

    /// Block for at most `timeout`. Returns true once the request is done.
    pub fn wait_for_finish_timeout(&self, timeout: Duration) -> bool {
        let mut completion = self.shared.completion.lock();
        if completion.state == RequestState::Pending {
            self.shared.finished.wait_for(&mut completion, timeout);
        }
        completion.state != RequestState::Pending
    }

    pub fn is_success(&self) -> bool {
        self.state() == RequestState::Success
    }

    /// Error of a finished request, `None` while pending or on success
    pub fn error(&self) -> Option<VdsError> {
        match &self.shared.completion.lock().result {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
            || self.state() == RequestState::Canceled
    }

    /// Ask for the request to be abandoned.
    ///
    /// Cancellation is cooperative: a transfer that has not started is
    /// skipped, one already in flight runs to the end and its result is
    /// discarded.
    pub fn cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
    }

    /// Run `callback` when the request completes, or now if it already has
    pub fn on_complete(&self, callback: CompletionCallback) {
        {
            let mut completion = self.shared.completion.lock();
            if completion.state == RequestState::Pending {
                completion.callbacks.push(callback);
                return;
            }
        }
        callback(self.shared.outcome());
    }

    /// Wait for the request and move its value out.
    ///
    /// Fails with a state error if the value was already taken.
    pub fn take(&self) -> Result<T> {
        self.wait_for_finish();
        let mut completion = self.shared.completion.lock();
        match completion.result.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => {
                completion.result = Some(Err(e.clone()));
                Err(e)
            }
            None => Err(VdsError::State("Request result was already taken".to_string())),
        }
    }
}

impl<T: Clone> Request<T> {
    /// Wait for the request and return a copy of its value
    pub fn result(&self) -> Result<T> {
        self.wait_for_finish();
        match &self.shared.completion.lock().result {
            Some(result) => result.clone(),
            None => Err(VdsError::State("Request result was already taken".to_string())),
        }
    }
}

/// Runs I/O requests against an [`IOManager`] on a tokio runtime
pub struct IoDispatcher {
    io_manager: Arc<dyn IOManager>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl IoDispatcher {
    /// Create a dispatcher with its own multi-threaded runtime
    pub fn new(io_manager: Arc<dyn IOManager>, io_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("vds-io")
            .enable_all()
            .build()
            .map_err(|e| VdsError::Configuration(format!("Failed to start I/O runtime: {}", e)))?;
        Ok(Self {
            io_manager,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Create a dispatcher that runs requests on an existing runtime.
    ///
    /// Requests must not be waited on from that runtime's own threads.
    pub fn with_handle(io_manager: Arc<dyn IOManager>, handle: Handle) -> Self {
        Self {
            io_manager,
            handle,
            runtime: None,
        }
    }

    pub fn io_manager(&self) -> &Arc<dyn IOManager> {
        &self.io_manager
    }

    /// Spawn `future` and return a request tracking it
    pub fn spawn<T, F>(&self, future: F) -> Request<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let request = Request::pending();
        let shared = Arc::clone(&request.shared);
        self.handle.spawn(async move {
            if shared.cancel_requested.load(Ordering::Acquire) {
                shared.complete(Err(VdsError::Canceled(
                    "Request was canceled before it started".to_string(),
                )));
                return;
            }
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(VdsError::io(
                    crate::error::UNKNOWN_IO_CODE,
                    "I/O task panicked",
                )),
            };
            if let Err(e) = &result {
                tracing::debug!("I/O request failed: {}", e);
            }
            shared.complete(result);
        });
        request
    }

    /// Run blocking `work` on the runtime's blocking pool and track it as a
    /// request. Used for work that waits on other requests.
    pub fn spawn_blocking<T, F>(&self, work: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = self.handle.clone();
        self.spawn(async move {
            match handle.spawn_blocking(work).await {
                Ok(result) => result,
                Err(e) => Err(VdsError::io(
                    crate::error::UNKNOWN_IO_CODE,
                    format!("Blocking task failed: {}", e),
                )),
            }
        })
    }

    /// Download an object, or the byte range `range` of it
    pub fn read_object(&self, name: &str, range: Option<Range<u64>>) -> Request<ObjectData> {
        let io = Arc::clone(&self.io_manager);
        let name = name.to_string();
        self.spawn(async move { io.read_object(&name, range).await })
    }

    /// Download exactly `size` bytes at `offset` of an object
    pub fn read_range(&self, name: &str, offset: u64, size: u64) -> Request<Bytes> {
        let io = Arc::clone(&self.io_manager);
        let name = name.to_string();
        self.spawn(async move {
            let object = io.read_object(&name, Some(offset..offset + size)).await?;
            if object.data.len() as u64 != size {
                return Err(VdsError::io(
                    crate::error::SHORT_READ_CODE,
                    format!(
                        "Read of {} bytes at {} from {} returned {} bytes",
                        size,
                        offset,
                        name,
                        object.data.len()
                    ),
                ));
            }
            Ok(object.data)
        })
    }

    /// Upload an object. `on_complete` runs once the upload has finished.
    pub fn write_object(
        &self,
        name: &str,
        options: WriteObjectOptions,
        data: Bytes,
        on_complete: Option<CompletionCallback>,
    ) -> Request<()> {
        let io = Arc::clone(&self.io_manager);
        let name = name.to_string();
        let request = self.spawn(async move { io.write_object(&name, &options, data).await });
        if let Some(callback) = on_complete {
            request.on_complete(callback);
        }
        request
    }

    pub fn head(&self, name: &str) -> Request<ObjectInfo> {
        let io = Arc::clone(&self.io_manager);
        let name = name.to_string();
        self.spawn(async move { io.head(&name).await })
    }
}

impl Drop for IoDispatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
