//! Chunk storage on top of an I/O dispatcher

use crate::codec::ChunkCodec;
use crate::data_provider::DataProvider;
use crate::data_view::{DataViewHandle, DataViewManager, DataViewManagerConfig};
use crate::error::Result;
use crate::io::WriteObjectOptions;
use crate::layer::VolumeDataLayer;
use crate::metadata::VdsMetadata;
use crate::request::{IoDispatcher, Request};
use crate::utils::METADATA_OBJECT_NAME;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Reads and writes chunk objects of a dataset.
///
/// Every chunk object gets its own [`DataViewManager`] while someone holds a
/// view of it, so concurrent readers of one chunk share a single fetch. Once
/// the last view is released the manager goes away with its recorded
/// failures, and the next read starts from scratch.
pub struct VolumeDataStore {
    dispatcher: Arc<IoDispatcher>,
    codec: Arc<dyn ChunkCodec>,
    view_config: DataViewManagerConfig,
    managers: Mutex<HashMap<String, Weak<DataViewManager>>>,
}

impl VolumeDataStore {
    pub fn new(dispatcher: Arc<IoDispatcher>, codec: Arc<dyn ChunkCodec>, view_config: DataViewManagerConfig) -> Self {
        Self {
            dispatcher,
            codec,
            view_config,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dispatcher(&self) -> &Arc<IoDispatcher> {
        &self.dispatcher
    }

    pub fn codec(&self) -> &Arc<dyn ChunkCodec> {
        &self.codec
    }

    fn manager(&self, object_name: &str) -> Arc<DataViewManager> {
        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(object_name).and_then(Weak::upgrade) {
            return manager;
        }
        managers.retain(|_, manager| manager.strong_count() > 0);

        let provider = Arc::new(DataProvider::object(Arc::clone(&self.dispatcher), object_name));
        let manager = DataViewManager::new(provider, self.view_config);
        managers.insert(object_name.to_string(), Arc::downgrade(&manager));
        manager
    }

    /// View of the whole stored object of `chunk`, fetched once for all
    /// concurrent callers
    pub fn acquire_chunk_view(&self, layer: &VolumeDataLayer, chunk: u64) -> Result<DataViewHandle> {
        let name = layer.chunk_object_name(chunk);
        let manager = self.manager(&name);
        let size = manager.provider().size()?;
        tracing::trace!("Acquiring {} ({} bytes)", name, size);
        manager.acquire_view(0, size, true)
    }

    /// Upload the encoded bytes of `chunk`
    pub fn write_chunk(&self, layer: &VolumeDataLayer, chunk: u64, data: Bytes) -> Request<()> {
        let name = layer.chunk_object_name(chunk);
        self.managers.lock().remove(&name);
        let options = WriteObjectOptions::default()
            .with_content_type("application/octet-stream")
            .with_metadata_header("vds-layer", layer.name())
            .with_metadata_header("vds-chunk", chunk.to_string());
        self.dispatcher.write_object(&name, options, data, None)
    }

    pub fn read_metadata(&self) -> Result<VdsMetadata> {
        let object = self.dispatcher.read_object(METADATA_OBJECT_NAME, None).take()?;
        VdsMetadata::from_json(&object.data)
    }

    pub fn write_metadata(&self, metadata: &VdsMetadata) -> Result<Request<()>> {
        let data = Bytes::from(metadata.to_json()?);
        let options = WriteObjectOptions::default().with_content_type("application/json");
        Ok(self.dispatcher.write_object(METADATA_OBJECT_NAME, options, data, None))
    }

    /// Number of chunk objects with live views
    pub fn active_chunk_count(&self) -> usize {
        self.managers
            .lock()
            .values()
            .filter(|manager| manager.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for VolumeDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDataStore")
            .field("backend", &self.dispatcher.io_manager().backend())
            .field("active_chunks", &self.active_chunk_count())
            .finish()
    }
}
