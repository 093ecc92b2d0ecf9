//! Object storage collaborators: the `IOManager` trait and the local backends

use crate::error::{Result, VdsError, SHORT_READ_CODE};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Kind of store a dataset URL points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// `file://` URLs and plain paths
    FileSystem,
    /// Process-local object store
    InMemory,
    S3,
    Azure,
    GCS,
}

impl StorageBackend {
    /// Backend named by the scheme of `url`. A URL without a scheme is a path.
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "inmemory" => Ok(StorageBackend::InMemory),
                "s3" => Ok(StorageBackend::S3),
                "azure" | "azureSAS" => Ok(StorageBackend::Azure),
                "gs" => Ok(StorageBackend::GCS),
                _ => Err(VdsError::Configuration(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Size and modification time of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub last_write_time: Option<DateTime<Utc>>,
}

/// Result of a download
#[derive(Debug, Clone)]
pub struct ObjectData {
    /// The requested bytes
    pub data: Bytes,
    /// Size of the whole object
    pub object_size: u64,
    pub last_write_time: Option<DateTime<Utc>>,
    /// Metadata headers stored with the object
    pub metadata: BTreeMap<String, String>,
}

/// Headers sent along with an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteObjectOptions {
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    pub metadata_headers: BTreeMap<String, String>,
}

impl WriteObjectOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_headers.insert(key.into(), value.into());
        self
    }
}

/// Named-object store holding the chunks and the metadata document of a
/// dataset. Cloud backends are supplied by the application.
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read a whole object, or only `range` of it.
    ///
    /// A range reaching past the end of the object is an error.
    async fn read_object(&self, name: &str, range: Option<Range<u64>>) -> Result<ObjectData>;

    /// Write an object, replacing any previous content
    async fn write_object(&self, name: &str, options: &WriteObjectOptions, data: Bytes) -> Result<()>;

    /// Get the size and modification time of an object
    async fn head(&self, name: &str) -> Result<ObjectInfo>;

    /// Delete an object
    async fn delete(&self, name: &str) -> Result<()>;

    /// List object names with a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend(&self) -> StorageBackend;
}

fn check_range(name: &str, range: &Range<u64>, object_size: u64) -> Result<()> {
    if range.start > range.end || range.end > object_size {
        return Err(VdsError::io(
            SHORT_READ_CODE,
            format!(
                "Range {}..{} is outside object {} of {} bytes",
                range.start, range.end, name, object_size
            ),
        ));
    }
    Ok(())
}

/// Objects as files below a base directory; `/` in names maps to subdirectories
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for an object name
    fn full_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read_object(&self, name: &str, range: Option<Range<u64>>) -> Result<ObjectData> {
        let full_path = self.full_path(name);
        let mut file = fs::File::open(&full_path).await?;
        let metadata = file.metadata().await?;
        let object_size = metadata.len();
        let last_write_time = metadata.modified().ok().map(DateTime::<Utc>::from);

        let data = match range {
            Some(range) => {
                check_range(name, &range, object_size)?;
                let mut buffer = vec![0u8; (range.end - range.start) as usize];
                file.seek(SeekFrom::Start(range.start)).await?;
                file.read_exact(&mut buffer).await?;
                buffer
            }
            None => {
                let mut buffer = Vec::with_capacity(object_size as usize);
                file.read_to_end(&mut buffer).await?;
                buffer
            }
        };

        Ok(ObjectData {
            data: Bytes::from(data),
            object_size,
            last_write_time,
            metadata: BTreeMap::new(),
        })
    }

    async fn write_object(&self, name: &str, _options: &WriteObjectOptions, data: Bytes) -> Result<()> {
        let full_path = self.full_path(name);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn head(&self, name: &str) -> Result<ObjectInfo> {
        let metadata = fs::metadata(self.full_path(name)).await?;
        Ok(ObjectInfo {
            size: metadata.len(),
            last_write_time: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        fs::remove_file(self.full_path(name)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if full_path.is_dir() {
            let mut read_dir = fs::read_dir(&full_path).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: BTreeMap<String, String>,
    last_write_time: DateTime<Utc>,
}

/// Object store kept in process memory
#[derive(Default)]
pub struct InMemoryIOManager {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store shared by every caller using the same name, so a dataset
    /// written through one manager can be reopened through another.
    pub fn named(name: &str) -> Arc<Self> {
        static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<InMemoryIOManager>>>> = OnceLock::new();
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        Arc::clone(
            registry
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(InMemoryIOManager::new())),
        )
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn get(&self, name: &str) -> Result<StoredObject> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VdsError::not_found(name))
    }
}

#[async_trait]
impl IOManager for InMemoryIOManager {
    async fn read_object(&self, name: &str, range: Option<Range<u64>>) -> Result<ObjectData> {
        let object = self.get(name)?;
        let object_size = object.data.len() as u64;
        let data = match range {
            Some(range) => {
                check_range(name, &range, object_size)?;
                object.data.slice(range.start as usize..range.end as usize)
            }
            None => object.data.clone(),
        };
        Ok(ObjectData {
            data,
            object_size,
            last_write_time: Some(object.last_write_time),
            metadata: object.metadata,
        })
    }

    async fn write_object(&self, name: &str, options: &WriteObjectOptions, data: Bytes) -> Result<()> {
        let object = StoredObject {
            data,
            metadata: options.metadata_headers.clone(),
            last_write_time: Utc::now(),
        };
        self.objects.write().insert(name.to_string(), object);
        Ok(())
    }

    async fn head(&self, name: &str) -> Result<ObjectInfo> {
        let object = self.get(name)?;
        Ok(ObjectInfo {
            size: object.data.len() as u64,
            last_write_time: Some(object.last_write_time),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VdsError::not_found(name))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::InMemory
    }
}

/// Backend for a dataset URL
///
/// Filesystem and in-memory URLs are supported. For cloud storage, implement
/// the `IOManager` trait and pass it to `VolumeDataAccess::with_io_manager`.
pub fn create_io_manager(url: &str) -> Result<Arc<dyn IOManager>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Arc::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::InMemory => {
            let name = url.strip_prefix("inmemory://").unwrap_or(url);
            Ok(InMemoryIOManager::named(name))
        }
        StorageBackend::S3 | StorageBackend::Azure | StorageBackend::GCS => {
            Err(VdsError::Configuration(format!(
                "Cloud backend {:?} needs an application provided IOManager",
                backend
            )))
        }
    }
}
