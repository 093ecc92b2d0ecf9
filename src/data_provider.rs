//! Blocking byte-range access to a local file or a stored object

use crate::error::{Result, VdsError, SHORT_READ_CODE};
use crate::io::ObjectInfo;
use crate::request::{IoDispatcher, Request};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

enum Source {
    File {
        path: PathBuf,
        file: File,
        info: ObjectInfo,
    },
    Object {
        dispatcher: Arc<IoDispatcher>,
        name: String,
        info: Mutex<Option<ObjectInfo>>,
    },
}

/// Uniform read/size facade over a local file or a remote object.
///
/// Reads are all-or-nothing: on failure the destination buffer is left
/// untouched.
pub struct DataProvider {
    source: Source,
}

#[cfg(unix)]
fn read_at(file: &File, buffer: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buffer, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buffer: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buffer.is_empty() {
        match file.seek_read(buffer, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buffer = &mut buffer[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl DataProvider {
    /// Open a local file; its size is read once here
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let metadata = file.metadata()?;
        let info = ObjectInfo {
            size: metadata.len(),
            last_write_time: metadata.modified().ok().map(DateTime::<Utc>::from),
        };
        Ok(Self {
            source: Source::File { path, file, info },
        })
    }

    /// Provider for an object reached through `dispatcher`
    pub fn object(dispatcher: Arc<IoDispatcher>, name: impl Into<String>) -> Self {
        Self {
            source: Source::Object {
                dispatcher,
                name: name.into(),
                info: Mutex::new(None),
            },
        }
    }

    /// Provider for an object whose size is already known
    pub fn object_with_info(dispatcher: Arc<IoDispatcher>, name: impl Into<String>, info: ObjectInfo) -> Self {
        Self {
            source: Source::Object {
                dispatcher,
                name: name.into(),
                info: Mutex::new(Some(info)),
            },
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, Source::Object { .. })
    }

    pub fn file_or_object_name(&self) -> String {
        match &self.source {
            Source::File { path, .. } => path.display().to_string(),
            Source::Object { name, .. } => name.clone(),
        }
    }

    fn info(&self) -> Result<ObjectInfo> {
        match &self.source {
            Source::File { info, .. } => Ok(info.clone()),
            Source::Object {
                dispatcher,
                name,
                info,
            } => {
                let mut cached = info.lock();
                if let Some(info) = cached.as_ref() {
                    return Ok(info.clone());
                }
                let resolved = dispatcher.head(name).result()?;
                *cached = Some(resolved.clone());
                Ok(resolved)
            }
        }
    }

    /// Size of the file or object, resolved once and cached
    pub fn size(&self) -> Result<u64> {
        Ok(self.info()?.size)
    }

    pub fn last_write_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.info()?.last_write_time)
    }

    /// Fill `buffer` with the bytes starting at `offset`
    pub fn read(&self, buffer: &mut [u8], offset: u64) -> Result<()> {
        let data = self.read_bytes(offset, buffer.len() as u64)?;
        buffer.copy_from_slice(&data);
        Ok(())
    }

    /// Read `size` bytes at `offset`, blocking until they are available
    pub fn read_bytes(&self, offset: u64, size: u64) -> Result<Bytes> {
        match &self.source {
            Source::File { path, file, info } => {
                if offset.checked_add(size).map_or(true, |end| end > info.size) {
                    return Err(VdsError::io(
                        SHORT_READ_CODE,
                        format!(
                            "Read of {} bytes at {} is past the end of {}",
                            size,
                            offset,
                            path.display()
                        ),
                    ));
                }
                let mut data = vec![0u8; size as usize];
                read_at(file, &mut data, offset)?;
                Ok(Bytes::from(data))
            }
            Source::Object { .. } => self.fetch(offset, size).result(),
        }
    }

    /// Start an asynchronous read of `size` bytes at `offset`.
    ///
    /// Local files are read synchronously and return a completed request.
    pub fn fetch(&self, offset: u64, size: u64) -> Request<Bytes> {
        match &self.source {
            Source::File { .. } => Request::completed(self.read_bytes(offset, size)),
            Source::Object { dispatcher, name, .. } => dispatcher.read_range(name, offset, size),
        }
    }
}

impl std::fmt::Debug for DataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProvider")
            .field("name", &self.file_or_object_name())
            .field("remote", &self.is_remote())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{InMemoryIOManager, WriteObjectOptions};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_provider() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let provider = DataProvider::open_file(file.path()).unwrap();
        assert_eq!(provider.size().unwrap(), 10);
        assert!(!provider.is_remote());

        let mut buffer = [0u8; 4];
        provider.read(&mut buffer, 3).unwrap();
        assert_eq!(&buffer, b"3456");
    }

    #[test]
    fn test_failed_read_leaves_buffer_untouched() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let provider = DataProvider::open_file(file.path()).unwrap();
        let mut buffer = [b'x'; 4];
        let err = provider.read(&mut buffer, 8).unwrap_err();
        assert_eq!(err.code(), SHORT_READ_CODE);
        assert_eq!(&buffer, b"xxxx");
    }

    #[test]
    fn test_object_provider() {
        let dispatcher = Arc::new(IoDispatcher::new(Arc::new(InMemoryIOManager::new()), 1).unwrap());
        dispatcher
            .write_object(
                "volume.bin",
                WriteObjectOptions::default(),
                Bytes::from_static(b"abcdefgh"),
                None,
            )
            .wait_for_finish();

        let provider = DataProvider::object(Arc::clone(&dispatcher), "volume.bin");
        assert!(provider.is_remote());
        assert_eq!(provider.size().unwrap(), 8);
        assert!(provider.last_write_time().unwrap().is_some());

        let mut buffer = [0u8; 3];
        provider.read(&mut buffer, 5).unwrap();
        assert_eq!(&buffer, b"fgh");

        let mut buffer = [b'x'; 3];
        assert!(provider.read(&mut buffer, 6).is_err());
        assert_eq!(&buffer, b"xxx");
    }
}
