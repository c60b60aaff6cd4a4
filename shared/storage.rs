// ========================================================================================
//
//                          THE STORAGE CAPABILITY
//
// ========================================================================================
//
// ### Purpose ###
//
// The engine never touches a filesystem directly. Every byte it reads or writes goes
// through the `Storage` trait: open a named stream, move bytes in and out with explicit
// byte counts, close it. The device build maps this onto a FAT volume on an SD card;
// here it is backed either by a directory (`DirStorage`) or by process memory
// (`MemoryStorage`), which also lets tests inject short writes.

use log::debug;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// How a stream is opened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// The stream must exist. Reads only.
    Read,
    /// The stream is created or truncated. Writes only.
    Write,
    /// The stream must exist. Reads and writes from the start, no truncation.
    ReadWrite,
    /// Like `ReadWrite`, but a missing stream is created empty.
    CreateIfMissing,
}

impl OpenMode {
    fn can_read(self) -> bool {
        !matches!(self, OpenMode::Write)
    }

    fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on stream '{stream}': {source}")]
    Io {
        stream: String,
        #[source]
        source: io::Error,
    },
    #[error("Stream '{0}' does not exist.")]
    NotFound(String),
    #[error("Short read on stream '{stream}': requested {requested} bytes, got {actual}.")]
    ShortRead {
        stream: String,
        requested: usize,
        actual: usize,
    },
    #[error("Short write on stream '{stream}': requested {requested} bytes, wrote {actual}.")]
    ShortWrite {
        stream: String,
        requested: usize,
        actual: usize,
    },
    #[error("Stream '{stream}' was opened in {mode:?} mode and cannot be {operation}.")]
    ModeViolation {
        stream: String,
        mode: OpenMode,
        operation: &'static str,
    },
    #[error("Persisted artifact '{stream}' is inconsistent: {reason}")]
    CorruptArtifact { stream: String, reason: String },
}

impl StorageError {
    fn io(stream: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(stream.to_string())
        } else {
            StorageError::Io {
                stream: stream.to_string(),
                source,
            }
        }
    }
}

/// One open stream. A handle is exclusively owned by whoever opened it.
pub trait StreamHandle {
    /// Reads up to `buf.len()` bytes. Fewer bytes are returned only at the end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Writes up to `buf.len()` bytes and reports how many were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError>;

    /// Flushes and releases the stream.
    fn close(self: Box<Self>) -> Result<(), StorageError>;

    fn name(&self) -> &str;
}

/// A named byte-stream store.
pub trait Storage {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn StreamHandle>, StorageError>;

    /// Current length of a stream in bytes.
    fn stream_len(&self, name: &str) -> Result<u64, StorageError>;
}

/// Fills `buf` completely or fails. A short read is an error, never a partial result.
pub fn read_exact(handle: &mut dyn StreamHandle, buf: &mut [u8]) -> Result<(), StorageError> {
    let actual = handle.read(buf)?;
    if actual != buf.len() {
        return Err(StorageError::ShortRead {
            stream: handle.name().to_string(),
            requested: buf.len(),
            actual,
        });
    }
    Ok(())
}

/// Writes all of `buf` or fails. A short write counts as a failed write.
pub fn write_exact(handle: &mut dyn StreamHandle, buf: &[u8]) -> Result<(), StorageError> {
    let actual = handle.write(buf)?;
    if actual != buf.len() {
        return Err(StorageError::ShortWrite {
            stream: handle.name().to_string(),
            requested: buf.len(),
            actual,
        });
    }
    Ok(())
}

/// Adapts a `StreamHandle` to `std::io::Read` so text parsers can pull from it.
///
/// The storage error that interrupted the read is kept aside so callers can recover the
/// typed error after the parser has wrapped it in an `io::Error`.
pub struct StreamReader<'a> {
    handle: &'a mut dyn StreamHandle,
    failure: Option<StorageError>,
}

impl<'a> StreamReader<'a> {
    pub fn new(handle: &'a mut dyn StreamHandle) -> Self {
        Self {
            handle,
            failure: None,
        }
    }

    pub fn take_failure(&mut self) -> Option<StorageError> {
        self.failure.take()
    }

    pub fn stream_name(&self) -> &str {
        self.handle.name()
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.handle.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let message = e.to_string();
                self.failure = Some(e);
                Err(io::Error::other(message))
            }
        }
    }
}

// ========================================================================================
//                              DIRECTORY-BACKED STORAGE
// ========================================================================================

/// Streams are files resolved relative to a root directory.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Storage for DirStorage {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn StreamHandle>, StorageError> {
        let path = self.resolve(name);
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::CreateIfMissing => options.read(true).write(true).create(true),
        };
        let file = options.open(&path).map_err(|e| StorageError::io(name, e))?;
        debug!("Opened '{}' ({mode:?})", path.display());

        let inner = match mode {
            OpenMode::Read => DirInner::Reader(BufReader::new(file)),
            OpenMode::Write => DirInner::Writer(BufWriter::new(file)),
            OpenMode::ReadWrite | OpenMode::CreateIfMissing => DirInner::Both(file),
        };
        Ok(Box::new(DirStream {
            name: name.to_string(),
            mode,
            inner,
        }))
    }

    fn stream_len(&self, name: &str) -> Result<u64, StorageError> {
        let metadata = std::fs::metadata(self.resolve(name)).map_err(|e| StorageError::io(name, e))?;
        Ok(metadata.len())
    }
}

enum DirInner {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
    Both(File),
}

struct DirStream {
    name: String,
    mode: OpenMode,
    inner: DirInner,
}

fn violation(stream: &str, mode: OpenMode, operation: &'static str) -> StorageError {
    StorageError::ModeViolation {
        stream: stream.to_string(),
        mode,
        operation,
    }
}

/// Keeps reading until `buf` is full or the source is exhausted.
fn fill_from(source: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl StreamHandle for DirStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let result = match &mut self.inner {
            DirInner::Reader(reader) => fill_from(reader, buf),
            DirInner::Both(file) => fill_from(file, buf),
            DirInner::Writer(_) => return Err(violation(&self.name, self.mode, "read")),
        };
        result.map_err(|e| StorageError::io(&self.name, e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError> {
        let result = match &mut self.inner {
            DirInner::Writer(writer) => writer.write_all(buf),
            DirInner::Both(file) => file.write_all(buf),
            DirInner::Reader(_) => return Err(violation(&self.name, self.mode, "written")),
        };
        result
            .map(|()| buf.len())
            .map_err(|e| StorageError::io(&self.name, e))
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        let DirStream { name, inner, .. } = *self;
        match inner {
            DirInner::Reader(_) => Ok(()),
            DirInner::Writer(writer) => {
                let file = writer
                    .into_inner()
                    .map_err(|e| StorageError::io(&name, e.into_error()))?;
                file.sync_all().map_err(|e| StorageError::io(&name, e))
            }
            DirInner::Both(mut file) => file.flush().map_err(|e| StorageError::io(&name, e)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ========================================================================================
//                                 IN-MEMORY STORAGE
// ========================================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    streams: HashMap<String, Vec<u8>>,
    /// Remaining bytes that writes may accept before they start coming up short.
    write_quota: Option<usize>,
    /// Remaining bytes that reads may return before the next read fails outright.
    read_budget: Option<usize>,
}

/// A process-local store. Clones share the same streams.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total number of bytes all future writes may accept. Writes past the
    /// quota are truncated, which the engine must treat as a storage failure.
    pub fn with_write_quota(self, bytes: usize) -> Self {
        self.guard().write_quota = Some(bytes);
        self
    }

    /// Lets reads return `bytes` in total. The first read that would go past that fails
    /// with an I/O error, as a failing card would.
    pub fn with_read_fault_after(self, bytes: usize) -> Self {
        self.guard().read_budget = Some(bytes);
        self
    }

    pub fn insert(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.guard().streams.insert(name.to_string(), bytes.into());
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.guard().streams.get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Vec<u8>> {
        self.guard().streams.remove(name)
    }

    /// Test-side access. A panic in another holder leaves the byte maps intact, so a
    /// poisoned lock is recovered rather than ignored.
    fn guard(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_inner<'a>(
    inner: &'a Mutex<MemoryInner>,
    stream: &str,
) -> Result<MutexGuard<'a, MemoryInner>, StorageError> {
    inner.lock().map_err(|_| StorageError::Io {
        stream: stream.to_string(),
        source: io::Error::other("memory storage lock poisoned"),
    })
}

impl Storage for MemoryStorage {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn StreamHandle>, StorageError> {
        let mut inner = lock_inner(&self.inner, name)?;
        match mode {
            OpenMode::Read | OpenMode::ReadWrite => {
                if !inner.streams.contains_key(name) {
                    return Err(StorageError::NotFound(name.to_string()));
                }
            }
            OpenMode::Write => {
                inner.streams.insert(name.to_string(), Vec::new());
            }
            OpenMode::CreateIfMissing => {
                inner.streams.entry(name.to_string()).or_default();
            }
        }
        Ok(Box::new(MemoryStream {
            name: name.to_string(),
            mode,
            position: 0,
            storage: Arc::clone(&self.inner),
        }))
    }

    fn stream_len(&self, name: &str) -> Result<u64, StorageError> {
        let inner = lock_inner(&self.inner, name)?;
        inner
            .streams
            .get(name)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}

struct MemoryStream {
    name: String,
    mode: OpenMode,
    position: usize,
    storage: Arc<Mutex<MemoryInner>>,
}

impl StreamHandle for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        if !self.mode.can_read() {
            return Err(violation(&self.name, self.mode, "read"));
        }
        let mut inner = lock_inner(&self.storage, &self.name)?;
        let available = inner
            .streams
            .get(&self.name)
            .ok_or_else(|| StorageError::NotFound(self.name.clone()))?
            .len()
            .saturating_sub(self.position);
        let n = available.min(buf.len());
        if let Some(budget) = inner.read_budget {
            if n > budget {
                inner.read_budget = Some(0);
                return Err(StorageError::Io {
                    stream: self.name.clone(),
                    source: io::Error::other("injected read fault"),
                });
            }
            inner.read_budget = Some(budget - n);
        }
        let bytes = &inner.streams[&self.name];
        buf[..n].copy_from_slice(&bytes[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError> {
        if !self.mode.can_write() {
            return Err(violation(&self.name, self.mode, "written"));
        }
        let mut inner = lock_inner(&self.storage, &self.name)?;
        let accepted = match inner.write_quota {
            Some(quota) => {
                let n = quota.min(buf.len());
                inner.write_quota = Some(quota - n);
                n
            }
            None => buf.len(),
        };
        let bytes = inner.streams.entry(self.name.clone()).or_default();
        let end = self.position + accepted;
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[self.position..end].copy_from_slice(&buf[..accepted]);
        self.position = end;
        Ok(accepted)
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_stream_round_trips_bytes() {
        let storage = MemoryStorage::new();
        let mut handle = storage.open("a.bin", OpenMode::Write).unwrap();
        write_exact(handle.as_mut(), b"hello").unwrap();
        handle.close().unwrap();

        assert_eq!(storage.stream_len("a.bin").unwrap(), 5);
        let mut handle = storage.open("a.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 5];
        read_exact(handle.as_mut(), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn short_read_is_an_error() {
        let storage = MemoryStorage::new();
        storage.insert("short.bin", vec![1u8, 2, 3]);
        let mut handle = storage.open("short.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 8];
        match read_exact(handle.as_mut(), &mut buf) {
            Err(StorageError::ShortRead {
                requested, actual, ..
            }) => {
                assert_eq!(requested, 8);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected ShortRead, got {other:?}"),
        }
    }

    #[test]
    fn write_quota_produces_short_write() {
        let storage = MemoryStorage::new().with_write_quota(6);
        let mut handle = storage.open("q.bin", OpenMode::Write).unwrap();
        write_exact(handle.as_mut(), &[0u8; 4]).unwrap();
        let err = write_exact(handle.as_mut(), &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::ShortWrite {
                requested: 4,
                actual: 2,
                ..
            }
        ));
        assert_eq!(storage.contents("q.bin").unwrap().len(), 6);
    }

    #[test]
    fn read_fault_fails_the_read_that_crosses_the_budget() {
        let storage = MemoryStorage::new().with_read_fault_after(4);
        storage.insert("f.bin", vec![9u8; 8]);
        let mut handle = storage.open("f.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 4];
        read_exact(handle.as_mut(), &mut buf).unwrap();
        assert!(matches!(
            handle.read(&mut buf),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn poisoned_lock_does_not_hide_streams() {
        let storage = MemoryStorage::new();
        storage.insert("p.bin", vec![1u8, 2]);
        let holder = storage.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = holder.inner.lock().unwrap();
            panic!("poison the store");
        })
        .join();
        assert!(panicked.is_err());

        assert_eq!(storage.contents("p.bin"), Some(vec![1u8, 2]));
        storage.insert("q.bin", vec![3u8]);
        assert_eq!(storage.remove("q.bin"), Some(vec![3u8]));
        let storage = storage.with_write_quota(1);
        assert_eq!(storage.guard().write_quota, Some(1));
    }

    #[test]
    fn read_mode_rejects_writes() {
        let storage = MemoryStorage::new();
        storage.insert("r.bin", Vec::new());
        let mut handle = storage.open("r.bin", OpenMode::Read).unwrap();
        assert!(matches!(
            handle.write(b"x"),
            Err(StorageError::ModeViolation { .. })
        ));
    }

    #[test]
    fn missing_stream_reports_not_found() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.open("nope", OpenMode::Read),
            Err(StorageError::NotFound(_))
        ));

        let dir = tempdir().unwrap();
        let storage = DirStorage::new(dir.path());
        assert!(matches!(
            storage.open("nope", OpenMode::Read),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn dir_storage_write_truncates_and_create_if_missing_keeps() {
        let dir = tempdir().unwrap();
        let storage = DirStorage::new(dir.path());

        let mut handle = storage.open("t.bin", OpenMode::Write).unwrap();
        write_exact(handle.as_mut(), &[7u8; 16]).unwrap();
        handle.close().unwrap();
        assert_eq!(storage.stream_len("t.bin").unwrap(), 16);

        let handle = storage.open("t.bin", OpenMode::CreateIfMissing).unwrap();
        handle.close().unwrap();
        assert_eq!(storage.stream_len("t.bin").unwrap(), 16);

        let mut handle = storage.open("t.bin", OpenMode::Write).unwrap();
        write_exact(handle.as_mut(), &[1u8; 4]).unwrap();
        handle.close().unwrap();
        assert_eq!(storage.stream_len("t.bin").unwrap(), 4);

        let mut handle = storage.open("t.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 4];
        read_exact(handle.as_mut(), &mut buf).unwrap();
        assert_eq!(buf, [1u8; 4]);
    }
}
