use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::error::BackendError;

pub const STORE_FILE_NAME: &str = "store.bin";

/// Durable key-value storage behind the store engine.
/// Implementations serialize their own I/O; writes are buffered until `flush`.
pub trait Backend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>, BackendError>;
    fn write(&self, key: &str, value: Value) -> Result<(), BackendError>;
    fn flush(&self) -> Result<(), BackendError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entries {
    values: Map<String, Value>,
    /// Keys written through this handle since the last successful flush
    dirty: HashSet<String>,
}

/// A single JSON object file holding every persisted key
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileBackend {
    /// Load the store file, creating its directory if needed.
    /// A missing file is an empty store; an unreadable or non-object file is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(&path, e))?;
        }

        let values = read_file(&path)?;
        tracing::debug!("Loaded {} entries from {:?}", values.len(), path);

        Ok(Self {
            path,
            entries: Mutex::new(Entries {
                values,
                dirty: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.entries).values.keys().cloned().collect()
    }
}

impl Backend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<Value>, BackendError> {
        Ok(lock(&self.entries).values.get(key).cloned())
    }

    fn write(&self, key: &str, value: Value) -> Result<(), BackendError> {
        let mut entries = lock(&self.entries);
        entries.values.insert(key.to_string(), value);
        entries.dirty.insert(key.to_string());
        Ok(())
    }

    fn flush(&self) -> Result<(), BackendError> {
        // Held for the whole write so concurrent flushes never interleave
        let mut entries = lock(&self.entries);
        if entries.dirty.is_empty() {
            return Ok(());
        }

        // Other processes may have flushed their own keys since this handle loaded
        let mut merged = match read_file(&self.path) {
            Ok(on_disk) => on_disk,
            Err(e) => {
                tracing::warn!("Rewriting store file from memory: {}", e);
                entries.values.clone()
            }
        };
        for key in &entries.dirty {
            if let Some(value) = entries.values.get(key) {
                merged.insert(key.clone(), value.clone());
            }
        }

        let bytes = serde_json::to_vec_pretty(&merged).map_err(|e| BackendError::Io {
            path: self.path.clone(),
            source: io::Error::other(e),
        })?;
        write_atomic(&self.path, &bytes).map_err(|source| BackendError::Io {
            path: self.path.clone(),
            source,
        })?;

        entries.values = merged;
        entries.dirty.clear();
        tracing::debug!("Flushed store file {:?}", self.path);
        Ok(())
    }
}

fn unavailable(path: &Path, reason: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// A missing or blank file is an empty store; anything but a JSON object is an error
fn read_file(path: &Path) -> Result<Map<String, Value>, BackendError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Map::new()),
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(unavailable(path, "expected a JSON object")),
            Err(e) => Err(unavailable(path, e)),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(unavailable(path, e)),
    }
}

/// Write through a uniquely named temp file in the same directory, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

static OPEN_BACKENDS: OnceLock<Mutex<HashMap<PathBuf, Weak<FileBackend>>>> = OnceLock::new();

/// Open the store file at `path`, returning the live handle if this process already has one.
/// Paths are compared as given.
pub fn open(path: impl AsRef<Path>) -> Result<Arc<FileBackend>, BackendError> {
    let path = path.as_ref().to_path_buf();
    let mut handles = lock(OPEN_BACKENDS.get_or_init(Default::default));

    if let Some(existing) = handles.get(&path).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let backend = Arc::new(FileBackend::load(path.clone())?);
    handles.retain(|_, handle| handle.strong_count() > 0);
    handles.insert(path, Arc::downgrade(&backend));
    Ok(backend)
}
