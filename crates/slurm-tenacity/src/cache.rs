//! Durable memory of resource allocations that worked for a job in the past.
//!
//! The cache maps a [`JobSignature`] to the last known-good walltime and memory. It is
//! read and rewritten as a whole in each transaction. Transactions are serialized within
//! a process, but there is no locking between processes: two processes sharing one cache
//! file can overwrite each other's updates.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::Map;

/// Default file name of the cache, relative to the working directory.
pub const DEFAULT_CACHE_FILE: &str = "allocation_cache.json";

/// Identifies "the same job" across runs.
///
/// Identical commands can have very different resource needs depending on their input
/// data, so the caller can add a key to tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSignature {
    pub command: Vec<String>,
    pub key: Option<String>,
}

impl JobSignature {
    pub fn new(command: &[String], key: Option<&str>) -> Self {
        Self {
            command: command.to_vec(),
            key: key.map(|k| k.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub walltime: Duration,
    /// `None` if the memory usage of the job was not known.
    pub memory: Option<ByteSize>,
}

pub type AllocationMap = Map<JobSignature, AllocationRecord>;

#[derive(Serialize, Deserialize)]
struct StoredAllocation {
    command: Vec<String>,
    key: Option<String>,
    walltime: Duration,
    memory_bytes: Option<u64>,
}

/// Storage backend of an [`AllocationCache`].
pub trait AllocationStore: Send + Sync {
    fn load(&self) -> crate::Result<AllocationMap>;
    fn save(&self, allocations: &AllocationMap) -> crate::Result<()>;
}

/// Stores the cache as a JSON file, replaced atomically on every save.
pub struct FileAllocationStore {
    path: PathBuf,
}

impl FileAllocationStore {
    /// Opens the store, creating an empty one if the file does not exist yet.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
        };
        if !path.exists() {
            log::debug!("Creating allocation cache at {}", path.display());
            store.save(&AllocationMap::new())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AllocationStore for FileAllocationStore {
    fn load(&self) -> crate::Result<AllocationMap> {
        let content = std::fs::read_to_string(&self.path)?;
        let stored: Vec<StoredAllocation> = serde_json::from_str(&content)?;
        Ok(stored
            .into_iter()
            .map(|entry| {
                (
                    JobSignature {
                        command: entry.command,
                        key: entry.key,
                    },
                    AllocationRecord {
                        walltime: entry.walltime,
                        memory: entry.memory_bytes.map(ByteSize::b),
                    },
                )
            })
            .collect())
    }

    fn save(&self, allocations: &AllocationMap) -> crate::Result<()> {
        let mut stored: Vec<StoredAllocation> = allocations
            .iter()
            .map(|(signature, record)| StoredAllocation {
                command: signature.command.clone(),
                key: signature.key.clone(),
                walltime: record.walltime,
                memory_bytes: record.memory.map(|m| m.as_u64()),
            })
            .collect();
        stored.sort_by(|a, b| (&a.command, &a.key).cmp(&(&b.command, &b.key)));

        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&directory)?;
        let mut file = tempfile::NamedTempFile::new_in(&directory)?;
        serde_json::to_writer_pretty(&mut file, &stored)?;
        file.flush()?;
        file.persist(&self.path)?;
        Ok(())
    }
}

/// Keeps the cache in memory only.
#[derive(Default)]
pub struct MemoryAllocationStore {
    allocations: Mutex<AllocationMap>,
}

impl AllocationStore for MemoryAllocationStore {
    fn load(&self) -> crate::Result<AllocationMap> {
        Ok(self
            .allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save(&self, allocations: &AllocationMap) -> crate::Result<()> {
        *self.allocations.lock().unwrap_or_else(|e| e.into_inner()) = allocations.clone();
        Ok(())
    }
}

pub struct AllocationCache {
    store: Box<dyn AllocationStore>,
    transaction_lock: Mutex<()>,
}

impl AllocationCache {
    pub fn new(store: impl AllocationStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            transaction_lock: Mutex::new(()),
        }
    }

    /// Opens (or creates) a cache stored in a file.
    pub fn open(path: &Path) -> crate::Result<Self> {
        Ok(Self::new(FileAllocationStore::open(path)?))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryAllocationStore::default())
    }

    /// Loads the whole cache, lets `body` read and modify it and persists the result.
    ///
    /// Changes are persisted only if `body` succeeds; an error leaves the stored cache
    /// untouched.
    pub fn transaction<T, F>(&self, body: F) -> crate::Result<T>
    where
        F: FnOnce(&mut AllocationMap) -> crate::Result<T>,
    {
        let _lock = self
            .transaction_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut allocations = self.store.load()?;
        let value = body(&mut allocations)?;
        self.store.save(&allocations)?;
        Ok(value)
    }

    pub fn get(&self, signature: &JobSignature) -> crate::Result<Option<AllocationRecord>> {
        self.transaction(|allocations| Ok(allocations.get(signature).copied()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytesize::ByteSize;

    use super::{AllocationCache, AllocationRecord, JobSignature};
    use crate::Error;

    fn signature(key: Option<&str>) -> JobSignature {
        JobSignature::new(&["./sim".to_string(), "input".to_string()], key)
    }

    fn record(secs: u64, kib: Option<u64>) -> AllocationRecord {
        AllocationRecord {
            walltime: Duration::from_secs(secs),
            memory: kib.map(ByteSize::kib),
        }
    }

    #[test]
    fn file_cache_is_created_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let cache = AllocationCache::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cache.get(&signature(None)).unwrap(), None);
    }

    #[test]
    fn file_cache_persists_committed_transaction() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        {
            let cache = AllocationCache::open(&path).unwrap();
            cache
                .transaction(|allocations| {
                    allocations.insert(signature(Some("sim-a")), record(54000, Some(3000)));
                    allocations.insert(signature(None), record(90, None));
                    Ok(())
                })
                .unwrap();
        }

        let cache = AllocationCache::open(&path).unwrap();
        assert_eq!(
            cache.get(&signature(Some("sim-a"))).unwrap(),
            Some(record(54000, Some(3000)))
        );
        assert_eq!(cache.get(&signature(None)).unwrap(), Some(record(90, None)));
        assert_eq!(cache.get(&signature(Some("sim-b"))).unwrap(), None);
    }

    #[test]
    fn subsecond_walltime_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = AllocationCache::open(&path).unwrap();
        let value = AllocationRecord {
            walltime: Duration::from_millis(1500),
            memory: Some(ByteSize::b(1)),
        };
        cache
            .transaction(|allocations| {
                allocations.insert(signature(None), value);
                Ok(())
            })
            .unwrap();
        let cache = AllocationCache::open(&path).unwrap();
        assert_eq!(cache.get(&signature(None)).unwrap(), Some(value));
    }

    #[test]
    fn failed_transaction_is_not_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = AllocationCache::open(&path).unwrap();
        let result: crate::Result<()> = cache.transaction(|allocations| {
            allocations.insert(signature(None), record(10, None));
            Err(Error::GenericError("interrupted".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(cache.get(&signature(None)).unwrap(), None);
    }

    #[test]
    fn corrupted_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();
        let cache = AllocationCache::open(&path).unwrap();
        assert!(matches!(
            cache.get(&signature(None)),
            Err(Error::SerializationError(_))
        ));
    }

    #[test]
    fn keys_distinguish_signatures() {
        let cache = AllocationCache::in_memory();
        cache
            .transaction(|allocations| {
                allocations.insert(signature(Some("small")), record(60, Some(100)));
                allocations.insert(signature(Some("large")), record(6000, Some(100000)));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            cache.get(&signature(Some("small"))).unwrap(),
            Some(record(60, Some(100)))
        );
        assert_eq!(
            cache.get(&signature(Some("large"))).unwrap(),
            Some(record(6000, Some(100000)))
        );
        assert_eq!(cache.get(&signature(None)).unwrap(), None);
    }
}
