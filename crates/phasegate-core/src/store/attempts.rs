//! The repair attempt record: the only cross-run shared mutable state.
//!
//! Access goes through [`AttemptStore::lock`], which hands out an exclusive
//! guard for a whole read-modify-write cycle. The file-backed store uses a
//! sidecar lock file created with `create_new`, so separate processes on the
//! same host serialize on it too.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{write_atomic, StoreError, StoreResult};

/// Attempt counter persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttemptRecord {
    pub count: u32,
    pub last_attempt: DateTime<Utc>,
}

impl RepairAttemptRecord {
    pub fn new(count: u32, last_attempt: DateTime<Utc>) -> Self {
        Self {
            count,
            last_attempt,
        }
    }
}

/// Exclusive access to the record, released on drop.
pub trait AttemptGuard {
    fn load(&self) -> StoreResult<Option<RepairAttemptRecord>>;

    fn store(&mut self, record: &RepairAttemptRecord) -> StoreResult<()>;
}

/// Single-writer accessor for the repair attempt record.
pub trait AttemptStore: Send + Sync {
    fn lock(&self) -> StoreResult<Box<dyn AttemptGuard + '_>>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local attempt store.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    record: Mutex<Option<RepairAttemptRecord>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: RepairAttemptRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    /// Current record without taking part in a transaction.
    pub fn peek(&self) -> Option<RepairAttemptRecord> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MemoryGuard<'a> {
    slot: MutexGuard<'a, Option<RepairAttemptRecord>>,
}

impl AttemptGuard for MemoryGuard<'_> {
    fn load(&self) -> StoreResult<Option<RepairAttemptRecord>> {
        Ok(*self.slot)
    }

    fn store(&mut self, record: &RepairAttemptRecord) -> StoreResult<()> {
        *self.slot = Some(*record);
        Ok(())
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn lock(&self) -> StoreResult<Box<dyn AttemptGuard + '_>> {
        let slot = self.record.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Box::new(MemoryGuard { slot }))
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// JSON record on disk guarded by `<record>.lock`.
#[derive(Debug, Clone)]
pub struct FileAttemptStore {
    path: PathBuf,
    lock_path: PathBuf,
    wait: Duration,
    stale_after: Duration,
}

impl FileAttemptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            wait: Duration::from_secs(5),
            stale_after: Duration::from_secs(300),
        }
    }

    /// How long `lock` waits for another holder before giving up.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Lock files older than this are considered abandoned and removed.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_is_stale(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_after)
    }

    fn acquire(&self) -> StoreResult<()> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        warn!(path = %self.lock_path.display(), "removing stale repair lock");
                        let _ = fs::remove_file(&self.lock_path);
                        continue;
                    }
                    if started.elapsed() >= self.wait {
                        return Err(StoreError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
    }
}

struct FileGuard<'a> {
    store: &'a FileAttemptStore,
}

impl AttemptGuard for FileGuard<'_> {
    fn load(&self) -> StoreResult<Option<RepairAttemptRecord>> {
        match fs::read(&self.store.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn store(&mut self, record: &RepairAttemptRecord) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.store.path, &json)
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.store.lock_path) {
            warn!(path = %self.store.lock_path.display(), error = %e, "failed to release repair lock");
        }
    }
}

impl AttemptStore for FileAttemptStore {
    fn lock(&self) -> StoreResult<Box<dyn AttemptGuard + '_>> {
        self.acquire()?;
        debug!(path = %self.path.display(), "repair attempt record locked");
        Ok(Box::new(FileGuard { store: self }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryAttemptStore::new();
        let now = Utc::now();
        {
            let mut guard = store.lock().unwrap();
            assert!(guard.load().unwrap().is_none());
            guard.store(&RepairAttemptRecord::new(2, now)).unwrap();
        }
        assert_eq!(store.peek(), Some(RepairAttemptRecord::new(2, now)));
    }

    #[test]
    fn file_store_persists_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAttemptStore::new(dir.path().join("state").join("attempts.json"));
        let now = Utc::now();
        {
            let mut guard = store.lock().unwrap();
            assert!(guard.load().unwrap().is_none());
            guard.store(&RepairAttemptRecord::new(1, now)).unwrap();
        }
        assert!(!dir.path().join("state").join("attempts.json.lock").exists());

        let guard = store.lock().unwrap();
        assert_eq!(guard.load().unwrap(), Some(RepairAttemptRecord::new(1, now)));
    }

    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAttemptStore::new(dir.path().join("attempts.json"))
            .with_wait(Duration::from_millis(50));
        let other = store.clone();

        let _held = store.lock().unwrap();
        let err = other.lock().err().expect("lock should be contended");
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.json");
        std::fs::write(dir.path().join("attempts.json.lock"), "999999\n").unwrap();

        let store = FileAttemptStore::new(&path)
            .with_wait(Duration::from_millis(50))
            .with_stale_after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.lock().is_ok());
    }
}
