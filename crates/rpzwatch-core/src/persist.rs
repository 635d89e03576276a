// # JSON File Persistence
//
// Shared by the file-based domain registry and the domain group registry.
//
// ## Locking
//
// Every writer takes an exclusive advisory lock on a sidecar file
// (`<file>.lock`) before its read-modify-write. Other processes editing the
// same file (administrative tooling) honour the same lock. Acquisition polls
// `try_lock_exclusive` until a bounded wait elapses.
//
// ## Crash Recovery
//
// - Atomic writes: serialise to `<file>.tmp`, then rename over the target
// - Backup: the last parsable version is copied to `<file>.backup` first
// - Recovery: a corrupt file is read from the backup instead; a corrupt
//   backup yields an empty value

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::Error;

/// Delay between two lock attempts
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A JSON document on disk guarded by a sidecar lock file
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
    lock_timeout: Duration,
}

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct FileLock {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn backup_path(&self) -> PathBuf {
        self.sibling(".backup")
    }

    /// Acquire the exclusive sidecar lock
    ///
    /// # Errors
    ///
    /// - `Error::LockTimeout` when another holder keeps the lock past the bounded wait
    /// - `Error::Io` when the lock file cannot be created
    pub async fn lock(&self) -> Result<FileLock, Error> {
        let lock_path = self.lock_path();
        self.ensure_parent_dir().await?;

        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .await?
            .into_std()
            .await;

        let contended = fs2::lock_contended_error().raw_os_error();
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: lock_path,
                    });
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.raw_os_error() == contended => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                tracing::warn!("Gave up waiting for {}", lock_path.display());
                return Err(Error::lock_timeout(lock_path));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Read the document without taking the lock
    ///
    /// Writers replace the file by rename, so an unlocked read always sees a
    /// complete version. A missing file reads as `T::default()`.
    pub async fn load<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned + Default,
    {
        match Self::read_json(&self.path).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Ok(T::default()),
            Err(ReadError::Io(e)) => Err(e.into()),
            Err(ReadError::Corrupt(e)) => {
                tracing::warn!(
                    "{} appears corrupted: {}. Attempting recovery from backup.",
                    self.path.display(),
                    e
                );
                self.load_backup().await
            }
        }
    }

    async fn load_backup<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned + Default,
    {
        let backup_path = self.backup_path();
        match Self::read_json(&backup_path).await {
            Ok(Some(value)) => {
                tracing::info!("Recovered {} from backup", self.path.display());
                Ok(value)
            }
            Ok(None) => {
                tracing::warn!("No backup file found for {}. Starting empty.", self.path.display());
                Ok(T::default())
            }
            Err(e) => {
                tracing::error!("Backup {} also unreadable: {}. Starting empty.", backup_path.display(), e);
                Ok(T::default())
            }
        }
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ReadError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReadError::Io(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(ReadError::Corrupt)
    }

    /// Replace the document; the caller must hold the lock
    pub async fn write_locked<T: Serialize>(&self, _lock: &FileLock, value: &T) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(value)?;
        self.ensure_parent_dir().await?;

        // Write to temporary file first
        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::storage(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        // Keep the current version as backup, but never overwrite a good
        // backup with a corrupt file
        if matches!(Self::read_json::<serde_json::Value>(&self.path).await, Ok(Some(_))) {
            if let Err(e) = fs::copy(&self.path, self.backup_path()).await {
                tracing::warn!("Failed to back up {}: {}", self.path.display(), e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::storage(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!("Wrote {}", self.path.display());
        Ok(())
    }

    /// Lock, then replace the document
    pub async fn store<T: Serialize>(&self, value: &T) -> Result<(), Error> {
        let lock = self.lock().await?;
        self.write_locked(&lock, value).await
    }

    /// Locked read-modify-write
    ///
    /// `f` returns `(result, changed)`; the file is only rewritten when
    /// `changed` is true.
    pub async fn update<T, R, F>(&self, f: F) -> Result<R, Error>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> (R, bool),
    {
        let lock = self.lock().await?;
        let mut value: T = self.load().await?;
        let (result, changed) = f(&mut value);
        if changed {
            self.write_locked(&lock, &value).await?;
        }
        Ok(result)
    }

    async fn ensure_parent_dir(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !fs::try_exists(parent).await.unwrap_or(false) {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error("{0}")]
    Io(std::io::Error),
    #[error("{0}")]
    Corrupt(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    type Mapping = BTreeMap<String, Vec<String>>;

    fn json_file(dir: &TempDir) -> JsonFile {
        JsonFile::new(dir.path().join("groups.json"), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let loaded: Mapping = json_file(&dir).load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let file = json_file(&dir);

        let mut mapping = Mapping::new();
        mapping.insert("a.example".into(), vec!["b.example".into()]);
        mapping.insert("b.example".into(), vec!["a.example".into()]);
        file.store(&mapping).await.unwrap();

        let loaded: Mapping = file.load().await.unwrap();
        assert_eq!(loaded, mapping);
        assert!(!file.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let file = json_file(&dir);

        let mut first = Mapping::new();
        first.insert("a.example".into(), vec![]);
        file.store(&first).await.unwrap();

        let mut second = first.clone();
        second.insert("b.example".into(), vec![]);
        file.store(&second).await.unwrap();

        std::fs::write(file.path(), "{ not json").unwrap();
        let loaded: Mapping = file.load().await.unwrap();
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn test_corrupt_file_without_backup_loads_empty() {
        let dir = TempDir::new().unwrap();
        let file = json_file(&dir);
        std::fs::write(file.path(), "[1, 2").unwrap();

        let loaded: Mapping = file.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let file = json_file(&dir);

        let held = file.lock().await.unwrap();
        let err = file.lock().await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(err.is_transient());

        drop(held);
        file.lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_skips_write_when_unchanged() {
        let dir = TempDir::new().unwrap();
        let file = json_file(&dir);

        let len = file
            .update(|mapping: &mut Mapping| (mapping.len(), false))
            .await
            .unwrap();
        assert_eq!(len, 0);
        assert!(!file.path().exists());

        file.update(|mapping: &mut Mapping| {
            mapping.insert("a.example".into(), vec![]);
            ((), true)
        })
        .await
        .unwrap();
        assert!(file.path().exists());
    }
}
