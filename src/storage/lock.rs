// src/storage/lock.rs

//! Cross-process locks on files in the storage directory.
//!
//! Locks are OS advisory locks, released by the kernel when the holder
//! exits, so a crashed process never leaves a lock behind. Lock files stay
//! on disk: removing one would let a later process lock a fresh file while
//! an earlier holder still owns the old one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;

use crate::error::Result;
use crate::storage::blocking;

/// Non-blocking mutual exclusion for scheduler passes.
#[async_trait]
pub trait PassLock: Send + Sync {
    /// Take the lock if it is free; `None` means another holder has it.
    async fn try_acquire(&self) -> Result<Option<LockGuard>>;
}

/// Held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Wait for the exclusive lock on `path`. Blocks the calling thread.
pub(crate) fn lock_exclusive(path: &Path) -> Result<LockGuard> {
    let file = open_lock_file(path)?;
    FileExt::lock_exclusive(&file)?;
    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
    })
}

/// Take the exclusive lock on `path` if nobody holds it.
pub(crate) fn try_lock_exclusive(path: &Path) -> Result<Option<LockGuard>> {
    let file = open_lock_file(path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(LockGuard {
            file,
            path: path.to_path_buf(),
        })),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Pass lock held on a file in the storage directory.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PassLock for FileLock {
    async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let path = self.path.clone();
        blocking(move || {
            let Some(mut guard) = try_lock_exclusive(&path)? else {
                return Ok(None);
            };
            // Owner note for operators; the lock itself is the OS lock.
            guard.file.set_len(0)?;
            writeln!(
                guard.file,
                "pid={} at={}",
                std::process::id(),
                Utc::now().to_rfc3339()
            )?;
            Ok(Some(guard))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path().join("sync.lock"));

        let guard = lock.try_acquire().await.unwrap();
        assert!(guard.is_some());
        assert!(lock.try_acquire().await.unwrap().is_none());

        drop(guard);
        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn held_lock_never_expires() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sync.lock");
        let first = FileLock::new(&path);
        let second = FileLock::new(&path);

        let _held = first.try_acquire().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(second.try_acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_does_not_open_the_lock_to_a_third_holder() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sync.lock");
        let (a, b, c) = (FileLock::new(&path), FileLock::new(&path), FileLock::new(&path));

        let first = a.try_acquire().await.unwrap().unwrap();
        drop(first);
        let _second = b.try_acquire().await.unwrap().unwrap();

        assert!(path.exists());
        assert!(c.try_acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leftover_lock_file_is_free() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sync.lock");
        std::fs::write(&path, "pid=0\n").unwrap();

        let lock = FileLock::new(&path);
        let guard = lock.try_acquire().await.unwrap().unwrap();
        let note = std::fs::read_to_string(guard.path()).unwrap();
        assert!(note.starts_with(&format!("pid={}", std::process::id())));
    }
}
