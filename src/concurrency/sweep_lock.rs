//! Cross-process lock serializing reaper sweeps (fs2 flock).
//!
//! Several engine processes may share one isolation runtime; only one of
//! them should sweep orphans at a time.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const SWEEP_LOCK_FILENAME: &str = "reaper.lock";

#[derive(Debug, Clone)]
pub struct SweepLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct SweepLockGuard {
    file: File,
}

impl Drop for SweepLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl SweepLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(SWEEP_LOCK_FILENAME))
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&self.path)
            .with_context(|| format!("Failed to open sweep lock {}", self.path.display()))
    }

    /// Blocking acquire.
    pub fn acquire(&self) -> Result<SweepLockGuard> {
        let file = self.open()?;
        file.lock_exclusive()?;
        Ok(SweepLockGuard { file })
    }

    /// Non-blocking acquire; `None` if another sweeper holds the lock.
    pub fn try_acquire(&self) -> Result<Option<SweepLockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(SweepLockGuard { file })),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
