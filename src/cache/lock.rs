//! Cross-process advisory lock for the shared cache directory.
//!
//! Backed by an OS file lock, so a holder that dies releases it with its
//! file descriptor. The holder's pid and acquisition time are written into
//! the lock file for diagnostics only.

use crate::error::Result;
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const LOCK_FILE: &str = "refresh.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    /// Unix seconds.
    pub acquired_at: u64,
}

#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(LOCK_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire without blocking. `None` means another holder is live.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: unix_now(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{} {}", holder.pid, holder.acquired_at)?;
        file.sync_data()?;
        Ok(Some(LockGuard { file, holder }))
    }

    /// Last recorded holder, if the lock file names one.
    pub fn holder(&self) -> Option<LockHolder> {
        let mut text = String::new();
        File::open(&self.path).ok()?.read_to_string(&mut text).ok()?;
        let mut parts = text.split_whitespace();
        let pid = parts.next()?.parse().ok()?;
        let acquired_at = parts.next()?.parse().ok()?;
        Some(LockHolder { pid, acquired_at })
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    holder: LockHolder,
}

impl LockGuard {
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the OS lock.
        let _ = self.file.set_len(0);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
