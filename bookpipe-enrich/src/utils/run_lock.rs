//! Single-writer lock for a checkpoint file
//!
//! The lock is a JSON PID file at `<checkpoint>.lock`. It is written to a
//! private temp file and hard-linked into place, so the lock path exists only
//! with complete contents and two runs cannot both create it. A lock whose
//! PID is no longer alive (crashed run) is reclaimed, which keeps
//! resume-after-crash working without manual cleanup.
//!
//! Reclaiming happens under `<checkpoint>.lock.reclaim`: only the run holding
//! that guard may delete a lock file, and it re-reads the holder first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("checkpoint {checkpoint} is in use by running process {pid} (lock file {lock})")]
    Held {
        checkpoint: PathBuf,
        lock: PathBuf,
        pid: u32,
    },

    #[error(
        "another run is reclaiming the lock on {checkpoint}; \
         remove {guard} if no other run is starting"
    )]
    Contended { checkpoint: PathBuf, guard: PathBuf },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// What the lock path currently holds
enum Holder {
    Absent,
    Alive(u32),
    /// Dead PID, or contents that do not parse
    Stale(Option<LockInfo>),
}

impl Holder {
    fn read(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Holder::Absent,
            Err(_) => Holder::Stale(None),
            Ok(text) => match serde_json::from_str::<LockInfo>(&text) {
                Ok(info) if process_alive(info.pid) => Holder::Alive(info.pid),
                Ok(info) => Holder::Stale(Some(info)),
                Err(_) => Holder::Stale(None),
            },
        }
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Lock path for a checkpoint file
    pub fn path_for(checkpoint: &Path) -> PathBuf {
        sibling(checkpoint, ".lock")
    }

    /// Acquire the lock for `checkpoint`, reclaiming it if the holder is dead
    pub fn acquire(checkpoint: &Path) -> Result<Self, LockError> {
        let path = Self::path_for(checkpoint);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let held = |pid| LockError::Held {
            checkpoint: checkpoint.to_path_buf(),
            lock: path.clone(),
            pid,
        };

        match Self::try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(source) => return Err(io_err(source)),
        }
        if let Holder::Alive(pid) = Holder::read(&path) {
            return Err(held(pid));
        }

        let guard_path = sibling(&path, ".reclaim");
        let _guard = match ReclaimGuard::acquire(&guard_path) {
            Ok(guard) => guard,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(LockError::Contended {
                    checkpoint: checkpoint.to_path_buf(),
                    guard: guard_path,
                })
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: guard_path,
                    source,
                })
            }
        };

        // Another run may have reclaimed it while we were deciding
        match Holder::read(&path) {
            Holder::Absent => {}
            Holder::Alive(pid) => return Err(held(pid)),
            Holder::Stale(info) => {
                match info {
                    Some(info) => tracing::warn!(
                        lock = %path.display(),
                        pid = info.pid,
                        acquired_at = %info.acquired_at,
                        "Reclaiming stale checkpoint lock"
                    ),
                    None => {
                        tracing::warn!(lock = %path.display(), "Reclaiming unreadable checkpoint lock")
                    }
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(source) => return Err(io_err(source)),
                }
            }
        }

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match Holder::read(&path) {
                Holder::Alive(pid) => Err(held(pid)),
                _ => Err(LockError::Contended {
                    checkpoint: checkpoint.to_path_buf(),
                    guard: guard_path.clone(),
                }),
            },
            Err(source) => Err(io_err(source)),
        }
    }

    /// Write our lock info to a temp file and link it into place
    fn try_create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = sibling(path, &format!(".{}.tmp", Uuid::new_v4()));
        let linked = write_info(&tmp).and_then(|_| std::fs::hard_link(&tmp, path));
        let _ = std::fs::remove_file(&tmp);
        linked?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to remove checkpoint lock");
        }
    }
}

/// Exclusive right to delete a stale lock; removed on drop
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn acquire(path: &Path) -> std::io::Result<Self> {
        OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_info(path: &Path) -> std::io::Result<()> {
    let info = LockInfo {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_string(&info).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()
}

/// `path` with `suffix` appended to its file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the existence/permission check only.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
