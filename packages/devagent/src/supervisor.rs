//! Single-instance enforcement.
//!
//! The long-running process holds an exclusive advisory lock on
//! `<dir>/devagent.lock` for its whole life and, once its socket is bound,
//! records `host:port` in `<dir>/devagent.addr`. The OS drops the lock when
//! the process dies, so a registration file without a held lock is only a
//! leftover from a crash.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = "devagent.lock";
pub const REGISTRATION_FILE: &str = "devagent.addr";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("another devagent instance already holds {0}")]
    AlreadyRunning(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Why a registration record could not be used.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no registration record at {0}")]
    Missing(PathBuf),

    /// Empty or half-written; the owner may still be starting up.
    #[error("registration record {path} is not a host:port ({content:?})")]
    Unparseable { path: PathBuf, content: String },

    #[error("failed to read registration record: {0}")]
    Io(#[from] io::Error),
}

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

pub fn registration_path(dir: &Path) -> PathBuf {
    dir.join(REGISTRATION_FILE)
}

/// An exclusive hold on the instance lock. Unlocks on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Try to take the instance lock under `dir`. Never blocks.
pub fn acquire_lock(dir: &Path) -> Result<InstanceLock, SupervisorError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| SupervisorError::io(format!("create {}", dir.display()), e))?;

    let path = lock_path(dir);
    // No truncate: the file content is irrelevant, only the flock matters.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| SupervisorError::io(format!("open {}", path.display()), e))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            debug!(path = %path.display(), "instance lock acquired");
            Ok(InstanceLock { file, path })
        }
        Err(e) if is_contended(&e) => Err(SupervisorError::AlreadyRunning(path)),
        Err(e) => Err(SupervisorError::io(format!("lock {}", path.display()), e)),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Write the registration record. Holding the lock is the precondition,
/// enforced by requiring a reference to it.
pub fn register(dir: &Path, _lock: &InstanceLock, addr: SocketAddr) -> Result<(), SupervisorError> {
    let path = registration_path(dir);
    std::fs::write(&path, addr.to_string())
        .map_err(|e| SupervisorError::io(format!("write {}", path.display()), e))?;
    info!(%addr, path = %path.display(), "registered instance");
    Ok(())
}

/// Read the registration record.
pub fn read_registration(dir: &Path) -> Result<SocketAddr, RegistrationError> {
    let path = registration_path(dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RegistrationError::Missing(path));
        }
        Err(e) => return Err(e.into()),
    };
    content
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| RegistrationError::Unparseable { path, content })
}

/// Remove the registration record, then drop the lock.
///
/// Safe to call when the record is already gone.
pub fn release(dir: &Path, lock: InstanceLock) {
    remove_registration(dir);
    if let Err(e) = FileExt::unlock(&lock.file) {
        warn!("Failed to unlock {}: {}", lock.path.display(), e);
    }
    drop(lock);
    debug!("instance lock released");
}

fn remove_registration(dir: &Path) {
    let path = registration_path(dir);
    match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "registration removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Remove a registration record left behind by a crashed instance.
///
/// Returns `Ok(true)` if a stale record was removed, `Ok(false)` if there
/// was nothing to clean, and `AlreadyRunning` if a live instance owns it.
pub fn clean_stale_registration(dir: &Path) -> Result<bool, SupervisorError> {
    let lock = acquire_lock(dir)?;
    let existed = registration_path(dir).exists();
    release(dir, lock);
    Ok(existed)
}
