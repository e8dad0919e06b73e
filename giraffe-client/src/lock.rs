//! Single-instance pid-file lock.
//!
//! An advisory lock (`flock` on POSIX, `LockFileEx` on Windows) on
//! `$GIRAFFECLOUD_HOME/tunnel.pid` guarantees one tunnel process per
//! config. The kernel drops the lock when a holder dies, so a crashed
//! process can never wedge the slot: a pid file whose lock is acquirable
//! is stale by definition and simply gets overwritten.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another tunnel process holds the lock{}", .holder_pid.map(|p| format!(" (pid {})", p)).unwrap_or_default())]
    Contended { holder_pid: Option<u32> },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the lifetime of the process; releases on drop.
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    /// Acquire the lock under the given state directory.
    pub fn acquire(home: &Path) -> Result<Self, LockError> {
        std::fs::create_dir_all(home)?;
        let path = home.join("tunnel.pid");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            debug!(path = %path.display(), error = %e, "lock contended");
            let holder_pid = read_pid(&mut file);
            if let Some(pid) = holder_pid {
                if !process_alive(pid) {
                    // lock held by the kernel but pid looks dead: should
                    // not happen with flock; report the pid anyway
                    warn!(pid, "lock held but recorded holder looks dead");
                }
            }
            return Err(LockError::Contended { holder_pid });
        }

        // we own the lock now; whatever pid was recorded is stale
        let stale = read_pid(&mut file);
        if let Some(pid) = stale {
            if pid != std::process::id() {
                info!(stale_pid = pid, "cleared stale pid file");
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        info!(path = %path.display(), pid = std::process::id(), "pid lock acquired");
        Ok(Self { file, path })
    }

    /// Release explicitly, removing the pid file.
    pub fn release(self) {
        let _ = fs2::FileExt::unlock(&self.file);
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "pid file removal failed");
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // signal 0: existence probe only
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_home(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "giraffecloud-lock-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_exactly_one_holder() {
        let home = temp_home("one");
        let lock = PidLock::acquire(&home).unwrap();
        match PidLock::acquire(&home) {
            Err(LockError::Contended { holder_pid }) => {
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            Ok(_) => panic!("second acquire must fail while the lock is held"),
            Err(e) => panic!("unexpected error: {e}"),
        }
        drop(lock);
    }

    #[test]
    fn test_reacquire_after_release() {
        let home = temp_home("release");
        let lock = PidLock::acquire(&home).unwrap();
        lock.release();
        let lock2 = PidLock::acquire(&home).unwrap();
        lock2.release();
    }

    #[test]
    fn test_stale_pid_file_is_overwritten() {
        let home = temp_home("stale");
        // a pid file with no live lock: crashed holder
        std::fs::write(home.join("tunnel.pid"), "999999\n").unwrap();
        let lock = PidLock::acquire(&home).unwrap();
        let content = std::fs::read_to_string(home.join("tunnel.pid")).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        lock.release();
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
