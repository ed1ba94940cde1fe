//! Advisory byte-range locks.
//!
//! Two flavors share one mechanism (`fcntl` ranges):
//!
//! - **Field locks** over mmap region files: every shared counter is
//!   locked at the byte offset of the field itself, for the microseconds
//!   the mutation takes.
//! - **Process locks**: one well-known slot per daemon in a single lock
//!   file, held for the lifetime of the process. The slot also stores a
//!   `"<user> [pid=<pid>]"` line so operators can see the holder.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::{BaseError, Result};

/// Well-known process-lock slots. The discriminant is the slot index in
/// the lock file; each slot is [`PROC_SLOT_SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcLockId {
    EditHostConfig = 0,
    EditDirConfig = 1,
    Scanner = 2,
    Dispatcher = 3,
    ArchiveWatch = 4,
    Statistics = 5,
    Operator = 6,
    OperatorTls = 7,
}

/// Bytes reserved per process-lock slot (lock byte + holder line).
pub const PROC_SLOT_SIZE: u64 = 64;

fn flock(type_: i16, offset: u64, len: u64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = type_;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

fn fcntl_lock(fd: i32, cmd: i32, fl: &mut libc::flock) -> std::io::Result<()> {
    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, fl as *mut libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Block until a one-byte write lock at `offset` is acquired.
pub fn lock_region_w(file: &File, offset: u64) -> Result<()> {
    let mut fl = flock(libc::F_WRLCK as i16, offset, 1);
    fcntl_lock(file.as_raw_fd(), libc::F_SETLKW, &mut fl)?;
    Ok(())
}

/// Try a one-byte write lock at `offset`; `false` when already held.
pub fn lock_region(file: &File, offset: u64) -> Result<bool> {
    let mut fl = flock(libc::F_WRLCK as i16, offset, 1);
    match fcntl_lock(file.as_raw_fd(), libc::F_SETLK, &mut fl) {
        Ok(()) => Ok(true),
        Err(e)
            if e.raw_os_error() == Some(libc::EACCES)
                || e.raw_os_error() == Some(libc::EAGAIN) =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Release a one-byte lock at `offset`.
pub fn unlock_region(file: &File, offset: u64) -> Result<()> {
    let mut fl = flock(libc::F_UNLCK as i16, offset, 1);
    fcntl_lock(file.as_raw_fd(), libc::F_SETLK, &mut fl)?;
    Ok(())
}

/// Run `body` with the one-byte write lock at `offset` held.
///
/// Callers must keep the body free of I/O; field locks are meant to be
/// held for microseconds.
pub fn with_region_lock<T>(file: &File, offset: u64, body: impl FnOnce() -> T) -> Result<T> {
    lock_region_w(file, offset)?;
    let out = body();
    unlock_region(file, offset)?;
    Ok(out)
}

/// Result of a [`lock_proc`] attempt.
pub enum ProcLock {
    /// The slot was free; dropping the guard releases it.
    Acquired(ProcLockGuard),
    /// Someone else holds the slot; `holder` is their identity line.
    Held { holder: String },
}

/// Holds a process-lock slot for the lifetime of the guard.
pub struct ProcLockGuard {
    file: File,
    offset: u64,
}

impl Drop for ProcLockGuard {
    fn drop(&mut self) {
        if !self.noop() {
            let _ = unlock_region(&self.file, self.offset);
        }
    }
}

/// Claim the process-lock slot `id` in `lock_file`, or report the holder.
///
/// With `test_only` the slot is probed and immediately released on
/// success, so a supervisor can answer "is X running?" without taking
/// the role itself.
pub fn lock_proc(lock_file: &Path, id: ProcLockId, test_only: bool) -> Result<ProcLock> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_file)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BaseError::LockFileNotThere {
                    path: lock_file.display().to_string(),
                }
            } else {
                BaseError::Io(e)
            }
        })?;

    let offset = id as u64 * PROC_SLOT_SIZE;
    if !lock_region(&file, offset)? {
        return Ok(ProcLock::Held {
            holder: read_holder(&mut file, offset)?,
        });
    }

    if test_only {
        unlock_region(&file, offset)?;
        return Ok(ProcLock::Acquired(ProcLockGuard {
            file,
            offset: u64::MAX, // nothing to release
        }));
    }

    write_holder(&mut file, offset)?;
    Ok(ProcLock::Acquired(ProcLockGuard { file, offset }))
}

fn holder_line() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("{} [pid={}]", user, std::process::id())
}

fn write_holder(file: &mut File, offset: u64) -> Result<()> {
    let line = holder_line();
    let mut slot = [0u8; PROC_SLOT_SIZE as usize];
    let n = line.len().min(slot.len() - 2);
    slot[1..1 + n].copy_from_slice(&line.as_bytes()[..n]);
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&slot)?;
    file.flush()?;
    Ok(())
}

fn read_holder(file: &mut File, offset: u64) -> Result<String> {
    let mut slot = [0u8; PROC_SLOT_SIZE as usize];
    file.seek(SeekFrom::Start(offset))?;
    let _ = file.read(&mut slot)?;
    let end = slot[1..].iter().position(|&b| b == 0).unwrap_or(slot.len() - 1);
    let line = String::from_utf8_lossy(&slot[1..1 + end]).into_owned();
    if line.is_empty() {
        Ok("unknown [pid=?]".to_string())
    } else {
        Ok(line)
    }
}

impl ProcLockGuard {
    fn noop(&self) -> bool {
        self.offset == u64::MAX
    }
}

impl std::fmt::Debug for ProcLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcLockGuard")
            .field("offset", &self.offset)
            .field("test_only", &self.noop())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_region_lock_conflict_between_fds() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        std::fs::write(&path, vec![0u8; 128]).unwrap();

        let a = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        lock_region_w(&a, 40).unwrap();

        // fcntl locks are per-process, so conflict needs a child process.
        match unsafe { libc::fork() } {
            0 => {
                let b = OpenOptions::new().read(true).write(true).open(&path).unwrap();
                let got = lock_region(&b, 40).unwrap();
                std::process::exit(if got { 1 } else { 0 });
            }
            pid => {
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
                assert_eq!(libc::WEXITSTATUS(status), 0, "child acquired a held lock");
            }
        }

        unlock_region(&a, 40).unwrap();
    }

    #[test]
    fn test_lock_proc_reports_holder() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("lock");

        let guard = match lock_proc(&path, ProcLockId::Dispatcher, false).unwrap() {
            ProcLock::Acquired(g) => g,
            ProcLock::Held { holder } => panic!("unexpected holder {holder}"),
        };

        // A second probe from another process must see the holder line.
        match unsafe { libc::fork() } {
            0 => {
                let outcome = lock_proc(&path, ProcLockId::Dispatcher, true).unwrap();
                let code = match outcome {
                    ProcLock::Held { holder } if holder.contains("pid=") => 0,
                    _ => 1,
                };
                std::process::exit(code);
            }
            pid => {
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
                assert_eq!(libc::WEXITSTATUS(status), 0);
            }
        }

        drop(guard);
        match lock_proc(&path, ProcLockId::Dispatcher, false).unwrap() {
            ProcLock::Acquired(_) => {}
            ProcLock::Held { holder } => panic!("slot not released, holder {holder}"),
        }
    }

    #[test]
    fn test_with_region_lock_runs_body() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        std::fs::write(&path, vec![0u8; 16]).unwrap();
        let f = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        let v = with_region_lock(&f, 4, || 21 * 2).unwrap();
        assert_eq!(v, 42);
    }
}
