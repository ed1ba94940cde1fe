//! Signal-safe read/write loops.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::Result;

/// Default slice size for [`writen`].
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Outcome of a [`readn`] call. A hard error is reported through `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer was filled completely.
    Complete,
    /// The peer closed before the buffer filled; `read` bytes arrived.
    Eof { read: usize },
    /// The timeout expired before the buffer filled.
    TimedOut { read: usize },
}

/// Read exactly `buf.len()` bytes, retrying short reads and `EINTR`.
///
/// With a timeout the fd is polled before every read so a stalled peer
/// cannot wedge the caller.
pub fn readn<F: Read + AsRawFd>(
    fd: &mut F,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<ReadOutcome> {
    let mut done = 0usize;

    while done < buf.len() {
        if let Some(t) = timeout {
            if !poll_readable(fd.as_raw_fd(), t)? {
                return Ok(ReadOutcome::TimedOut { read: done });
            }
        }
        match fd.read(&mut buf[done..]) {
            Ok(0) => return Ok(ReadOutcome::Eof { read: done }),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Non-blocking fd: wait for readiness. Without a
                // timeout this degrades to a poll loop, preserving
                // blocking semantics.
                let wait = timeout.unwrap_or(Duration::from_secs(1));
                if !poll_readable(fd.as_raw_fd(), wait)? && timeout.is_some() {
                    return Ok(ReadOutcome::TimedOut { read: done });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Complete)
}

/// Write all of `buf` in `block_size` slices, retrying `EINTR`.
pub fn writen<F: Write>(fd: &mut F, buf: &[u8], block_size: usize) -> Result<()> {
    let block = if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    let mut done = 0usize;

    while done < buf.len() {
        let end = (done + block).min(buf.len());
        match fd.write(&buf[done..end]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into())
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Open a file with `O_CLOEXEC` so forked workers do not inherit it.
pub fn coe_open(path: &std::path::Path, write: bool) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(write)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)?;
    Ok(file)
}

fn poll_readable(fd: i32, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        return Ok(rc > 0 && (pfd.revents & libc::POLLIN) != 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn test_writen_readn_roundtrip() {
        let mut file = tempfile::tempfile().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        writen(&mut file, &payload, 512).unwrap();
        file.rewind().unwrap();

        let mut buf = vec![0u8; payload.len()];
        let outcome = readn(&mut file, &mut buf, None).unwrap();
        assert_eq!(outcome, ReadOutcome::Complete);
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_readn_reports_eof() {
        let mut file = tempfile::tempfile().unwrap();
        writen(&mut file, b"short", 0).unwrap();
        file.rewind().unwrap();

        let mut buf = [0u8; 32];
        let outcome = readn(&mut file, &mut buf, None).unwrap();
        assert_eq!(outcome, ReadOutcome::Eof { read: 5 });
        assert_eq!(&buf[..5], b"short");
    }

    #[test]
    fn test_readn_times_out_on_silent_fifo() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("t.fifo");
        crate::fifo::make_fifo(&path).unwrap();
        let mut rd = crate::fifo::open_fifo_rd(&path).unwrap();

        let mut buf = [0u8; 8];
        let outcome = readn(&mut rd, &mut buf, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(outcome, ReadOutcome::TimedOut { read: 0 });
    }
}
