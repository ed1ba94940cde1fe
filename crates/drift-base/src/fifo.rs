//! Named fifo helpers.
//!
//! Every control and log channel in Drift is a named fifo under
//! `fifodir/`. Producers open write ends non-blocking so a missing
//! consumer never stalls the data plane.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::Result;

/// Create a named fifo, idempotently.
///
/// An already existing fifo is fine; any other error is passed up.
pub fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o660)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => {
            // Verify the existing node really is a fifo.
            let meta = std::fs::metadata(path)?;
            if meta.file_type().is_fifo() {
                Ok(())
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a fifo", path.display()),
                )
                .into())
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Open the write end of a fifo without blocking on a missing reader.
pub fn open_fifo_wr(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok(file)
}

/// Open the read end of a fifo non-blocking.
///
/// Opening read+write keeps the fifo alive across writer turnover so the
/// reader never sees a spurious EOF between producers.
pub fn open_fifo_rd(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok(file)
}

/// Write a single command byte to a fifo.
pub fn send_cmd(cmd: u8, fifo: &mut File) -> Result<()> {
    fifo.write_all(&[cmd])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_make_fifo_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cmd.fifo");

        make_fifo(&path).unwrap();
        make_fifo(&path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn test_make_fifo_rejects_regular_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("not_a_fifo");
        std::fs::write(&path, b"x").unwrap();

        assert!(make_fifo(&path).is_err());
    }

    #[test]
    fn test_send_cmd_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cmd.fifo");
        make_fifo(&path).unwrap();

        let mut rd = open_fifo_rd(&path).unwrap();
        let mut wr = open_fifo_wr(&path).unwrap();

        send_cmd(7, &mut wr).unwrap();

        let mut buf = [0u8; 1];
        rd.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }
}
