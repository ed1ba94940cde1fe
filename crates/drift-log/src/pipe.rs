//! Log fifo producers.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use drift_base::fifo::{make_fifo, open_fifo_wr};
use tracing::debug;

use crate::{LogKind, Result};

/// Producer end of one log fifo.
///
/// A full fifo (`EAGAIN`) gets exactly one retry; after that the
/// record is dropped and counted. The pipeline never blocks transfers
/// on a slow logger.
pub struct LogPipe {
    kind: LogKind,
    fifo: File,
    // Keeps the fifo connected until the logger process attaches, so
    // early writes do not fail with ENXIO.
    _anchor: Option<File>,
    dropped: AtomicU64,
}

impl LogPipe {
    /// Create the fifo if needed and open its write end.
    pub fn open(fifodir: &Path, kind: LogKind) -> Result<Self> {
        let path = fifodir.join(kind.fifo_name());
        make_fifo(&path)?;
        let (fifo, anchor) = match open_fifo_wr(&path) {
            Ok(f) => (f, None),
            Err(_) => {
                let keep = drift_base::fifo::open_fifo_rd(&path)?;
                (open_fifo_wr(&path)?, Some(keep))
            }
        };
        Ok(Self {
            kind,
            fifo,
            _anchor: anchor,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Records dropped because the fifo stayed full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Write one record; returns whether it was accepted.
    pub fn write_record(&mut self, record: &[u8]) -> Result<bool> {
        for attempt in 0..2 {
            match self.fifo.write_all(record) {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && attempt == 0 => {
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(kind = ?self.kind, "log fifo full, record dropped");
        Ok(false)
    }
}
