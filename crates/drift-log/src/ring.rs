//! Sign ring history.
//!
//! The status region remembers the sign of the most recent records of
//! every log, so the operator view can paint a severity history
//! without re-reading log files.

use std::path::Path;

use drift_region::MappedRegion;

use crate::{LogKind, Result, Sign, LOG_FIFO_SIZE};

/// Status region file under `fifodir/`.
pub const STATUS_FILE: &str = "drift.status";

const STATUS_VERSION: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RingRecord {
    next: u32,
    signs: [u8; LOG_FIFO_SIZE],
}

const _: () = assert!(std::mem::size_of::<RingRecord>() == 44);

/// The mapped ring table, one slot per [`LogKind`].
pub struct SignRing {
    region: MappedRegion,
}

impl SignRing {
    pub fn open(fifodir: &Path) -> Result<Self> {
        let path = fifodir.join(STATUS_FILE);
        let mut region = if path.exists() {
            MappedRegion::attach(&path)?
        } else {
            MappedRegion::create(
                &path,
                STATUS_VERSION,
                LogKind::ALL.len() * std::mem::size_of::<RingRecord>(),
            )?
        };
        region.require_version(STATUS_VERSION)?;
        if region.count() == 0 {
            region.set_count(LogKind::ALL.len() as i32)?;
        }
        Ok(Self { region })
    }

    pub fn open_passive(fifodir: &Path) -> Result<Self> {
        let region = MappedRegion::attach_passive(&fifodir.join(STATUS_FILE))?;
        region.require_version(STATUS_VERSION)?;
        Ok(Self { region })
    }

    /// Remember `sign` as the newest record of `kind`.
    pub fn push(&mut self, kind: LogKind, sign: Sign) -> Result<()> {
        let rec = &mut self.region.payload_mut::<RingRecord>()?[kind.ring_slot()];
        let at = rec.next as usize % LOG_FIFO_SIZE;
        rec.signs[at] = sign as u8;
        rec.next = ((at + 1) % LOG_FIFO_SIZE) as u32;
        Ok(())
    }

    /// The remembered signs, oldest first, zero slots skipped.
    pub fn history(&self, kind: LogKind) -> Vec<char> {
        let rec = &self.region.payload::<RingRecord>()[kind.ring_slot()];
        let start = rec.next as usize % LOG_FIFO_SIZE;
        (0..LOG_FIFO_SIZE)
            .map(|i| rec.signs[(start + i) % LOG_FIFO_SIZE])
            .filter(|&b| b != 0)
            .map(|b| b as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_history_keeps_order() {
        let temp = tempdir().unwrap();
        let mut ring = SignRing::open(temp.path()).unwrap();

        ring.push(LogKind::System, Sign::Info).unwrap();
        ring.push(LogKind::System, Sign::Warn).unwrap();
        ring.push(LogKind::System, Sign::Error).unwrap();

        assert_eq!(ring.history(LogKind::System), vec!['I', 'W', 'E']);
        assert!(ring.history(LogKind::Transfer).is_empty());
    }

    #[test]
    fn test_ring_wraps_and_evicts_oldest() {
        let temp = tempdir().unwrap();
        let mut ring = SignRing::open(temp.path()).unwrap();

        for _ in 0..LOG_FIFO_SIZE {
            ring.push(LogKind::Delete, Sign::Info).unwrap();
        }
        ring.push(LogKind::Delete, Sign::Fatal).unwrap();

        let hist = ring.history(LogKind::Delete);
        assert_eq!(hist.len(), LOG_FIFO_SIZE);
        assert_eq!(*hist.last().unwrap(), 'F');
        assert_eq!(hist[0], 'I');
    }

    #[test]
    fn test_reopen_preserves_history() {
        let temp = tempdir().unwrap();
        {
            let mut ring = SignRing::open(temp.path()).unwrap();
            ring.push(LogKind::Event, Sign::Config).unwrap();
        }
        let ring = SignRing::open(temp.path()).unwrap();
        assert_eq!(ring.history(LogKind::Event), vec!['C']);
    }
}
