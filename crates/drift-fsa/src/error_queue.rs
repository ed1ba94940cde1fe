//! Error queue.
//!
//! A small shared region listing the hosts whose transfers are
//! currently failing, so operator tools can paint the problem set
//! without scanning the whole host table. Entries mirror the
//! `ERROR_QUEUE_SET` bit in `host_status`.

use std::path::Path;

use drift_region::MappedRegion;

use crate::Result;

/// Region file under `fifodir/`.
pub const ERROR_QUEUE_FILE: &str = "error_queue";

const ERROR_QUEUE_VERSION: u8 = 1;
const ERROR_QUEUE_STEP: usize = 16;

/// One failing host.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorQueueEntry {
    pub host_id: u32,
    pub error_counter: u32,
    pub first_seen: i64,
}

const _: () = assert!(std::mem::size_of::<ErrorQueueEntry>() == 16);

/// The mapped error queue.
pub struct ErrorQueue {
    region: MappedRegion,
}

impl ErrorQueue {
    pub fn open(fifodir: &Path) -> Result<Self> {
        let path = fifodir.join(ERROR_QUEUE_FILE);
        let region = if path.exists() {
            MappedRegion::attach(&path)?
        } else {
            MappedRegion::create(
                &path,
                ERROR_QUEUE_VERSION,
                ERROR_QUEUE_STEP * std::mem::size_of::<ErrorQueueEntry>(),
            )?
        };
        region.require_version(ERROR_QUEUE_VERSION)?;
        Ok(Self { region })
    }

    pub fn open_passive(fifodir: &Path) -> Result<Self> {
        let region = MappedRegion::attach_passive(&fifodir.join(ERROR_QUEUE_FILE))?;
        region.require_version(ERROR_QUEUE_VERSION)?;
        Ok(Self { region })
    }

    pub fn len(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[ErrorQueueEntry] {
        &self.region.payload::<ErrorQueueEntry>()[..self.len()]
    }

    pub fn contains(&self, host_id: u32) -> bool {
        self.entries().iter().any(|e| e.host_id == host_id)
    }

    /// Add or refresh a failing host.
    pub fn add(&mut self, host_id: u32, error_counter: u32, now: i64) -> Result<()> {
        let n = self.len();
        {
            let entries = self.region.payload_mut::<ErrorQueueEntry>()?;
            if let Some(e) = entries[..n].iter_mut().find(|e| e.host_id == host_id) {
                e.error_counter = error_counter;
                return Ok(());
            }
        }
        let capacity = self.region.payload::<ErrorQueueEntry>().len();
        if n == capacity {
            self.region
                .resize((capacity + ERROR_QUEUE_STEP) * std::mem::size_of::<ErrorQueueEntry>())?;
        }
        self.region.payload_mut::<ErrorQueueEntry>()?[n] = ErrorQueueEntry {
            host_id,
            error_counter,
            first_seen: now,
        };
        self.region.set_count((n + 1) as i32)?;
        Ok(())
    }

    /// Drop a host that recovered. Returns whether it was listed.
    pub fn remove(&mut self, host_id: u32) -> Result<bool> {
        let n = self.len();
        let entries = self.region.payload_mut::<ErrorQueueEntry>()?;
        let Some(index) = entries[..n].iter().position(|e| e.host_id == host_id) else {
            return Ok(false);
        };
        entries.copy_within(index + 1..n, index);
        self.region.set_count((n - 1) as i32)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_refresh_remove() {
        let temp = tempdir().unwrap();
        let mut eq = ErrorQueue::open(temp.path()).unwrap();

        eq.add(0xaaaa, 1, 100).unwrap();
        eq.add(0xbbbb, 3, 110).unwrap();
        assert_eq!(eq.len(), 2);
        assert!(eq.contains(0xaaaa));

        // Refresh keeps first_seen.
        eq.add(0xaaaa, 5, 200).unwrap();
        assert_eq!(eq.len(), 2);
        let entry = eq.entries()[0];
        assert_eq!(entry.error_counter, 5);
        assert_eq!(entry.first_seen, 100);

        assert!(eq.remove(0xaaaa).unwrap());
        assert!(!eq.contains(0xaaaa));
        assert!(!eq.remove(0xaaaa).unwrap());
        assert_eq!(eq.entries()[0].host_id, 0xbbbb);
    }

    #[test]
    fn test_grows_past_step() {
        let temp = tempdir().unwrap();
        let mut eq = ErrorQueue::open(temp.path()).unwrap();
        for i in 0..(ERROR_QUEUE_STEP as u32 + 4) {
            eq.add(i, 1, 0).unwrap();
        }
        assert_eq!(eq.len(), ERROR_QUEUE_STEP + 4);
    }

    #[test]
    fn test_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let mut eq = ErrorQueue::open(temp.path()).unwrap();
            eq.add(7, 2, 50).unwrap();
        }
        let eq = ErrorQueue::open(temp.path()).unwrap();
        assert!(eq.contains(7));
    }
}
