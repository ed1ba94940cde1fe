//! # drift-fra
//!
//! The File-retrieve Status Area: one fixed-size record per monitored
//! directory. Besides the live byte/file counters it carries the
//! retrieval schedule as cron-like bitmaps, evaluated by
//! [`calc_next_time`].
//!
//! The region protocol (versioned header, stale + reattach, byte-range
//! counter locks) is the same as the host table's.

pub mod schedule;

use std::mem::offset_of;
use std::path::Path;

use drift_base::lock::{lock_region_w, unlock_region};
use drift_region::{
    copy_str, numbered_path, read_region_id, read_str, MappedRegion, RegionError,
};
use thiserror::Error;
use tracing::debug;

pub use schedule::{calc_next_time, calc_next_time_array, TimeEntry, TIME_EXTERNAL};

/// Region file base name under `fifodir/`.
pub const FRA_STATUS_FILE: &str = "fra_status";
/// Redirection file holding the current image id.
pub const FRA_ID_FILE: &str = "fra.id";

pub const CURRENT_FRA_VERSION: u8 = 1;

pub const MAX_DIR_ALIAS_LENGTH: usize = 32;
pub const MAX_URL_LENGTH: usize = 256;
pub const MAX_TIMEZONE_LENGTH: usize = 32;
pub const MAX_FRA_TIME_ENTRIES: usize = 12;

// dir_flag bits.
pub const FILES_IN_QUEUE: u32 = 1 << 0;
pub const DIR_DISABLED: u32 = 1 << 1;
pub const DIR_STOPPED: u32 = 1 << 2;
pub const WARN_TIME_REACHED: u32 = 1 << 3;
pub const LINK_NO_EXEC: u32 = 1 << 4;

// dir_options bits.
pub const DELETE_UNKNOWN_FILES: u32 = 1 << 0;
pub const REPORT_UNKNOWN_FILES: u32 = 1 << 1;
pub const STORE_RETRIEVE_LIST: u32 = 1 << 2;
pub const DONT_REMOVE_FILES: u32 = 1 << 3;

/// One monitored-directory record, padded to exactly 1 KiB.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirRecord {
    pub bytes_in_dir: i64,
    pub bytes_in_queue: i64,
    pub last_retrieval: i64,
    pub next_check_time: i64,
    pub warn_time: i64,
    pub dup_check_timeout: i64,
    pub dir_id: u32,
    pub fsa_pos: i32,
    pub host_id: u32,
    pub files_in_dir: i32,
    pub files_queued: i32,
    pub dir_flag: u32,
    pub dir_options: u32,
    pub dup_check_flag: u32,
    pub no_of_time_entries: i32,
    pub max_copied_files: i32,
    pub dir_alias: [u8; MAX_DIR_ALIAS_LENGTH],
    pub url: [u8; MAX_URL_LENGTH],
    pub timezone: [u8; MAX_TIMEZONE_LENGTH],
    pub te: [TimeEntry; MAX_FRA_TIME_ENTRIES],
    pub _reserved: [u8; 232],
}

const _: () = assert!(std::mem::size_of::<DirRecord>() == 1024);

/// Lock rendezvous offset for the queue counters.
pub const LOCK_FQ: usize = offset_of!(DirRecord, files_queued);

impl DirRecord {
    pub fn new(alias: &str, url: &str) -> Self {
        let mut rec: DirRecord = unsafe { std::mem::zeroed() };
        copy_str(&mut rec.dir_alias, alias);
        copy_str(&mut rec.url, url);
        rec.dir_id = drift_hash::fingerprint(alias.as_bytes());
        rec.fsa_pos = -1;
        rec.max_copied_files = 100;
        rec
    }

    pub fn alias(&self) -> String {
        read_str(&self.dir_alias)
    }

    pub fn url_str(&self) -> String {
        read_str(&self.url)
    }

    pub fn timezone_str(&self) -> String {
        read_str(&self.timezone)
    }

    pub fn time_entries(&self) -> &[TimeEntry] {
        let n = (self.no_of_time_entries.max(0) as usize).min(MAX_FRA_TIME_ENTRIES);
        &self.te[..n]
    }
}

#[derive(Error, Debug)]
pub enum FraError {
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("lock error: {0}")]
    Lock(#[from] drift_base::BaseError),

    #[error("unknown directory: {0}")]
    UnknownDir(String),
}

pub type Result<T> = std::result::Result<T, FraError>;

/// Handle on the directory table.
pub struct Fra {
    region: MappedRegion,
}

impl Fra {
    pub fn create(path: &Path, dirs: &[DirRecord]) -> Result<Self> {
        let mut region = MappedRegion::create(
            path,
            CURRENT_FRA_VERSION,
            dirs.len() * std::mem::size_of::<DirRecord>(),
        )?;
        region.payload_mut::<DirRecord>()?[..dirs.len()].copy_from_slice(dirs);
        region.set_count(dirs.len() as i32)?;
        region.flush()?;
        Ok(Self { region })
    }

    pub fn attach(path: &Path) -> Result<Self> {
        let mut region = MappedRegion::attach(path)?;
        region.ensure_version(CURRENT_FRA_VERSION, |_, found| {
            Err(RegionError::IncorrectVersion {
                found,
                expected: CURRENT_FRA_VERSION,
            })
        })?;
        Ok(Self { region })
    }

    pub fn attach_passive(path: &Path) -> Result<Self> {
        let region = MappedRegion::attach_passive(path)?;
        if region.version() != CURRENT_FRA_VERSION {
            return Err(RegionError::IncorrectVersion {
                found: region.version(),
                expected: CURRENT_FRA_VERSION,
            }
            .into());
        }
        Ok(Self { region })
    }

    pub fn attach_current(fifodir: &Path) -> Result<Self> {
        let id = read_region_id(&fifodir.join(FRA_ID_FILE))?;
        Self::attach(&numbered_path(&fifodir.join(FRA_STATUS_FILE), id))
    }

    pub fn attach_current_passive(fifodir: &Path) -> Result<Self> {
        let id = read_region_id(&fifodir.join(FRA_ID_FILE))?;
        Self::attach_passive(&numbered_path(&fifodir.join(FRA_STATUS_FILE), id))
    }

    pub fn check_stale(&mut self, fifodir: &Path) -> Result<bool> {
        if !self.region.is_stale() {
            return Ok(false);
        }
        let id = read_region_id(&fifodir.join(FRA_ID_FILE))?;
        self.region = MappedRegion::attach(&numbered_path(&fifodir.join(FRA_STATUS_FILE), id))?;
        Ok(true)
    }

    pub fn detach(self, sync: bool) -> Result<()> {
        self.region.detach(sync)?;
        Ok(())
    }

    pub fn no_of_dirs(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn dirs(&self) -> &[DirRecord] {
        &self.region.payload::<DirRecord>()[..self.no_of_dirs()]
    }

    pub fn dirs_mut(&mut self) -> Result<&mut [DirRecord]> {
        let n = self.no_of_dirs();
        Ok(&mut self.region.payload_mut::<DirRecord>()?[..n])
    }

    pub fn dir(&self, pos: usize) -> &DirRecord {
        &self.dirs()[pos]
    }

    pub fn get_dir_position(&self, alias: &str) -> Option<usize> {
        self.dirs().iter().position(|d| d.alias() == alias)
    }

    pub fn get_dir_id_position(&self, dir_id: u32) -> Option<usize> {
        self.dirs().iter().position(|d| d.dir_id == dir_id)
    }

    fn fq_offset(pos: usize) -> u64 {
        MappedRegion::field_offset::<DirRecord>(pos, LOCK_FQ)
    }

    /// Add files/bytes to the queue counters and raise `FILES_IN_QUEUE`.
    pub fn bump_queue(&mut self, pos: usize, files: i32, bytes: i64) -> Result<()> {
        let off = Self::fq_offset(pos);
        lock_region_w(self.region.file(), off)?;
        {
            let dir = &mut self.dirs_mut()?[pos];
            dir.files_queued += files;
            dir.bytes_in_queue += bytes;
            if dir.files_queued > 0 {
                dir.dir_flag |= FILES_IN_QUEUE;
            }
        }
        unlock_region(self.region.file(), off)?;
        Ok(())
    }

    /// The canonical queue-reduction mutator: saturating decrement of
    /// both counters, clearing `FILES_IN_QUEUE` when the queue drains.
    pub fn abs_reduce_queue(&mut self, pos: usize, files: i32, bytes: i64) -> Result<()> {
        let off = Self::fq_offset(pos);
        lock_region_w(self.region.file(), off)?;
        let underflow = {
            let dir = &mut self.dirs_mut()?[pos];
            let mut underflow = false;
            dir.files_queued -= files;
            dir.bytes_in_queue -= bytes;
            if dir.files_queued < 0 {
                dir.files_queued = 0;
                underflow = true;
            }
            if dir.bytes_in_queue < 0 {
                dir.bytes_in_queue = 0;
                underflow = true;
            }
            if dir.files_queued == 0 {
                dir.dir_flag &= !FILES_IN_QUEUE;
                dir.bytes_in_queue = 0;
            }
            underflow
        };
        unlock_region(self.region.file(), off)?;
        if underflow {
            debug!(pos, files, bytes, "queue counter underflow repaired");
        }
        Ok(())
    }

    /// Record a completed retrieval and schedule the next check.
    pub fn note_retrieval(&mut self, pos: usize, now: i64) -> Result<()> {
        let (entries, tz): (Vec<TimeEntry>, String) = {
            let dir = self.dir(pos);
            (dir.time_entries().to_vec(), dir.timezone_str())
        };
        let tz = if tz.is_empty() { None } else { Some(tz) };
        let next = calc_next_time_array(&entries, tz.as_deref(), now);

        let dir = &mut self.dirs_mut()?[pos];
        dir.last_retrieval = now;
        if let Some(next) = next {
            // next_check_time never trails the retrieval it follows.
            dir.next_check_time = next.max(now);
        }
        Ok(())
    }
}
