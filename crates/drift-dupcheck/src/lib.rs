//! # drift-dupcheck
//!
//! The duplicate-check store: a mapped vector of `(crc, flag, timeout)`
//! entries per checked context. What gets hashed (name, name+size,
//! content, ...) and with which CRC flavor is selected by flag bits;
//! the same bits record what a hit should do (delete, store away,
//! warn), so the logging side can reconstruct the decision.
//!
//! Eviction is lazy: expired entries are compacted out on insert.

use std::fs::File;
use std::path::Path;

use drift_base::lock::{lock_region_w, unlock_region};
use drift_hash::{checksum, checksum_reader, CrcFlavor, INITIAL_CRC};
use drift_region::{MappedRegion, RegionError};
use thiserror::Error;

/// Entries added per growth step.
pub const CRC_STEP_SIZE: usize = 1000;

pub const CURRENT_CRC_VERSION: u8 = 1;

/// Default clamp range for *configured* dup-check timeouts, in
/// seconds. The clamp belongs to configuration parsing; `isdup` takes
/// the timeout it is handed.
pub const DUPCHECK_MIN_CHECK_TIME: i64 = 5 * 86_400;
pub const DUPCHECK_MAX_CHECK_TIME: i64 = 40 * 86_400;

/// Flag bits controlling one check.
pub mod flag {
    // What is hashed.
    pub const FILENAME_ONLY: u32 = 1 << 0;
    pub const FILENAME_AND_SIZE: u32 = 1 << 1;
    pub const FILE_CONTENT: u32 = 1 << 2;
    pub const FILE_CONT_NAME: u32 = 1 << 3;
    pub const NAME_NO_SUFFIX: u32 = 1 << 4;

    // CRC flavor.
    pub const CRC32: u32 = 1 << 5;
    pub const CRC32C: u32 = 1 << 6;
    pub const MURMUR3: u32 = 1 << 7;

    // What a hit does (recorded, acted on by the caller).
    pub const DELETE: u32 = 1 << 8;
    pub const STORE: u32 = 1 << 9;
    pub const WARN: u32 = 1 << 10;

    // Modifiers.
    pub const USE_RECIPIENT_ID: u32 = 1 << 11;
    pub const TIMEOUT_IS_FIXED: u32 = 1 << 12;
}

/// Clamp a configured timeout into the supported window.
pub fn clamp_timeout(timeout: i64) -> i64 {
    timeout.clamp(DUPCHECK_MIN_CHECK_TIME, DUPCHECK_MAX_CHECK_TIME)
}

/// One stored fingerprint.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcEntry {
    pub crc: u32,
    pub flag: u32,
    pub timeout: i64,
}

const _: () = assert!(std::mem::size_of::<CrcEntry>() == 16);

#[derive(Error, Debug)]
pub enum DupError {
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("lock error: {0}")]
    Lock(#[from] drift_base::BaseError),

    #[error("hash error: {0}")]
    Hash(#[from] drift_hash::HashError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DupError>;

/// One duplicate check.
#[derive(Debug, Clone)]
pub struct DupCheck<'a> {
    pub name: &'a str,
    pub size: i64,
    /// File whose content is hashed for the content selectors.
    pub content: Option<&'a Path>,
    pub recipient_id: u32,
    pub flag: u32,
    /// Entry lifetime in seconds.
    pub timeout: i64,
}

impl DupCheck<'_> {
    fn flavor(&self) -> CrcFlavor {
        if self.flag & flag::MURMUR3 != 0 {
            CrcFlavor::Murmur3
        } else if self.flag & flag::CRC32C != 0 {
            CrcFlavor::Crc32c
        } else {
            CrcFlavor::Crc32
        }
    }

    fn fingerprint(&self) -> Result<u32> {
        let flavor = self.flavor();
        let mut crc = if self.flag & (flag::FILE_CONTENT | flag::FILE_CONT_NAME) != 0 {
            let path = self.content.ok_or_else(|| {
                DupError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "content check without a content path",
                ))
            })?;
            let mut file = File::open(path)?;
            checksum_reader(flavor, INITIAL_CRC, &mut file)?
        } else {
            INITIAL_CRC
        };

        if self.flag & flag::FILE_CONTENT == 0 {
            let name = if self.flag & flag::NAME_NO_SUFFIX != 0 {
                self.name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(self.name)
            } else {
                self.name
            };
            crc = checksum(flavor, crc, name.as_bytes());
            if self.flag & flag::FILENAME_AND_SIZE != 0 {
                crc = checksum(flavor, crc, &self.size.to_ne_bytes());
            }
        }

        if self.flag & flag::USE_RECIPIENT_ID != 0 {
            crc ^= self.recipient_id;
        }
        Ok(crc)
    }
}

/// A mapped duplicate-check store. The mmap lives exactly as long as
/// the handle; use [`isdup_once`] for one-shot checks.
pub struct DupStore {
    region: MappedRegion,
}

impl DupStore {
    /// Attach the store at `path`, creating it on first use.
    pub fn attach(path: &Path) -> Result<Self> {
        let mut region = if path.exists() {
            MappedRegion::attach(path)?
        } else {
            MappedRegion::create(
                path,
                CURRENT_CRC_VERSION,
                CRC_STEP_SIZE * std::mem::size_of::<CrcEntry>(),
            )?
        };
        region.ensure_version(CURRENT_CRC_VERSION, |_, found| {
            Err(RegionError::IncorrectVersion {
                found,
                expected: CURRENT_CRC_VERSION,
            })
        })?;
        Ok(Self { region })
    }

    pub fn len(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[CrcEntry] {
        &self.region.payload::<CrcEntry>()[..self.len()]
    }

    /// Check (and unless `test_only`, record) a fingerprint.
    ///
    /// Returns true when the fingerprint is present and alive at
    /// `now`. A live hit slides the entry's timeout forward unless
    /// `TIMEOUT_IS_FIXED` is set. A miss inserts the entry (lazily
    /// compacting out expired ones) unless `test_only`.
    pub fn isdup(&mut self, check: &DupCheck<'_>, now: i64, test_only: bool) -> Result<bool> {
        let crc = check.fingerprint()?;

        lock_region_w(self.region.file(), 0)?;
        let out = self.isdup_locked(check, crc, now, test_only);
        unlock_region(self.region.file(), 0)?;
        out
    }

    fn isdup_locked(
        &mut self,
        check: &DupCheck<'_>,
        crc: u32,
        now: i64,
        test_only: bool,
    ) -> Result<bool> {
        let n = self.len();
        {
            let entries = self.region.payload_mut::<CrcEntry>()?;
            if let Some(hit) = entries[..n]
                .iter_mut()
                .find(|e| e.crc == crc && e.timeout >= now)
            {
                if !test_only && check.flag & flag::TIMEOUT_IS_FIXED == 0 {
                    hit.timeout = now + check.timeout;
                }
                return Ok(true);
            }
        }

        if test_only {
            return Ok(false);
        }

        // Compact out the dead, then append.
        let mut kept = 0usize;
        {
            let entries = self.region.payload_mut::<CrcEntry>()?;
            for i in 0..n {
                if entries[i].timeout >= now {
                    if kept != i {
                        entries[kept] = entries[i];
                    }
                    kept += 1;
                }
            }
        }
        if kept < n {
            tracing::debug!(evicted = n - kept, "expired fingerprints compacted");
        }

        let capacity = self.region.payload::<CrcEntry>().len();
        if kept == capacity {
            self.region
                .resize((capacity + CRC_STEP_SIZE) * std::mem::size_of::<CrcEntry>())?;
        }
        self.region.payload_mut::<CrcEntry>()?[kept] = CrcEntry {
            crc,
            flag: check.flag,
            timeout: now + check.timeout,
        };
        self.region.set_count((kept + 1) as i32)?;
        Ok(false)
    }
}

/// One-shot check: attach, check, unmap.
pub fn isdup_once(path: &Path, check: &DupCheck<'_>, now: i64, test_only: bool) -> Result<bool> {
    let mut store = DupStore::attach(path)?;
    store.isdup(check, now, test_only)
}
