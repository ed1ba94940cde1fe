//! # drift-retrieve
//!
//! The retrieve list: a per-remote-directory catalog of files already
//! seen, so repeated polls only fetch what is new.
//!
//! The on-disk record evolved over time; the header's version byte
//! selects the layout and [`RetrieveList::attach`] migrates old images
//! in place before use:
//!
//! - v0: name, size, mtime, flags, retrieved/in_list
//! - v1: adds `assigned` and `special_flag` (carved out of padding)
//! - v2: adds `prev_size`
//! - v3: adds `extra_data` (only with the `extra-check` feature)

use std::path::Path;

use drift_region::{copy_str, read_str, MappedRegion, RegionError};
use thiserror::Error;

/// Remote file names longer than this are truncated by the scanner.
pub const MAX_REMOTE_FILENAME_LENGTH: usize = 128;

/// Records added per growth step.
pub const RETRIEVE_STEP_SIZE: usize = 50;

#[cfg(feature = "extra-check")]
pub const CURRENT_RL_VERSION: u8 = 3;
#[cfg(not(feature = "extra-check"))]
pub const CURRENT_RL_VERSION: u8 = 2;

/// Extra verification payload length (v3 records).
pub const EXTRA_DATA_LENGTH: usize = 64;

// Flag bits.
pub const RL_GOT_SIZE_DATE: u32 = 1 << 0;
pub const RL_GOT_EXACT_SIZE: u32 = 1 << 1;
pub const RL_GOT_EXACT_DATE: u32 = 1 << 2;

/// Version 0 record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRecordV0 {
    pub file_mtime: i64,
    pub size: i64,
    pub flags: u32,
    pub retrieved: u8,
    pub in_list: u8,
    pub _pad: [u8; 2],
    pub file_name: [u8; MAX_REMOTE_FILENAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<RetrieveRecordV0>() == 152);

/// Version 1 record: `assigned` and `special_flag` live where v0 had
/// padding, so the byte layout is upgrade-compatible in place.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRecordV1 {
    pub file_mtime: i64,
    pub size: i64,
    pub flags: u32,
    pub retrieved: u8,
    pub in_list: u8,
    pub assigned: u8,
    pub special_flag: u8,
    pub file_name: [u8; MAX_REMOTE_FILENAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<RetrieveRecordV1>() == 152);

/// Version 2 record, adding `prev_size`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRecordV2 {
    pub file_mtime: i64,
    pub size: i64,
    pub prev_size: i64,
    pub flags: u32,
    pub retrieved: u8,
    pub in_list: u8,
    pub assigned: u8,
    pub special_flag: u8,
    pub file_name: [u8; MAX_REMOTE_FILENAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<RetrieveRecordV2>() == 160);

/// Version 3 record, adding `extra_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRecordV3 {
    pub file_mtime: i64,
    pub size: i64,
    pub prev_size: i64,
    pub flags: u32,
    pub retrieved: u8,
    pub in_list: u8,
    pub assigned: u8,
    pub special_flag: u8,
    pub file_name: [u8; MAX_REMOTE_FILENAME_LENGTH],
    pub extra_data: [u8; EXTRA_DATA_LENGTH],
}

const _: () = assert!(std::mem::size_of::<RetrieveRecordV3>() == 224);

#[cfg(feature = "extra-check")]
pub type RetrieveRecord = RetrieveRecordV3;
#[cfg(not(feature = "extra-check"))]
pub type RetrieveRecord = RetrieveRecordV2;

impl RetrieveRecord {
    pub fn new(name: &str, size: i64, file_mtime: i64) -> Self {
        let mut rec: RetrieveRecord = unsafe { std::mem::zeroed() };
        copy_str(&mut rec.file_name, name);
        rec.size = size;
        rec.file_mtime = file_mtime;
        rec.in_list = 1;
        rec
    }

    pub fn name(&self) -> String {
        read_str(&self.file_name)
    }
}

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("retrieve list full and not growable")]
    Full,
}

pub type Result<T> = std::result::Result<T, RetrieveError>;

/// A mapped retrieve list at the current record version.
pub struct RetrieveList {
    region: MappedRegion,
}

impl RetrieveList {
    /// Create an empty list stamped with `created` in the header.
    pub fn create(path: &Path, created: i64) -> Result<Self> {
        let mut region = MappedRegion::create(
            path,
            CURRENT_RL_VERSION,
            RETRIEVE_STEP_SIZE * std::mem::size_of::<RetrieveRecord>(),
        )?;
        region.header_mut()?.reserved = created as i32;
        region.flush()?;
        Ok(Self { region })
    }

    /// Attach an existing list, migrating old record layouts in place.
    ///
    /// On conversion failure the caller must skip retrieval for this
    /// directory this cycle; the old image stays untouched.
    pub fn attach(path: &Path) -> Result<Self> {
        let mut region = MappedRegion::attach(path)?;
        region.ensure_version(CURRENT_RL_VERSION, convert_ls_data)?;
        Ok(Self { region })
    }

    pub fn no_of_listed_files(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn created(&self) -> i64 {
        self.region.header().reserved as i64
    }

    pub fn records(&self) -> &[RetrieveRecord] {
        &self.region.payload::<RetrieveRecord>()[..self.no_of_listed_files()]
    }

    pub fn records_mut(&mut self) -> Result<&mut [RetrieveRecord]> {
        let n = self.no_of_listed_files();
        Ok(&mut self.region.payload_mut::<RetrieveRecord>()?[..n])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.records().iter().position(|r| r.name() == name)
    }

    /// Add or refresh a file entry, growing the region when full.
    pub fn upsert(&mut self, name: &str, size: i64, file_mtime: i64) -> Result<usize> {
        if let Some(pos) = self.position(name) {
            let rec = &mut self.records_mut()?[pos];
            rec.prev_size = rec.size;
            rec.size = size;
            rec.file_mtime = file_mtime;
            rec.in_list = 1;
            return Ok(pos);
        }

        let n = self.no_of_listed_files();
        let capacity = self.region.payload::<RetrieveRecord>().len();
        if n == capacity {
            self.region.resize(
                (capacity + RETRIEVE_STEP_SIZE) * std::mem::size_of::<RetrieveRecord>(),
            )?;
        }
        self.region.payload_mut::<RetrieveRecord>()?[n] = RetrieveRecord::new(name, size, file_mtime);
        self.region.set_count((n + 1) as i32)?;
        Ok(n)
    }

    /// Mark the start of a poll: nothing is in the remote listing yet.
    pub fn begin_poll(&mut self) -> Result<()> {
        for rec in self.records_mut()? {
            rec.in_list = 0;
        }
        Ok(())
    }

    /// Drop entries that vanished from the remote listing.
    pub fn prune_unlisted(&mut self) -> Result<usize> {
        let n = self.no_of_listed_files();
        let recs = self.region.payload_mut::<RetrieveRecord>()?;
        let mut kept = 0usize;
        for i in 0..n {
            if recs[i].in_list != 0 {
                if kept != i {
                    recs[kept] = recs[i];
                }
                kept += 1;
            }
        }
        let dropped = n - kept;
        self.region.set_count(kept as i32)?;
        if dropped > 0 {
            tracing::debug!(dropped, kept, "pruned vanished remote files");
        }
        Ok(dropped)
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()?;
        Ok(())
    }
}

/// In-place upward migration of one version step.
///
/// Chained by the version gate until the current layout is reached.
/// The version byte is stamped only after the new records are in
/// place, so an interrupted run leaves a readable old image.
pub fn convert_ls_data(
    region: &mut MappedRegion,
    found: u8,
) -> std::result::Result<(), RegionError> {
    let count = region.count().max(0) as usize;
    match found {
        0 => {
            // v1 fields occupy v0 padding: zero them, stamp.
            let recs = region.payload_mut::<RetrieveRecordV1>()?;
            for rec in recs[..count].iter_mut() {
                rec.assigned = 0;
                rec.special_flag = 0;
            }
            region.header_mut()?.version = 1;
        }
        1 => {
            let old: Vec<RetrieveRecordV1> =
                region.payload::<RetrieveRecordV1>()[..count].to_vec();
            region.resize(count.max(RETRIEVE_STEP_SIZE) * std::mem::size_of::<RetrieveRecordV2>())?;
            let new = region.payload_mut::<RetrieveRecordV2>()?;
            for (i, o) in old.iter().enumerate() {
                new[i] = RetrieveRecordV2 {
                    file_mtime: o.file_mtime,
                    size: o.size,
                    prev_size: 0,
                    flags: o.flags,
                    retrieved: o.retrieved,
                    in_list: o.in_list,
                    assigned: o.assigned,
                    special_flag: o.special_flag,
                    file_name: o.file_name,
                };
            }
            region.header_mut()?.version = 2;
        }
        #[cfg(feature = "extra-check")]
        2 => {
            let old: Vec<RetrieveRecordV2> =
                region.payload::<RetrieveRecordV2>()[..count].to_vec();
            region.resize(count.max(RETRIEVE_STEP_SIZE) * std::mem::size_of::<RetrieveRecordV3>())?;
            let new = region.payload_mut::<RetrieveRecordV3>()?;
            for (i, o) in old.iter().enumerate() {
                new[i] = RetrieveRecordV3 {
                    file_mtime: o.file_mtime,
                    size: o.size,
                    prev_size: o.prev_size,
                    flags: o.flags,
                    retrieved: o.retrieved,
                    in_list: o.in_list,
                    assigned: o.assigned,
                    special_flag: o.special_flag,
                    file_name: o.file_name,
                    extra_data: [0; EXTRA_DATA_LENGTH],
                };
            }
            region.header_mut()?.version = 3;
        }
        v => {
            return Err(RegionError::IncorrectVersion {
                found: v,
                expected: CURRENT_RL_VERSION,
            })
        }
    }
    region.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_v0(path: &Path, entries: &[(&str, i64, i64)]) {
        let mut region = MappedRegion::create(
            path,
            0,
            entries.len() * std::mem::size_of::<RetrieveRecordV0>(),
        )
        .unwrap();
        {
            let recs = region.payload_mut::<RetrieveRecordV0>().unwrap();
            for (i, (name, size, mtime)) in entries.iter().enumerate() {
                let mut rec: RetrieveRecordV0 = unsafe { std::mem::zeroed() };
                copy_str(&mut rec.file_name, name);
                rec.size = *size;
                rec.file_mtime = *mtime;
                rec.in_list = 1;
                rec.retrieved = (i % 2) as u8;
                recs[i] = rec;
            }
        }
        region.set_count(entries.len() as i32).unwrap();
        region.flush().unwrap();
    }

    #[test]
    fn test_upgrade_v0_to_current_preserves_fields() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ls_data");
        write_v0(
            &path,
            &[("a.bin", 10, 100), ("b.bin", 20, 200), ("c.bin", 30, 300)],
        );

        let list = RetrieveList::attach(&path).unwrap();
        assert_eq!(list.no_of_listed_files(), 3);

        let recs = list.records();
        for (i, (name, size, mtime)) in
            [("a.bin", 10i64, 100i64), ("b.bin", 20, 200), ("c.bin", 30, 300)]
                .iter()
                .enumerate()
        {
            assert_eq!(recs[i].name(), *name);
            assert_eq!(recs[i].size, *size);
            assert_eq!(recs[i].file_mtime, *mtime);
            assert_eq!(recs[i].prev_size, 0);
            assert_eq!(recs[i].assigned, 0);
            assert_eq!(recs[i].special_flag, 0);
            assert_eq!(recs[i].in_list, 1);
            assert_eq!(recs[i].retrieved, (i % 2) as u8);
        }
    }

    #[test]
    fn test_upgraded_image_is_stamped_current() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ls_data");
        write_v0(&path, &[("x", 1, 2)]);

        drop(RetrieveList::attach(&path).unwrap());

        let region = MappedRegion::attach(&path).unwrap();
        assert_eq!(region.version(), CURRENT_RL_VERSION);
        assert_eq!(region.count(), 1);
    }

    #[test]
    fn test_attach_refuses_future_version() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ls_data");
        let region = MappedRegion::create(&path, 9, 160).unwrap();
        drop(region);

        assert!(matches!(
            RetrieveList::attach(&path),
            Err(RetrieveError::Region(RegionError::IncorrectVersion { .. }))
        ));
    }

    #[test]
    fn test_upsert_tracks_prev_size_and_grows() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ls_data");
        let mut list = RetrieveList::create(&path, 1234).unwrap();
        assert_eq!(list.created(), 1234);

        for i in 0..(RETRIEVE_STEP_SIZE + 5) {
            list.upsert(&format!("f{i}"), i as i64, 0).unwrap();
        }
        assert_eq!(list.no_of_listed_files(), RETRIEVE_STEP_SIZE + 5);

        let pos = list.upsert("f3", 99, 7).unwrap();
        assert_eq!(pos, 3);
        let rec = &list.records()[3];
        assert_eq!(rec.size, 99);
        assert_eq!(rec.prev_size, 3);
        assert_eq!(rec.file_mtime, 7);
    }

    #[test]
    fn test_poll_cycle_prunes_vanished_files() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ls_data");
        let mut list = RetrieveList::create(&path, 0).unwrap();
        list.upsert("keep", 1, 1).unwrap();
        list.upsert("gone", 2, 2).unwrap();

        list.begin_poll().unwrap();
        list.upsert("keep", 1, 1).unwrap();

        assert_eq!(list.prune_unlisted().unwrap(), 1);
        assert_eq!(list.no_of_listed_files(), 1);
        assert_eq!(list.records()[0].name(), "keep");
    }
}
