//! # drift-fsa
//!
//! The File-transfer Status Area: a memory-mapped table with one
//! fixed-size record per configured host. Transfer workers mutate their
//! own `job_status` slot without locks; the shared counters and the
//! status word are mutated under one-byte range locks at the offset of
//! the field itself.
//!
//! A configuration rewrite replaces the table: the new image is
//! published as `fsa_status.<id>` with the id in `fsa.id`, and the old
//! image's count word is set to `-1` so readers reattach.

pub mod error_queue;
pub mod host_config;

use std::mem::offset_of;

pub use error_queue::{ErrorQueue, ErrorQueueEntry, ERROR_QUEUE_FILE};
use std::path::{Path, PathBuf};

use drift_base::lock::{lock_region_w, unlock_region};
use drift_region::{
    copy_str, numbered_path, read_region_id, read_str, write_region_id, MappedRegion, RegionError,
};
use thiserror::Error;
use tracing::info;

/// Region file base name under `fifodir/`.
pub const FSA_STATUS_FILE: &str = "fsa_status";
/// Redirection file holding the current image id.
pub const FSA_ID_FILE: &str = "fsa.id";

pub const CURRENT_FSA_VERSION: u8 = 1;

pub const MAX_HOSTNAME_LENGTH: usize = 16;
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 64;
pub const MAX_NO_PARALLEL_JOBS: usize = 8;
pub const ERROR_HISTORY_LENGTH: usize = 5;
pub const MAX_MSG_NAME_LENGTH: usize = 64;
pub const MAX_FILENAME_LENGTH: usize = 256;

// host_status bits.
pub const STOP_TRANSFER_STAT: u32 = 1 << 0;
pub const PAUSE_QUEUE_STAT: u32 = 1 << 1;
pub const AUTO_PAUSE_QUEUE_STAT: u32 = 1 << 2;
pub const DANGER_PAUSE_QUEUE_STAT: u32 = 1 << 3;
pub const HOST_ERROR_OFFLINE_STATIC: u32 = 1 << 4;
pub const HOST_CONFIG_HOST_DISABLED: u32 = 1 << 5;
pub const ERROR_QUEUE_SET: u32 = 1 << 6;
pub const PENDING_ERRORS: u32 = 1 << 7;
pub const HOST_ERROR_ACKNOWLEDGED: u32 = 1 << 8;
pub const HOST_ERROR_OFFLINE: u32 = 1 << 9;
pub const HOST_WARN_TIME_REACHED: u32 = 1 << 10;
pub const DO_NOT_DELETE_DATA: u32 = 1 << 11;
pub const HOST_ACTION_SUCCESS: u32 = 1 << 12;
pub const SIMULATE_SEND_MODE: u32 = 1 << 13;

/// Bits that stop new work from being dispatched to a host.
pub const HOST_NOT_DISPATCHABLE: u32 = STOP_TRANSFER_STAT
    | PAUSE_QUEUE_STAT
    | AUTO_PAUSE_QUEUE_STAT
    | DANGER_PAUSE_QUEUE_STAT
    | HOST_CONFIG_HOST_DISABLED;

/// Bits marking a host whose errors are acknowledged or known-offline;
/// log records for such hosts carry the `O` sign.
pub const HOST_ERROR_OFFLINE_ANY: u32 =
    HOST_ERROR_OFFLINE | HOST_ERROR_OFFLINE_STATIC | HOST_ERROR_ACKNOWLEDGED;

/// Protocol bits for `HostRecord::protocol`.
pub mod protocol {
    pub const FTP: u32 = 1 << 0;
    pub const SFTP: u32 = 1 << 1;
    pub const SMTP: u32 = 1 << 2;
    pub const HTTP: u32 = 1 << 3;
    pub const LOC: u32 = 1 << 4;
    pub const EXEC: u32 = 1 << 5;
}

/// Values for `JobStatus::connect_status`.
pub mod connect_status {
    pub const DISCONNECT: u8 = 0;
    pub const NOT_WORKING: u8 = 1;
    pub const CONNECTING: u8 = 2;
    pub const TRANSFERRING: u8 = 3;
}

/// One byte per event in `error_history`.
pub mod transfer_error {
    pub const NONE: u8 = 0;
    pub const CONNECT_ERROR: u8 = 1;
    pub const TIMEOUT_ERROR: u8 = 2;
    pub const CON_RESET: u8 = 3;
    pub const CON_REFUSED: u8 = 4;
    pub const WRITE_REMOTE_ERROR: u8 = 5;
    pub const AUTH_ERROR: u8 = 6;
    pub const EXIT_NONZERO: u8 = 7;
}

/// Per-slot state of one active transfer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JobStatus {
    pub file_size: i64,
    pub file_size_done: i64,
    pub bytes_send: u64,
    pub file_size_in_use: i64,
    pub file_size_in_use_done: i64,
    pub proc_id: i32,
    pub job_id: u32,
    pub no_of_files: i32,
    pub no_of_files_done: i32,
    pub connect_status: u8,
    pub _pad: [u8; 7],
    pub unique_name: [u8; MAX_MSG_NAME_LENGTH],
    pub file_name_in_use: [u8; MAX_FILENAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<JobStatus>() == 384);

/// One host record. Layout is fixed; the trailing reserve pads the
/// record to exactly 4 KiB.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostRecord {
    pub transfer_timeout: i64,
    pub transfer_rate_limit: i64,
    pub warn_time: i64,
    pub dup_check_timeout: i64,
    pub last_retry_time: i64,
    pub last_connection: i64,
    pub first_error_time: i64,
    pub total_file_size: i64,
    pub bytes_send: u64,
    pub host_id: u32,
    pub protocol: u32,
    pub protocol_options: u32,
    pub protocol_options2: u32,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub keep_connected: u32,
    pub dup_check_flag: u32,
    pub host_status: u32,
    pub error_counter: i32,
    pub total_errors: u32,
    pub total_file_counter: i32,
    pub jobs_queued: i32,
    pub file_counter_done: u32,
    pub connections: u32,
    pub active_transfers: i32,
    pub host_toggle: u8,
    pub error_history: [u8; ERROR_HISTORY_LENGTH],
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH],
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LENGTH]; 2],
    pub _pad: [u8; 2],
    pub job_status: [JobStatus; MAX_NO_PARALLEL_JOBS],
    pub _reserved: [u8; 728],
}

const _: () = assert!(std::mem::size_of::<HostRecord>() == 4096);

// Lock rendezvous offsets, relative to the start of a host record.
pub const LOCK_TFC: usize = offset_of!(HostRecord, total_file_counter);
pub const LOCK_EC: usize = offset_of!(HostRecord, error_counter);
pub const LOCK_HS: usize = offset_of!(HostRecord, host_status);
pub const LOCK_CON: usize = offset_of!(HostRecord, connections);
pub const LOCK_FIU: usize = offset_of!(HostRecord, job_status);

// Region-wide rendezvous offsets inside the header.
pub const LOCK_CHECK_FSA_ENTRIES: u64 = 8;
pub const LOCK_EXEC: u64 = 9;

impl HostRecord {
    /// Fresh record with configuration defaults.
    pub fn new(alias: &str) -> Self {
        let mut rec: HostRecord = unsafe { std::mem::zeroed() };
        copy_str(&mut rec.host_alias, alias);
        rec.host_id = drift_hash::fingerprint(alias.as_bytes());
        rec.allowed_transfers = 3;
        rec.max_errors = 10;
        rec.retry_interval = 120;
        rec.block_size = 4096;
        rec.transfer_timeout = 60;
        rec
    }

    pub fn alias(&self) -> String {
        read_str(&self.host_alias)
    }

    pub fn real_hostname(&self, toggle: usize) -> String {
        read_str(&self.real_hostname[toggle & 1])
    }

    /// Count of slots currently claimed by live workers.
    pub fn busy_slots(&self) -> i32 {
        self.job_status.iter().filter(|j| j.proc_id > 0).count() as i32
    }

    pub fn is_dispatchable(&self) -> bool {
        (self.host_status & HOST_NOT_DISPATCHABLE) == 0
            && self.active_transfers < self.allowed_transfers
    }
}

#[derive(Error, Debug)]
pub enum FsaError {
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("lock error: {0}")]
    Lock(#[from] drift_base::BaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("bad alias order: {0}")]
    BadOrder(String),
}

pub type Result<T> = std::result::Result<T, FsaError>;

/// Whether a counter mutation had to repair drifted accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repaired {
    No,
    Yes,
}

/// Handle on the host table.
pub struct Fsa {
    region: MappedRegion,
}

impl Fsa {
    /// Create a fresh table with the given aliases at `path`.
    pub fn create(path: &Path, aliases: &[&str]) -> Result<Self> {
        let mut region = MappedRegion::create(
            path,
            CURRENT_FSA_VERSION,
            aliases.len() * std::mem::size_of::<HostRecord>(),
        )?;
        {
            let hosts = region.payload_mut::<HostRecord>()?;
            for (i, alias) in aliases.iter().enumerate() {
                hosts[i] = HostRecord::new(alias);
            }
        }
        region.set_count(aliases.len() as i32)?;
        region.flush()?;
        Ok(Self { region })
    }

    /// Attach the current image read-write, via the `fsa.id` redirect.
    pub fn attach_current(fifodir: &Path) -> Result<Self> {
        let id = read_region_id(&fifodir.join(FSA_ID_FILE))?;
        Self::attach(&numbered_path(&fifodir.join(FSA_STATUS_FILE), id))
    }

    pub fn attach(path: &Path) -> Result<Self> {
        let mut region = MappedRegion::attach(path)?;
        region.ensure_version(CURRENT_FSA_VERSION, |_, found| {
            // No older on-disk layout exists yet; anything lower is refused.
            Err(RegionError::IncorrectVersion {
                found,
                expected: CURRENT_FSA_VERSION,
            })
        })?;
        Ok(Self { region })
    }

    /// Attach read-only; status views use this.
    pub fn attach_passive(path: &Path) -> Result<Self> {
        let region = MappedRegion::attach_passive(path)?;
        if region.version() != CURRENT_FSA_VERSION {
            return Err(RegionError::IncorrectVersion {
                found: region.version(),
                expected: CURRENT_FSA_VERSION,
            }
            .into());
        }
        Ok(Self { region })
    }

    pub fn attach_current_passive(fifodir: &Path) -> Result<Self> {
        let id = read_region_id(&fifodir.join(FSA_ID_FILE))?;
        Self::attach_passive(&numbered_path(&fifodir.join(FSA_STATUS_FILE), id))
    }

    /// Reattach when the current image went stale. Returns true when a
    /// new image was mapped.
    pub fn check_stale(&mut self, fifodir: &Path) -> Result<bool> {
        if !self.region.is_stale() {
            return Ok(false);
        }
        let id = read_region_id(&fifodir.join(FSA_ID_FILE))?;
        let fresh = MappedRegion::attach(&numbered_path(&fifodir.join(FSA_STATUS_FILE), id))?;
        self.region = fresh;
        Ok(true)
    }

    pub fn detach(self, sync: bool) -> Result<()> {
        self.region.detach(sync)?;
        Ok(())
    }

    pub fn no_of_hosts(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn hosts(&self) -> &[HostRecord] {
        &self.region.payload::<HostRecord>()[..self.no_of_hosts()]
    }

    pub fn hosts_mut(&mut self) -> Result<&mut [HostRecord]> {
        let n = self.no_of_hosts();
        Ok(&mut self.region.payload_mut::<HostRecord>()?[..n])
    }

    pub fn host(&self, pos: usize) -> &HostRecord {
        &self.hosts()[pos]
    }

    /// Linear alias search.
    pub fn get_host_position(&self, alias: &str) -> Option<usize> {
        self.hosts().iter().position(|h| h.alias() == alias)
    }

    /// Linear search over the CRC host id.
    pub fn get_host_id_position(&self, host_id: u32) -> Option<usize> {
        self.hosts().iter().position(|h| h.host_id == host_id)
    }

    fn field_lock_offset(&self, pos: usize, field: usize) -> u64 {
        MappedRegion::field_offset::<HostRecord>(pos, field)
    }

    /// Apply `files`/`bytes` deltas to the total counters under
    /// `LOCK_TFC`, clamping to zero and reporting repairs.
    pub fn add_file_counter(&mut self, pos: usize, files: i32, bytes: i64) -> Result<Repaired> {
        let off = self.field_lock_offset(pos, LOCK_TFC);
        lock_region_w(self.region.file(), off)?;
        let repaired = {
            let host = &mut self.hosts_mut()?[pos];
            let mut repaired = Repaired::No;
            host.total_file_counter += files;
            host.total_file_size += bytes;
            if host.total_file_counter < 0 {
                host.total_file_counter = 0;
                repaired = Repaired::Yes;
            }
            if host.total_file_size < 0 {
                host.total_file_size = 0;
                repaired = Repaired::Yes;
            }
            if host.total_file_counter == 0 && host.total_file_size != 0 {
                host.total_file_size = 0;
                repaired = Repaired::Yes;
            }
            repaired
        };
        unlock_region(self.region.file(), off)?;
        if repaired == Repaired::Yes {
            info!(pos, files, bytes, "repaired drifted file counters");
        }
        Ok(repaired)
    }

    /// Record a transfer error: shift the history, bump the counters,
    /// auto-pause the host when `max_errors` is reached. Returns true
    /// when the host was auto-paused by this call.
    pub fn note_error(&mut self, pos: usize, kind: u8, now: i64) -> Result<bool> {
        let ec_off = self.field_lock_offset(pos, LOCK_EC);
        lock_region_w(self.region.file(), ec_off)?;
        let reached_limit = {
            let host = &mut self.hosts_mut()?[pos];
            host.error_history.copy_within(0..ERROR_HISTORY_LENGTH - 1, 1);
            host.error_history[0] = kind;
            if host.error_counter < host.max_errors {
                host.error_counter += 1;
            }
            host.total_errors += 1;
            host.error_counter >= host.max_errors
        };
        unlock_region(self.region.file(), ec_off)?;

        if !reached_limit {
            return Ok(false);
        }

        let hs_off = self.field_lock_offset(pos, LOCK_HS);
        lock_region_w(self.region.file(), hs_off)?;
        let newly_paused = {
            let host = &mut self.hosts_mut()?[pos];
            let was = host.host_status & AUTO_PAUSE_QUEUE_STAT != 0;
            host.host_status |= AUTO_PAUSE_QUEUE_STAT | PENDING_ERRORS;
            if host.first_error_time == 0 {
                host.first_error_time = now;
            }
            !was
        };
        unlock_region(self.region.file(), hs_off)?;
        Ok(newly_paused)
    }

    /// Record a successful transfer: reset the error state machine.
    pub fn note_success(&mut self, pos: usize, now: i64) -> Result<()> {
        let ec_off = self.field_lock_offset(pos, LOCK_EC);
        lock_region_w(self.region.file(), ec_off)?;
        {
            let host = &mut self.hosts_mut()?[pos];
            host.error_counter = 0;
            host.last_connection = now;
        }
        unlock_region(self.region.file(), ec_off)?;

        let hs_off = self.field_lock_offset(pos, LOCK_HS);
        lock_region_w(self.region.file(), hs_off)?;
        {
            let host = &mut self.hosts_mut()?[pos];
            host.host_status &=
                !(AUTO_PAUSE_QUEUE_STAT | PENDING_ERRORS | HOST_ERROR_ACKNOWLEDGED);
            host.host_status |= HOST_ACTION_SUCCESS;
            host.first_error_time = 0;
        }
        unlock_region(self.region.file(), hs_off)?;
        Ok(())
    }

    /// Post-drain reset, called when both total counters reach zero:
    /// forget the two most recent error kinds, clear the error counter
    /// and promote idle-but-not-working slots back to disconnected.
    pub fn note_queue_drained(&mut self, pos: usize) -> Result<()> {
        let ec_off = self.field_lock_offset(pos, LOCK_EC);
        lock_region_w(self.region.file(), ec_off)?;
        {
            let host = &mut self.hosts_mut()?[pos];
            host.error_history[0] = 0;
            host.error_history[1] = 0;
            host.error_counter = 0;
        }
        unlock_region(self.region.file(), ec_off)?;

        let fiu_off = self.field_lock_offset(pos, LOCK_FIU);
        lock_region_w(self.region.file(), fiu_off)?;
        {
            let host = &mut self.hosts_mut()?[pos];
            for js in host.job_status.iter_mut() {
                if js.connect_status == connect_status::NOT_WORKING {
                    js.connect_status = connect_status::DISCONNECT;
                }
            }
        }
        unlock_region(self.region.file(), fiu_off)?;
        Ok(())
    }

    /// Set and clear `host_status` bits under `LOCK_HS`.
    pub fn update_host_status(&mut self, pos: usize, set: u32, clear: u32) -> Result<u32> {
        let off = self.field_lock_offset(pos, LOCK_HS);
        lock_region_w(self.region.file(), off)?;
        let status = {
            let host = &mut self.hosts_mut()?[pos];
            host.host_status = (host.host_status & !clear) | set;
            host.host_status
        };
        unlock_region(self.region.file(), off)?;
        Ok(status)
    }

    /// Claim a free `job_status` slot for worker `pid`.
    pub fn claim_slot(&mut self, pos: usize, pid: i32, job_id: u32, msg_name: &str) -> Result<Option<usize>> {
        let off = self.field_lock_offset(pos, LOCK_FIU);
        lock_region_w(self.region.file(), off)?;
        let slot = {
            let host = &mut self.hosts_mut()?[pos];
            let slot = host.job_status.iter().position(|j| j.proc_id <= 0);
            if let Some(i) = slot {
                let js = &mut host.job_status[i];
                *js = unsafe { std::mem::zeroed() };
                js.proc_id = pid;
                js.job_id = job_id;
                js.connect_status = connect_status::CONNECTING;
                copy_str(&mut js.unique_name, msg_name);
                host.active_transfers = host.busy_slots();
                host.connections += 1;
            }
            slot
        };
        unlock_region(self.region.file(), off)?;
        Ok(slot)
    }

    /// Release the slot owned by `pid`.
    pub fn release_slot(&mut self, pos: usize, pid: i32) -> Result<()> {
        let off = self.field_lock_offset(pos, LOCK_FIU);
        lock_region_w(self.region.file(), off)?;
        {
            let host = &mut self.hosts_mut()?[pos];
            if let Some(js) = host.job_status.iter_mut().find(|j| j.proc_id == pid) {
                js.proc_id = 0;
                js.connect_status = connect_status::DISCONNECT;
            }
            host.active_transfers = host.busy_slots();
        }
        unlock_region(self.region.file(), off)?;
        Ok(())
    }
}

/// Rebuild the table with hosts in a new order.
///
/// `order[i]` names the old position that becomes new position `i`.
/// The new image is published under the bumped id and the old one is
/// marked stale so every reader reattaches.
pub fn change_alias_order(
    fifodir: &Path,
    old: &mut Fsa,
    order: &[usize],
) -> Result<(Fsa, PathBuf)> {
    let n_old = old.no_of_hosts();
    for &p in order {
        if p >= n_old {
            return Err(FsaError::BadOrder(format!("position {p} out of range")));
        }
    }

    let id_file = fifodir.join(FSA_ID_FILE);
    let new_id = read_region_id(&id_file).map(|id| id + 1).unwrap_or(0);
    let new_path = numbered_path(&fifodir.join(FSA_STATUS_FILE), new_id);

    let mut region = MappedRegion::create(
        &new_path,
        CURRENT_FSA_VERSION,
        order.len() * std::mem::size_of::<HostRecord>(),
    )?;
    {
        let dst = region.payload_mut::<HostRecord>()?;
        for (i, &p) in order.iter().enumerate() {
            dst[i] = *old.host(p);
        }
    }
    region.set_count(order.len() as i32)?;
    region.flush()?;

    write_region_id(&id_file, new_id)?;
    old.region.mark_stale()?;
    info!(new_id, hosts = order.len(), "rebuilt host table");

    Ok((Fsa { region }, new_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(dir: &Path, aliases: &[&str]) -> Fsa {
        let id_file = dir.join(FSA_ID_FILE);
        write_region_id(&id_file, 0).unwrap();
        let path = numbered_path(&dir.join(FSA_STATUS_FILE), 0);
        Fsa::create(&path, aliases).unwrap()
    }

    #[test]
    fn test_record_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<JobStatus>(), 384);
        assert_eq!(std::mem::size_of::<HostRecord>(), 4096);
        assert_eq!(LOCK_TFC, 124);
        assert_eq!(LOCK_HS, 112);
    }

    #[test]
    fn test_position_lookup() {
        let temp = tempdir().unwrap();
        let fsa = table(temp.path(), &["alpha", "beta", "gamma"]);

        assert_eq!(fsa.get_host_position("beta"), Some(1));
        assert_eq!(fsa.get_host_position("nope"), None);

        let id = drift_hash::fingerprint(b"gamma");
        assert_eq!(fsa.get_host_id_position(id), Some(2));
    }

    #[test]
    fn test_file_counter_clamps_and_reports() {
        let temp = tempdir().unwrap();
        let mut fsa = table(temp.path(), &["h"]);

        assert_eq!(fsa.add_file_counter(0, 2, 1000).unwrap(), Repaired::No);
        assert_eq!(fsa.host(0).total_file_counter, 2);

        // Draining below zero clamps and reports.
        assert_eq!(fsa.add_file_counter(0, -3, -1000).unwrap(), Repaired::Yes);
        assert_eq!(fsa.host(0).total_file_counter, 0);
        assert_eq!(fsa.host(0).total_file_size, 0);
    }

    #[test]
    fn test_counter_zero_forces_size_zero() {
        let temp = tempdir().unwrap();
        let mut fsa = table(temp.path(), &["h"]);

        fsa.add_file_counter(0, 1, 500).unwrap();
        // Files reach zero but ten bytes of drift remain: repaired.
        assert_eq!(fsa.add_file_counter(0, -1, -490).unwrap(), Repaired::Yes);
        assert_eq!(fsa.host(0).total_file_size, 0);
    }

    #[test]
    fn test_error_state_machine_auto_pauses() {
        let temp = tempdir().unwrap();
        let mut fsa = table(temp.path(), &["h"]);
        fsa.hosts_mut().unwrap()[0].max_errors = 2;

        assert!(!fsa.note_error(0, transfer_error::TIMEOUT_ERROR, 100).unwrap());
        assert!(fsa.note_error(0, transfer_error::TIMEOUT_ERROR, 101).unwrap());
        let host = *fsa.host(0);
        assert_eq!(host.error_counter, 2);
        assert_ne!(host.host_status & AUTO_PAUSE_QUEUE_STAT, 0);
        assert_eq!(host.first_error_time, 100 + 1);
        assert_eq!(host.error_history[0], transfer_error::TIMEOUT_ERROR);
        assert!(!host.is_dispatchable());

        fsa.note_success(0, 200).unwrap();
        let host = *fsa.host(0);
        assert_eq!(host.error_counter, 0);
        assert_eq!(host.host_status & AUTO_PAUSE_QUEUE_STAT, 0);
        assert_eq!(host.first_error_time, 0);
        assert!(host.is_dispatchable());
    }

    #[test]
    fn test_error_history_shifts() {
        let temp = tempdir().unwrap();
        let mut fsa = table(temp.path(), &["h"]);

        fsa.note_error(0, transfer_error::CONNECT_ERROR, 1).unwrap();
        fsa.note_error(0, transfer_error::TIMEOUT_ERROR, 2).unwrap();
        let host = fsa.host(0);
        assert_eq!(
            &host.error_history[..2],
            &[transfer_error::TIMEOUT_ERROR, transfer_error::CONNECT_ERROR]
        );
    }

    #[test]
    fn test_slot_claim_release_tracks_active_transfers() {
        let temp = tempdir().unwrap();
        let mut fsa = table(temp.path(), &["h"]);

        let a = fsa.claim_slot(0, 101, 7, "5f3a_1_0").unwrap().unwrap();
        let b = fsa.claim_slot(0, 102, 7, "5f3a_2_0").unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(fsa.host(0).active_transfers, 2);
        assert_eq!(fsa.host(0).connections, 2);

        fsa.release_slot(0, 101).unwrap();
        assert_eq!(fsa.host(0).active_transfers, 1);
        let host = fsa.host(0);
        assert_eq!(host.job_status[a].connect_status, connect_status::DISCONNECT);
    }

    #[test]
    fn test_change_alias_order_permutes_and_staleifies() {
        let temp = tempdir().unwrap();
        let mut fsa = table(temp.path(), &["a", "b", "c"]);
        fsa.hosts_mut().unwrap()[2].total_file_counter = 42;

        let reader = Fsa::attach_current_passive(temp.path()).unwrap();

        let (fresh, _path) = change_alias_order(temp.path(), &mut fsa, &[2, 0, 1]).unwrap();
        assert_eq!(fresh.no_of_hosts(), 3);
        assert_eq!(fresh.host(0).alias(), "c");
        assert_eq!(fresh.host(0).total_file_counter, 42);
        assert_eq!(fresh.host(1).alias(), "a");

        // The reader's image went stale; reattach lands on the new one.
        assert!(reader.region.is_stale());
        let mut reader = reader;
        assert!(reader.check_stale(temp.path()).unwrap());
        assert_eq!(reader.host(0).alias(), "c");
    }

    #[test]
    fn test_attach_refuses_unknown_version() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("fsa_status.9");
        let region = MappedRegion::create(&path, 9, 4096).unwrap();
        drop(region);

        assert!(matches!(
            Fsa::attach(&path),
            Err(FsaError::Region(RegionError::IncorrectVersion { .. }))
        ));
    }
}
