//! # drift-queue
//!
//! The dispatch queue between the directory scanner and the transfer
//! supervisor.
//!
//! Queue state lives in the mapped `fd_msg_queue` region; wake-ups are
//! a single byte on `msg.fifo`. An entry is in exactly one state:
//! queued (`pid == 0`), dispatched (`pid > 0`), or gone. The pid
//! doubles as the capability to touch the message's pool directory,
//! see [`pool::PoolDir`].

pub mod msgname;
pub mod pool;
pub mod spool;

use std::fs::File;
use std::path::Path;

use drift_base::fifo::{make_fifo, open_fifo_rd, open_fifo_wr, send_cmd};
use drift_fsa::Fsa;
use drift_region::{copy_str, read_str, MappedRegion, RegionError};
use thiserror::Error;

pub use msgname::{check_msg_name, MsgName};
pub use pool::{PoolDir, RemoveSummary};

/// Queue region file under `fifodir/`.
pub const FD_MSG_QUEUE_FILE: &str = "fd_msg_queue";
/// Wake-up fifo under `fifodir/`.
pub const MSG_FIFO: &str = "msg.fifo";
/// Pool tree below the work directory.
pub const OUTGOING_DIR: &str = "files/outgoing";

pub const CURRENT_QUEUE_VERSION: u8 = 1;

/// Entries added per growth step.
const QUEUE_STEP_SIZE: usize = 50;

pub use drift_fsa::MAX_MSG_NAME_LENGTH;

/// One queued message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QueueEntry {
    /// Scheduling key; lower dispatches earlier.
    pub msg_number: f64,
    pub creation_time: i64,
    pub file_size_to_send: i64,
    /// 0 while queued; the worker pid once dispatched.
    pub pid: i32,
    /// Host position in the FSA.
    pub pos: i32,
    pub connect_pos: i32,
    pub files_to_send: u32,
    pub retries: u32,
    pub job_id: u32,
    pub dir_no: u32,
    pub special_flag: u8,
    pub _pad: [u8; 3],
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<QueueEntry>() == 120);

impl QueueEntry {
    pub fn name(&self) -> String {
        read_str(&self.msg_name)
    }

    pub fn is_queued(&self) -> bool {
        self.pid == 0
    }
}

/// Scheduling key for a fresh message: creation time, tie-broken by
/// the per-second unique number.
pub fn msg_number(creation_time: i64, unique_number: u32) -> f64 {
    creation_time as f64 + unique_number as f64 / 100_000.0
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("base error: {0}")]
    Base(#[from] drift_base::BaseError),

    #[error("fsa error: {0}")]
    Fsa(#[from] drift_fsa::FsaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message name: {0}")]
    BadMsgName(String),

    #[error("pool directory contains a subdirectory: {0}")]
    SubdirInPool(String),

    #[error("no such queue entry")]
    NoSuchEntry,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// The mapped message queue plus its wake-up fifo.
pub struct MsgQueue {
    region: MappedRegion,
    fifo_wr: File,
    // Keeps msg.fifo connected until the supervisor attaches.
    _anchor: Option<File>,
}

impl MsgQueue {
    /// Open (creating if needed) the queue region and `msg.fifo`.
    pub fn open(fifodir: &Path) -> Result<Self> {
        let path = fifodir.join(FD_MSG_QUEUE_FILE);
        let mut region = if path.exists() {
            MappedRegion::attach(&path)?
        } else {
            MappedRegion::create(
                &path,
                CURRENT_QUEUE_VERSION,
                QUEUE_STEP_SIZE * std::mem::size_of::<QueueEntry>(),
            )?
        };
        region.ensure_version(CURRENT_QUEUE_VERSION, |_, found| {
            Err(RegionError::IncorrectVersion {
                found,
                expected: CURRENT_QUEUE_VERSION,
            })
        })?;

        let fifo_path = fifodir.join(MSG_FIFO);
        make_fifo(&fifo_path)?;
        // Anchor the read side so announcements never fail before the
        // supervisor attaches.
        let (fifo_wr, anchor) = match open_fifo_wr(&fifo_path) {
            Ok(f) => (f, None),
            Err(_) => {
                let keep = open_fifo_rd(&fifo_path)?;
                (open_fifo_wr(&fifo_path)?, Some(keep))
            }
        };

        Ok(Self {
            region,
            fifo_wr,
            _anchor: anchor,
        })
    }

    pub fn len(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.region.payload::<QueueEntry>()[..self.len()]
    }

    pub fn entries_mut(&mut self) -> Result<&mut [QueueEntry]> {
        let n = self.len();
        Ok(&mut self.region.payload_mut::<QueueEntry>()?[..n])
    }

    /// Append an entry and announce it on `msg.fifo`.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<usize> {
        let n = self.len();
        let capacity = self.region.payload::<QueueEntry>().len();
        if n == capacity {
            self.region
                .resize((capacity + QUEUE_STEP_SIZE) * std::mem::size_of::<QueueEntry>())?;
        }
        self.region.payload_mut::<QueueEntry>()?[n] = entry;
        self.region.set_count((n + 1) as i32)?;

        send_cmd(drift_ipc::ControlCmd::NewData.as_byte(), &mut self.fifo_wr)?;
        Ok(n)
    }

    /// Remove entry `index`, preserving the order of the rest.
    pub fn remove(&mut self, index: usize) -> Result<QueueEntry> {
        let n = self.len();
        if index >= n {
            return Err(QueueError::NoSuchEntry);
        }
        let entries = self.region.payload_mut::<QueueEntry>()?;
        let removed = entries[index];
        entries.copy_within(index + 1..n, index);
        self.region.set_count((n - 1) as i32)?;
        Ok(removed)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        self.entries().iter().position(|e| e.pid == pid)
    }

    /// Record dispatch: the entry now belongs to worker `pid`.
    pub fn set_pid(&mut self, index: usize, pid: i32) -> Result<()> {
        self.entries_mut()?
            .get_mut(index)
            .ok_or(QueueError::NoSuchEntry)?
            .pid = pid;
        Ok(())
    }

    /// Put a failed dispatch back in the queue with one more retry.
    pub fn requeue(&mut self, index: usize) -> Result<()> {
        let entry = self
            .entries_mut()?
            .get_mut(index)
            .ok_or(QueueError::NoSuchEntry)?;
        entry.pid = 0;
        entry.retries += 1;
        Ok(())
    }

    /// Pick the queued entry with the lowest `msg_number` whose host
    /// can take another transfer. Hosts that are paused (by operator
    /// or by the error state machine) are skipped.
    pub fn next_dispatchable(&self, fsa: &Fsa) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in self.entries().iter().enumerate() {
            if !entry.is_queued() {
                continue;
            }
            let pos = entry.pos;
            if pos < 0 || pos as usize >= fsa.no_of_hosts() {
                continue;
            }
            if !fsa.host(pos as usize).is_dispatchable() {
                continue;
            }
            match best {
                Some((_, num)) if num <= entry.msg_number => {}
                _ => best = Some((i, entry.msg_number)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// The job ids currently referenced by queued or active messages,
    /// deduplicated: the content of the current-message list.
    pub fn current_job_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.entries().iter().map(|e| e.job_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Build a queue entry for a freshly scanned message.
#[allow(clippy::too_many_arguments)]
pub fn new_entry(
    name: &MsgName,
    job_id: u32,
    dir_no: u32,
    fsa_pos: i32,
    files_to_send: u32,
    file_size_to_send: i64,
) -> QueueEntry {
    let mut entry: QueueEntry = unsafe { std::mem::zeroed() };
    entry.msg_number = msg_number(name.creation_time, name.unique_number);
    entry.creation_time = name.creation_time;
    entry.file_size_to_send = file_size_to_send;
    entry.files_to_send = files_to_send;
    entry.job_id = job_id;
    entry.dir_no = dir_no;
    entry.pos = fsa_pos;
    entry.connect_pos = -1;
    copy_str(&mut entry.msg_name, &name.to_string());
    entry
}
