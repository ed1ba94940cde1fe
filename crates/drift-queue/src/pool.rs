//! Pool-directory ownership.
//!
//! `files/outgoing/<job_id hex>/<dir_no hex>/<msg_name>/` stages the
//! files of one outgoing job. Exactly one process owns a pool
//! directory at a time; ownership is the worker pid recorded in the
//! queue entry. [`PoolDir::remove`] is the only sanctioned bulk
//! delete: it accounts every file into the host counters and the
//! delete log on the way out.

use std::path::{Path, PathBuf};

use drift_fsa::Fsa;
use drift_log::{DeleteRecord, LogPipe};
use tracing::warn;

use crate::msgname::MsgName;
use crate::{QueueError, Result};

/// What a removal drained out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveSummary {
    pub files: u32,
    pub bytes: i64,
    /// True when the host's total counters reached zero and the
    /// post-drain reset ran.
    pub drained_host: bool,
}

/// Handle on one pool directory.
#[derive(Debug, Clone)]
pub struct PoolDir {
    path: PathBuf,
    job_id: u32,
    dir_no: u32,
    name: MsgName,
}

impl PoolDir {
    /// Locate the pool directory of a message under `outgoing`.
    pub fn locate(outgoing: &Path, job_id: u32, dir_no: u32, name: MsgName) -> Self {
        let path = outgoing
            .join(format!("{:x}", job_id))
            .join(format!("{:x}", dir_no))
            .join(name.to_string());
        Self {
            path,
            job_id,
            dir_no,
            name,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn job_id(&self) -> u32 {
        self.job_id
    }

    pub fn dir_no(&self) -> u32 {
        self.dir_no
    }

    pub fn msg_name(&self) -> MsgName {
        self.name
    }

    /// Create the directory tree (the scanner side).
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Count regular files and bytes without touching anything.
    pub fn stat(&self) -> Result<(u32, i64)> {
        let mut files = 0u32;
        let mut bytes = 0i64;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                files += 1;
                bytes += meta.len() as i64;
            }
        }
        Ok((files, bytes))
    }

    /// Remove the pool directory and account for it.
    ///
    /// Every regular file is unlinked and logged to the delete log
    /// with `reason`; a subdirectory aborts the removal (nothing below
    /// a pool directory may nest). The host's total counters are
    /// reduced under the counter lock; when both reach zero the
    /// post-drain reset runs.
    pub fn remove(
        self,
        fsa: &mut Fsa,
        fsa_pos: usize,
        dir_id: u32,
        reason: &str,
        proc_name: &str,
        delete_log: Option<&mut LogPipe>,
    ) -> Result<RemoveSummary> {
        // First pass: refuse if anything nests.
        let mut names: Vec<(PathBuf, i64)> = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                warn!(
                    pool = %self.path.display(),
                    nested = %entry.path().display(),
                    "subdirectory in pool directory, refusing removal"
                );
                return Err(QueueError::SubdirInPool(
                    entry.path().display().to_string(),
                ));
            }
            names.push((entry.path(), meta.len() as i64));
        }

        let host_alias = fsa.host(fsa_pos).alias();
        let mut files = 0u32;
        let mut bytes = 0i64;
        let mut delete_log = delete_log;

        for (path, size) in names {
            std::fs::remove_file(&path)?;
            files += 1;
            bytes += size;

            if let Some(pipe) = delete_log.as_deref_mut() {
                let record = DeleteRecord {
                    input_time: self.name.creation_time,
                    unique_number: self.name.unique_number,
                    split_job_counter: self.name.split_job_counter,
                    job_id: self.job_id,
                    dir_id,
                    file_size: size,
                    file_name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    host_and_reason: format!("{}: {}", host_alias, reason),
                    proc_name: proc_name.to_string(),
                    source: String::new(),
                };
                let _ = pipe.write_record(&record.encode());
            }
        }

        if let Err(e) = std::fs::remove_dir(&self.path) {
            if e.kind() == std::io::ErrorKind::DirectoryNotEmpty {
                // A straggler appeared between the scan and the rmdir.
                std::fs::remove_dir_all(&self.path)?;
            } else {
                return Err(e.into());
            }
        }

        fsa.add_file_counter(fsa_pos, -(files as i32), -bytes)?;
        let host = fsa.host(fsa_pos);
        let drained = host.total_file_counter == 0 && host.total_file_size == 0;
        if drained {
            fsa.note_queue_drained(fsa_pos)?;
        }

        Ok(RemoveSummary {
            files,
            bytes,
            drained_host: drained,
        })
    }
}
