//! The on-disk layout below the work directory.

use std::path::{Path, PathBuf};

use crate::Result;

/// Every well-known path below `$WORK_DIR`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub work_dir: PathBuf,
    /// Fifos, lock file, mapped regions.
    pub fifodir: PathBuf,
    /// Pool directories for outgoing jobs.
    pub outgoing: PathBuf,
    /// Jobs deferred for future delivery.
    pub time_dir: PathBuf,
    /// Quarantined duplicates.
    pub store_dir: PathBuf,
    /// Successful deliveries when archiving is on.
    pub archive: PathBuf,
    /// Rotated text logs.
    pub log_dir: PathBuf,
    /// Configuration files.
    pub etc_dir: PathBuf,
    pub config_file: PathBuf,
    pub host_config: PathBuf,
    pub dir_config: PathBuf,
    pub xor_key: PathBuf,
    /// Single lock file with the per-daemon slots.
    pub lock_file: PathBuf,
    /// Per-second counter backing message names.
    pub counter_file: PathBuf,
    /// Control fifo of the dispatch supervisor.
    pub fd_cmd_fifo: PathBuf,
}

impl Layout {
    pub fn new(work_dir: &Path) -> Self {
        let fifodir = work_dir.join("fifodir");
        let etc_dir = work_dir.join("etc");
        Self {
            work_dir: work_dir.to_path_buf(),
            outgoing: work_dir.join("files/outgoing"),
            time_dir: work_dir.join("files/time"),
            store_dir: work_dir.join("files/store"),
            archive: work_dir.join("archive"),
            log_dir: work_dir.join("log"),
            config_file: etc_dir.join("config.toml"),
            host_config: etc_dir.join("HOST_CONFIG"),
            dir_config: etc_dir.join("DIR_CONFIG"),
            xor_key: etc_dir.join(".xor.key"),
            lock_file: fifodir.join("lock.file"),
            counter_file: fifodir.join("counter"),
            fd_cmd_fifo: fifodir.join("fd_cmd.fifo"),
            etc_dir,
            fifodir,
        }
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.fifodir,
            &self.outgoing,
            &self.time_dir,
            &self.store_dir,
            &self.archive,
            &self.log_dir,
            &self.etc_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
