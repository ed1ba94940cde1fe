//! Spool sweep.
//!
//! After an unclean stop the queue region may disagree with what is
//! actually staged on disk. The sweep walks `files/outgoing/` and
//! rebuilds one queue entry per surviving pool directory (the
//! `SEARCH_OLD_FILES` path).

use std::path::Path;

use drift_fsa::Fsa;
use drift_registry::JobRegistry;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::msgname::MsgName;
use crate::pool::PoolDir;
use crate::{new_entry, QueueEntry, Result};

/// Walk the outgoing tree and rebuild entries for every staged message.
///
/// Pool directories whose job id is unknown to the registry, or whose
/// host has left the table, are reported and skipped; an operator has
/// to decide about those.
pub fn scan_spool(outgoing: &Path, fsa: &Fsa, registry: &JobRegistry) -> Result<Vec<QueueEntry>> {
    let mut entries = Vec::new();
    if !outgoing.exists() {
        return Ok(entries);
    }

    for item in WalkDir::new(outgoing)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let msg_dir = item.path();
        let name_str = item.file_name().to_string_lossy();
        let name: MsgName = match name_str.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(path = %msg_dir.display(), "not a message directory, skipping");
                continue;
            }
        };

        let dir_no = match hex_component(msg_dir, 1) {
            Some(v) => v,
            None => continue,
        };
        let job_id = match hex_component(msg_dir, 2) {
            Some(v) => v,
            None => continue,
        };

        let job = match registry.find(job_id) {
            Some(j) => j,
            None => {
                warn!(job_id = format_args!("{:x}", job_id), path = %msg_dir.display(),
                      "staged message for unknown job, skipping");
                continue;
            }
        };
        let fsa_pos = match fsa.get_host_id_position(job.host_id) {
            Some(p) => p as i32,
            None => {
                warn!(host_id = format_args!("{:x}", job.host_id),
                      "staged message for vanished host, skipping");
                continue;
            }
        };

        let pool = PoolDir::locate(outgoing, job_id, dir_no, name);
        let (files, bytes) = pool.stat()?;
        if files == 0 {
            continue;
        }
        entries.push(new_entry(&name, job_id, dir_no, fsa_pos, files, bytes));
    }

    entries.sort_by(|a, b| a.msg_number.total_cmp(&b.msg_number));
    info!(found = entries.len(), "spool sweep complete");
    Ok(entries)
}

/// `n`-th path component above the message directory, parsed as hex.
fn hex_component(msg_dir: &Path, n: usize) -> Option<u32> {
    let mut p = msg_dir;
    for _ in 0..n {
        p = p.parent()?;
    }
    u32::from_str_radix(&p.file_name()?.to_string_lossy(), 16).ok()
}
