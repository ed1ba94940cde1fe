//! Read-only views over the shared regions.

use anyhow::Result;
use drift_config::Layout;
use drift_fsa::{Fsa, HostRecord, AUTO_PAUSE_QUEUE_STAT, PAUSE_QUEUE_STAT, STOP_TRANSFER_STAT};
use drift_ipc::exit_code;
use drift_log::{LogKind, SignRing};
use drift_queue::MsgQueue;
use drift_registry::{show_job_list, CurrentJobList, JobRegistry};

pub fn print_hosts(layout: &Layout) -> Result<i32> {
    let fsa = match Fsa::attach_current_passive(&layout.fifodir) {
        Ok(f) => f,
        Err(_) => {
            println!("no host table (system not started?)");
            return Ok(exit_code::IS_NOT_ACTIVE);
        }
    };

    println!(
        "{:<16} {:>6} {:>8} {:>10} {:>12} {:>7} {}",
        "HOST", "ACTIVE", "ERRORS", "FILES", "BYTES", "QUEUED", "FLAGS"
    );
    for host in fsa.hosts() {
        println!(
            "{:<16} {:>6} {:>8} {:>10} {:>12} {:>7} {}",
            host.alias(),
            host.active_transfers,
            format!("{}/{}", host.error_counter, host.max_errors),
            host.total_file_counter,
            host.total_file_size,
            host.jobs_queued,
            host_flags(host),
        );
    }
    Ok(exit_code::SUCCESS)
}

fn host_flags(host: &HostRecord) -> String {
    let mut flags = String::new();
    if host.host_status & STOP_TRANSFER_STAT != 0 {
        flags.push('S');
    }
    if host.host_status & PAUSE_QUEUE_STAT != 0 {
        flags.push('P');
    }
    if host.host_status & AUTO_PAUSE_QUEUE_STAT != 0 {
        flags.push('A');
    }
    if host.host_status & drift_fsa::ERROR_QUEUE_SET != 0 {
        flags.push('Q');
    }
    if host.host_status & drift_fsa::HOST_ERROR_OFFLINE_ANY != 0 {
        flags.push('O');
    }
    if flags.is_empty() {
        flags.push('-');
    }
    flags
}

pub fn print_dirs(layout: &Layout) -> Result<i32> {
    let fra = match drift_fra::Fra::attach_current_passive(&layout.fifodir) {
        Ok(f) => f,
        Err(_) => {
            println!("no directory table (scanner not started?)");
            return Ok(exit_code::IS_NOT_ACTIVE);
        }
    };

    println!(
        "{:<24} {:>8} {:>12} {:>10} {}",
        "DIRECTORY", "QUEUED", "BYTES", "IN DIR", "URL"
    );
    for dir in fra.dirs() {
        println!(
            "{:<24} {:>8} {:>12} {:>10} {}",
            dir.alias(),
            dir.files_queued,
            dir.bytes_in_queue,
            dir.files_in_dir,
            dir.url_str(),
        );
    }
    Ok(exit_code::SUCCESS)
}

pub fn print_jobs(layout: &Layout, blur: bool) -> Result<i32> {
    let path = layout.fifodir.join(drift_registry::JOB_ID_DATA_FILE);
    if !path.exists() {
        println!("no job registry");
        return Ok(exit_code::IS_NOT_ACTIVE);
    }
    let registry = JobRegistry::open(&path)?;
    let current_path = layout.fifodir.join(drift_registry::CURRENT_JOB_LIST_FILE);
    let current = if current_path.exists() {
        CurrentJobList::open(&current_path)
            .ok()
            .filter(|c| !c.ids().is_empty())
    } else {
        None
    };

    let mut out = Vec::new();
    show_job_list(&mut out, &registry, current.as_ref(), blur)?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(exit_code::SUCCESS)
}

pub fn print_queue(layout: &Layout) -> Result<i32> {
    let path = layout.fifodir.join(drift_queue::FD_MSG_QUEUE_FILE);
    if !path.exists() {
        println!("no message queue");
        return Ok(exit_code::IS_NOT_ACTIVE);
    }
    let queue = MsgQueue::open(&layout.fifodir)?;

    println!(
        "{:<24} {:>10} {:>6} {:>8} {:>8} {}",
        "MESSAGE", "JOB", "FILES", "BYTES", "RETRIES", "STATE"
    );
    for entry in queue.entries() {
        println!(
            "{:<24} {:>10x} {:>6} {:>8} {:>8} {}",
            entry.name(),
            entry.job_id,
            entry.files_to_send,
            entry.file_size_to_send,
            entry.retries,
            if entry.is_queued() {
                "queued".to_string()
            } else {
                format!("pid {}", entry.pid)
            }
        );
    }
    Ok(exit_code::SUCCESS)
}

pub fn print_log_history(layout: &Layout) -> Result<i32> {
    let ring = match SignRing::open_passive(&layout.fifodir) {
        Ok(r) => r,
        Err(_) => {
            println!("no status region");
            return Ok(exit_code::IS_NOT_ACTIVE);
        }
    };
    for kind in LogKind::ALL {
        let history: String = ring.history(kind).into_iter().collect();
        println!("{:<14} {}", format!("{:?}", kind), history);
    }
    Ok(exit_code::SUCCESS)
}
