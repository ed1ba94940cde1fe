//! The dispatch loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use drift_base::fifo::{make_fifo, open_fifo_rd};
use drift_base::io::{readn, ReadOutcome};
use drift_config::{Config, Layout};
use drift_fra::Fra;
use drift_fsa::{
    ErrorQueue, Fsa, Repaired, AUTO_PAUSE_QUEUE_STAT, ERROR_QUEUE_SET, HOST_ERROR_OFFLINE_ANY,
};
use drift_ipc::{ControlCmd, DumpEntry, QueueDump};
use drift_log::{
    format_record, EventAction, EventClass, EventRecord, EventType, LogKind, LogPipe, Sign,
    SignRing,
};
use drift_queue::{check_msg_name, MsgName, MsgQueue, PoolDir, QueueEntry};
use drift_registry::{CurrentJobList, JobRegistry};
use drift_region::{numbered_path, write_region_id};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Queue snapshot file under `fifodir/`.
pub const MSG_CACHE_FILE: &str = "fd_msg_cache";

/// Events feeding the dispatch loop.
#[derive(Debug)]
pub enum FdEvent {
    /// One or more wake-up bytes arrived on `msg.fifo`.
    MsgQueued,
    /// A control byte arrived on the command fifo.
    Control(ControlCmd),
    /// A dispatched worker exited.
    ChildExit { pid: i32, success: bool },
}

/// Which fifo a reader thread drains.
#[derive(Debug, Clone, Copy)]
pub enum FifoRole {
    MsgQueue,
    Control,
}

/// Live view of one dispatched transfer, shared with the operator
/// service.
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub host_alias: String,
    pub msg_name: String,
    pub started: i64,
}

pub struct Supervisor {
    layout: Layout,
    config: Config,
    fsa: Fsa,
    fra: Option<Fra>,
    error_queue: ErrorQueue,
    queue: MsgQueue,
    current: CurrentJobList,
    registry: JobRegistry,
    delete_pipe: LogPipe,
    transfer_pipe: LogPipe,
    event_pipe: LogPipe,
    ring: SignRing,
    active: Arc<DashMap<i32, ActiveTransfer>>,
    dispatch_enabled: bool,
    draining: bool,
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Supervisor {
    /// Attach every shared region, creating what a first start lacks.
    pub fn open(
        layout: Layout,
        config: Config,
        active: Arc<DashMap<i32, ActiveTransfer>>,
    ) -> Result<Self> {
        let fsa = attach_or_create_fsa(&layout)?;
        let fra = Fra::attach_current(&layout.fifodir).ok();
        let error_queue = ErrorQueue::open(&layout.fifodir)?;
        let queue = MsgQueue::open(&layout.fifodir)?;
        let current =
            CurrentJobList::open(&layout.fifodir.join(drift_registry::CURRENT_JOB_LIST_FILE))?;
        let registry = JobRegistry::open(&layout.fifodir.join(drift_registry::JOB_ID_DATA_FILE))?;

        make_fifo(&layout.fd_cmd_fifo)?;
        let delete_pipe = LogPipe::open(&layout.fifodir, LogKind::Delete)?;
        let transfer_pipe = LogPipe::open(&layout.fifodir, LogKind::Transfer)?;
        let event_pipe = LogPipe::open(&layout.fifodir, LogKind::Event)?;
        let ring = SignRing::open(&layout.fifodir)?;

        Ok(Self {
            layout,
            config,
            fsa,
            fra,
            error_queue,
            queue,
            current,
            registry,
            delete_pipe,
            transfer_pipe,
            event_pipe,
            ring,
            active,
            dispatch_enabled: true,
            draining: false,
        })
    }

    pub fn queue(&self) -> &MsgQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MsgQueue {
        &mut self.queue
    }

    pub fn fsa(&self) -> &Fsa {
        &self.fsa
    }

    pub fn fsa_mut(&mut self) -> &mut Fsa {
        &mut self.fsa
    }

    /// The main loop: events, periodic work, drain.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<FdEvent>,
        tx: mpsc::Sender<FdEvent>,
    ) -> Result<()> {
        self.emit_event(
            EventClass::Glob,
            EventType::Auto,
            EventAction::Startup,
            "*",
            "dispatch supervisor up",
        );
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            if self.draining {
                if self.active_pids().is_empty() {
                    break;
                }
                if let Some(d) = drain_deadline {
                    if tokio::time::Instant::now() >= d {
                        self.kill_survivors();
                        break;
                    }
                }
            }

            tokio::select! {
                Some(event) = rx.recv() => {
                    if self.handle_event(event, &tx) {
                        self.begin_drain(&mut drain_deadline);
                    }
                }
                _ = tick.tick() => {
                    if !self.draining {
                        self.periodic(now());
                        self.dispatch_all(&tx);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, draining");
                    self.begin_drain(&mut drain_deadline);
                }
            }
        }

        self.write_dump()?;
        self.emit_event(
            EventClass::Glob,
            EventType::Auto,
            EventAction::Shutdown,
            "*",
            "dispatch supervisor down",
        );
        info!("driftfd stopped");
        Ok(())
    }

    /// Returns true when the event asks for a drain.
    pub fn handle_event(&mut self, event: FdEvent, tx: &mpsc::Sender<FdEvent>) -> bool {
        match event {
            FdEvent::MsgQueued => {
                self.sync_current_list();
                self.dispatch_all(tx);
                false
            }
            FdEvent::ChildExit { pid, success } => {
                self.handle_child_exit(pid, success, now());
                self.dispatch_all(tx);
                false
            }
            FdEvent::Control(cmd) => self.handle_control(cmd, now()),
        }
    }

    /// Apply one control byte; true requests a drain.
    pub fn handle_control(&mut self, cmd: ControlCmd, at: i64) -> bool {
        debug!(?cmd, "control");
        match cmd {
            ControlCmd::Stop
            | ControlCmd::QuickStop
            | ControlCmd::Halt
            | ControlCmd::Shutdown
            | ControlCmd::ShutdownAll
            | ControlCmd::SaveStop => true,
            ControlCmd::StopDispatcher => {
                self.dispatch_enabled = false;
                false
            }
            ControlCmd::StartDispatcher | ControlCmd::Start => {
                self.dispatch_enabled = true;
                false
            }
            ControlCmd::Retry => {
                self.retry_all_hosts(at);
                false
            }
            ControlCmd::CheckFileDir | ControlCmd::SearchOldFiles => {
                if let Err(e) = self.rescan_spool() {
                    warn!(error = %e, "spool rescan failed");
                }
                false
            }
            ControlCmd::FlushMsgFifoDumpQueue => {
                if let Err(e) = self.write_dump() {
                    warn!(error = %e, "queue dump failed");
                }
                false
            }
            ControlCmd::CheckTableEntries => {
                self.check_table_entries(at);
                false
            }
            ControlCmd::IsAlive => {
                info!(queued = self.queue.len(), "alive");
                false
            }
            other => {
                debug!(?other, "control byte not for the dispatcher, ignored");
                false
            }
        }
    }

    /// Dispatch every eligible message, bounded by one pass over the
    /// queue so a failing spawn cannot spin the loop.
    pub fn dispatch_all(&mut self, tx: &mpsc::Sender<FdEvent>) {
        if !self.dispatch_enabled || self.draining {
            return;
        }
        if let Err(e) = self.fsa.check_stale(&self.layout.fifodir) {
            warn!(error = %e, "host table reattach failed");
            return;
        }

        let budget = self.queue.len();
        for _ in 0..budget {
            let Some(index) = self.queue.next_dispatchable(&self.fsa) else {
                break;
            };
            if let Err(e) = self.spawn_worker(index, tx) {
                let entry = self.queue.entries()[index];
                warn!(msg = %entry.name(), error = %e, "worker spawn failed");
                let _ = self.queue.requeue(index);
                let pos = entry.pos as usize;
                if let Ok(paused) =
                    self.fsa
                        .note_error(pos, drift_fsa::transfer_error::EXIT_NONZERO, now())
                {
                    if paused {
                        self.note_auto_pause(pos, now());
                    }
                }
                break;
            }
        }
    }

    fn spawn_worker(&mut self, index: usize, tx: &mpsc::Sender<FdEvent>) -> Result<()> {
        let entry = self.queue.entries()[index];
        let name: MsgName = entry.name().parse()?;
        let pool = PoolDir::locate(&self.layout.outgoing, entry.job_id, entry.dir_no, name);
        let pos = entry.pos as usize;
        let host_alias = self.fsa.host(pos).alias();

        let mut child = tokio::process::Command::new(&self.config.fd.worker_command)
            .arg(pool.path())
            .arg(&host_alias)
            .arg(format!("{:x}", entry.job_id))
            .spawn()
            .with_context(|| format!("spawning {}", self.config.fd.worker_command))?;
        let pid = child.id().unwrap_or_default() as i32;

        self.queue.set_pid(index, pid)?;
        self.fsa.claim_slot(pos, pid, entry.job_id, &entry.name())?;
        self.active.insert(
            pid,
            ActiveTransfer {
                host_alias: host_alias.clone(),
                msg_name: entry.name(),
                started: now(),
            },
        );
        debug!(pid, host = %host_alias, msg = %entry.name(), "dispatched");

        let tx = tx.clone();
        tokio::spawn(async move {
            let success = matches!(child.wait().await, Ok(status) if status.success());
            let _ = tx.send(FdEvent::ChildExit { pid, success }).await;
        });
        Ok(())
    }

    /// Post-exit accounting for worker `pid`.
    pub fn handle_child_exit(&mut self, pid: i32, success: bool, at: i64) {
        self.active.remove(&pid);
        let Some(index) = self.queue.find_by_pid(pid) else {
            debug!(pid, "exit for unknown pid");
            return;
        };
        let entry = self.queue.entries()[index];
        let pos = entry.pos as usize;
        let _ = self.fsa.release_slot(pos, pid);

        if success {
            self.finish_message(index, at);
        } else {
            let _ = self.queue.requeue(index);
            self.transfer_record(Sign::Error, pos, &entry.name(), "transfer failed");
            match self
                .fsa
                .note_error(pos, drift_fsa::transfer_error::EXIT_NONZERO, at)
            {
                Ok(true) => self.note_auto_pause(pos, at),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "error bookkeeping failed"),
            }
        }
        self.sync_current_list();
    }

    fn finish_message(&mut self, index: usize, at: i64) {
        let Ok(entry) = self.queue.remove(index) else {
            return;
        };
        let pos = entry.pos as usize;
        let _ = self.fsa.note_success(pos, at);
        let host_id = self.fsa.host(pos).host_id;
        if self.error_queue.remove(host_id).unwrap_or(false) {
            let _ = self.fsa.update_host_status(pos, 0, ERROR_QUEUE_SET);
        }
        self.transfer_record(Sign::Info, pos, &entry.name(), "delivered");

        // Drop the pool directory; the worker already consumed the
        // files, anything left is accounted and logged on the way out.
        if let Ok(name) = entry.name().parse::<MsgName>() {
            let pool = PoolDir::locate(&self.layout.outgoing, entry.job_id, entry.dir_no, name);
            if pool.path().exists() {
                let dir_id = self
                    .registry
                    .find(entry.job_id)
                    .map(|j| j.dir_id)
                    .unwrap_or_default();
                match pool.remove(
                    &mut self.fsa,
                    pos,
                    dir_id,
                    "delivered",
                    "driftfd",
                    Some(&mut self.delete_pipe),
                ) {
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "pool cleanup failed"),
                }
            }
        }

        self.reduce_dir_counters(&entry);
        self.note_repair_if_strict(pos, at);
    }

    /// The scanner accounts queued work per directory; give it back.
    fn reduce_dir_counters(&mut self, entry: &QueueEntry) {
        let Some(fra) = self.fra.as_mut() else {
            return;
        };
        let Some(job) = self.registry.find(entry.job_id) else {
            return;
        };
        if let Some(dir_pos) = fra.get_dir_id_position(job.dir_id) {
            let _ = fra.abs_reduce_queue(
                dir_pos,
                entry.files_to_send as i32,
                entry.file_size_to_send,
            );
        }
    }

    fn note_repair_if_strict(&mut self, pos: usize, at: i64) {
        if !self.config.fd.strict_accounting {
            return;
        }
        // In strict mode any repair the counters needed becomes an
        // operator-visible event.
        if let Ok(Repaired::Yes) = self.fsa.add_file_counter(pos, 0, 0) {
            let host = self.fsa.host(pos).alias();
            self.emit_event(
                EventClass::Host,
                EventType::Auto,
                EventAction::AccountingDrift,
                &host,
                format!("counter drift repaired at {at}").as_str(),
            );
        }
    }

    fn note_auto_pause(&mut self, pos: usize, at: i64) {
        {
            let Ok(hosts) = self.fsa.hosts_mut() else {
                return;
            };
            hosts[pos].last_retry_time = at;
        }
        let host = *self.fsa.host(pos);
        let alias = host.alias();
        let _ = self.fsa.update_host_status(pos, ERROR_QUEUE_SET, 0);
        let _ = self
            .error_queue
            .add(host.host_id, host.error_counter as u32, at);
        warn!(host = %alias, "error limit reached, host auto-paused");
        self.emit_event(
            EventClass::Host,
            EventType::Auto,
            EventAction::AutoPauseHost,
            &alias,
            "error limit reached",
        );
    }

    /// Periodic work: reattach stale tables and lift expired pauses.
    pub fn periodic(&mut self, at: i64) {
        if let Err(e) = self.fsa.check_stale(&self.layout.fifodir) {
            warn!(error = %e, "host table reattach failed");
        }
        self.release_auto_paused(at);
    }

    /// Lift auto-pauses whose retry interval has elapsed.
    pub fn release_auto_paused(&mut self, at: i64) {
        let n = self.fsa.no_of_hosts();
        for pos in 0..n {
            let host = *self.fsa.host(pos);
            if host.host_status & AUTO_PAUSE_QUEUE_STAT == 0 {
                continue;
            }
            let interval = if host.retry_interval > 0 {
                host.retry_interval as i64
            } else {
                self.config.fd.default_retry_interval as i64
            };
            if at >= host.last_retry_time + interval {
                let _ = self.fsa.update_host_status(pos, 0, AUTO_PAUSE_QUEUE_STAT);
                if let Ok(hosts) = self.fsa.hosts_mut() {
                    hosts[pos].last_retry_time = at;
                }
                let alias = host.alias();
                info!(host = %alias, "retry interval elapsed, resuming dispatch");
                self.emit_event(
                    EventClass::Host,
                    EventType::Auto,
                    EventAction::RetryTransfer,
                    &alias,
                    "retry interval elapsed",
                );
            }
        }
    }

    /// Operator `RETRY`: lift every auto-pause immediately.
    pub fn retry_all_hosts(&mut self, at: i64) {
        let n = self.fsa.no_of_hosts();
        for pos in 0..n {
            if self.fsa.host(pos).host_status & AUTO_PAUSE_QUEUE_STAT != 0 {
                let _ = self.fsa.update_host_status(pos, 0, AUTO_PAUSE_QUEUE_STAT);
                if let Ok(hosts) = self.fsa.hosts_mut() {
                    hosts[pos].last_retry_time = at;
                }
                let alias = self.fsa.host(pos).alias();
                self.emit_event(
                    EventClass::Host,
                    EventType::Man,
                    EventAction::RetryTransfer,
                    &alias,
                    "operator retry",
                );
            }
        }
    }

    /// Rebuild queue entries from the spool for staged messages that
    /// are not queued (unclean stop, `SEARCH_OLD_FILES`).
    pub fn rescan_spool(&mut self) -> Result<()> {
        let found =
            drift_queue::spool::scan_spool(&self.layout.outgoing, &self.fsa, &self.registry)?;
        let mut added = 0usize;
        for entry in found {
            let name = entry.name();
            let dup = self
                .queue
                .entries()
                .iter()
                .any(|e| e.name() == name && e.job_id == entry.job_id);
            if !dup {
                self.queue.enqueue(entry)?;
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "requeued staged messages from spool");
            self.emit_event(
                EventClass::Glob,
                EventType::Auto,
                EventAction::SearchOldFiles,
                "*",
                &format!("requeued {added} staged messages"),
            );
        }
        self.sync_current_list();
        Ok(())
    }

    /// Consistency pass over the shared tables.
    pub fn check_table_entries(&mut self, at: i64) {
        let n = self.fsa.no_of_hosts();
        for pos in 0..n {
            if let Ok(Repaired::Yes) = self.fsa.add_file_counter(pos, 0, 0) {
                let alias = self.fsa.host(pos).alias();
                warn!(host = %alias, "repaired counters during table check");
                if self.config.fd.strict_accounting {
                    self.emit_event(
                        EventClass::Host,
                        EventType::Auto,
                        EventAction::AccountingDrift,
                        &alias,
                        format!("repair during table check at {at}").as_str(),
                    );
                }
            }
        }
        self.sync_current_list();
        let missing = self.current.missing_from(&self.registry);
        if !missing.is_empty() {
            warn!(?missing, "current list references unknown job ids");
        }
    }

    /// Keep the published current-message list in step with the queue.
    pub fn sync_current_list(&mut self) {
        let ids = self.queue.current_job_ids();
        if let Err(e) = self.current.set(&ids) {
            warn!(error = %e, "current job list update failed");
        }
    }

    /// Snapshot the queue to `fd_msg_cache`.
    pub fn write_dump(&mut self) -> Result<()> {
        let dump = QueueDump {
            written_at: now(),
            entries: self
                .queue
                .entries()
                .iter()
                .map(|e| DumpEntry {
                    msg_name: e.name(),
                    msg_number: e.msg_number,
                    creation_time: e.creation_time,
                    file_size_to_send: e.file_size_to_send,
                    files_to_send: e.files_to_send,
                    retries: e.retries,
                    fsa_pos: e.pos,
                    job_id: e.job_id,
                })
                .collect(),
        };
        let path = self.layout.fifodir.join(MSG_CACHE_FILE);
        let mut file = std::fs::File::create(&path)?;
        dump.write_to(&mut file)?;
        self.emit_event(
            EventClass::Glob,
            EventType::Auto,
            EventAction::QueueDumped,
            "*",
            &format!("{} entries", dump.entries.len()),
        );
        Ok(())
    }

    /// Restore a queue snapshot left by the previous run.
    pub fn restore_dump(&mut self) -> Result<()> {
        let path = self.layout.fifodir.join(MSG_CACHE_FILE);
        if !path.exists() {
            return Ok(());
        }
        let mut file = std::fs::File::open(&path)?;
        let dump = match QueueDump::read_from(&mut file) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "queue snapshot unreadable, ignoring");
                std::fs::remove_file(&path)?;
                return Ok(());
            }
        };

        let mut restored = 0usize;
        for d in dump.entries {
            if !check_msg_name(&d.msg_name) {
                continue;
            }
            let already = self.queue.entries().iter().any(|e| e.name() == d.msg_name);
            if already {
                continue;
            }
            let Ok(name) = d.msg_name.parse::<MsgName>() else {
                continue;
            };
            let mut entry = drift_queue::new_entry(
                &name,
                d.job_id,
                0,
                d.fsa_pos,
                d.files_to_send,
                d.file_size_to_send,
            );
            entry.retries = d.retries;
            entry.msg_number = d.msg_number;
            self.queue.enqueue(entry)?;
            restored += 1;
        }
        std::fs::remove_file(&path)?;
        if restored > 0 {
            info!(restored, "queue snapshot restored");
            self.emit_event(
                EventClass::Glob,
                EventType::Auto,
                EventAction::QueueRestored,
                "*",
                &format!("{restored} entries"),
            );
        }
        self.sync_current_list();
        Ok(())
    }

    pub fn active_pids(&self) -> Vec<i32> {
        self.queue
            .entries()
            .iter()
            .filter(|e| e.pid > 0)
            .map(|e| e.pid)
            .collect()
    }

    fn begin_drain(&mut self, deadline: &mut Option<tokio::time::Instant>) {
        if self.draining {
            return;
        }
        self.draining = true;
        let grace = self
            .config
            .fd
            .max_shutdown_time
            .saturating_sub(self.config.fd.min_shutdown_time);
        *deadline = Some(tokio::time::Instant::now() + Duration::from_secs(grace));
        info!(
            active = self.active_pids().len(),
            grace, "drain started"
        );
    }

    fn kill_survivors(&mut self) {
        for pid in self.active_pids() {
            warn!(pid, "drain deadline reached, killing worker");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
            self.handle_child_exit(pid, false, now());
        }
    }

    fn transfer_record(&mut self, sign: Sign, pos: usize, msg_name: &str, text: &str) {
        let host = *self.fsa.host(pos);
        let sign = sign.for_host(host.host_status & HOST_ERROR_OFFLINE_ANY != 0);
        let line = format_record(
            now(),
            sign,
            Some(&host.alias()),
            None,
            &format!("{msg_name}: {text}"),
            None,
        );
        let _ = self.transfer_pipe.write_record(line.as_bytes());
        let _ = self.ring.push(LogKind::Transfer, sign);
    }

    fn emit_event(
        &mut self,
        class: EventClass,
        initiator: EventType,
        action: EventAction,
        target: &str,
        reason: &str,
    ) {
        let record = EventRecord {
            when: now(),
            class,
            initiator,
            action,
            target: target.to_string(),
            reason: reason.to_string(),
        };
        let _ = self.event_pipe.write_record(record.to_line().as_bytes());
        let _ = self.ring.push(LogKind::Event, Sign::Info);
    }
}

/// First start: publish an empty host table under id 0.
fn attach_or_create_fsa(layout: &Layout) -> Result<Fsa> {
    match Fsa::attach_current(&layout.fifodir) {
        Ok(fsa) => Ok(fsa),
        Err(_) => {
            let path = numbered_path(&layout.fifodir.join(drift_fsa::FSA_STATUS_FILE), 0);
            let fsa = Fsa::create(&path, &[])?;
            write_region_id(&layout.fifodir.join(drift_fsa::FSA_ID_FILE), 0)?;
            info!("created empty host table");
            Ok(fsa)
        }
    }
}

/// Bridge a fifo into the event channel from a blocking thread.
pub fn spawn_fifo_reader(
    path: PathBuf,
    tx: mpsc::Sender<FdEvent>,
    role: FifoRole,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = fifo_reader_loop(&path, &tx, role) {
            error!(path = %path.display(), error = %e, "fifo reader stopped");
        }
    })
}

fn fifo_reader_loop(
    path: &Path,
    tx: &mpsc::Sender<FdEvent>,
    role: FifoRole,
) -> drift_base::Result<()> {
    make_fifo(path)?;
    let mut fifo = open_fifo_rd(path)?;
    loop {
        let mut buf = [0u8; 1];
        match readn(&mut fifo, &mut buf, Some(Duration::from_secs(1)))? {
            ReadOutcome::Complete => {
                let event = match role {
                    FifoRole::MsgQueue => FdEvent::MsgQueued,
                    FifoRole::Control => match ControlCmd::try_from(buf[0]) {
                        Ok(cmd) => FdEvent::Control(cmd),
                        Err(_) => {
                            warn!(byte = buf[0], "unknown control byte ignored");
                            continue;
                        }
                    },
                };
                if tx.blocking_send(event).is_err() {
                    return Ok(());
                }
            }
            ReadOutcome::TimedOut { .. } => {
                if tx.is_closed() {
                    return Ok(());
                }
            }
            ReadOutcome::Eof { .. } => {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_queue::new_entry;
    use tempfile::tempdir;

    fn supervisor_with_host(dir: &Path, max_errors: i32, allowed: i32) -> Supervisor {
        let layout = Layout::new(dir);
        layout.ensure().unwrap();

        let path = numbered_path(&layout.fifodir.join(drift_fsa::FSA_STATUS_FILE), 0);
        let mut fsa = Fsa::create(&path, &["h"]).unwrap();
        {
            let hosts = fsa.hosts_mut().unwrap();
            hosts[0].max_errors = max_errors;
            hosts[0].allowed_transfers = allowed;
            hosts[0].retry_interval = 60;
        }
        drop(fsa);
        write_region_id(&layout.fifodir.join(drift_fsa::FSA_ID_FILE), 0).unwrap();

        let mut config = Config::default();
        config.fd.worker_command = "/bin/true".to_string();
        Supervisor::open(layout, config, Arc::new(DashMap::new())).unwrap()
    }

    fn queue_message(sup: &mut Supervisor, time: i64, unique: u32, files: u32, bytes: i64) {
        let name = MsgName {
            creation_time: time,
            unique_number: unique,
            split_job_counter: 0,
        };
        let entry = new_entry(&name, 0xcafe, 0, 0, files, bytes);
        sup.queue_mut().enqueue(entry).unwrap();
    }

    #[test]
    fn test_child_failure_counts_and_auto_pauses() {
        let temp = tempdir().unwrap();
        let mut sup = supervisor_with_host(temp.path(), 2, 2);

        queue_message(&mut sup, 100, 1, 2, 1000);
        sup.queue_mut().set_pid(0, 501).unwrap();
        sup.handle_child_exit(501, false, 1000);
        assert_eq!(sup.fsa().host(0).error_counter, 1);
        assert!(sup.fsa().host(0).is_dispatchable());

        sup.queue_mut().set_pid(0, 502).unwrap();
        sup.handle_child_exit(502, false, 1001);
        let host = *sup.fsa().host(0);
        assert_eq!(host.error_counter, 2);
        assert_ne!(host.host_status & AUTO_PAUSE_QUEUE_STAT, 0);
        assert!(!host.is_dispatchable());

        // The message stayed queued with its retries counted.
        let entry = sup.queue().entries()[0];
        assert!(entry.is_queued());
        assert_eq!(entry.retries, 2);
        assert_eq!(sup.queue().next_dispatchable(sup.fsa()), None);
    }

    #[test]
    fn test_retry_interval_lifts_auto_pause() {
        let temp = tempdir().unwrap();
        let mut sup = supervisor_with_host(temp.path(), 1, 2);

        queue_message(&mut sup, 100, 1, 1, 10);
        sup.queue_mut().set_pid(0, 601).unwrap();
        sup.handle_child_exit(601, false, 1000);
        assert!(!sup.fsa().host(0).is_dispatchable());

        // Too early: still paused.
        sup.release_auto_paused(1030);
        assert!(!sup.fsa().host(0).is_dispatchable());

        // Interval (60 s) elapsed: dispatchable again.
        sup.release_auto_paused(1061);
        assert!(sup.fsa().host(0).is_dispatchable());
    }

    #[test]
    fn test_operator_retry_lifts_pause_immediately() {
        let temp = tempdir().unwrap();
        let mut sup = supervisor_with_host(temp.path(), 1, 2);

        queue_message(&mut sup, 100, 1, 1, 10);
        sup.queue_mut().set_pid(0, 701).unwrap();
        sup.handle_child_exit(701, false, 1000);
        assert!(!sup.fsa().host(0).is_dispatchable());

        assert!(!sup.handle_control(ControlCmd::Retry, 1001));
        assert!(sup.fsa().host(0).is_dispatchable());
    }

    #[test]
    fn test_successful_exit_removes_message_and_pool() {
        let temp = tempdir().unwrap();
        let mut sup = supervisor_with_host(temp.path(), 3, 2);

        let name = MsgName {
            creation_time: 100,
            unique_number: 1,
            split_job_counter: 0,
        };
        let pool = PoolDir::locate(
            &Layout::new(temp.path()).outgoing,
            0xcafe,
            0,
            name,
        );
        pool.create().unwrap();
        std::fs::write(pool.path().join("f"), vec![0u8; 10]).unwrap();
        sup.fsa_mut().add_file_counter(0, 1, 10).unwrap();

        queue_message(&mut sup, 100, 1, 1, 10);
        sup.queue_mut().set_pid(0, 801).unwrap();
        sup.handle_child_exit(801, true, 1000);

        assert!(sup.queue().is_empty());
        assert!(!pool.path().exists());
        let host = *sup.fsa().host(0);
        assert_eq!(host.total_file_counter, 0);
        assert_eq!(host.total_file_size, 0);
        assert_eq!(host.error_counter, 0);
    }

    #[test]
    fn test_error_queue_tracks_failing_host() {
        let temp = tempdir().unwrap();
        let mut sup = supervisor_with_host(temp.path(), 1, 2);
        let host_id = sup.fsa().host(0).host_id;

        queue_message(&mut sup, 100, 1, 1, 10);
        sup.queue_mut().set_pid(0, 901).unwrap();
        sup.handle_child_exit(901, false, 1000);

        let eq = ErrorQueue::open(&Layout::new(temp.path()).fifodir).unwrap();
        assert!(eq.contains(host_id));
        assert_ne!(sup.fsa().host(0).host_status & ERROR_QUEUE_SET, 0);
        drop(eq);

        // A later success clears both the bit and the listing.
        sup.queue_mut().set_pid(0, 902).unwrap();
        sup.handle_child_exit(902, true, 1100);
        let eq = ErrorQueue::open(&Layout::new(temp.path()).fifodir).unwrap();
        assert!(!eq.contains(host_id));
        assert_eq!(sup.fsa().host(0).host_status & ERROR_QUEUE_SET, 0);
    }

    #[test]
    fn test_dump_and_restore_roundtrip() {
        let temp = tempdir().unwrap();
        {
            let mut sup = supervisor_with_host(temp.path(), 3, 2);
            queue_message(&mut sup, 100, 1, 2, 1000);
            queue_message(&mut sup, 101, 2, 1, 500);
            sup.write_dump().unwrap();
        }

        // Fresh supervisor over the same work dir: clear the region to
        // prove entries come back from the snapshot.
        let layout = Layout::new(temp.path());
        std::fs::remove_file(layout.fifodir.join(drift_queue::FD_MSG_QUEUE_FILE)).unwrap();
        let mut config = Config::default();
        config.fd.worker_command = "/bin/true".to_string();
        let mut sup = Supervisor::open(layout, config, Arc::new(DashMap::new())).unwrap();
        sup.restore_dump().unwrap();

        assert_eq!(sup.queue().len(), 2);
        assert_eq!(sup.queue().entries()[0].creation_time, 100);
        // The snapshot file is consumed.
        assert!(!Layout::new(temp.path())
            .fifodir
            .join(MSG_CACHE_FILE)
            .exists());
    }

    #[tokio::test]
    async fn test_dispatch_spawns_and_reaps_worker() {
        let temp = tempdir().unwrap();
        let mut sup = supervisor_with_host(temp.path(), 3, 2);
        let name = MsgName {
            creation_time: 100,
            unique_number: 1,
            split_job_counter: 0,
        };
        PoolDir::locate(&Layout::new(temp.path()).outgoing, 0xcafe, 0, name)
            .create()
            .unwrap();
        queue_message(&mut sup, 100, 1, 0, 0);

        let (tx, mut rx) = mpsc::channel(16);
        sup.dispatch_all(&tx);
        let entry = sup.queue().entries()[0];
        assert!(entry.pid > 0);
        assert_eq!(sup.fsa().host(0).active_transfers, 1);

        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(FdEvent::ChildExit { pid, success })) => {
                assert_eq!(pid, entry.pid);
                assert!(success);
                sup.handle_child_exit(pid, success, now());
            }
            other => panic!("expected child exit, got {other:?}"),
        }
        assert!(sup.queue().is_empty());
        assert_eq!(sup.fsa().host(0).active_transfers, 0);
    }
}
