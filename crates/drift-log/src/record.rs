//! Record formats.
//!
//! Text logs share one line layout; the event log is structured into a
//! fixed field sequence; the delete log fronts each record with a
//! binary header so the logger can account files and bytes without
//! parsing text.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::{LogError, Result, Sign, LOG_HOSTNAME_WIDTH};

/// Render one text-log line:
/// `<dd> <hh:mm:ss> <sign> [host] [slot] : message (file line)`.
///
/// `slot` is the worker's job slot, when it has one. `source` names
/// the emitting file and line for postmortems.
pub fn format_record(
    when: i64,
    sign: Sign,
    host: Option<&str>,
    slot: Option<usize>,
    message: &str,
    source: Option<(&str, u32)>,
) -> String {
    let t: DateTime<Utc> = DateTime::from_timestamp(when, 0).unwrap_or_default();
    let mut out = format!(
        "{:02} {:02}:{:02}:{:02} <{}> ",
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        sign.as_char()
    );
    if let Some(host) = host {
        out.push_str(&format!("[{:<width$}] ", host, width = LOG_HOSTNAME_WIDTH));
    }
    if let Some(slot) = slot {
        out.push_str(&format!("[{}] ", slot));
    }
    out.push_str(": ");
    out.push_str(message);
    if let Some((file, line)) = source {
        out.push_str(&format!(" ({} {})", file, line));
    }
    out.push('\n');
    out
}

/// Event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Glob,
    Dir,
    Prod,
    Host,
}

impl EventClass {
    fn as_str(self) -> &'static str {
        match self {
            EventClass::Glob => "GLOB",
            EventClass::Dir => "DIR",
            EventClass::Prod => "PROD",
            EventClass::Host => "HOST",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "GLOB" => EventClass::Glob,
            "DIR" => EventClass::Dir,
            "PROD" => EventClass::Prod,
            "HOST" => EventClass::Host,
            _ => return None,
        })
    }
}

/// Who initiated the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Man,
    Ext,
    Auto,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Man => "MAN",
            EventType::Ext => "EXT",
            EventType::Auto => "AUTO",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "MAN" => EventType::Man,
            "EXT" => EventType::Ext,
            "AUTO" => EventType::Auto,
            _ => return None,
        })
    }
}

/// Closed action catalog. Discriminants are wire values; new actions
/// are appended, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventAction {
    Startup = 1,
    Shutdown = 2,
    ConfigReread = 3,
    HostDisabled = 4,
    HostEnabled = 5,
    StartQueue = 6,
    StopQueue = 7,
    StartTransfer = 8,
    StopTransfer = 9,
    AutoPauseHost = 10,
    RetryTransfer = 11,
    ErrorAcknowledged = 12,
    ErrorOfflineSet = 13,
    ErrorOfflineCleared = 14,
    SwitchHost = 15,
    WarnTimeReached = 16,
    QueueDumped = 17,
    QueueRestored = 18,
    SearchOldFiles = 19,
    AccountingDrift = 20,
    TableRebuilt = 21,
}

impl EventAction {
    fn parse(v: u8) -> Option<Self> {
        Some(match v {
            1 => EventAction::Startup,
            2 => EventAction::Shutdown,
            3 => EventAction::ConfigReread,
            4 => EventAction::HostDisabled,
            5 => EventAction::HostEnabled,
            6 => EventAction::StartQueue,
            7 => EventAction::StopQueue,
            8 => EventAction::StartTransfer,
            9 => EventAction::StopTransfer,
            10 => EventAction::AutoPauseHost,
            11 => EventAction::RetryTransfer,
            12 => EventAction::ErrorAcknowledged,
            13 => EventAction::ErrorOfflineSet,
            14 => EventAction::ErrorOfflineCleared,
            15 => EventAction::SwitchHost,
            16 => EventAction::WarnTimeReached,
            17 => EventAction::QueueDumped,
            18 => EventAction::QueueRestored,
            19 => EventAction::SearchOldFiles,
            20 => EventAction::AccountingDrift,
            21 => EventAction::TableRebuilt,
            _ => return None,
        })
    }
}

/// One structured event-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub when: i64,
    pub class: EventClass,
    pub initiator: EventType,
    pub action: EventAction,
    /// Host alias or directory alias the event concerns; `*` for
    /// system-wide events.
    pub target: String,
    pub reason: String,
}

impl EventRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}\n",
            self.when,
            self.class.as_str(),
            self.initiator.as_str(),
            self.action as u8,
            if self.target.is_empty() { "*" } else { &self.target },
            self.reason
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut it = line.trim_end().splitn(6, ' ');
        let when = it
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(LogError::Malformed)?;
        let class = it
            .next()
            .and_then(EventClass::parse)
            .ok_or(LogError::Malformed)?;
        let initiator = it
            .next()
            .and_then(EventType::parse)
            .ok_or(LogError::Malformed)?;
        let action = it
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .and_then(EventAction::parse)
            .ok_or(LogError::Malformed)?;
        let target = it.next().ok_or(LogError::Malformed)?.to_string();
        let reason = it.next().unwrap_or_default().to_string();
        Ok(Self {
            when,
            class,
            initiator,
            action,
            target,
            reason,
        })
    }
}

/// Binary-fronted delete-log record.
///
/// Fixed header, then `file_name\0host_and_reason\0proc\0(file line)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    pub input_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
    pub job_id: u32,
    pub dir_id: u32,
    pub file_size: i64,
    pub file_name: String,
    pub host_and_reason: String,
    pub proc_name: String,
    pub source: String,
}

/// Fixed part: input_time, unique, split, job_id, dir_id, file_size,
/// file_name_length.
const DELETE_FIXED_LEN: usize = 8 + 4 + 4 + 4 + 4 + 8 + 4;

impl DeleteRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DELETE_FIXED_LEN + self.file_name.len() + 32);
        out.extend_from_slice(&self.input_time.to_ne_bytes());
        out.extend_from_slice(&self.unique_number.to_ne_bytes());
        out.extend_from_slice(&self.split_job_counter.to_ne_bytes());
        out.extend_from_slice(&self.job_id.to_ne_bytes());
        out.extend_from_slice(&self.dir_id.to_ne_bytes());
        out.extend_from_slice(&self.file_size.to_ne_bytes());
        out.extend_from_slice(&(self.file_name.len() as u32).to_ne_bytes());
        out.extend_from_slice(self.file_name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.host_and_reason.as_bytes());
        out.push(0);
        out.extend_from_slice(self.proc_name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.source.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DELETE_FIXED_LEN {
            return Err(LogError::Malformed);
        }
        let mut off = 0usize;
        let mut take = |n: usize| {
            let s = &buf[off..off + n];
            off += n;
            s
        };
        let input_time = i64::from_ne_bytes(take(8).try_into().unwrap());
        let unique_number = u32::from_ne_bytes(take(4).try_into().unwrap());
        let split_job_counter = u32::from_ne_bytes(take(4).try_into().unwrap());
        let job_id = u32::from_ne_bytes(take(4).try_into().unwrap());
        let dir_id = u32::from_ne_bytes(take(4).try_into().unwrap());
        let file_size = i64::from_ne_bytes(take(8).try_into().unwrap());
        let name_len = u32::from_ne_bytes(take(4).try_into().unwrap()) as usize;

        let rest = &buf[DELETE_FIXED_LEN..];
        if rest.len() < name_len {
            return Err(LogError::Malformed);
        }
        let mut parts = rest.splitn(4, |&b| b == 0);
        let file_name = parts.next().ok_or(LogError::Malformed)?;
        if file_name.len() != name_len {
            return Err(LogError::Malformed);
        }
        let host_and_reason = parts.next().ok_or(LogError::Malformed)?;
        let proc_name = parts.next().ok_or(LogError::Malformed)?;
        let source = parts.next().unwrap_or_default();

        Ok(Self {
            input_time,
            unique_number,
            split_job_counter,
            job_id,
            dir_id,
            file_size,
            file_name: String::from_utf8_lossy(file_name).into_owned(),
            host_and_reason: String::from_utf8_lossy(host_and_reason).into_owned(),
            proc_name: String::from_utf8_lossy(proc_name).into_owned(),
            source: String::from_utf8_lossy(source).into_owned(),
        })
    }
}
