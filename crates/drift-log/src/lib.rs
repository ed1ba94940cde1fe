//! # drift-log
//!
//! The operator-visible logging pipeline. Every worker writes records
//! into named fifos under `fifodir/`; one logger process per log drains
//! its fifo, rotates files and keeps a ring of the most recent record
//! signs in the status region.
//!
//! Producers must never stall the data plane: a full fifo gets one
//! retry, then the record is dropped and counted.

pub mod pipe;
pub mod record;
pub mod ring;

use thiserror::Error;

pub use pipe::LogPipe;
pub use record::{format_record, DeleteRecord, EventAction, EventClass, EventRecord, EventType};
pub use ring::SignRing;

/// Host-name column width in text records.
pub const LOG_HOSTNAME_WIDTH: usize = 16;

/// Ring length of remembered record signs per log.
pub const LOG_FIFO_SIZE: usize = 40;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base error: {0}")]
    Base(#[from] drift_base::BaseError),

    #[error("region error: {0}")]
    Region(#[from] drift_region::RegionError),

    #[error("malformed record")]
    Malformed,
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Record severity sign. The middle byte of the rendered `<X>` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Sign {
    Info = b'I',
    Config = b'C',
    Warn = b'W',
    Error = b'E',
    Fatal = b'F',
    Debug = b'D',
    Trace = b'T',
    /// Error on a host that is acknowledged or known offline.
    Offline = b'O',
}

impl Sign {
    pub fn as_char(self) -> char {
        self as u8 as char
    }

    /// Rewrite an error sign to `O` when the host's error state is
    /// acknowledged or offline, so downstream tools can tell live
    /// errors from known ones. `offline` is the host-status predicate.
    pub fn for_host(self, offline: bool) -> Sign {
        match (self, offline) {
            (Sign::Error | Sign::Warn | Sign::Fatal, true) => Sign::Offline,
            _ => self,
        }
    }
}

/// Every log in the pipeline, with its fifo name under `fifodir/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    System,
    Maintainer,
    Event,
    Receive,
    Transfer,
    TransDebug,
    Input,
    Output,
    Delete,
    Production,
    Distribution,
    Confirmation,
}

impl LogKind {
    pub const ALL: [LogKind; 12] = [
        LogKind::System,
        LogKind::Maintainer,
        LogKind::Event,
        LogKind::Receive,
        LogKind::Transfer,
        LogKind::TransDebug,
        LogKind::Input,
        LogKind::Output,
        LogKind::Delete,
        LogKind::Production,
        LogKind::Distribution,
        LogKind::Confirmation,
    ];

    pub fn fifo_name(self) -> &'static str {
        match self {
            LogKind::System => "system_log.fifo",
            LogKind::Maintainer => "maintainer_log.fifo",
            LogKind::Event => "event_log.fifo",
            LogKind::Receive => "receive_log.fifo",
            LogKind::Transfer => "transfer_log.fifo",
            LogKind::TransDebug => "trans_db_log.fifo",
            LogKind::Input => "input_log.fifo",
            LogKind::Output => "output_log.fifo",
            LogKind::Delete => "delete_log.fifo",
            LogKind::Production => "production_log.fifo",
            LogKind::Distribution => "distribution_log.fifo",
            LogKind::Confirmation => "confirmation_log.fifo",
        }
    }

    /// Index into the sign ring region.
    pub fn ring_slot(self) -> usize {
        Self::ALL.iter().position(|k| *k == self).unwrap()
    }
}
