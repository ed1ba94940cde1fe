//! # drift-base
//!
//! Primitive I/O and locking substrate for Drift.
//!
//! Everything in this crate is process-shared plumbing: named fifos,
//! advisory byte-range locks over well-known offsets, signal-safe
//! read/write loops, persistent counter files and the message-name
//! generator that hands work from the scanner to the dispatcher.

pub mod counter;
pub mod fifo;
pub mod io;
pub mod lock;
pub mod naming;

use thiserror::Error;

/// Directory creation mode for pool and message directories.
pub const DIR_MODE: u32 = 0o770;

/// Upper bound for the per-second unique counter.
pub const MAX_MSG_PER_SEC: u32 = 10_000;

#[derive(Error, Debug)]
pub enum BaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("lock is held by {holder}")]
    LockIsSet { holder: String },

    #[error("lock file does not exist: {path}")]
    LockFileNotThere { path: String },

    #[error("message name space exhausted after {attempts} attempts")]
    SpaceExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, BaseError>;
