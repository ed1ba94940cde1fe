//! Persistent per-second counter file.
//!
//! The counter disambiguates message names created within the same
//! second. It lives in one small file, is advanced under a whole-file
//! write lock, and wraps at [`MAX_MSG_PER_SEC`](crate::MAX_MSG_PER_SEC).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::lock::{lock_region_w, unlock_region};
use crate::{Result, MAX_MSG_PER_SEC};

pub struct CounterFile {
    file: File,
}

impl CounterFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Advance the counter and return its previous value.
    ///
    /// The read-modify-write runs under a byte lock so concurrent
    /// producers never mint the same number.
    pub fn next(&mut self) -> Result<u32> {
        lock_region_w(&self.file, 0)?;
        let out = self.next_locked();
        unlock_region(&self.file, 0)?;
        out
    }

    fn next_locked(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file.seek(SeekFrom::Start(0))?;
        let n = self.file.read(&mut buf)?;
        let current = if n == 4 { u32::from_ne_bytes(buf) } else { 0 };
        let next = (current + 1) % MAX_MSG_PER_SEC;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&next.to_ne_bytes())?;
        Ok(current)
    }
}
