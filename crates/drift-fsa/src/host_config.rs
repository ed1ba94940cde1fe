//! HOST_CONFIG text codec.
//!
//! The host table is materialized from `etc/HOST_CONFIG`; operator
//! tools rewrite that file from live records. Rewrites go through a
//! temp file and an atomic rename so a crash never leaves a torn
//! config behind.

use std::io::Write;
use std::path::Path;

use crate::{FsaError, HostRecord, Result};
use drift_region::copy_str;

/// One parsed HOST_CONFIG row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfigRow {
    pub alias: String,
    pub real_hostname: [String; 2],
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub transfer_timeout: i64,
    pub protocol: u32,
}

impl HostConfigRow {
    pub fn from_record(rec: &HostRecord) -> Self {
        Self {
            alias: rec.alias(),
            real_hostname: [rec.real_hostname(0), rec.real_hostname(1)],
            allowed_transfers: rec.allowed_transfers,
            max_errors: rec.max_errors,
            retry_interval: rec.retry_interval,
            block_size: rec.block_size,
            transfer_timeout: rec.transfer_timeout,
            protocol: rec.protocol,
        }
    }

    pub fn to_record(&self) -> HostRecord {
        let mut rec = HostRecord::new(&self.alias);
        copy_str(&mut rec.real_hostname[0], &self.real_hostname[0]);
        copy_str(&mut rec.real_hostname[1], &self.real_hostname[1]);
        rec.allowed_transfers = self.allowed_transfers;
        rec.max_errors = self.max_errors;
        rec.retry_interval = self.retry_interval;
        rec.block_size = self.block_size;
        rec.transfer_timeout = self.transfer_timeout;
        rec.protocol = self.protocol;
        rec
    }

    fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{:x}",
            self.alias,
            self.real_hostname[0],
            self.real_hostname[1],
            self.allowed_transfers,
            self.max_errors,
            self.retry_interval,
            self.block_size,
            self.transfer_timeout,
            self.protocol
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut it = line.split(':');
        let alias = it.next()?.to_string();
        let real0 = it.next()?.to_string();
        let real1 = it.next()?.to_string();
        Some(Self {
            alias,
            real_hostname: [real0, real1],
            allowed_transfers: it.next()?.parse().ok()?,
            max_errors: it.next()?.parse().ok()?,
            retry_interval: it.next()?.parse().ok()?,
            block_size: it.next()?.parse().ok()?,
            transfer_timeout: it.next()?.parse().ok()?,
            protocol: u32::from_str_radix(it.next()?, 16).ok()?,
        })
    }
}

/// Rewrite HOST_CONFIG atomically (temp file + rename).
pub fn write_host_config(path: &Path, rows: &[HostConfigRow]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut f = std::fs::File::create(&tmp)?;
        writeln!(f, "# Host configuration, one host per line:")?;
        writeln!(
            f,
            "# alias:real1:real2:allowed_transfers:max_errors:retry_interval:block_size:transfer_timeout:protocol"
        )?;
        for row in rows {
            writeln!(f, "{}", row.to_line())?;
        }
        f.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(FsaError::Io(e));
    }
    Ok(())
}

/// Parse HOST_CONFIG, skipping comments and malformed rows.
pub fn read_host_config(path: &Path) -> Result<Vec<HostConfigRow>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(HostConfigRow::parse)
        .collect())
}
