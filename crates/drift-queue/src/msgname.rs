//! Message names.
//!
//! A message directory is named `<creation_time hex>_<unique hex>_<split hex>`.
//! The tuple must identify a job uniquely for the lifetime of the
//! installation; archivers and log correlation rely on it.

use std::fmt;
use std::str::FromStr;

use crate::QueueError;

/// Parsed message name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgName {
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
}

impl fmt::Display for MsgName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}_{:04x}_{:x}",
            self.creation_time, self.unique_number, self.split_job_counter
        )
    }
}

impl FromStr for MsgName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || QueueError::BadMsgName(s.to_string());
        let mut it = s.split('_');
        let creation = it.next().ok_or_else(bad)?;
        let unique = it.next().ok_or_else(bad)?;
        let split = it.next().ok_or_else(bad)?;
        if it.next().is_some() || creation.is_empty() || unique.is_empty() || split.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            creation_time: i64::from_str_radix(creation, 16).map_err(|_| bad())?,
            unique_number: u32::from_str_radix(unique, 16).map_err(|_| bad())?,
            split_job_counter: u32::from_str_radix(split, 16).map_err(|_| bad())?,
        })
    }
}

/// Validate a message-name string.
pub fn check_msg_name(s: &str) -> bool {
    s.parse::<MsgName>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(check_msg_name("5f3a2b10_0001_0000"));
        assert!(check_msg_name("0_0_0"));
        assert!(check_msg_name("deadbeef_ffff_2a"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!check_msg_name("no_underscores"));
        assert!(!check_msg_name("5f3a2b10_0001"));
        assert!(!check_msg_name("5f3a2b10_0001_0000_extra"));
        assert!(!check_msg_name("xyz_01_02"));
        assert!(!check_msg_name("__"));
        assert!(!check_msg_name(""));
    }

    #[test]
    fn test_roundtrip() {
        let name = MsgName {
            creation_time: 0x5f3a2b10,
            unique_number: 1,
            split_job_counter: 0,
        };
        assert_eq!(name.to_string(), "5f3a2b10_0001_0");
        assert_eq!(name.to_string().parse::<MsgName>().unwrap(), name);
    }
}
