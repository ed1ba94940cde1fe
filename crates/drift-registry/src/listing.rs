//! Operator job listing.
//!
//! `show_job_list` streams the current rules in the line protocol the
//! operator tools speak: a `211-` banner, `NJ <count>`, then one `JL`
//! line per rule. In blurred mode the tag becomes `Jl` and the text
//! after the leading fields is obfuscated with a position-dependent
//! byte offset, so recipients cannot be shoulder-surfed off the wire.
//! This is obfuscation, not confidentiality.

use std::io::Write;

use crate::{CurrentJobList, JobRegistry, Result};

/// Blur wraps its position counter after this many bytes.
const BLUR_WRAP: usize = 28;

/// Obfuscate `data` in place: subtract 9 every third position, 17
/// otherwise, position counted modulo [`BLUR_WRAP`].
pub fn blur_bytes(data: &mut [u8]) {
    for (i, b) in data.iter_mut().enumerate() {
        let delta = if (i % BLUR_WRAP) % 3 == 0 { 9u8 } else { 17u8 };
        *b = b.wrapping_sub(delta);
    }
}

/// Invert [`blur_bytes`].
pub fn unblur_bytes(data: &mut [u8]) {
    for (i, b) in data.iter_mut().enumerate() {
        let delta = if (i % BLUR_WRAP) % 3 == 0 { 9u8 } else { 17u8 };
        *b = b.wrapping_add(delta);
    }
}

/// Stream the job list. With `current` given, only rules referenced by
/// the current message list are shown; otherwise the whole registry.
pub fn show_job_list(
    out: &mut impl Write,
    registry: &JobRegistry,
    current: Option<&CurrentJobList>,
    blur: bool,
) -> Result<()> {
    let selected: Vec<_> = registry
        .jobs()
        .iter()
        .filter(|j| current.map(|c| c.contains(j.job_id)).unwrap_or(true))
        .collect();

    writeln!(out, "211- Job list:")?;
    writeln!(out, "NJ {}", selected.len())?;

    for (index, job) in selected.iter().enumerate() {
        let tag = if blur { "Jl" } else { "JL" };
        let head = format!(
            "{} {} {:x} {:x} {:x} {}",
            tag, index, job.job_id, job.dir_id, job.no_of_loptions, job.priority as char
        );
        let mut tail = job.recipient_str().into_bytes();
        if blur {
            blur_bytes(&mut tail);
        }
        out.write_all(head.as_bytes())?;
        out.write_all(b" ")?;
        out.write_all(&tail)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobSpec, DEFAULT_PRIORITY, JOB_ID_DATA_FILE};
    use tempfile::tempdir;

    fn registry_with(recipients: &[&str]) -> (tempfile::TempDir, JobRegistry) {
        let temp = tempdir().unwrap();
        let mut reg = JobRegistry::open(&temp.path().join(JOB_ID_DATA_FILE)).unwrap();
        for r in recipients {
            reg.lookup_job_id(&JobSpec {
                recipient: r.to_string(),
                loptions: Vec::new(),
                soptions: String::new(),
                host_alias: "h".to_string(),
                priority: DEFAULT_PRIORITY,
                dir_id: 1,
                file_mask_id: 2,
                dir_config_id: 3,
                dir_id_pos: 0,
            })
            .unwrap();
        }
        (temp, reg)
    }

    #[test]
    fn test_blur_roundtrip_across_wrap_boundary() {
        let mut data: Vec<u8> = (0..100u8).collect();
        let original = data.clone();
        blur_bytes(&mut data);
        assert_ne!(data, original);
        unblur_bytes(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_blur_uses_position_dependent_deltas() {
        let mut data = vec![100u8; 6];
        blur_bytes(&mut data);
        assert_eq!(data, vec![91, 83, 83, 91, 83, 83]);
    }

    #[test]
    fn test_listing_format() {
        let (_temp, reg) = registry_with(&["ftp://u@a/in", "ftp://u@b/in"]);
        let mut out = Vec::new();
        show_job_list(&mut out, &reg, None, false).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "211- Job list:");
        assert_eq!(lines[1], "NJ 2");
        assert!(lines[2].starts_with("JL 0 "));
        assert!(lines[2].ends_with(" ftp://u@a/in"));
        assert!(lines[3].starts_with("JL 1 "));
    }

    #[test]
    fn test_blurred_listing_hides_recipient_but_decodes() {
        let (_temp, reg) = registry_with(&["ftp://user@host/in"]);
        let mut out = Vec::new();
        show_job_list(&mut out, &reg, None, true).unwrap();

        let text = out.split(|&b| b == b'\n').nth(2).unwrap().to_vec();
        assert!(text.starts_with(b"Jl 0 "));

        // Tail after the leading fields decodes back to the recipient.
        let tail_start = text
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == b' ')
            .map(|(i, _)| i)
            .nth(5)
            .unwrap()
            + 1;
        let mut tail = text[tail_start..].to_vec();
        assert_ne!(tail, b"ftp://user@host/in");
        unblur_bytes(&mut tail);
        assert_eq!(tail, b"ftp://user@host/in");
    }

    #[test]
    fn test_listing_filtered_by_current_list() {
        let temp = tempdir().unwrap();
        let mut reg = JobRegistry::open(&temp.path().join(JOB_ID_DATA_FILE)).unwrap();
        let keep = reg
            .lookup_job_id(&JobSpec {
                recipient: "ftp://u@keep/in".to_string(),
                loptions: Vec::new(),
                soptions: String::new(),
                host_alias: "h".to_string(),
                priority: DEFAULT_PRIORITY,
                dir_id: 1,
                file_mask_id: 2,
                dir_config_id: 3,
                dir_id_pos: 0,
            })
            .unwrap();
        reg.lookup_job_id(&JobSpec {
            recipient: "ftp://u@drop/in".to_string(),
            loptions: Vec::new(),
            soptions: String::new(),
            host_alias: "h".to_string(),
            priority: DEFAULT_PRIORITY,
            dir_id: 1,
            file_mask_id: 2,
            dir_config_id: 3,
            dir_id_pos: 0,
        })
        .unwrap();

        let mut current =
            CurrentJobList::open(&temp.path().join(crate::CURRENT_JOB_LIST_FILE)).unwrap();
        current.set(&[keep]).unwrap();

        let mut out = Vec::new();
        show_job_list(&mut out, &reg, Some(&current), false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("NJ 1"));
        assert!(text.contains("ftp://u@keep/in"));
        assert!(!text.contains("ftp://u@drop/in"));
    }
}
