//! Message-name generation.
//!
//! A message directory name is `<creation_time hex>_<unique hex>_<split hex>`,
//! placed under `<id hex>/<dir_no hex>/` for prioritized jobs or flat
//! (with the id appended) for `NO_PRIORITY` work. The tuple
//! `(creation_time, unique_number, split_job_counter)` must stay unique
//! for the lifetime of the installation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::counter::CounterFile;
use crate::{BaseError, Result, MAX_MSG_PER_SEC};

/// Collision budget before [`create_name`] gives up.
pub const DIRS_LEFT: u32 = 10_000;

/// Message directories per `<id>/<dir_no>` bucket before the bucket
/// number advances.
pub const MAX_MSGS_PER_DIR: usize = 10_000;

/// A freshly created message directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedName {
    /// Bucket number the message landed in (0 for `NO_PRIORITY` names).
    pub dir_no: u32,
    /// Final path component, `<time>_<unique>_<split>[_<id>]`.
    pub name: String,
    /// Path of the created directory relative to the base.
    pub rel_path: PathBuf,
}

/// Create a unique message directory under `base`.
///
/// `priority` of `None` selects the flat name form that carries the id
/// inline; otherwise names are bucketed under `<id hex>/<dir_no hex>/`.
/// The per-second `counter` (when given) refreshes `unique_number`;
/// name collisions advance `split_job_counter` and retry, up to
/// [`DIRS_LEFT`] attempts.
pub fn create_name(
    base: &Path,
    priority: Option<char>,
    time_val: i64,
    id: u32,
    split_job_counter: &mut u32,
    unique_number: &mut u32,
    counter: Option<&mut CounterFile>,
) -> Result<CreatedName> {
    if let Some(c) = counter {
        *unique_number = c.next()?;
    } else {
        *unique_number = (*unique_number + 1) % MAX_MSG_PER_SEC;
    }

    let mut dirs_left = DIRS_LEFT;
    loop {
        let (rel_path, name, dir_no) = if priority.is_none() {
            let name = format!(
                "{:x}_{:04x}_{:x}_{:x}",
                time_val, *unique_number, *split_job_counter, id
            );
            (PathBuf::from(&name), name, 0)
        } else {
            let dir_no = pick_dir_no(&base.join(format!("{:x}", id)))?;
            let bucket = PathBuf::from(format!("{:x}", id)).join(format!("{:x}", dir_no));
            mkdir_all_mode(&base.join(&bucket))?;
            let name = format!("{:x}_{:04x}_{:x}", time_val, *unique_number, *split_job_counter);
            (bucket.join(&name), name, dir_no)
        };

        match mkdir_mode(&base.join(&rel_path)) {
            Ok(()) => {
                return Ok(CreatedName {
                    dir_no,
                    name,
                    rel_path,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                *split_job_counter += 1;
                dirs_left -= 1;
                if dirs_left == 0 {
                    warn!(
                        id = format_args!("{:x}", id),
                        time_val, "name space exhausted, giving up"
                    );
                    return Err(BaseError::SpaceExhausted { attempts: DIRS_LEFT });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Highest existing bucket under `id_dir`, advanced when full.
fn pick_dir_no(id_dir: &Path) -> Result<u32> {
    let mut highest = 0u32;
    match std::fs::read_dir(id_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                if let Some(n) = entry
                    .file_name()
                    .to_str()
                    .and_then(|s| u32::from_str_radix(s, 16).ok())
                {
                    highest = highest.max(n);
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    }

    let bucket = id_dir.join(format!("{:x}", highest));
    match std::fs::read_dir(&bucket) {
        Ok(entries) => {
            if entries.count() >= MAX_MSGS_PER_DIR {
                Ok(highest + 1)
            } else {
                Ok(highest)
            }
        }
        Err(_) => Ok(highest),
    }
}

fn mkdir_mode(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir(path)?;
    set_dir_mode(path)
}

fn mkdir_all_mode(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        set_dir_mode(path)?;
    }
    Ok(())
}

fn set_dir_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(crate::DIR_MODE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_flat_name_carries_id() {
        let temp = tempdir().unwrap();
        let mut split = 0;
        let mut unique = 5;

        let created =
            create_name(temp.path(), None, 0x5f3a2b10, 0xab, &mut split, &mut unique, None)
                .unwrap();

        assert_eq!(created.dir_no, 0);
        assert!(created.name.ends_with("_ab"));
        assert!(temp.path().join(&created.rel_path).is_dir());
    }

    #[test]
    fn test_bucketed_name_layout() {
        let temp = tempdir().unwrap();
        let mut split = 0;
        let mut unique = 0;

        let created = create_name(
            temp.path(),
            Some('3'),
            0x5f3a2b10,
            0xcafe,
            &mut split,
            &mut unique,
            None,
        )
        .unwrap();

        assert_eq!(created.rel_path, PathBuf::from("cafe/0").join(&created.name));
        assert!(temp.path().join(&created.rel_path).is_dir());
    }

    #[test]
    fn test_collision_advances_split_counter() {
        let temp = tempdir().unwrap();
        let mut split = 0;
        let mut unique = 6;

        let first = create_name(
            temp.path(),
            Some('5'),
            100,
            1,
            &mut split,
            &mut unique,
            None,
        )
        .unwrap();

        // Same time and unique number again: the split counter must move.
        let mut unique2 = 6; // pre-increment lands on 7 both times
        let second = create_name(
            temp.path(),
            Some('5'),
            100,
            1,
            &mut split,
            &mut unique2,
            None,
        )
        .unwrap();

        assert_ne!(first.name, second.name);
        assert_eq!(split, 1);
    }

    #[test]
    fn test_counter_file_feeds_unique_number() {
        let temp = tempdir().unwrap();
        let mut counter = CounterFile::open(&temp.path().join("counter")).unwrap();
        let mut split = 0;
        let mut unique = 999;

        create_name(
            temp.path(),
            None,
            42,
            9,
            &mut split,
            &mut unique,
            Some(&mut counter),
        )
        .unwrap();
        assert_eq!(unique, 0);

        create_name(
            temp.path(),
            None,
            42,
            9,
            &mut split,
            &mut unique,
            Some(&mut counter),
        )
        .unwrap();
        assert_eq!(unique, 1);
    }
}
