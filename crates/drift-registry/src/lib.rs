//! # drift-registry
//!
//! Content-addressed identities for distribution rules.
//!
//! Every recipient, option block, directory and file-mask set gets a
//! CRC-32 fingerprint of its canonical textual form; the 4-tuple
//! `(job_id, dir_id, file_mask_id, host_id)` identifies a rule. CRC
//! collisions are resolved by deterministically perturbing the reserved
//! last byte of the short-options block and rehashing.
//!
//! The registry may hold history; the *current* job list is the
//! separate set of ids referenced by queued or active messages.

pub mod listing;

use std::path::Path;

use drift_region::{copy_str, read_str, MappedRegion, RegionError};
use thiserror::Error;

pub use listing::{blur_bytes, show_job_list, unblur_bytes};

/// Region file names under `fifodir/`.
pub const JOB_ID_DATA_FILE: &str = "job_id_data";
pub const DIR_NAME_FILE: &str = "directory_names";
pub const FILE_MASK_FILE: &str = "file_masks";
pub const CURRENT_JOB_LIST_FILE: &str = "current_job_id_list";

pub const CURRENT_JID_VERSION: u8 = 1;

pub const MAX_OPTION_LENGTH: usize = 256;
pub const MAX_RECIPIENT_LENGTH: usize = 256;
/// Matches the host table's alias field.
pub const MAX_HOSTNAME_LENGTH: usize = 16;
pub const MAX_DIR_NAME_LENGTH: usize = 256;
pub const MAX_FILE_MASK_BUFFER: usize = 512;

/// Records added per growth step.
const JOB_STEP_SIZE: usize = 20;

/// Priority used when a rule does not set one.
pub const DEFAULT_PRIORITY: u8 = b'5';

/// One registered distribution rule.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JobIdData {
    pub job_id: u32,
    pub dir_id: u32,
    pub file_mask_id: u32,
    pub dir_config_id: u32,
    pub host_id: u32,
    pub recipient_id: u32,
    pub dir_id_pos: i32,
    pub no_of_loptions: i32,
    pub no_of_soptions: i32,
    pub priority: u8,
    pub _pad: [u8; 3],
    /// Newline-separated local options. The final byte is reserved as
    /// the collision-perturbation slot and never carries option text.
    pub loptions: [u8; MAX_OPTION_LENGTH],
    pub soptions: [u8; MAX_OPTION_LENGTH],
    pub recipient: [u8; MAX_RECIPIENT_LENGTH],
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<JobIdData>() == 824);

impl JobIdData {
    pub fn recipient_str(&self) -> String {
        read_str(&self.recipient)
    }

    pub fn host_alias_str(&self) -> String {
        read_str(&self.host_alias)
    }

    pub fn loptions_vec(&self) -> Vec<String> {
        let s = read_str(&self.loptions);
        if s.is_empty() {
            Vec::new()
        } else {
            s.lines().map(str::to_string).collect()
        }
    }

    pub fn soptions_str(&self) -> String {
        read_str(&self.soptions)
    }
}

/// The textual form of a rule, as the configuration parser hands it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub recipient: String,
    pub loptions: Vec<String>,
    pub soptions: String,
    pub host_alias: String,
    pub priority: u8,
    pub dir_id: u32,
    pub file_mask_id: u32,
    pub dir_config_id: u32,
    pub dir_id_pos: i32,
}

impl JobSpec {
    /// Canonical byte string the job fingerprint is computed over.
    ///
    /// `perturb` fills the reserved slot during collision resolution;
    /// 0 is the undisturbed form.
    fn canonical(&self, perturb: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.recipient.as_bytes());
        out.push(0);
        out.extend_from_slice(self.loptions.join("\n").as_bytes());
        out.push(0);
        out.extend_from_slice(self.soptions.as_bytes());
        out.push(perturb);
        out.push(0);
        out.extend_from_slice(self.host_alias.as_bytes());
        out.push(0);
        out.push(self.priority);
        out
    }

    fn matches(&self, rec: &JobIdData) -> bool {
        rec.recipient_str() == self.recipient
            && rec.loptions_vec() == self.loptions
            && rec.soptions_str() == self.soptions
            && rec.host_alias_str() == self.host_alias
            && rec.priority == self.priority
            && rec.dir_id == self.dir_id
            && rec.file_mask_id == self.file_mask_id
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no unique id left for rule (recipient {0})")]
    IdSpaceExhausted(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// The mapped `job_id_data` registry.
pub struct JobRegistry {
    region: MappedRegion,
}

impl JobRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let mut region = if path.exists() {
            MappedRegion::attach(path)?
        } else {
            MappedRegion::create(
                path,
                CURRENT_JID_VERSION,
                JOB_STEP_SIZE * std::mem::size_of::<JobIdData>(),
            )?
        };
        region.ensure_version(CURRENT_JID_VERSION, |_, found| {
            Err(RegionError::IncorrectVersion {
                found,
                expected: CURRENT_JID_VERSION,
            })
        })?;
        Ok(Self { region })
    }

    pub fn no_of_job_ids(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn jobs(&self) -> &[JobIdData] {
        &self.region.payload::<JobIdData>()[..self.no_of_job_ids()]
    }

    pub fn find(&self, job_id: u32) -> Option<&JobIdData> {
        self.jobs().iter().find(|j| j.job_id == job_id)
    }

    /// Return the id for `spec`, registering it on first sight.
    ///
    /// The fingerprint is CRC-32 over the canonical string; when a
    /// different rule already owns the id, the reserved short-options
    /// byte is stepped until the id is unique.
    pub fn lookup_job_id(&mut self, spec: &JobSpec) -> Result<u32> {
        let mut perturb: u8 = 0;
        loop {
            let job_id = drift_hash::fingerprint(&spec.canonical(perturb));
            match self.find(job_id) {
                Some(rec) if spec.matches(rec) => return Ok(job_id),
                Some(_) => {
                    perturb = perturb.checked_add(1).ok_or_else(|| {
                        RegistryError::IdSpaceExhausted(spec.recipient.clone())
                    })?;
                    tracing::warn!(
                        job_id = format_args!("{:x}", job_id),
                        perturb,
                        "job id collision, rehashing"
                    );
                }
                None => {
                    self.append(spec, job_id, perturb)?;
                    tracing::debug!(
                        job_id = format_args!("{:x}", job_id),
                        recipient = %spec.recipient,
                        "registered distribution rule"
                    );
                    return Ok(job_id);
                }
            }
        }
    }

    fn append(&mut self, spec: &JobSpec, job_id: u32, perturb: u8) -> Result<()> {
        let n = self.no_of_job_ids();
        let capacity = self.region.payload::<JobIdData>().len();
        if n == capacity {
            self.region
                .resize((capacity + JOB_STEP_SIZE) * std::mem::size_of::<JobIdData>())?;
        }

        let mut rec: JobIdData = unsafe { std::mem::zeroed() };
        rec.job_id = job_id;
        rec.dir_id = spec.dir_id;
        rec.file_mask_id = spec.file_mask_id;
        rec.dir_config_id = spec.dir_config_id;
        rec.host_id = drift_hash::fingerprint(spec.host_alias.as_bytes());
        rec.recipient_id = drift_hash::fingerprint(spec.recipient.as_bytes());
        rec.dir_id_pos = spec.dir_id_pos;
        rec.no_of_loptions = spec.loptions.len() as i32;
        rec.no_of_soptions = if spec.soptions.is_empty() { 0 } else { 1 };
        rec.priority = spec.priority;
        copy_str(&mut rec.loptions, &spec.loptions.join("\n"));
        copy_str(&mut rec.soptions, &spec.soptions);
        rec.soptions[MAX_OPTION_LENGTH - 1] = perturb;
        copy_str(&mut rec.recipient, &spec.recipient);
        copy_str(&mut rec.host_alias, &spec.host_alias);

        self.region.payload_mut::<JobIdData>()?[n] = rec;
        self.region.set_count((n + 1) as i32)?;
        Ok(())
    }
}

/// Load a point-in-time copy of the registry, as operator tools do.
pub fn read_job_ids(path: &Path) -> Result<Vec<JobIdData>> {
    let region = MappedRegion::attach_passive(path)?;
    if region.version() != CURRENT_JID_VERSION {
        return Err(RegionError::IncorrectVersion {
            found: region.version(),
            expected: CURRENT_JID_VERSION,
        }
        .into());
    }
    let n = region.count().max(0) as usize;
    Ok(region.payload::<JobIdData>()[..n].to_vec())
}

/// One registered directory name.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirNameEntry {
    pub dir_id: u32,
    pub _pad: [u8; 4],
    pub dir_name: [u8; MAX_DIR_NAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<DirNameEntry>() == 264);

impl DirNameEntry {
    pub fn name(&self) -> String {
        read_str(&self.dir_name)
    }
}

/// The mapped `directory_names` registry.
pub struct DirNameBuf {
    region: MappedRegion,
}

impl DirNameBuf {
    pub fn open(path: &Path) -> Result<Self> {
        let region = if path.exists() {
            MappedRegion::attach(path)?
        } else {
            MappedRegion::create(
                path,
                CURRENT_JID_VERSION,
                JOB_STEP_SIZE * std::mem::size_of::<DirNameEntry>(),
            )?
        };
        region.require_version(CURRENT_JID_VERSION)?;
        Ok(Self { region })
    }

    pub fn no_of_dir_names(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn entries(&self) -> &[DirNameEntry] {
        &self.region.payload::<DirNameEntry>()[..self.no_of_dir_names()]
    }

    pub fn find(&self, dir_id: u32) -> Option<&DirNameEntry> {
        self.entries().iter().find(|e| e.dir_id == dir_id)
    }

    /// Fingerprint `name`, registering it on first sight. Collisions
    /// append a counter byte to the hashed form until unique.
    pub fn lookup_dir_id(&mut self, name: &str) -> Result<u32> {
        let mut salt: u8 = 0;
        loop {
            let dir_id = if salt == 0 {
                drift_hash::fingerprint(name.as_bytes())
            } else {
                let mut input = name.as_bytes().to_vec();
                input.push(salt);
                drift_hash::fingerprint(&input)
            };
            match self.find(dir_id) {
                Some(e) if e.name() == name => return Ok(dir_id),
                Some(_) => {
                    salt = salt
                        .checked_add(1)
                        .ok_or_else(|| RegistryError::IdSpaceExhausted(name.to_string()))?;
                }
                None => {
                    let n = self.no_of_dir_names();
                    let capacity = self.region.payload::<DirNameEntry>().len();
                    if n == capacity {
                        self.region.resize(
                            (capacity + JOB_STEP_SIZE) * std::mem::size_of::<DirNameEntry>(),
                        )?;
                    }
                    let mut rec: DirNameEntry = unsafe { std::mem::zeroed() };
                    rec.dir_id = dir_id;
                    copy_str(&mut rec.dir_name, name);
                    self.region.payload_mut::<DirNameEntry>()?[n] = rec;
                    self.region.set_count((n + 1) as i32)?;
                    return Ok(dir_id);
                }
            }
        }
    }
}

/// One registered file-mask set (nul-separated masks).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FileMaskEntry {
    pub file_mask_id: u32,
    pub no_of_masks: i32,
    pub masks: [u8; MAX_FILE_MASK_BUFFER],
}

const _: () = assert!(std::mem::size_of::<FileMaskEntry>() == 520);

impl FileMaskEntry {
    pub fn masks_vec(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.no_of_masks.max(0) as usize);
        let mut start = 0usize;
        for _ in 0..self.no_of_masks.max(0) {
            let rest = &self.masks[start..];
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            out.push(String::from_utf8_lossy(&rest[..end]).into_owned());
            start += end + 1;
            if start >= self.masks.len() {
                break;
            }
        }
        out
    }
}

/// The mapped `file_masks` registry.
pub struct FileMaskList {
    region: MappedRegion,
}

impl FileMaskList {
    pub fn open(path: &Path) -> Result<Self> {
        let region = if path.exists() {
            MappedRegion::attach(path)?
        } else {
            MappedRegion::create(
                path,
                CURRENT_JID_VERSION,
                JOB_STEP_SIZE * std::mem::size_of::<FileMaskEntry>(),
            )?
        };
        region.require_version(CURRENT_JID_VERSION)?;
        Ok(Self { region })
    }

    pub fn no_of_mask_sets(&self) -> usize {
        self.region.count().max(0) as usize
    }

    pub fn entries(&self) -> &[FileMaskEntry] {
        &self.region.payload::<FileMaskEntry>()[..self.no_of_mask_sets()]
    }

    pub fn find(&self, file_mask_id: u32) -> Option<&FileMaskEntry> {
        self.entries().iter().find(|e| e.file_mask_id == file_mask_id)
    }

    pub fn lookup_file_mask_id(&mut self, masks: &[&str]) -> Result<u32> {
        let joined: Vec<u8> = masks.iter().flat_map(|m| {
            let mut v = m.as_bytes().to_vec();
            v.push(0);
            v
        }).collect();

        let mut salt: u8 = 0;
        loop {
            let id = if salt == 0 {
                drift_hash::fingerprint(&joined)
            } else {
                let mut input = joined.clone();
                input.push(salt);
                drift_hash::fingerprint(&input)
            };
            match self.find(id) {
                Some(e) if e.masks_vec() == masks => return Ok(id),
                Some(_) => {
                    salt = salt.checked_add(1).ok_or_else(|| {
                        RegistryError::IdSpaceExhausted(masks.join(","))
                    })?;
                }
                None => {
                    let n = self.no_of_mask_sets();
                    let capacity = self.region.payload::<FileMaskEntry>().len();
                    if n == capacity {
                        self.region.resize(
                            (capacity + JOB_STEP_SIZE) * std::mem::size_of::<FileMaskEntry>(),
                        )?;
                    }
                    let mut rec: FileMaskEntry = unsafe { std::mem::zeroed() };
                    rec.file_mask_id = id;
                    rec.no_of_masks = masks.len() as i32;
                    let n_copy = joined.len().min(MAX_FILE_MASK_BUFFER);
                    rec.masks[..n_copy].copy_from_slice(&joined[..n_copy]);
                    self.region.payload_mut::<FileMaskEntry>()?[n] = rec;
                    self.region.set_count((n + 1) as i32)?;
                    return Ok(id);
                }
            }
        }
    }
}

/// The set of job ids referenced by at least one queued or active
/// message, published for operator tools.
pub struct CurrentJobList {
    region: MappedRegion,
}

impl CurrentJobList {
    pub fn open(path: &Path) -> Result<Self> {
        let region = if path.exists() {
            MappedRegion::attach(path)?
        } else {
            MappedRegion::create(path, CURRENT_JID_VERSION, 64 * std::mem::size_of::<u32>())?
        };
        region.require_version(CURRENT_JID_VERSION)?;
        Ok(Self { region })
    }

    pub fn ids(&self) -> &[u32] {
        let n = self.region.count().max(0) as usize;
        &self.region.payload::<u32>()[..n]
    }

    pub fn contains(&self, job_id: u32) -> bool {
        self.ids().contains(&job_id)
    }

    /// Replace the list wholesale; the dispatcher owns its content.
    pub fn set(&mut self, ids: &[u32]) -> Result<()> {
        let capacity = self.region.payload::<u32>().len();
        if ids.len() > capacity {
            self.region
                .resize(ids.len().next_multiple_of(64) * std::mem::size_of::<u32>())?;
        }
        self.region.payload_mut::<u32>()?[..ids.len()].copy_from_slice(ids);
        self.region.set_count(ids.len() as i32)?;
        Ok(())
    }

    /// Ids in the current list with no registry entry; always empty
    /// when the dispatcher maintains both sides correctly.
    pub fn missing_from(&self, registry: &JobRegistry) -> Vec<u32> {
        self.ids()
            .iter()
            .copied()
            .filter(|id| registry.find(*id).is_none())
            .collect()
    }
}
