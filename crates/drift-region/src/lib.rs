//! # drift-region
//!
//! Versioned, memory-mapped, process-shared regions.
//!
//! Every shared table (hosts, directories, job identities, queue,
//! duplicate cache, retrieve lists) is a file starting with the same
//! 16-byte header followed by an array of fixed-size `#[repr(C)]`
//! records:
//!
//! ```text
//! offset  field     size
//! ------  --------  ----
//!  0      count      4    (-1 = stale, readers must reattach)
//!  4      flag1      1
//!  5      flag2      1
//!  6      aux        1
//!  7      version    1
//!  8      pagesize   4
//! 12      reserved   4    (creation time for the retrieve list)
//! ```
//!
//! Readers check the version byte and refuse unknown versions; the
//! owning crate migrates old images in place through
//! [`MappedRegion::ensure_version`]. A writer replacing a region marks
//! the old image stale (`count = -1`) and publishes the new image id in
//! a sibling `.id` file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use thiserror::Error;
use tracing::info;

/// Size of the region header.
pub const REGION_HEADER_SIZE: usize = 16;

/// Count value signalling a stale region.
pub const STALE: i32 = -1;

/// The shared 16-byte region header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegionHeader {
    pub count: i32,
    pub flag1: u8,
    pub flag2: u8,
    pub aux: u8,
    pub version: u8,
    pub pagesize: i32,
    pub reserved: i32,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == REGION_HEADER_SIZE);

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("region {path} too small: {len} bytes")]
    TooSmall { path: String, len: u64 },

    #[error("incorrect region version {found}, expected {expected}")]
    IncorrectVersion { found: u8, expected: u8 },

    #[error("region is stale")]
    Stale,

    #[error("region is attached read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, RegionError>;

enum MapInner {
    Rw(MmapMut),
    Ro(Mmap),
}

impl MapInner {
    fn as_ptr(&self) -> *const u8 {
        match self {
            MapInner::Rw(m) => m.as_ptr(),
            MapInner::Ro(m) => m.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            MapInner::Rw(m) => m.len(),
            MapInner::Ro(m) => m.len(),
        }
    }
}

/// A mapped region file: header plus a payload of fixed-size records.
pub struct MappedRegion {
    file: File,
    map: MapInner,
    path: PathBuf,
}

impl MappedRegion {
    /// Create (or truncate) a region with a freshly initialized header
    /// and a zeroed payload of `payload_len` bytes.
    pub fn create(path: &Path, version: u8, payload_len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((REGION_HEADER_SIZE + payload_len) as u64)?;

        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let header = unsafe { &mut *(map.as_mut_ptr() as *mut RegionHeader) };
        *header = RegionHeader {
            count: 0,
            flag1: 0,
            flag2: 0,
            aux: 0,
            version,
            pagesize: page_size(),
            reserved: 0,
        };
        map.flush()?;

        Ok(Self {
            file,
            map: MapInner::Rw(map),
            path: path.to_path_buf(),
        })
    }

    /// Attach an existing region read-write.
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < REGION_HEADER_SIZE as u64 {
            return Err(RegionError::TooSmall {
                path: path.display().to_string(),
                len,
            });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            map: MapInner::Rw(map),
            path: path.to_path_buf(),
        })
    }

    /// Attach an existing region read-only (the passive sibling).
    pub fn attach_passive(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        if len < REGION_HEADER_SIZE as u64 {
            return Err(RegionError::TooSmall {
                path: path.display().to_string(),
                len,
            });
        }
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            file,
            map: MapInner::Ro(map),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The region file, for byte-range locks on field offsets.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() <= REGION_HEADER_SIZE
    }

    pub fn header(&self) -> &RegionHeader {
        unsafe { &*(self.map.as_ptr() as *const RegionHeader) }
    }

    pub fn header_mut(&mut self) -> Result<&mut RegionHeader> {
        match &mut self.map {
            MapInner::Rw(m) => Ok(unsafe { &mut *(m.as_mut_ptr() as *mut RegionHeader) }),
            MapInner::Ro(_) => Err(RegionError::ReadOnly),
        }
    }

    pub fn version(&self) -> u8 {
        self.header().version
    }

    pub fn count(&self) -> i32 {
        self.header().count
    }

    pub fn set_count(&mut self, count: i32) -> Result<()> {
        self.header_mut()?.count = count;
        Ok(())
    }

    /// True once a writer has replaced this image.
    pub fn is_stale(&self) -> bool {
        self.count() == STALE
    }

    /// Mark this image stale so readers reattach to the successor.
    pub fn mark_stale(&mut self) -> Result<()> {
        self.header_mut()?.count = STALE;
        self.flush()
    }

    pub fn payload_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(REGION_HEADER_SIZE),
                self.map.len() - REGION_HEADER_SIZE,
            )
        }
    }

    pub fn payload_bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            MapInner::Rw(m) => {
                let len = m.len() - REGION_HEADER_SIZE;
                Ok(unsafe {
                    std::slice::from_raw_parts_mut(m.as_mut_ptr().add(REGION_HEADER_SIZE), len)
                })
            }
            MapInner::Ro(_) => Err(RegionError::ReadOnly),
        }
    }

    /// Typed view of the payload as an array of `T`.
    pub fn payload<T: Copy>(&self) -> &[T] {
        let n = (self.map.len() - REGION_HEADER_SIZE) / std::mem::size_of::<T>();
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(REGION_HEADER_SIZE) as *const T, n)
        }
    }

    /// Mutable typed view of the payload.
    pub fn payload_mut<T: Copy>(&mut self) -> Result<&mut [T]> {
        match &mut self.map {
            MapInner::Rw(m) => {
                let n = (m.len() - REGION_HEADER_SIZE) / std::mem::size_of::<T>();
                Ok(unsafe {
                    std::slice::from_raw_parts_mut(
                        m.as_mut_ptr().add(REGION_HEADER_SIZE) as *mut T,
                        n,
                    )
                })
            }
            MapInner::Ro(_) => Err(RegionError::ReadOnly),
        }
    }

    /// Byte offset of record `index`'s `field_offset` from the start of
    /// the file, which is the offset byte-range locks take.
    pub fn field_offset<T>(index: usize, field_offset: usize) -> u64 {
        (REGION_HEADER_SIZE + index * std::mem::size_of::<T>() + field_offset) as u64
    }

    /// Grow or shrink the payload in place and remap.
    pub fn resize(&mut self, new_payload_len: usize) -> Result<()> {
        match &mut self.map {
            MapInner::Ro(_) => Err(RegionError::ReadOnly),
            MapInner::Rw(_) => {
                self.file
                    .set_len((REGION_HEADER_SIZE + new_payload_len) as u64)?;
                let map = unsafe { MmapMut::map_mut(&self.file)? };
                self.map = MapInner::Rw(map);
                Ok(())
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        if let MapInner::Rw(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }

    /// Optionally sync, then unmap.
    pub fn detach(self, sync: bool) -> Result<()> {
        if sync {
            self.flush()?;
        }
        Ok(())
    }

    /// Refuse any version other than `expected` (regions without
    /// migration paths).
    pub fn require_version(&self, expected: u8) -> Result<()> {
        if self.version() != expected {
            return Err(RegionError::IncorrectVersion {
                found: self.version(),
                expected,
            });
        }
        Ok(())
    }

    /// Gate on the structure version, migrating old images in place.
    ///
    /// `migrate` is called with the version found and must leave the
    /// header at a strictly higher version; the loop repeats until
    /// `current` is reached. Versions above `current` are refused.
    /// Converters write the new version byte last, so a crash
    /// mid-migration leaves the old image intact.
    pub fn ensure_version(
        &mut self,
        current: u8,
        mut migrate: impl FnMut(&mut MappedRegion, u8) -> Result<()>,
    ) -> Result<()> {
        loop {
            let found = self.version();
            if found == current {
                return Ok(());
            }
            if found > current {
                return Err(RegionError::IncorrectVersion {
                    found,
                    expected: current,
                });
            }
            migrate(self, found)?;
            if self.version() <= found {
                // Converter did not advance: refuse instead of looping.
                return Err(RegionError::IncorrectVersion {
                    found,
                    expected: current,
                });
            }
            info!(
                path = %self.path.display(),
                from = found,
                to = self.version(),
                "migrated region"
            );
        }
    }
}

fn page_size() -> i32 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as i32
    }
}

/// Copy `s` into a fixed, nul-padded record field, truncating to
/// `dst.len() - 1` so the field always stays nul-terminated.
pub fn copy_str(dst: &mut [u8], s: &str) {
    dst.fill(0);
    let n = s.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Read a nul-padded record field back out.
pub fn read_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Read the current image id from a `.id` redirection file.
pub fn read_region_id(id_file: &Path) -> Result<u32> {
    let mut s = String::new();
    File::open(id_file)?.read_to_string(&mut s)?;
    s.trim()
        .parse()
        .map_err(|_| RegionError::Io(std::io::Error::other("malformed region id file")))
}

/// Publish a new image id.
pub fn write_region_id(id_file: &Path, id: u32) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(id_file)?;
    writeln!(f, "{}", id)?;
    Ok(())
}

/// Path of the numbered image `<base>.<id>`.
pub fn numbered_path(base: &Path, id: u32) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(format!(".{}", id));
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Rec {
        a: u64,
        b: u32,
        c: u32,
    }

    #[test]
    fn test_create_attach_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");

        let mut region = MappedRegion::create(&path, 1, 4 * std::mem::size_of::<Rec>()).unwrap();
        assert_eq!(region.version(), 1);
        assert_eq!(region.count(), 0);

        {
            let recs = region.payload_mut::<Rec>().unwrap();
            assert_eq!(recs.len(), 4);
            recs[2] = Rec { a: 7, b: 8, c: 9 };
        }
        region.set_count(3).unwrap();
        region.flush().unwrap();

        let other = MappedRegion::attach(&path).unwrap();
        assert_eq!(other.count(), 3);
        assert_eq!(other.payload::<Rec>()[2], Rec { a: 7, b: 8, c: 9 });
    }

    #[test]
    fn test_passive_attach_rejects_mutation() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        MappedRegion::create(&path, 1, 64).unwrap();

        let mut passive = MappedRegion::attach_passive(&path).unwrap();
        assert!(matches!(passive.header_mut(), Err(RegionError::ReadOnly)));
        assert!(matches!(
            passive.payload_mut::<Rec>(),
            Err(RegionError::ReadOnly)
        ));
    }

    #[test]
    fn test_stale_flag_visible_to_other_mapping() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        let mut writer = MappedRegion::create(&path, 1, 64).unwrap();
        let reader = MappedRegion::attach_passive(&path).unwrap();

        assert!(!reader.is_stale());
        writer.mark_stale().unwrap();
        assert!(reader.is_stale());
    }

    #[test]
    fn test_resize_preserves_leading_payload() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        let mut region = MappedRegion::create(&path, 1, 2 * std::mem::size_of::<Rec>()).unwrap();
        region.payload_mut::<Rec>().unwrap()[0] = Rec { a: 1, b: 2, c: 3 };

        region.resize(8 * std::mem::size_of::<Rec>()).unwrap();
        let recs = region.payload::<Rec>();
        assert_eq!(recs.len(), 8);
        assert_eq!(recs[0], Rec { a: 1, b: 2, c: 3 });
        assert_eq!(recs[7], Rec::default());
    }

    #[test]
    fn test_version_gate_refuses_future_versions() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        let mut region = MappedRegion::create(&path, 5, 16).unwrap();

        let err = region.ensure_version(3, |_, _| Ok(())).unwrap_err();
        assert!(matches!(
            err,
            RegionError::IncorrectVersion { found: 5, expected: 3 }
        ));
    }

    #[test]
    fn test_version_gate_chains_migrations() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("region");
        let mut region = MappedRegion::create(&path, 0, 16).unwrap();

        let mut steps = Vec::new();
        region
            .ensure_version(2, |r, found| {
                steps.push(found);
                r.header_mut()?.version = found + 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(steps, vec![0, 1]);
        assert_eq!(region.version(), 2);
    }

    #[test]
    fn test_region_id_file_roundtrip() {
        let temp = tempdir().unwrap();
        let id_file = temp.path().join("fsa.id");
        write_region_id(&id_file, 12).unwrap();
        assert_eq!(read_region_id(&id_file).unwrap(), 12);
        assert_eq!(
            numbered_path(&temp.path().join("fsa_status"), 12),
            temp.path().join("fsa_status.12")
        );
    }
}
