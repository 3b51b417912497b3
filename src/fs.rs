//! Disk abstraction: mtimes and the file operations the build core needs.
//!
//! The build driver and the dependency scan only touch the disk through
//! `DiskInterface`, so tests can run against an in-memory implementation.

use std::io;
use std::path::Path;

/// A file's modification state.  `Unknown` means not stat()ed yet; `Missing`
/// means the file does not exist; `Stamp` is nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MTime {
    Unknown,
    Missing,
    Stamp(u64),
}

impl MTime {
    /// Ordering key: a missing file is older than any existing one.
    /// Panics on `Unknown`, which means a stat was skipped somewhere.
    pub fn nanos(&self) -> u64 {
        match self {
            MTime::Unknown => panic!("mtime queried before stat"),
            MTime::Missing => 0,
            MTime::Stamp(n) => *n,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, MTime::Missing)
    }
}

/// Result of reading a file, distinguishing absence from IO failure.
pub enum ReadResult {
    Okay(Vec<u8>),
    NotFound,
}

/// The disk operations used by the build core.  All operations are
/// synchronous; callers treat stat errors as reportable but survivable.
pub trait DiskInterface {
    fn stat(&self, path: &str) -> anyhow::Result<MTime>;
    fn read_file(&self, path: &str) -> anyhow::Result<ReadResult>;
    fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;
    /// Create the directories containing `path`.
    fn make_dirs(&self, path: &str) -> anyhow::Result<()>;
    /// Returns false when the file did not exist.
    fn remove_file(&self, path: &str) -> anyhow::Result<bool>;
}

/// The real disk.
pub struct SystemDisk;

#[cfg(unix)]
fn metadata_mtime(meta: &std::fs::Metadata) -> MTime {
    use std::os::unix::fs::MetadataExt;
    let secs = meta.mtime().max(0) as u64;
    MTime::Stamp(secs * 1_000_000_000 + meta.mtime_nsec() as u64)
}

#[cfg(not(unix))]
fn metadata_mtime(meta: &std::fs::Metadata) -> MTime {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    MTime::Stamp(mtime)
}

impl DiskInterface for SystemDisk {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(metadata_mtime(&meta)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => anyhow::bail!("stat {}: {}", path, err),
        }
    }

    fn read_file(&self, path: &str) -> anyhow::Result<ReadResult> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(ReadResult::Okay(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ReadResult::NotFound),
            Err(err) => anyhow::bail!("read {}: {}", path, err),
        }
    }

    fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        std::fs::write(path, content).map_err(|err| anyhow::anyhow!("write {}: {}", path, err))
    }

    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| anyhow::anyhow!("mkdirs {}: {}", parent.display(), err))?;
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => anyhow::bail!("remove {}: {}", path, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_ordering() {
        assert!(MTime::Missing.nanos() < MTime::Stamp(1).nanos());
        assert!(MTime::Stamp(1).nanos() < MTime::Stamp(2).nanos());
        assert_eq!(MTime::Stamp(7), MTime::Stamp(7));
        assert_ne!(MTime::Missing, MTime::Stamp(0));
    }

    #[test]
    fn make_dirs_bare_filename_is_noop() {
        // A path with no directory component must not error.
        SystemDisk.make_dirs("just_a_name").unwrap();
    }
}
