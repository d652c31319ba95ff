//! Filesystem effects for applied inodes.
//!
//! Everything here runs on the worker actor thread, never on a connection's
//! reader task, so plain blocking `std::fs` is fine.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use tracing::error;

use crate::tree::FileStat;

/// Make sure a file exists at `path` with exactly `size` bytes.
///
/// A missing file is created sparse at the advertised size so data blocks
/// can land at any offset; an existing file is resized.
pub fn allocate_file(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.set_len(size).map_err(|err| {
        error!(filename = %path.display(), size, error = %err, "allocate_file");
        err
    })
    .with_context(|| format!("allocating {} to {} bytes", path.display(), size))?;
    Ok(())
}

/// Write a block of content at an offset.
pub fn write_block(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
        .with_context(|| format!("writing {} bytes at {offset} in {}", data.len(), path.display()))?;
    Ok(())
}

/// Stat a file into the record shape carried on the wire.
pub fn file_stat(path: &Path) -> Result<FileStat> {
    let meta = std::fs::metadata(path).map_err(|err| {
        error!(filename = %path.display(), error = %err, "file_stat");
        err
    })
    .with_context(|| format!("stat {}", path.display()))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default();
    Ok(FileStat::new(meta.len(), modified))
}

/// A location's path relative to its tenant root, with `/` separators.
///
/// Fails when the location does not sit under the root.
pub fn relative_path(root: &Path, location: &Path) -> Result<String> {
    let Ok(relative) = location.strip_prefix(root) else {
        bail!(
            "location {} is not in tenant root {}",
            location.display(),
            root.display()
        );
    };
    let mut name = String::new();
    for component in relative.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn allocate_creates_at_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        allocate_file(&path, 4096).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

        allocate_file(&path, 100).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn blocks_land_at_their_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        allocate_file(&path, 8).unwrap();
        write_block(&path, 4, b"abcd").unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[4..], b"abcd");
    }

    #[test]
    fn stat_reports_the_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello").unwrap();
        let stat = file_stat(&path).unwrap();
        assert_eq!(stat.size.bytes, 5);
        assert!(stat.modified > 0);
    }

    #[test]
    fn relative_path_rejects_escapes() {
        let root = PathBuf::from("/srv/docs");
        assert_eq!(
            relative_path(&root, &root.join("a/b.txt")).unwrap(),
            "a/b.txt"
        );
        assert!(relative_path(&root, Path::new("/etc/passwd")).is_err());
    }
}
