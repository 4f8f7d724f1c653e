//! Crash-safe file writes
//!
//! All state owned by the handler (sequence watermark, process record, status
//! documents) is rewritten wholesale. Writes go to a temporary file in the
//! target's directory which is then renamed over the target, so a concurrent
//! reader sees either the old or the new content, never a partial write.
//!
//! The temporary file is a [`tempfile::NamedTempFile`]: if anything fails
//! before the rename, dropping it removes the temporary from disk.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// Atomically replace the contents of `path` with `contents`.
///
/// The parent directory is created if it does not exist.
#[instrument(skip_all, fields(path = %path.display(), len = contents.len()))]
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    debug!("Wrote {} atomically", path.display());
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
