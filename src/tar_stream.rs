//! Serializes a source tree into a tar stream.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::exclude::ExcludeSet;
use crate::progress::ProgressReporter;

pub fn archive_root(canonical_source: &Path) -> PathBuf {
    canonical_source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Writes a tar encoding of `source` into `out` and returns the number of
/// entries archived.
///
/// Symlinks are stored as links, never followed. Entries matching
/// `excludes` are left out, and excluded directories are not descended
/// into. Absolute paths listed in `skip` (the job's own artifacts) are
/// never archived.
pub fn write_tar<W: Write>(
    out: W,
    source: &Path,
    excludes: &ExcludeSet,
    skip: &[PathBuf],
    progress: &ProgressReporter,
) -> Result<u64> {
    let canonical_root =
        fs::canonicalize(source).map_err(|err| ArchiveError::source_unreadable(source, err))?;
    let tar_root = archive_root(&canonical_root);

    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Complete);

    let walker = WalkDir::new(&canonical_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if skip.iter().any(|s| s == entry.path()) {
                debug!(path = %entry.path().display(), "skipping job artifact inside source tree");
                return false;
            }
            match tar_path(&canonical_root, &tar_root, entry.path()) {
                Some(name) if excludes.is_excluded(&name) => {
                    debug!(entry = %name.display(), "excluded");
                    false
                }
                _ => true,
            }
        });

    let mut entries = 0u64;
    for entry_result in walker {
        let entry = entry_result.map_err(|err| {
            let path = err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| canonical_root.clone());
            ArchiveError::source_unreadable(path, io::Error::from(err))
        })?;

        if is_socket(entry.file_type()) {
            warn!(path = %entry.path().display(), "socket ignored");
            continue;
        }

        let name = tar_path(&canonical_root, &tar_root, entry.path()).ok_or_else(|| {
            ArchiveError::CompressionFailed(format!(
                "walker produced {} outside of the source root",
                entry.path().display()
            ))
        })?;

        progress.record_entry();
        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|err| append_error(entry.path(), err))?;
        entries += 1;
    }

    builder
        .finish()
        .map_err(|err| append_error(&canonical_root, err))?;
    Ok(entries)
}

fn tar_path(canonical_root: &Path, tar_root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(canonical_root).ok()?;
    if rel.as_os_str().is_empty() {
        Some(tar_root.to_path_buf())
    } else {
        Some(tar_root.join(rel))
    }
}

/// Pipeline shutdowns surface as write errors from the sink; everything
/// else is a read failure on the entry.
fn append_error(path: &Path, err: io::Error) -> ArchiveError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted => {
            ArchiveError::CompressionFailed(format!("tar stream stopped at {}: {err}", path.display()))
        }
        _ => ArchiveError::source_unreadable(path, err),
    }
}

#[cfg(unix)]
fn is_socket(file_type: fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: fs::FileType) -> bool {
    false
}
