//! Lifecycle of the `<destination>.tmp` artifact.
//!
//! The temporary file is held by [`TempArtifact`], which deletes it on
//! drop unless it was promoted. Promotion is a same-directory rename (or
//! a hard link when clobbering is not allowed), so the destination path
//! only ever shows a complete archive.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};

pub fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

pub struct TempArtifact {
    path: PathBuf,
    file: Option<File>,
    persisted: bool,
}

impl TempArtifact {
    /// Creates the temporary file, first removing one left behind by a
    /// crashed or killed run.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match fs::remove_file(&path) {
            Ok(()) => warn!(
                path = %path.display(),
                "removed stale temporary artifact left by an earlier run"
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(ArchiveError::io(&path, err)),
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| ArchiveError::io(&path, err))?;
        debug!(path = %path.display(), "temporary artifact created");

        Ok(Self {
            path,
            file: Some(file),
            persisted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| {
            ArchiveError::io(
                path,
                io::Error::new(io::ErrorKind::Other, "temporary artifact already closed"),
            )
        })
    }

    /// Flushes and fsyncs the file so a promoted archive survives a crash.
    pub fn sync(&mut self) -> Result<()> {
        let path = self.path.clone();
        let file = self.file_mut()?;
        file.flush().map_err(|err| ArchiveError::io(&path, err))?;
        file.sync_all().map_err(|err| ArchiveError::io(&path, err))
    }

    pub fn discard(mut self) -> Result<()> {
        self.file.take();
        self.persisted = true;
        fs::remove_file(&self.path).map_err(|err| ArchiveError::io(&self.path, err))?;
        debug!(path = %self.path.display(), "temporary artifact discarded");
        Ok(())
    }

    /// Moves the temporary file to `destination`.
    ///
    /// With `overwrite`, an existing destination is replaced in one rename.
    /// Without it, the publish fails with `DestinationExists` if something
    /// appeared at `destination` since validation, and the temporary file
    /// is removed.
    pub fn promote(mut self, destination: &Path, overwrite: bool) -> Result<()> {
        self.file.take();

        if overwrite {
            self.rename_to(destination)?;
        } else {
            match fs::hard_link(&self.path, destination) {
                Ok(()) => {
                    self.persisted = true;
                    if let Err(err) = fs::remove_file(&self.path) {
                        warn!(
                            path = %self.path.display(),
                            error = %err,
                            "archive published but temporary link could not be removed"
                        );
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(ArchiveError::DestinationExists(destination.to_path_buf()));
                }
                Err(err) => {
                    debug!(error = %err, "hard link unavailable, falling back to rename");
                    if destination.exists() {
                        return Err(ArchiveError::DestinationExists(destination.to_path_buf()));
                    }
                    self.rename_to(destination)?;
                }
            }
        }

        sync_parent_dir(destination);
        debug!(destination = %destination.display(), "temporary artifact promoted");
        Ok(())
    }

    fn rename_to(&mut self, destination: &Path) -> Result<()> {
        fs::rename(&self.path, destination).map_err(|err| {
            ArchiveError::destination_unwritable(destination, format!("rename failed: {err}"))
        })?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        self.file.take();
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "temporary artifact removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove temporary artifact"
            ),
        }
    }
}

/// Persists the directory entry of a freshly renamed file. Best effort.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %err, "directory sync skipped");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
