//! Error types for archive jobs.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can stop a backup run.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Missing or malformed flags, bad destination extension.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Source missing, permission denied, or an entry failed mid-stream.
    #[error("Source '{}' is not readable", .path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Target directory missing and uncreatable, or not writable.
    #[error("Destination '{}' is not writable: {reason}", .path.display())]
    DestinationUnwritable { path: PathBuf, reason: String },

    #[error(
        "Output file at '{}' already exists. Run with --overwrite to replace it",
        .0.display()
    )]
    DestinationExists(PathBuf),

    /// Any failure inside the compression pipeline.
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// File lifecycle I/O that fits none of the above.
    #[error("I/O error on '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    pub fn source_unreadable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::SourceUnreadable {
            path: path.into(),
            source,
        }
    }

    pub fn destination_unwritable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ArchiveError::DestinationUnwritable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit status for this error. Every failure maps to 1.
    pub fn exit_code(&self) -> u8 {
        1
    }

    /// Format error with its full source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {self}");

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {depth}: {err}"));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<anyhow::Error> for ArchiveError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors that travelled through an anyhow boundary.
        match err.downcast::<ArchiveError>() {
            Ok(archive) => archive,
            Err(other) => ArchiveError::CompressionFailed(format!("{other:#}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArchiveError::InvalidArguments("target must end in .tar.gz".into());
        assert_eq!(
            err.to_string(),
            "Invalid arguments: target must end in .tar.gz"
        );

        let err = ArchiveError::DestinationExists(PathBuf::from("/backups/out.tar.gz"));
        assert!(err.to_string().contains("/backups/out.tar.gz"));
        assert!(err.to_string().contains("--overwrite"));
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let err = ArchiveError::source_unreadable(
            "/data/project",
            io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        );
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: Source '/data/project' is not readable"));
        assert!(detailed.contains("Caused by:\n  1: permission denied"));
    }

    #[test]
    fn test_every_error_exits_with_one() {
        let errors = [
            ArchiveError::InvalidArguments("x".into()),
            ArchiveError::destination_unwritable("/x", "read-only"),
            ArchiveError::CompressionFailed("boom".into()),
        ];
        for err in errors {
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[test]
    fn test_anyhow_conversion_preserves_typed_errors() {
        let typed = anyhow::Error::new(ArchiveError::DestinationExists("/x".into()));
        assert!(matches!(
            ArchiveError::from(typed),
            ArchiveError::DestinationExists(_)
        ));

        let untyped = anyhow::anyhow!("worker exploded");
        match ArchiveError::from(untyped) {
            ArchiveError::CompressionFailed(msg) => assert_eq!(msg, "worker exploded"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
