//! Command-line surface. Accepts both `--source=/--target=` and the
//! positional `<source> <target>` form through one parser.

use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser};

use crate::compress::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::error::{ArchiveError, Result};
use crate::exclude::ExcludeSet;
use crate::job::ArchiveJob;
use crate::progress::progress_allowed;

#[derive(Debug, Parser)]
#[command(
    name = "gzbackup",
    version,
    about = "Parallel tar + gzip backups with atomic publishing",
    override_usage = "gzbackup --source=<PATH> --target=<FILE.tar.gz> [OPTIONS]\n       \
                      gzbackup <SOURCE> <TARGET> [OPTIONS]",
    after_help = "Don't forget the .tar.gz on the target filename.",
    disable_help_flag = true
)]
pub struct Args {
    /// Directory or file to archive (positional form).
    #[arg(value_name = "SOURCE", conflicts_with = "source")]
    source_pos: Option<PathBuf>,

    /// Archive to write (positional form).
    #[arg(value_name = "TARGET", conflicts_with = "target")]
    target_pos: Option<PathBuf>,

    /// Directory or file to archive.
    #[arg(long, value_name = "PATH")]
    source: Option<PathBuf>,

    /// Archive to write; must end in .tar.gz.
    #[arg(long, value_name = "FILE.tar.gz")]
    target: Option<PathBuf>,

    /// Comma-separated patterns to leave out of the archive.
    #[arg(long, value_name = "DIR1[,FILE1,...]", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Compression threads; 0 uses every core.
    #[arg(long, value_name = "N", default_value_t = 0)]
    threads: usize,

    /// Size of tar chunks handed to each compression worker (bytes).
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Replace the target if it already exists instead of aborting.
    #[arg(long)]
    overwrite: bool,

    /// Build the archive, then discard it. Nothing is published.
    #[arg(long)]
    dry: bool,

    /// Disable the progress spinner.
    #[arg(long)]
    no_progress: bool,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print help.
    #[arg(long, action = ArgAction::SetTrue)]
    help: bool,
}

impl Args {
    pub fn wants_help(&self) -> bool {
        self.help
    }

    pub fn help_text() -> String {
        Args::command().render_help().to_string()
    }

    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn into_job(self) -> Result<ArchiveJob> {
        let source = self.source.or(self.source_pos).ok_or_else(|| {
            ArchiveError::InvalidArguments(
                "missing source; pass --source=<PATH> or a positional SOURCE".to_string(),
            )
        })?;
        let destination = self.target.or(self.target_pos).ok_or_else(|| {
            ArchiveError::InvalidArguments(
                "missing target; pass --target=<FILE.tar.gz> or a positional TARGET".to_string(),
            )
        })?;
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ArchiveError::InvalidArguments(format!(
                "chunk-size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }

        Ok(ArchiveJob {
            source,
            destination,
            excludes: ExcludeSet::new(&self.exclude)?,
            threads: self.threads,
            chunk_size: self.chunk_size,
            dry_run: self.dry,
            overwrite: self.overwrite,
            show_progress: progress_allowed(self.no_progress),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(args: &[&str]) -> std::result::Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("gzbackup").chain(args.iter().copied()))
    }

    #[test]
    fn test_named_form() {
        let job = parse(&[
            "--source=/data/project",
            "--target=/backups/out.tar.gz",
            "--exclude=secret,*.log",
            "--threads=3",
            "--overwrite",
        ])
        .unwrap()
        .into_job()
        .unwrap();

        assert_eq!(job.source, Path::new("/data/project"));
        assert_eq!(job.destination, Path::new("/backups/out.tar.gz"));
        assert_eq!(job.excludes.patterns(), ["secret", "*.log"]);
        assert_eq!(job.threads, 3);
        assert!(job.overwrite);
        assert!(!job.dry_run);
    }

    #[test]
    fn test_positional_form() {
        let job = parse(&["/data/project", "/backups/out.tar.gz", "--dry"])
            .unwrap()
            .into_job()
            .unwrap();
        assert_eq!(job.source, Path::new("/data/project"));
        assert_eq!(job.destination, Path::new("/backups/out.tar.gz"));
        assert!(job.dry_run);
        assert_eq!(job.threads, 0);
        assert_eq!(job.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_mixed_forms_conflict() {
        assert!(parse(&["/data/a", "--source=/data/b", "--target=/x.tar.gz"]).is_err());
    }

    #[test]
    fn test_empty_exclude_means_nothing_excluded() {
        let job = parse(&["--source=/s", "--target=/t.tar.gz", "--exclude="])
            .unwrap()
            .into_job()
            .unwrap();
        assert!(job.excludes.is_empty());
    }

    #[test]
    fn test_missing_target_is_invalid() {
        let err = parse(&["--source=/s"]).unwrap().into_job().unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArguments(_)));
    }

    #[test]
    fn test_zero_chunk_size_is_invalid() {
        let err = parse(&["/s", "/t.tar.gz", "--chunk-size=0"])
            .unwrap()
            .into_job()
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArguments(_)));
    }

    #[test]
    fn test_oversized_chunk_size_is_invalid() {
        let err = parse(&["/s", "/t.tar.gz", "--chunk-size=1099511627776"])
            .unwrap()
            .into_job()
            .unwrap_err();
        assert!(err.to_string().contains("chunk-size"), "{err}");

        let at_limit = format!("--chunk-size={MAX_CHUNK_SIZE}");
        let job = parse(&["/s", "/t.tar.gz", &at_limit]).unwrap().into_job().unwrap();
        assert_eq!(job.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_malformed_exclude_pattern_is_invalid() {
        let err = parse(&["/s", "/t.tar.gz", "--exclude=a[b"])
            .unwrap()
            .into_job()
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArguments(_)));
    }

    #[test]
    fn test_negative_threads_rejected() {
        assert!(parse(&["/s", "/t.tar.gz", "--threads=-2"]).is_err());
    }

    #[test]
    fn test_help_flag_is_parsed_not_handled() {
        let args = parse(&["--help"]).unwrap();
        assert!(args.wants_help());
        assert!(Args::help_text().contains("--overwrite"));
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(parse(&[]).unwrap().log_level(), "info");
        assert_eq!(parse(&["-vv"]).unwrap().log_level(), "trace");
        assert_eq!(parse(&["-q"]).unwrap().log_level(), "warn");
    }

    #[test]
    fn test_command_definition_is_valid() {
        Args::command().debug_assert();
    }
}
