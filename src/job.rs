//! The archive job and the state machine that publishes its output.
//!
//! ```text
//! Idle -> Validating -> Compressing -> DryRunDiscard -> Done
//!                                   -> Promoting     -> Done
//!         (any failure)             -> Failed
//! ```
//!
//! Validation runs before the temporary path is touched. Once compression
//! starts, the temporary artifact is owned by a guard that removes it on
//! every failure path.

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indicatif::{HumanBytes, HumanDuration};
use tracing::{debug, info};

use crate::compress::{gzip_member, ChunkWriter, CompressStats, EncodeFn, ParallelGzip};
use crate::error::{ArchiveError, Result};
use crate::exclude::ExcludeSet;
use crate::progress::ProgressReporter;
use crate::publish::{temp_path_for, TempArtifact};
use crate::tar_stream::write_tar;
use crate::threads::{self, ThreadChoice};

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// One backup run, built once from the command line.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub excludes: ExcludeSet,
    /// 0 means every detected core.
    pub threads: usize,
    pub chunk_size: usize,
    pub dry_run: bool,
    pub overwrite: bool,
    pub show_progress: bool,
}

impl ArchiveJob {
    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.destination)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Validating,
    Compressing,
    DryRunDiscard,
    Promoting,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Validating => "validating",
            JobState::Compressing => "compressing",
            JobState::DryRunDiscard => "dry-run discard",
            JobState::Promoting => "promoting",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published,
    /// Dry run: the archive was built and thrown away.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub outcome: Outcome,
    pub threads: ThreadChoice,
    pub entries: u64,
    pub stats: CompressStats,
    pub elapsed: Duration,
}

pub fn run(job: &ArchiveJob) -> Result<JobReport> {
    Controller::new(job, threads::detected_cores()).run()
}

struct Controller<'a> {
    job: &'a ArchiveJob,
    detected_cores: usize,
    encode: EncodeFn,
    state: JobState,
}

struct Prepared {
    /// Canonical paths of the job's own files, excluded from the tar.
    artifacts: Vec<PathBuf>,
}

impl<'a> Controller<'a> {
    fn new(job: &'a ArchiveJob, detected_cores: usize) -> Self {
        Self {
            job,
            detected_cores,
            encode: gzip_member,
            state: JobState::Idle,
        }
    }

    #[cfg(test)]
    fn with_encoder(mut self, encode: EncodeFn) -> Self {
        self.encode = encode;
        self
    }

    fn enter(&mut self, state: JobState) {
        debug!(from = %self.state, to = %state, "job state");
        self.state = state;
    }

    fn run(&mut self) -> Result<JobReport> {
        let job = self.job;
        self.run_with(move |writer, progress, artifacts| {
            write_tar(writer, &job.source, &job.excludes, artifacts, progress)
        })
    }

    /// Drives the state machine with `produce` writing the tar stream.
    fn run_with<F>(&mut self, produce: F) -> Result<JobReport>
    where
        F: FnOnce(&mut ChunkWriter, &ProgressReporter, &[PathBuf]) -> Result<u64> + Send,
    {
        let result = self.drive(produce);
        if let Err(err) = &result {
            debug!(state = %self.state, error = %err, "job failed");
            self.enter(JobState::Failed);
        }
        result
    }

    fn drive<F>(&mut self, produce: F) -> Result<JobReport>
    where
        F: FnOnce(&mut ChunkWriter, &ProgressReporter, &[PathBuf]) -> Result<u64> + Send,
    {
        let job = self.job;

        self.enter(JobState::Validating);
        let prepared = validate(job)?;

        if job.dry_run {
            info!("Running in dry mode, the archive will be discarded");
        }
        info!(
            source = %job.source.display(),
            destination = %job.destination.display(),
            "Compression started"
        );
        let started = Instant::now();

        if !job.excludes.is_empty() {
            info!(patterns = ?job.excludes.patterns(), "Excluding matching entries");
        }
        let choice = threads::resolve(job.threads, self.detected_cores);
        info!("{choice}");

        self.enter(JobState::Compressing);
        let mut temp = TempArtifact::create(job.temp_path())?;
        debug!(temp = %temp.path().display(), "writing archive");
        let progress = ProgressReporter::new("archiving", job.show_progress);
        let compressor =
            ParallelGzip::new(choice.count(), job.chunk_size).with_encoder(self.encode);

        let compressed = {
            let producer_progress = progress.clone();
            let artifacts: &[PathBuf] = &prepared.artifacts;
            let file = temp.file_mut()?;
            compressor.compress(
                move |writer| produce(writer, &producer_progress, artifacts).map(|_| ()),
                file,
                &progress,
            )
        };
        let stats = match compressed.and_then(|stats| temp.sync().map(|()| stats)) {
            Ok(stats) => stats,
            Err(err) => {
                progress.finish_error();
                // Dropping the guard removes the partial artifact first.
                drop(temp);
                return Err(err);
            }
        };
        progress.finish_success();

        let outcome = if job.dry_run {
            self.enter(JobState::DryRunDiscard);
            temp.discard()?;
            Outcome::Discarded
        } else {
            self.enter(JobState::Promoting);
            temp.promote(&job.destination, job.overwrite)?;
            Outcome::Published
        };
        self.enter(JobState::Done);

        let report = JobReport {
            outcome,
            threads: choice,
            entries: progress.entries(),
            stats,
            elapsed: started.elapsed(),
        };
        log_report(&report);
        Ok(report)
    }
}

fn log_report(report: &JobReport) {
    let ratio = if report.stats.bytes_in == 0 {
        0.0
    } else {
        report.stats.bytes_out as f64 * 100.0 / report.stats.bytes_in as f64
    };
    info!(
        "Finished: {} entries, {} -> {} ({ratio:.1}%), {} threads",
        report.entries,
        HumanBytes(report.stats.bytes_in),
        HumanBytes(report.stats.bytes_out),
        report.threads.count(),
    );
    info!("Elapsed time: {}", HumanDuration(report.elapsed));
    if report.outcome == Outcome::Discarded {
        info!("Dry run complete, nothing was written");
    }
}

/// Pre-flight checks. Nothing here touches the temporary path.
fn validate(job: &ArchiveJob) -> Result<Prepared> {
    let destination = &job.destination;

    let has_suffix = destination
        .file_name()
        .map(|name| name.to_string_lossy().ends_with(ARCHIVE_SUFFIX))
        .unwrap_or(false);
    if !has_suffix {
        return Err(ArchiveError::InvalidArguments(format!(
            "target '{}' must end in {ARCHIVE_SUFFIX}",
            destination.display()
        )));
    }

    check_source(&job.source)?;

    let dest_dir = destination_dir(destination)?;
    ensure_dir(&dest_dir)?;
    check_writable(&dest_dir)?;

    match fs::symlink_metadata(destination) {
        Ok(meta) if meta.is_dir() => {
            return Err(ArchiveError::destination_unwritable(
                destination,
                "path is a directory",
            ));
        }
        Ok(_) if !job.overwrite => {
            return Err(ArchiveError::DestinationExists(destination.clone()));
        }
        Ok(_) => debug!(destination = %destination.display(), "existing destination will be replaced"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(ArchiveError::destination_unwritable(destination, err.to_string())),
    }

    let canonical_dir = fs::canonicalize(&dest_dir)
        .map_err(|err| ArchiveError::destination_unwritable(&dest_dir, err.to_string()))?;
    let artifacts = [destination.clone(), job.temp_path()]
        .iter()
        .filter_map(|p| p.file_name().map(|name| canonical_dir.join(name)))
        .collect();

    Ok(Prepared { artifacts })
}

fn check_source(source: &Path) -> Result<()> {
    let meta = fs::metadata(source).map_err(|err| ArchiveError::source_unreadable(source, err))?;
    let readable = if meta.is_dir() {
        fs::read_dir(source).map(|_| ())
    } else {
        fs::File::open(source).map(|_| ())
    };
    readable.map_err(|err| ArchiveError::source_unreadable(source, err))
}

fn destination_dir(destination: &Path) -> Result<PathBuf> {
    let absolute = if destination.is_absolute() {
        destination.to_path_buf()
    } else {
        env::current_dir()
            .map_err(|err| ArchiveError::destination_unwritable(destination, err.to_string()))?
            .join(destination)
    };
    absolute
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ArchiveError::destination_unwritable(destination, "no parent directory"))
}

/// Creates the destination directory (0755) when it is missing.
fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    info!(dir = %dir.display(), "Output directory does not exist, creating it");

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder
        .create(dir)
        .map_err(|err| ArchiveError::destination_unwritable(dir, format!("cannot create directory: {err}")))
}

/// Proves the directory is writable by creating and removing a scratch file.
fn check_writable(dir: &Path) -> Result<()> {
    tempfile::Builder::new()
        .prefix(".gzbackup-check-")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|err| ArchiveError::destination_unwritable(dir, err.to_string()))
}
