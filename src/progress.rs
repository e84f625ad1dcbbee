use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atty::Stream;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

pub fn progress_allowed(no_progress: bool) -> bool {
    !no_progress && atty::is(Stream::Stderr)
}

/// Cheap to clone; a disabled reporter still counts so the job report
/// has totals either way.
#[derive(Clone)]
pub struct ProgressReporter {
    counters: Arc<Counters>,
    bar: Option<ProgressBar>,
}

#[derive(Default)]
struct Counters {
    entries: AtomicU64,
    bytes: AtomicU64,
    finished: AtomicBool,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        let bar = enabled.then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{prefix:.bold} {spinner} {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar.set_prefix(label.into());
            bar
        });
        let reporter = Self {
            counters: Arc::new(Counters::default()),
            bar,
        };
        reporter.update_message();
        reporter
    }

    #[cfg(test)]
    pub fn hidden() -> Self {
        Self::new("", false)
    }

    pub fn record_entry(&self) {
        self.counters.entries.fetch_add(1, Ordering::Relaxed);
        self.update_message();
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.update_message();
    }

    pub fn entries(&self) -> u64 {
        self.counters.entries.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.counters.bytes.load(Ordering::Relaxed)
    }

    pub fn finish_success(&self) {
        self.finish_with_status("done");
    }

    pub fn finish_error(&self) {
        self.finish_with_status("failed");
    }

    fn update_message(&self) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "{} entries - {}",
                self.entries(),
                HumanBytes(self.bytes())
            ));
        }
    }

    fn finish_with_status(&self, status: &str) {
        if self
            .counters
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Some(bar) = &self.bar {
            bar.finish_with_message(format!("{status} - {}", bar.message()));
        }
    }
}
