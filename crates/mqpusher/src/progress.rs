//! Periodic progress reporting.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::source::{Progress, ProgressTracker};

/// Default reporting interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest accepted interval. Zero is raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Background task that logs how many rows were read since its last tick.
///
/// It only reads the source's counters. Dropping the reporter stops it.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Starts reporting on `tracker` every `interval`.
    #[must_use]
    pub fn start(tracker: Arc<ProgressTracker>, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            let mut last_count = 0;
            loop {
                ticker.tick().await;
                let progress = tracker.snapshot();
                info!("{}", progress_line(progress, last_count, interval));
                last_count = progress.count;
            }
        });

        Self { handle }
    }

    /// Stops the reporter.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Formats one progress line from a sample and the previous count.
#[must_use]
pub fn progress_line(progress: Progress, last_count: u64, interval: Duration) -> String {
    format!(
        "processed {} rows in {:?}; approximately {:.2}% done",
        progress.count.saturating_sub(last_count),
        interval,
        progress.percent
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_reports_delta() {
        let line = progress_line(
            Progress {
                count: 1_500,
                percent: 42.5,
            },
            1_000,
            Duration::from_secs(30),
        );
        assert_eq!(line, "processed 500 rows in 30s; approximately 42.50% done");
    }

    #[test]
    fn test_progress_line_never_negative() {
        let line = progress_line(Progress::default(), 10, Duration::from_secs(1));
        assert!(line.starts_with("processed 0 rows"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_to_minimum() {
        let tracker = Arc::new(ProgressTracker::new());
        let reporter = ProgressReporter::start(tracker, Duration::ZERO);

        tokio::time::sleep(MIN_INTERVAL * 3).await;

        assert!(!reporter.handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_drop() {
        let tracker = Arc::new(ProgressTracker::new());
        let reporter = ProgressReporter::start(Arc::clone(&tracker), Duration::from_secs(30));
        tracker.record_row(50.0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(Arc::strong_count(&tracker), 2);

        reporter.stop();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
