//! Record sources.
//!
//! A [`Source`] yields records one at a time in origin order and keeps a pair
//! of progress counters that other tasks may sample while it is being read.

pub mod file;
#[cfg(feature = "postgres")]
pub mod query;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::SourceSelector;
use crate::error::Result;

/// One unit of data moving through the pipeline.
///
/// Keys are kept sorted, so the JSON encoding of a record is canonical.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A consistent view of a source's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    /// Records yielded so far.
    pub count: u64,
    /// Approximate completion in `[0, 100]`.
    pub percent: f32,
}

/// Thread-safe progress counters owned by a source.
///
/// Both values are updated under one lock, so a reader never observes a count
/// from one row paired with the percentage of another.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: Mutex<Progress>,
}

impl ProgressTracker {
    /// Creates a tracker at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one yielded row and the new completion estimate.
    ///
    /// The percentage is clamped to `[0, 100]` and never moves backwards.
    pub fn record_row(&self, percent: f32) {
        let mut progress = self.inner.lock();
        progress.count += 1;
        progress.percent = clamp_percent(percent).max(progress.percent);
    }

    /// Marks the origin as exhausted.
    pub fn finish(&self) {
        self.inner.lock().percent = 100.0;
    }

    /// Returns the latest committed counters.
    #[must_use]
    pub fn snapshot(&self) -> Progress {
        *self.inner.lock()
    }
}

fn clamp_percent(percent: f32) -> f32 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Trait for record sources.
///
/// Implement this trait to add support for a new origin.
#[async_trait]
pub trait Source: Send {
    /// Get the source type name.
    fn source_type(&self) -> &'static str;

    /// Returns the next record, or `None` once the origin is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Read`] on malformed input or I/O failure.
    /// The error is terminal for the run.
    async fn next(&mut self) -> Result<Option<Record>>;

    /// Shared handle to this source's counters.
    fn tracker(&self) -> Arc<ProgressTracker>;

    /// Latest committed counters. Never blocks on I/O.
    fn progress(&self) -> Progress {
        self.tracker().snapshot()
    }

    /// Close the source and release its resources.
    async fn close(&mut self) -> Result<()>;
}

/// Opens the source named by a validated selector.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, the query cannot be
/// started, or the selected source type is not compiled in.
pub async fn open_source(selector: &SourceSelector) -> Result<Box<dyn Source>> {
    match selector {
        SourceSelector::File(cfg) => Ok(Box::new(file::FileSource::open(cfg.clone())?)),
        #[cfg(feature = "postgres")]
        SourceSelector::Query(cfg) => Ok(Box::new(query::QuerySource::open(cfg.clone()).await?)),
        #[cfg(not(feature = "postgres"))]
        SourceSelector::Query(_) => Err(crate::error::Error::Config(
            "db source requires the `postgres` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_rows() {
        let tracker = ProgressTracker::new();
        tracker.record_row(10.0);
        tracker.record_row(20.0);

        let progress = tracker.snapshot();
        assert_eq!(progress.count, 2);
        assert!((progress.percent - 20.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_tracker_percent_is_clamped_and_monotonic() {
        let tracker = ProgressTracker::new();
        tracker.record_row(150.0);
        assert!((tracker.snapshot().percent - 100.0).abs() < f32::EPSILON);

        let tracker = ProgressTracker::new();
        tracker.record_row(40.0);
        tracker.record_row(30.0);
        tracker.record_row(f32::NAN);
        assert!((tracker.snapshot().percent - 40.0).abs() < f32::EPSILON);
        assert_eq!(tracker.snapshot().count, 3);
    }

    #[test]
    fn test_tracker_finish() {
        let tracker = ProgressTracker::new();
        tracker.finish();
        assert_eq!(
            tracker.snapshot(),
            Progress {
                count: 0,
                percent: 100.0
            }
        );
    }

    #[test]
    fn test_tracker_concurrent_reads_never_decrease() {
        let tracker = Arc::new(ProgressTracker::new());
        let writer = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    tracker.record_row(i as f32 / 100.0);
                }
            })
        };

        let mut last = Progress::default();
        for _ in 0..1_000 {
            let current = tracker.snapshot();
            assert!(current.count >= last.count);
            assert!(current.percent >= last.percent);
            assert!((0.0..=100.0).contains(&current.percent));
            last = current;
        }
        writer.join().unwrap();
        assert_eq!(tracker.snapshot().count, 10_000);
    }
}
