//! Push pipeline orchestration.
//!
//! The driver pulls one record at a time from the source, runs it through the
//! optional transformer and publishes it before reading the next one. The
//! first error of any stage ends the run; the source is closed exactly once on
//! every exit path.

use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::config::PushConfig;
use crate::error::{Error, Result};
use crate::progress::{ProgressReporter, DEFAULT_INTERVAL, MIN_INTERVAL};
use crate::publish::{AmqpPublisher, DryRunPublisher, Publisher};
use crate::source::{open_source, Source};
use crate::transform::{ScriptTransformer, Transformer};

/// Push statistics.
#[derive(Debug, Default, Clone)]
pub struct PushStats {
    /// Records read from the source.
    pub read: u64,
    /// Records the broker accepted.
    pub published: u64,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl PushStats {
    /// Calculate throughput (records per second).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.published as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The source was exhausted and every record was published.
    Succeeded,
    /// A stage failed and the run stopped.
    Failed,
}

/// Outcome of a run.
#[derive(Debug)]
pub struct RunReport {
    /// Counters at the time the run ended.
    pub stats: PushStats,
    /// The error that ended the run, if any.
    pub error: Option<Error>,
}

impl RunReport {
    /// Terminal state of the run.
    #[must_use]
    pub fn state(&self) -> RunState {
        if self.error.is_some() {
            RunState::Failed
        } else {
            RunState::Succeeded
        }
    }

    /// Whether the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the report into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run.
    pub fn into_result(self) -> Result<PushStats> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }
}

/// Push pipeline.
pub struct Pipeline {
    source: Box<dyn Source>,
    transformer: Option<Box<dyn Transformer>>,
    publisher: Box<dyn Publisher>,
    progress_interval: Duration,
}

impl Pipeline {
    /// Sets up a pipeline from configuration.
    ///
    /// The transformer is compiled and the publisher connected before the
    /// source is opened, so nothing fallible happens once the source exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the script cannot be
    /// loaded, the broker is unreachable, or the source cannot be opened.
    pub async fn start(config: PushConfig) -> Result<Self> {
        config.validate()?;
        let selector = config.source.resolve()?;

        let transformer = match &config.script {
            Some(script) => Some(Box::new(ScriptTransformer::from_file(&script.path)?) as Box<dyn Transformer>),
            None => None,
        };

        let mut publisher: Box<dyn Publisher> = if config.options.dry_run {
            info!("Dry run mode - printing payloads instead of publishing");
            Box::new(DryRunPublisher::new())
        } else {
            Box::new(AmqpPublisher::connect(&config.target).await?)
        };

        let source = match open_source(&selector).await {
            Ok(source) => source,
            Err(e) => {
                if let Err(close_err) = publisher.close().await {
                    error!("closing publisher: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(Self::from_parts(source, transformer, publisher)
            .with_progress_interval(Duration::from_secs(config.options.progress_interval_secs)))
    }

    /// Assembles a pipeline from already constructed parts.
    #[must_use]
    pub fn from_parts(
        source: Box<dyn Source>,
        transformer: Option<Box<dyn Transformer>>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            source,
            transformer,
            publisher,
            progress_interval: DEFAULT_INTERVAL,
        }
    }

    /// Sets the progress reporting interval, raised to at least
    /// [`MIN_INTERVAL`].
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Progress reporting interval in effect.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Run the pipeline to completion or first error.
    pub async fn run(mut self) -> RunReport {
        let started = Instant::now();
        let mut stats = PushStats::default();
        let reporter = ProgressReporter::start(self.source.tracker(), self.progress_interval);

        info!("Starting push from {} source", self.source.source_type());

        let outcome = self.pump(&mut stats).await;
        reporter.stop();

        if let Err(e) = &outcome {
            error!("{} failed: {}", e.stage(), e);
        }

        if let Err(e) = self.source.close().await {
            error!("closing source: {}", e);
        }
        if let Err(e) = self.publisher.close().await {
            error!("closing publisher: {}", e);
        }

        let elapsed = started.elapsed();
        stats.duration_secs = elapsed.as_secs_f64();
        info!(
            "total processed rows {}, elapsed time: {:?}",
            stats.published, elapsed
        );
        if outcome.is_ok() {
            info!("successfully finished");
        }

        RunReport {
            stats,
            error: outcome.err(),
        }
    }

    async fn pump(&mut self, stats: &mut PushStats) -> Result<()> {
        while let Some(record) = self.source.next().await? {
            stats.read += 1;

            let record = match &self.transformer {
                Some(transformer) => transformer.apply(record)?,
                None => record,
            };

            self.publisher.publish(&record).await?;
            stats.published += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_stats_throughput() {
        let stats = PushStats {
            read: 1000,
            published: 1000,
            duration_secs: 2.0,
        };

        assert!((stats.throughput() - 500.0).abs() < 0.001);
    }

    #[test]
    fn test_push_stats_zero_duration() {
        let stats = PushStats::default();
        assert_eq!(stats.throughput(), 0.0);
    }

    #[test]
    fn test_report_state() {
        let ok = RunReport {
            stats: PushStats::default(),
            error: None,
        };
        assert_eq!(ok.state(), RunState::Succeeded);
        assert!(ok.into_result().is_ok());

        let failed = RunReport {
            stats: PushStats::default(),
            error: Some(Error::Read("bad row".to_string())),
        };
        assert_eq!(failed.state(), RunState::Failed);
        assert!(matches!(failed.into_result(), Err(Error::Read(_))));
    }
}
