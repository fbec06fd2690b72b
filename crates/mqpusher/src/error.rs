//! Error types for mqpusher.
//!
//! Each pipeline stage has its own variant so that a failed run can report
//! exactly where it stopped.

use thiserror::Error;

/// Result type alias for mqpusher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running a push.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing, ambiguous or invalid configuration. Fatal before the run starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The source could not produce the next record.
    #[error("read error: {0}")]
    Read(String),

    /// The transformation script failed or returned something that is not a map.
    #[error("transform error: {0}")]
    Transform(String),

    /// The record could not be serialized or the broker rejected it.
    #[error("publish error: {0}")]
    Publish(String),

    /// Releasing a resource failed. Logged, never escalated.
    #[error("close error: {0}")]
    Close(String),

    /// IO error while loading configuration or scripts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Name of the pipeline stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Io(_) | Self::Yaml(_) => "configuration",
            Self::Read(_) => "reading",
            Self::Transform(_) => "transforming",
            Self::Publish(_) => "publishing",
            Self::Close(_) => "closing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Error::Config("x".into()).stage(), "configuration");
        assert_eq!(Error::Read("x".into()).stage(), "reading");
        assert_eq!(Error::Transform("x".into()).stage(), "transforming");
        assert_eq!(Error::Publish("x".into()).stage(), "publishing");
        assert_eq!(Error::Close("x".into()).stage(), "closing");
    }

    #[test]
    fn test_io_error_is_configuration_stage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.stage(), "configuration");
        assert!(err.to_string().contains("missing"));
    }
}
