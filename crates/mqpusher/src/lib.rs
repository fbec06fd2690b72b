//! # mqpusher
//!
//! `mqpusher` is a CLI tool and library for one-shot data migrations into
//! RabbitMQ: it reads rows from a flat file or a SQL query, optionally rewrites
//! each row with a Rhai script, and publishes every row as one persistent JSON
//! message.
//!
//! ## Supported Sources
//!
//! | Source | Notes |
//! |--------|-------|
//! | CSV file | Header row maps columns to fields, `.gz` decompressed on the fly |
//! | JSON Lines file | One object per line, `.gz` supported |
//! | `PostgreSQL` query | Requires the `postgres` feature (default) |
//!
//! ## Quick Start
//!
//! ```bash
//! mqpusher --config config.yaml
//!
//! # Override the file source and script from the command line
//! mqpusher --config config.yaml --csv-file users.csv.gz --script scrub.rhai
//!
//! # Print payloads instead of publishing
//! mqpusher --config config.yaml --dry-run
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   file:
//!     path: ./users.csv.gz
//!
//! script:
//!   path: ./scrub.rhai
//!
//! target:
//!   rabbit:
//!     host: localhost
//!     port: 5672
//!     user: guest
//!     password: guest
//!   publisher:
//!     routing_key: users
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod publish;
pub mod source;
pub mod transform;

pub use config::{PushConfig, PushOptions, SourceConfig, SourceSelector};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PushStats, RunReport, RunState};
pub use publish::{AmqpPublisher, DryRunPublisher, Publisher};
pub use source::{open_source, Progress, ProgressTracker, Record, Source};
pub use transform::{ScriptTransformer, Transformer};
