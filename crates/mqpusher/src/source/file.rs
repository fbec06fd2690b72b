//! Flat file source: CSV or JSON Lines, optionally gzip-compressed.

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::source::{ProgressTracker, Record, Source};

/// Highest percentage reported before end-of-file is actually reached.
///
/// Decoders buffer ahead of the rows they yield, so consumed bytes can hit the
/// file size while rows are still pending.
const MAX_ESTIMATE: f32 = 99.9;

/// Configuration for a flat file source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    /// Path to the file.
    pub path: PathBuf,
    /// Row format.
    #[serde(default)]
    pub format: FileFormat,
    /// Compression. `auto` picks gzip for `.gz` files.
    #[serde(default)]
    pub compression: Compression,
    /// CSV delimiter character.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Whether the CSV file has a header row. Without one, fields are `col_0`, `col_1`, ...
    #[serde(default = "default_has_header")]
    pub has_header: bool,
    /// Turn CSV cells that look like integers, floats or booleans into JSON scalars.
    #[serde(default)]
    pub infer_types: bool,
}

impl FileSourceConfig {
    /// CSV defaults for the given path.
    #[must_use]
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: FileFormat::Csv,
            compression: Compression::Auto,
            delimiter: default_delimiter(),
            has_header: default_has_header(),
            infer_types: false,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_has_header() -> bool {
    true
}

/// Row format of a flat file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Delimited text with an optional header row.
    #[default]
    Csv,
    /// One JSON object per line.
    #[serde(alias = "ndjson")]
    Jsonl,
}

/// Compression of a flat file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Detect from the file extension.
    #[default]
    Auto,
    /// Plain file.
    None,
    /// Gzip stream.
    Gzip,
}

impl Compression {
    /// Resolves `Auto` against a path.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => {
                let is_gzip = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
                if is_gzip {
                    Self::Gzip
                } else {
                    Self::None
                }
            }
            other => other,
        }
    }
}

/// Counts bytes pulled from the underlying file.
struct CountingReader<R> {
    inner: R,
    bytes: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

type BoxedRead = Box<dyn Read + Send>;

enum Decoder {
    Csv {
        reader: csv::Reader<BoxedRead>,
        headers: Option<Vec<String>>,
        row: csv::StringRecord,
    },
    JsonLines {
        reader: BufReader<BoxedRead>,
        line: String,
        line_no: u64,
    },
}

/// Reads a flat file row by row.
pub struct FileSource {
    config: FileSourceConfig,
    decoder: Option<Decoder>,
    bytes_read: Arc<AtomicU64>,
    file_size: u64,
    tracker: Arc<ProgressTracker>,
    finished: bool,
}

impl FileSource {
    /// Opens the file and prepares the decoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, the delimiter is not a
    /// single ASCII character, or the CSV header cannot be read.
    pub fn open(config: FileSourceConfig) -> Result<Self> {
        if !config.delimiter.is_ascii() {
            return Err(Error::Config(format!(
                "delimiter '{}' must be a single ASCII character",
                config.delimiter
            )));
        }

        let file = File::open(&config.path).map_err(|e| {
            Error::Read(format!(
                "failed to open file '{}': {}",
                config.path.display(),
                e
            ))
        })?;
        let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let bytes_read = Arc::new(AtomicU64::new(0));
        let counting = CountingReader {
            inner: file,
            bytes: Arc::clone(&bytes_read),
        };
        let compression = config.compression.resolve(&config.path);
        let raw: BoxedRead = match compression {
            Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(counting))),
            Compression::None | Compression::Auto => Box::new(counting),
        };

        let decoder = match config.format {
            FileFormat::Csv => {
                let mut reader = csv::ReaderBuilder::new()
                    .delimiter(config.delimiter as u8)
                    .has_headers(config.has_header)
                    .trim(csv::Trim::Headers)
                    .from_reader(raw);
                let headers = if config.has_header {
                    let headers = reader
                        .headers()
                        .map_err(|e| Error::Read(format!("failed to read CSV header: {}", e)))?;
                    Some(headers.iter().map(str::to_string).collect())
                } else {
                    None
                };
                Decoder::Csv {
                    reader,
                    headers,
                    row: csv::StringRecord::new(),
                }
            }
            FileFormat::Jsonl => Decoder::JsonLines {
                reader: BufReader::with_capacity(128 * 1024, raw),
                line: String::new(),
                line_no: 0,
            },
        };

        debug!(
            path = %config.path.display(),
            format = ?config.format,
            compression = ?compression,
            file_size,
            "Opened file source"
        );

        Ok(Self {
            config,
            decoder: Some(decoder),
            bytes_read,
            file_size,
            tracker: Arc::new(ProgressTracker::new()),
            finished: false,
        })
    }

    fn estimate_percent(&self) -> f32 {
        if self.file_size == 0 {
            return 0.0;
        }
        let read = self.bytes_read.load(Ordering::Relaxed) as f64;
        let percent = (read / self.file_size as f64 * 100.0) as f32;
        percent.min(MAX_ESTIMATE)
    }

    fn read_row(&mut self) -> Result<Option<Record>> {
        let infer_types = self.config.infer_types;
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(Error::Read("file source is closed".to_string()));
        };

        match decoder {
            Decoder::Csv {
                reader,
                headers,
                row,
            } => {
                let has_row = reader
                    .read_record(row)
                    .map_err(|e| Error::Read(format!("failed to read CSV row: {}", e)))?;
                if !has_row {
                    return Ok(None);
                }
                let headers =
                    headers.get_or_insert_with(|| (0..row.len()).map(|i| format!("col_{}", i)).collect());
                Ok(Some(csv_row_to_record(headers, row, infer_types)))
            }
            Decoder::JsonLines {
                reader,
                line,
                line_no,
            } => loop {
                line.clear();
                let n = reader
                    .read_line(line)
                    .map_err(|e| Error::Read(format!("failed to read line: {}", e)))?;
                if n == 0 {
                    return Ok(None);
                }
                *line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                return match serde_json::from_str::<Value>(line) {
                    Ok(Value::Object(map)) => Ok(Some(map)),
                    Ok(_) => Err(Error::Read(format!(
                        "line {} is not a JSON object",
                        line_no
                    ))),
                    Err(e) => Err(Error::Read(format!(
                        "invalid JSON on line {}: {}",
                        line_no, e
                    ))),
                };
            },
        }
    }
}

/// Maps a CSV row onto header names.
fn csv_row_to_record(headers: &[String], row: &csv::StringRecord, infer_types: bool) -> Record {
    let mut record = Record::new();
    for (idx, header) in headers.iter().enumerate() {
        let cell = row.get(idx).unwrap_or_default();
        let value = if infer_types {
            infer_value(cell)
        } else {
            Value::String(cell.to_string())
        };
        record.insert(header.clone(), value);
    }
    record
}

/// Parses a CSV cell into the narrowest JSON scalar.
fn infer_value(cell: &str) -> Value {
    if let Ok(n) = cell.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if let Ok(b) = cell.parse::<bool>() {
        return Value::Bool(b);
    }
    Value::String(cell.to_string())
}

#[async_trait]
impl Source for FileSource {
    fn source_type(&self) -> &'static str {
        match self.config.format {
            FileFormat::Csv => "csv_file",
            FileFormat::Jsonl => "jsonl_file",
        }
    }

    async fn next(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        match self.read_row()? {
            Some(record) => {
                self.tracker.record_row(self.estimate_percent());
                Ok(Some(record))
            }
            None => {
                self.finished = true;
                self.tracker.finish();
                Ok(None)
            }
        }
    }

    fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    async fn close(&mut self) -> Result<()> {
        if self.decoder.take().is_some() {
            debug!(path = %self.config.path.display(), "Closed file source");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
