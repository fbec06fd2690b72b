//! `PostgreSQL` query source.
//!
//! The query runs once. Rows are converted to JSON objects by the server
//! (`row_to_json`) and streamed by a producer task into a bounded channel, so
//! at most `prefetch` rows are held in memory ahead of the pipeline.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::QuerySourceConfig;
use crate::error::{Error, Result};
use crate::source::{ProgressTracker, Record, Source};

/// Streams the rows of one SQL query.
pub struct QuerySource {
    pool: PgPool,
    rows: mpsc::Receiver<Result<Record>>,
    producer: Option<JoinHandle<()>>,
    total: Option<u64>,
    tracker: Arc<ProgressTracker>,
    finished: bool,
}

impl QuerySource {
    /// Connects, optionally counts the result set, and starts streaming.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Read`] if the connection or the count query fails.
    pub async fn open(config: QuerySourceConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Read(format!("failed to connect to database: {}", e)))?;

        let total = if config.count_total {
            let count: i64 = sqlx::query_scalar(&count_sql(&config.query))
                .fetch_one(&pool)
                .await
                .map_err(|e| Error::Read(format!("count query failed: {}", e)))?;
            let total = u64::try_from(count).unwrap_or(0);
            info!("Query source: {} rows to push", total);
            Some(total)
        } else {
            None
        };

        let (tx, rows) = mpsc::channel(config.prefetch.max(1));
        let producer = tokio::spawn(stream_rows(pool.clone(), rows_sql(&config.query), tx));

        Ok(Self {
            pool,
            rows,
            producer: Some(producer),
            total,
            tracker: Arc::new(ProgressTracker::new()),
            finished: false,
        })
    }

    fn percent_after(&self, count: u64) -> f32 {
        match self.total {
            Some(total) if total > 0 => (count as f64 / total as f64 * 100.0) as f32,
            _ => 0.0,
        }
    }
}

/// Forwards query rows into the channel until the stream ends, the first
/// error is sent, or the receiver is dropped.
async fn stream_rows(pool: PgPool, sql: String, tx: mpsc::Sender<Result<Record>>) {
    let mut rows = sqlx::query_scalar::<_, Json<Value>>(&sql).fetch(&pool);

    while let Some(row) = rows.next().await {
        let item = match row {
            Ok(Json(Value::Object(map))) => Ok(map),
            Ok(Json(other)) => Err(Error::Read(format!(
                "query row is not a JSON object: {}",
                other
            ))),
            Err(e) => Err(Error::Read(format!("query failed: {}", e))),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
    debug!("Query producer finished");
}

fn trim_query(query: &str) -> &str {
    query.trim().trim_end_matches(';').trim_end()
}

/// Wraps a query so each row comes back as one JSON object.
///
/// The outer query is a bare projection over the subquery: no join, sort,
/// grouping or filter. PostgreSQL then emits rows in the subquery's order, so
/// an `ORDER BY` in the user query decides the publish order. SQL itself does
/// not promise this for subqueries; a query without `ORDER BY` has no defined
/// order at all.
pub(crate) fn rows_sql(query: &str) -> String {
    format!("SELECT row_to_json(src) FROM ({}) AS src", trim_query(query))
}

/// Wraps a query to count its rows.
pub(crate) fn count_sql(query: &str) -> String {
    format!("SELECT count(*) FROM ({}) AS src", trim_query(query))
}

#[async_trait]
impl Source for QuerySource {
    fn source_type(&self) -> &'static str {
        "postgres_query"
    }

    async fn next(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        match self.rows.recv().await {
            Some(Ok(record)) => {
                let count = self.tracker.snapshot().count + 1;
                self.tracker.record_row(self.percent_after(count));
                Ok(Some(record))
            }
            Some(Err(e)) => Err(e),
            None => {
                if let Some(producer) = self.producer.take() {
                    producer
                        .await
                        .map_err(|e| Error::Read(format!("query producer failed: {}", e)))?;
                }
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
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.rows.close();
        self.pool.close().await;
        Ok(())
    }
}
