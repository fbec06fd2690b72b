//! Record publishing.
//!
//! Every record becomes one persistent `application/json` message.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::io::Write;
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::source::Record;

/// Content type of every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Encodes a record as its canonical JSON payload.
///
/// # Errors
///
/// Returns [`Error::Publish`] if a value cannot be serialized.
pub fn encode_payload(record: &Record) -> Result<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|e| Error::Publish(format!("failed to serialize record: {}", e)))
}

/// Trait for message publishers.
#[async_trait]
pub trait Publisher: Send {
    /// Publishes one record. Returns once the broker has accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Publish`] on serialization or broker failure.
    async fn publish(&mut self, record: &Record) -> Result<()>;

    /// Close the publisher and release its connection.
    async fn close(&mut self) -> Result<()>;
}

/// Publishes to a RabbitMQ exchange.
pub struct AmqpPublisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
    routing_key: String,
    confirm: bool,
    closed: bool,
}

impl AmqpPublisher {
    /// Connects to the broker and prepares the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Publish`] if the broker is unreachable or rejects the
    /// channel setup.
    pub async fn connect(target: &TargetConfig) -> Result<Self> {
        let uri = target.rabbit.uri();
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Publish(format!("failed to connect to broker: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Publish(format!("failed to open channel: {}", e)))?;

        let publisher = &target.publisher;
        if publisher.confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| Error::Publish(format!("failed to enable confirms: {}", e)))?;
        }
        if publisher.declare_queue {
            channel
                .queue_declare(
                    &publisher.routing_key,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    Error::Publish(format!(
                        "failed to declare queue '{}': {}",
                        publisher.routing_key, e
                    ))
                })?;
        }

        info!(
            "Connected to broker {}:{}, publishing to exchange '{}' with routing key '{}'",
            target.rabbit.host, target.rabbit.port, publisher.exchange, publisher.routing_key
        );

        Ok(Self {
            connection,
            channel,
            exchange: publisher.exchange.clone(),
            routing_key: publisher.routing_key.clone(),
            confirm: publisher.confirm,
            closed: false,
        })
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&mut self, record: &Record) -> Result<()> {
        let payload = encode_payload(record)?;
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT);
        let options = BasicPublishOptions {
            mandatory: self.confirm,
            ..Default::default()
        };

        let pending = self
            .channel
            .basic_publish(&self.exchange, &self.routing_key, options, &payload, properties)
            .await
            .map_err(|e| Error::Publish(format!("broker publish failed: {}", e)))?;

        let confirmation = pending
            .await
            .map_err(|e| Error::Publish(format!("broker confirm failed: {}", e)))?;
        match confirmation {
            Confirmation::Nack(_) => Err(Error::Publish("broker nacked the message".to_string())),
            Confirmation::Ack(Some(_)) => Err(Error::Publish(format!(
                "message returned as unroutable (exchange '{}', routing key '{}')",
                self.exchange, self.routing_key
            ))),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The broker may already have closed the channel; the connection is
        // closed regardless.
        let channel = self
            .channel
            .close(200, "OK")
            .await
            .map_err(|e| Error::Close(format!("failed to close channel: {}", e)));
        let connection = self
            .connection
            .close(200, "OK")
            .await
            .map_err(|e| Error::Close(format!("failed to close broker connection: {}", e)));
        debug!("Closed broker connection");
        first_error(channel, connection)
    }
}

/// Returns the first of two close results that failed.
fn first_error(first: Result<()>, second: Result<()>) -> Result<()> {
    first.and(second)
}

/// Writes each payload as one line instead of publishing it.
pub struct DryRunPublisher<W = std::io::Stdout> {
    out: W,
}

impl DryRunPublisher {
    /// Creates a dry-run publisher printing to stdout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl Default for DryRunPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> DryRunPublisher<W> {
    /// Creates a dry-run publisher writing to `out`.
    pub fn with_writer(out: W) -> Self {
        Self { out }
    }

    /// Consumes the publisher and returns its writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> Publisher for DryRunPublisher<W> {
    async fn publish(&mut self, record: &Record) -> Result<()> {
        let mut payload = encode_payload(record)?;
        payload.push(b'\n');
        self.out
            .write_all(&payload)
            .map_err(|e| Error::Publish(format!("failed to write payload: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| Error::Close(format!("failed to flush output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn test_encode_payload_is_canonical_json() {
        let payload = encode_payload(&record(json!({"b": 2, "a": [true, null]}))).unwrap();
        assert_eq!(payload, br#"{"a":[true,null],"b":2}"#);
    }

    #[test]
    fn test_encode_payload_round_trips_fields() {
        let input = record(json!({"id": 1, "name": "x", "nested": {"k": 1.5}}));
        let payload = encode_payload(&input).unwrap();
        let decoded: Record = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_close_reports_first_failure() {
        let channel = Err(Error::Close("channel already closed".to_string()));
        let connection = Err(Error::Close("connection reset".to_string()));
        let err = first_error(channel, connection).unwrap_err();
        assert!(err.to_string().contains("channel already closed"));

        let err = first_error(Ok(()), Err(Error::Close("connection reset".to_string())))
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        assert!(first_error(Ok(()), Ok(())).is_ok());
    }

    #[test]
    fn test_dry_run_writes_one_line_per_record() {
        let mut publisher = DryRunPublisher::with_writer(Vec::new());

        tokio_test::block_on(async {
            publisher.publish(&record(json!({"id": 1}))).await.unwrap();
            publisher.publish(&record(json!({"id": 2}))).await.unwrap();
            publisher.close().await.unwrap();
        });

        let out = String::from_utf8(publisher.into_inner()).unwrap();
        assert_eq!(out, "{\"id\":1}\n{\"id\":2}\n");
    }
}
