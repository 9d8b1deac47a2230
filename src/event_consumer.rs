use crate::config::EventQueueConfig;
use crate::metadata_store::{format_last_modified, MetadataStore};
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client as SqsClient;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// S3 event notification body delivered through SQS, reduced to the
/// fields ingestion needs.
#[derive(Debug, Deserialize)]
pub struct S3EventNotification {
    #[serde(default, rename = "Records")]
    pub records: Vec<S3EventRecord>,
}

/// One object-created record inside a notification.
#[derive(Debug, Deserialize)]
pub struct S3EventRecord {
    #[serde(default, rename = "eventTime")]
    pub event_time: String,
    #[serde(default)]
    pub s3: S3Entity,
}

#[derive(Debug, Default, Deserialize)]
pub struct S3Entity {
    #[serde(default)]
    pub object: S3ObjectRef,
}

#[derive(Debug, Default, Deserialize)]
pub struct S3ObjectRef {
    #[serde(default)]
    pub key: String,
}

/// Per-record ingestion outcome, ordered best to worst. A notification
/// batch reports the maximum across its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordOutcome {
    /// Record upserted into the metadata table.
    Stored,
    /// Record skipped: no object key or unparsable event time.
    Malformed,
    /// The metadata store write failed.
    Failed,
}

/// SQS consumer upserting an image record per S3 object-created event
pub struct S3EventConsumer {
    client: SqsClient,
    queue_url: String,
    wait_time_secs: i32,
    max_messages: i32,
    metadata_store: Arc<MetadataStore>,
}

impl S3EventConsumer {
    /// Create a new consumer for the configured event queue
    pub async fn new(config: &EventQueueConfig, metadata_store: Arc<MetadataStore>) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint_url) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let aws_config = loader.load().await;
        let client = SqsClient::new(&aws_config);

        info!(queue_url = %config.queue_url, "S3 event consumer initialized");

        Ok(Self {
            client,
            queue_url: config.queue_url.clone(),
            wait_time_secs: config.wait_time_secs as i32,
            max_messages: config.max_messages as i32,
            metadata_store,
        })
    }

    /// Long-poll the queue until the task is aborted.
    pub async fn run(&self) -> Result<()> {
        info!(queue_url = %self.queue_url, "Starting S3 event consumer");

        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %format!("{e:#}"), "SQS polling request failed");
                metrics::counter!("catalog.events.poll_errors").increment(1);
                tokio::time::sleep(Duration::from_secs(self.wait_time_secs as u64)).await;
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .wait_time_seconds(self.wait_time_secs)
            .max_number_of_messages(self.max_messages)
            .send()
            .await
            .context("failed to receive queue messages")?;

        for message in response.messages.unwrap_or_default() {
            // Messages are removed up front; a failed record surfaces in
            // logs and metrics, never through redelivery.
            if let Some(receipt) = message.receipt_handle() {
                if let Err(e) = self
                    .client
                    .delete_message()
                    .queue_url(&self.queue_url)
                    .receipt_handle(receipt)
                    .send()
                    .await
                {
                    warn!(error = %e, "Failed to delete queue message");
                }
            }

            self.handle_message(message.body.as_deref().unwrap_or_default())
                .await;
        }

        Ok(())
    }

    /// Process one notification body, isolating failures per record.
    #[instrument(skip(self, body))]
    async fn handle_message(&self, body: &str) {
        let notification: S3EventNotification = match serde_json::from_str(body) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, "Failed to deserialize S3 event notification");
                metrics::counter!("catalog.events.malformed").increment(1);
                return;
            }
        };

        if notification.records.is_empty() {
            warn!("S3 event notification carries no records");
            metrics::counter!("catalog.events.malformed").increment(1);
            return;
        }

        let mut worst = RecordOutcome::Stored;
        for record in &notification.records {
            let outcome = self.apply_record(record).await;
            worst = worst.max(outcome);
        }

        match worst {
            RecordOutcome::Stored => {
                debug!(
                    records = notification.records.len(),
                    "Processed S3 event notification"
                );
                metrics::counter!("catalog.events.processed").increment(1);
            }
            RecordOutcome::Malformed => {
                warn!(
                    records = notification.records.len(),
                    "Processed S3 event notification with malformed records"
                );
                metrics::counter!("catalog.events.malformed").increment(1);
            }
            RecordOutcome::Failed => {
                error!(
                    records = notification.records.len(),
                    "Failed to process S3 event notification"
                );
                metrics::counter!("catalog.events.failed").increment(1);
            }
        }
    }

    async fn apply_record(&self, record: &S3EventRecord) -> RecordOutcome {
        let Some((storage_key, last_modified)) = extract_object(record) else {
            warn!(
                key = %record.s3.object.key,
                event_time = %record.event_time,
                "Skipping malformed S3 event record"
            );
            return RecordOutcome::Malformed;
        };

        match self
            .metadata_store
            .upsert_by_storage_key(&storage_key, &last_modified)
            .await
        {
            Ok(()) => {
                metrics::counter!("catalog.records.upserted").increment(1);
                RecordOutcome::Stored
            }
            Err(e) => {
                error!(
                    key = %storage_key,
                    error = %format!("{e:#}"),
                    "Failed to upsert image record"
                );
                RecordOutcome::Failed
            }
        }
    }
}

/// Pull `(storage_key, last_modified)` out of one event record. `None`
/// when the object key is missing or the event time does not parse.
fn extract_object(record: &S3EventRecord) -> Option<(String, String)> {
    if record.s3.object.key.is_empty() {
        return None;
    }

    let event_time = DateTime::parse_from_rfc3339(&record.event_time).ok()?;
    Some((
        record.s3.object.key.clone(),
        format_last_modified(event_time.with_timezone(&Utc)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_record(key: &str, event_time: &str) -> S3EventRecord {
        S3EventRecord {
            event_time: event_time.to_string(),
            s3: S3Entity {
                object: S3ObjectRef {
                    key: key.to_string(),
                },
            },
        }
    }

    #[test]
    fn test_deserialize_s3_event_notification() {
        let json = r#"{
            "Records": [{
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "eventTime": "2024-05-30T03:40:35.123Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": {"name": "image-bucket"},
                    "object": {
                        "key": "images/2024/05/05-30-03-40-35.123-abc.png",
                        "size": 1024
                    }
                }
            }]
        }"#;

        let notification: S3EventNotification = serde_json::from_str(json).unwrap();
        assert_eq!(notification.records.len(), 1);
        assert_eq!(
            notification.records[0].s3.object.key,
            "images/2024/05/05-30-03-40-35.123-abc.png"
        );
        assert_eq!(notification.records[0].event_time, "2024-05-30T03:40:35.123Z");
    }

    #[test]
    fn test_extract_object_formats_event_time() {
        let record = event_record("images/a.png", "2024-05-30T03:40:35.123Z");

        let (key, last_modified) = extract_object(&record).unwrap();
        assert_eq!(key, "images/a.png");
        assert_eq!(last_modified, "2024/05/30 03:40:35.123");
    }

    #[test]
    fn test_extract_object_rejects_missing_key() {
        let record = event_record("", "2024-05-30T03:40:35.123Z");
        assert!(extract_object(&record).is_none());
    }

    #[test]
    fn test_extract_object_rejects_bad_timestamp() {
        let record = event_record("images/a.png", "yesterday-ish");
        assert!(extract_object(&record).is_none());

        let record = event_record("images/a.png", "");
        assert!(extract_object(&record).is_none());
    }

    #[test]
    fn test_batch_reports_worst_outcome() {
        let outcomes = [
            RecordOutcome::Stored,
            RecordOutcome::Failed,
            RecordOutcome::Malformed,
        ];

        let worst = outcomes.iter().copied().max().unwrap();
        assert_eq!(worst, RecordOutcome::Failed);

        assert!(RecordOutcome::Stored < RecordOutcome::Malformed);
        assert!(RecordOutcome::Malformed < RecordOutcome::Failed);
    }
}
