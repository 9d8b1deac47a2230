use crate::config::DynamoDbConfig;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, DeleteRequest, KeySchemaElement, KeyType,
    ProvisionedThroughput, ScalarAttributeType, TableStatus, WriteRequest,
};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_dynamo::{from_item, to_item, Item};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Hash key of the image table.
const KEY_ID: &str = "id";

/// Attribute holding the S3 key of the image object.
const ATTR_STORAGE_KEY: &str = "storage_key";

/// Attribute holding the conversion eligibility flag.
const ATTR_CONVERTIBLE: &str = "convertible";

/// Attribute holding the millisecond-precision modification timestamp.
const ATTR_LAST_MODIFIED: &str = "last_modified";

/// BatchWriteItem accepts at most 25 requests per call.
const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// How long to wait for a freshly created table to become active.
const CREATE_TABLE_WAIT_ATTEMPTS: usize = 30;

/// Timestamp layout used for `last_modified` values.
pub const LAST_MODIFIED_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

/// Render a timestamp in the catalog's `last_modified` layout.
pub fn format_last_modified(ts: DateTime<Utc>) -> String {
    ts.format(LAST_MODIFIED_FORMAT).to_string()
}

/// Whether an image has been evaluated as eligible for format conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertibleState {
    /// Not yet evaluated.
    #[default]
    Undetermined,
    /// Eligible for conversion.
    Enabled,
    /// Evaluated and rejected.
    Invalid,
}

impl ConvertibleState {
    /// Case-insensitive name match; `None` for unrecognized names.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "undetermined" => Some(Self::Undetermined),
            "enabled" => Some(Self::Enabled),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::Enabled => "enabled",
            Self::Invalid => "invalid",
        }
    }
}

// Stored values outside the known set must not fail a whole table scan,
// so reads fall back to the undetermined state. API input is parsed
// strictly through `parse` instead.
impl<'de> Deserialize<'de> for ConvertibleState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name).unwrap_or_default())
    }
}

/// One image known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Stable identifier, assigned once at first discovery.
    pub id: String,
    /// S3 key of the image object. Unique across live records.
    pub storage_key: String,
    /// Millisecond-precision timestamp, `YYYY/MM/DD HH:MM:SS.mmm`.
    #[serde(default)]
    pub last_modified: String,
    /// Conversion eligibility flag.
    #[serde(default)]
    pub convertible: ConvertibleState,
}

impl ImageRecord {
    /// Create a record for a newly discovered storage key.
    pub fn new(storage_key: String, last_modified: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            storage_key,
            last_modified,
            convertible: ConvertibleState::default(),
        }
    }
}

/// Metadata store for image records in DynamoDB
pub struct MetadataStore {
    client: DynamoDbClient,
    table_name: String,
}

impl MetadataStore {
    /// Create a new metadata store
    pub async fn new(config: &DynamoDbConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint_url) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let aws_config = loader.load().await;
        let client = DynamoDbClient::new(&aws_config);

        info!(
            table = %config.table_name,
            region = %config.region,
            "Metadata store initialized"
        );

        Ok(Self {
            client,
            table_name: config.table_name.clone(),
        })
    }

    /// Create the image table if it does not exist yet.
    #[instrument(skip(self))]
    pub async fn ensure_table(&self) -> Result<()> {
        if self.table_exists().await? {
            return Ok(());
        }

        self.client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(KEY_ID)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .context("invalid attribute definition")?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(KEY_ID)
                    .key_type(KeyType::Hash)
                    .build()
                    .context("invalid key schema")?,
            )
            .provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(5)
                    .write_capacity_units(5)
                    .build()
                    .context("invalid provisioned throughput")?,
            )
            .send()
            .await
            .context("failed to create image table")?;

        self.wait_until_active().await?;

        info!(table = %self.table_name, "Created image table");
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        let mut names = self.client.list_tables().into_paginator().items().send();

        while let Some(name) = names.next().await {
            if name.context("failed to list tables")? == self.table_name {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn wait_until_active(&self) -> Result<()> {
        for _ in 0..CREATE_TABLE_WAIT_ATTEMPTS {
            let described = self
                .client
                .describe_table()
                .table_name(&self.table_name)
                .send()
                .await
                .context("failed to describe image table")?;

            let active = described
                .table()
                .and_then(|table| table.table_status())
                .is_some_and(|status| *status == TableStatus::Active);

            if active {
                return Ok(());
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        anyhow::bail!("image table {} did not become active", self.table_name)
    }

    /// Fetch every image record in the table.
    #[instrument(skip(self))]
    pub async fn scan_records(&self) -> Result<Vec<ImageRecord>> {
        let mut records = Vec::new();
        let mut items = self
            .client
            .scan()
            .table_name(&self.table_name)
            .into_paginator()
            .items()
            .send();

        while let Some(item) = items.next().await {
            let item = item.context("failed to scan image table")?;
            let record: ImageRecord =
                from_item(item).context("failed to deserialize image record")?;
            records.push(record);
        }

        debug!(count = records.len(), "Scanned image records");
        Ok(records)
    }

    /// Fetch one record by id.
    pub async fn get_record(&self, id: &str) -> Result<Option<ImageRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ID, AttributeValue::S(id.to_owned()))
            .send()
            .await
            .context("failed to get image record")?;

        match output.item {
            Some(item) => Ok(Some(
                from_item(item).context("failed to deserialize image record")?,
            )),
            None => Ok(None),
        }
    }

    /// Find the record holding a given storage key, if any.
    ///
    /// The table is keyed by id only, so this is a filtered scan.
    #[instrument(skip(self))]
    pub async fn find_by_storage_key(&self, storage_key: &str) -> Result<Option<ImageRecord>> {
        let mut items = self
            .client
            .scan()
            .table_name(&self.table_name)
            .filter_expression("#key = :key")
            .expression_attribute_names("#key", ATTR_STORAGE_KEY)
            .expression_attribute_values(":key", AttributeValue::S(storage_key.to_owned()))
            .into_paginator()
            .items()
            .send();

        while let Some(item) = items.next().await {
            let item = item.context("failed to scan image table")?;
            return Ok(Some(
                from_item(item).context("failed to deserialize image record")?,
            ));
        }

        Ok(None)
    }

    /// Insert a record.
    pub async fn put_record(&self, record: &ImageRecord) -> Result<()> {
        let item: Item = to_item(record).context("failed to serialize image record")?;

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item.into()))
            .send()
            .await
            .context("failed to put image record")?;

        Ok(())
    }

    /// Update the conversion flag of a single record, leaving every other
    /// attribute untouched.
    #[instrument(skip(self))]
    pub async fn update_convertible(&self, id: &str, state: ConvertibleState) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ID, AttributeValue::S(id.to_owned()))
            .update_expression("SET #convertible = :state")
            .expression_attribute_names("#convertible", ATTR_CONVERTIBLE)
            .expression_attribute_values(":state", AttributeValue::S(state.as_str().to_owned()))
            .send()
            .await
            .context("failed to update convertible state")?;

        debug!(id, state = state.as_str(), "Updated convertible state");
        Ok(())
    }

    /// Update the modification timestamp of a single record.
    pub async fn update_last_modified(&self, id: &str, last_modified: &str) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ID, AttributeValue::S(id.to_owned()))
            .update_expression("SET #last_modified = :ts")
            .expression_attribute_names("#last_modified", ATTR_LAST_MODIFIED)
            .expression_attribute_values(":ts", AttributeValue::S(last_modified.to_owned()))
            .send()
            .await
            .context("failed to update last modified timestamp")?;

        Ok(())
    }

    /// Insert-or-update by storage key: an unseen key gets a fresh record,
    /// a known key only has its timestamp refreshed so the original id and
    /// conversion flag survive.
    #[instrument(skip(self))]
    pub async fn upsert_by_storage_key(&self, storage_key: &str, last_modified: &str) -> Result<()> {
        match self.find_by_storage_key(storage_key).await? {
            Some(record) => self.update_last_modified(&record.id, last_modified).await,
            None => {
                let record = ImageRecord::new(storage_key.to_owned(), last_modified.to_owned());
                self.put_record(&record).await
            }
        }
    }

    /// Batch-delete records by id.
    pub async fn delete_all(&self, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(MAX_BATCH_WRITE_ITEMS) {
            let mut writes = Vec::with_capacity(chunk.len());
            for id in chunk {
                let delete = DeleteRequest::builder()
                    .key(KEY_ID, AttributeValue::S(id.clone()))
                    .build()
                    .context("invalid delete request")?;
                writes.push(WriteRequest::builder().delete_request(delete).build());
            }

            self.client
                .batch_write_item()
                .request_items(&self.table_name, writes)
                .send()
                .await
                .context("failed to delete image records")?;
        }

        Ok(())
    }

    /// Replace the whole table contents with the given record set.
    ///
    /// Not atomic: a failure mid-replacement can leave the table empty or
    /// partially populated until the next reconciliation run.
    #[instrument(skip(self, records))]
    pub async fn replace_all(&self, records: &[ImageRecord]) -> Result<()> {
        let existing = self.scan_records().await?;
        let ids: Vec<String> = existing.into_iter().map(|record| record.id).collect();
        self.delete_all(&ids).await?;

        for record in records {
            self.put_record(record).await?;
        }

        debug!(count = records.len(), "Replaced image records");
        Ok(())
    }

    /// Cheap connectivity probe for readiness checks.
    pub async fn ping(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .context("failed to describe image table")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_convertible_parse_is_case_insensitive() {
        assert_eq!(
            ConvertibleState::parse("ENABLED"),
            Some(ConvertibleState::Enabled)
        );
        assert_eq!(
            ConvertibleState::parse("Invalid"),
            Some(ConvertibleState::Invalid)
        );
        assert_eq!(
            ConvertibleState::parse("undetermined"),
            Some(ConvertibleState::Undetermined)
        );
    }

    #[test]
    fn test_convertible_parse_rejects_unknown() {
        assert_eq!(ConvertibleState::parse("bogus"), None);
        assert_eq!(ConvertibleState::parse(""), None);
    }

    #[test]
    fn test_convertible_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConvertibleState::Enabled).unwrap(),
            "\"enabled\""
        );
        assert_eq!(
            serde_json::to_string(&ConvertibleState::Undetermined).unwrap(),
            "\"undetermined\""
        );
    }

    #[test]
    fn test_convertible_deserialize_defaults_unknown() {
        let state: ConvertibleState = serde_json::from_str("\"bogus\"").unwrap();
        assert_eq!(state, ConvertibleState::Undetermined);

        let state: ConvertibleState = serde_json::from_str("\"INVALID\"").unwrap();
        assert_eq!(state, ConvertibleState::Invalid);
    }

    #[test]
    fn test_format_last_modified_millisecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(format_last_modified(ts), "2024/01/15 10:30:45.123");
    }

    #[test]
    fn test_new_record_starts_undetermined() {
        let record = ImageRecord::new(
            "images/2024/01/f1.jpg".to_string(),
            "2024/01/15 10:30:45.123".to_string(),
        );
        assert_eq!(record.convertible, ConvertibleState::Undetermined);
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_record_item_round_trip() {
        let record = ImageRecord::new(
            "images/2024/01/f1.jpg".to_string(),
            "2024/01/15 10:30:45.123".to_string(),
        );

        let item: Item = to_item(&record).unwrap();
        let back: ImageRecord = from_item(item).unwrap();
        assert_eq!(back, record);
    }
}
