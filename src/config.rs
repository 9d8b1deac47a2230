use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the image catalog service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// DynamoDB configuration
    pub dynamodb: DynamoDbConfig,
    /// S3 event queue configuration
    pub events: EventQueueConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for image storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// DynamoDB metadata table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    /// Table holding the image records
    pub table_name: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for DynamoDB Local, LocalStack, etc.)
    pub endpoint_url: Option<String>,
}

/// SQS queue receiving S3 object-created notifications
#[derive(Debug, Clone, Deserialize)]
pub struct EventQueueConfig {
    /// Queue URL
    pub queue_url: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Long-poll wait time in seconds
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u32,
    /// Maximum messages fetched per poll
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

/// API configuration for the HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "image-catalog-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_wait_time_secs() -> u32 {
    20
}

fn default_max_messages() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "image-catalog-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/image-catalog").required(false))
            .add_source(config::File::with_name("/etc/image-catalog/service").required(false))
            // Override with environment variables
            // IMAGE_CATALOG__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("IMAGE_CATALOG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_presigned_url_expiry_secs(), 3600);
        assert_eq!(default_wait_time_secs(), 20);
        assert_eq!(default_region(), "us-east-1");
    }

    #[test]
    fn test_service_config_default() {
        let config = ServiceConfig::default();
        assert_eq!(config.name, "image-catalog-service");
        assert_eq!(config.log_level, "info");
    }
}
