use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

/// Error surfaced by an API operation.
///
/// Every failure maps onto the uniform response envelope: `result` is set
/// to `NG` and `result_detail` carries the diagnostic text. Unknown image
/// ids count as validation failures, not a distinct not-found case.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed request input, including unknown image ids.
    #[error("{0}")]
    Validation(String),
    /// A call into S3, DynamoDB, or SQS failed.
    #[error("{0:#}")]
    Dependency(anyhow::Error),
}

impl ApiError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Dependency(err)
    }
}

/// Envelope returned for every failed request.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    result: &'static str,
    result_detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Validation(detail) => {
                warn!(detail = %detail, "Rejected invalid request");
            }
            Self::Dependency(err) => {
                error!(error = %format!("{err:#}"), "Store operation failed");
            }
        }

        let envelope = ErrorEnvelope {
            result: "NG",
            result_detail: self.to_string(),
        };

        (self.status_code(), Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            ApiError::validation("missing id").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(anyhow::anyhow!("timeout")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_dependency_detail_carries_error_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
        let err = err.context("failed to scan metadata table").unwrap_err();

        let detail = ApiError::from(err).to_string();
        assert!(detail.contains("failed to scan metadata table"));
        assert!(detail.contains("connection refused"));
    }

    #[test]
    fn test_validation_detail_is_message() {
        let err = ApiError::validation("count must not be negative: -1");
        assert_eq!(err.to_string(), "count must not be negative: -1");
    }

    #[test]
    fn test_error_envelope_shape() {
        let envelope = ErrorEnvelope {
            result: "NG",
            result_detail: "id does not exist in the image table: xyz".to_string(),
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["result"], "NG");
        assert_eq!(
            json["result_detail"],
            "id does not exist in the image table: xyz"
        );
    }
}
