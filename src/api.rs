use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::metadata_store::{ConvertibleState, MetadataStore};
use crate::object_store::{generate_upload_key, ObjectStore};
use crate::reconciler::reconcile;
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Value of `result` in successful envelopes.
const RESULT_OK: &str = "OK";

/// How many presigned URLs are issued concurrently when listing images.
const PRESIGN_CONCURRENCY: usize = 8;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub object_store: Arc<ObjectStore>,
    pub metadata_store: Arc<MetadataStore>,
    pub presigned_url_expiry: Duration,
}

/// Upload URL request: client-side paths of the images to upload
#[derive(Debug, Default, Deserialize)]
pub struct SignedUrlRequest {
    #[serde(default)]
    pub images: Vec<String>,
}

/// Upload URL response: one `{source path: presigned URL}` pair per image
#[derive(Debug, Serialize)]
pub struct SignedUrlsResponse {
    pub result: &'static str,
    pub signed_urls: Vec<HashMap<String, String>>,
}

/// Bare envelope for operations without a payload
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub result: &'static str,
}

/// Image list response
#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub result: &'static str,
    pub data: Vec<ImageEntry>,
}

/// One catalogued image with a presigned download URL
#[derive(Debug, Serialize)]
pub struct ImageEntry {
    pub id: String,
    pub url: String,
    pub last_modified: String,
    pub convertible: ConvertibleState,
}

/// Single-image download URL response
#[derive(Debug, Serialize)]
pub struct ImageUrlResponse {
    pub result: &'static str,
    pub url: String,
}

/// Image mutation request; only the conversion flag is updatable
#[derive(Debug, Default, Deserialize)]
pub struct UpdateImageRequest {
    #[serde(default)]
    pub convertible: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/signed_url", post(issue_upload_urls))
        .route("/update_table", get(update_table))
        .route("/images", get(list_images))
        .route("/images/:count", get(list_images_with_count))
        .route("/image/:id", get(get_image).patch(update_image))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "image-catalog-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.metadata_store.ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "metadata_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "metadata_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Issue presigned upload URLs, one per requested image path.
#[instrument(skip(state, request))]
async fn issue_upload_urls(
    State(state): State<AppState>,
    request: Option<Json<SignedUrlRequest>>,
) -> Result<Json<SignedUrlsResponse>, ApiError> {
    let paths = request.map(|Json(r)| r.images).unwrap_or_default();
    if paths.is_empty() {
        return Err(ApiError::validation("the input image file path list is empty"));
    }

    state.object_store.ensure_bucket().await?;

    // One timestamp per request batch keeps sibling uploads in the same
    // calendar directory.
    let now = Utc::now();

    let mut signed_urls = Vec::with_capacity(paths.len());
    for path in paths {
        let key = generate_upload_key(now, &path);
        let url = state
            .object_store
            .presign_put(&key, state.presigned_url_expiry)
            .await?;
        signed_urls.push(HashMap::from([(path, url)]));
    }

    metrics::counter!("catalog.signed_urls.issued").increment(signed_urls.len() as u64);

    Ok(Json(SignedUrlsResponse {
        result: RESULT_OK,
        signed_urls,
    }))
}

/// Rebuild the metadata table from the live bucket contents.
#[instrument(skip(state))]
async fn update_table(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let listing = state.object_store.list_images().await?;
    let current = state.metadata_store.scan_records().await?;

    let next = reconcile(&listing, current);
    state.metadata_store.replace_all(&next).await?;

    metrics::counter!("catalog.reconcile.runs").increment(1);
    metrics::gauge!("catalog.records.live").set(next.len() as f64);

    Ok(Json(StatusResponse { result: RESULT_OK }))
}

/// List all catalogued images
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
) -> Result<Json<ImageListResponse>, ApiError> {
    list_images_inner(state, 0).await
}

/// List up to `count` catalogued images (0 means all)
#[instrument(skip(state))]
async fn list_images_with_count(
    State(state): State<AppState>,
    Path(count): Path<i64>,
) -> Result<Json<ImageListResponse>, ApiError> {
    list_images_inner(state, count).await
}

async fn list_images_inner(
    state: AppState,
    count: i64,
) -> Result<Json<ImageListResponse>, ApiError> {
    if count < 0 {
        return Err(ApiError::validation(format!(
            "count must not be negative: {count}"
        )));
    }

    let mut records = state.metadata_store.scan_records().await?;
    if count > 0 {
        records.truncate(count as usize);
    }

    let results: Vec<anyhow::Result<ImageEntry>> = stream::iter(records)
        .map(|record| {
            let object_store = state.object_store.clone();
            let expiry = state.presigned_url_expiry;
            async move {
                let url = object_store.presign_get(&record.storage_key, expiry).await?;
                Ok(ImageEntry {
                    id: record.id,
                    url,
                    last_modified: record.last_modified,
                    convertible: record.convertible,
                })
            }
        })
        .buffer_unordered(PRESIGN_CONCURRENCY)
        .collect()
        .await;

    let mut data = Vec::with_capacity(results.len());
    for result in results {
        data.push(result?);
    }

    Ok(Json(ImageListResponse {
        result: RESULT_OK,
        data,
    }))
}

/// Presigned download URL for one image.
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ImageUrlResponse>, ApiError> {
    let record = state
        .metadata_store
        .get_record(&id)
        .await?
        .ok_or_else(|| ApiError::validation(format!("id does not exist in the image table: {id}")))?;

    let url = state
        .object_store
        .presign_get(&record.storage_key, state.presigned_url_expiry)
        .await?;

    Ok(Json(ImageUrlResponse {
        result: RESULT_OK,
        url,
    }))
}

/// Update the conversion flag of one image.
#[instrument(skip(state, request))]
async fn update_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<UpdateImageRequest>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let name = request.map(|Json(r)| r.convertible).unwrap_or_default();
    if name.is_empty() {
        return Err(ApiError::validation(
            "convertible state is missing from the request body",
        ));
    }

    // Unknown names are rejected rather than coerced to a default state.
    let target = ConvertibleState::parse(&name)
        .ok_or_else(|| ApiError::validation(format!("unknown convertible state: {name}")))?;

    if state.metadata_store.get_record(&id).await?.is_none() {
        return Err(ApiError::validation(format!(
            "id does not exist in the image table: {id}"
        )));
    }

    state.metadata_store.update_convertible(&id, target).await?;

    Ok(Json(StatusResponse { result: RESULT_OK }))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image catalog API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router).await.context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_url_request_defaults_to_empty_list() {
        let request: SignedUrlRequest = serde_json::from_str("{}").unwrap();
        assert!(request.images.is_empty());
    }

    #[test]
    fn test_status_response_envelope() {
        let response = StatusResponse { result: RESULT_OK };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"result":"OK"}"#
        );
    }

    #[test]
    fn test_image_entry_serializes_convertible_name() {
        let entry = ImageEntry {
            id: "a".to_string(),
            url: "https://example.com/signed".to_string(),
            last_modified: "2024/01/15 10:30:45.123".to_string(),
            convertible: ConvertibleState::Enabled,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["convertible"], "enabled");
        assert_eq!(json["last_modified"], "2024/01/15 10:30:45.123");
    }

    #[test]
    fn test_signed_urls_response_shape() {
        let response = SignedUrlsResponse {
            result: RESULT_OK,
            signed_urls: vec![HashMap::from([(
                "src.png".to_string(),
                "https://example.com/put".to_string(),
            )])],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"], "OK");
        assert_eq!(json["signed_urls"][0]["src.png"], "https://example.com/put");
    }
}
