//! Image Catalog Service
//!
//! REST façade over an S3 bucket of images and the DynamoDB table that
//! indexes them. The service issues time-limited presigned upload and
//! download URLs, lists the catalogued images, reconciles the metadata
//! table against the actual bucket contents, and tracks a per-image
//! conversion eligibility flag. A companion SQS consumer reacts to S3
//! "object created" notifications by upserting metadata records.
//!
//! ## Architecture
//!
//! ```text
//! SQS Queue                   S3 Bucket                 DynamoDB
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ S3 object-   │           │ images/      │          │ image        │
//! │ created      │           │   {yyyy}/    │          │ records      │
//! │ events       │           │   {mm}/      │          └──────────────┘
//! └──────────────┘           └──────────────┘                 ▲
//!        │                          │                         │
//!        ▼                          ▼                         │
//! ┌──────────────┐           ┌──────────────┐                 │
//! │ Event        │           │ Object       │          ┌──────────────┐
//! │ Consumer     │──────────▶│ Store        │◀─────────│ Metadata     │
//! └──────────────┘  upsert   └──────────────┘ reconcile│ Store        │
//!                                   │                  └──────────────┘
//!                                   ▼
//!                            ┌──────────────┐
//!                            │ Presigned    │
//!                            │ URL API      │
//!                            └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod event_consumer;
pub mod metadata_store;
pub mod object_store;
pub mod reconciler;

pub use api::AppState;
pub use config::Config;
pub use error::ApiError;
pub use event_consumer::S3EventConsumer;
pub use metadata_store::{ConvertibleState, ImageRecord, MetadataStore};
pub use object_store::{ObjectEntry, ObjectStore};
pub use reconciler::reconcile;
