use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{Batch, BatchEvent};
use crate::db::types::{BatchStatus, UploadStrategy};

#[derive(Debug, Serialize)]
pub(crate) struct UploadBatchResponse {
    pub(crate) batch_id: String,
    pub(crate) status: BatchStatus,
    pub(crate) message: String,
    pub(crate) total_size: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchResponse {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) upload_strategy: UploadStrategy,
    pub(crate) status: BatchStatus,
    pub(crate) profile_id: i64,
    pub(crate) archive_sha256: String,
    pub(crate) archive_size: i64,
    pub(crate) notes: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) sheet_count: i32,
    pub(crate) processed_count: i32,
    pub(crate) failed_count: i32,
    pub(crate) created_at: String,
    pub(crate) completed_at: Option<String>,
}

impl BatchResponse {
    pub(crate) fn from_db(batch: Batch) -> Self {
        Self {
            id: batch.id,
            name: batch.name,
            upload_strategy: batch.upload_strategy,
            status: batch.status,
            profile_id: batch.profile_id,
            archive_sha256: batch.archive_sha256,
            archive_size: batch.archive_size,
            notes: batch.notes,
            error_message: batch.error_message,
            sheet_count: batch.sheet_count,
            processed_count: batch.processed_count,
            failed_count: batch.failed_count,
            created_at: format_primitive(batch.created_at),
            completed_at: batch.completed_at.map(format_primitive),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchProgressResponse {
    pub(crate) batch_id: String,
    pub(crate) status: BatchStatus,
    pub(crate) stage: Option<String>,
    pub(crate) message: Option<String>,
    pub(crate) sheet_count: i32,
    pub(crate) processed_count: i32,
    pub(crate) failed_count: i32,
    pub(crate) progress_percentage: f64,
}

impl BatchProgressResponse {
    pub(crate) fn from_db(batch: Batch, latest: Option<BatchEvent>) -> Self {
        let progress_percentage = if batch.status == BatchStatus::Completed {
            100.0
        } else if batch.sheet_count > 0 {
            (batch.processed_count + batch.failed_count) as f64 / batch.sheet_count as f64 * 100.0
        } else {
            0.0
        };
        Self {
            batch_id: batch.id,
            status: batch.status,
            stage: latest.as_ref().map(|event| event.stage.clone()),
            message: latest.map(|event| event.message),
            sheet_count: batch.sheet_count,
            processed_count: batch.processed_count,
            failed_count: batch.failed_count,
            progress_percentage,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchEventResponse {
    pub(crate) id: i64,
    pub(crate) stage: String,
    pub(crate) message: String,
    pub(crate) created_at: String,
}

impl BatchEventResponse {
    pub(crate) fn from_db(event: BatchEvent) -> Self {
        Self {
            id: event.id,
            stage: event.stage,
            message: event.message,
            created_at: format_primitive(event.created_at),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ReprocessRequest {
    #[validate(length(min = 1, message = "sheet_ids must not be empty"))]
    pub(crate) sheet_ids: Vec<String>,
    /// Defaults to the default profile when omitted.
    #[serde(default)]
    pub(crate) profile_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReprocessResponse {
    pub(crate) job_id: String,
    pub(crate) sheet_count: usize,
}
