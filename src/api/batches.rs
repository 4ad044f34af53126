use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::api::pagination::{default_limit, PaginatedResponse};
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{Batch, Profile};
use crate::db::types::{BatchStatus, UploadStrategy};
use crate::jobs::orchestrator::run_batch_job;
use crate::repositories::{batches, events, profiles, stats};
use crate::schemas::batch::{
    BatchEventResponse, BatchProgressResponse, BatchResponse, UploadBatchResponse,
};

#[derive(Debug, Deserialize)]
pub(crate) struct ListBatchesQuery {
    #[serde(default)]
    status: Option<BatchStatus>,
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    after: i64,
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_batches))
        .route("/upload", post(upload_batch))
        .route("/:batch_id", get(get_batch).delete(delete_batch))
        .route("/:batch_id/progress", get(get_progress))
        .route("/:batch_id/events", get(get_events))
        .route("/:batch_id/stats", get(get_stats))
        .route("/:batch_id/cancel", post(cancel_batch))
}

/// Accepts the archive plus batch metadata as multipart form data. The
/// archive streams to disk under the admission ceiling; the batch id
/// returns immediately and the pipeline runs in the background.
async fn upload_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadBatchResponse>), ApiError> {
    let batch_id = Uuid::new_v4().to_string();

    let archives_dir = state.settings().storage().archives_dir();
    tokio::fs::create_dir_all(&archives_dir)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to prepare archive storage"))?;
    let archive_path = archives_dir.join(format!("{batch_id}.zip"));

    // A rejected upload must not leave the streamed archive behind.
    let accepted = receive_batch(&state, &batch_id, &archive_path, multipart).await;
    let (batch, profile) = match accepted {
        Ok(accepted) => accepted,
        Err(err) => {
            let _ = tokio::fs::remove_file(&archive_path).await;
            return Err(err);
        }
    };

    let response = UploadBatchResponse {
        batch_id: batch.id.clone(),
        status: batch.status,
        message: "Batch accepted for processing".to_string(),
        total_size: batch.archive_size,
    };
    tokio::spawn(run_batch_job(state, batch, profile.config_json.0, archive_path));

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Streams the multipart fields, enforcing the admission ceiling, and
/// creates the batch row once every required field has arrived.
async fn receive_batch(
    state: &AppState,
    batch_id: &str,
    archive_path: &std::path::Path,
    mut multipart: Multipart,
) -> Result<(Batch, Profile), ApiError> {
    let storage = state.settings().storage();
    let max_bytes = storage.max_archive_size_bytes();

    let mut name: Option<String> = None;
    let mut strategy: Option<UploadStrategy> = None;
    let mut profile_id: Option<i64> = None;
    let mut notes: Option<String> = None;
    let mut archive: Option<(String, u64)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                let mut hasher = Sha256::new();
                let mut size: u64 = 0;
                let mut file = tokio::fs::File::create(&archive_path)
                    .await
                    .map_err(|err| ApiError::internal(err, "Failed to create archive file"))?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|_| ApiError::BadRequest("Failed to read archive".to_string()))?
                {
                    size += chunk.len() as u64;
                    if size > max_bytes {
                        return Err(ApiError::PayloadTooLarge(format!(
                            "Archive exceeds {}MB limit",
                            storage.max_archive_size_mb
                        )));
                    }
                    hasher.update(&chunk);
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| ApiError::internal(err, "Failed to write archive file"))?;
                }
                file.flush()
                    .await
                    .map_err(|err| ApiError::internal(err, "Failed to write archive file"))?;
                archive = Some((hex::encode(hasher.finalize()), size));
            }
            "batch_name" => name = Some(text_field(field, "batch_name").await?),
            "upload_strategy" => {
                let text = text_field(field, "upload_strategy").await?;
                strategy = Some(parse_strategy(&text)?);
            }
            "profile_id" => {
                let text = text_field(field, "profile_id").await?;
                profile_id = Some(text.parse::<i64>().map_err(|_| {
                    ApiError::BadRequest("profile_id must be an integer".to_string())
                })?);
            }
            "notes" => notes = Some(text_field(field, "notes").await?),
            _ => {}
        }
    }

    let (archive_sha256, archive_size) = archive.ok_or_else(|| {
        ApiError::BadRequest("Archive file field \"file\" is required".to_string())
    })?;
    let name =
        name.ok_or_else(|| ApiError::BadRequest("batch_name is required".to_string()))?;
    let strategy = strategy.unwrap_or(UploadStrategy::Replace);

    let profile = match profile_id {
        Some(id) => profiles::find_by_id(state.db(), id)
            .await
            .map_err(|err| ApiError::internal(err, "Failed to load profile"))?
            .ok_or_else(|| ApiError::NotFound(format!("Profile {id} not found")))?,
        None => profiles::get_default(state.db())
            .await
            .map_err(|err| ApiError::internal(err, "Failed to load default profile"))?
            .ok_or_else(|| {
                ApiError::BadRequest("No default profile configured".to_string())
            })?,
    };

    let batch = batches::create(
        state.db(),
        batch_id,
        &name,
        strategy,
        profile.id,
        &archive_sha256,
        archive_size as i64,
        notes.as_deref(),
        primitive_now_utc(),
    )
    .await
    .map_err(|err| ApiError::internal(err, "Failed to create batch"))?;

    Ok((batch, profile))
}

async fn list_batches(
    State(state): State<AppState>,
    Query(params): Query<ListBatchesQuery>,
) -> Result<Json<PaginatedResponse<BatchResponse>>, ApiError> {
    let limit = params.limit.clamp(1, 500);
    let skip = params.skip.max(0);
    let (total_count, items) = batches::list(state.db(), params.status, skip, limit)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to list batches"))?;

    Ok(Json(PaginatedResponse {
        items: items.into_iter().map(BatchResponse::from_db).collect(),
        total_count,
        skip,
        limit,
    }))
}

async fn get_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchResponse>, ApiError> {
    let batch = find_batch(&state, &batch_id).await?;
    Ok(Json(BatchResponse::from_db(batch)))
}

async fn get_progress(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchProgressResponse>, ApiError> {
    let batch = find_batch(&state, &batch_id).await?;
    let latest = events::latest(state.db(), &batch_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load batch events"))?;
    Ok(Json(BatchProgressResponse::from_db(batch, latest)))
}

async fn get_events(
    Path(batch_id): Path<String>,
    Query(params): Query<EventsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<BatchEventResponse>>, ApiError> {
    find_batch(&state, &batch_id).await?;
    list_job_events(state, batch_id, params.after).await
}

/// Shared with the reprocess flow, whose job ids are not batch ids.
pub(crate) async fn job_events(
    Path(job_id): Path<String>,
    Query(params): Query<EventsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<BatchEventResponse>>, ApiError> {
    list_job_events(state, job_id, params.after).await
}

pub(crate) async fn cancel_job(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.jobs().cancel(&job_id) {
        return Err(ApiError::Conflict(format!("Job {job_id} is not running")));
    }
    Ok(Json(serde_json::json!({ "job_id": job_id, "cancelled": true })))
}

async fn get_stats(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<stats::StatsSummary>, ApiError> {
    find_batch(&state, &batch_id).await?;
    let summary = stats::batch_stats(state.db(), &batch_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to compute batch stats"))?;
    Ok(Json(summary))
}

async fn cancel_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch = find_batch(&state, &batch_id).await?;
    if batch.status.is_terminal() {
        return Err(ApiError::Conflict(format!("Batch is already {:?}", batch.status)));
    }
    if !state.jobs().cancel(&batch_id) {
        return Err(ApiError::Conflict("Batch job is not running".to_string()));
    }
    Ok(Json(serde_json::json!({ "batch_id": batch_id, "cancelled": true })))
}

/// Deletes a finished batch along with its sheets, answer sets and
/// extracted images. Running batches must be cancelled first.
async fn delete_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch = find_batch(&state, &batch_id).await?;
    if state.jobs().is_running(&batch_id) || !batch.status.is_terminal() {
        return Err(ApiError::Conflict("Batch job is still running".to_string()));
    }

    batches::delete(state.db(), &batch_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to delete batch"))?;

    let batch_dir = state.settings().storage().batch_dir(&batch_id);
    if let Err(err) = tokio::fs::remove_dir_all(&batch_dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(batch_id = %batch_id, error = %err, "Batch file cleanup failed");
        }
    }

    Ok(Json(serde_json::json!({ "batch_id": batch_id, "deleted": true })))
}

async fn list_job_events(
    state: AppState,
    job_id: String,
    after: i64,
) -> Result<Json<Vec<BatchEventResponse>>, ApiError> {
    let events = events::list_after(state.db(), &job_id, after)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load job events"))?;
    Ok(Json(events.into_iter().map(BatchEventResponse::from_db).collect()))
}

async fn find_batch(
    state: &AppState,
    batch_id: &str,
) -> Result<crate::db::models::Batch, ApiError> {
    batches::find_by_id(state.db(), batch_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load batch"))?
        .ok_or_else(|| ApiError::NotFound(format!("Batch {batch_id} not found")))
}

async fn text_field(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, ApiError> {
    field.text().await.map_err(|_| ApiError::BadRequest(format!("Invalid field {name}")))
}

fn parse_strategy(text: &str) -> Result<UploadStrategy, ApiError> {
    match text {
        "replace" => Ok(UploadStrategy::Replace),
        "merge" => Ok(UploadStrategy::Merge),
        "append" => Ok(UploadStrategy::Append),
        other => Err(ApiError::BadRequest(format!(
            "upload_strategy must be replace, merge or append, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::core::config::Settings;
    use crate::services::grading::ThresholdGrader;
    use crate::test_support;

    #[test]
    fn strategy_parsing_rejects_unknown_values() {
        assert_eq!(parse_strategy("replace").unwrap(), UploadStrategy::Replace);
        assert_eq!(parse_strategy("merge").unwrap(), UploadStrategy::Merge);
        assert_eq!(parse_strategy("append").unwrap(), UploadStrategy::Append);
        assert!(parse_strategy("overwrite").is_err());
    }

    #[tokio::test]
    async fn rejected_upload_removes_the_streamed_archive() {
        let _guard = test_support::env_lock().await;
        let data_root = tempfile::tempdir().expect("tempdir");
        std::env::set_var("OMR_DATA_ROOT", data_root.path());
        std::env::remove_var("PROMETHEUS_ENABLED");
        let settings = Settings::load().expect("settings");
        std::env::remove_var("OMR_DATA_ROOT");

        let db =
            sqlx::PgPool::connect_lazy(&settings.database().database_url()).expect("lazy pool");
        let state = AppState::new(settings, db, Arc::new(ThresholdGrader));
        let app = crate::api::router::router(state);

        // A file field but no batch_name: rejected before any database
        // access, after the archive already streamed to disk.
        let boundary = "omrupload";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"b.zip\"\r\n\
             Content-Type: application/zip\r\n\r\n\
             not-a-real-archive\r\n\
             --{boundary}--\r\n"
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/batches/upload")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let leftovers = std::fs::read_dir(data_root.path().join("archives"))
            .expect("archives dir")
            .count();
        assert_eq!(leftovers, 0);
    }
}
