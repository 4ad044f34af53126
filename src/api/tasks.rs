use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::jobs::orchestrator::run_reprocess_job;
use crate::repositories::{profiles, roster, sheets, stats};
use crate::schemas::batch::{ReprocessRequest, ReprocessResponse};
use crate::schemas::roster::{RosterEntryResponse, RosterImportRequest, RosterImportResponse};
use crate::services::reconcile::reconcile_task;
use crate::services::scan::TaskId;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:task_id/stats", get(get_stats))
        .route("/:task_id/roster", get(get_roster).put(import_roster))
        .route("/:task_id/reprocess", post(reprocess))
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    TaskId::parse(raw)
        .ok_or_else(|| ApiError::BadRequest(format!("{raw} is not a valid 8-digit task id")))
}

async fn get_stats(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<stats::StatsSummary>, ApiError> {
    let task = parse_task_id(&task_id)?;
    let summary = stats::task_stats(state.db(), task.as_str())
        .await
        .map_err(|err| ApiError::internal(err, "Failed to compute task stats"))?;
    Ok(Json(summary))
}

async fn get_roster(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<RosterEntryResponse>>, ApiError> {
    let task = parse_task_id(&task_id)?;
    let entries = roster::list_for_task(state.db(), task.as_str())
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load roster"))?;
    Ok(Json(entries.into_iter().map(RosterEntryResponse::from_db).collect()))
}

/// Replaces the task roster and reconciles immediately so row statuses
/// reflect the new registration data without waiting for the next job.
async fn import_roster(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<RosterImportRequest>,
) -> Result<Json<RosterImportResponse>, ApiError> {
    let task = parse_task_id(&task_id)?;
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let rows: Vec<roster::RosterImportRow> = payload
        .entries
        .into_iter()
        .map(|entry| roster::RosterImportRow {
            student_id: entry.student_id,
            student_name: entry.student_name,
            present: entry.present,
        })
        .collect();

    let task_ids = vec![task.as_str().to_string()];
    let _guards = state.jobs().lock_tasks(&task_ids).await;
    let imported = roster::replace_for_task(state.db(), task.as_str(), &rows, primitive_now_utc())
        .await
        .map_err(|err| match err.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                ApiError::Conflict("Duplicate student_id in roster".to_string())
            }
            _ => ApiError::internal(err, "Failed to import roster"),
        })?;
    reconcile_task(state.db(), task.as_str())
        .await
        .map_err(|err| ApiError::internal(err, "Failed to reconcile roster"))?;

    Ok(Json(RosterImportResponse { task_id: task.as_str().to_string(), imported }))
}

/// Starts a background job that re-grades the requested sheets under
/// the given (or default) profile. Returns the job id; progress and
/// events are polled like a batch job.
async fn reprocess(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ReprocessRequest>,
) -> Result<Json<ReprocessResponse>, ApiError> {
    let task = parse_task_id(&task_id)?;
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let subset = sheets::list_by_ids_for_task(state.db(), task.as_str(), &payload.sheet_ids)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load sheets"))?;
    if subset.len() != payload.sheet_ids.len() {
        let found: std::collections::HashSet<&str> =
            subset.iter().map(|sheet| sheet.id.as_str()).collect();
        let missing: Vec<&str> = payload
            .sheet_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !found.contains(id))
            .collect();
        return Err(ApiError::NotFound(format!(
            "Sheets not found for task {}: {}",
            task.as_str(),
            missing.join(", ")
        )));
    }

    let profile = match payload.profile_id {
        Some(id) => profiles::find_by_id(state.db(), id)
            .await
            .map_err(|err| ApiError::internal(err, "Failed to load profile"))?
            .ok_or_else(|| ApiError::NotFound(format!("Profile {id} not found")))?,
        None => profiles::get_default(state.db())
            .await
            .map_err(|err| ApiError::internal(err, "Failed to load default profile"))?
            .ok_or_else(|| ApiError::BadRequest("No default profile configured".to_string()))?,
    };

    let job_id = Uuid::new_v4().to_string();
    let sheet_count = subset.len();
    tokio::spawn(run_reprocess_job(state, job_id.clone(), subset, profile.config_json.0));

    Ok(Json(ReprocessResponse { job_id, sheet_count }))
}
