use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories::profiles;
use crate::schemas::profile::{
    ProfileCloneRequest, ProfileCreate, ProfileResponse, ProfileUpdate,
};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_profiles).post(create_profile))
        .route("/:profile_id", get(get_profile).patch(update_profile).delete(delete_profile))
        .route("/:profile_id/clone", post(clone_profile))
        .route("/:profile_id/default", post(set_default))
}

async fn list_profiles(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProfileResponse>>, ApiError> {
    let items = profiles::list(state.db())
        .await
        .map_err(|err| ApiError::internal(err, "Failed to list profiles"))?;
    Ok(Json(items.into_iter().map(ProfileResponse::from_db).collect()))
}

async fn create_profile(
    State(state): State<AppState>,
    Json(payload): Json<ProfileCreate>,
) -> Result<Json<ProfileResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let profile = profiles::create(
        state.db(),
        &payload.name,
        payload.description.as_deref(),
        &payload.config,
        primitive_now_utc(),
    )
    .await
    .map_err(name_conflict)?;
    Ok(Json(ProfileResponse::from_db(profile)))
}

async fn get_profile(
    Path(profile_id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let profile = find_profile(&state, profile_id).await?;
    Ok(Json(ProfileResponse::from_db(profile)))
}

async fn update_profile(
    Path(profile_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<ProfileUpdate>,
) -> Result<Json<ProfileResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let profile = profiles::update(
        state.db(),
        profile_id,
        payload.name.as_deref(),
        payload.description.as_deref(),
        payload.config.as_ref(),
        primitive_now_utc(),
    )
    .await
    .map_err(name_conflict)?
    .ok_or_else(|| ApiError::NotFound(format!("Profile {profile_id} not found")))?;
    Ok(Json(ProfileResponse::from_db(profile)))
}

async fn clone_profile(
    Path(profile_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<ProfileCloneRequest>,
) -> Result<Json<ProfileResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let profile =
        profiles::clone_profile(state.db(), profile_id, &payload.new_name, primitive_now_utc())
        .await
        .map_err(name_conflict)?
        .ok_or_else(|| ApiError::NotFound(format!("Profile {profile_id} not found")))?;
    Ok(Json(ProfileResponse::from_db(profile)))
}

async fn set_default(
    Path(profile_id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let profile = profiles::set_default(state.db(), profile_id, primitive_now_utc())
        .await
        .map_err(|err| ApiError::internal(err, "Failed to set default profile"))?
        .ok_or_else(|| ApiError::NotFound(format!("Profile {profile_id} not found")))?;
    Ok(Json(ProfileResponse::from_db(profile)))
}

/// The default profile cannot be deleted, nor can a profile still
/// referenced by a batch.
async fn delete_profile(
    Path(profile_id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let profile = find_profile(&state, profile_id).await?;
    if profile.is_default {
        return Err(ApiError::Conflict("Cannot delete the default profile".to_string()));
    }

    let deleted = profiles::delete(state.db(), profile_id).await.map_err(|err| {
        match err.as_database_error() {
            Some(db_err) if db_err.is_foreign_key_violation() => {
                ApiError::Conflict("Profile is referenced by existing batches".to_string())
            }
            _ => ApiError::internal(err, "Failed to delete profile"),
        }
    })?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Profile {profile_id} not found")));
    }
    Ok(Json(serde_json::json!({ "profile_id": profile_id, "deleted": true })))
}

async fn find_profile(
    state: &AppState,
    profile_id: i64,
) -> Result<crate::db::models::Profile, ApiError> {
    profiles::find_by_id(state.db(), profile_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load profile"))?
        .ok_or_else(|| ApiError::NotFound(format!("Profile {profile_id} not found")))
}

fn name_conflict(err: sqlx::Error) -> ApiError {
    match err.as_database_error() {
        Some(db_err) if db_err.is_unique_violation() => {
            ApiError::Conflict("Profile name already exists".to_string())
        }
        _ => ApiError::internal(err, "Failed to write profile"),
    }
}
