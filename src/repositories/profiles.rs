use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::Profile;
use crate::services::grading::ProfileConfig;

pub(crate) const COLUMNS: &str =
    "id, name, description, config_json, is_default, created_at, updated_at";

pub(crate) async fn create(
    pool: &PgPool,
    name: &str,
    description: Option<&str>,
    config: &ProfileConfig,
    now: PrimitiveDateTime,
) -> Result<Profile, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!(
        "INSERT INTO profiles (name, description, config_json, is_default, created_at, updated_at)
         VALUES ($1, $2, $3, FALSE, $4, $4)
         RETURNING {COLUMNS}"
    ))
    .bind(name)
    .bind(description)
    .bind(Json(config))
    .bind(now)
    .fetch_one(pool)
    .await
}

pub(crate) async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!("SELECT {COLUMNS} FROM profiles WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!(
        "SELECT {COLUMNS} FROM profiles ORDER BY is_default DESC, name"
    ))
    .fetch_all(pool)
    .await
}

pub(crate) async fn get_default(pool: &PgPool) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!("SELECT {COLUMNS} FROM profiles WHERE is_default"))
        .fetch_optional(pool)
        .await
}

pub(crate) async fn update(
    pool: &PgPool,
    id: i64,
    name: Option<&str>,
    description: Option<&str>,
    config: Option<&ProfileConfig>,
    now: PrimitiveDateTime,
) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!(
        "UPDATE profiles
         SET name = COALESCE($2, name),
             description = COALESCE($3, description),
             config_json = COALESCE($4, config_json),
             updated_at = $5
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(name)
    .bind(description)
    .bind(config.map(Json))
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Copies an existing profile's config under a new name. The clone is
/// never the default regardless of the source.
pub(crate) async fn clone_profile(
    pool: &PgPool,
    id: i64,
    new_name: &str,
    now: PrimitiveDateTime,
) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!(
        "INSERT INTO profiles (name, description, config_json, is_default, created_at, updated_at)
         SELECT $2, description, config_json, FALSE, $3, $3 FROM profiles WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(new_name)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Swaps the default flag in one transaction. The partial unique index
/// on is_default means the clear must land before the set.
pub(crate) async fn set_default(
    pool: &PgPool,
    id: i64,
    now: PrimitiveDateTime,
) -> Result<Option<Profile>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE profiles SET is_default = FALSE, updated_at = $1 WHERE is_default")
        .bind(now)
        .execute(&mut *tx)
        .await?;
    let profile = sqlx::query_as::<_, Profile>(&format!(
        "UPDATE profiles SET is_default = TRUE, updated_at = $2 WHERE id = $1 RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(profile)
}

/// Fails with a foreign key violation if any batch still references the
/// profile; the handler maps that to a conflict response.
pub(crate) async fn delete(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM profiles WHERE id = $1 AND NOT is_default")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
