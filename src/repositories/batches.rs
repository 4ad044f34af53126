use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::Batch;
use crate::db::types::{BatchStatus, UploadStrategy};

pub(crate) const COLUMNS: &str = "id, name, upload_strategy, status, profile_id, archive_sha256, \
     archive_size, notes, error_message, sheet_count, processed_count, failed_count, created_at, \
     completed_at";

#[allow(clippy::too_many_arguments)]
pub(crate) async fn create(
    pool: &PgPool,
    id: &str,
    name: &str,
    upload_strategy: UploadStrategy,
    profile_id: i64,
    archive_sha256: &str,
    archive_size: i64,
    notes: Option<&str>,
    now: PrimitiveDateTime,
) -> Result<Batch, sqlx::Error> {
    sqlx::query_as::<_, Batch>(&format!(
        "INSERT INTO batches (id, name, upload_strategy, status, profile_id, archive_sha256, \
         archive_size, notes, created_at)
         VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8)
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(name)
    .bind(upload_strategy)
    .bind(profile_id)
    .bind(archive_sha256)
    .bind(archive_size)
    .bind(notes)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Batch>, sqlx::Error> {
    sqlx::query_as::<_, Batch>(&format!("SELECT {COLUMNS} FROM batches WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list(
    pool: &PgPool,
    status: Option<BatchStatus>,
    skip: i64,
    limit: i64,
) -> Result<(i64, Vec<Batch>), sqlx::Error> {
    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM batches WHERE ($1::batchstatus IS NULL OR status = $1)",
    )
    .bind(status)
    .fetch_one(pool)
    .await?;

    let batches = sqlx::query_as::<_, Batch>(&format!(
        "SELECT {COLUMNS} FROM batches
         WHERE ($1::batchstatus IS NULL OR status = $1)
         ORDER BY created_at DESC
         OFFSET $2 LIMIT $3"
    ))
    .bind(status)
    .bind(skip)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok((total.0, batches))
}

pub(crate) async fn set_status(
    pool: &PgPool,
    id: &str,
    status: BatchStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE batches SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn set_counts(
    pool: &PgPool,
    id: &str,
    sheet_count: i32,
    processed_count: i32,
    failed_count: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE batches SET sheet_count = $2, processed_count = $3, failed_count = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(sheet_count)
    .bind(processed_count)
    .bind(failed_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn mark_completed(
    pool: &PgPool,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE batches SET status = 'completed', error_message = NULL, completed_at = $2
         WHERE id = $1",
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn mark_failed(
    pool: &PgPool,
    id: &str,
    message: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE batches SET status = 'failed', error_message = $2, completed_at = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn delete(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM batches WHERE id = $1").bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}
