use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::BatchEvent;

pub(crate) const COLUMNS: &str = "id, job_id, stage, message, created_at";

pub(crate) async fn append(
    pool: &PgPool,
    job_id: &str,
    stage: &str,
    message: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO batch_events (job_id, stage, message, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(job_id)
    .bind(stage)
    .bind(message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Events after a cursor, oldest first. A cursor of 0 returns the whole
/// stream; pollers pass the last id they saw.
pub(crate) async fn list_after(
    pool: &PgPool,
    job_id: &str,
    after_id: i64,
) -> Result<Vec<BatchEvent>, sqlx::Error> {
    sqlx::query_as::<_, BatchEvent>(&format!(
        "SELECT {COLUMNS} FROM batch_events WHERE job_id = $1 AND id > $2 ORDER BY id"
    ))
    .bind(job_id)
    .bind(after_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn latest(
    pool: &PgPool,
    job_id: &str,
) -> Result<Option<BatchEvent>, sqlx::Error> {
    sqlx::query_as::<_, BatchEvent>(&format!(
        "SELECT {COLUMNS} FROM batch_events WHERE job_id = $1 ORDER BY id DESC LIMIT 1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}
