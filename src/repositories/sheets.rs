use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::Sheet;
use crate::db::types::SheetStatus;
use crate::services::archive::ExtractedSheet;

pub(crate) const COLUMNS: &str = "id, batch_id, task_id, source_filename, image_path, kind, \
     student_id, status, error_kind, created_at, updated_at";

/// Creates one pending sheet row per extracted image. Idempotent per
/// (batch_id, source_filename): re-running extraction for the same batch
/// never duplicates rows. Files that already failed validation are
/// created directly in `error` state so they stay visible.
pub(crate) async fn create_pending(
    pool: &PgPool,
    batch_id: &str,
    extracted: &[ExtractedSheet],
    now: PrimitiveDateTime,
) -> Result<usize, sqlx::Error> {
    let mut created = 0;
    for sheet in extracted {
        let status = if sheet.error.is_some() { SheetStatus::Error } else { SheetStatus::Pending };
        let result = sqlx::query(
            "INSERT INTO sheets
                 (id, batch_id, task_id, source_filename, image_path, kind, status, error_kind, \
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
             ON CONFLICT (batch_id, source_filename) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(batch_id)
        .bind(sheet.task_id.as_str())
        .bind(&sheet.filename)
        .bind(sheet.image_path.to_string_lossy().as_ref())
        .bind(sheet.kind)
        .bind(status)
        .bind(sheet.error)
        .bind(now)
        .execute(pool)
        .await?;
        created += result.rows_affected() as usize;
    }
    Ok(created)
}

pub(crate) async fn list_pending_for_batch(
    pool: &PgPool,
    batch_id: &str,
) -> Result<Vec<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "SELECT {COLUMNS} FROM sheets WHERE batch_id = $1 AND status = 'pending' ORDER BY id"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_by_ids_for_task(
    pool: &PgPool,
    task_id: &str,
    sheet_ids: &[String],
) -> Result<Vec<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "SELECT {COLUMNS} FROM sheets WHERE task_id = $1 AND id = ANY($2) ORDER BY id"
    ))
    .bind(task_id)
    .bind(sheet_ids)
    .fetch_all(pool)
    .await
}

pub(crate) async fn task_ids_for_batch(
    pool: &PgPool,
    batch_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT task_id FROM sheets WHERE batch_id = $1 ORDER BY task_id")
            .bind(batch_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(task_id,)| task_id).collect())
}

