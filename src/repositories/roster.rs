use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::RosterEntry;
use crate::db::types::RowStatus;

pub(crate) const COLUMNS: &str = "id, task_id, student_id, student_name, registered, present, \
     matched_sheet_id, row_status, updated_at";

pub(crate) async fn list_for_task(
    pool: &PgPool,
    task_id: &str,
) -> Result<Vec<RosterEntry>, sqlx::Error> {
    sqlx::query_as::<_, RosterEntry>(&format!(
        "SELECT {COLUMNS} FROM roster_entries WHERE task_id = $1 ORDER BY student_id"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await
}

/// One roster row as submitted by the import endpoint.
pub(crate) struct RosterImportRow {
    pub(crate) student_id: String,
    pub(crate) student_name: Option<String>,
    pub(crate) present: bool,
}

/// Replaces the roster for a task wholesale. Ghost rows left by a
/// previous reconciliation are wiped along with everything else; the
/// caller re-reconciles afterwards so they reappear if the sheets
/// still exist.
pub(crate) async fn replace_for_task(
    pool: &PgPool,
    task_id: &str,
    rows: &[RosterImportRow],
    now: PrimitiveDateTime,
) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM roster_entries WHERE task_id = $1")
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
    for row in rows {
        sqlx::query(
            "INSERT INTO roster_entries
                 (task_id, student_id, student_name, registered, present, row_status, updated_at)
             VALUES ($1, $2, $3, TRUE, $4, $5, $6)",
        )
        .bind(task_id)
        .bind(&row.student_id)
        .bind(&row.student_name)
        .bind(row.present)
        .bind(RowStatus::Missing)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len())
}
