//! Persists grading outcomes. A first load is all-or-nothing for the
//! batch; a reprocess goes through the surgical path, which touches only
//! the explicitly requested sheets and is idempotent.

use std::collections::HashSet;
use std::time::Instant;

use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;

use crate::core::time::primitive_now_utc;
use crate::db::models::AnswerMark;
use crate::db::types::{ErrorKind, SheetStatus, UploadStrategy};

#[derive(Debug, Error)]
pub(crate) enum LoadError {
    #[error("database load failed: {0}")]
    Db(#[from] sqlx::Error),
}

/// Terminal grading outcome for one sheet, ready to persist.
#[derive(Debug, Clone)]
pub(crate) struct GradedRecord {
    pub(crate) sheet_id: String,
    pub(crate) student_id: Option<String>,
    pub(crate) status: SheetStatus,
    pub(crate) error_kind: Option<ErrorKind>,
    pub(crate) answers: Vec<AnswerMark>,
    pub(crate) score: i32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadOutcome {
    pub(crate) sheets: usize,
    pub(crate) answers: usize,
    pub(crate) elapsed_ms: u128,
}

/// Initial batch load: applies every grading outcome and inserts the
/// answer sets in one transaction. The upload strategy decides how the
/// batch interacts with sheets already loaded for the same tasks.
pub(crate) async fn bulk_load(
    pool: &PgPool,
    batch_id: &str,
    strategy: UploadStrategy,
    task_ids: &[String],
    records: &[GradedRecord],
) -> Result<LoadOutcome, LoadError> {
    let started = Instant::now();
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    match strategy {
        UploadStrategy::Replace => {
            // The batch supersedes whatever earlier batches loaded for
            // these tasks.
            sqlx::query("DELETE FROM sheets WHERE task_id = ANY($1) AND batch_id <> $2")
                .bind(task_ids)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
        }
        UploadStrategy::Merge | UploadStrategy::Append => {}
    }

    let mut answers = 0;
    for record in records {
        let updated = apply_record(&mut tx, record, now).await?;
        if updated {
            answers += record.answers.len();
        }
    }

    let mut sheets = records.len();
    if strategy == UploadStrategy::Merge {
        // Collisions can only be detected once the batch's own student
        // ids are written; the earlier read wins, so the incoming row
        // is the one dropped.
        let dropped: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM sheets
             WHERE batch_id = $1
               AND student_id IS NOT NULL
               AND EXISTS (
                   SELECT 1 FROM sheets other
                   WHERE other.batch_id <> $1
                     AND other.task_id = sheets.task_id
                     AND other.student_id = sheets.student_id
                     AND other.status = 'graded'
               )
             RETURNING id",
        )
        .bind(batch_id)
        .fetch_all(&mut *tx)
        .await?;
        let dropped: HashSet<String> = dropped.into_iter().map(|(id,)| id).collect();
        (sheets, answers) = merge_surviving_counts(records, &dropped);
    }

    tx.commit().await?;

    Ok(LoadOutcome { sheets, answers, elapsed_ms: started.elapsed().as_millis() })
}

/// Load-outcome counts after a merge: dropped rows contribute neither
/// sheets nor answers.
fn merge_surviving_counts(
    records: &[GradedRecord],
    dropped: &HashSet<String>,
) -> (usize, usize) {
    let mut sheets = 0;
    let mut answers = 0;
    for record in records {
        if dropped.contains(&record.sheet_id) {
            continue;
        }
        sheets += 1;
        if record.status == SheetStatus::Graded {
            answers += record.answers.len();
        }
    }
    (sheets, answers)
}

/// Surgical update: replaces only the answer sets of the requested sheet
/// subset. Running the same request twice produces the same rows, and a
/// failure rolls back without touching any sheet outside the subset.
pub(crate) async fn surgical_update(
    pool: &PgPool,
    records: &[GradedRecord],
) -> Result<LoadOutcome, LoadError> {
    let started = Instant::now();
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    let mut answers = 0;
    for record in records {
        if apply_record(&mut tx, record, now).await? {
            answers += record.answers.len();
        }
    }

    tx.commit().await?;

    Ok(LoadOutcome { sheets: records.len(), answers, elapsed_ms: started.elapsed().as_millis() })
}

/// Writes one grading outcome: sheet row update plus answer-set upsert.
/// Returns false when the sheet row no longer exists (e.g. dropped by a
/// merge collision earlier in the same transaction).
async fn apply_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &GradedRecord,
    now: time::PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sheets
         SET student_id = $2, status = $3, error_kind = $4, updated_at = $5
         WHERE id = $1",
    )
    .bind(&record.sheet_id)
    .bind(&record.student_id)
    .bind(record.status)
    .bind(record.error_kind)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    match record.status {
        SheetStatus::Graded => {
            sqlx::query(
                "INSERT INTO answer_sets (sheet_id, answers, score, graded_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (sheet_id) DO UPDATE
                 SET answers = EXCLUDED.answers,
                     score = EXCLUDED.score,
                     graded_at = EXCLUDED.graded_at",
            )
            .bind(&record.sheet_id)
            .bind(Json(&record.answers))
            .bind(record.score)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        SheetStatus::Error | SheetStatus::Pending => {
            // A sheet that regressed to error on reprocess loses its
            // previous answers.
            sqlx::query("DELETE FROM answer_sets WHERE sheet_id = $1")
                .bind(&record.sheet_id)
                .execute(&mut **tx)
                .await?;
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sheet_id: &str, status: SheetStatus, marks: usize) -> GradedRecord {
        GradedRecord {
            sheet_id: sheet_id.to_string(),
            student_id: Some("1234567890".to_string()),
            status,
            error_kind: None,
            answers: (0..marks)
                .map(|i| AnswerMark { question_number: i as u16 + 1, chosen_answer: 'A' })
                .collect(),
            score: marks as i32,
        }
    }

    #[test]
    fn merge_counts_exclude_dropped_collisions() {
        let records = vec![
            record("s1", SheetStatus::Graded, 150),
            record("s2", SheetStatus::Graded, 148),
            record("s3", SheetStatus::Error, 0),
        ];
        let dropped: HashSet<String> = ["s2".to_string()].into_iter().collect();
        let (sheets, answers) = merge_surviving_counts(&records, &dropped);
        assert_eq!(sheets, 2);
        assert_eq!(answers, 150);
    }

    #[test]
    fn merge_with_no_collisions_counts_everything() {
        let records =
            vec![record("s1", SheetStatus::Graded, 150), record("s2", SheetStatus::Graded, 150)];
        let (sheets, answers) = merge_surviving_counts(&records, &HashSet::new());
        assert_eq!(sheets, 2);
        assert_eq!(answers, 300);
    }
}
