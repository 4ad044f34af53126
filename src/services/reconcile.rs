//! Joins roster entries against the answer sheets loaded for a task and
//! assigns every entry a row status. The whole task is recomputed on
//! each run; nothing is patched incrementally, so a reprocessed sheet
//! can never leave a stale status behind.

use std::collections::{BTreeMap, HashSet};

use sqlx::PgPool;
use thiserror::Error;

use crate::core::time::primitive_now_utc;
use crate::db::types::{ErrorKind, RowStatus, SheetStatus};

#[derive(Debug, Error)]
pub(crate) enum ReconcileError {
    #[error("roster reconciliation failed: {0}")]
    Db(#[from] sqlx::Error),
}

/// A sheet that resolved to a roster entry's student id.
#[derive(Debug, Clone)]
pub(crate) struct MatchingSheet {
    pub(crate) sheet_id: String,
    pub(crate) status: SheetStatus,
    pub(crate) error_kind: Option<ErrorKind>,
}

impl MatchingSheet {
    fn is_graded(&self) -> bool {
        self.status == SheetStatus::Graded
    }
}

/// Pure classification. Priority order is fixed and must stay stable
/// across versions: reclassifying historical audit data silently is
/// worse than an imperfect ordering.
pub(crate) fn classify(
    registered: bool,
    present: bool,
    sheets: &[MatchingSheet],
) -> (RowStatus, Option<String>) {
    let graded: Vec<&MatchingSheet> = sheets.iter().filter(|s| s.is_graded()).collect();
    let first_graded = graded.first().map(|s| s.sheet_id.clone());
    let first_any = sheets.first().map(|s| s.sheet_id.clone());

    if !registered && !sheets.is_empty() {
        return (RowStatus::Ghost, first_graded.or(first_any));
    }
    if graded.len() > 1 {
        return (RowStatus::Duplicate, first_graded);
    }
    if registered && present {
        if let [only] = graded.as_slice() {
            if only.error_kind.is_none() {
                return (RowStatus::Ok, first_graded);
            }
        }
        if sheets.is_empty() {
            return (RowStatus::Missing, None);
        }
    }
    if registered && !present {
        if sheets.is_empty() {
            return (RowStatus::Absent, None);
        }
        return (RowStatus::AbsentMismatch, first_graded.or(first_any));
    }
    if !sheets.is_empty() {
        return (RowStatus::Error, first_graded.or(first_any));
    }
    (RowStatus::Unexpected, None)
}

struct TaskSheetRow {
    sheet_id: String,
    student_id: Option<String>,
    status: SheetStatus,
    error_kind: Option<ErrorKind>,
}

struct RosterRow {
    id: i64,
    student_id: String,
    registered: bool,
    present: bool,
}

/// Full recompute of every roster entry for one task, in a single
/// transaction. Also re-derives the duplicate flags on the task's
/// graded answer sheets and inserts ghost entries for student ids that
/// have sheets but no roster row.
pub(crate) async fn reconcile_task(pool: &PgPool, task_id: &str) -> Result<(), ReconcileError> {
    let now = primitive_now_utc();
    let mut tx = pool.begin().await?;

    let sheets: Vec<TaskSheetRow> = sqlx::query_as::<_, (String, Option<String>, SheetStatus, Option<ErrorKind>)>(
        "SELECT id, student_id, status, error_kind
         FROM sheets
         WHERE task_id = $1 AND kind = 'answer' AND status <> 'pending'
         ORDER BY id",
    )
    .bind(task_id)
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .map(|(sheet_id, student_id, status, error_kind)| TaskSheetRow {
        sheet_id,
        student_id,
        status,
        error_kind,
    })
    .collect();

    // Clear stale duplicate flags before re-deriving them.
    sqlx::query(
        "UPDATE sheets SET error_kind = NULL, updated_at = $2
         WHERE task_id = $1 AND status = 'graded' AND error_kind = 'duplicate_sheet'",
    )
    .bind(task_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let mut by_student: BTreeMap<String, Vec<MatchingSheet>> = BTreeMap::new();
    for sheet in &sheets {
        let Some(student_id) = &sheet.student_id else { continue };
        let error_kind = match sheet.error_kind {
            Some(ErrorKind::DuplicateSheet) => None,
            other => other,
        };
        by_student.entry(student_id.clone()).or_default().push(MatchingSheet {
            sheet_id: sheet.sheet_id.clone(),
            status: sheet.status,
            error_kind,
        });
    }

    for matches in by_student.values() {
        let graded: Vec<&MatchingSheet> = matches.iter().filter(|s| s.is_graded()).collect();
        if graded.len() > 1 {
            for sheet in graded {
                sqlx::query(
                    "UPDATE sheets SET error_kind = 'duplicate_sheet', updated_at = $2
                     WHERE id = $1",
                )
                .bind(&sheet.sheet_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    let roster: Vec<RosterRow> = sqlx::query_as::<_, (i64, String, bool, bool)>(
        "SELECT id, student_id, registered, present FROM roster_entries WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .map(|(id, student_id, registered, present)| RosterRow { id, student_id, registered, present })
    .collect();

    let known: HashSet<&str> = roster.iter().map(|row| row.student_id.as_str()).collect();
    for student_id in by_student.keys() {
        if !known.contains(student_id.as_str()) {
            sqlx::query(
                "INSERT INTO roster_entries
                     (task_id, student_id, registered, present, row_status, updated_at)
                 VALUES ($1, $2, FALSE, FALSE, 'GHOST', $3)
                 ON CONFLICT (task_id, student_id) DO NOTHING",
            )
            .bind(task_id)
            .bind(student_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
    }

    let empty: Vec<MatchingSheet> = Vec::new();
    for row in &roster {
        let matches = by_student.get(&row.student_id).unwrap_or(&empty);
        let (row_status, matched_sheet_id) = classify(row.registered, row.present, matches);
        sqlx::query(
            "UPDATE roster_entries
             SET row_status = $2, matched_sheet_id = $3, updated_at = $4
             WHERE id = $1",
        )
        .bind(row.id)
        .bind(row_status)
        .bind(matched_sheet_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    // Ghost rows inserted above also get their matched sheet recorded.
    for (student_id, matches) in &by_student {
        if !known.contains(student_id.as_str()) {
            let (row_status, matched_sheet_id) = classify(false, false, matches);
            sqlx::query(
                "UPDATE roster_entries
                 SET row_status = $3, matched_sheet_id = $4, updated_at = $5
                 WHERE task_id = $1 AND student_id = $2",
            )
            .bind(task_id)
            .bind(student_id)
            .bind(row_status)
            .bind(matched_sheet_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graded(id: &str) -> MatchingSheet {
        MatchingSheet { sheet_id: id.to_string(), status: SheetStatus::Graded, error_kind: None }
    }

    fn errored(id: &str, kind: ErrorKind) -> MatchingSheet {
        MatchingSheet {
            sheet_id: id.to_string(),
            status: SheetStatus::Error,
            error_kind: Some(kind),
        }
    }

    #[test]
    fn registered_present_with_clean_sheet_is_ok() {
        let (status, matched) = classify(true, true, &[graded("s1")]);
        assert_eq!(status, RowStatus::Ok);
        assert_eq!(matched.as_deref(), Some("s1"));
    }

    #[test]
    fn registered_present_without_sheet_is_missing() {
        assert_eq!(classify(true, true, &[]).0, RowStatus::Missing);
    }

    #[test]
    fn registered_absent_without_sheet_is_absent() {
        assert_eq!(classify(true, false, &[]).0, RowStatus::Absent);
    }

    #[test]
    fn sheet_for_absent_entry_is_a_mismatch() {
        let (status, matched) = classify(true, false, &[graded("s1")]);
        assert_eq!(status, RowStatus::AbsentMismatch);
        assert_eq!(matched.as_deref(), Some("s1"));
    }

    #[test]
    fn unregistered_entry_with_sheet_is_ghost() {
        assert_eq!(classify(false, false, &[graded("s1")]).0, RowStatus::Ghost);
    }

    #[test]
    fn ghost_takes_priority_over_duplicate() {
        let status = classify(false, true, &[graded("s1"), graded("s2")]).0;
        assert_eq!(status, RowStatus::Ghost);
    }

    #[test]
    fn two_graded_sheets_are_a_duplicate() {
        let (status, matched) = classify(true, true, &[graded("s1"), graded("s2")]);
        assert_eq!(status, RowStatus::Duplicate);
        assert_eq!(matched.as_deref(), Some("s1"));
    }

    #[test]
    fn duplicate_takes_priority_over_absent_mismatch() {
        assert_eq!(classify(true, false, &[graded("s1"), graded("s2")]).0, RowStatus::Duplicate);
    }

    #[test]
    fn error_sheet_for_present_entry_is_error() {
        let sheets = [errored("s1", ErrorKind::ExamCenterMismatch)];
        assert_eq!(classify(true, true, &sheets).0, RowStatus::Error);
    }

    #[test]
    fn unregistered_without_sheet_is_unexpected() {
        assert_eq!(classify(false, false, &[]).0, RowStatus::Unexpected);
    }

    #[test]
    fn classification_is_idempotent() {
        let cases: &[(bool, bool, Vec<MatchingSheet>)] = &[
            (true, true, vec![graded("s1")]),
            (true, true, vec![]),
            (true, false, vec![errored("s1", ErrorKind::LowAnswerCount)]),
            (false, false, vec![graded("s1"), graded("s2")]),
        ];
        for (registered, present, sheets) in cases {
            let first = classify(*registered, *present, sheets);
            let second = classify(*registered, *present, sheets);
            assert_eq!(first, second);
        }
    }
}
