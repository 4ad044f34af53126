use serde::Serialize;
use sqlx::PgPool;

/// Aggregate counters over sheets and roster entries. Always recomputed
/// from row state, never stored.
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct StatsSummary {
    pub(crate) registered_total: i64,
    pub(crate) present_total: i64,
    pub(crate) sheets_total: i64,
    pub(crate) actual_sheets_total: i64,
    pub(crate) error_total: i64,
    pub(crate) err_duplicate_sheets_total: i64,
    pub(crate) err_low_answer_total: i64,
    pub(crate) err_student_id_total: i64,
    pub(crate) err_exam_center_id_total: i64,
    pub(crate) err_class_level_total: i64,
    pub(crate) err_class_group_total: i64,
}

type SheetCounters = (i64, i64, i64, i64, i64, i64, i64, i64, i64, i64);

const SHEET_COUNTERS: &str = "COUNT(*),
     COUNT(*) FILTER (WHERE kind = 'answer'),
     COUNT(*) FILTER (WHERE status = 'error'),
     COUNT(*) FILTER (WHERE error_kind = 'duplicate_sheet'),
     COUNT(DISTINCT (task_id, student_id)) FILTER (WHERE error_kind = 'duplicate_sheet'),
     COUNT(*) FILTER (WHERE error_kind = 'low_answer_count'),
     COUNT(*) FILTER (WHERE error_kind = 'student_id_unreadable'),
     COUNT(*) FILTER (WHERE error_kind = 'exam_center_mismatch'),
     COUNT(*) FILTER (WHERE error_kind = 'class_level_mismatch'),
     COUNT(*) FILTER (WHERE error_kind = 'class_group_mismatch')";

fn assemble(roster: (i64, i64), sheets: SheetCounters) -> StatsSummary {
    let (registered_total, present_total) = roster;
    let (
        sheets_total,
        actual_sheets_total,
        error_total,
        dup_flagged,
        dup_groups,
        err_low_answer_total,
        err_student_id_total,
        err_exam_center_id_total,
        err_class_level_total,
        err_class_group_total,
    ) = sheets;
    StatsSummary {
        registered_total,
        present_total,
        sheets_total,
        actual_sheets_total,
        error_total,
        // Every sheet in a collision group carries the flag; the counter
        // reports the excess copies, one per extra duplicate.
        err_duplicate_sheets_total: dup_flagged - dup_groups,
        err_low_answer_total,
        err_student_id_total,
        err_exam_center_id_total,
        err_class_level_total,
        err_class_group_total,
    }
}

/// Batch-level stats. Roster counters cover every task the batch's
/// sheets touch because the dashboard shows a batch against live
/// roster state, not against a snapshot.
pub(crate) async fn batch_stats(
    pool: &PgPool,
    batch_id: &str,
) -> Result<StatsSummary, sqlx::Error> {
    let roster: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*) FILTER (WHERE registered), COUNT(*) FILTER (WHERE present)
         FROM roster_entries
         WHERE task_id IN (SELECT DISTINCT task_id FROM sheets WHERE batch_id = $1)",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;

    let sheets: SheetCounters =
        sqlx::query_as(&format!("SELECT {SHEET_COUNTERS} FROM sheets WHERE batch_id = $1"))
            .bind(batch_id)
            .fetch_one(pool)
            .await?;

    Ok(assemble(roster, sheets))
}

pub(crate) async fn task_stats(pool: &PgPool, task_id: &str) -> Result<StatsSummary, sqlx::Error> {
    let roster: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*) FILTER (WHERE registered), COUNT(*) FILTER (WHERE present)
         FROM roster_entries WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await?;

    let sheets: SheetCounters =
        sqlx::query_as(&format!("SELECT {SHEET_COUNTERS} FROM sheets WHERE task_id = $1"))
            .bind(task_id)
            .fetch_one(pool)
            .await?;

    Ok(assemble(roster, sheets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_counter_reports_one_per_extra_copy() {
        // Two collision groups: one pair and one triple, five flagged rows.
        let summary = assemble((30, 28), (40, 36, 3, 5, 2, 1, 1, 1, 0, 0));
        assert_eq!(summary.err_duplicate_sheets_total, 3);
        assert_eq!(summary.sheets_total, 40);
        assert_eq!(summary.error_total, 3);
    }

    #[test]
    fn no_duplicates_means_a_zero_counter() {
        let summary = assemble((10, 10), (12, 10, 0, 0, 0, 0, 0, 0, 0, 0));
        assert_eq!(summary.err_duplicate_sheets_total, 0);
    }
}
