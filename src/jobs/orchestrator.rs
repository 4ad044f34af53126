//! Drives a batch from uploaded archive to completed state, and the
//! reprocess variant that re-grades a sheet subset. Every stage
//! transition is written to the event feed; the dashboard renders those
//! messages verbatim, so their wording is part of the contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{Batch, Sheet};
use crate::db::types::{BatchStatus, SheetStatus};
use crate::jobs::pool::{run_pool, GradeOutcome, GradeTask};
use crate::repositories::{batches, events, sheets};
use crate::services::archive::{extract_archive, ArchiveError};
use crate::services::export::{write_exports, ExportError, SheetExportRow};
use crate::services::grading::ProfileConfig;
use crate::services::loader::{bulk_load, surgical_update, GradedRecord, LoadError};
use crate::services::reconcile::{reconcile_task, ReconcileError};
use crate::services::scan::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobStage {
    Pending,
    Extracting,
    CreatingRecords,
    Dispatching,
    Processing,
    Collecting,
    Exporting,
    Loading,
    Reconciling,
    Completed,
    Failed,
}

impl JobStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::CreatingRecords => "creating_records",
            Self::Dispatching => "dispatching",
            Self::Processing => "processing",
            Self::Collecting => "collecting",
            Self::Exporting => "exporting",
            Self::Loading => "loading",
            Self::Reconciling => "reconciling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// The coarse batch status a stage maps onto. The event feed keeps
    /// the fine-grained stage; the batch row only tracks these.
    pub(crate) fn batch_status(self) -> BatchStatus {
        match self {
            Self::Pending => BatchStatus::Pending,
            Self::Extracting => BatchStatus::Extracting,
            Self::CreatingRecords
            | Self::Dispatching
            | Self::Processing
            | Self::Collecting
            | Self::Exporting => BatchStatus::Processing,
            Self::Loading | Self::Reconciling => BatchStatus::Loading,
            Self::Completed => BatchStatus::Completed,
            Self::Failed => BatchStatus::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum JobError {
    #[error("Job cancelled by operator")]
    Cancelled,
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("background task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Progress events are throttled to roughly ten per job.
fn progress_step(total: usize) -> usize {
    (total / 10).max(1)
}

#[derive(Clone)]
struct JobContext {
    state: AppState,
    job_id: String,
    batch_id: Option<String>,
}

impl JobContext {
    /// Stage transition: batch status update (batch jobs only) plus an
    /// event feed entry.
    async fn enter(&self, stage: JobStage, message: &str) -> Result<(), sqlx::Error> {
        if let Some(batch_id) = &self.batch_id {
            batches::set_status(self.state.db(), batch_id, stage.batch_status()).await?;
        }
        self.note(stage, message).await
    }

    /// Event feed entry without a status change.
    async fn note(&self, stage: JobStage, message: &str) -> Result<(), sqlx::Error> {
        tracing::info!(job_id = %self.job_id, stage = stage.as_str(), "{message}");
        events::append(self.state.db(), &self.job_id, stage.as_str(), message, primitive_now_utc())
            .await
    }

    fn check_cancel(&self, cancel: &watch::Receiver<bool>) -> Result<(), JobError> {
        if *cancel.borrow() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

/// Runs the full batch pipeline. Spawned by the upload handler; the
/// job id is the batch id.
pub(crate) async fn run_batch_job(
    state: AppState,
    batch: Batch,
    profile: ProfileConfig,
    archive_path: PathBuf,
) {
    let cancel = state.jobs().register(&batch.id);
    let ctx = JobContext {
        state: state.clone(),
        job_id: batch.id.clone(),
        batch_id: Some(batch.id.clone()),
    };

    match batch_pipeline(&ctx, &batch, profile, archive_path, cancel).await {
        Ok(()) => {
            metrics::counter!("batch_jobs_total", "kind" => "batch", "status" => "completed")
                .increment(1);
        }
        Err(err) => {
            let message = err.to_string();
            tracing::error!(batch_id = %batch.id, error = %message, "Batch job failed");
            let _ = ctx.note(JobStage::Failed, &format!("Job failed: {message}")).await;
            let _ =
                batches::mark_failed(state.db(), &batch.id, &message, primitive_now_utc()).await;
            metrics::counter!("batch_jobs_total", "kind" => "batch", "status" => "failed")
                .increment(1);
        }
    }

    state.jobs().finish(&batch.id);
}

async fn batch_pipeline(
    ctx: &JobContext,
    batch: &Batch,
    profile: ProfileConfig,
    archive_path: PathBuf,
    cancel: watch::Receiver<bool>,
) -> Result<(), JobError> {
    let storage = ctx.state.settings().storage().clone();

    ctx.enter(JobStage::Extracting, "Starting extraction").await?;
    let extracted = {
        let archive = archive_path.clone();
        let dest = storage.batch_dir(&batch.id);
        let max_bytes = storage.max_archive_size_bytes();
        task::spawn_blocking(move || extract_archive(&archive, &dest, max_bytes)).await??
    };
    ctx.note(JobStage::Extracting, &format!("Extraction complete - {} sheets", extracted.len()))
        .await?;
    ctx.check_cancel(&cancel)?;

    ctx.enter(JobStage::CreatingRecords, "Creating sheet records").await?;
    let invalid = extracted.iter().filter(|sheet| !sheet.is_gradable()).count();
    sheets::create_pending(ctx.state.db(), &batch.id, &extracted, primitive_now_utc()).await?;

    let pending = sheets::list_pending_for_batch(ctx.state.db(), &batch.id).await?;
    let tasks = grade_tasks(&pending);
    ctx.enter(JobStage::Dispatching, &format!("Dispatching {} tasks to workers", tasks.len()))
        .await?;
    ctx.check_cancel(&cancel)?;

    ctx.enter(JobStage::Processing, &format!("Processing: 0/{} sheets completed", tasks.len()))
        .await?;
    let report = graded_with_progress(ctx, tasks, profile, cancel.clone(), |done, total| {
        format!("Processing: {done}/{total} sheets completed")
    })
    .await;
    ctx.note(
        JobStage::Processing,
        &format!("All {} tasks completed ({} failed)", report.outcomes.len(), report.failed),
    )
    .await?;
    if report.cancelled {
        return Err(JobError::Cancelled);
    }

    ctx.enter(JobStage::Collecting, "Collecting worker results").await?;
    let records = collect_records(report.outcomes);
    ctx.note(JobStage::Collecting, &format!("Collected {} results", records.len())).await?;

    ctx.enter(JobStage::Exporting, "Generating CSV files").await?;
    let summary = {
        let rows = export_rows(&pending, &records);
        let dir = storage.exports_dir();
        let job_id = ctx.job_id.clone();
        task::spawn_blocking(move || write_exports(&dir, &job_id, &rows)).await??
    };
    ctx.note(
        JobStage::Exporting,
        &format!("CSV generation complete: {} sheets, {} answers", summary.sheets, summary.answers),
    )
    .await?;

    // Cancellation past this point is ignored: a partially loaded batch
    // is worse than a completed one.
    ctx.check_cancel(&cancel)?;

    ctx.enter(JobStage::Loading, "Loading to database").await?;
    let task_ids = sheets::task_ids_for_batch(ctx.state.db(), &batch.id).await?;
    let guards = ctx.state.jobs().lock_tasks(&task_ids).await;
    let outcome =
        bulk_load(ctx.state.db(), &batch.id, batch.upload_strategy, &task_ids, &records).await?;
    ctx.note(
        JobStage::Loading,
        &format!(
            "Database load complete: {} sheets, {} answers in {}ms",
            outcome.sheets, outcome.answers, outcome.elapsed_ms
        ),
    )
    .await?;

    ctx.enter(JobStage::Reconciling, "Finalizing scores").await?;
    for task_id in &task_ids {
        reconcile_task(ctx.state.db(), task_id).await?;
    }
    drop(guards);

    ctx.note(JobStage::Loading, "Cleaning up batch files").await?;
    if let Err(err) = tokio::fs::remove_file(&archive_path).await {
        tracing::warn!(path = %archive_path.display(), error = %err, "Archive cleanup failed");
    }

    let completed = records.iter().filter(|r| r.status == SheetStatus::Graded).count();
    let failed = records.len() - completed + invalid;
    batches::set_counts(
        ctx.state.db(),
        &batch.id,
        extracted.len() as i32,
        completed as i32,
        failed as i32,
    )
    .await?;
    batches::mark_completed(ctx.state.db(), &batch.id, primitive_now_utc()).await?;
    ctx.note(JobStage::Completed, "Batch completed successfully").await?;
    Ok(())
}

/// Re-grades an explicit sheet subset under a (possibly different)
/// profile and surgically replaces their answer sets.
pub(crate) async fn run_reprocess_job(
    state: AppState,
    job_id: String,
    subset: Vec<Sheet>,
    profile: ProfileConfig,
) {
    let cancel = state.jobs().register(&job_id);
    let ctx = JobContext { state: state.clone(), job_id: job_id.clone(), batch_id: None };

    match reprocess_pipeline(&ctx, subset, profile, cancel).await {
        Ok(()) => {
            metrics::counter!("batch_jobs_total", "kind" => "reprocess", "status" => "completed")
                .increment(1);
        }
        Err(err) => {
            let message = err.to_string();
            tracing::error!(job_id = %job_id, error = %message, "Reprocess job failed");
            let _ = ctx.note(JobStage::Failed, &format!("Job failed: {message}")).await;
            metrics::counter!("batch_jobs_total", "kind" => "reprocess", "status" => "failed")
                .increment(1);
        }
    }

    state.jobs().finish(&job_id);
}

async fn reprocess_pipeline(
    ctx: &JobContext,
    subset: Vec<Sheet>,
    profile: ProfileConfig,
    cancel: watch::Receiver<bool>,
) -> Result<(), JobError> {
    ctx.note(
        JobStage::Dispatching,
        &format!("Initializing reprocess job for {} sheets", subset.len()),
    )
    .await?;

    let tasks = grade_tasks(&subset);
    let report = graded_with_progress(ctx, tasks, profile, cancel.clone(), |done, total| {
        format!("processed {done}/{total} sheets")
    })
    .await;
    if report.cancelled {
        return Err(JobError::Cancelled);
    }

    let records = collect_records(report.outcomes);

    ctx.note(JobStage::Exporting, "Generating CSV for database update").await?;
    {
        let rows = export_rows(&subset, &records);
        let dir = ctx.state.settings().storage().exports_dir();
        let job_id = ctx.job_id.clone();
        task::spawn_blocking(move || write_exports(&dir, &job_id, &rows)).await??;
    }

    ctx.check_cancel(&cancel)?;
    ctx.note(JobStage::Loading, "Loading reprocessed data").await?;
    let mut task_ids: Vec<String> = subset.iter().map(|sheet| sheet.task_id.clone()).collect();
    task_ids.sort();
    task_ids.dedup();
    let guards = ctx.state.jobs().lock_tasks(&task_ids).await;
    surgical_update(ctx.state.db(), &records).await?;

    ctx.note(JobStage::Reconciling, "Finalizing scores").await?;
    for task_id in &task_ids {
        reconcile_task(ctx.state.db(), task_id).await?;
    }
    drop(guards);

    ctx.note(JobStage::Completed, "Reprocessing completed successfully").await?;
    Ok(())
}

fn grade_tasks(sheet_rows: &[Sheet]) -> Vec<GradeTask> {
    sheet_rows
        .iter()
        .filter_map(|sheet| {
            let Some(task_id) = TaskId::parse(&sheet.task_id) else {
                tracing::warn!(sheet_id = %sheet.id, task_id = %sheet.task_id, "Skipping sheet with malformed task id");
                return None;
            };
            Some(GradeTask {
                sheet_id: sheet.id.clone(),
                kind: sheet.kind,
                task_id,
                image_path: PathBuf::from(&sheet.image_path),
            })
        })
        .collect()
}

/// Runs the grading pool while forwarding throttled progress messages
/// to the event feed.
async fn graded_with_progress(
    ctx: &JobContext,
    tasks: Vec<GradeTask>,
    profile: ProfileConfig,
    cancel: watch::Receiver<bool>,
    render: impl Fn(usize, usize) -> String + Send + 'static,
) -> crate::jobs::pool::PoolReport {
    let step = progress_step(tasks.len());
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, usize)>();

    let feed_ctx = ctx.clone();
    let feed = tokio::spawn(async move {
        while let Some((done, total)) = progress_rx.recv().await {
            let _ = feed_ctx.note(JobStage::Processing, &render(done, total)).await;
        }
    });

    let settings = ctx.state.settings().pipeline();
    let report = run_pool(
        ctx.state.grader(),
        profile,
        tasks,
        settings.effective_worker_count(),
        Duration::from_secs(settings.grade_timeout_seconds),
        cancel,
        move |done, total| {
            if done % step == 0 || done == total {
                let _ = progress_tx.send((done, total));
            }
        },
    )
    .await;

    let _ = feed.await;
    report
}

fn collect_records(outcomes: Vec<GradeOutcome>) -> Vec<GradedRecord> {
    outcomes
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(graded) => GradedRecord {
                sheet_id: outcome.sheet_id,
                student_id: Some(graded.student_id),
                status: SheetStatus::Graded,
                error_kind: None,
                answers: graded.answers,
                score: graded.score,
            },
            Err(failure) => GradedRecord {
                sheet_id: outcome.sheet_id,
                student_id: failure.student_id,
                status: SheetStatus::Error,
                error_kind: Some(failure.kind),
                answers: Vec::new(),
                score: 0,
            },
        })
        .collect()
}

fn export_rows(sheet_rows: &[Sheet], records: &[GradedRecord]) -> Vec<SheetExportRow> {
    let meta: HashMap<&str, &Sheet> =
        sheet_rows.iter().map(|sheet| (sheet.id.as_str(), sheet)).collect();
    records
        .iter()
        .filter_map(|record| {
            let sheet = meta.get(record.sheet_id.as_str())?;
            Some(SheetExportRow {
                sheet_id: record.sheet_id.clone(),
                task_id: sheet.task_id.clone(),
                source_filename: sheet.source_filename.clone(),
                kind: sheet.kind,
                student_id: record.student_id.clone(),
                status: record.status,
                error_kind: record.error_kind,
                score: (record.status == SheetStatus::Graded).then_some(record.score),
                answers: record.answers.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_stable() {
        assert_eq!(JobStage::CreatingRecords.as_str(), "creating_records");
        assert_eq!(JobStage::Reconciling.as_str(), "reconciling");
        assert_eq!(JobStage::Failed.as_str(), "failed");
    }

    #[test]
    fn fine_stages_collapse_to_coarse_batch_status() {
        assert_eq!(JobStage::Dispatching.batch_status(), BatchStatus::Processing);
        assert_eq!(JobStage::Exporting.batch_status(), BatchStatus::Processing);
        assert_eq!(JobStage::Reconciling.batch_status(), BatchStatus::Loading);
        assert_eq!(JobStage::Completed.batch_status(), BatchStatus::Completed);
    }

    #[test]
    fn cancellation_message_matches_feed_contract() {
        assert_eq!(JobError::Cancelled.to_string(), "Job cancelled by operator");
    }

    #[test]
    fn progress_step_yields_about_ten_events() {
        assert_eq!(progress_step(0), 1);
        assert_eq!(progress_step(7), 1);
        assert_eq!(progress_step(100), 10);
        assert_eq!(progress_step(1234), 123);
    }

    #[test]
    fn failed_grade_becomes_error_record_without_answers() {
        use crate::db::types::ErrorKind;
        use crate::services::grading::GradeFailure;

        let outcomes = vec![GradeOutcome {
            sheet_id: "s1".to_string(),
            result: Err(GradeFailure {
                kind: ErrorKind::LowAnswerCount,
                message: "only 12 of 150 questions legible".to_string(),
                student_id: Some("1234567890".to_string()),
            }),
        }];
        let records = collect_records(outcomes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SheetStatus::Error);
        assert_eq!(records[0].error_kind, Some(ErrorKind::LowAnswerCount));
        assert!(records[0].answers.is_empty());
        assert_eq!(records[0].score, 0);
    }

    #[test]
    fn error_record_keeps_the_readable_student_id() {
        use crate::db::types::ErrorKind;
        use crate::services::grading::GradeFailure;

        let outcomes = vec![
            GradeOutcome {
                sheet_id: "s1".to_string(),
                result: Err(GradeFailure {
                    kind: ErrorKind::ExamCenterMismatch,
                    message: "sheet center 9999 vs task 9001".to_string(),
                    student_id: Some("1234567890".to_string()),
                }),
            },
            GradeOutcome {
                sheet_id: "s2".to_string(),
                result: Err(GradeFailure {
                    kind: ErrorKind::StudentIdUnreadable,
                    message: "student id digits unreadable".to_string(),
                    student_id: None,
                }),
            },
        ];
        let records = collect_records(outcomes);
        // Error sheets with a readable id stay matchable against the roster.
        assert_eq!(records[0].student_id.as_deref(), Some("1234567890"));
        assert_eq!(records[1].student_id, None);
    }
}
