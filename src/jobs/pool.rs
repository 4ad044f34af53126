//! Fan-out/fan-in for the grading stage: a shared queue, a bounded set
//! of workers, and a collector that acts as the join barrier. No stage
//! after grading starts until every dispatched sheet has a terminal
//! outcome.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task;

use crate::db::types::{ErrorKind, SheetKind};
use crate::services::grading::{GradeFailure, GradedAnswers, ProfileConfig, SheetGrader};
use crate::services::scan::TaskId;

#[derive(Debug, Clone)]
pub(crate) struct GradeTask {
    pub(crate) sheet_id: String,
    pub(crate) kind: SheetKind,
    pub(crate) task_id: TaskId,
    pub(crate) image_path: PathBuf,
}

#[derive(Debug)]
pub(crate) struct GradeOutcome {
    pub(crate) sheet_id: String,
    pub(crate) result: Result<GradedAnswers, GradeFailure>,
}

#[derive(Debug)]
pub(crate) struct PoolReport {
    pub(crate) outcomes: Vec<GradeOutcome>,
    pub(crate) completed: usize,
    pub(crate) failed: usize,
    pub(crate) cancelled: bool,
}

/// Grades every task with up to `workers` parallel workers. Each sheet
/// reaches exactly one terminal outcome; a per-sheet timeout converts a
/// stuck grade into an error instead of hanging the batch. On
/// cancellation, in-flight sheets finish and the remainder of the queue
/// is abandoned.
pub(crate) async fn run_pool(
    grader: Arc<dyn SheetGrader>,
    profile: ProfileConfig,
    tasks: Vec<GradeTask>,
    workers: usize,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    mut on_progress: impl FnMut(usize, usize),
) -> PoolReport {
    let total = tasks.len();
    let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<GradeOutcome>(workers.max(1) * 2);

    let mut handles = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        handles.push(tokio::spawn(worker_loop(
            grader.clone(),
            profile.clone(),
            queue.clone(),
            timeout,
            cancel.clone(),
            outcome_tx.clone(),
        )));
    }
    drop(outcome_tx);

    let mut outcomes = Vec::with_capacity(total);
    let mut completed = 0;
    let mut failed = 0;
    while let Some(outcome) = outcome_rx.recv().await {
        if outcome.result.is_ok() {
            completed += 1;
        } else {
            failed += 1;
        }
        outcomes.push(outcome);
        on_progress(completed + failed, total);
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Grading worker join failed");
        }
    }

    let cancelled = *cancel.borrow();
    PoolReport { outcomes, completed, failed, cancelled }
}

async fn worker_loop(
    grader: Arc<dyn SheetGrader>,
    profile: ProfileConfig,
    queue: Arc<Mutex<VecDeque<GradeTask>>>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    outcome_tx: mpsc::Sender<GradeOutcome>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        let Some(task) = queue.lock().expect("queue poisoned").pop_front() else {
            break;
        };

        let result = grade_one(grader.clone(), profile.clone(), &task, timeout).await;
        if result.is_ok() {
            metrics::counter!("grading_sheets_total", "status" => "ok").increment(1);
        } else {
            metrics::counter!("grading_sheets_total", "status" => "failed").increment(1);
        }

        let outcome = GradeOutcome { sheet_id: task.sheet_id.clone(), result };
        if outcome_tx.send(outcome).await.is_err() {
            break;
        }
    }
}

async fn grade_one(
    grader: Arc<dyn SheetGrader>,
    profile: ProfileConfig,
    task: &GradeTask,
    timeout: Duration,
) -> Result<GradedAnswers, GradeFailure> {
    let payload = match tokio::fs::read(&task.image_path).await {
        Ok(payload) => payload,
        Err(err) => {
            return Err(GradeFailure {
                kind: ErrorKind::Unreadable,
                message: format!("failed to read sheet image: {err}"),
                student_id: None,
            })
        }
    };

    let kind = task.kind;
    let task_id = task.task_id.clone();
    let started = std::time::Instant::now();
    let graded = tokio::time::timeout(
        timeout,
        task::spawn_blocking(move || grader.grade(&payload, kind, &task_id, &profile)),
    )
    .await;
    metrics::histogram!("grading_duration_seconds").record(started.elapsed().as_secs_f64());

    match graded {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(GradeFailure {
            kind: ErrorKind::Unreadable,
            message: format!("grading worker panicked: {join_err}"),
            student_id: None,
        }),
        Err(_) => Err(GradeFailure {
            kind: ErrorKind::Timeout,
            message: format!("grading exceeded {}s ceiling", timeout.as_secs()),
            student_id: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::grading::ThresholdGrader;
    use crate::test_support::{answer_grid, scan_payload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn write_sheet(dir: &std::path::Path, name: &str, payload: &[u8]) -> GradeTask {
        let path = dir.join(name);
        std::fs::write(&path, payload).expect("write payload");
        GradeTask {
            sheet_id: name.to_string(),
            kind: SheetKind::Answer,
            task_id: TaskId::parse("90011201").expect("task"),
            image_path: path,
        }
    }

    fn idle_cancel() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn pool_reaches_barrier_with_mixed_outcomes() {
        let dir = tempdir().expect("tempdir");
        let good = scan_payload("1234567890", "9001", 1, 2, &answer_grid(150, 0));
        let bad = scan_payload("1234567891", "9999", 1, 2, &answer_grid(150, 0));

        let tasks = vec![
            write_sheet(dir.path(), "s1", &good),
            write_sheet(dir.path(), "s2", &bad),
            write_sheet(dir.path(), "s3", &good),
        ];

        let progress_calls = AtomicUsize::new(0);
        let report = run_pool(
            Arc::new(ThresholdGrader),
            ProfileConfig::default(),
            tasks,
            2,
            Duration::from_secs(5),
            idle_cancel(),
            |_done, _total| {
                progress_calls.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.cancelled);
        assert_eq!(progress_calls.load(Ordering::SeqCst), 3);

        let failed = report
            .outcomes
            .iter()
            .find(|o| o.sheet_id == "s2")
            .and_then(|o| o.result.as_ref().err())
            .expect("failure for s2");
        assert_eq!(failed.kind, ErrorKind::ExamCenterMismatch);
    }

    #[tokio::test]
    async fn missing_image_becomes_an_error_outcome() {
        let dir = tempdir().expect("tempdir");
        let task = GradeTask {
            sheet_id: "gone".to_string(),
            kind: SheetKind::Answer,
            task_id: TaskId::parse("90011201").expect("task"),
            image_path: dir.path().join("gone.img"),
        };

        let report = run_pool(
            Arc::new(ThresholdGrader),
            ProfileConfig::default(),
            vec![task],
            1,
            Duration::from_secs(5),
            idle_cancel(),
            |_, _| {},
        )
        .await;

        assert_eq!(report.failed, 1);
        let outcome = report.outcomes.first().expect("outcome");
        assert_eq!(
            outcome.result.as_ref().err().map(|e| e.kind),
            Some(ErrorKind::Unreadable)
        );
    }

    struct SlowGrader;

    impl SheetGrader for SlowGrader {
        fn grade(
            &self,
            _payload: &[u8],
            _kind: SheetKind,
            _task: &TaskId,
            _profile: &ProfileConfig,
        ) -> Result<GradedAnswers, GradeFailure> {
            std::thread::sleep(Duration::from_secs(5));
            Ok(GradedAnswers {
                student_id: "1234567890".to_string(),
                answers: Vec::new(),
                score: 0,
            })
        }
    }

    #[tokio::test]
    async fn per_sheet_timeout_converts_to_error() {
        let dir = tempdir().expect("tempdir");
        let payload = scan_payload("1234567890", "9001", 1, 2, &answer_grid(150, 0));
        let tasks = vec![write_sheet(dir.path(), "slow", &payload)];

        let report = run_pool(
            Arc::new(SlowGrader),
            ProfileConfig::default(),
            tasks,
            1,
            Duration::from_millis(50),
            idle_cancel(),
            |_, _| {},
        )
        .await;

        assert_eq!(report.failed, 1);
        assert_eq!(
            report.outcomes[0].result.as_ref().err().map(|e| e.kind),
            Some(ErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn cancellation_abandons_the_remaining_queue() {
        let dir = tempdir().expect("tempdir");
        let payload = scan_payload("1234567890", "9001", 1, 2, &answer_grid(150, 0));
        let tasks: Vec<GradeTask> = (0..20)
            .map(|i| write_sheet(dir.path(), &format!("s{i}"), &payload))
            .collect();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let report = run_pool(
            Arc::new(ThresholdGrader),
            ProfileConfig::default(),
            tasks,
            1,
            Duration::from_secs(5),
            cancel_rx,
            move |done, _total| {
                if done == 2 {
                    let _ = cancel_tx.send(true);
                }
            },
        )
        .await;

        assert!(report.cancelled);
        assert!(report.outcomes.len() < 20);
    }
}
