//! Grading of one sheet against a profile. Pure: identical (payload,
//! profile) inputs always produce identical output, which is what makes
//! reprocessing and the CSV audit trail reproducible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::db::models::AnswerMark;
use crate::db::types::{ErrorKind, SheetKind};
use crate::services::scan::{ScanParseError, SheetScan, TaskId};

/// Answer pages need at least this many legible questions to count as a
/// valid read.
pub(crate) const MIN_LEGIBLE_ANSWERS: u16 = 140;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub(crate) struct BubbleDetection {
    #[serde(default = "default_darkness_threshold")]
    #[validate(range(min = 0.0, max = 1.0, message = "darkness_empty_threshold must be in [0, 1]"))]
    pub(crate) darkness_empty_threshold: f64,
    #[serde(default = "default_density_threshold")]
    #[validate(range(min = 0.0, max = 1.0, message = "grid_density_min_threshold must be in [0, 1]"))]
    pub(crate) grid_density_min_threshold: f64,
}

/// Grading thresholds. The extension map carries forward-compatible
/// tuning knobs without making the config free-form.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub(crate) struct ProfileConfig {
    #[serde(default)]
    #[validate(nested)]
    pub(crate) bubble_detection: BubbleDetection,
    #[serde(default, flatten)]
    pub(crate) extensions: BTreeMap<String, serde_json::Value>,
}

fn default_darkness_threshold() -> f64 {
    0.55
}

fn default_density_threshold() -> f64 {
    0.05
}

impl Default for BubbleDetection {
    fn default() -> Self {
        Self {
            darkness_empty_threshold: default_darkness_threshold(),
            grid_density_min_threshold: default_density_threshold(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self { bubble_detection: BubbleDetection::default(), extensions: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GradedAnswers {
    pub(crate) student_id: String,
    pub(crate) answers: Vec<AnswerMark>,
    pub(crate) score: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct GradeFailure {
    pub(crate) kind: ErrorKind,
    pub(crate) message: String,
    /// Set when the id digits were readable despite the failure, so the
    /// error sheet can still be matched against the roster.
    pub(crate) student_id: Option<String>,
}

impl GradeFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), student_id: None }
    }

    fn for_student(student_id: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), student_id: Some(student_id.to_string()) }
    }
}

/// The pluggable grading function. One sheet in, an answer set or a
/// per-sheet error out; must be deterministic.
pub(crate) trait SheetGrader: Send + Sync {
    fn grade(
        &self,
        payload: &[u8],
        kind: SheetKind,
        task: &TaskId,
        profile: &ProfileConfig,
    ) -> Result<GradedAnswers, GradeFailure>;
}

/// Default grader: thresholds the appliance's darkness grid.
pub(crate) struct ThresholdGrader;

impl SheetGrader for ThresholdGrader {
    fn grade(
        &self,
        payload: &[u8],
        kind: SheetKind,
        task: &TaskId,
        profile: &ProfileConfig,
    ) -> Result<GradedAnswers, GradeFailure> {
        let scan = SheetScan::parse(payload).map_err(failure_for_parse)?;

        if scan.question_count > 0
            && scan.mean_darkness() < profile.bubble_detection.grid_density_min_threshold
        {
            return Err(GradeFailure::new(
                ErrorKind::Unreadable,
                "scan grid density below profile minimum",
            ));
        }

        let student_id = scan.header.student_id.clone().ok_or_else(|| {
            GradeFailure::new(ErrorKind::StudentIdUnreadable, "student id digits unreadable")
        })?;

        if scan.header.center_code != task.center_code() {
            return Err(GradeFailure::for_student(
                &student_id,
                ErrorKind::ExamCenterMismatch,
                format!("sheet center {} vs task {}", scan.header.center_code, task.center_code()),
            ));
        }
        if scan.header.class_level != task.class_level() {
            return Err(GradeFailure::for_student(
                &student_id,
                ErrorKind::ClassLevelMismatch,
                format!("sheet level {} vs task {}", scan.header.class_level, task.class_level()),
            ));
        }
        if scan.header.class_group != task.class_group() {
            return Err(GradeFailure::for_student(
                &student_id,
                ErrorKind::ClassGroupMismatch,
                format!("sheet group {} vs task {}", scan.header.class_group, task.class_group()),
            ));
        }

        // Cover and closing pages carry identity only.
        if !matches!(kind, SheetKind::Answer) {
            return Ok(GradedAnswers { student_id, answers: Vec::new(), score: 0 });
        }

        let answers = read_marks(&scan, profile.bubble_detection.darkness_empty_threshold);
        if (answers.len() as u16) < MIN_LEGIBLE_ANSWERS {
            return Err(GradeFailure::for_student(
                &student_id,
                ErrorKind::LowAnswerCount,
                format!("only {} of {} questions legible", answers.len(), scan.question_count),
            ));
        }

        let score = answers.len() as i32;
        Ok(GradedAnswers { student_id, answers, score })
    }
}

/// A question is legible when exactly one bubble crosses the darkness
/// threshold.
fn read_marks(scan: &SheetScan, darkness_threshold: f64) -> Vec<AnswerMark> {
    let mut answers = Vec::new();
    for question in 0..scan.question_count {
        let mut marked = None;
        let mut marked_count = 0;
        for choice in 0..scan.choices {
            let darkness = scan.cell(question, choice) as f64 / 255.0;
            if darkness >= darkness_threshold {
                marked = Some(choice);
                marked_count += 1;
            }
        }
        if marked_count == 1 {
            let choice = marked.unwrap_or_default();
            answers.push(AnswerMark {
                question_number: question + 1,
                chosen_answer: (b'A' + choice) as char,
            });
        }
    }
    answers
}

fn failure_for_parse(err: ScanParseError) -> GradeFailure {
    GradeFailure::new(ErrorKind::Unreadable, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{answer_grid, scan_payload};

    fn task() -> TaskId {
        TaskId::parse("90011201").expect("task id")
    }

    fn grade(
        payload: &[u8],
        kind: SheetKind,
    ) -> Result<GradedAnswers, GradeFailure> {
        ThresholdGrader.grade(payload, kind, &task(), &ProfileConfig::default())
    }

    #[test]
    fn grades_clean_answer_sheet() {
        let grid = answer_grid(150, 0);
        let payload = scan_payload("1234567890", "9001", 1, 2, &grid);
        let graded = grade(&payload, SheetKind::Answer).expect("graded");
        assert_eq!(graded.student_id, "1234567890");
        assert_eq!(graded.answers.len(), 150);
        assert_eq!(graded.score, 150);
        assert_eq!(graded.answers[0].question_number, 1);
        assert_eq!(graded.answers[0].chosen_answer, 'A');
        assert_eq!(graded.answers[1].chosen_answer, 'B');
    }

    #[test]
    fn grading_is_deterministic() {
        let payload = scan_payload("1234567890", "9001", 1, 2, &answer_grid(150, 3));
        let first = grade(&payload, SheetKind::Answer).expect("first");
        let second = grade(&payload, SheetKind::Answer).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn low_legible_count_fails() {
        // 139 legible questions, one short of the minimum.
        let mut grid = answer_grid(150, 0);
        for cell in grid.iter_mut().skip(139) {
            *cell = [0, 0, 0, 0];
        }
        let payload = scan_payload("1234567890", "9001", 1, 2, &grid);
        let err = grade(&payload, SheetKind::Answer).expect_err("low answer");
        assert_eq!(err.kind, ErrorKind::LowAnswerCount);
        assert_eq!(err.student_id.as_deref(), Some("1234567890"));
    }

    #[test]
    fn exactly_minimum_legible_passes() {
        let mut grid = answer_grid(150, 0);
        for cell in grid.iter_mut().skip(MIN_LEGIBLE_ANSWERS as usize) {
            *cell = [0, 0, 0, 0];
        }
        let payload = scan_payload("1234567890", "9001", 1, 2, &grid);
        let graded = grade(&payload, SheetKind::Answer).expect("graded");
        assert_eq!(graded.answers.len(), MIN_LEGIBLE_ANSWERS as usize);
    }

    #[test]
    fn double_marked_question_is_illegible() {
        let mut grid = answer_grid(150, 0);
        grid[0] = [220, 220, 0, 0];
        let payload = scan_payload("1234567890", "9001", 1, 2, &grid);
        let graded = grade(&payload, SheetKind::Answer).expect("graded");
        assert_eq!(graded.answers.len(), 149);
        assert_eq!(graded.answers[0].question_number, 2);
    }

    #[test]
    fn unreadable_student_id() {
        let mut payload = scan_payload("1234567890", "9001", 1, 2, &answer_grid(150, 0));
        payload[5] = 0xFF;
        let err = grade(&payload, SheetKind::Answer).expect_err("unreadable id");
        assert_eq!(err.kind, ErrorKind::StudentIdUnreadable);
        assert_eq!(err.student_id, None);
    }

    #[test]
    fn center_and_class_mismatches() {
        let wrong_center = scan_payload("1234567890", "9999", 1, 2, &answer_grid(150, 0));
        let err = grade(&wrong_center, SheetKind::Answer).expect_err("center");
        assert_eq!(err.kind, ErrorKind::ExamCenterMismatch);
        // The id was readable, so the roster can still match the error sheet.
        assert_eq!(err.student_id.as_deref(), Some("1234567890"));

        let wrong_level = scan_payload("1234567890", "9001", 3, 2, &answer_grid(150, 0));
        assert_eq!(
            grade(&wrong_level, SheetKind::Answer).expect_err("level").kind,
            ErrorKind::ClassLevelMismatch
        );

        let wrong_group = scan_payload("1234567890", "9001", 1, 3, &answer_grid(150, 0));
        assert_eq!(
            grade(&wrong_group, SheetKind::Answer).expect_err("group").kind,
            ErrorKind::ClassGroupMismatch
        );
    }

    #[test]
    fn cover_sheet_returns_identity_only() {
        let payload = scan_payload("1234567890", "9001", 1, 2, &[]);
        let graded = grade(&payload, SheetKind::Cover).expect("cover");
        assert_eq!(graded.student_id, "1234567890");
        assert!(graded.answers.is_empty());
    }

    #[test]
    fn garbage_payload_is_unreadable() {
        let err = grade(&[0u8; 64], SheetKind::Answer).expect_err("garbage");
        assert_eq!(err.kind, ErrorKind::Unreadable);
    }

    #[test]
    fn profile_config_defaults_and_validation() {
        let config: ProfileConfig = serde_json::from_str("{}").expect("empty config");
        assert!(config.validate().is_ok());
        assert!((config.bubble_detection.darkness_empty_threshold - 0.55).abs() < 1e-9);

        let bad: ProfileConfig = serde_json::from_str(
            "{\"bubble_detection\": {\"darkness_empty_threshold\": 1.5}}",
        )
        .expect("parse");
        assert!(bad.validate().is_err());
    }
}
