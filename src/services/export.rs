//! Serializes graded sheets and their answer sets to CSV export files,
//! plus a companion file of error sheets. Rows are ordered by sheet id
//! ascending so identical input sets produce byte-identical files.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::db::models::AnswerMark;
use crate::db::types::{ErrorKind, SheetKind, SheetStatus};

#[derive(Debug, Error)]
pub(crate) enum ExportError {
    #[error("csv serialization failed: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct SheetExportRow {
    pub(crate) sheet_id: String,
    pub(crate) task_id: String,
    pub(crate) source_filename: String,
    pub(crate) kind: SheetKind,
    pub(crate) student_id: Option<String>,
    pub(crate) status: SheetStatus,
    pub(crate) error_kind: Option<ErrorKind>,
    pub(crate) score: Option<i32>,
    pub(crate) answers: Vec<AnswerMark>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportSummary {
    pub(crate) sheets: usize,
    pub(crate) answers: usize,
    pub(crate) errors: usize,
    pub(crate) sheets_path: PathBuf,
    pub(crate) answers_path: PathBuf,
    pub(crate) errors_path: PathBuf,
}

pub(crate) fn write_exports(
    dir: &Path,
    job_id: &str,
    rows: &[SheetExportRow],
) -> Result<ExportSummary, ExportError> {
    fs::create_dir_all(dir)?;

    let mut ordered: Vec<&SheetExportRow> = rows.iter().collect();
    ordered.sort_by(|a, b| a.sheet_id.cmp(&b.sheet_id));

    let sheets_path = dir.join(format!("{job_id}_sheets.csv"));
    let answers_path = dir.join(format!("{job_id}_answers.csv"));
    let errors_path = dir.join(format!("{job_id}_errors.csv"));

    let mut sheets_csv = Vec::new();
    let mut answers_csv = Vec::new();
    let mut errors_csv = Vec::new();
    let (sheets, answers, errors) =
        render(&ordered, &mut sheets_csv, &mut answers_csv, &mut errors_csv)?;

    File::create(&sheets_path)?.write_all(&sheets_csv)?;
    File::create(&answers_path)?.write_all(&answers_csv)?;
    File::create(&errors_path)?.write_all(&errors_csv)?;

    Ok(ExportSummary { sheets, answers, errors, sheets_path, answers_path, errors_path })
}

fn render(
    ordered: &[&SheetExportRow],
    sheets_out: &mut Vec<u8>,
    answers_out: &mut Vec<u8>,
    errors_out: &mut Vec<u8>,
) -> Result<(usize, usize, usize), ExportError> {
    let mut sheets_writer = csv::Writer::from_writer(sheets_out);
    let mut answers_writer = csv::Writer::from_writer(answers_out);
    let mut errors_writer = csv::Writer::from_writer(errors_out);

    sheets_writer.write_record([
        "sheet_id",
        "task_id",
        "source_filename",
        "kind",
        "student_id",
        "score",
    ])?;
    answers_writer.write_record(["sheet_id", "question_number", "chosen_answer"])?;
    errors_writer.write_record(["sheet_id", "task_id", "source_filename", "error_kind"])?;

    let mut sheets = 0;
    let mut answers = 0;
    let mut errors = 0;

    for row in ordered {
        match row.status {
            SheetStatus::Graded => {
                sheets += 1;
                let score = row.score.unwrap_or_default().to_string();
                sheets_writer.write_record([
                    row.sheet_id.as_str(),
                    row.task_id.as_str(),
                    row.source_filename.as_str(),
                    kind_label(row.kind),
                    row.student_id.as_deref().unwrap_or(""),
                    score.as_str(),
                ])?;
                for mark in &row.answers {
                    answers += 1;
                    let question = mark.question_number.to_string();
                    let answer = mark.chosen_answer.to_string();
                    answers_writer.write_record([
                        row.sheet_id.as_str(),
                        question.as_str(),
                        answer.as_str(),
                    ])?;
                }
            }
            SheetStatus::Error => {
                errors += 1;
                errors_writer.write_record([
                    row.sheet_id.as_str(),
                    row.task_id.as_str(),
                    row.source_filename.as_str(),
                    row.error_kind.map(error_label).unwrap_or(""),
                ])?;
            }
            SheetStatus::Pending => {}
        }
    }

    sheets_writer.flush()?;
    answers_writer.flush()?;
    errors_writer.flush()?;
    drop(sheets_writer);
    drop(answers_writer);
    drop(errors_writer);

    Ok((sheets, answers, errors))
}

fn kind_label(kind: SheetKind) -> &'static str {
    match kind {
        SheetKind::Cover => "cover",
        SheetKind::Answer => "answer",
        SheetKind::Closing => "closing",
    }
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::LowAnswerCount => "low_answer_count",
        ErrorKind::StudentIdUnreadable => "student_id_unreadable",
        ErrorKind::ExamCenterMismatch => "exam_center_mismatch",
        ErrorKind::ClassLevelMismatch => "class_level_mismatch",
        ErrorKind::ClassGroupMismatch => "class_group_mismatch",
        ErrorKind::DuplicateSheet => "duplicate_sheet",
        ErrorKind::BadSequence => "bad_sequence",
        ErrorKind::SizeOutOfRange => "size_out_of_range",
        ErrorKind::Unreadable => "unreadable",
        ErrorKind::Timeout => "timeout",
    }
}
