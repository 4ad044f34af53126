use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "batchstatus", rename_all = "lowercase")]
pub(crate) enum BatchStatus {
    Pending,
    Extracting,
    Processing,
    Loading,
    Completed,
    Failed,
}

impl BatchStatus {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "uploadstrategy", rename_all = "lowercase")]
pub(crate) enum UploadStrategy {
    Replace,
    Merge,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "sheetstatus", rename_all = "lowercase")]
pub(crate) enum SheetStatus {
    Pending,
    Graded,
    Error,
}

/// Page role inferred from the filename marker (`C`, `A`, `Z`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "sheetkind", rename_all = "lowercase")]
pub(crate) enum SheetKind {
    Cover,
    Answer,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "errorkind", rename_all = "snake_case")]
pub(crate) enum ErrorKind {
    LowAnswerCount,
    StudentIdUnreadable,
    ExamCenterMismatch,
    ClassLevelMismatch,
    ClassGroupMismatch,
    DuplicateSheet,
    BadSequence,
    SizeOutOfRange,
    Unreadable,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "rowstatus")]
pub(crate) enum RowStatus {
    #[sqlx(rename = "OK")]
    Ok,
    #[sqlx(rename = "MISSING")]
    Missing,
    #[sqlx(rename = "ABSENT")]
    Absent,
    #[sqlx(rename = "ABSENT_MISMATCH")]
    AbsentMismatch,
    #[sqlx(rename = "DUPLICATE")]
    Duplicate,
    #[sqlx(rename = "GHOST")]
    Ghost,
    #[sqlx(rename = "ERROR")]
    Error,
    #[sqlx(rename = "UNEXPECTED")]
    Unexpected,
}
