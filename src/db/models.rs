use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{
    BatchStatus, ErrorKind, RowStatus, SheetKind, SheetStatus, UploadStrategy,
};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Batch {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) upload_strategy: UploadStrategy,
    pub(crate) status: BatchStatus,
    pub(crate) profile_id: i64,
    pub(crate) archive_sha256: String,
    pub(crate) archive_size: i64,
    pub(crate) notes: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) sheet_count: i32,
    pub(crate) processed_count: i32,
    pub(crate) failed_count: i32,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Sheet {
    pub(crate) id: String,
    pub(crate) batch_id: String,
    pub(crate) task_id: String,
    pub(crate) source_filename: String,
    pub(crate) image_path: String,
    pub(crate) kind: SheetKind,
    pub(crate) student_id: Option<String>,
    pub(crate) status: SheetStatus,
    pub(crate) error_kind: Option<ErrorKind>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// One answer mark as stored inside a sheet's answer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AnswerMark {
    pub(crate) question_number: u16,
    pub(crate) chosen_answer: char,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Profile {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) config_json: Json<crate::services::grading::ProfileConfig>,
    pub(crate) is_default: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct RosterEntry {
    pub(crate) id: i64,
    pub(crate) task_id: String,
    pub(crate) student_id: String,
    pub(crate) student_name: Option<String>,
    pub(crate) registered: bool,
    pub(crate) present: bool,
    pub(crate) matched_sheet_id: Option<String>,
    pub(crate) row_status: RowStatus,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BatchEvent {
    pub(crate) id: i64,
    pub(crate) job_id: String,
    pub(crate) stage: String,
    pub(crate) message: String,
    pub(crate) created_at: PrimitiveDateTime,
}
