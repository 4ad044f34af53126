use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::RosterEntry;
use crate::db::types::RowStatus;

fn default_present() -> bool {
    true
}

// Serialize is required by the validator derive on the containing list.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct RosterImportEntry {
    #[validate(length(equal = 10, message = "student_id must be 10 digits"))]
    pub(crate) student_id: String,
    #[serde(default)]
    pub(crate) student_name: Option<String>,
    #[serde(default = "default_present")]
    pub(crate) present: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RosterImportRequest {
    #[validate(length(min = 1, message = "entries must not be empty"), nested)]
    pub(crate) entries: Vec<RosterImportEntry>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RosterImportResponse {
    pub(crate) task_id: String,
    pub(crate) imported: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct RosterEntryResponse {
    pub(crate) id: i64,
    pub(crate) task_id: String,
    pub(crate) student_id: String,
    pub(crate) student_name: Option<String>,
    pub(crate) registered: bool,
    pub(crate) present: bool,
    pub(crate) matched_sheet_id: Option<String>,
    pub(crate) row_status: RowStatus,
    pub(crate) updated_at: String,
}

impl RosterEntryResponse {
    pub(crate) fn from_db(entry: RosterEntry) -> Self {
        Self {
            id: entry.id,
            task_id: entry.task_id,
            student_id: entry.student_id,
            student_name: entry.student_name,
            registered: entry.registered,
            present: entry.present,
            matched_sheet_id: entry.matched_sheet_id,
            row_status: entry.row_status,
            updated_at: format_primitive(entry.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_request_rejects_empty_and_short_ids() {
        let empty: RosterImportRequest = serde_json::from_str("{\"entries\": []}").expect("parse");
        assert!(empty.validate().is_err());

        let short: RosterImportRequest = serde_json::from_str(
            "{\"entries\": [{\"student_id\": \"123\"}]}",
        )
        .expect("parse");
        assert!(short.validate().is_err());
    }

    #[test]
    fn import_entry_defaults_to_present() {
        let request: RosterImportRequest = serde_json::from_str(
            "{\"entries\": [{\"student_id\": \"1234567890\", \"student_name\": \"A\"}]}",
        )
        .expect("parse");
        assert!(request.validate().is_ok());
        assert!(request.entries[0].present);
    }
}
