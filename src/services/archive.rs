//! Unpacks an uploaded batch archive into batch-scoped storage and
//! validates its structure. File-level problems (size range, naming,
//! duplicates) are recorded on the extracted entry and never abort the
//! batch; structural problems reject the whole archive.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::db::types::{ErrorKind, SheetKind};
use crate::services::scan::TaskId;

/// Inclusive byte ranges per page role; KB means 1024 bytes.
pub(crate) const COVER_SIZE_RANGE: (u64, u64) = (140 * 1024, 320 * 1024);
pub(crate) const ANSWER_SIZE_RANGE: (u64, u64) = (500 * 1024, 1000 * 1024);

#[derive(Debug, Error)]
pub(crate) enum ArchiveError {
    #[error("archive is {size} bytes, above the {limit} byte ceiling")]
    TooLarge { size: u64, limit: u64 },
    #[error("archive structure invalid: {0}")]
    Structure(String),
    #[error("archive read failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct ExtractedSheet {
    pub(crate) filename: String,
    pub(crate) task_id: TaskId,
    pub(crate) kind: SheetKind,
    pub(crate) sequence: u16,
    pub(crate) image_path: PathBuf,
    pub(crate) size: u64,
    /// Per-file validation failure; the sheet record is created in
    /// `error` state instead of being silently dropped.
    pub(crate) error: Option<ErrorKind>,
}

impl ExtractedSheet {
    pub(crate) fn is_gradable(&self) -> bool {
        self.error.is_none()
    }
}

/// Extracts every sheet image under `dest`, enforcing the admission
/// ceiling before touching the archive contents.
pub(crate) fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    max_bytes: u64,
) -> Result<Vec<ExtractedSheet>, ArchiveError> {
    let archive_size = fs::metadata(archive_path)?.len();
    if archive_size > max_bytes {
        return Err(ArchiveError::TooLarge { size: archive_size, limit: max_bytes });
    }

    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    validate_single_root(&mut archive)?;
    fs::create_dir_all(dest)?;

    let mut sheets = Vec::new();
    let mut seen_names: HashMap<String, u32> = HashMap::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(ArchiveError::Structure(format!(
                "entry {} escapes the archive root",
                entry.name()
            )));
        };
        let filename = match enclosed.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        let size = entry.size();
        let parsed = parse_sheet_filename(&filename);
        let (task_id, kind, sequence) = match &parsed {
            Some((task, kind, seq)) => (task.clone(), *kind, *seq),
            None => (TaskId::parse("00000000").expect("placeholder task"), SheetKind::Answer, 0),
        };

        let mut error = match parsed {
            Some(_) => size_error(kind, size),
            None => Some(ErrorKind::BadSequence),
        };
        let occurrence = {
            let count = seen_names.entry(filename.clone()).or_insert(0);
            *count += 1;
            *count
        };
        // A repeat keeps its own record; the stored name is suffixed so
        // the row survives the per-batch filename uniqueness.
        let filename = if occurrence > 1 {
            if error.is_none() {
                error = Some(ErrorKind::DuplicateSheet);
            }
            format!("{filename}#{occurrence}")
        } else {
            filename
        };

        let image_path = dest.join(&filename);
        if error.is_none() {
            let mut out = File::create(&image_path)?;
            io::copy(&mut entry, &mut out)?;
            out.flush()?;
        }

        sheets.push(ExtractedSheet {
            filename,
            task_id,
            kind,
            sequence,
            image_path,
            size,
            error,
        });
    }

    sheets.sort_by(|a, b| {
        (a.task_id.as_str(), a.sequence, &a.filename)
            .cmp(&(b.task_id.as_str(), b.sequence, &b.filename))
    });
    apply_sequence_rules(&mut sheets);

    Ok(sheets)
}

/// Archive must contain exactly one top-level folder.
fn validate_single_root<R: Read + io::Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<(), ArchiveError> {
    let mut roots = HashSet::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let name = entry.name();
        match name.split('/').next() {
            Some(root) if name.contains('/') => {
                roots.insert(root.to_string());
            }
            _ => {
                return Err(ArchiveError::Structure(format!(
                    "file {name} sits outside a top-level folder"
                )))
            }
        }
    }
    if roots.len() != 1 {
        return Err(ArchiveError::Structure(format!(
            "expected exactly one top-level folder, found {}",
            roots.len()
        )));
    }
    Ok(())
}

/// `TTTTTTTT_SSS_K.ext` — task id, zero-padded sequence, page marker.
pub(crate) fn parse_sheet_filename(filename: &str) -> Option<(TaskId, SheetKind, u16)> {
    let stem = filename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(filename);
    let mut parts = stem.split('_');
    let task = TaskId::parse(parts.next()?)?;
    let sequence: u16 = parts.next().filter(|s| s.len() == 3)?.parse().ok()?;
    let kind = match parts.next()? {
        "C" => SheetKind::Cover,
        "A" => SheetKind::Answer,
        "Z" => SheetKind::Closing,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((task, kind, sequence))
}

fn size_error(kind: SheetKind, size: u64) -> Option<ErrorKind> {
    let (min, max) = match kind {
        SheetKind::Answer => ANSWER_SIZE_RANGE,
        SheetKind::Cover | SheetKind::Closing => COVER_SIZE_RANGE,
    };
    if size < min || size > max {
        Some(ErrorKind::SizeOutOfRange)
    } else {
        None
    }
}

/// Each per-student group must open with a cover page and each task's
/// listing must end with the closing marker. Violations attach to the
/// offending sheet only.
fn apply_sequence_rules(sheets: &mut [ExtractedSheet]) {
    let mut last_per_task: HashMap<String, usize> = HashMap::new();
    let mut open_group: HashMap<String, bool> = HashMap::new();

    for (index, sheet) in sheets.iter_mut().enumerate() {
        let task = sheet.task_id.as_str().to_string();
        last_per_task.insert(task.clone(), index);
        let has_cover = open_group.entry(task).or_insert(false);
        match sheet.kind {
            SheetKind::Cover => *has_cover = true,
            SheetKind::Answer => {
                if !*has_cover && sheet.error.is_none() {
                    sheet.error = Some(ErrorKind::BadSequence);
                }
            }
            SheetKind::Closing => *has_cover = false,
        }
    }

    for (_, index) in last_per_task {
        let sheet = &mut sheets[index];
        if sheet.kind != SheetKind::Closing && sheet.error.is_none() {
            sheet.error = Some(ErrorKind::BadSequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sized_scan_file, zip_fixture};
    use tempfile::tempdir;

    const MAX: u64 = 3 * 1024 * 1024 * 1024;

    // The directory must outlive the assertions, so it rides along.
    fn extract(
        entries: &[(&str, Vec<u8>)],
    ) -> (tempfile::TempDir, Result<Vec<ExtractedSheet>, ArchiveError>) {
        let dir = tempdir().expect("tempdir");
        let archive = zip_fixture(dir.path(), entries);
        let result = extract_archive(&archive, &dir.path().join("out"), MAX);
        (dir, result)
    }

    fn cover(bytes: u64) -> Vec<u8> {
        sized_scan_file("1234567890", "9001", 1, 2, 0, bytes as usize)
    }

    fn answer(bytes: u64) -> Vec<u8> {
        sized_scan_file("1234567890", "9001", 1, 2, 150, bytes as usize)
    }

    #[test]
    fn two_top_level_folders_is_a_structure_error() {
        let (_dir, result) = extract(&[
            ("a/90011201_001_C.img", cover(140 * 1024)),
            ("b/90011201_002_A.img", answer(500 * 1024)),
        ]);
        assert!(matches!(result.expect_err("structure"), ArchiveError::Structure(_)));
    }

    #[test]
    fn file_at_root_is_a_structure_error() {
        let (_dir, result) = extract(&[("90011201_001_C.img", cover(140 * 1024))]);
        assert!(matches!(result.expect_err("structure"), ArchiveError::Structure(_)));
    }

    #[test]
    fn cover_size_boundaries() {
        let (_dir, result) = extract(&[
            ("batch/90011201_001_C.img", cover(139 * 1024)),
            ("batch/90011201_002_C.img", cover(140 * 1024)),
            ("batch/90011201_003_A.img", answer(500 * 1024)),
            ("batch/90011201_004_Z.img", cover(141 * 1024)),
        ]);
        let sheets = result.expect("extract");
        assert_eq!(sheets[0].error, Some(ErrorKind::SizeOutOfRange));
        assert_eq!(sheets[1].error, None);
        assert!(sheets[1].image_path.exists());
        assert!(!sheets[0].image_path.exists());
    }

    #[test]
    fn answer_size_range_is_enforced_per_file() {
        let (_dir, result) = extract(&[
            ("batch/90011201_001_C.img", cover(150 * 1024)),
            ("batch/90011201_002_A.img", answer(499 * 1024)),
            ("batch/90011201_003_A.img", answer(1000 * 1024)),
            ("batch/90011201_004_Z.img", cover(150 * 1024)),
        ]);
        let sheets = result.expect("extract");
        assert_eq!(sheets[1].error, Some(ErrorKind::SizeOutOfRange));
        assert_eq!(sheets[2].error, None);
    }

    #[test]
    fn group_without_cover_gets_sequence_error() {
        let (_dir, result) = extract(&[
            ("batch/90011201_001_A.img", answer(600 * 1024)),
            ("batch/90011201_002_Z.img", cover(150 * 1024)),
        ]);
        let sheets = result.expect("extract");
        assert_eq!(sheets[0].error, Some(ErrorKind::BadSequence));
        assert_eq!(sheets[1].error, None);
    }

    #[test]
    fn task_not_ending_with_closing_marker() {
        let (_dir, result) = extract(&[
            ("batch/90011201_001_C.img", cover(150 * 1024)),
            ("batch/90011201_002_A.img", answer(600 * 1024)),
        ]);
        let sheets = result.expect("extract");
        assert_eq!(sheets[0].error, None);
        assert_eq!(sheets[1].error, Some(ErrorKind::BadSequence));
    }

    #[test]
    fn unparseable_filename_is_a_sequence_error() {
        let (_dir, result) = extract(&[
            ("batch/90011201_001_C.img", cover(150 * 1024)),
            ("batch/notes.txt", vec![0u8; 64]),
            ("batch/90011201_002_A.img", answer(600 * 1024)),
            ("batch/90011201_003_Z.img", cover(150 * 1024)),
        ]);
        let sheets = result.expect("extract");
        let odd = sheets.iter().find(|s| s.filename == "notes.txt").expect("entry");
        assert_eq!(odd.error, Some(ErrorKind::BadSequence));
    }

    #[test]
    fn repeated_filename_keeps_a_flagged_record() {
        let (_dir, result) = extract(&[
            ("batch/a/90011201_001_C.img", cover(150 * 1024)),
            ("batch/a/90011201_002_A.img", answer(600 * 1024)),
            ("batch/b/90011201_002_A.img", answer(600 * 1024)),
            ("batch/a/90011201_003_Z.img", cover(150 * 1024)),
        ]);
        let sheets = result.expect("extract");
        assert_eq!(sheets.len(), 4);

        let first =
            sheets.iter().find(|s| s.filename == "90011201_002_A.img").expect("first row");
        assert_eq!(first.error, None);
        assert!(first.image_path.exists());

        // The repeat stays as its own record, under a name that cannot
        // collide with the first one.
        let dup =
            sheets.iter().find(|s| s.filename == "90011201_002_A.img#2").expect("repeat row");
        assert_eq!(dup.error, Some(ErrorKind::DuplicateSheet));
        assert!(!dup.image_path.exists());
    }

    #[test]
    fn admission_ceiling_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let archive =
            zip_fixture(dir.path(), &[("batch/90011201_001_C.img", cover(150 * 1024))]);
        let err = extract_archive(&archive, &dir.path().join("out"), 1024).expect_err("too large");
        assert!(matches!(err, ArchiveError::TooLarge { .. }));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn filename_parsing() {
        let (task, kind, seq) = parse_sheet_filename("90011201_012_A.img").expect("parse");
        assert_eq!(task.as_str(), "90011201");
        assert_eq!(kind, SheetKind::Answer);
        assert_eq!(seq, 12);
        assert!(parse_sheet_filename("90011201_12_A.img").is_none());
        assert!(parse_sheet_filename("90011201_012_X.img").is_none());
        assert!(parse_sheet_filename("scan.img").is_none());
    }
}
