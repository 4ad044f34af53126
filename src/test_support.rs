//! Shared fixture builders for unit tests.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Serializes tests that mutate process environment variables.
pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

/// Builds a well-formed scan payload with four choices per question.
pub(crate) fn scan_payload(
    student_id: &str,
    center: &str,
    level: u8,
    group: u8,
    grid: &[[u8; 4]],
) -> Vec<u8> {
    assert_eq!(student_id.len(), 10, "student id must be 10 digits");
    assert_eq!(center.len(), 4, "center code must be 4 digits");
    let mut bytes = Vec::with_capacity(23 + grid.len() * 4);
    bytes.extend_from_slice(b"OMRS");
    bytes.push(1);
    bytes.extend_from_slice(student_id.as_bytes());
    bytes.extend_from_slice(center.as_bytes());
    bytes.push(b'0' + level);
    bytes.push(b'0' + group);
    bytes.extend_from_slice(&(grid.len() as u16).to_le_bytes());
    bytes.push(4);
    for row in grid {
        bytes.extend_from_slice(row);
    }
    bytes
}

/// One cleanly marked cell per question, rotating through the choices
/// starting at `phase`.
pub(crate) fn answer_grid(questions: usize, phase: usize) -> Vec<[u8; 4]> {
    (0..questions)
        .map(|i| {
            let mut row = [10u8; 4];
            row[(i + phase) % 4] = 220;
            row
        })
        .collect()
}

/// A scan payload padded with raster bytes to an exact file size, for
/// exercising the size admission rules.
pub(crate) fn sized_scan_file(
    student_id: &str,
    center: &str,
    level: u8,
    group: u8,
    questions: usize,
    total_bytes: usize,
) -> Vec<u8> {
    let grid = answer_grid(questions, 0);
    let mut bytes = scan_payload(student_id, center, level, group, &grid);
    assert!(bytes.len() <= total_bytes, "payload longer than requested file size");
    bytes.resize(total_bytes, 0);
    bytes
}

/// Writes a stored (uncompressed) zip so entry sizes match the payload
/// sizes exactly.
pub(crate) fn zip_fixture(dir: &Path, entries: &[(&str, Vec<u8>)]) -> PathBuf {
    let path = dir.join("fixture.zip");
    let file = File::create(&path).expect("create zip");
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, payload) in entries {
        writer.start_file(*name, options).expect("start entry");
        writer.write_all(payload).expect("write entry");
    }
    writer.finish().expect("finish zip");
    path
}
