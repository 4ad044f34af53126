//! Parser for the preprocessed scan payload the scanner appliance embeds
//! at the front of every sheet image. Bubble detection itself happens
//! upstream; this backend only reads the normalized darkness grid.
//!
//! Layout (little-endian):
//!   magic "OMRS" (4) | version u8 | student id digits (10, 0xFF = unreadable)
//!   | center digits (4) | class level digit | class group digit
//!   | question_count u16 | choices u8 | question_count * choices darkness bytes
//!
//! Anything after the grid is the original raster and is ignored here.

use thiserror::Error;

pub(crate) const SCAN_MAGIC: &[u8; 4] = b"OMRS";
pub(crate) const SCAN_VERSION: u8 = 1;
pub(crate) const STUDENT_ID_DIGITS: usize = 10;

const HEADER_LEN: usize = 4 + 1 + STUDENT_ID_DIGITS + 4 + 1 + 1 + 2 + 1;

#[derive(Debug, Error)]
pub(crate) enum ScanParseError {
    #[error("payload shorter than header ({0} bytes)")]
    TooShort(usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated darkness grid: expected {expected} cells, got {actual}")]
    TruncatedGrid { expected: usize, actual: usize },
    #[error("malformed header field: {0}")]
    BadHeader(&'static str),
}

/// An exam task identity: 8 ASCII digits — center code (4), class level,
/// class group, room sequence (2).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TaskId {
    raw: String,
}

impl TaskId {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self { raw: raw.to_string() })
        } else {
            None
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.raw
    }

    pub(crate) fn center_code(&self) -> &str {
        &self.raw[..4]
    }

    pub(crate) fn class_level(&self) -> u8 {
        self.raw.as_bytes()[4] - b'0'
    }

    pub(crate) fn class_group(&self) -> u8 {
        self.raw.as_bytes()[5] - b'0'
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScanHeader {
    /// None when any digit cell was unreadable upstream.
    pub(crate) student_id: Option<String>,
    pub(crate) center_code: String,
    pub(crate) class_level: u8,
    pub(crate) class_group: u8,
}

#[derive(Debug, Clone)]
pub(crate) struct SheetScan {
    pub(crate) header: ScanHeader,
    pub(crate) question_count: u16,
    pub(crate) choices: u8,
    cells: Vec<u8>,
}

impl SheetScan {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, ScanParseError> {
        if bytes.len() < HEADER_LEN {
            return Err(ScanParseError::TooShort(bytes.len()));
        }
        if &bytes[..4] != SCAN_MAGIC {
            return Err(ScanParseError::BadMagic);
        }
        let version = bytes[4];
        if version != SCAN_VERSION {
            return Err(ScanParseError::UnsupportedVersion(version));
        }

        let mut offset = 5;
        let id_bytes = &bytes[offset..offset + STUDENT_ID_DIGITS];
        offset += STUDENT_ID_DIGITS;
        let student_id = if id_bytes.iter().all(|b| b.is_ascii_digit()) {
            Some(String::from_utf8_lossy(id_bytes).into_owned())
        } else {
            None
        };

        let center_bytes = &bytes[offset..offset + 4];
        offset += 4;
        if !center_bytes.iter().all(|b| b.is_ascii_digit()) {
            return Err(ScanParseError::BadHeader("center code"));
        }
        let center_code = String::from_utf8_lossy(center_bytes).into_owned();

        let class_level = digit(bytes[offset]).ok_or(ScanParseError::BadHeader("class level"))?;
        offset += 1;
        let class_group = digit(bytes[offset]).ok_or(ScanParseError::BadHeader("class group"))?;
        offset += 1;

        let question_count = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        offset += 2;
        let choices = bytes[offset];
        offset += 1;
        if choices == 0 && question_count > 0 {
            return Err(ScanParseError::BadHeader("choices"));
        }

        let expected = question_count as usize * choices as usize;
        let actual = bytes.len() - offset;
        if actual < expected {
            return Err(ScanParseError::TruncatedGrid { expected, actual });
        }
        let cells = bytes[offset..offset + expected].to_vec();

        Ok(Self {
            header: ScanHeader { student_id, center_code, class_level, class_group },
            question_count,
            choices,
            cells,
        })
    }

    pub(crate) fn cell(&self, question: u16, choice: u8) -> u8 {
        self.cells[question as usize * self.choices as usize + choice as usize]
    }

    /// Mean darkness across the whole grid, normalized to [0, 1].
    pub(crate) fn mean_darkness(&self) -> f64 {
        if self.cells.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.cells.iter().map(|&b| b as u64).sum();
        sum as f64 / (self.cells.len() as f64 * 255.0)
    }
}

fn digit(byte: u8) -> Option<u8> {
    byte.is_ascii_digit().then(|| byte - b'0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scan_payload;

    #[test]
    fn parses_well_formed_payload() {
        let bytes = scan_payload("1234567890", "9001", 1, 2, &[[200, 10, 10, 10]; 3]);
        let scan = SheetScan::parse(&bytes).expect("parse");
        assert_eq!(scan.header.student_id.as_deref(), Some("1234567890"));
        assert_eq!(scan.header.center_code, "9001");
        assert_eq!(scan.header.class_level, 1);
        assert_eq!(scan.header.class_group, 2);
        assert_eq!(scan.question_count, 3);
        assert_eq!(scan.cell(0, 0), 200);
        assert_eq!(scan.cell(2, 3), 10);
    }

    #[test]
    fn unreadable_student_id_is_none() {
        let mut bytes = scan_payload("1234567890", "9001", 1, 1, &[[200, 0, 0, 0]]);
        bytes[5] = 0xFF;
        let scan = SheetScan::parse(&bytes).expect("parse");
        assert!(scan.header.student_id.is_none());
    }

    #[test]
    fn trailing_raster_bytes_are_ignored() {
        let mut bytes = scan_payload("1234567890", "9001", 1, 1, &[[200, 0, 0, 0]]);
        bytes.extend_from_slice(&[0xAB; 512]);
        assert!(SheetScan::parse(&bytes).is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = scan_payload("1234567890", "9001", 1, 1, &[[200, 0, 0, 0]]);
        bytes[0] = b'X';
        assert!(matches!(SheetScan::parse(&bytes), Err(ScanParseError::BadMagic)));
    }

    #[test]
    fn rejects_truncated_grid() {
        let bytes = scan_payload("1234567890", "9001", 1, 1, &[[200, 0, 0, 0]; 5]);
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            SheetScan::parse(truncated),
            Err(ScanParseError::TruncatedGrid { .. })
        ));
    }

    #[test]
    fn task_id_fields() {
        let task = TaskId::parse("90011203").expect("task id");
        assert_eq!(task.center_code(), "9001");
        assert_eq!(task.class_level(), 1);
        assert_eq!(task.class_group(), 2);
        assert!(TaskId::parse("90011").is_none());
        assert!(TaskId::parse("9001120a").is_none());
    }
}
