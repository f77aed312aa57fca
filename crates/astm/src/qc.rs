//! Strict extraction of QC (`Q`) records.
//!
//! Record layout: `Q|seq|testCode^lot^level|value|unit|timestamp|flag`.
//!
//! Parsing is all-or-nothing: a single malformed Q record fails the whole message so that
//! partially corrupt QC runs are never admitted.

use crate::record::{Message, Record, RecordType};
use crate::{AstmError, AstmResult};
use chrono::NaiveDateTime;
use serde::Serialize;

/// Timestamp layout used by Q records (`20250127143000`).
pub const QC_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const MIN_Q_FIELDS: usize = 6;

/// Control material level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ControlLevel {
    #[serde(rename = "L")]
    Low,
    #[serde(rename = "N")]
    Normal,
    #[serde(rename = "H")]
    High,
}

impl ControlLevel {
    /// Parse the single-letter wire code. Only `L`, `N` and `H` are accepted.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "L" => Some(Self::Low),
            "N" => Some(Self::Normal),
            "H" => Some(Self::High),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Low => "L",
            Self::Normal => "N",
            Self::High => "H",
        }
    }
}

impl std::fmt::Display for ControlLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One QC measurement as it appeared on the wire. Immutable once parsed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QcSegmentData {
    instrument_id: Option<String>,
    test_code: String,
    control_lot_number: String,
    control_level: ControlLevel,
    result_value: String,
    unit: String,
    timestamp: NaiveDateTime,
    flag: Option<String>,
}

impl QcSegmentData {
    pub fn instrument_id(&self) -> Option<&str> {
        self.instrument_id.as_deref()
    }

    pub fn test_code(&self) -> &str {
        &self.test_code
    }

    pub fn control_lot_number(&self) -> &str {
        &self.control_lot_number
    }

    pub fn control_level(&self) -> ControlLevel {
        self.control_level
    }

    /// Result exactly as transmitted; numeric interpretation is left to the caller.
    pub fn result_value(&self) -> &str {
        &self.result_value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn flag(&self) -> Option<&str> {
        self.flag.as_deref()
    }
}

/// Extract every QC record from `message`, in input order.
///
/// The instrument id is read once from the header and shared by all results.
///
/// # Arguments
///
/// * `message` - Raw ASTM message text.
///
/// # Returns
///
/// One [`QcSegmentData`] per Q record, or an empty list when the message carries none.
///
/// # Errors
///
/// Returns [`AstmError::Parse`] if the message is blank, or if any Q record lacks a test code,
/// lot, level, value, unit or timestamp, carries a level other than `L`/`N`/`H`, or has a
/// timestamp not in `yyyyMMddHHmmss` form.
pub fn parse_q_segments(message: &str) -> AstmResult<Vec<QcSegmentData>> {
    if message.trim().is_empty() {
        return Err(AstmError::Parse("QC message is empty".into()));
    }

    let parsed = Message::parse(message)?;
    let instrument_id = parsed.instrument_id().map(str::to_string);

    parsed
        .records_of(&RecordType::Qc)
        .map(|record| parse_q_record(record, instrument_id.clone()))
        .collect()
}

fn parse_q_record(record: &Record, instrument_id: Option<String>) -> AstmResult<QcSegmentData> {
    if record.field_count() < MIN_Q_FIELDS {
        return Err(AstmError::Parse(format!(
            "Q record has {} fields, expected at least {}: {}",
            record.field_count(),
            MIN_Q_FIELDS,
            record.raw()
        )));
    }

    let missing = |what: &str| AstmError::Parse(format!("Q record missing {what}: {}", record.raw()));

    let test_code = record.component(2, 0).ok_or_else(|| missing("test code"))?;
    let lot = record.component(2, 1).ok_or_else(|| missing("control lot"))?;
    let level_code = record.component(2, 2).ok_or_else(|| missing("control level"))?;
    let control_level = ControlLevel::from_code(level_code).ok_or_else(|| {
        AstmError::Parse(format!(
            "Q record has invalid control level '{level_code}' (expected L, N or H): {}",
            record.raw()
        ))
    })?;
    let value = record.field(3).ok_or_else(|| missing("result value"))?;
    let unit = record.field(4).ok_or_else(|| missing("unit"))?;
    let raw_timestamp = record.field(5).ok_or_else(|| missing("timestamp"))?;
    let timestamp =
        NaiveDateTime::parse_from_str(raw_timestamp, QC_TIMESTAMP_FORMAT).map_err(|e| {
            AstmError::Parse(format!(
                "Q record timestamp '{raw_timestamp}' is not yyyyMMddHHmmss ({e}): {}",
                record.raw()
            ))
        })?;

    Ok(QcSegmentData {
        instrument_id,
        test_code: test_code.to_string(),
        control_lot_number: lot.to_string(),
        control_level,
        result_value: value.to_string(),
        unit: unit.to_string(),
        timestamp,
        flag: record.field(6).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "H|\\^&|||TEST_ANALYZER^MODEL^V1|||||||P|LIS2-A2";

    fn message(q_lines: &[&str]) -> String {
        let mut lines = vec![HEADER];
        lines.extend_from_slice(q_lines);
        lines.push("L|1|N");
        lines.join("\r")
    }

    #[test]
    fn test_parse_single_q_segment() {
        let msg = message(&["Q|1|GLUCOSE^LOT1^N|105.5|mg/dL|20250127143000|N"]);
        let results = parse_q_segments(&msg).unwrap();
        assert_eq!(results.len(), 1);
        let qc = &results[0];
        assert_eq!(qc.instrument_id(), Some("TEST_ANALYZER"));
        assert_eq!(qc.test_code(), "GLUCOSE");
        assert_eq!(qc.control_lot_number(), "LOT1");
        assert_eq!(qc.control_level(), ControlLevel::Normal);
        assert_eq!(qc.result_value(), "105.5");
        assert_eq!(qc.unit(), "mg/dL");
        assert_eq!(qc.timestamp().to_string(), "2025-01-27 14:30:00");
        assert_eq!(qc.flag(), Some("N"));
    }

    #[test]
    fn test_parse_preserves_order_and_shares_instrument() {
        let msg = message(&[
            "Q|1|GLUCOSE^LOT1^L|60|mg/dL|20250127143000|N",
            "Q|2|GLUCOSE^LOT2^H|300|mg/dL|20250127143100|N",
            "Q|3|CHOL^LOT3^N|180|mg/dL|20250127143200|",
        ]);
        let results = parse_q_segments(&msg).unwrap();
        let codes: Vec<(&str, ControlLevel)> = results
            .iter()
            .map(|q| (q.control_lot_number(), q.control_level()))
            .collect();
        assert_eq!(
            codes,
            vec![
                ("LOT1", ControlLevel::Low),
                ("LOT2", ControlLevel::High),
                ("LOT3", ControlLevel::Normal)
            ]
        );
        assert!(results
            .iter()
            .all(|q| q.instrument_id() == Some("TEST_ANALYZER")));
        assert_eq!(results[2].flag(), None);
    }

    #[test]
    fn test_parse_without_q_segments_is_empty() {
        let msg = message(&["R|1|^^^GLU|105|mg/dL"]);
        assert!(parse_q_segments(&msg).unwrap().is_empty());
    }

    #[test]
    fn test_parse_lf_terminated_message() {
        let msg = format!("{HEADER}\nQ|1|GLUCOSE^LOT1^N|105.5|mg/dL|20250127143000|N\n");
        assert_eq!(parse_q_segments(&msg).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_without_header_has_no_instrument() {
        let results = parse_q_segments("Q|1|GLUCOSE^LOT1^N|105.5|mg/dL|20250127143000|N").unwrap();
        assert_eq!(results[0].instrument_id(), None);
    }

    #[test]
    fn test_parse_empty_message_fails() {
        assert!(matches!(parse_q_segments(""), Err(AstmError::Parse(_))));
        assert!(matches!(parse_q_segments("  \r\n"), Err(AstmError::Parse(_))));
    }

    #[test]
    fn test_missing_lot_fails_whole_message() {
        let msg = message(&[
            "Q|1|GLUCOSE^LOT1^N|105.5|mg/dL|20250127143000|N",
            "Q|2|GLUCOSE^^N|99|mg/dL|20250127143000|N",
        ]);
        assert!(matches!(parse_q_segments(&msg), Err(AstmError::Parse(_))));
    }

    #[test]
    fn test_missing_level_fails() {
        let msg = message(&["Q|1|GLUCOSE^LOT1|105.5|mg/dL|20250127143000|N"]);
        assert!(parse_q_segments(&msg).is_err());
    }

    #[test]
    fn test_invalid_level_fails() {
        let msg = message(&["Q|1|GLUCOSE^LOT1^X|105.5|mg/dL|20250127143000|N"]);
        let err = parse_q_segments(&msg).unwrap_err();
        assert!(err.to_string().contains("invalid control level"));
    }

    #[test]
    fn test_missing_value_fails() {
        let msg = message(&["Q|1|GLUCOSE^LOT1^N||mg/dL|20250127143000|N"]);
        assert!(parse_q_segments(&msg).is_err());
    }

    #[test]
    fn test_missing_unit_fails() {
        let msg = message(&["Q|1|GLUCOSE^LOT1^N|105.5||20250127143000|N"]);
        assert!(parse_q_segments(&msg).is_err());
    }

    #[test]
    fn test_short_record_fails() {
        let msg = message(&["Q|1|GLUCOSE^LOT1^N|105.5"]);
        assert!(parse_q_segments(&msg).is_err());
    }

    #[test]
    fn test_bad_timestamp_fails() {
        let msg = message(&["Q|1|GLUCOSE^LOT1^N|105.5|mg/dL|2025-01-27|N"]);
        assert!(parse_q_segments(&msg).is_err());
    }
}
