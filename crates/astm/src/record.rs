//! ASTM E1394 record tokenisation.
//!
//! Responsibilities:
//! - Split raw message text into record lines (CR, LF or CRLF terminated)
//! - Read the delimiter set declared by the header record
//! - Expose records as typed, index-addressable fields and components
//!
//! Field indices are zero-based and include the record type token, so for
//! `R|1|^^^GLU|105|mg/dL` field 0 is `R`, field 2 is `^^^GLU` and field 4 is `mg/dL`.

use crate::{AstmError, AstmResult};

// ============================================================================
// Delimiters
// ============================================================================

/// Delimiter set declared in the header record (`H|\^&|...`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub repeat: char,
    pub component: char,
    pub escape: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            repeat: '\\',
            component: '^',
            escape: '&',
        }
    }
}

impl Delimiters {
    /// Read the delimiter declaration from a header line.
    ///
    /// The character after `H` is the field delimiter; the next field lists the repeat,
    /// component and escape delimiters in that order. Returns `None` if `line` is not a header
    /// or the declaration is incomplete.
    pub fn from_header(line: &str) -> Option<Self> {
        let mut chars = line.trim_start().chars();
        if chars.next()? != 'H' {
            return None;
        }
        let field = chars.next()?;
        let repeat = chars.next()?;
        let component = chars.next()?;
        let escape = chars.next()?;
        if [repeat, component, escape].contains(&field) {
            return None;
        }
        Some(Self {
            field,
            repeat,
            component,
            escape,
        })
    }
}

// ============================================================================
// Records
// ============================================================================

/// Record type, taken from the first field token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordType {
    Header,
    Patient,
    Order,
    Result,
    Qc,
    Comment,
    Manufacturer,
    Terminator,
    Other(String),
}

impl RecordType {
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "H" => Self::Header,
            "P" => Self::Patient,
            "O" => Self::Order,
            "R" => Self::Result,
            "Q" => Self::Qc,
            "C" => Self::Comment,
            "M" => Self::Manufacturer,
            "L" => Self::Terminator,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Self::Header => "H",
            Self::Patient => "P",
            Self::Order => "O",
            Self::Result => "R",
            Self::Qc => "Q",
            Self::Comment => "C",
            Self::Manufacturer => "M",
            Self::Terminator => "L",
            Self::Other(token) => token,
        }
    }
}

/// A single tokenised record line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    record_type: RecordType,
    raw: String,
    fields: Vec<String>,
    component: char,
}

impl Record {
    /// Tokenise one line using `delimiters`.
    pub fn parse(line: &str, delimiters: &Delimiters) -> Self {
        let fields: Vec<String> = line.split(delimiters.field).map(str::to_string).collect();
        let record_type = RecordType::from_token(fields.first().map(String::as_str).unwrap_or(""));
        Self {
            record_type,
            raw: line.to_string(),
            fields,
            component: delimiters.component,
        }
    }

    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    /// The original line, without its terminator.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field `index` trimmed, or `None` if absent or blank.
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
    }

    /// All components of field `index`, untrimmed. Empty when the field is absent.
    pub fn components(&self, index: usize) -> Vec<&str> {
        match self.fields.get(index) {
            Some(field) => field.split(self.component).collect(),
            None => Vec::new(),
        }
    }

    /// Component `component` of field `index`, trimmed, or `None` if absent or blank.
    pub fn component(&self, index: usize, component: usize) -> Option<&str> {
        self.components(index)
            .get(component)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
    }

    /// Universal test identifier of an order or result record (`^^^GLU` → `GLU`).
    ///
    /// Falls back to the first non-empty component for instruments that omit the leading
    /// empty components.
    pub fn test_code(&self) -> Option<&str> {
        self.component(2, 3).or_else(|| {
            self.components(2)
                .into_iter()
                .map(str::trim)
                .find(|c| !c.is_empty())
        })
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Split raw text into non-blank lines, accepting CR, LF and CRLF terminators.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// A parsed ASTM message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    delimiters: Delimiters,
    records: Vec<Record>,
}

impl Message {
    /// Tokenise a complete message.
    ///
    /// Delimiters are taken from the first header record; the ASTM defaults apply when the
    /// message has no header.
    ///
    /// # Errors
    ///
    /// Returns [`AstmError::Parse`] if `text` is empty or blank.
    pub fn parse(text: &str) -> AstmResult<Self> {
        let lines = split_lines(text);
        if lines.is_empty() {
            return Err(AstmError::Parse("message is empty".into()));
        }
        Ok(Self::from_lines(&lines))
    }

    /// Tokenise already-split lines. Blank lines are skipped.
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let delimiters = lines
            .iter()
            .find_map(|line| Delimiters::from_header(line.as_ref()))
            .unwrap_or_default();
        let records = lines
            .iter()
            .map(AsRef::as_ref)
            .filter(|line| !line.trim().is_empty())
            .map(|line| Record::parse(line, &delimiters))
            .collect();
        Self {
            delimiters,
            records,
        }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn header(&self) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| *r.record_type() == RecordType::Header)
    }

    /// Records of one type, in input order.
    pub fn records_of<'a>(&'a self, kind: &'a RecordType) -> impl Iterator<Item = &'a Record> + 'a {
        self.records.iter().filter(move |r| r.record_type() == kind)
    }

    /// Sender name from the header (`H|\^&|||NAME^MODEL^VERSION|...`), first component of field 4.
    pub fn instrument_id(&self) -> Option<&str> {
        self.header().and_then(|h| h.component(4, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "H|\\^&|||COBAS^6000^1.2|||||||P|LIS2-A2\r\
P|1||PAT001\r\
O|1|S001||^^^GLU\r\
R|1|^^^GLU|105|mg/dL||N\r\
L|1|N\r";

    #[test]
    fn test_default_delimiters_from_header() {
        let d = Delimiters::from_header("H|\\^&|||X").unwrap();
        assert_eq!(d, Delimiters::default());
    }

    #[test]
    fn test_custom_delimiters_from_header() {
        let d = Delimiters::from_header("H!\\~&!!!X").unwrap();
        assert_eq!(d.field, '!');
        assert_eq!(d.component, '~');
    }

    #[test]
    fn test_from_header_rejects_non_header() {
        assert!(Delimiters::from_header("R|1|^^^GLU").is_none());
        assert!(Delimiters::from_header("H|").is_none());
    }

    #[test]
    fn test_split_lines_accepts_mixed_terminators() {
        let lines = split_lines("H|a\r\nP|1\rR|1\n\nL|1");
        assert_eq!(lines, vec!["H|a", "P|1", "R|1", "L|1"]);
    }

    #[test]
    fn test_parse_message_records_in_order() {
        let message = Message::parse(SAMPLE).unwrap();
        let kinds: Vec<&str> = message
            .records()
            .iter()
            .map(|r| r.record_type().token())
            .collect();
        assert_eq!(kinds, vec!["H", "P", "O", "R", "L"]);
    }

    #[test]
    fn test_instrument_id_is_first_header_component() {
        let message = Message::parse(SAMPLE).unwrap();
        assert_eq!(message.instrument_id(), Some("COBAS"));
    }

    #[test]
    fn test_instrument_id_absent_without_header() {
        let message = Message::parse("R|1|^^^GLU|105").unwrap();
        assert_eq!(message.instrument_id(), None);
    }

    #[test]
    fn test_result_test_code() {
        let message = Message::parse(SAMPLE).unwrap();
        let result = message.records_of(&RecordType::Result).next().unwrap();
        assert_eq!(result.test_code(), Some("GLU"));
        assert_eq!(result.field(3), Some("105"));
        assert_eq!(result.field(4), Some("mg/dL"));
    }

    #[test]
    fn test_test_code_without_leading_components() {
        let record = Record::parse("R|1|WBC^White Cells|7.2", &Delimiters::default());
        assert_eq!(record.test_code(), Some("WBC"));
    }

    #[test]
    fn test_blank_field_is_none() {
        let record = Record::parse("R|1||  |x", &Delimiters::default());
        assert_eq!(record.field(2), None);
        assert_eq!(record.field(3), None);
        assert_eq!(record.field(4), Some("x"));
        assert_eq!(record.field(9), None);
    }

    #[test]
    fn test_parse_rejects_blank_message() {
        assert!(matches!(Message::parse(" \r\n "), Err(AstmError::Parse(_))));
    }
}
