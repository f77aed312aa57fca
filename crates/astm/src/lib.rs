//! ASTM wire/boundary support for analyzer messages.
//!
//! This crate provides **wire models** and **parsing helpers** for the two layers of the ASTM
//! protocol family spoken by laboratory instruments:
//! - ASTM E1394 records (`H`, `P`, `O`, `R`, `Q`, `C`, `L`), one record per line
//! - CLSI LIS2-A2 low-level framing (`<STX><FN>data<ETX><CS><CR><LF>`) used on TCP links
//!
//! This crate focuses on:
//! - tokenising raw text into typed records and fields
//! - strict extraction of QC (`Q`) records
//! - frame encoding, decoding and checksum verification
//!
//! It knows nothing about analyzers, mappings or persistence; callers in `lis-core` translate
//! these wire values into domain entities.

pub mod frame;
pub mod qc;
pub mod record;

// Re-export public types
pub use frame::Frame;
pub use qc::{parse_q_segments, ControlLevel, QcSegmentData};
pub use record::{split_lines, Delimiters, Message, Record, RecordType};

/// Errors returned by the `astm` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum AstmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ASTM parse error: {0}")]
    Parse(String),

    #[error("ASTM frame error: {0}")]
    Frame(String),
}

/// Type alias for Results that can fail with an [`AstmError`].
pub type AstmResult<T> = Result<T, AstmError>;
