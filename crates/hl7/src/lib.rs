//! HL7 v2 wire/boundary support.
//!
//! This crate provides the HL7 v2 pieces the analyzer integration engine needs:
//! - segment tokenising with MSH-declared encoding characters
//! - inbound results (`ORU^R01`) and header metadata (`MSH`)
//! - outbound orders (`ORM^O01`), generated deterministically
//!
//! Parsing and generation are fail-fast: a caller either receives a complete value or an
//! [`Hl7Error`], never a partial message.

pub mod orm;
pub mod oru;
pub mod segment;

// Re-export facades and wire models
pub use orm::{generate_orm_o01, OrderItem, OrderRequest};
pub use oru::{extract_msh_info, parse_oru_r01, MshInfo, Observation, OruR01};
pub use segment::{to_segment_lines, EncodingCharacters, Segment};

/// Errors returned by the `hl7` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum Hl7Error {
    #[error("HL7 parse error: {0}")]
    Parse(String),

    #[error("HL7 generation error: {0}")]
    Generation(String),
}

/// Type alias for Results that can fail with an [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;
