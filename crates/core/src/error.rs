use crate::model::{AnalyzerStatus, FieldType, OpenelisFieldType};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("type incompatibility: {field_type} field cannot be mapped to {openelis_type}: {detail}")]
    TypeIncompatibility {
        field_type: FieldType,
        openelis_type: OpenelisFieldType,
        detail: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("record was modified by another user (expected {expected}, found {actual})")]
    ConcurrentModification { expected: String, actual: String },

    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: AnalyzerStatus,
        to: AnalyzerStatus,
    },

    #[error("status {0} can only be entered automatically")]
    ManualTransitionForbidden(AnalyzerStatus),

    #[error("activation blocked, missing required mappings: {}", missing.join(", "))]
    ActivationBlocked { missing: Vec<String> },

    #[error("cannot disable mapping: analyzer has {pending} pending messages in the error queue")]
    DisableBlocked { pending: usize },

    #[error("invalid rule expression: {0}")]
    RuleExpression(String),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("seed error: {0}")]
    Seed(String),

    #[error(transparent)]
    Parse(#[from] astm::AstmError),

    #[error(transparent)]
    Hl7(#[from] hl7::Hl7Error),

    #[error("invalid identifier: {0}")]
    Id(#[from] lis_uuid::UuidError),

    #[error("invalid text: {0}")]
    Text(#[from] lis_types::TextError),

    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
