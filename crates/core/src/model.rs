//! Domain entities for analyzer configuration, the error queue and analyzer lifecycle.
//!
//! Entities are plain data. Invariants that involve a single entity are checked by the
//! `validate` methods here; rules spanning several entities (type compatibility, activation,
//! uniqueness) live in the services that own them.
//!
//! All entities derive `Deserialize` so that a seed document can populate the store, and
//! `Serialize` so the CLI can print them.

use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use lis_types::NonEmptyText;
use lis_uuid::EntityId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

macro_rules! display_as_serde_name {
    ($ty:ty { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ============================================================================
// ANALYZERS
// ============================================================================

/// Lifecycle status of an analyzer. Changes only through [`crate::status::StatusService`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalyzerStatus {
    Inactive,
    Setup,
    Validation,
    Active,
    ErrorPending,
    Offline,
    Deleted,
}

display_as_serde_name!(AnalyzerStatus {
    Inactive => "INACTIVE",
    Setup => "SETUP",
    Validation => "VALIDATION",
    Active => "ACTIVE",
    ErrorPending => "ERROR_PENDING",
    Offline => "OFFLINE",
    Deleted => "DELETED",
});

impl Default for AnalyzerStatus {
    fn default() -> Self {
        Self::Setup
    }
}

/// How messages reach the engine from an analyzer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transport {
    #[default]
    Tcp,
    Serial,
    FileImport,
}

display_as_serde_name!(Transport {
    Tcp => "TCP",
    Serial => "SERIAL",
    FileImport => "FILE_IMPORT",
});

impl Transport {
    /// Push-only transports deliver messages but cannot be queried.
    pub fn is_push_only(&self) -> bool {
        matches!(self, Self::Serial | Self::FileImport)
    }
}

/// A family of analyzers sharing one protocol handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerType {
    #[serde(default)]
    pub id: EntityId,
    pub name: NonEmptyText,
    /// Registered name of the protocol handler serving this type.
    pub handler: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Analyzer {
    #[serde(default)]
    pub id: EntityId,
    pub name: NonEmptyText,
    #[serde(default)]
    pub analyzer_type_id: Option<EntityId>,
    /// Direct handler binding; takes precedence over the type's handler.
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: AnalyzerStatus,
    #[serde(default)]
    pub last_activated: Option<DateTime<Utc>>,
}

impl Analyzer {
    pub fn new(name: NonEmptyText) -> Self {
        Self {
            id: EntityId::new(),
            name,
            analyzer_type_id: None,
            handler: None,
            ip_address: None,
            port: None,
            transport: Transport::default(),
            enabled: true,
            status: AnalyzerStatus::default(),
            last_activated: None,
        }
    }
}

// ============================================================================
// FIELDS AND MAPPINGS
// ============================================================================

/// Kind of value an analyzer field carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Numeric,
    Qualitative,
    Text,
    Custom,
}

display_as_serde_name!(FieldType {
    Numeric => "NUMERIC",
    Qualitative => "QUALITATIVE",
    Text => "TEXT",
    Custom => "CUSTOM",
});

impl std::str::FromStr for FieldType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NUMERIC" => Ok(Self::Numeric),
            "QUALITATIVE" => Ok(Self::Qualitative),
            "TEXT" => Ok(Self::Text),
            "CUSTOM" => Ok(Self::Custom),
            other => Err(CoreError::InvalidInput(format!("unknown field type '{other}'"))),
        }
    }
}

/// A named value emitted by an analyzer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerField {
    #[serde(default)]
    pub id: EntityId,
    pub analyzer_id: EntityId,
    pub field_name: NonEmptyText,
    pub field_type: FieldType,
    #[serde(default)]
    pub unit: Option<NonEmptyText>,
    /// Wire position, either `TYPE|index` (e.g. `O|3`) or the raw test identifier.
    #[serde(default)]
    pub astm_ref: Option<String>,
    #[serde(default)]
    pub custom_type_id: Option<EntityId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl AnalyzerField {
    /// Check the unit invariant: NUMERIC requires a unit, QUALITATIVE and TEXT forbid one.
    pub fn validate(&self) -> CoreResult<()> {
        match (self.field_type, &self.unit) {
            (FieldType::Numeric, None) => Err(CoreError::Validation(format!(
                "NUMERIC field '{}' requires a unit",
                self.field_name
            ))),
            (FieldType::Qualitative | FieldType::Text, Some(unit)) => {
                Err(CoreError::Validation(format!(
                    "{} field '{}' must not have a unit (got '{}')",
                    self.field_type, self.field_name, unit
                )))
            }
            (FieldType::Custom, _) if self.custom_type_id.is_none() => {
                Err(CoreError::Validation(format!(
                    "CUSTOM field '{}' requires a custom field type",
                    self.field_name
                )))
            }
            _ => Ok(()),
        }
    }

    /// Record type and field index when `astm_ref` is positional (`O|3`).
    pub fn position(&self) -> Option<(&str, usize)> {
        let (record, index) = self.astm_ref.as_deref()?.split_once('|')?;
        let record = record.trim();
        if record.is_empty() {
            return None;
        }
        Some((record, index.trim().parse().ok()?))
    }
}

/// Target entity kind in the laboratory system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenelisFieldType {
    Test,
    Result,
    Sample,
    Qc,
    Metadata,
}

display_as_serde_name!(OpenelisFieldType {
    Test => "TEST",
    Result => "RESULT",
    Sample => "SAMPLE",
    Qc => "QC",
    Metadata => "METADATA",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    TestLevel,
    ResultLevel,
    Metadata,
}

display_as_serde_name!(MappingType {
    TestLevel => "TEST_LEVEL",
    ResultLevel => "RESULT_LEVEL",
    Metadata => "METADATA",
});

/// Translation of one analyzer field into a laboratory-system field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMapping {
    #[serde(default)]
    pub id: EntityId,
    pub analyzer_id: EntityId,
    pub analyzer_field_id: EntityId,
    pub openelis_field_id: NonEmptyText,
    pub openelis_field_type: OpenelisFieldType,
    pub mapping_type: MappingType,
    #[serde(default)]
    pub is_required: bool,
    /// Drafts (`false`) never auto-promote; only an explicit activation sets this.
    #[serde(default)]
    pub is_active: bool,
    /// Example values checked against CUSTOM field rules.
    #[serde(default)]
    pub sample_values: Vec<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retirement_reason: Option<NonEmptyText>,
}

impl FieldMapping {
    /// Advance the optimistic-lock token after a change.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.last_updated = now;
    }
}

/// Unit translation for a numeric field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitMapping {
    #[serde(default)]
    pub id: EntityId,
    pub analyzer_field_id: EntityId,
    pub analyzer_unit: NonEmptyText,
    pub openelis_unit: NonEmptyText,
    #[serde(default)]
    pub conversion_factor: Option<Decimal>,
    /// Reject values in a different unit instead of converting them.
    #[serde(default)]
    pub reject_if_mismatch: bool,
}

impl UnitMapping {
    pub fn units_differ(&self) -> bool {
        !self.analyzer_unit.eq_ignore_case(self.openelis_unit.as_str())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if let Some(factor) = self.conversion_factor {
            if factor.is_zero() {
                return Err(CoreError::Validation(
                    "conversion factor must not be zero".into(),
                ));
            }
        }
        if self.units_differ() && self.conversion_factor.is_none() && !self.reject_if_mismatch {
            return Err(CoreError::Validation(format!(
                "conversion factor required to map '{}' to '{}'",
                self.analyzer_unit, self.openelis_unit
            )));
        }
        Ok(())
    }
}

/// Translation of one qualitative analyzer value into a laboratory-system code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualitativeMapping {
    #[serde(default)]
    pub id: EntityId,
    pub analyzer_field_id: EntityId,
    pub analyzer_value: NonEmptyText,
    pub openelis_code: NonEmptyText,
    #[serde(default)]
    pub is_default: bool,
}

// ============================================================================
// CUSTOM FIELD TYPES
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomFieldType {
    #[serde(default)]
    pub id: EntityId,
    pub type_name: NonEmptyText,
    pub display_name: NonEmptyText,
    /// Laboratory-system targets this type may map to; empty means any.
    #[serde(default)]
    pub compatible_types: Vec<OpenelisFieldType>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Regex,
    Range,
    Enum,
    Length,
}

display_as_serde_name!(RuleType {
    Regex => "REGEX",
    Range => "RANGE",
    Enum => "ENUM",
    Length => "LENGTH",
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRule {
    #[serde(default)]
    pub id: EntityId,
    pub custom_field_type_id: EntityId,
    pub rule_name: NonEmptyText,
    pub rule_type: RuleType,
    pub rule_expression: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl ValidationRule {
    pub fn failure_message(&self) -> String {
        self.error_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Value does not meet validation rule: {}", self.rule_name))
    }
}

// ============================================================================
// ERROR QUEUE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Mapping,
    Validation,
    Timeout,
    Protocol,
    Connection,
    QcMappingIncomplete,
    QcServiceUnavailable,
}

display_as_serde_name!(ErrorType {
    Mapping => "MAPPING",
    Validation => "VALIDATION",
    Timeout => "TIMEOUT",
    Protocol => "PROTOCOL",
    Connection => "CONNECTION",
    QcMappingIncomplete => "QC_MAPPING_INCOMPLETE",
    QcServiceUnavailable => "QC_SERVICE_UNAVAILABLE",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

display_as_serde_name!(Severity {
    Critical => "CRITICAL",
    Error => "ERROR",
    Warning => "WARNING",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    Unacknowledged,
    Acknowledged,
}

display_as_serde_name!(ErrorStatus {
    Unacknowledged => "UNACKNOWLEDGED",
    Acknowledged => "ACKNOWLEDGED",
});

/// A message the engine could not fully translate. Retained as an audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerError {
    pub id: EntityId,
    pub analyzer_id: EntityId,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub status: ErrorStatus,
    pub error_message: String,
    /// Original message text, kept verbatim for reprocessing.
    pub raw_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<NonEmptyText>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}
