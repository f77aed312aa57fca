//! Validation rules for CUSTOM analyzer field types.
//!
//! Four fixed rule kinds are supported:
//! - `REGEX`: the whole value must match the pattern
//! - `RANGE`: `{"min": n, "max": n}`, either bound optional, inclusive
//! - `ENUM`: a JSON list of allowed values
//! - `LENGTH`: `{"minLength": n, "maxLength": n}`, either bound optional, counted in characters

use crate::model::{AnalyzerField, FieldMapping, FieldType, RuleType, ValidationRule};
use crate::store::{AnalyzerStore, AnalyzerStoreExt};
use crate::{CoreError, CoreResult};
use lis_uuid::EntityId;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

/// Parse a decimal, accepting plain and scientific notation.
pub fn parse_decimal(value: &str) -> Option<Decimal> {
    let value = value.trim();
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .ok()
}

pub struct RuleEngine;

impl RuleEngine {
    /// Check that a rule expression is well formed for its type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RuleExpression`] describing the problem.
    pub fn check_expression(rule_type: RuleType, expression: &str) -> CoreResult<()> {
        match rule_type {
            RuleType::Regex => compile_full_match(expression).map(|_| ()),
            RuleType::Range => parse_bounds(expression, "min", "max", parse_json_decimal).map(|_| ()),
            RuleType::Enum => parse_enum(expression).map(|_| ()),
            RuleType::Length => {
                parse_bounds(expression, "minLength", "maxLength", |v| v.as_u64()).map(|_| ())
            }
        }
    }

    /// Evaluate `value` against `rule`.
    ///
    /// # Returns
    ///
    /// `true` if the value satisfies the rule. A non-numeric value never satisfies a RANGE rule.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RuleExpression`] if the rule's expression is malformed.
    pub fn evaluate(value: &str, rule: &ValidationRule) -> CoreResult<bool> {
        let expression = rule.rule_expression.as_str();
        match rule.rule_type {
            RuleType::Regex => {
                if expression.trim().is_empty() {
                    return Ok(true);
                }
                Ok(compile_full_match(expression)?.is_match(value))
            }
            RuleType::Range => {
                let (min, max) = parse_bounds(expression, "min", "max", parse_json_decimal)?;
                let Some(number) = parse_decimal(value) else {
                    return Ok(false);
                };
                Ok(min.is_none_or(|m| number >= m) && max.is_none_or(|m| number <= m))
            }
            RuleType::Enum => {
                let allowed = parse_enum(expression)?;
                let value = value.trim();
                Ok(allowed.iter().any(|a| a == value))
            }
            RuleType::Length => {
                let (min, max) =
                    parse_bounds(expression, "minLength", "maxLength", |v| v.as_u64())?;
                let len = value.chars().count() as u64;
                Ok(min.is_none_or(|m| len >= m) && max.is_none_or(|m| len <= m))
            }
        }
    }
}

fn compile_full_match(pattern: &str) -> CoreResult<Regex> {
    if pattern.trim().is_empty() {
        return Regex::new("").map_err(|e| CoreError::RuleExpression(e.to_string()));
    }
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| CoreError::RuleExpression(format!("invalid regex '{pattern}': {e}")))
}

fn parse_json_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

fn parse_bounds<T: PartialOrd + Copy>(
    expression: &str,
    min_key: &str,
    max_key: &str,
    convert: impl Fn(&Value) -> Option<T>,
) -> CoreResult<(Option<T>, Option<T>)> {
    let json: Value = serde_json::from_str(expression)
        .map_err(|e| CoreError::RuleExpression(format!("expected JSON object: {e}")))?;
    let Value::Object(map) = json else {
        return Err(CoreError::RuleExpression("expected JSON object".into()));
    };

    let bound = |key: &str| -> CoreResult<Option<T>> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => convert(v)
                .map(Some)
                .ok_or_else(|| CoreError::RuleExpression(format!("'{key}' has invalid value {v}"))),
        }
    };

    let (min, max) = (bound(min_key)?, bound(max_key)?);
    if min.is_none() && max.is_none() {
        return Err(CoreError::RuleExpression(format!(
            "at least one of '{min_key}' or '{max_key}' is required"
        )));
    }
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(CoreError::RuleExpression(format!(
                "'{min_key}' must not exceed '{max_key}'"
            )));
        }
    }
    Ok((min, max))
}

fn parse_enum(expression: &str) -> CoreResult<Vec<String>> {
    let values: Vec<Value> = serde_json::from_str(expression)
        .map_err(|e| CoreError::RuleExpression(format!("expected JSON list: {e}")))?;
    if values.is_empty() {
        return Err(CoreError::RuleExpression("enumeration must not be empty".into()));
    }
    Ok(values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

// ============================================================================
// CUSTOM TYPE VALIDATION
// ============================================================================

/// Decides whether a CUSTOM field may be mapped as proposed.
pub trait CustomTypeValidator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CoreError::TypeIncompatibility`] if the mapping is not allowed.
    fn validate_mapping(&self, field: &AnalyzerField, mapping: &FieldMapping) -> CoreResult<()>;

    /// Messages for every active rule that `value` fails. Malformed rules are skipped.
    fn validate_value(&self, custom_type_id: EntityId, value: &str) -> CoreResult<Vec<String>>;
}

/// Evaluates the custom type's active rules against the mapping's sample values.
pub struct RuleEngineValidator {
    store: Arc<dyn AnalyzerStore>,
}

impl RuleEngineValidator {
    pub fn new(store: Arc<dyn AnalyzerStore>) -> Self {
        Self { store }
    }
}

impl CustomTypeValidator for RuleEngineValidator {
    fn validate_mapping(&self, field: &AnalyzerField, mapping: &FieldMapping) -> CoreResult<()> {
        let incompatible = |detail: String| CoreError::TypeIncompatibility {
            field_type: FieldType::Custom,
            openelis_type: mapping.openelis_field_type,
            detail,
        };

        let type_id = field
            .custom_type_id
            .ok_or_else(|| incompatible("field has no custom type".into()))?;
        let custom_type = self.store.require_custom_type(type_id)?;
        if !custom_type.is_active {
            return Err(incompatible(format!(
                "custom type '{}' is inactive",
                custom_type.type_name
            )));
        }
        if !custom_type.compatible_types.is_empty()
            && !custom_type
                .compatible_types
                .contains(&mapping.openelis_field_type)
        {
            return Err(incompatible(format!(
                "custom type '{}' does not allow {} targets",
                custom_type.type_name, mapping.openelis_field_type
            )));
        }

        let rules = self.store.rules_for_custom_type(type_id)?;
        for rule in rules.iter().filter(|r| r.is_active) {
            for sample in &mapping.sample_values {
                if !RuleEngine::evaluate(sample, rule)? {
                    return Err(incompatible(format!(
                        "sample value '{sample}': {}",
                        rule.failure_message()
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_value(&self, custom_type_id: EntityId, value: &str) -> CoreResult<Vec<String>> {
        let mut failures = Vec::new();
        for rule in self
            .store
            .rules_for_custom_type(custom_type_id)?
            .iter()
            .filter(|r| r.is_active)
        {
            match RuleEngine::evaluate(value, rule) {
                Ok(true) => {}
                Ok(false) => failures.push(rule.failure_message()),
                Err(e) => tracing::warn!("skipping rule '{}': {}", rule.rule_name, e),
            }
        }
        Ok(failures)
    }
}
