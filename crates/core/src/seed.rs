//! Seed documents: analyzer configuration loaded from YAML into an [`InMemoryStore`].
//!
//! Entities are inserted in dependency order (types, analyzers, custom types, rules, fields,
//! mappings, unit and qualitative mappings). A reference to an entity missing from the document
//! fails the load the same way a dangling write fails in the store. Seeded configuration is held
//! to the same rules as configuration entered through the mapping service.

use crate::handlers::HandlerSpec;
use crate::mapping::{check_compatibility, insert_mapping, insert_qualitative, insert_unit_mapping};
use crate::model::{
    Analyzer, AnalyzerField, AnalyzerType, CustomFieldType, FieldMapping, QualitativeMapping,
    UnitMapping, ValidationRule,
};
use crate::rules::{RuleEngine, RuleEngineValidator};
use crate::store::{AnalyzerStore, AnalyzerStoreExt, InMemoryStore, StoreSnapshot};
use crate::{CoreError, CoreResult};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Top-level layout of a seed document. Every section is optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedDocument {
    #[serde(default)]
    pub handlers: Vec<HandlerSpec>,
    #[serde(default)]
    pub analyzer_types: Vec<AnalyzerType>,
    #[serde(default)]
    pub analyzers: Vec<Analyzer>,
    #[serde(default)]
    pub custom_field_types: Vec<CustomFieldType>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default)]
    pub fields: Vec<AnalyzerField>,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub unit_mappings: Vec<UnitMapping>,
    #[serde(default)]
    pub qualitative_mappings: Vec<QualitativeMapping>,
}

impl SeedDocument {
    /// Parse seed YAML.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seed`] naming the path of the first field that does not match the
    /// schema (for example `fields[2].field_type`).
    pub fn parse(yaml_text: &str) -> CoreResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        match serde_path_to_error::deserialize::<_, SeedDocument>(deserializer) {
            Ok(document) => Ok(document),
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() || path == "." {
                    "<root>"
                } else {
                    path.as_str()
                };
                Err(CoreError::Seed(format!("seed schema mismatch at {path}: {source}")))
            }
        }
    }

    /// Build a store, checking references and the same invariants the mapping service enforces:
    /// field units, rule expressions, type compatibility of mappings, and uniqueness of mappings,
    /// unit mappings and qualitative values. Handler specs are not part of the store.
    pub fn into_store(self) -> CoreResult<Arc<InMemoryStore>> {
        let mut snapshot = StoreSnapshot::default();

        for analyzer_type in self.analyzer_types {
            snapshot.put_analyzer_type(analyzer_type)?;
        }
        for analyzer in self.analyzers {
            snapshot.put_analyzer(analyzer)?;
        }
        for custom_type in self.custom_field_types {
            snapshot.put_custom_type(custom_type)?;
        }
        for rule in self.validation_rules {
            RuleEngine::check_expression(rule.rule_type, &rule.rule_expression)?;
            snapshot.put_rule(rule)?;
        }
        for field in self.fields {
            field.validate()?;
            snapshot.put_field(field)?;
        }

        let store = Arc::new(InMemoryStore::from_snapshot(snapshot));
        let validator = RuleEngineValidator::new(store.clone());
        for mapping in self.mappings {
            if let Some(field) = store.field(mapping.analyzer_field_id)? {
                check_compatibility(&validator, &field, &mapping)?;
            }
            store.atomically(move |tx| insert_mapping(tx, mapping))?;
        }
        store.atomically(move |tx| {
            for unit_mapping in self.unit_mappings {
                insert_unit_mapping(tx, unit_mapping)?;
            }
            for mapping in self.qualitative_mappings {
                insert_qualitative(tx, mapping)?;
            }
            Ok(())
        })?;
        Ok(store)
    }
}

/// A loaded seed: the populated store and the handlers to register.
#[derive(Debug)]
pub struct Seed {
    pub store: Arc<InMemoryStore>,
    pub handlers: Vec<HandlerSpec>,
}

/// Parse seed YAML into a ready store.
pub fn load_seed_str(yaml_text: &str) -> CoreResult<Seed> {
    let mut document = SeedDocument::parse(yaml_text)?;
    let handlers = std::mem::take(&mut document.handlers);
    let counts = (
        document.analyzers.len(),
        document.fields.len(),
        document.mappings.len(),
    );
    let store = document.into_store()?;
    tracing::info!(
        "seed loaded: {} analyzer(s), {} field(s), {} mapping(s)",
        counts.0,
        counts.1,
        counts.2
    );
    Ok(Seed {
        store,
        handlers,
    })
}

/// Read and load a seed file.
///
/// # Errors
///
/// Returns [`CoreError::Io`] if the file cannot be read, otherwise the errors of
/// [`load_seed_str`].
pub fn load_seed_file(path: &Path) -> CoreResult<Seed> {
    let text = std::fs::read_to_string(path)?;
    load_seed_str(&text).map_err(|e| match e {
        CoreError::Seed(message) => CoreError::Seed(format!("{}: {message}", path.display())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalyzerStatus, FieldType};
    use crate::store::AnalyzerStore;
    use std::io::Write;

    const SEED: &str = r#"
handlers:
  - name: cobas
    protocol: ASTM
    pattern: "^COBAS"
analyzer_types:
  - id: "aa000000000000000000000000000001"
    name: Roche Cobas
    handler: cobas
analyzers:
  - id: "bb000000000000000000000000000001"
    name: Cobas 6000
    analyzer_type_id: "aa000000000000000000000000000001"
    ip_address: 10.0.0.5
    port: 5000
    status: ACTIVE
fields:
  - id: "cc000000000000000000000000000001"
    analyzer_id: "bb000000000000000000000000000001"
    field_name: GLU
    field_type: NUMERIC
    unit: mg/dL
mappings:
  - analyzer_id: "bb000000000000000000000000000001"
    analyzer_field_id: "cc000000000000000000000000000001"
    openelis_field_id: test.glucose
    openelis_field_type: TEST
    mapping_type: TEST_LEVEL
    is_active: true
unit_mappings:
  - analyzer_field_id: "cc000000000000000000000000000001"
    analyzer_unit: mg/dL
    openelis_unit: mmol/L
    conversion_factor: "0.0555"
"#;

    #[test]
    fn test_seed_loads_entities() {
        let seed = load_seed_str(SEED).unwrap();
        assert_eq!(seed.handlers[0].name, "cobas");
        let store = seed.store;
        let analyzers = store.analyzers().unwrap();
        assert_eq!(analyzers.len(), 1);
        assert_eq!(analyzers[0].status, AnalyzerStatus::Active);

        let fields = store.fields_for_analyzer(analyzers[0].id).unwrap();
        assert_eq!(fields[0].field_type, FieldType::Numeric);
        let mappings = store.mappings_for_analyzer(analyzers[0].id).unwrap();
        assert!(mappings[0].is_active);
        assert_eq!(
            store.unit_mappings_for_field(fields[0].id).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_schema_error_names_path() {
        let bad = SEED.replace("field_type: NUMERIC", "field_type: DECIMAL");
        let err = load_seed_str(&bad).unwrap_err().to_string();
        assert!(err.contains("fields[0].field_type"), "{err}");
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let bad = SEED.replace(
            "analyzer_id: \"bb000000000000000000000000000001\"\n    field_name",
            "analyzer_id: \"bb000000000000000000000000000009\"\n    field_name",
        );
        assert!(matches!(
            load_seed_str(&bad),
            Err(CoreError::Persistence(_))
        ));
    }

    #[test]
    fn test_numeric_field_without_unit_rejected() {
        let bad = SEED.replace("    unit: mg/dL\n", "");
        assert!(matches!(load_seed_str(&bad), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_incompatible_mapping_rejected() {
        let bad = SEED.replace(
            "openelis_field_type: TEST\n    mapping_type: TEST_LEVEL",
            "openelis_field_type: METADATA\n    mapping_type: METADATA",
        );
        assert_ne!(bad, SEED);
        assert!(matches!(
            load_seed_str(&bad),
            Err(CoreError::TypeIncompatibility { .. })
        ));
    }

    #[test]
    fn test_duplicate_unit_mapping_rejected() {
        let bad = format!(
            "{SEED}  - analyzer_field_id: \"cc000000000000000000000000000001\"\n    \
             analyzer_unit: MG/DL\n    openelis_unit: mmol/L\n    conversion_factor: \"0.0555\"\n"
        );
        assert!(matches!(load_seed_str(&bad), Err(CoreError::Validation(_))));
    }

    const QUALITATIVE_SEED: &str = r#"
analyzers:
  - id: "bb000000000000000000000000000001"
    name: Cobas 6000
fields:
  - id: "cc000000000000000000000000000002"
    analyzer_id: "bb000000000000000000000000000001"
    field_name: HIV
    field_type: QUALITATIVE
qualitative_mappings:
  - analyzer_field_id: "cc000000000000000000000000000002"
    analyzer_value: POS
    openelis_code: POSITIVE
    is_default: true
  - analyzer_field_id: "cc000000000000000000000000000002"
    analyzer_value: NEG
    openelis_code: NEGATIVE
"#;

    #[test]
    fn test_qualitative_values_checked() {
        let seed = load_seed_str(QUALITATIVE_SEED).unwrap();
        let hiv = lis_uuid::EntityId::parse("cc000000000000000000000000000002").unwrap();
        assert_eq!(seed.store.qualitative_mappings_for_field(hiv).unwrap().len(), 2);

        let repeated_value = QUALITATIVE_SEED.replace("analyzer_value: NEG", "analyzer_value: pos");
        assert!(matches!(
            load_seed_str(&repeated_value),
            Err(CoreError::Validation(_))
        ));

        let second_default = format!("{QUALITATIVE_SEED}    is_default: true\n");
        assert!(matches!(
            load_seed_str(&second_default),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_seed_file_round_trip_through_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();
        let store = load_seed_file(file.path()).unwrap().store;
        assert_eq!(store.analyzers().unwrap().len(), 1);

        let missing = file.path().with_extension("missing");
        assert!(matches!(load_seed_file(&missing), Err(CoreError::Io(_))));
    }
}
