//! Built-in protocol handlers.

use crate::router::{HandlerRegistry, LineInserter, ProtocolHandler};
use crate::{CoreError, CoreResult};
use astm::Message;
use lis_uuid::EntityId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

fn compile(pattern: &str) -> CoreResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| CoreError::InvalidInput(format!("invalid handler pattern '{pattern}': {e}")))
}

/// Claims ASTM messages whose header sender (`H|\^&|||NAME^MODEL^VERSION`) matches a pattern.
pub struct GenericAstmHandler {
    name: String,
    sender: Regex,
    inserter: Arc<dyn LineInserter>,
}

impl GenericAstmHandler {
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if `sender_pattern` is not a valid regex.
    pub fn new(
        name: impl Into<String>,
        sender_pattern: &str,
        inserter: Arc<dyn LineInserter>,
    ) -> CoreResult<Self> {
        Ok(Self {
            name: name.into(),
            sender: compile(sender_pattern)?,
            inserter,
        })
    }
}

impl ProtocolHandler for GenericAstmHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_target_analyzer(&self, lines: &[String]) -> CoreResult<bool> {
        let message = Message::from_lines(lines);
        Ok(message
            .header()
            .and_then(|h| h.field(4))
            .is_some_and(|sender| self.sender.is_match(sender)))
    }

    fn line_inserter(&self) -> Arc<dyn LineInserter> {
        Arc::clone(&self.inserter)
    }
}

/// Claims HL7 messages whose sending application (MSH-3) matches a pattern.
pub struct Hl7Handler {
    name: String,
    sending_application: Regex,
    inserter: Arc<dyn LineInserter>,
}

impl Hl7Handler {
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if `application_pattern` is not a valid regex.
    pub fn new(
        name: impl Into<String>,
        application_pattern: &str,
        inserter: Arc<dyn LineInserter>,
    ) -> CoreResult<Self> {
        Ok(Self {
            name: name.into(),
            sending_application: compile(application_pattern)?,
            inserter,
        })
    }
}

impl ProtocolHandler for Hl7Handler {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_target_analyzer(&self, lines: &[String]) -> CoreResult<bool> {
        if !lines.iter().any(|l| l.starts_with("MSH")) {
            return Ok(false);
        }
        let msh = hl7::extract_msh_info(&lines.join("\r"))?;
        Ok(self.sending_application.is_match(&msh.sending_application))
    }

    fn line_inserter(&self) -> Arc<dyn LineInserter> {
        Arc::clone(&self.inserter)
    }
}

/// Wire protocol a configured handler recognises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerProtocol {
    Astm,
    Hl7,
}

/// Declarative handler configuration, as found in seed documents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec {
    pub name: String,
    pub protocol: HandlerProtocol,
    /// Matched against the ASTM header sender or HL7 MSH-3.
    pub pattern: String,
}

impl HandlerSpec {
    pub fn build(&self, inserter: Arc<dyn LineInserter>) -> CoreResult<Arc<dyn ProtocolHandler>> {
        Ok(match self.protocol {
            HandlerProtocol::Astm => Arc::new(GenericAstmHandler::new(
                self.name.clone(),
                &self.pattern,
                inserter,
            )?),
            HandlerProtocol::Hl7 => {
                Arc::new(Hl7Handler::new(self.name.clone(), &self.pattern, inserter)?)
            }
        })
    }
}

/// Build a registry from handler specs, all delivering to `inserter`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidInput`] for a bad pattern or a duplicate handler name.
pub fn build_registry(
    specs: &[HandlerSpec],
    inserter: Arc<dyn LineInserter>,
) -> CoreResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for spec in specs {
        registry.register(spec.build(Arc::clone(&inserter))?)?;
    }
    Ok(registry)
}

/// Keeps inserted lines in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLineInserter {
    inserted: Mutex<Vec<(EntityId, Vec<String>)>>,
}

impl MemoryLineInserter {
    pub fn inserted(&self) -> Vec<(EntityId, Vec<String>)> {
        self.inserted
            .lock()
            .map(|inserted| inserted.clone())
            .unwrap_or_default()
    }
}

impl LineInserter for MemoryLineInserter {
    fn insert(&self, analyzer_id: EntityId, lines: &[String]) -> CoreResult<()> {
        self.inserted
            .lock()
            .map_err(|_| CoreError::Persistence("line inserter lock poisoned".into()))?
            .push((analyzer_id, lines.to_vec()));
        Ok(())
    }
}
