//! Message routing: which analyzer sent a message, and which protocol handler serves it.
//!
//! Routing runs in two stages:
//! 1. **IP match**: the connection's source address is registered to an analyzer.
//! 2. **Handler scan**: each registered handler, in registration order, inspects the message
//!    header. The first handler that claims it wins.
//!
//! A handler whose predicate fails or panics is logged and skipped so that one broken handler
//! cannot stop the scan.

use crate::constants::{ROUTE_IP_MATCH, ROUTE_NO_MATCH, ROUTE_PLUGIN_MATCH};
use crate::model::{Analyzer, AnalyzerStatus};
use crate::store::AnalyzerStore;
use crate::{CoreError, CoreResult};
use lis_uuid::EntityId;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

// ============================================================================
// HANDLER CONTRACT
// ============================================================================

/// Persists translated lines for one handler family.
pub trait LineInserter: Send + Sync {
    /// # Errors
    ///
    /// Any error aborts delivery of this message.
    fn insert(&self, analyzer_id: EntityId, lines: &[String]) -> CoreResult<()>;
}

/// A protocol-specific component that recognises messages from one analyzer family.
pub trait ProtocolHandler: Send + Sync {
    /// Registry key. Analyzers and analyzer types bind to handlers by this name.
    fn name(&self) -> &str;

    /// Whether `lines` came from an analyzer this handler serves.
    fn is_target_analyzer(&self, lines: &[String]) -> CoreResult<bool>;

    fn line_inserter(&self) -> Arc<dyn LineInserter>;
}

/// Ordered set of protocol handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if a handler with the same name is registered.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) -> CoreResult<()> {
        if self.get(handler.name()).is_some() {
            return Err(CoreError::InvalidInput(format!(
                "handler '{}' is already registered",
                handler.name()
            )));
        }
        tracing::info!("registered protocol handler '{}'", handler.name());
        self.handlers.push(handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ProtocolHandler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProtocolHandler>> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ============================================================================
// ROUTING
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMethod {
    IpMatch,
    PluginMatch,
    NoMatch,
}

impl RouteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpMatch => ROUTE_IP_MATCH,
            Self::PluginMatch => ROUTE_PLUGIN_MATCH,
            Self::NoMatch => ROUTE_NO_MATCH,
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct RouteResult {
    pub analyzer: Option<Analyzer>,
    pub handler: Option<Arc<dyn ProtocolHandler>>,
    pub method: RouteMethod,
}

impl RouteResult {
    fn no_match() -> Self {
        Self {
            analyzer: None,
            handler: None,
            method: RouteMethod::NoMatch,
        }
    }

    pub fn is_success(&self) -> bool {
        self.analyzer.is_some() && self.handler.is_some()
    }
}

impl std::fmt::Debug for RouteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteResult")
            .field("analyzer", &self.analyzer.as_ref().map(|a| a.id))
            .field("handler", &self.handler.as_ref().map(|h| h.name().to_string()))
            .field("method", &self.method)
            .finish()
    }
}

pub struct MessageRouter {
    store: Arc<dyn AnalyzerStore>,
    handlers: Arc<HandlerRegistry>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn AnalyzerStore>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { store, handlers }
    }

    /// Identify the analyzer and handler for a message.
    ///
    /// # Errors
    ///
    /// Only store failures are returned; an unroutable message yields
    /// [`RouteMethod::NoMatch`].
    pub fn route(&self, source_ip: Option<IpAddr>, lines: &[String]) -> CoreResult<RouteResult> {
        let analyzers: Vec<Analyzer> = self
            .store
            .analyzers()?
            .into_iter()
            .filter(|a| a.enabled && a.status != AnalyzerStatus::Deleted)
            .collect();

        if let Some(ip) = source_ip {
            if let Some(analyzer) = analyzers.iter().find(|a| a.ip_address == Some(ip)) {
                match self.bound_handler(analyzer)? {
                    Some(handler) => {
                        tracing::debug!("routed message from {ip} to analyzer {}", analyzer.id);
                        return Ok(RouteResult {
                            analyzer: Some(analyzer.clone()),
                            handler: Some(handler),
                            method: RouteMethod::IpMatch,
                        });
                    }
                    None => tracing::warn!(
                        "analyzer {} matches {ip} but has no registered handler",
                        analyzer.id
                    ),
                }
            }
        }

        for handler in self.handlers.iter() {
            let claimed = catch_unwind(AssertUnwindSafe(|| handler.is_target_analyzer(lines)));
            match claimed {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => continue,
                Ok(Err(e)) => {
                    tracing::warn!("handler '{}' failed to inspect message: {}", handler.name(), e);
                    continue;
                }
                Err(_) => {
                    tracing::warn!("handler '{}' panicked while inspecting message", handler.name());
                    continue;
                }
            }

            match self.analyzer_for_handler(&analyzers, handler.name())? {
                Some(analyzer) => {
                    tracing::debug!(
                        "handler '{}' claimed message for analyzer {}",
                        handler.name(),
                        analyzer.id
                    );
                    return Ok(RouteResult {
                        analyzer: Some(analyzer),
                        handler: Some(Arc::clone(handler)),
                        method: RouteMethod::PluginMatch,
                    });
                }
                None => tracing::debug!(
                    "handler '{}' claimed message but no analyzer is bound to it",
                    handler.name()
                ),
            }
        }

        tracing::info!("no analyzer matched message from {:?}", source_ip);
        Ok(RouteResult::no_match())
    }

    /// Handler registered for an analyzer. A direct binding wins over the analyzer type's.
    pub fn bound_handler(&self, analyzer: &Analyzer) -> CoreResult<Option<Arc<dyn ProtocolHandler>>> {
        let name = match &analyzer.handler {
            Some(name) => Some(name.clone()),
            None => match analyzer.analyzer_type_id {
                Some(type_id) => self.store.analyzer_type(type_id)?.map(|t| t.handler),
                None => None,
            },
        };
        Ok(name.and_then(|n| self.handlers.get(&n).cloned()))
    }

    /// First analyzer whose type declares `handler`, else the first bound to it directly.
    fn analyzer_for_handler(
        &self,
        analyzers: &[Analyzer],
        handler: &str,
    ) -> CoreResult<Option<Analyzer>> {
        for analyzer in analyzers {
            let Some(type_id) = analyzer.analyzer_type_id else {
                continue;
            };
            if self
                .store
                .analyzer_type(type_id)?
                .is_some_and(|t| t.handler == handler)
            {
                return Ok(Some(analyzer.clone()));
            }
        }
        Ok(analyzers
            .iter()
            .find(|a| a.handler.as_deref() == Some(handler))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalyzerType;
    use crate::store::{AnalyzerStoreExt, InMemoryStore};
    use crate::handlers::MemoryLineInserter;
    use lis_types::NonEmptyText;

    /// Claims every message whose first line starts with `prefix`.
    struct PrefixHandler {
        name: &'static str,
        prefix: &'static str,
        inserter: Arc<MemoryLineInserter>,
    }

    impl ProtocolHandler for PrefixHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn is_target_analyzer(&self, lines: &[String]) -> CoreResult<bool> {
            Ok(lines.first().is_some_and(|l| l.starts_with(self.prefix)))
        }

        fn line_inserter(&self) -> Arc<dyn LineInserter> {
            self.inserter.clone()
        }
    }

    struct PanickingHandler;

    impl ProtocolHandler for PanickingHandler {
        fn name(&self) -> &str {
            "panicking"
        }

        fn is_target_analyzer(&self, _lines: &[String]) -> CoreResult<bool> {
            panic!("broken plugin")
        }

        fn line_inserter(&self) -> Arc<dyn LineInserter> {
            Arc::new(MemoryLineInserter::default())
        }
    }

    struct FailingHandler;

    impl ProtocolHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        fn is_target_analyzer(&self, _lines: &[String]) -> CoreResult<bool> {
            Err(CoreError::InvalidInput("cannot read header".into()))
        }

        fn line_inserter(&self) -> Arc<dyn LineInserter> {
            Arc::new(MemoryLineInserter::default())
        }
    }

    fn prefix(name: &'static str, prefix: &'static str) -> Arc<dyn ProtocolHandler> {
        Arc::new(PrefixHandler {
            name,
            prefix,
            inserter: Arc::new(MemoryLineInserter::default()),
        })
    }

    fn analyzer(name: &str, handler: Option<&str>, ip: Option<&str>) -> Analyzer {
        let mut analyzer = Analyzer::new(NonEmptyText::new(name).unwrap());
        analyzer.handler = handler.map(str::to_string);
        analyzer.ip_address = ip.map(|i| i.parse().unwrap());
        analyzer
    }

    fn router(analyzers: Vec<Analyzer>, handlers: Vec<Arc<dyn ProtocolHandler>>) -> MessageRouter {
        let store = Arc::new(InMemoryStore::new());
        store
            .atomically(move |tx| analyzers.into_iter().try_for_each(|a| tx.put_analyzer(a)))
            .unwrap();
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        MessageRouter::new(store, Arc::new(registry))
    }

    fn message(first: &str) -> Vec<String> {
        vec![first.to_string(), "L|1|N".to_string()]
    }

    #[test]
    fn test_ip_match_wins_over_handler_predicate() {
        let x = analyzer("X", Some("astm"), Some("192.168.1.50"));
        let y = analyzer("Y", Some("cobas"), None);
        let x_id = x.id;
        let router = router(vec![y, x], vec![prefix("cobas", "H|"), prefix("astm", "H|")]);

        let result = router
            .route(Some("192.168.1.50".parse().unwrap()), &message("H|\\^&|||COBAS"))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.method, RouteMethod::IpMatch);
        assert_eq!(result.method.as_str(), "IP_MATCH");
        assert_eq!(result.analyzer.unwrap().id, x_id);
    }

    #[test]
    fn test_handler_scan_first_claim_wins() {
        let a = analyzer("A", Some("first"), None);
        let b = analyzer("B", Some("second"), None);
        let a_id = a.id;
        let router = router(vec![b, a], vec![prefix("first", "H|"), prefix("second", "H|")]);

        let result = router.route(None, &message("H|\\^&|||ANY")).unwrap();
        assert_eq!(result.method, RouteMethod::PluginMatch);
        assert_eq!(result.analyzer.unwrap().id, a_id);
        assert_eq!(result.handler.unwrap().name(), "first");
    }

    #[test]
    fn test_type_binding_preferred_over_direct_binding() {
        let store = Arc::new(InMemoryStore::new());
        let kind = AnalyzerType {
            id: EntityId::new(),
            name: NonEmptyText::new("Mindray BC").unwrap(),
            handler: "mindray".into(),
        };
        let direct = analyzer("Direct", Some("mindray"), None);
        let mut typed = analyzer("Typed", None, None);
        typed.analyzer_type_id = Some(kind.id);
        let typed_id = typed.id;
        store
            .atomically(move |tx| {
                tx.put_analyzer_type(kind)?;
                tx.put_analyzer(direct)?;
                tx.put_analyzer(typed)
            })
            .unwrap();
        let mut registry = HandlerRegistry::new();
        registry.register(prefix("mindray", "MSH")).unwrap();
        let router = MessageRouter::new(store, Arc::new(registry));

        let result = router.route(None, &message("MSH|^~\\&|MINDRAY")).unwrap();
        assert_eq!(result.analyzer.unwrap().id, typed_id);
    }

    #[test]
    fn test_broken_handlers_are_skipped() {
        let a = analyzer("A", Some("astm"), None);
        let router = router(
            vec![a],
            vec![Arc::new(PanickingHandler), Arc::new(FailingHandler), prefix("astm", "H|")],
        );
        let result = router.route(None, &message("H|\\^&")).unwrap();
        assert!(result.is_success());
        assert_eq!(result.handler.unwrap().name(), "astm");
    }

    #[test]
    fn test_no_match() {
        let a = analyzer("A", Some("astm"), Some("10.0.0.1"));
        let router = router(vec![a], vec![prefix("astm", "H|")]);
        let result = router
            .route(Some("10.0.0.2".parse().unwrap()), &message("MSH|^~\\&"))
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.method.as_str(), "NO_MATCH");
    }

    #[test]
    fn test_deleted_analyzer_not_routed() {
        let mut a = analyzer("A", Some("astm"), Some("10.0.0.1"));
        a.status = AnalyzerStatus::Deleted;
        let router = router(vec![a], vec![prefix("astm", "H|")]);
        let result = router
            .route(Some("10.0.0.1".parse().unwrap()), &message("H|\\^&"))
            .unwrap();
        assert_eq!(result.method, RouteMethod::NoMatch);
    }

    #[test]
    fn test_duplicate_handler_name_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(prefix("astm", "H|")).unwrap();
        assert!(registry.register(prefix("astm", "X")).is_err());
        assert_eq!(registry.len(), 1);
    }
}
