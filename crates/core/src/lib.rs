//! # LIS Core
//!
//! Analyzer integration engine for the laboratory information system.
//!
//! This crate holds the pure engine logic:
//! - Message routing to analyzers and their protocol handlers
//! - Field mapping configuration, validation and activation
//! - Mapping application (unit conversion, qualitative coding) and QC extraction
//! - The analyzer error queue and the status state machine
//! - LIS2-A2 field discovery queries against analyzers
//!
//! **No wire concerns**: record tokenising and framing live in the `astm` and `hl7` crates.

pub mod apply;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod error_queue;
pub mod events;
pub mod handlers;
pub mod mapping;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod preview;
pub mod qc;
pub mod query;
pub mod router;
pub mod rules;
pub mod seed;
pub mod status;
pub mod store;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use config::CoreConfig;
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
