//! Constants used throughout the analyzer integration core.
//!
//! Defaults for [`crate::config::CoreConfig`], route method labels and the reasons attached to
//! automatic status transitions live here so that logs, events and tests agree on the same text.

/// Default number of days an analyzer may stay ACTIVE before the idle sweep takes it OFFLINE.
pub const DEFAULT_IDLE_THRESHOLD_DAYS: i64 = 7;

/// Default decimal places kept after unit conversion (half-up rounding).
pub const DEFAULT_CONVERSION_SCALE: u32 = 5;

/// Largest scale `rust_decimal` can represent.
pub const MAX_CONVERSION_SCALE: u32 = 28;

/// Default interval between idle sweeps (daily).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Default TCP connect timeout for analyzer queries and connection tests.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default wall-clock limit for one analyzer query job.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 5 * 60;

/// The sweep logs a warning when more analyzers than this fail in one run.
pub const SWEEP_FAILURE_WARN_THRESHOLD: usize = 3;

/// Largest message accepted by the mapping preview.
pub const MAX_PREVIEW_MESSAGE_BYTES: usize = 10 * 1024;

/// Header record sent to an analyzer to request its field catalogue.
pub const QUERY_HEADER_RECORD: &str = "H|\\^&|||OpenELIS^Query^1.0|||||||LIS2-A2";

/// Times a frame may be NAKed before a query job gives up.
pub const MAX_FRAME_RETRIES: usize = 6;

// Route methods reported by the message router.
pub const ROUTE_IP_MATCH: &str = "IP_MATCH";
pub const ROUTE_PLUGIN_MATCH: &str = "PLUGIN_MATCH";
pub const ROUTE_NO_MATCH: &str = "NO_MATCH";

// Required mapping categories reported by activation validation.
pub const CATEGORY_SAMPLE_ID: &str = "Sample ID";
pub const CATEGORY_TEST_CODE: &str = "Test Code";
pub const CATEGORY_RESULT_VALUE: &str = "Result Value";

// Reasons recorded on automatic status transitions.
pub const REASON_FIRST_MAPPING: &str = "First mapping created";
pub const REASON_ALL_MAPPINGS_ACTIVATED: &str = "All required mappings activated";
pub const REASON_ERROR_CREATED: &str = "Unacknowledged error created";
pub const REASON_CONNECTION_FAILED: &str = "Connection test failed";
pub const REASON_ERRORS_ACKNOWLEDGED: &str = "All errors acknowledged";
pub const REASON_CONNECTION_RESTORED: &str = "Connection restored";
pub const REASON_IDLE_THRESHOLD: &str = "Idle threshold exceeded";
