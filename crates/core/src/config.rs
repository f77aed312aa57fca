//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services as an
//! `Arc<CoreConfig>`. Services never read environment variables while handling messages, which
//! keeps behaviour consistent across threads and lets tests build configurations directly.

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_CONVERSION_SCALE, DEFAULT_IDLE_THRESHOLD_DAYS,
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS, MAX_CONVERSION_SCALE,
};
use crate::{CoreError, CoreResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    idle_threshold: chrono::Duration,
    conversion_scale: u32,
    sweep_interval: Duration,
    connect_timeout: Duration,
    query_timeout: Duration,
    allow_loopback_queries: bool,
    seed_file: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            idle_threshold: chrono::Duration::days(DEFAULT_IDLE_THRESHOLD_DAYS),
            conversion_scale: DEFAULT_CONVERSION_SCALE,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            allow_loopback_queries: false,
            seed_file: None,
        }
    }
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the idle threshold is not positive, the conversion
    /// scale exceeds what a decimal can hold, or any timeout or interval is zero.
    pub fn new(
        idle_threshold_days: i64,
        conversion_scale: u32,
        sweep_interval: Duration,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> CoreResult<Self> {
        if idle_threshold_days <= 0 {
            return Err(CoreError::InvalidInput(
                "idle threshold must be at least one day".into(),
            ));
        }
        if conversion_scale > MAX_CONVERSION_SCALE {
            return Err(CoreError::InvalidInput(format!(
                "conversion scale {conversion_scale} exceeds maximum of {MAX_CONVERSION_SCALE}"
            )));
        }
        if sweep_interval.is_zero() || connect_timeout.is_zero() || query_timeout.is_zero() {
            return Err(CoreError::InvalidInput(
                "sweep interval and timeouts must be greater than zero".into(),
            ));
        }

        Ok(Self {
            idle_threshold: chrono::Duration::days(idle_threshold_days),
            conversion_scale,
            sweep_interval,
            connect_timeout,
            query_timeout,
            ..Self::default()
        })
    }

    /// Permit analyzer queries to loopback addresses (local simulators and tests).
    pub fn with_loopback_queries(mut self, allow: bool) -> Self {
        self.allow_loopback_queries = allow;
        self
    }

    pub fn with_seed_file(mut self, seed_file: Option<PathBuf>) -> Self {
        self.seed_file = seed_file;
        self
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        self.idle_threshold
    }

    pub fn conversion_scale(&self) -> u32 {
        self.conversion_scale
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn allow_loopback_queries(&self) -> bool {
        self.allow_loopback_queries
    }

    pub fn seed_file(&self) -> Option<&PathBuf> {
        self.seed_file.as_ref()
    }
}

/// Parse an optional environment value, falling back to `default` when unset or blank.
///
/// `name` is only used in the error message.
///
/// # Errors
///
/// Returns [`CoreError::InvalidInput`] if the value is present but does not parse.
pub fn parse_env_value<T>(name: &str, value: Option<String>, default: T) -> CoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    match value {
        Some(v) => v
            .parse::<T>()
            .map_err(|e| CoreError::InvalidInput(format!("{name}='{v}' is invalid: {e}"))),
        None => Ok(default),
    }
}

/// Parse an optional boolean flag (`1`/`true`/`yes` are true, case-insensitive).
pub fn flag_from_env_value(value: Option<String>) -> bool {
    value
        .map(|v| v.trim().to_ascii_lowercase())
        .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.idle_threshold(), chrono::Duration::days(7));
        assert_eq!(cfg.conversion_scale(), 5);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.query_timeout(), Duration::from_secs(300));
        assert!(!cfg.allow_loopback_queries());
    }

    #[test]
    fn test_new_rejects_non_positive_threshold() {
        let result = CoreConfig::new(
            0,
            5,
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_new_rejects_excessive_scale() {
        let result = CoreConfig::new(
            7,
            29,
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_new_rejects_zero_timeout() {
        let result = CoreConfig::new(
            7,
            5,
            Duration::from_secs(60),
            Duration::ZERO,
            Duration::from_secs(60),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_env_value_defaults_when_blank() {
        assert_eq!(parse_env_value("X", None, 7i64).unwrap(), 7);
        assert_eq!(parse_env_value("X", Some("  ".into()), 7i64).unwrap(), 7);
        assert_eq!(parse_env_value("X", Some(" 14 ".into()), 7i64).unwrap(), 14);
    }

    #[test]
    fn test_parse_env_value_rejects_garbage() {
        let err = parse_env_value("LIS_IDLE_THRESHOLD_DAYS", Some("abc".into()), 7i64).unwrap_err();
        assert!(err.to_string().contains("LIS_IDLE_THRESHOLD_DAYS"));
    }

    #[test]
    fn test_flag_from_env_value() {
        assert!(flag_from_env_value(Some("TRUE".into())));
        assert!(flag_from_env_value(Some("1".into())));
        assert!(!flag_from_env_value(Some("no".into())));
        assert!(!flag_from_env_value(None));
    }
}
