//! Implementation of the canonical [`EntityId`] wrapper.

use crate::{UuidError, UuidResult};
use std::{fmt, str::FromStr};

/// Re-exported for convenience.
pub use ::uuid::Uuid;

/// Canonical entity identifier (32 lowercase hex characters, no hyphens).
///
/// Once constructed, the contained UUID is guaranteed to render canonically, so identifiers can be
/// used as map keys and compared as strings without normalisation.
///
/// # Construction
/// - [`EntityId::new`] allocates a fresh identifier.
/// - [`EntityId::parse`] validates an externally supplied identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(Uuid);

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityId {
    /// Generates a new random (v4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Validates and parses an identifier that must already be in canonical form.
    ///
    /// # Arguments
    ///
    /// * `input` - Identifier string. Must be exactly 32 lowercase hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if `input` is not canonical.
    pub fn parse(input: &str) -> UuidResult<Self> {
        if !Self::is_canonical(input) {
            return Err(UuidError::InvalidInput(format!(
                "identifier must be 32 lowercase hex characters without hyphens, got: '{}'",
                input
            )));
        }
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| UuidError::InvalidInput(format!("invalid identifier '{}': {}", input, e)))
    }

    /// Returns the underlying `uuid::Uuid`.
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Returns true if `input` is in canonical form.
    ///
    /// This is a purely syntactic check:
    /// - Exactly 32 bytes long
    /// - Contains only lowercase hex characters (`0-9` and `a-f`)
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for EntityId {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityId::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for EntityId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EntityId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_canonical() {
        let id = EntityId::new();
        assert!(EntityId::is_canonical(&id.to_string()));
    }

    #[test]
    fn test_parse_accepts_canonical() {
        let input = "550e8400e29b41d4a716446655440000";
        let id = EntityId::parse(input).unwrap();
        assert_eq!(id.to_string(), input);
    }

    #[test]
    fn test_parse_rejects_hyphenated() {
        assert!(EntityId::parse("550e8400-e29b-41d4-a716-446655440000").is_err());
    }

    #[test]
    fn test_parse_rejects_uppercase() {
        assert!(EntityId::parse("550E8400E29B41D4A716446655440000").is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(EntityId::parse("550e8400e29b41d4").is_err());
        assert!(EntityId::parse("").is_err());
    }

    #[test]
    fn test_from_str_matches_parse() {
        let id: EntityId = "550e8400e29b41d4a716446655440000".parse().unwrap();
        assert_eq!(id, EntityId::parse("550e8400e29b41d4a716446655440000").unwrap());
    }

    #[test]
    fn test_serde_uses_canonical_form() {
        let id = EntityId::parse("550e8400e29b41d4a716446655440000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"550e8400e29b41d4a716446655440000\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<EntityId>("\"not-an-id\"").is_err());
    }
}
