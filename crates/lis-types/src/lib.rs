//! Validated primitives shared by the analyzer integration crates.
//!
//! Operator-supplied names (field names, units, audit reasons, usernames) flow through many
//! services. Wrapping them once at the boundary means downstream code never re-checks for
//! blank input.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("text cannot be empty")]
    Empty,
    /// The input exceeded the permitted length
    #[error("text exceeds maximum length of {max} characters")]
    TooLong { max: usize },
}

/// A trimmed string that guarantees non-empty content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Upper bound applied to every value, matching the widest configuration column.
    pub const MAX_LEN: usize = 255;

    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] for blank input and [`TextError::TooLong`] when the trimmed
    /// value is longer than [`NonEmptyText::MAX_LEN`] characters.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(TextError::TooLong { max: Self::MAX_LEN });
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Like [`NonEmptyText::new`] but maps blank input to `None`.
    pub fn optional(input: Option<impl AsRef<str>>) -> Result<Option<Self>, TextError> {
        match input {
            Some(value) if !value.as_ref().trim().is_empty() => Self::new(value).map(Some),
            _ => Ok(None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Case-insensitive comparison, used for unit labels and qualitative values.
    pub fn eq_ignore_case(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for NonEmptyText {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl PartialEq<str> for NonEmptyText {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NonEmptyText {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_input() {
        let text = NonEmptyText::new("  mg/dL ").unwrap();
        assert_eq!(text.as_str(), "mg/dL");
    }

    #[test]
    fn test_new_rejects_blank() {
        assert_eq!(NonEmptyText::new("   "), Err(TextError::Empty));
        assert_eq!(NonEmptyText::new(""), Err(TextError::Empty));
    }

    #[test]
    fn test_new_rejects_overlong() {
        let long = "x".repeat(NonEmptyText::MAX_LEN + 1);
        assert_eq!(
            NonEmptyText::new(long),
            Err(TextError::TooLong {
                max: NonEmptyText::MAX_LEN
            })
        );
    }

    #[test]
    fn test_optional_maps_blank_to_none() {
        assert_eq!(NonEmptyText::optional(Some(" ")).unwrap(), None);
        assert_eq!(NonEmptyText::optional(None::<&str>).unwrap(), None);
        assert_eq!(
            NonEmptyText::optional(Some("POS")).unwrap(),
            Some(NonEmptyText::new("POS").unwrap())
        );
    }

    #[test]
    fn test_eq_ignore_case() {
        let unit = NonEmptyText::new("mmol/L").unwrap();
        assert!(unit.eq_ignore_case("MMOL/l"));
        assert!(!unit.eq_ignore_case("mg/dL"));
    }

    #[test]
    fn test_deserialize_rejects_blank() {
        let ok: NonEmptyText = serde_json::from_str("\"GLU\"").unwrap();
        assert_eq!(ok, "GLU");
        assert!(serde_json::from_str::<NonEmptyText>("\"  \"").is_err());
    }
}
