//! SQL identifier validation.
//!
//! Every schema, table and column name supplied by a caller passes through
//! [`Identifier::parse`] before it is interpolated into generated SQL.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Postgres truncates identifiers longer than this.
pub const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier pattern"));

/// Rejected identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier '{value}': {reason}")]
pub struct IdentifierError {
    pub value: String,
    pub reason: &'static str,
}

/// A validated SQL identifier (alphanumeric and underscore, bounded length).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Validate `value` with the default length bound.
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        Self::parse_bounded(value, MAX_IDENTIFIER_LEN)
    }

    /// Validate `value`, allowing at most `max_len` characters.
    pub fn parse_bounded(value: &str, max_len: usize) -> Result<Self, IdentifierError> {
        if value.is_empty() {
            return Err(IdentifierError {
                value: value.to_string(),
                reason: "identifier is empty",
            });
        }
        if value.len() > max_len.min(MAX_IDENTIFIER_LEN) {
            return Err(IdentifierError {
                value: value.to_string(),
                reason: "identifier is too long",
            });
        }
        if !IDENTIFIER_RE.is_match(value) {
            return Err(IdentifierError {
                value: value.to_string(),
                reason: "only letters, digits and underscore are allowed",
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for interpolation into SQL text.
    pub fn quoted(&self) -> String {
        // The allow-pattern excludes '"', so no escaping is needed.
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// `"schema"."table"`
pub fn qualified(schema: &Identifier, table: &Identifier) -> String {
    format!("{}.{}", schema.quoted(), table.quoted())
}
