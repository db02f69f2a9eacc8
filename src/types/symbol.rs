use serde::{Deserialize, Serialize};
use std::fmt;

/// Equity ticker symbol (e.g., "AAPL", "BRK.B").
/// Uses NewType pattern for type safety; construction through [`Symbol::parse`]
/// enforces the ticker grammar: an uppercase letter followed by up to nine
/// uppercase letters, digits, dots, or dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

/// Rejection for a string that does not match the ticker grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ticker symbol: {0:?}")]
pub struct InvalidSymbol(pub String);

impl Symbol {
    /// Parse and validate a ticker symbol.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidSymbol> {
        let s = s.into();
        if Self::is_valid_str(&s) {
            Ok(Self(s))
        } else {
            Err(InvalidSymbol(s))
        }
    }

    /// Construct without validation. Reserved for symbols that already passed
    /// through `parse` (e.g., round-tripped through the trade store).
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    fn is_valid_str(s: &str) -> bool {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() > 10 {
            return false;
        }
        if !bytes[0].is_ascii_uppercase() {
            return false;
        }
        bytes[1..]
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'.' || *b == b'-')
    }

    /// Get the underlying string value
    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> String {
        s.0
    }
}
