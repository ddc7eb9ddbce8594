//! Identity types shared across the engine.
//!
//! Identifiers that cross a trust boundary (`AppId`) are validated at
//! construction. Derived names (`CollectionName`, `ShardPostfix`) can only be
//! produced by [`crate::keys`], so a value of those types is always well formed.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application identifier.
///
/// Trimmed, non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AppId(String);

/// Name of the physical collection holding one event key's aggregates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    pub(crate) const fn from_digest(name: String) -> Self {
        Self(name)
    }

    /// The collection name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One base64 symbol that spreads writes for a bucket over sibling documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardPostfix(char);

impl ShardPostfix {
    /// Every symbol a postfix can take, in base64 alphabet order.
    pub const ALPHABET: &'static str =
        "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    pub(crate) const fn from_symbol(symbol: char) -> Self {
        Self(symbol)
    }

    /// The postfix symbol.
    pub const fn symbol(self) -> char {
        self.0
    }
}

impl fmt::Display for ShardPostfix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_id_is_trimmed() {
        let id = AppId::try_new("  5f1a  ").expect("valid app id");
        assert_eq!(id.as_ref(), "5f1a");
    }

    #[test]
    fn app_id_rejects_blank() {
        assert!(AppId::try_new("   ").is_err());
    }

    #[test]
    fn alphabet_has_sixty_four_distinct_symbols() {
        let mut symbols: Vec<char> = ShardPostfix::ALPHABET.chars().collect();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), 64);
    }
}
