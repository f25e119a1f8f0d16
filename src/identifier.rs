//! Per-message identifier strategies.
//!
//! An [`IdentifierGenerator`] is chosen by a configuration token:
//!
//! ```text
//! Token     | Generator
//! ----------|------------------------------------------
//! uuid      | random v4 UUID on every call
//! series    | "1", "2", "3", ... (process local)
//! anything  | the token itself on every call
//! ```

use serde::Deserialize;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// The OS random source could not be read.
#[derive(Debug, Error)]
#[error("random source unavailable: {0}")]
pub struct IdentifierError(String);

/// Source of correlation and message ids.
///
/// Clones of a `Series` generator share one counter, so handing clones to
/// several workers still yields distinct values.
#[derive(Debug, Clone, Default)]
pub enum IdentifierGenerator {
    #[default]
    Uuid,
    Series { counter: Arc<AtomicU64> },
    Static { value: String },
}

impl IdentifierGenerator {
    pub fn series() -> Self {
        IdentifierGenerator::Series {
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn fixed(value: impl Into<String>) -> Self {
        IdentifierGenerator::Static {
            value: value.into(),
        }
    }

    /// Select a generator by token; unknown tokens become static values.
    pub fn from_token(token: &str) -> Self {
        match token {
            "uuid" => IdentifierGenerator::Uuid,
            "series" => IdentifierGenerator::series(),
            other => IdentifierGenerator::fixed(other),
        }
    }

    /// Produce the next identifier.
    pub fn next(&self) -> Result<String, IdentifierError> {
        match self {
            IdentifierGenerator::Uuid => {
                let mut bytes = [0u8; 16];
                getrandom::getrandom(&mut bytes).map_err(|e| IdentifierError(e.to_string()))?;
                Ok(uuid::Builder::from_random_bytes(bytes)
                    .into_uuid()
                    .to_string())
            }
            IdentifierGenerator::Series { counter } => {
                let value = counter.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(value.to_string())
            }
            IdentifierGenerator::Static { value } => Ok(value.clone()),
        }
    }

    /// Token that selects this generator.
    pub fn token(&self) -> &str {
        match self {
            IdentifierGenerator::Uuid => "uuid",
            IdentifierGenerator::Series { .. } => "series",
            IdentifierGenerator::Static { value } => value,
        }
    }
}

impl FromStr for IdentifierGenerator {
    type Err = Infallible;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Ok(IdentifierGenerator::from_token(token))
    }
}

impl<'de> Deserialize<'de> for IdentifierGenerator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        Ok(IdentifierGenerator::from_token(&token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_series_counts_from_one() {
        let generator = IdentifierGenerator::series();
        assert_eq!(generator.next().unwrap(), "1");
        assert_eq!(generator.next().unwrap(), "2");
        assert_eq!(generator.next().unwrap(), "3");
    }

    #[test]
    fn test_series_clones_share_counter() {
        let a = IdentifierGenerator::series();
        let b = a.clone();
        assert_eq!(a.next().unwrap(), "1");
        assert_eq!(b.next().unwrap(), "2");
    }

    #[test]
    fn test_static_repeats() {
        let generator = IdentifierGenerator::fixed("X");
        for _ in 0..5 {
            assert_eq!(generator.next().unwrap(), "X");
        }
    }

    #[test]
    fn test_uuid_values_are_distinct() {
        let generator = IdentifierGenerator::Uuid;
        let seen: HashSet<String> = (0..10_000).map(|_| generator.next().unwrap()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_uuid_is_version_four() {
        let id = IdentifierGenerator::Uuid.next().unwrap();
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_token_selection() {
        assert!(matches!(
            IdentifierGenerator::from_token("uuid"),
            IdentifierGenerator::Uuid
        ));
        assert!(matches!(
            IdentifierGenerator::from_token("series"),
            IdentifierGenerator::Series { .. }
        ));
        let generator: IdentifierGenerator = "order-7".parse().unwrap();
        assert_eq!(generator.token(), "order-7");
        assert_eq!(generator.next().unwrap(), "order-7");
    }

    #[test]
    fn test_default_is_uuid() {
        assert!(matches!(IdentifierGenerator::default(), IdentifierGenerator::Uuid));
    }
}
