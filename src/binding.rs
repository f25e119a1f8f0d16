//! Queue bindings given as `exchange/queue/routing-key` strings.
//!
//! ```text
//! Input                          | exchange | queue   | routing key
//! -------------------------------|----------|---------|-------------
//! orders/order-q/order.created   | orders   | order-q | order.created
//! /order-q/                      | ""       | order-q | ""
//! orders/order-q                 | error: two segments
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

const DELIMITER: char = '/';

/// One exchange/queue/routing-key triple. Empty segments mean the broker
/// default (the default exchange, a server-named queue, an empty key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    exchange: String,
    queue_name: String,
    routing_key: String,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

impl FromStr for QueueBinding {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(DELIMITER).collect();
        match parts.as_slice() {
            [exchange, queue, routing_key] => Ok(Self::new(*exchange, *queue, *routing_key)),
            _ => Err(Error::Configuration(format!(
                "queue binding '{}' must be exchange{d}queue-name{d}routing-key and nothing else",
                value,
                d = DELIMITER
            ))),
        }
    }
}

impl fmt::Display for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [&self.exchange, &self.queue_name, &self.routing_key];
        let rendered: Vec<&str> = parts
            .iter()
            .map(|p| if p.is_empty() { "_" } else { p.as_str() })
            .collect();
        f.write_str(&rendered.join("/"))
    }
}

/// Ordered list of bindings for one consume session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSet {
    bindings: Vec<QueueBinding>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every string, failing on the first malformed one.
    pub fn parse<I, S>(values: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for value in values {
            set.add(value.as_ref())?;
        }
        Ok(set)
    }

    /// Parse and append one binding.
    pub fn add(&mut self, value: &str) -> Result<(), Error> {
        self.bindings.push(value.parse()?);
        Ok(())
    }

    pub fn push(&mut self, binding: QueueBinding) {
        self.bindings.push(binding);
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueueBinding> {
        self.bindings.iter()
    }
}

impl<'a> IntoIterator for &'a BindingSet {
    type Item = &'a QueueBinding;
    type IntoIter = std::slice::Iter<'a, QueueBinding>;

    fn into_iter(self) -> Self::IntoIter {
        self.bindings.iter()
    }
}

impl From<Vec<QueueBinding>> for BindingSet {
    fn from(bindings: Vec<QueueBinding>) -> Self {
        Self { bindings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_segments() {
        let binding: QueueBinding = "orders/order-q/order.created".parse().unwrap();
        assert_eq!(binding.exchange(), "orders");
        assert_eq!(binding.queue_name(), "order-q");
        assert_eq!(binding.routing_key(), "order.created");
    }

    #[test]
    fn test_parse_keeps_empty_segments() {
        let binding: QueueBinding = "/order-q/".parse().unwrap();
        assert_eq!(binding.exchange(), "");
        assert_eq!(binding.queue_name(), "order-q");
        assert_eq!(binding.routing_key(), "");

        let binding: QueueBinding = "//".parse().unwrap();
        assert_eq!(binding, QueueBinding::new("", "", ""));
    }

    #[test]
    fn test_parse_rejects_wrong_segment_count() {
        for bad in ["", "orders", "orders/order-q", "a/b/c/d", "a/b/c/"] {
            let err = bad.parse::<QueueBinding>().unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_display_marks_empty_segments() {
        let binding = QueueBinding::new("", "order-q", "");
        assert_eq!(binding.to_string(), "_/order-q/_");
    }

    #[test]
    fn test_binding_set_preserves_order() {
        let set = BindingSet::parse([
            "orders/order-q/order.created",
            "orders/order-q/order.cancelled",
        ])
        .unwrap();
        let keys: Vec<&str> = set.iter().map(|b| b.routing_key()).collect();
        assert_eq!(keys, vec!["order.created", "order.cancelled"]);
    }

    #[test]
    fn test_binding_set_fails_on_any_bad_entry() {
        let result = BindingSet::parse(["orders/order-q/order.created", "broken"]);
        assert!(result.is_err());
    }
}
