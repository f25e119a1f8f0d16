//! Message properties.
//!
//! [`DeliveryProperties`] is the static, configured view built once at
//! startup. Each call to [`DeliveryProperties::stamp`] turns it into a
//! concrete [`MessageProperties`], drawing fresh correlation and message ids
//! from their generators.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identifier::{IdentifierError, IdentifierGenerator};

/// Delivery mode for messages the broker keeps across restarts.
pub const PERSISTENT: u8 = 2;

/// Concrete properties carried by one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// A message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(properties: MessageProperties, body: Vec<u8>) -> Self {
        Self { properties, body }
    }
}

/// Static publishing properties, loaded from the `[publish.properties]`
/// section of the config file.
///
/// Correlation and message ids have independent generator slots. Call
/// [`DeliveryProperties::share_id_generator`] to make both draw from one.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryProperties {
    /// Empty means "derive from the file extension"
    #[serde(default)]
    pub content_type: String,

    #[serde(default = "default_content_encoding")]
    pub content_encoding: String,

    /// 1 for transient, 2 for persistent
    #[serde(default = "default_delivery_mode")]
    pub delivery_mode: u8,

    /// 0 to 9
    #[serde(default)]
    pub priority: u8,

    #[serde(default)]
    pub correlation_id: IdentifierGenerator,

    #[serde(default)]
    pub reply_to: String,

    #[serde(default)]
    pub expiration: String,

    #[serde(default)]
    pub message_id: IdentifierGenerator,

    /// Unix seconds; defaults to the moment the properties were built
    #[serde(default = "default_timestamp")]
    pub timestamp: i64,

    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub app_id: String,
}

fn default_content_encoding() -> String {
    "UTF-8".to_string()
}

fn default_delivery_mode() -> u8 {
    PERSISTENT
}

fn default_timestamp() -> i64 {
    Utc::now().timestamp()
}

impl Default for DeliveryProperties {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: default_content_encoding(),
            delivery_mode: default_delivery_mode(),
            priority: 0,
            correlation_id: IdentifierGenerator::default(),
            reply_to: String::new(),
            expiration: String::new(),
            message_id: IdentifierGenerator::default(),
            timestamp: default_timestamp(),
            kind: String::new(),
            user_id: String::new(),
            app_id: String::new(),
        }
    }
}

impl DeliveryProperties {
    /// Make message ids come from the correlation id generator.
    pub fn share_id_generator(mut self) -> Self {
        self.message_id = self.correlation_id.clone();
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    pub fn delivery_mode(&self) -> u8 {
        self.delivery_mode
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn correlation_id(&self) -> Result<String, IdentifierError> {
        self.correlation_id.next()
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn expiration(&self) -> &str {
        &self.expiration
    }

    pub fn message_id(&self) -> Result<String, IdentifierError> {
        self.message_id.next()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Build the properties for one message. Empty strings are left unset.
    pub fn stamp(&self) -> Result<MessageProperties, IdentifierError> {
        Ok(MessageProperties {
            content_type: non_empty(self.content_type()),
            content_encoding: non_empty(self.content_encoding()),
            delivery_mode: Some(self.delivery_mode()),
            priority: Some(self.priority()),
            correlation_id: non_empty(&self.correlation_id()?),
            reply_to: non_empty(self.reply_to()),
            expiration: non_empty(self.expiration()),
            message_id: non_empty(&self.message_id()?),
            timestamp: u64::try_from(self.timestamp()).ok(),
            kind: non_empty(self.kind()),
            user_id: non_empty(self.user_id()),
            app_id: non_empty(self.app_id()),
            headers: BTreeMap::new(),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
