//! Rendering of consumed deliveries.
//!
//! Every delivery becomes a JSON envelope. Without an output directory it is
//! printed as one line on stdout; with one it is written to
//!
//! ```text
//! <out_dir>/<exchange or "_">/<message id or sha256 of the JSON>/message.json
//! ```

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::broker::Delivery;
use crate::error::Result;
use crate::properties::MessageProperties;

/// Directory name used for the default (unnamed) exchange.
pub const DEFAULT_EXCHANGE_DIR: &str = "_";

const MESSAGE_FILE: &str = "message.json";

#[derive(Debug, Serialize)]
pub struct DumpEnvelope<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: &'a MessageProperties,
    pub body_as_string: String,
}

impl<'a> DumpEnvelope<'a> {
    pub fn from_delivery(delivery: &'a Delivery) -> Self {
        Self {
            exchange: &delivery.exchange,
            routing_key: &delivery.routing_key,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            properties: &delivery.properties,
            body_as_string: String::from_utf8_lossy(&delivery.body).into_owned(),
        }
    }

    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }

    /// `exchange: body`, the short form used when tailing the firehose.
    pub fn summary_line(&self) -> String {
        format!("{}: {}", self.exchange, self.body_as_string)
    }

    /// Directory this envelope is written to under `out_dir`.
    pub fn message_dir(&self, out_dir: &Path, json: &str) -> PathBuf {
        let exchange = if self.exchange.is_empty() {
            DEFAULT_EXCHANGE_DIR
        } else {
            self.exchange
        };
        let folder = match self.properties.message_id.as_deref() {
            Some(id) if is_safe_dir_name(id) => id.to_string(),
            _ => format!("{:x}", Sha256::digest(json.as_bytes())),
        };
        out_dir.join(exchange).join(folder)
    }
}

/// A message id can name a directory only if it stays a single component.
fn is_safe_dir_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// Write `delivery` below `out_dir` and return the file written.
pub async fn write_delivery(out_dir: &Path, delivery: &Delivery, pretty: bool) -> Result<PathBuf> {
    let envelope = DumpEnvelope::from_delivery(delivery);
    let json = envelope.to_json(pretty).map_err(std::io::Error::from)?;
    let dir = envelope.message_dir(out_dir, &json);

    tokio::fs::create_dir_all(&dir).await?;
    let file = dir.join(MESSAGE_FILE);
    tokio::fs::write(&file, json.as_bytes()).await?;
    debug!(path = %file.display(), "Delivery written");
    Ok(file)
}
