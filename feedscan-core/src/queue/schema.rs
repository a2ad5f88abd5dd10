//! Name+version envelope stamped on every queued payload so consumers can
//! route and evolve message shapes independently of producers.

use feedscan_model::{IndexScanMessage, LeafScanMessage, PageScanMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ScanError};

/// Schema name of the bulk envelope.
pub const BULK_SCHEMA: &str = "hbe";

/// A payload type with a registered schema name and version.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync {
    const SCHEMA: &'static str;
    const VERSION: u32;
}

impl QueueMessage for IndexScanMessage {
    const SCHEMA: &'static str = "cis";
    const VERSION: u32 = 1;
}

impl QueueMessage for PageScanMessage {
    const SCHEMA: &'static str = "cps";
    const VERSION: u32 = 1;
}

impl QueueMessage for LeafScanMessage {
    const SCHEMA: &'static str = "cls";
    const VERSION: u32 = 1;
}

/// Many payloads of one schema sent as a single queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomogeneousBulk {
    #[serde(rename = "n")]
    pub schema: String,
    #[serde(rename = "v")]
    pub version: u32,
    #[serde(rename = "m")]
    pub messages: Vec<Value>,
}

impl QueueMessage for HomogeneousBulk {
    const SCHEMA: &'static str = BULK_SCHEMA;
    const VERSION: u32 = 1;
}

impl HomogeneousBulk {
    /// Individual envelopes this bulk carries.
    pub fn into_envelopes(self) -> Vec<Envelope> {
        let schema = self.schema;
        let version = self.version;
        self.messages
            .into_iter()
            .map(|data| Envelope {
                schema: schema.clone(),
                version,
                data,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "n")]
    pub schema: String,
    #[serde(rename = "v")]
    pub version: u32,
    #[serde(rename = "d")]
    pub data: Value,
}

impl Envelope {
    pub fn wrap<T: QueueMessage>(message: &T) -> Result<Self> {
        Ok(Self {
            schema: T::SCHEMA.to_string(),
            version: T::VERSION,
            data: serde_json::to_value(message)?,
        })
    }

    pub fn parse(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is<T: QueueMessage>(&self) -> bool {
        self.schema == T::SCHEMA && self.version == T::VERSION
    }

    /// Decode the payload, insisting on the expected schema and version.
    pub fn open<T: QueueMessage>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(self.unknown());
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn unknown(&self) -> ScanError {
        ScanError::UnknownSchema {
            name: self.schema.clone(),
            version: self.version,
        }
    }
}

/// Serialize a payload into a queue body.
pub fn to_body<T: QueueMessage>(message: &T) -> Result<String> {
    Envelope::wrap(message)?.to_body()
}
