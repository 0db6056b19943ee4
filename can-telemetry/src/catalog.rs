//! Signal definition catalog
//!
//! Immutable, load-once mapping from numeric frame id to message and signal
//! layouts. The catalog is loaded from pre-parsed JSON (the output of the
//! `dbc-to-json` converter), validated eagerly, and treated as read-only for
//! the process lifetime. Malformed entries are rejected at load time instead
//! of failing per-frame.

use crate::types::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// Little-endian (Intel format)
    Little,
    /// Big-endian (Motorola format)
    Big,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDefinition {
    /// Signal name, unique within its message
    pub name: String,
    /// Start bit in the CAN frame
    pub start_bit: u16,
    /// Length in bits (1-64 decode, <=53 encode)
    pub length: u16,
    /// Scale factor to convert raw value to physical value
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Offset to add after scaling
    #[serde(default)]
    pub offset: f64,
    /// Minimum physical value (None = no lower limit)
    #[serde(default)]
    pub min: Option<f64>,
    /// Maximum physical value (None = no upper limit)
    #[serde(default)]
    pub max: Option<f64>,
    /// Byte order
    #[serde(default = "default_endianness")]
    pub endianness: Endianness,
    /// True if the raw value is a two's-complement signed integer
    #[serde(default)]
    pub signed: bool,
    /// Engineering unit (e.g. "km/h", "V")
    #[serde(default)]
    pub unit: Option<String>,
    /// Value table for enum-like values (raw value -> description)
    #[serde(default)]
    pub val_table: Option<HashMap<i64, String>>,
}

fn default_factor() -> f64 {
    1.0
}

fn default_endianness() -> Endianness {
    Endianness::Little
}

impl SignalDefinition {
    /// True if this signal is a sequence counter ("life counter") by naming
    /// convention
    pub fn is_life_counter(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        name.contains("lifecnt") || name.contains("lifecount")
    }

    /// True if this signal is a checksum by naming convention
    pub fn is_checksum(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        name.contains("checksum") || name.contains("chksum") || name.contains("crc")
    }
}

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDefinition {
    /// CAN message ID
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub length: usize,
    /// Expected cycle time in milliseconds (None = event-driven)
    #[serde(default, rename = "cycleTime")]
    pub cycle_time_ms: Option<u64>,
    /// Sender ECU name
    #[serde(default)]
    pub sender: Option<String>,
    /// All signals in this message, name-unique
    pub signals: Vec<SignalDefinition>,
}

/// On-disk catalog document as written by the DBC converter
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    #[serde(default = "default_version")]
    version: u32,
    messages: Vec<MessageDefinition>,
}

fn default_version() -> u32 {
    1
}

/// The immutable signal definition catalog
pub struct Catalog {
    messages: HashMap<u32, MessageDefinition>,
    version: u32,
}

impl Catalog {
    /// Build a catalog from already-parsed message definitions, validating
    /// every entry
    pub fn new(messages: Vec<MessageDefinition>) -> Result<Self, CatalogError> {
        Self::build(messages, default_version())
    }

    /// Load a catalog from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::build(file.messages, file.version)
    }

    /// Load a catalog from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        log::info!("Loading signal catalog: {:?}", path);
        let json = std::fs::read_to_string(path)?;
        let catalog = Self::from_json_str(&json)?;
        let stats = catalog.stats();
        log::info!(
            "Catalog loaded: {} messages, {} signals (version {})",
            stats.num_messages,
            stats.num_signals,
            catalog.version
        );
        Ok(catalog)
    }

    fn build(messages: Vec<MessageDefinition>, version: u32) -> Result<Self, CatalogError> {
        if messages.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut map = HashMap::with_capacity(messages.len());
        for message in messages {
            validate_message(&message)?;
            map.insert(message.id, message);
        }

        Ok(Self {
            messages: map,
            version,
        })
    }

    /// Get the message definition for a CAN ID
    pub fn message(&self, id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&id)
    }

    /// Get a specific signal definition within a message
    pub fn signal(&self, id: u32, name: &str) -> Option<&SignalDefinition> {
        self.messages
            .get(&id)
            .and_then(|msg| msg.signals.iter().find(|s| s.name == name))
    }

    /// Iterate over all message definitions
    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.values()
    }

    /// Catalog schema version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Get statistics about the loaded catalog
    pub fn stats(&self) -> CatalogStats {
        let num_signals = self.messages.values().map(|m| m.signals.len()).sum();
        CatalogStats {
            num_messages: self.messages.len(),
            num_signals,
        }
    }
}

/// Catalog statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

fn validate_message(message: &MessageDefinition) -> Result<(), CatalogError> {
    if message.length == 0 || message.length > 64 {
        return Err(CatalogError::InvalidMessage {
            message: message.name.clone(),
            reason: format!("byte length {} out of range 1-64", message.length),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for signal in &message.signals {
        if !seen.insert(signal.name.as_str()) {
            return Err(CatalogError::InvalidSignal {
                message: message.name.clone(),
                signal: signal.name.clone(),
                reason: "duplicate signal name".to_string(),
            });
        }
        if signal.length == 0 || signal.length > 64 {
            return Err(CatalogError::InvalidSignal {
                message: message.name.clone(),
                signal: signal.name.clone(),
                reason: format!("bit length {} out of range 1-64", signal.length),
            });
        }
        if !signal.factor.is_finite() || signal.factor == 0.0 {
            return Err(CatalogError::InvalidSignal {
                message: message.name.clone(),
                signal: signal.name.clone(),
                reason: format!("factor {} is not usable", signal.factor),
            });
        }
    }
    Ok(())
}
