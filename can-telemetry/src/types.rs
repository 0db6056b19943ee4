//! Core types for the CAN telemetry library
//!
//! This module defines the fundamental types that flow through the pipeline:
//! raw frames from a source, decoded messages produced by the normalizer, and
//! the error taxonomy shared by all subsystems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Timestamp type used throughout the pipeline
pub type Timestamp = DateTime<Utc>;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// A raw CAN frame as delivered by a frame source
///
/// This represents a single frame before any signal decoding. It is created
/// by the source, consumed exactly once by the normalizer, then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// Receipt timestamp
    pub timestamp: Timestamp,
}

impl RawFrame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

/// A fully decoded CAN message with all its physical signal values
///
/// Created per frame by the normalizer; consumed by the aggregation store and
/// the distribution hub. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    /// CAN message ID
    #[serde(rename = "msgId")]
    pub msg_id: u32,
    /// Message name from the catalog
    pub name: String,
    /// Receipt timestamp of the underlying frame, epoch milliseconds on the wire
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Timestamp,
    /// Signal name -> physical value
    pub signals: HashMap<String, f64>,
    /// Raw frame bytes, kept for diagnostics and re-encoding
    pub raw: Vec<u8>,
    /// False if any signal failed to decode or any validation rule failed
    pub healthy: bool,
}

/// Errors produced by the bit-level signal codec
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid bit length {0} (must be 1-64)")]
    InvalidBitLength(u16),

    #[error("Bit length {0} exceeds the 53-bit encode limit")]
    EncodeLengthExceeded(u16),

    #[error("Signal '{signal}' needs {required} bytes but frame has {available}")]
    OutOfRange {
        signal: String,
        required: usize,
        available: usize,
    },

    #[error("Scale factor must be non-zero")]
    ZeroFactor,
}

/// Errors produced while loading or validating the signal catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to parse catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Catalog contains no valid message definitions")]
    Empty,

    #[error("Invalid signal definition '{signal}' in message '{message}': {reason}")]
    InvalidSignal {
        message: String,
        signal: String,
        reason: String,
    },

    #[error("Invalid message definition '{message}': {reason}")]
    InvalidMessage { message: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur anywhere in the telemetry pipeline
///
/// Per-signal, per-frame and per-client failures are isolated and recorded as
/// diagnostics; only catalog load failure is fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Distribution error: {0}")]
    Distribution(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Convert a timestamp to the epoch-millisecond representation used by the
/// aggregate tables and the wire envelope.
pub fn to_epoch_ms(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_epoch_ms`]; out-of-range values saturate to the epoch.
pub fn from_epoch_ms(ms: i64) -> Timestamp {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
