//! Bounded diagnostics recorder
//!
//! Keeps two observability stores: a FIFO ring of decode/validation errors and
//! a size-bounded map of unrecognized frame id sightings. Both are strictly
//! bounded and never authoritative state; losing a record is acceptable,
//! growing without bound is not.

use crate::types::Timestamp;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Maximum number of retained decode error records
pub const MAX_ERROR_RECORDS: usize = 1000;

/// Maximum number of distinct unknown frame ids tracked
pub const MAX_UNKNOWN_IDS: usize = 100;

/// Classification of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticCode {
    /// A signal could not be extracted from its frame
    DecodeFailed,
    /// Sequence counter skipped or repeated
    LifeCounterMismatch,
    /// Checksum signal did not match the computed XOR
    ChecksumMismatch,
}

impl DiagnosticCode {
    /// Stable wire/log identifier for this code
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::DecodeFailed => "DECODE_FAILED",
            DiagnosticCode::LifeCounterMismatch => "LIFECNT_CHECK_FAILED",
            DiagnosticCode::ChecksumMismatch => "CHECKSUM_CHECK_FAILED",
        }
    }
}

/// A single recorded decode or validation failure
///
/// Carries enough context to reconstruct the failure without the original
/// frame: id, names, code and the raw payload as hex.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticRecord {
    pub timestamp: Timestamp,
    pub frame_id: u32,
    pub message_name: Option<String>,
    pub signal_name: Option<String>,
    pub code: DiagnosticCode,
    pub detail: String,
    pub raw_hex: String,
}

/// Sightings of a frame id absent from the catalog
#[derive(Debug, Clone, Serialize)]
pub struct UnknownFrameRecord {
    pub frame_id: u32,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub count: u64,
}

/// The diagnostics recorder
pub struct DiagnosticsRecorder {
    errors: VecDeque<DiagnosticRecord>,
    unknown: HashMap<u32, UnknownFrameRecord>,
    total_errors: u64,
    max_errors: usize,
    max_unknown: usize,
}

impl DiagnosticsRecorder {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ERROR_RECORDS, MAX_UNKNOWN_IDS)
    }

    /// Create a recorder with explicit bounds (used by tests)
    pub fn with_capacity(max_errors: usize, max_unknown: usize) -> Self {
        Self {
            errors: VecDeque::with_capacity(max_errors.min(64)),
            unknown: HashMap::new(),
            total_errors: 0,
            max_errors,
            max_unknown,
        }
    }

    /// Record a decode or validation failure; the oldest record is evicted
    /// once the ring is full
    pub fn record_error(
        &mut self,
        frame_id: u32,
        message_name: Option<&str>,
        signal_name: Option<&str>,
        code: DiagnosticCode,
        detail: String,
        raw: &[u8],
    ) {
        if self.errors.len() >= self.max_errors {
            self.errors.pop_front();
        }
        self.errors.push_back(DiagnosticRecord {
            timestamp: Utc::now(),
            frame_id,
            message_name: message_name.map(str::to_string),
            signal_name: signal_name.map(str::to_string),
            code,
            detail,
            raw_hex: to_hex(raw),
        });
        self.total_errors += 1;
    }

    /// Record a sighting of a frame id that is not in the catalog
    ///
    /// Not an error, just an unmodeled id. When the map is full the entry
    /// with the oldest first-seen timestamp is evicted.
    pub fn record_unknown_frame(&mut self, frame_id: u32) {
        let now = Utc::now();
        if let Some(entry) = self.unknown.get_mut(&frame_id) {
            entry.last_seen = now;
            entry.count += 1;
            return;
        }

        if self.unknown.len() >= self.max_unknown {
            if let Some(oldest) = self
                .unknown
                .values()
                .min_by_key(|r| r.first_seen)
                .map(|r| r.frame_id)
            {
                self.unknown.remove(&oldest);
            }
        }

        self.unknown.insert(
            frame_id,
            UnknownFrameRecord {
                frame_id,
                first_seen: now,
                last_seen: now,
                count: 1,
            },
        );
    }

    /// The most recent `n` error records, newest last
    pub fn recent(&self, n: usize) -> Vec<&DiagnosticRecord> {
        let skip = self.errors.len().saturating_sub(n);
        self.errors.iter().skip(skip).collect()
    }

    /// Aggregated error counts by code over the retained window
    pub fn counts_by_code(&self) -> HashMap<DiagnosticCode, usize> {
        let mut counts = HashMap::new();
        for record in &self.errors {
            *counts.entry(record.code).or_insert(0) += 1;
        }
        counts
    }

    /// All tracked unknown frame sightings
    pub fn unknown_frames(&self) -> Vec<&UnknownFrameRecord> {
        self.unknown.values().collect()
    }

    /// Total errors recorded over the process lifetime, including evicted ones
    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    /// Number of retained error records
    pub fn retained_errors(&self) -> usize {
        self.errors.len()
    }
}

impl Default for DiagnosticsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02X}", b));
    }
    s
}
