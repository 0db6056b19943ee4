//! Frame normalization pipeline
//!
//! Applies the codec to every signal of an incoming frame using the catalog,
//! enforces the sequence-counter and checksum conventions, and emits a decoded
//! message with an aggregated health flag. Per-signal failures are isolated:
//! one bad signal never aborts the rest of the frame.

use crate::catalog::{Catalog, Endianness, MessageDefinition, SignalDefinition};
use crate::codec;
use crate::diagnostics::{DiagnosticCode, DiagnosticsRecorder};
use crate::types::{DecodedMessage, RawFrame};
use std::collections::HashMap;
use std::sync::Arc;

/// Modulus of the sequence ("life") counter convention
const LIFE_COUNTER_MODULUS: i64 = 16;

/// Number of leading payload bytes covered by the XOR checksum convention
const CHECKSUM_SPAN: usize = 7;

/// Stateful frame normalizer
///
/// The only state is a per-instance sequence-counter cache keyed by frame id,
/// so independent pipelines (and tests) never observe each other's counters.
pub struct FrameNormalizer {
    catalog: Arc<Catalog>,
    seq_cache: HashMap<u32, i64>,
}

impl FrameNormalizer {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            seq_cache: HashMap::new(),
        }
    }

    /// Normalize a raw frame into a decoded message
    ///
    /// Returns `None` for frame ids absent from the catalog; the sighting is
    /// recorded but it is not an error. The returned message's `healthy` flag
    /// is false if any signal failed to decode or any validation rule failed.
    pub fn normalize(
        &mut self,
        frame: &RawFrame,
        diagnostics: &mut DiagnosticsRecorder,
    ) -> Option<DecodedMessage> {
        let message_def = match self.catalog.message(frame.id) {
            Some(def) => def.clone(),
            None => {
                log::trace!("Unknown CAN ID 0x{:X}", frame.id);
                diagnostics.record_unknown_frame(frame.id);
                return None;
            }
        };

        let mut signals = HashMap::with_capacity(message_def.signals.len());
        let mut healthy = true;

        for signal in &message_def.signals {
            let raw_value = match self.extract_raw(frame, &message_def, signal, diagnostics) {
                Some(v) => v,
                None => {
                    healthy = false;
                    continue;
                }
            };

            if signal.is_life_counter() {
                if !self.check_life_counter(frame, &message_def, signal, raw_value, diagnostics) {
                    healthy = false;
                }
            } else if signal.is_checksum()
                && !check_checksum(frame, &message_def, signal, raw_value, diagnostics)
            {
                healthy = false;
            }

            let physical = codec::clamp(
                codec::apply_scale(raw_value, signal.factor, signal.offset),
                signal.min,
                signal.max,
            );
            signals.insert(signal.name.clone(), physical);
        }

        Some(DecodedMessage {
            msg_id: frame.id,
            name: message_def.name.clone(),
            timestamp: frame.timestamp,
            signals,
            raw: frame.data.clone(),
            healthy,
        })
    }

    /// Extract one signal's raw value, recording a diagnostic on failure
    fn extract_raw(
        &self,
        frame: &RawFrame,
        message_def: &MessageDefinition,
        signal: &SignalDefinition,
        diagnostics: &mut DiagnosticsRecorder,
    ) -> Option<i64> {
        let required_bytes = (signal.start_bit as usize + signal.length as usize + 7) / 8;
        if required_bytes > frame.data.len() {
            log::warn!(
                "Signal '{}' requires {} bytes but frame 0x{:X} has {}",
                signal.name,
                required_bytes,
                frame.id,
                frame.data.len()
            );
            diagnostics.record_error(
                frame.id,
                Some(&message_def.name),
                Some(&signal.name),
                DiagnosticCode::DecodeFailed,
                format!(
                    "needs {} bytes, frame has {}",
                    required_bytes,
                    frame.data.len()
                ),
                &frame.data,
            );
            return None;
        }

        let big_endian = signal.endianness == Endianness::Big;
        match codec::extract_bits(
            &frame.data,
            signal.start_bit,
            signal.length,
            big_endian,
            signal.signed,
        ) {
            Ok(raw) => Some(raw),
            Err(e) => {
                diagnostics.record_error(
                    frame.id,
                    Some(&message_def.name),
                    Some(&signal.name),
                    DiagnosticCode::DecodeFailed,
                    e.to_string(),
                    &frame.data,
                );
                None
            }
        }
    }

    /// Validate a sequence-counter signal against the cached previous value
    ///
    /// The cache is updated with the observed value regardless of outcome, so
    /// a single drop produces exactly one diagnostic.
    fn check_life_counter(
        &mut self,
        frame: &RawFrame,
        message_def: &MessageDefinition,
        signal: &SignalDefinition,
        actual: i64,
        diagnostics: &mut DiagnosticsRecorder,
    ) -> bool {
        let previous = self.seq_cache.insert(frame.id, actual);
        let Some(previous) = previous else {
            // First sighting of this id is always a valid transition
            return true;
        };

        let expected = (previous + 1) % LIFE_COUNTER_MODULUS;
        if actual == expected {
            return true;
        }

        log::debug!(
            "Life counter mismatch on 0x{:X}: expected {}, got {}",
            frame.id,
            expected,
            actual
        );
        diagnostics.record_error(
            frame.id,
            Some(&message_def.name),
            Some(&signal.name),
            DiagnosticCode::LifeCounterMismatch,
            format!("expected {}, actual {}", expected, actual),
            &frame.data,
        );
        false
    }
}

/// Validate a checksum signal: the raw value must equal the XOR of the
/// frame's first seven bytes
fn check_checksum(
    frame: &RawFrame,
    message_def: &MessageDefinition,
    signal: &SignalDefinition,
    actual: i64,
    diagnostics: &mut DiagnosticsRecorder,
) -> bool {
    let span = frame.data.len().min(CHECKSUM_SPAN);
    let expected = frame.data[..span].iter().fold(0u8, |acc, b| acc ^ b) as i64;
    if actual == expected {
        return true;
    }

    log::debug!(
        "Checksum mismatch on 0x{:X}: expected {}, got {}",
        frame.id,
        expected,
        actual
    );
    diagnostics.record_error(
        frame.id,
        Some(&message_def.name),
        Some(&signal.name),
        DiagnosticCode::ChecksumMismatch,
        format!("expected {}, actual {}", expected, actual),
        &frame.data,
    );
    false
}
