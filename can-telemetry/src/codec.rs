//! Bit-level signal codec
//!
//! Extracts and encodes fixed-width bit fields from CAN frame payloads under
//! both endianness conventions, with sign extension and scale/offset/clamp
//! arithmetic. This is the leaf module of the pipeline: it knows nothing about
//! messages or catalogs, only bytes and bit positions.

use crate::types::CodecError;

/// Widest field the encode path accepts. Physical values travel through `f64`
/// arithmetic, so raw values above 2^53 would silently lose precision on the
/// way back in. Decode is not affected and handles the full 1-64 bit range.
pub const MAX_ENCODE_BITS: u16 = 53;

/// Extract a raw signal value from frame data
///
/// Big-endian (Motorola) reads MSB-first starting at byte `start_bit / 8`,
/// bit offset `start_bit % 8` from the MSB, advancing into higher bytes.
/// Little-endian (Intel) reads LSB-first in increasing bit order.
///
/// Bits beyond the end of `data` read as 0; only an invalid `length` is an
/// error.
pub fn extract_bits(
    data: &[u8],
    start_bit: u16,
    length: u16,
    big_endian: bool,
    signed: bool,
) -> Result<i64, CodecError> {
    if length == 0 || length > 64 {
        return Err(CodecError::InvalidBitLength(length));
    }

    let raw = if big_endian {
        extract_big_endian(data, start_bit as usize, length as usize)
    } else {
        extract_little_endian(data, start_bit as usize, length as usize)
    };

    if signed {
        Ok(sign_extend(raw, length as usize))
    } else {
        Ok(raw as i64)
    }
}

/// Encode a raw signal value into frame data - the exact inverse of
/// [`extract_bits`]
///
/// Only fields up to [`MAX_ENCODE_BITS`] wide are supported. Values outside
/// the field's representable range are clamped, not rejected. Bits that would
/// land beyond the end of `data` are dropped.
pub fn encode_bits(
    data: &mut [u8],
    start_bit: u16,
    length: u16,
    big_endian: bool,
    signed: bool,
    raw: i64,
) -> Result<(), CodecError> {
    if length == 0 || length > 64 {
        return Err(CodecError::InvalidBitLength(length));
    }
    if length > MAX_ENCODE_BITS {
        return Err(CodecError::EncodeLengthExceeded(length));
    }

    let clamped = clamp_raw(raw, length as usize, signed);
    let mask = (1u64 << length) - 1;
    let bits = (clamped as u64) & mask;

    if big_endian {
        write_big_endian(data, start_bit as usize, length as usize, bits);
    } else {
        write_little_endian(data, start_bit as usize, length as usize, bits);
    }
    Ok(())
}

/// Convert a raw integer value to a physical value
pub fn apply_scale(raw: i64, factor: f64, offset: f64) -> f64 {
    raw as f64 * factor + offset
}

/// Convert a physical value back to a raw integer value, rounding to the
/// nearest integer
pub fn inverse_scale(physical: f64, factor: f64, offset: f64) -> Result<i64, CodecError> {
    if factor == 0.0 {
        return Err(CodecError::ZeroFactor);
    }
    Ok(((physical - offset) / factor).round() as i64)
}

/// Bound a physical value to the signal's limits; `None` means no limit
pub fn clamp(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut v = value;
    if let Some(lo) = min {
        if v < lo {
            v = lo;
        }
    }
    if let Some(hi) = max {
        if v > hi {
            v = hi;
        }
    }
    v
}

/// Extract a field with little-endian (Intel) byte order
///
/// Start bit points to the LSB; bits are collected in increasing bit order
/// across increasing byte indices.
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << i;
        }
    }

    result
}

/// Extract a field with big-endian (Motorola) byte order
///
/// Start bit points to the MSB of the field; reading proceeds toward the LSB
/// of each byte and then into the next higher byte.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = 7 - (bit_pos % 8);

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << (length - 1 - i);
        }
    }

    result
}

fn write_little_endian(data: &mut [u8], start_bit: usize, length: usize, bits: u64) {
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = ((bits >> i) & 0x01) as u8;
            data[byte_idx] = (data[byte_idx] & !(1 << bit_in_byte)) | (bit_value << bit_in_byte);
        }
    }
}

fn write_big_endian(data: &mut [u8], start_bit: usize, length: usize, bits: u64) {
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = 7 - (bit_pos % 8);

        if byte_idx < data.len() {
            let bit_value = ((bits >> (length - 1 - i)) & 0x01) as u8;
            data[byte_idx] = (data[byte_idx] & !(1 << bit_in_byte)) | (bit_value << bit_in_byte);
        }
    }
}

/// Sign-extend a value from N bits to 64 bits
///
/// If the value's MSB is 1, fill the upper bits with 1s. This converts the
/// unsigned representation to a proper signed value.
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

/// Clamp a raw value into the representable range of an N-bit field
fn clamp_raw(raw: i64, length: usize, signed: bool) -> i64 {
    let (lo, hi) = if signed {
        (-(1i64 << (length - 1)), (1i64 << (length - 1)) - 1)
    } else {
        (0, ((1u64 << length) - 1) as i64)
    };
    raw.max(lo).min(hi)
}
