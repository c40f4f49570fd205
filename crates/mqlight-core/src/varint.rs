//! Variable length integer encoding used for frame and field lengths.
//!
//! Seven bits of value per byte, high bit set when more bytes follow:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use bytes::BufMut;

use crate::error::{ProtocolError, Result};

/// Largest value that fits in the four byte encoding.
pub const MAX_VALUE: usize = 268_435_455;

/// Decode a variable length integer from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful,
/// `Ok(None)` if more data is needed, or `Err` if the encoding is invalid.
///
/// # Example
/// ```
/// use mqlight_core::varint::decode;
/// let buf = [0x80, 0x01];
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(ProtocolError::InvalidLength);
        }
        value += ((byte & 0x7F) as usize) * multiplier;

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(ProtocolError::InvalidLength);
    }
    Ok(None)
}

/// Append `value` to `buf`. Values above [`MAX_VALUE`] are rejected.
pub fn encode<B: BufMut>(mut value: usize, buf: &mut B) -> Result<()> {
    if value > MAX_VALUE {
        return Err(ProtocolError::FrameTooLarge(value));
    }
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes `encode` writes for `value`.
#[inline]
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
    }

    #[test]
    fn test_decode_multi_byte() {
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16_383, 2)));
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_VALUE, 4))
        );
    }

    #[test]
    fn test_decode_needs_more() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_too_long() {
        assert!(decode(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        assert!(decode(&[0x80, 0x80, 0x80, 0x80]).is_err());
    }

    #[test]
    fn test_encode_boundaries() {
        for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_VALUE] {
            let mut buf = Vec::new();
            encode(value, &mut buf).unwrap();
            assert_eq!(buf.len(), encoded_len(value));
            assert_eq!(decode(&buf).unwrap(), Some((value, buf.len())));
        }
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let mut buf = Vec::new();
        assert_eq!(
            encode(MAX_VALUE + 1, &mut buf),
            Err(ProtocolError::FrameTooLarge(MAX_VALUE + 1))
        );
        assert!(buf.is_empty());
    }
}
