//! Bit-field helpers shared by every packed word.

use alloy_primitives::U256;

use crate::error::{CodecError, CodecResult};

/// All-ones mask of the given width.
pub(crate) fn mask(bits: usize) -> U256 {
    if bits >= 256 {
        U256::MAX
    } else {
        (U256::from(1u8) << bits) - U256::from(1u8)
    }
}

/// Single-bit mask.
pub(crate) fn bit(position: usize) -> U256 {
    U256::from(1u8) << position
}

/// Reject a value wider than its field.
pub(crate) fn check_width(field: &'static str, value: U256, bits: usize) -> CodecResult<U256> {
    if value.bit_len() > bits {
        return Err(CodecError::EncodingOverflow {
            field,
            bits: bits as u32,
        });
    }
    Ok(value)
}

/// Shift a width-checked value into place.
pub(crate) fn place(field: &'static str, value: U256, offset: usize, bits: usize) -> CodecResult<U256> {
    Ok(check_width(field, value, bits)? << offset)
}

/// Read a field back out of a word.
pub(crate) fn extract(word: U256, offset: usize, bits: usize) -> U256 {
    (word >> offset) & mask(bits)
}

/// Read a field that is known to fit in 64 bits.
pub(crate) fn extract_u64(word: U256, offset: usize, bits: usize) -> u64 {
    debug_assert!(bits <= 64);
    extract(word, offset, bits).as_limbs()[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_widths() {
        assert_eq!(mask(0), U256::ZERO);
        assert_eq!(mask(8), U256::from(0xffu64));
        assert_eq!(mask(256), U256::MAX);
    }

    #[test]
    fn test_place_and_extract() {
        let word = place("x", U256::from(0xabcdu64), 80, 40).unwrap();
        assert_eq!(extract_u64(word, 80, 40), 0xabcd);
        assert_eq!(extract(word, 0, 80), U256::ZERO);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let err = place("expiration", U256::from(1u64) << 40, 80, 40).unwrap_err();
        assert_eq!(
            err,
            CodecError::EncodingOverflow {
                field: "expiration",
                bits: 40
            }
        );
    }
}
