//! Maker and taker traits words.
//!
//! Both words are read bit-for-bit by the order protocol contract, so the
//! layout constants below are fixed. Flags sit in the high byte and packed
//! integer fields fill the low bits.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::packing::{bit, check_width, extract, extract_u64, mask, place};

/// Maker traits flag positions.
pub mod maker_bits {
    pub const NO_PARTIAL_FILLS: usize = 255;
    pub const ALLOW_MULTIPLE_FILLS: usize = 254;
    pub const PRE_INTERACTION: usize = 252;
    pub const POST_INTERACTION: usize = 251;
    pub const NEED_EPOCH_CHECK: usize = 250;
    pub const HAS_EXTENSION: usize = 249;
    pub const USE_PERMIT2: usize = 248;
    pub const UNWRAP_NATIVE: usize = 247;

    pub const ALLOWED_SENDER_OFFSET: usize = 0;
    pub const ALLOWED_SENDER_BITS: usize = 80;
    pub const EXPIRATION_OFFSET: usize = 80;
    pub const EXPIRATION_BITS: usize = 40;
    pub const NONCE_OFFSET: usize = 120;
    pub const NONCE_BITS: usize = 40;
    pub const SERIES_OFFSET: usize = 160;
    pub const SERIES_BITS: usize = 40;

    /// Every bit covered by a packed field.
    pub const LOW_FIELDS_BITS: usize = 200;
}

/// Taker traits flag positions.
pub mod taker_bits {
    pub const MAKER_AMOUNT: usize = 255;
    pub const UNWRAP_NATIVE: usize = 254;
    pub const SKIP_ORDER_PERMIT: usize = 253;
    pub const USE_PERMIT2: usize = 252;
    pub const ARGS_HAS_TARGET: usize = 251;

    pub const EXTENSION_LENGTH_OFFSET: usize = 224;
    pub const EXTENSION_LENGTH_BITS: usize = 24;
    pub const INTERACTION_LENGTH_OFFSET: usize = 200;
    pub const INTERACTION_LENGTH_BITS: usize = 24;
    pub const THRESHOLD_BITS: usize = 185;
}

/// Order-level switches and limits chosen by the maker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MakerTraits {
    pub no_partial_fills: bool,
    pub allow_multiple_fills: bool,
    pub pre_interaction: bool,
    pub post_interaction: bool,
    pub need_epoch_check: bool,
    pub has_extension: bool,
    pub use_permit2: bool,
    pub unwrap_native: bool,
    /// Low 80 bits of the only address allowed to fill; zero allows anyone.
    pub allowed_sender: u128,
    /// Unix seconds after which the order is void; zero never expires.
    pub expiration: u64,
    pub nonce_or_epoch: u64,
    pub series: u64,
}

impl MakerTraits {
    fn flags(&self) -> [(usize, bool); 8] {
        use maker_bits::*;
        [
            (NO_PARTIAL_FILLS, self.no_partial_fills),
            (ALLOW_MULTIPLE_FILLS, self.allow_multiple_fills),
            (PRE_INTERACTION, self.pre_interaction),
            (POST_INTERACTION, self.post_interaction),
            (NEED_EPOCH_CHECK, self.need_epoch_check),
            (HAS_EXTENSION, self.has_extension),
            (USE_PERMIT2, self.use_permit2),
            (UNWRAP_NATIVE, self.unwrap_native),
        ]
    }

    /// Bits the contract assigns a meaning to.
    fn known_bits() -> U256 {
        use maker_bits::*;
        [
            NO_PARTIAL_FILLS,
            ALLOW_MULTIPLE_FILLS,
            PRE_INTERACTION,
            POST_INTERACTION,
            NEED_EPOCH_CHECK,
            HAS_EXTENSION,
            USE_PERMIT2,
            UNWRAP_NATIVE,
        ]
        .into_iter()
        .fold(mask(LOW_FIELDS_BITS), |acc, b| acc | bit(b))
    }

    /// Restrict filling to one address.
    pub fn with_allowed_sender(mut self, sender: Address) -> Self {
        self.allowed_sender = Self::sender_suffix(sender);
        self
    }

    /// Low 80 bits of an address, as stored in the allowed-sender field.
    pub fn sender_suffix(address: Address) -> u128 {
        let mut buf = [0u8; 16];
        buf[6..].copy_from_slice(&address.as_slice()[10..]);
        u128::from_be_bytes(buf)
    }

    /// Whether `sender` may fill this order.
    pub fn is_allowed_sender(&self, sender: Address) -> bool {
        self.allowed_sender == 0 || self.allowed_sender == Self::sender_suffix(sender)
    }

    /// Whether the order has expired at `now_secs`.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expiration != 0 && self.expiration < now_secs
    }

    pub fn encode(&self) -> CodecResult<U256> {
        use maker_bits::*;

        let mut word = place(
            "allowed_sender",
            U256::from(self.allowed_sender),
            ALLOWED_SENDER_OFFSET,
            ALLOWED_SENDER_BITS,
        )?;
        word |= place(
            "expiration",
            U256::from(self.expiration),
            EXPIRATION_OFFSET,
            EXPIRATION_BITS,
        )?;
        word |= place(
            "nonce_or_epoch",
            U256::from(self.nonce_or_epoch),
            NONCE_OFFSET,
            NONCE_BITS,
        )?;
        word |= place("series", U256::from(self.series), SERIES_OFFSET, SERIES_BITS)?;

        for (position, set) in self.flags() {
            if set {
                word |= bit(position);
            }
        }
        Ok(word)
    }

    pub fn decode(word: U256) -> CodecResult<Self> {
        use maker_bits::*;

        let reserved = word & !Self::known_bits();
        if reserved != U256::ZERO {
            return Err(CodecError::mismatch(
                "maker_traits",
                format!("reserved bits set: {reserved:#x}"),
            ));
        }

        let allowed_sender = extract(word, ALLOWED_SENDER_OFFSET, ALLOWED_SENDER_BITS);
        let limbs = allowed_sender.as_limbs();

        Ok(Self {
            no_partial_fills: word.bit(NO_PARTIAL_FILLS),
            allow_multiple_fills: word.bit(ALLOW_MULTIPLE_FILLS),
            pre_interaction: word.bit(PRE_INTERACTION),
            post_interaction: word.bit(POST_INTERACTION),
            need_epoch_check: word.bit(NEED_EPOCH_CHECK),
            has_extension: word.bit(HAS_EXTENSION),
            use_permit2: word.bit(USE_PERMIT2),
            unwrap_native: word.bit(UNWRAP_NATIVE),
            allowed_sender: (limbs[0] as u128) | ((limbs[1] as u128) << 64),
            expiration: extract_u64(word, EXPIRATION_OFFSET, EXPIRATION_BITS),
            nonce_or_epoch: extract_u64(word, NONCE_OFFSET, NONCE_BITS),
            series: extract_u64(word, SERIES_OFFSET, SERIES_BITS),
        })
    }
}

/// Fill-time options chosen by the taker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TakerTraits {
    /// Threshold is a maker amount rather than a taker amount.
    pub maker_amount: bool,
    pub unwrap_native: bool,
    pub skip_order_permit: bool,
    pub use_permit2: bool,
    pub args_has_target: bool,
    /// Byte length of the extension appended to the fill arguments.
    pub extension_length: u32,
    /// Byte length of the taker interaction appended after the extension.
    pub interaction_length: u32,
    pub threshold: U256,
}

impl TakerTraits {
    fn flags(&self) -> [(usize, bool); 5] {
        use taker_bits::*;
        [
            (MAKER_AMOUNT, self.maker_amount),
            (UNWRAP_NATIVE, self.unwrap_native),
            (SKIP_ORDER_PERMIT, self.skip_order_permit),
            (USE_PERMIT2, self.use_permit2),
            (ARGS_HAS_TARGET, self.args_has_target),
        ]
    }

    fn known_bits() -> U256 {
        use taker_bits::*;
        let lengths = mask(EXTENSION_LENGTH_BITS) << EXTENSION_LENGTH_OFFSET
            | mask(INTERACTION_LENGTH_BITS) << INTERACTION_LENGTH_OFFSET;
        [MAKER_AMOUNT, UNWRAP_NATIVE, SKIP_ORDER_PERMIT, USE_PERMIT2, ARGS_HAS_TARGET]
            .into_iter()
            .fold(mask(THRESHOLD_BITS) | lengths, |acc, b| acc | bit(b))
    }

    /// Traits declaring exactly the given extension.
    pub fn for_extension(extension: &[u8]) -> CodecResult<Self> {
        let length = u32::try_from(extension.len()).map_err(|_| CodecError::EncodingOverflow {
            field: "extension_length",
            bits: taker_bits::EXTENSION_LENGTH_BITS as u32,
        })?;
        check_width(
            "extension_length",
            U256::from(length),
            taker_bits::EXTENSION_LENGTH_BITS,
        )?;
        Ok(Self {
            extension_length: length,
            ..Default::default()
        })
    }

    /// Confirm the declared extension length matches the bytes that will be sent.
    pub fn validate_extension(&self, extension: &[u8]) -> CodecResult<()> {
        if self.extension_length as usize != extension.len() {
            return Err(CodecError::mismatch(
                "extension_length",
                format!(
                    "taker traits declare {} bytes, extension has {}",
                    self.extension_length,
                    extension.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> CodecResult<U256> {
        use taker_bits::*;

        let mut word = check_width("threshold", self.threshold, THRESHOLD_BITS)?;
        word |= place(
            "extension_length",
            U256::from(self.extension_length),
            EXTENSION_LENGTH_OFFSET,
            EXTENSION_LENGTH_BITS,
        )?;
        word |= place(
            "interaction_length",
            U256::from(self.interaction_length),
            INTERACTION_LENGTH_OFFSET,
            INTERACTION_LENGTH_BITS,
        )?;

        for (position, set) in self.flags() {
            if set {
                word |= bit(position);
            }
        }
        Ok(word)
    }

    pub fn decode(word: U256) -> CodecResult<Self> {
        use taker_bits::*;

        let reserved = word & !Self::known_bits();
        if reserved != U256::ZERO {
            return Err(CodecError::mismatch(
                "taker_traits",
                format!("reserved bits set: {reserved:#x}"),
            ));
        }

        Ok(Self {
            maker_amount: word.bit(MAKER_AMOUNT),
            unwrap_native: word.bit(UNWRAP_NATIVE),
            skip_order_permit: word.bit(SKIP_ORDER_PERMIT),
            use_permit2: word.bit(USE_PERMIT2),
            args_has_target: word.bit(ARGS_HAS_TARGET),
            extension_length: extract_u64(word, EXTENSION_LENGTH_OFFSET, EXTENSION_LENGTH_BITS)
                as u32,
            interaction_length: extract_u64(
                word,
                INTERACTION_LENGTH_OFFSET,
                INTERACTION_LENGTH_BITS,
            ) as u32,
            threshold: extract(word, 0, THRESHOLD_BITS),
        })
    }
}
