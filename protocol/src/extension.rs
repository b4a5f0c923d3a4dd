//! Order extension payload.
//!
//! An extension is a 32-byte offsets header followed by up to eight
//! concatenated fields and optional custom data. Field `i` records its
//! cumulative end offset in bits `[32i+31:32i]` of the big-endian header
//! word, so the post-interaction field (index 7) is the first four bytes.

use std::fmt;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolValue};
use bridgemenot_common::ChainId;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::packing::{check_width, extract, extract_u64, mask};
use crate::timelocks::Timelocks;

/// Size of the offsets header.
pub const HEADER_LEN: usize = 32;
/// Number of offset-addressed fields.
pub const FIELD_COUNT: usize = 8;
const OFFSET_BITS: usize = 32;

/// Escrow factory address prefix of the post-interaction field.
pub const ESCROW_TARGET_LEN: usize = 20;
/// ABI-encoded escrow arguments: five static words.
pub const ESCROW_ARGS_LEN: usize = 5 * 32;
pub const ESCROW_POST_INTERACTION_LEN: usize = ESCROW_TARGET_LEN + ESCROW_ARGS_LEN;
/// Total encoded size of an escrow extension.
pub const ESCROW_EXTENSION_LEN: usize = HEADER_LEN + ESCROW_POST_INTERACTION_LEN;

const DEPOSIT_BITS: usize = 128;

/// Extension fields in header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExtensionField {
    MakerAssetSuffix = 0,
    TakerAssetSuffix = 1,
    MakingAmountData = 2,
    TakingAmountData = 3,
    Predicate = 4,
    MakerPermit = 5,
    PreInteractionData = 6,
    PostInteractionData = 7,
}

impl ExtensionField {
    pub const ALL: [ExtensionField; FIELD_COUNT] = [
        ExtensionField::MakerAssetSuffix,
        ExtensionField::TakerAssetSuffix,
        ExtensionField::MakingAmountData,
        ExtensionField::TakingAmountData,
        ExtensionField::Predicate,
        ExtensionField::MakerPermit,
        ExtensionField::PreInteractionData,
        ExtensionField::PostInteractionData,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn offset(self) -> usize {
        self.index() * OFFSET_BITS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionField::MakerAssetSuffix => "maker_asset_suffix",
            ExtensionField::TakerAssetSuffix => "taker_asset_suffix",
            ExtensionField::MakingAmountData => "making_amount_data",
            ExtensionField::TakingAmountData => "taking_amount_data",
            ExtensionField::Predicate => "predicate",
            ExtensionField::MakerPermit => "maker_permit",
            ExtensionField::PreInteractionData => "pre_interaction_data",
            ExtensionField::PostInteractionData => "post_interaction_data",
        }
    }
}

impl fmt::Display for ExtensionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extension {
    fields: [Bytes; FIELD_COUNT],
    custom_data: Bytes,
}

impl Extension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: ExtensionField, data: impl Into<Bytes>) -> Self {
        self.fields[field.index()] = data.into();
        self
    }

    pub fn with_custom_data(mut self, data: impl Into<Bytes>) -> Self {
        self.custom_data = data.into();
        self
    }

    pub fn field(&self, field: ExtensionField) -> &Bytes {
        &self.fields[field.index()]
    }

    pub fn custom_data(&self) -> &Bytes {
        &self.custom_data
    }

    /// An empty extension encodes to zero bytes.
    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(|f| f.is_empty()) && self.custom_data.is_empty()
    }

    pub fn encode(&self) -> CodecResult<Bytes> {
        if self.is_empty() {
            return Ok(Bytes::new());
        }

        let mut header = U256::ZERO;
        let mut end = 0usize;
        for field in ExtensionField::ALL {
            end += self.field(field).len();
            let offset = check_width("extension_offset", U256::from(end), OFFSET_BITS)?;
            header |= offset << field.offset();
        }

        let mut out = Vec::with_capacity(HEADER_LEN + end + self.custom_data.len());
        out.extend_from_slice(&header.to_be_bytes::<HEADER_LEN>());
        for field in &self.fields {
            out.extend_from_slice(field);
        }
        out.extend_from_slice(&self.custom_data);
        Ok(out.into())
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::mismatch(
                "extension",
                format!("{} bytes is shorter than the offsets header", bytes.len()),
            ));
        }

        let header = U256::from_be_slice(&bytes[..HEADER_LEN]);
        let body = &bytes[HEADER_LEN..];

        let mut extension = Self::default();
        let mut start = 0usize;
        for field in ExtensionField::ALL {
            let end = extract_u64(header, field.offset(), OFFSET_BITS) as usize;
            if end < start {
                return Err(CodecError::mismatch(
                    "extension",
                    format!("{field} ends at {end}, before its start {start}"),
                ));
            }
            if end > body.len() {
                return Err(CodecError::mismatch(
                    "extension",
                    format!("{field} ends at {end}, past the {}-byte payload", body.len()),
                ));
            }
            extension.fields[field.index()] = Bytes::copy_from_slice(&body[start..end]);
            start = end;
        }
        extension.custom_data = Bytes::copy_from_slice(&body[start..]);
        Ok(extension)
    }

    /// keccak256 of the encoded extension, used to bind it to an order salt.
    pub fn hash(&self) -> CodecResult<B256> {
        Ok(keccak256(self.encode()?))
    }
}

sol! {
    /// Post-interaction arguments read by the escrow factory.
    #[derive(Debug, PartialEq, Eq)]
    struct EscrowExtraData {
        bytes32 hashlock;
        uint256 dstChainId;
        address dstToken;
        /// `dst << 128 | src`
        uint256 deposits;
        uint256 timelocks;
    }
}

/// The extension every cross-chain escrow order carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowExtension {
    /// Escrow factory invoked as the post-interaction target.
    pub factory: Address,
    pub hashlock: B256,
    pub dst_chain_id: ChainId,
    pub dst_token: Address,
    pub src_safety_deposit: U256,
    pub dst_safety_deposit: U256,
    /// Undeployed timelocks as signed into the order.
    pub timelocks: Timelocks,
}

/// Pack both safety deposits into one word.
pub fn pack_deposits(src: U256, dst: U256) -> CodecResult<U256> {
    let src = check_width("src_safety_deposit", src, DEPOSIT_BITS)?;
    let dst = check_width("dst_safety_deposit", dst, DEPOSIT_BITS)?;
    Ok(dst << DEPOSIT_BITS | src)
}

/// Split a deposits word into `(src, dst)`.
pub fn unpack_deposits(word: U256) -> (U256, U256) {
    (word & mask(DEPOSIT_BITS), extract(word, DEPOSIT_BITS, DEPOSIT_BITS))
}

impl EscrowExtension {
    /// Post-interaction field contents: factory address then ABI arguments.
    pub fn post_interaction_data(&self) -> CodecResult<Vec<u8>> {
        let args = EscrowExtraData {
            hashlock: self.hashlock,
            dstChainId: U256::from(self.dst_chain_id.0),
            dstToken: self.dst_token,
            deposits: pack_deposits(self.src_safety_deposit, self.dst_safety_deposit)?,
            timelocks: self.timelocks.encode(),
        }
        .abi_encode();

        let mut data = Vec::with_capacity(ESCROW_POST_INTERACTION_LEN);
        data.extend_from_slice(self.factory.as_slice());
        data.extend_from_slice(&args);
        Ok(data)
    }

    pub fn to_extension(&self) -> CodecResult<Extension> {
        Ok(Extension::new().with_field(
            ExtensionField::PostInteractionData,
            self.post_interaction_data()?,
        ))
    }

    pub fn encode(&self) -> CodecResult<Bytes> {
        self.to_extension()?.encode()
    }

    /// Decode an escrow extension, accepting nothing but a well-formed
    /// post-interaction field.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() != ESCROW_EXTENSION_LEN {
            return Err(CodecError::mismatch(
                "escrow_extension",
                format!("{} bytes, expected {ESCROW_EXTENSION_LEN}", bytes.len()),
            ));
        }
        Self::from_extension(&Extension::decode(bytes)?)
    }

    pub fn from_extension(extension: &Extension) -> CodecResult<Self> {
        for field in ExtensionField::ALL {
            if field != ExtensionField::PostInteractionData && !extension.field(field).is_empty() {
                return Err(CodecError::mismatch(
                    "escrow_extension",
                    format!("unexpected {field} data"),
                ));
            }
        }
        if !extension.custom_data().is_empty() {
            return Err(CodecError::mismatch(
                "escrow_extension",
                "unexpected custom data",
            ));
        }

        let data = extension.field(ExtensionField::PostInteractionData);
        if data.len() != ESCROW_POST_INTERACTION_LEN {
            return Err(CodecError::mismatch(
                "post_interaction_data",
                format!("{} bytes, expected {ESCROW_POST_INTERACTION_LEN}", data.len()),
            ));
        }

        let factory = Address::from_slice(&data[..ESCROW_TARGET_LEN]);
        let args = EscrowExtraData::abi_decode(&data[ESCROW_TARGET_LEN..], true)
            .map_err(|e| CodecError::mismatch("post_interaction_data", e.to_string()))?;

        let dst_chain_id = u64::try_from(args.dstChainId).map_err(|_| {
            CodecError::mismatch("dst_chain_id", format!("{} exceeds 64 bits", args.dstChainId))
        })?;
        let (src_safety_deposit, dst_safety_deposit) = unpack_deposits(args.deposits);

        Ok(Self {
            factory,
            hashlock: args.hashlock,
            dst_chain_id: ChainId(dst_chain_id),
            dst_token: args.dstToken,
            src_safety_deposit,
            dst_safety_deposit,
            timelocks: Timelocks::decode(args.timelocks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timelocks::TimelockDelays;
    use alloy_primitives::address;
    use proptest::prelude::*;

    fn escrow_extension() -> EscrowExtension {
        EscrowExtension {
            factory: address!("a7bcb4eac8964306f9e3764f67db6a7af6ddf99a"),
            hashlock: keccak256(b"secret"),
            dst_chain_id: ChainId(8453),
            dst_token: address!("833589fcd6edb6e08f4c7c32d4f71b54bda02913"),
            src_safety_deposit: U256::from(1_000u64),
            dst_safety_deposit: U256::from(2_000u64),
            timelocks: Timelocks::undeployed(TimelockDelays::default()).unwrap(),
        }
    }

    #[test]
    fn test_empty_extension_is_zero_bytes() {
        assert!(Extension::new().encode().unwrap().is_empty());
        assert_eq!(Extension::decode(&[]).unwrap(), Extension::new());
    }

    #[test]
    fn test_post_interaction_offset_is_first_header_bytes() {
        let encoded = Extension::new()
            .with_field(ExtensionField::PostInteractionData, vec![0xaa; 3])
            .encode()
            .unwrap();

        assert_eq!(encoded.len(), HEADER_LEN + 3);
        // Cumulative end of field 7 sits in the top four bytes.
        assert_eq!(&encoded[..4], &[0, 0, 0, 3]);
        // Fields 0..7 are empty so every lower offset is zero.
        assert!(encoded[4..HEADER_LEN].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_field_offsets_are_cumulative() {
        let extension = Extension::new()
            .with_field(ExtensionField::MakerAssetSuffix, vec![1; 2])
            .with_field(ExtensionField::Predicate, vec![2; 5])
            .with_custom_data(vec![3; 4]);
        let encoded = extension.encode().unwrap();
        let header = U256::from_be_slice(&encoded[..HEADER_LEN]);

        assert_eq!(extract_u64(header, 0, 32), 2);
        assert_eq!(extract_u64(header, 3 * 32, 32), 2);
        assert_eq!(extract_u64(header, 4 * 32, 32), 7);
        assert_eq!(extract_u64(header, 7 * 32, 32), 7);
        assert_eq!(encoded.len(), HEADER_LEN + 7 + 4);

        let decoded = Extension::decode(&encoded).unwrap();
        assert_eq!(decoded, extension);
        assert_eq!(&decoded.custom_data()[..], &[3u8; 4]);
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(matches!(
            Extension::decode(&[0u8; 12]),
            Err(CodecError::DecodeMismatch { field: "extension", .. })
        ));
    }

    #[test]
    fn test_offset_past_payload_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN + 2];
        bytes[3] = 9;
        assert!(Extension::decode(&bytes).is_err());
    }

    #[test]
    fn test_non_monotonic_offsets_rejected() {
        let mut header = U256::from(5u64);
        header |= U256::from(2u64) << 32;
        let mut bytes = header.to_be_bytes::<32>().to_vec();
        bytes.extend_from_slice(&[0u8; 5]);
        assert!(matches!(
            Extension::decode(&bytes),
            Err(CodecError::DecodeMismatch { field: "extension", .. })
        ));
    }

    #[test]
    fn test_escrow_extension_layout() {
        let escrow = escrow_extension();
        let encoded = escrow.encode().unwrap();

        assert_eq!(encoded.len(), ESCROW_EXTENSION_LEN);
        assert_eq!(
            &encoded[..4],
            &(ESCROW_POST_INTERACTION_LEN as u32).to_be_bytes()
        );
        assert_eq!(
            &encoded[HEADER_LEN..HEADER_LEN + ESCROW_TARGET_LEN],
            escrow.factory.as_slice()
        );
        assert_eq!(
            &encoded[HEADER_LEN + ESCROW_TARGET_LEN..HEADER_LEN + ESCROW_TARGET_LEN + 32],
            escrow.hashlock.as_slice()
        );

        assert_eq!(EscrowExtension::decode(&encoded).unwrap(), escrow);
    }

    #[test]
    fn test_escrow_extension_rejects_extra_fields() {
        let extension = escrow_extension()
            .to_extension()
            .unwrap()
            .with_field(ExtensionField::Predicate, vec![1u8]);
        assert!(matches!(
            EscrowExtension::from_extension(&extension),
            Err(CodecError::DecodeMismatch { field: "escrow_extension", .. })
        ));
    }

    #[test]
    fn test_escrow_extension_rejects_wrong_length() {
        let mut encoded = escrow_extension().encode().unwrap().to_vec();
        encoded.push(0);
        assert!(matches!(
            EscrowExtension::decode(&encoded),
            Err(CodecError::DecodeMismatch { field: "escrow_extension", .. })
        ));
    }

    #[test]
    fn test_deposits_packing() {
        let word = pack_deposits(U256::from(7u64), U256::from(9u64)).unwrap();
        assert_eq!(word, U256::from(9u64) << 128 | U256::from(7u64));
        assert_eq!(unpack_deposits(word), (U256::from(7u64), U256::from(9u64)));

        assert!(matches!(
            pack_deposits(U256::from(1u64) << 128, U256::ZERO),
            Err(CodecError::EncodingOverflow { field: "src_safety_deposit", bits: 128 })
        ));
    }

    fn field_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..48)
    }

    proptest! {
        #[test]
        fn prop_extension_round_trip(
            fields in prop::array::uniform8(field_bytes()),
            custom in field_bytes(),
        ) {
            let extension = ExtensionField::ALL
                .into_iter()
                .zip(fields)
                .fold(Extension::new(), |ext, (field, data)| ext.with_field(field, data))
                .with_custom_data(custom);

            let encoded = extension.encode().unwrap();
            prop_assert_eq!(Extension::decode(&encoded).unwrap(), extension);
        }
    }
}
