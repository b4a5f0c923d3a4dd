//! Escrow immutables ABI and deterministic escrow addresses.
//!
//! The escrow factory deploys each escrow as a minimal proxy via CREATE2
//! with `keccak256(abi.encode(immutables))` as the salt, so anyone holding
//! the immutables can compute the escrow address before it exists.

use alloy_primitives::{keccak256, Address, B256};
use alloy_sol_types::{sol, SolValue};
use bridgemenot_common::{address_to_word, word_to_address, Immutables, SwapParams};

use crate::error::{CodecError, CodecResult};
use crate::timelocks::Timelocks;

/// Encoded size: eight static words.
pub const IMMUTABLES_LEN: usize = 8 * 32;

sol! {
    /// Escrow constructor arguments, in contract field order.
    #[derive(Debug, PartialEq, Eq)]
    struct EscrowImmutables {
        bytes32 orderHash;
        bytes32 hashlock;
        uint256 maker;
        uint256 taker;
        uint256 token;
        uint256 amount;
        uint256 safetyDeposit;
        uint256 timelocks;
    }
}

impl From<&Immutables> for EscrowImmutables {
    fn from(value: &Immutables) -> Self {
        Self {
            orderHash: value.order_hash,
            hashlock: value.hashlock,
            maker: value.maker,
            taker: value.taker,
            token: value.token,
            amount: value.amount,
            safetyDeposit: value.safety_deposit,
            timelocks: value.timelocks,
        }
    }
}

impl From<EscrowImmutables> for Immutables {
    fn from(value: EscrowImmutables) -> Self {
        Self {
            order_hash: value.orderHash,
            hashlock: value.hashlock,
            maker: value.maker,
            taker: value.taker,
            token: value.token,
            amount: value.amount,
            safety_deposit: value.safetyDeposit,
            timelocks: value.timelocks,
        }
    }
}

pub fn encode_immutables(immutables: &Immutables) -> Vec<u8> {
    EscrowImmutables::from(immutables).abi_encode()
}

/// Decode an immutables tuple, rejecting address words with high bits set
/// and timelocks the escrow would never honour.
pub fn decode_immutables(data: &[u8]) -> CodecResult<Immutables> {
    if data.len() != IMMUTABLES_LEN {
        return Err(CodecError::mismatch(
            "immutables",
            format!("{} bytes, expected {IMMUTABLES_LEN}", data.len()),
        ));
    }
    let decoded: Immutables = EscrowImmutables::abi_decode(data, true)
        .map_err(|e| CodecError::mismatch("immutables", e.to_string()))?
        .into();

    for (field, word) in [
        ("maker", decoded.maker),
        ("taker", decoded.taker),
        ("token", decoded.token),
    ] {
        if word_to_address(word).is_none() {
            return Err(CodecError::mismatch(field, "not an address"));
        }
    }
    timelocks_of(&decoded)?;
    Ok(decoded)
}

/// Decoded timelocks of an immutables tuple.
pub fn timelocks_of(immutables: &Immutables) -> CodecResult<Timelocks> {
    Timelocks::decode(immutables.timelocks)
}

/// `keccak256(abi.encode(immutables))`
pub fn immutables_hash(immutables: &Immutables) -> B256 {
    keccak256(encode_immutables(immutables))
}

/// CREATE2 address of the escrow for `immutables`.
pub fn escrow_address(
    factory: Address,
    proxy_bytecode_hash: B256,
    immutables: &Immutables,
) -> Address {
    factory.create2(immutables_hash(immutables), proxy_bytecode_hash)
}

/// Source escrow tuple: the maker's tokens, held for the taker.
pub fn src_immutables(
    params: &SwapParams,
    order_hash: B256,
    maker: Address,
    taker: Address,
    timelocks: &Timelocks,
) -> Immutables {
    Immutables {
        order_hash,
        hashlock: params.hashlock,
        maker: address_to_word(maker),
        taker: address_to_word(taker),
        token: address_to_word(params.src_token),
        amount: params.src_amount,
        safety_deposit: params.src_safety_deposit,
        timelocks: timelocks.encode(),
    }
}

/// Destination escrow tuple: the taker's tokens, held for the maker's receiver.
pub fn dst_immutables(
    params: &SwapParams,
    order_hash: B256,
    taker: Address,
    timelocks: &Timelocks,
) -> Immutables {
    Immutables {
        order_hash,
        hashlock: params.hashlock,
        maker: address_to_word(params.dst_receiver),
        taker: address_to_word(taker),
        token: address_to_word(params.dst_token),
        amount: params.dst_amount,
        safety_deposit: params.dst_safety_deposit,
        timelocks: timelocks.encode(),
    }
}
