//! Persisted per-swap artifact.
//!
//! Makers publish one JSON document per swap, keyed by hashlock, carrying
//! the signed order and its extension. Resolvers load it to fill the order
//! and to rebuild the swap parameters.

use alloy_primitives::{Address, Bytes, B256, U256};
use bridgemenot_common::{ChainId, SwapParams};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::extension::EscrowExtension;
use crate::order::{EscrowOrder, Order};
use crate::traits::TakerTraits;

/// Accepted signature encodings: compact (r, vs) or full (r, s, v).
const SIGNATURE_LENS: [usize; 2] = [64, 65];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapArtifact {
    pub hashlock: B256,
    pub order_hash: B256,
    pub src_chain_id: ChainId,
    pub dst_chain_id: ChainId,
    pub order: Order,
    pub signature: Bytes,
    pub extension: Bytes,
    /// Taker traits word the fill will be submitted with; derived from the
    /// extension when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_traits: Option<U256>,
}

impl SwapArtifact {
    pub fn new(
        escrow_order: &EscrowOrder,
        src_chain_id: ChainId,
        verifying_contract: Address,
        signature: Bytes,
    ) -> Self {
        Self {
            hashlock: escrow_order.escrow.hashlock,
            order_hash: escrow_order.hash(src_chain_id, verifying_contract),
            src_chain_id,
            dst_chain_id: escrow_order.escrow.dst_chain_id,
            order: escrow_order.order.clone(),
            signature,
            extension: escrow_order.extension.clone(),
            taker_traits: None,
        }
    }

    /// Storage key: the 0x-prefixed hashlock.
    pub fn key(&self) -> String {
        self.hashlock.to_string()
    }

    pub fn from_json(json: &str) -> CodecResult<Self> {
        serde_json::from_str(json).map_err(|e| CodecError::Artifact(e.to_string()))
    }

    pub fn to_json(&self) -> CodecResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| CodecError::Artifact(e.to_string()))
    }

    pub fn escrow_extension(&self) -> CodecResult<EscrowExtension> {
        EscrowExtension::decode(&self.extension)
    }

    /// Taker traits for the fill, checked against the extension it carries.
    pub fn taker_traits(&self) -> CodecResult<TakerTraits> {
        match self.taker_traits {
            Some(word) => {
                let traits = TakerTraits::decode(word)?;
                traits.validate_extension(&self.extension)?;
                Ok(traits)
            }
            None => TakerTraits::for_extension(&self.extension),
        }
    }

    /// Cross-check every redundant field against the order and extension.
    pub fn validate(&self, verifying_contract: Address) -> CodecResult<EscrowExtension> {
        self.taker_traits()?;
        if !SIGNATURE_LENS.contains(&self.signature.len()) {
            return Err(CodecError::mismatch(
                "signature",
                format!("{} bytes", self.signature.len()),
            ));
        }

        self.order.validate_extension(&self.extension)?;
        if !self.order.traits()?.post_interaction {
            return Err(CodecError::mismatch(
                "maker_traits",
                "escrow orders require the post-interaction flag",
            ));
        }

        let escrow = self.escrow_extension()?;
        if escrow.hashlock != self.hashlock {
            return Err(CodecError::mismatch(
                "hashlock",
                format!("artifact {} but extension {}", self.hashlock, escrow.hashlock),
            ));
        }
        if escrow.dst_chain_id != self.dst_chain_id {
            return Err(CodecError::mismatch(
                "dst_chain_id",
                format!(
                    "artifact {} but extension {}",
                    self.dst_chain_id, escrow.dst_chain_id
                ),
            ));
        }

        let order_hash = self.order.hash(self.src_chain_id, verifying_contract);
        if order_hash != self.order_hash {
            return Err(CodecError::mismatch(
                "order_hash",
                format!("artifact {} but order hashes to {order_hash}", self.order_hash),
            ));
        }
        Ok(escrow)
    }

    /// Swap parameters for a resolver filling as `taker`.
    pub fn swap_params(&self, taker: Address) -> CodecResult<SwapParams> {
        let escrow = self.escrow_extension()?;
        Ok(SwapParams {
            src_chain_id: self.src_chain_id,
            dst_chain_id: self.dst_chain_id,
            src_token: self.order.makerAsset,
            dst_token: escrow.dst_token,
            src_amount: self.order.makingAmount,
            dst_amount: self.order.takingAmount,
            src_receiver: taker,
            dst_receiver: self.order.receiver_or_maker(),
            hashlock: self.hashlock,
            src_safety_deposit: escrow.src_safety_deposit,
            dst_safety_deposit: escrow.dst_safety_deposit,
        })
    }
}
