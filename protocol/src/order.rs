//! Limit orders and their EIP-712 hash.

use std::borrow::Cow;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{sol, Eip712Domain, SolStruct};
use bridgemenot_common::{ChainId, SwapParams};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::extension::EscrowExtension;
use crate::packing::mask;
use crate::timelocks::{TimelockDelays, Timelocks};
use crate::traits::MakerTraits;

pub const DOMAIN_NAME: &str = "Bridge-Me-Not Orders";
pub const DOMAIN_VERSION: &str = "1";

/// Low salt bits that commit to the extension hash.
const SALT_EXTENSION_BITS: usize = 160;

sol! {
    /// A limit order as signed by the maker.
    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Order {
        uint256 salt;
        address maker;
        address receiver;
        address makerAsset;
        address takerAsset;
        uint256 makingAmount;
        uint256 takingAmount;
        uint256 makerTraits;
    }
}

/// Typed-data domain of the order protocol deployed at `verifying_contract`.
pub fn order_domain(chain_id: ChainId, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Borrowed(DOMAIN_NAME)),
        Some(Cow::Borrowed(DOMAIN_VERSION)),
        Some(U256::from(chain_id.0)),
        Some(verifying_contract),
        None,
    )
}

fn extension_commitment(extension: &[u8]) -> U256 {
    U256::from_be_bytes(keccak256(extension).0) & mask(SALT_EXTENSION_BITS)
}

impl Order {
    /// The digest the maker signs.
    pub fn hash(&self, chain_id: ChainId, verifying_contract: Address) -> B256 {
        self.eip712_signing_hash(&order_domain(chain_id, verifying_contract))
    }

    pub fn traits(&self) -> CodecResult<MakerTraits> {
        MakerTraits::decode(self.makerTraits)
    }

    /// Who receives the taker asset; the maker when unset.
    pub fn receiver_or_maker(&self) -> Address {
        if self.receiver.is_zero() {
            self.maker
        } else {
            self.receiver
        }
    }

    /// Replace the low salt bits with the extension commitment.
    pub fn with_extension_salt(mut self, extension: &[u8]) -> Self {
        let high = self.salt & !mask(SALT_EXTENSION_BITS);
        self.salt = high | extension_commitment(extension);
        self
    }

    /// Check the extension against the maker traits and the salt.
    pub fn validate_extension(&self, extension: &[u8]) -> CodecResult<()> {
        let traits = self.traits()?;

        if !traits.has_extension {
            if extension.is_empty() {
                return Ok(());
            }
            return Err(CodecError::mismatch(
                "extension",
                "order carries an extension but its traits do not declare one",
            ));
        }
        if extension.is_empty() {
            return Err(CodecError::mismatch(
                "extension",
                "order traits declare an extension but none is attached",
            ));
        }
        if self.salt & mask(SALT_EXTENSION_BITS) != extension_commitment(extension) {
            return Err(CodecError::mismatch(
                "salt",
                "low 160 bits do not commit to the extension",
            ));
        }
        Ok(())
    }
}

/// Everything a maker signs and publishes for one cross-chain swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowOrder {
    pub order: Order,
    pub extension: Bytes,
    pub escrow: EscrowExtension,
}

impl EscrowOrder {
    /// Build the source-chain order for `params`.
    ///
    /// The extension, post-interaction and multiple-fill flags are forced on
    /// top of `traits`; the low bits of `salt` are replaced by the extension
    /// commitment.
    pub fn build(
        params: &SwapParams,
        maker: Address,
        factory: Address,
        delays: TimelockDelays,
        traits: MakerTraits,
        salt: U256,
    ) -> CodecResult<Self> {
        let escrow = EscrowExtension {
            factory,
            hashlock: params.hashlock,
            dst_chain_id: params.dst_chain_id,
            dst_token: params.dst_token,
            src_safety_deposit: params.src_safety_deposit,
            dst_safety_deposit: params.dst_safety_deposit,
            timelocks: Timelocks::undeployed(delays)?,
        };
        let extension = escrow.encode()?;

        let traits = MakerTraits {
            has_extension: true,
            post_interaction: true,
            allow_multiple_fills: true,
            ..traits
        };

        let order = Order {
            salt,
            maker,
            receiver: params.dst_receiver,
            makerAsset: params.src_token,
            takerAsset: params.dst_token,
            makingAmount: params.src_amount,
            takingAmount: params.dst_amount,
            makerTraits: traits.encode()?,
        }
        .with_extension_salt(&extension);

        Ok(Self {
            order,
            extension,
            escrow,
        })
    }

    pub fn hash(&self, chain_id: ChainId, verifying_contract: Address) -> B256 {
        self.order.hash(chain_id, verifying_contract)
    }
}
