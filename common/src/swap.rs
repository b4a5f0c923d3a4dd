//! Swap record model and lifecycle state machine.

use std::fmt;

use crate::{now, BridgeError, ChainId, HolderId, Result, SwapId, Timestamp};
use alloy_primitives::{keccak256, Address, B256, U256};
use chrono::Duration;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Swap status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    /// Maker committed the order; nothing deployed yet.
    Created,
    /// Source-chain escrow deployment confirmed.
    SrcEscrowDeployed,
    /// Destination-chain escrow deployment confirmed.
    DstEscrowDeployed,
    /// Destination withdrawal confirmed; the secret is public.
    SecretRevealed,
    /// Source withdrawal with the revealed secret confirmed.
    Completed,
    /// Funds returned after a cancellation window opened.
    Cancelled,
    /// Unrecoverable error recorded with a reason.
    Failed,
}

impl SwapStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SwapStatus; 7] = [
        SwapStatus::Created,
        SwapStatus::SrcEscrowDeployed,
        SwapStatus::DstEscrowDeployed,
        SwapStatus::SecretRevealed,
        SwapStatus::Completed,
        SwapStatus::Cancelled,
        SwapStatus::Failed,
    ];

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Cancelled | SwapStatus::Failed
        )
    }

    /// Check if the swap is still in progress.
    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal()
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[SwapStatus] {
        match self {
            SwapStatus::Created => &[
                SwapStatus::SrcEscrowDeployed,
                SwapStatus::Cancelled,
                SwapStatus::Failed,
            ],
            SwapStatus::SrcEscrowDeployed => &[
                SwapStatus::DstEscrowDeployed,
                SwapStatus::Cancelled,
                SwapStatus::Failed,
            ],
            SwapStatus::DstEscrowDeployed => &[
                SwapStatus::SecretRevealed,
                SwapStatus::Cancelled,
                SwapStatus::Failed,
            ],
            SwapStatus::SecretRevealed => &[
                SwapStatus::Completed,
                SwapStatus::Cancelled,
                SwapStatus::Failed,
            ],
            SwapStatus::Completed | SwapStatus::Cancelled | SwapStatus::Failed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable name used in storage keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Created => "created",
            SwapStatus::SrcEscrowDeployed => "src_escrow_deployed",
            SwapStatus::DstEscrowDeployed => "dst_escrow_deployed",
            SwapStatus::SecretRevealed => "secret_revealed",
            SwapStatus::Completed => "completed",
            SwapStatus::Cancelled => "cancelled",
            SwapStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-level intent of a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapParams {
    pub src_chain_id: ChainId,
    pub dst_chain_id: ChainId,
    pub src_token: Address,
    pub dst_token: Address,
    pub src_amount: U256,
    pub dst_amount: U256,
    pub src_receiver: Address,
    pub dst_receiver: Address,
    pub hashlock: B256,
    /// Deposit posted by the source escrow deployer.
    pub src_safety_deposit: U256,
    /// Deposit posted by the destination escrow deployer.
    pub dst_safety_deposit: U256,
}

/// The exact tuple passed to an escrow contract.
///
/// Addresses are carried as 256-bit integers because that is how the escrow
/// ABI declares them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Immutables {
    pub order_hash: B256,
    pub hashlock: B256,
    pub maker: U256,
    pub taker: U256,
    pub token: U256,
    pub amount: U256,
    pub safety_deposit: U256,
    /// Packed timelock word.
    pub timelocks: U256,
}

impl Immutables {
    /// Maker as an address, if the word holds one.
    pub fn maker_address(&self) -> Option<Address> {
        word_to_address(self.maker)
    }

    /// Taker as an address, if the word holds one.
    pub fn taker_address(&self) -> Option<Address> {
        word_to_address(self.taker)
    }

    /// Token as an address, if the word holds one.
    pub fn token_address(&self) -> Option<Address> {
        word_to_address(self.token)
    }
}

/// Widen an address to the 256-bit integer the escrow ABI expects.
pub fn address_to_word(address: Address) -> U256 {
    U256::from_be_slice(address.as_slice())
}

/// Narrow a 256-bit integer back to an address; `None` if the high 96 bits are set.
pub fn word_to_address(word: U256) -> Option<Address> {
    if word.bit_len() > 160 {
        return None;
    }
    let bytes = word.to_be_bytes::<32>();
    Some(Address::from_slice(&bytes[12..]))
}

/// The 32-byte preimage of a hashlock.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(B256);

impl Secret {
    /// Wrap existing secret bytes.
    pub fn new(bytes: B256) -> Self {
        Self(bytes)
    }

    /// Draw a fresh secret from the thread RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(B256::from(bytes))
    }

    /// The hashlock committing to this secret.
    pub fn hashlock(&self) -> B256 {
        keccak256(self.0)
    }

    /// Check this secret opens the given hashlock.
    pub fn opens(&self, hashlock: &B256) -> bool {
        self.hashlock() == *hashlock
    }

    /// Get the secret bytes.
    pub fn as_b256(&self) -> &B256 {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Changes carried alongside a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapPatch {
    /// Filled source immutables, recorded on source deployment.
    pub immutables: Option<Immutables>,
    /// Destination immutables, recorded on destination deployment.
    pub dst_immutables: Option<Immutables>,
    pub src_escrow_address: Option<Address>,
    pub dst_escrow_address: Option<Address>,
    /// Revealed secret, recorded on destination withdrawal.
    pub secret: Option<Secret>,
    /// Reason for failure or cancellation.
    pub reason: Option<String>,
    /// Transaction that confirmed the transition.
    pub tx_hash: Option<B256>,
}

impl SwapPatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_immutables(mut self, immutables: Immutables) -> Self {
        self.immutables = Some(immutables);
        self
    }

    pub fn with_dst_immutables(mut self, immutables: Immutables) -> Self {
        self.dst_immutables = Some(immutables);
        self
    }

    pub fn with_src_escrow(mut self, address: Address) -> Self {
        self.src_escrow_address = Some(address);
        self
    }

    pub fn with_dst_escrow(mut self, address: Address) -> Self {
        self.dst_escrow_address = Some(address);
        self
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: B256) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }
}

/// One cross-chain swap attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    /// Hashlock or order hash.
    pub id: SwapId,
    /// Current status.
    pub status: SwapStatus,
    /// Human-level intent.
    pub params: SwapParams,
    /// Source escrow tuple.
    pub immutables: Immutables,
    /// Destination escrow tuple, once deployed.
    pub dst_immutables: Option<Immutables>,
    pub secret_revealed: bool,
    pub secret: Option<Secret>,
    pub src_escrow_address: Option<Address>,
    pub dst_escrow_address: Option<Address>,
    /// Why the swap failed or was cancelled.
    pub failure_reason: Option<String>,
    /// Optimistic concurrency version; starts at 1.
    pub version: u64,
    pub created_at: Timestamp,
    pub last_modified: Timestamp,
    /// Garbage collection horizon once terminal.
    pub expires_at: Timestamp,
}

impl SwapRecord {
    /// Create a new record in `Created`.
    ///
    /// The id must be the hashlock or the order hash, and the immutables must
    /// commit to the same hashlock as the params.
    pub fn new(
        id: SwapId,
        params: SwapParams,
        immutables: Immutables,
        retention: Duration,
    ) -> Result<Self> {
        if immutables.hashlock != params.hashlock {
            return Err(BridgeError::InvalidPatch {
                swap_id: id,
                reason: "immutables hashlock differs from params hashlock".to_string(),
            });
        }
        if *id.as_b256() != params.hashlock && *id.as_b256() != immutables.order_hash {
            return Err(BridgeError::InvalidPatch {
                swap_id: id,
                reason: "id must be the hashlock or the order hash".to_string(),
            });
        }

        let created_at = now();
        Ok(Self {
            id,
            status: SwapStatus::Created,
            params,
            immutables,
            dst_immutables: None,
            secret_revealed: false,
            secret: None,
            src_escrow_address: None,
            dst_escrow_address: None,
            failure_reason: None,
            version: 1,
            created_at,
            last_modified: created_at,
            expires_at: created_at + retention,
        })
    }

    /// The hashlock this swap is bound to.
    pub fn hashlock(&self) -> &B256 {
        &self.immutables.hashlock
    }

    /// Every address with a stake in this swap, deduplicated.
    pub fn counterparties(&self) -> Vec<Address> {
        let mut parties = Vec::with_capacity(4);
        let candidates = [
            self.immutables.maker_address(),
            self.immutables.taker_address(),
            Some(self.params.src_receiver),
            Some(self.params.dst_receiver),
        ];
        for address in candidates.into_iter().flatten() {
            if address != Address::ZERO && !parties.contains(&address) {
                parties.push(address);
            }
        }
        parties
    }

    /// Both chains this swap touches.
    pub fn chains(&self) -> Vec<ChainId> {
        if self.params.src_chain_id == self.params.dst_chain_id {
            vec![self.params.src_chain_id]
        } else {
            vec![self.params.src_chain_id, self.params.dst_chain_id]
        }
    }

    /// Eligible for garbage collection: terminal and past retention.
    pub fn is_collectable(&self, at: Timestamp) -> bool {
        self.status.is_terminal() && at > self.expires_at
    }

    /// Produce the successor record for a transition.
    ///
    /// `self` is left untouched; the returned record carries `version + 1`.
    pub fn apply(&self, to: SwapStatus, patch: &SwapPatch) -> Result<SwapRecord> {
        if !self.status.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition {
                swap_id: self.id,
                from: self.status,
                to,
            });
        }

        let mut next = self.clone();

        if let Some(immutables) = &patch.immutables {
            self.require(
                to == SwapStatus::SrcEscrowDeployed,
                "immutables are recorded on source deployment only",
            )?;
            self.require(immutables.hashlock == self.immutables.hashlock, "hashlock is immutable")?;
            next.immutables = immutables.clone();
        }
        if let Some(dst) = &patch.dst_immutables {
            self.require(
                to == SwapStatus::DstEscrowDeployed,
                "destination immutables are recorded on destination deployment only",
            )?;
            self.require(
                dst.hashlock == self.immutables.hashlock,
                "destination hashlock differs from source hashlock",
            )?;
            next.dst_immutables = Some(dst.clone());
        }
        if let Some(address) = patch.src_escrow_address {
            self.require(
                to == SwapStatus::SrcEscrowDeployed,
                "source escrow is recorded on source deployment only",
            )?;
            next.src_escrow_address = Some(address);
        }
        if let Some(address) = patch.dst_escrow_address {
            self.require(
                to == SwapStatus::DstEscrowDeployed,
                "destination escrow is recorded on destination deployment only",
            )?;
            next.dst_escrow_address = Some(address);
        }
        if let Some(secret) = patch.secret {
            self.require(to == SwapStatus::SecretRevealed, "secret is recorded on reveal only")?;
            self.require(
                secret.opens(&self.immutables.hashlock),
                "secret does not open the hashlock",
            )?;
            next.secret = Some(secret);
            next.secret_revealed = true;
        }

        match to {
            SwapStatus::SrcEscrowDeployed => {
                self.require(next.src_escrow_address.is_some(), "source escrow address missing")?;
            }
            SwapStatus::DstEscrowDeployed => {
                self.require(
                    next.dst_escrow_address.is_some(),
                    "destination escrow address missing",
                )?;
                self.require(next.dst_immutables.is_some(), "destination immutables missing")?;
            }
            SwapStatus::SecretRevealed => {
                self.require(next.secret.is_some(), "secret missing")?;
            }
            SwapStatus::Completed => {
                self.require(next.secret_revealed, "secret has not been revealed")?;
            }
            SwapStatus::Failed => {
                self.require(patch.reason.is_some(), "failure requires a reason")?;
                next.failure_reason = patch.reason.clone();
            }
            SwapStatus::Cancelled => {
                next.failure_reason = patch.reason.clone();
            }
            SwapStatus::Created => {}
        }

        next.status = to;
        next.version = self.version + 1;
        next.last_modified = now();
        if to.is_terminal() {
            // Retention restarts when the swap settles.
            next.expires_at = next.last_modified + (self.expires_at - self.created_at);
        }
        Ok(next)
    }

    fn require(&self, condition: bool, reason: &str) -> Result<()> {
        if condition {
            Ok(())
        } else {
            Err(BridgeError::InvalidPatch {
                swap_id: self.id,
                reason: reason.to_string(),
            })
        }
    }
}

/// Secret material for one swap, retained for audit until expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub order_id: SwapId,
    pub secret: Secret,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub revealed: bool,
    pub revealed_at: Option<Timestamp>,
}

impl SecretEntry {
    /// Create an unrevealed entry.
    pub fn new(order_id: SwapId, secret: Secret, retention: Duration) -> Self {
        let created_at = now();
        Self {
            order_id,
            secret,
            created_at,
            expires_at: created_at + retention,
            revealed: false,
            revealed_at: None,
        }
    }

    /// Mark as revealed; idempotent.
    pub fn mark_revealed(&mut self) {
        if !self.revealed {
            self.revealed = true;
            self.revealed_at = Some(now());
        }
    }
}

/// Immutable log entry written by every create and transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapEvent {
    pub swap_id: SwapId,
    /// Record version after this event.
    pub version: u64,
    /// `None` for the creation event.
    pub from: Option<SwapStatus>,
    pub to: SwapStatus,
    pub holder: Option<HolderId>,
    pub at: Timestamp,
    pub reason: Option<String>,
    pub tx_hash: Option<B256>,
}

impl SwapEvent {
    /// Creation event for a freshly committed record.
    pub fn created(record: &SwapRecord) -> Self {
        Self {
            swap_id: record.id,
            version: record.version,
            from: None,
            to: record.status,
            holder: None,
            at: record.created_at,
            reason: None,
            tx_hash: None,
        }
    }

    /// Transition event between two versions of a record.
    pub fn transition(
        before: &SwapRecord,
        after: &SwapRecord,
        holder: &HolderId,
        patch: &SwapPatch,
    ) -> Self {
        Self {
            swap_id: after.id,
            version: after.version,
            from: Some(before.status),
            to: after.status,
            holder: Some(holder.clone()),
            at: after.last_modified,
            reason: patch.reason.clone(),
            tx_hash: patch.tx_hash,
        }
    }
}
