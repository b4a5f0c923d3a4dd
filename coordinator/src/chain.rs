//! Chain collaborator: escrow deployment, withdrawal and cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use bridgemenot_common::{BridgeError, ChainId, Immutables, Result, Secret};
use bridgemenot_protocol::immutables::timelocks_of;
use bridgemenot_protocol::{escrow_address, Stage};

/// Which leg of a swap an escrow holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowSide {
    Src,
    Dst,
}

impl EscrowSide {
    fn withdrawal_stages(self) -> [Stage; 2] {
        match self {
            EscrowSide::Src => [Stage::SrcWithdrawal, Stage::SrcPublicWithdrawal],
            EscrowSide::Dst => [Stage::DstWithdrawal, Stage::DstPublicWithdrawal],
        }
    }

    fn cancellation_stages(self) -> &'static [Stage] {
        match self {
            EscrowSide::Src => &[Stage::SrcCancellation, Stage::SrcPublicCancellation],
            EscrowSide::Dst => &[Stage::DstCancellation],
        }
    }
}

/// Confirmation of an on-chain action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub escrow: Address,
    pub tx_hash: B256,
}

/// An escrow as the factory reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedEscrow {
    pub escrow: Address,
    pub immutables: Immutables,
    pub state: EscrowState,
    /// Transaction that deployed the escrow.
    pub deploy_tx: B256,
}

/// Escrow operations on the chains a resolver serves.
///
/// Implementations submit and confirm transactions; a returned receipt means
/// the action is final.
#[async_trait]
pub trait EscrowChain: Send + Sync {
    /// Latest block timestamp of `chain`, in Unix seconds.
    async fn now(&self, chain: ChainId) -> Result<u64>;

    /// The `side` escrow deployed on `chain` for `order_hash`, if any.
    ///
    /// Lets a resolver pick up an action that landed on chain before its
    /// transition was recorded.
    async fn find_escrow(
        &self,
        chain: ChainId,
        side: EscrowSide,
        order_hash: B256,
    ) -> Result<Option<DeployedEscrow>>;

    async fn deploy_escrow(
        &self,
        chain: ChainId,
        side: EscrowSide,
        immutables: &Immutables,
    ) -> Result<ChainReceipt>;

    async fn withdraw(
        &self,
        chain: ChainId,
        side: EscrowSide,
        escrow: Address,
        secret: &Secret,
        immutables: &Immutables,
    ) -> Result<ChainReceipt>;

    async fn cancel(
        &self,
        chain: ChainId,
        side: EscrowSide,
        escrow: Address,
        immutables: &Immutables,
    ) -> Result<ChainReceipt>;
}

/// Lifecycle state of a deployed escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowState {
    Active,
    Withdrawn,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Escrow {
    side: EscrowSide,
    immutables: Immutables,
    state: EscrowState,
    deploy_tx: B256,
}

/// In-process chains with manual clocks, enforcing the escrow rules the
/// contracts enforce: CREATE2 addresses, hashlock and timelock windows.
pub struct MemoryChain {
    factory: Address,
    proxy_bytecode_hash: B256,
    /// Clock of any chain not touched yet.
    genesis: AtomicU64,
    clocks: DashMap<ChainId, u64>,
    escrows: DashMap<(ChainId, Address), Escrow>,
    deployments: AtomicU64,
    nonce: AtomicU64,
    latency: Duration,
}

impl MemoryChain {
    pub fn new(factory: Address, proxy_bytecode_hash: B256, genesis: u64) -> Self {
        Self {
            factory,
            proxy_bytecode_hash,
            genesis: AtomicU64::new(genesis),
            clocks: DashMap::new(),
            escrows: DashMap::new(),
            deployments: AtomicU64::new(0),
            nonce: AtomicU64::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Delay every transaction by `latency` to widen race windows.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Move the clock of `chain` forward.
    pub fn advance(&self, chain: ChainId, secs: u64) {
        let genesis = self.genesis.load(Ordering::SeqCst);
        *self.clocks.entry(chain).or_insert(genesis) += secs;
    }

    /// Move every clock forward.
    pub fn advance_all(&self, secs: u64) {
        self.genesis.fetch_add(secs, Ordering::SeqCst);
        for mut clock in self.clocks.iter_mut() {
            *clock.value_mut() += secs;
        }
    }

    /// Escrows deployed so far, across all chains.
    pub fn deployments(&self) -> u64 {
        self.deployments.load(Ordering::SeqCst)
    }

    pub fn escrow_state(&self, chain: ChainId, escrow: Address) -> Option<EscrowState> {
        self.escrows.get(&(chain, escrow)).map(|e| e.state)
    }

    fn clock(&self, chain: ChainId) -> u64 {
        let genesis = self.genesis.load(Ordering::SeqCst);
        *self.clocks.entry(chain).or_insert(genesis)
    }

    async fn confirm(&self) -> B256 {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        keccak256(nonce.to_be_bytes())
    }

    /// Settle an active escrow if one of `stages` is open.
    async fn settle(
        &self,
        chain: ChainId,
        side: EscrowSide,
        escrow: Address,
        immutables: &Immutables,
        stages: &[Stage],
        to: EscrowState,
    ) -> Result<ChainReceipt> {
        let now = self.clock(chain);
        {
            let stored = self
                .escrows
                .get(&(chain, escrow))
                .ok_or_else(|| BridgeError::Chain(format!("no escrow at {escrow} on chain {chain}")))?;
            if stored.side != side || stored.immutables != *immutables {
                return Err(BridgeError::Chain("immutables do not match escrow".into()));
            }
            if stored.state != EscrowState::Active {
                return Err(BridgeError::Chain(format!("escrow already {:?}", stored.state)));
            }
            let timelocks = timelocks_of(immutables)?;
            if !stages.iter().any(|stage| timelocks.is_open(*stage, now)) {
                return Err(BridgeError::Chain(format!(
                    "no {to:?} window open at {now} on chain {chain}"
                )));
            }
        }

        let tx_hash = self.confirm().await;
        let mut stored = self
            .escrows
            .get_mut(&(chain, escrow))
            .ok_or_else(|| BridgeError::Chain(format!("no escrow at {escrow}")))?;
        if stored.state != EscrowState::Active {
            return Err(BridgeError::Chain(format!("escrow already {:?}", stored.state)));
        }
        stored.state = to;
        debug!(%escrow, %chain, state = ?to, "Escrow settled");
        Ok(ChainReceipt { escrow, tx_hash })
    }
}

#[async_trait]
impl EscrowChain for MemoryChain {
    async fn now(&self, chain: ChainId) -> Result<u64> {
        Ok(self.clock(chain))
    }

    async fn find_escrow(
        &self,
        chain: ChainId,
        side: EscrowSide,
        order_hash: B256,
    ) -> Result<Option<DeployedEscrow>> {
        Ok(self
            .escrows
            .iter()
            .find(|entry| {
                let (on, _) = entry.key();
                *on == chain
                    && entry.side == side
                    && entry.immutables.order_hash == order_hash
            })
            .map(|entry| DeployedEscrow {
                escrow: entry.key().1,
                immutables: entry.immutables.clone(),
                state: entry.state,
                deploy_tx: entry.deploy_tx,
            }))
    }

    async fn deploy_escrow(
        &self,
        chain: ChainId,
        side: EscrowSide,
        immutables: &Immutables,
    ) -> Result<ChainReceipt> {
        let timelocks = timelocks_of(immutables)?;
        if timelocks.deployed_at() != self.clock(chain) {
            return Err(BridgeError::Chain(format!(
                "timelocks anchored at {} but chain {chain} is at {}",
                timelocks.deployed_at(),
                self.clock(chain)
            )));
        }

        let escrow = escrow_address(self.factory, self.proxy_bytecode_hash, immutables);
        let tx_hash = self.confirm().await;
        let inserted = match self.escrows.entry((chain, escrow)) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Escrow {
                    side,
                    immutables: immutables.clone(),
                    state: EscrowState::Active,
                    deploy_tx: tx_hash,
                });
                true
            }
        };
        if !inserted {
            return Err(BridgeError::Chain(format!("escrow {escrow} already deployed")));
        }

        self.deployments.fetch_add(1, Ordering::SeqCst);
        debug!(%escrow, %chain, ?side, "Escrow deployed");
        Ok(ChainReceipt { escrow, tx_hash })
    }

    async fn withdraw(
        &self,
        chain: ChainId,
        side: EscrowSide,
        escrow: Address,
        secret: &Secret,
        immutables: &Immutables,
    ) -> Result<ChainReceipt> {
        if !secret.opens(&immutables.hashlock) {
            return Err(BridgeError::Chain("secret does not open hashlock".into()));
        }
        self.settle(
            chain,
            side,
            escrow,
            immutables,
            &side.withdrawal_stages(),
            EscrowState::Withdrawn,
        )
        .await
    }

    async fn cancel(
        &self,
        chain: ChainId,
        side: EscrowSide,
        escrow: Address,
        immutables: &Immutables,
    ) -> Result<ChainReceipt> {
        self.settle(
            chain,
            side,
            escrow,
            immutables,
            side.cancellation_stages(),
            EscrowState::Cancelled,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use bridgemenot_protocol::{TimelockDelays, Timelocks};

    const GENESIS: u64 = 1_700_000_000;

    fn chain() -> MemoryChain {
        MemoryChain::new(Address::repeat_byte(0xfa), B256::repeat_byte(0xbc), GENESIS)
    }

    fn immutables(secret: &Secret, deployed_at: u64) -> Immutables {
        Immutables {
            order_hash: B256::repeat_byte(1),
            hashlock: secret.hashlock(),
            maker: U256::from(1u64),
            taker: U256::from(2u64),
            token: U256::from(3u64),
            amount: U256::from(10u64),
            safety_deposit: U256::from(1u64),
            timelocks: Timelocks::new(deployed_at, TimelockDelays::default())
                .unwrap()
                .encode(),
        }
    }

    #[tokio::test]
    async fn test_deploy_is_create2_and_unique() {
        let chain = chain();
        let secret = Secret::generate();
        let immutables = immutables(&secret, GENESIS);

        let receipt = chain
            .deploy_escrow(ChainId(1), EscrowSide::Src, &immutables)
            .await
            .unwrap();
        assert_eq!(
            receipt.escrow,
            escrow_address(Address::repeat_byte(0xfa), B256::repeat_byte(0xbc), &immutables)
        );
        assert!(chain
            .deploy_escrow(ChainId(1), EscrowSide::Src, &immutables)
            .await
            .is_err());
        assert_eq!(chain.deployments(), 1);
    }

    #[tokio::test]
    async fn test_find_escrow_by_order_and_side() {
        let chain = chain();
        let secret = Secret::generate();
        let immutables = immutables(&secret, GENESIS);
        let receipt = chain
            .deploy_escrow(ChainId(1), EscrowSide::Src, &immutables)
            .await
            .unwrap();

        let found = chain
            .find_escrow(ChainId(1), EscrowSide::Src, immutables.order_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.escrow, receipt.escrow);
        assert_eq!(found.deploy_tx, receipt.tx_hash);
        assert_eq!(found.state, EscrowState::Active);

        assert!(chain
            .find_escrow(ChainId(1), EscrowSide::Dst, immutables.order_hash)
            .await
            .unwrap()
            .is_none());
        assert!(chain
            .find_escrow(ChainId(10), EscrowSide::Src, immutables.order_hash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deploy_rejects_wrong_anchor() {
        let chain = chain();
        let immutables = immutables(&Secret::generate(), GENESIS - 5);
        assert!(chain
            .deploy_escrow(ChainId(1), EscrowSide::Src, &immutables)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_withdrawal_window_and_secret() {
        let chain = chain();
        let secret = Secret::generate();
        let immutables = immutables(&secret, GENESIS);
        let escrow = chain
            .deploy_escrow(ChainId(10), EscrowSide::Dst, &immutables)
            .await
            .unwrap()
            .escrow;

        // Before the finality lock.
        assert!(chain
            .withdraw(ChainId(10), EscrowSide::Dst, escrow, &secret, &immutables)
            .await
            .is_err());

        chain.advance(ChainId(10), 20);
        assert!(chain
            .withdraw(ChainId(10), EscrowSide::Dst, escrow, &Secret::generate(), &immutables)
            .await
            .is_err());
        chain
            .withdraw(ChainId(10), EscrowSide::Dst, escrow, &secret, &immutables)
            .await
            .unwrap();
        assert_eq!(
            chain.escrow_state(ChainId(10), escrow),
            Some(EscrowState::Withdrawn)
        );
        assert!(chain
            .cancel(ChainId(10), EscrowSide::Dst, escrow, &immutables)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_needs_open_window() {
        let chain = chain();
        let immutables = immutables(&Secret::generate(), GENESIS);
        let escrow = chain
            .deploy_escrow(ChainId(1), EscrowSide::Src, &immutables)
            .await
            .unwrap()
            .escrow;

        assert!(chain
            .cancel(ChainId(1), EscrowSide::Src, escrow, &immutables)
            .await
            .is_err());
        chain.advance(ChainId(1), 600);
        chain
            .cancel(ChainId(1), EscrowSide::Src, escrow, &immutables)
            .await
            .unwrap();
        assert_eq!(
            chain.escrow_state(ChainId(1), escrow),
            Some(EscrowState::Cancelled)
        );
    }
}
