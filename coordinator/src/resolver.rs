//! Resolver lifecycle driver.
//!
//! A [`Resolver`] is one instance of the taker-side automation. Any number
//! of instances may share one coordination store; each step of a swap runs
//! under the swap's distributed lock, re-reads the record, performs the
//! chain action and commits the transition fenced by the lock.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use bridgemenot_common::{
    address_to_word, chrono_duration, BridgeError, ChainId, HolderId, Immutables, Result, Secret,
    SwapId, SwapPatch, SwapRecord, SwapStatus,
};
use bridgemenot_protocol::immutables::{dst_immutables, src_immutables, timelocks_of};
use bridgemenot_protocol::{escrow_address, Stage, SwapArtifact};

use crate::chain::{ChainReceipt, EscrowChain, EscrowSide, EscrowState};
use crate::config::ResolverConfig;
use crate::lock_manager::{Lease, LockManager};
use crate::metrics::{MetricsRecorder, Operation};
use crate::state::ResolverState;
use crate::store::KvStore;
use crate::swap_store::SwapStore;

/// One resolver instance.
pub struct Resolver {
    config: ResolverConfig,
    holder: HolderId,
    store: Arc<SwapStore>,
    locks: Arc<LockManager>,
    chain: Arc<dyn EscrowChain>,
    metrics: MetricsRecorder,
    state: Arc<RwLock<ResolverState>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Arc<RwLock<Option<mpsc::Receiver<()>>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// Create a resolver over a shared store and chain collaborator.
    pub fn new(
        config: ResolverConfig,
        kv: Arc<dyn KvStore>,
        chain: Arc<dyn EscrowChain>,
        metrics: MetricsRecorder,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let holder = config
            .instance_id
            .clone()
            .map(HolderId::new)
            .unwrap_or_else(HolderId::generate);

        let store = Arc::new(SwapStore::new(
            kv.clone(),
            config.store.clone(),
            metrics.clone(),
        ));
        let locks = Arc::new(LockManager::new(
            kv,
            holder.clone(),
            config.lock.clone(),
            config.store.retry.clone(),
            config.store.lock_audit_retention,
            metrics.clone(),
        ));

        Self {
            config,
            holder,
            store,
            locks,
            chain,
            metrics,
            state: Arc::new(RwLock::new(ResolverState::Starting)),
            shutdown_tx,
            shutdown_rx: Arc::new(RwLock::new(Some(shutdown_rx))),
            sweeper: Mutex::new(None),
        }
    }

    /// Start accepting work and spawn the expiry sweep.
    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn start(&self) -> Result<()> {
        info!("Starting resolver");

        let Some(shutdown_rx) = self.shutdown_rx.write().take() else {
            return Err(BridgeError::Configuration(
                "resolver cannot be restarted".to_string(),
            ));
        };
        let store = self.store.clone();
        let interval = self.config.store.expiry_sweep_interval;
        *self.sweeper.lock() = Some(tokio::spawn(run_expiry_sweep(store, interval, shutdown_rx)));

        *self.state.write() = ResolverState::Running;
        info!("Resolver started");
        Ok(())
    }

    /// Stop accepting work and wait for the sweep to finish.
    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping resolver");
        *self.state.write() = ResolverState::ShuttingDown;

        let _ = self.shutdown_tx.send(()).await;
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Expiry sweep did not stop in time");
            }
        }

        *self.state.write() = ResolverState::Stopped;
        info!("Resolver stopped");
        Ok(())
    }

    pub fn state(&self) -> ResolverState {
        *self.state.read()
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub fn store(&self) -> &Arc<SwapStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Record a maker's signed order and keep its secret.
    ///
    /// The record and its secret entry land in one transaction, so a
    /// hashlock is never visible to other instances without the secret
    /// behind it, and a failed commit can simply be retried.
    #[instrument(skip(self, artifact, secret), fields(swap_id = %artifact.hashlock))]
    pub async fn commit_order(&self, artifact: &SwapArtifact, secret: Secret) -> Result<SwapRecord> {
        self.ensure_running()?;
        let id = SwapId::new(artifact.hashlock);
        if !secret.opens(&artifact.hashlock) {
            return Err(invalid(id, "secret does not open the order hashlock"));
        }

        let escrow = artifact.validate(self.config.order_protocol)?;
        let params = artifact.swap_params(self.config.resolver_address)?;
        let immutables = src_immutables(
            &params,
            artifact.order_hash,
            artifact.order.maker,
            Address::ZERO,
            &escrow.timelocks,
        );
        let record = SwapRecord::new(
            id,
            params,
            immutables,
            chrono_duration(self.config.store.record_retention),
        )?;

        self.store.create_with_secret(&record, secret).await?;
        Ok(record)
    }

    /// Fill the order: anchor the timelocks and deploy the source escrow.
    pub async fn deploy_src_escrow(&self, id: SwapId) -> Result<SwapRecord> {
        self.drive(id, SwapStatus::SrcEscrowDeployed, |record| {
            self.src_deployment(record)
        })
        .await
    }

    /// Deploy the destination escrow with the resolver's tokens.
    pub async fn deploy_dst_escrow(&self, id: SwapId) -> Result<SwapRecord> {
        self.drive(id, SwapStatus::DstEscrowDeployed, |record| {
            self.dst_deployment(record)
        })
        .await
    }

    /// Withdraw on the destination chain, which publishes the secret.
    pub async fn reveal_secret(&self, id: SwapId) -> Result<SwapRecord> {
        self.drive(id, SwapStatus::SecretRevealed, |record| {
            self.dst_withdrawal(record)
        })
        .await
    }

    /// Withdraw on the source chain with the revealed secret.
    pub async fn complete(&self, id: SwapId) -> Result<SwapRecord> {
        self.drive(id, SwapStatus::Completed, |record| {
            self.src_withdrawal(record)
        })
        .await
    }

    /// Refund every deployed escrow once its cancellation window is open at `now`.
    pub async fn cancel(&self, id: SwapId, now: u64) -> Result<SwapRecord> {
        self.drive(id, SwapStatus::Cancelled, |record| {
            self.cancellation(record, now)
        })
        .await
    }

    /// Record an unrecoverable error.
    pub async fn fail(&self, id: SwapId, reason: impl Into<String>) -> Result<SwapRecord> {
        let reason = reason.into();
        self.drive(id, SwapStatus::Failed, move |_| {
            futures::future::ready(Ok(SwapPatch::new().with_reason(reason)))
        })
        .await
    }

    /// Drive one step from the current status.
    pub async fn advance(&self, id: SwapId) -> Result<SwapRecord> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(BridgeError::NotFound(id))?;
        match record.status {
            SwapStatus::Created => self.deploy_src_escrow(id).await,
            SwapStatus::SrcEscrowDeployed => self.deploy_dst_escrow(id).await,
            SwapStatus::DstEscrowDeployed => self.reveal_secret(id).await,
            SwapStatus::SecretRevealed => self.complete(id).await,
            SwapStatus::Completed | SwapStatus::Cancelled | SwapStatus::Failed => Ok(record),
        }
    }

    /// Every swap not yet settled, for recovery after a crash.
    pub async fn pending(&self) -> Result<Vec<SwapRecord>> {
        let mut pending = Vec::new();
        for status in SwapStatus::ALL.into_iter().filter(|s| s.is_in_progress()) {
            pending.extend(self.store.query_by_status(status).await?);
        }
        Ok(pending)
    }

    /// Run one lifecycle step under the swap lock.
    ///
    /// A step whose target status is already reached is a no-op. The lease
    /// is extended for as long as the chain action runs. A version conflict
    /// re-reads the record and re-applies the step's patch without repeating
    /// the chain action. A decode failure of stored escrow parameters fails
    /// the swap.
    async fn drive<F, Fut>(&self, id: SwapId, to: SwapStatus, step: F) -> Result<SwapRecord>
    where
        F: FnOnce(SwapRecord) -> Fut,
        Fut: Future<Output = Result<SwapPatch>>,
    {
        self.ensure_running()?;
        let started = Instant::now();
        let resource = id.lock_resource();
        let ttl = self.config.lock.default_ttl;

        let result = self
            .locks
            .with_lock(&resource, ttl, |mut lease| async move {
                let record = self
                    .store
                    .get(id)
                    .await?
                    .ok_or(BridgeError::NotFound(id))?;
                if record.status == to {
                    return Ok(record);
                }
                ensure_transition(&record, to)?;

                let mut version = record.version;
                let patch = match self.keep_alive(&mut lease, step(record)).await {
                    Ok(patch) => patch,
                    Err(e) if e.is_fatal_to_swap() => {
                        error!(swap_id = %id, error = %e, "Escrow parameters rejected, failing swap");
                        self.store
                            .transition(
                                &lease,
                                id,
                                version,
                                SwapStatus::Failed,
                                SwapPatch::new().with_reason(e.to_string()),
                            )
                            .await?;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };

                let mut attempt = 0;
                loop {
                    match self
                        .store
                        .transition(&lease, id, version, to, patch.clone())
                        .await
                    {
                        Err(e)
                            if matches!(e.root(), BridgeError::VersionConflict { .. })
                                && attempt < self.config.max_version_retries =>
                        {
                            attempt += 1;
                            warn!(swap_id = %id, attempt, "Version conflict, re-reading");
                            let current = self
                                .store
                                .get(id)
                                .await?
                                .ok_or(BridgeError::NotFound(id))?;
                            if current.status == to {
                                return Ok(current);
                            }
                            ensure_transition(&current, to)?;
                            version = current.version;
                        }
                        other => return other,
                    }
                }
            })
            .await
            .map_err(|e| e.in_transition(id, to));

        self.metrics.observe(Operation::Step(to), started, &result);
        result
    }

    /// Run `work` while extending `lease` every third of the lock TTL.
    async fn keep_alive<T>(
        &self,
        lease: &mut Lease,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let ttl = self.config.lock.default_ttl;
        let period = (ttl / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.locks.extend(lease, ttl).await {
                        warn!(resource = lease.resource(), error = %e, "Lost lease during chain action");
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn src_deployment(&self, record: SwapRecord) -> Result<SwapPatch> {
        let existing = self
            .existing_deployment(&record, EscrowSide::Src, |at| {
                self.src_escrow_immutables(&record, at)
            })
            .await?;
        let (receipt, immutables) = match existing {
            Some(found) => found,
            None => {
                let at = self.chain.now(record.params.src_chain_id).await?;
                let immutables = self.src_escrow_immutables(&record, at)?;
                (self.deploy(&record, EscrowSide::Src, &immutables).await?, immutables)
            }
        };
        Ok(SwapPatch::new()
            .with_immutables(immutables)
            .with_src_escrow(receipt.escrow)
            .with_tx_hash(receipt.tx_hash))
    }

    async fn dst_deployment(&self, record: SwapRecord) -> Result<SwapPatch> {
        let existing = self
            .existing_deployment(&record, EscrowSide::Dst, |at| {
                self.dst_escrow_immutables(&record, at)
            })
            .await?;
        let (receipt, immutables) = match existing {
            Some(found) => found,
            None => {
                let at = self.chain.now(record.params.dst_chain_id).await?;
                let immutables = self.dst_escrow_immutables(&record, at)?;
                (self.deploy(&record, EscrowSide::Dst, &immutables).await?, immutables)
            }
        };
        Ok(SwapPatch::new()
            .with_dst_immutables(immutables)
            .with_dst_escrow(receipt.escrow)
            .with_tx_hash(receipt.tx_hash))
    }

    /// Source escrow parameters with the resolver as taker, anchored at `deployed_at`.
    fn src_escrow_immutables(&self, record: &SwapRecord, deployed_at: u64) -> Result<Immutables> {
        let timelocks = timelocks_of(&record.immutables)?.with_deployed_at(deployed_at)?;
        Ok(Immutables {
            taker: address_to_word(self.config.resolver_address),
            timelocks: timelocks.encode(),
            ..record.immutables.clone()
        })
    }

    /// Destination escrow parameters anchored at `deployed_at`.
    fn dst_escrow_immutables(&self, record: &SwapRecord, deployed_at: u64) -> Result<Immutables> {
        let src = timelocks_of(&record.immutables)?;
        let timelocks = src.with_deployed_at(deployed_at)?;
        if timelocks.stage_start(Stage::DstCancellation) > src.stage_start(Stage::SrcCancellation) {
            return Err(invalid(
                record.id,
                "destination cancellation would open after source cancellation",
            ));
        }
        Ok(dst_immutables(
            &record.params,
            record.immutables.order_hash,
            self.config.resolver_address,
            &timelocks,
        ))
    }

    /// An escrow this swap already deployed on `side`, checked against the
    /// parameters `expected` derives from its on-chain anchor.
    async fn existing_deployment<E>(
        &self,
        record: &SwapRecord,
        side: EscrowSide,
        expected: E,
    ) -> Result<Option<(ChainReceipt, Immutables)>>
    where
        E: FnOnce(u64) -> Result<Immutables>,
    {
        let chain = chain_of(record, side);
        let Some(found) = self
            .chain
            .find_escrow(chain, side, record.immutables.order_hash)
            .await?
        else {
            return Ok(None);
        };

        let immutables = expected(timelocks_of(&found.immutables)?.deployed_at())?;
        let address = escrow_address(
            self.config.escrow_factory,
            self.config.proxy_bytecode_hash,
            &immutables,
        );
        if found.immutables != immutables || found.escrow != address {
            return Err(BridgeError::Chain(format!(
                "escrow {} on chain {chain} does not match swap {}",
                found.escrow, record.id
            )));
        }
        info!(swap_id = %record.id, ?side, escrow = %found.escrow, "Reusing escrow already on chain");
        Ok(Some((
            ChainReceipt {
                escrow: found.escrow,
                tx_hash: found.deploy_tx,
            },
            immutables,
        )))
    }

    /// Whether the escrow at `escrow` already reached `state`.
    async fn settled_on_chain(
        &self,
        record: &SwapRecord,
        side: EscrowSide,
        escrow: Address,
        state: EscrowState,
    ) -> Result<bool> {
        let found = self
            .chain
            .find_escrow(chain_of(record, side), side, record.immutables.order_hash)
            .await?;
        let settled = found.is_some_and(|found| found.escrow == escrow && found.state == state);
        if settled {
            info!(swap_id = %record.id, ?side, %escrow, ?state, "Escrow already settled on chain");
        }
        Ok(settled)
    }

    async fn deploy(
        &self,
        record: &SwapRecord,
        side: EscrowSide,
        immutables: &Immutables,
    ) -> Result<ChainReceipt> {
        let expected = escrow_address(
            self.config.escrow_factory,
            self.config.proxy_bytecode_hash,
            immutables,
        );
        let receipt = self
            .chain
            .deploy_escrow(chain_of(record, side), side, immutables)
            .await?;
        if receipt.escrow != expected {
            return Err(BridgeError::Chain(format!(
                "escrow deployed at {} but immutables derive {expected}",
                receipt.escrow
            )));
        }
        info!(swap_id = %record.id, ?side, escrow = %receipt.escrow, "Escrow deployed");
        Ok(receipt)
    }

    async fn dst_withdrawal(&self, record: SwapRecord) -> Result<SwapPatch> {
        let entry = self
            .store
            .secret(record.id)
            .await?
            .ok_or_else(|| invalid(record.id, "no secret entry"))?;
        let (escrow, immutables) = record
            .dst_escrow_address
            .zip(record.dst_immutables.as_ref())
            .ok_or_else(|| invalid(record.id, "destination escrow not recorded"))?;

        let patch = SwapPatch::new().with_secret(entry.secret);
        if self
            .settled_on_chain(&record, EscrowSide::Dst, escrow, EscrowState::Withdrawn)
            .await?
        {
            return Ok(patch);
        }
        let receipt = self
            .chain
            .withdraw(
                record.params.dst_chain_id,
                EscrowSide::Dst,
                escrow,
                &entry.secret,
                immutables,
            )
            .await?;
        Ok(patch.with_tx_hash(receipt.tx_hash))
    }

    async fn src_withdrawal(&self, record: SwapRecord) -> Result<SwapPatch> {
        let secret = record
            .secret
            .ok_or_else(|| invalid(record.id, "secret not revealed"))?;
        let escrow = record
            .src_escrow_address
            .ok_or_else(|| invalid(record.id, "source escrow not recorded"))?;
        if self
            .settled_on_chain(&record, EscrowSide::Src, escrow, EscrowState::Withdrawn)
            .await?
        {
            return Ok(SwapPatch::new());
        }

        let receipt = self
            .chain
            .withdraw(
                record.params.src_chain_id,
                EscrowSide::Src,
                escrow,
                &secret,
                &record.immutables,
            )
            .await?;
        Ok(SwapPatch::new().with_tx_hash(receipt.tx_hash))
    }

    async fn cancellation(&self, record: SwapRecord, now: u64) -> Result<SwapPatch> {
        let mut refunds = Vec::new();
        if record.status == SwapStatus::DstEscrowDeployed {
            if let Some((escrow, immutables)) = record
                .dst_escrow_address
                .zip(record.dst_immutables.as_ref())
            {
                refunds.push((EscrowSide::Dst, escrow, immutables, Stage::DstCancellation));
            }
        }
        if let Some(escrow) = record.src_escrow_address {
            refunds.push((EscrowSide::Src, escrow, &record.immutables, Stage::SrcCancellation));
        }

        // Check every window before touching any chain.
        for (side, _, immutables, stage) in &refunds {
            if !timelocks_of(immutables)?.is_open(*stage, now) {
                return Err(invalid(
                    record.id,
                    format!("{side:?} cancellation window not open at {now}"),
                ));
            }
        }

        let mut patch = SwapPatch::new().with_reason(format!("cancelled at {now}"));
        for (side, escrow, immutables, _) in refunds {
            if self
                .settled_on_chain(&record, side, escrow, EscrowState::Cancelled)
                .await?
            {
                continue;
            }
            let receipt = self
                .chain
                .cancel(chain_of(&record, side), side, escrow, immutables)
                .await?;
            patch = patch.with_tx_hash(receipt.tx_hash);
        }
        Ok(patch)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state.read().accepts_work() {
            Ok(())
        } else {
            Err(BridgeError::NotRunning)
        }
    }
}

fn chain_of(record: &SwapRecord, side: EscrowSide) -> ChainId {
    match side {
        EscrowSide::Src => record.params.src_chain_id,
        EscrowSide::Dst => record.params.dst_chain_id,
    }
}

fn ensure_transition(record: &SwapRecord, to: SwapStatus) -> Result<()> {
    if record.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(BridgeError::InvalidTransition {
            swap_id: record.id,
            from: record.status,
            to,
        })
    }
}

fn invalid(swap_id: SwapId, reason: impl Into<String>) -> BridgeError {
    BridgeError::InvalidPatch {
        swap_id,
        reason: reason.into(),
    }
}

async fn run_expiry_sweep(
    store: Arc<SwapStore>,
    interval: Duration,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.expire_stale().await {
                    warn!(error = %e, "Expiry sweep failed");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
