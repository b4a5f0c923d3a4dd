//! Simulation controller.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::Context;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bridgemenot_common::{ChainId, Result, Secret, SwapId, SwapParams, SwapRecord, SwapStatus};
use bridgemenot_coordinator::metrics::{DailyRollup, TracingSink};
use bridgemenot_coordinator::{
    EscrowChain, MemoryChain, MemoryStore, MetricsAggregator, MetricsSnapshot, Resolver,
    ResolverConfig,
};
use bridgemenot_protocol::{EscrowOrder, MakerTraits, SwapArtifact};

use crate::scenario::{AssertCondition, Scenario, ScenarioStep};

/// Chain clock at simulation start.
const GENESIS: u64 = 1_700_000_000;
const SRC_CHAIN: ChainId = ChainId(1);
const DST_CHAIN: ChainId = ChainId(8453);
const MAX_DRIVE_ROUNDS: usize = 16;

/// Controls the simulation.
pub struct SimulationController {
    config: ResolverConfig,
    chain: Arc<MemoryChain>,
    /// Resolver instances sharing one store.
    resolvers: Vec<Arc<Resolver>>,
    crashed: Vec<bool>,
    /// Swaps committed so far.
    swaps: Vec<SwapId>,
    rng: StdRng,
    aggregator: Arc<MetricsAggregator>,
    metrics_task: Option<JoinHandle<()>>,
}

impl SimulationController {
    /// Start `instances` resolvers against one in-memory store and chain pair.
    pub async fn new(
        config: ResolverConfig,
        instances: usize,
        chain_latency: Duration,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        info!("Initializing simulation with {} resolver instances", instances);

        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let kv = Arc::new(MemoryStore::new());
        let chain = Arc::new(
            MemoryChain::new(config.escrow_factory, config.proxy_bytecode_hash, GENESIS)
                .with_latency(chain_latency),
        );
        let (recorder, aggregator, metrics_task) =
            MetricsAggregator::spawn(&config.metrics, Some(Arc::new(TracingSink)));

        let mut resolvers = Vec::with_capacity(instances);
        for i in 0..instances {
            let instance = ResolverConfig {
                instance_id: Some(format!("resolver-{i}")),
                ..config.clone()
            };
            let resolver = Resolver::new(instance, kv.clone(), chain.clone(), recorder.clone());
            resolver.start().await?;
            resolvers.push(Arc::new(resolver));
        }

        Ok(Self {
            config,
            chain,
            crashed: vec![false; instances],
            resolvers,
            swaps: Vec::new(),
            rng,
            aggregator,
            metrics_task,
        })
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::CommitOrders { count } => {
                for _ in 0..*count {
                    self.commit_order().await?;
                }
                info!("Committed {} orders", count);
            }
            ScenarioStep::Drive { until } => self.drive(*until).await?,
            ScenarioStep::AdvanceClock { seconds } => {
                info!("Advancing chain clocks by {}s", seconds);
                self.chain.advance_all(*seconds);
            }
            ScenarioStep::Crash {
                instance,
                lock_ttl_ms,
            } => self.crash(*instance, Duration::from_millis(*lock_ttl_ms)).await?,
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::CancelAll => self.cancel_all().await?,
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    async fn commit_order(&mut self) -> anyhow::Result<()> {
        let secret = Secret::new(B256::from(self.rng.gen::<[u8; 32]>()));
        let maker = Address::from(self.rng.gen::<[u8; 20]>());
        let amount = U256::from(self.rng.gen_range(1_000u64..1_000_000));
        let params = SwapParams {
            src_chain_id: SRC_CHAIN,
            dst_chain_id: DST_CHAIN,
            src_token: Address::repeat_byte(0x22),
            dst_token: Address::repeat_byte(0x33),
            src_amount: amount,
            dst_amount: amount * U256::from(995u64) / U256::from(1000u64),
            src_receiver: self.config.resolver_address,
            dst_receiver: maker,
            hashlock: secret.hashlock(),
            src_safety_deposit: U256::from(1_000u64),
            dst_safety_deposit: U256::from(1_000u64),
        };
        let salt = U256::from(self.rng.gen::<u64>()) << 160;
        let order = EscrowOrder::build(
            &params,
            maker,
            self.config.escrow_factory,
            self.config.timelocks,
            MakerTraits::default(),
            salt,
        )?;
        let artifact = SwapArtifact::new(
            &order,
            SRC_CHAIN,
            self.config.order_protocol,
            Bytes::from(vec![0x1b; 65]),
        );

        let record = self.leader()?.commit_order(&artifact, secret).await?;
        self.swaps.push(record.id);
        Ok(())
    }

    /// Race every running instance on each swap behind `until`.
    async fn drive(&mut self, until: SwapStatus) -> anyhow::Result<()> {
        let target = rank(until);
        for round in 1..=MAX_DRIVE_ROUNDS {
            let before = self.statuses().await?;
            let behind: Vec<(SwapId, SwapStatus)> = before
                .iter()
                .copied()
                .filter(|(_, status)| status.is_in_progress() && rank(*status) < target)
                .collect();
            if behind.is_empty() {
                return Ok(());
            }

            let attempts = self.running().flat_map(|resolver| {
                behind
                    .iter()
                    .map(move |(id, status)| step(resolver.clone(), *id, *status))
            });
            for result in join_all(attempts).await {
                if let Err(e) = result {
                    warn!(round, code = e.error_code(), error = %e, "Step failed");
                }
            }

            if self.statuses().await? == before {
                warn!(round, until = %until, "Drive made no progress");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Grab every pending swap lock on `instance`, then stop it without releasing.
    async fn crash(&mut self, instance: usize, lock_ttl: Duration) -> anyhow::Result<()> {
        let resolver = self
            .resolvers
            .get(instance)
            .cloned()
            .with_context(|| format!("no resolver instance {instance}"))?;

        let mut held = 0;
        for (id, status) in self.statuses().await? {
            if status.is_in_progress()
                && resolver
                    .locks()
                    .acquire(&id.lock_resource(), lock_ttl, 0)
                    .await?
                    .is_some()
            {
                held += 1;
            }
        }

        resolver.stop().await?;
        self.crashed[instance] = true;
        warn!(holder = %resolver.holder(), held, "Resolver crashed holding locks");
        Ok(())
    }

    async fn cancel_all(&mut self) -> anyhow::Result<()> {
        let resolver = self.leader()?;
        for (id, status) in self.statuses().await? {
            if !status.is_in_progress() {
                continue;
            }
            let now = self.chain.now(SRC_CHAIN).await?;
            if let Err(e) = resolver.cancel(id, now).await {
                warn!(swap_id = %id, code = e.error_code(), error = %e, "Cancellation failed");
            }
        }
        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::StatusCount { status, count } => {
                let actual = self
                    .statuses()
                    .await?
                    .into_iter()
                    .filter(|(_, s)| s == status)
                    .count();
                anyhow::ensure!(
                    actual == *count,
                    "expected {count} swaps in {status}, found {actual}"
                );
            }
            AssertCondition::Deployments { count } => {
                let actual = self.chain.deployments();
                anyhow::ensure!(
                    actual == *count,
                    "expected {count} escrow deployments, found {actual}"
                );
            }
        }
        info!("Assertion held: {:?}", condition);
        Ok(())
    }

    /// Current status of every committed swap, in commit order.
    async fn statuses(&self) -> anyhow::Result<Vec<(SwapId, SwapStatus)>> {
        let store = self.leader()?.store().clone();
        let mut statuses = Vec::with_capacity(self.swaps.len());
        for id in &self.swaps {
            let record = store
                .get(*id)
                .await?
                .with_context(|| format!("swap {id} vanished"))?;
            statuses.push((*id, record.status));
        }
        Ok(statuses)
    }

    fn running(&self) -> impl Iterator<Item = &Arc<Resolver>> {
        self.resolvers
            .iter()
            .zip(&self.crashed)
            .filter(|(_, crashed)| !**crashed)
            .map(|(resolver, _)| resolver)
    }

    fn leader(&self) -> anyhow::Result<Arc<Resolver>> {
        self.running()
            .next()
            .cloned()
            .context("every resolver instance has crashed")
    }

    /// Stop every instance and wait for the metrics pipeline to drain.
    ///
    /// Returns the counters and the per-operation daily rollups.
    pub async fn shutdown(mut self) -> anyhow::Result<(MetricsSnapshot, Vec<DailyRollup>)> {
        for resolver in self.running() {
            resolver.stop().await?;
        }
        self.resolvers.clear();

        if let Some(handle) = self.metrics_task.take() {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .context("metrics aggregator did not drain")??;
        }
        Ok((self.aggregator.snapshot(), self.aggregator.rollups()))
    }
}

/// Position in the happy-path lifecycle.
fn rank(status: SwapStatus) -> usize {
    SwapStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or(usize::MAX)
}

async fn step(resolver: Arc<Resolver>, id: SwapId, status: SwapStatus) -> Result<SwapRecord> {
    match status {
        SwapStatus::Created => resolver.deploy_src_escrow(id).await,
        SwapStatus::SrcEscrowDeployed => resolver.deploy_dst_escrow(id).await,
        SwapStatus::DstEscrowDeployed => resolver.reveal_secret(id).await,
        _ => resolver.complete(id).await,
    }
}
