//! Several resolver instances racing over one shared store.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{address, Address, Bytes, B256, U256};
use futures::future::join_all;

use bridgemenot_common::{BridgeError, ChainId, HolderId, Secret, SwapId, SwapParams, SwapStatus};
use bridgemenot_coordinator::{
    KvStore, LockConfig, LockManager, MemoryChain, MemoryStore, MetricsRecorder, Resolver,
    ResolverConfig, RetryConfig,
};
use bridgemenot_protocol::{EscrowOrder, MakerTraits, SwapArtifact, TimelockDelays};

const GENESIS: u64 = 1_700_000_000;
const FACTORY: Address = address!("a7bcb4eac8964306f9e3764f67db6a7af6ddf99a");
const ORDER_PROTOCOL: Address = address!("111111125421ca6dc452d289314280a0f8842a65");
const RESOLVER: Address = address!("00000000000000000000000000000000000000dd");
const MAKER: Address = address!("00000000000000000000000000000000000000cc");

fn artifact(secret: &Secret) -> SwapArtifact {
    let params = SwapParams {
        src_chain_id: ChainId(1),
        dst_chain_id: ChainId(10),
        src_token: Address::repeat_byte(0x22),
        dst_token: Address::repeat_byte(0x33),
        src_amount: U256::from(10_000u64),
        dst_amount: U256::from(9_950u64),
        src_receiver: RESOLVER,
        dst_receiver: MAKER,
        hashlock: secret.hashlock(),
        src_safety_deposit: U256::from(10u64),
        dst_safety_deposit: U256::from(10u64),
    };
    let order = EscrowOrder::build(
        &params,
        MAKER,
        FACTORY,
        TimelockDelays::default(),
        MakerTraits::default(),
        U256::from(7u64) << 200,
    )
    .unwrap();
    SwapArtifact::new(&order, ChainId(1), ORDER_PROTOCOL, Bytes::from(vec![0x1b; 65]))
}

async fn cluster(instances: usize, latency: Duration) -> (Vec<Arc<Resolver>>, Arc<MemoryChain>) {
    cluster_with_ttl(instances, latency, LockConfig::default().default_ttl).await
}

async fn cluster_with_ttl(
    instances: usize,
    latency: Duration,
    lock_ttl: Duration,
) -> (Vec<Arc<Resolver>>, Arc<MemoryChain>) {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let chain = Arc::new(
        MemoryChain::new(FACTORY, B256::repeat_byte(0xbc), GENESIS).with_latency(latency),
    );

    let mut resolvers = Vec::new();
    for i in 0..instances {
        let config = ResolverConfig {
            instance_id: Some(format!("resolver-{i}")),
            resolver_address: RESOLVER,
            escrow_factory: FACTORY,
            proxy_bytecode_hash: B256::repeat_byte(0xbc),
            order_protocol: ORDER_PROTOCOL,
            lock: LockConfig {
                default_ttl: lock_ttl,
                acquire_retries: 20,
                ..LockConfig::default()
            },
            ..ResolverConfig::default()
        };
        let resolver = Resolver::new(config, kv.clone(), chain.clone(), MetricsRecorder::disabled());
        resolver.start().await.unwrap();
        resolvers.push(Arc::new(resolver));
    }
    (resolvers, chain)
}

/// Every instance drives every swap to `to` at once.
async fn race(resolvers: &[Arc<Resolver>], ids: &[SwapId], to: SwapStatus) {
    let calls = resolvers.iter().flat_map(|r| {
        ids.iter().map(move |id| async move {
            match to {
                SwapStatus::SrcEscrowDeployed => r.deploy_src_escrow(*id).await,
                SwapStatus::DstEscrowDeployed => r.deploy_dst_escrow(*id).await,
                SwapStatus::SecretRevealed => r.reveal_secret(*id).await,
                _ => r.complete(*id).await,
            }
        })
    });
    for result in join_all(calls).await {
        assert_eq!(result.unwrap().status, to);
    }
}

#[tokio::test]
async fn test_racing_deployments_deploy_once() {
    let (resolvers, chain) = cluster(4, Duration::from_millis(30)).await;
    let secret = Secret::generate();
    let id = resolvers[0].commit_order(&artifact(&secret), secret).await.unwrap().id;

    let results = join_all(resolvers.iter().map(|r| r.deploy_src_escrow(id))).await;
    let records: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(chain.deployments(), 1);
    let escrow = records[0].src_escrow_address;
    assert!(escrow.is_some());
    for record in &records {
        assert_eq!(record.status, SwapStatus::SrcEscrowDeployed);
        assert_eq!(record.version, 2);
        assert_eq!(record.src_escrow_address, escrow);
    }
}

#[tokio::test]
async fn test_slow_deployment_keeps_its_lease() {
    // Confirmation takes three lock TTLs.
    let (resolvers, chain) =
        cluster_with_ttl(3, Duration::from_millis(150), Duration::from_millis(50)).await;
    let secret = Secret::generate();
    let id = resolvers[0].commit_order(&artifact(&secret), secret).await.unwrap().id;

    let results = join_all(resolvers.iter().map(|r| r.deploy_src_escrow(id))).await;
    for result in results {
        assert_eq!(result.unwrap().status, SwapStatus::SrcEscrowDeployed);
    }
    assert_eq!(chain.deployments(), 1);

    let history = resolvers[0].store().history(id).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_racing_instances_complete_every_swap() {
    let (resolvers, chain) = cluster(3, Duration::from_millis(5)).await;
    let mut ids = Vec::new();
    for _ in 0..4 {
        let secret = Secret::generate();
        ids.push(resolvers[0].commit_order(&artifact(&secret), secret).await.unwrap().id);
    }

    race(&resolvers, &ids, SwapStatus::SrcEscrowDeployed).await;
    race(&resolvers, &ids, SwapStatus::DstEscrowDeployed).await;
    chain.advance_all(20);
    race(&resolvers, &ids, SwapStatus::SecretRevealed).await;
    race(&resolvers, &ids, SwapStatus::Completed).await;

    assert_eq!(chain.deployments(), 8);
    let store = resolvers[1].store();
    assert_eq!(store.query_by_status(SwapStatus::Completed).await.unwrap().len(), 4);
    for id in ids {
        let history = store.history(id).await.unwrap();
        let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }
}

#[tokio::test]
async fn test_one_winner_among_concurrent_acquirers() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let managers: Vec<LockManager> = (0..8)
        .map(|i| {
            LockManager::new(
                kv.clone(),
                HolderId::new(format!("holder-{i}")),
                LockConfig::default(),
                RetryConfig::default(),
                Duration::from_secs(60),
                MetricsRecorder::disabled(),
            )
        })
        .collect();

    let results = join_all(
        managers
            .iter()
            .map(|m| m.acquire("swap:contended", Duration::from_secs(10), 0)),
    )
    .await;

    let winners: Vec<_> = results.into_iter().filter_map(|r| r.unwrap()).collect();
    assert_eq!(winners.len(), 1);
}

#[tokio::test]
async fn test_survivor_takes_over_after_lease_expiry() {
    let (resolvers, _chain) = cluster(2, Duration::ZERO).await;
    let secret = Secret::generate();
    let id = resolvers[0].commit_order(&artifact(&secret), secret).await.unwrap().id;

    // The first instance dies holding the swap lock.
    let orphan = resolvers[0]
        .locks()
        .acquire(&id.lock_resource(), Duration::from_millis(200), 0)
        .await
        .unwrap()
        .unwrap();
    resolvers[0].stop().await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let record = resolvers[1].deploy_src_escrow(id).await.unwrap();
    assert_eq!(record.status, SwapStatus::SrcEscrowDeployed);

    // The orphaned lease no longer fences writes.
    let err = resolvers[1]
        .store()
        .transition(&orphan, id, record.version, SwapStatus::Failed, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), BridgeError::LockNotHeld { .. }));
}
