//! Bridge-Me-Not Coordinator
//!
//! Coordination layer shared by every resolver instance: a transactional
//! key-value store abstraction, the swap store with its secondary indexes,
//! fenced distributed locks, operational metrics and the resolver driver that
//! moves swaps through their lifecycle.

pub mod config;
pub mod store;
pub mod memory_store;
pub mod keys;
pub mod swap_store;
pub mod lock_manager;
pub mod metrics;
pub mod state;
pub mod chain;
pub mod resolver;

pub use config::{LockConfig, MetricsConfig, ResolverConfig, RetryConfig, StoreConfig};
pub use store::{Compare, KvEntry, KvStore, StoreError, Txn, TxnOutcome};
pub use memory_store::MemoryStore;
pub use swap_store::SwapStore;
pub use lock_manager::{Lease, Lock, LockAction, LockAuditEntry, LockManager};
pub use metrics::{MetricsAggregator, MetricsRecorder, MetricsSink, MetricsSnapshot};
pub use state::ResolverState;
pub use chain::{ChainReceipt, DeployedEscrow, EscrowChain, EscrowSide, EscrowState, MemoryChain};
pub use resolver::Resolver;
