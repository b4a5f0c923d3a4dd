//! Resolver configuration.

use std::time::Duration;

use alloy_primitives::{Address, B256};
use bridgemenot_protocol::TimelockDelays;

use crate::store::jittered_backoff;

/// Distributed lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration used by the resolver driver.
    pub default_ttl: Duration,
    /// Longest lease any caller may request.
    pub max_ttl: Duration,
    /// Acquire attempts after the first before giving up.
    pub acquire_retries: u32,
    /// Backoff before the first acquire retry.
    pub retry_backoff_base: Duration,
    /// Backoff ceiling between acquire retries.
    pub retry_backoff_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(300),
            acquire_retries: 5,
            retry_backoff_base: Duration::from_millis(50),
            retry_backoff_max: Duration::from_secs(2),
        }
    }
}

impl LockConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        jittered_backoff(self.retry_backoff_base, self.retry_backoff_max, attempt)
    }
}

/// Retry policy for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single store call.
    pub operation_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        jittered_backoff(self.initial_backoff, self.max_backoff, attempt)
    }
}

/// Coordination store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a settled swap stays queryable.
    pub record_retention: Duration,
    /// How long secret entries are kept for audit.
    pub secret_retention: Duration,
    /// How long lock audit entries are kept.
    pub lock_audit_retention: Duration,
    /// Interval between garbage collection sweeps.
    pub expiry_sweep_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            record_retention: Duration::from_secs(7 * 24 * 3600),
            secret_retention: Duration::from_secs(14 * 24 * 3600),
            lock_audit_retention: Duration::from_secs(24 * 3600),
            expiry_sweep_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// Metrics pipeline configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Bounded channel size; events beyond it are dropped.
    pub channel_capacity: usize,
    /// Days of daily rollups kept in memory, today included.
    pub rollup_retention_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1024,
            rollup_retention_days: 7,
        }
    }
}

/// Main resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Instance identity used as lock holder; generated when unset.
    pub instance_id: Option<String>,
    /// Address the resolver fills orders and deploys escrows from.
    pub resolver_address: Address,
    /// Escrow factory on every supported chain.
    pub escrow_factory: Address,
    /// Init code hash of the escrow proxy, for CREATE2 address checks.
    pub proxy_bytecode_hash: B256,
    /// Order protocol contract that verifies maker signatures.
    pub order_protocol: Address,
    /// Stage delays for orders committed by this instance.
    pub timelocks: TimelockDelays,
    /// Re-read and retry budget after a version conflict.
    pub max_version_retries: u32,
    pub lock: LockConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    pub log_level: String,
    /// Emit JSON log lines instead of plain text.
    pub log_json: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            resolver_address: Address::ZERO,
            escrow_factory: Address::ZERO,
            proxy_bytecode_hash: B256::ZERO,
            order_protocol: Address::ZERO,
            timelocks: TimelockDelays::default(),
            max_version_retries: 3,
            lock: LockConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ResolverConfig {
    /// Load configuration from `BRIDGEMENOT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("BRIDGEMENOT_INSTANCE_ID") {
            config.instance_id = Some(id);
        }

        if let Some(address) = env_parse("BRIDGEMENOT_RESOLVER_ADDRESS") {
            config.resolver_address = address;
        }

        if let Some(address) = env_parse("BRIDGEMENOT_ESCROW_FACTORY") {
            config.escrow_factory = address;
        }

        if let Some(hash) = env_parse("BRIDGEMENOT_PROXY_BYTECODE_HASH") {
            config.proxy_bytecode_hash = hash;
        }

        if let Some(address) = env_parse("BRIDGEMENOT_ORDER_PROTOCOL") {
            config.order_protocol = address;
        }

        if let Some(secs) = env_parse("BRIDGEMENOT_LOCK_TTL_SECS") {
            config.lock.default_ttl = Duration::from_secs(secs);
        }

        if let Some(retries) = env_parse("BRIDGEMENOT_LOCK_RETRIES") {
            config.lock.acquire_retries = retries;
        }

        if let Some(retries) = env_parse("BRIDGEMENOT_VERSION_RETRIES") {
            config.max_version_retries = retries;
        }

        if let Some(secs) = env_parse("BRIDGEMENOT_SWEEP_INTERVAL_SECS") {
            config.store.expiry_sweep_interval = Duration::from_secs(secs);
        }

        if let Some(capacity) = env_parse("BRIDGEMENOT_METRICS_CAPACITY") {
            config.metrics.channel_capacity = capacity;
        }

        if let Some(days) = env_parse("BRIDGEMENOT_METRICS_RETENTION_DAYS") {
            config.metrics.rollup_retention_days = days;
        }

        if let Ok(level) = std::env::var("BRIDGEMENOT_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(json) = env_parse("BRIDGEMENOT_LOG_JSON") {
            config.log_json = json;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.lock.default_ttl.is_zero() {
            return Err("Lock TTL cannot be zero".to_string());
        }

        if self.lock.default_ttl > self.lock.max_ttl {
            return Err("Default lock TTL cannot exceed max TTL".to_string());
        }

        if self.store.retry.max_attempts == 0 {
            return Err("Store retry attempts must be at least 1".to_string());
        }

        if self.store.record_retention.is_zero() {
            return Err("Record retention cannot be zero".to_string());
        }

        if self.store.expiry_sweep_interval.is_zero() {
            return Err("Expiry sweep interval cannot be zero".to_string());
        }

        if self.metrics.enabled && self.metrics.channel_capacity == 0 {
            return Err("Metrics channel capacity cannot be zero".to_string());
        }

        if self.metrics.rollup_retention_days == 0 {
            return Err("Metrics rollup retention must be at least one day".to_string());
        }

        self.timelocks
            .validate()
            .map_err(|e| format!("Invalid timelock delays: {e}"))?;

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
