//! Key-value engine behind the coordination store.
//!
//! The engine only has to offer atomic multi-key compare-and-set
//! transactions, per-key expiry and ordered prefix scans. Every committed
//! transaction advances one store-wide revision, and every key it writes is
//! stamped with that revision, so a revision observed once is never reused.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bridgemenot_common::{now, BridgeError, Timestamp};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::RetryConfig;

/// Store-wide commit counter.
pub type Revision = u64;

/// A stored value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the transaction that last wrote this key.
    pub revision: Revision,
    /// After this instant the key is logically absent.
    pub expires_at: Option<Timestamp>,
}

impl KvEntry {
    pub fn is_live(&self, at: Timestamp) -> bool {
        self.expires_at.map_or(true, |expiry| at < expiry)
    }
}

/// A transaction guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// No live entry under the key.
    Absent(String),
    /// An entry exists with this revision, live or expired.
    Revision(String, Revision),
    /// A live entry exists with this revision.
    LiveRevision(String, Revision),
}

impl Compare {
    pub fn key(&self) -> &str {
        match self {
            Compare::Absent(key) | Compare::Revision(key, _) | Compare::LiveRevision(key, _) => key,
        }
    }

    /// Evaluate against the current entry for the key.
    pub fn holds(&self, entry: Option<&KvEntry>, at: Timestamp) -> bool {
        match self {
            Compare::Absent(_) => entry.map_or(true, |e| !e.is_live(at)),
            Compare::Revision(_, revision) => entry.map_or(false, |e| e.revision == *revision),
            Compare::LiveRevision(_, revision) => {
                entry.map_or(false, |e| e.revision == *revision && e.is_live(at))
            }
        }
    }
}

/// A transaction mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put {
        key: String,
        value: Vec<u8>,
        expires_at: Option<Timestamp>,
    },
    Delete(String),
}

/// All-or-nothing batch: every compare must hold for any write to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub writes: Vec<Write>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>, expires_at: Option<Timestamp>) -> Self {
        self.writes.push(Write::Put {
            key: key.into(),
            value,
            expires_at,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.writes.push(Write::Delete(key.into()));
        self
    }
}

/// Result of a transaction that reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// All writes applied at this revision.
    Committed(Revision),
    /// The compare at this index failed; nothing was written.
    Conflict(usize),
}

impl TxnOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed(_))
    }
}

/// Engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The engine could not be reached or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A call did not complete before its deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be decoded.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => BridgeError::StoreUnavailable(reason),
            StoreError::Timeout(after) => BridgeError::Timeout(format!("store call after {after:?}")),
            StoreError::Corrupt { key, reason } => {
                BridgeError::Serialization(format!("{key}: {reason}"))
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Serialize a stored value.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, BridgeError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a stored value, reporting the key on failure.
pub fn decode_value<T: DeserializeOwned>(entry: &KvEntry) -> StoreResult<T> {
    serde_json::from_slice(&entry.value).map_err(|e| StoreError::Corrupt {
        key: entry.key.clone(),
        reason: e.to_string(),
    })
}

/// Backing engine of the coordination store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key including an expired entry that has not been purged yet.
    async fn read(&self, key: &str) -> StoreResult<Option<KvEntry>>;

    /// Live entries under `prefix`, ordered by key, from one snapshot.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<KvEntry>>;

    /// Apply a transaction atomically.
    async fn txn(&self, txn: Txn) -> StoreResult<TxnOutcome>;

    /// Physically remove expired entries; returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<usize>;

    /// Read a key, treating an expired entry as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        let at = now();
        Ok(self.read(key).await?.filter(|entry| entry.is_live(at)))
    }
}

/// Exponential backoff, jittered within its upper half and capped at `max`.
pub fn jittered_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let ceiling = base
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(max)
        .min(max);
    let millis = ceiling.as_millis() as u64;
    if millis == 0 {
        return ceiling;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

/// Run a store call with a deadline, retrying transient failures.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut call: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(config.operation_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(config.operation_timeout)),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn entry(revision: Revision, expires_at: Option<Timestamp>) -> KvEntry {
        KvEntry {
            key: "k".into(),
            value: vec![],
            revision,
            expires_at,
        }
    }

    #[test]
    fn test_compare_semantics() {
        let at = now();
        let live = entry(7, None);
        let expired = entry(7, Some(at - chrono::Duration::seconds(1)));

        assert!(Compare::Absent("k".into()).holds(None, at));
        assert!(Compare::Absent("k".into()).holds(Some(&expired), at));
        assert!(!Compare::Absent("k".into()).holds(Some(&live), at));

        assert!(Compare::Revision("k".into(), 7).holds(Some(&expired), at));
        assert!(!Compare::Revision("k".into(), 8).holds(Some(&live), at));
        assert!(!Compare::Revision("k".into(), 7).holds(None, at));

        assert!(Compare::LiveRevision("k".into(), 7).holds(Some(&live), at));
        assert!(!Compare::LiveRevision("k".into(), 7).holds(Some(&expired), at));
    }

    #[test]
    fn test_store_error_mapping() {
        let err: BridgeError = StoreError::Unavailable("down".into()).into();
        assert!(err.is_retryable());
        let err: BridgeError = StoreError::Corrupt {
            key: "swaps/x".into(),
            reason: "eof".into(),
        }
        .into();
        assert_eq!(err.error_code(), "SERIALIZATION");
    }

    #[test]
    fn test_corrupt_value_names_key() {
        let mut bad = entry(1, None);
        bad.value = b"not json".to_vec();
        let err = decode_value::<u64>(&bad).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "k"));

        let mut good = entry(1, None);
        good.value = encode_value(&42u64).unwrap();
        assert_eq!(decode_value::<u64>(&good).unwrap(), 42);
    }

    proptest! {
        #[test]
        fn test_jittered_backoff_bounds(base_ms in 1u64..1_000, max_ms in 1u64..10_000, attempt in 0u32..64) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            let delay = jittered_backoff(base, max, attempt);
            prop_assert!(delay <= max);
            prop_assert!(delay >= Duration::from_millis(base_ms.min(max_ms) / 2));
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            operation_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_retry(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(StoreError::Unavailable("blip".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_surfaces_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry(&fast_retry(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry(&fast_retry(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::Corrupt {
                    key: "k".into(),
                    reason: "bad".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_times_out_slow_calls() {
        let result: StoreResult<()> = with_retry(&fast_retry(1), "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
