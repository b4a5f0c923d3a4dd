//! Distributed lock management for swaps.
//!
//! Locks live in the shared coordination store under `locks/{resource}` with
//! a TTL. Acquisition is create-if-absent; an expired lock is taken over
//! with a compare on the stale entry's revision so exactly one racing
//! instance wins. The store revision of the lock entry doubles as a fencing
//! token: swap transitions compare it inside their own transaction.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use bridgemenot_common::{chrono_duration, now, BridgeError, HolderId, Result, Timestamp};

use crate::config::{LockConfig, RetryConfig};
use crate::keys;
use crate::metrics::{MetricsRecorder, Operation, OperationEvent};
use crate::store::{
    decode_value, encode_value, with_retry, Compare, KvStore, Revision, Txn, TxnOutcome,
};

/// A lock as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource: String,
    pub holder: HolderId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    /// Bumped on every extension.
    pub version: u64,
    /// Fresh per acquisition, kept across extensions.
    pub token: Uuid,
}

impl Lock {
    pub fn is_expired(&self, at: Timestamp) -> bool {
        at >= self.expires_at
    }
}

/// Proof of holding a lock, valid while the stored entry keeps `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lock: Lock,
    pub revision: Revision,
}

impl Lease {
    pub fn resource(&self) -> &str {
        &self.lock.resource
    }

    pub fn holder(&self) -> &HolderId {
        &self.lock.holder
    }

    pub fn expires_at(&self) -> Timestamp {
        self.lock.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.lock.is_expired(now())
    }
}

/// Lock lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Acquired,
    Released,
    Extended,
    TakenOver,
}

/// One entry of a resource's lock history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAuditEntry {
    pub resource: String,
    pub holder: HolderId,
    pub action: LockAction,
    pub at: Timestamp,
    /// Lock expiry after the action; `None` for releases.
    pub expires_at: Option<Timestamp>,
}

/// Manager for distributed locks held by one resolver instance.
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    holder: HolderId,
    config: LockConfig,
    retry: RetryConfig,
    audit_retention: Duration,
    metrics: MetricsRecorder,
}

impl LockManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        holder: HolderId,
        config: LockConfig,
        retry: RetryConfig,
        audit_retention: Duration,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            kv,
            holder,
            config,
            retry,
            audit_retention,
            metrics,
        }
    }

    /// Identity this manager acquires locks as.
    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `resource`, retrying with backoff while it is held elsewhere.
    ///
    /// Returns `None` once `retries` further attempts have failed. `ttl` is
    /// clamped to the configured maximum.
    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn acquire(&self, resource: &str, ttl: Duration, retries: u32) -> Result<Option<Lease>> {
        let ttl = ttl.min(self.config.max_ttl);
        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }
            if let Some(lease) = self.try_acquire(resource, ttl).await? {
                return Ok(Some(lease));
            }
            self.metrics
                .record(OperationEvent::success(Operation::LockContended, Duration::ZERO));
        }
        debug!(resource, retries, "Lock acquisition exhausted retries");
        Ok(None)
    }

    /// One acquisition attempt; `None` if the lock is live or the race was lost.
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lease>> {
        let started = Instant::now();
        let key = keys::lock(resource);
        let current = with_retry(&self.retry, "lock.read", || self.kv.read(&key)).await?;

        let at = now();
        let (guard, action) = match &current {
            Some(entry) if entry.is_live(at) => return Ok(None),
            Some(entry) => (Compare::Revision(key.clone(), entry.revision), LockAction::TakenOver),
            None => (Compare::Absent(key.clone()), LockAction::Acquired),
        };

        let lock = Lock {
            resource: resource.to_string(),
            holder: self.holder.clone(),
            acquired_at: at,
            expires_at: at + chrono_duration(ttl),
            version: 1,
            token: Uuid::new_v4(),
        };
        let txn = Txn::new()
            .when(guard)
            .put(key.clone(), encode_value(&lock)?, Some(lock.expires_at));
        let txn = self.audit(txn, &lock, action, Some(lock.expires_at))?;

        match with_retry(&self.retry, "lock.acquire", || self.kv.txn(txn.clone())).await? {
            TxnOutcome::Committed(revision) => {
                let operation = if action == LockAction::TakenOver {
                    let previous = current.as_ref().and_then(|e| decode_value::<Lock>(e).ok());
                    warn!(
                        resource,
                        previous_holder = previous.as_ref().map(|l| l.holder.as_str()).unwrap_or("unknown"),
                        "Took over expired lock"
                    );
                    Operation::TakeoverLock
                } else {
                    info!(resource, "Lock acquired");
                    Operation::AcquireLock
                };
                self.metrics
                    .record(OperationEvent::success(operation, started.elapsed()));
                Ok(Some(Lease { lock, revision }))
            }
            TxnOutcome::Conflict(_) => Ok(None),
        }
    }

    /// Release `resource` if this instance holds it.
    ///
    /// Returns `false`, after logging, when the lock is absent or held by
    /// another instance.
    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn release(&self, resource: &str) -> Result<bool> {
        self.release_if(resource, |lock| lock.holder == self.holder).await
    }

    /// Release the exact acquisition behind `lease`.
    ///
    /// Unlike [`release`](Self::release) this refuses a later acquisition of
    /// the same resource by the same instance.
    pub async fn release_lease(&self, lease: &Lease) -> Result<bool> {
        self.release_if(lease.resource(), |lock| {
            lock.holder == lease.lock.holder && lock.token == lease.lock.token
        })
        .await
    }

    async fn release_if<P>(&self, resource: &str, owns: P) -> Result<bool>
    where
        P: Fn(&Lock) -> bool,
    {
        let started = Instant::now();
        let key = keys::lock(resource);
        let Some(entry) = with_retry(&self.retry, "lock.get", || self.kv.get(&key)).await? else {
            debug!(resource, "Release of absent lock ignored");
            return Ok(false);
        };
        let lock: Lock = decode_value(&entry)?;
        if !owns(&lock) {
            warn!(resource, owner = %lock.holder, "Release by non-holder ignored");
            return Ok(false);
        }

        let txn = Txn::new()
            .when(Compare::Revision(key.clone(), entry.revision))
            .delete(key);
        let txn = self.audit(txn, &lock, LockAction::Released, None)?;
        match with_retry(&self.retry, "lock.release", || self.kv.txn(txn.clone())).await? {
            TxnOutcome::Committed(_) => {
                debug!(resource, "Lock released");
                self.metrics
                    .record(OperationEvent::success(Operation::ReleaseLock, started.elapsed()));
                Ok(true)
            }
            TxnOutcome::Conflict(_) => {
                warn!(resource, "Lock changed during release, left in place");
                Ok(false)
            }
        }
    }

    /// Push the expiry of a held lease to `now + ttl`.
    ///
    /// Fails with `LockNotHeld` if the lease has expired or been replaced.
    #[instrument(skip(self, lease), fields(resource = %lease.resource()))]
    pub async fn extend(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
        let started = Instant::now();
        let ttl = ttl.min(self.config.max_ttl);
        let not_held = || BridgeError::LockNotHeld {
            resource: lease.lock.resource.clone(),
            holder: self.holder.to_string(),
        };
        if lease.lock.holder != self.holder {
            return Err(not_held());
        }

        let key = keys::lock(lease.resource());
        let at = now();
        let extended = Lock {
            expires_at: at + chrono_duration(ttl),
            version: lease.lock.version + 1,
            ..lease.lock.clone()
        };
        let txn = Txn::new()
            .when(Compare::LiveRevision(key.clone(), lease.revision))
            .put(key, encode_value(&extended)?, Some(extended.expires_at));
        let txn = self.audit(txn, &extended, LockAction::Extended, Some(extended.expires_at))?;

        let result = match with_retry(&self.retry, "lock.extend", || self.kv.txn(txn.clone())).await? {
            TxnOutcome::Committed(revision) => Ok(revision),
            TxnOutcome::Conflict(_) => Err(not_held()),
        };
        self.metrics
            .observe(Operation::ExtendLock, started, &result);
        let revision = result?;

        lease.lock = extended;
        lease.revision = revision;
        debug!(version = lease.lock.version, "Lock extended");
        Ok(())
    }

    /// Run `f` while holding `resource`.
    ///
    /// Fails with `LockUnavailable` if the lock cannot be acquired within
    /// the configured retries. The lease is released on every exit path,
    /// including a panic in `f`, and `f`'s result is returned unchanged.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, ttl: Duration, f: F) -> Result<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self
            .acquire(resource, ttl, self.config.acquire_retries)
            .await?
            .ok_or_else(|| BridgeError::LockUnavailable(resource.to_string()))?;

        let outcome = AssertUnwindSafe(f(lease.clone())).catch_unwind().await;

        match self.release_lease(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(resource, "Lease lapsed before release"),
            Err(e) => warn!(resource, error = %e, "Failed to release lock"),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Live lock on `resource`, if any.
    pub async fn current(&self, resource: &str) -> Result<Option<Lock>> {
        let key = keys::lock(resource);
        let entry = with_retry(&self.retry, "lock.read", || self.kv.get(&key)).await?;
        Ok(entry.as_ref().map(decode_value).transpose()?)
    }

    /// Retained audit history of `resource`, oldest first.
    pub async fn audit_log(&self, resource: &str) -> Result<Vec<LockAuditEntry>> {
        let prefix = keys::lock_audit_prefix(resource);
        let entries = with_retry(&self.retry, "lock.audit", || self.kv.scan_prefix(&prefix)).await?;
        let mut log = entries
            .iter()
            .map(decode_value::<LockAuditEntry>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        log.sort_by_key(|entry| entry.at);
        Ok(log)
    }

    fn audit(
        &self,
        txn: Txn,
        lock: &Lock,
        action: LockAction,
        expires_at: Option<Timestamp>,
    ) -> Result<Txn> {
        let at = now();
        let entry = LockAuditEntry {
            resource: lock.resource.clone(),
            holder: self.holder.clone(),
            action,
            at,
            expires_at,
        };
        let retain_until = at + chrono_duration(self.audit_retention);
        Ok(txn.put(
            keys::lock_audit(&lock.resource),
            encode_value(&entry)?,
            Some(retain_until),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    fn manager(kv: Arc<dyn KvStore>, holder: &str) -> LockManager {
        let config = LockConfig {
            retry_backoff_base: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(5),
            ..LockConfig::default()
        };
        LockManager::new(
            kv,
            HolderId::new(holder),
            config,
            RetryConfig::default(),
            Duration::from_secs(60),
            MetricsRecorder::disabled(),
        )
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone(), "a");
        let b = manager(kv.clone(), "b");

        let lease = a.acquire("swap:1", Duration::from_secs(30), 0).await.unwrap();
        assert!(lease.is_some());
        assert!(b.acquire("swap:1", Duration::from_secs(30), 2).await.unwrap().is_none());

        let current = a.current("swap:1").await.unwrap().unwrap();
        assert_eq!(current.holder, HolderId::new("a"));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone(), "a");
        let b = manager(kv.clone(), "b");

        a.acquire("swap:2", Duration::from_secs(30), 0).await.unwrap();
        assert!(!b.release("swap:2").await.unwrap());
        assert!(a.current("swap:2").await.unwrap().is_some());

        assert!(a.release("swap:2").await.unwrap());
        assert!(a.current("swap:2").await.unwrap().is_none());
        assert!(!a.release("swap:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone(), "a");
        let b = manager(kv.clone(), "b");

        let stale = a
            .acquire("swap:3", Duration::from_millis(20), 0)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = b
            .acquire("swap:3", Duration::from_secs(30), 0)
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.revision > stale.revision);

        // The old holder can neither extend nor release the new lease.
        let mut stale = stale;
        assert_err!(a.extend(&mut stale, Duration::from_secs(30)).await);
        assert!(!a.release_lease(&stale).await.unwrap());

        let actions: Vec<LockAction> = b
            .audit_log("swap:3")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(actions, vec![LockAction::Acquired, LockAction::TakenOver]);
    }

    #[tokio::test]
    async fn test_release_of_own_expired_lock_reports_lapse() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone(), "a");

        let lease = a
            .acquire("swap:5", Duration::from_millis(10), 0)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!a.release_lease(&lease).await.unwrap());
        assert!(!a.release("swap:5").await.unwrap());
        let actions: Vec<LockAction> = a
            .audit_log("swap:5")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(actions, vec![LockAction::Acquired]);
    }

    #[tokio::test]
    async fn test_extend_bumps_version_and_revision() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv, "a");

        let mut lease = a
            .acquire("swap:4", Duration::from_secs(1), 0)
            .await
            .unwrap()
            .unwrap();
        let before = lease.clone();
        assert_ok!(a.extend(&mut lease, Duration::from_secs(60)).await);

        assert_eq!(lease.lock.version, 2);
        assert_eq!(lease.lock.token, before.lock.token);
        assert!(lease.revision > before.revision);
        assert!(lease.expires_at() > before.expires_at());
    }

    #[tokio::test]
    async fn test_ttl_is_clamped() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv, "a");
        let lease = a
            .acquire("swap:5", Duration::from_secs(86_400), 0)
            .await
            .unwrap()
            .unwrap();
        assert!(lease.expires_at() <= now() + chrono::Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv, "a");

        let result: Result<()> = a
            .with_lock("swap:6", Duration::from_secs(30), |_lease| async {
                Err(BridgeError::Chain("reverted".into()))
            })
            .await;
        assert!(matches!(result, Err(BridgeError::Chain(_))));
        assert!(a.current("swap:6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = Arc::new(manager(kv, "a"));

        let task = {
            let a = a.clone();
            tokio::spawn(async move {
                a.with_lock("swap:7", Duration::from_secs(30), |_lease| async {
                    if a.holder().as_str() == "a" {
                        panic!("step blew up");
                    }
                    Ok(())
                })
                .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert!(a.current("swap:7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_unavailable() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = manager(kv.clone(), "a");
        let b = LockManager {
            config: LockConfig {
                acquire_retries: 1,
                retry_backoff_base: Duration::from_millis(1),
                retry_backoff_max: Duration::from_millis(1),
                ..LockConfig::default()
            },
            ..manager(kv, "b")
        };

        a.acquire("swap:8", Duration::from_secs(30), 0).await.unwrap();
        let result = b
            .with_lock("swap:8", Duration::from_secs(30), |_lease| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(BridgeError::LockUnavailable(_))));
    }
}
