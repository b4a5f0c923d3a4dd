//! Swap records, indexes, event log and secrets on top of a [`KvStore`].
//!
//! Every mutation is one engine transaction, so an index entry, the record
//! it points at and the event describing the change are always written
//! together. Queries scan an index and then read each record, dropping
//! records that no longer match; a query can lag a concurrent transition
//! by one transaction but never sees a half-applied one.

use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::Address;
use tracing::{debug, info, instrument, warn};

use bridgemenot_common::{
    chrono_duration, now, BridgeError, ChainId, Result, Secret, SecretEntry, SwapEvent, SwapId,
    SwapPatch, SwapRecord, SwapStatus,
};

use crate::config::StoreConfig;
use crate::keys;
use crate::lock_manager::Lease;
use crate::metrics::{MetricsRecorder, Operation};
use crate::store::{
    decode_value, encode_value, with_retry, Compare, KvEntry, KvStore, Txn, TxnOutcome,
};

/// Coordination store shared by every resolver instance.
pub struct SwapStore {
    kv: Arc<dyn KvStore>,
    config: StoreConfig,
    metrics: MetricsRecorder,
}

impl SwapStore {
    pub fn new(kv: Arc<dyn KvStore>, config: StoreConfig, metrics: MetricsRecorder) -> Self {
        Self {
            kv,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Persist a new record with its indexes and creation event.
    #[instrument(skip(self, record), fields(swap_id = %record.id))]
    pub async fn create(&self, record: &SwapRecord) -> Result<()> {
        let started = Instant::now();
        let result = self.try_create(record, None).await;
        self.metrics.observe(Operation::CreateSwap, started, &result);
        result
    }

    /// Persist a new record and the secret behind its hashlock in one
    /// transaction.
    ///
    /// A secret entry left by an earlier attempt whose record never landed
    /// is replaced, as long as it holds the same unrevealed secret.
    #[instrument(skip(self, record, secret), fields(swap_id = %record.id))]
    pub async fn create_with_secret(
        &self,
        record: &SwapRecord,
        secret: Secret,
    ) -> Result<SecretEntry> {
        let started = Instant::now();
        let retention = chrono_duration(self.config.secret_retention);
        let entry = SecretEntry::new(record.id, secret, retention);
        let result = self.try_create(record, Some(&entry)).await;
        self.metrics.observe(Operation::CreateSwap, started, &result);
        result.map(|()| entry)
    }

    async fn try_create(&self, record: &SwapRecord, secret: Option<&SecretEntry>) -> Result<()> {
        let key = keys::swap(record.id);
        let mut txn = Txn::new()
            .when(Compare::Absent(key.clone()))
            .put(key, encode_value(record)?, None);
        if let Some(entry) = secret {
            let secret_key = keys::secret(record.id);
            let guard = match self.load_secret(record.id).await? {
                None => Compare::Absent(secret_key.clone()),
                Some((stored, existing)) if existing.secret == entry.secret && !existing.revealed => {
                    debug!("Replacing secret entry left by an earlier attempt");
                    Compare::Revision(secret_key.clone(), stored.revision)
                }
                Some(_) => return Err(BridgeError::AlreadyExists(record.id)),
            };
            txn = txn
                .when(guard)
                .put(secret_key, encode_value(entry)?, Some(entry.expires_at));
        }
        for index in keys::index_keys(record) {
            txn = txn.put(index, Vec::new(), None);
        }
        txn = txn.put(
            keys::event(record.id, record.version),
            encode_value(&SwapEvent::created(record))?,
            None,
        );

        match self.commit("swap.create", txn).await? {
            TxnOutcome::Committed(_) => {
                info!(status = %record.status, "Swap created");
                Ok(())
            }
            TxnOutcome::Conflict(_) => Err(BridgeError::AlreadyExists(record.id)),
        }
    }

    /// Move a swap to `to`, applying `patch`.
    ///
    /// `lease` must be the live lock for the swap; its revision is compared
    /// inside the same transaction as the record write, so a lease that
    /// expired or was taken over can never commit.
    #[instrument(skip_all, fields(swap_id = %id, to = %to, expected_version = expected_version))]
    pub async fn transition(
        &self,
        lease: &Lease,
        id: SwapId,
        expected_version: u64,
        to: SwapStatus,
        patch: SwapPatch,
    ) -> Result<SwapRecord> {
        let started = Instant::now();
        let result = self
            .try_transition(lease, id, expected_version, to, &patch)
            .await
            .map_err(|e| e.in_transition(id, to));
        self.metrics
            .observe(Operation::Transition(to), started, &result);
        result
    }

    async fn try_transition(
        &self,
        lease: &Lease,
        id: SwapId,
        expected_version: u64,
        to: SwapStatus,
        patch: &SwapPatch,
    ) -> Result<SwapRecord> {
        let not_held = || BridgeError::LockNotHeld {
            resource: id.lock_resource(),
            holder: lease.holder().to_string(),
        };
        if lease.resource() != id.lock_resource() {
            return Err(not_held());
        }

        let (entry, current) = self.load(id).await?.ok_or(BridgeError::NotFound(id))?;
        if current.version != expected_version {
            return Err(BridgeError::VersionConflict {
                swap_id: id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let next = current.apply(to, patch)?;
        let event = SwapEvent::transition(&current, &next, lease.holder(), patch);
        let revealed = if to == SwapStatus::SecretRevealed {
            self.revealed_secret(id).await?
        } else {
            None
        };

        let key = keys::swap(id);
        let mut txn = Txn::new()
            .when(Compare::LiveRevision(keys::lock(lease.resource()), lease.revision))
            .when(Compare::Revision(key.clone(), entry.revision))
            .put(key, encode_value(&next)?, None);

        let before = keys::index_keys(&current);
        let after = keys::index_keys(&next);
        for stale in before.iter().filter(|k| !after.contains(k)) {
            txn = txn.delete(stale.clone());
        }
        for added in after.iter().filter(|k| !before.contains(k)) {
            txn = txn.put(added.clone(), Vec::new(), None);
        }
        txn = txn.put(keys::event(id, next.version), encode_value(&event)?, None);
        if let Some((revision, secret)) = revealed {
            let secret_key = keys::secret(id);
            txn = txn
                .when(Compare::Revision(secret_key.clone(), revision))
                .put(secret_key, encode_value(&secret)?, Some(secret.expires_at));
        }

        match self.commit("swap.transition", txn).await? {
            TxnOutcome::Committed(_) => {
                info!(
                    from = %current.status,
                    version = next.version,
                    holder = %lease.holder(),
                    "Swap transitioned"
                );
                Ok(next)
            }
            TxnOutcome::Conflict(0) => {
                warn!(holder = %lease.holder(), "Transition fenced off, lease no longer live");
                Err(not_held())
            }
            TxnOutcome::Conflict(2) => Err(BridgeError::StoreUnavailable(format!(
                "secret entry for {id} changed during transition"
            ))),
            TxnOutcome::Conflict(_) => {
                let actual = self.get(id).await?.ok_or(BridgeError::NotFound(id))?.version;
                Err(BridgeError::VersionConflict {
                    swap_id: id,
                    expected: expected_version,
                    actual,
                })
            }
        }
    }

    /// The secret entry flagged as revealed, with the revision it was read
    /// at; `None` when there is no entry or it is already flagged.
    async fn revealed_secret(&self, id: SwapId) -> Result<Option<(u64, SecretEntry)>> {
        let Some((stored, mut secret)) = self.load_secret(id).await? else {
            warn!("No secret entry to flag as revealed");
            return Ok(None);
        };
        if secret.revealed {
            return Ok(None);
        }
        secret.mark_revealed();
        Ok(Some((stored.revision, secret)))
    }

    pub async fn get(&self, id: SwapId) -> Result<Option<SwapRecord>> {
        Ok(self.load(id).await?.map(|(_, record)| record))
    }

    async fn load(&self, id: SwapId) -> Result<Option<(KvEntry, SwapRecord)>> {
        let key = keys::swap(id);
        let Some(entry) = with_retry(&self.config.retry, "swap.get", || self.kv.get(&key)).await?
        else {
            return Ok(None);
        };
        let record = decode_value(&entry)?;
        Ok(Some((entry, record)))
    }

    pub async fn query_by_status(&self, status: SwapStatus) -> Result<Vec<SwapRecord>> {
        self.query_index(&keys::status_prefix(status), |record| record.status == status)
            .await
    }

    pub async fn query_by_counterparty(&self, address: Address) -> Result<Vec<SwapRecord>> {
        self.query_index(&keys::party_prefix(address), |record| {
            record.counterparties().contains(&address)
        })
        .await
    }

    pub async fn query_by_chain(&self, chain: ChainId) -> Result<Vec<SwapRecord>> {
        self.query_index(&keys::chain_prefix(chain), |record| {
            record.chains().contains(&chain)
        })
        .await
    }

    async fn query_index<P>(&self, prefix: &str, matches: P) -> Result<Vec<SwapRecord>>
    where
        P: Fn(&SwapRecord) -> bool,
    {
        let mut records = Vec::new();
        for id in self.index_ids(prefix).await? {
            match self.get(id).await? {
                Some(record) if matches(&record) => records.push(record),
                Some(_) => debug!(swap_id = %id, prefix, "Index entry ahead of record, skipped"),
                None => {}
            }
        }
        Ok(records)
    }

    async fn index_ids(&self, prefix: &str) -> Result<Vec<SwapId>> {
        let entries =
            with_retry(&self.config.retry, "swap.scan", || self.kv.scan_prefix(prefix)).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let id = keys::id_suffix(&entry.key, prefix);
                if id.is_none() {
                    warn!(key = %entry.key, "Malformed index key");
                }
                id
            })
            .collect())
    }

    /// Event log of a swap, oldest first.
    pub async fn history(&self, id: SwapId) -> Result<Vec<SwapEvent>> {
        let prefix = keys::events_prefix(id);
        let entries =
            with_retry(&self.config.retry, "swap.history", || self.kv.scan_prefix(&prefix))
                .await?;
        Ok(entries
            .iter()
            .map(decode_value::<SwapEvent>)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Remove terminal records past retention, then purge expired keys.
    ///
    /// Each removal compares the record revision it inspected, so a record
    /// that changed in the meantime is left for the next sweep.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<usize> {
        let started = Instant::now();
        let result = self.try_expire_stale().await;
        self.metrics.observe(Operation::ExpireStale, started, &result);
        result
    }

    async fn try_expire_stale(&self) -> Result<usize> {
        let at = now();
        let mut removed = 0;

        for status in SwapStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for id in self.index_ids(&keys::status_prefix(status)).await? {
                let Some((entry, record)) = self.load(id).await? else {
                    continue;
                };
                if !record.is_collectable(at) {
                    continue;
                }

                let key = keys::swap(id);
                let mut txn = Txn::new()
                    .when(Compare::Revision(key.clone(), entry.revision))
                    .delete(key);
                for index in keys::index_keys(&record) {
                    txn = txn.delete(index);
                }
                let events_prefix = keys::events_prefix(id);
                let events = with_retry(&self.config.retry, "swap.expire", || {
                    self.kv.scan_prefix(&events_prefix)
                })
                .await?;
                for event in events {
                    txn = txn.delete(event.key);
                }

                match self.commit("swap.expire", txn).await? {
                    TxnOutcome::Committed(_) => {
                        debug!(swap_id = %id, status = %record.status, "Expired swap record");
                        removed += 1;
                    }
                    TxnOutcome::Conflict(_) => {
                        debug!(swap_id = %id, "Swap changed during expiry, skipped");
                    }
                }
            }
        }

        let purged = with_retry(&self.config.retry, "swap.purge", || self.kv.purge_expired()).await?;
        if removed > 0 || purged > 0 {
            info!(removed, purged, "Expired stale entries");
        }
        Ok(removed)
    }

    pub async fn secret(&self, id: SwapId) -> Result<Option<SecretEntry>> {
        Ok(self.load_secret(id).await?.map(|(_, secret)| secret))
    }

    async fn load_secret(&self, id: SwapId) -> Result<Option<(KvEntry, SecretEntry)>> {
        let key = keys::secret(id);
        let Some(entry) = with_retry(&self.config.retry, "secret.get", || self.kv.get(&key)).await?
        else {
            return Ok(None);
        };
        let secret = decode_value(&entry)?;
        Ok(Some((entry, secret)))
    }

    async fn commit(&self, operation: &str, txn: Txn) -> Result<TxnOutcome> {
        Ok(with_retry(&self.config.retry, operation, || self.kv.txn(txn.clone())).await?)
    }
}
