//! In-process key-value engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use bridgemenot_common::now;

use crate::store::{KvEntry, KvStore, Revision, StoreError, StoreResult, Txn, TxnOutcome, Write};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, KvEntry>,
    revision: Revision,
}

/// Ordered map behind one lock; every transaction is serialised.
///
/// Shared by all resolver instances of a process, which stands in for a
/// networked engine in tests and the simulator.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Calls left to fail with `Unavailable`.
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail as if the engine were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Current store-wide revision.
    pub fn revision(&self) -> Revision {
        self.inner.read().revision
    }

    /// Number of physically present keys, expired or not.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected_failure(&self) -> StoreResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn read(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        self.injected_failure()?;
        Ok(self.inner.read().entries.get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<KvEntry>> {
        self.injected_failure()?;
        let at = now();
        let inner = self.inner.read();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(at))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnOutcome> {
        self.injected_failure()?;
        let at = now();
        let mut inner = self.inner.write();

        for (index, compare) in txn.compares.iter().enumerate() {
            if !compare.holds(inner.entries.get(compare.key()), at) {
                debug!(key = compare.key(), index, "Transaction compare failed");
                return Ok(TxnOutcome::Conflict(index));
            }
        }

        inner.revision += 1;
        let revision = inner.revision;
        for write in txn.writes {
            match write {
                Write::Put {
                    key,
                    value,
                    expires_at,
                } => {
                    inner.entries.insert(
                        key.clone(),
                        KvEntry {
                            key,
                            value,
                            revision,
                            expires_at,
                        },
                    );
                }
                Write::Delete(key) => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(TxnOutcome::Committed(revision))
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.injected_failure()?;
        let at = now();
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(at));
        Ok(before - inner.entries.len())
    }
}
