//! Storage key layout.
//!
//! ```text
//! swaps/{id}                          primary record
//! idx/status/{status}/{id}            status index
//! idx/chain/{chain}/{id}              chain index
//! idx/party/{address}/{id}            counterparty index
//! events/{id}/{version:020}           swap event log
//! secrets/{id}                        secret entry (TTL)
//! locks/{resource}                    distributed lock (TTL)
//! lock-audit/{resource}/{uuid}        lock audit log (TTL)
//! ```

use alloy_primitives::{hex, Address};
use uuid::Uuid;

use bridgemenot_common::{ChainId, SwapId, SwapRecord, SwapStatus};

pub fn swap(id: SwapId) -> String {
    format!("swaps/{id}")
}

pub fn status_prefix(status: SwapStatus) -> String {
    format!("idx/status/{status}/")
}

pub fn chain_prefix(chain: ChainId) -> String {
    format!("idx/chain/{chain}/")
}

pub fn party_prefix(address: Address) -> String {
    format!("idx/party/{}/", hex::encode(address))
}

pub fn events_prefix(id: SwapId) -> String {
    format!("events/{id}/")
}

pub fn event(id: SwapId, version: u64) -> String {
    format!("events/{id}/{version:020}")
}

pub fn secret(id: SwapId) -> String {
    format!("secrets/{id}")
}

pub fn lock(resource: &str) -> String {
    format!("locks/{resource}")
}

pub fn lock_audit_prefix(resource: &str) -> String {
    format!("lock-audit/{resource}/")
}

pub fn lock_audit(resource: &str) -> String {
    format!("lock-audit/{resource}/{}", Uuid::now_v7())
}

/// Every index entry a record should have in its current state.
pub fn index_keys(record: &SwapRecord) -> Vec<String> {
    let id = record.id;
    let mut keys = vec![format!("{}{id}", status_prefix(record.status))];
    keys.extend(
        record
            .chains()
            .into_iter()
            .map(|chain| format!("{}{id}", chain_prefix(chain))),
    );
    keys.extend(
        record
            .counterparties()
            .into_iter()
            .map(|party| format!("{}{id}", party_prefix(party))),
    );
    keys
}

/// The swap id at the end of an index key.
pub fn id_suffix(key: &str, prefix: &str) -> Option<SwapId> {
    SwapId::parse(key.strip_prefix(prefix)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    #[test]
    fn test_event_keys_sort_by_version() {
        let id = SwapId::new(B256::repeat_byte(1));
        assert!(event(id, 9) < event(id, 10));
        assert!(event(id, 10).starts_with(&events_prefix(id)));
    }

    #[test]
    fn test_id_suffix() {
        let id = SwapId::new(B256::repeat_byte(2));
        let prefix = status_prefix(SwapStatus::Created);
        let key = format!("{prefix}{id}");
        assert_eq!(id_suffix(&key, &prefix), Some(id));
        assert_eq!(id_suffix("idx/status/created/junk", &prefix), None);
    }

    #[test]
    fn test_party_prefix_is_lowercase_hex() {
        let prefix = party_prefix(Address::repeat_byte(0xab));
        assert_eq!(prefix, format!("idx/party/{}/", "ab".repeat(20)));
    }
}
