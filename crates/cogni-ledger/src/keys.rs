//! Key encoding for the ledger column families.

use chrono::{DateTime, Utc};

use cogni_core::{BillingAccountId, EntryId, VirtualKeyId};

/// Account key: the account UUID bytes.
#[must_use]
pub fn account_key(account_id: &BillingAccountId) -> Vec<u8> {
    account_id.as_bytes().to_vec()
}

/// Owner index key: the owner UUID bytes.
#[must_use]
pub fn owner_key(owner_user_id: &uuid::Uuid) -> Vec<u8> {
    owner_user_id.as_bytes().to_vec()
}

/// Virtual key record key: the key UUID bytes.
#[must_use]
pub fn virtual_key_key(key_id: &VirtualKeyId) -> Vec<u8> {
    key_id.as_bytes().to_vec()
}

/// Entry key: the entry ULID bytes.
#[must_use]
pub fn entry_key(entry_id: &EntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// Account-entry index key.
///
/// Format: `account_id (16 bytes) || entry_id (16 bytes)`.
///
/// ULIDs are time-ordered, so iterating the account prefix yields entries in
/// chronological order.
#[must_use]
pub fn account_entry_key(account_id: &BillingAccountId, entry_id: &EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// Prefix for iterating all entries of an account.
#[must_use]
pub fn account_entries_prefix(account_id: &BillingAccountId) -> Vec<u8> {
    account_id.as_bytes().to_vec()
}

/// Extract the entry id from an account-entry index key.
///
/// # Panics
///
/// Panics if the key is shorter than 32 bytes.
#[must_use]
pub fn extract_entry_id(key: &[u8]) -> EntryId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    EntryId::from_bytes(bytes).expect("valid ULID bytes")
}

/// Receipt key: the request id bytes.
#[must_use]
pub fn receipt_key(request_id: &str) -> Vec<u8> {
    request_id.as_bytes().to_vec()
}

/// Account-receipt index key.
///
/// Format: `account_id (16 bytes) || created_at millis (8 bytes BE) ||
/// request_id`.
#[must_use]
pub fn account_receipt_key(
    account_id: &BillingAccountId,
    created_at: DateTime<Utc>,
    request_id: &str,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(24 + request_id.len());
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(&created_at.timestamp_millis().to_be_bytes());
    key.extend_from_slice(request_id.as_bytes());
    key
}

/// Extract the request id from an account-receipt index key.
///
/// # Panics
///
/// Panics if the key is shorter than 24 bytes or the id is not UTF-8.
#[must_use]
pub fn extract_receipt_request_id(key: &[u8]) -> String {
    String::from_utf8(key[24..].to_vec()).expect("utf-8 request id")
}

/// Extract the timestamp millis from an account-receipt index key.
///
/// # Panics
///
/// Panics if the key is shorter than 24 bytes.
#[must_use]
pub fn extract_receipt_millis(key: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[16..24]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_entry_key_layout() {
        let account = BillingAccountId::generate();
        let entry = EntryId::generate();
        let key = account_entry_key(&account, &entry);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], account.as_bytes());
        assert_eq!(extract_entry_id(&key), entry);
    }

    #[test]
    fn receipt_index_roundtrip() {
        let account = BillingAccountId::generate();
        let now = Utc::now();
        let key = account_receipt_key(&account, now, "gen-abc");

        assert_eq!(extract_receipt_request_id(&key), "gen-abc");
        assert_eq!(extract_receipt_millis(&key), now.timestamp_millis());
    }

    #[test]
    fn receipt_index_sorts_by_time() {
        let account = BillingAccountId::generate();
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(5);

        let a = account_receipt_key(&account, early, "a");
        let b = account_receipt_key(&account, late, "b");
        assert!(a < b);
    }
}
