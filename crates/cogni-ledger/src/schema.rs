//! Column family layout for the ledger database.

/// Column family names.
pub mod cf {
    /// Account records, keyed by account id.
    pub const ACCOUNTS: &str = "accounts";

    /// Owner → account id index (enforces one account per user).
    pub const ACCOUNTS_BY_OWNER: &str = "accounts_by_owner";

    /// Virtual key records, keyed by key id.
    pub const VIRTUAL_KEYS: &str = "virtual_keys";

    /// Account id → default virtual key id.
    pub const DEFAULT_KEY_BY_ACCOUNT: &str = "default_key_by_account";

    /// Ledger entries, keyed by entry id (ULID).
    pub const ENTRIES: &str = "entries";

    /// Index for listing entries by account in time order.
    pub const ENTRIES_BY_ACCOUNT: &str = "entries_by_account";

    /// Charge receipts, keyed by request id.
    pub const RECEIPTS: &str = "receipts";

    /// Index for listing receipts by account in time order.
    pub const RECEIPTS_BY_ACCOUNT: &str = "receipts_by_account";
}

/// All column families, for database open.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::ACCOUNTS_BY_OWNER,
        cf::VIRTUAL_KEYS,
        cf::DEFAULT_KEY_BY_ACCOUNT,
        cf::ENTRIES,
        cf::ENTRIES_BY_ACCOUNT,
        cf::RECEIPTS,
        cf::RECEIPTS_BY_ACCOUNT,
    ]
}
