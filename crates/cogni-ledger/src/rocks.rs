//! RocksDB ledger implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use cogni_core::{
    BillingAccount, BillingAccountId, ChargeParams, ChargeReceipt, EntryReason, LedgerEntry,
    VirtualKey, VirtualKeyId,
};

use crate::error::{LedgerError, Result};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{LedgerStore, MAX_RECEIPT_PAGE};

/// RocksDB-backed ledger.
pub struct RocksLedger {
    db: Arc<DBWithThreadMode<MultiThreaded>>,

    /// Serializes mutations so `balance_after` chains reflect commit order.
    write_lock: Mutex<()>,

    /// When set, settlement refuses to dip below this balance instead of
    /// logging the breach.
    settlement_floor: Option<i64>,
}

impl RocksLedger {
    /// Open or create the ledger database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P, settlement_floor: Option<i64>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
            settlement_floor,
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Database(format!("column family not found: {name}")))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    fn load_account(&self, account_id: &BillingAccountId) -> Result<BillingAccount> {
        self.get_account(account_id)?
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    fn load_virtual_key(&self, key_id: &VirtualKeyId) -> Result<VirtualKey> {
        self.get_virtual_key(key_id)?
            .ok_or_else(|| LedgerError::VirtualKeyNotFound {
                virtual_key_id: key_id.to_string(),
            })
    }

    /// Stage an account update plus a ledger entry into a batch.
    fn stage_entry(
        &self,
        batch: &mut WriteBatch,
        account: &BillingAccount,
        entry: &LedgerEntry,
    ) -> Result<()> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_index = self.cf(cf::ENTRIES_BY_ACCOUNT)?;

        batch.put_cf(
            &cf_accounts,
            keys::account_key(&account.id),
            Self::serialize(account)?,
        );
        batch.put_cf(&cf_entries, keys::entry_key(&entry.id), Self::serialize(entry)?);
        batch.put_cf(
            &cf_index,
            keys::account_entry_key(&account.id, &entry.id),
            [],
        );
        Ok(())
    }

    fn get_entry(&self, key: &[u8]) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(cf::ENTRIES)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }
}

impl LedgerStore for RocksLedger {
    // =========================================================================
    // Accounts & keys
    // =========================================================================

    fn get_or_create_account(
        &self,
        owner_user_id: uuid::Uuid,
    ) -> Result<(BillingAccount, VirtualKey)> {
        let _guard = self.write_lock.lock().expect("ledger write lock");

        let cf_owner = self.cf(cf::ACCOUNTS_BY_OWNER)?;
        let owner_key = keys::owner_key(&owner_user_id);

        if let Some(account_bytes) = self
            .db
            .get_cf(&cf_owner, &owner_key)
            .map_err(|e| LedgerError::Database(e.to_string()))?
        {
            let mut id_bytes = [0u8; 16];
            id_bytes.copy_from_slice(&account_bytes[..16]);
            let account_id = BillingAccountId::from_uuid(uuid::Uuid::from_bytes(id_bytes));

            let account = self.load_account(&account_id)?;

            let cf_default = self.cf(cf::DEFAULT_KEY_BY_ACCOUNT)?;
            let key_bytes = self
                .db
                .get_cf(&cf_default, keys::account_key(&account_id))
                .map_err(|e| LedgerError::Database(e.to_string()))?
                .ok_or_else(|| {
                    LedgerError::Database(format!("account {account_id} has no default key"))
                })?;
            let mut kb = [0u8; 16];
            kb.copy_from_slice(&key_bytes[..16]);
            let key_id = VirtualKeyId::from_uuid(uuid::Uuid::from_bytes(kb));
            let key = self.load_virtual_key(&key_id)?;

            return Ok((account, key));
        }

        // First sight of this user: create account + default key atomically.
        let account = BillingAccount::new(owner_user_id);
        let key = VirtualKey::default_for(account.id);

        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_keys = self.cf(cf::VIRTUAL_KEYS)?;
        let cf_default = self.cf(cf::DEFAULT_KEY_BY_ACCOUNT)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_accounts,
            keys::account_key(&account.id),
            Self::serialize(&account)?,
        );
        batch.put_cf(&cf_owner, &owner_key, account.id.as_bytes());
        batch.put_cf(
            &cf_keys,
            keys::virtual_key_key(&key.id),
            Self::serialize(&key)?,
        );
        batch.put_cf(
            &cf_default,
            keys::account_key(&account.id),
            key.id.as_bytes(),
        );

        self.db
            .write(batch)
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        tracing::info!(
            account_id = %account.id,
            owner = %owner_user_id,
            "Created billing account with default virtual key"
        );

        Ok((account, key))
    }

    fn get_account(&self, account_id: &BillingAccountId) -> Result<Option<BillingAccount>> {
        let cf = self.cf(cf::ACCOUNTS)?;
        self.db
            .get_cf(&cf, keys::account_key(account_id))
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn get_balance(&self, account_id: &BillingAccountId) -> Result<i64> {
        Ok(self.load_account(account_id)?.balance_credits)
    }

    fn get_virtual_key(&self, key_id: &VirtualKeyId) -> Result<Option<VirtualKey>> {
        let cf = self.cf(cf::VIRTUAL_KEYS)?;
        self.db
            .get_cf(&cf, keys::virtual_key_key(key_id))
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    fn debit_for_usage(
        &self,
        account_id: &BillingAccountId,
        virtual_key_id: &VirtualKeyId,
        cost_credits: i64,
        request_id: &str,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        if cost_credits < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "negative debit: {cost_credits}"
            )));
        }

        let _guard = self.write_lock.lock().expect("ledger write lock");

        let mut account = self.load_account(account_id)?;
        self.load_virtual_key(virtual_key_id)?;

        if cost_credits == 0 {
            // Zero-cost probe: the gate still requires the account to be in
            // the black, but writes nothing.
            if account.balance_credits <= 0 {
                return Err(LedgerError::InsufficientCredits {
                    balance: account.balance_credits,
                    attempted: 0,
                });
            }
            return Ok(account.balance_credits);
        }

        let new_balance = account.balance_credits - cost_credits;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientCredits {
                balance: account.balance_credits,
                attempted: cost_credits,
            });
        }

        account.balance_credits = new_balance;
        account.updated_at = Utc::now();

        let entry = LedgerEntry::ai_usage(
            *account_id,
            *virtual_key_id,
            cost_credits,
            new_balance,
            request_id.to_string(),
            metadata,
        );

        let mut batch = WriteBatch::default();
        self.stage_entry(&mut batch, &account, &entry)?;
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        Ok(new_balance)
    }

    fn record_charge_receipt(&self, params: ChargeParams) -> Result<()> {
        if params.charged_credits < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "negative charge: {}",
                params.charged_credits
            )));
        }

        let _guard = self.write_lock.lock().expect("ledger write lock");

        // Idempotency probe: one receipt and one charge_receipt entry per
        // request id, ever.
        let cf_receipts = self.cf(cf::RECEIPTS)?;
        let receipt_key = keys::receipt_key(&params.request_id);
        if self
            .db
            .get_cf(&cf_receipts, &receipt_key)
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .is_some()
        {
            tracing::debug!(request_id = %params.request_id, "Charge receipt already recorded");
            return Ok(());
        }

        let mut account = self.load_account(&params.billing_account_id)?;
        self.load_virtual_key(&params.virtual_key_id)?;

        let new_balance = account.balance_credits - params.charged_credits;

        if let Some(floor) = self.settlement_floor {
            if new_balance < floor {
                return Err(LedgerError::SettlementRefused {
                    would_reach: new_balance,
                    floor,
                });
            }
        }

        if new_balance < 0 {
            tracing::error!(
                account_id = %params.billing_account_id,
                request_id = %params.request_id,
                balance = account.balance_credits,
                charged = params.charged_credits,
                new_balance,
                "INVARIANT BREACH: settlement drove balance negative"
            );
        }

        account.balance_credits = new_balance;
        account.updated_at = Utc::now();

        let receipt = ChargeReceipt {
            request_id: params.request_id.clone(),
            billing_account_id: params.billing_account_id,
            virtual_key_id: params.virtual_key_id,
            charged_credits: params.charged_credits,
            provider_call_id: params.provider_call_id,
            provider_cost_usd: params.provider_cost_usd,
            charge_reason: params.charge_reason,
            source_system: params.source_system,
            source_reference: params.source_reference,
            created_at: Utc::now(),
        };

        let entry = LedgerEntry::charge_receipt(
            params.billing_account_id,
            params.virtual_key_id,
            params.charged_credits,
            new_balance,
            params.request_id.clone(),
            params.metadata,
        );

        let cf_index = self.cf(cf::RECEIPTS_BY_ACCOUNT)?;

        let mut batch = WriteBatch::default();
        self.stage_entry(&mut batch, &account, &entry)?;
        batch.put_cf(&cf_receipts, &receipt_key, Self::serialize(&receipt)?);
        batch.put_cf(
            &cf_index,
            keys::account_receipt_key(
                &params.billing_account_id,
                receipt.created_at,
                &params.request_id,
            ),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        Ok(())
    }

    fn credit_account(
        &self,
        account_id: &BillingAccountId,
        amount: i64,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<i64> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "credit must be positive: {amount}"
            )));
        }

        let _guard = self.write_lock.lock().expect("ledger write lock");

        let mut account = self.load_account(account_id)?;

        let cf_default = self.cf(cf::DEFAULT_KEY_BY_ACCOUNT)?;
        let key_bytes = self
            .db
            .get_cf(&cf_default, keys::account_key(account_id))
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .ok_or_else(|| {
                LedgerError::Database(format!("account {account_id} has no default key"))
            })?;
        let mut kb = [0u8; 16];
        kb.copy_from_slice(&key_bytes[..16]);
        let key_id = VirtualKeyId::from_uuid(uuid::Uuid::from_bytes(kb));

        let new_balance = account.balance_credits + amount;
        account.balance_credits = new_balance;
        account.updated_at = Utc::now();

        let mut entry = LedgerEntry::credit(
            *account_id,
            key_id,
            amount,
            new_balance,
            reference.unwrap_or_default(),
        );
        entry.reason = reason;

        let mut batch = WriteBatch::default();
        self.stage_entry(&mut batch, &account, &entry)?;
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        Ok(new_balance)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn list_entries(
        &self,
        account_id: &BillingAccountId,
        limit: usize,
        offset: usize,
        reason: Option<EntryReason>,
    ) -> Result<Vec<LedgerEntry>> {
        let cf_index = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let prefix = keys::account_entries_prefix(account_id);

        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(&prefix, Direction::Forward));

        let mut all_keys: Vec<Vec<u8>> = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| LedgerError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            all_keys.push(key.to_vec());
        }

        // ULID order is chronological; reverse for newest first.
        all_keys.reverse();

        let mut entries = Vec::new();
        let mut skipped = 0;
        for key in all_keys {
            let entry_id = keys::extract_entry_id(&key);
            let Some(entry) = self.get_entry(&keys::entry_key(&entry_id))? else {
                continue;
            };
            if let Some(want) = reason {
                if entry.reason != want {
                    continue;
                }
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if entries.len() >= limit {
                break;
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    fn find_receipt(&self, request_id: &str) -> Result<Option<ChargeReceipt>> {
        let cf = self.cf(cf::RECEIPTS)?;
        self.db
            .get_cf(&cf, keys::receipt_key(request_id))
            .map_err(|e| LedgerError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_receipts(
        &self,
        account_id: &BillingAccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChargeReceipt>> {
        let limit = limit.min(MAX_RECEIPT_PAGE);
        let cf_index = self.cf(cf::RECEIPTS_BY_ACCOUNT)?;
        let cf_receipts = self.cf(cf::RECEIPTS)?;

        let prefix = keys::account_entries_prefix(account_id);
        let mut start = prefix.clone();
        start.extend_from_slice(&from.timestamp_millis().to_be_bytes());

        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(&start, Direction::Forward));

        let mut receipts = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| LedgerError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if keys::extract_receipt_millis(&key) > to.timestamp_millis() {
                break;
            }
            if receipts.len() >= limit {
                break;
            }

            let request_id = keys::extract_receipt_request_id(&key);
            if let Some(data) = self
                .db
                .get_cf(&cf_receipts, keys::receipt_key(&request_id))
                .map_err(|e| LedgerError::Database(e.to_string()))?
            {
                receipts.push(Self::deserialize(&data)?);
            }
        }

        Ok(receipts)
    }
}
