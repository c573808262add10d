//! Transactional persistence seam for the ledger.
//!
//! Every ledger operation opens one unit of work with [`LedgerStore::begin`], reads and
//! writes through it, and calls [`LedgerTx::commit`]. Dropping a unit of work without
//! committing discards everything it staged.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LedgerResult;
use crate::models::{Account, Organization, UploadKey, UploadRecord, UsageLedger};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// key: ledger-store -> unit-of-work factory
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>>;
}

/// key: ledger-tx -> reads,conditional writes,commit
///
/// Rows read through a unit of work stay locked against other writers until it ends.
/// Operations that lock several rows take them in one order: organization, account,
/// usage ledger, upload. Two units touching the same rows then wait on each other
/// instead of deadlocking.
#[async_trait]
pub trait LedgerTx: Send {
    async fn usage(&mut self, account: &str) -> LedgerResult<Option<UsageLedger>>;
    /// Returns `false` when a ledger for the account already exists.
    async fn insert_usage(&mut self, usage: &UsageLedger) -> LedgerResult<bool>;
    async fn update_usage(&mut self, usage: &UsageLedger) -> LedgerResult<()>;
    async fn usage_accounts(&mut self) -> LedgerResult<Vec<String>>;

    async fn account(&mut self, name: &str) -> LedgerResult<Option<Account>>;
    /// Returns `false` when the account already exists.
    async fn insert_account(&mut self, account: &Account) -> LedgerResult<bool>;
    async fn update_account(&mut self, account: &Account) -> LedgerResult<()>;
    async fn delete_account(&mut self, name: &str) -> LedgerResult<bool>;

    async fn upload(&mut self, key: &UploadKey) -> LedgerResult<Option<UploadRecord>>;
    /// Returns `false` when an upload with the same key already exists.
    async fn insert_upload(&mut self, upload: &UploadRecord) -> LedgerResult<bool>;
    /// Writes `upload` only if the stored deadline still equals `expected_deadline`.
    /// Returns `false` when the row changed underneath or vanished.
    async fn update_upload(
        &mut self,
        upload: &UploadRecord,
        expected_deadline: DateTime<Utc>,
    ) -> LedgerResult<bool>;
    async fn delete_upload(&mut self, key: &UploadKey) -> LedgerResult<bool>;
    async fn uploads_by_network(&mut self, network: &str) -> LedgerResult<Vec<UploadRecord>>;
    async fn uploads_by_identifier(&mut self, identifier: &str)
        -> LedgerResult<Vec<UploadRecord>>;
    async fn uploads_for_account(&mut self, account: &str) -> LedgerResult<Vec<UploadRecord>>;
    /// Uploads whose anchor time (last update, else creation) lies within `[from, to]`.
    async fn uploads_for_account_between(
        &mut self,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Vec<UploadRecord>>;
    async fn uploads_expiring_before(
        &mut self,
        instant: DateTime<Utc>,
    ) -> LedgerResult<Vec<UploadRecord>>;
    async fn all_uploads(&mut self) -> LedgerResult<Vec<UploadRecord>>;

    async fn organization(&mut self, name: &str) -> LedgerResult<Option<Organization>>;
    async fn organization_owned_by(&mut self, owner: &str) -> LedgerResult<Option<Organization>>;
    /// Returns `false` when an organization with the same name already exists. An owner
    /// that already has an organization fails with `AlreadyExists`.
    async fn insert_organization(&mut self, organization: &Organization) -> LedgerResult<bool>;
    async fn update_organization(&mut self, organization: &Organization) -> LedgerResult<()>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;
}
