use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, Organization, UploadKey, UploadRecord, UsageLedger};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    usage: BTreeMap<String, UsageLedger>,
    accounts: BTreeMap<String, Account>,
    uploads: BTreeMap<UploadKey, UploadRecord>,
    organizations: BTreeMap<String, Organization>,
}

/// key: memory-store -> single-writer in-process backend
///
/// A unit of work holds the state lock for its whole lifetime and edits a staged copy,
/// so concurrent units run one after another and nothing is visible before commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

impl MemoryTx {
    fn uploads_where<F>(&self, predicate: F) -> Vec<UploadRecord>
    where
        F: Fn(&UploadRecord) -> bool,
    {
        let mut uploads: Vec<UploadRecord> = self
            .staged
            .uploads
            .values()
            .filter(|upload| predicate(upload))
            .cloned()
            .collect();
        uploads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        uploads
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn usage(&mut self, account: &str) -> LedgerResult<Option<UsageLedger>> {
        Ok(self.staged.usage.get(account).cloned())
    }

    async fn insert_usage(&mut self, usage: &UsageLedger) -> LedgerResult<bool> {
        if self.staged.usage.contains_key(&usage.account) {
            return Ok(false);
        }
        self.staged
            .usage
            .insert(usage.account.clone(), usage.clone());
        Ok(true)
    }

    async fn update_usage(&mut self, usage: &UsageLedger) -> LedgerResult<()> {
        if let Some(existing) = self.staged.usage.get_mut(&usage.account) {
            *existing = usage.clone();
        }
        Ok(())
    }

    async fn usage_accounts(&mut self) -> LedgerResult<Vec<String>> {
        Ok(self.staged.usage.keys().cloned().collect())
    }

    async fn account(&mut self, name: &str) -> LedgerResult<Option<Account>> {
        Ok(self.staged.accounts.get(name).cloned())
    }

    async fn insert_account(&mut self, account: &Account) -> LedgerResult<bool> {
        if self.staged.accounts.contains_key(&account.name) {
            return Ok(false);
        }
        self.staged
            .accounts
            .insert(account.name.clone(), account.clone());
        Ok(true)
    }

    async fn update_account(&mut self, account: &Account) -> LedgerResult<()> {
        if let Some(existing) = self.staged.accounts.get_mut(&account.name) {
            *existing = account.clone();
        }
        Ok(())
    }

    async fn delete_account(&mut self, name: &str) -> LedgerResult<bool> {
        Ok(self.staged.accounts.remove(name).is_some())
    }

    async fn upload(&mut self, key: &UploadKey) -> LedgerResult<Option<UploadRecord>> {
        Ok(self.staged.uploads.get(key).cloned())
    }

    async fn insert_upload(&mut self, upload: &UploadRecord) -> LedgerResult<bool> {
        let key = upload.key();
        if self.staged.uploads.contains_key(&key) {
            return Ok(false);
        }
        self.staged.uploads.insert(key, upload.clone());
        Ok(true)
    }

    async fn update_upload(
        &mut self,
        upload: &UploadRecord,
        expected_deadline: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        match self.staged.uploads.get_mut(&upload.key()) {
            Some(existing) if existing.garbage_collect_deadline == expected_deadline => {
                *existing = upload.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_upload(&mut self, key: &UploadKey) -> LedgerResult<bool> {
        Ok(self.staged.uploads.remove(key).is_some())
    }

    async fn uploads_by_network(&mut self, network: &str) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self.uploads_where(|upload| upload.network == network))
    }

    async fn uploads_by_identifier(
        &mut self,
        identifier: &str,
    ) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self.uploads_where(|upload| upload.identifier == identifier))
    }

    async fn uploads_for_account(&mut self, account: &str) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self.uploads_where(|upload| upload.account == account))
    }

    async fn uploads_for_account_between(
        &mut self,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self.uploads_where(|upload| {
            let anchor = upload.anchor();
            upload.account == account && anchor >= from && anchor <= to
        }))
    }

    async fn uploads_expiring_before(
        &mut self,
        instant: DateTime<Utc>,
    ) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self.uploads_where(|upload| upload.garbage_collect_deadline < instant))
    }

    async fn all_uploads(&mut self) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self.uploads_where(|_| true))
    }

    async fn organization(&mut self, name: &str) -> LedgerResult<Option<Organization>> {
        Ok(self.staged.organizations.get(name).cloned())
    }

    async fn organization_owned_by(&mut self, owner: &str) -> LedgerResult<Option<Organization>> {
        Ok(self
            .staged
            .organizations
            .values()
            .find(|organization| organization.owner == owner)
            .cloned())
    }

    async fn insert_organization(&mut self, organization: &Organization) -> LedgerResult<bool> {
        if self.staged.organizations.contains_key(&organization.name) {
            return Ok(false);
        }
        if self
            .staged
            .organizations
            .values()
            .any(|existing| existing.owner == organization.owner)
        {
            return Err(LedgerError::already_exists(
                "organization owner",
                organization.owner.as_str(),
            ));
        }
        self.staged
            .organizations
            .insert(organization.name.clone(), organization.clone());
        Ok(true)
    }

    async fn update_organization(&mut self, organization: &Organization) -> LedgerResult<()> {
        if let Some(existing) = self.staged.organizations.get_mut(&organization.name) {
            *existing = organization.clone();
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
