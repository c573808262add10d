pub mod billing;
pub mod clock;
pub mod config;
pub mod credits;
pub mod error;
pub mod models;
pub mod pinning;
pub mod refund;
pub mod store;
pub mod tiers;
pub mod uploads;
pub mod usage;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use billing::{BillingItem, BillingReport, OrganizationService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credits::CreditService;
pub use error::{LedgerError, LedgerResult};
pub use models::{Account, Organization, UploadKey, UploadKind, UploadRecord, UsageLedger};
pub use pinning::{PinRemovalReceipt, PinRemovalService, PinRemovalState};
pub use refund::{calculate_refund, quote_refund, RefundQuote, REMOVAL_BUFFER_HOURS};
pub use store::{LedgerStore, LedgerTx, MemoryStore, PgStore};
pub use tiers::Tier;
pub use uploads::{UploadOptions, UploadService, DEFAULT_NETWORK};
pub use usage::{PeriodCounter, UsageService};

/// key: ledger -> every service over one store and one clock
#[derive(Clone)]
pub struct Ledger {
    pub usage: UsageService,
    pub uploads: UploadService,
    pub credits: CreditService,
    pub pins: PinRemovalService,
    pub organizations: OrganizationService,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            usage: UsageService::new(store.clone(), clock.clone()),
            uploads: UploadService::new(store.clone(), clock.clone()),
            credits: CreditService::new(store.clone(), clock.clone()),
            pins: PinRemovalService::new(store.clone(), clock.clone()),
            organizations: OrganizationService::new(store, clock),
        }
    }

    /// In-memory ledger, mostly for tests and embedding.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), clock)
    }

    pub async fn create_usage_entry(&self, account: &str, tier: Tier) -> LedgerResult<UsageLedger> {
        self.usage.create(account, tier).await
    }

    pub async fn find_usage(&self, account: &str) -> LedgerResult<UsageLedger> {
        self.usage.find(account).await
    }

    pub async fn increase_usage(&self, account: &str, delta_bytes: u64) -> LedgerResult<UsageLedger> {
        self.usage.increase_usage(account, delta_bytes).await
    }

    pub async fn change_tier(&self, account: &str, tier: Tier) -> LedgerResult<UsageLedger> {
        self.usage.change_tier(account, tier).await
    }

    pub async fn create_upload(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
        options: UploadOptions,
    ) -> LedgerResult<UploadRecord> {
        self.uploads.create(account, identifier, network, options).await
    }

    pub async fn extend_retention(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
        new_hold_time_months: u32,
    ) -> LedgerResult<UploadRecord> {
        self.uploads
            .extend_retention(account, identifier, network, new_hold_time_months)
            .await
    }

    pub async fn remove_pin(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
    ) -> LedgerResult<PinRemovalReceipt> {
        self.pins.remove_pin(account, identifier, network).await
    }

    pub async fn generate_billing_report(
        &self,
        organization: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<BillingReport> {
        self.organizations
            .generate_billing_report(organization, from, to)
            .await
    }
}
