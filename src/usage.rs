use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::models::UsageLedger;
use crate::store::{LedgerStore, LedgerTx};
use crate::tiers::{capabilities_of, Tier};

/// Counters limited per billing period on capped tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodCounter {
    Broadcast,
    Naming,
    Keys,
}

impl PeriodCounter {
    fn capability(&self) -> &'static str {
        match self {
            PeriodCounter::Broadcast => "broadcast publishing",
            PeriodCounter::Naming => "naming record publishing",
            PeriodCounter::Keys => "key creation",
        }
    }
}

impl UsageLedger {
    /// Adds stored bytes, rejecting the change on quota-capped tiers when it would pass the quota.
    pub fn add_bytes(&mut self, delta: u64) -> LedgerResult<()> {
        let next = self.current_used_bytes.checked_add(delta).ok_or_else(|| {
            LedgerError::Overflow(format!("data usage for `{}` overflows", self.account))
        })?;
        if capabilities_of(self.tier).quota_enforced && next > self.monthly_quota_bytes {
            return Err(LedgerError::QuotaExceeded {
                account: self.account.clone(),
                requested: delta,
                used: self.current_used_bytes,
                limit: self.monthly_quota_bytes,
            });
        }
        self.current_used_bytes = next;
        Ok(())
    }

    pub fn release_bytes(&mut self, delta: u64) -> LedgerResult<()> {
        if delta > self.current_used_bytes {
            return Err(LedgerError::Overflow(format!(
                "cannot release {delta} bytes from `{}`, only {} in use",
                self.account, self.current_used_bytes
            )));
        }
        self.current_used_bytes -= delta;
        Ok(())
    }

    /// Moves the ledger to `tier` and resizes its quota. Once an account has left the free
    /// tier it may never return to it.
    pub fn move_to_tier(&mut self, tier: Tier) -> LedgerResult<()> {
        if tier == Tier::Free && self.tier != Tier::Free {
            return Err(LedgerError::InvalidState(format!(
                "`{}` cannot return to the free tier from {}",
                self.account, self.tier
            )));
        }
        self.tier = tier;
        self.monthly_quota_bytes = capabilities_of(tier).quota_bytes;
        Ok(())
    }

    /// Checks that one more unit of `counter` is allowed without changing anything.
    pub fn ensure_counter_allows(&self, counter: PeriodCounter, count: u64) -> LedgerResult<()> {
        let caps = capabilities_of(self.tier);
        let permitted = match counter {
            PeriodCounter::Broadcast => caps.flags.can_publish_broadcast,
            PeriodCounter::Naming => caps.flags.can_publish_naming_record,
            PeriodCounter::Keys => caps.flags.can_create_key,
        };
        if !permitted {
            return Err(LedgerError::CapabilityDenied {
                tier: self.tier.as_str(),
                capability: counter.capability(),
            });
        }
        let current = self.counter(counter);
        let next = current.checked_add(count).ok_or_else(|| {
            LedgerError::Overflow(format!("{} count for `{}` overflows", counter.capability(), self.account))
        })?;
        if let Some(limits) = caps.period_limits {
            let limit = match counter {
                PeriodCounter::Broadcast => limits.broadcast_messages,
                PeriodCounter::Naming => limits.naming_records,
                PeriodCounter::Keys => limits.keys,
            };
            if next > limit {
                return Err(LedgerError::QuotaExceeded {
                    account: self.account.clone(),
                    requested: count,
                    used: current,
                    limit,
                });
            }
        }
        Ok(())
    }

    pub fn increment_counter(&mut self, counter: PeriodCounter, count: u64) -> LedgerResult<()> {
        self.ensure_counter_allows(counter, count)?;
        let slot = match counter {
            PeriodCounter::Broadcast => &mut self.broadcast_messages_sent,
            PeriodCounter::Naming => &mut self.naming_records_published,
            PeriodCounter::Keys => &mut self.keys_created,
        };
        *slot += count;
        Ok(())
    }

    pub fn counter(&self, counter: PeriodCounter) -> u64 {
        match counter {
            PeriodCounter::Broadcast => self.broadcast_messages_sent,
            PeriodCounter::Naming => self.naming_records_published,
            PeriodCounter::Keys => self.keys_created,
        }
    }

    pub fn reset_period_counters(&mut self) {
        self.broadcast_messages_sent = 0;
        self.naming_records_published = 0;
    }
}

/// key: usage-service -> tier-aware counters
#[derive(Clone)]
pub struct UsageService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl UsageService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create(&self, account: &str, tier: Tier) -> LedgerResult<UsageLedger> {
        let usage = UsageLedger::new(account, tier, self.clock.now());
        let mut tx = self.store.begin().await?;
        if !tx.insert_usage(&usage).await? {
            return Err(LedgerError::already_exists("usage", account));
        }
        tx.commit().await?;
        info!(account, tier = %tier, quota = usage.monthly_quota_bytes, "usage ledger created");
        Ok(usage)
    }

    pub async fn find(&self, account: &str) -> LedgerResult<UsageLedger> {
        let mut tx = self.store.begin().await?;
        let usage = load_usage(tx.as_mut(), account).await?;
        drop(tx);
        debug!(account, used = usage.current_used_bytes, "usage ledger read");
        Ok(usage)
    }

    pub async fn increase_usage(&self, account: &str, delta_bytes: u64) -> LedgerResult<UsageLedger> {
        let usage = self
            .mutate(account, |usage| usage.add_bytes(delta_bytes))
            .await?;
        info!(account, delta_bytes, used = usage.current_used_bytes, "data usage increased");
        Ok(usage)
    }

    pub async fn decrease_usage(&self, account: &str, delta_bytes: u64) -> LedgerResult<UsageLedger> {
        let usage = self
            .mutate(account, |usage| usage.release_bytes(delta_bytes))
            .await?;
        info!(account, delta_bytes, used = usage.current_used_bytes, "data usage reduced");
        Ok(usage)
    }

    pub async fn change_tier(&self, account: &str, tier: Tier) -> LedgerResult<UsageLedger> {
        let usage = self.mutate(account, |usage| usage.move_to_tier(tier)).await?;
        info!(account, tier = %tier, quota = usage.monthly_quota_bytes, "tier changed");
        Ok(usage)
    }

    pub async fn increment_broadcast_usage(&self, account: &str, count: u64) -> LedgerResult<UsageLedger> {
        self.increment(account, PeriodCounter::Broadcast, count).await
    }

    pub async fn increment_naming_usage(&self, account: &str, count: u64) -> LedgerResult<UsageLedger> {
        self.increment(account, PeriodCounter::Naming, count).await
    }

    pub async fn increment_key_count(&self, account: &str, count: u64) -> LedgerResult<UsageLedger> {
        self.increment(account, PeriodCounter::Keys, count).await
    }

    /// Lowers the key count, stopping at zero.
    pub async fn reduce_key_count(&self, account: &str, count: u64) -> LedgerResult<UsageLedger> {
        self.mutate(account, |usage| {
            usage.keys_created = usage.keys_created.saturating_sub(count);
            Ok(())
        })
        .await
    }

    pub async fn can_publish_naming_record(&self, account: &str) -> LedgerResult<()> {
        self.find(account)
            .await?
            .ensure_counter_allows(PeriodCounter::Naming, 1)
    }

    pub async fn can_publish_broadcast(&self, account: &str) -> LedgerResult<()> {
        self.find(account)
            .await?
            .ensure_counter_allows(PeriodCounter::Broadcast, 1)
    }

    pub async fn can_create_key(&self, account: &str) -> LedgerResult<()> {
        self.find(account)
            .await?
            .ensure_counter_allows(PeriodCounter::Keys, 1)
    }

    pub async fn upload_price_per_gb(&self, account: &str) -> LedgerResult<f64> {
        Ok(self.find(account).await?.tier.price_per_gb())
    }

    pub async fn claim_external_name(&self, account: &str) -> LedgerResult<UsageLedger> {
        self.mutate(account, |usage| {
            if !capabilities_of(usage.tier).flags.can_claim_external_name {
                return Err(LedgerError::CapabilityDenied {
                    tier: usage.tier.as_str(),
                    capability: "external name claims",
                });
            }
            if usage.claimed_external_name {
                return Err(LedgerError::InvalidState(format!(
                    "`{}` has already claimed an external name",
                    usage.account
                )));
            }
            usage.claimed_external_name = true;
            Ok(())
        })
        .await
    }

    pub async fn unclaim_external_name(&self, account: &str) -> LedgerResult<UsageLedger> {
        self.mutate(account, |usage| {
            if !usage.claimed_external_name {
                return Err(LedgerError::InvalidState(format!(
                    "`{}` has no external name claimed",
                    usage.account
                )));
            }
            usage.claimed_external_name = false;
            Ok(())
        })
        .await
    }

    pub async fn start_storage_trial(&self, account: &str) -> LedgerResult<UsageLedger> {
        self.mutate(account, |usage| {
            if usage.tier != Tier::Free || usage.started_storage_trial {
                return Err(LedgerError::InvalidState(format!(
                    "`{}` is not eligible for a storage trial",
                    usage.account
                )));
            }
            usage.started_storage_trial = true;
            Ok(())
        })
        .await
    }

    /// Invoked by the billing-cycle scheduler only.
    pub async fn reset_period_counters(&self, account: &str) -> LedgerResult<UsageLedger> {
        let usage = self
            .mutate(account, |usage| {
                usage.reset_period_counters();
                Ok(())
            })
            .await?;
        info!(account, "period counters reset");
        Ok(usage)
    }

    pub async fn accounts(&self) -> LedgerResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        tx.usage_accounts().await
    }

    async fn increment(
        &self,
        account: &str,
        counter: PeriodCounter,
        count: u64,
    ) -> LedgerResult<UsageLedger> {
        let usage = self
            .mutate(account, |usage| usage.increment_counter(counter, count))
            .await?;
        info!(
            account,
            ?counter,
            count,
            total = usage.counter(counter),
            "usage counter incremented"
        );
        Ok(usage)
    }

    /// Read-modify-write of one ledger inside a single unit of work. Nothing is written
    /// when `apply` fails.
    async fn mutate<F>(&self, account: &str, apply: F) -> LedgerResult<UsageLedger>
    where
        F: FnOnce(&mut UsageLedger) -> LedgerResult<()> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut usage = load_usage(tx.as_mut(), account).await?;
        apply(&mut usage)?;
        usage.updated_at = self.clock.now();
        tx.update_usage(&usage).await?;
        tx.commit().await?;
        Ok(usage)
    }
}

pub(crate) async fn load_usage(tx: &mut dyn LedgerTx, account: &str) -> LedgerResult<UsageLedger> {
    tx.usage(account)
        .await?
        .ok_or_else(|| LedgerError::not_found("usage", account))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::{BYTES_PER_GB, BYTES_PER_MB, FREE_UPLOAD_LIMIT, NON_FREE_UPLOAD_LIMIT};
    use chrono::Utc;

    fn ledger(tier: Tier) -> UsageLedger {
        UsageLedger::new("tester", tier, Utc::now())
    }

    #[test]
    fn free_tier_rejects_bytes_past_quota_without_mutation() {
        let mut usage = ledger(Tier::Free);
        usage.add_bytes(2 * BYTES_PER_GB).unwrap();

        let err = usage.add_bytes(2 * BYTES_PER_GB).unwrap_err();
        assert!(matches!(err, LedgerError::QuotaExceeded { limit, .. } if limit == FREE_UPLOAD_LIMIT));
        assert_eq!(usage.current_used_bytes, 2 * BYTES_PER_GB);

        usage.add_bytes(100 * BYTES_PER_MB).unwrap();
        assert_eq!(usage.current_used_bytes, 2 * BYTES_PER_GB + 100 * BYTES_PER_MB);
    }

    #[test]
    fn paid_tiers_are_not_capped() {
        let mut usage = ledger(Tier::Paid);
        usage.add_bytes(NON_FREE_UPLOAD_LIMIT + 1).unwrap();
        assert!(usage.current_used_bytes > usage.monthly_quota_bytes);
    }

    #[test]
    fn releasing_more_than_used_is_overflow() {
        let mut usage = ledger(Tier::Paid);
        usage.add_bytes(10).unwrap();
        assert!(matches!(usage.release_bytes(11), Err(LedgerError::Overflow(_))));
        assert_eq!(usage.current_used_bytes, 10);
        usage.release_bytes(10).unwrap();
        assert_eq!(usage.current_used_bytes, 0);
    }

    #[test]
    fn tier_changes_never_return_to_free() {
        let mut usage = ledger(Tier::Free);
        usage.move_to_tier(Tier::Free).unwrap();
        usage.move_to_tier(Tier::Paid).unwrap();
        assert_eq!(usage.monthly_quota_bytes, NON_FREE_UPLOAD_LIMIT);
        usage.move_to_tier(Tier::Partner).unwrap();
        usage.move_to_tier(Tier::Paid).unwrap();

        assert!(matches!(
            usage.move_to_tier(Tier::Free),
            Err(LedgerError::InvalidState(_))
        ));
        assert_eq!(usage.tier, Tier::Paid);
    }

    #[test]
    fn free_tier_counters_are_capped_per_period() {
        let mut usage = ledger(Tier::Free);
        usage.increment_counter(PeriodCounter::Naming, 5).unwrap();
        let err = usage
            .increment_counter(PeriodCounter::Naming, 1)
            .unwrap_err();
        assert!(matches!(err, LedgerError::QuotaExceeded { used: 5, limit: 5, .. }));

        usage.reset_period_counters();
        assert_eq!(usage.naming_records_published, 0);
        usage.increment_counter(PeriodCounter::Naming, 1).unwrap();
    }

    #[test]
    fn reset_keeps_key_count() {
        let mut usage = ledger(Tier::Paid);
        usage.increment_counter(PeriodCounter::Keys, 3).unwrap();
        usage.increment_counter(PeriodCounter::Broadcast, 500).unwrap();
        usage.reset_period_counters();
        assert_eq!(usage.keys_created, 3);
        assert_eq!(usage.broadcast_messages_sent, 0);
    }
}
