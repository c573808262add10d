use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::models::{BillingItem, BillingReport};
use crate::clock::Clock;
use crate::config;
use crate::credits::load_account;
use crate::error::{LedgerError, LedgerResult};
use crate::models::Organization;
use crate::store::{LedgerStore, LedgerTx};
use crate::tiers::Tier;
use crate::usage::load_usage;

/// key: organization-service -> white-labeled membership and aggregate billing
#[derive(Clone)]
pub struct OrganizationService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl OrganizationService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_organization(&self, name: &str, owner: &str) -> LedgerResult<Organization> {
        let now = self.clock.now();
        let organization = Organization {
            name: name.to_string(),
            owner: owner.to_string(),
            amount_owed: 0.0,
            registered_members: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let mut tx = self.store.begin().await?;
        if tx.organization(name).await?.is_some() {
            return Err(LedgerError::already_exists("organization", name));
        }
        if tx.organization_owned_by(owner).await?.is_some() {
            return Err(LedgerError::already_exists("organization owner", owner));
        }
        if !tx.insert_organization(&organization).await? {
            return Err(LedgerError::already_exists("organization", name));
        }
        tx.commit().await?;
        info!(organization = name, owner, "organization created");
        Ok(organization)
    }

    pub async fn find(&self, name: &str) -> LedgerResult<Organization> {
        let mut tx = self.store.begin().await?;
        load_organization(tx.as_mut(), name).await
    }

    pub async fn members(&self, name: &str) -> LedgerResult<Vec<String>> {
        Ok(self.find(name).await?.registered_members)
    }

    /// Enrolls an existing account, switching its ledger to organization billing.
    pub async fn register_member(&self, name: &str, account: &str) -> LedgerResult<Organization> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut organization = load_organization(tx.as_mut(), name).await?;
        if organization
            .registered_members
            .iter()
            .any(|member| member == account)
        {
            return Err(LedgerError::already_exists(
                "organization member",
                format!("{name}/{account}"),
            ));
        }

        let mut member = load_account(tx.as_mut(), account).await?;
        let mut usage = load_usage(tx.as_mut(), account).await?;
        usage.move_to_tier(Tier::WhiteLabeled)?;
        usage.updated_at = now;
        member.organization = Some(name.to_string());
        member.updated_at = now;
        organization.registered_members.push(account.to_string());
        organization.updated_at = now;

        tx.update_usage(&usage).await?;
        tx.update_account(&member).await?;
        tx.update_organization(&organization).await?;
        tx.commit().await?;

        info!(organization = name, account, "organization member registered");
        Ok(organization)
    }

    pub async fn increase_amount_owed(&self, name: &str, amount: f64) -> LedgerResult<Organization> {
        let organization = self
            .adjust_amount_owed(name, |owed| {
                if !amount.is_finite() || amount < 0.0 {
                    return Err(LedgerError::InvalidState(format!(
                        "amount owed increase must be finite and non-negative, got {amount}"
                    )));
                }
                let next = owed + amount;
                if !next.is_finite() {
                    return Err(LedgerError::Overflow("amount owed overflows".to_string()));
                }
                Ok(next)
            })
            .await?;
        info!(organization = name, amount, owed = organization.amount_owed, "amount owed increased");
        Ok(organization)
    }

    pub async fn decrease_amount_owed(&self, name: &str, amount: f64) -> LedgerResult<Organization> {
        let organization = self
            .adjust_amount_owed(name, |owed| {
                if !amount.is_finite() || amount < 0.0 {
                    return Err(LedgerError::InvalidState(format!(
                        "amount owed decrease must be finite and non-negative, got {amount}"
                    )));
                }
                if amount > owed {
                    return Err(LedgerError::Overflow(format!(
                        "cannot decrease amount owed of {owed} by {amount}"
                    )));
                }
                Ok(owed - amount)
            })
            .await?;
        info!(organization = name, amount, owed = organization.amount_owed, "amount owed decreased");
        Ok(organization)
    }

    /// Sum of the current data usage of every member.
    pub async fn total_storage_used(&self, name: &str) -> LedgerResult<u64> {
        let mut tx = self.store.begin().await?;
        let organization = load_organization(tx.as_mut(), name).await?;
        let mut total: u64 = 0;
        for member in &organization.registered_members {
            let usage = load_usage(tx.as_mut(), member).await?;
            total = total
                .checked_add(usage.current_used_bytes)
                .ok_or_else(|| LedgerError::Overflow(format!("storage total for `{name}` overflows")))?;
        }
        Ok(total)
    }

    /// Collects each member's uploads anchored inside `[from, to]`. Members that no longer
    /// exist, or whose uploads cannot be read, are skipped rather than failing the report.
    pub async fn generate_billing_report(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<BillingReport> {
        let organization = self.find(name).await?;
        let mut items = Vec::new();
        for member in &organization.registered_members {
            match self.member_item(member, from, to).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {
                    debug!(organization = name, account = %member, "no uploads in report window");
                }
                Err(err) => {
                    warn!(
                        organization = name,
                        account = %member,
                        error = err.kind(),
                        "skipping member in billing report"
                    );
                }
            }
        }

        let report = BillingReport {
            org_name: organization.name,
            items,
            amount_due: organization.amount_owed,
            window_start: from,
            window_end: to,
            generated_at: self.clock.now(),
        };
        info!(
            organization = name,
            members = report.items.len(),
            amount_due = report.amount_due,
            "billing report generated"
        );
        Ok(report)
    }

    /// Report over the trailing `BILLING_REPORT_WINDOW_DAYS`.
    pub async fn generate_recent_billing_report(&self, name: &str) -> LedgerResult<BillingReport> {
        self.generate_trailing_billing_report(name, *config::BILLING_REPORT_WINDOW_DAYS)
            .await
    }

    /// Report over the `days` leading up to now.
    pub async fn generate_trailing_billing_report(
        &self,
        name: &str,
        days: i64,
    ) -> LedgerResult<BillingReport> {
        let to = self.clock.now();
        let from = Duration::try_days(days)
            .and_then(|window| to.checked_sub_signed(window))
            .ok_or_else(|| {
                LedgerError::Overflow(format!("report window of {days} days is out of range"))
            })?;
        self.generate_billing_report(name, from, to).await
    }

    async fn member_item(
        &self,
        member: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Option<BillingItem>> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), member).await?;
        let uploads = tx.uploads_for_account_between(member, from, to).await?;
        if uploads.is_empty() {
            return Ok(None);
        }
        Ok(Some(BillingItem {
            account: member.to_string(),
            uploads,
        }))
    }

    async fn adjust_amount_owed<F>(&self, name: &str, apply: F) -> LedgerResult<Organization>
    where
        F: FnOnce(f64) -> LedgerResult<f64> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut organization = load_organization(tx.as_mut(), name).await?;
        organization.amount_owed = apply(organization.amount_owed)?;
        organization.updated_at = self.clock.now();
        tx.update_organization(&organization).await?;
        tx.commit().await?;
        Ok(organization)
    }
}

async fn load_organization(tx: &mut dyn LedgerTx, name: &str) -> LedgerResult<Organization> {
    tx.organization(name)
        .await?
        .ok_or_else(|| LedgerError::not_found("organization", name))
}
