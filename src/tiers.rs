//! Closed tier catalog. Every price, quota and entitlement lives in [`capabilities_of`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub const BYTES_PER_MB: u64 = 1 << 20;
pub const BYTES_PER_GB: u64 = 1 << 30;
pub const BYTES_PER_TB: u64 = 1 << 40;

/// Hours in a billing month; hourly prices are the monthly price divided by this.
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Price returned for the free tier. Large enough that an accidental charge is obvious;
/// callers short-circuit on [`Tier::Free`] before pricing anything.
pub const FREE_TIER_SENTINEL_PRICE: f64 = 9999.0;

pub const FREE_UPLOAD_LIMIT: u64 = 3 * BYTES_PER_GB;
pub const NON_FREE_UPLOAD_LIMIT: u64 = BYTES_PER_TB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Free,
    Paid,
    Partner,
    WhiteLabeled,
}

/// Per-period caps applied to counters on tiers that have them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodLimits {
    pub naming_records: u64,
    pub broadcast_messages: u64,
    pub keys: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierFlags {
    pub can_publish_naming_record: bool,
    pub can_publish_broadcast: bool,
    pub can_create_key: bool,
    pub can_claim_external_name: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierCapabilities {
    pub price_per_gb_month: f64,
    pub price_per_gb_hour: f64,
    pub quota_bytes: u64,
    /// Whether byte increments are rejected past `quota_bytes`.
    pub quota_enforced: bool,
    pub flags: TierFlags,
    pub period_limits: Option<PeriodLimits>,
}

const ALL_FEATURES: TierFlags = TierFlags {
    can_publish_naming_record: true,
    can_publish_broadcast: true,
    can_create_key: true,
    can_claim_external_name: true,
};

/// key: tier-catalog -> pricing,quota,entitlements
pub fn capabilities_of(tier: Tier) -> TierCapabilities {
    match tier {
        Tier::Free => TierCapabilities {
            price_per_gb_month: FREE_TIER_SENTINEL_PRICE,
            price_per_gb_hour: FREE_TIER_SENTINEL_PRICE,
            quota_bytes: FREE_UPLOAD_LIMIT,
            quota_enforced: true,
            flags: TierFlags {
                can_claim_external_name: false,
                ..ALL_FEATURES
            },
            period_limits: Some(PeriodLimits {
                naming_records: 5,
                broadcast_messages: 100,
                keys: 5,
            }),
        },
        Tier::Paid => paid_tier(0.07),
        Tier::Partner => paid_tier(0.05),
        Tier::WhiteLabeled => paid_tier(0.05),
    }
}

fn paid_tier(price_per_gb_month: f64) -> TierCapabilities {
    TierCapabilities {
        price_per_gb_month,
        price_per_gb_hour: price_per_gb_month / HOURS_PER_MONTH,
        quota_bytes: NON_FREE_UPLOAD_LIMIT,
        quota_enforced: false,
        flags: ALL_FEATURES,
        period_limits: None,
    }
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Paid, Tier::Partner, Tier::WhiteLabeled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Paid => "paid",
            Tier::Partner => "partner",
            Tier::WhiteLabeled => "white-labeled",
        }
    }

    pub fn capabilities(&self) -> TierCapabilities {
        capabilities_of(*self)
    }

    pub fn price_per_gb(&self) -> f64 {
        capabilities_of(*self).price_per_gb_month
    }

    pub fn price_per_gb_per_hour(&self) -> f64 {
        capabilities_of(*self).price_per_gb_hour
    }

    /// Tiers that are never billed per byte for an individual account.
    pub fn is_unmetered(&self) -> bool {
        matches!(self, Tier::Free | Tier::WhiteLabeled)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "free" => Ok(Tier::Free),
            "paid" => Ok(Tier::Paid),
            "partner" => Ok(Tier::Partner),
            "white-labeled" => Ok(Tier::WhiteLabeled),
            other => Err(LedgerError::InvalidState(format!("unknown tier `{other}`"))),
        }
    }
}
