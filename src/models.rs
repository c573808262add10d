use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::tiers::{capabilities_of, Tier};

/// key: usage-model -> per-account counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub account: String,
    pub tier: Tier,
    pub current_used_bytes: u64,
    pub monthly_quota_bytes: u64,
    pub broadcast_messages_sent: u64,
    pub naming_records_published: u64,
    pub keys_created: u64,
    pub claimed_external_name: bool,
    pub started_storage_trial: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageLedger {
    pub fn new(account: impl Into<String>, tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            account: account.into(),
            tier,
            current_used_bytes: 0,
            monthly_quota_bytes: capabilities_of(tier).quota_bytes,
            broadcast_messages_sent: 0,
            naming_records_published: 0,
            keys_created: 0,
            claimed_external_name: false,
            started_storage_trial: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// key: account-model -> credit balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub credits: f64,
    pub organization: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            credits: 0.0,
            organization: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    File,
    Pin,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::File => "file",
            UploadKind::Pin => "pin",
        }
    }
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadKind {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "file" => Ok(UploadKind::File),
            "pin" => Ok(UploadKind::Pin),
            other => Err(LedgerError::InvalidState(format!(
                "unknown upload kind `{other}`"
            ))),
        }
    }
}

/// Unique key of an upload record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadKey {
    pub account: String,
    pub identifier: String,
    pub network: String,
}

impl UploadKey {
    pub fn new(
        account: impl Into<String>,
        identifier: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            identifier: identifier.into(),
            network: network.into(),
        }
    }
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.account, self.identifier, self.network)
    }
}

/// key: upload-model -> retention record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub account: String,
    pub identifier: String,
    pub kind: UploadKind,
    pub network: String,
    pub hold_time_months: u32,
    pub size_bytes: u64,
    pub garbage_collect_deadline: DateTime<Utc>,
    pub file_name: Option<String>,
    pub file_name_lower: Option<String>,
    pub extension: Option<String>,
    pub encrypted: bool,
    pub directory: bool,
    pub created_at: DateTime<Utc>,
    /// Absent until the record is first updated after creation.
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    pub fn key(&self) -> UploadKey {
        UploadKey::new(&self.account, &self.identifier, &self.network)
    }

    /// Start of the currently paid retention period.
    pub fn anchor(&self) -> DateTime<Utc> {
        self.last_updated_at.unwrap_or(self.created_at)
    }
}

/// key: organization-model -> white-labeled billing aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub owner: String,
    pub amount_owed: f64,
    pub registered_members: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
