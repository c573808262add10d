use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::UploadRecord;

/// key: billing-report -> organization read model, never persisted
#[derive(Debug, Clone, Serialize)]
pub struct BillingReport {
    pub org_name: String,
    pub items: Vec<BillingItem>,
    /// Amount owed by the organization at generation time.
    pub amount_due: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

impl BillingReport {
    pub fn total_bytes(&self) -> u64 {
        self.items
            .iter()
            .flat_map(|item| item.uploads.iter())
            .fold(0u64, |total, upload| total.saturating_add(upload.size_bytes))
    }
}

/// key: billing-item -> one member's uploads within the report window
#[derive(Debug, Clone, Serialize)]
pub struct BillingItem {
    pub account: String,
    pub uploads: Vec<UploadRecord>,
}
