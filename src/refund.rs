//! Prorated refunds for uploads removed before their paid retention elapses.
//!
//! The computation may under-refund but never over-refunds: the deadline is pulled in by
//! the removal buffer, stored time is subtracted from what remains, and the buffer is
//! taken off the refundable hours once more. Pinning and immediately unpinning therefore
//! always costs at least the buffer.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};
use crate::models::UploadRecord;
use crate::tiers::{Tier, BYTES_PER_GB};

/// Minimum charged storage time for any removal.
pub const REMOVAL_BUFFER_HOURS: i64 = 72;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// key: refund-quote -> hours and credit returned for an early removal
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RefundQuote {
    pub refundable_hours: f64,
    pub amount: f64,
}

impl RefundQuote {
    const NONE: RefundQuote = RefundQuote {
        refundable_hours: 0.0,
        amount: 0.0,
    };
}

pub fn calculate_refund(upload: &UploadRecord, tier: Tier, now: DateTime<Utc>) -> LedgerResult<f64> {
    quote_refund(upload, tier, now).map(|quote| quote.amount)
}

/// key: refund-calculator -> buffered, hour-truncated proration
pub fn quote_refund(
    upload: &UploadRecord,
    tier: Tier,
    now: DateTime<Utc>,
) -> LedgerResult<RefundQuote> {
    if tier.is_unmetered() {
        return Ok(RefundQuote::NONE);
    }

    let anchor = upload.anchor();
    if upload.garbage_collect_deadline < upload.created_at {
        return Err(LedgerError::InvalidState(format!(
            "upload {} has a deadline before its creation",
            upload.key()
        )));
    }

    // Anchors ahead of `now` (clock skew) count as zero stored time.
    let stored = (now - anchor).max(Duration::zero());
    let buffer = Duration::hours(REMOVAL_BUFFER_HOURS);
    let buffered_deadline = upload
        .garbage_collect_deadline
        .checked_sub_signed(buffer)
        .ok_or_else(|| LedgerError::Overflow("buffered deadline out of range".to_string()))?;
    let remaining = Duration::hours((buffered_deadline - now).num_hours());

    let refundable = remaining - stored;
    let refundable_hours = refundable.num_seconds() as f64 / SECONDS_PER_HOUR;
    let buffer_hours = REMOVAL_BUFFER_HOURS as f64;
    if refundable_hours <= buffer_hours {
        return Ok(RefundQuote::NONE);
    }
    let refundable_hours = refundable_hours - buffer_hours;

    let size_gb = upload.size_bytes as f64 / BYTES_PER_GB as f64;
    let amount = (size_gb * tier.price_per_gb_per_hour() * refundable_hours).max(0.0);
    Ok(RefundQuote {
        refundable_hours,
        amount,
    })
}

/// Full price of the retention still ahead of `now`, with no buffers applied.
/// Refunds never exceed this.
pub fn unconsumed_retention_value(upload: &UploadRecord, tier: Tier, now: DateTime<Utc>) -> f64 {
    if tier.is_unmetered() {
        return 0.0;
    }
    let hours = (upload.garbage_collect_deadline - now).num_seconds() as f64 / SECONDS_PER_HOUR;
    let size_gb = upload.size_bytes as f64 / BYTES_PER_GB as f64;
    (size_gb * tier.price_per_gb_per_hour() * hours).max(0.0)
}
