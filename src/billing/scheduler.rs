use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config;
use crate::error::LedgerResult;
use crate::models::UploadKey;
use crate::uploads::UploadService;
use crate::usage::UsageService;

/// Upload whose retention has lapsed and may be dropped by the storage fabric.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiredUpload {
    pub key: UploadKey,
    pub deadline: DateTime<Utc>,
    pub size_bytes: u64,
}

/// key: maintenance-scheduler -> billing-cycle resets and expired upload scans
///
/// This is the external driver; ledger operations themselves never poll.
pub fn spawn(
    usage: UsageService,
    uploads: UploadService,
    clock: Arc<dyn Clock>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let reset_every = TokioDuration::from_secs(*config::USAGE_RESET_INTERVAL_SECS);
    let scan_every = TokioDuration::from_secs(*config::GC_SCAN_INTERVAL_SECS);

    let resets = tokio::spawn(async move {
        // first reset happens one full cycle after start
        let now = Instant::now();
        let first = now.checked_add(reset_every).unwrap_or_else(|| {
            warn!(secs = reset_every.as_secs(), "reset interval out of range, resetting now");
            now
        });
        let mut ticker = time::interval_at(first, reset_every);
        loop {
            ticker.tick().await;
            if let Err(err) = process_reset_tick(&usage).await {
                warn!(?err, "usage reset tick failed");
            }
        }
    });

    let scans = tokio::spawn(async move {
        let mut ticker = time::interval(scan_every);
        loop {
            ticker.tick().await;
            if let Err(err) = collect_expired(&uploads, clock.now()).await {
                warn!(?err, "expired upload scan failed");
            }
        }
    });

    (resets, scans)
}

/// key: maintenance-scheduler -> reset tick handler
///
/// Resets every ledger's period counters. A failing account is logged and skipped.
pub async fn process_reset_tick(usage: &UsageService) -> LedgerResult<usize> {
    let accounts = usage.accounts().await?;
    let mut reset = 0;
    for account in &accounts {
        match usage.reset_period_counters(account).await {
            Ok(_) => reset += 1,
            Err(err) => warn!(
                account = %account,
                error = err.kind(),
                "failed to reset period counters"
            ),
        }
    }
    info!(reset, total = accounts.len(), "period counters reset for billing cycle");
    Ok(reset)
}

/// key: maintenance-scheduler -> expired upload scan
pub async fn collect_expired(
    uploads: &UploadService,
    now: DateTime<Utc>,
) -> LedgerResult<Vec<ExpiredUpload>> {
    let expired: Vec<ExpiredUpload> = uploads
        .expiring_before(now)
        .await?
        .into_iter()
        .map(|upload| ExpiredUpload {
            key: upload.key(),
            deadline: upload.garbage_collect_deadline,
            size_bytes: upload.size_bytes,
        })
        .collect();

    for upload in &expired {
        debug!(key = %upload.key, deadline = %upload.deadline, "upload past retention");
    }
    info!(expired = expired.len(), "expired upload scan complete");
    Ok(expired)
}
