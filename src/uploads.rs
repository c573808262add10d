use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{UploadKey, UploadKind, UploadRecord};
use crate::store::{LedgerStore, LedgerTx};
use crate::usage::load_usage;

pub const DEFAULT_NETWORK: &str = "public";

/// key: upload-options -> per-upload metadata
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub kind: UploadKind,
    pub hold_time_months: u32,
    pub size_bytes: u64,
    pub file_name: Option<String>,
    pub encrypted: bool,
    pub directory: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            kind: UploadKind::Pin,
            hold_time_months: 1,
            size_bytes: 0,
            file_name: None,
            encrypted: false,
            directory: false,
        }
    }
}

/// Instant at which content held for `hold_time_months` from `from` becomes collectable.
pub fn garbage_collect_deadline(
    from: DateTime<Utc>,
    hold_time_months: u32,
) -> LedgerResult<DateTime<Utc>> {
    from.checked_add_months(Months::new(hold_time_months))
        .ok_or_else(|| {
            LedgerError::Overflow(format!("hold time of {hold_time_months} months is out of range"))
        })
}

/// key: upload-service -> retention records
#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl UploadService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records a new upload and charges its size to the owner's usage ledger in one unit
    /// of work.
    pub async fn create(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
        options: UploadOptions,
    ) -> LedgerResult<UploadRecord> {
        let now = self.clock.now();
        let key = UploadKey::new(account, identifier, network);
        let mut tx = self.store.begin().await?;
        let mut usage = load_usage(tx.as_mut(), account).await?;
        if tx.upload(&key).await?.is_some() {
            return Err(LedgerError::already_exists("upload", key.to_string()));
        }
        usage.add_bytes(options.size_bytes)?;
        usage.updated_at = now;

        let file_name_lower = options.file_name.as_ref().map(|name| name.to_lowercase());
        let extension = options.file_name.as_deref().and_then(file_extension);
        let upload = UploadRecord {
            id: Uuid::new_v4(),
            account: account.to_string(),
            identifier: identifier.to_string(),
            kind: options.kind,
            network: network.to_string(),
            hold_time_months: options.hold_time_months,
            size_bytes: options.size_bytes,
            garbage_collect_deadline: garbage_collect_deadline(now, options.hold_time_months)?,
            file_name: options.file_name,
            file_name_lower,
            extension,
            encrypted: options.encrypted,
            directory: options.directory,
            created_at: now,
            last_updated_at: None,
        };

        if !tx.insert_upload(&upload).await? {
            return Err(LedgerError::already_exists("upload", key.to_string()));
        }
        tx.update_usage(&usage).await?;
        tx.commit().await?;

        info!(
            account,
            identifier,
            network,
            kind = %upload.kind,
            size_bytes = upload.size_bytes,
            deadline = %upload.garbage_collect_deadline,
            "upload recorded"
        );
        Ok(upload)
    }

    /// Re-anchors retention at `now + new_hold_time_months`. The deadline only ever moves later.
    pub async fn extend_retention(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
        new_hold_time_months: u32,
    ) -> LedgerResult<UploadRecord> {
        let now = self.clock.now();
        let candidate = garbage_collect_deadline(now, new_hold_time_months)?;
        self.move_deadline(account, identifier, network, now, |upload| {
            if candidate <= upload.garbage_collect_deadline {
                return Err(LedgerError::ShorterRetention);
            }
            upload.hold_time_months = new_hold_time_months;
            upload.garbage_collect_deadline = candidate;
            Ok(())
        })
        .await
    }

    /// Pushes the current deadline out by `months`.
    pub async fn extend_garbage_collection_period(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
        months: u32,
    ) -> LedgerResult<UploadRecord> {
        if months == 0 {
            return Err(LedgerError::ShorterRetention);
        }
        let now = self.clock.now();
        self.move_deadline(account, identifier, network, now, |upload| {
            upload.garbage_collect_deadline =
                garbage_collect_deadline(upload.garbage_collect_deadline, months)?;
            Ok(())
        })
        .await
    }

    pub async fn find(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
    ) -> LedgerResult<UploadRecord> {
        let key = UploadKey::new(account, identifier, network);
        let mut tx = self.store.begin().await?;
        load_upload(tx.as_mut(), &key).await
    }

    pub async fn find_by_network(&self, network: &str) -> LedgerResult<Vec<UploadRecord>> {
        let mut tx = self.store.begin().await?;
        tx.uploads_by_network(network).await
    }

    pub async fn find_by_identifier(&self, identifier: &str) -> LedgerResult<Vec<UploadRecord>> {
        let mut tx = self.store.begin().await?;
        tx.uploads_by_identifier(identifier).await
    }

    /// First upload of `identifier` stored on `network`, for any account.
    pub async fn find_by_identifier_and_network(
        &self,
        identifier: &str,
        network: &str,
    ) -> LedgerResult<UploadRecord> {
        self.find_by_identifier(identifier)
            .await?
            .into_iter()
            .find(|upload| upload.network == network)
            .ok_or_else(|| LedgerError::not_found("upload", format!("{identifier}@{network}")))
    }

    pub async fn uploads_for_account(&self, account: &str) -> LedgerResult<Vec<UploadRecord>> {
        let mut tx = self.store.begin().await?;
        tx.uploads_for_account(account).await
    }

    /// Every network copy of `identifier` held by `account`.
    pub async fn uploads_for_account_and_identifier(
        &self,
        account: &str,
        identifier: &str,
    ) -> LedgerResult<Vec<UploadRecord>> {
        Ok(self
            .uploads_for_account(account)
            .await?
            .into_iter()
            .filter(|upload| upload.identifier == identifier)
            .collect())
    }

    pub async fn all(&self) -> LedgerResult<Vec<UploadRecord>> {
        let mut tx = self.store.begin().await?;
        tx.all_uploads().await
    }

    pub async fn expiring_before(&self, instant: DateTime<Utc>) -> LedgerResult<Vec<UploadRecord>> {
        let mut tx = self.store.begin().await?;
        tx.uploads_expiring_before(instant).await
    }

    /// Matches the lower-cased file names of `account`'s uploads against a LIKE pattern
    /// (`%` any run, `_` any single character).
    pub async fn search(&self, account: &str, pattern: &str) -> LedgerResult<Vec<UploadRecord>> {
        let matcher = like_pattern(pattern)?;
        let uploads = self.uploads_for_account(account).await?;
        let matches: Vec<UploadRecord> = uploads
            .into_iter()
            .filter(|upload| {
                upload
                    .file_name_lower
                    .as_deref()
                    .map(|name| matcher.is_match(name))
                    .unwrap_or(false)
            })
            .collect();
        debug!(account, pattern, hits = matches.len(), "upload search");
        Ok(matches)
    }

    async fn move_deadline<F>(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
        now: DateTime<Utc>,
        apply: F,
    ) -> LedgerResult<UploadRecord>
    where
        F: FnOnce(&mut UploadRecord) -> LedgerResult<()> + Send,
    {
        let key = UploadKey::new(account, identifier, network);
        let mut tx = self.store.begin().await?;
        let mut upload = load_upload(tx.as_mut(), &key).await?;
        let previous = upload.garbage_collect_deadline;
        apply(&mut upload)?;
        if upload.garbage_collect_deadline <= previous {
            return Err(LedgerError::ShorterRetention);
        }
        upload.last_updated_at = Some(now);

        if !tx.update_upload(&upload, previous).await? {
            return Err(LedgerError::InvalidState(format!(
                "upload {key} changed while extending retention"
            )));
        }
        tx.commit().await?;

        info!(
            account,
            identifier,
            network,
            previous = %previous,
            deadline = %upload.garbage_collect_deadline,
            hold_time_months = upload.hold_time_months,
            "retention extended"
        );
        Ok(upload)
    }
}

pub(crate) async fn load_upload(tx: &mut dyn LedgerTx, key: &UploadKey) -> LedgerResult<UploadRecord> {
    tx.upload(key)
        .await?
        .ok_or_else(|| LedgerError::not_found("upload", key.to_string()))
}

/// Suffix of the last path element from its final dot, dot included. Dotfiles keep their
/// whole name (`.bashrc`).
fn file_extension(file_name: &str) -> Option<String> {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    base.rfind('.').map(|dot| base[dot..].to_string())
}

fn like_pattern(pattern: &str) -> LedgerResult<Regex> {
    let mut expr = String::from("^");
    for ch in pattern.to_lowercase().chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|err| LedgerError::InvalidState(format!("bad search pattern: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn deadline_adds_calendar_months() {
        let from = Utc.with_ymd_and_hms(2024, 1, 31, 8, 0, 0).unwrap();
        let deadline = garbage_collect_deadline(from, 1).unwrap();
        assert_eq!(deadline, Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap());
        assert_eq!(garbage_collect_deadline(from, 0).unwrap(), from);
    }

    #[test]
    fn extension_is_suffix_from_last_dot() {
        assert_eq!(file_extension("photo.jpg").as_deref(), Some(".jpg"));
        assert_eq!(file_extension("archive.tar.gz").as_deref(), Some(".gz"));
        assert_eq!(file_extension(".bashrc").as_deref(), Some(".bashrc"));
        assert_eq!(file_extension("trailing.").as_deref(), Some("."));
        assert_eq!(file_extension("dir.d/README").as_deref(), None);
        assert_eq!(file_extension("README"), None);
    }

    #[test]
    fn like_pattern_translates_wildcards() {
        let dogs = like_pattern("dog%").unwrap();
        assert!(dogs.is_match("dogpic1.jpg"));
        assert!(dogs.is_match("dogfoodpic.jpg"));
        assert!(!dogs.is_match("catpic1.jpg"));

        let pics = like_pattern("%PIC_.jpg").unwrap();
        assert!(pics.is_match("catpic1.jpg"));
        assert!(!pics.is_match("dogfoodpic.jpg"));

        let literal = like_pattern("a.b").unwrap();
        assert!(literal.is_match("a.b"));
        assert!(!literal.is_match("axb"));
    }
}
