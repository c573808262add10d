use std::sync::Arc;

use chrono::{Duration, Months, TimeZone, Utc};
use pin_ledger::tiers::{BYTES_PER_GB, BYTES_PER_MB};
use pin_ledger::{
    Clock, Ledger, LedgerError, ManualClock, Tier, UploadKind, UploadOptions, DEFAULT_NETWORK,
};

fn ledger() -> (Ledger, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (Ledger::in_memory(shared), clock)
}

fn hold(months: u32) -> UploadOptions {
    UploadOptions {
        hold_time_months: months,
        size_bytes: 10 * BYTES_PER_MB,
        ..UploadOptions::default()
    }
}

fn named(file_name: &str) -> UploadOptions {
    UploadOptions {
        file_name: Some(file_name.to_string()),
        ..hold(1)
    }
}

// key: upload-tests -> retention deadline only moves later
#[tokio::test]
async fn shorter_retention_is_rejected_without_change() {
    let (ledger, _clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    let created = ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, hold(6))
        .await
        .unwrap();

    let err = ledger
        .extend_retention("alice", "bafy-a", DEFAULT_NETWORK, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ShorterRetention));

    let stored = ledger.uploads.find("alice", "bafy-a", DEFAULT_NETWORK).await.unwrap();
    assert_eq!(stored.garbage_collect_deadline, created.garbage_collect_deadline);
    assert_eq!(stored.hold_time_months, 6);
    assert!(stored.last_updated_at.is_none());
}

#[tokio::test]
async fn extension_reanchors_from_now() {
    let (ledger, clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    let created = ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, hold(1))
        .await
        .unwrap();

    clock.advance(Duration::days(20));
    let now = clock.now();
    let extended = ledger
        .extend_retention("alice", "bafy-a", DEFAULT_NETWORK, 3)
        .await
        .unwrap();

    assert!(extended.garbage_collect_deadline > created.garbage_collect_deadline);
    assert_eq!(
        extended.garbage_collect_deadline,
        now.checked_add_months(Months::new(3)).unwrap()
    );
    assert_eq!(extended.hold_time_months, 3);
    assert_eq!(extended.last_updated_at, Some(now));
    assert_eq!(extended.anchor(), now);
}

#[tokio::test]
async fn repeated_extensions_are_monotonic() {
    let (ledger, clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    let mut deadline = ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, hold(1))
        .await
        .unwrap()
        .garbage_collect_deadline;

    // created Jan 10 with a Feb 10 deadline; each step is three days after the last
    let steps = [(1, true), (2, true), (2, true), (1, false), (4, true)];
    for (months, accepted) in steps {
        clock.advance(Duration::days(3));
        let outcome = ledger
            .extend_retention("alice", "bafy-a", DEFAULT_NETWORK, months)
            .await;
        if accepted {
            assert!(outcome.is_ok(), "{months} months should extend: {outcome:?}");
        } else {
            assert!(
                matches!(outcome, Err(LedgerError::ShorterRetention)),
                "{months} months should be rejected: {outcome:?}"
            );
        }

        let now_deadline = ledger
            .uploads
            .find("alice", "bafy-a", DEFAULT_NETWORK)
            .await
            .unwrap()
            .garbage_collect_deadline;
        assert_eq!(now_deadline > deadline, accepted);
        assert!(now_deadline >= deadline);
        deadline = now_deadline;
    }
}

#[tokio::test]
async fn garbage_collection_period_extends_from_current_deadline() {
    let (ledger, _clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    let created = ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, hold(1))
        .await
        .unwrap();

    let extended = ledger
        .uploads
        .extend_garbage_collection_period("alice", "bafy-a", DEFAULT_NETWORK, 2)
        .await
        .unwrap();
    assert_eq!(
        extended.garbage_collect_deadline,
        created
            .garbage_collect_deadline
            .checked_add_months(Months::new(2))
            .unwrap()
    );

    let err = ledger
        .uploads
        .extend_garbage_collection_period("alice", "bafy-a", DEFAULT_NETWORK, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ShorterRetention));
}

#[tokio::test]
async fn one_upload_per_account_identifier_network() {
    let (ledger, _clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    ledger.create_usage_entry("bob", Tier::Paid).await.unwrap();

    ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, hold(1))
        .await
        .unwrap();
    let err = ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, hold(2))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyExists { entity: "upload", .. }));
    assert_eq!(
        ledger.find_usage("alice").await.unwrap().current_used_bytes,
        10 * BYTES_PER_MB
    );

    ledger.create_upload("alice", "bafy-a", "private", hold(1)).await.unwrap();
    ledger.create_upload("bob", "bafy-a", DEFAULT_NETWORK, hold(1)).await.unwrap();

    assert_eq!(ledger.uploads.find_by_identifier("bafy-a").await.unwrap().len(), 3);
    assert_eq!(ledger.uploads.find_by_network("private").await.unwrap().len(), 1);
    let private = ledger
        .uploads
        .find_by_identifier_and_network("bafy-a", "private")
        .await
        .unwrap();
    assert_eq!(private.account, "alice");
}

#[tokio::test]
async fn upload_needs_a_usage_ledger_and_respects_quota() {
    let (ledger, _clock) = ledger();
    let err = ledger
        .create_upload("ghost", "bafy-x", DEFAULT_NETWORK, hold(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "usage", .. }));

    ledger.create_usage_entry("bob", Tier::Free).await.unwrap();
    let too_big = UploadOptions {
        size_bytes: 4 * BYTES_PER_GB,
        ..hold(1)
    };
    let err = ledger
        .create_upload("bob", "bafy-big", DEFAULT_NETWORK, too_big)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::QuotaExceeded { .. }));
    assert!(ledger.uploads.uploads_for_account("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_options_derive_file_metadata() {
    let (ledger, _clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    let options = UploadOptions {
        kind: UploadKind::File,
        encrypted: true,
        ..named("Holiday.JPG")
    };
    let upload = ledger
        .create_upload("alice", "bafy-pic", DEFAULT_NETWORK, options)
        .await
        .unwrap();

    assert_eq!(upload.file_name_lower.as_deref(), Some("holiday.jpg"));
    assert_eq!(upload.extension.as_deref(), Some(".JPG"));
    assert_eq!(upload.kind, UploadKind::File);
    assert!(upload.encrypted);
    assert!(!upload.directory);

    let dotfile = ledger
        .create_upload("alice", "bafy-rc", DEFAULT_NETWORK, named(".bashrc"))
        .await
        .unwrap();
    assert_eq!(dotfile.extension.as_deref(), Some(".bashrc"));
}

#[tokio::test]
async fn search_matches_like_patterns_on_lowercased_names() {
    let (ledger, _clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    ledger.create_usage_entry("bob", Tier::Paid).await.unwrap();
    for (id, name) in [
        ("bafy-1", "DogPic1.jpg"),
        ("bafy-2", "dogfoodpic.jpg"),
        ("bafy-3", "catpic1.jpg"),
    ] {
        ledger
            .create_upload("alice", id, DEFAULT_NETWORK, named(name))
            .await
            .unwrap();
    }
    ledger
        .create_upload("bob", "bafy-4", DEFAULT_NETWORK, named("dogbone.png"))
        .await
        .unwrap();
    ledger
        .create_upload("alice", "bafy-5", DEFAULT_NETWORK, hold(1))
        .await
        .unwrap();

    let dogs = ledger.uploads.search("alice", "dog%").await.unwrap();
    let mut ids: Vec<_> = dogs.iter().map(|u| u.identifier.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["bafy-1", "bafy-2"]);

    let numbered = ledger.uploads.search("alice", "%pic_.jpg").await.unwrap();
    assert_eq!(numbered.len(), 2);
}

#[tokio::test]
async fn expiring_before_lists_lapsed_uploads() {
    let (ledger, clock) = ledger();
    ledger.create_usage_entry("alice", Tier::Paid).await.unwrap();
    ledger.create_upload("alice", "short", DEFAULT_NETWORK, hold(1)).await.unwrap();
    ledger.create_upload("alice", "long", DEFAULT_NETWORK, hold(12)).await.unwrap();

    clock.advance(Duration::days(60));
    let expired = ledger.uploads.expiring_before(clock.now()).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].identifier, "short");
    assert_eq!(ledger.uploads.all().await.unwrap().len(), 2);
}
