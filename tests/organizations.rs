use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pin_ledger::tiers::BYTES_PER_MB;
use pin_ledger::{Clock, Ledger, LedgerError, ManualClock, Tier, UploadOptions, DEFAULT_NETWORK};

fn ledger() -> (Ledger, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (Ledger::in_memory(shared), clock)
}

async fn enroll(ledger: &Ledger, org: &str, account: &str) {
    ledger.credits.create_account(account).await.unwrap();
    ledger.create_usage_entry(account, Tier::Paid).await.unwrap();
    ledger
        .organizations
        .register_member(org, account)
        .await
        .unwrap();
}

fn sized(megabytes: u64) -> UploadOptions {
    UploadOptions {
        size_bytes: megabytes * BYTES_PER_MB,
        ..UploadOptions::default()
    }
}

// key: organization-tests -> white-labeled membership
#[tokio::test]
async fn registering_moves_member_to_white_labeled() {
    let (ledger, _clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();
    assert!(matches!(
        ledger.organizations.create_organization("acme", "other").await,
        Err(LedgerError::AlreadyExists { .. })
    ));

    enroll(&ledger, "acme", "alice").await;

    assert_eq!(ledger.find_usage("alice").await.unwrap().tier, Tier::WhiteLabeled);
    assert_eq!(
        ledger.credits.find_account("alice").await.unwrap().organization.as_deref(),
        Some("acme")
    );
    assert_eq!(ledger.organizations.members("acme").await.unwrap(), ["alice"]);

    let err = ledger
        .organizations
        .register_member("acme", "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyExists { .. }));

    let err = ledger
        .organizations
        .register_member("acme", "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "account", .. }));
    assert_eq!(ledger.organizations.members("acme").await.unwrap().len(), 1);
}

#[tokio::test]
async fn an_owner_holds_one_organization() {
    let (ledger, _clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();

    let err = ledger
        .organizations
        .create_organization("globex", "owner")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::AlreadyExists { entity: "organization owner", ref key } if key == "owner"
    ));
    assert!(matches!(
        ledger.organizations.find("globex").await,
        Err(LedgerError::NotFound { .. })
    ));

    ledger.organizations.create_organization("globex", "someone-else").await.unwrap();
}

#[tokio::test]
async fn white_labeled_members_get_no_refund() {
    let (ledger, _clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();
    enroll(&ledger, "acme", "alice").await;
    ledger
        .create_upload("alice", "bafy-a", DEFAULT_NETWORK, sized(512))
        .await
        .unwrap();

    let receipt = ledger.remove_pin("alice", "bafy-a", DEFAULT_NETWORK).await.unwrap();
    assert_eq!(receipt.refund, 0.0);
    assert_eq!(ledger.credits.get_credits("alice").await.unwrap(), 0.0);
}

#[tokio::test]
async fn amount_owed_never_goes_below_zero() {
    let (ledger, _clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();

    ledger.organizations.increase_amount_owed("acme", 10.0).await.unwrap();
    let org = ledger.organizations.decrease_amount_owed("acme", 4.0).await.unwrap();
    assert_eq!(org.amount_owed, 6.0);

    let err = ledger
        .organizations
        .decrease_amount_owed("acme", 7.0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Overflow(_)));
    assert_eq!(ledger.organizations.find("acme").await.unwrap().amount_owed, 6.0);

    assert!(ledger
        .organizations
        .increase_amount_owed("acme", f64::INFINITY)
        .await
        .is_err());
}

#[tokio::test]
async fn total_storage_sums_members() {
    let (ledger, _clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();
    enroll(&ledger, "acme", "alice").await;
    enroll(&ledger, "acme", "bob").await;
    ledger.create_upload("alice", "a1", DEFAULT_NETWORK, sized(100)).await.unwrap();
    ledger.create_upload("bob", "b1", DEFAULT_NETWORK, sized(50)).await.unwrap();

    assert_eq!(
        ledger.organizations.total_storage_used("acme").await.unwrap(),
        150 * BYTES_PER_MB
    );
}

// key: billing-report-tests -> missing members are skipped
#[tokio::test]
async fn report_skips_member_whose_account_is_gone() {
    let (ledger, clock) = ledger();
    let from = clock.now() - Duration::days(1);
    ledger.organizations.create_organization("acme", "owner").await.unwrap();
    ledger.organizations.increase_amount_owed("acme", 42.5).await.unwrap();
    for member in ["alice", "bob", "carol"] {
        enroll(&ledger, "acme", member).await;
        ledger
            .create_upload(member, &format!("bafy-{member}"), DEFAULT_NETWORK, sized(10))
            .await
            .unwrap();
    }
    ledger.credits.close_account("carol").await.unwrap();

    clock.advance(Duration::hours(2));
    let report = ledger
        .generate_billing_report("acme", from, clock.now())
        .await
        .unwrap();

    let accounts: Vec<_> = report.items.iter().map(|item| item.account.as_str()).collect();
    assert_eq!(accounts, ["alice", "bob"]);
    assert_eq!(report.amount_due, 42.5);
    assert_eq!(report.total_bytes(), 20 * BYTES_PER_MB);
    assert_eq!(report.generated_at, clock.now());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["org_name"], "acme");
    assert_eq!(json["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn report_window_uses_upload_anchor() {
    let (ledger, clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();
    enroll(&ledger, "acme", "alice").await;
    ledger.create_upload("alice", "old", DEFAULT_NETWORK, sized(1)).await.unwrap();
    ledger.create_upload("alice", "renewed", DEFAULT_NETWORK, sized(1)).await.unwrap();

    clock.advance(Duration::days(10));
    let window_start = clock.now();
    ledger
        .extend_retention("alice", "renewed", DEFAULT_NETWORK, 6)
        .await
        .unwrap();

    let report = ledger
        .generate_billing_report("acme", window_start, clock.now())
        .await
        .unwrap();
    assert_eq!(report.items.len(), 1);
    let ids: Vec<_> = report.items[0]
        .uploads
        .iter()
        .map(|upload| upload.identifier.as_str())
        .collect();
    assert_eq!(ids, ["renewed"]);

    let empty = ledger
        .generate_billing_report("acme", clock.now() + Duration::days(1), clock.now() + Duration::days(2))
        .await
        .unwrap();
    assert!(empty.items.is_empty());
}

#[tokio::test]
async fn trailing_report_rejects_out_of_range_window() {
    let (ledger, clock) = ledger();
    ledger.organizations.create_organization("acme", "owner").await.unwrap();
    enroll(&ledger, "acme", "alice").await;
    ledger.create_upload("alice", "a1", DEFAULT_NETWORK, sized(1)).await.unwrap();

    let report = ledger
        .organizations
        .generate_trailing_billing_report("acme", 7)
        .await
        .unwrap();
    assert_eq!(report.window_end, clock.now());
    assert_eq!(report.window_start, clock.now() - Duration::days(7));
    assert_eq!(report.items.len(), 1);

    for days in [1_000_000_000_000_000, i64::MAX] {
        let err = ledger
            .organizations
            .generate_trailing_billing_report("acme", days)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Overflow(_)));
    }
}

#[tokio::test]
async fn report_for_unknown_organization_fails() {
    let (ledger, clock) = ledger();
    let err = ledger
        .generate_billing_report("nope", clock.now(), clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "organization", .. }));
}
