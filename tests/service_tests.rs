use guildledger::storage::registry::{BALANCES, BANK};
use guildledger::{
    AdminCommand, DatasetSpec, InMemoryFeed, LedgerConfig, LedgerError, LedgerService, Principal,
    RetryPolicy,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const OPERATOR: &str = "900";

fn config() -> LedgerConfig {
    LedgerConfig::new("test-channel")
        .retry(RetryPolicy::none())
        .min_save_interval(Duration::from_secs(10))
        .datasets(vec![
            DatasetSpec::custom(BALANCES, || json!(0)),
            DatasetSpec::custom(BANK, || json!({ "deposit": 0 })),
        ])
        .operator(OPERATOR)
}

async fn open(feed: &InMemoryFeed) -> LedgerService {
    LedgerService::open(config(), Arc::new(feed.clone())).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_state_survives_restart() {
    let feed = InMemoryFeed::new();
    let ann = Principal::new("1");

    let service = open(&feed).await;
    assert_eq!(service.restore_report().unwrap().missing.len(), 2);
    service.currency().credit(&ann, 100).await.unwrap();
    service.currency().debit(&ann, 30).await.unwrap();
    let final_save = service.shutdown().await.unwrap();
    assert!(final_save.is_clean());

    let restarted = open(&feed).await;
    assert_eq!(restarted.currency().balance(&ann).unwrap(), 70);
    assert_ok!(restarted.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_request_save_publishes_in_background() {
    let feed = InMemoryFeed::new();
    let service = open(&feed).await;

    service.currency().credit(&Principal::new("1"), 5).await.unwrap();
    service.request_save();
    service.scheduler().wait_idle().await;

    assert_eq!(feed.post_count().await, 1);
    assert_ok!(service.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_open_rejects_invalid_config() {
    let feed = InMemoryFeed::new();
    let config = config().max_payloads_per_publish(0);
    let err = LedgerService::open(config, Arc::new(feed)).await.err().unwrap();
    assert!(matches!(err, LedgerError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_open_survives_unreachable_feed() {
    let feed = InMemoryFeed::new();
    feed.fail_next_lists(1).await;

    let service = open(&feed).await;
    assert!(service.restore_report().is_none());
    assert_eq!(service.replicator().unrestored().unwrap().len(), 2);

    let report = service.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.published.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_admin_requires_operator() {
    let feed = InMemoryFeed::new();
    let service = open(&feed).await;

    for command in [
        AdminCommand::ForceSave,
        AdminCommand::Status,
        AdminCommand::ForceRestore {
            dataset: BALANCES.to_string(),
            reference: None,
        },
        AdminCommand::MigratePrincipal(Principal::new("1")),
    ] {
        let err = service.admin().execute("12345", command).await.unwrap_err();
        assert_eq!(err, LedgerError::Unauthorized("12345".to_string()));
    }
    assert_eq!(feed.post_count().await, 0);
    assert_eq!(service.scheduler().stats().executed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_admin_force_save_and_restore() {
    let feed = InMemoryFeed::new();
    let service = open(&feed).await;
    let admin = service.admin();
    let ann = Principal::new("1");

    service.currency().credit(&ann, 10).await.unwrap();
    let saved = admin.execute(OPERATOR, AdminCommand::ForceSave).await.unwrap();
    assert!(saved.starts_with("Save finished"), "{}", saved);
    let pinned = service.replicator().load_record(BALANCES).unwrap().unwrap();

    service.currency().credit(&ann, 90).await.unwrap();
    admin.execute(OPERATOR, AdminCommand::ForceSave).await.unwrap();

    let restored = admin
        .execute(
            OPERATOR,
            AdminCommand::parse(&format!("restore {} {}", BALANCES, pinned.reference)).unwrap(),
        )
        .await
        .unwrap();
    assert!(restored.contains(pinned.reference.as_str()), "{}", restored);
    assert_eq!(service.currency().balance(&ann).unwrap(), 10);

    let unknown = admin
        .execute(
            OPERATOR,
            AdminCommand::ForceRestore {
                dataset: "lottery".to_string(),
                reference: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(unknown, LedgerError::UnknownDataset("lottery".to_string()));

    let report = service.shutdown().await.unwrap();
    assert!(report.published.contains(&BALANCES.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_admin_migrate_and_status() {
    let feed = InMemoryFeed::new();
    let service = open(&feed).await;
    let admin = service.admin();
    let store = service.protocol().store();
    store.set_raw(BALANCES, "Alice", json!(50)).unwrap();
    store.set_raw(BANK, "Alice", json!({ "deposit": 5 })).unwrap();

    let message = admin
        .execute(OPERATOR, AdminCommand::parse("migrate 111 Alice").unwrap())
        .await
        .unwrap();
    assert_eq!(message, "Migrated 111 in: balances, bank");
    assert_eq!(store.get_raw(BALANCES, "111").unwrap(), Some(json!(50)));

    let again = admin
        .execute(OPERATOR, AdminCommand::parse("migrate 111 Alice").unwrap())
        .await
        .unwrap();
    assert_eq!(again, "Nothing to migrate for 111");

    let status = admin.execute(OPERATOR, AdminCommand::Status).await.unwrap();
    assert!(status.contains("balances: 1 records"), "{}", status);
    assert!(status.contains("never published"), "{}", status);
    assert!(status.contains("saves: 0 executed"), "{}", status);
}
