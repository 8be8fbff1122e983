use guildledger::storage::registry::{BALANCES, COOLDOWNS};
use guildledger::storage::{RecordStore, default_datasets};
use guildledger::{IdentityResolver, LedgerError, Principal, Slot, UpdateProtocol};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

fn protocol() -> Arc<UpdateProtocol> {
    Arc::new(UpdateProtocol::new(Arc::new(RecordStore::new(default_datasets()))))
}

/// Keys in `dataset` that belong to `who`: the id or any alias variant.
fn attributable(protocol: &UpdateProtocol, dataset: &str, who: &Principal) -> usize {
    let resolver = protocol.resolver();
    let mut candidates = resolver.legacy_keys(who, "");
    candidates.push(resolver.canonical_key(who).into_string());
    protocol
        .store()
        .read(dataset, |data| candidates.iter().filter(|key| data.contains(key)).count())
        .unwrap()
}

#[tokio::test]
async fn test_interleaved_async_updates_lose_nothing() {
    let protocol = protocol();
    let workers = 25;

    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let protocol = Arc::clone(&protocol);
            tokio::spawn(async move {
                let who = Principal::new("7").with_alias("Gus");
                protocol
                    .update_async(&who, BALANCES, 0i64, |balance| async move {
                        // Simulates a lookup that suspends mid-update.
                        sleep(Duration::from_millis(1 + (i % 3))).await;
                        Ok::<_, LedgerError>(balance + 1)
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let who = Principal::new("7");
    assert_eq!(protocol.get(&who, BALANCES, 0i64).unwrap(), workers as i64);
}

#[tokio::test]
async fn test_at_most_one_record_per_principal() {
    let protocol = protocol();
    let store = protocol.store();
    store.set_raw(BALANCES, "Alice", json!(50)).unwrap();
    store.set_raw(BALANCES, "Alice ", json!(3)).unwrap();
    store.set_raw(BALANCES, "111", json!(1)).unwrap();
    store.set_raw(BALANCES, "222", json!(8)).unwrap();

    let alice = Principal::new("111").with_alias("Alice ");

    assert_eq!(protocol.get(&alice, BALANCES, 0i64).unwrap(), 1);
    assert_eq!(attributable(&protocol, BALANCES, &alice), 1);

    protocol.update(&alice, BALANCES, 0i64, |v| v + 1).await.unwrap();
    assert_eq!(attributable(&protocol, BALANCES, &alice), 1);

    store.set_raw(BALANCES, "Alice", json!(99)).unwrap();
    protocol.update(&alice, BALANCES, 0i64, |v| v * 10).await.unwrap();
    assert_eq!(attributable(&protocol, BALANCES, &alice), 1);
    assert_eq!(protocol.get(&alice, BALANCES, 0i64).unwrap(), 20);

    assert_eq!(store.get_raw(BALANCES, "222").unwrap(), Some(json!(8)));
}

#[tokio::test]
async fn test_migrate_is_idempotent() {
    let protocol = protocol();
    let store = protocol.store();
    store.set_raw(BALANCES, "Alice", json!(50)).unwrap();
    store.set_raw(BALANCES, "Bob", json!(5)).unwrap();
    let alice = Principal::new("111").with_alias("Alice");
    let resolver = IdentityResolver::new();

    let once = store
        .write(BALANCES, |data| resolver.migrate(&alice, data, ""))
        .unwrap();
    let after_once = store.export(BALANCES).unwrap();
    let twice = store
        .write(BALANCES, |data| resolver.migrate(&alice, data, ""))
        .unwrap();

    assert!(once);
    assert!(!twice);
    assert_eq!(store.export(BALANCES).unwrap(), after_once);
    assert_eq!(after_once.get("111"), Some(&json!(50)));
    assert!(!after_once.contains_key("Alice"));
}

#[tokio::test]
async fn test_migrate_all_covers_principal_keyed_datasets() {
    let protocol = protocol();
    let store = protocol.store();
    store.set_raw(BALANCES, "Alice", json!(50)).unwrap();
    store.set_raw(COOLDOWNS, "Alice", json!(1_700_000_000)).unwrap();
    let alice = Principal::new("111").with_alias("Alice");

    let migrated = protocol.resolver().migrate_all(&alice, store).unwrap();
    assert_eq!(migrated, vec![BALANCES.to_string(), COOLDOWNS.to_string()]);
    assert!(protocol.resolver().migrate_all(&alice, store).unwrap().is_empty());
}

#[tokio::test]
async fn test_update_async_error_leaves_record_and_releases_lock() {
    let protocol = protocol();
    let who = Principal::new("1");
    protocol.set(&who, Slot::prefixed(COOLDOWNS, "daily:"), 10u64).await.unwrap();

    let err = protocol
        .update_async(&who, Slot::prefixed(COOLDOWNS, "daily:"), 0u64, |_| async {
            Err::<u64, _>(LedgerError::Rejected("cooldown active".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Rejected(_)));

    let key = protocol
        .update(&who, Slot::prefixed(COOLDOWNS, "daily:"), 0u64, |v| v + 5)
        .await
        .unwrap();
    assert_eq!(key.as_str(), "daily:1");
    assert_eq!(protocol.store().get_raw(COOLDOWNS, "daily:1").unwrap(), Some(json!(15)));
}
