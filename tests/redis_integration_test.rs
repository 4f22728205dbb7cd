mod common;

use std::sync::Arc;

use common::{TestHub, started_id, template};
use serde_json::json;
use taskhub::config::HubConfig;
use taskhub::runtime::redis_storage::RedisKvStore;
use taskhub::runtime::storage::KvStore;

fn redis_url() -> String {
    std::env::var("TASKHUB_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/6".to_string())
}

async fn fresh_store(prefix: &str) -> RedisKvStore {
    let client = redis::Client::open(redis_url()).expect("Invalid Redis URL");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");
    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut conn)
        .await
        .expect("Failed to flush db");
    RedisKvStore::new(client, prefix)
}

#[tokio::test]
#[ignore] // needs a running Redis
async fn test_redis_kv_roundtrip() {
    let store = fresh_store("taskhub-test").await;

    store.set("instances", "a", json!({ "input": { "x": 1 } })).await.unwrap();
    store.set("instances", "b", json!({ "input": { "x": 2 } })).await.unwrap();
    assert!(store.has("instances", "a").await.unwrap());
    assert_eq!(
        store.get("instances", "a").await.unwrap(),
        Some(json!({ "input": { "x": 1 } }))
    );

    let mut keys: Vec<String> = store
        .iterate("instances")
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b"]);

    store.delete("instances", "a").await.unwrap();
    assert!(!store.has("instances", "a").await.unwrap());
    assert_eq!(store.get("instances", "missing").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // needs a running Redis
async fn test_hub_state_survives_restart_on_redis() {
    let kv: Arc<dyn KvStore> = Arc::new(fresh_store("taskhub-hub").await);
    let config = HubConfig {
        templates: vec![template("chat", &["ui"])],
        ..HubConfig::default()
    };

    let mut first = TestHub::with_store(config.clone(), kv.clone()).await;
    first.processor("p1", "ui").await;
    let id = started_id(&first.start("p1", "chat").await.unwrap());
    first
        .update("p1", &id, json!({ "input": { "topic": "redis" } }))
        .await
        .unwrap();

    let second = TestHub::with_store(config, kv).await;
    let task = second.task(&id).await;
    assert_eq!(task.input["topic"], "redis");
    assert_eq!(task.meta.update_count, 1);
    assert!(second.hub.active_record(&id).await.unwrap().unwrap().active);
    assert_eq!(second.hub.store().family(&task.family_id).await.unwrap(), vec![id]);
}
