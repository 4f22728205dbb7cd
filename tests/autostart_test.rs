mod common;

use std::sync::Arc;

use common::TestHub;
use taskhub::config::HubConfig;
use taskhub::runtime::Outcome;
use taskhub::runtime::storage::{InMemoryKvStore, KvStore};
use taskhub::task::{AutoStartSpec, TaskTemplate};

fn autostarting(id: &str, environments: &[&str], environment: &str, once: bool, priority: i64) -> TaskTemplate {
    TaskTemplate {
        auto_start: Some(AutoStartSpec {
            environment: environment.to_string(),
            environments: Vec::new(),
            once,
            priority,
        }),
        ..TaskTemplate::new(id, environments)
    }
}

fn autostarted(outcome: Outcome) -> Vec<String> {
    match outcome {
        Outcome::Registered { autostarted, .. } => autostarted,
        other => panic!("Expected Registered, got {:?}", other),
    }
}

#[tokio::test]
async fn test_autostart_fires_when_environments_connect() {
    let mut t = TestHub::new(vec![
        autostarting("dashboard", &["ui"], "ui", false, 1),
        autostarting("setup", &["ui", "db"], "db", true, 5),
    ])
    .await;

    let first = autostarted(t.processor("p1", "ui").await);
    assert_eq!(first.len(), 1);
    assert_eq!(t.task(&first[0]).await.template_id, "dashboard");

    let second = autostarted(t.processor("d1", "db").await);
    assert_eq!(second.len(), 1);
    let setup = t.task(&second[0]).await;
    assert_eq!(setup.template_id, "setup");
    assert!(setup.nodes.contains_key("p1"));
    assert!(setup.nodes.contains_key("d1"));

    // a new node of the owning environment retriggers a repeating entry only
    let third = autostarted(t.processor("p2", "ui").await);
    assert_eq!(third.len(), 1);
    assert_ne!(third[0], first[0]);
    assert_eq!(t.task(&third[0]).await.template_id, "dashboard");

    let again = autostarted(t.processor("d2", "db").await);
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_autostart_waits_for_hub_environments() {
    let mut t = TestHub::with_config(HubConfig {
        hub_environments: vec!["ui".to_string(), "db".to_string()],
        templates: vec![
            autostarting("dashboard", &["ui"], "ui", false, 1),
            autostarting("setup", &["ui", "db"], "db", true, 5),
        ],
        ..HubConfig::default()
    })
    .await;

    assert!(autostarted(t.processor("p1", "ui").await).is_empty());

    let started = autostarted(t.processor("d1", "db").await);
    assert_eq!(started.len(), 2);
    assert_eq!(t.task(&started[0]).await.template_id, "setup");
    assert_eq!(t.task(&started[1]).await.template_id, "dashboard");
}

#[tokio::test]
async fn test_failed_autostart_can_fire_again() {
    let template = TaskTemplate {
        auto_start: Some(AutoStartSpec {
            environment: "ui".to_string(),
            environments: vec!["ui".to_string()],
            once: true,
            priority: 0,
        }),
        ..TaskTemplate::new("render", &["gpu"])
    };
    let mut t = TestHub::new(vec![template]).await;

    assert!(autostarted(t.processor("p1", "ui").await).is_empty());
    let entries = t.hub.autostart().entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].started);

    t.processor("g1", "gpu").await;
    let entries = t.hub.autostart().entries().await.unwrap();
    assert!(entries[0].started);
}

#[tokio::test]
async fn test_started_flag_survives_rebuild() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let config = HubConfig {
        templates: vec![autostarting("setup", &["ui"], "ui", true, 0)],
        ..HubConfig::default()
    };

    let mut first = TestHub::with_store(config.clone(), kv.clone()).await;
    assert_eq!(autostarted(first.processor("p1", "ui").await).len(), 1);

    let mut second = TestHub::with_store(config, kv).await;
    assert!(autostarted(second.processor("p1", "ui").await).is_empty());
    assert!(second.hub.autostart().entries().await.unwrap()[0].started);
}
