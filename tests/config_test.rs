use std::fs;

use taskhub::config::{self, HubConfig};
use taskhub::protocol::Command;

fn write_yaml(name: &str, content: &str) -> (tempfile::TempDir, String) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join(name);
    fs::write(&file_path, content).expect("Failed to write temp file");
    let path = file_path.to_string_lossy().to_string();
    (temp_dir, path)
}

#[test]
fn test_load_hub_config_yaml() {
    let yaml_content = r#"
hub_id: "hub-eu"
lock_stale_secs: 120
hub_environments: ["ui", "db"]
default_user: "system"
exempt_commands: ["join", "error"]
redis:
  url: "redis://127.0.0.1:6379/2"
templates:
  - id: "root.orders.start"
    environments: ["ui", "db"]
    state:
      current: "draft"
      legal: ["draft", "submitted"]
    config:
      oneFamily: true
      maxRequestRate: 30
    input:
      items: []
  - id: "root.error"
    environments: ["ui"]
  - id: "dashboard"
    environments: ["ui"]
    autoStart:
      environment: "ui"
      priority: 10
"#;
    let (_dir, path) = write_yaml("hub.yaml", yaml_content);

    let config = config::load_config_from_yaml(&path).expect("Failed to load config");
    assert_eq!(config.hub_id, "hub-eu");
    assert_eq!(config.lock_stale_after(), chrono::Duration::minutes(2));
    assert_eq!(config.heartbeat_timeout_secs, 90);
    assert_eq!(config.default_user.as_deref(), Some("system"));
    assert_eq!(config.redis.as_ref().unwrap().prefix, "taskhub");
    assert_eq!(config.templates.len(), 3);

    let exempt = config.exempt();
    for command in [Command::Partial, Command::Register, Command::Pong, Command::Join, Command::Error] {
        assert!(exempt.contains(&command), "{} should be exempt", command);
    }
    assert!(!exempt.contains(&Command::Update));

    let orders = &config.templates[0];
    assert_eq!(orders.initial_state(), "draft");
    assert!(orders.state.is_legal("submitted"));
    assert!(!orders.state.is_legal("shipped"));
    let policy = orders.policy();
    assert!(policy.one_family);
    assert_eq!(policy.max_request_rate, Some(30));

    let auto = config.templates[2].auto_start.as_ref().unwrap();
    assert_eq!(auto.priority, 10);
    assert!(!auto.once);

    let warnings = config.validate().expect("Config should validate");
    assert_eq!(warnings, vec!["Template dashboard has no reachable error handler".to_string()]);
}

#[test]
fn test_defaults_apply_to_empty_config() {
    let (_dir, path) = write_yaml("empty.yaml", "{}\n");
    let config = config::load_config_from_yaml(&path).unwrap();
    assert_eq!(config, HubConfig::default());
    assert_eq!(config.exempt_commands, vec![Command::Join]);
}

#[test]
fn test_validate_rejects_broken_templates() {
    let (_dir, path) = write_yaml(
        "dup.yaml",
        r#"
templates:
  - id: "a"
    environments: ["ui"]
  - id: "a"
    environments: ["ui"]
"#,
    );
    let config = config::load_config_from_yaml(&path).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("Duplicate template a"));

    let (_dir, path) = write_yaml(
        "noenv.yaml",
        r#"
templates:
  - id: "floating"
"#,
    );
    let config = config::load_config_from_yaml(&path).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_missing_file_names_path() {
    let err = config::load_config_from_yaml("/nonexistent/hub.yaml").unwrap_err();
    assert!(format!("{:#}", err).contains("/nonexistent/hub.yaml"));
}

#[test]
fn test_load_single_template() {
    let (_dir, path) = write_yaml(
        "template.yaml",
        r#"
id: "root.review.start"
environments: ["ui"]
config:
  errorTask: "root.review.error"
"#,
    );
    let template = config::load_template_from_yaml(&path).unwrap();
    assert_eq!(template.id, "root.review.start");
    assert_eq!(template.policy().error_task.as_deref(), Some("root.review.error"));
    assert_eq!(template.initial_state(), "start");
}
