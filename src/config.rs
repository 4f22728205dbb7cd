use std::collections::BTreeSet;
use std::fs;

use anyhow::{Context as _, Result, bail};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::protocol::Command;
use crate::runtime::instances::error_handler_candidates;
use crate::task::TaskTemplate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            prefix: "taskhub".to_string(),
        }
    }
}

/// Hub settings plus the templates it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub hub_id: String,
    /// Seconds without an update after which an edit lock may be taken over.
    pub lock_stale_secs: i64,
    /// Seconds without a `pong` after which a node is reaped.
    pub heartbeat_timeout_secs: i64,
    /// Hub-wide `error` commands accepted per minute.
    pub max_error_rate: u32,
    /// Environments that must all be connected before anything autostarts.
    pub hub_environments: Vec<String>,
    /// User for starts that name none, autostarts included.
    pub default_user: Option<String>,
    /// Commands that skip the coprocessor pipeline, besides partial/register/pong.
    pub exempt_commands: Vec<Command>,
    pub redis: Option<RedisConfig>,
    pub templates: Vec<TaskTemplate>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_id: "hub".to_string(),
            lock_stale_secs: 300,
            heartbeat_timeout_secs: 90,
            max_error_rate: 20,
            hub_environments: Vec::new(),
            default_user: None,
            exempt_commands: vec![Command::Join],
            redis: None,
            templates: Vec::new(),
        }
    }
}

impl HubConfig {
    pub fn lock_stale_after(&self) -> Duration {
        Duration::seconds(self.lock_stale_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.heartbeat_timeout_secs)
    }

    pub fn exempt(&self) -> Vec<Command> {
        let mut exempt = vec![Command::Partial, Command::Register, Command::Pong];
        for command in &self.exempt_commands {
            if !exempt.contains(command) {
                exempt.push(*command);
            }
        }
        exempt
    }

    /// Structural checks. Returns warnings for problems that do not stop the hub.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.hub_id.is_empty() {
            bail!("hub_id must not be empty");
        }

        let mut ids = BTreeSet::new();
        for template in &self.templates {
            if !ids.insert(template.id.as_str()) {
                bail!("Duplicate template {}", template.id);
            }
            if template.environments.is_empty() {
                bail!("Template {} has no environments", template.id);
            }
            if let Some(auto) = &template.auto_start {
                if auto.environment.is_empty() {
                    bail!("Template {} autostarts without an environment", template.id);
                }
            }
        }

        let mut warnings = Vec::new();
        for template in &self.templates {
            if template.id == "error" || template.id.ends_with(".error") {
                continue;
            }
            let explicit = template.policy().error_task;
            let resolvable = match &explicit {
                Some(handler) => ids.contains(handler.as_str()),
                None => error_handler_candidates(&template.id)
                    .iter()
                    .any(|c| ids.contains(c.as_str())),
            };
            if !resolvable {
                warnings.push(format!("Template {} has no reachable error handler", template.id));
            }
        }
        Ok(warnings)
    }
}

pub fn load_config_from_yaml(file_path: &str) -> Result<HubConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    let config: HubConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path))?;

    Ok(config)
}

pub fn load_template_from_yaml(file_path: &str) -> Result<TaskTemplate> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    let template: TaskTemplate = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize template from {}", file_path))?;

    Ok(template)
}
