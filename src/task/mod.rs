//! The synchronized task record and the templates it is created from.

pub mod hash;
pub mod patch;

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::protocol::Command;
use patch::Diff;

/// Keys of a task body that only the hub writes. Stripped from incoming diffs.
pub const ENGINE_OWNED: [&str; 10] = [
    "instanceId",
    "templateId",
    "familyId",
    "threadId",
    "environments",
    "meta",
    "nodes",
    "users",
    "node",
    "user",
];

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Processor,
    Coprocessor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal: Option<Vec<String>>,
}

impl TaskState {
    pub fn is_legal(&self, state: &str) -> bool {
        self.legal
            .as_ref()
            .is_none_or(|legal| legal.iter().any(|s| s == state))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Engine bookkeeping carried on every instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskMeta {
    pub update_count: u64,
    pub broadcast_count: u64,
    pub request_count: u64,
    pub requests_this_minute: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_window_start: Option<DateTime<Utc>>,
    /// Node holding the advisory edit lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<u32>,
    /// Leaves touched by the last committed change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_handler_instance_id: Option<String>,
}

/// Per instance routing record for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRoute {
    pub node_id: String,
    pub environment: String,
    #[serde(default)]
    pub role: NodeRole,
    /// Last command routed to this node for the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub coprocessing: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub coprocessing_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states_not_supported: Option<Vec<String>>,
}

impl NodeRoute {
    pub fn has_state_filter(&self) -> bool {
        self.states_supported.is_some() || self.states_not_supported.is_some()
    }

    pub fn accepts_state(&self, state: Option<&str>) -> bool {
        let state = state.unwrap_or_default();
        if let Some(supported) = &self.states_supported {
            if !supported.iter().any(|s| s == state) {
                return false;
            }
        }
        if let Some(unsupported) = &self.states_not_supported {
            if unsupported.iter().any(|s| s == state) {
                return false;
            }
        }
        true
    }
}

/// Engine-relevant switches read out of a task's free-form `config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPolicy {
    pub one_family: bool,
    pub collaborate_group_id: Option<String>,
    pub error_task: Option<String>,
    pub max_request_rate: Option<u32>,
    pub max_request_count: Option<u64>,
}

impl TaskPolicy {
    /// Each switch is read on its own. A mistyped one keeps its default and
    /// leaves the others intact.
    pub fn from_config(config: &Value) -> Self {
        Self {
            one_family: config_field(config, "oneFamily").unwrap_or_default(),
            collaborate_group_id: config_field(config, "collaborateGroupId"),
            error_task: config_field(config, "errorTask"),
            max_request_rate: config_field(config, "maxRequestRate"),
            max_request_count: config_field(config, "maxRequestCount"),
        }
    }
}

fn config_field<T: DeserializeOwned>(config: &Value, key: &str) -> Option<T> {
    let value = config.get(key).filter(|v| !v.is_null())?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key = %key, value = %value, "Ignoring malformed task config value: {}", e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoStartSpec {
    /// Environment that owns the autostart and may retrigger it.
    pub environment: String,
    /// Every environment that must be connected before firing.
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub priority: i64,
}

/// Static definition an instance is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub id: String,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default = "empty_object")]
    pub output: Value,
    #[serde(default = "empty_object")]
    pub request: Value,
    #[serde(default = "empty_object")]
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<AutoStartSpec>,
}

impl TaskTemplate {
    pub fn new(id: impl Into<String>, environments: &[&str]) -> Self {
        Self {
            id: id.into(),
            environments: environments.iter().map(|e| e.to_string()).collect(),
            state: TaskState::default(),
            config: empty_object(),
            input: empty_object(),
            output: empty_object(),
            request: empty_object(),
            response: empty_object(),
            auto_start: None,
        }
    }

    pub fn policy(&self) -> TaskPolicy {
        TaskPolicy::from_config(&self.config)
    }

    pub fn initial_state(&self) -> String {
        self.state.current.clone().unwrap_or_else(|| "start".to_string())
    }
}

/// The unit of synchronized state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub instance_id: String,
    pub template_id: String,
    pub family_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub input: Value,
    #[serde(default = "empty_object")]
    pub output: Value,
    #[serde(default = "empty_object")]
    pub request: Value,
    #[serde(default = "empty_object")]
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub meta: TaskMeta,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeRoute>,
    #[serde(default)]
    pub users: BTreeMap<String, Value>,
}

impl TaskInstance {
    pub fn from_template(
        template: &TaskTemplate,
        instance_id: impl Into<String>,
        family_id: impl Into<String>,
    ) -> Self {
        let mut state = template.state.clone();
        state.current = Some(template.initial_state());
        Self {
            instance_id: instance_id.into(),
            template_id: template.id.clone(),
            family_id: family_id.into(),
            thread_id: None,
            user_id: None,
            group_id: None,
            environments: template.environments.clone(),
            state,
            config: template.config.clone(),
            input: template.input.clone(),
            output: template.output.clone(),
            request: template.request.clone(),
            response: template.response.clone(),
            error: None,
            meta: TaskMeta::default(),
            nodes: BTreeMap::new(),
            users: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> TaskPolicy {
        TaskPolicy::from_config(&self.config)
    }

    pub fn current_state(&self) -> Option<&str> {
        self.state.current.as_deref()
    }

    pub fn is_error_handler(&self) -> bool {
        self.template_id == "error" || self.template_id.ends_with(".error")
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .with_context(|| format!("Failed to serialize task {}", self.instance_id))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("Failed to deserialize task instance")
    }

    /// Merges `diff` into this record, last write wins per leaf.
    pub fn apply(&mut self, diff: &Diff) -> Result<()> {
        let mut value = self.to_value()?;
        patch::merge_in_place(&mut value, diff);
        *self = Self::from_value(value)?;
        Ok(())
    }

    pub fn content_hash(&self) -> Result<u32> {
        Ok(hash::task_hash(&self.to_value()?))
    }

    /// Recomputes `meta.hash` from the current content.
    pub fn rehash(&mut self) -> Result<u32> {
        let hash = self.content_hash()?;
        self.meta.hash = Some(hash);
        Ok(hash)
    }
}
