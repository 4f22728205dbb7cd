use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::task::TaskInstance;

// --- Interfaces ---

/// Durable key-value engine. Keys live in flat namespaces.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;
    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()>;
    async fn has(&self, namespace: &str, key: &str) -> Result<bool>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;
    /// Every entry of a namespace. Order is unspecified.
    async fn iterate(&self, namespace: &str) -> Result<Vec<(String, Value)>>;
}

// --- In-Memory Implementation ---

#[derive(Default)]
pub struct InMemoryKvStore {
    // Map<Namespace, Map<Key, Value>>
    spaces: DashMap<String, DashMap<String, Value>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .spaces
            .get(namespace)
            .and_then(|space| space.get(key).map(|v| v.value().clone())))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let space = self
            .spaces
            .entry(namespace.to_string())
            .or_insert_with(DashMap::new);
        space.insert(key.to_string(), value);
        Ok(())
    }

    async fn has(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .spaces
            .get(namespace)
            .is_some_and(|space| space.contains_key(key)))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        if let Some(space) = self.spaces.get(namespace) {
            space.remove(key);
        }
        Ok(())
    }

    async fn iterate(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .spaces
            .get(namespace)
            .map(|space| {
                space
                    .iter()
                    .map(|item| (item.key().clone(), item.value().clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// --- Typed access ---

pub mod ns {
    pub const INSTANCES: &str = "instances";
    pub const FAMILIES: &str = "families";
    pub const THREADS: &str = "threads";
    pub const OUTPUTS: &str = "outputs";
    pub const ACTIVE: &str = "active";
    pub const NODE_TASKS: &str = "nodeTasks";
    pub const VIEWS: &str = "views";
    pub const AUTOSTART: &str = "autostart";
}

fn view_key(instance_id: &str, node_id: &str) -> String {
    format!("{}:{}", instance_id, node_id)
}

/// Hub records on top of a [`KvStore`].
pub struct HubStore {
    kv: Arc<dyn KvStore>,
    // Serializes read-modify-write of the append-only indexes.
    index_writer: Mutex<()>,
}

impl HubStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            index_writer: Mutex::new(()),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.kv.get(namespace, key).await? {
            Some(value) => {
                let parsed = serde_json::from_value(value)
                    .with_context(|| format!("Corrupt record {}/{}", namespace, key))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(&self, namespace: &str, key: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)
            .with_context(|| format!("Failed to serialize {}/{}", namespace, key))?;
        self.kv.set(namespace, key, value).await
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.kv.delete(namespace, key).await
    }

    pub async fn all_json<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        self.kv
            .iterate(namespace)
            .await?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value)
                    .with_context(|| format!("Corrupt record {}/{}", namespace, key))
            })
            .collect()
    }

    // --- instances ---

    pub async fn instance(&self, instance_id: &str) -> Result<Option<TaskInstance>> {
        self.get_json(ns::INSTANCES, instance_id).await
    }

    pub async fn has_instance(&self, instance_id: &str) -> Result<bool> {
        self.kv.has(ns::INSTANCES, instance_id).await
    }

    pub async fn put_instance(&self, task: &TaskInstance) -> Result<()> {
        self.put_json(ns::INSTANCES, &task.instance_id, task).await
    }

    // --- families, threads, outputs ---

    pub async fn family(&self, family_id: &str) -> Result<Vec<String>> {
        Ok(self.get_json(ns::FAMILIES, family_id).await?.unwrap_or_default())
    }

    pub async fn thread(&self, thread_id: &str) -> Result<Vec<String>> {
        Ok(self.get_json(ns::THREADS, thread_id).await?.unwrap_or_default())
    }

    pub async fn append_family(&self, family_id: &str, instance_id: &str) -> Result<()> {
        self.append(ns::FAMILIES, family_id, instance_id).await
    }

    pub async fn append_thread(&self, thread_id: &str, instance_id: &str) -> Result<()> {
        self.append(ns::THREADS, thread_id, instance_id).await
    }

    async fn append(&self, namespace: &str, key: &str, instance_id: &str) -> Result<()> {
        let _guard = self.index_writer.lock().await;
        let mut members: Vec<String> = self.get_json(namespace, key).await?.unwrap_or_default();
        if !members.iter().any(|m| m == instance_id) {
            members.push(instance_id.to_string());
            self.put_json(namespace, key, &members).await?;
        }
        Ok(())
    }

    /// Outputs of a family keyed `"<templateId>.output"`.
    pub async fn family_outputs(&self, family_id: &str) -> Result<Value> {
        Ok(self
            .kv
            .get(ns::OUTPUTS, family_id)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    pub async fn record_output(&self, family_id: &str, template_id: &str, output: &Value) -> Result<()> {
        let _guard = self.index_writer.lock().await;
        let mut outputs = match self.kv.get(ns::OUTPUTS, family_id).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        outputs.insert(format!("{}.output", template_id), output.clone());
        self.kv.set(ns::OUTPUTS, family_id, Value::Object(outputs)).await
    }

    // --- node -> instances reverse index ---

    pub async fn node_tasks(&self, node_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.get_json(ns::NODE_TASKS, node_id).await?.unwrap_or_default())
    }

    pub async fn add_node_task(&self, node_id: &str, instance_id: &str) -> Result<()> {
        let _guard = self.index_writer.lock().await;
        let mut tasks = self.node_tasks(node_id).await?;
        if tasks.insert(instance_id.to_string()) {
            self.put_json(ns::NODE_TASKS, node_id, &tasks).await?;
        }
        Ok(())
    }

    pub async fn remove_node_task(&self, node_id: &str, instance_id: &str) -> Result<()> {
        let _guard = self.index_writer.lock().await;
        let mut tasks = self.node_tasks(node_id).await?;
        if tasks.remove(instance_id) {
            if tasks.is_empty() {
                self.kv.delete(ns::NODE_TASKS, node_id).await?;
            } else {
                self.put_json(ns::NODE_TASKS, node_id, &tasks).await?;
            }
        }
        Ok(())
    }

    pub async fn drop_node_tasks(&self, node_id: &str) -> Result<()> {
        let _guard = self.index_writer.lock().await;
        self.kv.delete(ns::NODE_TASKS, node_id).await
    }

    // --- last broadcast views ---

    pub async fn view(&self, instance_id: &str, node_id: &str) -> Result<Option<Value>> {
        self.kv.get(ns::VIEWS, &view_key(instance_id, node_id)).await
    }

    pub async fn set_view(&self, instance_id: &str, node_id: &str, view: Value) -> Result<()> {
        self.kv.set(ns::VIEWS, &view_key(instance_id, node_id), view).await
    }

    pub async fn delete_view(&self, instance_id: &str, node_id: &str) -> Result<()> {
        self.kv.delete(ns::VIEWS, &view_key(instance_id, node_id)).await
    }
}
