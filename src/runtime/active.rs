use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::runtime::pipeline::PipelineStage;
use crate::runtime::storage::{HubStore, ns};

/// Live routing state of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRecord {
    pub instance_id: String,
    /// False while only a parked `init` exists.
    pub active: bool,
    pub holders: BTreeSet<String>,
    #[serde(default)]
    pub pending: BTreeMap<String, PipelineStage>,
}

impl ActiveRecord {
    pub fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.pending.is_empty()
    }
}

/// Active-task registry. All mutations go through one writer.
pub struct ActiveTaskRegistry {
    store: Arc<HubStore>,
    writer: Mutex<()>,
}

impl ActiveTaskRegistry {
    pub fn new(store: Arc<HubStore>) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
        }
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<ActiveRecord>> {
        self.store.get_json(ns::ACTIVE, instance_id).await
    }

    pub async fn all(&self) -> Result<Vec<ActiveRecord>> {
        self.store.all_json(ns::ACTIVE).await
    }

    async fn put(&self, record: &ActiveRecord) -> Result<()> {
        self.store.put_json(ns::ACTIVE, &record.instance_id, record).await
    }

    async fn load_or_new(&self, instance_id: &str) -> Result<ActiveRecord> {
        Ok(self.get(instance_id).await?.unwrap_or_else(|| ActiveRecord {
            instance_id: instance_id.to_string(),
            ..Default::default()
        }))
    }

    /// Marks the instance active and adds `holders` to its holder set.
    pub async fn activate<I>(&self, instance_id: &str, holders: I) -> Result<ActiveRecord>
    where
        I: IntoIterator<Item = String>,
    {
        let _guard = self.writer.lock().await;
        let mut record = self.load_or_new(instance_id).await?;
        record.active = true;
        for node_id in holders {
            self.store.add_node_task(&node_id, instance_id).await?;
            record.holders.insert(node_id);
        }
        self.put(&record).await?;
        Ok(record)
    }

    pub async fn add_holder(&self, instance_id: &str, node_id: &str) -> Result<()> {
        self.activate(instance_id, [node_id.to_string()]).await.map(|_| ())
    }

    /// Drops the record, its reverse index entries and its stored views.
    pub async fn deactivate(&self, instance_id: &str) -> Result<Option<ActiveRecord>> {
        let _guard = self.writer.lock().await;
        let Some(record) = self.get(instance_id).await? else {
            return Ok(None);
        };
        for node_id in &record.holders {
            self.store.remove_node_task(node_id, instance_id).await?;
            self.store.delete_view(instance_id, node_id).await?;
        }
        self.store.delete(ns::ACTIVE, instance_id).await?;
        debug!(instance_id = %instance_id, "Active record removed");
        Ok(Some(record))
    }

    /// Deletes the record if nothing holds or awaits it any more.
    pub async fn release_if_idle(&self, instance_id: &str) -> Result<bool> {
        let idle = self
            .get(instance_id)
            .await?
            .is_some_and(|record| record.is_idle());
        if idle {
            self.deactivate(instance_id).await?;
        }
        Ok(idle)
    }

    /// Removes `node_id` from every holder set it is in.
    /// Returns the instances whose record became idle and was deleted.
    pub async fn remove_node(&self, node_id: &str) -> Result<Vec<String>> {
        let _guard = self.writer.lock().await;
        let mut released = Vec::new();
        for instance_id in self.store.node_tasks(node_id).await? {
            self.store.delete_view(&instance_id, node_id).await?;
            let Some(mut record) = self.get(&instance_id).await? else {
                continue;
            };
            record.holders.remove(node_id);
            if record.is_idle() {
                self.store.delete(ns::ACTIVE, &instance_id).await?;
                released.push(instance_id);
            } else {
                self.put(&record).await?;
            }
        }
        self.store.drop_node_tasks(node_id).await?;
        Ok(released)
    }

    /// Drops holders that are no longer connected.
    pub async fn prune_holders(&self, instance_id: &str, gone: &[String]) -> Result<()> {
        if gone.is_empty() {
            return Ok(());
        }
        let _guard = self.writer.lock().await;
        let Some(mut record) = self.get(instance_id).await? else {
            return Ok(());
        };
        for node_id in gone {
            record.holders.remove(node_id);
            self.store.remove_node_task(node_id, instance_id).await?;
            self.store.delete_view(instance_id, node_id).await?;
        }
        self.put(&record).await
    }

    // --- parked pipeline stages ---

    /// Stores or replaces a stage. Creates an inactive record for a parked `init`.
    pub async fn park(&self, stage: PipelineStage) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut record = self.load_or_new(&stage.instance_id).await?;
        record.pending.insert(stage.ticket.clone(), stage);
        self.put(&record).await
    }

    pub async fn take_stage(&self, instance_id: &str, ticket: &str) -> Result<Option<PipelineStage>> {
        let _guard = self.writer.lock().await;
        let Some(mut record) = self.get(instance_id).await? else {
            return Ok(None);
        };
        let stage = record.pending.remove(ticket);
        if stage.is_some() {
            self.put(&record).await?;
        }
        Ok(stage)
    }

    pub async fn stage(&self, instance_id: &str, ticket: &str) -> Result<Option<PipelineStage>> {
        Ok(self
            .get(instance_id)
            .await?
            .and_then(|mut record| record.pending.remove(ticket)))
    }

    /// Every parked stage currently waiting on `node_id`.
    pub async fn stages_awaiting(&self, node_id: &str) -> Result<Vec<PipelineStage>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .flat_map(|record| record.pending.into_values())
            .filter(|stage| stage.awaiting == node_id)
            .collect())
    }
}
