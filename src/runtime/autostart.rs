use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::runtime::storage::{HubStore, ns};
use crate::task::TaskTemplate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoStartEntry {
    pub template_id: String,
    /// Environment owning the entry. Its nodes may retrigger a non-`once` entry.
    pub start_environment: String,
    pub environments: Vec<String>,
    pub once: bool,
    pub started: bool,
    pub priority: i64,
}

impl AutoStartEntry {
    pub fn from_template(template: &TaskTemplate) -> Option<Self> {
        let spec = template.auto_start.as_ref()?;
        let environments = if spec.environments.is_empty() {
            template.environments.clone()
        } else {
            spec.environments.clone()
        };
        Some(Self {
            template_id: template.id.clone(),
            start_environment: spec.environment.clone(),
            environments,
            once: spec.once,
            started: false,
            priority: spec.priority,
        })
    }

    fn satisfied_by(&self, connected: &BTreeSet<String>) -> bool {
        self.environments.iter().all(|e| connected.contains(e))
    }

    fn due(&self, registering_environment: Option<&str>) -> bool {
        !self.started || (!self.once && registering_environment == Some(self.start_environment.as_str()))
    }
}

pub struct AutoStartRegistry {
    store: Arc<HubStore>,
    writer: Mutex<()>,
}

impl AutoStartRegistry {
    pub fn new(store: Arc<HubStore>) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
        }
    }

    /// Adds entries for templates that declare an autostart. Existing entries keep their `started` flag.
    pub async fn seed(&self, templates: &[TaskTemplate]) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let mut added = 0;
        for entry in templates.iter().filter_map(AutoStartEntry::from_template) {
            let existing: Option<AutoStartEntry> =
                self.store.get_json(ns::AUTOSTART, &entry.template_id).await?;
            let entry = match existing {
                Some(prev) => AutoStartEntry {
                    started: prev.started,
                    ..entry
                },
                None => {
                    added += 1;
                    entry
                }
            };
            self.store.put_json(ns::AUTOSTART, &entry.template_id, &entry).await?;
        }
        Ok(added)
    }

    pub async fn entries(&self) -> Result<Vec<AutoStartEntry>> {
        let mut entries: Vec<AutoStartEntry> = self.store.all_json(ns::AUTOSTART).await?;
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.template_id.cmp(&b.template_id))
        });
        Ok(entries)
    }

    /// Marks every due entry as started and returns them, highest priority first.
    pub async fn claim_due(
        &self,
        connected: &BTreeSet<String>,
        registering_environment: Option<&str>,
    ) -> Result<Vec<AutoStartEntry>> {
        let _guard = self.writer.lock().await;
        let mut claimed = Vec::new();
        for mut entry in self.entries().await? {
            if !entry.satisfied_by(connected) || !entry.due(registering_environment) {
                continue;
            }
            entry.started = true;
            self.store.put_json(ns::AUTOSTART, &entry.template_id, &entry).await?;
            info!(template_id = %entry.template_id, priority = entry.priority, "Autostart due");
            claimed.push(entry);
        }
        Ok(claimed)
    }

    /// Lets a claimed entry fire again, after its start failed.
    pub async fn unclaim(&self, template_id: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        let entry: Option<AutoStartEntry> = self.store.get_json(ns::AUTOSTART, template_id).await?;
        if let Some(mut entry) = entry {
            entry.started = false;
            self.store.put_json(ns::AUTOSTART, template_id, &entry).await?;
        }
        Ok(())
    }
}
