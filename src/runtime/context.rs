use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::runtime::clock::{Clock, SystemClock};
use crate::task::{TaskInstance, TaskTemplate};

/// Source of resolved task templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, template_id: &str) -> Result<Option<TaskTemplate>>;
    async fn list(&self) -> Result<Vec<TaskTemplate>>;
}

/// Fills a new instance from the outputs its family produced so far.
pub trait FieldSubstitution: Send + Sync {
    fn substitute(&self, task: &mut TaskInstance, family_outputs: &Value) -> Result<()>;
}

/// Decides whether a user may start a template.
pub trait AccessPolicy: Send + Sync {
    fn may_start(&self, template: &TaskTemplate, user_id: Option<&str>, group_id: Option<&str>) -> bool;
}

#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: DashMap<String, TaskTemplate>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: impl IntoIterator<Item = TaskTemplate>) -> Self {
        let store = Self::new();
        for template in templates {
            store.insert(template);
        }
        store
    }

    pub fn insert(&self, template: TaskTemplate) {
        self.templates.insert(template.id.clone(), template);
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get(&self, template_id: &str) -> Result<Option<TaskTemplate>> {
        Ok(self.templates.get(template_id).map(|t| t.value().clone()))
    }

    async fn list(&self) -> Result<Vec<TaskTemplate>> {
        let mut templates: Vec<TaskTemplate> =
            self.templates.iter().map(|t| t.value().clone()).collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(templates)
    }
}

/// Leaves instances as instantiated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSubstitution;

impl FieldSubstitution for NoSubstitution {
    fn substitute(&self, _task: &mut TaskInstance, _family_outputs: &Value) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn may_start(&self, _template: &TaskTemplate, _user_id: Option<&str>, _group_id: Option<&str>) -> bool {
        true
    }
}

/// External collaborators the hub calls into. Cheap to clone.
#[derive(Clone)]
pub struct HubContext {
    pub templates: Arc<dyn TemplateStore>,
    pub substitution: Arc<dyn FieldSubstitution>,
    pub access: Arc<dyn AccessPolicy>,
    pub clock: Arc<dyn Clock>,
}

impl HubContext {
    pub fn new(templates: Arc<dyn TemplateStore>) -> Self {
        Self {
            templates,
            substitution: Arc::new(NoSubstitution),
            access: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
        }
    }

    pub async fn template(&self, template_id: &str) -> Result<Option<TaskTemplate>> {
        self.templates.get(template_id).await
    }
}
