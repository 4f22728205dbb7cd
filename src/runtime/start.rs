use serde_json::json;
use tracing::info;

use crate::error::{HubError, HubResult};
use crate::protocol::{Command, CommandArgs, Inbound};
use crate::runtime::allocator;
use crate::runtime::engine::{Hub, Outcome};
use crate::runtime::instances;
use crate::runtime::pipeline::{self, PipelineStage};
use crate::runtime::registry::NodeRegistration;
use crate::task::patch::Diff;
use crate::task::{ENGINE_OWNED, TaskInstance};

/// Everything needed to instantiate a template.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub template_id: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub family_id: Option<String>,
    pub thread_id: Option<String>,
    pub prev_instance_id: Option<String>,
    pub parent_instance_id: Option<String>,
    /// Initial content merged over the template.
    pub body: Diff,
    /// Node that asked for the start. Preferred during allocation.
    pub source: Option<NodeRegistration>,
}

impl StartRequest {
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            ..Default::default()
        }
    }

    pub fn from_inbound(sender: &NodeRegistration, inbound: &Inbound) -> HubResult<Self> {
        let args = &inbound.command_args;
        let template_id = args
            .template_id
            .clone()
            .ok_or_else(|| HubError::Protocol("start without templateId".into()))?;
        Ok(Self {
            template_id,
            user_id: args.user_id.clone(),
            group_id: args.group_id.clone(),
            family_id: args.family_id.clone(),
            thread_id: args.thread_id.clone(),
            prev_instance_id: args.prev_instance_id.clone(),
            parent_instance_id: None,
            body: Diff::from_wire(&inbound.task)?,
            source: Some(sender.clone()),
        })
    }
}

impl Hub {
    /// Instantiates (or restarts, or joins) a template and moves it to `init`.
    pub async fn start(&self, request: StartRequest) -> HubResult<Outcome> {
        let template = self
            .ctx
            .template(&request.template_id)
            .await?
            .ok_or_else(|| HubError::TemplateNotFound(request.template_id.clone()))?;
        if template.environments.is_empty() {
            return Err(HubError::InvalidTemplate {
                template_id: template.id.clone(),
                reason: "no environments".into(),
            });
        }

        let now = self.now();
        let source = request.source.as_ref();
        let user_id = request
            .user_id
            .clone()
            .or_else(|| source.and_then(|s| s.user_id.clone()))
            .or_else(|| self.config.default_user.clone());
        let policy = template.policy();
        let singleton = instances::singleton_id(&template.id, &policy, user_id.as_deref());
        let instance_id = singleton.clone().unwrap_or_else(instances::fresh_id);

        let guard = self.locks.acquire(&instance_id).await;

        let existing = match &singleton {
            Some(id) => self.store.instance(id).await?,
            None => None,
        };
        let mut task = match existing {
            Some(mut task) => {
                if self.is_live(&task).await? {
                    drop(guard);
                    info!(instance_id = %instance_id, template_id = %template.id, "Singleton is live, joining");
                    return match source {
                        Some(source) => self.join(source, &instance_id).await,
                        None => Ok(Outcome::Joined {
                            instance_id,
                            node_id: None,
                        }),
                    };
                }
                info!(instance_id = %instance_id, template_id = %template.id, "Restarting singleton");
                self.active.deactivate(&instance_id).await?;
                instances::reset_for_restart(&mut task, &template);
                task
            }
            None => {
                let previous = match &request.prev_instance_id {
                    Some(id) => self.store.instance(id).await?,
                    None => None,
                };
                let lineage = instances::lineage(
                    &instance_id,
                    singleton.is_some(),
                    request.family_id.as_deref(),
                    request.thread_id.as_deref(),
                    previous.as_ref(),
                );
                let mut task = TaskInstance::from_template(&template, &instance_id, lineage.family_id);
                task.thread_id = Some(lineage.thread_id);
                task.meta.created_at = Some(now);
                task.meta.prev_instance_id = request.prev_instance_id.clone();
                task.meta.parent_instance_id = request.parent_instance_id.clone();
                task
            }
        };

        if user_id.is_some() {
            task.user_id = user_id.clone();
        }
        if let Some(group) = request.group_id.clone().or(policy.collaborate_group_id) {
            task.group_id = Some(group);
        }
        if let Some(user) = &task.user_id {
            task.users
                .entry(user.clone())
                .or_insert_with(|| json!({ "userId": user }));
        }
        Self::merge_body(&mut task, &request.body.clone().without(&ENGINE_OWNED))?;

        let outputs = self.store.family_outputs(&task.family_id).await?;
        self.ctx
            .substitution
            .substitute(&mut task, &outputs)
            .map_err(|e| HubError::InvalidTemplate {
                template_id: template.id.clone(),
                reason: format!("substitution failed: {:#}", e),
            })?;

        if !self
            .ctx
            .access
            .may_start(&template, task.user_id.as_deref(), task.group_id.as_deref())
        {
            return Err(HubError::PermissionDenied {
                template_id: template.id.clone(),
                user_id: task.user_id.clone().unwrap_or_else(|| "anonymous".into()),
            });
        }

        let mut routes = allocator::allocate(
            &template.id,
            &task.environments,
            source,
            &task.nodes,
            &self.registry,
        )?;
        for route in routes.values_mut() {
            route.command = Some(Command::Init);
        }
        task.nodes = routes;

        let outcome = self.init(task, source).await;
        drop(guard);
        outcome
    }

    /// Sends a new instance through the pipeline, or commits it straight away.
    pub(crate) async fn init(
        &self,
        task: TaskInstance,
        source: Option<&NodeRegistration>,
    ) -> HubResult<Outcome> {
        let args = CommandArgs::default();
        if pipeline::enters_pipeline(Command::Init, source, &args, &self.exempt) {
            let chain = self.registry.pipeline();
            if let Some((position, coprocessor)) =
                pipeline::next_coprocessor(&chain, Command::Init, &[])
            {
                let stage = PipelineStage::new(
                    Command::Init,
                    &task.instance_id,
                    source.map(|s| s.node_id.clone()),
                    args,
                    task.to_value()?,
                    &Diff::new(),
                    None,
                    self.now(),
                );
                return self.park(stage, coprocessor, position).await;
            }
        }
        self.commit_init(task, source.map(|s| s.node_id.as_str())).await
    }

    /// Records the instance everywhere and sends the full task to its nodes.
    pub(crate) async fn commit_init(
        &self,
        mut task: TaskInstance,
        source: Option<&str>,
    ) -> HubResult<Outcome> {
        let now = self.now();
        task.meta.created_at.get_or_insert(now);
        task.meta.updated_at = Some(now);
        task.meta.last_updated_at = Some(now);
        task.meta.broadcast_count = self.sync.next_broadcast_count();
        task.rehash()?;

        self.store.put_instance(&task).await?;
        self.store.append_family(&task.family_id, &task.instance_id).await?;
        if let Some(thread_id) = &task.thread_id {
            self.store.append_thread(thread_id, &task.instance_id).await?;
        }
        self.active
            .activate(&task.instance_id, task.nodes.keys().cloned())
            .await?;

        let report = self
            .sync
            .broadcast(&task, Command::Init, source, &CommandArgs::default())
            .await?;
        self.prune_gone(&task.instance_id, &report).await?;

        info!(
            instance_id = %task.instance_id,
            template_id = %task.template_id,
            family_id = %task.family_id,
            nodes = task.nodes.len(),
            "Task started"
        );
        Ok(Outcome::Started {
            instance_id: task.instance_id.clone(),
            nodes: task.nodes.keys().cloned().collect(),
        })
    }

    /// Attaches `sender` to an active instance. No lock or admission checks.
    pub(crate) async fn join(&self, sender: &NodeRegistration, instance_id: &str) -> HubResult<Outcome> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut task = self.live_instance(instance_id).await?;

        if !task.nodes.contains_key(&sender.node_id) {
            let mut route = sender.route();
            route.command = Some(Command::Join);
            task.nodes.insert(sender.node_id.clone(), route);
            self.store.put_instance(&task).await?;
        }
        self.active.add_holder(instance_id, &sender.node_id).await?;
        self.sync.send_full(&task, &sender.node_id, Command::Join).await?;

        info!(instance_id = %instance_id, node_id = %sender.node_id, "Node joined");
        Ok(Outcome::Joined {
            instance_id: instance_id.to_string(),
            node_id: Some(sender.node_id.clone()),
        })
    }
}
