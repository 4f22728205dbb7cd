use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::protocol::{Command, CommandArgs, Inbound};
use crate::runtime::active::{ActiveRecord, ActiveTaskRegistry};
use crate::runtime::autostart::AutoStartRegistry;
use crate::runtime::clock::Clock;
use crate::runtime::context::{AccessPolicy, FieldSubstitution, HubContext, InMemoryTemplateStore, TemplateStore};
use crate::runtime::lock::InstanceLocks;
use crate::runtime::outbound::Outbound;
use crate::runtime::pipeline::PipelineStage;
use crate::runtime::registry::{NodeRegistration, NodeRegistry};
use crate::runtime::start::StartRequest;
use crate::runtime::storage::{HubStore, InMemoryKvStore, KvStore};
use crate::runtime::sync::{BroadcastReport, Synchronizer};
use crate::task::TaskInstance;
use crate::task::patch::Diff;

/// What a successfully handled command did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Outcome {
    Registered {
        hub_id: String,
        autostarted: Vec<String>,
    },
    /// Instance committed and sent to its nodes.
    Started {
        instance_id: String,
        nodes: Vec<String>,
    },
    Joined {
        instance_id: String,
        node_id: Option<String>,
    },
    Committed {
        instance_id: String,
        update_count: u64,
    },
    Completed {
        instance_id: String,
        next_instance_id: Option<String>,
    },
    ErrorRouted {
        instance_id: String,
        handler_instance_id: Option<String>,
    },
    /// Waiting on a coprocessor.
    Parked {
        instance_id: String,
        ticket: String,
        coprocessor: String,
    },
    Forwarded {
        instance_id: String,
        recipients: usize,
    },
    Ack,
}

impl Outcome {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Outcome::Started { instance_id, .. }
            | Outcome::Joined { instance_id, .. }
            | Outcome::Committed { instance_id, .. }
            | Outcome::Completed { instance_id, .. }
            | Outcome::ErrorRouted { instance_id, .. }
            | Outcome::Parked { instance_id, .. }
            | Outcome::Forwarded { instance_id, .. } => Some(instance_id),
            Outcome::Registered { .. } | Outcome::Ack => None,
        }
    }

    pub(crate) fn chained(self, next: Option<String>) -> Self {
        match self {
            Outcome::Completed { instance_id, .. } => Outcome::Completed {
                instance_id,
                next_instance_id: next,
            },
            Outcome::ErrorRouted { instance_id, .. } => Outcome::ErrorRouted {
                instance_id,
                handler_instance_id: next,
            },
            other => other,
        }
    }
}

/// Work that runs after the instance mutex is released.
#[derive(Debug)]
pub(crate) enum FollowUp {
    Chain(StartRequest),
    RouteError {
        instance_id: String,
        error_task: Option<String>,
    },
}

pub struct Hub {
    pub(crate) config: HubConfig,
    pub(crate) ctx: HubContext,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) store: Arc<HubStore>,
    pub(crate) active: ActiveTaskRegistry,
    pub(crate) autostart: AutoStartRegistry,
    pub(crate) locks: InstanceLocks,
    pub(crate) sync: Synchronizer,
    pub(crate) exempt: Vec<Command>,
    halted: AtomicBool,
    error_window: Mutex<VecDeque<DateTime<Utc>>>,
}

pub struct HubBuilder {
    config: HubConfig,
    kv: Option<Arc<dyn KvStore>>,
    outbound: Option<Arc<dyn Outbound>>,
    templates: Option<Arc<dyn TemplateStore>>,
    substitution: Option<Arc<dyn FieldSubstitution>>,
    access: Option<Arc<dyn AccessPolicy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            kv: None,
            outbound: None,
            templates: None,
            substitution: None,
            access: None,
            clock: None,
        }
    }

    pub fn store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn templates(mut self, templates: Arc<dyn TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn substitution(mut self, substitution: Arc<dyn FieldSubstitution>) -> Self {
        self.substitution = Some(substitution);
        self
    }

    pub fn access(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> Result<Hub> {
        let outbound = self
            .outbound
            .ok_or_else(|| anyhow!("Hub needs an outbound transport"))?;
        let kv = self.kv.unwrap_or_else(|| Arc::new(InMemoryKvStore::new()));
        let templates = self.templates.unwrap_or_else(|| {
            Arc::new(InMemoryTemplateStore::from_templates(
                self.config.templates.iter().cloned(),
            ))
        });

        let mut ctx = HubContext::new(templates);
        if let Some(substitution) = self.substitution {
            ctx.substitution = substitution;
        }
        if let Some(access) = self.access {
            ctx.access = access;
        }
        if let Some(clock) = self.clock {
            ctx.clock = clock;
        }

        let store = Arc::new(HubStore::new(kv));
        let registry = Arc::new(NodeRegistry::new());
        let sync = Synchronizer::new(
            self.config.hub_id.clone(),
            registry.clone(),
            store.clone(),
            outbound,
        );
        let autostart = AutoStartRegistry::new(store.clone());
        let seeded = autostart.seed(&ctx.templates.list().await?).await?;

        let hub = Hub {
            exempt: self.config.exempt(),
            config: self.config,
            ctx,
            registry,
            active: ActiveTaskRegistry::new(store.clone()),
            store,
            autostart,
            locks: InstanceLocks::new(),
            sync,
            halted: AtomicBool::new(false),
            error_window: Mutex::new(VecDeque::new()),
        };
        info!(hub_id = %hub.config.hub_id, autostart_entries = seeded, "Hub ready");
        Ok(hub)
    }
}

impl Hub {
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    pub fn hub_id(&self) -> &str {
        &self.config.hub_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &HubStore {
        &self.store
    }

    pub fn active(&self) -> &ActiveTaskRegistry {
        &self.active
    }

    pub fn autostart(&self) -> &AutoStartRegistry {
        &self.autostart
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    pub async fn instance(&self, instance_id: &str) -> HubResult<Option<TaskInstance>> {
        Ok(self.store.instance(instance_id).await?)
    }

    pub async fn active_record(&self, instance_id: &str) -> HubResult<Option<ActiveRecord>> {
        Ok(self.active.get(instance_id).await?)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Re-admits commands after a storage failure.
    pub fn resume(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!(hub_id = %self.config.hub_id, "Hub resumed");
        }
    }

    fn halt(&self, reason: &anyhow::Error) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(hub_id = %self.config.hub_id, "Storage failure, halting: {:#}", reason);
        }
    }

    /// Entry point for every node message.
    pub async fn handle(&self, inbound: Inbound) -> HubResult<Outcome> {
        let command = inbound.command;
        let node_id = inbound.node_id.clone();
        let instance_id = inbound.instance_id.clone().unwrap_or_default();

        let result = self.dispatch(inbound).await;
        match &result {
            Ok(outcome) => {
                debug!(node_id = %node_id, command = %command, instance_id = %instance_id, ?outcome, "Handled");
            }
            Err(HubError::Storage(e)) => self.halt(e),
            Err(e) if e.is_retryable() => {
                info!(node_id = %node_id, command = %command, instance_id = %instance_id, "Rejected: {}", e);
            }
            Err(e) => {
                warn!(node_id = %node_id, command = %command, instance_id = %instance_id, "Failed: {}", e);
            }
        }
        result
    }

    async fn dispatch(&self, inbound: Inbound) -> HubResult<Outcome> {
        inbound.validate()?;
        if inbound.command == Command::Register {
            return self.register(&inbound.node_id, &inbound.command_args).await;
        }

        let sender = self.sender(&inbound.node_id).await?;
        if inbound.command == Command::Pong {
            return Ok(Outcome::Ack);
        }
        if self.is_halted() {
            return Err(HubError::Halted);
        }
        if inbound.pipeline.is_some() {
            return self.resume_stage(&sender, inbound).await;
        }

        match inbound.command {
            Command::Start => self.start(StartRequest::from_inbound(&sender, &inbound)?).await,
            Command::Init => Err(HubError::Protocol("init is issued by the hub".into())),
            Command::Join => {
                let instance_id = required_instance(&inbound)?;
                self.join(&sender, &instance_id).await
            }
            Command::Update => self.update(&sender, inbound).await,
            Command::Error => self.error(&sender, inbound).await,
            Command::Partial => self.partial(&sender, &inbound).await,
            Command::Register | Command::Pong => Ok(Outcome::Ack),
        }
    }

    /// Registered sender, or a register request sent back to an unknown one.
    async fn sender(&self, node_id: &str) -> HubResult<NodeRegistration> {
        match self.registry.get(node_id) {
            Some(registration) => {
                self.registry.touch(node_id, self.now());
                Ok(registration)
            }
            None => {
                self.sync.request_registration(node_id).await;
                Err(HubError::UnknownNode(node_id.to_string()))
            }
        }
    }

    // --- node lifecycle ---

    pub async fn register(&self, node_id: &str, args: &CommandArgs) -> HubResult<Outcome> {
        let (registration, new) = self.registry.register(node_id, args, self.now())?;
        info!(
            node_id = %node_id,
            environment = %registration.environment,
            role = ?registration.role,
            new,
            "Node registered"
        );
        let autostarted = self.run_autostart(&registration.environment).await;
        Ok(Outcome::Registered {
            hub_id: self.config.hub_id.clone(),
            autostarted,
        })
    }

    async fn run_autostart(&self, registering_environment: &str) -> Vec<String> {
        let connected = self.registry.environments();
        if !self
            .config
            .hub_environments
            .iter()
            .all(|e| connected.contains(e))
        {
            return Vec::new();
        }

        let due = match self
            .autostart
            .claim_due(&connected, Some(registering_environment))
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("Autostart lookup failed: {:#}", e);
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for entry in due {
            let request = StartRequest {
                user_id: self.config.default_user.clone(),
                ..StartRequest::new(&entry.template_id)
            };
            match self.start(request).await {
                Ok(outcome) => {
                    if let Some(id) = outcome.instance_id() {
                        started.push(id.to_string());
                    }
                }
                Err(e) => {
                    warn!(template_id = %entry.template_id, "Autostart failed: {}", e);
                    if let Err(e) = self.autostart.unclaim(&entry.template_id).await {
                        error!(template_id = %entry.template_id, "Autostart reset failed: {:#}", e);
                    }
                }
            }
        }
        started
    }

    /// Removes a node and everything routed to it. Returns instances left without holders.
    pub async fn unregister(&self, node_id: &str) -> HubResult<Vec<String>> {
        let Some(registration) = self.registry.unregister(node_id) else {
            return Ok(Vec::new());
        };
        let attached = self.store.node_tasks(node_id).await?;

        for parked in self.active.stages_awaiting(node_id).await? {
            let guard = self.locks.acquire(&parked.instance_id).await;
            let Some(mut stage) = self.active.stage(&parked.instance_id, &parked.ticket).await? else {
                continue;
            };
            if stage.awaiting != node_id {
                continue;
            }
            warn!(instance_id = %stage.instance_id, node_id = %node_id, "Coprocessor left, skipping it");
            stage.visited.push(node_id.to_string());
            let (_, follow) = self.continue_stage(stage).await?;
            drop(guard);
            self.run_follow_up(follow).await;
        }

        for instance_id in &attached {
            let _guard = self.locks.acquire(instance_id).await;
            self.detach(instance_id, &[node_id.to_string()]).await?;
        }

        let released = self.active.remove_node(node_id).await?;
        for instance_id in &released {
            self.locks.prune(instance_id);
        }
        info!(
            node_id = %node_id,
            environment = %registration.environment,
            released = released.len(),
            "Node unregistered"
        );
        Ok(released)
    }

    /// Unregisters nodes that stopped answering.
    pub async fn reap_stale_nodes(&self) -> HubResult<Vec<String>> {
        let cutoff = self.now() - self.config.heartbeat_timeout();
        let stale = self.registry.stale(cutoff);
        for node_id in &stale {
            warn!(node_id = %node_id, "Node missed heartbeat");
            self.unregister(node_id).await?;
        }
        Ok(stale)
    }

    // --- partial ---

    async fn partial(&self, sender: &NodeRegistration, inbound: &Inbound) -> HubResult<Outcome> {
        let instance_id = required_instance(inbound)?;
        let task = self.live_instance(&instance_id).await?;
        let recipients = self
            .sync
            .forward_partial(&task, &sender.node_id, &inbound.task, &inbound.command_args)
            .await;
        Ok(Outcome::Forwarded {
            instance_id,
            recipients,
        })
    }

    // --- shared helpers ---

    /// Stored instance with an active record, or `NotFound`.
    pub(crate) async fn live_instance(&self, instance_id: &str) -> HubResult<TaskInstance> {
        let active = self
            .active
            .get(instance_id)
            .await?
            .is_some_and(|record| record.active);
        if !active {
            return Err(HubError::NotFound(instance_id.to_string()));
        }
        self.store
            .instance(instance_id)
            .await?
            .ok_or_else(|| HubError::NotFound(instance_id.to_string()))
    }

    /// Active, with every required environment covered by a connected holder.
    pub(crate) async fn is_live(&self, task: &TaskInstance) -> HubResult<bool> {
        let Some(record) = self.active.get(&task.instance_id).await? else {
            return Ok(false);
        };
        if !record.active {
            return Ok(false);
        }
        Ok(task.environments.iter().all(|environment| {
            record.holders.iter().any(|holder| {
                self.registry
                    .get(holder)
                    .is_some_and(|r| r.environment == *environment)
            })
        }))
    }

    pub(crate) fn merge_body(task: &mut TaskInstance, diff: &Diff) -> HubResult<()> {
        task.apply(diff)
            .map_err(|e| HubError::Protocol(format!("change does not fit task: {:#}", e)))
    }

    /// Caller holds the instance mutex.
    pub(crate) async fn prune_gone(&self, instance_id: &str, report: &BroadcastReport) -> HubResult<()> {
        if !report.gone.is_empty() {
            debug!(instance_id = %instance_id, gone = ?report.gone, "Pruning disconnected holders");
            self.active.prune_holders(instance_id, &report.gone).await?;
            self.detach(instance_id, &report.gone).await?;
        }
        Ok(())
    }

    /// Drops the routes of departed nodes from the stored instance, along with
    /// any edit lock they held. Caller holds the instance mutex.
    async fn detach(&self, instance_id: &str, gone: &[String]) -> HubResult<()> {
        let Some(mut task) = self.store.instance(instance_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        for node_id in gone {
            changed |= task.nodes.remove(node_id).is_some();
            if task.meta.locked.as_ref() == Some(node_id) {
                info!(instance_id = %instance_id, holder = %node_id, "Holder left, edit lock released");
                task.meta.locked = None;
                changed = true;
            }
        }
        if changed {
            self.store.put_instance(&task).await?;
        }
        Ok(())
    }

    /// Parks a stage and hands it to `coprocessor`.
    pub(crate) async fn park(
        &self,
        mut stage: PipelineStage,
        coprocessor: &NodeRegistration,
        position: usize,
    ) -> HubResult<Outcome> {
        stage.hand_to(&coprocessor.node_id, position);
        let envelope = stage.envelope(&self.config.hub_id);
        let outcome = Outcome::Parked {
            instance_id: stage.instance_id.clone(),
            ticket: stage.ticket.clone(),
            coprocessor: coprocessor.node_id.clone(),
        };
        debug!(
            instance_id = %stage.instance_id,
            command = %stage.command,
            coprocessor = %coprocessor.node_id,
            position,
            "Stage parked"
        );
        self.active.park(stage).await?;
        if !self.sync.hand_off(envelope, &coprocessor.node_id).await {
            warn!(coprocessor = %coprocessor.node_id, "Stage waits on an unreachable coprocessor");
        }
        Ok(outcome)
    }

    /// Hub-wide `error` budget over a rolling minute.
    pub(crate) async fn admit_error(&self) -> HubResult<()> {
        let now = self.now();
        let mut window = self.error_window.lock().await;
        while window
            .front()
            .is_some_and(|t| now - *t >= Duration::minutes(1))
        {
            window.pop_front();
        }
        if window.len() >= self.config.max_error_rate as usize {
            return Err(HubError::ErrorStorm(self.config.max_error_rate));
        }
        window.push_back(now);
        Ok(())
    }

    pub(crate) async fn run_follow_up(&self, follow: Option<FollowUp>) -> Option<String> {
        match follow? {
            FollowUp::Chain(request) => {
                let template_id = request.template_id.clone();
                match self.start(request).await {
                    Ok(outcome) => outcome.instance_id().map(str::to_string),
                    Err(e) => {
                        if let HubError::Storage(inner) = &e {
                            self.halt(inner);
                        }
                        warn!(template_id = %template_id, "Chained start failed: {}", e);
                        None
                    }
                }
            }
            FollowUp::RouteError {
                instance_id,
                error_task,
            } => self.route_error(&instance_id, error_task).await,
        }
    }
}

pub(crate) fn required_instance(inbound: &Inbound) -> HubResult<String> {
    inbound
        .instance_id
        .clone()
        .ok_or_else(|| HubError::Protocol(format!("missing instanceId for {}", inbound.command)))
}

/// `meta.hash` a sender reported alongside its change.
pub(crate) fn reported_hash(body: &Value) -> Option<u32> {
    body.get("meta")
        .and_then(|meta| meta.get("hash"))
        .and_then(Value::as_u64)
        .and_then(|hash| u32::try_from(hash).ok())
}
