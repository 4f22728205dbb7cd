#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::Value;
use taskhub::config::HubConfig;
use taskhub::error::HubResult;
use taskhub::protocol::{Command, CommandArgs, Envelope, Inbound};
use taskhub::runtime::clock::ManualClock;
use taskhub::runtime::outbound::ChannelOutbound;
use taskhub::runtime::storage::{InMemoryKvStore, KvStore};
use taskhub::runtime::{Hub, Outcome};
use taskhub::task::{NodeRole, TaskInstance, TaskTemplate};
use tokio::sync::mpsc::UnboundedReceiver;

/// A hub wired to in-process channels and a clock that only moves on request.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub outbound: Arc<ChannelOutbound>,
    pub clock: Arc<ManualClock>,
    inboxes: HashMap<String, UnboundedReceiver<Envelope>>,
}

impl TestHub {
    pub async fn new(templates: Vec<TaskTemplate>) -> Self {
        Self::with_config(HubConfig {
            templates,
            ..HubConfig::default()
        })
        .await
    }

    pub async fn with_config(config: HubConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryKvStore::new())).await
    }

    pub async fn with_store(config: HubConfig, kv: Arc<dyn KvStore>) -> Self {
        let outbound = Arc::new(ChannelOutbound::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let hub = Hub::builder(config)
            .store(kv)
            .outbound(outbound.clone())
            .clock(clock.clone())
            .build()
            .await
            .expect("Failed to build hub");
        Self {
            hub: Arc::new(hub),
            outbound,
            clock,
            inboxes: HashMap::new(),
        }
    }

    /// Opens a channel for `node_id` without registering it.
    pub fn listen(&mut self, node_id: &str) {
        let rx = self.outbound.connect(node_id);
        self.inboxes.insert(node_id.to_string(), rx);
    }

    pub async fn connect(&mut self, node_id: &str, args: CommandArgs) -> HubResult<Outcome> {
        self.listen(node_id);
        self.hub
            .handle(Inbound::new(node_id, Command::Register).args(args))
            .await
    }

    pub async fn processor(&mut self, node_id: &str, environment: &str) -> Outcome {
        self.connect(node_id, register_args(environment, NodeRole::Processor, 0))
            .await
            .expect("Failed to register processor")
    }

    pub async fn coprocessor(&mut self, node_id: &str, environment: &str, priority: i64) -> Outcome {
        self.connect(node_id, register_args(environment, NodeRole::Coprocessor, priority))
            .await
            .expect("Failed to register coprocessor")
    }

    /// Everything delivered to `node_id` since the last drain.
    pub fn drain(&mut self, node_id: &str) -> Vec<Envelope> {
        let mut received = Vec::new();
        if let Some(rx) = self.inboxes.get_mut(node_id) {
            while let Ok(envelope) = rx.try_recv() {
                received.push(envelope);
            }
        }
        received
    }

    pub fn drain_all(&mut self) {
        for rx in self.inboxes.values_mut() {
            while rx.try_recv().is_ok() {}
        }
    }

    pub async fn send(&self, inbound: Inbound) -> HubResult<Outcome> {
        self.hub.handle(inbound).await
    }

    pub async fn start(&self, node_id: &str, template_id: &str) -> HubResult<Outcome> {
        self.start_with(node_id, CommandArgs {
            template_id: Some(template_id.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn start_with(&self, node_id: &str, args: CommandArgs) -> HubResult<Outcome> {
        self.send(Inbound::new(node_id, Command::Start).args(args)).await
    }

    pub async fn join(&self, node_id: &str, instance_id: &str) -> HubResult<Outcome> {
        self.send(Inbound::new(node_id, Command::Join).instance(instance_id))
            .await
    }

    pub async fn update(&self, node_id: &str, instance_id: &str, body: Value) -> HubResult<Outcome> {
        self.update_with(node_id, instance_id, body, CommandArgs::default())
            .await
    }

    pub async fn update_with(
        &self,
        node_id: &str,
        instance_id: &str,
        body: Value,
        args: CommandArgs,
    ) -> HubResult<Outcome> {
        self.send(
            Inbound::new(node_id, Command::Update)
                .instance(instance_id)
                .args(args)
                .body(body),
        )
        .await
    }

    pub async fn task(&self, instance_id: &str) -> TaskInstance {
        self.hub
            .instance(instance_id)
            .await
            .expect("Failed to load instance")
            .expect("Instance not stored")
    }
}

pub fn register_args(environment: &str, role: NodeRole, priority: i64) -> CommandArgs {
    CommandArgs {
        environment: Some(environment.to_string()),
        role: Some(role),
        priority: Some(priority),
        ..Default::default()
    }
}

pub fn template(id: &str, environments: &[&str]) -> TaskTemplate {
    TaskTemplate::new(id, environments)
}

pub fn template_with_config(id: &str, environments: &[&str], config: Value) -> TaskTemplate {
    TaskTemplate {
        config,
        ..TaskTemplate::new(id, environments)
    }
}

/// Instance id of a start that committed.
pub fn started_id(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Started { instance_id, .. } => instance_id.clone(),
        other => panic!("Expected Started, got {:?}", other),
    }
}
