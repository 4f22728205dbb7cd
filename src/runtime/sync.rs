//! Fan-out of committed changes.
//!
//! Every holder gets its own view of the task. For updates the hub diffs that
//! view against the last one it sent the node and delivers only the
//! difference.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::protocol::{Command, CommandArgs, Envelope};
use crate::runtime::outbound::Outbound;
use crate::runtime::registry::{NodeRegistration, NodeRegistry};
use crate::runtime::storage::HubStore;
use crate::task::patch::{self, Diff};
use crate::task::{NodeRoute, TaskInstance};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    pub sent: Vec<String>,
    /// Holders that are no longer registered.
    pub gone: Vec<String>,
}

/// Route with the node's registration defaults filled in.
fn effective_route(route: &NodeRoute, registration: &NodeRegistration) -> NodeRoute {
    let mut route = route.clone();
    if !route.has_state_filter() {
        route.states_supported = registration.states_supported.clone();
        route.states_not_supported = registration.states_not_supported.clone();
    }
    route
}

/// What one node sees of a task.
pub fn node_view(
    task: &TaskInstance,
    route: &NodeRoute,
    registration: Option<&NodeRegistration>,
) -> Result<Value> {
    let mut view = task.to_value()?;
    if let Value::Object(map) = &mut view {
        map.remove("nodes");
        map.remove("users");
        map.remove("meta");
        if let Some(holder) = &task.meta.locked {
            map.insert("meta".to_string(), json!({ "locked": holder }));
        }
        map.insert("node".to_string(), serde_json::to_value(route)?);

        let user_id = registration
            .and_then(|r| r.user_id.as_ref())
            .or(task.user_id.as_ref());
        if let Some(user) = user_id.and_then(|id| task.users.get(id)) {
            map.insert("user".to_string(), user.clone());
        }
    }
    Ok(view)
}

pub struct Synchronizer {
    hub_id: String,
    registry: Arc<NodeRegistry>,
    store: Arc<HubStore>,
    outbound: Arc<dyn Outbound>,
    broadcasts: AtomicU64,
}

impl Synchronizer {
    pub fn new(
        hub_id: impl Into<String>,
        registry: Arc<NodeRegistry>,
        store: Arc<HubStore>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            hub_id: hub_id.into(),
            registry,
            store,
            outbound,
            broadcasts: AtomicU64::new(0),
        }
    }

    /// Hub-wide monotonic broadcast stamp.
    pub fn next_broadcast_count(&self) -> u64 {
        self.broadcasts.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn deliver(&self, node_id: &str, envelope: Envelope) -> bool {
        let command = envelope.command;
        match self.outbound.send(node_id, envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(node_id = %node_id, command = %command, "Delivery failed: {}", e);
                false
            }
        }
    }

    fn envelope(
        &self,
        command: Command,
        task: &TaskInstance,
        body: Value,
        full: bool,
        source: Option<&str>,
        args: &CommandArgs,
    ) -> Envelope {
        let mut envelope = Envelope::new(command, &self.hub_id, body);
        envelope.instance_id = Some(task.instance_id.clone());
        envelope.source_node_id = source.map(str::to_string);
        envelope.command_args = CommandArgs {
            sync_task: None,
            ..args.clone()
        };
        envelope.full = full;
        envelope
    }

    /// Sends `command` for a committed task to every eligible holder.
    ///
    /// `init` and `join` carry full views; `update` and `error` carry the
    /// difference from the node's last view, or nothing when it is empty.
    pub async fn broadcast(
        &self,
        task: &TaskInstance,
        command: Command,
        source: Option<&str>,
        args: &CommandArgs,
    ) -> Result<BroadcastReport> {
        let mut report = BroadcastReport::default();
        let state = task.current_state();

        for (node_id, route) in &task.nodes {
            if *node_id == self.hub_id {
                continue;
            }
            let Some(registration) = self.registry.get(node_id) else {
                report.gone.push(node_id.clone());
                continue;
            };
            if !registration.accepts(command) {
                continue;
            }

            let route = effective_route(route, &registration);
            if route.has_state_filter() && !route.accepts_state(state) {
                debug!(instance_id = %task.instance_id, node_id = %node_id, "Filtered by state");
                self.store.delete_view(&task.instance_id, node_id).await?;
                continue;
            }

            let view = node_view(task, &route, Some(&registration))?;
            let diff_based = matches!(command, Command::Update | Command::Error);
            let last = if diff_based && !route.has_state_filter() {
                self.store.view(&task.instance_id, node_id).await?
            } else {
                None
            };

            let envelope = match last {
                Some(last) => {
                    let change = patch::diff(&last, &view);
                    let announce_done = args.done && source != Some(node_id.as_str());
                    if change.is_empty() && !announce_done {
                        continue;
                    }
                    self.envelope(command, task, change.to_wire(), false, source, args)
                }
                None => self.envelope(command, task, view.clone(), true, source, args),
            };

            if self.deliver(node_id, envelope).await {
                self.store.set_view(&task.instance_id, node_id, view).await?;
                report.sent.push(node_id.clone());
            }
        }

        debug!(
            instance_id = %task.instance_id,
            command = %command,
            sent = report.sent.len(),
            broadcast_count = task.meta.broadcast_count,
            "Broadcast"
        );
        Ok(report)
    }

    /// Full view to one node, used for `join`.
    pub async fn send_full(
        &self,
        task: &TaskInstance,
        node_id: &str,
        command: Command,
    ) -> Result<bool> {
        let registration = self.registry.get(node_id);
        let route = match (task.nodes.get(node_id), &registration) {
            (Some(route), Some(reg)) => effective_route(route, reg),
            (Some(route), None) => route.clone(),
            (None, Some(reg)) => reg.route(),
            (None, None) => return Ok(false),
        };
        let view = node_view(task, &route, registration.as_ref())?;
        let envelope = self.envelope(
            command,
            task,
            view.clone(),
            true,
            Some(node_id),
            &CommandArgs::default(),
        );
        let delivered = self.deliver(node_id, envelope).await;
        if delivered {
            self.store.set_view(&task.instance_id, node_id, view).await?;
        }
        Ok(delivered)
    }

    /// Advances the sender's stored view by its own change so it is not echoed.
    pub async fn record_sender_view(&self, instance_id: &str, node_id: &str, change: &Diff) -> Result<()> {
        if let Some(mut view) = self.store.view(instance_id, node_id).await? {
            patch::merge_in_place(&mut view, change);
            self.store.set_view(instance_id, node_id, view).await?;
        }
        Ok(())
    }

    /// Relays a `partial` to every other holder that accepts it.
    pub async fn forward_partial(
        &self,
        task: &TaskInstance,
        sender: &str,
        body: &Value,
        args: &CommandArgs,
    ) -> usize {
        let mut forwarded = 0;
        for node_id in task.nodes.keys() {
            if node_id == sender || *node_id == self.hub_id {
                continue;
            }
            let accepts = self
                .registry
                .get(node_id)
                .is_some_and(|r| r.accepts(Command::Partial));
            if !accepts {
                continue;
            }
            let envelope = self.envelope(Command::Partial, task, body.clone(), false, Some(sender), args);
            if self.deliver(node_id, envelope).await {
                forwarded += 1;
            }
        }
        forwarded
    }

    /// Asks an unknown node to register.
    pub async fn request_registration(&self, node_id: &str) -> bool {
        let mut envelope = Envelope::new(Command::Register, &self.hub_id, json!({}));
        envelope.command_args.hub_id = Some(self.hub_id.clone());
        self.deliver(node_id, envelope).await
    }

    /// Sends a parked stage to the coprocessor it now awaits.
    pub async fn hand_off(&self, envelope: Envelope, coprocessor: &str) -> bool {
        self.deliver(coprocessor, envelope).await
    }
}
