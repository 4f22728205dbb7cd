use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{HubError, HubResult};
use crate::protocol::{Command, CommandArgs};
use crate::task::{NodeRole, NodeRoute};

/// A connected node. Lives only as long as the connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    pub node_id: String,
    pub environment: String,
    pub commands_accepted: Vec<Command>,
    pub role: NodeRole,
    pub priority: i64,
    pub user_id: Option<String>,
    pub states_supported: Option<Vec<String>>,
    pub states_not_supported: Option<Vec<String>>,
    /// Registration order, kept across re-registrations.
    pub seq: u64,
    pub last_seen: DateTime<Utc>,
}

impl NodeRegistration {
    pub fn accepts(&self, command: Command) -> bool {
        self.commands_accepted.contains(&command)
    }

    pub fn is_coprocessor(&self) -> bool {
        self.role == NodeRole::Coprocessor
    }

    /// Routing entry recorded on an instance when this node is allocated to it.
    pub fn route(&self) -> NodeRoute {
        NodeRoute {
            node_id: self.node_id.clone(),
            environment: self.environment.clone(),
            role: self.role,
            command: None,
            coprocessing: self.is_coprocessor(),
            coprocessing_done: false,
            states_supported: self.states_supported.clone(),
            states_not_supported: self.states_not_supported.clone(),
        }
    }
}

pub struct NodeRegistry {
    nodes: DashMap<String, NodeRegistration>,
    seq: AtomicU64,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Idempotent upsert. Returns the stored registration and whether it is new.
    pub fn register(
        &self,
        node_id: &str,
        args: &CommandArgs,
        now: DateTime<Utc>,
    ) -> HubResult<(NodeRegistration, bool)> {
        let environment = args
            .environment
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| HubError::Protocol(format!("register from {} without environment", node_id)))?;

        let previous = self.nodes.get(node_id).map(|r| r.seq);
        let seq = previous.unwrap_or_else(|| self.seq.fetch_add(1, Ordering::SeqCst));

        let registration = NodeRegistration {
            node_id: node_id.to_string(),
            environment,
            commands_accepted: args
                .commands_accepted
                .clone()
                .unwrap_or_else(Command::default_accepted),
            role: args.role.unwrap_or_default(),
            priority: args.priority.unwrap_or(0),
            user_id: args.user_id.clone(),
            states_supported: args.states_supported.clone(),
            states_not_supported: args.states_not_supported.clone(),
            seq,
            last_seen: now,
        };
        self.nodes.insert(node_id.to_string(), registration.clone());
        Ok((registration, previous.is_none()))
    }

    pub fn unregister(&self, node_id: &str) -> Option<NodeRegistration> {
        self.nodes.remove(node_id).map(|(_, r)| r)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRegistration> {
        self.nodes.get(node_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Environments with at least one connected node.
    pub fn environments(&self) -> BTreeSet<String> {
        self.nodes.iter().map(|r| r.environment.clone()).collect()
    }

    fn matching(&self, environment: &str, role: NodeRole) -> Vec<NodeRegistration> {
        let mut found: Vec<NodeRegistration> = self
            .nodes
            .iter()
            .filter(|r| r.environment == environment && r.role == role)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|r| r.seq);
        found
    }

    /// Processors of an environment, earliest registered first.
    pub fn processors(&self, environment: &str) -> Vec<NodeRegistration> {
        self.matching(environment, NodeRole::Processor)
    }

    pub fn coprocessors(&self, environment: &str) -> Vec<NodeRegistration> {
        self.matching(environment, NodeRole::Coprocessor)
    }

    /// Every coprocessor in pipeline order: priority descending, then registration order.
    pub fn pipeline(&self) -> Vec<NodeRegistration> {
        let mut chain: Vec<NodeRegistration> = self
            .nodes
            .iter()
            .filter(|r| r.is_coprocessor())
            .map(|r| r.value().clone())
            .collect();
        chain.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        chain
    }

    /// Refreshes `last_seen`. Returns false for unknown nodes.
    pub fn touch(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut r) => {
                r.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Nodes not seen since `cutoff`.
    pub fn stale(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|r| r.last_seen < cutoff)
            .map(|r| r.node_id.clone())
            .collect()
    }
}
