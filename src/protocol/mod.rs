//! Hub <-> node wire messages.
//!
//! The vocabulary is symmetric: nodes send commands to the hub and the hub
//! sends the same commands back out. Command names are parsed into a closed
//! enum here so nothing past this boundary ever sees an unknown command.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, HubResult};
use crate::task::NodeRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Register,
    Start,
    Init,
    Join,
    Update,
    Error,
    Partial,
    Pong,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Register,
        Command::Start,
        Command::Init,
        Command::Join,
        Command::Update,
        Command::Error,
        Command::Partial,
        Command::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Register => "register",
            Command::Start => "start",
            Command::Init => "init",
            Command::Join => "join",
            Command::Update => "update",
            Command::Error => "error",
            Command::Partial => "partial",
            Command::Pong => "pong",
        }
    }

    /// Commands that must name an existing instance.
    pub fn requires_instance(&self) -> bool {
        matches!(
            self,
            Command::Join | Command::Update | Command::Error | Command::Partial
        )
    }

    /// What a node accepts when it registers without listing commands.
    pub fn default_accepted() -> Vec<Command> {
        Command::ALL
            .iter()
            .copied()
            .filter(|c| *c != Command::Start)
            .collect()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| HubError::UnknownCommand(s.to_string()))
    }
}

/// Command specific arguments. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandArgs {
    // update completion
    #[serde(skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_task_id: Option<String>,

    // error routing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_task: Option<String>,

    // update variants
    #[serde(skip_serializing_if = "is_false")]
    pub lock: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unlock: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub lock_bypass: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_task: Option<Value>,

    // start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,

    // pipeline
    #[serde(skip_serializing_if = "is_false")]
    pub coprocessing_done: bool,

    // register
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands_accepted: Option<Vec<Command>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states_supported: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states_not_supported: Option<Vec<String>>,

    // hub -> node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Position of a parked command inside the coprocessor pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTicket {
    pub ticket: String,
    pub position: usize,
}

/// A command as received from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub node_id: String,
    pub command: Command,
    pub instance_id: Option<String>,
    pub command_args: CommandArgs,
    /// Full task body or a diff. `null` leaves mark deletions.
    pub task: Value,
    pub pipeline: Option<PipelineTicket>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    node_id: Option<String>,
    command: Option<String>,
    instance_id: Option<String>,
    #[serde(default)]
    command_args: Option<Value>,
    #[serde(default)]
    task: Option<Value>,
    #[serde(default)]
    pipeline: Option<PipelineTicket>,
}

impl Inbound {
    pub fn new(node_id: impl Into<String>, command: Command) -> Self {
        Self {
            node_id: node_id.into(),
            command,
            instance_id: None,
            command_args: CommandArgs::default(),
            task: Value::Object(Default::default()),
            pipeline: None,
        }
    }

    pub fn instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn args(mut self, args: CommandArgs) -> Self {
        self.command_args = args;
        self
    }

    pub fn body(mut self, task: Value) -> Self {
        self.task = task;
        self
    }

    pub fn ticket(mut self, ticket: PipelineTicket) -> Self {
        self.pipeline = Some(ticket);
        self
    }

    pub fn parse(raw: &str) -> HubResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> HubResult<Self> {
        let raw: RawInbound = serde_json::from_value(value)?;

        let node_id = raw
            .node_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HubError::Protocol("missing nodeId".into()))?;
        let command: Command = raw
            .command
            .ok_or_else(|| HubError::Protocol("missing command".into()))?
            .parse()?;

        let command_args = match raw.command_args {
            None | Some(Value::Null) => CommandArgs::default(),
            Some(v) => serde_json::from_value(v)
                .map_err(|e| HubError::Protocol(format!("bad commandArgs: {}", e)))?,
        };

        let task = match raw.task {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(v @ Value::Object(_)) => v,
            Some(_) => return Err(HubError::Protocol("task must be an object".into())),
        };

        let inbound = Self {
            node_id,
            command,
            instance_id: raw.instance_id,
            command_args,
            task,
            pipeline: raw.pipeline,
        };
        inbound.validate()?;
        Ok(inbound)
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.command.requires_instance() && self.instance_id.is_none() {
            return Err(HubError::Protocol(format!(
                "missing instanceId for {}",
                self.command
            )));
        }
        if self.command == Command::Start && self.command_args.template_id.is_none() {
            return Err(HubError::Protocol("start without templateId".into()));
        }
        if self.command_args.sync && self.command_args.done {
            return Err(HubError::Protocol("sync update cannot be done".into()));
        }
        Ok(())
    }
}

/// A message sent from the hub to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub command: Command,
    pub hub_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Node that originated the change being delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(default)]
    pub command_args: CommandArgs,
    pub task: Value,
    /// `true` when `task` is a complete view rather than a diff.
    #[serde(default)]
    pub full: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineTicket>,
}

impl Envelope {
    pub fn new(command: Command, hub_id: impl Into<String>, task: Value) -> Self {
        Self {
            command,
            hub_id: hub_id.into(),
            instance_id: None,
            source_node_id: None,
            command_args: CommandArgs::default(),
            task,
            full: false,
            pipeline: None,
        }
    }
}
