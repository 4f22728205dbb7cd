//! Ordered coprocessor pipeline.
//!
//! A parked command is a [`PipelineStage`] stored inside the instance's active
//! record. Each coprocessor reply names the stage by ticket; the hub merges the
//! reply, records the hop and either sends the stage on or commits it. Nothing
//! waits on a stack frame between hops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{Command, CommandArgs, Envelope, PipelineTicket};
use crate::runtime::registry::NodeRegistration;
use crate::task::patch::{self, Diff};

/// Whether a command from `sender` has to pass through the coprocessors.
pub fn enters_pipeline(
    command: Command,
    sender: Option<&NodeRegistration>,
    args: &CommandArgs,
    exempt: &[Command],
) -> bool {
    if exempt.contains(&command) || args.coprocessing_done {
        return false;
    }
    if !matches!(command, Command::Init | Command::Update | Command::Error) {
        return false;
    }
    // coprocessors speaking outside a hop commit directly
    !sender.is_some_and(|s| s.is_coprocessor())
}

/// First coprocessor in `chain` that accepts `command` and has not seen the stage.
pub fn next_coprocessor<'a>(
    chain: &'a [NodeRegistration],
    command: Command,
    visited: &[String],
) -> Option<(usize, &'a NodeRegistration)> {
    chain
        .iter()
        .enumerate()
        .find(|(_, c)| c.accepts(command) && !visited.contains(&c.node_id))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub ticket: String,
    pub command: Command,
    pub instance_id: String,
    pub initiating_node_id: Option<String>,
    #[serde(default)]
    pub command_args: CommandArgs,
    /// Candidate task as coprocessors see it.
    pub task: Value,
    /// Pending change, re-merged onto the live record at commit.
    #[serde(default)]
    pub diff: Diff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<u32>,
    /// A coprocessor changed the content on the way through.
    #[serde(default)]
    pub rewritten: bool,
    #[serde(default)]
    pub visited: Vec<String>,
    pub awaiting: String,
    pub position: usize,
    pub created_at: DateTime<Utc>,
}

impl PipelineStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command: Command,
        instance_id: impl Into<String>,
        initiating_node_id: Option<String>,
        command_args: CommandArgs,
        task: Value,
        diff: &Diff,
        expected_hash: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket: Uuid::new_v4().to_string(),
            command,
            instance_id: instance_id.into(),
            initiating_node_id,
            command_args,
            task,
            diff: diff.clone(),
            expected_hash,
            rewritten: false,
            visited: Vec::new(),
            awaiting: String::new(),
            position: 0,
            created_at: now,
        }
    }

    /// Folds a coprocessor's rewrite into both the candidate and the pending change.
    pub fn absorb(&mut self, reply: &Diff) {
        if reply.is_empty() {
            return;
        }
        // rewritten content no longer matches what the initiator hashed
        self.expected_hash = None;
        self.rewritten = true;
        patch::merge_in_place(&mut self.task, reply);
        self.diff = std::mem::take(&mut self.diff).then(reply);
    }

    pub fn hand_to(&mut self, coprocessor: &str, position: usize) {
        self.awaiting = coprocessor.to_string();
        self.position = position;
    }

    pub fn ticket(&self) -> PipelineTicket {
        PipelineTicket {
            ticket: self.ticket.clone(),
            position: self.position,
        }
    }

    /// Message carrying this stage to the coprocessor it awaits.
    pub fn envelope(&self, hub_id: &str) -> Envelope {
        let mut envelope = Envelope::new(self.command, hub_id, self.task.clone());
        envelope.instance_id = Some(self.instance_id.clone());
        envelope.source_node_id = self.initiating_node_id.clone();
        envelope.command_args = self.command_args.clone();
        envelope.full = true;
        envelope.pipeline = Some(self.ticket());
        envelope
    }
}
