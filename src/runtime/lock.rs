use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::error::{HubError, HubResult};
use crate::protocol::{Command, CommandArgs};
use crate::task::TaskMeta;

/// Per-instance request mutex. Held from load to commit of one command.
#[derive(Default)]
pub struct InstanceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Forgets the mutex of an instance nobody is waiting on.
    pub fn prune(&self, instance_id: &str) {
        self.locks
            .remove_if(instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Decides the advisory edit lock holder after a command from `node_id`.
///
/// Returns the holder to store, or `Locked` when another node holds a fresh lock.
pub fn check_edit_lock(
    instance_id: &str,
    meta: &TaskMeta,
    node_id: &str,
    command: Command,
    args: &CommandArgs,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> HubResult<Option<String>> {
    let requested = args.lock.then(|| node_id.to_string());

    if command == Command::Error {
        if let Some(holder) = &meta.locked {
            info!(instance_id = %instance_id, holder = %holder, "Error clears edit lock");
        }
        return Ok(None);
    }

    let Some(holder) = meta.locked.as_deref() else {
        return Ok(requested);
    };

    if holder == node_id {
        // holder keeps it only by asking again
        return Ok(requested);
    }

    let last_touch = meta.last_updated_at.or(meta.updated_at);
    let stale = last_touch.is_none_or(|t| now - t >= stale_after);
    if stale {
        warn!(instance_id = %instance_id, holder = %holder, node_id = %node_id, "Clearing stale edit lock");
        return Ok(requested);
    }
    if args.unlock {
        info!(instance_id = %instance_id, holder = %holder, node_id = %node_id, "Edit lock released by another node");
        return Ok(requested);
    }
    if args.lock_bypass {
        return Ok(Some(holder.to_string()));
    }

    Err(HubError::Locked {
        instance_id: instance_id.to_string(),
        holder: holder.to_string(),
    })
}
