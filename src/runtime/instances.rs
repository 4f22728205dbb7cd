//! Identity rules for new and restarted instances.

use uuid::Uuid;

use crate::task::{TaskInstance, TaskPolicy, TaskTemplate};

fn deterministic_id(template_id: &str, scope: &str) -> String {
    format!("{}-{}", template_id, scope).replace('.', "-")
}

/// Instance id shared by every start of a singleton template, if it is one.
///
/// `collaborateGroupId` wins over `oneFamily`; a one-family template started
/// without a user is not a singleton.
pub fn singleton_id(template_id: &str, policy: &TaskPolicy, user_id: Option<&str>) -> Option<String> {
    if let Some(group) = policy.collaborate_group_id.as_deref() {
        return Some(deterministic_id(template_id, group));
    }
    if policy.one_family {
        return user_id.map(|user| deterministic_id(template_id, user));
    }
    None
}

pub fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

/// Family and thread an instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub family_id: String,
    pub thread_id: String,
}

pub fn lineage(
    instance_id: &str,
    singleton: bool,
    family_arg: Option<&str>,
    thread_arg: Option<&str>,
    previous: Option<&TaskInstance>,
) -> Lineage {
    let family_id = previous
        .map(|p| p.family_id.clone())
        .or_else(|| singleton.then(|| instance_id.to_string()))
        .or_else(|| family_arg.map(str::to_string))
        .unwrap_or_else(|| instance_id.to_string());
    let thread_id = thread_arg
        .map(str::to_string)
        .or_else(|| previous.and_then(|p| p.thread_id.clone()))
        .unwrap_or_else(|| instance_id.to_string());
    Lineage {
        family_id,
        thread_id,
    }
}

/// Brings a stored instance that is no longer live back to its starting state.
pub fn reset_for_restart(task: &mut TaskInstance, template: &TaskTemplate) {
    task.state.current = Some(template.initial_state());
    task.error = None;
    task.meta.update_count = 0;
    task.meta.locked = None;
    task.meta.modified = None;
    task.meta.requests_this_minute = 0;
    task.meta.request_window_start = None;
}

/// Closest error handler template for `template_id`.
///
/// Walks the dotted path upward, replacing the tail with `error` one segment at
/// a time: `root.a.b.start` tries `root.a.b.error`, `root.a.error`,
/// `root.error`, then `error`.
pub fn error_handler_candidates(template_id: &str) -> Vec<String> {
    let segments: Vec<&str> = template_id.split('.').collect();
    (0..segments.len())
        .rev()
        .map(|keep| {
            if keep == 0 {
                "error".to_string()
            } else {
                format!("{}.error", segments[..keep].join("."))
            }
        })
        .filter(|candidate| candidate != template_id)
        .collect()
}
