use chrono::{DateTime, Duration, Utc};

use crate::error::{HubError, HubResult};
use crate::task::{TaskMeta, TaskPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Lifetime request cap passed. The command still commits, as a task error.
    CountExceeded(u64),
}

impl Admission {
    pub fn error_message(&self) -> Option<String> {
        match self {
            Admission::Admitted => None,
            Admission::CountExceeded(limit) => {
                Some(format!("Task request count of {} exceeded.", limit))
            }
        }
    }
}

/// Counts one request against the instance's rate window and lifetime cap.
///
/// Works on a copy of the meta: a rejected command must leave the record untouched.
pub fn admit(
    instance_id: &str,
    meta: &mut TaskMeta,
    policy: &TaskPolicy,
    now: DateTime<Utc>,
) -> HubResult<Admission> {
    let window_open = meta
        .request_window_start
        .is_some_and(|start| now - start < Duration::minutes(1));
    if !window_open {
        meta.request_window_start = Some(now);
        meta.requests_this_minute = 0;
    }
    meta.requests_this_minute += 1;
    meta.request_count += 1;

    if let Some(limit) = policy.max_request_rate {
        if meta.requests_this_minute > limit {
            return Err(HubError::RateLimited {
                instance_id: instance_id.to_string(),
                limit,
            });
        }
    }
    if let Some(limit) = policy.max_request_count {
        if meta.request_count > limit {
            return Ok(Admission::CountExceeded(limit));
        }
    }
    Ok(Admission::Admitted)
}
