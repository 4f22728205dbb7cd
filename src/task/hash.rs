use serde_json::{Map, Value};

/// Keys that differ legitimately between the hub and each node.
const UNHASHED: [&str; 6] = ["nodes", "node", "users", "user", "meta", "connections"];

/// Content hash of the shared part of a task.
///
/// serde_json keeps object keys sorted, so the serialized form is canonical.
pub fn task_hash(task: &Value) -> u32 {
    let cleaned = clean_for_hash(task);
    djb2(&cleaned.to_string())
}

pub fn clean_for_hash(task: &Value) -> Value {
    let mut map = match task {
        Value::Object(map) => map.clone(),
        _ => return Value::Object(Map::new()),
    };
    for key in UNHASHED {
        map.remove(key);
    }
    // state.last is per node
    if let Some(Value::Object(state)) = map.get_mut("state") {
        state.remove("last");
    }
    strip_empty(Value::Object(map)).unwrap_or_else(|| Value::Object(Map::new()))
}

/// Drops nulls and empty objects, which storage backends disagree about.
fn strip_empty(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| strip_empty(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

/// Folds UTF-16 code units so hashes agree with nodes that hash JS strings.
fn djb2(s: &str) -> u32 {
    s.encode_utf16()
        .fold(5381u32, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    /// The sender did not report a hash.
    Unchecked,
    Match,
    Mismatch { expected: u32, actual: u32 },
}

pub fn verify(expected: Option<u32>, merged: &Value) -> HashCheck {
    match expected {
        None => HashCheck::Unchecked,
        Some(expected) => {
            let actual = task_hash(merged);
            if actual == expected {
                HashCheck::Match
            } else {
                HashCheck::Mismatch { expected, actual }
            }
        }
    }
}
