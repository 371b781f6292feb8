//! Status registry: a lock-protected `name → string` map every component
//! publishes into for out-of-band introspection.
//!
//! Components pre-declare their status names at construction so the status
//! surface is stable; readers always get snapshot copies.

use crate::proto::Cmd;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

struct Inner {
    values: HashMap<String, String>,
    updated: DateTime<Utc>,
}

/// Thread-safe status map with snapshot reads.
pub struct Status {
    inner: RwLock<Inner>,
}

impl Status {
    /// Creates a registry with the given names pre-declared (empty values).
    pub fn new(names: &[&str]) -> Self {
        let mut values = HashMap::with_capacity(names.len());
        for name in names {
            values.insert((*name).to_string(), String::new());
        }
        Status {
            inner: RwLock::new(Inner {
                values,
                updated: Utc::now(),
            }),
        }
    }

    /// Publishes `value` under `name`.
    pub fn update(&self, name: &str, value: &str) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.values.insert(name.to_string(), value.to_string());
        inner.updated = Utc::now();
    }

    /// Publishes `value` annotated with the command being handled, so a
    /// status read shows *which* command a busy component is working on.
    pub fn update_cmd(&self, name: &str, value: &str, cmd: &Cmd) {
        self.update(name, &format!("{} {}", value, cmd));
    }

    /// Returns the current value for `name`, or an empty string if the name
    /// was never declared.
    pub fn get(&self, name: &str) -> String {
        let inner = self.inner.read().expect("status lock poisoned");
        inner.values.get(name).cloned().unwrap_or_default()
    }

    /// Returns a snapshot copy of the whole map.
    pub fn all(&self) -> HashMap<String, String> {
        let inner = self.inner.read().expect("status lock poisoned");
        inner.values.clone()
    }

    /// Snapshot union: starts from this registry's snapshot and overlays
    /// `other`, whose keys win on conflict.
    pub fn merge(&self, other: HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.all();
        for (k, v) in other {
            merged.insert(k, v);
        }
        merged
    }

    /// Timestamp of the most recent update.
    pub fn updated(&self) -> DateTime<Utc> {
        self.inner.read().expect("status lock poisoned").updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_predeclared_names_are_present() {
        let status = Status::new(&["agent", "agent-cmd-handler"]);
        let all = status.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["agent"], "");
        assert_eq!(all["agent-cmd-handler"], "");
    }

    #[test]
    fn test_update_and_get() {
        let status = Status::new(&["qan"]);
        status.update("qan", "Running");
        assert_eq!(status.get("qan"), "Running");
        assert_eq!(status.get("never-declared"), "");
    }

    #[test]
    fn test_update_cmd_annotates_value() {
        let status = Status::new(&["agent"]);
        let cmd = Cmd::new(9, "agent", "Restart", Value::Null);
        status.update_cmd("agent", "Restarting", &cmd);
        let v = status.get("agent");
        assert!(v.starts_with("Restarting"));
        assert!(v.contains("Restart"));
        assert!(v.contains('9'));
    }

    #[test]
    fn test_all_returns_snapshot_copy() {
        let status = Status::new(&["a"]);
        let snap = status.all();
        status.update("a", "changed");
        // The earlier snapshot must not observe the later write.
        assert_eq!(snap["a"], "");
        assert_eq!(status.get("a"), "changed");
    }

    #[test]
    fn test_merge_other_keys_win() {
        let status = Status::new(&["a", "b"]);
        status.update("a", "mine");
        status.update("b", "mine");
        let mut other = HashMap::new();
        other.insert("b".to_string(), "theirs".to_string());
        other.insert("c".to_string(), "theirs".to_string());
        let merged = status.merge(other);
        assert_eq!(merged["a"], "mine");
        assert_eq!(merged["b"], "theirs");
        assert_eq!(merged["c"], "theirs");
    }
}
