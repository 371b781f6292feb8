//! Uniform service lifecycle and the registry the supervisor dispatches
//! through.
//!
//! Every sub-service (qan, mm, sysconfig, log, mrm) implements
//! [`ServiceManager`] and registers under a string name. Commands and
//! status queries are routed by that name; shutdown walks the registry in
//! insertion order.

use crate::error::Error;
use crate::proto::{AgentConfigResource, Cmd, Reply};
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Capability set of one managed service.
pub trait ServiceManager: Send + Sync {
    /// Starts the service from its persisted config. A service with no
    /// config on disk is simply not enabled; that is not an error.
    fn start(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Stops the service. Stopping a stopped service is a no-op.
    fn stop(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Status snapshot, merged into the agent-wide status surface.
    fn status(&self) -> HashMap<String, String>;

    /// Handles a service-targeted command and produces its reply.
    fn handle(&self, cmd: Cmd) -> BoxFuture<'_, Reply>;

    /// The service's current config(s), or the errors hit collecting them.
    fn get_config(&self) -> (Vec<AgentConfigResource>, Vec<Error>);
}

/// Name → manager map preserving registration order, which is also the
/// shutdown order (the supervisor skips `"log"` so teardown errors still
/// ship).
pub struct Registry {
    services: Vec<(String, Arc<dyn ServiceManager>)>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            services: Vec::new(),
        }
    }

    /// Registers a manager. Last registration wins for duplicate names.
    pub fn add(&mut self, name: &str, manager: Arc<dyn ServiceManager>) {
        self.services.retain(|(n, _)| n != name);
        self.services.push((name.to_string(), manager));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ServiceManager>> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ServiceManager>)> {
        self.services.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct FakeService(&'static str);

    impl ServiceManager for FakeService {
        fn start(&self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
        fn stop(&self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
        fn status(&self) -> HashMap<String, String> {
            let mut m = HashMap::new();
            m.insert(self.0.to_string(), "Idle".to_string());
            m
        }
        fn handle(&self, cmd: Cmd) -> BoxFuture<'_, Reply> {
            Box::pin(async move { cmd.ok() })
        }
        fn get_config(&self) -> (Vec<AgentConfigResource>, Vec<Error>) {
            (Vec::new(), Vec::new())
        }
    }

    #[test]
    fn test_registry_preserves_insertion_order() {
        let mut registry = Registry::new();
        registry.add("log", Arc::new(FakeService("log")));
        registry.add("qan", Arc::new(FakeService("qan")));
        registry.add("mm", Arc::new(FakeService("mm")));
        let names: Vec<_> = registry.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["log", "qan", "mm"]);
    }

    #[test]
    fn test_registry_get_by_name() {
        let mut registry = Registry::new();
        registry.add("qan", Arc::new(FakeService("qan")));
        assert!(registry.get("qan").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces() {
        let mut registry = Registry::new();
        registry.add("qan", Arc::new(FakeService("first")));
        registry.add("qan", Arc::new(FakeService("second")));
        assert_eq!(registry.len(), 1);
        let status = registry.get("qan").unwrap().status();
        assert!(status.contains_key("second"));
        let _ = Cmd::new(1, "qan", "GetConfig", Value::Null);
    }
}
