use super::handler::TaskHandler;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Name to handler table, built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!("Task {} registered twice, keeping the last handler", name);
        }
        self
    }

    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Handlers sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TaskHandler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::FnTask;
    use serde_json::json;

    #[test]
    fn test_lookup_and_order() {
        let registry = TaskRegistry::new()
            .with(Arc::new(FnTask::new("send_email", "", |_, _| Ok(json!(null)))))
            .with(Arc::new(FnTask::new("index_page", "", |_, _| Ok(json!(null)))));

        assert!(registry.contains("send_email"));
        assert!(!registry.contains("missing"));
        assert!(registry.get("missing").is_none());
        let names: Vec<_> = registry.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["index_page", "send_email"]);
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(FnTask::new("a", "first", |_, _| Ok(json!(1)))));
        registry.register(Arc::new(FnTask::new("a", "second", |_, _| Ok(json!(2)))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().description(), "second");
    }
}
