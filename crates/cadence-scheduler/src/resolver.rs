//! Owner resolution for method-style jobs.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A live component instance, type-erased.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Maps an owner key to a live instance. Implemented by whatever container
/// manages the application's components.
pub trait InstanceResolver: Send + Sync {
    fn resolve(&self, owner_key: &str) -> Option<Instance>;
}

impl<F> InstanceResolver for F
where
    F: Fn(&str) -> Option<Instance> + Send + Sync,
{
    fn resolve(&self, owner_key: &str) -> Option<Instance> {
        self(owner_key)
    }
}

/// Singleton components keyed by name.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: HashMap<String, Instance>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component` under `name`, replacing any previous entry.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, component: Arc<T>) {
        self.components.insert(name.into(), component);
    }

    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, component: Arc<T>) -> Self {
        self.insert(name, component);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl InstanceResolver for ComponentRegistry {
    fn resolve(&self, owner_key: &str) -> Option<Instance> {
        self.components.get(owner_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_by_name() {
        let components = ComponentRegistry::new().with("Mailer", Arc::new(42_u32));
        let found = components.resolve("Mailer").unwrap();
        assert_eq!(found.downcast_ref::<u32>(), Some(&42));
        assert!(components.resolve("mailer").is_none());
        assert_eq!(components.len(), 1);
    }

    #[test]
    fn closures_are_resolvers() {
        let resolver = |key: &str| -> Option<Instance> {
            (key == "Clock").then(|| Arc::new("tick") as Instance)
        };
        assert!(resolver.resolve("Clock").is_some());
        assert!(resolver.resolve("Other").is_none());
    }
}
