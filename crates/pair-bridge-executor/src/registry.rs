//! Backend registry: backend tag to adapter factory.

use std::{collections::HashMap, sync::Arc};

use pair_bridge_core::{AdapterError, AgentAdapter, Backend, BridgeConfig};

use crate::{claude::ClaudeOpusAdapter, codex::CodexAdapter};

/// Builds an adapter for a backend.
pub type AdapterFactory = Arc<dyn Fn(&BridgeConfig) -> Box<dyn AgentAdapter> + Send + Sync>;

/// Maps each backend to the factory that builds its adapter.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: HashMap<Backend, AdapterFactory>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Registry with the built-in adapters.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Backend::ClaudeOpus, |config| Box::new(ClaudeOpusAdapter::new(config)));
        registry.register(Backend::Codex, |config| Box::new(CodexAdapter::new(config)));
        registry
    }

    /// Registry with nothing registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register or replace the factory for `backend`.
    pub fn register<F>(&mut self, backend: Backend, factory: F)
    where
        F: Fn(&BridgeConfig) -> Box<dyn AgentAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(backend, Arc::new(factory));
    }

    /// Build the adapter for `backend`.
    ///
    /// # Errors
    /// Returns error if no factory is registered for it.
    pub fn create(&self, backend: Backend, config: &BridgeConfig) -> Result<Box<dyn AgentAdapter>, AdapterError> {
        self.factories
            .get(&backend)
            .map(|factory| factory(config))
            .ok_or(AdapterError::NotRegistered(backend))
    }

    /// Build the adapter for a backend tag such as `codex`.
    ///
    /// # Errors
    /// Returns error if the tag is unknown or nothing is registered for it.
    pub fn create_by_tag(&self, tag: &str, config: &BridgeConfig) -> Result<Box<dyn AgentAdapter>, AdapterError> {
        self.create(tag.parse()?, config)
    }

    /// Registered backends with their display names, in declaration order.
    #[must_use]
    pub fn backends(&self) -> Vec<(Backend, &'static str)> {
        Backend::ALL
            .into_iter()
            .filter(|b| self.factories.contains_key(b))
            .map(|b| (b, b.display_name()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_backends() {
        let registry = AdapterRegistry::new();
        let config = BridgeConfig::default();

        let adapter = registry.create(Backend::ClaudeOpus, &config).unwrap();
        assert_eq!(adapter.backend(), Backend::ClaudeOpus);
        assert_eq!(adapter.name(), "Claude Opus");

        let adapter = registry.create_by_tag("codex", &config).unwrap();
        assert_eq!(adapter.backend(), Backend::Codex);

        assert_eq!(
            registry.backends(),
            vec![(Backend::ClaudeOpus, "Claude Opus"), (Backend::Codex, "Codex")]
        );
    }

    #[test]
    fn test_unknown_and_unregistered() {
        let config = BridgeConfig::default();
        assert!(matches!(
            AdapterRegistry::new().create_by_tag("gemini", &config),
            Err(AdapterError::UnknownBackend(_))
        ));
        assert!(matches!(
            AdapterRegistry::empty().create(Backend::Codex, &config),
            Err(AdapterError::NotRegistered(Backend::Codex))
        ));
    }

    #[test]
    fn test_register_overrides_builtin() {
        let mut registry = AdapterRegistry::new();
        registry.register(Backend::Codex, |config| Box::new(ClaudeOpusAdapter::new(config)));
        let adapter = registry.create(Backend::Codex, &BridgeConfig::default()).unwrap();
        assert_eq!(adapter.backend(), Backend::ClaudeOpus);
    }
}
