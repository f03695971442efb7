use std::sync::Arc;

use crate::error::LoadError;
use crate::metadata::Plugin;

type PluginFactory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Build-time plugin discovery: a table mapping a stable plugin id to a
/// factory validated against the [`Plugin`] contract. Replaces directory
/// scanning and dynamic type lookup; the id convention is the plugin's
/// metadata name.
#[derive(Default)]
pub struct PluginFactoryRegistry {
    factories: Vec<(String, PluginFactory)>,
}

impl PluginFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: &str,
        factory: impl Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    ) -> Result<(), LoadError> {
        if self.contains(id) {
            return Err(LoadError::DuplicateId(id.to_string()));
        }
        self.factories.push((id.to_string(), Box::new(factory)));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.iter().any(|(n, _)| n == id)
    }

    /// Instantiate a fresh plugin instance, or `None` for an unknown id.
    pub fn instantiate(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.factories
            .iter()
            .find(|(n, _)| n == id)
            .map(|(_, f)| f())
    }

    /// Every registered plugin id, in registration order.
    pub fn ids(&self) -> Vec<&str> {
        self.factories.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
