use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, Result};
use crate::provider::Provider;

/// Provider id to provider; written at startup, read everywhere
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let id = provider.id().to_string();
        let mut providers = self.providers.write().unwrap_or_else(|p| p.into_inner());
        if providers.contains_key(&id) {
            return Err(crate::track!(EngineError::DuplicateProvider(id)));
        }
        log::debug!("registered provider {}", id);
        providers.insert(id, provider);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        providers.get(id).cloned()
    }

    /// Like `get`, but a missing id is a not-found error
    pub fn require(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.get(id)
            .ok_or_else(|| crate::track!(EngineError::NotFound(format!("provider '{}'", id)), "provider" => id))
    }

    /// All providers ordered by id
    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<_> = providers.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
