//! Registry of agent providers.

use std::sync::Arc;

use super::Provider;
use crate::config::ProvidersConfig;

/// Cloud providers in registration order plus the local models one fallback is picked from
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    cloud: Vec<Arc<dyn Provider>>,
    local: Vec<Arc<dyn Provider>>,
    /// Local model picked by configuration; the latest registered one otherwise
    local_choice: Option<String>,
    default_order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. A provider with an already registered id replaces
    /// the old one in place.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let providers = if provider.is_local() {
            &mut self.local
        } else {
            &mut self.cloud
        };
        match providers.iter_mut().find(|p| p.id() == provider.id()) {
            Some(existing) => *existing = provider,
            None => providers.push(provider),
        }
    }

    /// Order used when a call does not name one
    pub fn with_default_order(mut self, order: Vec<String>) -> Self {
        self.default_order = order;
        self
    }

    /// Apply the `[providers]` config section: default order and local fallback id
    pub fn configure(mut self, config: &ProvidersConfig) -> Self {
        if !config.order.is_empty() {
            self.default_order = config.order.clone();
        }
        if let Some(local_id) = &config.local_fallback {
            if self.local.iter().any(|l| l.id() == local_id) {
                self.local_choice = Some(local_id.clone());
            } else {
                tracing::warn!(
                    configured = %local_id,
                    "configured local fallback is not registered; keeping the default one"
                );
            }
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.cloud
            .iter()
            .chain(self.local.iter())
            .find(|p| p.id() == id)
    }

    pub fn local_fallback(&self) -> Option<&Arc<dyn Provider>> {
        self.local_choice
            .as_deref()
            .and_then(|id| self.local.iter().find(|l| l.id() == id))
            .or_else(|| self.local.last())
    }

    /// The default order, or every cloud provider in registration order
    pub fn default_order(&self) -> Vec<String> {
        if self.default_order.is_empty() {
            self.cloud.iter().map(|p| p.id().to_string()).collect()
        } else {
            self.default_order.clone()
        }
    }

    /// Cloud providers for `order`; unknown ids are skipped with a warning
    pub fn resolve(&self, order: &[String]) -> Vec<Arc<dyn Provider>> {
        let owned;
        let order = if order.is_empty() {
            owned = self.default_order();
            &owned[..]
        } else {
            order
        };

        order
            .iter()
            .filter_map(|id| {
                let provider = self.cloud.iter().find(|p| p.id() == id.as_str());
                if provider.is_none() {
                    tracing::warn!(provider = %id, "unknown provider in order, skipping");
                }
                provider.cloned()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cloud.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
