//! Registry for managing discovery source plugins.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{CrossRefSource, OpenAlexSource, SemanticScholarSource, Source, SourceError};
use crate::config::ApiKeys;
use crate::models::{RelationshipType, SourceType};

bitflags::bitflags! {
    /// Relationship types a source can answer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceCapabilities: u32 {
        const CITES = 1 << 0;
        const CITED_BY = 1 << 1;
        const SEMANTIC_SIMILARITY = 1 << 2;
        const SAME_AUTHOR = 1 << 3;
        const SAME_VENUE = 1 << 4;
    }
}

impl SourceCapabilities {
    pub fn for_relationship(relationship: RelationshipType) -> Self {
        match relationship {
            RelationshipType::Cites => Self::CITES,
            RelationshipType::CitedBy => Self::CITED_BY,
            RelationshipType::SemanticSimilarity => Self::SEMANTIC_SIMILARITY,
            RelationshipType::SameAuthor => Self::SAME_AUTHOR,
            RelationshipType::SameVenue => Self::SAME_VENUE,
        }
    }
}

/// Registry of discovery sources keyed by id
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in HTTP sources
    pub fn with_default_sources(api_keys: &ApiKeys) -> Result<Self, SourceError> {
        let mut registry = Self::new();

        registry.register(Arc::new(CrossRefSource::new(api_keys.crossref_mailto.clone())?));
        registry.register(Arc::new(SemanticScholarSource::new(
            api_keys.semantic_scholar.clone(),
        )?));
        registry.register(Arc::new(OpenAlexSource::new(api_keys.openalex_email.clone())?));

        Ok(registry)
    }

    /// Register a source, replacing any source with the same id
    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.id().to_string(), source);
    }

    /// Get a source by ID
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Source>> {
        self.sources.get(id)
    }

    /// Get the source for a configured source type
    pub fn get_by_type(&self, source: &SourceType) -> Option<&Arc<dyn Source>> {
        self.get(source.id())
    }

    /// Get a source by ID, returning an error if not found
    pub fn get_required(&self, id: &str) -> Result<&Arc<dyn Source>, SourceError> {
        self.get(id)
            .ok_or_else(|| SourceError::NotFound(format!("Source '{}' not registered", id)))
    }

    /// Get all registered sources
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Source>> {
        self.sources.values()
    }

    /// Get all source IDs
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(|s| s.as_str())
    }

    /// Get sources that can answer a relationship type
    pub fn supporting(&self, relationship: RelationshipType) -> Vec<&Arc<dyn Source>> {
        self.all().filter(|s| s.supports(relationship)).collect()
    }

    /// Check if a source exists
    pub fn has(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockSource;

    fn default_registry() -> SourceRegistry {
        SourceRegistry::with_default_sources(&ApiKeys::default()).unwrap()
    }

    #[test]
    fn test_default_sources_registered() {
        let registry = default_registry();
        assert_eq!(registry.len(), 3);
        for id in ["crossref", "semantic_scholar", "openalex"] {
            assert!(registry.has(id), "source '{}' should be registered", id);
        }
        assert!(registry.get_by_type(&SourceType::SemanticScholar).is_some());
        assert!(registry.get("nonexistent").is_none());
        assert!(registry.get_required("nonexistent").is_err());
    }

    #[test]
    fn test_capabilities() {
        let registry = default_registry();

        let crossref = registry.get("crossref").unwrap();
        assert!(crossref.supports(RelationshipType::Cites));
        assert!(!crossref.supports(RelationshipType::CitedBy));

        let semantic = registry.get("semantic_scholar").unwrap();
        assert!(semantic.supports(RelationshipType::CitedBy));
        assert!(semantic.supports(RelationshipType::SemanticSimilarity));

        assert_eq!(registry.supporting(RelationshipType::CitedBy).len(), 2);
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(MockSource::new("mock")));
        registry.register(Arc::new(MockSource::new("mock")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["mock"]);
    }
}
