//! # paperflow
//!
//! Document processing pipeline for research papers: a dependency-ordered stage
//! scheduler, resilient multi-provider agent calls and related paper discovery
//! across several literature APIs.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`]: Core data structures (stages, configurations, call and stage results, discovered papers)
//! - [`agents`]: Providers, the fallback chain and the metrics registry
//! - [`pipeline`]: Stage graph, stage executor and the orchestrator
//! - [`discovery`]: Multi-source related paper discovery
//! - [`sources`]: Literature source plugins with extensible trait-based architecture
//! - [`utils`]: HTTP client, retry, circuit breakers and deduplication
//! - [`config`]: Configuration management

pub mod agents;
pub mod config;
pub mod discovery;
pub mod models;
pub mod pipeline;
pub mod sources;
pub mod utils;

// Re-export commonly used types
pub use agents::{FallbackChain, MetricsRegistry, Provider, ProviderRegistry};
pub use discovery::DiscoveryAggregator;
pub use models::{DiscoveryConfiguration, PipelineConfiguration};
pub use pipeline::{PipelineOrchestrator, PipelineRun, StageExecutor};
pub use sources::{Source, SourceRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
