//! Related paper discovery across several literature sources.
//!
//! The [`DiscoveryAggregator`] fans a source paper out to every enabled
//! [`Source`](crate::sources::Source), normalizes the records into
//! [`DiscoveredPaper`](crate::models::DiscoveredPaper)s and rolls them up into one
//! [`RelatedPaperDiscoveryResult`](crate::models::RelatedPaperDiscoveryResult).
//! Source failures never fail the run; they are reported in `errors` and the
//! result is flagged for review.

mod aggregator;

pub use aggregator::DiscoveryAggregator;

/// Errors that stop a discovery run before any source is called
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid discovery configuration: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),
}
