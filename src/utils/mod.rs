//! Utility modules supporting discovery and agent calls.
//!
//! - [`deduplicate_papers`]: Merge copies of the same paper found by different sources
//! - [`HttpClient`]: Shared HTTP client with JSON decoding and error mapping
//! - [`CircuitBreaker`]: Stop calling a source that keeps failing
//! - [`RetryConfig`]: Retry policy with fixed or exponential backoff
//! - [`with_retry`]: Execute a source operation with automatic retry on transient errors
//!
//! # Retry with Backoff
//!
//! ```rust,no_run
//! use paperflow::utils::{with_retry, RetryConfig};
//! use paperflow::sources::SourceError;
//!
//! # async fn fetch_data() -> Result<String, SourceError> { Ok("data".to_string()) }
//! # #[tokio::main]
//! # async fn main() -> Result<(), SourceError> {
//! let config = RetryConfig::default().max_attempts(3);
//! let data = with_retry(config, || fetch_data()).await?;
//! # Ok(())
//! # }
//! ```

mod circuit_breaker;
mod dedup;
mod http;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerManager, CircuitState};
pub use dedup::{deduplicate_papers, find_duplicates};
pub use http::HttpClient;
pub use retry::{api_retry_config, with_retry, Backoff, RetryConfig, TransientError};
