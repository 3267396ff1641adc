// Stage client implementations
pub mod catalog;
pub mod http;
pub mod retry;

// Re-exports
pub use catalog::{CatalogEntry, RawFinding, VulnerabilityCatalog};
pub use http::HttpStageClient;
pub use retry::{RetryPolicy, RetryingStageClient};
