//! Search index hook run after a source's library has been refreshed.

use async_trait::async_trait;

/// Rebuilds the search index of one source.
///
/// Failures are reported but never fail the sync that triggered them.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    /// Returns the number of indexed items.
    async fn rebuild(&self, source: &str) -> Result<usize, String>;
}

/// Indexer that does nothing, for hosts without search.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexer;

#[async_trait]
impl SearchIndexer for NoopIndexer {
    async fn rebuild(&self, _source: &str) -> Result<usize, String> {
        Ok(0)
    }
}
