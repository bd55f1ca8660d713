//! Seams between the extraction loop and the outside world.
//!
//! The controller only sees these traits, so tests can drive it with scripted sources and
//! extractors instead of a live site.

use std::future::Future;

use crate::record::Record;
use crate::Result;

/// Where history pages come from.
pub trait PageSource: Send + Sync + 'static {
    /// Number of pages in the listing, `1` if it isn't paginated.
    ///
    /// Queried once when a run starts and again when a paused run resumes.
    fn total_pages(&self) -> impl Future<Output = Result<u32>> + Send;

    /// A single attempt at fetching the content of `page` (1-based).
    ///
    /// Retries are layered on top by [`crate::fetch::PageFetcher`].
    fn fetch_page(&self, page: u32) -> impl Future<Output = Result<String>> + Send;
}

/// Turns the content of one page into records.
pub trait RecordExtractor: Send + Sync + 'static {
    /// Never fails as a whole: entries that can't be read become
    /// [`crate::record::FailedRecord`] placeholders.
    fn extract(&self, content: &str, page: u32) -> Vec<Record>;
}
