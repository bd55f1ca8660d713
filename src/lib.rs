//! Pausable scraper for a paginated reading history.
//!
//! [`process::ExtractionController`] walks the history pages one at a time, retries the ones
//! that fail, and hands the collected [`record::Record`]s to an [`export::OutputSink`] when the
//! run completes, pauses, is cancelled or fails.

mod error;
mod macros;

pub mod config;
pub mod export;
pub mod fetch;
pub mod parse;
pub mod process;
pub mod progress;
pub mod record;
pub mod request;
pub mod signal;
pub mod traits;

pub use error::{Error, Result};

/// Wait after every scraped page, so the site isn't hammered.
const PAGE_DELAY_MS: u64 = 600;
/// Wait after a page that failed all of its attempts.
const FAILURE_DELAY_MS: u64 = 500;
/// Wait after a page recovered by the retry sweep.
const RETRY_DELAY_MS: u64 = 300;
/// Attempts on top of the first one, per page.
const MAX_RETRIES: u32 = 5;
const BACKOFF_BASE_DELAY_MS: u64 = 3000;
/// A request that takes longer counts as a failed attempt.
const REQUEST_TIMEOUT_MS: u64 = 30_000;
