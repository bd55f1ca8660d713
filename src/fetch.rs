//! Retrying page fetches with exponential backoff.
//!
//! A fetch that is paused or cancelled returns [`FetchError::Interrupted`], never
//! [`FetchError::Exhausted`], so the controller doesn't mistake a pause for a bad page.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::signal::{Interrupt, RunSignals};
use crate::traits::PageSource;
use crate::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Fetch was {0}.")]
    Interrupted(Interrupt),
    #[error("Failed to fetch page {page} after {attempts} attempts: {source}")]
    Exhausted {
        page: u32,
        attempts: u32,
        #[source]
        source: Error,
    },
}

impl From<Interrupt> for FetchError {
    fn from(interrupt: Interrupt) -> Self {
        FetchError::Interrupted(interrupt)
    }
}

pub struct PageFetcher<S> {
    source: S,
    policy: RetryPolicy,
    reporter: Arc<dyn ProgressReporter>,
}

impl<S: PageSource> PageFetcher<S> {
    pub fn new(source: S, policy: RetryPolicy, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            source,
            policy,
            reporter,
        }
    }

    /// Fetches `page`, retrying up to `policy.max_retries` more times.
    ///
    /// The signals are checked before every attempt and raced against the request and every
    /// backoff wait.
    pub async fn fetch(&self, page: u32, signals: &RunSignals) -> Result<String, FetchError> {
        self.with_retries(page, signals, || self.source.fetch_page(page)).await
    }

    /// Reads the page count from the source, with the same retries and interrupts as a fetch
    /// of page 1.
    pub async fn count_pages(&self, signals: &RunSignals) -> Result<u32, FetchError> {
        self.with_retries(1, signals, || self.source.total_pages()).await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        page: u32,
        signals: &RunSignals,
        mut request: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let max_retries = self.policy.max_retries;
        let mut attempt = 0;

        loop {
            let result = signals.guard(request()).await?;

            match result {
                Ok(output) => {
                    if attempt > 0 {
                        info!(page, attempts = attempt + 1, "Page fetched after retry");
                    } else {
                        debug!(page, "Page fetched");
                    }
                    return Ok(output);
                }
                Err(e) if attempt < max_retries => {
                    let delay = self.policy.backoff(attempt);
                    attempt += 1;

                    warn!(
                        page,
                        error = %e,
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Page fetch failed, retrying"
                    );
                    self.reporter.report(ProgressEvent::status(format!(
                        "Network error on page {page}. Retrying ({attempt}/{max_retries})..."
                    )));

                    signals.sleep(delay).await?;
                }
                Err(e) => {
                    return Err(FetchError::Exhausted {
                        page,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
            }
        }
    }
}
