//! The extraction controller: drives a run over every history page, and lets the user pause,
//! resume or cancel it while it's in flight.
//!
//! A run goes through two sweeps. The first walks the pages in order; a page that fails all
//! of its fetch attempts is remembered and skipped. If the first sweep got through the whole
//! listing, the second sweep tries each failed page once more, in the order they failed.
//!
//! Records are kept in the order they were collected: first-sweep pages in page order, then
//! the pages recovered by the retry sweep. Sort by [`Record::page_number`] if page order
//! matters.
//!
//! When a run pauses it is parked, with everything it collected, until it's resumed. Resuming
//! starts at the page that was in progress, so no page is fetched twice once it has an
//! outcome and none is skipped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::ScrapeConfig;
use crate::export::{OutputSink, Snapshot};
use crate::fetch::{FetchError, PageFetcher};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::record::Record;
use crate::signal::{Interrupt, RunSignals};
use crate::traits::{PageSource, RecordExtractor};
use crate::{info_time, Error};

/// How a run ended, or that it's parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    CancelledWithPartial,
    CancelledEmpty,
    /// Suspended, can be resumed.
    Paused,
    FailedWithPartial,
    FailedEmpty,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CancelledWithPartial => "cancelled-with-partial",
            RunOutcome::CancelledEmpty => "cancelled-empty",
            RunOutcome::Paused => "paused",
            RunOutcome::FailedWithPartial => "failed-with-partial",
            RunOutcome::FailedEmpty => "failed-empty",
        }
    }

    /// Everything except [`RunOutcome::Paused`] ends the run for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Paused)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
}

/// Everything one run has collected so far.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRun {
    current_page: u32,
    total_pages: u32,
    records: Vec<Record>,
    /// Pages that failed the first sweep, in the order they failed.
    failed_pages: Vec<u32>,
    /// Index into `failed_pages` of the next page to retry.
    retry_cursor: usize,
    recovered_pages: Vec<u32>,
    /// Whether `total_pages` came from the source rather than the default.
    counted: bool,
}

impl Default for ExtractionRun {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: 1,
            records: Vec::new(),
            failed_pages: Vec::new(),
            retry_cursor: 0,
            recovered_pages: Vec::new(),
            counted: false,
        }
    }
}

impl ExtractionRun {
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn failed_pages(&self) -> &[u32] {
        &self.failed_pages
    }

    pub fn recovered_pages(&self) -> &[u32] {
        &self.recovered_pages
    }
}

/// Why `collect` stopped early.
enum Halt {
    Interrupted(Interrupt),
    Fatal(Error),
}

impl From<Interrupt> for Halt {
    fn from(interrupt: Interrupt) -> Self {
        Halt::Interrupted(interrupt)
    }
}

enum Slot {
    Idle,
    Running,
    Parked(ExtractionRun),
}

struct Lifecycle {
    signals: RunSignals,
    slot: Slot,
}

struct Shared<S, X> {
    fetcher: PageFetcher<S>,
    extractor: Arc<X>,
    reporter: Arc<dyn ProgressReporter>,
    sink: Arc<dyn OutputSink>,
    config: ScrapeConfig,
    lifecycle: Mutex<Lifecycle>,
}

/// Runs extractions one at a time and exposes the pause / resume / cancel controls.
///
/// Cloning is cheap and every clone controls the same run, so a clone can be handed to
/// whatever delivers the user's input.
pub struct ExtractionController<S, X> {
    inner: Arc<Shared<S, X>>,
}

impl<S, X> Clone for ExtractionController<S, X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, X> ExtractionController<S, X>
where
    S: PageSource,
    X: RecordExtractor,
{
    pub fn new(
        source: S,
        extractor: X,
        reporter: Arc<dyn ProgressReporter>,
        sink: Arc<dyn OutputSink>,
        config: ScrapeConfig,
    ) -> Self {
        let fetcher = PageFetcher::new(source, config.retry, Arc::clone(&reporter));
        Self {
            inner: Arc::new(Shared {
                fetcher,
                extractor: Arc::new(extractor),
                reporter,
                sink,
                config,
                lifecycle: Mutex::new(Lifecycle {
                    signals: RunSignals::new(),
                    slot: Slot::Idle,
                }),
            }),
        }
    }

    pub fn state(&self) -> RunState {
        match self.lock().slot {
            Slot::Idle => RunState::Idle,
            Slot::Running => RunState::Running,
            Slot::Parked(_) => RunState::Paused,
        }
    }

    /// A copy of the parked run, if the controller is paused.
    pub fn parked(&self) -> Option<ExtractionRun> {
        match &self.lock().slot {
            Slot::Parked(run) => Some(run.clone()),
            _ => None,
        }
    }

    /// Starts a new run and drives it until it ends or pauses.
    ///
    /// Returns `None` without doing anything if a run is already active or parked.
    pub async fn start(&self) -> Option<RunOutcome> {
        let signals = {
            let mut lifecycle = self.lock();
            if !matches!(lifecycle.slot, Slot::Idle) {
                debug!("An extraction is already active, ignoring start");
                return None;
            }
            lifecycle.signals = RunSignals::new();
            lifecycle.slot = Slot::Running;
            lifecycle.signals.clone()
        };

        info!("Starting extraction");
        Some(self.drive(ExtractionRun::default(), signals).await)
    }

    /// Resumes a parked run and drives it until it ends or pauses again.
    ///
    /// Returns `None` if no run is parked.
    pub async fn resume(&self) -> Option<RunOutcome> {
        let (run, signals) = {
            let mut lifecycle = self.lock();
            let run = take_parked(&mut lifecycle, Slot::Running)?;
            lifecycle.signals.set_paused(false);
            (run, lifecycle.signals.clone())
        };

        self.report_resume(&run);
        Some(self.drive(run, signals).await)
    }

    /// Flips the pause flag of the active run. Does nothing when idle.
    ///
    /// Pausing takes effect at the run's next checkpoint, including in the middle of a request
    /// or a wait. Unpausing a parked run resumes it on a new task, whose handle is returned.
    /// Must be called from within a tokio runtime.
    pub fn toggle_pause(&self) -> Option<JoinHandle<Option<RunOutcome>>> {
        let (paused, resumed) = {
            let mut lifecycle = self.lock();
            if matches!(lifecycle.slot, Slot::Idle) {
                debug!("No extraction to pause");
                return None;
            }
            let paused = lifecycle.signals.toggle_pause();
            let resumed = if paused {
                None
            } else {
                take_parked(&mut lifecycle, Slot::Running)
                    .map(|run| (run, lifecycle.signals.clone()))
            };
            (paused, resumed)
        };

        if paused {
            debug!("Pause requested");
            self.report(ProgressEvent::status("Extraction paused."));
            return None;
        }

        let Some((run, signals)) = resumed else {
            // Still running, it never got to park.
            debug!("Pause lifted");
            self.report(ProgressEvent::status("Extraction resumed."));
            return None;
        };

        self.report_resume(&run);
        let controller = self.clone();
        Some(tokio::spawn(async move {
            Some(controller.drive(run, signals).await)
        }))
    }

    /// Requests cancellation. Does nothing when idle.
    ///
    /// A running run stops at its next checkpoint and reports its own outcome. A parked run
    /// is settled right away and its outcome is returned here.
    pub async fn cancel(&self) -> Option<RunOutcome> {
        let parked = {
            let mut lifecycle = self.lock();
            if matches!(lifecycle.slot, Slot::Idle) {
                debug!("No extraction to cancel");
                return None;
            }
            lifecycle.signals.cancel();
            take_parked(&mut lifecycle, Slot::Idle)
        };

        self.report(ProgressEvent::status("Cancelling extraction process..."));
        let run = parked?;
        Some(self.settle(run, Ending::Cancelled).await)
    }

    /// Drives `run` until it completes, fails, is cancelled or parks.
    ///
    /// The slot changes under the lock; reporting and delivery happen after it's released, so
    /// reporters and sinks are free to call back into the controller.
    async fn drive(&self, mut run: ExtractionRun, signals: RunSignals) -> RunOutcome {
        let start_time = Local::now();
        let mut slot_guard = SlotGuard::new(&self.inner.lifecycle);
        // Counted once per start or resume, never mid-run.
        let mut counted = false;

        let outcome = loop {
            let halt = self.advance(&mut run, &signals, &mut counted).await.err();

            let ending = {
                let mut lifecycle = self.lock();
                let ending = match halt {
                    None => Some(Ending::Completed),
                    Some(Halt::Fatal(e)) => Some(Ending::Failed(e)),
                    Some(Halt::Interrupted(_)) if signals.is_cancelled() => Some(Ending::Cancelled),
                    Some(Halt::Interrupted(_)) if signals.is_paused() => Some(Ending::Paused),
                    Some(Halt::Interrupted(_)) => None,
                };
                match ending {
                    Some(Ending::Paused) => lifecycle.slot = Slot::Parked(run.clone()),
                    Some(_) => lifecycle.slot = Slot::Idle,
                    None => {}
                }
                ending
            };

            match ending {
                Some(ending) => {
                    slot_guard.disarm();
                    break self.settle(run, ending).await;
                }
                None => debug!(page = run.current_page, "Pause lifted before parking"),
            }
        };

        info_time!(start_time, "Extraction stopped: {}", outcome);
        outcome
    }

    /// Counts the pages if this drive hasn't yet, then runs the sweeps.
    async fn advance(
        &self,
        run: &mut ExtractionRun,
        signals: &RunSignals,
        counted: &mut bool,
    ) -> Result<(), Halt> {
        if !*counted {
            self.count_pages(run, signals).await?;
            *counted = true;
        }
        self.collect(run, signals).await
    }

    /// Asks the source for the page count. A run that already has a count keeps it when the
    /// source can't answer.
    async fn count_pages(&self, run: &mut ExtractionRun, signals: &RunSignals) -> Result<(), Halt> {
        match self.inner.fetcher.count_pages(signals).await {
            Ok(total_pages) => {
                let total_pages = total_pages.max(1);
                if run.counted && total_pages != run.total_pages {
                    info!(
                        was = run.total_pages,
                        now = total_pages,
                        "Page count changed while paused"
                    );
                }
                run.total_pages = total_pages;
                run.counted = true;
            }
            Err(FetchError::Interrupted(interrupt)) => return Err(interrupt.into()),
            Err(e) if run.counted => {
                warn!(
                    error = %e,
                    total_pages = run.total_pages,
                    "Keeping the previous page count"
                );
                self.report(ProgressEvent::status(format!(
                    "Couldn't refresh the page count. Continuing with {} pages...",
                    run.total_pages
                )));
            }
            Err(FetchError::Exhausted { source, .. }) => return Err(Halt::Fatal(source)),
        }

        debug!(total_pages = run.total_pages, "Page count");
        self.report(ProgressEvent::page(
            run.current_page.min(run.total_pages),
            run.total_pages,
        ));
        Ok(())
    }

    /// The two sweeps. Returns early on pause, cancel or a fatal error, with `run` pointing at
    /// the page that was in progress.
    async fn collect(&self, run: &mut ExtractionRun, signals: &RunSignals) -> Result<(), Halt> {
        let config = &self.inner.config;
        let total_pages = run.total_pages;

        while run.current_page <= total_pages {
            signals.checkpoint()?;
            let page = run.current_page;
            self.report(ProgressEvent::page(page, total_pages));

            match self.inner.fetcher.fetch(page, signals).await {
                Ok(content) => {
                    let records = self.extract(content, page).await?;
                    debug!(page, records = records.len(), "Page scraped");
                    run.records.extend(records);
                    run.current_page += 1;
                    signals.sleep(config.page_delay).await?;
                }
                Err(FetchError::Interrupted(interrupt)) => return Err(interrupt.into()),
                Err(e @ FetchError::Exhausted { .. }) => {
                    warn!(page, error = %e, "Skipping page");
                    if !run.failed_pages.contains(&page) {
                        run.failed_pages.push(page);
                    }
                    run.current_page += 1;
                    self.report(ProgressEvent::page_with_status(
                        page,
                        total_pages,
                        format!("Error on page {page}, continuing..."),
                    ));
                    self.report(ProgressEvent::status(format!(
                        "Failed to load page {page}. Continuing with next page..."
                    )));
                    signals.sleep(config.failure_delay).await?;
                }
            }
        }

        if run.retry_cursor >= run.failed_pages.len() {
            return Ok(());
        }

        let failed_count = run.failed_pages.len();
        info!(
            pages = ?&run.failed_pages[run.retry_cursor..],
            "Retrying failed pages"
        );
        self.report(ProgressEvent::status(format!(
            "Retrying {} failed pages...",
            failed_count - run.retry_cursor
        )));

        while run.retry_cursor < failed_count {
            signals.checkpoint()?;
            let page = run.failed_pages[run.retry_cursor];
            let position = run.retry_cursor + 1;
            self.report(ProgressEvent::page_with_status(
                page,
                total_pages,
                format!("Retry page {page} ({position}/{failed_count})..."),
            ));

            match self.inner.fetcher.fetch(page, signals).await {
                Ok(content) => {
                    let records = self.extract(content, page).await?;
                    info!(page, records = records.len(), "Recovered page on retry");
                    run.records.extend(records);
                    run.recovered_pages.push(page);
                    run.retry_cursor += 1;
                    self.report(ProgressEvent::status(format!(
                        "Successfully loaded page {page} on retry. Continuing..."
                    )));
                    signals.sleep(config.retry_delay).await?;
                }
                Err(FetchError::Interrupted(interrupt)) => return Err(interrupt.into()),
                Err(e @ FetchError::Exhausted { .. }) => {
                    error!(page, error = %e, "Final retry failed");
                    run.retry_cursor += 1;
                    self.report(ProgressEvent::status(format!(
                        "Failed to load page {page} after multiple attempts."
                    )));
                }
            }
        }

        self.report(ProgressEvent::status(format!(
            "Retry process complete. {} pages recovered.",
            run.recovered_pages.len()
        )));
        Ok(())
    }

    /// Extraction runs on the blocking pool. A panicking extractor is fatal to the run.
    async fn extract(&self, content: String, page: u32) -> Result<Vec<Record>, Halt> {
        let extractor = Arc::clone(&self.inner.extractor);
        spawn_blocking(move || extractor.extract(&content, page))
            .await
            .map_err(|e| Halt::Fatal(e.into()))
    }

    /// Reports how the run ended and hands its records to the sink, if there is anything to
    /// hand over. The slot has already been updated.
    async fn settle(&self, run: ExtractionRun, ending: Ending) -> RunOutcome {
        let has_records = !run.records.is_empty();
        match ending {
            Ending::Completed => {
                self.report(ProgressEvent::status(format!(
                    "Successfully collected {} works!",
                    run.records.len()
                )));
                self.deliver(run.records, false).await;
                RunOutcome::Completed
            }
            Ending::Paused => {
                let page = run.current_page;
                info!(page, records = run.records.len(), "Extraction paused");
                self.report(ProgressEvent::page_with_status(
                    page.min(run.total_pages),
                    run.total_pages,
                    "Paused...",
                ));
                self.report(ProgressEvent::status(format!(
                    "Paused at page {page}. Collected {} works so far.",
                    run.records.len()
                )));
                self.deliver(run.records, true).await;
                RunOutcome::Paused
            }
            Ending::Cancelled if has_records => {
                self.report(ProgressEvent::status(
                    "Process cancelled. The data collected so far has been saved.",
                ));
                self.deliver(run.records, true).await;
                RunOutcome::CancelledWithPartial
            }
            Ending::Cancelled => {
                self.report(ProgressEvent::status("Process cancelled."));
                RunOutcome::CancelledEmpty
            }
            Ending::Failed(e) => {
                error!(error = %e, "Extraction failed");
                self.report(ProgressEvent::page_with_status(0, 0, format!("Error: {e}")));
                if has_records {
                    self.report(ProgressEvent::status(
                        "Some pages failed to load. The data collected so far has been saved.",
                    ));
                    self.deliver(run.records, true).await;
                    RunOutcome::FailedWithPartial
                } else {
                    RunOutcome::FailedEmpty
                }
            }
        }
    }

    /// Sinks may block on IO, so they run on the blocking pool.
    async fn deliver(&self, records: Vec<Record>, is_partial: bool) {
        let sink = Arc::clone(&self.inner.sink);
        let delivered = spawn_blocking(move || sink.deliver(&Snapshot::new(&records, is_partial)))
            .await
            .map_err(Error::from)
            .and_then(|result| result);

        if let Err(e) = delivered {
            error!(error = %e, "Couldn't hand over the collected records");
            self.report(ProgressEvent::status(format!(
                "Couldn't save the collected data: {e}"
            )));
        }
    }

    fn report_resume(&self, run: &ExtractionRun) {
        info!(page = run.current_page, "Resuming extraction");
        self.report(ProgressEvent::status(format!(
            "Resuming extraction from page {}...",
            run.current_page
        )));
    }

    fn report(&self, event: ProgressEvent) {
        self.inner.reporter.report(event);
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Ending {
    Completed,
    Paused,
    Cancelled,
    Failed(Error),
}

/// Moves a parked run out of the slot, leaving `then` in its place.
fn take_parked(lifecycle: &mut Lifecycle, then: Slot) -> Option<ExtractionRun> {
    match std::mem::replace(&mut lifecycle.slot, then) {
        Slot::Parked(run) => Some(run),
        other => {
            lifecycle.slot = other;
            None
        }
    }
}

/// Frees the slot when a run's future is dropped before the run settles or parks, so the
/// controller doesn't stay busy forever.
struct SlotGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(lifecycle: &'a Mutex<Lifecycle>) -> Self {
        Self {
            lifecycle,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(lifecycle.slot, Slot::Running) {
            warn!("Extraction dropped before it finished");
            lifecycle.signals.cancel();
            lifecycle.slot = Slot::Idle;
        }
    }
}
