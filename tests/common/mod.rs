//! Scripted collaborators for driving the extraction controller in tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use history_scrap::config::{RetryPolicy, ScrapeConfig};
use history_scrap::export::{OutputSink, Snapshot};
use history_scrap::process::{ExtractionController, RunState};
use history_scrap::progress::{ProgressEvent, ProgressReporter};
use history_scrap::record::{Record, WorkRecord};
use history_scrap::traits::{PageSource, RecordExtractor};
use history_scrap::{Error, Result};
use tokio::sync::Notify;

pub const RECORDS_PER_PAGE: usize = 2;

// =============================================================================
// ScriptedSource
// =============================================================================

#[derive(Default)]
struct SourceState {
    total: u32,
    /// Remaining failures of the page count.
    count_failures: u32,
    count_calls: usize,
    /// The next page count never completes.
    hang_count: bool,
    /// Remaining failures per page.
    failures: HashMap<u32, u32>,
    /// Every call to `fetch_page`, in order.
    fetched: Vec<u32>,
    /// Page whose fetch never completes, after letting the given number of fetches through.
    hang_on: Option<(u32, u32)>,
}

/// A listing of `total` pages whose content is `page-N`.
///
/// Pages and the page count can be scripted to fail a number of times, or to hang until the
/// request is dropped.
#[derive(Clone)]
pub struct ScriptedSource {
    delay: Duration,
    state: Arc<Mutex<SourceState>>,
    reached: Arc<Notify>,
}

impl ScriptedSource {
    pub fn new(total: u32) -> Self {
        let state = SourceState {
            total,
            ..Default::default()
        };
        Self {
            delay: Duration::ZERO,
            state: Arc::new(Mutex::new(state)),
            reached: Arc::new(Notify::new()),
        }
    }

    /// A source whose page count can't be determined.
    pub fn without_page_count() -> Self {
        Self::new(1).fail_count(u32::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_count(self, times: u32) -> Self {
        self.set_count_failures(times);
        self
    }

    pub fn hang_count(self) -> Self {
        self.state.lock().unwrap().hang_count = true;
        self
    }

    pub fn fail_page(self, page: u32, times: u32) -> Self {
        self.state.lock().unwrap().failures.insert(page, times);
        self
    }

    /// The next fetch of `page` hangs.
    pub fn hang_on(self, page: u32) -> Self {
        self.hang_on_nth(page, 1)
    }

    /// The `nth` fetch of `page`, counting from 1, hangs.
    pub fn hang_on_nth(self, page: u32, nth: u32) -> Self {
        self.state.lock().unwrap().hang_on = Some((page, nth - 1));
        self
    }

    /// The next `times` page counts fail.
    pub fn set_count_failures(&self, times: u32) {
        self.state.lock().unwrap().count_failures = times;
    }

    /// Changes the page count reported from now on.
    pub fn set_total(&self, total: u32) {
        self.state.lock().unwrap().total = total;
    }

    /// Notified when a hanging request starts.
    pub fn reached(&self) -> Arc<Notify> {
        self.reached.clone()
    }

    pub fn count_calls(&self) -> usize {
        self.state.lock().unwrap().count_calls
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.state.lock().unwrap().fetched.clone()
    }

    pub fn fetch_count(&self, page: u32) -> usize {
        self.fetched().iter().filter(|p| **p == page).count()
    }

    async fn hang(&self) {
        self.reached.notify_one();
        std::future::pending::<()>().await;
    }
}

impl PageSource for ScriptedSource {
    async fn total_pages(&self) -> Result<u32> {
        let (hang, counted) = {
            let mut state = self.state.lock().unwrap();
            state.count_calls += 1;

            let hang = std::mem::take(&mut state.hang_count);
            let counted = if hang {
                Ok(state.total)
            } else if state.count_failures > 0 {
                state.count_failures -= 1;
                Err(Error::HttpStatus { page: 1, status: 500 })
            } else {
                Ok(state.total)
            };
            (hang, counted)
        };

        if hang {
            self.hang().await;
        }
        counted
    }

    async fn fetch_page(&self, page: u32) -> Result<String> {
        let (hang, fail) = {
            let mut state = self.state.lock().unwrap();
            state.fetched.push(page);

            let hang_on = state.hang_on;
            let hang = match hang_on {
                Some((p, 0)) if p == page => {
                    state.hang_on = None;
                    true
                }
                Some((p, skips)) if p == page => {
                    state.hang_on = Some((p, skips - 1));
                    false
                }
                _ => false,
            };
            let fail = match state.failures.get_mut(&page) {
                Some(left) if !hang && *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            (hang, fail)
        };

        if hang {
            self.hang().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if fail {
            return Err(Error::HttpStatus { page, status: 503 });
        }
        Ok(format!("page-{page}"))
    }
}

// =============================================================================
// Extractors
// =============================================================================

/// Produces `RECORDS_PER_PAGE` works per page, with ids `N-i`.
pub struct NumberedExtractor;

impl RecordExtractor for NumberedExtractor {
    fn extract(&self, content: &str, page: u32) -> Vec<Record> {
        assert_eq!(content, format!("page-{page}"));
        (0..RECORDS_PER_PAGE)
            .map(|i| {
                Record::from(WorkRecord {
                    id: format!("{page}-{i}"),
                    page_number: page,
                    title: format!("Work {i} on page {page}"),
                    ..Default::default()
                })
            })
            .collect()
    }
}

/// Panics on one page, like an extractor with a bug.
pub struct PanickingExtractor {
    pub on_page: u32,
}

impl RecordExtractor for PanickingExtractor {
    fn extract(&self, content: &str, page: u32) -> Vec<Record> {
        if page == self.on_page {
            panic!("extractor blew up on page {page}");
        }
        NumberedExtractor.extract(content, page)
    }
}

// =============================================================================
// Recorders
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub records: Vec<Record>,
    pub is_partial: bool,
}

#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Delivery> {
        self.deliveries.lock().unwrap().last().cloned()
    }
}

impl OutputSink for RecordingSink {
    fn deliver(&self, snapshot: &Snapshot<'_>) -> Result<()> {
        self.deliveries.lock().unwrap().push(Delivery {
            records: snapshot.records.to_vec(),
            is_partial: snapshot.is_partial,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Status(message) => Some(message),
                ProgressEvent::Page { .. } => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub type TestController = ExtractionController<ScriptedSource, NumberedExtractor>;

/// A reporter and sink that look at the controller's state from inside their callbacks, like
/// a UI refreshing its buttons.
#[derive(Default)]
pub struct StateWatcher {
    controller: OnceLock<TestController>,
    reported: Mutex<Vec<RunState>>,
    delivered: Mutex<Vec<RunState>>,
}

impl StateWatcher {
    pub fn watch(&self, controller: TestController) {
        let _ = self.controller.set(controller);
    }

    /// State seen by each report.
    pub fn reported(&self) -> Vec<RunState> {
        self.reported.lock().unwrap().clone()
    }

    /// State seen by each delivery.
    pub fn delivered(&self) -> Vec<RunState> {
        self.delivered.lock().unwrap().clone()
    }

    fn state(&self) -> Option<RunState> {
        self.controller.get().map(TestController::state)
    }
}

impl ProgressReporter for StateWatcher {
    fn report(&self, _event: ProgressEvent) {
        if let Some(state) = self.state() {
            self.reported.lock().unwrap().push(state);
        }
    }
}

impl OutputSink for StateWatcher {
    fn deliver(&self, _snapshot: &Snapshot<'_>) -> Result<()> {
        if let Some(state) = self.state() {
            self.delivered.lock().unwrap().push(state);
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Millisecond delays so scenarios finish quickly.
pub fn fast_config() -> ScrapeConfig {
    ScrapeConfig {
        page_delay: Duration::from_millis(1),
        failure_delay: Duration::from_millis(1),
        retry_delay: Duration::from_millis(1),
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
        },
    }
}

pub struct Harness<X> {
    pub controller: ExtractionController<ScriptedSource, X>,
    pub source: ScriptedSource,
    pub sink: Arc<RecordingSink>,
    pub reporter: Arc<RecordingReporter>,
}

pub fn harness(source: ScriptedSource) -> Harness<NumberedExtractor> {
    harness_with(source, NumberedExtractor)
}

pub fn harness_with<X: RecordExtractor>(source: ScriptedSource, extractor: X) -> Harness<X> {
    let sink = Arc::new(RecordingSink::default());
    let reporter = Arc::new(RecordingReporter::default());
    let controller = ExtractionController::new(
        source.clone(),
        extractor,
        reporter.clone(),
        sink.clone(),
        fast_config(),
    );
    Harness {
        controller,
        source,
        sink,
        reporter,
    }
}

/// Page of origin of each record, in accumulator order.
pub fn pages_of(records: &[Record]) -> Vec<u32> {
    records.iter().map(Record::page_number).collect()
}

/// `RECORDS_PER_PAGE` copies of each page, the shape of an accumulator that saw `pages`.
pub fn expected_pages(pages: &[u32]) -> Vec<u32> {
    pages
        .iter()
        .flat_map(|page| std::iter::repeat(*page).take(RECORDS_PER_PAGE))
        .collect()
}
