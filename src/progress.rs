//! Progress and status reporting.

use std::fmt;

use tracing::info;

/// Something worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Position in the listing, with an optional note replacing the default
    /// "Processing page N of M" text.
    Page {
        current_page: u32,
        total_pages: u32,
        status: Option<String>,
    },
    /// Free-text status message.
    Status(String),
}

impl ProgressEvent {
    pub fn page(current_page: u32, total_pages: u32) -> Self {
        Self::Page {
            current_page,
            total_pages,
            status: None,
        }
    }

    pub fn page_with_status(current_page: u32, total_pages: u32, status: impl Into<String>) -> Self {
        Self::Page {
            current_page,
            total_pages,
            status: Some(status.into()),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status(message.into())
    }

    /// Rounded completion percentage, `None` for plain status messages.
    pub fn percent(&self) -> Option<u32> {
        match self {
            Self::Page {
                current_page,
                total_pages,
                ..
            } => {
                if *total_pages == 0 {
                    return Some(0);
                }
                let pct = f64::from(*current_page) / f64::from(*total_pages) * 100.0;
                Some(pct.round() as u32)
            }
            Self::Status(_) => None,
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page {
                status: Some(status),
                ..
            } => f.write_str(status),
            Self::Page {
                current_page,
                total_pages,
                status: None,
            } => write!(f, "Processing page {current_page} of {total_pages}"),
            Self::Status(message) => f.write_str(message),
        }
    }
}

/// Receives progress events from a run.
///
/// Called from the run's task, so implementations should return quickly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn report(&self, _event: ProgressEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Page {
                current_page,
                total_pages,
                ..
            } => info!(
                current_page,
                total_pages,
                percent = event.percent().unwrap_or(0),
                "{event}"
            ),
            ProgressEvent::Status(_) => info!("{event}"),
        }
    }
}
