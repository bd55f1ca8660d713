use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use history_scrap::config::ScrapeConfig;
use history_scrap::export::JsonFileSink;
use history_scrap::parse::HistoryPageExtractor;
use history_scrap::process::{ExtractionController, RunOutcome};
use history_scrap::progress::TracingReporter;
use history_scrap::request::HttpPageSource;
use history_scrap::{info_time, Result};

type Controller = ExtractionController<HttpPageSource, HistoryPageExtractor>;

#[derive(Parser, Debug)]
#[command(name = "history-scrap", version, about = "Export a paginated reading history to JSON")]
#[command(after_help = "While running, type `p` + Enter to pause or resume, `c` + Enter or Ctrl-C to cancel.

Examples:
  history-scrap https://archiveofourown.org/users/reader/readings --cookie \"$SESSION\"
  history-scrap https://archiveofourown.org/users/reader/readings -o exports --config slow.json")]
struct Cli {
    /// Any page of the reading history
    #[arg(value_name = "URL")]
    url: String,

    /// Cookie header sent with every request, for listings behind a login
    #[arg(long, env = "HISTORY_SCRAP_COOKIE", hide_env_values = true)]
    cookie: Option<String>,

    /// Directory the JSON snapshots are written to
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Viewer that accepts the snapshot as base64 JSON in its `data` parameter
    #[arg(long, env = "HISTORY_SCRAP_VIEWER")]
    viewer_url: Option<Url>,

    /// JSON file with delays and retry settings
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let start_time = Local::now();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ScrapeConfig::from_json_file(path)?,
        None => ScrapeConfig::default(),
    };
    let source = HttpPageSource::new(&cli.url, cli.cookie.as_deref(), config.request_timeout)?;
    let extractor = HistoryPageExtractor::new()?;
    let mut sink = JsonFileSink::new(&cli.out_dir);
    if let Some(viewer) = cli.viewer_url {
        sink = sink.with_viewer(viewer);
    }

    let controller = ExtractionController::new(
        source,
        extractor,
        Arc::new(TracingReporter),
        Arc::new(sink),
        config,
    );

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    tokio::spawn({
        let controller = controller.clone();
        let outcome_tx = outcome_tx.clone();
        async move {
            if let Some(outcome) = controller.start().await {
                let _ = outcome_tx.send(outcome);
            }
        }
    });
    tokio::spawn(read_commands(controller.clone(), outcome_tx));

    let outcome = loop {
        tokio::select! {
            outcome = outcome_rx.recv() => match outcome {
                Some(RunOutcome::Paused) => {
                    if let Some(run) = controller.parked() {
                        info!(
                            page = run.current_page(),
                            total_pages = run.total_pages(),
                            records = run.records().len(),
                            failed_pages = ?run.failed_pages(),
                            "Paused. Type `p` + Enter to resume or `c` + Enter to cancel."
                        );
                    }
                }
                Some(outcome) => break outcome,
                None => {
                    error!("Extraction stopped without an outcome");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling");
                if let Some(outcome) = controller.cancel().await {
                    break outcome;
                }
            }
        }
    };

    info_time!(start_time, "Full program time, outcome: {}", outcome);
    Ok(())
}

/// Reads pause / cancel commands from stdin and forwards the outcomes of resumed runs.
async fn read_commands(controller: Controller, outcome_tx: mpsc::UnboundedSender<RunOutcome>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Couldn't read from stdin, pause and cancel are unavailable");
                return;
            }
        };

        match line.trim() {
            "p" => {
                if let Some(resumed) = controller.toggle_pause() {
                    let outcome_tx = outcome_tx.clone();
                    tokio::spawn(async move {
                        match resumed.await {
                            Ok(Some(outcome)) => {
                                let _ = outcome_tx.send(outcome);
                            }
                            Ok(None) => {}
                            Err(e) => error!(error = %e, "Resumed extraction panicked"),
                        }
                    });
                }
            }
            "c" => {
                if let Some(outcome) = controller.cancel().await {
                    let _ = outcome_tx.send(outcome);
                }
            }
            "" => {}
            other => warn!(command = other, "Unknown command, use `p` or `c`"),
        }
    }
}
