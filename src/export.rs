//! Handing the collected records over: JSON snapshots, files and viewer links.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::info;
use url::Url;

use crate::record::Record;
use crate::Result;

pub const FILE_NAME: &str = "reading_history.json";
pub const PARTIAL_FILE_NAME: &str = "reading_history_partial.json";

/// The records of a run at the moment it stopped.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub records: &'a [Record],
    /// True unless the run went through every page.
    pub is_partial: bool,
}

impl<'a> Snapshot<'a> {
    pub fn new(records: &'a [Record], is_partial: bool) -> Self {
        Self {
            records,
            is_partial,
        }
    }

    /// Pretty-printed JSON array of the records.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self.records)?)
    }

    pub fn file_name(&self) -> &'static str {
        if self.is_partial {
            PARTIAL_FILE_NAME
        } else {
            FILE_NAME
        }
    }

    /// The same JSON document, base64 encoded into the `data` query parameter of `viewer`.
    pub fn viewer_url(&self, viewer: &Url) -> Result<Url> {
        let encoded = STANDARD.encode(self.to_json()?);
        let mut url = viewer.clone();
        url.query_pairs_mut().append_pair("data", &encoded);
        Ok(url)
    }
}

/// Receives the records when a run completes, is cancelled with data, pauses or fails.
pub trait OutputSink: Send + Sync {
    fn deliver(&self, snapshot: &Snapshot<'_>) -> Result<()>;
}

/// Writes each snapshot into a directory, overwriting the previous file of the same kind.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
    viewer: Option<Url>,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            viewer: None,
        }
    }

    /// Also log a viewer link for every snapshot.
    pub fn with_viewer(mut self, viewer: Url) -> Self {
        self.viewer = Some(viewer);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl OutputSink for JsonFileSink {
    fn deliver(&self, snapshot: &Snapshot<'_>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(snapshot.file_name());
        std::fs::write(&path, snapshot.to_json()?)?;
        info!(
            path = %path.display(),
            records = snapshot.records.len(),
            partial = snapshot.is_partial,
            "Wrote history snapshot"
        );

        if let Some(viewer) = &self.viewer {
            let url = snapshot.viewer_url(viewer)?;
            info!(%url, "Open the snapshot in the viewer");
        }
        Ok(())
    }
}
