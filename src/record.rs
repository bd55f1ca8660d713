//! Records extracted from a reading history page.
//!
//! The JSON field names are camelCase so the exported snapshot can be loaded by existing
//! history viewers without a conversion step.

use serde::{Deserialize, Serialize};

/// One history entry. Either a fully extracted work, or a placeholder when the entry couldn't
/// be read. Both carry the page they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    Work(Box<WorkRecord>),
    Failed(FailedRecord),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Record::Work(work) => &work.id,
            Record::Failed(failed) => &failed.id,
        }
    }

    /// The history page the record was extracted from.
    pub fn page_number(&self) -> u32 {
        match self {
            Record::Work(work) => work.page_number,
            Record::Failed(failed) => failed.page_number,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Record::Failed(_))
    }
}

impl From<WorkRecord> for Record {
    fn from(work: WorkRecord) -> Self {
        Record::Work(Box::new(work))
    }
}

impl From<FailedRecord> for Record {
    fn from(failed: FailedRecord) -> Self {
        Record::Failed(failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub id: String,
    pub page_number: u32,
    pub title: String,
    pub url: Option<String>,
    pub author: String,
    pub author_url: Option<String>,
    pub fandoms: Vec<Link>,
    pub rating: String,
    pub warning: String,
    pub category: String,
    pub completion: String,
    pub summary: String,
    pub tags: Tags,
    pub stats: Stats,
    pub user_stats: UserStats,
    pub series: Option<Series>,
}

/// A named link, used for fandoms and tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub url: Option<String>,
}

/// Tags partitioned by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    pub warnings: Vec<Link>,
    pub relationships: Vec<Link>,
    pub characters: Vec<Link>,
    pub freeforms: Vec<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub word_count: u64,
    /// Kept as text, e.g. `3/10` or `1/?`.
    pub chapters: String,
    pub kudos: u64,
    pub comments: u64,
    pub bookmarks: u64,
    pub hits: u64,
    pub language: String,
    pub publish_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub last_visited: String,
    pub visits: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub url: Option<String>,
    pub part: String,
}

/// Placeholder for an entry whose extraction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    pub id: String,
    pub page_number: u32,
    pub error: String,
    pub error_details: String,
}

impl FailedRecord {
    pub fn new(id: impl Into<String>, page_number: u32, details: impl ToString) -> Self {
        Self {
            id: id.into(),
            page_number,
            error: "Failed to extract complete data".to_string(),
            error_details: details.to_string(),
        }
    }
}
