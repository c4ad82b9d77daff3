//! Domain types shared by the engine, the clients and the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::normalize::ColumnMap;

/// Lifecycle status of a submission.
///
/// `Pending` is the only non-terminal state. Terminal submissions are never
/// re-evaluated by later sync passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
    Duplicate,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Duplicate => "duplicate",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SubmissionStatus::Pending),
            "approved" => Ok(SubmissionStatus::Approved),
            "rejected" => Ok(SubmissionStatus::Rejected),
            "duplicate" => Ok(SubmissionStatus::Duplicate),
            other => Err(format!("unknown submission status: {}", other)),
        }
    }
}

/// Where a submission entered the system.
///
/// Only `Sheet` records take part in delete reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Sheet,
    Direct,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Sheet => "sheet",
            Origin::Direct => "direct",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sheet" => Ok(Origin::Sheet),
            "direct" => Ok(Origin::Direct),
            other => Err(format!("unknown origin: {}", other)),
        }
    }
}

/// Canonical news submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub title: String,
    pub description: String,
    pub city: String,
    pub category: String,
    pub publisher_name: String,
    pub publisher_phone: String,
    pub image_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    /// Back-reference to the accepted submission this one matched.
    pub duplicate_of: Option<String>,
    pub origin: Origin,
    pub duplicate_score: Option<f64>,
    pub validation_errors: Vec<String>,
    pub moderation_reason: Option<String>,
    /// 1-based sheet row the record was read from.
    pub source_row: Option<u64>,
}

impl Submission {
    /// Text unit used for duplicate comparison.
    pub fn comparison_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

/// Fields of a submission received directly, before an id is assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionDraft {
    pub title: String,
    pub description: String,
    pub city: String,
    pub category: String,
    pub publisher_name: String,
    pub publisher_phone: String,
    pub image_reference: Option<String>,
}

impl SubmissionDraft {
    pub fn into_submission(self, id: String, created_at: DateTime<Utc>) -> Submission {
        Submission {
            id,
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            city: self.city.trim().to_string(),
            category: self.category.trim().to_string(),
            publisher_name: self.publisher_name.trim().to_string(),
            publisher_phone: self.publisher_phone.trim().to_string(),
            image_reference: self
                .image_reference
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            created_at,
            status: SubmissionStatus::Pending,
            duplicate_of: None,
            origin: Origin::Direct,
            duplicate_score: None,
            validation_errors: Vec::new(),
            moderation_reason: None,
            source_row: None,
        }
    }
}

/// Optional equality filters for [`crate::capabilities::Storage::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionFilter {
    pub status: Option<SubmissionStatus>,
    pub city: Option<String>,
    pub category: Option<String>,
    pub origin: Option<Origin>,
}

/// Aggregated storage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_submissions: i64,
    pub approved: i64,
    pub rejected: i64,
    pub duplicate: i64,
    pub pending: i64,
    pub from_sheet: i64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Persisted high-water marks of sync progress for one source.
///
/// `columns` holds the header map learned on the first pass so later passes,
/// which fetch after the header row, keep resolving columns by header.
/// `last_row_id` is the id of the last non-blank data row passed; when rows
/// above it are deleted from the sheet it shows where that row moved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_processed_row: u64,
    pub last_processed_time: DateTime<Utc>,
    #[serde(default)]
    pub columns: Option<ColumnMap>,
    #[serde(default)]
    pub last_row_id: Option<String>,
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self {
            last_processed_row: 0,
            last_processed_time: DateTime::<Utc>::UNIX_EPOCH,
            columns: None,
            last_row_id: None,
        }
    }
}

impl SyncCursor {
    /// True until the first pass has consumed any row.
    pub fn is_initial(&self) -> bool {
        self.last_processed_row == 0
    }
}
