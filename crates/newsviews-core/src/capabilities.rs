//! Capability traits the engine consumes.
//!
//! The engine never talks to a spreadsheet, a database or a moderation API
//! directly. `newsviews-client` and `newsviews-db` provide the production
//! implementations; tests use in-memory fakes.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;

use crate::duplicate::CorpusEntry;
use crate::error::AppError;
use crate::models::{Origin, Submission, SubmissionFilter, SyncCursor};

/// A raw row read from the external source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    /// 1-based row number in the sheet (the header row is row 1).
    pub index: u64,
    pub cells: Vec<String>,
}

impl SourceRow {
    pub fn new(index: u64, cells: Vec<String>) -> Self {
        Self { index, cells }
    }
}

/// Ids of the data rows currently in the source, each with the sheet row it
/// sits on. An id that appears on several rows keeps the highest row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceIndex {
    rows: HashMap<String, u64>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: String, row: u64) {
        let entry = self.rows.entry(id).or_insert(row);
        *entry = (*entry).max(row);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Current sheet row of `id`.
    pub fn row_of(&self, id: &str) -> Option<u64> {
        self.rows.get(id).copied()
    }

    pub fn ids(&self) -> HashSet<String> {
        self.rows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FromIterator<(String, u64)> for SourceIndex {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut index = SourceIndex::new();
        for (id, row) in iter {
            index.insert(id, row);
        }
        index
    }
}

/// Visual tag written back to a rejected source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RowMarker {
    Invalid,
    Duplicate,
    Inappropriate,
}

impl RowMarker {
    pub fn label(&self) -> &'static str {
        match self {
            RowMarker::Invalid => "INVALID SUBMISSION",
            RowMarker::Duplicate => "DUPLICATE",
            RowMarker::Inappropriate => "INAPPROPRIATE CONTENT",
        }
    }
}

/// External mutable source of submissions (the Google Form response sheet).
#[async_trait]
pub trait SpreadsheetSource: Send + Sync {
    /// Returns every row after `after_row`, in source order.
    async fn fetch_rows(&self, after_row: u64) -> Result<Vec<SourceRow>, AppError>;

    /// Returns the id and current row of every non-blank data row in the
    /// source, with ids derived the same way the normalizer derives them.
    async fn list_ids(&self) -> Result<SourceIndex, AppError>;

    /// Best-effort feedback on the source. The default does nothing.
    async fn annotate_row(&self, _row: u64, _marker: RowMarker) -> Result<(), AppError> {
        Ok(())
    }
}

/// Authoritative submission store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, AppError>;

    /// Inserts a submission. Returns `false` without writing when the id is
    /// already stored.
    async fn insert(&self, submission: &Submission) -> Result<bool, AppError>;

    /// Deletes the given ids in one transaction and returns the number removed.
    async fn delete(&self, ids: &HashSet<String>) -> Result<u64, AppError>;

    async fn list_ids(&self, origin: Option<Origin>) -> Result<HashSet<String>, AppError>;

    /// Newest first.
    async fn query(
        &self,
        filter: &SubmissionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Submission>, AppError>;

    async fn count(&self) -> Result<u64, AppError>;

    /// Approved submissions as duplicate-detection corpus, oldest first.
    async fn accepted_corpus(&self) -> Result<Vec<CorpusEntry>, AppError>;
}

/// Durable home of the sync cursor, keyed by source name.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, source: &str) -> Result<Option<SyncCursor>, AppError>;
    async fn save_cursor(&self, source: &str, cursor: &SyncCursor) -> Result<(), AppError>;
}

/// Tri-state verdict of an image moderation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ModerationVerdict {
    Appropriate,
    Inappropriate { reason: String },
    /// The service could not answer. Treated as a soft pass.
    Unavailable { reason: String },
}

impl ModerationVerdict {
    pub fn passes(&self) -> bool {
        !matches!(self, ModerationVerdict::Inappropriate { .. })
    }
}

#[async_trait]
pub trait ModerationService: Send + Sync {
    /// Never fails: service problems come back as [`ModerationVerdict::Unavailable`].
    async fn moderate(&self, image_reference: &str) -> ModerationVerdict;
}

/// Owner of image artifacts; rejected submissions hand their image back here.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn release(&self, image_reference: &str) -> Result<(), AppError>;
}
