//! Sync pass bookkeeping: per-row outcomes, pass statistics and the
//! high-water mark.
//!
//! Pure logic, decoupled from the I/O the engine performs.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capabilities::SourceIndex;
use crate::models::{SubmissionStatus, SyncCursor};
use crate::normalize::ColumnMap;

/// Outcome of processing a single source row during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowOutcome {
    /// Stored as approved.
    Approved,
    /// Stored as rejected.
    Rejected,
    /// Stored with `status = duplicate`.
    Duplicate,
    /// Id already in storage, nothing written.
    AlreadyPresent,
    /// Older than the cursor while storage was non-empty.
    Stale,
    /// Could not be normalized.
    Malformed,
    /// Persisting the row failed.
    Failed,
}

impl RowOutcome {
    pub fn from_status(status: SubmissionStatus) -> Self {
        match status {
            SubmissionStatus::Approved => RowOutcome::Approved,
            SubmissionStatus::Duplicate => RowOutcome::Duplicate,
            SubmissionStatus::Rejected | SubmissionStatus::Pending => RowOutcome::Rejected,
        }
    }

    /// True when the row was written to storage.
    pub fn is_addition(&self) -> bool {
        matches!(
            self,
            RowOutcome::Approved | RowOutcome::Rejected | RowOutcome::Duplicate
        )
    }
}

/// Per-pass counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub approved: usize,
    pub rejected: usize,
    pub duplicate: usize,
    pub already_present: usize,
    pub stale: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Approved => self.approved += 1,
            RowOutcome::Rejected => self.rejected += 1,
            RowOutcome::Duplicate => self.duplicate += 1,
            RowOutcome::AlreadyPresent => self.already_present += 1,
            RowOutcome::Stale => self.stale += 1,
            RowOutcome::Malformed => self.malformed += 1,
            RowOutcome::Failed => self.failed += 1,
        }
    }

    /// Rows written to storage, whatever their status.
    pub fn added(&self) -> usize {
        self.approved + self.rejected + self.duplicate
    }

    /// Rows passed over without writing.
    pub fn skipped(&self) -> usize {
        self.already_present + self.stale + self.malformed
    }

    /// Returns the total number of rows seen.
    pub fn total(&self) -> usize {
        self.added() + self.skipped() + self.failed
    }
}

/// Report of one completed pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub stats: SyncStats,
    pub deleted: u64,
    /// Row-scoped and commit-step error messages.
    pub errors: Vec<String>,
    /// The pass stopped early on cancellation; nothing after the last row
    /// processed was applied.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cursor: SyncCursor,
}

impl SyncSummary {
    pub fn added(&self) -> usize {
        self.stats.added()
    }

    pub fn skipped(&self) -> usize {
        self.stats.skipped()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

/// Staleness rule for a row that is not yet stored.
///
/// A row older than the cursor time is stale, except when storage was empty
/// at pass start, so an initial bulk import is never filtered.
pub fn is_stale(
    created_at: DateTime<Utc>,
    cursor: &SyncCursor,
    storage_was_empty: bool,
) -> bool {
    !storage_was_empty && created_at < cursor.last_processed_time
}

/// Where a pass should start reading, given where the sheet rows are now.
///
/// Deleting sheet rows moves every later row up. When the cursor's last row
/// now sits higher, reading resumes right after its new position; when it is
/// gone, or sits lower than recorded, reading restarts from the top. Rows read
/// again are already stored and skipped by id.
pub fn resume_cursor(cursor: &SyncCursor, index: &SourceIndex) -> SyncCursor {
    let Some(anchor) = cursor.last_row_id.as_deref() else {
        return cursor.clone();
    };

    match index.row_of(anchor) {
        Some(row) if row == cursor.last_processed_row => cursor.clone(),
        Some(row) if row < cursor.last_processed_row => SyncCursor {
            last_processed_row: row,
            ..cursor.clone()
        },
        _ => SyncCursor {
            last_processed_row: 0,
            last_row_id: None,
            ..cursor.clone()
        },
    }
}

/// In-memory high-water mark advanced row by row during a pass.
///
/// Freezes at the first row that fails to persist so that row is fetched
/// again, and not judged stale, on the next pass. Only timestamps read from
/// the row itself move the time mark.
#[derive(Debug, Clone)]
pub struct HighWater {
    row: u64,
    time: DateTime<Utc>,
    anchor: Option<String>,
    frozen: bool,
}

impl HighWater {
    pub fn from_cursor(cursor: &SyncCursor) -> Self {
        Self {
            row: cursor.last_processed_row,
            time: cursor.last_processed_time,
            anchor: cursor.last_row_id.clone(),
            frozen: false,
        }
    }

    /// Moves past `row`. The time mark only ever moves forward. `anchor` is
    /// the row's id, `None` for the header and blank rows.
    pub fn advance(
        &mut self,
        row: u64,
        anchor: Option<String>,
        parsed_time: Option<DateTime<Utc>>,
    ) {
        if self.frozen || row < self.row {
            return;
        }
        self.row = row;
        if anchor.is_some() {
            self.anchor = anchor;
        }
        if let Some(ts) = parsed_time {
            self.time = self.time.max(ts);
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn row(&self) -> u64 {
        self.row
    }

    /// Cursor to persist once the pass completes.
    pub fn to_cursor(&self, columns: Option<ColumnMap>) -> SyncCursor {
        SyncCursor {
            last_processed_row: self.row,
            last_processed_time: self.time,
            columns,
            last_row_id: self.anchor.clone(),
        }
    }
}
