//! Reconciliation engine.
//!
//! One [`SyncEngine`] owns the sync cursor and the pass lock for a source. A
//! pass first snapshots the ids in the source and moves the cursor back to
//! the row now holding the last processed id, or to the top when that id is
//! gone. It then fetches the rows after the cursor, runs each through the normalizer
//! and the content gate in source order, stores the result, deletes stored
//! sheet records that disappeared from the source and finally persists the
//! advanced cursor.
//!
//! Only one pass runs at a time. A pass requested while another is in flight
//! returns [`PassOutcome::AlreadyRunning`] without touching anything. Direct
//! submissions share the same lock but wait for it instead.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capabilities::{
    CursorStore, ImageStore, ModerationService, SourceIndex, SourceRow, SpreadsheetSource,
    Storage,
};
use crate::config::SyncConfig;
use crate::duplicate::{CorpusEntry, DuplicateDetector};
use crate::error::{AppError, SyncError};
use crate::gate::{ContentGate, GateDecision};
use crate::models::{Origin, Submission, SubmissionDraft, SyncCursor};
use crate::normalize::{is_blank_row, normalize, row_id, row_timestamp, ColumnMap};
use crate::sync::{is_stale, resume_cursor, HighWater, RowOutcome, SyncStats, SyncSummary};

/// Result of asking for a pass.
#[derive(Debug, Clone)]
pub enum PassOutcome {
    Completed(SyncSummary),
    /// Another pass held the lock; nothing was done.
    AlreadyRunning,
}

impl PassOutcome {
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            PassOutcome::Completed(summary) => Some(summary),
            PassOutcome::AlreadyRunning => None,
        }
    }
}

/// Keeps storage consistent with one spreadsheet source.
pub struct SyncEngine {
    source: Arc<dyn SpreadsheetSource>,
    storage: Arc<dyn Storage>,
    cursors: Arc<dyn CursorStore>,
    images: Option<Arc<dyn ImageStore>>,
    gate: ContentGate,
    config: SyncConfig,
    cursor: RwLock<SyncCursor>,
    pass_lock: Mutex<()>,
}

impl SyncEngine {
    /// Creates an engine without image moderation or image cleanup.
    pub fn new(
        source: Arc<dyn SpreadsheetSource>,
        storage: Arc<dyn Storage>,
        cursors: Arc<dyn CursorStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            storage,
            cursors,
            images: None,
            gate: build_gate(&config, None),
            config,
            cursor: RwLock::new(SyncCursor::default()),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_moderation(mut self, service: Arc<dyn ModerationService>) -> Self {
        self.gate = build_gate(&self.config, Some(service));
        self
    }

    pub fn with_image_store(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Restores the persisted cursor. Call once before the first pass.
    pub async fn load(&self) -> Result<SyncCursor, AppError> {
        let stored = self.cursors.load_cursor(&self.config.source_name).await?;
        let cursor = stored.unwrap_or_default();
        info!(
            source = %self.config.source_name,
            row = cursor.last_processed_row,
            time = %cursor.last_processed_time,
            "Loaded sync cursor"
        );
        *self.cursor.write().await = cursor.clone();
        Ok(cursor)
    }

    pub async fn cursor(&self) -> SyncCursor {
        self.cursor.read().await.clone()
    }

    /// True while a pass or a direct submission holds the lock.
    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Resets the cursor to its initial state, waiting for any running pass.
    pub async fn reset_cursor(&self) -> Result<(), AppError> {
        let _guard = self.pass_lock.lock().await;
        let cursor = SyncCursor::default();
        self.cursors
            .save_cursor(&self.config.source_name, &cursor)
            .await?;
        *self.cursor.write().await = cursor;
        warn!(source = %self.config.source_name, "Sync cursor reset");
        Ok(())
    }

    /// Runs one reconciliation pass.
    ///
    /// Returns an error only when the source or storage cannot be read before
    /// the first mutation. Row failures are counted in the summary.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassOutcome, SyncError> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            info!("Sync pass already running, skipping");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let started_at = Utc::now();
        let stored_cursor = self.cursor.read().await.clone();

        let index = self
            .bounded(self.source.list_ids())
            .await
            .map_err(SyncError::Fetch)?;
        let cursor = resume_cursor(&stored_cursor, &index);
        if cursor.last_processed_row != stored_cursor.last_processed_row {
            warn!(
                from = stored_cursor.last_processed_row,
                to = cursor.last_processed_row,
                "Source rows moved, rewinding cursor"
            );
        }
        debug!(row = cursor.last_processed_row, "Starting sync pass");

        let rows = self
            .bounded(self.source.fetch_rows(cursor.last_processed_row))
            .await
            .map_err(SyncError::Fetch)?;

        let stored_count = self.storage.count().await.map_err(SyncError::Storage)?;
        let mut corpus = self
            .storage
            .accepted_corpus()
            .await
            .map_err(SyncError::Storage)?;
        let storage_was_empty = stored_count == 0;

        let mut mark = HighWater::from_cursor(&cursor);
        let mut columns = cursor.columns.clone();
        let mut data_rows = rows.as_slice();

        if cursor.is_initial() && self.config.has_header_row {
            if let Some((header, rest)) = rows.split_first() {
                let map = ColumnMap::from_headers(&header.cells);
                debug!(columns = ?map, "Built column map from header row");
                columns = Some(map);
                mark.advance(header.index, None, None);
                data_rows = rest;
            }
        }

        let mut stats = SyncStats::new();
        let mut errors = Vec::new();
        let mut cancelled = false;

        for row in data_rows {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            match self
                .process_row(
                    row,
                    columns.as_ref(),
                    &cursor,
                    storage_was_empty,
                    &mut corpus,
                )
                .await
            {
                Ok(outcome) => {
                    stats.record(outcome);
                    let anchor = (!is_blank_row(&row.cells))
                        .then(|| row_id(&row.cells, columns.as_ref()));
                    mark.advance(
                        row.index,
                        anchor,
                        row_timestamp(&row.cells, columns.as_ref()),
                    );
                }
                Err(e) => {
                    error!(row = row.index, error = %e, "Row failed");
                    stats.record(RowOutcome::Failed);
                    errors.push(e.to_string());
                    mark.freeze();
                }
            }
        }

        cancelled = cancelled || cancel.is_cancelled();

        let mut deleted = 0;
        if cancelled {
            warn!("Sync pass cancelled, skipping deletions and cursor update");
        } else {
            match self.delete_vanished(&index).await {
                Ok(n) => deleted = n,
                Err(e) => {
                    error!(error = %e, "Deletion reconciliation failed");
                    errors.push(format!("deletion failed: {}", e));
                }
            }

            let advanced = mark.to_cursor(columns);
            if advanced != stored_cursor {
                match self
                    .cursors
                    .save_cursor(&self.config.source_name, &advanced)
                    .await
                {
                    Ok(()) => *self.cursor.write().await = advanced,
                    Err(e) => {
                        let e = SyncError::CursorPersistence(e);
                        error!(error = %e, "Cursor not advanced");
                        errors.push(e.to_string());
                    }
                }
            }
        }

        let summary = SyncSummary {
            stats,
            deleted,
            errors,
            cancelled,
            started_at,
            finished_at: Utc::now(),
            cursor: self.cursor.read().await.clone(),
        };

        info!(
            added = summary.added(),
            skipped = summary.skipped(),
            deleted = summary.deleted,
            errors = summary.error_count(),
            cursor_row = summary.cursor.last_processed_row,
            "Sync pass complete"
        );

        Ok(PassOutcome::Completed(summary))
    }

    /// Evaluates and stores a directly received submission.
    ///
    /// Waits for a running pass instead of coalescing, so the corpus it is
    /// checked against is never half-updated.
    pub async fn submit_direct(&self, draft: SubmissionDraft) -> Result<Submission, SyncError> {
        let _guard = self.pass_lock.lock().await;

        let corpus = self
            .storage
            .accepted_corpus()
            .await
            .map_err(SyncError::Storage)?;

        let mut submission = draft.into_submission(Uuid::new_v4().to_string(), Utc::now());
        let decision = self.gate.evaluate(&submission, &corpus).await;
        decision.apply(&mut submission);

        self.storage
            .insert(&submission)
            .await
            .map_err(|source| SyncError::Persistence {
                id: submission.id.clone(),
                source,
            })?;

        info!(
            id = %submission.id,
            status = %submission.status,
            origin = %Origin::Direct,
            "Direct submission stored"
        );

        if decision.release_image() {
            self.release_image(&submission).await;
        }

        Ok(submission)
    }

    async fn process_row(
        &self,
        row: &SourceRow,
        columns: Option<&ColumnMap>,
        cursor: &SyncCursor,
        storage_was_empty: bool,
        corpus: &mut Vec<CorpusEntry>,
    ) -> Result<RowOutcome, SyncError> {
        let mut submission = match normalize(&row.cells, columns) {
            Ok(submission) => submission,
            Err(e) => {
                warn!(row = row.index, error = %e, "Skipping malformed row");
                return Ok(RowOutcome::Malformed);
            }
        };
        submission.source_row = Some(row.index);

        let exists = self
            .storage
            .exists(&submission.id)
            .await
            .map_err(|source| SyncError::Persistence {
                id: submission.id.clone(),
                source,
            })?;
        if exists {
            debug!(row = row.index, id = %submission.id, "Already stored, skipping");
            return Ok(RowOutcome::AlreadyPresent);
        }

        if is_stale(submission.created_at, cursor, storage_was_empty) {
            info!(
                row = row.index,
                id = %submission.id,
                created_at = %submission.created_at,
                "Skipping stale row"
            );
            return Ok(RowOutcome::Stale);
        }

        let decision = self.gate.evaluate(&submission, corpus).await;
        decision.apply(&mut submission);

        let inserted = self
            .storage
            .insert(&submission)
            .await
            .map_err(|source| SyncError::Persistence {
                id: submission.id.clone(),
                source,
            })?;
        if !inserted {
            return Ok(RowOutcome::AlreadyPresent);
        }

        info!(
            row = row.index,
            id = %submission.id,
            status = %submission.status,
            duplicate_of = submission.duplicate_of.as_deref().unwrap_or(""),
            "Row stored"
        );

        if decision.is_approved() {
            corpus.push(CorpusEntry::new(
                submission.id.clone(),
                submission.comparison_text(),
            ));
        } else {
            self.annotate(row.index, &decision).await;
            if decision.release_image() {
                self.release_image(&submission).await;
            }
        }

        Ok(RowOutcome::from_status(submission.status))
    }

    /// Deletes stored sheet records whose ids the source no longer lists.
    async fn delete_vanished(&self, index: &SourceIndex) -> Result<u64, AppError> {
        let stored = self.storage.list_ids(Some(Origin::Sheet)).await?;
        let vanished: HashSet<String> = stored
            .into_iter()
            .filter(|id| !index.contains(id))
            .collect();
        if vanished.is_empty() {
            return Ok(0);
        }

        let deleted = self.storage.delete(&vanished).await?;
        info!(deleted, "Removed submissions no longer in the source");
        Ok(deleted)
    }

    async fn annotate(&self, row: u64, decision: &GateDecision) {
        let Some(marker) = decision.marker() else {
            return;
        };
        if let Err(e) = self.bounded(self.source.annotate_row(row, marker)).await {
            warn!(row, marker = marker.label(), error = %e, "Failed to annotate source row");
        }
    }

    async fn release_image(&self, submission: &Submission) {
        let (Some(images), Some(image)) = (&self.images, &submission.image_reference) else {
            return;
        };
        if let Err(e) = images.release(image).await {
            warn!(id = %submission.id, image = %image, error = %e, "Failed to release image");
        }
    }

    /// Bounds an external call by the configured timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        let limit = self.config.external_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(limit.as_secs())),
        }
    }
}

fn build_gate(config: &SyncConfig, moderation: Option<Arc<dyn ModerationService>>) -> ContentGate {
    ContentGate::new(
        DuplicateDetector::new(config.duplicate_threshold),
        moderation,
        config.external_timeout(),
        config.min_description_length,
        config.duplicate_policy,
    )
}
