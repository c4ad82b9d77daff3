//! In-memory capability fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use newsviews_core::capabilities::{
    CursorStore, ImageStore, ModerationService, ModerationVerdict, RowMarker, SourceIndex,
    SourceRow, SpreadsheetSource, Storage,
};
use newsviews_core::duplicate::CorpusEntry;
use newsviews_core::normalize::{is_blank_row, row_id, ColumnMap};
use newsviews_core::{
    AppError, Origin, Submission, SubmissionFilter, SubmissionStatus, SyncConfig, SyncCursor,
    SyncEngine,
};

pub const DESCRIPTION: &str =
    "Heavy overnight rain flooded the central market square and closed six stalls.";

pub fn header() -> Vec<String> {
    strings(&[
        "Timestamp",
        "News Title",
        "News Description",
        "City",
        "Category",
        "Publisher Name",
        "Publisher Phone",
        "Image Upload",
    ])
}

pub fn strings(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

/// A complete, valid form response.
pub fn form_row(timestamp: &str, title: &str, description: &str, phone: &str) -> Vec<String> {
    strings(&[
        timestamp,
        title,
        description,
        "Lagos",
        "Local",
        "Ada Obi",
        phone,
        "",
    ])
}

/// Spreadsheet fake. Row `i` of `rows` is sheet row `i + 1`.
#[derive(Default)]
pub struct FakeSheet {
    rows: Mutex<Vec<Vec<String>>>,
    has_header: bool,
    fail_fetch: AtomicBool,
    fail_list: AtomicBool,
    block_fetch: AtomicBool,
    pub fetch_entered: Notify,
    pub fetch_release: Notify,
    fetch_calls: AtomicUsize,
    annotations: Mutex<Vec<(u64, RowMarker)>>,
}

impl FakeSheet {
    pub fn with_header(rows: Vec<Vec<String>>) -> Arc<Self> {
        let mut all = vec![header()];
        all.extend(rows);
        Arc::new(Self {
            rows: Mutex::new(all),
            has_header: true,
            ..Default::default()
        })
    }

    pub fn headerless(rows: Vec<Vec<String>>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
            has_header: false,
            ..Default::default()
        })
    }

    pub fn push(&self, row: Vec<String>) {
        self.rows.lock().unwrap().push(row);
    }

    /// Removes the sheet row with the given 1-based index.
    pub fn remove(&self, index: u64) {
        self.rows.lock().unwrap().remove(index as usize - 1);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Makes `fetch_rows` wait on `fetch_release` after signalling `fetch_entered`.
    pub fn set_block_fetch(&self, block: bool) {
        self.block_fetch.store(block, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn annotations(&self) -> Vec<(u64, RowMarker)> {
        self.annotations.lock().unwrap().clone()
    }

    fn column_map(&self, rows: &[Vec<String>]) -> Option<ColumnMap> {
        if self.has_header {
            rows.first().map(|h| ColumnMap::from_headers(h))
        } else {
            None
        }
    }
}

#[async_trait]
impl SpreadsheetSource for FakeSheet {
    async fn fetch_rows(&self, after_row: u64) -> Result<Vec<SourceRow>, AppError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.block_fetch.load(Ordering::SeqCst) {
            self.fetch_entered.notify_one();
            self.fetch_release.notified().await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(AppError::NetworkError("connection refused".to_string()));
        }

        let rows = self.rows.lock().unwrap().clone();
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, cells)| SourceRow::new(i as u64 + 1, cells))
            .filter(|row| row.index > after_row)
            .collect())
    }

    async fn list_ids(&self) -> Result<SourceIndex, AppError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(AppError::SheetsError("HTTP 403 PERMISSION_DENIED".to_string()));
        }

        let rows = self.rows.lock().unwrap().clone();
        let columns = self.column_map(&rows);
        let skip = usize::from(self.has_header);
        Ok(rows
            .iter()
            .enumerate()
            .skip(skip)
            .filter(|(_, cells)| !is_blank_row(cells))
            .map(|(i, cells)| (row_id(cells, columns.as_ref()), i as u64 + 1))
            .collect())
    }

    async fn annotate_row(&self, row: u64, marker: RowMarker) -> Result<(), AppError> {
        self.annotations.lock().unwrap().push((row, marker));
        Ok(())
    }
}

/// Storage fake keyed by id.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<BTreeMap<String, Submission>>,
    insert_calls: AtomicUsize,
    fail_titles: Mutex<HashSet<String>>,
    fail_reads: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, submission: Submission) {
        self.records
            .lock()
            .unwrap()
            .insert(submission.id.clone(), submission);
    }

    pub fn get(&self, id: &str) -> Option<Submission> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Submission> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn find_by_title(&self, title: &str) -> Option<Submission> {
        self.all().into_iter().find(|s| s.title == title)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Inserts of a submission with this title fail.
    pub fn fail_inserts_titled(&self, title: &str) {
        self.fail_titles.lock().unwrap().insert(title.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_titles.lock().unwrap().clear();
        self.fail_reads.store(false, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), AppError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(AppError::Generic("storage offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, id: &str) -> Result<bool, AppError> {
        self.check_reads()?;
        Ok(self.records.lock().unwrap().contains_key(id))
    }

    async fn insert(&self, submission: &Submission) -> Result<bool, AppError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_titles.lock().unwrap().contains(&submission.title) {
            return Err(AppError::Generic("disk full".to_string()));
        }

        let mut records = self.records.lock().unwrap();
        if records.contains_key(&submission.id) {
            return Ok(false);
        }
        records.insert(submission.id.clone(), submission.clone());
        Ok(true)
    }

    async fn delete(&self, ids: &HashSet<String>) -> Result<u64, AppError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|id, _| !ids.contains(id));
        Ok((before - records.len()) as u64)
    }

    async fn list_ids(&self, origin: Option<Origin>) -> Result<HashSet<String>, AppError> {
        self.check_reads()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|s| origin.is_none_or(|o| s.origin == o))
            .map(|s| s.id.clone())
            .collect())
    }

    async fn query(
        &self,
        filter: &SubmissionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Submission>, AppError> {
        self.check_reads()?;
        let mut matching: Vec<Submission> = self
            .all()
            .into_iter()
            .filter(|s| filter.status.is_none_or(|st| s.status == st))
            .filter(|s| filter.origin.is_none_or(|o| s.origin == o))
            .filter(|s| filter.city.as_ref().is_none_or(|c| &s.city == c))
            .filter(|s| filter.category.as_ref().is_none_or(|c| &s.category == c))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> Result<u64, AppError> {
        self.check_reads()?;
        Ok(self.records.lock().unwrap().len() as u64)
    }

    async fn accepted_corpus(&self) -> Result<Vec<CorpusEntry>, AppError> {
        self.check_reads()?;
        let mut approved: Vec<Submission> = self
            .all()
            .into_iter()
            .filter(|s| s.status == SubmissionStatus::Approved)
            .collect();
        approved.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(approved
            .iter()
            .map(|s| CorpusEntry::new(s.id.clone(), s.comparison_text()))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, SyncCursor>>,
    fail_save: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, source: &str) -> Option<SyncCursor> {
        self.cursors.lock().unwrap().get(source).cloned()
    }

    pub fn set(&self, source: &str, cursor: SyncCursor) {
        self.cursors
            .lock()
            .unwrap()
            .insert(source.to_string(), cursor);
    }

    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load_cursor(&self, source: &str) -> Result<Option<SyncCursor>, AppError> {
        Ok(self.get(source))
    }

    async fn save_cursor(&self, source: &str, cursor: &SyncCursor) -> Result<(), AppError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(AppError::Generic("cursor table locked".to_string()));
        }
        self.set(source, cursor.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingImages {
    released: Mutex<Vec<String>>,
}

impl RecordingImages {
    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageStore for RecordingImages {
    async fn release(&self, image_reference: &str) -> Result<(), AppError> {
        self.released
            .lock()
            .unwrap()
            .push(image_reference.to_string());
        Ok(())
    }
}

/// Flags every image whose reference contains `needle`.
pub struct KeywordModeration {
    pub needle: String,
}

#[async_trait]
impl ModerationService for KeywordModeration {
    async fn moderate(&self, image_reference: &str) -> ModerationVerdict {
        if image_reference.contains(&self.needle) {
            ModerationVerdict::Inappropriate {
                reason: "explicit content".to_string(),
            }
        } else {
            ModerationVerdict::Appropriate
        }
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        interval_secs: 3600,
        external_timeout_secs: 5,
        join_timeout_secs: 2,
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub sheet: Arc<FakeSheet>,
    pub storage: Arc<MemoryStorage>,
    pub cursors: Arc<MemoryCursorStore>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new(sheet: Arc<FakeSheet>) -> Self {
        Self::with_config(sheet, test_config())
    }

    pub fn with_config(sheet: Arc<FakeSheet>, config: SyncConfig) -> Self {
        Self::with_stores(sheet, MemoryStorage::new(), MemoryCursorStore::new(), config)
    }

    pub fn with_stores(
        sheet: Arc<FakeSheet>,
        storage: Arc<MemoryStorage>,
        cursors: Arc<MemoryCursorStore>,
        config: SyncConfig,
    ) -> Self {
        let engine = Arc::new(SyncEngine::new(
            sheet.clone(),
            storage.clone(),
            cursors.clone(),
            config,
        ));
        Self {
            sheet,
            storage,
            cursors,
            engine,
        }
    }
}

/// Polls `check` every 20ms until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
