use thiserror::Error;

/// Transport and storage errors shared by every NewsViews crate.
///
/// Clients and repositories return this type; the sync engine wraps it into
/// [`SyncError`] to decide whether a failure is pass-scoped or row-scoped.
///
/// `sqlx::Error`, `serde_json::Error` and `std::io::Error` convert with `?`.
///
/// ```no_run
/// use newsviews_core::error::AppError;
///
/// fn lookup(id: &str) -> Result<(), AppError> {
///     Err(AppError::SubmissionNotFound(id.to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Storage query failed: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Request could not be sent or its response read.
    #[error("HTTP request failed: {0}")]
    ClientError(String),

    /// Google Sheets API returned an error payload.
    ///
    /// Carries the message from the API so `user_message()` can tell
    /// authentication problems apart from quota problems.
    #[error("Sheets error: {0}")]
    SheetsError(String),

    #[error("Malformed JSON: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Not a valid URL: {0}")]
    InvalidUrl(String),

    /// Submission not found in storage.
    #[error("Submission not found: {0}")]
    SubmissionNotFound(String),

    /// Spreadsheet id or range could not be used to build a request.
    #[error("Invalid spreadsheet reference: {0}")]
    InvalidSpreadsheet(String),

    /// The moderation service answered without any choice text.
    #[error("Service returned an empty answer")]
    EmptyResponse,

    #[error("Connection failed: {0}")]
    NetworkError(String),

    #[error("No answer within {0}s")]
    Timeout(u64),

    /// HTTP 429 after all retries.
    #[error("Quota exhausted (HTTP 429)")]
    RateLimitExceeded,

    /// Filesystem error while handling image artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Operator-facing text for the CLI, with a hint where one helps.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => {
                "PostgreSQL is unreachable.\n   Check DATABASE_URL and that the server is up."
                    .to_string()
            }
            AppError::ClientError(msg) if msg.contains("connect") => format!(
                "Could not reach the service: {}\n   Check network access to the API host.",
                msg
            ),
            AppError::SheetsError(msg) => {
                if msg.contains("401") || msg.contains("UNAUTHENTICATED") {
                    "Google Sheets rejected the credentials.\n   Check GOOGLE_SHEETS_TOKEN or GOOGLE_API_KEY."
                        .to_string()
                } else if msg.contains("403") || msg.contains("PERMISSION_DENIED") {
                    "The spreadsheet is not shared with these credentials.".to_string()
                } else if msg.contains("404") {
                    "Spreadsheet or sheet not found.\n   Check sheet.spreadsheet_id and sheet.sheet_name."
                        .to_string()
                } else {
                    format!("Sheets error: {}", msg)
                }
            }
            AppError::InvalidSpreadsheet(reference) => {
                format!(
                    "Invalid spreadsheet reference: {}\n   Example: spreadsheet_id = \"1AbC...xyz\"",
                    reference
                )
            }
            AppError::NetworkError(msg) => format!(
                "Could not reach the service: {}\n   Check network access to the API host.",
                msg
            ),
            AppError::Timeout(secs) => format!(
                "No answer within {}s.\n   Raise http.timeout_secs or retry the pass later.",
                secs
            ),
            AppError::RateLimitExceeded => {
                "Google quota exhausted.\n   Lengthen sync.interval_secs or wait a minute.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Transient failures that a later pass may not hit again.
    ///
    /// ```
    /// use newsviews_core::error::AppError;
    ///
    /// assert!(AppError::NetworkError("connection reset".to_string()).is_retryable());
    /// assert!(AppError::RateLimitExceeded.is_retryable());
    /// assert!(!AppError::SubmissionNotFound("abc".to_string()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ClientError(_)
        )
    }
}

/// A raw source row could not be mapped onto a submission.
///
/// Row-scoped: the engine skips the row and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("row has {found} columns, at least {required} are required")]
    TooFewColumns { found: usize, required: usize },
}

/// Failures surfaced by a sync pass or a direct submission.
///
/// Only [`SyncError::Fetch`] and [`SyncError::Storage`] abort a pass, and both
/// happen before the first mutation. [`SyncError::Stopped`] means no pass was
/// attempted. The other variants are reported per row or per commit step.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The external source could not be reached. Nothing was mutated.
    #[error("failed to fetch from source: {0}")]
    Fetch(#[source] AppError),

    /// Storage could not be read before the pass started. Nothing was mutated.
    #[error("storage unavailable: {0}")]
    Storage(#[source] AppError),

    /// A single submission could not be written.
    #[error("failed to persist submission {id}: {source}")]
    Persistence {
        id: String,
        #[source]
        source: AppError,
    },

    /// The advanced cursor could not be written.
    #[error("failed to persist sync cursor: {0}")]
    CursorPersistence(#[source] AppError),

    /// The scheduler was stopped, so no pass was started.
    #[error("scheduler is stopped")]
    Stopped,
}

impl SyncError {
    /// Returns true if retrying the whole pass is expected to help.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fetch(e) | SyncError::Storage(e) => e.is_retryable(),
            SyncError::Persistence { .. } | SyncError::CursorPersistence(_) => true,
            SyncError::Stopped => false,
        }
    }
}
