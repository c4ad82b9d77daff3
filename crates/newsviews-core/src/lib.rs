//! NewsViews Core - reconciliation engine, content gate, domain types and configuration.
//!
//! The crate has no network or SQL code. External systems are reached through
//! the traits in [`capabilities`]; `newsviews-client` and `newsviews-db`
//! implement them.

pub mod capabilities;
pub mod config;
pub mod duplicate;
pub mod engine;
pub mod error;
pub mod gate;
pub mod models;
pub mod normalize;
pub mod scheduler;
pub mod sync;

pub use capabilities::{
    CursorStore, ImageStore, ModerationService, ModerationVerdict, RowMarker, SourceIndex,
    SourceRow, SpreadsheetSource, Storage,
};
pub use config::{
    default_config_path, load_config, AppConfig, ConfigError, DbConfig, HttpConfig,
    ModerationConfig, SheetConfig, SyncConfig,
};
pub use duplicate::{CorpusEntry, DuplicateDetector, DuplicateResult};
pub use engine::{PassOutcome, SyncEngine};
pub use error::{AppError, NormalizationError, SyncError};
pub use gate::{ContentGate, DuplicatePolicy, GateDecision};
pub use models::{
    DatabaseStats, Origin, Submission, SubmissionDraft, SubmissionFilter, SubmissionStatus,
    SyncCursor,
};
pub use normalize::{normalize, ColumnMap};
pub use scheduler::{next_interval, Scheduler, SchedulerStatus, StopOutcome};
pub use sync::{RowOutcome, SyncStats, SyncSummary};
