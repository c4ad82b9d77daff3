//! NewsViews DB - PostgreSQL storage layer
//!
//! This crate provides the production [`Storage`] and [`CursorStore`]
//! implementations used by the sync engine:
//!
//! - [`repository`] - submissions and sync cursors in PostgreSQL
//!
//! The schema ships as embedded migrations; call [`migrate`] once after
//! connecting.
//!
//! [`Storage`]: newsviews_core::capabilities::Storage
//! [`CursorStore`]: newsviews_core::capabilities::CursorStore

pub mod repository;

pub use repository::SubmissionRepository;

use newsviews_core::error::AppError;
use sqlx::PgPool;

/// Runs the embedded schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))
}
