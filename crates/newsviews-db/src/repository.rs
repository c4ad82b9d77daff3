//! Submission and cursor repository for PostgreSQL.
//!
//! # Testing
//!
//! Row mapping is unit tested here. The SQL paths are covered by the
//! `scenario_repository` integration tests, which need a live database and
//! are ignored unless run with `DATABASE_URL` set.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsviews_core::capabilities::{CursorStore, Storage};
use newsviews_core::duplicate::CorpusEntry;
use newsviews_core::error::AppError;
use newsviews_core::models::{
    DatabaseStats, Origin, Submission, SubmissionFilter, SubmissionStatus, SyncCursor,
};
use newsviews_core::normalize::ColumnMap;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};
use tracing::{debug, instrument};

/// Column list for SELECT queries. Must remain a const literal to ensure SQL safety
/// since format!() bypasses sqlx compile-time validation.
const SUBMISSION_COLUMNS: &str = "id, title, description, city, category, publisher_name, publisher_phone, image_reference, created_at, status, duplicate_of, origin, duplicate_score, validation_errors, moderation_reason, source_row";

/// Repository for submissions and sync cursors in PostgreSQL.
///
/// Implements both [`Storage`] and [`CursorStore`], so one pool backs the
/// whole engine.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use newsviews_db::SubmissionRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/newsviews")
///     .await?;
///
/// let repo = SubmissionRepository::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SubmissionRepository {
    pool: Pool<Postgres>,
}

impl SubmissionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Retrieves a submission by id.
    pub async fn get(&self, id: &str) -> Result<Option<Submission>, AppError> {
        let query = format!("SELECT {} FROM submissions WHERE id = $1", SUBMISSION_COLUMNS);
        let row = sqlx::query_as::<_, SubmissionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        row.map(Submission::try_from).transpose()
    }

    /// Returns aggregated database statistics.
    pub async fn get_stats(&self) -> Result<DatabaseStats, AppError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'approved') as approved,
                COUNT(*) FILTER (WHERE status = 'rejected') as rejected,
                COUNT(*) FILTER (WHERE status = 'duplicate') as duplicate,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE origin = 'sheet') as from_sheet,
                MAX(stored_at) as last_update
            FROM submissions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(DatabaseStats {
            total_submissions: row.total.unwrap_or(0),
            approved: row.approved.unwrap_or(0),
            rejected: row.rejected.unwrap_or(0),
            duplicate: row.duplicate.unwrap_or(0),
            pending: row.pending.unwrap_or(0),
            from_sheet: row.from_sheet.unwrap_or(0),
            last_update: row.last_update,
        })
    }
}

#[async_trait]
impl Storage for SubmissionRepository {
    #[instrument(skip_all)]
    async fn exists(&self, id: &str) -> Result<bool, AppError> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM submissions WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;
        Ok(found)
    }

    #[instrument(skip_all, fields(id = %submission.id))]
    async fn insert(&self, submission: &Submission) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO submissions (
                id,
                title,
                description,
                city,
                category,
                publisher_name,
                publisher_phone,
                image_reference,
                created_at,
                status,
                duplicate_of,
                origin,
                duplicate_score,
                validation_errors,
                moderation_reason,
                source_row
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&submission.id)
        .bind(&submission.title)
        .bind(&submission.description)
        .bind(&submission.city)
        .bind(&submission.category)
        .bind(&submission.publisher_name)
        .bind(&submission.publisher_phone)
        .bind(&submission.image_reference)
        .bind(submission.created_at)
        .bind(submission.status.as_str())
        .bind(&submission.duplicate_of)
        .bind(submission.origin.as_str())
        .bind(submission.duplicate_score)
        .bind(Json(&submission.validation_errors))
        .bind(&submission.moderation_reason)
        .bind(submission.source_row.map(|row| row as i64))
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip_all, fields(count = ids.len()))]
    async fn delete(&self, ids: &HashSet<String>) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().cloned().collect();

        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        let result = sqlx::query("DELETE FROM submissions WHERE id = ANY($1)")
            .bind(&ids[..])
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        tx.commit().await.map_err(AppError::DatabaseError)?;

        debug!(deleted = result.rows_affected(), "Deleted submissions");
        Ok(result.rows_affected())
    }

    #[instrument(skip_all)]
    async fn list_ids(&self, origin: Option<Origin>) -> Result<HashSet<String>, AppError> {
        let ids: Vec<String> = match origin {
            Some(origin) => {
                sqlx::query_scalar::<_, String>("SELECT id FROM submissions WHERE origin = $1")
                    .bind(origin.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query_scalar::<_, String>("SELECT id FROM submissions")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(AppError::DatabaseError)?;

        Ok(ids.into_iter().collect())
    }

    #[instrument(skip_all)]
    async fn query(
        &self,
        filter: &SubmissionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Submission>, AppError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM submissions WHERE TRUE", SUBMISSION_COLUMNS));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(city) = &filter.city {
            builder.push(" AND LOWER(city) = LOWER(").push_bind(city.clone()).push(")");
        }
        if let Some(category) = &filter.category {
            builder
                .push(" AND LOWER(category) = LOWER(")
                .push_bind(category.clone())
                .push(")");
        }
        if let Some(origin) = filter.origin {
            builder.push(" AND origin = ").push_bind(origin.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = builder
            .build_query_as::<SubmissionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        rows.into_iter().map(Submission::try_from).collect()
    }

    #[instrument(skip_all)]
    async fn count(&self) -> Result<u64, AppError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submissions")
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip_all)]
    async fn accepted_corpus(&self) -> Result<Vec<CorpusEntry>, AppError> {
        let rows: Vec<CorpusRow> = sqlx::query_as(
            r#"
            SELECT id, title, description
            FROM submissions
            WHERE status = 'approved'
            ORDER BY created_at ASC, stored_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|row| CorpusEntry::new(row.id, format!("{} {}", row.title, row.description)))
            .collect())
    }
}

#[async_trait]
impl CursorStore for SubmissionRepository {
    #[instrument(skip_all, fields(source = %source))]
    async fn load_cursor(&self, source: &str) -> Result<Option<SyncCursor>, AppError> {
        let row: Option<CursorRow> = sqlx::query_as(
            r#"
            SELECT last_processed_row, last_processed_time, columns, last_row_id
            FROM sync_cursors
            WHERE source = $1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(row.map(SyncCursor::from))
    }

    #[instrument(skip_all, fields(source = %source, row = cursor.last_processed_row))]
    async fn save_cursor(&self, source: &str, cursor: &SyncCursor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors
                (source, last_processed_row, last_processed_time, columns, last_row_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (source)
            DO UPDATE SET
                last_processed_row = EXCLUDED.last_processed_row,
                last_processed_time = EXCLUDED.last_processed_time,
                columns = EXCLUDED.columns,
                last_row_id = EXCLUDED.last_row_id,
                updated_at = NOW()
            "#,
        )
        .bind(source)
        .bind(cursor.last_processed_row as i64)
        .bind(cursor.last_processed_time)
        .bind(cursor.columns.as_ref().map(Json))
        .bind(cursor.last_row_id.as_deref())
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(())
    }
}

/// Helper struct for deserializing submission rows
#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: String,
    title: String,
    description: String,
    city: String,
    category: String,
    publisher_name: String,
    publisher_phone: String,
    image_reference: Option<String>,
    created_at: DateTime<Utc>,
    status: String,
    duplicate_of: Option<String>,
    origin: String,
    duplicate_score: Option<f64>,
    validation_errors: Json<Vec<String>>,
    moderation_reason: Option<String>,
    source_row: Option<i64>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = AppError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let status: SubmissionStatus = row
            .status
            .parse()
            .map_err(|e| AppError::Generic(format!("submission {}: {}", row.id, e)))?;
        let origin: Origin = row
            .origin
            .parse()
            .map_err(|e| AppError::Generic(format!("submission {}: {}", row.id, e)))?;

        Ok(Submission {
            id: row.id,
            title: row.title,
            description: row.description,
            city: row.city,
            category: row.category,
            publisher_name: row.publisher_name,
            publisher_phone: row.publisher_phone,
            image_reference: row.image_reference,
            created_at: row.created_at,
            status,
            duplicate_of: row.duplicate_of,
            origin,
            duplicate_score: row.duplicate_score,
            validation_errors: row.validation_errors.0,
            moderation_reason: row.moderation_reason,
            source_row: row.source_row.and_then(|r| u64::try_from(r).ok()),
        })
    }
}

/// Helper struct for deserializing the duplicate-detection corpus
#[derive(sqlx::FromRow)]
struct CorpusRow {
    id: String,
    title: String,
    description: String,
}

#[derive(sqlx::FromRow)]
struct CursorRow {
    last_processed_row: i64,
    last_processed_time: DateTime<Utc>,
    columns: Option<Json<ColumnMap>>,
    last_row_id: Option<String>,
}

impl From<CursorRow> for SyncCursor {
    fn from(row: CursorRow) -> Self {
        SyncCursor {
            last_processed_row: row.last_processed_row.max(0) as u64,
            last_processed_time: row.last_processed_time,
            columns: row.columns.map(|c| c.0),
            last_row_id: row.last_row_id,
        }
    }
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    total: Option<i64>,
    approved: Option<i64>,
    rejected: Option<i64>,
    duplicate: Option<i64>,
    pending: Option<i64>,
    from_sheet: Option<i64>,
    last_update: Option<DateTime<Utc>>,
}
