use std::time::Duration;

use async_trait::async_trait;
use newsviews_core::capabilities::{RowMarker, SourceIndex, SourceRow, SpreadsheetSource};
use newsviews_core::config::{HttpConfig, SheetConfig};
use newsviews_core::error::AppError;
use newsviews_core::normalize::{is_blank_row, row_id, ColumnMap};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

/// Google Sheets v4 API root.
pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/";

/// Credentials accepted by the Sheets values API.
///
/// An API key can only read public sheets; writing row annotations needs an
/// OAuth bearer token.
#[derive(Clone)]
pub enum SheetsAuth {
    Bearer(String),
    ApiKey(String),
}

impl std::fmt::Debug for SheetsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetsAuth::Bearer(_) => f.write_str("Bearer(***)"),
            SheetsAuth::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

/// `ValueRange` as returned by `spreadsheets.values.get`.
///
/// Trailing empty cells and trailing empty rows are omitted by the API, so
/// `values` is absent for an empty range.
#[derive(Deserialize, Debug)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Body of `spreadsheets.values.update`.
#[derive(Serialize)]
struct ValueUpdate {
    values: Vec<Vec<String>>,
}

/// Error envelope shared by Google APIs.
#[derive(Deserialize)]
struct GoogleError {
    error: GoogleErrorDetail,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    message: String,
    #[allow(dead_code)]
    status: Option<String>,
}

/// [`SpreadsheetSource`] backed by the Google Sheets values API.
///
/// # Examples
///
/// ```no_run
/// use newsviews_client::{SheetsAuth, SheetsClient};
/// use newsviews_core::capabilities::SpreadsheetSource;
/// use newsviews_core::config::{HttpConfig, SheetConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sheet = SheetConfig {
///     spreadsheet_id: "1AbC".to_string(),
///     ..SheetConfig::default()
/// };
/// let client = SheetsClient::new(
///     sheet,
///     &HttpConfig::default(),
///     SheetsAuth::ApiKey("key".to_string()),
///     true,
/// )?;
/// let rows = client.fetch_rows(0).await?;
/// println!("{} rows", rows.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SheetsClient {
    client: Client,
    base_url: Url,
    auth: SheetsAuth,
    sheet: SheetConfig,
    has_header_row: bool,
    max_retries: u32,
    retry_base_delay_ms: u64,
    timeout_secs: u64,
}

impl SheetsClient {
    /// Creates a client for the configured spreadsheet.
    ///
    /// `has_header_row` must match the engine's setting so that ids listed
    /// for deletion diffing are derived from the same column layout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidSpreadsheet` if no spreadsheet id is configured.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(
        sheet: SheetConfig,
        http: &HttpConfig,
        auth: SheetsAuth,
        has_header_row: bool,
    ) -> Result<Self, AppError> {
        if sheet.spreadsheet_id.trim().is_empty() {
            return Err(AppError::InvalidSpreadsheet(
                "spreadsheet id is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .user_agent("NewsViews/0.1 (form-sync)")
            .timeout(http.timeout())
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|e| AppError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            auth,
            sheet,
            has_header_row,
            max_retries: http.max_retries.max(1),
            retry_base_delay_ms: http.retry_base_delay_ms,
            timeout_secs: http.timeout_secs,
        })
    }

    /// Points the client at another API root (a proxy or a test server).
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AppError> {
        let mut url =
            Url::parse(base_url).map_err(|_| AppError::InvalidUrl(base_url.to_string()))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base_url = url;
        Ok(self)
    }

    /// A1 range of the whole rows starting at `first_row` (1-based).
    fn rows_range(&self, first_row: u64) -> String {
        format!(
            "{}!A{}:{}",
            quote_sheet_name(&self.sheet.sheet_name),
            first_row,
            self.sheet.last_column
        )
    }

    fn cell_range(&self, column: &str, row: u64) -> String {
        format!("{}!{}{}", quote_sheet_name(&self.sheet.sheet_name), column, row)
    }

    fn marker_column(&self, marker: RowMarker) -> &str {
        match marker {
            RowMarker::Invalid => &self.sheet.invalid_column,
            RowMarker::Duplicate => &self.sheet.duplicate_column,
            RowMarker::Inappropriate => &self.sheet.inappropriate_column,
        }
    }

    fn values_url(&self, range: &str) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["spreadsheets", self.sheet.spreadsheet_id.as_str(), "values", range]);

        if let SheetsAuth::ApiKey(key) = &self.auth {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            SheetsAuth::Bearer(token) => request.bearer_auth(token),
            SheetsAuth::ApiKey(_) => request,
        }
    }

    /// Reads every row from `first_row` (1-based) to the end of the sheet.
    async fn read_rows(&self, first_row: u64) -> Result<Vec<Vec<String>>, AppError> {
        let mut url = self.values_url(&self.rows_range(first_row))?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "FORMATTED_VALUE");

        let resp = self
            .request_with_retry(|| self.authorize(self.client.get(url.clone())))
            .await?;

        let range: ValueRange = resp
            .json()
            .await
            .map_err(|e| AppError::ClientError(format!("Failed to parse response: {}", e)))?;

        Ok(range
            .values
            .into_iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    /// Sends a request with automatic retry on transient failures.
    ///
    /// Retries network errors, timeouts, server errors (5xx) and rate
    /// limiting (429). Other client errors fail immediately with the message
    /// from the Google error payload when one is present.
    async fn request_with_retry<F>(&self, build: F) -> Result<reqwest::Response, AppError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = AppError::Generic("No attempts made".to_string());

        for attempt in 1..=self.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        return Ok(resp);
                    }

                    // 429: exponential backoff
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = AppError::RateLimitExceeded;
                        if attempt < self.max_retries {
                            let delay = Duration::from_millis(
                                self.retry_base_delay_ms * 2_u64.pow(attempt),
                            );
                            sleep(delay).await;
                            continue;
                        }
                        return Err(last_error);
                    }

                    if status.is_server_error() {
                        last_error = AppError::ClientError(format!(
                            "Server error: HTTP {}",
                            status.as_u16()
                        ));
                        if attempt < self.max_retries {
                            let delay =
                                Duration::from_millis(self.retry_base_delay_ms * attempt as u64);
                            sleep(delay).await;
                            continue;
                        }
                        return Err(last_error);
                    }

                    // Other 4xx: the request itself is wrong, fail now
                    let body = resp.text().await.unwrap_or_default();
                    return Err(sheets_error(status, &body));
                }
                Err(e) => {
                    if e.is_timeout() {
                        last_error = AppError::Timeout(self.timeout_secs);
                    } else if e.is_connect() {
                        last_error = AppError::NetworkError(format!("Connection failed: {}", e));
                    } else {
                        last_error = AppError::ClientError(e.to_string());
                    }

                    if attempt < self.max_retries && (e.is_timeout() || e.is_connect()) {
                        let delay =
                            Duration::from_millis(self.retry_base_delay_ms * attempt as u64);
                        sleep(delay).await;
                        continue;
                    }
                    return Err(last_error);
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl SpreadsheetSource for SheetsClient {
    async fn fetch_rows(&self, after_row: u64) -> Result<Vec<SourceRow>, AppError> {
        let first_row = after_row + 1;
        let rows = self.read_rows(first_row).await?;
        debug!(first_row, count = rows.len(), "Fetched sheet rows");

        Ok(rows
            .into_iter()
            .zip(first_row..)
            .map(|(cells, index)| SourceRow::new(index, cells))
            .collect())
    }

    async fn list_ids(&self) -> Result<SourceIndex, AppError> {
        let rows = self.read_rows(1).await?;
        Ok(ids_from_rows(&rows, self.has_header_row))
    }

    async fn annotate_row(&self, row: u64, marker: RowMarker) -> Result<(), AppError> {
        if let SheetsAuth::ApiKey(_) = self.auth {
            return Err(AppError::SheetsError(
                "writing annotations needs an OAuth token".to_string(),
            ));
        }

        let range = self.cell_range(self.marker_column(marker), row);
        let mut url = self.values_url(&range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        let body = ValueUpdate {
            values: vec![vec![marker.label().to_string()]],
        };

        self.request_with_retry(|| self.authorize(self.client.put(url.clone()).json(&body)))
            .await?;
        debug!(row, marker = marker.label(), "Annotated sheet row");
        Ok(())
    }
}

/// Maps the id of every data row to its sheet row, resolving columns from the
/// header row when the sheet has one. `rows` must start at sheet row 1.
/// Blank rows are not submissions and are skipped.
fn ids_from_rows(rows: &[Vec<String>], has_header_row: bool) -> SourceIndex {
    let columns = match rows.first() {
        Some(header) if has_header_row => Some(ColumnMap::from_headers(header)),
        _ => None,
    };

    rows.iter()
        .zip(1u64..)
        .skip(usize::from(has_header_row))
        .filter(|(row, _)| !is_blank_row(row))
        .map(|(row, index)| (row_id(row, columns.as_ref()), index))
        .collect()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Quotes a sheet name for A1 notation. Embedded quotes are doubled.
fn quote_sheet_name(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

fn sheets_error(status: StatusCode, body: &str) -> AppError {
    match serde_json::from_str::<GoogleError>(body) {
        Ok(err) => AppError::SheetsError(format!("HTTP {}: {}", status.as_u16(), err.error.message)),
        Err(_) => AppError::SheetsError(format!("HTTP {}", status.as_u16())),
    }
}
