//! Record normalizer: maps a raw spreadsheet row onto a [`Submission`].
//!
//! Column aliasing happens here and nowhere else. Columns are resolved by
//! header when a header map is available, otherwise by the fixed Google Form
//! layout:
//!
//! | index | field |
//! |-------|-------|
//! | 0 | timestamp |
//! | 1 | title |
//! | 2 | description |
//! | 3 | city |
//! | 4 | category |
//! | 5 | publisher name |
//! | 6 | publisher phone |
//! | 7 | image reference |

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::NormalizationError;
use crate::models::{Origin, Submission, SubmissionStatus};

/// Rows shorter than this cannot carry title, description, city and category data.
pub const MIN_COLUMNS: usize = 4;

/// Naive formats tried in order after RFC 3339.
const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%d/%m/%Y", "%Y-%m-%d"];

/// Canonical submission fields a column can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    Timestamp,
    Title,
    Description,
    City,
    Category,
    PublisherPhone,
    PublisherName,
    Image,
}

impl Field {
    /// Header matching order. Phone is matched before name so a
    /// "Publisher Phone" header is not taken by the name aliases.
    const MATCH_ORDER: [Field; 9] = [
        Field::Id,
        Field::Timestamp,
        Field::Title,
        Field::Description,
        Field::City,
        Field::Category,
        Field::PublisherPhone,
        Field::PublisherName,
        Field::Image,
    ];

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Field::Id => &[],
            Field::Timestamp => &["timestamp", "submitted", "date"],
            Field::Title => &["title", "headline"],
            Field::Description => &["description", "details", "content"],
            Field::City => &["city", "location"],
            Field::Category => &["category", "topic"],
            Field::PublisherPhone => &["phone", "contact", "mobile"],
            Field::PublisherName => &["name", "publisher", "reporter"],
            Field::Image => &["image", "photo", "picture", "upload"],
        }
    }

    fn matches_header(&self, header: &str) -> bool {
        match self {
            Field::Id => header == "id" || header.ends_with(" id") || header.ends_with("_id"),
            _ => self.aliases().iter().any(|alias| header.contains(alias)),
        }
    }

    fn default_position(&self) -> Option<usize> {
        match self {
            Field::Id => None,
            Field::Timestamp => Some(0),
            Field::Title => Some(1),
            Field::Description => Some(2),
            Field::City => Some(3),
            Field::Category => Some(4),
            Field::PublisherName => Some(5),
            Field::PublisherPhone => Some(6),
            Field::Image => Some(7),
        }
    }
}

/// Header-derived column positions. Unmatched fields are `None` and fall back
/// to the positional layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub id: Option<usize>,
    pub timestamp: Option<usize>,
    pub title: Option<usize>,
    pub description: Option<usize>,
    pub city: Option<usize>,
    pub category: Option<usize>,
    pub publisher_name: Option<usize>,
    pub publisher_phone: Option<usize>,
    pub image: Option<usize>,
}

impl ColumnMap {
    /// Builds a map from a header row using case-insensitive substring matching.
    ///
    /// Each header is claimed by at most one field.
    ///
    /// # Examples
    ///
    /// ```
    /// use newsviews_core::normalize::ColumnMap;
    ///
    /// let headers: Vec<String> = ["Timestamp", "News Title", "News Description", "City"]
    ///     .iter()
    ///     .map(|s| s.to_string())
    ///     .collect();
    /// let map = ColumnMap::from_headers(&headers);
    /// assert_eq!(map.title, Some(1));
    /// assert_eq!(map.description, Some(2));
    /// assert_eq!(map.category, None);
    /// ```
    pub fn from_headers(headers: &[String]) -> Self {
        let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let mut claimed = vec![false; lowered.len()];
        let mut map = ColumnMap::default();

        for field in Field::MATCH_ORDER {
            let hit = lowered
                .iter()
                .enumerate()
                .find(|(i, header)| !claimed[*i] && field.matches_header(header))
                .map(|(i, _)| i);
            if let Some(i) = hit {
                claimed[i] = true;
                map.set(field, i);
            }
        }

        map
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        match field {
            Field::Id => self.id,
            Field::Timestamp => self.timestamp,
            Field::Title => self.title,
            Field::Description => self.description,
            Field::City => self.city,
            Field::Category => self.category,
            Field::PublisherName => self.publisher_name,
            Field::PublisherPhone => self.publisher_phone,
            Field::Image => self.image,
        }
    }

    fn set(&mut self, field: Field, index: usize) {
        let slot = match field {
            Field::Id => &mut self.id,
            Field::Timestamp => &mut self.timestamp,
            Field::Title => &mut self.title,
            Field::Description => &mut self.description,
            Field::City => &mut self.city,
            Field::Category => &mut self.category,
            Field::PublisherName => &mut self.publisher_name,
            Field::PublisherPhone => &mut self.publisher_phone,
            Field::Image => &mut self.image,
        };
        *slot = Some(index);
    }

    pub fn is_empty(&self) -> bool {
        *self == ColumnMap::default()
    }
}

fn cell<'a>(row: &'a [String], columns: Option<&ColumnMap>, field: Field) -> &'a str {
    columns
        .and_then(|c| c.get(field))
        .or_else(|| field.default_position())
        .and_then(|i| row.get(i))
        .map(|value| value.trim())
        .unwrap_or("")
}

/// Normalizes a raw row, falling back to the current time for unparseable timestamps.
pub fn normalize(
    row: &[String],
    columns: Option<&ColumnMap>,
) -> Result<Submission, NormalizationError> {
    normalize_at(row, columns, Utc::now())
}

/// Normalizes a raw row using `now` as the timestamp fallback.
pub fn normalize_at(
    row: &[String],
    columns: Option<&ColumnMap>,
    now: DateTime<Utc>,
) -> Result<Submission, NormalizationError> {
    if row.len() < MIN_COLUMNS {
        return Err(NormalizationError::TooFewColumns {
            found: row.len(),
            required: MIN_COLUMNS,
        });
    }

    let created_at = match row_timestamp(row, columns) {
        Some(ts) => ts,
        None => {
            warn!(
                raw = cell(row, columns, Field::Timestamp),
                "Unrecognised timestamp, falling back to current time"
            );
            now
        }
    };

    let image = cell(row, columns, Field::Image);

    Ok(Submission {
        id: row_id(row, columns),
        title: cell(row, columns, Field::Title).to_string(),
        description: cell(row, columns, Field::Description).to_string(),
        city: cell(row, columns, Field::City).to_string(),
        category: cell(row, columns, Field::Category).to_string(),
        publisher_name: cell(row, columns, Field::PublisherName).to_string(),
        publisher_phone: cell(row, columns, Field::PublisherPhone).to_string(),
        image_reference: (!image.is_empty()).then(|| image.to_string()),
        created_at,
        status: SubmissionStatus::Pending,
        duplicate_of: None,
        origin: Origin::Sheet,
        duplicate_score: None,
        validation_errors: Vec::new(),
        moderation_reason: None,
        source_row: None,
    })
}

/// The row's own timestamp, or `None` when [`normalize`] would fall back to
/// the current time.
pub fn row_timestamp(row: &[String], columns: Option<&ColumnMap>) -> Option<DateTime<Utc>> {
    parse_timestamp(cell(row, columns, Field::Timestamp))
}

/// True when every cell of the row is empty or whitespace.
pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

/// Returns the stable id of a raw row.
///
/// Uses the source's own id column when present and non-empty. Otherwise the
/// id is derived from the raw timestamp, title and phone cells, so the same
/// row yields the same id on every pass and in deletion diffs.
pub fn row_id(row: &[String], columns: Option<&ColumnMap>) -> String {
    let own = cell(row, columns, Field::Id);
    if !own.is_empty() {
        return own.to_string();
    }

    let mut hasher = Sha256::new();
    for part in [
        cell(row, columns, Field::Timestamp),
        cell(row, columns, Field::Title),
        cell(row, columns, Field::PublisherPhone),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("row-{}", &digest[..32])
}

/// Parses a timestamp using RFC 3339 and then the known spreadsheet formats.
/// Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_positional_layout() {
        let raw = row(&[
            "5/1/2024 9:03:12",
            "Water main burst",
            "A water main burst on High Street this morning, flooding two shops.",
            "Springfield",
            "Local",
            "Ann Reporter",
            "+1 555 010 0199",
            "https://example.com/img.jpg",
        ]);
        let sub = normalize(&raw, None).unwrap();

        assert_eq!(sub.title, "Water main burst");
        assert_eq!(sub.city, "Springfield");
        assert_eq!(sub.category, "Local");
        assert_eq!(sub.publisher_name, "Ann Reporter");
        assert_eq!(sub.publisher_phone, "+1 555 010 0199");
        assert_eq!(
            sub.image_reference.as_deref(),
            Some("https://example.com/img.jpg")
        );
        assert_eq!(
            sub.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 3, 12).unwrap()
        );
        assert_eq!(sub.origin, Origin::Sheet);
        assert_eq!(sub.status, SubmissionStatus::Pending);
    }

    #[test]
    fn test_too_few_columns() {
        let err = normalize(&row(&["ts", "title", "desc"]), None).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::TooFewColumns {
                found: 3,
                required: 4
            }
        );
    }

    #[test]
    fn test_missing_trailing_columns_are_empty() {
        let sub = normalize(&row(&["", "Title", "Desc", "City"]), None).unwrap();
        assert_eq!(sub.category, "");
        assert_eq!(sub.publisher_phone, "");
        assert!(sub.image_reference.is_none());
    }

    #[test]
    fn test_header_map_reordered_columns() {
        let headers = row(&[
            "Submission ID",
            "City",
            "Your Name",
            "Contact Number",
            "News Description",
            "News Title",
            "Category",
            "Timestamp",
        ]);
        let map = ColumnMap::from_headers(&headers);
        assert_eq!(map.id, Some(0));
        assert_eq!(map.city, Some(1));
        assert_eq!(map.publisher_name, Some(2));
        assert_eq!(map.publisher_phone, Some(3));
        assert_eq!(map.description, Some(4));
        assert_eq!(map.title, Some(5));
        assert_eq!(map.category, Some(6));
        assert_eq!(map.timestamp, Some(7));
        assert_eq!(map.image, None);

        let raw = row(&[
            "sub-42",
            "Shelbyville",
            "Bo",
            "555-0100",
            "Long description",
            "Headline",
            "Sports",
            "2024-03-02 08:00:00",
        ]);
        let sub = normalize(&raw, Some(&map)).unwrap();
        assert_eq!(sub.id, "sub-42");
        assert_eq!(sub.title, "Headline");
        assert_eq!(sub.city, "Shelbyville");
        assert_eq!(sub.publisher_phone, "555-0100");
    }

    #[test]
    fn test_publisher_phone_header_not_taken_by_name() {
        let map = ColumnMap::from_headers(&row(&["Publisher Name", "Publisher Phone"]));
        assert_eq!(map.publisher_name, Some(0));
        assert_eq!(map.publisher_phone, Some(1));
    }

    #[test]
    fn test_unmatched_headers_fall_back_to_positions() {
        let map = ColumnMap::from_headers(&row(&["A", "B", "C", "D"]));
        assert!(map.is_empty());
        let sub = normalize(&row(&["", "Title", "Desc", "City", "Cat"]), Some(&map)).unwrap();
        assert_eq!(sub.title, "Title");
        assert_eq!(sub.category, "Cat");
    }

    #[test]
    fn test_blank_id_column_derives_stable_id() {
        let map = ColumnMap::from_headers(&row(&["ID", "Timestamp", "Title", "Description", "City"]));
        let raw = row(&["   ", "2024-01-01", "Title", "Desc", "City"]);
        let a = row_id(&raw, Some(&map));
        let b = row_id(&raw, Some(&map));
        assert_eq!(a, b);
        assert!(a.starts_with("row-"));
        assert_eq!(a.len(), 36);

        let other = row(&["", "2024-01-02", "Title", "Desc", "City"]);
        assert_ne!(a, row_id(&other, Some(&map)));
    }

    #[test]
    fn test_unparseable_timestamp_falls_back_to_now() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let sub = normalize_at(&row(&["yesterday-ish", "T", "D", "C"]), None, now).unwrap();
        assert_eq!(sub.created_at, now);
        assert_eq!(row_timestamp(&row(&["yesterday-ish", "T", "D", "C"]), None), None);
    }

    #[test]
    fn test_row_timestamp_parsed() {
        assert_eq!(
            row_timestamp(&row(&["2/6/2024 10:00:00", "T", "D", "C"]), None),
            Some(Utc.with_ymd_and_hms(2024, 2, 6, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_blank_row() {
        assert!(is_blank_row(&row(&["", "  ", "\t"])));
        assert!(is_blank_row(&[]));
        assert!(!is_blank_row(&row(&["", "Title"])));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 2, 13, 14, 5, 0).unwrap();
        assert_eq!(parse_timestamp("2024-02-13T14:05:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2/13/2024 14:05:00"), Some(expected));
        assert_eq!(parse_timestamp("13/02/2024 14:05:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-02-13 14:05:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-02-13"),
            Some(Utc.with_ymd_and_hms(2024, 2, 13, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("not a date"), None);
    }
}
