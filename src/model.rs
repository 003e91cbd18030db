//! Record types shared by the detail store, the summary aggregator, and the
//! upstream selectors.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::SummaryError;

/// One qualifying rental, denormalized with customer, movie, and genre.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    /// Generated by the detail store; never reused.
    pub id: i64,
    pub rental_timestamp: NaiveDateTime,
    pub customer_id: i32,
    pub customer_display_name: String,
    pub movie_title: String,
    pub genre: String,
    pub film_id: i32,
    pub category_id: i32,
}

/// A detail record before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDetailRecord {
    pub rental_timestamp: NaiveDateTime,
    pub customer_id: i32,
    pub customer_display_name: String,
    pub movie_title: String,
    pub genre: String,
    pub film_id: i32,
    pub category_id: i32,
}

impl NewDetailRecord {
    /// Reject records the summary cannot key on.
    pub fn validate(&self) -> Result<(), SummaryError> {
        if self.genre.trim().is_empty() {
            return Err(SummaryError::InvalidArgument(
                "detail record genre must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Attach a store-assigned id.
    pub fn with_id(self, id: i64) -> DetailRecord {
        DetailRecord {
            id,
            rental_timestamp: self.rental_timestamp,
            customer_id: self.customer_id,
            customer_display_name: self.customer_display_name,
            movie_title: self.movie_title,
            genre: self.genre,
            film_id: self.film_id,
            category_id: self.category_id,
        }
    }
}

/// Per-genre rental count held by the summary aggregator.
///
/// A persisted entry always has `total_count > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub genre: String,
    pub total_count: i64,
}

impl SummaryEntry {
    pub fn new(genre: impl Into<String>, total_count: i64) -> Self {
        Self {
            genre: genre.into(),
            total_count,
        }
    }
}

/// A genre with its rental count, as returned by the top-genre selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreCount {
    pub genre: String,
    pub rental_count: i64,
}

impl From<SummaryEntry> for GenreCount {
    fn from(entry: SummaryEntry) -> Self {
        GenreCount {
            genre: entry.genre,
            rental_count: entry.total_count,
        }
    }
}

/// Half-open rental timestamp range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ReportWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, SummaryError> {
        if start >= end {
            return Err(SummaryError::InvalidArgument(format!(
                "report window start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether `ts` falls inside the window.
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl Default for ReportWindow {
    /// June through August 2005, the summer covered by the sample data.
    fn default() -> Self {
        let day = |m| {
            chrono::NaiveDate::from_ymd_opt(2005, m, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default()
        };
        Self {
            start: day(6),
            end: day(9),
        }
    }
}

/// Sort summary rows by count descending, ties broken by genre name.
pub fn sort_by_count_desc(entries: &mut [SummaryEntry]) {
    entries.sort_by(|a, b| {
        b.total_count
            .cmp(&a.total_count)
            .then_with(|| a.genre.cmp(&b.genre))
    });
}
