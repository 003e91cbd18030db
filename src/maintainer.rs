//! Incremental maintenance of the genre summary.
//!
//! The summary holds, for each genre, the number of detail records carrying
//! that genre. Genres with no detail records have no summary entry at all.
//! [`on_insert`] and [`on_delete`] keep that true one row at a time;
//! [`full_rebuild`] recomputes it from scratch.
//!
//! Every function here runs inside the caller's [`UnitOfWork`] and never
//! commits it. The caller applies the detail mutation and the maintainer
//! call in the same unit of work so that they commit or roll back together.
//! A detail mutation that skips the maintainer leaves the summary stale
//! until the next [`full_rebuild`].

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SummaryError;
use crate::model::{DetailRecord, SummaryEntry};
use crate::store::UnitOfWork;

/// What [`on_insert`] did to the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First record of its genre; a new entry with count 1.
    Created,
    /// Existing entry incremented to the given count.
    Incremented(i64),
}

/// What [`on_delete`] did to the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Entry decremented to the given (positive) count.
    Decremented(i64),
    /// Count reached zero and the entry was removed.
    Removed,
    /// No entry existed for the genre. The summary was already
    /// inconsistent; nothing was changed.
    MissingEntry,
}

/// Result of a [`full_rebuild`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Entries present before the rebuild.
    pub entries_cleared: u64,
    /// Entries written by the rebuild.
    pub entries_written: u64,
    /// Detail records counted.
    pub detail_rows: i64,
}

/// Account for a newly inserted detail record.
pub fn on_insert<U>(tx: &mut U, record: &DetailRecord) -> Result<InsertOutcome, SummaryError>
where
    U: UnitOfWork + ?Sized,
{
    tx.lock_genre(&record.genre)?;

    match tx.summary_entry(&record.genre)? {
        Some(entry) => {
            let total = entry.total_count + 1;
            tx.update_summary_count(&record.genre, total)?;
            debug!(
                genre = %record.genre,
                detail_id = record.id,
                total_count = total,
                "summary entry incremented"
            );
            Ok(InsertOutcome::Incremented(total))
        }
        None => {
            tx.insert_summary_entry(&SummaryEntry::new(&record.genre, 1))?;
            debug!(
                genre = %record.genre,
                detail_id = record.id,
                "summary entry created"
            );
            Ok(InsertOutcome::Created)
        }
    }
}

/// Account for a detail record being removed.
///
/// A missing summary entry means the invariant was already broken before
/// this call. It is logged and skipped rather than failing the deletion.
pub fn on_delete<U>(tx: &mut U, record: &DetailRecord) -> Result<DeleteOutcome, SummaryError>
where
    U: UnitOfWork + ?Sized,
{
    tx.lock_genre(&record.genre)?;

    let Some(entry) = tx.summary_entry(&record.genre)? else {
        let violation = SummaryError::InvariantViolation {
            genre: record.genre.clone(),
        };
        warn!(
            genre = %record.genre,
            detail_id = record.id,
            "{violation}; skipping summary update"
        );
        return Ok(DeleteOutcome::MissingEntry);
    };

    let total = entry.total_count - 1;
    if total <= 0 {
        tx.remove_summary_entry(&record.genre)?;
        debug!(genre = %record.genre, detail_id = record.id, "summary entry removed");
        Ok(DeleteOutcome::Removed)
    } else {
        tx.update_summary_count(&record.genre, total)?;
        debug!(
            genre = %record.genre,
            detail_id = record.id,
            total_count = total,
            "summary entry decremented"
        );
        Ok(DeleteOutcome::Decremented(total))
    }
}

/// Take the genre locks for every record a unit of work is about to count,
/// once each, in sorted order.
///
/// Two batches touching the same genres in different row orders would
/// otherwise wait on each other.
pub fn lock_genres<'a, U>(
    tx: &mut U,
    genres: impl IntoIterator<Item = &'a str>,
) -> Result<(), SummaryError>
where
    U: UnitOfWork + ?Sized,
{
    let genres: BTreeSet<&str> = genres.into_iter().collect();
    for genre in genres {
        tx.lock_genre(genre)?;
    }
    Ok(())
}

/// Clear the summary and recompute it from the whole detail table.
///
/// The summary is locked against other writers before the group-by, so
/// every detail row committed before the rebuild is counted and none
/// committed after it is lost. The group-by runs before the clear, so a
/// failure while reading the detail table leaves the previous summary
/// untouched even without a rollback.
pub fn full_rebuild<U>(tx: &mut U) -> Result<RebuildReport, SummaryError>
where
    U: UnitOfWork + ?Sized,
{
    tx.lock_summary_exclusive()?;
    let counts = tx.detail_genre_counts()?;
    let detail_rows: i64 = counts.values().sum();

    let entries_cleared = tx.clear_summary()?;

    let mut entries_written = 0u64;
    for (genre, count) in counts {
        if count <= 0 {
            continue;
        }
        tx.insert_summary_entry(&SummaryEntry::new(genre, count))?;
        entries_written += 1;
    }

    info!(
        entries_cleared,
        entries_written, detail_rows, "summary rebuilt from detail table"
    );

    Ok(RebuildReport {
        entries_cleared,
        entries_written,
        detail_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::model::NewDetailRecord;
    use crate::store::Backend;
    use crate::store::recording::{CallLog, Recording};
    use chrono::NaiveDate;

    fn record(genre: &str) -> NewDetailRecord {
        NewDetailRecord {
            rental_timestamp: NaiveDate::from_ymd_opt(2005, 7, 8)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            customer_id: 7,
            customer_display_name: "Maria Miller".into(),
            movie_title: "Bucket Brotherhood".into(),
            genre: genre.into(),
            film_id: 100,
            category_id: 1,
        }
    }

    fn sorted(mut entries: Vec<SummaryEntry>) -> Vec<SummaryEntry> {
        entries.sort_by(|a, b| a.genre.cmp(&b.genre));
        entries
    }

    #[test]
    fn test_on_insert_creates_then_increments() {
        let mut backend = MemoryBackend::new();
        let mut tx = backend.begin().unwrap();

        let a = tx.insert_detail(record("Sports")).unwrap();
        assert_eq!(on_insert(&mut tx, &a).unwrap(), InsertOutcome::Created);

        let b = tx.insert_detail(record("Sports")).unwrap();
        assert_eq!(
            on_insert(&mut tx, &b).unwrap(),
            InsertOutcome::Incremented(2)
        );
        assert_eq!(
            tx.summary_entry("Sports").unwrap(),
            Some(SummaryEntry::new("Sports", 2))
        );
    }

    #[test]
    fn test_on_delete_decrements_then_removes() {
        let mut backend = MemoryBackend::new();
        let mut tx = backend.begin().unwrap();

        let a = tx.insert_detail(record("Comedy")).unwrap();
        on_insert(&mut tx, &a).unwrap();
        let b = tx.insert_detail(record("Comedy")).unwrap();
        on_insert(&mut tx, &b).unwrap();

        tx.delete_detail(a.id).unwrap();
        assert_eq!(
            on_delete(&mut tx, &a).unwrap(),
            DeleteOutcome::Decremented(1)
        );

        tx.delete_detail(b.id).unwrap();
        assert_eq!(on_delete(&mut tx, &b).unwrap(), DeleteOutcome::Removed);
        assert_eq!(tx.summary_entry("Comedy").unwrap(), None);
    }

    #[test]
    fn test_on_delete_missing_entry_is_skipped() {
        let mut backend = MemoryBackend::new();
        let mut tx = backend.begin().unwrap();

        let orphan = record("Horror").with_id(99);
        assert_eq!(
            on_delete(&mut tx, &orphan).unwrap(),
            DeleteOutcome::MissingEntry
        );
        assert!(tx.summary_entries().unwrap().is_empty());
    }

    #[test]
    fn test_on_delete_removes_non_positive_counts() {
        let mut backend = MemoryBackend::new();
        let mut tx = backend.begin().unwrap();

        // A corrupted entry that somehow holds zero is removed, not
        // driven negative.
        tx.insert_summary_entry(&SummaryEntry::new("Music", 0))
            .unwrap();
        let rec = record("Music").with_id(1);
        assert_eq!(on_delete(&mut tx, &rec).unwrap(), DeleteOutcome::Removed);
        assert_eq!(tx.summary_entry("Music").unwrap(), None);
    }

    #[test]
    fn test_full_rebuild_replaces_drifted_summary() {
        let mut backend = MemoryBackend::new();
        let mut tx = backend.begin().unwrap();

        tx.insert_detail(record("Sports")).unwrap();
        tx.insert_detail(record("Sports")).unwrap();
        tx.insert_detail(record("Games")).unwrap();
        tx.insert_summary_entry(&SummaryEntry::new("Classics", 9))
            .unwrap();

        let report = full_rebuild(&mut tx).unwrap();
        assert_eq!(
            report,
            RebuildReport {
                entries_cleared: 1,
                entries_written: 2,
                detail_rows: 3,
            }
        );
        assert_eq!(
            sorted(tx.summary_entries().unwrap()),
            vec![SummaryEntry::new("Games", 1), SummaryEntry::new("Sports", 2)]
        );
    }

    #[test]
    fn test_full_rebuild_on_empty_detail_table() {
        let mut backend = MemoryBackend::new();
        let mut tx = backend.begin().unwrap();

        let report = full_rebuild(&mut tx).unwrap();
        assert_eq!(report.entries_written, 0);
        assert_eq!(report.detail_rows, 0);
        assert!(tx.summary_entries().unwrap().is_empty());
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call} not called: {calls:?}"))
    }

    #[test]
    fn test_full_rebuild_locks_summary_before_grouping() {
        let mut backend = MemoryBackend::new();
        let calls = CallLog::default();
        let mut tx = Recording::new(backend.begin().unwrap(), calls.clone());
        let row = tx.insert_detail(record("Drama")).unwrap();
        on_insert(&mut tx, &row).unwrap();
        calls.borrow_mut().clear();

        full_rebuild(&mut tx).unwrap();

        let calls = calls.borrow();
        assert_eq!(calls[0], "lock_summary_exclusive");
        assert!(position(&calls, "lock_summary_exclusive") < position(&calls, "detail_genre_counts"));
        assert!(position(&calls, "detail_genre_counts") < position(&calls, "clear_summary"));
    }

    #[test]
    fn test_lock_genres_sorted_and_deduplicated() {
        let mut backend = MemoryBackend::new();
        let calls = CallLog::default();
        let mut tx = Recording::new(backend.begin().unwrap(), calls.clone());

        lock_genres(&mut tx, ["Comedy", "Action", "Comedy", "Sci-Fi", "Action"]).unwrap();

        assert_eq!(
            *calls.borrow(),
            vec!["lock_genre Action", "lock_genre Comedy", "lock_genre Sci-Fi"]
        );
    }

    #[test]
    fn test_lock_genres_same_order_for_any_row_order() {
        let order = |genres: [&str; 2]| {
            let mut backend = MemoryBackend::new();
            let calls = CallLog::default();
            let mut tx = Recording::new(backend.begin().unwrap(), calls.clone());
            lock_genres(&mut tx, genres).unwrap();
            calls.take()
        };
        assert_eq!(order(["Action", "Comedy"]), order(["Comedy", "Action"]));
    }
}
