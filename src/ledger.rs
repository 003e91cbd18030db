//! The host component for detail-store mutations.
//!
//! [`RentalLedger`] is the only sanctioned way to change the detail table.
//! Each operation opens one unit of work, applies the detail mutation, calls
//! the [`maintainer`](crate::maintainer) synchronously, and commits. If any
//! step fails the unit of work is dropped, so the caller sees either both
//! tables updated or neither.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SummaryError;
use crate::maintainer::{self, DeleteOutcome, RebuildReport};
use crate::model::{self, DetailRecord, NewDetailRecord, SummaryEntry};
use crate::store::{Backend, UnitOfWork};

/// Counters kept by a ledger since it was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub inserted: u64,
    pub deleted: u64,
    pub rebuilds: u64,
    /// Deletes whose genre had no summary entry.
    pub invariant_violations: u64,
    /// Mutations that failed and were rolled back.
    pub rolled_back: u64,
}

/// One genre whose summary count disagrees with the detail table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenreDrift {
    pub genre: String,
    /// Count derived from the detail table (0 if absent).
    pub expected: i64,
    /// Count held by the summary (0 if absent).
    pub actual: i64,
}

/// Result of comparing the summary with a fresh group-by of the details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub detail_rows: i64,
    pub summary_total: i64,
    pub drift: Vec<GenreDrift>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty()
    }
}

/// How [`RentalLedger::load`] keeps the summary up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Each row is counted by the maintainer as it is inserted.
    Incremental,
    /// Rows are inserted directly and the summary is rebuilt once.
    BulkThenRebuild,
}

/// Result of [`RentalLedger::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub mode: LoadMode,
    pub rows_inserted: u64,
    /// Detail rows removed first because `replace_existing` was set.
    pub rows_replaced: u64,
    pub rebuild: Option<RebuildReport>,
}

/// Applies detail mutations and their summary updates atomically.
pub struct RentalLedger<B: Backend> {
    backend: B,
    stats: LedgerStats,
}

impl<B: Backend> RentalLedger<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            stats: LedgerStats::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    /// Run `f` in a unit of work and commit it if `f` succeeds.
    fn mutate<T>(
        &mut self,
        f: impl FnOnce(&mut dyn UnitOfWork) -> Result<T, SummaryError>,
    ) -> Result<T, SummaryError> {
        let mut tx = self.backend.begin()?;
        let result = f(&mut tx).and_then(|value| tx.commit().map(|()| value));
        if let Err(e) = &result {
            self.stats.rolled_back += 1;
            warn!(error = %e, kind = %e.kind(), "mutation rolled back");
        }
        result
    }

    /// Insert one detail record and count it in the summary.
    pub fn insert(&mut self, record: NewDetailRecord) -> Result<DetailRecord, SummaryError> {
        record.validate()?;
        let inserted = self.mutate(|tx| {
            let inserted = tx.insert_detail(record)?;
            maintainer::on_insert(tx, &inserted)?;
            Ok(inserted)
        })?;
        self.stats.inserted += 1;
        Ok(inserted)
    }

    /// Insert a batch of detail records in one unit of work.
    ///
    /// Every row goes through the maintainer. A failure on any row rolls
    /// back the whole batch.
    pub fn insert_batch(
        &mut self,
        records: Vec<NewDetailRecord>,
    ) -> Result<Vec<DetailRecord>, SummaryError> {
        for record in &records {
            record.validate()?;
        }
        let inserted = self.mutate(|tx| {
            maintainer::lock_genres(tx, records.iter().map(|r| r.genre.as_str()))?;
            let mut inserted = Vec::with_capacity(records.len());
            for record in records {
                let row = tx.insert_detail(record)?;
                maintainer::on_insert(tx, &row)?;
                inserted.push(row);
            }
            Ok(inserted)
        })?;
        self.stats.inserted += inserted.len() as u64;
        info!(rows = inserted.len(), "detail batch inserted");
        Ok(inserted)
    }

    /// Load many detail records in one unit of work.
    ///
    /// With `replace_existing`, the detail table and the summary are emptied
    /// first. [`LoadMode::Incremental`] sends every row through the
    /// maintainer; [`LoadMode::BulkThenRebuild`] skips it and rebuilds the
    /// summary once at the end.
    pub fn load(
        &mut self,
        records: Vec<NewDetailRecord>,
        mode: LoadMode,
        replace_existing: bool,
    ) -> Result<LoadReport, SummaryError> {
        for record in &records {
            record.validate()?;
        }
        let report = self.mutate(|tx| {
            // Genre locks before the table lock, the same order a concurrent
            // insert takes them in.
            if mode == LoadMode::Incremental {
                maintainer::lock_genres(tx, records.iter().map(|r| r.genre.as_str()))?;
            }
            let rows_replaced = if replace_existing {
                tx.lock_summary_exclusive()?;
                let n = tx.clear_details()?;
                tx.clear_summary()?;
                n
            } else {
                0
            };

            let mut rows_inserted = 0u64;
            for record in records {
                let row = tx.insert_detail(record)?;
                if mode == LoadMode::Incremental {
                    maintainer::on_insert(tx, &row)?;
                }
                rows_inserted += 1;
            }

            let rebuild = match mode {
                LoadMode::Incremental => None,
                LoadMode::BulkThenRebuild => Some(maintainer::full_rebuild(tx)?),
            };
            Ok(LoadReport {
                mode,
                rows_inserted,
                rows_replaced,
                rebuild,
            })
        })?;

        self.stats.inserted += report.rows_inserted;
        if report.rebuild.is_some() {
            self.stats.rebuilds += 1;
        }
        info!(
            mode = ?report.mode,
            rows_inserted = report.rows_inserted,
            rows_replaced = report.rows_replaced,
            "detail rows loaded"
        );
        Ok(report)
    }

    /// Delete a detail record and uncount it from the summary.
    ///
    /// Returns `None` if no record has this id.
    pub fn delete(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError> {
        let outcome = self.mutate(|tx| {
            let Some(removed) = tx.delete_detail(id)? else {
                return Ok(None);
            };
            let outcome = maintainer::on_delete(tx, &removed)?;
            Ok(Some((removed, outcome)))
        })?;

        let Some((removed, outcome)) = outcome else {
            return Ok(None);
        };
        self.stats.deleted += 1;
        if outcome == DeleteOutcome::MissingEntry {
            self.stats.invariant_violations += 1;
        }
        Ok(Some(removed))
    }

    /// Fetch one detail record.
    pub fn detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError> {
        let mut tx = self.backend.begin_read()?;
        tx.detail(id)
    }

    /// Number of detail records.
    pub fn detail_count(&mut self) -> Result<i64, SummaryError> {
        let mut tx = self.backend.begin_read()?;
        tx.detail_count()
    }

    /// Recompute the summary from the whole detail table.
    ///
    /// Runs in one unit of work: on failure the previous summary is kept.
    pub fn rebuild(&mut self) -> Result<RebuildReport, SummaryError> {
        let report = self.mutate(|tx| maintainer::full_rebuild(tx))?;
        self.stats.rebuilds += 1;
        Ok(report)
    }

    /// The summary, ordered by count descending then genre.
    pub fn summary(&mut self) -> Result<Vec<SummaryEntry>, SummaryError> {
        let mut tx = self.backend.begin_read()?;
        let mut entries = tx.summary_entries()?;
        model::sort_by_count_desc(&mut entries);
        Ok(entries)
    }

    /// Compare the summary against the detail table without changing
    /// either. Both are read from one consistent snapshot.
    pub fn verify(&mut self) -> Result<ConsistencyReport, SummaryError> {
        let mut tx = self.backend.begin_read()?;
        let expected = tx.detail_genre_counts()?;
        let actual: BTreeMap<String, i64> = tx
            .summary_entries()?
            .into_iter()
            .map(|e| (e.genre, e.total_count))
            .collect();

        let report = diff_counts(&expected, &actual);
        if !report.is_consistent() {
            warn!(
                drifted_genres = report.drift.len(),
                "summary disagrees with detail table"
            );
        }
        Ok(report)
    }
}

/// Compare expected (detail-derived) counts with actual summary counts.
pub fn diff_counts(
    expected: &BTreeMap<String, i64>,
    actual: &BTreeMap<String, i64>,
) -> ConsistencyReport {
    let mut drift = Vec::new();
    for genre in expected.keys().chain(actual.keys()) {
        let e = expected.get(genre).copied().unwrap_or(0);
        let a = actual.get(genre).copied().unwrap_or(0);
        // A zero-count entry in the summary is itself drift, even though
        // the counts compare equal to an absent genre.
        let zero_entry = actual.get(genre).is_some_and(|&c| c <= 0);
        if (e != a || zero_entry) && !drift.iter().any(|d: &GenreDrift| &d.genre == genre) {
            drift.push(GenreDrift {
                genre: genre.clone(),
                expected: e,
                actual: a,
            });
        }
    }
    drift.sort_by(|a, b| a.genre.cmp(&b.genre));

    ConsistencyReport {
        detail_rows: expected.values().sum(),
        summary_total: actual.values().sum(),
        drift,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::store::recording::RecordingBackend;
    use chrono::NaiveDate;

    fn record(genre: &str, customer_id: i32) -> NewDetailRecord {
        NewDetailRecord {
            rental_timestamp: NaiveDate::from_ymd_opt(2005, 8, 2)
                .unwrap()
                .and_hms_opt(14, 5, 0)
                .unwrap(),
            customer_id,
            customer_display_name: format!("Customer {customer_id}"),
            movie_title: "Chamber Italian".into(),
            genre: genre.into(),
            film_id: 133,
            category_id: 12,
        }
    }

    fn counts(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(g, c)| (g.to_string(), *c)).collect()
    }

    #[test]
    fn test_insert_and_delete_update_stats() {
        let mut ledger = RentalLedger::new(MemoryBackend::new());
        let a = ledger.insert(record("Music", 1)).unwrap();
        ledger.insert(record("Music", 2)).unwrap();
        ledger.delete(a.id).unwrap();

        assert_eq!(
            ledger.stats(),
            &LedgerStats {
                inserted: 2,
                deleted: 1,
                ..LedgerStats::default()
            }
        );
        assert_eq!(ledger.summary().unwrap(), vec![SummaryEntry::new("Music", 1)]);
    }

    #[test]
    fn test_delete_unknown_id_is_noop() {
        let mut ledger = RentalLedger::new(MemoryBackend::new());
        ledger.insert(record("Games", 1)).unwrap();
        assert_eq!(ledger.delete(404).unwrap(), None);
        assert_eq!(ledger.stats().deleted, 0);
        assert_eq!(ledger.summary().unwrap(), vec![SummaryEntry::new("Games", 1)]);
    }

    #[test]
    fn test_invalid_record_rejected_before_unit_of_work() {
        let mut ledger = RentalLedger::new(MemoryBackend::new());
        let err = ledger.insert(record("", 1)).unwrap_err();
        assert!(matches!(err, SummaryError::InvalidArgument(_)));
        assert_eq!(ledger.stats().rolled_back, 0);
        assert_eq!(ledger.detail_count().unwrap(), 0);
    }

    #[test]
    fn test_summary_failure_rolls_back_detail_insert() {
        let mut backend = MemoryBackend::new();
        backend.fail_summary_writes_after(0);
        let mut ledger = RentalLedger::new(backend);

        let err = ledger.insert(record("Action", 1)).unwrap_err();
        assert!(matches!(err, SummaryError::StorageUnavailable(_)));
        assert_eq!(ledger.stats().rolled_back, 1);
        assert_eq!(ledger.stats().inserted, 0);
        assert!(ledger.backend().detail_records().is_empty());
        assert!(ledger.backend().summary_snapshot().is_empty());
    }

    #[test]
    fn test_bulk_load_matches_incremental_load() {
        let rows: Vec<_> = ["Sports", "Sports", "Drama", "Sports", "Drama", "Travel"]
            .iter()
            .enumerate()
            .map(|(i, g)| record(g, i as i32))
            .collect();

        let mut incremental = RentalLedger::new(MemoryBackend::new());
        let report = incremental
            .load(rows.clone(), LoadMode::Incremental, false)
            .unwrap();
        assert_eq!(report.rows_inserted, 6);
        assert_eq!(report.rebuild, None);

        let mut bulk = RentalLedger::new(MemoryBackend::new());
        let report = bulk.load(rows, LoadMode::BulkThenRebuild, false).unwrap();
        assert_eq!(report.rebuild.map(|r| r.entries_written), Some(3));

        assert_eq!(incremental.summary().unwrap(), bulk.summary().unwrap());
        assert_eq!(bulk.stats().rebuilds, 1);
        assert_eq!(incremental.stats().rebuilds, 0);
    }

    #[test]
    fn test_load_replacing_existing_rows() {
        let mut ledger = RentalLedger::new(MemoryBackend::new());
        ledger
            .insert_batch(vec![record("Classics", 1), record("Classics", 2)])
            .unwrap();

        let report = ledger
            .load(vec![record("New", 3)], LoadMode::Incremental, true)
            .unwrap();
        assert_eq!(report.rows_replaced, 2);
        assert_eq!(ledger.detail_count().unwrap(), 1);
        assert_eq!(ledger.summary().unwrap(), vec![SummaryEntry::new("New", 1)]);
        assert!(ledger.verify().unwrap().is_consistent());
    }

    #[test]
    fn test_verify_reports_no_drift_after_maintained_mutations() {
        let mut ledger = RentalLedger::new(MemoryBackend::new());
        ledger.insert(record("Horror", 1)).unwrap();
        let b = ledger.insert(record("Comedy", 2)).unwrap();
        ledger.delete(b.id).unwrap();

        let report = ledger.verify().unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.detail_rows, 1);
        assert_eq!(report.summary_total, 1);
    }

    #[test]
    fn test_diff_counts_finds_missing_extra_and_wrong() {
        let expected = counts(&[("Action", 2), ("Drama", 1)]);
        let actual = counts(&[("Action", 3), ("Music", 1)]);
        let report = diff_counts(&expected, &actual);
        assert_eq!(
            report.drift,
            vec![
                GenreDrift {
                    genre: "Action".into(),
                    expected: 2,
                    actual: 3
                },
                GenreDrift {
                    genre: "Drama".into(),
                    expected: 1,
                    actual: 0
                },
                GenreDrift {
                    genre: "Music".into(),
                    expected: 0,
                    actual: 1
                },
            ]
        );
    }

    #[test]
    fn test_diff_counts_flags_zero_entries() {
        let report = diff_counts(&BTreeMap::new(), &counts(&[("Classics", 0)]));
        assert!(!report.is_consistent());
        assert_eq!(report.drift[0].genre, "Classics");
    }

    #[test]
    fn test_reads_use_read_only_units_of_work() {
        let mut ledger = RentalLedger::new(RecordingBackend::new(MemoryBackend::new()));
        ledger.insert(record("Family", 1)).unwrap();
        ledger.backend().take_calls();

        ledger.verify().unwrap();
        ledger.summary().unwrap();
        ledger.detail_count().unwrap();

        let calls = ledger.backend().take_calls();
        assert_eq!(calls.iter().filter(|c| *c == "begin_read").count(), 3);
        assert!(!calls.iter().any(|c| c == "begin"), "{calls:?}");
        // verify reads both tables inside one unit of work
        assert_eq!(calls[..3], ["begin_read", "detail_genre_counts", "summary_entries"]);
    }

    #[test]
    fn test_insert_batch_locks_genres_sorted_before_first_row() {
        let mut ledger = RentalLedger::new(RecordingBackend::new(MemoryBackend::new()));
        ledger
            .insert_batch(vec![record("Comedy", 1), record("Action", 2), record("Comedy", 3)])
            .unwrap();

        let calls = ledger.backend().take_calls();
        assert_eq!(
            calls[..4],
            ["begin", "lock_genre Action", "lock_genre Comedy", "insert_detail"]
        );
    }

    #[test]
    fn test_replacing_load_locks_genres_then_summary_then_clears() {
        let mut ledger = RentalLedger::new(RecordingBackend::new(MemoryBackend::new()));
        ledger.insert(record("Classics", 1)).unwrap();
        ledger.backend().take_calls();

        ledger
            .load(
                vec![record("Sports", 2), record("Animation", 3)],
                LoadMode::Incremental,
                true,
            )
            .unwrap();

        let calls = ledger.backend().take_calls();
        assert_eq!(
            calls[..6],
            [
                "begin",
                "lock_genre Animation",
                "lock_genre Sports",
                "lock_summary_exclusive",
                "clear_details",
                "clear_summary",
            ]
        );
        assert!(ledger.verify().unwrap().is_consistent());
    }

    #[test]
    fn test_bulk_replacing_load_locks_summary_before_clearing() {
        let mut ledger = RentalLedger::new(RecordingBackend::new(MemoryBackend::new()));
        ledger.insert(record("Classics", 1)).unwrap();
        ledger.backend().take_calls();

        ledger
            .load(vec![record("Sports", 2)], LoadMode::BulkThenRebuild, true)
            .unwrap();

        let calls = ledger.backend().take_calls();
        assert_eq!(calls[..3], ["begin", "lock_summary_exclusive", "clear_details"]);
        assert!(!calls.iter().any(|c| c.starts_with("lock_genre")), "{calls:?}");
    }
}
