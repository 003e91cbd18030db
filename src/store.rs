//! Storage seam between the maintainer and a concrete backend.
//!
//! A [`Backend`] owns the detail and summary tables and hands out
//! [`UnitOfWork`]s. Every detail mutation and the summary update it implies
//! run inside one unit of work: either both are committed, or the unit of
//! work is dropped and neither is visible.
//!
//! Two backends ship with the crate:
//! - [`MemoryBackend`](crate::memory::MemoryBackend): in-process tables with
//!   an undo log.
//! - [`PgBackend`](crate::pg::PgBackend): `rental_details` /
//!   `rental_summary` tables in PostgreSQL.

use std::collections::BTreeMap;

use crate::error::SummaryError;
use crate::model::{DetailRecord, NewDetailRecord, SummaryEntry};

/// A source of units of work over one pair of detail/summary tables.
pub trait Backend {
    type Tx<'a>: UnitOfWork
    where
        Self: 'a;

    /// Start a unit of work.
    fn begin(&mut self) -> Result<Self::Tx<'_>, SummaryError>;

    /// Start a unit of work that only reads. Every read in it sees the
    /// same committed state of both tables.
    fn begin_read(&mut self) -> Result<Self::Tx<'_>, SummaryError> {
        self.begin()
    }
}

/// Primitive reads and writes on the detail and summary tables, scoped to
/// one atomic unit.
///
/// Dropping a unit of work without calling [`commit`](UnitOfWork::commit)
/// rolls back every change made through it.
pub trait UnitOfWork {
    // ── Detail table ────────────────────────────────────────────────────

    /// Insert a detail record and return it with its generated id.
    fn insert_detail(&mut self, record: NewDetailRecord) -> Result<DetailRecord, SummaryError>;

    /// Remove a detail record by id, returning it if it existed.
    fn delete_detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError>;

    /// Remove every detail record, returning how many were removed.
    ///
    /// Bypasses the maintainer; callers must clear or rebuild the summary in
    /// the same unit of work.
    fn clear_details(&mut self) -> Result<u64, SummaryError>;

    /// Fetch a detail record by id.
    fn detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError>;

    /// Number of detail records.
    fn detail_count(&mut self) -> Result<i64, SummaryError>;

    /// Group the full detail table by genre and count.
    fn detail_genre_counts(&mut self) -> Result<BTreeMap<String, i64>, SummaryError>;

    // ── Summary table ───────────────────────────────────────────────────

    /// Serialize read-modify-write of `genre`'s summary entry against other
    /// units of work until this one ends.
    fn lock_genre(&mut self, genre: &str) -> Result<(), SummaryError>;

    /// Block every other writer of the summary until this unit of work
    /// ends. Taken before a whole-table rewrite of the summary.
    fn lock_summary_exclusive(&mut self) -> Result<(), SummaryError>;

    /// Fetch the summary entry for `genre`.
    fn summary_entry(&mut self, genre: &str) -> Result<Option<SummaryEntry>, SummaryError>;

    /// Create a summary entry. Fails with
    /// [`SummaryError::DuplicateGenreKey`] if one already exists.
    fn insert_summary_entry(&mut self, entry: &SummaryEntry) -> Result<(), SummaryError>;

    /// Overwrite the count of an existing summary entry.
    fn update_summary_count(&mut self, genre: &str, total_count: i64)
    -> Result<(), SummaryError>;

    /// Remove the summary entry for `genre`.
    fn remove_summary_entry(&mut self, genre: &str) -> Result<(), SummaryError>;

    /// Remove every summary entry, returning how many were removed.
    fn clear_summary(&mut self) -> Result<u64, SummaryError>;

    /// All summary entries, in no particular order.
    fn summary_entries(&mut self) -> Result<Vec<SummaryEntry>, SummaryError>;

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Make every change in this unit of work durable and visible.
    fn commit(self) -> Result<(), SummaryError>
    where
        Self: Sized;
}
