//! In-process detail and summary tables.
//!
//! Mutations are applied in place and recorded in an undo log owned by the
//! unit of work. Commit discards the log; dropping an uncommitted unit of
//! work replays it in reverse, so rollback costs O(changes) rather than
//! O(table).
//!
//! Detail ids come from a counter that is not rolled back, matching a
//! database sequence: an id handed out by an aborted unit of work is never
//! reused.
//!
//! [`SharedMemoryBackend`] puts the tables behind a mutex held for the whole
//! unit of work, which serializes all summary read-modify-writes (and
//! therefore every genre) across threads.

use std::collections::BTreeMap;
use std::ops::DerefMut;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::SummaryError;
use crate::model::{DetailRecord, NewDetailRecord, SummaryEntry};
use crate::store::{Backend, UnitOfWork};

// ── Fault injection ─────────────────────────────────────────────────

/// Remaining successful writes before a table starts failing.
///
/// `None` means the table never fails.
#[derive(Debug, Clone, Default)]
struct Faults {
    detail_writes_left: Option<usize>,
    summary_writes_left: Option<usize>,
    detail_reads_fail: bool,
}

fn spend(budget: &mut Option<usize>, table: &str) -> Result<(), SummaryError> {
    match budget {
        Some(0) => Err(SummaryError::StorageUnavailable(format!(
            "{table} table is unavailable"
        ))),
        Some(n) => {
            *n -= 1;
            Ok(())
        }
        None => Ok(()),
    }
}

// ── Tables ──────────────────────────────────────────────────────────

/// Detail and summary tables held in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    details: BTreeMap<i64, DetailRecord>,
    summary: BTreeMap<String, i64>,
    next_id: i64,
    faults: Faults,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            details: BTreeMap::new(),
            summary: BTreeMap::new(),
            next_id: 1,
            faults: Faults::default(),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more detail writes succeed, then fail every subsequent one
    /// with [`SummaryError::StorageUnavailable`].
    pub fn fail_detail_writes_after(&mut self, n: usize) {
        self.faults.detail_writes_left = Some(n);
    }

    /// Let `n` more summary writes succeed, then fail every subsequent one
    /// with [`SummaryError::StorageUnavailable`].
    pub fn fail_summary_writes_after(&mut self, n: usize) {
        self.faults.summary_writes_left = Some(n);
    }

    /// Make every detail read fail.
    pub fn fail_detail_reads(&mut self) {
        self.faults.detail_reads_fail = true;
    }

    /// Clear all injected faults.
    pub fn heal(&mut self) {
        self.faults = Faults::default();
    }

    /// Committed detail records, ordered by id.
    pub fn detail_records(&self) -> Vec<DetailRecord> {
        self.details.values().cloned().collect()
    }

    /// Committed summary, keyed by genre.
    pub fn summary_snapshot(&self) -> BTreeMap<String, i64> {
        self.summary.clone()
    }

    /// Start a unit of work. Same as [`Backend::begin`], but infallible.
    pub fn begin_tx(&mut self) -> MemoryTx<&mut MemoryBackend> {
        MemoryTx::new(self)
    }
}

impl Backend for MemoryBackend {
    type Tx<'a>
        = MemoryTx<&'a mut MemoryBackend>
    where
        Self: 'a;

    fn begin(&mut self) -> Result<Self::Tx<'_>, SummaryError> {
        Ok(self.begin_tx())
    }
}

// ── Shared tables ───────────────────────────────────────────────────

/// A [`MemoryBackend`] shared between threads.
///
/// Clones refer to the same tables. A unit of work holds the lock until it
/// commits or is dropped.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryBackend {
    inner: Arc<Mutex<MemoryBackend>>,
}

impl SharedMemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryBackend::new())),
        }
    }

    /// Run `f` against the tables while holding the lock.
    pub fn with_tables<R>(&self, f: impl FnOnce(&mut MemoryBackend) -> R) -> Result<R, SummaryError> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryBackend>, SummaryError> {
        self.inner
            .lock()
            .map_err(|_| SummaryError::StorageUnavailable("memory tables lock poisoned".into()))
    }
}

impl Backend for SharedMemoryBackend {
    type Tx<'a>
        = MemoryTx<MutexGuard<'a, MemoryBackend>>
    where
        Self: 'a;

    fn begin(&mut self) -> Result<Self::Tx<'_>, SummaryError> {
        Ok(MemoryTx::new(self.lock()?))
    }
}

// ── Unit of work ────────────────────────────────────────────────────

#[derive(Debug)]
enum Undo {
    DetailInserted(i64),
    DetailDeleted(DetailRecord),
    DetailsCleared(BTreeMap<i64, DetailRecord>),
    SummaryInserted(String),
    SummaryUpdated { genre: String, previous: i64 },
    SummaryRemoved { genre: String, previous: i64 },
    SummaryCleared(BTreeMap<String, i64>),
}

/// A unit of work over a [`MemoryBackend`], reached through `G`.
pub struct MemoryTx<G: DerefMut<Target = MemoryBackend>> {
    tables: G,
    undo: Vec<Undo>,
    committed: bool,
}

impl<G: DerefMut<Target = MemoryBackend>> MemoryTx<G> {
    fn new(tables: G) -> Self {
        Self {
            tables,
            undo: Vec::new(),
            committed: false,
        }
    }

    fn rollback(&mut self) {
        let steps = self.undo.len();
        while let Some(step) = self.undo.pop() {
            let t = &mut *self.tables;
            match step {
                Undo::DetailInserted(id) => {
                    t.details.remove(&id);
                }
                Undo::DetailDeleted(record) => {
                    t.details.insert(record.id, record);
                }
                Undo::DetailsCleared(previous) => {
                    t.details = previous;
                }
                Undo::SummaryInserted(genre) => {
                    t.summary.remove(&genre);
                }
                Undo::SummaryUpdated { genre, previous }
                | Undo::SummaryRemoved { genre, previous } => {
                    t.summary.insert(genre, previous);
                }
                Undo::SummaryCleared(previous) => {
                    t.summary = previous;
                }
            }
        }
        if steps > 0 {
            debug!(steps, "memory unit of work rolled back");
        }
    }

    fn check_detail_read(&self) -> Result<(), SummaryError> {
        if self.tables.faults.detail_reads_fail {
            return Err(SummaryError::StorageUnavailable(
                "detail table is unavailable".into(),
            ));
        }
        Ok(())
    }
}

impl<G: DerefMut<Target = MemoryBackend>> Drop for MemoryTx<G> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

impl<G: DerefMut<Target = MemoryBackend>> UnitOfWork for MemoryTx<G> {
    fn insert_detail(&mut self, record: NewDetailRecord) -> Result<DetailRecord, SummaryError> {
        record.validate()?;
        let t = &mut *self.tables;
        spend(&mut t.faults.detail_writes_left, "detail")?;

        let id = t.next_id;
        t.next_id += 1;
        let record = record.with_id(id);
        t.details.insert(id, record.clone());
        self.undo.push(Undo::DetailInserted(id));
        Ok(record)
    }

    fn delete_detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError> {
        let t = &mut *self.tables;
        spend(&mut t.faults.detail_writes_left, "detail")?;

        let removed = t.details.remove(&id);
        if let Some(record) = &removed {
            self.undo.push(Undo::DetailDeleted(record.clone()));
        }
        Ok(removed)
    }

    fn clear_details(&mut self) -> Result<u64, SummaryError> {
        let t = &mut *self.tables;
        spend(&mut t.faults.detail_writes_left, "detail")?;

        let previous = std::mem::take(&mut t.details);
        let cleared = previous.len() as u64;
        self.undo.push(Undo::DetailsCleared(previous));
        Ok(cleared)
    }

    fn detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError> {
        self.check_detail_read()?;
        Ok(self.tables.details.get(&id).cloned())
    }

    fn detail_count(&mut self) -> Result<i64, SummaryError> {
        self.check_detail_read()?;
        Ok(self.tables.details.len() as i64)
    }

    fn detail_genre_counts(&mut self) -> Result<BTreeMap<String, i64>, SummaryError> {
        self.check_detail_read()?;
        let mut counts = BTreeMap::new();
        for record in self.tables.details.values() {
            *counts.entry(record.genre.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn lock_genre(&mut self, _genre: &str) -> Result<(), SummaryError> {
        // The whole backend is exclusively borrowed (or mutex-guarded) for
        // the lifetime of this unit of work.
        Ok(())
    }

    fn lock_summary_exclusive(&mut self) -> Result<(), SummaryError> {
        Ok(())
    }

    fn summary_entry(&mut self, genre: &str) -> Result<Option<SummaryEntry>, SummaryError> {
        Ok(self
            .tables
            .summary
            .get(genre)
            .map(|&count| SummaryEntry::new(genre, count)))
    }

    fn insert_summary_entry(&mut self, entry: &SummaryEntry) -> Result<(), SummaryError> {
        let t = &mut *self.tables;
        spend(&mut t.faults.summary_writes_left, "summary")?;

        if t.summary.contains_key(&entry.genre) {
            return Err(SummaryError::DuplicateGenreKey(entry.genre.clone()));
        }
        t.summary.insert(entry.genre.clone(), entry.total_count);
        self.undo.push(Undo::SummaryInserted(entry.genre.clone()));
        Ok(())
    }

    fn update_summary_count(
        &mut self,
        genre: &str,
        total_count: i64,
    ) -> Result<(), SummaryError> {
        let t = &mut *self.tables;
        spend(&mut t.faults.summary_writes_left, "summary")?;

        let slot = t
            .summary
            .get_mut(genre)
            .ok_or_else(|| SummaryError::NotFound(format!("summary entry for genre '{genre}'")))?;
        let previous = std::mem::replace(slot, total_count);
        self.undo.push(Undo::SummaryUpdated {
            genre: genre.to_string(),
            previous,
        });
        Ok(())
    }

    fn remove_summary_entry(&mut self, genre: &str) -> Result<(), SummaryError> {
        let t = &mut *self.tables;
        spend(&mut t.faults.summary_writes_left, "summary")?;

        if let Some(previous) = t.summary.remove(genre) {
            self.undo.push(Undo::SummaryRemoved {
                genre: genre.to_string(),
                previous,
            });
        }
        Ok(())
    }

    fn clear_summary(&mut self) -> Result<u64, SummaryError> {
        let t = &mut *self.tables;
        spend(&mut t.faults.summary_writes_left, "summary")?;

        let previous = std::mem::take(&mut t.summary);
        let cleared = previous.len() as u64;
        self.undo.push(Undo::SummaryCleared(previous));
        Ok(cleared)
    }

    fn summary_entries(&mut self) -> Result<Vec<SummaryEntry>, SummaryError> {
        Ok(self
            .tables
            .summary
            .iter()
            .map(|(genre, &count)| SummaryEntry::new(genre.clone(), count))
            .collect())
    }

    fn commit(mut self) -> Result<(), SummaryError> {
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}
