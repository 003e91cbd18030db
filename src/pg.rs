//! PostgreSQL storage for the detail and summary tables, and the upstream
//! queries over the DVD rental sample database.
//!
//! # Tables
//!
//! - `rental_details`: one row per qualifying rental, keyed by a generated
//!   `detail_id`. `customer_id`, `film_id` and `category_id` point at the
//!   upstream relations; their integrity is enforced outside this crate.
//! - `rental_summary`: one row per genre, keyed by `genre`. The CHECK
//!   constraint mirrors the rule that zero-count genres are removed.
//!
//! # Concurrency
//!
//! Each unit of work is one `postgres::Transaction`. Before reading a
//! genre's summary row the maintainer calls [`UnitOfWork::lock_genre`],
//! which takes `pg_advisory_xact_lock` on a 64-bit hash of the genre label.
//! The lock is held until commit or rollback, so two transactions cannot
//! both observe a genre as absent and both insert it, and concurrent
//! increments of the same genre cannot be lost.
//!
//! Whole-table rewrites of the summary (rebuild, replacing load) first take
//! `LOCK TABLE rental_summary IN EXCLUSIVE MODE`, then group the detail
//! table. Incremental writers queue behind that lock, so nothing committed
//! between the group-by and the rewrite is lost. When a unit of work needs
//! several genre locks it takes them in sorted order, and always before the
//! table lock.
//!
//! Read-only units of work run at REPEATABLE READ.

use std::collections::BTreeMap;

use postgres::{Client, IsolationLevel, NoTls, Row, Transaction};
use tracing::{debug, info};
use xxhash_rust::xxh64;

use crate::error::SummaryError;
use crate::model::{DetailRecord, GenreCount, NewDetailRecord, ReportWindow, SummaryEntry};
use crate::store::{Backend, UnitOfWork};
use crate::upstream::UpstreamSource;

/// DDL for the detail and summary tables. Safe to run repeatedly.
pub const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS rental_details (
    detail_id             BIGSERIAL PRIMARY KEY,
    rental_timestamp      TIMESTAMP NOT NULL,
    customer_id           INT NOT NULL,
    customer_display_name TEXT NOT NULL,
    movie_title           TEXT NOT NULL,
    genre                 TEXT NOT NULL,
    film_id               INT NOT NULL,
    category_id           INT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rental_details_genre ON rental_details (genre);

CREATE TABLE IF NOT EXISTS rental_summary (
    genre       TEXT PRIMARY KEY,
    total_count BIGINT NOT NULL CHECK (total_count > 0)
);
"#;

/// Fixed seed so that every process derives the same lock key for a genre.
const GENRE_LOCK_SEED: u64 = 0x517cc1b727220a95;

/// Advisory lock key for a genre label.
pub fn genre_lock_key(genre: &str) -> i64 {
    xxh64::xxh64(genre.as_bytes(), GENRE_LOCK_SEED) as i64
}

const DETAIL_COLUMNS: &str = "detail_id, rental_timestamp, customer_id, customer_display_name, \
                              movie_title, genre, film_id, category_id";

fn detail_from_row(row: &Row) -> Result<DetailRecord, SummaryError> {
    Ok(DetailRecord {
        id: row.try_get("detail_id")?,
        rental_timestamp: row.try_get("rental_timestamp")?,
        customer_id: row.try_get("customer_id")?,
        customer_display_name: row.try_get("customer_display_name")?,
        movie_title: row.try_get("movie_title")?,
        genre: row.try_get("genre")?,
        film_id: row.try_get("film_id")?,
        category_id: row.try_get("category_id")?,
    })
}

fn summary_from_row(row: &Row) -> Result<SummaryEntry, SummaryError> {
    Ok(SummaryEntry {
        genre: row.try_get("genre")?,
        total_count: row.try_get("total_count")?,
    })
}

fn connect(url: &str) -> Result<Client, SummaryError> {
    Client::connect(url, NoTls).map_err(|e| {
        SummaryError::StorageUnavailable(format!("could not connect to database: {e}"))
    })
}

// ── Backend ─────────────────────────────────────────────────────────

/// Detail and summary tables in a PostgreSQL database.
pub struct PgBackend {
    client: Client,
}

impl PgBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect without TLS.
    pub fn connect(url: &str) -> Result<Self, SummaryError> {
        Ok(Self::new(connect(url)?))
    }

    /// Create the detail and summary tables if they do not exist.
    pub fn ensure_schema(&mut self) -> Result<(), SummaryError> {
        self.client.batch_execute(SCHEMA_DDL)?;
        info!("rental_details / rental_summary schema ensured");
        Ok(())
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl Backend for PgBackend {
    type Tx<'a>
        = PgTx<'a>
    where
        Self: 'a;

    fn begin(&mut self) -> Result<Self::Tx<'_>, SummaryError> {
        Ok(PgTx {
            tx: self.client.transaction()?,
        })
    }

    /// REPEATABLE READ, so the detail group-by and the summary scan of one
    /// `verify` come from the same snapshot.
    fn begin_read(&mut self) -> Result<Self::Tx<'_>, SummaryError> {
        let tx = self
            .client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()?;
        Ok(PgTx { tx })
    }
}

/// A unit of work backed by one PostgreSQL transaction.
///
/// Dropping it without commit rolls the transaction back.
pub struct PgTx<'a> {
    tx: Transaction<'a>,
}

impl UnitOfWork for PgTx<'_> {
    fn insert_detail(&mut self, record: NewDetailRecord) -> Result<DetailRecord, SummaryError> {
        record.validate()?;
        let row = self.tx.query_one(
            "INSERT INTO rental_details \
                 (rental_timestamp, customer_id, customer_display_name, \
                  movie_title, genre, film_id, category_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING detail_id",
            &[
                &record.rental_timestamp,
                &record.customer_id,
                &record.customer_display_name,
                &record.movie_title,
                &record.genre,
                &record.film_id,
                &record.category_id,
            ],
        )?;
        let id: i64 = row.try_get("detail_id")?;
        Ok(record.with_id(id))
    }

    fn delete_detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError> {
        let row = self.tx.query_opt(
            format!("DELETE FROM rental_details WHERE detail_id = $1 RETURNING {DETAIL_COLUMNS}").as_str(),
            &[&id],
        )?;
        row.as_ref().map(detail_from_row).transpose()
    }

    fn clear_details(&mut self) -> Result<u64, SummaryError> {
        Ok(self.tx.execute("DELETE FROM rental_details", &[])?)
    }

    fn detail(&mut self, id: i64) -> Result<Option<DetailRecord>, SummaryError> {
        let row = self.tx.query_opt(
            format!("SELECT {DETAIL_COLUMNS} FROM rental_details WHERE detail_id = $1").as_str(),
            &[&id],
        )?;
        row.as_ref().map(detail_from_row).transpose()
    }

    fn detail_count(&mut self) -> Result<i64, SummaryError> {
        let row = self
            .tx
            .query_one("SELECT count(*) AS n FROM rental_details", &[])?;
        Ok(row.try_get("n")?)
    }

    fn detail_genre_counts(&mut self) -> Result<BTreeMap<String, i64>, SummaryError> {
        let rows = self.tx.query(
            "SELECT genre, count(*) AS n FROM rental_details GROUP BY genre",
            &[],
        )?;
        let mut counts = BTreeMap::new();
        for row in &rows {
            counts.insert(row.try_get("genre")?, row.try_get("n")?);
        }
        Ok(counts)
    }

    fn lock_genre(&mut self, genre: &str) -> Result<(), SummaryError> {
        let key = genre_lock_key(genre);
        self.tx
            .execute("SELECT pg_advisory_xact_lock($1)", &[&key])?;
        debug!(genre, key, "genre lock acquired");
        Ok(())
    }

    fn lock_summary_exclusive(&mut self) -> Result<(), SummaryError> {
        // EXCLUSIVE conflicts with the ROW SHARE of `FOR UPDATE` and the ROW
        // EXCLUSIVE of writes, but still admits plain readers.
        self.tx
            .batch_execute("LOCK TABLE rental_summary IN EXCLUSIVE MODE")?;
        debug!("summary table locked");
        Ok(())
    }

    fn summary_entry(&mut self, genre: &str) -> Result<Option<SummaryEntry>, SummaryError> {
        let row = self.tx.query_opt(
            "SELECT genre, total_count FROM rental_summary WHERE genre = $1 FOR UPDATE",
            &[&genre],
        )?;
        row.as_ref().map(summary_from_row).transpose()
    }

    fn insert_summary_entry(&mut self, entry: &SummaryEntry) -> Result<(), SummaryError> {
        self.tx
            .execute(
                "INSERT INTO rental_summary (genre, total_count) VALUES ($1, $2)",
                &[&entry.genre, &entry.total_count],
            )
            .map_err(|e| match SummaryError::from(e) {
                SummaryError::DuplicateGenreKey(_) => {
                    SummaryError::DuplicateGenreKey(entry.genre.clone())
                }
                other => other,
            })?;
        Ok(())
    }

    fn update_summary_count(
        &mut self,
        genre: &str,
        total_count: i64,
    ) -> Result<(), SummaryError> {
        let updated = self.tx.execute(
            "UPDATE rental_summary SET total_count = $2 WHERE genre = $1",
            &[&genre, &total_count],
        )?;
        if updated == 0 {
            return Err(SummaryError::NotFound(format!(
                "summary entry for genre '{genre}'"
            )));
        }
        Ok(())
    }

    fn remove_summary_entry(&mut self, genre: &str) -> Result<(), SummaryError> {
        self.tx
            .execute("DELETE FROM rental_summary WHERE genre = $1", &[&genre])?;
        Ok(())
    }

    fn clear_summary(&mut self) -> Result<u64, SummaryError> {
        Ok(self.tx.execute("DELETE FROM rental_summary", &[])?)
    }

    fn summary_entries(&mut self) -> Result<Vec<SummaryEntry>, SummaryError> {
        let rows = self
            .tx
            .query("SELECT genre, total_count FROM rental_summary", &[])?;
        rows.iter().map(summary_from_row).collect()
    }

    fn commit(self) -> Result<(), SummaryError> {
        self.tx.commit()?;
        Ok(())
    }
}

// ── Upstream ────────────────────────────────────────────────────────

/// Joins every rental to its film, genre and customer. Inner joins: rentals
/// with a dangling reference are dropped.
const UPSTREAM_JOIN: &str = "\
    FROM rental r \
    JOIN inventory i      ON i.inventory_id = r.inventory_id \
    JOIN film f           ON f.film_id = i.film_id \
    JOIN film_category fc ON fc.film_id = f.film_id \
    JOIN category c       ON c.category_id = fc.category_id \
    JOIN customer cu      ON cu.customer_id = r.customer_id \
    WHERE r.rental_date >= $1 AND r.rental_date < $2";

/// Reads the upstream DVD rental relations.
pub struct PgUpstream {
    client: Client,
}

impl PgUpstream {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect without TLS.
    pub fn connect(url: &str) -> Result<Self, SummaryError> {
        Ok(Self::new(connect(url)?))
    }
}

fn genre_count_from_row(row: &Row) -> Result<GenreCount, SummaryError> {
    Ok(GenreCount {
        genre: row.try_get("genre")?,
        rental_count: row.try_get("rental_count")?,
    })
}

impl UpstreamSource for PgUpstream {
    fn genre_rental_counts(
        &mut self,
        window: &ReportWindow,
    ) -> Result<Vec<GenreCount>, SummaryError> {
        let rows = self.client.query(
            format!(
                "SELECT c.name::text AS genre, count(*)::bigint AS rental_count \
                 {UPSTREAM_JOIN} \
                 GROUP BY c.name"
            ).as_str(),
            &[&window.start, &window.end],
        )?;
        rows.iter().map(genre_count_from_row).collect()
    }

    fn top_genres(
        &mut self,
        window: &ReportWindow,
        n: usize,
    ) -> Result<Vec<GenreCount>, SummaryError> {
        let limit = i64::try_from(n)
            .map_err(|_| SummaryError::InvalidArgument(format!("top_n {n} is too large")))?;
        let rows = self.client.query(
            format!(
                "SELECT c.name::text AS genre, count(*)::bigint AS rental_count \
                 {UPSTREAM_JOIN} \
                 GROUP BY c.name \
                 ORDER BY rental_count DESC, genre ASC \
                 LIMIT $3"
            ).as_str(),
            &[&window.start, &window.end, &limit],
        )?;
        rows.iter().map(genre_count_from_row).collect()
    }

    fn qualifying_rentals(
        &mut self,
        window: &ReportWindow,
        genres: &[String],
    ) -> Result<Vec<NewDetailRecord>, SummaryError> {
        let rows = self.client.query(
            format!(
                "SELECT r.rental_date::timestamp AS rental_timestamp, \
                        cu.customer_id::int AS customer_id, \
                        (cu.first_name || ' ' || cu.last_name)::text AS customer_display_name, \
                        f.title::text AS movie_title, \
                        c.name::text AS genre, \
                        f.film_id::int AS film_id, \
                        c.category_id::int AS category_id \
                 {UPSTREAM_JOIN} \
                   AND c.name = ANY($3) \
                 ORDER BY r.rental_date, r.rental_id"
            ).as_str(),
            &[&window.start, &window.end, &genres],
        )?;
        rows.iter()
            .map(|row| {
                Ok(NewDetailRecord {
                    rental_timestamp: row.try_get("rental_timestamp")?,
                    customer_id: row.try_get("customer_id")?,
                    customer_display_name: row.try_get("customer_display_name")?,
                    movie_title: row.try_get("movie_title")?,
                    genre: row.try_get("genre")?,
                    film_id: row.try_get("film_id")?,
                    category_id: row.try_get("category_id")?,
                })
            })
            .collect()
    }
}
