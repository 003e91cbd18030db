//! rental_summary: an incrementally maintained top-genre rental summary for
//! the DVD rental sample database.
//!
//! Rentals for the most popular genres are denormalized into a detail table.
//! A per-genre summary of those rows is kept exactly in step with it: every
//! detail insert or delete calls the [`maintainer`] inside the same unit of
//! work, so both tables change together or not at all.
//!
//! # Layout
//!
//! - [`model`]: detail records, summary entries, the report window.
//! - [`store`]: the unit-of-work seam the maintainer writes through.
//! - [`maintainer`]: incremental `on_insert` / `on_delete` and
//!   `full_rebuild`.
//! - [`ledger`]: the host component that wraps each mutation in a unit of
//!   work and checks the summary against the details.
//! - [`memory`] and [`pg`]: the in-process and PostgreSQL backends.
//! - [`upstream`], [`selector`], [`backfill`]: ranking genres over the
//!   upstream relations and bulk-populating the detail table.
//! - [`config`] and [`logging`]: TOML settings and subscriber setup for the
//!   command-line tool.
//!
//! # Invariant
//!
//! After every committed mutation, for every genre `g`:
//! `summary[g].total_count == |{d ∈ details : d.genre == g}|`, and genres
//! with zero detail rows have no summary entry.

pub mod backfill;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod maintainer;
pub mod memory;
pub mod model;
pub mod pg;
pub mod selector;
pub mod store;
pub mod upstream;

pub use error::{SummaryError, SummaryErrorKind};
pub use ledger::RentalLedger;
pub use model::{DetailRecord, NewDetailRecord, ReportWindow, SummaryEntry};
