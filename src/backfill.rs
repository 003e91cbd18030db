//! Bulk population of the detail store from upstream rentals.
//!
//! A backfill ranks genres over the report window, keeps the top `n`, pulls
//! every qualifying rental for those genres, and hands the rows to
//! [`RentalLedger::load`] so that the summary is either maintained row by
//! row or rebuilt once at the end.

use serde::Serialize;
use tracing::info;

use crate::error::SummaryError;
use crate::ledger::{LoadMode, LoadReport, RentalLedger};
use crate::model::{GenreCount, ReportWindow};
use crate::selector;
use crate::store::Backend;
use crate::upstream::UpstreamSource;

/// Parameters of one backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillOptions {
    pub window: ReportWindow,
    pub top_n: usize,
    pub mode: LoadMode,
    /// Empty the detail and summary tables before loading.
    pub replace_existing: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            window: ReportWindow::default(),
            top_n: 3,
            mode: LoadMode::Incremental,
            replace_existing: true,
        }
    }
}

/// Result of a backfill run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub window: ReportWindow,
    /// The selected genres, in rank order.
    pub genres: Vec<GenreCount>,
    pub load: LoadReport,
}

/// Populate the detail store for the top genres of `options.window`.
pub fn backfill<B, S>(
    ledger: &mut RentalLedger<B>,
    source: &mut S,
    options: &BackfillOptions,
) -> Result<BackfillReport, SummaryError>
where
    B: Backend,
    S: UpstreamSource + ?Sized,
{
    if options.top_n == 0 {
        return Err(SummaryError::InvalidArgument(
            "backfill needs at least one genre (top_n = 0)".into(),
        ));
    }

    let genres = source.top_genres(&options.window, options.top_n)?;
    let names = selector::genre_names(&genres);
    info!(
        genres = ?names,
        start = %options.window.start,
        end = %options.window.end,
        "top genres selected for backfill"
    );

    let rows = source.qualifying_rentals(&options.window, &names)?;
    let load = ledger.load(rows, options.mode, options.replace_existing)?;

    Ok(BackfillReport {
        window: options.window,
        genres,
        load,
    })
}
