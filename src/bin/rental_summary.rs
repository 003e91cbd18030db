//! rental_summary: command-line front end for the top-genre rental summary.
//!
//! Every subcommand opens its own connection. Logs go to stderr; command
//! output goes to stdout as text or JSON.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info};

use rental_summary::backfill::{self, BackfillOptions};
use rental_summary::config::Config;
use rental_summary::ledger::{LoadMode, RentalLedger};
use rental_summary::logging;
use rental_summary::model::{NewDetailRecord, ReportWindow};
use rental_summary::pg::{PgBackend, PgUpstream};
use rental_summary::upstream::UpstreamSource;
use rental_summary::SummaryError;

/// Maintain and inspect the top-genre rental summary
#[derive(Parser, Debug)]
#[command(name = "rental_summary")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "RENTAL_SUMMARY_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string (overrides database.url)
    #[arg(long, env = "RENTAL_SUMMARY_DATABASE_URL")]
    database_url: Option<String>,

    /// Log filter directive (overrides logging.level)
    #[arg(long, env = "RENTAL_SUMMARY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Start of the report window, inclusive (overrides report.window_start)
    #[arg(long, env = "RENTAL_SUMMARY_WINDOW_START", value_parser = parse_timestamp)]
    window_start: Option<NaiveDateTime>,

    /// End of the report window, exclusive (overrides report.window_end)
    #[arg(long, env = "RENTAL_SUMMARY_WINDOW_END", value_parser = parse_timestamp)]
    window_end: Option<NaiveDateTime>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the detail and summary tables if missing
    InitSchema,

    /// Populate the detail table from upstream rentals of the top genres
    Backfill {
        /// How the summary is brought up to date
        #[arg(long, value_enum, default_value_t = Mode::Incremental)]
        mode: Mode,

        /// Number of genres to keep (overrides report.top_n)
        #[arg(long)]
        top: Option<usize>,

        /// Keep existing detail rows instead of replacing them
        #[arg(long)]
        append: bool,
    },

    /// Recompute the summary from the detail table
    Rebuild,

    /// Show the summary, most rented genre first
    Summary,

    /// Rank genres by rentals in the report window, straight from upstream
    TopGenres {
        /// Number of genres to show (overrides report.top_n)
        #[arg(long)]
        top: Option<usize>,
    },

    /// Compare the summary with the detail table; exits 4 on drift
    Verify,

    /// Insert one detail record
    Insert {
        #[arg(long)]
        customer_id: i32,
        #[arg(long)]
        film_id: i32,
        #[arg(long)]
        category_id: i32,
        #[arg(long)]
        genre: String,
        /// Movie title
        #[arg(long)]
        title: String,
        /// Customer display name, e.g. "Mary Smith"
        #[arg(long)]
        customer_name: String,
        /// Rental timestamp, e.g. 2005-07-08 19:03:15
        #[arg(long, value_parser = parse_timestamp)]
        rented_at: NaiveDateTime,
    },

    /// Delete one detail record by id
    Delete {
        /// Detail record id
        id: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Count each row as it is inserted
    Incremental,
    /// Insert everything, then rebuild the summary once
    Rebuild,
}

impl From<Mode> for LoadMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Incremental => LoadMode::Incremental,
            Mode::Rebuild => LoadMode::BulkThenRebuild,
        }
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| {
            NaiveDateTime::parse_from_str(s, fmt).ok().or_else(|| {
                chrono::NaiveDate::parse_from_str(s, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
        })
        .ok_or_else(|| format!("expected a timestamp like 2005-07-08 19:03:15, got '{s}'"))
}

fn load_config(cli: &Cli) -> Result<Config, SummaryError> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(start) = cli.window_start {
        config.report.window_start = start;
    }
    if let Some(end) = cli.window_end {
        config.report.window_end = end;
    }
    config.validate()?;
    Ok(config)
}

fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> Result<(), SummaryError> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)
                .map_err(|e| SummaryError::InternalError(format!("JSON output: {e}")))?;
            println!("{json}");
        }
        OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}

fn ledger(config: &Config) -> Result<RentalLedger<PgBackend>, SummaryError> {
    Ok(RentalLedger::new(PgBackend::connect(&config.database.url)?))
}

fn top_n(flag: Option<usize>, config: &Config) -> Result<usize, SummaryError> {
    match flag.unwrap_or(config.report.top_n) {
        0 => Err(SummaryError::InvalidArgument("--top must be at least 1".into())),
        n => Ok(n),
    }
}

fn run(cli: &Cli, config: &Config) -> Result<ExitCode, SummaryError> {
    let window: ReportWindow = config.window()?;

    match &cli.command {
        Commands::InitSchema => {
            PgBackend::connect(&config.database.url)?.ensure_schema()?;
            emit(cli.format, &"ok", |_| "schema ready".to_string())?;
        }

        Commands::Backfill { mode, top, append } => {
            let options = BackfillOptions {
                window,
                top_n: top_n(*top, config)?,
                mode: (*mode).into(),
                replace_existing: !append,
            };
            let mut backend = PgBackend::connect(&config.database.url)?;
            backend.ensure_schema()?;
            let mut ledger = RentalLedger::new(backend);
            let mut upstream = PgUpstream::connect(&config.database.url)?;
            let report = backfill::backfill(&mut ledger, &mut upstream, &options)?;
            emit(cli.format, &report, |r| {
                let genres: Vec<_> = r.genres.iter().map(|g| g.genre.as_str()).collect();
                format!(
                    "backfilled {} rows for [{}] ({} replaced)",
                    r.load.rows_inserted,
                    genres.join(", "),
                    r.load.rows_replaced
                )
            })?;
        }

        Commands::Rebuild => {
            let report = ledger(config)?.rebuild()?;
            emit(cli.format, &report, |r| {
                format!(
                    "rebuilt summary: {} entries from {} detail rows ({} cleared)",
                    r.entries_written, r.detail_rows, r.entries_cleared
                )
            })?;
        }

        Commands::Summary => {
            let entries = ledger(config)?.summary()?;
            emit(cli.format, &entries, |entries| {
                entries
                    .iter()
                    .map(|e| format!("{:<20} {:>8}", e.genre, e.total_count))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }

        Commands::TopGenres { top } => {
            let n = top_n(*top, config)?;
            let genres = PgUpstream::connect(&config.database.url)?.top_genres(&window, n)?;
            emit(cli.format, &genres, |genres| {
                genres
                    .iter()
                    .map(|g| format!("{:<20} {:>8}", g.genre, g.rental_count))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }

        Commands::Verify => {
            let report = ledger(config)?.verify()?;
            emit(cli.format, &report, |r| {
                if r.is_consistent() {
                    format!("consistent: {} detail rows", r.detail_rows)
                } else {
                    r.drift
                        .iter()
                        .map(|d| {
                            format!("{}: expected {}, found {}", d.genre, d.expected, d.actual)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            })?;
            if let Some(first) = report.drift.first() {
                let e = SummaryError::InvariantViolation {
                    genre: first.genre.clone(),
                };
                error!(error = %e, drifted_genres = report.drift.len(), "summary drift detected");
                return Ok(exit_code(&e));
            }
        }

        Commands::Insert {
            customer_id,
            film_id,
            category_id,
            genre,
            title,
            customer_name,
            rented_at,
        } => {
            let record = NewDetailRecord {
                rental_timestamp: *rented_at,
                customer_id: *customer_id,
                customer_display_name: customer_name.clone(),
                movie_title: title.clone(),
                genre: genre.clone(),
                film_id: *film_id,
                category_id: *category_id,
            };
            let inserted = ledger(config)?.insert(record)?;
            info!(detail_id = inserted.id, genre = %inserted.genre, "detail record inserted");
            emit(cli.format, &inserted, |r| format!("inserted detail record {}", r.id))?;
        }

        Commands::Delete { id } => {
            let Some(removed) = ledger(config)?.delete(*id)? else {
                return Err(SummaryError::NotFound(format!("detail record {id}")));
            };
            emit(cli.format, &removed, |r| {
                format!("deleted detail record {} ({})", r.id, r.genre)
            })?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code(e: &SummaryError) -> ExitCode {
    ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return exit_code(&e);
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("error: {e}");
        return exit_code(&e);
    }

    match run(&cli, &config) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, kind = %e.kind(), retryable = e.is_retryable(), "command failed");
            eprintln!("error: {e}");
            exit_code(&e)
        }
    }
}
