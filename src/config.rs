//! Configuration for the rental summary tools.
//!
//! Settings are read from a TOML file and may be overridden from the command
//! line or `RENTAL_SUMMARY_*` environment variables. Every field has a
//! default, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [database]
//! url = "postgres://postgres@localhost/dvdrental"
//!
//! [report]
//! window_start = "2005-06-01T00:00:00"
//! window_end = "2005-09-01T00:00:00"
//! top_n = 3
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::SummaryError;
use crate::model::ReportWindow;

/// Default connection string for the sample database.
pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost:5432/dvdrental";

/// Default number of genres kept by the top-genre selector.
pub const DEFAULT_TOP_N: usize = 3;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

/// Where the detail, summary, and upstream tables live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

/// The report window and the number of genres to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub top_n: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        let window = ReportWindow::default();
        Self {
            window_start: window.start,
            window_end: window.end,
            top_n: DEFAULT_TOP_N,
        }
    }
}

/// Log filter and output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `rental_summary=debug`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Read and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, SummaryError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SummaryError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML configuration string.
    pub fn from_toml(content: &str) -> Result<Self, SummaryError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), SummaryError> {
        if self.database.url.trim().is_empty() {
            return Err(SummaryError::Config("database.url must not be empty".into()));
        }
        if self.report.top_n == 0 {
            return Err(SummaryError::Config("report.top_n must be at least 1".into()));
        }
        self.window()?;
        Ok(())
    }

    /// The configured report window.
    pub fn window(&self) -> Result<ReportWindow, SummaryError> {
        ReportWindow::new(self.report.window_start, self.report.window_end)
            .map_err(|e| SummaryError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.report.top_n, 3);
        assert_eq!(config.window().unwrap(), ReportWindow::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config = Config::from_toml(
            r#"
            [report]
            top_n = 5

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.report.top_n, 5);
        assert_eq!(config.report.window_start, ReportWindow::default().start);
        assert!(config.logging.json);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
    }

    #[test]
    fn test_window_parsed_from_toml() {
        let config = Config::from_toml(
            r#"
            [report]
            window_start = "2005-07-01T00:00:00"
            window_end = "2005-08-01T00:00:00"
            "#,
        )
        .unwrap();
        let w = config.window().unwrap();
        assert_eq!(w.start.to_string(), "2005-07-01 00:00:00");
        assert_eq!(w.end.to_string(), "2005-08-01 00:00:00");
    }

    #[test]
    fn test_inverted_window_rejected() {
        let err = Config::from_toml(
            r#"
            [report]
            window_start = "2005-09-01T00:00:00"
            window_end = "2005-06-01T00:00:00"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SummaryError::Config(_)));
    }

    #[test]
    fn test_zero_top_n_rejected() {
        let err = Config::from_toml("[report]\ntop_n = 0\n").unwrap_err();
        assert!(err.to_string().contains("top_n"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::from_toml("[report]\ntop = 3\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nurl = \"postgres://u@db/rentals\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "postgres://u@db/rentals");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/rental_summary.toml")).unwrap_err();
        assert!(matches!(err, SummaryError::Config(_)));
    }
}
