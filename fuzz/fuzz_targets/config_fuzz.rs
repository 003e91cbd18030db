//! Feeds arbitrary text to the TOML config loader. Any input must yield
//! either a validated config or an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rental_summary::config::Config;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(config) = Config::from_toml(text) {
            assert!(config.report.top_n > 0);
            assert!(config.window().is_ok());
        }
    }
});
