//! Drives the ledger with byte-encoded insert/delete sequences.
//!
//! Each input byte is one operation: the high bit selects delete, the low
//! bits pick a genre (insert) or a live row (delete). After every operation
//! the summary must match a fresh group-by of the detail table.

#![no_main]

use chrono::NaiveDate;
use libfuzzer_sys::fuzz_target;
use rental_summary::ledger::RentalLedger;
use rental_summary::memory::MemoryBackend;
use rental_summary::model::NewDetailRecord;

const GENRES: [&str; 6] = ["Action", "Comedy", "Drama", "Horror", "Sports", "Travel"];

fuzz_target!(|data: &[u8]| {
    let ts = NaiveDate::from_ymd_opt(2005, 7, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    let mut ledger = RentalLedger::new(MemoryBackend::new());

    for (n, &byte) in data.iter().take(512).enumerate() {
        if byte & 0x80 == 0 {
            let genre = GENRES[usize::from(byte) % GENRES.len()];
            ledger
                .insert(NewDetailRecord {
                    rental_timestamp: ts,
                    customer_id: n as i32,
                    customer_display_name: String::new(),
                    movie_title: String::new(),
                    genre: genre.to_string(),
                    film_id: 1,
                    category_id: 1,
                })
                .unwrap();
        } else {
            let rows = ledger.backend().detail_records();
            if !rows.is_empty() {
                let id = rows[usize::from(byte & 0x7f) % rows.len()].id;
                assert!(ledger.delete(id).unwrap().is_some());
            }
        }
        assert!(ledger.verify().unwrap().is_consistent());
    }
    assert_eq!(ledger.stats().invariant_violations, 0);
});
