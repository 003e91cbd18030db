//! Read-only access to the upstream rental relations.
//!
//! The detail store is fed from six upstream relations of the DVD rental
//! sample database: `rental`, `inventory`, `film`, `film_category`,
//! `category` and `customer`. [`UpstreamSource`] is the seam; the
//! PostgreSQL implementation lives in [`crate::pg`], and
//! [`UpstreamSnapshot`] holds the same relations in memory.
//!
//! Joins are inner joins, as in SQL: a rental whose inventory, film,
//! category or customer row is missing does not qualify.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::SummaryError;
use crate::model::{GenreCount, NewDetailRecord, ReportWindow};
use crate::selector;

/// Queries the backfill and the top-genre selector need from upstream.
pub trait UpstreamSource {
    /// Rentals per genre within `window`, in no particular order.
    fn genre_rental_counts(
        &mut self,
        window: &ReportWindow,
    ) -> Result<Vec<GenreCount>, SummaryError>;

    /// The `n` most rented genres within `window`.
    fn top_genres(
        &mut self,
        window: &ReportWindow,
        n: usize,
    ) -> Result<Vec<GenreCount>, SummaryError> {
        Ok(selector::rank_genres(self.genre_rental_counts(window)?, n))
    }

    /// Denormalized detail rows for rentals within `window` whose genre is
    /// one of `genres`, ordered by rental timestamp then rental id.
    fn qualifying_rentals(
        &mut self,
        window: &ReportWindow,
        genres: &[String],
    ) -> Result<Vec<NewDetailRecord>, SummaryError>;
}

// ── In-memory relations ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub rental_id: i32,
    pub rental_date: NaiveDateTime,
    pub inventory_id: i32,
    pub customer_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub inventory_id: i32,
    pub film_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Film {
    pub film_id: i32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmCategory {
    pub film_id: i32,
    pub category_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub category_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: i32,
    pub first_name: String,
    pub last_name: String,
}

impl Customer {
    /// `first_name || ' ' || last_name`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// The upstream relations held in memory.
///
/// Deserializable from JSON so fixtures can be kept alongside tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamSnapshot {
    #[serde(default)]
    pub rentals: Vec<Rental>,
    #[serde(default)]
    pub inventory: Vec<Inventory>,
    #[serde(default)]
    pub films: Vec<Film>,
    #[serde(default)]
    pub film_categories: Vec<FilmCategory>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub customers: Vec<Customer>,
}

/// One rental joined through to its genre and customer.
struct JoinedRental<'a> {
    rental: &'a Rental,
    film: &'a Film,
    category: &'a Category,
    customer: &'a Customer,
}

impl UpstreamSnapshot {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Rentals in `window`, joined through every upstream relation.
    fn joined(&self, window: &ReportWindow) -> Vec<JoinedRental<'_>> {
        let inventory: HashMap<i32, &Inventory> =
            self.inventory.iter().map(|i| (i.inventory_id, i)).collect();
        let films: HashMap<i32, &Film> = self.films.iter().map(|f| (f.film_id, f)).collect();
        let categories: HashMap<i32, &Category> =
            self.categories.iter().map(|c| (c.category_id, c)).collect();
        let customers: HashMap<i32, &Customer> =
            self.customers.iter().map(|c| (c.customer_id, c)).collect();
        let mut film_categories: HashMap<i32, Vec<i32>> = HashMap::new();
        for fc in &self.film_categories {
            film_categories
                .entry(fc.film_id)
                .or_default()
                .push(fc.category_id);
        }

        let mut joined = Vec::new();
        for rental in self.rentals.iter().filter(|r| window.contains(r.rental_date)) {
            let Some(&inv) = inventory.get(&rental.inventory_id) else {
                continue;
            };
            let Some(&film) = films.get(&inv.film_id) else {
                continue;
            };
            let Some(&customer) = customers.get(&rental.customer_id) else {
                continue;
            };
            for category_id in film_categories.get(&film.film_id).into_iter().flatten() {
                if let Some(&category) = categories.get(category_id) {
                    joined.push(JoinedRental {
                        rental,
                        film,
                        category,
                        customer,
                    });
                }
            }
        }
        joined
    }
}

impl UpstreamSource for UpstreamSnapshot {
    fn genre_rental_counts(
        &mut self,
        window: &ReportWindow,
    ) -> Result<Vec<GenreCount>, SummaryError> {
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for row in self.joined(window) {
            *counts.entry(row.category.name.as_str()).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(genre, rental_count)| GenreCount {
                genre: genre.to_string(),
                rental_count,
            })
            .collect())
    }

    fn qualifying_rentals(
        &mut self,
        window: &ReportWindow,
        genres: &[String],
    ) -> Result<Vec<NewDetailRecord>, SummaryError> {
        let mut rows: Vec<_> = self
            .joined(window)
            .into_iter()
            .filter(|row| genres.iter().any(|g| *g == row.category.name))
            .collect();
        rows.sort_by_key(|row| (row.rental.rental_date, row.rental.rental_id));

        Ok(rows
            .into_iter()
            .map(|row| NewDetailRecord {
                rental_timestamp: row.rental.rental_date,
                customer_id: row.customer.customer_id,
                customer_display_name: row.customer.display_name(),
                movie_title: row.film.title.clone(),
                genre: row.category.name.clone(),
                film_id: row.film.film_id,
                category_id: row.category.category_id,
            })
            .collect())
    }
}
