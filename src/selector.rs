//! Top-genre selection.
//!
//! The canonical ranking is computed from upstream rentals
//! ([`UpstreamSource::top_genres`](crate::upstream::UpstreamSource::top_genres)),
//! not from the summary table: the summary only holds genres that were
//! already selected, so ranking it again would be self-referential.

use crate::model::GenreCount;

/// Order genres by rental count descending, ties broken by genre name, and
/// keep the first `n`.
///
/// Genres with a non-positive count are never selected.
pub fn rank_genres(mut counts: Vec<GenreCount>, n: usize) -> Vec<GenreCount> {
    counts.retain(|g| g.rental_count > 0);
    counts.sort_by(|a, b| {
        b.rental_count
            .cmp(&a.rental_count)
            .then_with(|| a.genre.cmp(&b.genre))
    });
    counts.truncate(n);
    counts
}

/// Genre names of a ranking, in rank order.
pub fn genre_names(ranked: &[GenreCount]) -> Vec<String> {
    ranked.iter().map(|g| g.genre.clone()).collect()
}
