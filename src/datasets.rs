//! Loading the MovieLens 100K files.
//!
//! The `u.data` file holds one tab-separated `user item rating timestamp`
//! row per rating. Rows with ratings outside the 1-5 scale are dropped.
//! Exact repeats of a row are dropped, and when the same (user, item) pair
//! appears with different ratings the row with the latest timestamp is
//! kept, so the result always satisfies the one-rating-per-pair rule of
//! [`RatingTable`].
//!
//! The `u.item` file is a `|`-separated, latin-1 encoded movie catalog:
//! id, title, release date, video release date, IMDb URL and one 0/1 flag
//! per genre.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{info, warn};

use crate::data::{Rating, RatingScale, RatingTable};
use crate::{ItemId, Timestamp, UserId};

/// Genre columns of `u.item`, in file order.
pub const GENRES: [&str; 19] = [
    "unknown",
    "Action",
    "Adventure",
    "Animation",
    "Children's",
    "Comedy",
    "Crime",
    "Documentary",
    "Drama",
    "Fantasy",
    "Film-Noir",
    "Horror",
    "Musical",
    "Mystery",
    "Romance",
    "Sci-Fi",
    "Thriller",
    "War",
    "Western",
];

const GENRE_OFFSET: usize = 5;

#[derive(Debug, Deserialize)]
struct MovielensRow {
    user_id: UserId,
    item_id: ItemId,
    rating: f32,
    timestamp: Timestamp,
}

/// What happened while loading a ratings file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Rows read.
    pub rows: usize,
    /// Rows dropped because the rating was outside the scale.
    pub invalid_ratings: usize,
    /// Rows dropped because their (user, item) pair was already present.
    pub duplicates: usize,
    /// Kept ratings per star value, from 1 to 5.
    pub rating_counts: [usize; 5],
    /// Fraction of the user-item matrix without a rating.
    pub sparsity: f64,
}

/// Read MovieLens `u.data` rows from `reader`.
pub fn read_movielens<R: Read>(reader: R) -> Result<(RatingTable, LoadSummary), failure::Error> {
    let scale = RatingScale::default();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_reader(reader);

    let mut summary = LoadSummary::default();
    let mut ratings: Vec<Rating> = Vec::new();
    let mut positions: HashMap<(UserId, ItemId), usize> = HashMap::new();

    for row in reader.deserialize() {
        let row: MovielensRow = row?;
        summary.rows += 1;

        if !row.rating.is_finite() || !scale.contains(row.rating) {
            summary.invalid_ratings += 1;
            continue;
        }

        let rating = Rating::new(row.user_id, row.item_id, row.rating).with_timestamp(row.timestamp);

        match positions.entry((row.user_id, row.item_id)) {
            Entry::Occupied(entry) => {
                summary.duplicates += 1;
                let existing = &mut ratings[*entry.get()];
                if existing.timestamp() <= rating.timestamp() {
                    *existing = rating;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(ratings.len());
                ratings.push(rating);
            }
        }
    }

    if summary.invalid_ratings > 0 || summary.duplicates > 0 {
        warn!(
            invalid_ratings = summary.invalid_ratings,
            duplicates = summary.duplicates,
            "Dropped rating rows"
        );
    }

    let table = RatingTable::build(ratings, scale)?;

    for rating in table.observations() {
        let star = (rating.rating().round() as usize).max(1).min(5);
        summary.rating_counts[star - 1] += 1;
    }
    summary.sparsity = table.sparsity();

    info!(
        rows = summary.rows,
        ratings = table.len(),
        users = table.num_users(),
        items = table.num_items(),
        rating_counts = ?summary.rating_counts,
        sparsity = summary.sparsity,
        "Loaded MovieLens ratings"
    );

    Ok((table, summary))
}

/// Load a MovieLens `u.data` file.
pub fn load_movielens<P: AsRef<Path>>(path: P) -> Result<RatingTable, failure::Error> {
    let file = File::open(path)?;
    let (table, _) = read_movielens(file)?;

    Ok(table)
}

/// A movie from the `u.item` catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    /// Item id, as used in `u.data`.
    pub item_id: ItemId,
    /// Title, usually ending in the release year, e.g. `Toy Story (1995)`.
    pub title: String,
    /// Year parsed from a trailing `(YYYY)` in the title.
    pub release_year: Option<u16>,
    /// Flagged genres other than `unknown`, in file order.
    pub genres: Vec<String>,
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| char::from(byte)).collect()
}

fn release_year(title: &str) -> Option<u16> {
    let inner = title.strip_suffix(')')?;
    let split = inner.len().checked_sub(4)?;
    let (head, year) = (inner.get(..split)?, inner.get(split..)?);

    if !head.ends_with('(') || !year.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    year.parse().ok()
}

/// Read the `u.item` movie catalog from `reader`, keyed by item id.
///
/// Later rows repeating an item id are ignored.
pub fn read_movielens_items<R: Read>(reader: R) -> Result<HashMap<ItemId, Movie>, failure::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(reader);

    let mut movies = HashMap::new();
    let mut duplicates = 0;

    for record in reader.byte_records() {
        let record = record?;

        if record.len() < GENRE_OFFSET + GENRES.len() {
            return Err(format_err!(
                "Expected {} fields in item row, got {}.",
                GENRE_OFFSET + GENRES.len(),
                record.len()
            ));
        }

        let item_id: ItemId = latin1(&record[0]).trim().parse()?;
        let title = latin1(&record[1]).trim().to_owned();
        let genres = GENRES
            .iter()
            .zip(record.iter().skip(GENRE_OFFSET))
            .skip(1)
            .filter(|&(_, flag)| flag == b"1")
            .map(|(&genre, _)| genre.to_owned())
            .collect();

        match movies.entry(item_id) {
            Entry::Occupied(_) => duplicates += 1,
            Entry::Vacant(entry) => {
                entry.insert(Movie {
                    item_id,
                    release_year: release_year(&title),
                    title,
                    genres,
                });
            }
        }
    }

    if duplicates > 0 {
        warn!(duplicates, "Dropped repeated item rows");
    }
    info!(movies = movies.len(), "Loaded MovieLens catalog");

    Ok(movies)
}

/// Load a MovieLens `u.item` file.
pub fn load_movielens_items<P: AsRef<Path>>(
    path: P,
) -> Result<HashMap<ItemId, Movie>, failure::Error> {
    read_movielens_items(File::open(path)?)
}
