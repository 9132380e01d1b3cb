//! Pairwise user-user and item-item similarities.
//!
//! Similarities are computed over the co-rated set only: for two users,
//! the items both have rated; for two items, the users who rated both.
//! Pairs with fewer co-ratings than the configured minimum overlap, or
//! whose similarity is undefined (zero variance), have no entry and
//! contribute nothing to neighbourhood predictions.
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use tracing::info;

use crate::data::RatingTable;

/// Whether similarities are computed between users or between items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimilarityMode {
    /// User-user similarity.
    User,
    /// Item-item similarity.
    Item,
}

/// Similarity measure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimilarityMetric {
    /// Pearson correlation, centred on the co-rated means.
    Pearson,
    /// Cosine of the raw co-rated rating vectors.
    Cosine,
}

fn ratings_of(table: &RatingTable, mode: SimilarityMode, entity: u32) -> &[(u32, f32)] {
    match mode {
        SimilarityMode::User => table.items_of(entity),
        SimilarityMode::Item => table.users_of(entity),
    }
}

fn co_rated(left: &[(u32, f32)], right: &[(u32, f32)]) -> Vec<(f32, f32)> {
    let mut shared = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < left.len() && j < right.len() {
        match left[i].0.cmp(&right[j].0) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                shared.push((left[i].1, right[j].1));
                i += 1;
                j += 1;
            }
        }
    }

    shared
}

/// Compute the similarity between `a` and `b` directly from `table`.
///
/// Returns `None` when the co-rated set is smaller than `min_overlap` or
/// the measure is undefined on it.
pub fn similarity(
    table: &RatingTable,
    mode: SimilarityMode,
    metric: SimilarityMetric,
    min_overlap: usize,
    a: u32,
    b: u32,
) -> Option<f32> {
    let shared = co_rated(ratings_of(table, mode, a), ratings_of(table, mode, b));

    if shared.is_empty() || shared.len() < min_overlap {
        return None;
    }

    let (mean_a, mean_b) = match metric {
        SimilarityMetric::Pearson => {
            let n = shared.len() as f64;
            let sum_a: f64 = shared.iter().map(|&(x, _)| f64::from(x)).sum();
            let sum_b: f64 = shared.iter().map(|&(_, y)| f64::from(y)).sum();
            (sum_a / n, sum_b / n)
        }
        SimilarityMetric::Cosine => (0.0, 0.0),
    };

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);

    for &(x, y) in &shared {
        let x = f64::from(x) - mean_a;
        let y = f64::from(y) - mean_b;

        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();

    if denominator <= ::std::f64::EPSILON {
        return None;
    }

    Some((dot / denominator).max(-1.0).min(1.0) as f32)
}

fn by_similarity(x: &(u32, f32), y: &(u32, f32)) -> Ordering {
    y.1.partial_cmp(&x.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| x.0.cmp(&y.0))
}

/// Identifies the data and settings an index was computed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexKey {
    /// Fingerprint of the source table.
    pub fingerprint: u64,
    /// Users or items.
    pub mode: SimilarityMode,
    /// Similarity measure.
    pub metric: SimilarityMetric,
    /// Minimum co-rated set size.
    pub min_overlap: usize,
}

/// An owned, eagerly computed cache of pairwise similarities.
///
/// The index remembers the fingerprint of the table it was built from;
/// use [`SimilarityIndex::is_built_from`] before combining it with a
/// table, and [`SimilarityIndex::rebuild`] to recompute it.
#[derive(Clone, Debug)]
pub struct SimilarityIndex {
    key: IndexKey,
    pairs: HashMap<(u32, u32), f32>,
    neighbors: HashMap<u32, Vec<(u32, f32)>>,
}

impl SimilarityIndex {
    /// Compute all defined similarities between entities of `table`.
    ///
    /// Only pairs sharing at least one co-rating are considered. Rows are
    /// processed in parallel and merged once every row is done.
    pub fn build(
        table: &RatingTable,
        mode: SimilarityMode,
        metric: SimilarityMetric,
        min_overlap: usize,
    ) -> Self {
        let key = IndexKey {
            fingerprint: table.fingerprint(),
            mode,
            metric,
            min_overlap,
        };
        let (pairs, neighbors) = compute(table, &key);

        info!(
            mode = ?mode,
            metric = ?metric,
            entities = neighbors.len(),
            pairs = pairs.len(),
            "Built similarity index"
        );

        SimilarityIndex {
            key,
            pairs,
            neighbors,
        }
    }

    /// Discard all cached similarities and recompute them from `table`
    /// with the same settings.
    pub fn rebuild(&mut self, table: &RatingTable) {
        *self = Self::build(table, self.key.mode, self.key.metric, self.key.min_overlap);
    }

    /// Whether this index was computed from `table`.
    pub fn is_built_from(&self, table: &RatingTable) -> bool {
        self.key.fingerprint == table.fingerprint()
    }

    /// The cache key of this index.
    pub fn key(&self) -> IndexKey {
        self.key
    }

    /// Users or items.
    pub fn mode(&self) -> SimilarityMode {
        self.key.mode
    }

    /// Similarity measure.
    pub fn metric(&self) -> SimilarityMetric {
        self.key.metric
    }

    /// Number of pairs with a defined similarity.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pair has a defined similarity.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The similarity of `a` and `b`, if defined. Self-similarity is
    /// never defined.
    pub fn get(&self, a: u32, b: u32) -> Option<f32> {
        let key = if a < b { (a, b) } else { (b, a) };
        self.pairs.get(&key).cloned()
    }

    /// The similarity of `a` and `b`, with undefined pairs counting as 0.
    pub fn similarity(&self, a: u32, b: u32) -> f32 {
        self.get(a, b).unwrap_or(0.0)
    }

    /// Up to `k` entities most similar to `entity`, by descending
    /// similarity with ties broken by ascending id.
    pub fn neighbors(&self, entity: u32, k: usize) -> &[(u32, f32)] {
        match self.neighbors.get(&entity) {
            Some(neighbors) => &neighbors[..k.min(neighbors.len())],
            None => &[],
        }
    }
}

type Pairs = HashMap<(u32, u32), f32>;
type Neighbors = HashMap<u32, Vec<(u32, f32)>>;

fn compute(table: &RatingTable, key: &IndexKey) -> (Pairs, Neighbors) {
    let (entities, opposite) = match key.mode {
        SimilarityMode::User => (table.user_ids(), SimilarityMode::Item),
        SimilarityMode::Item => (table.item_ids(), SimilarityMode::User),
    };

    let rows: Vec<Vec<(u32, u32, f32)>> = entities
        .par_iter()
        .map(|&a| {
            let candidates: BTreeSet<u32> = ratings_of(table, key.mode, a)
                .iter()
                .flat_map(|&(shared, _)| ratings_of(table, opposite, shared).iter())
                .map(|&(b, _)| b)
                .filter(|&b| b > a)
                .collect();

            candidates
                .into_iter()
                .filter_map(|b| {
                    similarity(table, key.mode, key.metric, key.min_overlap, a, b)
                        .map(|sim| (a, b, sim))
                })
                .collect::<Vec<_>>()
        })
        .collect();

    let mut pairs = HashMap::new();
    let mut neighbors: Neighbors = HashMap::new();

    for (a, b, sim) in rows.into_iter().flatten() {
        pairs.insert((a, b), sim);
        neighbors.entry(a).or_insert_with(Vec::new).push((b, sim));
        neighbors.entry(b).or_insert_with(Vec::new).push((a, sim));
    }

    neighbors
        .par_iter_mut()
        .for_each(|(_, row)| row.sort_by(by_similarity));

    (pairs, neighbors)
}
