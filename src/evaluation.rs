//! Rating-error and ranking-quality metrics.
//!
//! Rating metrics compare predictions with every observation of a test
//! table. Ranking metrics are averaged over *eligible* users: those with
//! at least one test rating at or above the relevance threshold. Users
//! without any relevant test item are left out of the average entirely,
//! rather than counted as zero.
use std::collections::HashSet;

use rayon::prelude::*;

use crate::data::RatingTable;
use crate::recommend::top_n;
use crate::{ConfigurationError, EvaluationError, ItemId, PredictionError, RatingPredictor, UserId};

fn errors<T: RatingPredictor + Sync + ?Sized>(
    model: &T,
    test: &RatingTable,
) -> Result<Vec<f64>, EvaluationError> {
    if test.is_empty() {
        return Err(EvaluationError::EmptyEvaluationSet);
    }

    let errors = test
        .observations()
        .par_iter()
        .map(|x| {
            model
                .predict(x.user_id(), x.item_id())
                .map(|prediction| f64::from(prediction) - f64::from(x.rating()))
        })
        .collect::<Result<Vec<f64>, PredictionError>>()?;

    Ok(errors)
}

/// Root mean squared error over all observations in `test`.
pub fn rmse<T: RatingPredictor + Sync + ?Sized>(
    model: &T,
    test: &RatingTable,
) -> Result<f32, EvaluationError> {
    let errors = errors(model, test)?;
    let squared: f64 = errors.iter().map(|x| x * x).sum();

    Ok((squared / errors.len() as f64).sqrt() as f32)
}

/// Mean absolute error over all observations in `test`.
pub fn mae<T: RatingPredictor + Sync + ?Sized>(
    model: &T,
    test: &RatingTable,
) -> Result<f32, EvaluationError> {
    let errors = errors(model, test)?;
    let absolute: f64 = errors.iter().map(|x| x.abs()).sum();

    Ok((absolute / errors.len() as f64) as f32)
}

/// Precision and recall at a cutoff, averaged over eligible users.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    /// Mean Precision@K.
    pub precision: f32,
    /// Mean Recall@K.
    pub recall: f32,
    /// Number of users the means were taken over.
    pub num_users: usize,
}

fn relevant_items(test: &RatingTable, relevance_threshold: f32) -> Vec<(UserId, HashSet<ItemId>)> {
    test.user_ids()
        .iter()
        .filter_map(|&user_id| {
            let relevant: HashSet<ItemId> = test
                .items_of(user_id)
                .iter()
                .filter(|&&(_, rating)| rating >= relevance_threshold)
                .map(|&(item_id, _)| item_id)
                .collect();

            if relevant.is_empty() {
                None
            } else {
                Some((user_id, relevant))
            }
        })
        .collect()
}

/// Compute Precision@K and Recall@K in one pass.
///
/// For each eligible user a Top-`k` list is generated from the catalog
/// of `train`, excluding items the user rated in `train`. Precision
/// divides the number of relevant items in the list by the list length,
/// which is `k` unless fewer candidates were available; an empty list
/// scores zero. Recall divides by the number of the user's relevant test
/// items.
pub fn ranking_metrics<T: RatingPredictor + Sync + ?Sized>(
    model: &T,
    train: &RatingTable,
    test: &RatingTable,
    k: usize,
    relevance_threshold: f32,
) -> Result<RankingMetrics, EvaluationError> {
    if k == 0 {
        return Err(ConfigurationError::InvalidCutoff.into());
    }

    let users = relevant_items(test, relevance_threshold);

    if users.is_empty() {
        return Err(EvaluationError::EmptyEvaluationSet);
    }

    let scores = users
        .par_iter()
        .map(|(user_id, relevant)| -> Result<(f64, f64), PredictionError> {
            let recommendations = top_n(model, train, *user_id, k)?;
            let hits = recommendations
                .iter()
                .filter(|(item_id, _)| relevant.contains(item_id))
                .count() as f64;

            let precision = if recommendations.is_empty() {
                0.0
            } else {
                hits / recommendations.len() as f64
            };
            let recall = hits / relevant.len() as f64;

            Ok((precision, recall))
        })
        .collect::<Result<Vec<(f64, f64)>, PredictionError>>()?;

    let num_users = scores.len();
    let (precision, recall) = scores
        .iter()
        .fold((0.0, 0.0), |(p, r), &(precision, recall)| (p + precision, r + recall));

    Ok(RankingMetrics {
        precision: (precision / num_users as f64) as f32,
        recall: (recall / num_users as f64) as f32,
        num_users,
    })
}

/// Mean Precision@K over eligible users. See [`ranking_metrics`].
pub fn precision_at_k<T: RatingPredictor + Sync + ?Sized>(
    model: &T,
    train: &RatingTable,
    test: &RatingTable,
    k: usize,
    relevance_threshold: f32,
) -> Result<f32, EvaluationError> {
    ranking_metrics(model, train, test, k, relevance_threshold).map(|x| x.precision)
}

/// Mean Recall@K over eligible users. See [`ranking_metrics`].
pub fn recall_at_k<T: RatingPredictor + Sync + ?Sized>(
    model: &T,
    train: &RatingTable,
    test: &RatingTable,
    k: usize,
    relevance_threshold: f32,
) -> Result<f32, EvaluationError> {
    ranking_metrics(model, train, test, k, relevance_threshold).map(|x| x.recall)
}
