//! Top-N recommendation lists.
use std::cmp::Ordering;

use rayon::prelude::*;

use crate::data::RatingTable;
use crate::{ConfigurationError, ItemId, PredictionError, RatingPredictor, UserId};

fn by_score(x: &(ItemId, f32), y: &(ItemId, f32)) -> Ordering {
    y.1.partial_cmp(&x.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| x.0.cmp(&y.0))
}

/// Score every catalog item of `train` that `user_id` has not rated and
/// return the `n` best, by descending score with ties broken by ascending
/// item id.
///
/// Users unseen in `train` get whatever the model's cold-start fallback
/// produces; when all scores collapse to the same value the list is
/// ordered by item id.
pub fn top_n<T: RatingPredictor + ?Sized>(
    model: &T,
    train: &RatingTable,
    user_id: UserId,
    n: usize,
) -> Result<Vec<(ItemId, f32)>, PredictionError> {
    let candidates: Vec<ItemId> = train
        .item_ids()
        .iter()
        .filter(|&&item_id| !train.contains(user_id, item_id))
        .cloned()
        .collect();

    let scores = model.predict_items(user_id, &candidates)?;

    let mut scored: Vec<(ItemId, f32)> = candidates.into_iter().zip(scores).collect();
    scored.sort_by(by_score);
    scored.truncate(n);

    Ok(scored)
}

/// Produces fixed-length recommendation lists.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommender {
    n: usize,
}

impl Recommender {
    /// Build a recommender returning at most `n` items per user.
    pub fn new(n: usize) -> Result<Self, ConfigurationError> {
        if n == 0 {
            return Err(ConfigurationError::InvalidListLength);
        }

        Ok(Recommender { n })
    }

    /// Maximum list length.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Recommend items to `user_id`, excluding items rated in `train`.
    pub fn top_n<T: RatingPredictor + ?Sized>(
        &self,
        model: &T,
        train: &RatingTable,
        user_id: UserId,
    ) -> Result<Vec<(ItemId, f32)>, PredictionError> {
        top_n(model, train, user_id, self.n)
    }

    /// Recommend items to each of `user_ids`, in parallel. Output order
    /// follows `user_ids`.
    pub fn top_n_batch<T: RatingPredictor + Sync + ?Sized>(
        &self,
        model: &T,
        train: &RatingTable,
        user_ids: &[UserId],
    ) -> Result<Vec<(UserId, Vec<(ItemId, f32)>)>, PredictionError> {
        user_ids
            .par_iter()
            .map(|&user_id| top_n(model, train, user_id, self.n).map(|list| (user_id, list)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::{Rating, RatingScale};
    use crate::models::factorization;
    use crate::models::neighborhood::{self, NeighborhoodModel};

    fn table(ratings: &[(UserId, ItemId, f32)]) -> RatingTable {
        RatingTable::build(
            ratings
                .iter()
                .map(|&(user, item, rating)| Rating::new(user, item, rating))
                .collect(),
            RatingScale::default(),
        )
        .unwrap()
    }

    fn sample() -> RatingTable {
        table(&[
            (1, 1, 5.0),
            (1, 2, 4.0),
            (2, 1, 5.0),
            (2, 2, 4.0),
            (2, 3, 1.0),
            (2, 4, 5.0),
            (3, 1, 1.0),
            (3, 3, 5.0),
            (3, 5, 2.0),
            (4, 2, 3.0),
            (4, 4, 4.0),
            (4, 5, 1.0),
        ])
    }

    fn knn(data: &Arc<RatingTable>) -> NeighborhoodModel {
        let mut model = NeighborhoodModel::new(neighborhood::Hyperparameters::default()).unwrap();
        model.fit(data);
        model
    }

    #[test]
    fn excludes_rated_items() {
        let data = Arc::new(sample());
        let model = knn(&data);
        let recommender = Recommender::new(10).unwrap();

        for &user_id in data.user_ids() {
            let list = recommender.top_n(&model, &data, user_id).unwrap();

            assert_eq!(list.len(), data.num_items() - data.items_of(user_id).len());
            for &(item_id, _) in &list {
                assert!(!data.contains(user_id, item_id));
            }
            for pair in list.windows(2) {
                assert!(pair[0].1 > pair[1].1 || (pair[0].1 == pair[1].1 && pair[0].0 < pair[1].0));
            }
        }
    }

    #[test]
    fn truncates_to_n() {
        let data = Arc::new(sample());
        let model = knn(&data);

        let list = Recommender::new(1).unwrap().top_n(&model, &data, 1).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn cold_user_is_ranked_by_fallback() {
        let data = Arc::new(sample());
        let model = knn(&data);

        // Every score is the global mean, so ties resolve by item id.
        let list = top_n(&model, &data, 99, 10).unwrap();
        let ids: Vec<ItemId> = list.iter().map(|&(item_id, _)| item_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        for &(_, score) in &list {
            assert!((score - data.mean_rating()).abs() < 1e-6);
        }

        // The factorization model falls back to global mean plus item bias.
        let mut latent = factorization::Hyperparameters::new()
            .latent_dim(2)
            .learning_rate(0.02)
            .num_epochs(30)
            .seed(3)
            .build()
            .unwrap();
        latent.fit(&data).unwrap();

        let list = top_n(&latent, &data, 99, 10).unwrap();
        let mut by_bias: Vec<(ItemId, f32)> = data
            .item_ids()
            .iter()
            .map(|&item_id| (item_id, latent.item_bias(item_id).unwrap()))
            .collect();
        by_bias.sort_by(by_score);

        assert_eq!(
            list.iter().map(|x| x.0).collect::<Vec<_>>(),
            by_bias.iter().map(|x| x.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn rankings_are_deterministic() {
        let data = Arc::new(sample());
        let first = knn(&data);
        let second = knn(&data);

        for &user_id in &[1, 2, 3, 4, 99] {
            assert_eq!(
                top_n(&first, &data, user_id, 3).unwrap(),
                top_n(&second, &data, user_id, 3).unwrap()
            );
        }
    }

    #[test]
    fn batch_matches_single() {
        let data = Arc::new(sample());
        let model = knn(&data);
        let recommender = Recommender::new(2).unwrap();

        let batch = recommender
            .top_n_batch(&model, &data, &[4, 1, 3])
            .unwrap();

        assert_eq!(batch.iter().map(|x| x.0).collect::<Vec<_>>(), vec![4, 1, 3]);
        for (user_id, list) in batch {
            assert_eq!(list, recommender.top_n(&model, &data, user_id).unwrap());
        }
    }

    #[test]
    fn rejects_zero_length() {
        assert_eq!(
            Recommender::new(0).unwrap_err(),
            ConfigurationError::InvalidListLength
        );
    }
}
