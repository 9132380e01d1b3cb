//! Neighbourhood-based collaborative filtering.
//!
//! In user mode, the rating of user `u` for item `i` is the
//! similarity-weighted average of the ratings given to `i` by the `K`
//! users most similar to `u` among those who rated `i`. Item mode is the
//! transpose: the ratings `u` gave to the `K` items most similar to `i`.
//!
//! Only positively similar neighbours contribute. Without any, the model
//! falls back to the mean rating of the query entity (the user in user
//! mode, the item in item mode) and then to the global mean.
use std::cmp::Ordering;
use std::sync::Arc;

use crate::data::RatingTable;
use crate::similarity::{SimilarityIndex, SimilarityMetric, SimilarityMode};
use crate::{ConfigurationError, ItemId, PredictionError, RatingPredictor, UserId};

/// Hyperparameters describing the neighbourhood model.
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Whether neighbours are users or items.
    #[builder(default = "SimilarityMode::User")]
    mode: SimilarityMode,
    /// Similarity measure between neighbours.
    #[builder(default = "SimilarityMetric::Pearson")]
    metric: SimilarityMetric,
    /// Maximum number of neighbours contributing to a prediction.
    #[builder(default = "20")]
    num_neighbors: usize,
    /// Minimum co-rated set size for a similarity to be defined.
    #[builder(default = "1")]
    min_overlap: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            mode: SimilarityMode::User,
            metric: SimilarityMetric::Pearson,
            num_neighbors: 20,
            min_overlap: 1,
        }
    }
}

impl Hyperparameters {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.num_neighbors == 0 {
            return Err(ConfigurationError::InvalidNumNeighbors);
        }
        if self.min_overlap == 0 {
            return Err(ConfigurationError::InvalidMinOverlap);
        }

        Ok(())
    }
}

#[derive(Debug)]
struct ModelData {
    table: Arc<RatingTable>,
    index: SimilarityIndex,
}

/// User-based or item-based nearest-neighbour model.
#[derive(Debug)]
pub struct NeighborhoodModel {
    hyper: Hyperparameters,
    model: Option<ModelData>,
}

impl NeighborhoodModel {
    /// Build a new model, validating the hyperparameters.
    pub fn new(hyper: Hyperparameters) -> Result<Self, ConfigurationError> {
        hyper.validate()?;

        Ok(NeighborhoodModel { hyper, model: None })
    }

    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Fit the model: compute the similarity index of `table`.
    pub fn fit(&mut self, table: &Arc<RatingTable>) {
        let index = SimilarityIndex::build(
            table,
            self.hyper.mode,
            self.hyper.metric,
            self.hyper.min_overlap,
        );

        self.model = Some(ModelData {
            table: Arc::clone(table),
            index,
        });
    }

    /// Fit the model with a precomputed similarity index.
    ///
    /// Fails with [`ConfigurationError::IndexMismatch`] if `index` was
    /// built from a different table or with different settings.
    pub fn fit_with_index(
        &mut self,
        table: &Arc<RatingTable>,
        index: SimilarityIndex,
    ) -> Result<(), ConfigurationError> {
        let key = index.key();

        if !index.is_built_from(table)
            || key.mode != self.hyper.mode
            || key.metric != self.hyper.metric
            || key.min_overlap != self.hyper.min_overlap
        {
            return Err(ConfigurationError::IndexMismatch);
        }

        self.model = Some(ModelData {
            table: Arc::clone(table),
            index,
        });

        Ok(())
    }

    /// The similarity index, once fitted.
    pub fn similarity_index(&self) -> Option<&SimilarityIndex> {
        self.model.as_ref().map(|model| &model.index)
    }

    /// The `K` neighbours used to predict `user_id`'s rating of `item_id`,
    /// with their similarities, most similar first.
    pub fn neighbors(
        &self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Vec<(u32, f32)>, PredictionError> {
        let model = self.model.as_ref().ok_or(PredictionError::NotFitted)?;

        Ok(self
            .weighted_neighbors(model, user_id, item_id)
            .into_iter()
            .map(|(neighbor, sim, _)| (neighbor, sim))
            .collect())
    }

    fn weighted_neighbors(
        &self,
        model: &ModelData,
        user_id: UserId,
        item_id: ItemId,
    ) -> Vec<(u32, f32, f32)> {
        // (neighbour, similarity, neighbour's rating)
        let (query, candidates) = match self.hyper.mode {
            SimilarityMode::User => (user_id, model.table.users_of(item_id)),
            SimilarityMode::Item => (item_id, model.table.items_of(user_id)),
        };

        let mut neighbors: Vec<(u32, f32, f32)> = candidates
            .iter()
            .filter(|&&(neighbor, _)| neighbor != query)
            .filter_map(|&(neighbor, rating)| {
                model
                    .index
                    .get(query, neighbor)
                    .filter(|&sim| sim > 0.0)
                    .map(|sim| (neighbor, sim, rating))
            })
            .collect();

        neighbors.sort_by(|x, y| {
            y.1.partial_cmp(&x.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.0.cmp(&y.0))
        });
        neighbors.truncate(self.hyper.num_neighbors);

        neighbors
    }

    fn fallback(&self, model: &ModelData, user_id: UserId, item_id: ItemId) -> f32 {
        let entity_mean = match self.hyper.mode {
            SimilarityMode::User => model.table.user_mean(user_id),
            SimilarityMode::Item => model.table.item_mean(item_id),
        };

        entity_mean.unwrap_or_else(|| model.table.mean_rating())
    }
}

impl RatingPredictor for NeighborhoodModel {
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError> {
        let model = self.model.as_ref().ok_or(PredictionError::NotFitted)?;
        let neighbors = self.weighted_neighbors(model, user_id, item_id);

        let (weighted, total) = neighbors
            .iter()
            .fold((0.0_f64, 0.0_f64), |(weighted, total), &(_, sim, rating)| {
                (
                    weighted + f64::from(sim) * f64::from(rating),
                    total + f64::from(sim),
                )
            });

        let prediction = if total > 0.0 {
            (weighted / total) as f32
        } else {
            self.fallback(model, user_id, item_id)
        };

        if prediction.is_finite() {
            Ok(model.table.scale().clamp(prediction))
        } else {
            Err(PredictionError::InvalidPredictionValue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Rating, RatingScale};

    fn table(ratings: &[(UserId, ItemId, f32)]) -> Arc<RatingTable> {
        Arc::new(
            RatingTable::build(
                ratings
                    .iter()
                    .map(|&(user, item, rating)| Rating::new(user, item, rating))
                    .collect(),
                RatingScale::default(),
            )
            .unwrap(),
        )
    }

    fn sample() -> Arc<RatingTable> {
        table(&[
            (1, 1, 5.0),
            (1, 2, 3.0),
            (1, 3, 1.0),
            (2, 1, 4.0),
            (2, 2, 3.0),
            (2, 3, 2.0),
            (2, 4, 4.0),
            (3, 1, 1.0),
            (3, 2, 3.0),
            (3, 3, 5.0),
            (3, 4, 2.0),
            (4, 5, 3.0),
        ])
    }

    fn fitted(hyper: Hyperparameters, data: &Arc<RatingTable>) -> NeighborhoodModel {
        let mut model = NeighborhoodModel::new(hyper).unwrap();
        model.fit(data);
        model
    }

    #[test]
    fn user_based_uses_positive_neighbors_only() {
        let data = sample();
        let model = fitted(Hyperparameters::default(), &data);

        // Users 2 and 3 both rated item 4, but only user 2 correlates
        // positively with user 1.
        let neighbors = model.neighbors(1, 4).unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, 2);
        assert!((model.predict(1, 4).unwrap() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn falls_back_to_entity_and_global_means() {
        let data = sample();
        let user_model = fitted(Hyperparameters::default(), &data);

        // User 4 has no co-ratings with anyone.
        assert!((user_model.predict(4, 1).unwrap() - 3.0).abs() < 1e-6);
        // Unseen user.
        assert!((user_model.predict(99, 1).unwrap() - data.mean_rating()).abs() < 1e-6);

        let item_model = fitted(
            HyperparametersBuilder::default()
                .mode(SimilarityMode::Item)
                .build()
                .unwrap(),
            &data,
        );

        // Item 5 is only rated by user 4, who rated nothing else.
        assert!((item_model.predict(1, 5).unwrap() - 3.0).abs() < 1e-6);
        assert!((item_model.predict(1, 99).unwrap() - data.mean_rating()).abs() < 1e-6);
    }

    #[test]
    fn item_based_weighted_average() {
        let data = table(&[
            (1, 1, 5.0),
            (1, 2, 5.0),
            (2, 1, 1.0),
            (2, 2, 1.0),
            (3, 1, 4.0),
            (3, 2, 2.0),
            (3, 3, 5.0),
            (4, 3, 1.0),
            (4, 1, 2.0),
        ]);
        let model = fitted(
            HyperparametersBuilder::default()
                .mode(SimilarityMode::Item)
                .metric(SimilarityMetric::Cosine)
                .build()
                .unwrap(),
            &data,
        );
        let index = model.similarity_index().unwrap();

        // User 1 rated items 1 and 2; predict item 3 from them.
        let sim_1 = index.similarity(3, 1);
        let sim_2 = index.similarity(3, 2);
        let expected = (sim_1 * 5.0 + sim_2 * 5.0) / (sim_1 + sim_2);

        assert!((model.predict(1, 3).unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn respects_neighborhood_size() {
        let data = sample();
        let model = fitted(
            HyperparametersBuilder::default()
                .num_neighbors(1)
                .build()
                .unwrap(),
            &data,
        );

        for &(user, item) in &[(1, 4), (2, 1), (3, 2)] {
            assert!(model.neighbors(user, item).unwrap().len() <= 1);
        }
    }

    #[test]
    fn predictions_are_clamped() {
        let data = sample();
        let model = fitted(Hyperparameters::default(), &data);

        for &user in data.user_ids() {
            for &item in data.item_ids() {
                let prediction = model.predict(user, item).unwrap();
                assert!(prediction >= 1.0 && prediction <= 5.0);
            }
        }
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        let zero_neighbors = HyperparametersBuilder::default()
            .num_neighbors(0)
            .build()
            .unwrap();
        assert_eq!(
            NeighborhoodModel::new(zero_neighbors).unwrap_err(),
            ConfigurationError::InvalidNumNeighbors
        );

        let zero_overlap = HyperparametersBuilder::default()
            .min_overlap(0)
            .build()
            .unwrap();
        assert_eq!(
            NeighborhoodModel::new(zero_overlap).unwrap_err(),
            ConfigurationError::InvalidMinOverlap
        );
    }

    #[test]
    fn rejects_foreign_index() {
        let data = sample();
        let other = table(&[(1, 1, 2.0), (2, 1, 3.0)]);
        let mut model = NeighborhoodModel::new(Hyperparameters::default()).unwrap();

        assert_eq!(model.predict(1, 1), Err(PredictionError::NotFitted));

        let foreign = SimilarityIndex::build(&other, SimilarityMode::User, SimilarityMetric::Pearson, 1);
        assert_eq!(
            model.fit_with_index(&data, foreign).unwrap_err(),
            ConfigurationError::IndexMismatch
        );
        assert!(model.similarity_index().is_none());

        let wrong_mode = SimilarityIndex::build(&data, SimilarityMode::Item, SimilarityMetric::Pearson, 1);
        assert_eq!(
            model.fit_with_index(&data, wrong_mode).unwrap_err(),
            ConfigurationError::IndexMismatch
        );

        let wrong_overlap = SimilarityIndex::build(&data, SimilarityMode::User, SimilarityMetric::Pearson, 2);
        assert_eq!(
            model.fit_with_index(&data, wrong_overlap).unwrap_err(),
            ConfigurationError::IndexMismatch
        );
        assert_eq!(model.predict(1, 1), Err(PredictionError::NotFitted));

        let own = SimilarityIndex::build(&data, SimilarityMode::User, SimilarityMetric::Pearson, 1);
        assert!(model.fit_with_index(&data, own).is_ok());
        assert!(model.predict(1, 4).is_ok());
    }
}
