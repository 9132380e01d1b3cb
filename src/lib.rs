#![warn(missing_docs)]
//! # lensrec
//!
//! `lensrec` predicts the rating a user would give an item and produces
//! ranked Top-N recommendation lists from a sparse table of explicit
//! ratings. Two model families are provided:
//!
//! - a biased matrix factorization model trained by regularized stochastic
//!   gradient descent (the "SVD" model of the Netflix-prize literature), and
//! - user-based and item-based nearest-neighbour collaborative filtering.
//!
//! Both implement [`RatingPredictor`], which is all that the evaluation and
//! recommendation code needs.
//!
//! ## Example
//!
//! ```rust
//! # extern crate lensrec;
//! use lensrec::data::{Rating, RatingScale, RatingTable};
//! use lensrec::models::factorization::Hyperparameters;
//! use lensrec::recommend::Recommender;
//! use lensrec::RatingPredictor;
//!
//! let ratings = vec![
//!     Rating::new(1, 1, 5.0),
//!     Rating::new(1, 2, 3.0),
//!     Rating::new(2, 1, 4.0),
//!     Rating::new(2, 2, 5.0),
//!     Rating::new(2, 3, 2.0),
//! ];
//! let table = RatingTable::build(ratings, RatingScale::default()).unwrap();
//!
//! let mut model = Hyperparameters::new()
//!     .latent_dim(2)
//!     .num_epochs(50)
//!     .seed(42)
//!     .build()
//!     .unwrap();
//! model.fit(&table).unwrap();
//!
//! let score = model.predict(1, 3).unwrap();
//! assert!(score >= 1.0 && score <= 5.0);
//!
//! let recommendations = Recommender::new(10)
//!     .unwrap()
//!     .top_n(&model, &table, 1)
//!     .unwrap();
//! assert_eq!(recommendations[0].0, 3);
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate derive_builder;

#[cfg(feature = "csv")]
extern crate csv;
#[macro_use]
extern crate failure;
extern crate ndarray;
extern crate rand;
extern crate rand_distr;
extern crate rand_xorshift;
extern crate rayon;
extern crate serde;
extern crate serde_json;
extern crate siphasher;
extern crate tracing;

pub mod data;
#[cfg(feature = "csv")]
pub mod datasets;
pub mod evaluation;
pub mod models;
pub mod recommend;
pub mod similarity;

/// Alias for user identifiers.
pub type UserId = u32;
/// Alias for item identifiers.
pub type ItemId = u32;
/// Alias for timestamps.
pub type Timestamp = u64;

/// Errors raised while building a rating table.
#[derive(Debug, Fail, PartialEq)]
pub enum DataError {
    /// The same (user, item) pair was observed more than once.
    #[fail(
        display = "Duplicate rating for user {} and item {}.",
        user_id, item_id
    )]
    DuplicateRating {
        /// The offending user.
        user_id: UserId,
        /// The offending item.
        item_id: ItemId,
    },
    /// A rating was non-finite or outside the rating scale.
    #[fail(
        display = "Rating {} of user {} for item {} is outside the rating scale.",
        rating, user_id, item_id
    )]
    RatingOutOfRange {
        /// The offending user.
        user_id: UserId,
        /// The offending item.
        item_id: ItemId,
        /// The rejected value.
        rating: f32,
    },
    /// The rating scale itself is malformed.
    #[fail(display = "Invalid rating scale [{}, {}].", min, max)]
    InvalidScale {
        /// Lower bound.
        min: f32,
        /// Upper bound.
        max: f32,
    },
}

/// Invalid hyperparameters, reported when a component is constructed.
#[derive(Debug, Fail, PartialEq)]
pub enum ConfigurationError {
    /// Latent dimension must be positive.
    #[fail(display = "Latent dimension must be positive.")]
    InvalidLatentDim,
    /// Learning rate must be positive and finite.
    #[fail(display = "Learning rate must be positive, got {}.", _0)]
    InvalidLearningRate(f32),
    /// L2 penalty must be non-negative and finite.
    #[fail(display = "L2 penalty must be non-negative, got {}.", _0)]
    InvalidL2Penalty(f32),
    /// At least one epoch is required.
    #[fail(display = "Number of epochs must be positive.")]
    InvalidNumEpochs,
    /// Convergence tolerance must be non-negative and finite.
    #[fail(display = "Convergence tolerance must be non-negative, got {}.", _0)]
    InvalidConvergenceTolerance(f32),
    /// Initialization scale must be positive and finite.
    #[fail(display = "Initialization scale must be positive, got {}.", _0)]
    InvalidInitStd(f32),
    /// Neighbourhood size must be positive.
    #[fail(display = "Number of neighbours must be positive.")]
    InvalidNumNeighbors,
    /// Minimum overlap must be positive.
    #[fail(display = "Minimum co-rating overlap must be positive.")]
    InvalidMinOverlap,
    /// Recommendation list length must be positive.
    #[fail(display = "Recommendation list length must be positive.")]
    InvalidListLength,
    /// Ranking cutoff must be positive.
    #[fail(display = "Ranking cutoff k must be positive.")]
    InvalidCutoff,
    /// A precomputed similarity index was built from another table or
    /// with other settings than the model's.
    #[fail(display = "Similarity index does not match the table or model settings.")]
    IndexMismatch,
    /// Test fraction must lie strictly between 0 and 1.
    #[fail(display = "Test fraction must be in (0, 1), got {}.", _0)]
    InvalidTestFraction(f32),
}

/// Fitting error types.
#[derive(Debug, Fail, PartialEq)]
pub enum FittingError {
    /// The training table was empty.
    #[fail(display = "No ratings were supplied.")]
    NoRatings,
    /// The loss became non-finite, usually because the learning rate is too large.
    #[fail(display = "Training diverged in epoch {}.", epoch)]
    TrainingDiverged {
        /// Zero-based epoch in which divergence was detected.
        epoch: usize,
    },
}

/// Prediction error types.
#[derive(Debug, Fail, PartialEq)]
pub enum PredictionError {
    /// The model has not been fitted yet.
    #[fail(display = "Model must be fitted first.")]
    NotFitted,
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
}

/// Evaluation error types.
#[derive(Debug, Fail, PartialEq)]
pub enum EvaluationError {
    /// There was nothing to evaluate on.
    #[fail(display = "No eligible observations or users to evaluate.")]
    EmptyEvaluationSet,
    /// The model failed to produce a prediction.
    #[fail(display = "{}", _0)]
    Prediction(#[cause] PredictionError),
    /// Invalid metric parameters.
    #[fail(display = "{}", _0)]
    Configuration(#[cause] ConfigurationError),
}

impl From<PredictionError> for EvaluationError {
    fn from(error: PredictionError) -> Self {
        EvaluationError::Prediction(error)
    }
}

impl From<ConfigurationError> for EvaluationError {
    fn from(error: ConfigurationError) -> Self {
        EvaluationError::Configuration(error)
    }
}

/// Trait describing models that predict explicit ratings.
///
/// Predictions are clamped to the rating scale of the table the model was
/// fitted on. Users and items unseen during fitting are not an error: each
/// model falls back to a mean rating.
pub trait RatingPredictor {
    /// Predict the rating `user_id` would give `item_id`.
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError>;

    /// Predict ratings of `user_id` for every item in `item_ids`.
    fn predict_items(
        &self,
        user_id: UserId,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError> {
        item_ids
            .iter()
            .map(|&item_id| self.predict(user_id, item_id))
            .collect()
    }
}

impl<'a, T: RatingPredictor + ?Sized> RatingPredictor for &'a T {
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError> {
        (**self).predict(user_id, item_id)
    }
}
