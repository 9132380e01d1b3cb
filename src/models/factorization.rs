//! Biased matrix factorization for explicit ratings.
//!
//! The model estimates
//!
//! ```text
//! r(u, i) = mu + b_u + b_i + p_u . q_i
//! ```
//!
//! where `mu` is the global mean of the training ratings, `b_u` and `b_i`
//! are user and item biases, and `p_u`, `q_i` are k-dimensional latent
//! vectors. Parameters are fitted by stochastic gradient descent with L2
//! shrinkage over the observed ratings only; missing entries are never
//! treated as zeros.
//!
//! Users and items unseen during fitting have zero biases and zero latent
//! vectors, so their predictions fall back to the global mean plus
//! whatever the known side contributes.
use std::collections::HashMap;
use std::io::{Read, Write};

use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use rand_xorshift::XorShiftRng;
use tracing::{debug, info, warn};

use crate::data::{RatingScale, RatingTable};
use crate::{
    ConfigurationError, FittingError, ItemId, PredictionError, RatingPredictor, UserId,
};

fn embedding_init<T: Rng>(
    rows: usize,
    cols: usize,
    normal: &Normal<f32>,
    rng: &mut T,
) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| normal.sample(rng))
}

/// Hyperparameters describing the factorization model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    latent_dim: usize,
    l2_penalty: f32,
    learning_rate: f32,
    num_epochs: usize,
    convergence_tol: f32,
    patience: usize,
    init_std: f32,
    seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new()
    }
}

impl Hyperparameters {
    /// Build new hyperparameters with a random seed.
    pub fn new() -> Self {
        Hyperparameters {
            latent_dim: 50,
            l2_penalty: 0.02,
            learning_rate: 0.005,
            num_epochs: 20,
            convergence_tol: 1e-4,
            patience: 2,
            init_std: 0.1,
            seed: rand::thread_rng().gen(),
        }
    }

    /// Set the latent dimensionality.
    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.latent_dim = latent_dim;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the maximum number of epochs run per `fit` call.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the minimum decrease in validation RMSE that counts as an
    /// improvement.
    pub fn convergence_tol(mut self, convergence_tol: f32) -> Self {
        self.convergence_tol = convergence_tol;
        self
    }

    /// Set how many epochs without improvement are tolerated before
    /// stopping early. Zero disables early stopping.
    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    /// Set the standard deviation of the latent vector initialization.
    pub fn init_std(mut self, init_std: f32) -> Self {
        self.init_std = init_std;
        self
    }

    /// Set the seed used for initialization and shuffling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Hyperparameters {
            latent_dim: 2_usize.pow(Uniform::new(2, 8).sample(rng)),
            l2_penalty: (10.0_f32).powf(Uniform::new(-3.0, -0.5).sample(rng)),
            learning_rate: (10.0_f32).powf(Uniform::new(-3.0, -1.5).sample(rng)),
            num_epochs: 2_usize.pow(Uniform::new(3, 7).sample(rng)),
            convergence_tol: 1e-4,
            patience: 2,
            init_std: 0.1,
            seed: rng.gen(),
        }
    }

    fn validate(&self) -> Result<Normal<f32>, ConfigurationError> {
        if self.latent_dim == 0 {
            return Err(ConfigurationError::InvalidLatentDim);
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ConfigurationError::InvalidLearningRate(self.learning_rate));
        }
        if !(self.l2_penalty >= 0.0 && self.l2_penalty.is_finite()) {
            return Err(ConfigurationError::InvalidL2Penalty(self.l2_penalty));
        }
        if self.num_epochs == 0 {
            return Err(ConfigurationError::InvalidNumEpochs);
        }
        if !(self.convergence_tol >= 0.0 && self.convergence_tol.is_finite()) {
            return Err(ConfigurationError::InvalidConvergenceTolerance(
                self.convergence_tol,
            ));
        }
        if !(self.init_std > 0.0 && self.init_std.is_finite()) {
            return Err(ConfigurationError::InvalidInitStd(self.init_std));
        }

        Normal::new(0.0, self.init_std).map_err(|_| ConfigurationError::InvalidInitStd(self.init_std))
    }

    /// Build the factorization model, validating the hyperparameters.
    pub fn build(self) -> Result<LatentFactorModel, ConfigurationError> {
        let init = self.validate()?;

        Ok(LatentFactorModel {
            hyper: self,
            init,
            model: None,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModelData {
    scale: RatingScale,
    global_bias: f32,
    user_index: HashMap<UserId, usize>,
    item_index: HashMap<ItemId, usize>,
    user_biases: Array1<f32>,
    item_biases: Array1<f32>,
    user_embeddings: Array2<f32>,
    item_embeddings: Array2<f32>,
}

impl ModelData {
    fn predict_raw(&self, user_id: UserId, item_id: ItemId) -> f32 {
        let user_idx = self.user_index.get(&user_id);
        let item_idx = self.item_index.get(&item_id);

        let mut prediction = self.global_bias;

        if let Some(&user_idx) = user_idx {
            prediction += self.user_biases[user_idx];
        }
        if let Some(&item_idx) = item_idx {
            prediction += self.item_biases[item_idx];
        }
        if let (Some(&user_idx), Some(&item_idx)) = (user_idx, item_idx) {
            prediction += self
                .user_embeddings
                .row(user_idx)
                .dot(&self.item_embeddings.row(item_idx));
        }

        prediction
    }

    fn predict_idx(&self, user_idx: usize, item_idx: usize) -> f32 {
        self.global_bias
            + self.user_biases[user_idx]
            + self.item_biases[item_idx]
            + self
                .user_embeddings
                .row(user_idx)
                .dot(&self.item_embeddings.row(item_idx))
    }

    /// One pass over `triples`. Returns `false` if a non-finite error
    /// was encountered.
    fn sgd_epoch(
        &mut self,
        triples: &[(usize, usize, f32)],
        learning_rate: f32,
        l2_penalty: f32,
    ) -> bool {
        for &(user_idx, item_idx, rating) in triples {
            let error = rating - self.predict_idx(user_idx, item_idx);

            if !error.is_finite() {
                return false;
            }

            let user_bias = &mut self.user_biases[user_idx];
            *user_bias += learning_rate * (error - l2_penalty * *user_bias);
            let item_bias = &mut self.item_biases[item_idx];
            *item_bias += learning_rate * (error - l2_penalty * *item_bias);

            let user_vector = self.user_embeddings.row_mut(user_idx);
            let item_vector = self.item_embeddings.row_mut(item_idx);

            for (user_factor, item_factor) in izip!(user_vector, item_vector) {
                let (p, q) = (*user_factor, *item_factor);

                *user_factor += learning_rate * (error * q - l2_penalty * p);
                *item_factor += learning_rate * (error * p - l2_penalty * q);
            }
        }

        true
    }

    fn triples_rmse(&self, triples: &[(usize, usize, f32)]) -> f32 {
        let squared_error: f64 = triples
            .iter()
            .map(|&(user_idx, item_idx, rating)| {
                f64::from(rating - self.predict_idx(user_idx, item_idx)).powi(2)
            })
            .sum();

        (squared_error / triples.len() as f64).sqrt() as f32
    }

    /// RMSE over a non-empty `table`.
    fn table_rmse(&self, table: &RatingTable) -> f32 {
        let squared_error: f64 = table
            .observations()
            .iter()
            .map(|x| f64::from(x.rating() - self.predict_raw(x.user_id(), x.item_id())).powi(2))
            .sum();

        (squared_error / table.len() as f64).sqrt() as f32
    }
}

/// Summary of a `fit` call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Training RMSE of the freshly initialized model.
    pub initial_train_rmse: f32,
    /// Training RMSE after each epoch.
    pub train_rmse: Vec<f32>,
    /// Validation RMSE after each epoch, when a validation table was given.
    pub validation_rmse: Vec<f32>,
    /// Number of epochs actually run.
    pub epochs_run: usize,
    /// Whether training stopped before `num_epochs` because the
    /// validation RMSE stopped improving.
    pub stopped_early: bool,
    /// Zero-based epoch whose parameters were kept, when a validation
    /// table was used.
    pub best_epoch: Option<usize>,
}

impl TrainingReport {
    /// Training RMSE of the parameters the model ended up with.
    pub fn final_train_rmse(&self) -> f32 {
        self.best_epoch
            .or_else(|| self.epochs_run.checked_sub(1))
            .and_then(|epoch| self.train_rmse.get(epoch).cloned())
            .unwrap_or(self.initial_train_rmse)
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    hyperparameters: &'a Hyperparameters,
    model: &'a ModelData,
}

#[derive(Deserialize)]
struct Snapshot {
    hyperparameters: Hyperparameters,
    model: ModelData,
}

/// Biased matrix factorization model trained by SGD.
#[derive(Clone, Debug)]
pub struct LatentFactorModel {
    hyper: Hyperparameters,
    init: Normal<f32>,
    model: Option<ModelData>,
}

impl LatentFactorModel {
    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Whether the model has been fitted.
    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    /// Number of users seen during fitting.
    pub fn num_users(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.user_index.len())
    }

    /// Number of items seen during fitting.
    pub fn num_items(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.item_index.len())
    }

    /// The global bias: the mean training rating.
    pub fn global_bias(&self) -> Option<f32> {
        self.model.as_ref().map(|model| model.global_bias)
    }

    /// Bias of `user_id`, if the user was seen during fitting.
    pub fn user_bias(&self, user_id: UserId) -> Option<f32> {
        let model = self.model.as_ref()?;
        model.user_index.get(&user_id).map(|&idx| model.user_biases[idx])
    }

    /// Bias of `item_id`, if the item was seen during fitting.
    pub fn item_bias(&self, item_id: ItemId) -> Option<f32> {
        let model = self.model.as_ref()?;
        model.item_index.get(&item_id).map(|&idx| model.item_biases[idx])
    }

    /// Latent vector of `user_id`, if the user was seen during fitting.
    pub fn user_embedding(&self, user_id: UserId) -> Option<ArrayView1<f32>> {
        let model = self.model.as_ref()?;
        model
            .user_index
            .get(&user_id)
            .map(|&idx| model.user_embeddings.row(idx))
    }

    /// Latent vector of `item_id`, if the item was seen during fitting.
    pub fn item_embedding(&self, item_id: ItemId) -> Option<ArrayView1<f32>> {
        let model = self.model.as_ref()?;
        model
            .item_index
            .get(&item_id)
            .map(|&idx| model.item_embeddings.row(idx))
    }

    fn build_model<R: Rng>(&self, train: &RatingTable, rng: &mut R) -> ModelData {
        let user_index: HashMap<UserId, usize> = train
            .user_ids()
            .iter()
            .enumerate()
            .map(|(idx, &user_id)| (user_id, idx))
            .collect();
        let item_index: HashMap<ItemId, usize> = train
            .item_ids()
            .iter()
            .enumerate()
            .map(|(idx, &item_id)| (item_id, idx))
            .collect();

        let user_embeddings =
            embedding_init(user_index.len(), self.hyper.latent_dim, &self.init, rng);
        let item_embeddings =
            embedding_init(item_index.len(), self.hyper.latent_dim, &self.init, rng);

        ModelData {
            scale: train.scale(),
            global_bias: train.mean_rating(),
            user_biases: Array1::zeros(user_index.len()),
            item_biases: Array1::zeros(item_index.len()),
            user_index,
            item_index,
            user_embeddings,
            item_embeddings,
        }
    }

    /// Fit the model on `train`, running the configured number of epochs.
    ///
    /// Any previously fitted parameters are discarded.
    pub fn fit(&mut self, train: &RatingTable) -> Result<TrainingReport, FittingError> {
        self.fit_inner(train, None)
    }

    /// Fit the model on `train`, stopping early once the RMSE on
    /// `validation` fails to improve by more than `convergence_tol` for
    /// `patience` consecutive epochs.
    ///
    /// The parameters of the epoch with the best validation RMSE are kept.
    /// An empty `validation` table gives nothing to monitor, and the call
    /// behaves like [`LatentFactorModel::fit`].
    pub fn fit_with_validation(
        &mut self,
        train: &RatingTable,
        validation: &RatingTable,
    ) -> Result<TrainingReport, FittingError> {
        self.fit_inner(train, Some(validation))
    }

    fn fit_inner(
        &mut self,
        train: &RatingTable,
        validation: Option<&RatingTable>,
    ) -> Result<TrainingReport, FittingError> {
        self.model = None;

        if train.is_empty() {
            return Err(FittingError::NoRatings);
        }

        let validation = match validation {
            Some(validation) if validation.is_empty() => {
                warn!("Empty validation table, early stopping disabled");
                None
            }
            validation => validation,
        };

        let hyper = &self.hyper;
        let mut rng = XorShiftRng::seed_from_u64(hyper.seed);
        let mut model = self.build_model(train, &mut rng);

        let mut triples: Vec<(usize, usize, f32)> = train
            .observations()
            .iter()
            .map(|x| {
                (
                    model.user_index[&x.user_id()],
                    model.item_index[&x.item_id()],
                    x.rating(),
                )
            })
            .collect();

        let mut report = TrainingReport {
            initial_train_rmse: model.triples_rmse(&triples),
            ..TrainingReport::default()
        };

        // (validation RMSE, epoch, parameters)
        let mut best: Option<(f32, usize, ModelData)> = None;
        let mut epochs_without_improvement = 0;

        for epoch in 0..hyper.num_epochs {
            triples.shuffle(&mut rng);

            let train_rmse = if model.sgd_epoch(&triples, hyper.learning_rate, hyper.l2_penalty) {
                model.triples_rmse(&triples)
            } else {
                ::std::f32::NAN
            };

            if !train_rmse.is_finite() {
                warn!(epoch, learning_rate = hyper.learning_rate, "Training diverged");
                return Err(FittingError::TrainingDiverged { epoch });
            }

            report.train_rmse.push(train_rmse);
            report.epochs_run = epoch + 1;

            if let Some(validation) = validation {
                let validation_rmse = model.table_rmse(validation);

                if !validation_rmse.is_finite() {
                    warn!(epoch, "Validation loss diverged");
                    return Err(FittingError::TrainingDiverged { epoch });
                }

                report.validation_rmse.push(validation_rmse);
                debug!(epoch, train_rmse, validation_rmse, "Finished epoch");

                let improved = match &best {
                    Some((best_rmse, _, _)) => best_rmse - validation_rmse > hyper.convergence_tol,
                    None => true,
                };

                if improved {
                    best = Some((validation_rmse, epoch, model.clone()));
                    epochs_without_improvement = 0;
                } else {
                    epochs_without_improvement += 1;

                    if hyper.patience > 0 && epochs_without_improvement >= hyper.patience {
                        info!(epoch, "Stopping early");
                        report.stopped_early = true;
                        break;
                    }
                }
            } else {
                debug!(epoch, train_rmse, "Finished epoch");
            }
        }

        if let Some((best_rmse, best_epoch, best_model)) = best {
            debug!(best_epoch, validation_rmse = best_rmse, "Restoring best epoch");
            model = best_model;
            report.best_epoch = Some(best_epoch);
        }

        info!(
            users = model.user_index.len(),
            items = model.item_index.len(),
            epochs = report.epochs_run,
            best_epoch = ?report.best_epoch,
            initial_train_rmse = report.initial_train_rmse,
            final_train_rmse = report.final_train_rmse(),
            "Fitted factorization model"
        );

        self.model = Some(model);

        Ok(report)
    }

    /// Serialize the fitted parameters together with the hyperparameters
    /// as JSON.
    pub fn save<W: Write>(&self, writer: W) -> Result<(), failure::Error> {
        let model = self.model.as_ref().ok_or(PredictionError::NotFitted)?;

        serde_json::to_writer(
            writer,
            &SnapshotRef {
                hyperparameters: &self.hyper,
                model,
            },
        )?;

        Ok(())
    }

    /// Restore a model written by [`LatentFactorModel::save`].
    pub fn load<R: Read>(reader: R) -> Result<Self, failure::Error> {
        let snapshot: Snapshot = serde_json::from_reader(reader)?;
        let model = snapshot.model;
        let latent_dim = snapshot.hyperparameters.latent_dim;

        if model.user_embeddings.dim() != (model.user_index.len(), latent_dim)
            || model.item_embeddings.dim() != (model.item_index.len(), latent_dim)
            || model.user_biases.len() != model.user_index.len()
            || model.item_biases.len() != model.item_index.len()
        {
            return Err(format_err!(
                "Stored parameters do not match latent dimension {}.",
                latent_dim
            ));
        }

        let mut restored = snapshot.hyperparameters.build()?;
        restored.model = Some(model);

        Ok(restored)
    }
}

impl RatingPredictor for LatentFactorModel {
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32, PredictionError> {
        let model = self.model.as_ref().ok_or(PredictionError::NotFitted)?;
        let prediction = model.predict_raw(user_id, item_id);

        if prediction.is_finite() {
            Ok(model.scale.clamp(prediction))
        } else {
            Err(PredictionError::InvalidPredictionValue)
        }
    }
}
