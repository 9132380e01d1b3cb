extern crate failure;
extern crate lensrec;
extern crate rand;
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
extern crate tracing;
extern crate tracing_subscriber;

use std::cmp::Ordering;
use std::env;
use std::fs::File;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lensrec::data::RatingTable;
use lensrec::datasets::load_movielens;
use lensrec::evaluation::{mae, rmse};
use lensrec::models::factorization;
use lensrec::ConfigurationError;

const RESULTS_PATH: &str = "factorization_results.json";

#[derive(Debug, Serialize, Deserialize)]
struct Trial {
    train_rmse: f32,
    validation_rmse: f32,
    test_rmse: f32,
    test_mae: f32,
    epochs_run: usize,
    elapsed: Duration,
    hyperparameters: factorization::Hyperparameters,
}

struct Tables {
    fit: RatingTable,
    validation: RatingTable,
    test: RatingTable,
}

/// Early stopping monitors a slice of the training split, so `test` never
/// influences which parameters or trials are kept.
fn split_tables(data: &RatingTable, seed: u64) -> Result<Tables, ConfigurationError> {
    let (train, test) = data.split(0.2, seed)?;
    let (fit, validation) = train.split(0.1, seed.wrapping_add(1))?;

    Ok(Tables {
        fit,
        validation,
        test,
    })
}

fn run_trial(
    hyper: factorization::Hyperparameters,
    tables: &Tables,
) -> Result<Option<Trial>, failure::Error> {
    let start = Instant::now();
    let mut model = hyper.clone().build()?;

    let report = match model.fit_with_validation(&tables.fit, &tables.validation) {
        Ok(report) => report,
        Err(error) => {
            warn!(%error, "Fitting failed");
            return Ok(None);
        }
    };

    Ok(Some(Trial {
        train_rmse: rmse(&model, &tables.fit)?,
        validation_rmse: rmse(&model, &tables.validation)?,
        test_rmse: rmse(&model, &tables.test)?,
        test_mae: mae(&model, &tables.test)?,
        epochs_run: report.epochs_run,
        elapsed: start.elapsed(),
        hyperparameters: hyper,
    }))
}

fn load_results() -> Vec<Trial> {
    File::open(RESULTS_PATH)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok())
        .unwrap_or_default()
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = env::args().nth(1).unwrap_or_else(|| "u.data".to_owned());
    let num_trials: usize = env::args()
        .nth(2)
        .map(|x| x.parse())
        .transpose()?
        .unwrap_or(100);

    let tables = split_tables(&load_movielens(&path)?, 42)?;
    let mut rng = rand::thread_rng();

    for _ in 0..num_trials {
        let mut results = load_results();

        let hyper = factorization::Hyperparameters::random(&mut rng);
        info!(?hyper, "Running");

        let trial = match run_trial(hyper, &tables)? {
            Some(trial) => trial,
            None => continue,
        };

        info!(?trial, "Finished");

        if trial.validation_rmse.is_finite() {
            results.push(trial);
            // Best validation first.
            results.sort_by(|a, b| {
                a.validation_rmse
                    .partial_cmp(&b.validation_rmse)
                    .unwrap_or(Ordering::Equal)
            });
        }

        if let Some(best) = results.first() {
            info!(
                validation_rmse = best.validation_rmse,
                test_rmse = best.test_rmse,
                hyperparameters = ?best.hyperparameters,
                "Best so far"
            );
        }

        serde_json::to_writer_pretty(File::create(RESULTS_PATH)?, &results)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use lensrec::data::{Rating, RatingScale};
    use lensrec::{ItemId, UserId};

    use super::*;

    fn synthetic(offset: u32) -> RatingTable {
        let ratings = (0..20u32)
            .flat_map(|user| (0..12u32).map(move |item| (user, item)))
            .map(|(user, item)| {
                Rating::new(user, item, 1.0 + ((user * 3 + item * 5 + offset) % 5) as f32)
            })
            .collect();

        RatingTable::build(ratings, RatingScale::default()).unwrap()
    }

    fn pairs(table: &RatingTable) -> HashSet<(UserId, ItemId)> {
        table
            .observations()
            .iter()
            .map(|x| (x.user_id(), x.item_id()))
            .collect()
    }

    #[test]
    fn validation_is_disjoint_from_test() {
        let data = synthetic(0);
        let tables = split_tables(&data, 42).unwrap();

        let (fit, validation, test) = (
            pairs(&tables.fit),
            pairs(&tables.validation),
            pairs(&tables.test),
        );

        assert!(!validation.is_empty());
        assert!(validation.is_disjoint(&test));
        assert!(validation.is_disjoint(&fit));
        assert!(fit.is_disjoint(&test));
        assert_eq!(fit.len() + validation.len() + test.len(), data.len());
    }

    #[test]
    fn test_ratings_do_not_affect_training() {
        let tables = split_tables(&synthetic(0), 42).unwrap();
        let hyper = factorization::Hyperparameters::new()
            .latent_dim(4)
            .learning_rate(0.02)
            .num_epochs(30)
            .seed(5);

        let first = run_trial(hyper.clone(), &tables).unwrap().unwrap();

        let shuffled_test = Tables {
            fit: tables.fit.clone(),
            validation: tables.validation.clone(),
            test: synthetic(2),
        };
        let second = run_trial(hyper, &shuffled_test).unwrap().unwrap();

        assert_eq!(first.train_rmse, second.train_rmse);
        assert_eq!(first.validation_rmse, second.validation_rmse);
        assert_eq!(first.epochs_run, second.epochs_run);
    }
}
