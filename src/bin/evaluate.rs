extern crate failure;
extern crate lensrec;
extern crate tracing;
extern crate tracing_subscriber;

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lensrec::data::RatingTable;
use lensrec::datasets::{load_movielens, load_movielens_items};
use lensrec::evaluation::{mae, ranking_metrics, rmse};
use lensrec::models::factorization;
use lensrec::models::neighborhood::{self, NeighborhoodModel};
use lensrec::recommend::Recommender;
use lensrec::similarity::{SimilarityMetric, SimilarityMode};
use lensrec::RatingPredictor;

const TEST_FRACTION: f32 = 0.2;
const SEED: u64 = 42;
const CUTOFF: usize = 10;
const RELEVANCE_THRESHOLD: f32 = 4.0;

fn report<T: RatingPredictor + Sync>(
    name: &str,
    model: &T,
    train: &RatingTable,
    test: &RatingTable,
) -> Result<(), failure::Error> {
    let ranking = ranking_metrics(model, train, test, CUTOFF, RELEVANCE_THRESHOLD)?;
    let rmse = rmse(model, test)?;
    let mae = mae(model, test)?;

    info!(
        model = name,
        rmse,
        mae,
        precision = ranking.precision,
        recall = ranking.recall,
        users = ranking.num_users,
        "Evaluated"
    );

    Ok(())
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = env::args().nth(1).unwrap_or_else(|| "u.data".to_owned());
    let data = load_movielens(&path)?;

    let items_path = env::args()
        .nth(2)
        .unwrap_or_else(|| Path::new(&path).with_file_name("u.item").display().to_string());
    let movies = load_movielens_items(&items_path).unwrap_or_else(|error| {
        warn!(%error, path = %items_path, "No movie catalog, showing item ids only");
        HashMap::new()
    });

    let (train, test) = data.split(TEST_FRACTION, SEED)?;
    let train = Arc::new(train);

    info!(train = train.len(), test = test.len(), "Split ratings");

    let start = Instant::now();
    let mut latent = factorization::Hyperparameters::new().seed(SEED).build()?;
    let training = latent.fit(&train)?;
    info!(
        epochs = training.epochs_run,
        elapsed = ?start.elapsed(),
        "Fitted factorization model"
    );
    report("svd", &latent, &train, &test)?;

    for &mode in &[SimilarityMode::User, SimilarityMode::Item] {
        let start = Instant::now();
        let hyper = neighborhood::HyperparametersBuilder::default()
            .mode(mode)
            .metric(SimilarityMetric::Pearson)
            .build()
            .map_err(failure::err_msg)?;
        let mut knn = NeighborhoodModel::new(hyper)?;
        knn.fit(&train);
        info!(?mode, elapsed = ?start.elapsed(), "Fitted neighbourhood model");

        let name = match mode {
            SimilarityMode::User => "user-knn",
            SimilarityMode::Item => "item-knn",
        };
        report(name, &knn, &train, &test)?;
    }

    let recommender = Recommender::new(CUTOFF)?;
    if let Some(&user_id) = train.user_ids().first() {
        for (rank, (item_id, score)) in recommender
            .top_n(&latent, &train, user_id)?
            .into_iter()
            .enumerate()
        {
            match movies.get(&item_id) {
                Some(movie) => info!(
                    user_id,
                    rank = rank + 1,
                    item_id,
                    score,
                    title = %movie.title,
                    genres = %movie.genres.join(", "),
                    "Recommended"
                ),
                None => info!(user_id, rank = rank + 1, item_id, score, "Recommended"),
            }
        }
    }

    Ok(())
}
