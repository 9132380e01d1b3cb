#[macro_use]
extern crate criterion;

extern crate lensrec;
extern crate rand;
extern crate rand_xorshift;

use criterion::Criterion;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use lensrec::data::{Rating, RatingScale, RatingTable};
use lensrec::models::factorization::Hyperparameters;
use lensrec::similarity::{SimilarityIndex, SimilarityMetric, SimilarityMode};

fn synthetic_ratings(num_users: u32, num_items: u32, per_user: usize) -> RatingTable {
    let mut rng = XorShiftRng::seed_from_u64(1);
    let mut ratings = Vec::new();

    for user_id in 0..num_users {
        let mut items: Vec<u32> = (0..per_user).map(|_| rng.gen_range(0..num_items)).collect();
        items.sort_unstable();
        items.dedup();

        for item_id in items {
            ratings.push(Rating::new(user_id, item_id, rng.gen_range(1..=5) as f32));
        }
    }

    RatingTable::build(ratings, RatingScale::default()).unwrap()
}

fn bench_factorization(c: &mut Criterion) {
    let data = synthetic_ratings(1000, 1500, 50);

    c.bench_function("factorization", |b| {
        let mut model = Hyperparameters::new()
            .latent_dim(32)
            .num_epochs(1)
            .seed(1)
            .build()
            .unwrap();

        b.iter(|| {
            model.fit(&data).unwrap();
        })
    });
}

fn bench_similarity(c: &mut Criterion) {
    let data = synthetic_ratings(300, 500, 30);

    c.bench_function("item_similarity", |b| {
        b.iter(|| SimilarityIndex::build(&data, SimilarityMode::Item, SimilarityMetric::Pearson, 1))
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_factorization, bench_similarity
}
criterion_main!(benches);
