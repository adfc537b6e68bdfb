#[macro_use]
extern crate criterion;

extern crate rand;
extern crate reco;

use criterion::Criterion;

use rand::{Rng, SeedableRng, XorShiftRng};

use reco::data::{Dataset, Rating, Ratings};
use reco::evaluation::{test_info, EvalSplits, MetricsConfig, SplitRole};
use reco::models::svd;
use reco::{Recommender, Task};

fn synthetic_ratings(num_rows: usize) -> Ratings {
    let mut rng = XorShiftRng::from_seed([42; 16]);

    let ratings: Vec<Rating> = (0..num_rows)
        .map(|idx| {
            Rating::new(
                rng.gen_range(0, 200),
                rng.gen_range(0, 500),
                rng.gen_range(1, 6) as f32,
                idx,
            )
        })
        .collect();

    Ratings::from(ratings)
}

fn bench_batched_evaluation(c: &mut Criterion) {
    c.bench_function("batched_test_info", |b| {
        let mut ratings = synthetic_ratings(20_000);
        let mut rng = XorShiftRng::from_seed([7; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Ranking)
            .with_negative_samples(&mut rng, 1);

        let mut model = svd::Hyperparameters::new(Task::Ranking)
            .negative_sampling(true)
            .num_factors(16)
            .num_epochs(1)
            .verbose(0)
            .from_seed([11; 16])
            .build();
        model.fit(&data).unwrap();

        let config = MetricsConfig::default();
        let batch_size = config.test_batch_size(model.kind());

        b.iter(|| {
            let split = data.split(SplitRole::Test, Task::Ranking, true).unwrap();
            test_info(&model, &split, batch_size).unwrap()
        });
    });
}

criterion_group!(benches, bench_batched_evaluation);
criterion_main!(benches);
