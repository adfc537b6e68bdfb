extern crate rand;
extern crate reco;

use rand::{Rng, SeedableRng, XorShiftRng};

use reco::data::Dataset;
use reco::evaluation::MetricsConfig;
use reco::models::{bpr, svd};
use reco::Task;

fn main() {
    let mut data = reco::datasets::download_movielens_100k().unwrap();
    println!(
        "Loaded {} interactions over {} users and {} items",
        data.len(),
        data.num_users(),
        data.num_items()
    );

    let mut rng = XorShiftRng::from_seed(rand::thread_rng().gen());

    // Explicit ratings with a biased factorization model.
    let rating_data = Dataset::build(&mut data, &mut rng, 0.2, Task::Rating);

    let mut model = svd::Hyperparameters::new(Task::Rating)
        .num_factors(32)
        .learning_rate(0.005)
        .regularization(0.02)
        .num_epochs(10)
        .verbose(2)
        .from_seed([42; 16])
        .build();
    let loss = model.fit(&rating_data).unwrap();
    println!("SVD final train loss: {:.4}", loss);

    // Implicit ranking with pairwise training and sampled top-k metrics
    // on the final epochs.
    let ranking_data = Dataset::build(&mut data, &mut rng, 0.2, Task::Ranking)
        .with_negative_samples(&mut rng, 1);

    let metrics = MetricsConfig {
        sample_user: 500,
        ..MetricsConfig::default()
    };
    let mut model = bpr::Hyperparameters::new()
        .num_factors(32)
        .learning_rate(0.05)
        .num_epochs(10)
        .verbose(3)
        .metrics(metrics)
        .from_seed([42; 16])
        .build();
    let loss = model.fit(&ranking_data).unwrap();
    println!("BPR final train loss: {:.4}", loss);
}
