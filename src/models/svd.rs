//! Biased matrix factorization.
//!
//! Scores a user/item pair as the sum of a global bias, per-user and
//! per-item biases and the inner product of latent factors. Squared-error
//! gradient steps fit the rating task; logistic gradient steps fit the
//! ranking task against negative-sampled arrays.
use std::collections::HashSet;
use std::time::Instant;

use rand::{thread_rng, Rng, SeedableRng, XorShiftRng};

use super::super::{FittingError, ItemId, PredictionError, Recommender, Task, UserId};
use super::{dot, embedding_init, top_k, ModelKind};
use data::{Batch, Dataset, RatingSplit};
use evaluation::{print_metrics, MetricsConfig};
use metrics::sigmoid;

/// Hyperparameters for the factorization model.
#[derive(Clone, Debug)]
pub struct Hyperparameters {
    num_factors: usize,
    learning_rate: f32,
    reg: f32,
    num_epochs: usize,
    task: Task,
    neg_sampling: bool,
    verbose: u32,
    metrics: MetricsConfig,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters for the given task.
    pub fn new(task: Task) -> Self {
        Hyperparameters {
            num_factors: 16,
            learning_rate: 0.005,
            reg: 0.02,
            num_epochs: 10,
            task,
            neg_sampling: false,
            verbose: 1,
            metrics: MetricsConfig::default(),
            rng: XorShiftRng::from_seed(thread_rng().gen()),
        }
    }

    /// Set the number of latent factors.
    pub fn num_factors(mut self, num_factors: usize) -> Self {
        self.num_factors = num_factors;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 regularization strength.
    pub fn regularization(mut self, reg: f32) -> Self {
        self.reg = reg;
        self
    }

    /// Set the number of epochs to run per `fit` call.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Train and evaluate against the negative-sampled arrays.
    pub fn negative_sampling(mut self, neg_sampling: bool) -> Self {
        self.neg_sampling = neg_sampling;
        self
    }

    /// Set the verbosity tier used for per-epoch evaluation.
    pub fn verbose(mut self, verbose: u32) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the per-epoch evaluation options.
    pub fn metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the random number generator.
    pub fn rng(mut self, rng: XorShiftRng) -> Self {
        self.rng = rng;
        self
    }

    /// Set the random number generator from a seed.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.rng = XorShiftRng::from_seed(seed);
        self
    }

    /// Build the model.
    pub fn build(self) -> Svd {
        Svd {
            hyper: self,
            params: None,
        }
    }
}

#[derive(Debug)]
struct Parameters {
    num_items: usize,
    global_bias: f32,
    user_biases: Vec<f32>,
    item_biases: Vec<f32>,
    user_factors: Vec<Vec<f32>>,
    item_factors: Vec<Vec<f32>>,
    user_consumed: Vec<HashSet<ItemId>>,
}

impl Parameters {
    fn score(&self, user: UserId, item: ItemId) -> f32 {
        self.global_bias
            + self.user_biases[user]
            + self.item_biases[item]
            + dot(&self.user_factors[user], &self.item_factors[item])
    }
}

/// Biased matrix factorization model.
#[derive(Debug)]
pub struct Svd {
    hyper: Hyperparameters,
    params: Option<Parameters>,
}

impl Svd {
    fn training_split<'a>(&self, data: &'a Dataset) -> Result<&'a RatingSplit, FittingError> {
        if self.hyper.task == Task::Ranking && self.hyper.neg_sampling {
            data.train_implicit
                .as_ref()
                .ok_or(FittingError::MissingNegativeSamples)
        } else {
            Ok(&data.train)
        }
    }

    /// Fit the model, evaluating after every epoch at the configured
    /// verbosity. Returns the mean training loss of the final epoch.
    pub fn fit(&mut self, data: &Dataset) -> Result<f32, FittingError> {
        let split = self.training_split(data)?.clone();

        if split.is_empty() {
            return Err(FittingError::NoInteractions);
        }

        let global_bias = match self.hyper.task {
            Task::Rating => split.labels().iter().sum::<f32>() / split.len() as f32,
            Task::Ranking => 0.0,
        };

        self.params = Some(Parameters {
            num_items: data.num_items(),
            global_bias,
            user_biases: vec![0.0; data.num_users()],
            item_biases: vec![0.0; data.num_items()],
            user_factors: embedding_init(
                data.num_users(),
                self.hyper.num_factors,
                &mut self.hyper.rng,
            ),
            item_factors: embedding_init(
                data.num_items(),
                self.hyper.num_factors,
                &mut self.hyper.rng,
            ),
            user_consumed: data.user_consumed(),
        });

        let learning_rate = self.hyper.learning_rate;
        let reg = self.hyper.reg;
        let task = self.hyper.task;

        let mut epoch_loss = 0.0;

        for epoch in 1..=self.hyper.num_epochs {
            let start = Instant::now();
            let mut loss_sum = 0.0;

            {
                let params = self.params.as_mut().unwrap();

                for (&user, (&item, &label)) in split
                    .users()
                    .iter()
                    .zip(split.items().iter().zip(split.labels().iter()))
                {
                    let prediction = params.score(user, item);

                    let (error, loss) = match task {
                        Task::Rating => {
                            let error = label - prediction;
                            (error, error.powi(2))
                        }
                        Task::Ranking => {
                            let probability = sigmoid(prediction);
                            let clipped = probability.max(1e-7).min(1.0 - 1e-7);
                            let loss =
                                -(label * clipped.ln() + (1.0 - label) * (1.0 - clipped).ln());
                            (label - probability, loss)
                        }
                    };

                    loss_sum += loss;

                    params.user_biases[user] +=
                        learning_rate * (error - reg * params.user_biases[user]);
                    params.item_biases[item] +=
                        learning_rate * (error - reg * params.item_biases[item]);

                    for factor in 0..self.hyper.num_factors {
                        let user_factor = params.user_factors[user][factor];
                        let item_factor = params.item_factors[item][factor];

                        params.user_factors[user][factor] +=
                            learning_rate * (error * item_factor - reg * user_factor);
                        params.item_factors[item][factor] +=
                            learning_rate * (error * user_factor - reg * item_factor);
                    }
                }
            }

            epoch_loss = loss_sum / split.len() as f32;

            if self.hyper.verbose >= 1 {
                println!(
                    "Epoch {}: train loss {:.4} (in {:?})",
                    epoch,
                    epoch_loss,
                    start.elapsed()
                );
            }

            print_metrics(
                &*self,
                data,
                epoch,
                self.hyper.verbose,
                &self.hyper.metrics,
            )?;
        }

        Ok(epoch_loss)
    }

    /// Predict the score of a user/item pair: the estimated rating for
    /// the rating task, the interaction probability for ranking.
    pub fn predict(&self, user: UserId, item: ItemId) -> Result<f32, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        if user >= params.user_biases.len() {
            return Err(PredictionError::OutOfRange {
                table: "user",
                index: user,
            });
        }
        if item >= params.num_items {
            return Err(PredictionError::OutOfRange {
                table: "item",
                index: item,
            });
        }

        let score = params.score(user, item);

        match self.hyper.task {
            Task::Rating => Ok(score),
            Task::Ranking => Ok(sigmoid(score)),
        }
    }
}

impl Recommender for Svd {
    fn kind(&self) -> ModelKind {
        ModelKind::Pure
    }

    fn task(&self) -> Task {
        self.hyper.task
    }

    fn negative_sampling(&self) -> bool {
        self.hyper.neg_sampling
    }

    fn score_batch(&self, batch: &Batch) -> Result<Vec<f32>, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        match *batch {
            Batch::Pure { users, items, .. } => izip!(users, items)
                .map(|(&user, &item)| {
                    if user >= params.user_biases.len() {
                        return Err(PredictionError::OutOfRange {
                            table: "user",
                            index: user,
                        });
                    }
                    if item >= params.num_items {
                        return Err(PredictionError::OutOfRange {
                            table: "item",
                            index: item,
                        });
                    }

                    Ok(params.score(user, item))
                })
                .collect(),
            Batch::Features { .. } => Err(PredictionError::BatchMismatch),
        }
    }

    fn recommend_user(&self, user_id: UserId, k: usize) -> Result<Vec<ItemId>, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        if user_id >= params.user_biases.len() {
            return Err(PredictionError::OutOfRange {
                table: "user",
                index: user_id,
            });
        }

        let scores: Vec<f32> = (0..params.num_items)
            .map(|item| params.score(user_id, item))
            .collect();

        Ok(top_k(&scores, k, &params.user_consumed[user_id]))
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};

    use super::*;
    use data::{Rating, Ratings};

    fn checkerboard_ratings() -> Ratings {
        // label = 3 + 2 * (-1)^(user + item): a rank-one structure plus
        // a constant, learnable by biased factorization.
        let ratings: Vec<Rating> = (0..8usize)
            .flat_map(|user| {
                (0..8usize).map(move |item| {
                    let label = if (user + item) % 2 == 0 { 5.0 } else { 1.0 };
                    Rating::new(user, item, label, user * 8 + item)
                })
            })
            .collect();

        Ratings::from(ratings)
    }

    #[test]
    fn learns_checkerboard_ratings() {
        let mut ratings = checkerboard_ratings();
        let mut rng = XorShiftRng::from_seed([13; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.1, Task::Rating);

        let mut model = Hyperparameters::new(Task::Rating)
            .num_factors(8)
            .learning_rate(0.05)
            .regularization(0.001)
            .num_epochs(300)
            .verbose(0)
            .from_seed([19; 16])
            .build();

        let final_loss = model.fit(&data).unwrap();
        assert!(final_loss < 1.0, "final loss {}", final_loss);

        let mut absolute_error = 0.0;
        for user in 0..8 {
            for item in 0..8 {
                let expected = if (user + item) % 2 == 0 { 5.0 } else { 1.0 };
                absolute_error += (model.predict(user, item).unwrap() - expected).abs();
            }
        }

        assert!(absolute_error / 64.0 < 1.0);
    }

    #[test]
    fn ranking_fit_requires_negative_samples() {
        let mut ratings = checkerboard_ratings();
        let mut rng = XorShiftRng::from_seed([23; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Ranking);

        let mut model = Hyperparameters::new(Task::Ranking)
            .negative_sampling(true)
            .verbose(0)
            .build();

        match model.fit(&data) {
            Err(FittingError::MissingNegativeSamples) => {}
            other => panic!("expected missing negative samples, got {:?}", other),
        }
    }

    fn sparse_ratings() -> Ratings {
        // Every user rates eight of fifteen items, leaving the rest
        // available for recommendation.
        let ratings: Vec<Rating> = (0..8usize)
            .flat_map(|user| {
                (0..8usize).map(move |offset| {
                    Rating::new(user, (user + offset) % 15, 4.0, user * 8 + offset)
                })
            })
            .collect();

        Ratings::from(ratings)
    }

    #[test]
    fn ranking_fit_and_recommend() {
        let mut ratings = sparse_ratings();
        let mut rng = XorShiftRng::from_seed([29; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Ranking)
            .with_negative_samples(&mut rng, 1);

        let mut model = Hyperparameters::new(Task::Ranking)
            .negative_sampling(true)
            .num_factors(4)
            .learning_rate(0.05)
            .num_epochs(5)
            .verbose(0)
            .from_seed([31; 16])
            .build();

        let loss = model.fit(&data).unwrap();
        assert!(loss.is_finite());

        let consumed = data.user_consumed();
        let recommended = model.recommend_user(0, 3).unwrap();

        assert_eq!(recommended.len(), 3);
        for item in &recommended {
            assert!(!consumed[0].contains(item));
        }
    }

    #[test]
    fn unfitted_model_refuses_to_predict() {
        let model = Hyperparameters::new(Task::Rating).build();

        match model.predict(0, 0) {
            Err(PredictionError::NotFitted) => {}
            other => panic!("expected not-fitted error, got {:?}", other),
        }
    }
}
