//! Bayesian personalized ranking.
//!
//! Trains item factors and biases on pairwise comparisons: for every
//! observed positive a random unconsumed item is sampled and the model is
//! pushed to score the positive above it. Evaluation runs against the
//! dataset's negative-sampled arrays like any other ranking model; the
//! pairwise structure only exists during fitting.
use std::collections::HashSet;
use std::time::Instant;

use rand::distributions::{Distribution, Uniform};
use rand::{thread_rng, Rng, SeedableRng, XorShiftRng};

use super::super::{FittingError, ItemId, PredictionError, Recommender, Task, UserId};
use super::{dot, embedding_init, top_k, ModelKind};
use data::{Batch, Dataset};
use evaluation::{print_metrics, MetricsConfig};
use metrics::sigmoid;

/// Hyperparameters for the pairwise ranking model.
#[derive(Clone, Debug)]
pub struct Hyperparameters {
    num_factors: usize,
    learning_rate: f32,
    reg: f32,
    num_epochs: usize,
    verbose: u32,
    metrics: MetricsConfig,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new() -> Self {
        Hyperparameters {
            num_factors: 16,
            learning_rate: 0.05,
            reg: 0.001,
            num_epochs: 10,
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
    pub fn build(self) -> Bpr {
        Bpr {
            hyper: self,
            params: None,
        }
    }
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new()
    }
}

#[derive(Debug)]
struct Parameters {
    num_items: usize,
    user_factors: Vec<Vec<f32>>,
    item_factors: Vec<Vec<f32>>,
    item_biases: Vec<f32>,
    user_consumed: Vec<HashSet<ItemId>>,
}

impl Parameters {
    fn score(&self, user: UserId, item: ItemId) -> f32 {
        self.item_biases[item] + dot(&self.user_factors[user], &self.item_factors[item])
    }
}

/// Pairwise ranking model.
#[derive(Debug)]
pub struct Bpr {
    hyper: Hyperparameters,
    params: Option<Parameters>,
}

impl Bpr {
    /// Fit the model on the positives of the training split, evaluating
    /// after every epoch at the configured verbosity. Returns the mean
    /// pairwise loss of the final epoch.
    pub fn fit(&mut self, data: &Dataset) -> Result<f32, FittingError> {
        let positives: Vec<(UserId, ItemId)> = data
            .train
            .users()
            .iter()
            .zip(data.train.items().iter().zip(data.train.labels().iter()))
            .filter(|&(_, (_, &label))| label > 0.0)
            .map(|(&user, (&item, _))| (user, item))
            .collect();

        if positives.is_empty() {
            return Err(FittingError::NoInteractions);
        }

        self.params = Some(Parameters {
            num_items: data.num_items(),
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
            item_biases: vec![0.0; data.num_items()],
            user_consumed: data.user_consumed(),
        });

        let num_epochs = self.hyper.num_epochs;
        let learning_rate = self.hyper.learning_rate;
        let reg = self.hyper.reg;
        let num_factors = self.hyper.num_factors;
        let num_items = data.num_items();
        let item_range = Uniform::new(0, num_items);

        let mut epoch_loss = 0.0;

        for epoch in 1..=num_epochs {
            let start = Instant::now();
            let mut loss_sum = 0.0;
            let mut comparisons = 0;

            {
                let Bpr {
                    ref mut hyper,
                    ref mut params,
                } = *self;
                let params = params.as_mut().unwrap();
                let rng = &mut hyper.rng;

                for &(user, positive) in &positives {
                    if params.user_consumed[user].len() >= num_items {
                        continue;
                    }

                    let negative = loop {
                        let candidate = item_range.sample(rng);
                        if !params.user_consumed[user].contains(&candidate) {
                            break candidate;
                        }
                    };

                    let difference = params.score(user, positive) - params.score(user, negative);
                    let gradient = sigmoid(-difference);

                    // Softplus of the negated difference, the BPR loss.
                    loss_sum += (1.0 + (-difference).exp()).ln();
                    comparisons += 1;

                    for factor in 0..num_factors {
                        let user_factor = params.user_factors[user][factor];
                        let positive_factor = params.item_factors[positive][factor];
                        let negative_factor = params.item_factors[negative][factor];

                        params.user_factors[user][factor] += learning_rate
                            * (gradient * (positive_factor - negative_factor) - reg * user_factor);
                        params.item_factors[positive][factor] +=
                            learning_rate * (gradient * user_factor - reg * positive_factor);
                        params.item_factors[negative][factor] +=
                            learning_rate * (-gradient * user_factor - reg * negative_factor);
                    }

                    params.item_biases[positive] +=
                        learning_rate * (gradient - reg * params.item_biases[positive]);
                    params.item_biases[negative] +=
                        learning_rate * (-gradient - reg * params.item_biases[negative]);
                }
            }

            if comparisons == 0 {
                return Err(FittingError::NoInteractions);
            }

            epoch_loss = loss_sum / comparisons as f32;

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

    /// Predict the interaction probability of a user/item pair.
    pub fn predict(&self, user: UserId, item: ItemId) -> Result<f32, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        if user >= params.user_factors.len() {
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

        Ok(sigmoid(params.score(user, item)))
    }
}

impl Recommender for Bpr {
    fn kind(&self) -> ModelKind {
        ModelKind::PairwiseRanking
    }

    fn task(&self) -> Task {
        Task::Ranking
    }

    fn negative_sampling(&self) -> bool {
        true
    }

    fn score_batch(&self, batch: &Batch) -> Result<Vec<f32>, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        match *batch {
            Batch::Pure { users, items, .. } => izip!(users, items)
                .map(|(&user, &item)| {
                    if user >= params.user_factors.len() {
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

        if user_id >= params.user_factors.len() {
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
    use evaluation::{test_info, MetricsConfig};

    fn sparse_ratings() -> Ratings {
        let ratings: Vec<Rating> = (0..8usize)
            .flat_map(|user| {
                (0..8usize).map(move |offset| {
                    Rating::new(user, (user + offset) % 15, 1.0, user * 8 + offset)
                })
            })
            .collect();

        Ratings::from(ratings)
    }

    fn fit_model(seed: [u8; 16]) -> (Bpr, Dataset) {
        let mut ratings = sparse_ratings();
        let mut rng = XorShiftRng::from_seed([41; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Ranking)
            .with_negative_samples(&mut rng, 1);

        let mut model = Hyperparameters::new()
            .num_factors(8)
            .num_epochs(20)
            .verbose(0)
            .from_seed(seed)
            .build();
        model.fit(&data).unwrap();

        (model, data)
    }

    #[test]
    fn fitting_is_deterministic_given_a_seed() {
        let (first, data) = fit_model([3; 16]);
        let (second, _) = fit_model([3; 16]);

        assert_eq!(
            first.predict(0, 0).unwrap(),
            second.predict(0, 0).unwrap()
        );
        assert_eq!(
            first.recommend_user(2, 5).unwrap(),
            second.recommend_user(2, 5).unwrap()
        );

        drop(data);
    }

    #[test]
    fn evaluation_runs_against_implicit_arrays() {
        let (model, data) = fit_model([7; 16]);

        let config = MetricsConfig::default();
        let split = ::evaluation::EvalSplits::split(
            &data,
            ::evaluation::SplitRole::Test,
            Task::Ranking,
            true,
        )
        .unwrap();

        let aggregate = test_info(&model, &split, config.test_batch_size(model.kind())).unwrap();

        assert_eq!(aggregate.probabilities.len(), aggregate.num_rows);
        assert!(aggregate.loss.is_finite());
    }

    #[test]
    fn recommendations_exclude_consumed_items() {
        let (model, data) = fit_model([11; 16]);
        let consumed = data.user_consumed();

        let recommended = model.recommend_user(0, 4).unwrap();
        assert_eq!(recommended.len(), 4);
        for item in &recommended {
            assert!(!consumed[0].contains(item));
        }
    }

    #[test]
    fn unknown_user_is_rejected() {
        let (model, _) = fit_model([13; 16]);

        match model.recommend_user(1000, 5) {
            Err(PredictionError::OutOfRange { .. }) => {}
            other => panic!("expected out-of-range error, got {:?}", other),
        }
    }
}
