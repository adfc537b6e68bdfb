//! Factorization machine over feature rows.
//!
//! Scores a row of `(feature index, feature value)` pairs with a global
//! bias, first-order feature weights and factorized pairwise
//! interactions. Works on [`FeatureSplit`](::data::FeatureSplit) rows,
//! covering user/item identities and side features alike.
use std::collections::HashSet;
use std::time::Instant;

use ndarray::ArrayView1;

use rand::{thread_rng, Rng, SeedableRng, XorShiftRng};

use super::super::{FittingError, ItemId, PredictionError, Recommender, Task, UserId};
use super::{embedding_init, top_k, ModelKind};
use data::{Batch, FeatureDataset, FeatureSchema, FeatureSplit};
use evaluation::{print_metrics, MetricsConfig};
use metrics::sigmoid;

/// Hyperparameters for the factorization machine.
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
            num_factors: 8,
            learning_rate: 0.01,
            reg: 0.001,
            num_epochs: 10,
            task,
            neg_sampling: false,
            verbose: 1,
            metrics: MetricsConfig::default(),
            rng: XorShiftRng::from_seed(thread_rng().gen()),
        }
    }

    /// Set the number of interaction factors.
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
    pub fn build(self) -> FactorizationMachine {
        FactorizationMachine {
            hyper: self,
            params: None,
        }
    }
}

#[derive(Debug)]
struct Parameters {
    num_features: usize,
    global_bias: f32,
    weights: Vec<f32>,
    factors: Vec<Vec<f32>>,
    schema: FeatureSchema,
    user_consumed: Vec<HashSet<ItemId>>,
}

impl Parameters {
    /// Score one row, returning the per-factor interaction sums for
    /// gradient reuse.
    fn score_row(&self, row: &[(usize, f32)], num_factors: usize) -> (f32, Vec<f32>) {
        let mut score = self.global_bias;
        let mut interaction_sums = vec![0.0; num_factors];

        for &(feature, value) in row {
            score += self.weights[feature] * value;
        }

        for factor in 0..num_factors {
            let mut sum = 0.0;
            let mut sum_of_squares = 0.0;

            for &(feature, value) in row {
                let term = self.factors[feature][factor] * value;
                sum += term;
                sum_of_squares += term * term;
            }

            interaction_sums[factor] = sum;
            score += 0.5 * (sum * sum - sum_of_squares);
        }

        (score, interaction_sums)
    }
}

/// Factorization machine model.
#[derive(Debug)]
pub struct FactorizationMachine {
    hyper: Hyperparameters,
    params: Option<Parameters>,
}

fn collect_row(
    indices: &ArrayView1<usize>,
    values: &ArrayView1<f32>,
    num_features: usize,
) -> Result<Vec<(usize, f32)>, PredictionError> {
    indices
        .iter()
        .zip(values.iter())
        .map(|(&feature, &value)| {
            if feature >= num_features {
                Err(PredictionError::OutOfRange {
                    table: "feature",
                    index: feature,
                })
            } else {
                Ok((feature, value))
            }
        })
        .collect()
}

impl FactorizationMachine {
    fn training_split<'a>(&self, data: &'a FeatureDataset) -> Result<&'a FeatureSplit, FittingError> {
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
    pub fn fit(&mut self, data: &FeatureDataset) -> Result<f32, FittingError> {
        let split = self.training_split(data)?.clone();

        if split.is_empty() {
            return Err(FittingError::NoInteractions);
        }

        let global_bias = match self.hyper.task {
            Task::Rating => split.labels().iter().sum::<f32>() / split.len() as f32,
            Task::Ranking => 0.0,
        };

        self.params = Some(Parameters {
            num_features: data.num_features(),
            global_bias,
            weights: vec![0.0; data.num_features()],
            factors: embedding_init(
                data.num_features(),
                self.hyper.num_factors,
                &mut self.hyper.rng,
            ),
            schema: data.schema.clone(),
            user_consumed: data.user_consumed(),
        });

        let learning_rate = self.hyper.learning_rate;
        let reg = self.hyper.reg;
        let task = self.hyper.task;
        let num_factors = self.hyper.num_factors;

        let mut epoch_loss = 0.0;

        for epoch in 1..=self.hyper.num_epochs {
            let start = Instant::now();
            let mut loss_sum = 0.0;

            {
                let params = self.params.as_mut().unwrap();

                for ((indices, values), &label) in split
                    .indices()
                    .genrows()
                    .into_iter()
                    .zip(split.values().genrows())
                    .zip(split.labels().iter())
                {
                    let row: Vec<(usize, f32)> = indices
                        .iter()
                        .zip(values.iter())
                        .map(|(&feature, &value)| (feature, value))
                        .collect();

                    let (prediction, interaction_sums) = params.score_row(&row, num_factors);

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

                    params.global_bias += learning_rate * error;

                    for &(feature, value) in &row {
                        params.weights[feature] +=
                            learning_rate * (error * value - reg * params.weights[feature]);
                    }

                    for factor in 0..num_factors {
                        for &(feature, value) in &row {
                            let factor_value = params.factors[feature][factor];
                            let gradient =
                                value * (interaction_sums[factor] - factor_value * value);

                            params.factors[feature][factor] +=
                                learning_rate * (error * gradient - reg * factor_value);
                        }
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

    /// Predict the score of a user/item pair by assembling its feature
    /// row from the schema.
    pub fn predict(&self, user: UserId, item: ItemId) -> Result<f32, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        if user >= params.user_consumed.len() {
            return Err(PredictionError::OutOfRange {
                table: "user",
                index: user,
            });
        }
        if item >= params.schema.num_items() {
            return Err(PredictionError::OutOfRange {
                table: "item",
                index: item,
            });
        }

        let (indices, values) = params.schema.row_for(user, item);
        let row: Vec<(usize, f32)> = indices.into_iter().zip(values.into_iter()).collect();

        let (score, _) = params.score_row(&row, self.hyper.num_factors);

        match self.hyper.task {
            Task::Rating => Ok(score),
            Task::Ranking => Ok(sigmoid(score)),
        }
    }
}

impl Recommender for FactorizationMachine {
    fn kind(&self) -> ModelKind {
        ModelKind::FeatureBased
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
            Batch::Features { indices, values, .. } => indices
                .genrows()
                .into_iter()
                .zip(values.genrows())
                .map(|(row_indices, row_values)| {
                    let row =
                        collect_row(&row_indices, &row_values, params.num_features)?;
                    let (score, _) = params.score_row(&row, self.hyper.num_factors);
                    Ok(score)
                })
                .collect(),
            Batch::Pure { .. } => Err(PredictionError::BatchMismatch),
        }
    }

    fn recommend_user(&self, user_id: UserId, k: usize) -> Result<Vec<ItemId>, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        if user_id >= params.user_consumed.len() {
            return Err(PredictionError::OutOfRange {
                table: "user",
                index: user_id,
            });
        }

        let (indices, values) = params.schema.recommend_rows(user_id);

        let scores: Vec<f32> = indices
            .genrows()
            .into_iter()
            .zip(values.genrows())
            .map(|(row_indices, row_values)| {
                let row: Vec<(usize, f32)> = row_indices
                    .iter()
                    .zip(row_values.iter())
                    .map(|(&feature, &value)| (feature, value))
                    .collect();

                let (score, _) = params.score_row(&row, self.hyper.num_factors);
                score
            })
            .collect();

        Ok(top_k(&scores, k, &params.user_consumed[user_id]))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rand::{SeedableRng, XorShiftRng};

    use super::*;
    use data::{Rating, Ratings};

    fn feature_dataset(task: Task) -> FeatureDataset {
        // Each user rates six of twelve items. Users with side feature 0
        // rate items with side feature 2 highly; the complementary pairs
        // get low ratings.
        let ratings: Vec<Rating> = (0..6usize)
            .flat_map(|user| {
                (0..6usize).map(move |offset| {
                    let item = (user * 2 + offset) % 12;
                    let like = (user % 2 == 0) == (item % 2 == 0);
                    let label = if like { 5.0 } else { 1.0 };
                    Rating::new(user, item, label, user * 6 + offset)
                })
            })
            .collect();
        let mut ratings = Ratings::from(ratings);

        let user_fields: Vec<usize> = (0..6).map(|user| user % 2).collect();
        let item_fields: Vec<usize> = (0..12).map(|item| 2 + item % 2).collect();

        let schema = FeatureSchema::new(
            4,
            Array2::from_shape_vec((6, 1), user_fields).unwrap(),
            Array2::from_shape_vec((6, 1), vec![1.0; 6]).unwrap(),
            Array2::from_shape_vec((12, 1), item_fields).unwrap(),
            Array2::from_shape_vec((12, 1), vec![1.0; 12]).unwrap(),
        );

        let mut rng = XorShiftRng::from_seed([67; 16]);
        FeatureDataset::build(&mut ratings, schema, &mut rng, 0.2, task)
    }

    #[test]
    fn learns_side_feature_structure() {
        let data = feature_dataset(Task::Rating);

        let mut model = Hyperparameters::new(Task::Rating)
            .num_factors(4)
            .learning_rate(0.02)
            .num_epochs(200)
            .verbose(0)
            .from_seed([71; 16])
            .build();

        let final_loss = model.fit(&data).unwrap();
        assert!(final_loss < 1.5, "final loss {}", final_loss);

        // Matching parity pairs should score clearly above opposed ones.
        let liked = model.predict(0, 0).unwrap();
        let disliked = model.predict(0, 1).unwrap();
        assert!(liked > disliked + 1.0, "liked {} disliked {}", liked, disliked);
    }

    #[test]
    fn scores_feature_batches_only() {
        let data = feature_dataset(Task::Rating);

        let mut model = Hyperparameters::new(Task::Rating)
            .num_epochs(1)
            .verbose(0)
            .from_seed([73; 16])
            .build();
        model.fit(&data).unwrap();

        let feature_batch = data.test.batch(0..data.test.len());
        assert_eq!(
            model.score_batch(&feature_batch).unwrap().len(),
            data.test.len()
        );

        let users = vec![0usize];
        let items = vec![0usize];
        let labels = vec![1.0f32];
        let pure_batch = Batch::Pure {
            users: &users,
            items: &items,
            labels: &labels,
        };

        match model.score_batch(&pure_batch) {
            Err(PredictionError::BatchMismatch) => {}
            other => panic!("expected batch mismatch, got {:?}", other),
        }
    }

    #[test]
    fn ranking_with_negative_samples() {
        let mut rng = XorShiftRng::from_seed([79; 16]);
        let data = feature_dataset(Task::Ranking).with_negative_samples(&mut rng, 1);

        let mut model = Hyperparameters::new(Task::Ranking)
            .negative_sampling(true)
            .num_epochs(5)
            .verbose(0)
            .from_seed([83; 16])
            .build();

        let loss = model.fit(&data).unwrap();
        assert!(loss.is_finite());

        let recommended = model.recommend_user(0, 3).unwrap();
        assert_eq!(recommended.len(), 3);
    }

    #[test]
    fn out_of_range_feature_aborts_scoring() {
        let data = feature_dataset(Task::Rating);

        let mut model = Hyperparameters::new(Task::Rating)
            .num_epochs(1)
            .verbose(0)
            .build();
        model.fit(&data).unwrap();

        let bad_indices = Array2::from_shape_vec((1, 4), vec![9999, 0, 4, 10]).unwrap();
        let values = Array2::from_shape_vec((1, 4), vec![1.0; 4]).unwrap();
        let labels = vec![1.0f32];
        let batch = Batch::Features {
            indices: bad_indices.view(),
            values: values.view(),
            labels: &labels,
        };

        match model.score_batch(&batch) {
            Err(PredictionError::OutOfRange { .. }) => {}
            other => panic!("expected out-of-range error, got {:?}", other),
        }
    }
}
