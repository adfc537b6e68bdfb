//! Sequence-aware model based on an exponentially-weighted average of
//! past item embeddings.
//!
//! A user's state at time `t` is
//!
//! ```text
//! u_t = decay * u_{t-1} + (1.0 - decay) * i_t
//! ```
//!
//! where `i_t` is the embedding of the item the user interacted with at
//! time `t`. Item embeddings and biases are trained with a pairwise loss
//! over (state, next item, sampled negative) triples; the gradient flows
//! back through the linear pooling into every contributing embedding.
use std::collections::HashSet;
use std::time::Instant;

use rand::distributions::{Distribution, Uniform};
use rand::{thread_rng, Rng, SeedableRng, XorShiftRng};

use super::super::{FittingError, ItemId, PredictionError, Recommender, Task, Timestamp, UserId};
use super::{dot, embedding_init, top_k, ModelKind};
use data::{Batch, Dataset};
use evaluation::{print_metrics, MetricsConfig};
use metrics::sigmoid;

/// Hyperparameters for the EWMA sequence model.
#[derive(Clone, Debug)]
pub struct Hyperparameters {
    embedding_dim: usize,
    decay: f32,
    max_sequence_length: usize,
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
            embedding_dim: 16,
            decay: 0.85,
            max_sequence_length: 128,
            learning_rate: 0.05,
            reg: 0.001,
            num_epochs: 10,
            verbose: 1,
            metrics: MetricsConfig::default(),
            rng: XorShiftRng::from_seed(thread_rng().gen()),
        }
    }

    /// Set the embedding dimensionality.
    pub fn embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    /// Set the history decay rate; values close to 1.0 remember more of
    /// the past.
    pub fn decay(mut self, decay: f32) -> Self {
        assert!(decay > 0.0 && decay < 1.0);
        self.decay = decay;
        self
    }

    /// Set the maximum history length kept per user.
    pub fn max_sequence_length(mut self, max_sequence_length: usize) -> Self {
        self.max_sequence_length = max_sequence_length;
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
    pub fn build(self) -> SequenceEwma {
        SequenceEwma {
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
    item_embeddings: Vec<Vec<f32>>,
    item_biases: Vec<f32>,
    user_states: Vec<Vec<f32>>,
    user_consumed: Vec<HashSet<ItemId>>,
}

impl Parameters {
    fn score(&self, user: UserId, item: ItemId) -> f32 {
        self.item_biases[item] + dot(&self.user_states[user], &self.item_embeddings[item])
    }
}

/// Implicit EWMA sequence model.
#[derive(Debug)]
pub struct SequenceEwma {
    hyper: Hyperparameters,
    params: Option<Parameters>,
}

fn user_histories(data: &Dataset, max_sequence_length: usize) -> Vec<Vec<ItemId>> {
    let mut histories: Vec<Vec<(Timestamp, ItemId)>> = vec![Vec::new(); data.num_users()];

    let split = &data.train;
    for (&user, (&item, (&label, &timestamp))) in split.users().iter().zip(
        split
            .items()
            .iter()
            .zip(split.labels().iter().zip(split.timestamps().iter())),
    ) {
        if label > 0.0 {
            histories[user].push((timestamp, item));
        }
    }

    histories
        .into_iter()
        .map(|mut history| {
            history.sort();
            let skip = history.len().saturating_sub(max_sequence_length);
            history.into_iter().skip(skip).map(|(_, item)| item).collect()
        })
        .collect()
}

fn pooled_state(history: &[ItemId], embeddings: &[Vec<f32>], decay: f32, dim: usize) -> Vec<f32> {
    let mut state = vec![0.0; dim];

    for (position, &item) in history.iter().enumerate() {
        let embedding = &embeddings[item];

        if position == 0 {
            state.copy_from_slice(embedding);
        } else {
            for (state_value, &embedding_value) in state.iter_mut().zip(embedding.iter()) {
                *state_value = decay * *state_value + (1.0 - decay) * embedding_value;
            }
        }
    }

    state
}

impl SequenceEwma {
    /// Fit the model on per-user interaction sequences, evaluating after
    /// every epoch at the configured verbosity. Returns the mean pairwise
    /// loss of the final epoch.
    pub fn fit(&mut self, data: &Dataset) -> Result<f32, FittingError> {
        let histories = user_histories(data, self.hyper.max_sequence_length);

        if histories.iter().all(|history| history.len() < 2) {
            return Err(FittingError::NoInteractions);
        }

        self.params = Some(Parameters {
            num_items: data.num_items(),
            item_embeddings: embedding_init(
                data.num_items(),
                self.hyper.embedding_dim,
                &mut self.hyper.rng,
            ),
            item_biases: vec![0.0; data.num_items()],
            user_states: vec![Vec::new(); data.num_users()],
            user_consumed: data.user_consumed(),
        });

        let num_epochs = self.hyper.num_epochs;
        let learning_rate = self.hyper.learning_rate;
        let reg = self.hyper.reg;
        let decay = self.hyper.decay;
        let dim = self.hyper.embedding_dim;
        let num_items = data.num_items();
        let item_range = Uniform::new(0, num_items);

        let mut epoch_loss = 0.0;

        for epoch in 1..=num_epochs {
            let start = Instant::now();
            let mut loss_sum = 0.0;
            let mut steps = 0;

            {
                let SequenceEwma {
                    ref mut hyper,
                    ref mut params,
                } = *self;
                let params = params.as_mut().unwrap();
                let rng = &mut hyper.rng;

                for (user, history) in histories.iter().enumerate() {
                    if history.len() < 2 || params.user_consumed[user].len() >= num_items {
                        continue;
                    }

                    // Running state over the prefix, with the pooling
                    // weight of every contributing embedding.
                    let mut state = params.item_embeddings[history[0]].clone();
                    let mut weights = vec![1.0f32];

                    for position in 1..history.len() {
                        let positive = history[position];
                        let negative = loop {
                            let candidate = item_range.sample(rng);
                            if !params.user_consumed[user].contains(&candidate) {
                                break candidate;
                            }
                        };

                        let difference = params.item_biases[positive]
                            + dot(&state, &params.item_embeddings[positive])
                            - params.item_biases[negative]
                            - dot(&state, &params.item_embeddings[negative]);
                        let gradient = sigmoid(-difference);

                        loss_sum += (1.0 + (-difference).exp()).ln();
                        steps += 1;

                        // State gradient, taken before the embeddings move.
                        let state_gradient: Vec<f32> = params.item_embeddings[positive]
                            .iter()
                            .zip(params.item_embeddings[negative].iter())
                            .map(|(&positive_value, &negative_value)| {
                                gradient * (positive_value - negative_value)
                            })
                            .collect();

                        for factor in 0..dim {
                            let positive_value = params.item_embeddings[positive][factor];
                            let negative_value = params.item_embeddings[negative][factor];

                            params.item_embeddings[positive][factor] +=
                                learning_rate * (gradient * state[factor] - reg * positive_value);
                            params.item_embeddings[negative][factor] += learning_rate
                                * (-gradient * state[factor] - reg * negative_value);
                        }

                        params.item_biases[positive] +=
                            learning_rate * (gradient - reg * params.item_biases[positive]);
                        params.item_biases[negative] +=
                            learning_rate * (-gradient - reg * params.item_biases[negative]);

                        // Backpropagate through the linear pooling.
                        for (&weight, &past_item) in weights.iter().zip(history.iter()) {
                            for factor in 0..dim {
                                params.item_embeddings[past_item][factor] +=
                                    learning_rate * weight * state_gradient[factor];
                            }
                        }

                        // Advance the state to cover this interaction.
                        for weight in &mut weights {
                            *weight *= decay;
                        }
                        weights.push(1.0 - decay);

                        for (state_value, &embedding_value) in state
                            .iter_mut()
                            .zip(params.item_embeddings[positive].iter())
                        {
                            *state_value = decay * *state_value + (1.0 - decay) * embedding_value;
                        }
                    }
                }

                // Cache the pooled state of every user for prediction.
                for (user, history) in histories.iter().enumerate() {
                    params.user_states[user] =
                        pooled_state(history, &params.item_embeddings, decay, dim);
                }
            }

            if steps == 0 {
                return Err(FittingError::NoInteractions);
            }

            epoch_loss = loss_sum / steps as f32;

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

    /// Predict the interaction probability of a user/item pair from the
    /// user's pooled history state.
    pub fn predict(&self, user: UserId, item: ItemId) -> Result<f32, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;

        if user >= params.user_states.len() {
            return Err(PredictionError::OutOfRange {
                table: "user history",
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

impl Recommender for SequenceEwma {
    fn kind(&self) -> ModelKind {
        ModelKind::SequenceAware
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
                    if user >= params.user_states.len() {
                        return Err(PredictionError::OutOfRange {
                            table: "user history",
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

        if user_id >= params.user_states.len() {
            return Err(PredictionError::OutOfRange {
                table: "user history",
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

    fn sequential_ratings() -> Ratings {
        // Six users cycling over fifteen items in time order.
        let ratings: Vec<Rating> = (0..6usize)
            .flat_map(|user| {
                (0..10usize)
                    .map(move |step| Rating::new(user, (user * 2 + step) % 15, 1.0, step))
            })
            .collect();

        Ratings::from(ratings)
    }

    fn fit_model() -> (SequenceEwma, Dataset) {
        let mut ratings = sequential_ratings();
        let mut rng = XorShiftRng::from_seed([53; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Ranking)
            .with_negative_samples(&mut rng, 1);

        let mut model = Hyperparameters::new()
            .embedding_dim(8)
            .num_epochs(10)
            .verbose(0)
            .from_seed([59; 16])
            .build();
        model.fit(&data).unwrap();

        (model, data)
    }

    #[test]
    fn fit_and_predict() {
        let (model, _) = fit_model();

        let probability = model.predict(0, 0).unwrap();
        assert!(probability > 0.0 && probability < 1.0);
    }

    #[test]
    fn histories_are_time_ordered_and_capped() {
        let mut ratings = sequential_ratings();
        let mut rng = XorShiftRng::from_seed([61; 16]);
        let data = Dataset::build(&mut ratings, &mut rng, 0.0, Task::Ranking);

        let capped = user_histories(&data, 4);
        for history in &capped {
            assert!(history.len() <= 4);
        }

        // With a zero test fraction every interaction survives; user 0
        // saw items 0..10 in timestamp order.
        let full = user_histories(&data, 100);
        assert_eq!(full[0].len(), 10);
        assert_eq!(full[0][0], 0);
        assert_eq!(full[0][9], 9);
    }

    #[test]
    fn out_of_range_user_aborts_scoring() {
        let (model, _) = fit_model();

        let users = vec![999usize];
        let items = vec![0usize];
        let labels = vec![1.0f32];
        let batch = Batch::Pure {
            users: &users,
            items: &items,
            labels: &labels,
        };

        match model.score_batch(&batch) {
            Err(PredictionError::OutOfRange { .. }) => {}
            other => panic!("expected out-of-range error, got {:?}", other),
        }
    }

    #[test]
    fn recommendations_exclude_consumed_items() {
        let (model, data) = fit_model();
        let consumed = data.user_consumed();

        let recommended = model.recommend_user(1, 3).unwrap();
        assert_eq!(recommended.len(), 3);
        for item in &recommended {
            assert!(!consumed[1].contains(item));
        }
    }
}
