#![deny(missing_docs)]
//! # reco
//!
//! `reco` implements classic recommender models together with the batched
//! evaluation machinery needed to train and compare them: mini-batch loss
//! computation over held-out data, ROC-AUC and PR-AUC over full splits, and
//! sampled top-k ranking metrics (MAP@k, Recall@k, NDCG@k).
//!
//! Models share a single capability contract, [`Recommender`], which the
//! evaluator treats as an opaque scorer; datasets expose immutable parallel
//! arrays which the evaluator slices into batches.
//!
//! ## Example
//!
//! ```rust
//! # extern crate rand;
//! # extern crate reco;
//! # use rand::{Rng, SeedableRng, XorShiftRng};
//! use reco::Task;
//! use reco::data::{Dataset, Rating, Ratings};
//! use reco::evaluation::{print_metrics, MetricsConfig};
//! use reco::models::svd;
//!
//! let mut rng = XorShiftRng::from_seed([42; 16]);
//!
//! // A small synthetic interaction log.
//! let ratings: Vec<Rating> = (0..64usize)
//!     .map(|idx| {
//!         let user = idx % 8;
//!         let item = rng.gen_range(0, 8);
//!         Rating::new(user, item, 1.0 + (idx % 5) as f32, idx)
//!     })
//!     .collect();
//! let mut ratings = Ratings::from(ratings);
//!
//! let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Rating);
//!
//! let mut model = svd::Hyperparameters::new(Task::Rating)
//!     .num_factors(8)
//!     .learning_rate(0.01)
//!     .num_epochs(5)
//!     .from_seed([7; 16])
//!     .build();
//! let loss = model.fit(&data).unwrap();
//!
//! let report = print_metrics(&model, &data, 5, 2, &MetricsConfig::default()).unwrap();
//! println!("final loss {}, test {:?}", loss, report.test.map(|m| m.loss));
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[cfg(feature = "csv")]
extern crate csv;
#[macro_use]
extern crate failure;
extern crate ndarray;
extern crate rand;
extern crate rayon;
extern crate serde;
extern crate serde_json;
extern crate siphasher;

#[cfg(feature = "reqwest")]
extern crate reqwest;

pub mod data;
#[cfg(feature = "csv")]
pub mod datasets;
pub mod evaluation;
pub mod metrics;
pub mod models;

pub use models::ModelKind;

use data::Batch;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// The learning task a model is trained for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Regression toward explicit numeric ratings.
    Rating,
    /// Binary relevance over implicit feedback.
    Ranking,
}

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The model has not been fitted yet.
    #[fail(display = "Model must be fitted first.")]
    NotFitted,
    /// The batch layout does not match the model family.
    #[fail(display = "Batch layout does not match the model family.")]
    BatchMismatch,
    /// An index in the batch lies outside the fitted parameter tables.
    #[fail(display = "Index {} is out of range for the {} table.", index, table)]
    OutOfRange {
        /// Name of the parameter table that was indexed.
        table: &'static str,
        /// The offending index.
        index: usize,
    },
}

/// Errors encountered during model fitting.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were available to fit on.
    #[fail(display = "No interactions to fit on.")]
    NoInteractions,
    /// The dataset carries no negative-sampled arrays although the model
    /// is trained and evaluated against them.
    #[fail(display = "Dataset has no negative-sampled arrays.")]
    MissingNegativeSamples,
    /// Per-epoch evaluation failed.
    #[fail(display = "Evaluation failed during fitting: {}", _0)]
    Evaluation(#[fail(cause)] evaluation::EvaluationError),
}

impl From<evaluation::EvaluationError> for FittingError {
    fn from(error: evaluation::EvaluationError) -> Self {
        FittingError::Evaluation(error)
    }
}

/// Trait describing the model capability the evaluator consumes: batched
/// scoring of aligned user/item (or feature) rows and ordered top-k
/// recommendation for a single user.
pub trait Recommender {
    /// The model family, used to pick batch layouts and batch-size
    /// defaults. Dispatch happens on this tag, never on type names.
    fn kind(&self) -> ModelKind;
    /// The task the model was configured for.
    fn task(&self) -> Task;
    /// Whether evaluation should run against the negative-sampled arrays.
    fn negative_sampling(&self) -> bool {
        false
    }
    /// Compute one raw score per row of the batch, in row order. For
    /// ranking tasks the scores are logits; the evaluator applies the
    /// sigmoid itself.
    fn score_batch(&self, batch: &Batch) -> Result<Vec<f32>, PredictionError>;
    /// Rank the item catalogue for `user_id` and return the `k` best item
    /// ids, most relevant first, excluding items consumed during training.
    fn recommend_user(&self, user_id: UserId, k: usize) -> Result<Vec<ItemId>, PredictionError>;
}
