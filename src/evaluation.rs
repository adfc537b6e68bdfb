//! Batched evaluation and metrics reporting.
//!
//! Each invocation is a fresh computation: the evaluator slices a split
//! into batches, feeds them to the model in split order, folds the
//! per-batch statistics into split-level aggregates and prints a report.
//! There is no state carried between epochs.
//!
//! The two historical aggregation policies are kept distinct and exposed
//! as [`mean_over_batches`] and [`mean_over_rows`]: pure-family rating
//! losses average per-batch RMSEs without re-weighting, while pure-family
//! ranking losses are weighted by the total number of labels. The feature
//! family averages per-batch means for both tasks.
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rand::thread_rng;
use serde_json;

use data::{batch_ranges, Dataset, FeatureDataset, SplitView};
use metrics;
use super::{ItemId, ModelKind, PredictionError, Recommender, Task, UserId};

const PURE_BATCH_DEFAULT: usize = 1 << 17;
const FEATURE_BATCH_DEFAULT: usize = 1 << 13;

/// Errors raised before or during an evaluation pass.
#[derive(Debug, Fail)]
pub enum EvaluationError {
    /// The metrics configuration could not be parsed, most commonly
    /// because of an unrecognized option name.
    #[fail(display = "Metrics option not understood: {}", _0)]
    InvalidConfig(String),
    /// The dataset carries no arrays for the requested task/sampling
    /// combination.
    #[fail(
        display = "No {:?} arrays for task {:?} with negative sampling set to {}.",
        role, task, neg_sampling
    )]
    MissingSplit {
        /// Which split was requested.
        role: SplitRole,
        /// The task of the evaluated model.
        task: Task,
        /// Whether negative-sampled arrays were requested.
        neg_sampling: bool,
    },
    /// The model failed to score a batch or produce recommendations.
    #[fail(display = "Prediction failed: {}", _0)]
    Prediction(#[fail(cause)] PredictionError),
}

impl From<PredictionError> for EvaluationError {
    fn from(error: PredictionError) -> Self {
        EvaluationError::Prediction(error)
    }
}

/// Which split of a dataset an evaluation pass runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitRole {
    /// The training split.
    Train,
    /// The held-out split.
    Test,
}

/// Evaluation options. The key set is closed: deserializing a
/// configuration with an unknown key fails before any batch work starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Compute ROC-AUC over the full held-out split.
    pub roc_auc: bool,
    /// Compute the precision-recall curve and its AUC.
    pub pr_auc: bool,
    /// Compute MAP@k over sampled users.
    pub map: bool,
    /// The k used for MAP@k.
    pub map_num: usize,
    /// Compute Recall@k over sampled users.
    pub recall: bool,
    /// The k used for Recall@k.
    pub recall_num: usize,
    /// Compute NDCG@k over sampled users.
    pub ndcg: bool,
    /// The k used for NDCG@k.
    pub ndcg_num: usize,
    /// How many users to sample for the three top-k metrics. One sample
    /// is shared by all three within a report.
    pub sample_user: usize,
    /// Training-split batch size; defaults by model family when absent.
    pub train_batch: Option<usize>,
    /// Held-out-split batch size; defaults by model family when absent.
    pub test_batch: Option<usize>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            roc_auc: true,
            pr_auc: true,
            map: true,
            map_num: 20,
            recall: true,
            recall_num: 50,
            ndcg: true,
            ndcg_num: 20,
            sample_user: 1000,
            train_batch: None,
            test_batch: None,
        }
    }
}

impl MetricsConfig {
    /// Parse a configuration from JSON, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self, EvaluationError> {
        serde_json::from_str(json).map_err(|error| EvaluationError::InvalidConfig(error.to_string()))
    }

    /// The training batch size to use for a model family.
    pub fn train_batch_size(&self, kind: ModelKind) -> usize {
        self.train_batch.unwrap_or_else(|| default_batch(kind))
    }

    /// The held-out batch size to use for a model family.
    pub fn test_batch_size(&self, kind: ModelKind) -> usize {
        self.test_batch.unwrap_or_else(|| default_batch(kind))
    }
}

fn default_batch(kind: ModelKind) -> usize {
    match kind {
        ModelKind::FeatureBased => FEATURE_BATCH_DEFAULT,
        _ => PURE_BATCH_DEFAULT,
    }
}

/// Split-level aggregate of an evaluation pass. `SplitMetrics::empty()`
/// is the defined result for a zero-row split.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitMetrics {
    /// Number of rows the aggregate covers.
    pub num_rows: usize,
    /// Aggregated loss; its aggregation policy depends on family and task.
    pub loss: f32,
    /// Classification accuracy, for ranking passes that compute it.
    pub accuracy: Option<f32>,
    /// Batch-averaged RMSE, for feature-family rating passes.
    pub rmse: Option<f32>,
    /// Predicted probabilities concatenated in split row order; one entry
    /// per split row whenever probabilities are collected.
    pub probabilities: Vec<f32>,
}

impl SplitMetrics {
    /// The sentinel aggregate for a split with no rows.
    pub fn empty() -> Self {
        SplitMetrics {
            num_rows: 0,
            loss: 0.0,
            accuracy: None,
            rmse: None,
            probabilities: Vec::new(),
        }
    }

    /// Whether this is the zero-row sentinel.
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }
}

/// Report produced by [`print_metrics`] for one epoch.
#[derive(Clone, Debug, Default)]
pub struct EpochReport {
    /// The epoch the report belongs to.
    pub epoch: usize,
    /// Training-split aggregate, when the verbosity tier computed it.
    pub train: Option<SplitMetrics>,
    /// Held-out-split aggregate, when the verbosity tier computed it.
    pub test: Option<SplitMetrics>,
    /// Full-split ROC-AUC, when configured.
    pub roc_auc: Option<f32>,
    /// Full-split PR-AUC, when configured.
    pub pr_auc: Option<f32>,
    /// MAP@k over sampled users, when configured.
    pub map: Option<f32>,
    /// Recall@k over sampled users, when configured.
    pub recall: Option<f32>,
    /// NDCG@k over sampled users, when configured.
    pub ndcg: Option<f32>,
}

/// Capability the reporter needs from a dataset: array selection by
/// `(role, task, negative sampling)` and held-out ground truth for the
/// top-k metrics.
pub trait EvalSplits {
    /// Select the arrays for an evaluation pass. Requesting a
    /// combination the dataset cannot represent is a configuration error
    /// reported before any batch work starts.
    fn split(
        &self,
        role: SplitRole,
        task: Task,
        neg_sampling: bool,
    ) -> Result<SplitView, EvaluationError>;

    /// Positively labelled held-out items per user.
    fn test_positives(&self) -> HashMap<UserId, HashSet<ItemId>>;
}

impl EvalSplits for Dataset {
    fn split(
        &self,
        role: SplitRole,
        task: Task,
        neg_sampling: bool,
    ) -> Result<SplitView, EvaluationError> {
        let explicit = match role {
            SplitRole::Train => &self.train,
            SplitRole::Test => &self.test,
        };

        match (task, neg_sampling) {
            (Task::Rating, _) | (Task::Ranking, false) => Ok(SplitView::Pure(explicit)),
            (Task::Ranking, true) => {
                let implicit = match role {
                    SplitRole::Train => self.train_implicit.as_ref(),
                    SplitRole::Test => self.test_implicit.as_ref(),
                };

                implicit.map(SplitView::Pure).ok_or(EvaluationError::MissingSplit {
                    role,
                    task,
                    neg_sampling,
                })
            }
        }
    }

    fn test_positives(&self) -> HashMap<UserId, HashSet<ItemId>> {
        Dataset::test_positives(self)
    }
}

impl EvalSplits for FeatureDataset {
    fn split(
        &self,
        role: SplitRole,
        task: Task,
        neg_sampling: bool,
    ) -> Result<SplitView, EvaluationError> {
        let explicit = match role {
            SplitRole::Train => &self.train,
            SplitRole::Test => &self.test,
        };

        match (task, neg_sampling) {
            (Task::Rating, _) | (Task::Ranking, false) => Ok(SplitView::Features(explicit)),
            (Task::Ranking, true) => {
                let implicit = match role {
                    SplitRole::Train => self.train_implicit.as_ref(),
                    SplitRole::Test => self.test_implicit.as_ref(),
                };

                implicit
                    .map(SplitView::Features)
                    .ok_or(EvaluationError::MissingSplit {
                        role,
                        task,
                        neg_sampling,
                    })
            }
        }
    }

    fn test_positives(&self) -> HashMap<UserId, HashSet<ItemId>> {
        FeatureDataset::test_positives(self)
    }
}

/// Unweighted mean of per-batch values. Returns 0.0 for empty input.
pub fn mean_over_batches(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    values.iter().sum::<f32>() / values.len() as f32
}

/// Row-weighted mean: the per-batch sums divided by the total row count.
/// Returns 0.0 when no rows were seen.
pub fn mean_over_rows(batch_sums: &[f32], total_rows: usize) -> f32 {
    if total_rows == 0 {
        return 0.0;
    }

    batch_sums.iter().sum::<f32>() / total_rows as f32
}

fn is_feature_family(kind: ModelKind) -> bool {
    kind == ModelKind::FeatureBased
}

/// Batched loss computation over a training split. Collects losses only;
/// probabilities and accuracy are a held-out-split concern.
pub fn train_info<M: Recommender>(
    model: &M,
    split: &SplitView,
    batch_size: usize,
) -> Result<SplitMetrics, EvaluationError> {
    if split.is_empty() {
        return Ok(SplitMetrics::empty());
    }

    let task = model.task();
    let feature_family = is_feature_family(model.kind());
    let num_rows = split.len();

    let mut batch_losses = Vec::new();

    for range in batch_ranges(num_rows, batch_size) {
        let batch = split.batch(range);
        let scores = model.score_batch(&batch)?;
        let labels = batch.labels();

        let batch_loss = match (task, feature_family) {
            (Task::Rating, false) => metrics::rmse(&scores, labels),
            (Task::Rating, true) => metrics::mean_squared_error(&scores, labels),
            (Task::Ranking, feat) => {
                let probabilities: Vec<f32> =
                    scores.iter().map(|&score| metrics::sigmoid(score)).collect();
                if feat {
                    metrics::log_loss(&probabilities, labels)
                } else {
                    metrics::log_loss_sum(&probabilities, labels)
                }
            }
        };

        batch_losses.push(batch_loss);
    }

    let loss = match (task, feature_family) {
        // The historical asymmetry: pure-family ranking losses are
        // weighted by the total label count, everything else averages
        // the per-batch values directly.
        (Task::Ranking, false) => mean_over_rows(&batch_losses, num_rows),
        _ => mean_over_batches(&batch_losses),
    };

    Ok(SplitMetrics {
        num_rows,
        loss,
        accuracy: None,
        rmse: None,
        probabilities: Vec::new(),
    })
}

/// Batched loss, accuracy and probability computation over a held-out
/// split. For ranking tasks the per-batch probabilities are concatenated
/// in split row order, one entry per row.
pub fn test_info<M: Recommender>(
    model: &M,
    split: &SplitView,
    batch_size: usize,
) -> Result<SplitMetrics, EvaluationError> {
    if split.is_empty() {
        return Ok(SplitMetrics::empty());
    }

    let task = model.task();
    let feature_family = is_feature_family(model.kind());
    let num_rows = split.len();

    let mut batch_losses = Vec::new();
    let mut batch_accuracies = Vec::new();
    let mut batch_rmses = Vec::new();
    let mut probabilities = Vec::new();

    for range in batch_ranges(num_rows, batch_size) {
        let batch = split.batch(range);
        let scores = model.score_batch(&batch)?;
        let labels = batch.labels();

        match (task, feature_family) {
            (Task::Rating, false) => {
                batch_losses.push(metrics::rmse(&scores, labels));
            }
            (Task::Rating, true) => {
                batch_losses.push(metrics::mean_squared_error(&scores, labels));
                batch_rmses.push(metrics::rmse(&scores, labels));
            }
            (Task::Ranking, feat) => {
                let batch_probabilities: Vec<f32> =
                    scores.iter().map(|&score| metrics::sigmoid(score)).collect();

                if feat {
                    batch_losses.push(metrics::log_loss(&batch_probabilities, labels));
                    batch_accuracies.push(metrics::accuracy(&batch_probabilities, labels));
                } else {
                    batch_losses.push(metrics::log_loss_sum(&batch_probabilities, labels));
                    batch_accuracies
                        .push(metrics::correct_predictions(&batch_probabilities, labels) as f32);
                }

                probabilities.extend(batch_probabilities);
            }
        }
    }

    let (loss, accuracy) = match (task, feature_family) {
        (Task::Rating, _) => (mean_over_batches(&batch_losses), None),
        (Task::Ranking, true) => (
            mean_over_batches(&batch_losses),
            Some(mean_over_batches(&batch_accuracies)),
        ),
        (Task::Ranking, false) => (
            mean_over_rows(&batch_losses, num_rows),
            Some(mean_over_rows(&batch_accuracies, num_rows)),
        ),
    };

    let rmse = if batch_rmses.is_empty() {
        None
    } else {
        Some(mean_over_batches(&batch_rmses))
    };

    Ok(SplitMetrics {
        num_rows,
        loss,
        accuracy,
        rmse,
        probabilities,
    })
}

fn seconds_since(start: Instant) -> f64 {
    let elapsed = start.elapsed();
    elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) * 1e-9
}

/// Run the configured evaluation passes for one epoch and print a report.
///
/// Verbosity tiers bound the evaluation cost: below 2 nothing is
/// computed, tier 2 adds the batched losses (and, for ranking tasks, the
/// AUC-family metrics), tier 3 adds the sampled top-k ranking metrics.
/// The structured report is returned alongside the printed output.
pub fn print_metrics<M, D>(
    model: &M,
    data: &D,
    epoch: usize,
    verbose: u32,
    config: &MetricsConfig,
) -> Result<EpochReport, EvaluationError>
where
    M: Recommender + Sync,
    D: EvalSplits,
{
    let mut report = EpochReport::default();
    report.epoch = epoch;

    if verbose < 2 {
        return Ok(report);
    }

    let task = model.task();
    let neg_sampling = model.negative_sampling();

    let train_batch = config.train_batch_size(model.kind());
    let test_batch = config.test_batch_size(model.kind());
    println!("train batch: {}, test batch: {}", train_batch, test_batch);

    let train = data.split(SplitRole::Train, task, neg_sampling)?;
    let test = data.split(SplitRole::Test, task, neg_sampling)?;

    let start = Instant::now();
    let train_metrics = train_info(model, &train, train_batch)?;
    if train_metrics.is_empty() {
        println!("\ttrain split is empty");
    } else {
        println!("\ttrain loss: {:.4}", train_metrics.loss);
        println!("\ttrain loss time: {:.4}", seconds_since(start));
    }

    let start = Instant::now();
    let test_metrics = test_info(model, &test, test_batch)?;
    if test_metrics.is_empty() {
        println!("\ttest split is empty");
    } else {
        println!("\ttest loss: {:.4}", test_metrics.loss);
        if let Some(rmse) = test_metrics.rmse {
            println!("\ttest rmse: {:.4}", rmse);
        }
        if let Some(accuracy) = test_metrics.accuracy {
            println!("\ttest accuracy: {:.4}", accuracy);
        }
        println!("\ttest loss time: {:.4}", seconds_since(start));
    }

    if task == Task::Ranking && !test_metrics.is_empty() {
        let start = Instant::now();
        if config.roc_auc {
            let roc_auc = metrics::roc_auc_score(test.labels(), &test_metrics.probabilities);
            println!("\t test roc auc: {:.4}", roc_auc);
            report.roc_auc = Some(roc_auc);
        }
        if config.pr_auc {
            let (precision, recall) =
                metrics::precision_recall_curve(test.labels(), &test_metrics.probabilities);
            let pr_auc = metrics::auc(&recall, &precision);
            println!("\t test pr auc: {:.4}", pr_auc);
            println!("\t auc, etc. time: {:.4}", seconds_since(start));
            report.pr_auc = Some(pr_auc);
        }

        if verbose >= 3 {
            let truth = data.test_positives();
            // One shared sample keeps MAP, Recall and NDCG comparable
            // within a report.
            let users = metrics::sample_users(&truth, &mut thread_rng(), config.sample_user);

            if config.map {
                let start = Instant::now();
                let map = metrics::map_at_k(model, &truth, &users, config.map_num)?;
                println!("\t MAP@{}: {:.4}", config.map_num, map);
                println!("\t MAP time: {:.4}", seconds_since(start));
                report.map = Some(map);
            }

            if config.recall {
                let start = Instant::now();
                let recall = metrics::recall_at_k(model, &truth, &users, config.recall_num)?;
                println!("\t recall@{}: {:.4}", config.recall_num, recall);
                println!("\t recall time: {:.4}", seconds_since(start));
                report.recall = Some(recall);
            }

            if config.ndcg {
                let start = Instant::now();
                let ndcg = metrics::ndcg_at_k(model, &truth, &users, config.ndcg_num)?;
                println!("\t NDCG@{}: {:.4}", config.ndcg_num, ndcg);
                println!("\t NDCG time: {:.4}", seconds_since(start));
                report.ndcg = Some(ndcg);
            }
        }
    }

    report.train = Some(train_metrics);
    report.test = Some(test_metrics);

    Ok(report)
}
