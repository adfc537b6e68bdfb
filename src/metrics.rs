//! Metric functions consumed by the evaluation loops: pointwise losses,
//! curve metrics over full splits, and sampled per-user top-k ranking
//! metrics.
//!
//! The evaluator treats everything here as a black box; it only supplies
//! correctly shaped inputs (full label/probability vectors for the
//! AUC-family metrics, per-user top-k lists for MAP/Recall/NDCG).
use std::cmp::{min, Ordering};
use std::collections::{HashMap, HashSet};

use rand::seq::sample_slice;
use rand::Rng;
use rayon::prelude::*;

use super::{ItemId, PredictionError, Recommender, UserId};

const PROBABILITY_FLOOR: f32 = 1e-7;

/// The logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp = x.exp();
        exp / (1.0 + exp)
    }
}

/// Root-mean-squared error between predictions and labels. Returns 0.0
/// for empty input.
pub fn rmse(predictions: &[f32], labels: &[f32]) -> f32 {
    mean_squared_error(predictions, labels).sqrt()
}

/// Mean squared error between predictions and labels. Returns 0.0 for
/// empty input.
pub fn mean_squared_error(predictions: &[f32], labels: &[f32]) -> f32 {
    if predictions.is_empty() {
        return 0.0;
    }

    let total: f32 = izip!(predictions, labels)
        .map(|(&prediction, &label)| (prediction - label).powi(2))
        .sum();

    total / predictions.len() as f32
}

/// Sum of the binary cross-entropy terms over all rows. Probabilities are
/// clipped away from 0 and 1 before taking logarithms.
pub fn log_loss_sum(probabilities: &[f32], labels: &[f32]) -> f32 {
    izip!(probabilities, labels)
        .map(|(&probability, &label)| {
            let clipped = probability
                .max(PROBABILITY_FLOOR)
                .min(1.0 - PROBABILITY_FLOOR);
            -(label * clipped.ln() + (1.0 - label) * (1.0 - clipped).ln())
        })
        .sum()
}

/// Mean binary cross-entropy over all rows. Returns 0.0 for empty input.
pub fn log_loss(probabilities: &[f32], labels: &[f32]) -> f32 {
    if probabilities.is_empty() {
        return 0.0;
    }

    log_loss_sum(probabilities, labels) / probabilities.len() as f32
}

/// Number of rows whose probability, thresholded at 0.5, matches the
/// binary label.
pub fn correct_predictions(probabilities: &[f32], labels: &[f32]) -> usize {
    izip!(probabilities, labels)
        .filter(|&(&probability, &label)| {
            let predicted = if probability >= 0.5 { 1.0 } else { 0.0 };
            predicted == label
        })
        .count()
}

/// Fraction of correctly classified rows at a 0.5 threshold. Returns 0.0
/// for empty input.
pub fn accuracy(probabilities: &[f32], labels: &[f32]) -> f32 {
    if probabilities.is_empty() {
        return 0.0;
    }

    correct_predictions(probabilities, labels) as f32 / probabilities.len() as f32
}

fn average_ranks(scores: &[f32]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; scores.len()];
    let mut idx = 0;

    while idx < order.len() {
        let mut stop = idx;
        while stop + 1 < order.len() && scores[order[stop + 1]] == scores[order[idx]] {
            stop += 1;
        }

        // Tied scores share the average of the 1-based ranks they span.
        let rank = (idx + stop + 2) as f64 / 2.0;
        for position in idx..=stop {
            ranks[order[position]] = rank;
        }

        idx = stop + 1;
    }

    ranks
}

/// Area under the ROC curve, computed as the tie-aware Mann-Whitney rank
/// statistic. Degenerate splits with a single class score 0.5.
pub fn roc_auc_score(labels: &[f32], scores: &[f32]) -> f32 {
    assert_eq!(labels.len(), scores.len());

    let num_positive = labels.iter().filter(|&&label| label > 0.5).count();
    let num_negative = labels.len() - num_positive;

    if num_positive == 0 || num_negative == 0 {
        return 0.5;
    }

    let ranks = average_ranks(scores);
    let positive_rank_sum: f64 = izip!(labels, ranks.iter())
        .filter(|&(&label, _)| label > 0.5)
        .map(|(_, &rank)| rank)
        .sum();

    let auc = (positive_rank_sum - (num_positive * (num_positive + 1)) as f64 / 2.0)
        / (num_positive * num_negative) as f64;

    auc as f32
}

/// Precision and recall at every distinct score threshold, from the most
/// permissive threshold to the most restrictive, with the conventional
/// terminal `(1.0, 0.0)` point appended.
pub fn precision_recall_curve(labels: &[f32], scores: &[f32]) -> (Vec<f32>, Vec<f32>) {
    assert_eq!(labels.len(), scores.len());

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    let num_positive = labels.iter().filter(|&&label| label > 0.5).count();

    let mut points = Vec::new();

    let mut true_positives = 0.0;
    let mut predicted_positives = 0.0;

    for (position, &idx) in order.iter().enumerate() {
        predicted_positives += 1.0;
        if labels[idx] > 0.5 {
            true_positives += 1.0;
        }

        let is_threshold_boundary =
            position + 1 == order.len() || scores[order[position + 1]] != scores[idx];

        if is_threshold_boundary && num_positive > 0 {
            points.push((
                true_positives / predicted_positives,
                true_positives / num_positive as f32,
            ));

            // Later thresholds cannot improve recall any further.
            if true_positives as usize == num_positive {
                break;
            }
        }
    }

    // Recall decreases along the returned curve, ending in the
    // conventional terminal point.
    points.reverse();
    points.push((1.0, 0.0));

    points.into_iter().unzip()
}

/// Trapezoidal area under a curve given by `x` and `y` coordinates. The
/// `x` values may run in either direction; the absolute area is returned.
pub fn auc(x: &[f32], y: &[f32]) -> f32 {
    assert_eq!(x.len(), y.len());

    if x.len() < 2 {
        return 0.0;
    }

    let mut area = 0.0f64;
    for idx in 1..x.len() {
        let dx = f64::from(x[idx]) - f64::from(x[idx - 1]);
        area += dx * f64::from(y[idx] + y[idx - 1]) / 2.0;
    }

    area.abs() as f32
}

/// Deterministically sample `sample_size` users from the ground-truth
/// population (all of them when fewer exist). Users are sorted before
/// sampling so a seeded generator yields a stable sample.
pub fn sample_users<R: Rng>(
    truth: &HashMap<UserId, HashSet<ItemId>>,
    rng: &mut R,
    sample_size: usize,
) -> Vec<UserId> {
    let mut users: Vec<UserId> = truth.keys().cloned().collect();
    users.sort();

    if users.len() <= sample_size {
        return users;
    }

    sample_slice(rng, &users, sample_size)
}

fn mean_over_users<M, F>(
    model: &M,
    truth: &HashMap<UserId, HashSet<ItemId>>,
    users: &[UserId],
    k: usize,
    per_user: F,
) -> Result<f32, PredictionError>
where
    M: Recommender + Sync,
    F: Fn(&[ItemId], &HashSet<ItemId>) -> f32 + Sync,
{
    let scores: Vec<Option<f32>> = users
        .par_iter()
        .map(|user| -> Result<Option<f32>, PredictionError> {
            let relevant = match truth.get(user) {
                Some(relevant) if !relevant.is_empty() => relevant,
                _ => return Ok(None),
            };

            let recommended = model.recommend_user(*user, k)?;

            Ok(Some(per_user(&recommended, relevant)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let scores: Vec<f32> = scores.into_iter().filter_map(|score| score).collect();

    if scores.is_empty() {
        return Ok(0.0);
    }

    Ok(scores.iter().sum::<f32>() / scores.len() as f32)
}

/// Mean average precision at `k` over the sampled users.
pub fn map_at_k<M: Recommender + Sync>(
    model: &M,
    truth: &HashMap<UserId, HashSet<ItemId>>,
    users: &[UserId],
    k: usize,
) -> Result<f32, PredictionError> {
    mean_over_users(model, truth, users, k, |recommended, relevant| {
        let mut hits = 0.0;
        let mut precision_sum = 0.0;

        for (position, item) in recommended.iter().enumerate() {
            if relevant.contains(item) {
                hits += 1.0;
                precision_sum += hits / (position + 1) as f32;
            }
        }

        precision_sum / min(k, relevant.len()) as f32
    })
}

/// Mean recall at `k` over the sampled users.
pub fn recall_at_k<M: Recommender + Sync>(
    model: &M,
    truth: &HashMap<UserId, HashSet<ItemId>>,
    users: &[UserId],
    k: usize,
) -> Result<f32, PredictionError> {
    mean_over_users(model, truth, users, k, |recommended, relevant| {
        let hits = recommended
            .iter()
            .filter(|item| relevant.contains(item))
            .count();

        hits as f32 / relevant.len() as f32
    })
}

/// Mean normalized discounted cumulative gain at `k` over the sampled
/// users, with binary relevance.
pub fn ndcg_at_k<M: Recommender + Sync>(
    model: &M,
    truth: &HashMap<UserId, HashSet<ItemId>>,
    users: &[UserId],
    k: usize,
) -> Result<f32, PredictionError> {
    mean_over_users(model, truth, users, k, |recommended, relevant| {
        let dcg: f32 = recommended
            .iter()
            .enumerate()
            .filter(|&(_, item)| relevant.contains(item))
            .map(|(position, _)| 1.0 / (position as f32 + 2.0).log2())
            .sum();

        let ideal_positions = min(k, relevant.len());
        let idcg: f32 = (0..ideal_positions)
            .map(|position| 1.0 / (position as f32 + 2.0).log2())
            .sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    })
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};

    use super::super::{ModelKind, Task};
    use super::*;
    use data::Batch;

    #[test]
    fn sigmoid_is_symmetric() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!((sigmoid(3.0) + sigmoid(-3.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rmse_of_exact_predictions_is_zero() {
        let labels = vec![1.0, 2.0, 3.0];
        assert_eq!(rmse(&labels, &labels), 0.0);
        assert_eq!(rmse(&[], &[]), 0.0);
    }

    #[test]
    fn rmse_known_value() {
        // Errors of 1 and -1 over two rows.
        assert!((rmse(&[2.0, 1.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn log_loss_penalizes_confident_mistakes() {
        let confident_right = log_loss(&[0.99, 0.01], &[1.0, 0.0]);
        let confident_wrong = log_loss(&[0.01, 0.99], &[1.0, 0.0]);

        assert!(confident_right < confident_wrong);
        assert!(log_loss(&[0.0, 1.0], &[1.0, 0.0]).is_finite());
    }

    #[test]
    fn accuracy_thresholds_at_half() {
        let probabilities = vec![0.9, 0.4, 0.6, 0.1];
        let labels = vec![1.0, 0.0, 0.0, 0.0];

        assert_eq!(correct_predictions(&probabilities, &labels), 3);
        assert!((accuracy(&probabilities, &labels) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn roc_auc_separable_scores() {
        let labels = vec![0.0, 0.0, 1.0, 1.0];
        let scores = vec![0.1, 0.2, 0.8, 0.9];

        assert!((roc_auc_score(&labels, &scores) - 1.0).abs() < 1e-6);
        assert!((roc_auc_score(&labels, &[0.9, 0.8, 0.2, 0.1]) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn roc_auc_constant_scores_is_half() {
        let labels: Vec<f32> = (0..100).map(|idx| (idx % 2) as f32).collect();
        let scores = vec![0.7; 100];

        assert!((roc_auc_score(&labels, &scores) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn roc_auc_single_class_is_half() {
        assert_eq!(roc_auc_score(&[1.0, 1.0], &[0.3, 0.4]), 0.5);
    }

    #[test]
    fn pr_curve_of_perfect_ranking() {
        let labels = vec![1.0, 1.0, 0.0, 0.0];
        let scores = vec![0.9, 0.8, 0.2, 0.1];

        let (precision, recall) = precision_recall_curve(&labels, &scores);
        let pr_auc = auc(&recall, &precision);

        assert_eq!(*precision.last().unwrap(), 1.0);
        assert_eq!(*recall.last().unwrap(), 0.0);
        assert!((pr_auc - 1.0).abs() < 1e-6);
    }

    #[test]
    fn trapezoid_auc_of_unit_square_half() {
        assert!((auc(&[0.0, 1.0], &[0.0, 1.0]) - 0.5).abs() < 1e-6);
        assert!((auc(&[1.0, 0.0], &[1.0, 0.0]) - 0.5).abs() < 1e-6);
    }

    struct OracleModel {
        // Ranks items in a fixed global order.
        item_order: Vec<ItemId>,
    }

    impl Recommender for OracleModel {
        fn kind(&self) -> ModelKind {
            ModelKind::Pure
        }
        fn task(&self) -> Task {
            Task::Ranking
        }
        fn score_batch(&self, batch: &Batch) -> Result<Vec<f32>, PredictionError> {
            Ok(vec![0.0; batch.len()])
        }
        fn recommend_user(&self, _user: UserId, k: usize) -> Result<Vec<ItemId>, PredictionError> {
            Ok(self.item_order.iter().take(k).cloned().collect())
        }
    }

    fn truth_for(user: UserId, items: &[ItemId]) -> HashMap<UserId, HashSet<ItemId>> {
        let mut truth = HashMap::new();
        truth.insert(user, items.iter().cloned().collect());
        truth
    }

    #[test]
    fn topk_metrics_of_perfect_recommender() {
        let model = OracleModel {
            item_order: vec![0, 1, 2, 3, 4],
        };
        let truth = truth_for(0, &[0, 1]);
        let users = vec![0];

        assert!((map_at_k(&model, &truth, &users, 2).unwrap() - 1.0).abs() < 1e-6);
        assert!((recall_at_k(&model, &truth, &users, 2).unwrap() - 1.0).abs() < 1e-6);
        assert!((ndcg_at_k(&model, &truth, &users, 2).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn topk_metrics_of_mismatched_recommender() {
        let model = OracleModel {
            item_order: vec![5, 6, 7],
        };
        let truth = truth_for(0, &[0, 1]);
        let users = vec![0];

        assert_eq!(map_at_k(&model, &truth, &users, 3).unwrap(), 0.0);
        assert_eq!(recall_at_k(&model, &truth, &users, 3).unwrap(), 0.0);
        assert_eq!(ndcg_at_k(&model, &truth, &users, 3).unwrap(), 0.0);
    }

    #[test]
    fn partial_hit_recall() {
        let model = OracleModel {
            item_order: vec![0, 5, 6],
        };
        let truth = truth_for(0, &[0, 1]);
        let users = vec![0];

        assert!((recall_at_k(&model, &truth, &users, 3).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn users_without_truth_are_skipped() {
        let model = OracleModel {
            item_order: vec![0, 1],
        };
        let truth = truth_for(0, &[0]);
        let users = vec![0, 99];

        assert!((map_at_k(&model, &truth, &users, 1).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sampling_is_stable_for_a_seeded_generator() {
        let mut truth = HashMap::new();
        for user in 0..50 {
            truth.insert(user, [user].iter().cloned().collect());
        }

        let first = sample_users(&truth, &mut XorShiftRng::from_seed([5; 16]), 10);
        let second = sample_users(&truth, &mut XorShiftRng::from_seed([5; 16]), 10);

        assert_eq!(first.len(), 10);
        assert_eq!(first, second);

        let everyone = sample_users(&truth, &mut XorShiftRng::from_seed([5; 16]), 100);
        assert_eq!(everyone.len(), 50);
    }
}
