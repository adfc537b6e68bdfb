//! Models module.
pub mod bpr;
pub mod ewma;
pub mod fm;
pub mod svd;

use std::collections::HashSet;

use rand::distributions::{Distribution, Normal};
use rand::Rng;

use super::ItemId;

/// The model family a `Recommender` belongs to. The evaluator dispatches
/// on this tag to pick batch layouts and batch-size defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Models scoring plain user/item index pairs.
    Pure,
    /// Models scoring feature index/value rows.
    FeatureBased,
    /// Models deriving user state from interaction history.
    SequenceAware,
    /// Models trained on pairwise preference comparisons.
    PairwiseRanking,
}

pub(crate) fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Vec<Vec<f32>> {
    let normal = Normal::new(0.0, 1.0 / cols as f64);

    (0..rows)
        .map(|_| (0..cols).map(|_| normal.sample(rng) as f32).collect())
        .collect()
}

pub(crate) fn dot(x: &[f32], y: &[f32]) -> f32 {
    izip!(x, y).map(|(&a, &b)| a * b).sum()
}

/// Indices of the `k` largest scores, best first, skipping excluded
/// items. Ties break toward the lower item id.
pub(crate) fn top_k(scores: &[f32], k: usize, exclude: &HashSet<ItemId>) -> Vec<ItemId> {
    let mut order: Vec<ItemId> = (0..scores.len())
        .filter(|item| !exclude.contains(item))
        .collect();

    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(::std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    order.truncate(k);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_orders_and_excludes() {
        let scores = vec![0.1, 0.9, 0.5, 0.7];
        let exclude: HashSet<ItemId> = [1].iter().cloned().collect();

        assert_eq!(top_k(&scores, 2, &exclude), vec![3, 2]);
        assert_eq!(top_k(&scores, 10, &HashSet::new()), vec![1, 3, 2, 0]);
    }
}
