//! Interaction data: owning collections, immutable train/test splits made
//! of parallel arrays, negative sampling, and the batch iterator used by
//! the evaluation loops.
use std;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::ops::Range;

use ndarray::{Array2, ArrayView2, Axis, Slice};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use siphasher::sip::SipHasher;

use super::{ItemId, Task, Timestamp, UserId};

/// A single observed user-item interaction with an explicit label.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rating {
    user_id: UserId,
    item_id: ItemId,
    label: f32,
    timestamp: Timestamp,
}

impl Rating {
    /// Create a new rating.
    pub fn new(user_id: UserId, item_id: ItemId, label: f32, timestamp: Timestamp) -> Self {
        Rating {
            user_id,
            item_id,
            label,
            timestamp,
        }
    }
    /// User id of the interaction.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
    /// Item id of the interaction.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
    /// Observed label (rating value, or 1.0 for implicit data).
    pub fn label(&self) -> f32 {
        self.label
    }
    /// Timestamp of the interaction.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Randomly split interactions into a train and a test set.
pub fn train_test_split<R: Rng>(
    ratings: &mut Ratings,
    rng: &mut R,
    test_fraction: f32,
) -> (Ratings, Ratings) {
    ratings.shuffle(rng);

    let (test, train) = ratings.split_at((test_fraction * ratings.len() as f32) as usize);

    (train, test)
}

/// Split interactions by user: every user's interactions land wholly in
/// either the train or the test set, decided by a keyed hash of the user
/// id.
pub fn user_based_split<R: Rng>(
    ratings: &mut Ratings,
    rng: &mut R,
    test_fraction: f32,
) -> (Ratings, Ratings) {
    let denominator = 100_000;
    let train_cutoff = (test_fraction * denominator as f32) as u64;

    let range = Uniform::new(0, std::u64::MAX);
    let (key_0, key_1) = (range.sample(rng), range.sample(rng));

    let is_train = |x: &Rating| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write_usize(x.user_id());
        hasher.finish() % denominator > train_cutoff
    };

    ratings.split_by(is_train)
}

/// An owning, mutable collection of interactions, used to assemble
/// immutable splits.
pub struct Ratings {
    num_users: usize,
    num_items: usize,
    ratings: Vec<Rating>,
}

impl Ratings {
    /// Create an empty collection with fixed dimensions.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Ratings {
            num_users,
            num_items,
            ratings: Vec::new(),
        }
    }

    /// The underlying interactions.
    pub fn data(&self) -> &[Rating] {
        &self.ratings
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    /// Whether the collection holds no interactions.
    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Shuffle the interactions in place.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        rng.shuffle(&mut self.ratings);
    }

    /// Split into `[0, idx)` and `[idx, len)` parts.
    pub fn split_at(&self, idx: usize) -> (Self, Self) {
        let head = Ratings {
            num_users: self.num_users,
            num_items: self.num_items,
            ratings: self.ratings[..idx].to_owned(),
        };
        let tail = Ratings {
            num_users: self.num_users,
            num_items: self.num_items,
            ratings: self.ratings[idx..].to_owned(),
        };

        (head, tail)
    }

    /// Split into interactions matching the predicate and the rest.
    pub fn split_by<F: Fn(&Rating) -> bool>(&self, func: F) -> (Self, Self) {
        let head = Ratings {
            num_users: self.num_users,
            num_items: self.num_items,
            ratings: self.ratings.iter().filter(|x| func(x)).cloned().collect(),
        };
        let tail = Ratings {
            num_users: self.num_users,
            num_items: self.num_items,
            ratings: self.ratings.iter().filter(|x| !func(x)).cloned().collect(),
        };

        (head, tail)
    }

    /// Build the immutable parallel-array representation.
    pub fn to_split(&self) -> RatingSplit {
        RatingSplit::from(self)
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of distinct items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

impl From<Vec<Rating>> for Ratings {
    fn from(data: Vec<Rating>) -> Ratings {
        let num_users = data.iter().map(|x| x.user_id()).max().unwrap() + 1;
        let num_items = data.iter().map(|x| x.item_id()).max().unwrap() + 1;

        Ratings {
            num_users,
            num_items,
            ratings: data,
        }
    }
}

/// An immutable split: parallel arrays with one row per interaction.
/// Never mutated after construction.
#[derive(Clone, Debug, Default)]
pub struct RatingSplit {
    user_indices: Vec<UserId>,
    item_indices: Vec<ItemId>,
    labels: Vec<f32>,
    timestamps: Vec<Timestamp>,
}

impl<'a> From<&'a Ratings> for RatingSplit {
    fn from(ratings: &Ratings) -> RatingSplit {
        RatingSplit {
            user_indices: ratings.data().iter().map(|x| x.user_id()).collect(),
            item_indices: ratings.data().iter().map(|x| x.item_id()).collect(),
            labels: ratings.data().iter().map(|x| x.label()).collect(),
            timestamps: ratings.data().iter().map(|x| x.timestamp()).collect(),
        }
    }
}

impl RatingSplit {
    fn from_rows(rows: Vec<(UserId, ItemId, f32)>) -> RatingSplit {
        RatingSplit {
            user_indices: rows.iter().map(|x| x.0).collect(),
            item_indices: rows.iter().map(|x| x.1).collect(),
            labels: rows.iter().map(|x| x.2).collect(),
            timestamps: vec![0; rows.len()],
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split holds no rows.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// User index column.
    pub fn users(&self) -> &[UserId] {
        &self.user_indices
    }

    /// Item index column.
    pub fn items(&self) -> &[ItemId] {
        &self.item_indices
    }

    /// Label column.
    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Timestamp column.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// Borrow the rows in `range` as a batch.
    pub fn batch(&self, range: Range<usize>) -> Batch {
        Batch::Pure {
            users: &self.user_indices[range.clone()],
            items: &self.item_indices[range.clone()],
            labels: &self.labels[range],
        }
    }

    /// Replace every label with 1.0, turning explicit ratings into
    /// implicit positives.
    pub fn binarized(mut self) -> RatingSplit {
        for label in &mut self.labels {
            *label = 1.0;
        }
        self
    }
}

/// A feature-family split: a dense table of feature indices and values
/// with one row per interaction. The last two columns of the index table
/// are the user and item identity features.
#[derive(Clone, Debug)]
pub struct FeatureSplit {
    feat_indices: Array2<usize>,
    feat_values: Array2<f32>,
    labels: Vec<f32>,
}

impl FeatureSplit {
    fn new(feat_indices: Array2<usize>, feat_values: Array2<f32>, labels: Vec<f32>) -> Self {
        assert_eq!(feat_indices.rows(), labels.len());
        assert_eq!(feat_indices.rows(), feat_values.rows());

        FeatureSplit {
            feat_indices,
            feat_values,
            labels,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split holds no rows.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The feature index table.
    pub fn indices(&self) -> ArrayView2<usize> {
        self.feat_indices.view()
    }

    /// The feature value table.
    pub fn values(&self) -> ArrayView2<f32> {
        self.feat_values.view()
    }

    /// Label column.
    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Borrow the rows in `range` as a batch.
    pub fn batch(&self, range: Range<usize>) -> Batch {
        Batch::Features {
            indices: self
                .feat_indices
                .slice_axis(Axis(0), Slice::from(range.clone())),
            values: self
                .feat_values
                .slice_axis(Axis(0), Slice::from(range.clone())),
            labels: &self.labels[range],
        }
    }

    fn binarized(mut self) -> FeatureSplit {
        for label in &mut self.labels {
            *label = 1.0;
        }
        self
    }
}

/// A borrowed, contiguous slice of a split's rows; created and discarded
/// per evaluation iteration.
#[derive(Clone, Debug)]
pub enum Batch<'a> {
    /// Rows of a [`RatingSplit`]: aligned user/item/label slices.
    Pure {
        /// User index per row.
        users: &'a [UserId],
        /// Item index per row.
        items: &'a [ItemId],
        /// Label per row.
        labels: &'a [f32],
    },
    /// Rows of a [`FeatureSplit`]: aligned index/value tables plus labels.
    Features {
        /// Feature indices, one row per interaction.
        indices: ArrayView2<'a, usize>,
        /// Feature values aligned with `indices`.
        values: ArrayView2<'a, f32>,
        /// Label per row.
        labels: &'a [f32],
    },
}

impl<'a> Batch<'a> {
    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.labels().len()
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.labels().is_empty()
    }

    /// Labels of the batch rows.
    pub fn labels(&self) -> &[f32] {
        match *self {
            Batch::Pure { labels, .. } => labels,
            Batch::Features { labels, .. } => labels,
        }
    }
}

/// A borrowed view of either split family, sliceable into batches.
#[derive(Clone, Copy, Debug)]
pub enum SplitView<'a> {
    /// View of a pure-family split.
    Pure(&'a RatingSplit),
    /// View of a feature-family split.
    Features(&'a FeatureSplit),
}

impl<'a> SplitView<'a> {
    /// Number of rows in the viewed split.
    pub fn len(&self) -> usize {
        match *self {
            SplitView::Pure(split) => split.len(),
            SplitView::Features(split) => split.len(),
        }
    }

    /// Whether the viewed split holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full label column of the viewed split.
    pub fn labels(&self) -> &'a [f32] {
        match *self {
            SplitView::Pure(split) => split.labels(),
            SplitView::Features(split) => split.labels(),
        }
    }

    /// Borrow the rows in `range` as a batch.
    pub fn batch(&self, range: Range<usize>) -> Batch<'a> {
        match *self {
            SplitView::Pure(split) => split.batch(range),
            SplitView::Features(split) => split.batch(range),
        }
    }
}

/// Lazy iterator over half-open row ranges `[i, min(i + batch_size, len))`
/// partitioning `[0, len)` exactly: no overlap, nothing dropped, and only
/// the last range may be shorter than `batch_size`. Ranges follow split
/// order.
#[derive(Clone, Debug)]
pub struct BatchRanges {
    len: usize,
    batch_size: usize,
    cursor: usize,
}

/// Iterate over the batch ranges of a split of length `len`.
///
/// # Panics
///
/// Panics if `batch_size` is zero.
pub fn batch_ranges(len: usize, batch_size: usize) -> BatchRanges {
    assert!(batch_size > 0, "batch size must be positive");

    BatchRanges {
        len,
        batch_size,
        cursor: 0,
    }
}

impl Iterator for BatchRanges {
    type Item = Range<usize>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.len {
            return None;
        }

        let start = self.cursor;
        let stop = std::cmp::min(start + self.batch_size, self.len);
        self.cursor = stop;

        Some(start..stop)
    }
}

fn consumed_sets(splits: &[&RatingSplit], num_users: usize) -> Vec<HashSet<ItemId>> {
    let mut consumed = vec![HashSet::new(); num_users];

    for split in splits {
        for (&user, (&item, &label)) in split
            .users()
            .iter()
            .zip(split.items().iter().zip(split.labels().iter()))
        {
            if label > 0.0 {
                consumed[user].insert(item);
            }
        }
    }

    consumed
}

fn negative_sampled_rows<R: Rng>(
    split: &RatingSplit,
    consumed: &[HashSet<ItemId>],
    num_items: usize,
    num_neg: usize,
    rng: &mut R,
) -> Vec<(UserId, ItemId, f32)> {
    let item_range = Uniform::new(0, num_items);
    let mut rows = Vec::with_capacity(split.len() * (1 + num_neg));

    for (&user, &item) in split.users().iter().zip(split.items().iter()) {
        rows.push((user, item, 1.0));

        if consumed[user].len() >= num_items {
            continue;
        }

        for _ in 0..num_neg {
            let negative = loop {
                let candidate = item_range.sample(rng);
                if !consumed[user].contains(&candidate) {
                    break candidate;
                }
            };
            rows.push((user, negative, 0.0));
        }
    }

    rows
}

/// Pure-family dataset: explicit train/test splits plus, after
/// [`Dataset::with_negative_samples`], the implicit (negative-sampled)
/// array sets used by ranking models.
pub struct Dataset {
    num_users: usize,
    num_items: usize,
    /// Explicit training split.
    pub train: RatingSplit,
    /// Explicit held-out split.
    pub test: RatingSplit,
    /// Negative-sampled training split, if built.
    pub train_implicit: Option<RatingSplit>,
    /// Negative-sampled held-out split, if built.
    pub test_implicit: Option<RatingSplit>,
}

impl Dataset {
    /// Shuffle `ratings`, carve off `test_fraction` of the rows as the
    /// held-out split and freeze both parts into parallel arrays. For the
    /// ranking task the labels are binarized.
    pub fn build<R: Rng>(
        ratings: &mut Ratings,
        rng: &mut R,
        test_fraction: f32,
        task: Task,
    ) -> Dataset {
        let num_users = ratings.num_users();
        let num_items = ratings.num_items();

        let (train, test) = train_test_split(ratings, rng, test_fraction);
        let (mut train, mut test) = (train.to_split(), test.to_split());

        if task == Task::Ranking {
            train = train.binarized();
            test = test.binarized();
        }

        Dataset {
            num_users,
            num_items,
            train,
            test,
            train_implicit: None,
            test_implicit: None,
        }
    }

    /// Build the implicit array sets by pairing every observed positive
    /// with `num_neg` sampled unconsumed items labelled 0.0.
    pub fn with_negative_samples<R: Rng>(mut self, rng: &mut R, num_neg: usize) -> Dataset {
        let consumed = consumed_sets(&[&self.train, &self.test], self.num_users);

        self.train_implicit = Some(RatingSplit::from_rows(negative_sampled_rows(
            &self.train,
            &consumed,
            self.num_items,
            num_neg,
            rng,
        )));
        self.test_implicit = Some(RatingSplit::from_rows(negative_sampled_rows(
            &self.test,
            &consumed,
            self.num_items,
            num_neg,
            rng,
        )));

        self
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of distinct items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }

    /// Items consumed in the training split, per user.
    pub fn user_consumed(&self) -> Vec<HashSet<ItemId>> {
        consumed_sets(&[&self.train], self.num_users)
    }

    /// Held-out ground truth: positively labelled test items per user.
    pub fn test_positives(&self) -> HashMap<UserId, HashSet<ItemId>> {
        let mut positives: HashMap<UserId, HashSet<ItemId>> = HashMap::new();

        for (&user, (&item, &label)) in self
            .test
            .users()
            .iter()
            .zip(self.test.items().iter().zip(self.test.labels().iter()))
        {
            if label > 0.0 {
                positives.entry(user).or_insert_with(HashSet::new).insert(item);
            }
        }

        positives
    }
}

/// Canonical per-entity feature rows in a global feature-index space.
///
/// A full interaction row is laid out as
/// `[user side features..., item side features..., user identity, item identity]`,
/// with the identity features occupying the two final columns. Side
/// features use indices below `side_offset`; user identities occupy
/// `[side_offset, side_offset + num_users)` and item identities the
/// `num_items` indices after those.
#[derive(Clone, Debug)]
pub struct FeatureSchema {
    num_users: usize,
    num_items: usize,
    side_offset: usize,
    user_fields: Array2<usize>,
    user_values: Array2<f32>,
    item_fields: Array2<usize>,
    item_values: Array2<f32>,
}

impl FeatureSchema {
    /// Create a schema from per-user and per-item side-feature tables.
    /// `side_offset` is the number of distinct side-feature indices; all
    /// entries of the field tables must lie below it.
    pub fn new(
        side_offset: usize,
        user_fields: Array2<usize>,
        user_values: Array2<f32>,
        item_fields: Array2<usize>,
        item_values: Array2<f32>,
    ) -> FeatureSchema {
        assert_eq!(user_fields.shape(), user_values.shape());
        assert_eq!(item_fields.shape(), item_values.shape());
        assert!(user_fields.iter().all(|&idx| idx < side_offset));
        assert!(item_fields.iter().all(|&idx| idx < side_offset));

        FeatureSchema {
            num_users: user_fields.rows(),
            num_items: item_fields.rows(),
            side_offset,
            user_fields,
            user_values,
            item_fields,
            item_values,
        }
    }

    /// Total number of distinct feature indices, identities included.
    pub fn num_features(&self) -> usize {
        self.side_offset + self.num_users + self.num_items
    }

    /// Number of columns in a full interaction row.
    pub fn num_fields(&self) -> usize {
        self.user_fields.cols() + self.item_fields.cols() + 2
    }

    /// Number of items covered by the schema.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Column of the user identity feature within a row.
    pub fn user_column(&self) -> usize {
        self.num_fields() - 2
    }

    /// Column of the item identity feature within a row.
    pub fn item_column(&self) -> usize {
        self.num_fields() - 1
    }

    /// Decode the user id held in a row's identity column.
    pub fn user_of_row(&self, row: &[usize]) -> UserId {
        row[self.user_column()] - self.side_offset
    }

    /// Decode the item id held in a row's identity column.
    pub fn item_of_row(&self, row: &[usize]) -> ItemId {
        row[self.item_column()] - self.side_offset - self.num_users
    }

    /// Assemble the full feature row for a `(user, item)` pair.
    pub fn row_for(&self, user: UserId, item: ItemId) -> (Vec<usize>, Vec<f32>) {
        let mut indices = Vec::with_capacity(self.num_fields());
        let mut values = Vec::with_capacity(self.num_fields());

        indices.extend(self.user_fields.row(user).iter().cloned());
        indices.extend(self.item_fields.row(item).iter().cloned());
        indices.push(self.side_offset + user);
        indices.push(self.side_offset + self.num_users + item);

        values.extend(self.user_values.row(user).iter().cloned());
        values.extend(self.item_values.row(item).iter().cloned());
        values.push(1.0);
        values.push(1.0);

        (indices, values)
    }

    /// Assemble the candidate rows for recommending to `user`: one row
    /// per item in the catalogue, in item-id order.
    pub fn recommend_rows(&self, user: UserId) -> (Array2<usize>, Array2<f32>) {
        let fields = self.num_fields();
        let mut indices = Vec::with_capacity(self.num_items * fields);
        let mut values = Vec::with_capacity(self.num_items * fields);

        for item in 0..self.num_items {
            let (row_indices, row_values) = self.row_for(user, item);
            indices.extend(row_indices);
            values.extend(row_values);
        }

        (
            Array2::from_shape_vec((self.num_items, fields), indices).unwrap(),
            Array2::from_shape_vec((self.num_items, fields), values).unwrap(),
        )
    }
}

/// Feature-family dataset: explicit and (optionally) negative-sampled
/// feature splits plus the schema used to assemble prediction rows.
pub struct FeatureDataset {
    num_users: usize,
    num_items: usize,
    /// Row-assembly schema shared by all splits.
    pub schema: FeatureSchema,
    /// Explicit training split.
    pub train: FeatureSplit,
    /// Explicit held-out split.
    pub test: FeatureSplit,
    /// Negative-sampled training split, if built.
    pub train_implicit: Option<FeatureSplit>,
    /// Negative-sampled held-out split, if built.
    pub test_implicit: Option<FeatureSplit>,
}

impl FeatureDataset {
    /// Shuffle `ratings`, split off `test_fraction` as held-out rows and
    /// assemble full feature rows for both parts using `schema`. For the
    /// ranking task the labels are binarized.
    pub fn build<R: Rng>(
        ratings: &mut Ratings,
        schema: FeatureSchema,
        rng: &mut R,
        test_fraction: f32,
        task: Task,
    ) -> FeatureDataset {
        let num_users = ratings.num_users();
        let num_items = ratings.num_items();

        let (train, test) = train_test_split(ratings, rng, test_fraction);

        let mut train = Self::assemble(&schema, train.data());
        let mut test = Self::assemble(&schema, test.data());

        if task == Task::Ranking {
            train = train.binarized();
            test = test.binarized();
        }

        FeatureDataset {
            num_users,
            num_items,
            schema,
            train,
            test,
            train_implicit: None,
            test_implicit: None,
        }
    }

    fn assemble(schema: &FeatureSchema, ratings: &[Rating]) -> FeatureSplit {
        let fields = schema.num_fields();
        let mut indices = Vec::with_capacity(ratings.len() * fields);
        let mut values = Vec::with_capacity(ratings.len() * fields);
        let mut labels = Vec::with_capacity(ratings.len());

        for rating in ratings {
            let (row_indices, row_values) = schema.row_for(rating.user_id(), rating.item_id());
            indices.extend(row_indices);
            values.extend(row_values);
            labels.push(rating.label());
        }

        FeatureSplit::new(
            Array2::from_shape_vec((ratings.len(), fields), indices).unwrap(),
            Array2::from_shape_vec((ratings.len(), fields), values).unwrap(),
            labels,
        )
    }

    fn pairs(&self, split: &FeatureSplit) -> Vec<(UserId, ItemId, f32)> {
        split
            .indices()
            .genrows()
            .into_iter()
            .zip(split.labels().iter())
            .map(|(row, &label)| {
                let row = row.to_vec();
                (
                    self.schema.user_of_row(&row),
                    self.schema.item_of_row(&row),
                    label,
                )
            })
            .collect()
    }

    fn implicit_split<R: Rng>(
        &self,
        split: &FeatureSplit,
        consumed: &[HashSet<ItemId>],
        num_neg: usize,
        rng: &mut R,
    ) -> FeatureSplit {
        let item_range = Uniform::new(0, self.num_items);
        let fields = self.schema.num_fields();

        let mut indices = Vec::new();
        let mut values = Vec::new();
        let mut labels = Vec::new();

        let mut push_row = |user: UserId, item: ItemId, label: f32| {
            let (row_indices, row_values) = self.schema.row_for(user, item);
            indices.extend(row_indices);
            values.extend(row_values);
            labels.push(label);
        };

        for (user, item, _) in self.pairs(split) {
            push_row(user, item, 1.0);

            if consumed[user].len() >= self.num_items {
                continue;
            }

            for _ in 0..num_neg {
                let negative = loop {
                    let candidate = item_range.sample(rng);
                    if !consumed[user].contains(&candidate) {
                        break candidate;
                    }
                };
                push_row(user, negative, 0.0);
            }
        }

        let rows = labels.len();
        FeatureSplit::new(
            Array2::from_shape_vec((rows, fields), indices).unwrap(),
            Array2::from_shape_vec((rows, fields), values).unwrap(),
            labels,
        )
    }

    /// Build the implicit array sets by pairing every observed positive
    /// with `num_neg` sampled unconsumed items labelled 0.0.
    pub fn with_negative_samples<R: Rng>(mut self, rng: &mut R, num_neg: usize) -> FeatureDataset {
        let mut consumed = vec![HashSet::new(); self.num_users];
        for split in &[&self.train, &self.test] {
            for (user, item, label) in self.pairs(split) {
                if label > 0.0 {
                    consumed[user].insert(item);
                }
            }
        }

        self.train_implicit = Some(self.implicit_split(&self.train, &consumed, num_neg, rng));
        self.test_implicit = Some(self.implicit_split(&self.test, &consumed, num_neg, rng));

        self
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of distinct items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Total number of distinct feature indices.
    pub fn num_features(&self) -> usize {
        self.schema.num_features()
    }

    /// Items consumed in the training split, per user.
    pub fn user_consumed(&self) -> Vec<HashSet<ItemId>> {
        let mut consumed = vec![HashSet::new(); self.num_users];
        for (user, item, label) in self.pairs(&self.train) {
            if label > 0.0 {
                consumed[user].insert(item);
            }
        }
        consumed
    }

    /// Held-out ground truth: positively labelled test items per user.
    pub fn test_positives(&self) -> HashMap<UserId, HashSet<ItemId>> {
        let mut positives: HashMap<UserId, HashSet<ItemId>> = HashMap::new();

        for (user, item, label) in self.pairs(&self.test) {
            if label > 0.0 {
                positives.entry(user).or_insert_with(HashSet::new).insert(item);
            }
        }

        positives
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};

    use super::*;

    fn synthetic_ratings(num_rows: usize) -> Ratings {
        let ratings: Vec<Rating> = (0..num_rows)
            .map(|idx| Rating::new(idx % 7, idx % 13, (idx % 5) as f32 + 1.0, idx))
            .collect();

        Ratings::from(ratings)
    }

    #[test]
    fn batch_ranges_partition_exactly() {
        for &(len, batch_size) in &[(257, 100), (100, 100), (1, 100), (99, 10), (1000, 1)] {
            let ranges: Vec<_> = batch_ranges(len, batch_size).collect();

            assert!(!ranges.is_empty());
            assert_eq!(ranges.first().unwrap().start, 0);
            assert_eq!(ranges.last().unwrap().end, len);

            for window in ranges.windows(2) {
                assert_eq!(window[0].end, window[1].start);
            }
            for range in &ranges {
                assert!(range.end - range.start <= batch_size);
                assert!(range.end > range.start);
            }
        }
    }

    #[test]
    fn batch_ranges_empty_split_yields_nothing() {
        assert_eq!(batch_ranges(0, 128).count(), 0);
    }

    #[test]
    fn batch_ranges_example_sizes() {
        let sizes: Vec<usize> = batch_ranges(257, 100).map(|r| r.end - r.start).collect();
        assert_eq!(sizes, vec![100, 100, 57]);
    }

    #[test]
    fn split_preserves_row_order() {
        let ratings = synthetic_ratings(20);
        let split = ratings.to_split();

        for (idx, rating) in ratings.data().iter().enumerate() {
            assert_eq!(split.users()[idx], rating.user_id());
            assert_eq!(split.items()[idx], rating.item_id());
            assert_eq!(split.labels()[idx], rating.label());
        }
    }

    #[test]
    fn train_test_split_partitions_rows() {
        let mut ratings = synthetic_ratings(100);
        let mut rng = XorShiftRng::from_seed([17; 16]);

        let (train, test) = train_test_split(&mut ratings, &mut rng, 0.2);

        assert_eq!(train.len() + test.len(), 100);
        assert_eq!(test.len(), 20);
    }

    #[test]
    fn user_based_split_keeps_users_whole() {
        let mut ratings = synthetic_ratings(200);
        let mut rng = XorShiftRng::from_seed([3; 16]);

        let (train, test) = user_based_split(&mut ratings, &mut rng, 0.3);

        let train_users: HashSet<UserId> =
            train.data().iter().map(|rating| rating.user_id()).collect();
        let test_users: HashSet<UserId> =
            test.data().iter().map(|rating| rating.user_id()).collect();

        assert!(train_users.is_disjoint(&test_users));
        assert_eq!(train.len() + test.len(), 200);
    }

    #[test]
    fn negative_samples_label_unconsumed_items() {
        let mut ratings = synthetic_ratings(60);
        let mut rng = XorShiftRng::from_seed([9; 16]);

        let data = Dataset::build(&mut ratings, &mut rng, 0.2, Task::Ranking)
            .with_negative_samples(&mut rng, 2);

        let implicit = data.train_implicit.as_ref().unwrap();
        assert_eq!(implicit.len(), data.train.len() * 3);

        let consumed = consumed_sets(&[&data.train, &data.test], data.num_users());
        for ((&user, &item), &label) in implicit
            .users()
            .iter()
            .zip(implicit.items().iter())
            .zip(implicit.labels().iter())
        {
            if label == 0.0 {
                assert!(!consumed[user].contains(&item));
            } else {
                assert_eq!(label, 1.0);
            }
        }
    }

    #[test]
    fn feature_schema_round_trips_identity_columns() {
        let schema = FeatureSchema::new(
            4,
            Array2::from_shape_vec((3, 1), vec![0, 1, 1]).unwrap(),
            Array2::from_shape_vec((3, 1), vec![1.0, 1.0, 1.0]).unwrap(),
            Array2::from_shape_vec((5, 1), vec![2, 3, 2, 3, 2]).unwrap(),
            Array2::from_shape_vec((5, 1), vec![1.0; 5]).unwrap(),
        );

        assert_eq!(schema.num_features(), 4 + 3 + 5);
        assert_eq!(schema.num_fields(), 4);

        let (indices, values) = schema.row_for(2, 4);
        assert_eq!(indices, vec![1, 2, 4 + 2, 4 + 3 + 4]);
        assert_eq!(values.len(), 4);
        assert_eq!(schema.user_of_row(&indices), 2);
        assert_eq!(schema.item_of_row(&indices), 4);
    }

    #[test]
    fn feature_dataset_rows_align_with_labels() {
        let mut ratings = synthetic_ratings(40);
        let mut rng = XorShiftRng::from_seed([11; 16]);

        let schema = FeatureSchema::new(
            2,
            Array2::from_shape_vec((7, 1), vec![0; 7]).unwrap(),
            Array2::from_shape_vec((7, 1), vec![1.0; 7]).unwrap(),
            Array2::from_shape_vec((13, 1), vec![1; 13]).unwrap(),
            Array2::from_shape_vec((13, 1), vec![1.0; 13]).unwrap(),
        );

        let data = FeatureDataset::build(&mut ratings, schema, &mut rng, 0.25, Task::Ranking);

        assert_eq!(data.train.len() + data.test.len(), 40);
        assert_eq!(data.train.indices().cols(), data.schema.num_fields());
        assert!(data.train.labels().iter().all(|&label| label == 1.0));

        for (user, item, _) in data.pairs(&data.test) {
            assert!(user < data.num_users());
            assert!(item < data.num_items());
        }
    }
}
