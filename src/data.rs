//! Immutable sparse rating tables and train/test splitting.
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use siphasher::sip::SipHasher;

use crate::{ConfigurationError, DataError, ItemId, Timestamp, UserId};

/// A single explicit rating.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Rating {
    user_id: UserId,
    item_id: ItemId,
    rating: f32,
    #[serde(default)]
    timestamp: Option<Timestamp>,
}

impl Rating {
    /// Build a rating without a timestamp.
    pub fn new(user_id: UserId, item_id: ItemId, rating: f32) -> Self {
        Rating {
            user_id,
            item_id,
            rating,
            timestamp: None,
        }
    }

    /// Attach a timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The rating user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
    /// The rated item.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
    /// The rating value.
    pub fn rating(&self) -> f32 {
        self.rating
    }
    /// When the rating was given, if known.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

/// Inclusive range of valid rating values.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct RatingScale {
    min: f32,
    max: f32,
}

impl RatingScale {
    /// Build a scale, failing if the bounds are not finite or not ordered.
    pub fn new(min: f32, max: f32) -> Result<Self, DataError> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(DataError::InvalidScale { min, max });
        }

        Ok(RatingScale { min, max })
    }

    /// Lower bound.
    pub fn min(&self) -> f32 {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> f32 {
        self.max
    }

    /// Whether `rating` lies within the scale.
    pub fn contains(&self, rating: f32) -> bool {
        rating >= self.min && rating <= self.max
    }

    /// Clamp `rating` into the scale.
    pub fn clamp(&self, rating: f32) -> f32 {
        rating.max(self.min).min(self.max)
    }

    /// Centre of the scale.
    pub fn midpoint(&self) -> f32 {
        (self.min + self.max) / 2.0
    }
}

impl Default for RatingScale {
    fn default() -> Self {
        RatingScale { min: 1.0, max: 5.0 }
    }
}

/// An immutable table of explicit ratings, indexed by user and by item.
///
/// Per-user and per-item rating lists are sorted by id, which lets
/// co-rated sets be found with a linear merge.
#[derive(Clone, Debug)]
pub struct RatingTable {
    scale: RatingScale,
    ratings: Vec<Rating>,
    by_user: HashMap<UserId, Vec<(ItemId, f32)>>,
    by_item: HashMap<ItemId, Vec<(UserId, f32)>>,
    cells: HashMap<(UserId, ItemId), f32>,
    user_means: HashMap<UserId, f32>,
    item_means: HashMap<ItemId, f32>,
    user_ids: Vec<UserId>,
    item_ids: Vec<ItemId>,
    mean: f32,
    fingerprint: u64,
}

impl RatingTable {
    /// Build a table, rejecting duplicate (user, item) pairs and ratings
    /// outside `scale`.
    pub fn build(ratings: Vec<Rating>, scale: RatingScale) -> Result<Self, DataError> {
        let mut seen = HashSet::with_capacity(ratings.len());

        for rating in &ratings {
            if !rating.rating.is_finite() || !scale.contains(rating.rating) {
                return Err(DataError::RatingOutOfRange {
                    user_id: rating.user_id,
                    item_id: rating.item_id,
                    rating: rating.rating,
                });
            }

            if !seen.insert((rating.user_id, rating.item_id)) {
                return Err(DataError::DuplicateRating {
                    user_id: rating.user_id,
                    item_id: rating.item_id,
                });
            }
        }

        Ok(Self::from_validated(ratings, scale))
    }

    fn from_validated(ratings: Vec<Rating>, scale: RatingScale) -> Self {
        let mut by_user: HashMap<UserId, Vec<(ItemId, f32)>> = HashMap::new();
        let mut by_item: HashMap<ItemId, Vec<(UserId, f32)>> = HashMap::new();
        let mut cells = HashMap::with_capacity(ratings.len());

        for rating in &ratings {
            cells.insert((rating.user_id, rating.item_id), rating.rating);
            by_user
                .entry(rating.user_id)
                .or_insert_with(Vec::new)
                .push((rating.item_id, rating.rating));
            by_item
                .entry(rating.item_id)
                .or_insert_with(Vec::new)
                .push((rating.user_id, rating.rating));
        }

        for row in by_user.values_mut() {
            row.sort_by_key(|&(item_id, _)| item_id);
        }
        for column in by_item.values_mut() {
            column.sort_by_key(|&(user_id, _)| user_id);
        }

        let user_means = by_user
            .iter()
            .map(|(&user_id, row)| (user_id, mean_of(row)))
            .collect();
        let item_means = by_item
            .iter()
            .map(|(&item_id, column)| (item_id, mean_of(column)))
            .collect();

        let mut user_ids: Vec<UserId> = by_user.keys().cloned().collect();
        user_ids.sort_unstable();
        let mut item_ids: Vec<ItemId> = by_item.keys().cloned().collect();
        item_ids.sort_unstable();

        let mean = if ratings.is_empty() {
            scale.midpoint()
        } else {
            (ratings.iter().map(|x| f64::from(x.rating)).sum::<f64>() / ratings.len() as f64)
                as f32
        };

        let fingerprint = fingerprint(&user_ids, &by_user, &scale);

        RatingTable {
            scale,
            ratings,
            by_user,
            by_item,
            cells,
            user_means,
            item_means,
            user_ids,
            item_ids,
            mean,
            fingerprint,
        }
    }

    /// All observations, in construction order.
    pub fn observations(&self) -> &[Rating] {
        &self.ratings
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    /// Whether the table holds no observations.
    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.user_ids.len()
    }

    /// Number of distinct items.
    pub fn num_items(&self) -> usize {
        self.item_ids.len()
    }

    /// Distinct users, ascending.
    pub fn user_ids(&self) -> &[UserId] {
        &self.user_ids
    }

    /// Distinct items, ascending. This is the recommendation catalog.
    pub fn item_ids(&self) -> &[ItemId] {
        &self.item_ids
    }

    /// The rating scale observations were validated against.
    pub fn scale(&self) -> RatingScale {
        self.scale
    }

    /// Items rated by `user_id` with their ratings, ascending by item.
    /// Empty for unknown users.
    pub fn items_of(&self, user_id: UserId) -> &[(ItemId, f32)] {
        self.by_user
            .get(&user_id)
            .map(|x| x.as_slice())
            .unwrap_or(&[])
    }

    /// Users who rated `item_id` with their ratings, ascending by user.
    /// Empty for unknown items.
    pub fn users_of(&self, item_id: ItemId) -> &[(UserId, f32)] {
        self.by_item
            .get(&item_id)
            .map(|x| x.as_slice())
            .unwrap_or(&[])
    }

    /// The rating `user_id` gave `item_id`, if any.
    pub fn rating(&self, user_id: UserId, item_id: ItemId) -> Option<f32> {
        self.cells.get(&(user_id, item_id)).cloned()
    }

    /// Whether `user_id` has rated `item_id`.
    pub fn contains(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.rating(user_id, item_id).is_some()
    }

    /// Whether `user_id` has any ratings.
    pub fn has_user(&self, user_id: UserId) -> bool {
        self.by_user.contains_key(&user_id)
    }

    /// Whether `item_id` has any ratings.
    pub fn has_item(&self, item_id: ItemId) -> bool {
        self.by_item.contains_key(&item_id)
    }

    /// Global mean rating, the cold-start fallback. For an empty table
    /// this is the midpoint of the scale.
    pub fn mean_rating(&self) -> f32 {
        self.mean
    }

    /// Mean rating given by `user_id`.
    pub fn user_mean(&self, user_id: UserId) -> Option<f32> {
        self.user_means.get(&user_id).cloned()
    }

    /// Mean rating received by `item_id`.
    pub fn item_mean(&self, item_id: ItemId) -> Option<f32> {
        self.item_means.get(&item_id).cloned()
    }

    /// Fraction of the user-item matrix without a rating. An empty table
    /// is entirely sparse.
    pub fn sparsity(&self) -> f64 {
        let cells = self.num_users() as f64 * self.num_items() as f64;

        if cells == 0.0 {
            1.0
        } else {
            1.0 - self.len() as f64 / cells
        }
    }

    /// Content hash of the table. Tables with equal observations and
    /// scale share a fingerprint regardless of construction order.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Deterministically partition the table into `(train, test)`.
    ///
    /// Every user with at least two ratings keeps at least one rating on
    /// each side; users with a single rating go entirely to train. Within a
    /// user, `round(test_fraction * n)` ratings (clamped to `[1, n - 1]`)
    /// are moved to test. The choice depends only on `seed` and the table
    /// contents, not on observation order.
    pub fn split(
        &self,
        test_fraction: f32,
        seed: u64,
    ) -> Result<(RatingTable, RatingTable), ConfigurationError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(ConfigurationError::InvalidTestFraction(test_fraction));
        }

        let mut rng = XorShiftRng::seed_from_u64(seed);
        let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

        let rank = |user_id: UserId, item_id: ItemId| {
            let mut hasher = SipHasher::new_with_keys(key_0, key_1);
            hasher.write_u32(user_id);
            hasher.write_u32(item_id);
            hasher.finish()
        };

        let mut test_pairs = HashSet::new();

        for &user_id in &self.user_ids {
            let row = self.items_of(user_id);
            let num_ratings = row.len();

            if num_ratings < 2 {
                continue;
            }

            let num_test = ((test_fraction * num_ratings as f32).round() as usize)
                .max(1)
                .min(num_ratings - 1);

            let mut ranked: Vec<(u64, ItemId)> = row
                .iter()
                .map(|&(item_id, _)| (rank(user_id, item_id), item_id))
                .collect();
            ranked.sort_unstable();

            for &(_, item_id) in ranked.iter().take(num_test) {
                test_pairs.insert((user_id, item_id));
            }
        }

        let (test, train): (Vec<Rating>, Vec<Rating>) = self
            .ratings
            .iter()
            .cloned()
            .partition(|x| test_pairs.contains(&(x.user_id, x.item_id)));

        Ok((
            RatingTable::from_validated(train, self.scale),
            RatingTable::from_validated(test, self.scale),
        ))
    }
}

fn mean_of<T>(entries: &[(T, f32)]) -> f32 {
    let total: f64 = entries.iter().map(|&(_, rating)| f64::from(rating)).sum();
    (total / entries.len() as f64) as f32
}

fn fingerprint(
    user_ids: &[UserId],
    by_user: &HashMap<UserId, Vec<(ItemId, f32)>>,
    scale: &RatingScale,
) -> u64 {
    let mut hasher = SipHasher::new();

    hasher.write_u32(scale.min.to_bits());
    hasher.write_u32(scale.max.to_bits());

    for user_id in user_ids {
        hasher.write_u32(*user_id);
        for &(item_id, rating) in &by_user[user_id] {
            hasher.write_u32(item_id);
            hasher.write_u32(rating.to_bits());
        }
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn table(ratings: &[(UserId, ItemId, f32)]) -> RatingTable {
        RatingTable::build(
            ratings
                .iter()
                .map(|&(user, item, rating)| Rating::new(user, item, rating))
                .collect(),
            RatingScale::default(),
        )
        .unwrap()
    }

    fn pairs(table: &RatingTable) -> HashSet<(UserId, ItemId)> {
        table
            .observations()
            .iter()
            .map(|x| (x.user_id(), x.item_id()))
            .collect()
    }

    #[test]
    fn indices_are_consistent() {
        let data = table(&[(1, 10, 4.0), (1, 11, 2.0), (2, 10, 5.0)]);

        assert_eq!(data.len(), 3);
        assert_eq!(data.num_users(), 2);
        assert_eq!(data.num_items(), 2);
        assert_eq!(data.items_of(1), &[(10, 4.0), (11, 2.0)]);
        assert_eq!(data.users_of(10), &[(1, 4.0), (2, 5.0)]);
        assert_eq!(data.rating(2, 10), Some(5.0));
        assert_eq!(data.rating(2, 11), None);
        assert!(data.items_of(99).is_empty());
        assert!((data.mean_rating() - 11.0 / 3.0).abs() < 1e-6);
        assert_eq!(data.user_mean(1), Some(3.0));
        assert_eq!(data.item_mean(11), Some(2.0));
        assert_eq!(data.item_mean(12), None);
        assert!((data.sparsity() - 0.25).abs() < 1e-12);
        assert_eq!(table(&[]).sparsity(), 1.0);

        for rating in data.observations() {
            assert!(data
                .items_of(rating.user_id())
                .contains(&(rating.item_id(), rating.rating())));
            assert!(data
                .users_of(rating.item_id())
                .contains(&(rating.user_id(), rating.rating())));
        }
    }

    #[test]
    fn rejects_duplicates() {
        let result = RatingTable::build(
            vec![Rating::new(1, 1, 3.0), Rating::new(1, 1, 4.0)],
            RatingScale::default(),
        );

        assert_eq!(
            result.unwrap_err(),
            DataError::DuplicateRating {
                user_id: 1,
                item_id: 1
            }
        );
    }

    #[test]
    fn rejects_out_of_range() {
        for &value in &[0.5, 5.5, ::std::f32::NAN, ::std::f32::INFINITY] {
            let result = RatingTable::build(vec![Rating::new(1, 1, value)], RatingScale::default());
            match result {
                Err(DataError::RatingOutOfRange { user_id: 1, .. }) => {}
                other => panic!("Unexpected result {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_invalid_scale() {
        assert!(RatingScale::new(5.0, 1.0).is_err());
        assert!(RatingScale::new(1.0, ::std::f32::NAN).is_err());
        assert!(RatingScale::new(0.0, 10.0).is_ok());
    }

    #[test]
    fn fingerprint_ignores_order() {
        let a = table(&[(1, 1, 3.0), (2, 1, 4.0)]);
        let b = table(&[(2, 1, 4.0), (1, 1, 3.0)]);
        let c = table(&[(2, 1, 4.0), (1, 1, 2.0)]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn split_is_stratified() {
        let data = table(&[
            (1, 1, 5.0),
            (1, 2, 3.0),
            (1, 3, 4.0),
            (1, 4, 1.0),
            (2, 1, 2.0),
            (2, 2, 2.0),
            (3, 4, 5.0),
        ]);

        let (train, test) = data.split(0.5, 7).unwrap();

        assert_eq!(test.items_of(1).len(), 2);
        assert_eq!(train.items_of(1).len(), 2);
        assert_eq!(test.items_of(2).len(), 1);
        assert_eq!(train.items_of(2).len(), 1);
        assert!(test.items_of(3).is_empty());
        assert_eq!(train.items_of(3).len(), 1);
    }

    #[test]
    fn split_is_deterministic() {
        let data = table(&[(1, 1, 5.0), (1, 2, 3.0), (1, 3, 4.0), (1, 4, 1.0), (1, 5, 2.0)]);

        let (_, first) = data.split(0.4, 3).unwrap();
        let (_, second) = data.split(0.4, 3).unwrap();

        assert_eq!(pairs(&first), pairs(&second));
    }

    #[test]
    fn split_rejects_bad_fraction() {
        let data = table(&[(1, 1, 5.0)]);

        for &fraction in &[0.0, 1.0, -0.1, ::std::f32::NAN] {
            assert!(data.split(fraction, 0).is_err());
        }
    }

    proptest! {
        #[test]
        fn split_partitions_observations(
            cells in prop::collection::hash_map((0u32..20, 0u32..20), 1u8..6, 1..200),
            fraction in 0.05f32..0.95,
            seed in any::<u64>(),
        ) {
            let ratings: Vec<Rating> = cells
                .iter()
                .map(|(&(user, item), &rating)| Rating::new(user, item, f32::from(rating)))
                .collect();
            let data = RatingTable::build(ratings, RatingScale::default()).unwrap();

            let (train, test) = data.split(fraction, seed).unwrap();
            let (train_pairs, test_pairs) = (pairs(&train), pairs(&test));

            prop_assert!(train_pairs.is_disjoint(&test_pairs));
            prop_assert_eq!(train.len() + test.len(), data.len());
            let union: HashSet<_> = train_pairs.union(&test_pairs).cloned().collect();
            prop_assert_eq!(union, pairs(&data));

            for &user_id in data.user_ids() {
                if data.items_of(user_id).len() >= 2 {
                    prop_assert!(!train.items_of(user_id).is_empty());
                    prop_assert!(!test.items_of(user_id).is_empty());
                }
            }
        }
    }
}
