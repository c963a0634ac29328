//! Train/test splitters.
//!
//! A splitter partitions a rating table into two disjoint row sets whose
//! union reconstructs the input exactly. The random splitter assigns
//! whole users to the test side by ranking them on a keyed hash, so a
//! given seed always produces the same assignment; the temporal splitter
//! holds out the latest fraction of each user's history.

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use rand::Rng;
use siphasher::sip::SipHasher;

use crate::data::{RatingRow, RatingTable};
use crate::errors::CoreError;
use crate::factory::Factory;
use crate::params::{ParamSchema, ParamValue, Params};
use crate::UserId;

/// Inclusive bounds on the configurable test-set proportion.
pub const MIN_TEST_RATIO: f64 = 0.01;
/// Upper bound of [`MIN_TEST_RATIO`]'s range.
pub const MAX_TEST_RATIO: f64 = 0.99;

/// Partitions a table into train and test row sets.
pub trait Splitter: Send {
    /// Splits the table; every input row lands on exactly one side.
    fn split(&self, table: RatingTable) -> Result<(RatingTable, RatingTable), CoreError>;
}

/// Factory of the registered splitters.
pub type SplitFactory = Factory<Box<dyn Splitter>, ()>;

fn check_ratio(test_ratio: f64) -> Result<(), CoreError> {
    if test_ratio < MIN_TEST_RATIO || test_ratio > MAX_TEST_RATIO || test_ratio.is_nan() {
        return Err(CoreError::Logic(format!(
            "test ratio {} outside [{}, {}]",
            test_ratio, MIN_TEST_RATIO, MAX_TEST_RATIO
        )));
    }
    Ok(())
}

/// Assigns a `test_ratio` fraction of whole users to the test side.
pub struct RandomSplitter {
    test_ratio: f64,
    seed: u64,
}

impl RandomSplitter {
    /// Creates a splitter; a missing seed is drawn from the thread RNG.
    pub fn new(test_ratio: f64, seed: Option<u64>) -> Result<RandomSplitter, CoreError> {
        check_ratio(test_ratio)?;
        Ok(RandomSplitter {
            test_ratio,
            seed: seed.unwrap_or_else(|| rand::thread_rng().gen()),
        })
    }

    fn user_hash(&self, user: UserId) -> u64 {
        let mut hasher = SipHasher::new_with_keys(self.seed, self.seed.rotate_left(32));
        hasher.write_u64(user);
        hasher.finish()
    }
}

impl Splitter for RandomSplitter {
    fn split(&self, table: RatingTable) -> Result<(RatingTable, RatingTable), CoreError> {
        let users = table.unique_users();
        let test_count = (self.test_ratio * users.len() as f64).floor() as usize;

        let mut ranked: Vec<UserId> = users;
        ranked.sort_by_key(|&user| (self.user_hash(user), user));
        let test_users: HashSet<UserId> = ranked.into_iter().take(test_count).collect();

        let mut train = RatingTable::new();
        let mut test = RatingTable::new();
        for row in table {
            if test_users.contains(&row.user) {
                test.push(row);
            } else {
                train.push(row);
            }
        }

        Ok((train, test))
    }
}

/// Holds out the latest `test_ratio` fraction of each user's rows.
pub struct TemporalSplitter {
    test_ratio: f64,
}

impl TemporalSplitter {
    /// Creates a splitter over timestamped tables.
    pub fn new(test_ratio: f64) -> Result<TemporalSplitter, CoreError> {
        check_ratio(test_ratio)?;
        Ok(TemporalSplitter { test_ratio })
    }
}

impl Splitter for TemporalSplitter {
    fn split(&self, table: RatingTable) -> Result<(RatingTable, RatingTable), CoreError> {
        let mut by_user: HashMap<UserId, Vec<RatingRow>> = HashMap::new();
        for row in table {
            if row.timestamp.is_none() {
                return Err(CoreError::Logic(
                    "temporal split requires a timestamp column".to_owned(),
                ));
            }
            by_user.entry(row.user).or_insert_with(Vec::new).push(row);
        }

        let mut users: Vec<UserId> = by_user.keys().copied().collect();
        users.sort();

        let mut train = RatingTable::new();
        let mut test = RatingTable::new();
        for user in users {
            let mut rows = by_user.remove(&user).expect("listed key");
            // Ties resolve by item id so reruns produce the same split.
            rows.sort_by_key(|row| (row.timestamp, row.item));

            let test_count = (self.test_ratio * rows.len() as f64).round() as usize;
            let cut = rows.len() - test_count.min(rows.len());
            for (index, row) in rows.into_iter().enumerate() {
                if index < cut {
                    train.push(row);
                } else {
                    test.push(row);
                }
            }
        }

        Ok((train, test))
    }
}

fn ratio_from(params: &Params) -> Result<f64, CoreError> {
    params
        .get("test_ratio")
        .and_then(ParamValue::as_f64)
        .ok_or_else(|| CoreError::Logic("missing parameter 'test_ratio'".to_owned()))
}

fn seed_from(params: &Params) -> Option<u64> {
    params.get("seed").and_then(ParamValue::as_u64)
}

/// Builds the factory of built-in splitters.
pub fn create_split_factory() -> SplitFactory {
    let mut factory = SplitFactory::new("splitters");

    factory
        .add(
            "random",
            Box::new(|_, params, _| {
                let splitter = RandomSplitter::new(ratio_from(params)?, seed_from(params))?;
                Ok(Box::new(splitter) as Box<dyn Splitter>)
            }),
            Some(Box::new(|| {
                ParamSchema::new()
                    .with_range("test_ratio", 0.2, MIN_TEST_RATIO, MAX_TEST_RATIO)
                    .with_seed("seed")
            })),
        )
        .expect("fresh factory");
    factory
        .add(
            "temporal",
            Box::new(|_, params, _| {
                let splitter = TemporalSplitter::new(ratio_from(params)?)?;
                Ok(Box::new(splitter) as Box<dyn Splitter>)
            }),
            Some(Box::new(|| {
                ParamSchema::new().with_range("test_ratio", 0.2, MIN_TEST_RATIO, MAX_TEST_RATIO)
            })),
        )
        .expect("fresh factory");

    factory
}
