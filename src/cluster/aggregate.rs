//! Reducers combining the outcomes of split or fanned-out commands.
//!
//! Each cluster command declares one reducer. Commands whose per-node
//! outcomes matter individually skip reduction and hand the caller an
//! [`AsyncExecutions`](super::AsyncExecutions) instead.

use std::collections::HashSet;

use bytes::Bytes;

use crate::Result;

/// Folds per-node outcomes into one.
pub trait Reducer<T> {
    /// Combined value.
    type Output;

    /// Combines outcomes given in dispatch order.
    fn reduce(&self, results: Vec<Result<T>>) -> Result<Self::Output>;
}

/// Succeeds only if every part succeeded; the first error in dispatch order
/// wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSucceeded;

impl<T> Reducer<T> for AllSucceeded {
    type Output = ();

    fn reduce(&self, results: Vec<Result<T>>) -> Result<()> {
        results.into_iter().try_for_each(|r| r.map(|_| ()))
    }
}

/// Adds up integer replies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Reducer<i64> for Sum {
    type Output = i64;

    fn reduce(&self, results: Vec<Result<i64>>) -> Result<i64> {
        results.into_iter().sum()
    }
}

/// Merges key lists, dropping duplicates and keeping first-seen order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Union;

impl Reducer<Vec<Bytes>> for Union {
    type Output = Vec<Bytes>;

    fn reduce(&self, results: Vec<Result<Vec<Bytes>>>) -> Result<Vec<Bytes>> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for keys in results {
            for key in keys? {
                if seen.insert(key.clone()) {
                    merged.push(key);
                }
            }
        }
        Ok(merged)
    }
}

/// True only if every part returned true.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalAnd;

impl Reducer<bool> for LogicalAnd {
    type Output = bool;

    fn reduce(&self, results: Vec<Result<bool>>) -> Result<bool> {
        results
            .into_iter()
            .try_fold(true, |acc, r| r.map(|value| acc && value))
    }
}
