//! Train/validation splitting, stratified by class label.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DataError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitMode {
    /// A single stratified holdout of `ratio` of each class.
    Plain { ratio: f64 },
    /// Stratified k-fold cross-validation.
    StratifiedKFold { n_splits: usize },
}

/// One train/validation partition. Both index lists are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

impl SplitMode {
    pub fn validate(&self) -> Result<()> {
        match *self {
            SplitMode::Plain { ratio } if !(0.0..1.0).contains(&ratio) => Err(
                DataError::InvalidSplit(format!("ratio must be in [0, 1), got {}", ratio)),
            ),
            SplitMode::StratifiedKFold { n_splits } if n_splits < 2 => Err(DataError::InvalidSplit(
                format!("n_splits must be at least 2, got {}", n_splits),
            )),
            _ => Ok(()),
        }
    }

    /// Splits row indices `0..labels.len()` according to the mode.
    pub fn split(&self, labels: &[usize], seed: u64) -> Result<Vec<Fold>> {
        self.validate()?;
        match *self {
            SplitMode::Plain { ratio } => Ok(vec![stratified_holdout(labels, ratio, seed)]),
            SplitMode::StratifiedKFold { n_splits } => stratified_kfold(labels, n_splits, seed),
        }
    }

    /// Directory name a fold's model is saved under.
    pub fn fold_name(&self, fold: &Fold) -> String {
        match self {
            SplitMode::Plain { .. } => "plain".to_string(),
            SplitMode::StratifiedKFold { .. } => format!("{}_fold", fold.index),
        }
    }
}

fn shuffled_by_class(labels: &[usize], rng: &mut StdRng) -> BTreeMap<usize, Vec<usize>> {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }
    for idxs in by_class.values_mut() {
        idxs.shuffle(rng);
    }
    by_class
}

fn stratified_holdout(labels: &[usize], ratio: f64, seed: u64) -> Fold {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut valid = Vec::new();

    for idxs in shuffled_by_class(labels, &mut rng).into_values() {
        let n_valid = (ratio * idxs.len() as f64).round() as usize;
        valid.extend_from_slice(&idxs[..n_valid]);
        train.extend_from_slice(&idxs[n_valid..]);
    }
    train.sort_unstable();
    valid.sort_unstable();

    Fold {
        index: 0,
        train,
        valid,
    }
}

fn stratified_kfold(labels: &[usize], n_splits: usize, seed: u64) -> Result<Vec<Fold>> {
    if labels.len() < n_splits {
        return Err(DataError::InvalidSplit(format!(
            "cannot make {} folds from {} rows",
            n_splits,
            labels.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); n_splits];
    // The deal position carries over between classes so bucket sizes stay balanced.
    let mut next = 0;
    for idxs in shuffled_by_class(labels, &mut rng).into_values() {
        for i in idxs {
            buckets[next].push(i);
            next = (next + 1) % n_splits;
        }
    }

    let folds = (0..n_splits)
        .map(|k| {
            let mut valid = buckets[k].clone();
            valid.sort_unstable();
            let mut train: Vec<usize> = buckets
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != k)
                .flat_map(|(_, b)| b.iter().copied())
                .collect();
            train.sort_unstable();
            Fold {
                index: k,
                train,
                valid,
            }
        })
        .collect();
    Ok(folds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<usize> {
        // 10 of class 0, 5 of class 1, 5 of class 2
        let mut labels = vec![0; 10];
        labels.extend([1; 5]);
        labels.extend([2; 5]);
        labels
    }

    fn assert_partition(fold: &Fold, n: usize) {
        let mut all: Vec<usize> = fold.train.iter().chain(&fold.valid).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..n).collect::<Vec<_>>());
        assert!(fold.train.windows(2).all(|w| w[0] < w[1]));
        assert!(fold.valid.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn plain_split_is_stratified() {
        let labels = labels();
        let folds = SplitMode::Plain { ratio: 0.2 }.split(&labels, 42).unwrap();
        assert_eq!(folds.len(), 1);
        let fold = &folds[0];
        assert_partition(fold, labels.len());

        let count = |c: usize| fold.valid.iter().filter(|&&i| labels[i] == c).count();
        assert_eq!(count(0), 2);
        assert_eq!(count(1), 1);
        assert_eq!(count(2), 1);
    }

    #[test]
    fn zero_ratio_keeps_everything_for_training() {
        let labels = labels();
        let fold = &SplitMode::Plain { ratio: 0.0 }.split(&labels, 1).unwrap()[0];
        assert!(fold.valid.is_empty());
        assert_eq!(fold.train.len(), labels.len());
    }

    #[test]
    fn kfold_covers_every_row_once() {
        let labels = labels();
        let folds = SplitMode::StratifiedKFold { n_splits: 5 }
            .split(&labels, 7)
            .unwrap();
        assert_eq!(folds.len(), 5);

        let mut seen = vec![0; labels.len()];
        for fold in &folds {
            assert_partition(fold, labels.len());
            assert_eq!(fold.valid.len(), 4);
            // each class lands in every validation fold
            for class in 0..3 {
                assert!(fold.valid.iter().any(|&i| labels[i] == class));
            }
            for &i in &fold.valid {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn same_seed_same_split() {
        let labels = labels();
        let mode = SplitMode::StratifiedKFold { n_splits: 3 };
        assert_eq!(mode.split(&labels, 3).unwrap(), mode.split(&labels, 3).unwrap());
        let plain = SplitMode::Plain { ratio: 0.3 };
        assert_eq!(plain.split(&labels, 9).unwrap(), plain.split(&labels, 9).unwrap());
    }

    #[test]
    fn invalid_parameters() {
        assert!(SplitMode::Plain { ratio: 1.0 }.split(&[0, 1], 0).is_err());
        assert!(SplitMode::Plain { ratio: -0.1 }.split(&[0, 1], 0).is_err());
        assert!(SplitMode::StratifiedKFold { n_splits: 1 }.split(&[0, 1], 0).is_err());
        assert!(SplitMode::StratifiedKFold { n_splits: 3 }.split(&[0, 1], 0).is_err());
    }

    #[test]
    fn fold_names() {
        let fold = Fold {
            index: 3,
            train: vec![],
            valid: vec![],
        };
        assert_eq!(SplitMode::Plain { ratio: 0.1 }.fold_name(&fold), "plain");
        assert_eq!(SplitMode::StratifiedKFold { n_splits: 5 }.fold_name(&fold), "3_fold");
    }
}
