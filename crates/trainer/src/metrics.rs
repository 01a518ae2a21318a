//! KLUE-RE evaluation metrics.

use re_core::LabelScheme;
use serde::{Deserialize, Serialize};

pub const MICRO_F1: &str = "micro f1 score";
pub const AUPRC: &str = "auprc";
pub const ACCURACY: &str = "accuracy";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    #[serde(rename = "micro f1 score")]
    pub micro_f1: f64,
    pub auprc: f64,
    pub accuracy: f64,
}

impl EvalMetrics {
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            MICRO_F1 => Some(self.micro_f1),
            AUPRC => Some(self.auprc),
            ACCURACY => Some(self.accuracy),
            _ => None,
        }
    }
}

pub fn argmax(probs: &[f32]) -> usize {
    probs
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
        .0
}

/// Micro-averaged F1 (×100) over every class except `ignore`.
pub fn micro_f1(preds: &[usize], labels: &[usize], ignore: Option<usize>) -> f64 {
    let counted = |c: usize| Some(c) != ignore;
    let mut tp = 0usize;
    let mut predicted = 0usize;
    let mut actual = 0usize;
    for (&p, &y) in preds.iter().zip(labels) {
        if counted(p) {
            predicted += 1;
        }
        if counted(y) {
            actual += 1;
            if p == y {
                tp += 1;
            }
        }
    }
    if tp == 0 {
        return 0.0;
    }
    let precision = tp as f64 / predicted as f64;
    let recall = tp as f64 / actual as f64;
    2.0 * precision * recall / (precision + recall) * 100.0
}

/// Area under the precision-recall curve of one binary problem, trapezoidal
/// over recall. `None` when there are no positives.
pub fn pr_auc(scores: &[f32], positives: &[bool]) -> Option<f64> {
    let total_pos = positives.iter().filter(|&&p| p).count();
    if total_pos == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut area = 0.0;
    let (mut prev_recall, mut prev_precision) = (0.0, 1.0);
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut i = 0;
    while i < order.len() {
        // Consume every sample tied at this threshold.
        let threshold = scores[order[i]];
        while i < order.len() && scores[order[i]] == threshold {
            if positives[order[i]] {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let precision = tp as f64 / (tp + fp) as f64;
        let recall = tp as f64 / total_pos as f64;
        area += (recall - prev_recall) * (precision + prev_precision) / 2.0;
        prev_recall = recall;
        prev_precision = precision;
        if tp == total_pos {
            break;
        }
    }
    Some(area)
}

/// Mean one-vs-rest PR-AUC (×100) over the classes that occur in `labels`.
pub fn auprc(probs: &[Vec<f32>], labels: &[usize], num_labels: usize) -> f64 {
    let areas: Vec<f64> = (0..num_labels)
        .filter_map(|c| {
            let scores: Vec<f32> = probs.iter().map(|p| p[c]).collect();
            let positives: Vec<bool> = labels.iter().map(|&y| y == c).collect();
            pr_auc(&scores, &positives)
        })
        .collect();
    if areas.is_empty() {
        return 0.0;
    }
    areas.iter().sum::<f64>() / areas.len() as f64 * 100.0
}

pub fn accuracy(preds: &[usize], labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = preds.iter().zip(labels).filter(|(p, y)| p == y).count();
    correct as f64 / labels.len() as f64
}

pub fn compute_metrics(probs: &[Vec<f32>], labels: &[usize], scheme: LabelScheme) -> EvalMetrics {
    let preds: Vec<usize> = probs.iter().map(|p| argmax(p)).collect();
    let num_labels = probs.first().map_or(0, Vec::len).min(scheme.num_labels());
    EvalMetrics {
        micro_f1: micro_f1(&preds, labels, scheme.no_relation_id()),
        auprc: auprc(probs, labels, num_labels),
        accuracy: accuracy(&preds, labels),
    }
}
