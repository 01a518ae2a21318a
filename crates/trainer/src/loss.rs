use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Reduction, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CbVariant {
    Focal,
    Sigmoid,
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossConfig {
    CrossEntropy,
    /// Binary focal loss over one-hot targets.
    Focal { alpha: f64, gamma: f64 },
    /// Class-balanced loss weighted by the effective number of samples per class.
    ClassBalanced {
        beta: f64,
        gamma: f64,
        variant: CbVariant,
    },
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::Focal {
            alpha: 0.25,
            gamma: 2.0,
        }
    }
}

/// Per-class weights `(1 - beta) / (1 - beta^n_c)`, scaled to sum to the class count.
pub fn class_balanced_weights(label_counts: &[usize], beta: f64) -> Vec<f64> {
    let raw: Vec<f64> = label_counts
        .iter()
        .map(|&n| {
            let effective_num = 1.0 - beta.powi(n.max(1) as i32);
            (1.0 - beta) / effective_num
        })
        .collect();
    let total: f64 = raw.iter().sum();
    let scale = label_counts.len() as f64 / total;
    raw.into_iter().map(|w| w * scale).collect()
}

pub struct RelationLoss {
    config: LossConfig,
    class_weights: Option<Tensor>,
}

impl RelationLoss {
    /// `label_counts` are the training-set class frequencies; only the
    /// class-balanced loss uses them.
    pub fn new(config: LossConfig, label_counts: &[usize], device: Device) -> Self {
        let class_weights = match config {
            LossConfig::ClassBalanced { beta, .. } => {
                let weights: Vec<f32> = class_balanced_weights(label_counts, beta)
                    .into_iter()
                    .map(|w| w as f32)
                    .collect();
                Some(Tensor::from_slice(&weights).to(device))
            }
            _ => None,
        };
        Self {
            config,
            class_weights,
        }
    }

    pub fn config(&self) -> LossConfig {
        self.config
    }

    /// logits: [batch, num_labels], labels: [batch] (Int64). Returns a scalar.
    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Tensor {
        let logits = logits.to_kind(Kind::Float);
        match (self.config, &self.class_weights) {
            (LossConfig::CrossEntropy, _) => logits.cross_entropy_for_logits(labels),
            (LossConfig::Focal { alpha, gamma }, _) => focal_loss(&logits, labels, alpha, gamma),
            (LossConfig::ClassBalanced { gamma, variant, .. }, Some(weights)) => {
                class_balanced_loss(&logits, labels, weights, gamma, variant)
            }
            (LossConfig::ClassBalanced { .. }, None) => logits.cross_entropy_for_logits(labels),
        }
    }
}

fn one_hot(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits
        .zeros_like()
        .scatter_value(1, &labels.to_kind(Kind::Int64).unsqueeze(1), 1.0)
}

/// `log(1 + exp(x))` without overflow for large `x`.
fn softplus(x: &Tensor) -> Tensor {
    x.relu() + (-x.abs()).exp().log1p()
}

/// `alpha_t * (1 - pt)^gamma * BCE`, averaged over every element. `alpha_t`
/// is `alpha` for negative targets and `1 - alpha` for positive ones.
pub fn focal_loss(logits: &Tensor, labels: &Tensor, alpha: f64, gamma: f64) -> Tensor {
    let targets = one_hot(logits, labels);
    let bce =
        logits.binary_cross_entropy_with_logits::<Tensor>(&targets, None, None, Reduction::None);
    let alpha_t = &targets * (1.0 - alpha) + (-&targets + 1.0) * alpha;
    let pt = (-&bce).exp();
    let modulator = (-pt + 1.0).pow_tensor_scalar(gamma);
    (alpha_t * modulator * bce).mean(Kind::Float)
}

fn class_balanced_loss(
    logits: &Tensor,
    labels: &Tensor,
    class_weights: &Tensor,
    gamma: f64,
    variant: CbVariant,
) -> Tensor {
    let targets = one_hot(logits, labels);
    let weights = class_weights
        .index_select(0, &labels.to_kind(Kind::Int64))
        .unsqueeze(1)
        .expand_as(logits)
        .contiguous();

    match variant {
        CbVariant::Focal => {
            let bce = logits.binary_cross_entropy_with_logits::<Tensor>(
                &targets,
                None,
                None,
                Reduction::None,
            );
            let modulator = if gamma == 0.0 {
                bce.ones_like()
            } else {
                (-(&targets * logits) * gamma - softplus(&-logits) * gamma).exp()
            };
            let weighted = weights * modulator * bce;
            weighted.sum(Kind::Float) / targets.sum(Kind::Float)
        }
        CbVariant::Sigmoid => {
            logits.binary_cross_entropy_with_logits(&targets, Some(&weights), None, Reduction::Mean)
        }
        CbVariant::Softmax => {
            let probs = logits.softmax(1, Kind::Float);
            probs.binary_cross_entropy(&targets, Some(&weights), Reduction::Mean)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LN2: f64 = std::f64::consts::LN_2;

    fn scalar(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    fn zero_logits() -> (Tensor, Tensor) {
        (
            Tensor::zeros([2, 2], (Kind::Float, Device::Cpu)),
            Tensor::from_slice(&[0i64, 1]),
        )
    }

    #[test]
    fn focal_matches_closed_form() {
        let (logits, labels) = zero_logits();
        // bce = ln2, pt = 0.5, mean alpha_t = (0.75 + 0.25) / 2
        let loss = focal_loss(&logits, &labels, 0.25, 2.0);
        assert!((scalar(&loss) - 0.125 * LN2).abs() < 1e-6);
    }

    #[test]
    fn focal_down_weights_confident_predictions() {
        let labels = Tensor::from_slice(&[0i64]);
        let confident = Tensor::from_slice(&[6.0f32, -6.0]).view([1, 2]);
        let unsure = Tensor::from_slice(&[0.5f32, -0.5]).view([1, 2]);
        let a = scalar(&focal_loss(&confident, &labels, 0.25, 2.0));
        let b = scalar(&focal_loss(&unsure, &labels, 0.25, 2.0));
        assert!(a < b);
        assert!(a > 0.0);
    }

    #[test]
    fn cross_entropy_of_uniform_logits() {
        let (logits, labels) = zero_logits();
        let loss = RelationLoss::new(LossConfig::CrossEntropy, &[1, 1], Device::Cpu);
        assert!((scalar(&loss.compute(&logits, &labels)) - LN2).abs() < 1e-6);
    }

    #[test]
    fn balanced_weights_sum_to_class_count() {
        let weights = class_balanced_weights(&[100, 10, 1], 0.9999);
        assert!((weights.iter().sum::<f64>() - 3.0).abs() < 1e-9);
        assert!(weights[0] < weights[1] && weights[1] < weights[2]);

        let even = class_balanced_weights(&[5, 5], 0.99);
        assert!((even[0] - 1.0).abs() < 1e-9 && (even[1] - 1.0).abs() < 1e-9);

        // empty classes stay finite
        assert!(class_balanced_weights(&[0, 3], 0.9).iter().all(|w| w.is_finite()));
    }

    #[test]
    fn class_balanced_variants_on_uniform_logits() {
        let (logits, labels) = zero_logits();
        let make = |variant| {
            RelationLoss::new(
                LossConfig::ClassBalanced {
                    beta: 0.9999,
                    gamma: 2.0,
                    variant,
                },
                &[4, 4],
                Device::Cpu,
            )
        };
        // modulator = 2^-gamma on every element; 4 elements over 2 positives
        let focal = scalar(&make(CbVariant::Focal).compute(&logits, &labels));
        assert!((focal - 2.0 * 0.25 * LN2).abs() < 1e-5);

        let sigmoid = scalar(&make(CbVariant::Sigmoid).compute(&logits, &labels));
        assert!((sigmoid - LN2).abs() < 1e-5);

        let softmax = scalar(&make(CbVariant::Softmax).compute(&logits, &labels));
        assert!((softmax - LN2).abs() < 1e-5);
    }

    #[test]
    fn class_balanced_focal_survives_extreme_logits() {
        let loss = RelationLoss::new(
            LossConfig::ClassBalanced {
                beta: 0.9999,
                gamma: 2.0,
                variant: CbVariant::Focal,
            },
            &[4, 4],
            Device::Cpu,
        );
        // true class scored at -100: modulator ~1, bce ~100
        let logits = Tensor::from_slice(&[-100.0f32, 0.0])
            .view([1, 2])
            .set_requires_grad(true);
        let labels = Tensor::from_slice(&[0i64]);
        let value = loss.compute(&logits, &labels);
        assert!(scalar(&value) > 99.0);

        value.backward();
        let grad = Vec::<f32>::try_from(logits.grad().view(-1)).unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn softplus_is_stable_at_both_ends() {
        let x = Tensor::from_slice(&[-200.0f32, 0.0, 200.0]);
        let y = Vec::<f32>::try_from(softplus(&x)).unwrap();
        assert!(y[0] >= 0.0 && y[0] < 1e-30);
        assert!((y[1] as f64 - LN2).abs() < 1e-6);
        assert!((y[2] - 200.0).abs() < 1e-3);
    }
}
