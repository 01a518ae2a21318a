use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use re_core::LabelScheme;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tch::{nn, nn::OptimizerConfig, Device, Kind};

use crate::checkpoint::{export_best, CheckpointManager, TrainerState};
use crate::dataset::EncodedDataset;
use crate::loss::RelationLoss;
use crate::metrics::{compute_metrics, EvalMetrics};
use crate::model::{load_safetensors, RelationClassifier};
use crate::{EvalStrategy, LrSchedule, TrainerConfig, MODEL_FILE};

/// Appends one JSON object per line to `log_history.jsonl`.
pub struct LogHistory {
    writer: BufWriter<File>,
}

impl LogHistory {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("log_history.jsonl"))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn record<T: Serialize>(&mut self, entry: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StepLog {
    step: usize,
    epoch: usize,
    loss: f64,
    learning_rate: f64,
}

/// Learning rate for optimizer step `step` (0-based) of `total_steps`: linear
/// warmup over the first `warmup` steps, then `schedule`.
pub fn scheduled_lr(
    base: f64,
    schedule: LrSchedule,
    warmup: Option<usize>,
    step: usize,
    total_steps: usize,
) -> f64 {
    let warmup = warmup.unwrap_or(0);
    if step < warmup {
        return base * (step + 1) as f64 / warmup as f64;
    }
    match schedule {
        LrSchedule::Constant => base,
        LrSchedule::Linear => {
            let remaining = total_steps.saturating_sub(step) as f64;
            let span = total_steps.saturating_sub(warmup).max(1) as f64;
            base * (remaining / span).min(1.0)
        }
    }
}

/// Whether batch `batch_idx` of an epoch ends an accumulation window. The last
/// batch always does, so no gradients carry over into the next epoch.
pub fn accumulation_boundary(batch_idx: usize, num_batches: usize, accum: usize) -> bool {
    (batch_idx + 1) % accum.max(1) == 0 || batch_idx + 1 == num_batches
}

/// Optimizer steps taken per epoch of `num_batches` batches.
pub fn optimizer_steps_per_epoch(num_batches: usize, accum: usize) -> usize {
    num_batches.div_ceil(accum.max(1))
}

/// Where in training an evaluation could happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPoint {
    /// Right after the optimizer step with this global step number.
    Step(usize),
    EpochEnd,
}

pub fn evaluation_due(strategy: EvalStrategy, eval_steps: usize, point: TrainingPoint) -> bool {
    match (strategy, point) {
        (EvalStrategy::Steps, TrainingPoint::Step(step)) => step % eval_steps.max(1) == 0,
        (EvalStrategy::Epoch, TrainingPoint::EpochEnd) => true,
        _ => false,
    }
}

/// Stops after `patience` consecutive evaluations without a new best.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: Option<usize>,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: Option<usize>) -> Self {
        Self { patience, stale: 0 }
    }

    /// `improved` is `None` when nothing was evaluated.
    pub fn update(&mut self, improved: Option<bool>) -> bool {
        let (Some(patience), Some(improved)) = (self.patience, improved) else {
            return false;
        };
        if improved {
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        self.stale >= patience
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub global_step: usize,
    pub best_metric: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub final_metrics: Option<EvalMetrics>,
}

pub struct Trainer {
    config: TrainerConfig,
    model: RelationClassifier,
    optimizer: nn::Optimizer,
    loss: RelationLoss,
    scheme: LabelScheme,
    vs: nn::VarStore,
}

impl Trainer {
    /// Loads a fresh copy of the TorchScript model at `model_path`.
    /// `label_counts` are training class frequencies, used by class-balanced losses.
    pub fn new(
        model_path: &Path,
        init_weights: Option<&Path>,
        scheme: LabelScheme,
        label_counts: &[usize],
        trainer_config: TrainerConfig,
        device: Device,
    ) -> Result<Self> {
        tch::manual_seed(trainer_config.seed as i64);

        let mut vs = nn::VarStore::new(device);
        let model = RelationClassifier::load(model_path, &vs, scheme.num_labels())?;
        if let Some(weights) = init_weights {
            let n = load_safetensors(&mut vs, weights)?;
            info!("Initialised {} tensors from {:?}", n, weights);
        }

        let optimizer = nn::AdamW {
            wd: trainer_config.weight_decay.unwrap_or(0.0),
            ..Default::default()
        }
        .build(&vs, trainer_config.learning_rate)?;

        let loss = RelationLoss::new(trainer_config.loss, label_counts, device);

        Ok(Self {
            config: trainer_config,
            model,
            optimizer,
            loss,
            scheme,
            vs,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn train(
        &mut self,
        train: &EncodedDataset,
        valid: Option<&EncodedDataset>,
        output_dir: &Path,
        logging_dir: &Path,
    ) -> Result<TrainOutcome> {
        if train.is_empty() {
            return Err(anyhow!("Training set is empty"));
        }
        let valid = valid.filter(|v| !v.is_empty());
        if valid.is_none() {
            warn!("No validation data, checkpoints will not be ranked");
        }

        let accum = self.config.gradient_accumulation_steps.max(1);
        let logging_steps = self.config.logging_steps.max(1);
        let eval_steps = self.config.eval_steps;
        let batches_per_epoch = train.len().div_ceil(self.config.batch_size.max(1));
        let total_steps = self.config.epochs * optimizer_steps_per_epoch(batches_per_epoch, accum);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut checkpoints = CheckpointManager::new(
            output_dir,
            self.config.save_total_limit,
            self.config.load_best_model_at_end,
        );
        let mut history = LogHistory::open(logging_dir)?;
        let mut state = TrainerState::default();
        let mut early_stopping = EarlyStopping::new(self.config.early_stopping_patience);
        let mut last_metrics = None;

        info!(
            "Training on {} rows for {} optimizer steps ({} trainable tensors), config: {:?}",
            train.len(),
            total_steps,
            self.vs.trainable_variables().len(),
            self.config
        );

        let mut running_loss = 0.0;
        let mut running_batches = 0usize;
        self.optimizer.zero_grad();

        'epochs: for epoch in 0..self.config.epochs {
            state.epoch = epoch;
            self.model.set_train();
            let batches = train.batch_indices(self.config.batch_size, Some(&mut rng));
            let num_batches = batches.len();

            for (batch_idx, idxs) in batches.iter().enumerate() {
                let batch = train.batch(idxs);
                let labels = batch
                    .labels
                    .as_ref()
                    .ok_or_else(|| anyhow!("Training data has no labels"))?;

                let logits = self.model.forward(&batch.input_ids, &batch.attention_mask)?;
                let loss = self.loss.compute(&logits, labels) / accum as f64;
                loss.backward();
                running_loss += loss.double_value(&[]) * accum as f64;
                running_batches += 1;

                if !accumulation_boundary(batch_idx, num_batches, accum) {
                    continue;
                }

                let lr = scheduled_lr(
                    self.config.learning_rate,
                    self.config.lr_scheduler,
                    self.config.warmup_steps,
                    state.global_step,
                    total_steps,
                );
                self.optimizer.set_lr(lr);
                if let Some(max_norm) = self.config.max_grad_norm {
                    self.optimizer.clip_grad_norm(max_norm);
                }
                self.optimizer.step();
                self.optimizer.zero_grad();
                state.global_step += 1;

                if state.global_step % logging_steps == 0 {
                    let avg = running_loss / running_batches.max(1) as f64;
                    info!(
                        "Epoch {} | Batch {}/{} | Step {} | Loss: {:.4}",
                        epoch,
                        batch_idx + 1,
                        num_batches,
                        state.global_step,
                        avg
                    );
                    history.record(&StepLog {
                        step: state.global_step,
                        epoch,
                        loss: avg,
                        learning_rate: lr,
                    })?;
                    running_loss = 0.0;
                    running_batches = 0;
                }

                let point = TrainingPoint::Step(state.global_step);
                if evaluation_due(self.config.eval_strategy, eval_steps, point) {
                    let evaluated =
                        self.checkpoint(valid, &mut checkpoints, &mut state, &mut history)?;
                    last_metrics = evaluated.map(|(m, _)| m).or(last_metrics);
                    self.model.set_train();
                    if early_stopping.update(evaluated.map(|(_, up)| up)) {
                        info!("Early stopping at step {}", state.global_step);
                        break 'epochs;
                    }
                }
            }

            if evaluation_due(self.config.eval_strategy, eval_steps, TrainingPoint::EpochEnd) {
                let evaluated =
                    self.checkpoint(valid, &mut checkpoints, &mut state, &mut history)?;
                last_metrics = evaluated.map(|(m, _)| m).or(last_metrics);
                if early_stopping.update(evaluated.map(|(_, up)| up)) {
                    info!("Early stopping after epoch {}", epoch);
                    break;
                }
            }
        }

        Ok(TrainOutcome {
            global_step: state.global_step,
            best_metric: state.best_metric,
            best_checkpoint: state.best_checkpoint,
            final_metrics: last_metrics,
        })
    }

    /// Evaluates (when validation data exists), saves a checkpoint and rotates old ones.
    fn checkpoint(
        &mut self,
        valid: Option<&EncodedDataset>,
        checkpoints: &mut CheckpointManager,
        state: &mut TrainerState,
        history: &mut LogHistory,
    ) -> Result<Option<(EvalMetrics, bool)>> {
        let metrics = match valid {
            Some(valid) => Some(self.evaluate(valid)?),
            None => None,
        };

        let dir = checkpoints.dir_for(state.global_step);
        let mut improved = false;
        if let Some(metrics) = metrics {
            info!(
                "Step {} | micro f1 {:.2} | auprc {:.2} | accuracy {:.4}",
                state.global_step, metrics.micro_f1, metrics.auprc, metrics.accuracy
            );
            improved = state.record(metrics, &self.config.metric_for_best_model, &dir)?;
            if improved {
                info!(
                    "New best {} = {:.4}",
                    self.config.metric_for_best_model,
                    state.best_metric.unwrap_or_default()
                );
            }
            if let Some(record) = state.evaluations.last() {
                history.record(record)?;
            }
        }

        let dir = checkpoints.prepare(state.global_step, state)?;
        self.model.save(dir.join(MODEL_FILE))?;
        debug!("Saved checkpoint {:?}", dir);
        checkpoints.rotate(state.best_checkpoint.as_deref())?;
        Ok(metrics.map(|m| (m, improved)))
    }

    pub fn evaluate(&mut self, data: &EncodedDataset) -> Result<EvalMetrics> {
        let labels = data
            .labels()
            .ok_or_else(|| anyhow!("Evaluation data has no labels"))?;
        let probs = predict_proba(&mut self.model, data, self.config.eval_batch_size())?;
        Ok(compute_metrics(&probs, &labels, self.scheme))
    }

    /// Writes the final model to `save_dir`: the best checkpoint when
    /// `load_best_model_at_end` is set and one exists, otherwise the current weights.
    pub fn save_model(&self, save_dir: &Path, outcome: &TrainOutcome) -> Result<PathBuf> {
        let best = outcome.best_checkpoint.as_deref();
        if let Some(target) = export_best(save_dir, best, self.config.load_best_model_at_end)? {
            return Ok(target);
        }
        fs::create_dir_all(save_dir)?;
        let target = save_dir.join(MODEL_FILE);
        self.model.save(&target)?;
        Ok(target)
    }
}

/// Class probabilities for every row, in dataset order.
pub fn predict_proba(
    model: &mut RelationClassifier,
    data: &EncodedDataset,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    model.set_eval();
    let num_labels = model.num_labels();
    let mut probs = Vec::with_capacity(data.len());

    for idxs in data.batch_indices(batch_size, None) {
        let batch = data.batch(&idxs);
        let batch_probs = tch::no_grad(|| -> Result<Vec<f32>> {
            let logits = model.forward(&batch.input_ids, &batch.attention_mask)?;
            let p = logits
                .softmax(-1, Kind::Float)
                .to_device(Device::Cpu)
                .view(-1);
            Ok(Vec::<f32>::try_from(p)?)
        })?;
        probs.extend(batch_probs.chunks(num_labels).map(|row| row.to_vec()));
    }
    Ok(probs)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::checkpoint::CheckpointManager;
    use crate::metrics::MICRO_F1;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warmup_ramps_linearly() {
        let constant = |step| scheduled_lr(1e-4, LrSchedule::Constant, Some(4), step, 20);
        assert_eq!(constant(0), 2.5e-5);
        assert_eq!(constant(3), 1e-4);
        assert_eq!(constant(10), 1e-4);
        assert_eq!(scheduled_lr(1e-4, LrSchedule::Constant, Some(0), 0, 20), 1e-4);
        assert_eq!(scheduled_lr(1e-4, LrSchedule::Constant, None, 0, 20), 1e-4);
    }

    #[test]
    fn linear_schedule_decays_to_zero() {
        let linear = |warmup, step| scheduled_lr(1e-4, LrSchedule::Linear, warmup, step, 4);
        assert!(close(linear(None, 0), 1e-4));
        assert!(close(linear(None, 1), 7.5e-5));
        assert!(close(linear(None, 3), 2.5e-5));
        assert_eq!(linear(None, 4), 0.0);
        assert_eq!(linear(None, 9), 0.0);

        // peak right after warmup, then down over the remaining two steps
        assert!(close(linear(Some(2), 0), 5e-5));
        assert!(close(linear(Some(2), 2), 1e-4));
        assert!(close(linear(Some(2), 3), 5e-5));
    }

    #[test]
    fn accumulation_windows_close_on_the_last_batch() {
        let steps: Vec<usize> = (0..7).filter(|&i| accumulation_boundary(i, 7, 3)).collect();
        assert_eq!(steps, vec![2, 5, 6]);
        assert_eq!(optimizer_steps_per_epoch(7, 3), steps.len());

        assert!((0..4).all(|i| accumulation_boundary(i, 4, 1)));
        assert!((0..4).all(|i| accumulation_boundary(i, 4, 0)));
        assert_eq!(optimizer_steps_per_epoch(4, 1), 4);
        assert_eq!(optimizer_steps_per_epoch(6, 3), 2);
    }

    #[test]
    fn evaluation_follows_strategy() {
        let steps = EvalStrategy::Steps;
        assert!(!evaluation_due(steps, 200, TrainingPoint::Step(199)));
        assert!(evaluation_due(steps, 200, TrainingPoint::Step(200)));
        assert!(evaluation_due(steps, 200, TrainingPoint::Step(400)));
        assert!(!evaluation_due(steps, 200, TrainingPoint::EpochEnd));
        assert!(evaluation_due(steps, 0, TrainingPoint::Step(3)));

        let epoch = EvalStrategy::Epoch;
        assert!(evaluation_due(epoch, 200, TrainingPoint::EpochEnd));
        assert!(!evaluation_due(epoch, 200, TrainingPoint::Step(200)));
    }

    #[test]
    fn best_checkpoint_is_what_gets_exported() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = CheckpointManager::new(dir.path().join("results"), Some(1), true);
        let mut state = TrainerState::default();

        for (step, f1) in [(100, 61.0), (200, 74.5), (300, 70.0), (400, 69.0)] {
            state.global_step = step;
            let dir = checkpoints.dir_for(step);
            state.record(
                EvalMetrics { micro_f1: f1, auprc: 0.0, accuracy: 0.0 },
                MICRO_F1,
                &dir,
            )
            .unwrap();
            let dir = checkpoints.prepare(step, &state).unwrap();
            fs::write(dir.join(MODEL_FILE), format!("weights@{}", step)).unwrap();
            checkpoints.rotate(state.best_checkpoint.as_deref()).unwrap();
        }

        let best = state.best_checkpoint.clone().unwrap();
        assert_eq!(best, checkpoints.dir_for(200));
        assert_eq!(checkpoints.saved(), &[best.clone(), checkpoints.dir_for(400)]);

        let outcome = TrainOutcome {
            global_step: 400,
            best_metric: state.best_metric,
            best_checkpoint: Some(best),
            final_metrics: None,
        };
        let save_dir = dir.path().join("best_model");
        let exported = export_best(&save_dir, outcome.best_checkpoint.as_deref(), true)
            .unwrap()
            .unwrap();
        assert_eq!(fs::read_to_string(exported).unwrap(), "weights@200");
    }

    #[test]
    fn early_stopping_counts_stale_evaluations() {
        let mut stopper = EarlyStopping::new(Some(2));
        assert!(!stopper.update(Some(true)));
        assert!(!stopper.update(Some(false)));
        assert!(!stopper.update(None));
        assert!(!stopper.update(Some(true)));
        assert!(!stopper.update(Some(false)));
        assert!(stopper.update(Some(false)));

        let mut never = EarlyStopping::new(None);
        assert!(!never.update(Some(false)));
    }

    #[test]
    fn log_history_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut history = LogHistory::open(dir.path().join("logs")).unwrap();
            history
                .record(&StepLog {
                    step: 200,
                    epoch: 0,
                    loss: 0.5,
                    learning_rate: 1e-5,
                })
                .unwrap();
        }
        let mut history = LogHistory::open(dir.path().join("logs")).unwrap();
        history.record(&serde_json::json!({"step": 400})).unwrap();

        let text = fs::read_to_string(dir.path().join("logs/log_history.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 200);
        assert_eq!(lines[1]["step"], 400);
    }
}
