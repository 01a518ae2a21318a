use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::metrics::EvalMetrics;
use crate::MODEL_FILE;

pub const STATE_FILE: &str = "trainer_state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRecord {
    pub step: usize,
    pub epoch: usize,
    pub metrics: EvalMetrics,
}

/// Progress written next to every checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    pub best_metric: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub evaluations: Vec<EvalRecord>,
}

impl TrainerState {
    /// Records `score` and returns whether it is a new best.
    pub fn observe(&mut self, score: f64, checkpoint: &Path) -> bool {
        let improved = self.best_metric.map_or(true, |best| score > best);
        if improved {
            self.best_metric = Some(score);
            self.best_checkpoint = Some(checkpoint.to_path_buf());
        }
        improved
    }

    /// Appends the evaluation made at `checkpoint` and ranks it by `metric`.
    /// Returns whether it is a new best.
    pub fn record(
        &mut self,
        metrics: EvalMetrics,
        metric: &str,
        checkpoint: &Path,
    ) -> Result<bool> {
        let score = metrics
            .get(metric)
            .ok_or_else(|| anyhow!("Unknown metric {:?}", metric))?;
        let improved = self.observe(score, checkpoint);
        self.evaluations.push(EvalRecord {
            step: self.global_step,
            epoch: self.epoch,
            metrics,
        });
        Ok(improved)
    }
}

/// Keeps `output_dir/checkpoint-<step>` directories, deleting the oldest
/// beyond the limit. The best checkpoint is never deleted; when it is kept for
/// the end of training the limit is at least 2 so the newest survives too.
pub struct CheckpointManager {
    root: PathBuf,
    limit: Option<usize>,
    saved: Vec<PathBuf>,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(root: P, limit: Option<usize>, keep_best: bool) -> Self {
        let limit = if keep_best {
            limit.map(|l| l.max(2))
        } else {
            limit
        };
        Self {
            root: root.as_ref().to_path_buf(),
            limit,
            saved: Vec::new(),
        }
    }

    pub fn dir_for(&self, step: usize) -> PathBuf {
        self.root.join(format!("checkpoint-{}", step))
    }

    /// Creates the directory for `step` and writes the state file into it.
    pub fn prepare(&mut self, step: usize, state: &TrainerState) -> Result<PathBuf> {
        let dir = self.dir_for(step);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let json = serde_json::to_string_pretty(state)?;
        fs::write(dir.join(STATE_FILE), json)?;
        if !self.saved.contains(&dir) {
            self.saved.push(dir.clone());
        }
        Ok(dir)
    }

    pub fn rotate(&mut self, best: Option<&Path>) -> Result<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        let limit = limit.max(1);
        while self.saved.len() > limit {
            let Some(pos) = self.saved.iter().position(|p| Some(p.as_path()) != best) else {
                break;
            };
            let stale = self.saved.remove(pos);
            info!("Deleting older checkpoint {:?}", stale);
            fs::remove_dir_all(&stale).with_context(|| format!("Failed to delete {:?}", stale))?;
        }
        Ok(())
    }

    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

/// Copies the best checkpoint's weights to `save_dir` when `load_best` is set
/// and a best checkpoint exists. `None` means the caller saves the current weights.
pub fn export_best(
    save_dir: &Path,
    best_checkpoint: Option<&Path>,
    load_best: bool,
) -> Result<Option<PathBuf>> {
    let Some(best) = best_checkpoint.filter(|_| load_best) else {
        return Ok(None);
    };
    fs::create_dir_all(save_dir)?;
    let target = save_dir.join(MODEL_FILE);
    info!("Loading best model from {:?}", best);
    fs::copy(best.join(MODEL_FILE), &target)
        .with_context(|| format!("Failed to copy best checkpoint {:?}", best))?;
    Ok(Some(target))
}
