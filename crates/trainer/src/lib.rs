pub mod checkpoint;
pub mod dataset;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod train;

pub use train::Trainer;

use anyhow::{Context, Result};
use re_core::{InputFormat, LabelScheme};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::loss::LossConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EvalStrategy {
    Epoch,
    Steps,
}

/// Learning-rate shape after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Decays linearly to zero at the last optimizer step.
    #[default]
    Linear,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub seed: u64,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub eval_batch_size: Option<usize>,
    pub gradient_accumulation_steps: usize,
    pub epochs: usize,
    /// Longest tokenized input; longer inputs are truncated.
    pub max_length: usize,
    pub warmup_steps: Option<usize>,
    pub lr_scheduler: LrSchedule,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub eval_strategy: EvalStrategy,
    pub eval_steps: usize,
    pub logging_steps: usize,
    pub save_total_limit: Option<usize>,
    pub load_best_model_at_end: bool,
    pub metric_for_best_model: String,
    pub early_stopping_patience: Option<usize>,
    pub pad_token: String,
    pub loss: LossConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            learning_rate: 5e-5,
            batch_size: 16,
            eval_batch_size: None,
            gradient_accumulation_steps: 1,
            epochs: 3,
            max_length: 256,
            warmup_steps: Some(0),
            lr_scheduler: LrSchedule::Linear,
            weight_decay: Some(0.01),
            max_grad_norm: Some(1.0),
            eval_strategy: EvalStrategy::Epoch,
            eval_steps: 200,
            logging_steps: 200,
            save_total_limit: Some(2),
            load_best_model_at_end: true,
            metric_for_best_model: metrics::MICRO_F1.to_string(),
            early_stopping_patience: None,
            pad_token: "[PAD]".to_string(),
            loss: LossConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn eval_batch_size(&self) -> usize {
        self.eval_batch_size.unwrap_or(self.batch_size)
    }
}

/// Describes how a saved model directory was trained, so it can be scored
/// later with the same label space and input format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub label_scheme: LabelScheme,
    pub input_format: InputFormat,
    pub num_labels: usize,
    pub max_length: usize,
    pub pad_token: String,
}

pub const MODEL_FILE: &str = "model.pt";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const MANIFEST_FILE: &str = "run_manifest.json";
pub const LABELS_FILE: &str = "labels.json";

/// Reads a YAML or JSON (by extension) config, falling back to defaults when
/// the file does not exist.
pub fn load_config<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        log::warn!("Config {:?} not found, using defaults", path);
        return Ok(T::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON config {:?}", path))?,
        _ => serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML config {:?}", path))?,
    };
    Ok(config)
}
