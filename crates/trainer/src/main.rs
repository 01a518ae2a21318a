use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tch::Device;

use re_core::{read_rows, Corpus, InputFormat, LabelScheme, ModelInput, SplitMode};
use trainer::dataset::{EncodedDataset, RelationTokenizer};
use trainer::metrics::{argmax, compute_metrics, EvalMetrics};
use trainer::model::RelationClassifier;
use trainer::train::{predict_proba, TrainOutcome};
use trainer::{
    load_config, EvalStrategy, RunManifest, Trainer, TrainerConfig, LABELS_FILE, MANIFEST_FILE,
    MODEL_FILE, TOKENIZER_FILE,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Fine-tune a pretrained encoder for KLUE relation extraction",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// One stratified train/validation split
    Plain,
    /// Stratified k-fold cross-validation
    Skf,
}

#[derive(Args)]
struct DataArgs {
    /// Label space: full, relation_only or binary
    #[arg(long, default_value = "full")]
    label_scheme: LabelScheme,

    /// Wrap entities in typed markup instead of pairing "subj[SEP]obj" with the sentence
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    add_ent_token: bool,
}

impl DataArgs {
    fn input_format(&self) -> InputFormat {
        if self.add_ent_token {
            InputFormat::Marked
        } else {
            InputFormat::EntityPair
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune on a labelled CSV
    Train {
        /// Hyper-parameter file (YAML, or JSON by extension)
        #[arg(long, default_value = "configs/training_config.yaml")]
        hp_config: PathBuf,

        /// Training CSV
        #[arg(long, default_value = "data/train.csv")]
        data_dir: PathBuf,

        /// Fixed validation CSV; disables splitting
        #[arg(long)]
        valid_data: Option<PathBuf>,

        /// Extra rows added to every training split (never to validation)
        #[arg(long)]
        aug_data_dir: Option<PathBuf>,

        /// Directory with the TorchScript model.pt and tokenizer.json
        #[arg(long, default_value = "pretrained/klue-roberta-small")]
        model_name: PathBuf,

        /// Optional .safetensors weights copied into the model before training
        #[arg(long)]
        init_weights: Option<PathBuf>,

        #[arg(long, default_value = "./results")]
        output_dir: PathBuf,

        #[arg(long, default_value = "./logs")]
        logging_dir: PathBuf,

        #[arg(long, default_value = "./best_model")]
        save_dir: PathBuf,

        #[arg(long, value_enum, default_value_t = Mode::Plain)]
        mode: Mode,

        #[arg(long, default_value_t = 0.1)]
        split_ratio: f64,

        #[arg(long, default_value_t = 5)]
        n_splits: usize,

        /// Overrides the config's evaluation strategy
        #[arg(long, value_enum)]
        eval_strategy: Option<EvalStrategy>,

        #[command(flatten)]
        data: DataArgs,
    },
    /// Score a saved model on a labelled CSV
    Evaluate {
        /// Directory written by `train`
        #[arg(long)]
        model_dir: PathBuf,

        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
    /// Write predicted labels and class probabilities for a CSV
    Predict {
        #[arg(long)]
        model_dir: PathBuf,

        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value = "prediction/submission.csv")]
        output: PathBuf,

        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
}

#[derive(Serialize)]
struct FoldSummary {
    fold: String,
    train_rows: usize,
    valid_rows: usize,
    best_metric: Option<f64>,
    final_metrics: Option<EvalMetrics>,
    save_dir: PathBuf,
}

#[derive(Serialize)]
struct CvSummary {
    metric: String,
    folds: Vec<FoldSummary>,
    mean: Option<f64>,
}

struct TrainJob<'a> {
    config: &'a TrainerConfig,
    model_name: &'a Path,
    init_weights: Option<&'a Path>,
    format: InputFormat,
    tokenizer: &'a RelationTokenizer,
    device: Device,
}

impl TrainJob<'_> {
    fn run(
        &self,
        train: &Corpus,
        valid: Option<&Corpus>,
        output_dir: &Path,
        logging_dir: &Path,
        save_dir: &Path,
    ) -> Result<TrainOutcome> {
        info!(
            "Train rows: {} | validation rows: {}",
            train.len(),
            valid.map_or(0, Corpus::len)
        );
        let train_set = EncodedDataset::new(
            train.rows(),
            Some(train.labels()),
            self.tokenizer,
            self.format,
            self.device,
        )?;
        let valid_set = valid
            .map(|v| {
                EncodedDataset::new(
                    v.rows(),
                    Some(v.labels()),
                    self.tokenizer,
                    self.format,
                    self.device,
                )
            })
            .transpose()?;

        let mut trainer = Trainer::new(
            &self.model_name.join(MODEL_FILE),
            self.init_weights,
            train.scheme(),
            &train.label_counts(),
            self.config.clone(),
            self.device,
        )?;
        let outcome = trainer.train(&train_set, valid_set.as_ref(), output_dir, logging_dir)?;
        trainer.save_model(save_dir, &outcome)?;
        self.write_model_dir(save_dir, train)?;

        info!(
            "Finished after {} steps, best {} = {:?}, saved to {:?}",
            outcome.global_step, self.config.metric_for_best_model, outcome.best_metric, save_dir
        );
        if let Some(last) = &outcome.final_metrics {
            info!("Last evaluation: {:?}", last);
        }
        Ok(outcome)
    }

    /// Makes `save_dir` self-contained for `evaluate` and `predict`.
    fn write_model_dir(&self, save_dir: &Path, train: &Corpus) -> Result<()> {
        fs::copy(
            self.model_name.join(TOKENIZER_FILE),
            save_dir.join(TOKENIZER_FILE),
        )
        .context("Failed to copy tokenizer")?;
        train.dict().save(save_dir.join(LABELS_FILE))?;
        let manifest = RunManifest {
            label_scheme: train.scheme(),
            input_format: self.format,
            num_labels: train.scheme().num_labels(),
            max_length: self.config.max_length,
            pad_token: self.config.pad_token.clone(),
        };
        fs::write(
            save_dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        fs::write(
            save_dir.join("training_config.json"),
            serde_json::to_string_pretty(self.config)?,
        )?;
        Ok(())
    }
}

/// Loads a labelled CSV, skipping rows that cannot be encoded as `format`.
fn load_corpus(path: &Path, scheme: LabelScheme, format: InputFormat) -> Result<Corpus> {
    let mut corpus =
        Corpus::load(path, scheme).with_context(|| format!("Failed to load {:?}", path))?;
    let skipped = corpus.drop_unencodable(format);
    if skipped > 0 {
        warn!("Skipped {} rows of {:?} with unusable entity spans", skipped, path);
    }
    Ok(corpus)
}

fn load_manifest(model_dir: &Path) -> Result<RunManifest> {
    let path = model_dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(serde_json::from_str(&content)?)
}

fn load_saved_model(
    model_dir: &Path,
    device: Device,
) -> Result<(RunManifest, RelationTokenizer, RelationClassifier, tch::nn::VarStore)> {
    let manifest = load_manifest(model_dir)?;
    let tokenizer = RelationTokenizer::load(
        model_dir.join(TOKENIZER_FILE),
        manifest.max_length,
        &manifest.pad_token,
    )?;
    let vs = tch::nn::VarStore::new(device);
    let model = RelationClassifier::load(model_dir.join(MODEL_FILE), &vs, manifest.num_labels)?;
    Ok((manifest, tokenizer, model, vs))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let device = Device::cuda_if_available();
    info!("Using device: {:?}", device);

    match cli.command {
        Commands::Train {
            hp_config,
            data_dir,
            valid_data,
            aug_data_dir,
            model_name,
            init_weights,
            output_dir,
            logging_dir,
            save_dir,
            mode,
            split_ratio,
            n_splits,
            eval_strategy,
            data,
        } => {
            let mut config: TrainerConfig = load_config(&hp_config)?;
            if let Some(strategy) = eval_strategy {
                config.eval_strategy = strategy;
            }

            let scheme = data.label_scheme;
            let format = data.input_format();
            let tokenizer = RelationTokenizer::load(
                model_name.join(TOKENIZER_FILE),
                config.max_length,
                &config.pad_token,
            )?;
            let job = TrainJob {
                config: &config,
                model_name: &model_name,
                init_weights: init_weights.as_deref(),
                format,
                tokenizer: &tokenizer,
                device,
            };

            let corpus = load_corpus(&data_dir, scheme, format)?;
            info!(
                "Loaded {} rows from {:?}: {:?}",
                corpus.len(),
                data_dir,
                corpus.label_histogram()
            );
            let augment = aug_data_dir
                .as_deref()
                .map(|path| load_corpus(path, scheme, format))
                .transpose()?;
            let with_augment = |train: Corpus| match &augment {
                Some(extra) => train.concat(extra.clone()),
                None => train,
            };

            if let Some(valid_path) = valid_data {
                let valid = load_corpus(&valid_path, scheme, format)?;
                job.run(
                    &with_augment(corpus),
                    Some(&valid),
                    &output_dir,
                    &logging_dir,
                    &save_dir,
                )?;
                return Ok(());
            }

            let split = match mode {
                Mode::Plain => SplitMode::Plain { ratio: split_ratio },
                Mode::Skf => SplitMode::StratifiedKFold { n_splits },
            };
            let folds = split.split(corpus.labels(), config.seed)?;

            let mut summaries = Vec::with_capacity(folds.len());
            for fold in &folds {
                let name = split.fold_name(fold);
                info!("===== {} =====", name);
                let train = with_augment(corpus.select(&fold.train));
                let valid = corpus.select(&fold.valid);
                let fold_save_dir = save_dir.join(&name);
                let outcome = job.run(
                    &train,
                    Some(&valid),
                    &output_dir.join(&name),
                    &logging_dir.join(&name),
                    &fold_save_dir,
                )?;
                summaries.push(FoldSummary {
                    fold: name,
                    train_rows: train.len(),
                    valid_rows: valid.len(),
                    best_metric: outcome.best_metric,
                    final_metrics: outcome.final_metrics,
                    save_dir: fold_save_dir,
                });
            }

            let scores: Vec<f64> = summaries.iter().filter_map(|s| s.best_metric).collect();
            let mean =
                (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
            if let Some(mean) = mean {
                info!(
                    "Mean {} over {} folds: {:.4}",
                    config.metric_for_best_model,
                    scores.len(),
                    mean
                );
            }
            let summary = CvSummary {
                metric: config.metric_for_best_model.clone(),
                folds: summaries,
                mean,
            };
            fs::create_dir_all(&save_dir)?;
            fs::write(
                save_dir.join("cv_summary.json"),
                serde_json::to_string_pretty(&summary)?,
            )?;
        }
        Commands::Evaluate {
            model_dir,
            data,
            batch_size,
        } => {
            let (manifest, tokenizer, mut model, _vs) = load_saved_model(&model_dir, device)?;
            let corpus = load_corpus(&data, manifest.label_scheme, manifest.input_format)?;
            let dataset = EncodedDataset::new(
                corpus.rows(),
                Some(corpus.labels()),
                &tokenizer,
                manifest.input_format,
                device,
            )?;
            let probs = predict_proba(&mut model, &dataset, batch_size)?;
            let metrics = compute_metrics(&probs, corpus.labels(), manifest.label_scheme);
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Predict {
            model_dir,
            data,
            output,
            batch_size,
        } => {
            let (manifest, tokenizer, mut model, _vs) = load_saved_model(&model_dir, device)?;
            let dict = re_core::LabelDict::load(model_dir.join(LABELS_FILE))?;
            if dict.len() != manifest.num_labels {
                return Err(anyhow!(
                    "{} has {} labels but the model predicts {}",
                    LABELS_FILE,
                    dict.len(),
                    manifest.num_labels
                ));
            }
            // Every row gets a prediction; unmarkable rows fall back to the entity pair.
            let rows = read_rows(&data)?;
            let inputs: Vec<ModelInput> = rows
                .iter()
                .map(|row| row.model_input_or_pair(manifest.input_format))
                .collect();
            let dataset = EncodedDataset::from_inputs(&inputs, None, &tokenizer, device)?;
            let probs = predict_proba(&mut model, &dataset, batch_size)?;

            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut writer = csv::Writer::from_path(&output)?;
            writer.write_record(["id", "pred_label", "probs"])?;
            for (row, p) in rows.iter().zip(&probs) {
                let label = dict.name(argmax(p))?;
                let probs = serde_json::to_string(p)?;
                writer.write_record([row.id.as_str(), label, probs.as_str()])?;
            }
            writer.flush()?;
            info!("Wrote {} predictions to {:?}", rows.len(), output);
        }
    }

    Ok(())
}
