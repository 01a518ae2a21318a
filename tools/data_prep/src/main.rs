use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use re_core::dataset::{write_marked, write_rows};
use re_core::{read_rows, Corpus, LabelScheme, SplitMode};

#[derive(Parser)]
#[command(author, version, about = "Prepare KLUE-RE csv files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a stratified train/validation split
    Split {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[arg(long, default_value_t = 0.1)]
        ratio: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Rows outside this label space are dropped
        #[arg(long, default_value = "full")]
        label_scheme: LabelScheme,
    },
    /// Replace every sentence with its entity-marked form
    Mark {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the label dictionary of a scheme as JSON
    Labels {
        #[arg(long, default_value = "full")]
        label_scheme: LabelScheme,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Split {
            input,
            output_dir,
            ratio,
            seed,
            label_scheme,
        } => {
            let corpus = Corpus::load(&input, label_scheme)?;
            let split = SplitMode::Plain { ratio };
            let folds = split.split(corpus.labels(), seed)?;
            std::fs::create_dir_all(&output_dir)?;
            for fold in &folds {
                let train = corpus.select(&fold.train);
                let valid = corpus.select(&fold.valid);
                write_rows(output_dir.join("train.csv"), train.rows())?;
                write_rows(output_dir.join("valid.csv"), valid.rows())?;
                info!("Label counts (train): {:?}", train.label_histogram());
                println!(
                    "Done. {} rows split into {} train / {} valid in {:?}.",
                    corpus.len(),
                    train.len(),
                    valid.len(),
                    output_dir
                );
            }
        }
        Commands::Mark { input, output } => {
            let rows = read_rows(&input)?;
            write_marked(&output, &rows)?;
            println!("Done. Marked {} sentences into {:?}.", rows.len(), output);
        }
        Commands::Labels {
            label_scheme,
            output,
        } => {
            let dict = label_scheme.dict();
            match output {
                Some(path) => {
                    dict.save(&path)?;
                    println!("Wrote {} labels to {:?}.", dict.len(), path);
                }
                None => {
                    let ids: serde_json::Map<String, serde_json::Value> = dict
                        .names()
                        .iter()
                        .enumerate()
                        .map(|(id, name)| (name.clone(), id.into()))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&ids)?);
                }
            }
        }
    }

    Ok(())
}
