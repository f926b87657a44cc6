#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

// ========================================================================================
//
//                      THE PREDICTION ENTRY POINT: PATHOGEN-PREDICT
//
// ========================================================================================
//
// Spawned once per request by the web service. The request arrives as a single JSON
// argument, the data directory comes from `PREDICTORS_DATA_PATH` (or `--data-dir`), and
// the prediction is written as the only line on stdout. Every diagnostic goes to stderr
// through the logger so the caller can parse stdout verbatim.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap::error::ErrorKind;
use pathogen_predictor::config::{PipelineConfig, PreprocessMode};
use pathogen_predictor::pipeline::{DATA_PATH_ENV, Predictor};
use pathogen_predictor::recipes::RecipeBook;
use polars::prelude::{CsvWriter, SerWriter};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Clone, Copy, ValueEnum)]
enum ModeCli {
    Direct,
    Curated,
}

impl From<ModeCli> for PreprocessMode {
    fn from(mode: ModeCli) -> Self {
        match mode {
            ModeCli::Direct => PreprocessMode::Direct,
            ModeCli::Curated => PreprocessMode::Curated,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "pathogen-predict",
    version,
    about = "Predict pathogen assay delta Cq from experiment metadata",
    long_about = "Joins a JSON experiment record against the lysis and wash recipe tables, \
                  preprocesses it into the model's feature row and prints the prediction."
)]
struct Cli {
    /// Prediction request as a JSON object
    request: Option<String>,

    /// Directory holding the recipe CSVs and trained_model.toml
    #[arg(long, env = DATA_PATH_ENV, global = true)]
    data_dir: Option<PathBuf>,

    /// Pipeline config (defaults to pipeline.toml in the data directory, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the preprocessing mode from the config
    #[arg(long, value_enum, global = true)]
    mode: Option<ModeCli>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the preprocessed feature frame for a request as CSV
    Features {
        /// Prediction request as a JSON object
        request: String,
    },
    /// List the available lysis, wash1 and wash2 versions as JSON
    Versions,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let Some(data_dir) = cli.data_dir.clone() else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                format!("no data directory: pass --data-dir or set {DATA_PATH_ENV}"),
            )
            .exit();
    };

    let result = match (cli.command, cli.request) {
        (Some(Commands::Versions), _) => versions_command(&data_dir),
        (Some(Commands::Features { request }), _) => load_predictor(&data_dir, cli.config.as_deref(), cli.mode)
            .and_then(|predictor| features_command(&predictor, &request)),
        (None, Some(request)) => load_predictor(&data_dir, cli.config.as_deref(), cli.mode)
            .and_then(|predictor| predict_command(&predictor, &request)),
        (None, None) => Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a JSON prediction request is required",
            )
            .exit(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_predictor(
    data_dir: &Path,
    config_path: Option<&Path>,
    mode: Option<ModeCli>,
) -> Result<Predictor, Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::resolve(data_dir, config_path)?;
    if let Some(mode) = mode {
        config.mode = mode.into();
    }
    log::info!("Preprocessing mode: {:?}", config.mode);
    Ok(Predictor::load(data_dir, config)?)
}

fn predict_command(predictor: &Predictor, request: &str) -> Result<(), Box<dyn std::error::Error>> {
    let prediction = predictor.predict(request)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{prediction}")?;
    stdout.flush()?;
    Ok(())
}

fn features_command(predictor: &Predictor, request: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut frame = predictor.features(request)?;
    let mut stdout = io::stdout().lock();
    CsvWriter::new(&mut stdout)
        .include_header(true)
        .finish(&mut frame)?;
    stdout.flush()?;
    Ok(())
}

fn versions_command(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let recipes = RecipeBook::load(data_dir)?;
    let json = serde_json::to_string_pretty(&recipes.catalog())?;
    println!("{json}");
    Ok(())
}
