// ========================================================================================
//
//                        THE COMMAND-LINE DRIVER: STACKGRNN
//
// ========================================================================================
//
// A thin host-side front end for the engine. Each invocation is a fresh process, so
// `predict` and `evaluate` re-attach the artifacts written by an earlier `train` instead
// of retraining. All streams are resolved under `--store`.

use clap::{Args, Parser, Subcommand};
use ndarray::Array1;
use stackgrnn::data::load_training_matrix;
use stackgrnn::metrics::{mean_absolute_percentage_error, root_mean_squared_error};
use stackgrnn::{DirStorage, Engine, EngineConfig};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "stackgrnn",
    version,
    about = "Train and query a storage-bounded stacked GRNN regression engine",
    long_about = "Trains a two-stage Gaussian-kernel regression on a CSV table (header row, \
                  label in the last column) and persists the pair set next to the dataset, \
                  so later predictions never hold more than the training table in memory."
)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// Directory that datasets and artifacts are resolved against
    #[arg(long, global = true, default_value = ".")]
    store: PathBuf,

    /// TOML file with engine settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Stage-1 kernel width (overrides the config file)
    #[arg(long, global = true)]
    sigma1: Option<f64>,

    /// Stage-2 and query kernel width (overrides the config file)
    #[arg(long, global = true)]
    sigma2: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on a dataset and persist its pair set
    #[command(about = "Train on a CSV dataset (outputs: <dataset>_pairs.bin, <dataset>_targets.bin)")]
    Train {
        /// Dataset name under the store directory
        dataset: String,
    },

    /// Predict the label for one feature vector
    Predict {
        /// Dataset the model was trained on
        dataset: String,

        /// Comma-separated feature values, one per non-label column
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true, required = true)]
        query: Vec<f64>,
    },

    /// Predict every row of a labelled test table and report the error
    Evaluate {
        /// Dataset the model was trained on
        dataset: String,

        /// Test CSV with the same columns as the training dataset
        test_data: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&cli.engine)?;
    let storage = DirStorage::new(&cli.engine.store);
    let mut engine = Engine::new(storage, config)?;

    match cli.command {
        Commands::Train { dataset } => {
            let summary = engine.train(&dataset)?;
            println!(
                "Trained on {} rows x {} columns: {} pairs",
                summary.rows, summary.cols, summary.pair_count
            );
            println!("Pairs written to: {}", summary.artifacts.pairs);
            println!("Targets written to: {}", summary.artifacts.targets);
        }
        Commands::Predict { dataset, query } => {
            engine.resume(&dataset)?;
            let prediction = engine.predict(&query)?;
            let mut buffer = ryu::Buffer::new();
            println!("{}", buffer.format(prediction));
        }
        Commands::Evaluate { dataset, test_data } => {
            engine.resume(&dataset)?;
            let test = load_training_matrix(engine.storage(), &test_data, engine.config())?;
            let mut predictions = Vec::with_capacity(test.nrows());
            let mut buffer = ryu::Buffer::new();
            println!("label\tprediction");
            for i in 0..test.nrows() {
                let features = test.features(i).to_vec();
                let prediction = engine.predict(&features)?;
                let label = test.label(i);
                print!("{}\t", buffer.format(label));
                println!("{}", buffer.format(prediction));
                predictions.push(prediction);
            }
            let labels: Array1<f64> = (0..test.nrows()).map(|i| test.label(i)).collect();
            let predictions = Array1::from_vec(predictions);
            println!(
                "RMSE: {:.6}",
                root_mean_squared_error(labels.view(), predictions.view())
            );
            println!(
                "MAPE: {:.3}%",
                mean_absolute_percentage_error(labels.view(), predictions.view())
            );
        }
    }
    Ok(())
}

fn resolve_config(args: &EngineArgs) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(sigma1) = args.sigma1 {
        config.sigma1 = sigma1;
    }
    if let Some(sigma2) = args.sigma2 {
        config.sigma2 = sigma2;
    }
    config.validate()?;
    Ok(config)
}
