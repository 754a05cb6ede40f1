use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pose_training::{
    checkpoint::load_checkpoint,
    config::{ConfigOverride, TrainingConfig},
    TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("pose-train-inspect failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect pose training configs and checkpoints", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load, override and validate a training config, then print it as JSON.
    Config {
        #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
        config: PathBuf,

        #[arg(
            long = "override",
            value_name = "KEY=VALUE",
            help = "Override configuration value using dot-separated paths"
        )]
        overrides: Vec<ConfigOverride>,
    },
    /// Verify a checkpoint directory and print its manifest.
    Checkpoint {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    match args.command {
        Command::Config { config, overrides } => {
            let config = TrainingConfig::load_with_overrides(&config, &overrides)?;
            print_json(&config)
        }
        Command::Checkpoint { path } => {
            let loaded = load_checkpoint(&path)?;
            log::info!(
                "checksum ok for {}",
                loaded.model_weights_path.display()
            );
            print_json(&loaded.manifest)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), TrainingError> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
