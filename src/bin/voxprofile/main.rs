use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use voxprofile::config::Config;
use voxprofile::error::VoxprofileError;
use voxprofile::metrics::Meters;
use voxprofile::profile::{ProfileSet, profile_path};

#[derive(Parser)]
#[command(
    name = "voxprofile",
    about = "Build speaker profiles from mel features and score audio classifiers",
    long_about = "voxprofile runs an ONNX audio model over precomputed mel spectrogram \
        features listed in CSV manifests. It averages per-utterance embeddings into \
        one profile vector per identifier and writes them next to the checkpoint, \
        and it validates classifier checkpoints with a class-weighted cross-entropy \
        criterion, reporting loss, perplexity, accuracy and AUC."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/voxprofile/config.yaml if not specified.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the voxprofile crate, showing
    /// progress through the dataset and per-batch details.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate identifier profiles from a checkpoint
    ///
    /// Embeds every utterance of the configured manifests one at a time,
    /// averages the embeddings of each identifier and writes the result to
    /// profile.pt in the checkpoint's directory.
    Profiles {
        /// Checkpoint to load (overrides model.checkpoint)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Score a classifier checkpoint with the configured criterion
    ///
    /// Runs the model over the configured manifests, computes the criterion
    /// loss for every batch and prints the reduced metrics.
    Validate {
        /// Checkpoint to load (overrides model.checkpoint)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Print metrics as a JSON object
        #[arg(long)]
        json: bool,
    },

    /// List the profiles stored in a profile file
    ///
    /// Reads the given file, or profile.pt next to the configured checkpoint
    /// when no path is given.
    Inspect {
        /// Profile file to read
        path: Option<PathBuf>,

        /// Print every profile vector as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config, VoxprofileError> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    Config::load(&path)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("voxprofile=debug,info")
    } else {
        EnvFilter::new("voxprofile=info,warn")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(cli);
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), VoxprofileError> {
    match cli.command {
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "voxprofile", &mut std::io::stdout());
            Ok(())
        }
        Command::Inspect {
            path: Some(ref path),
            json,
        } => run_inspect(path, json),
        _ => run_with_config(cli),
    }
}

fn run_with_config(cli: Cli) -> Result<(), VoxprofileError> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Profiles { checkpoint } => {
            let checkpoint = config.checkpoint_path(checkpoint.as_deref())?;
            let path = voxprofile::profile::generate::run_generation(&config, &checkpoint)?;
            println!("Saved profiles to {}", path.display());
            Ok(())
        }
        Command::Validate { checkpoint, json } => {
            let checkpoint = config.checkpoint_path(checkpoint.as_deref())?;
            let meters = voxprofile::validate::run_validation(&config, &checkpoint)?;
            print_metrics(&meters, json)
        }
        Command::Inspect { path: None, json } => {
            let checkpoint = config.checkpoint_path(None)?;
            run_inspect(&profile_path(&checkpoint), json)
        }
        Command::Inspect { path: Some(_), .. } | Command::Completions { .. } => unreachable!(),
    }
}

fn print_metrics(meters: &Meters, json: bool) -> Result<(), VoxprofileError> {
    let values = meters.smoothed_values();

    if json {
        let object: serde_json::Map<String, serde_json::Value> = values
            .into_iter()
            .map(|(key, value)| (key, serde_json::json!(value)))
            .collect();
        let text = serde_json::to_string(&object)
            .map_err(|e| VoxprofileError::Other(format!("failed to serialize metrics: {e}")))?;
        println!("{text}");
    } else {
        for (key, value) in values {
            println!("{key:>10} {value}");
        }
    }
    Ok(())
}

fn run_inspect(path: &Path, json: bool) -> Result<(), VoxprofileError> {
    let profiles = ProfileSet::load(path)?;

    if json {
        let object: serde_json::Map<String, serde_json::Value> = profiles
            .iter()
            .map(|(id, profile)| (id.clone(), serde_json::json!(profile)))
            .collect();
        let text = serde_json::to_string_pretty(&object)
            .map_err(|e| VoxprofileError::Other(format!("failed to serialize profiles: {e}")))?;
        println!("{text}");
        return Ok(());
    }

    if profiles.is_empty() {
        println!("No profiles in {}.", path.display());
        return Ok(());
    }

    println!("Profiles in {}:", path.display());
    for (id, profile) in profiles.iter() {
        println!(
            "  {id}: {} observations, dim {}",
            profile.observations,
            profile.embedding.len()
        );
    }
    println!("{} observations total", profiles.observations());
    Ok(())
}
