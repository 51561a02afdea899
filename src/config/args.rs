//! Command-line argument parsing

use std::path::PathBuf;

use clap::Parser;

/// Overlap-sampling Monte Carlo for virial coefficients
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config_file: String,

    /// Log file (default stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Log debug records too
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the number of workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Override the production macro-steps per worker
    #[arg(long)]
    pub steps: Option<u64>,

    /// Override the equilibration macro-steps per worker
    #[arg(long)]
    pub equilibration_steps: Option<u64>,

    /// Override the temperature
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Override the base random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Raw bin statistics output
    #[arg(long)]
    pub raw: Option<PathBuf>,

    /// Bin weights output
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// JSON summary output
    #[arg(long)]
    pub summary: Option<PathBuf>,
}
