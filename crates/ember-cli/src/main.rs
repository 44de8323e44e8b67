//! Ember command-line interface.
//!
//! Run dust emission jobs from TOML configuration files:
//! ```sh
//! ember-cli run job.toml --ranks 4
//! ember-cli validate job.toml
//! ```
//!
//! Set `RUST_LOG=info` to see library progress.

mod config;
mod runner;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ember-cli")]
#[command(about = "Ember: dust emission library for radiative transfer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an emission job from a TOML configuration file.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of ranks of a thread ensemble (overrides config file setting).
        #[arg(short, long)]
        ranks: Option<usize>,
    },
    /// Validate a configuration file without running the job.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output, ranks } => {
            println!("Ember Dust Emission");
            println!("===================");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());
            job.validate()
                .with_context(|| format!("invalid configuration {}", config.display()))?;
            let ranks = ranks.unwrap_or(job.parallel.ranks);
            if ranks == 0 {
                anyhow::bail!("--ranks must be at least 1");
            }

            let Some(result) = runner::run_simulation(&job, ranks)? else {
                // non-root MPI process
                return Ok(());
            };
            println!(
                "Cells: {}, wavelengths: {}, components: {}",
                result.cells.len(),
                result.wavelengths_micron.len(),
                job.model.component.len()
            );

            // Determine output directory
            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));

            // CSV luminosities (default on)
            if job.output.save_csv {
                let csv_path = out_dir.join("luminosity.csv");
                runner::write_luminosity_csv(&result, &csv_path, &job)?;
            }

            // JSON luminosities (optional)
            if job.output.save_json {
                let json_path = out_dir.join("luminosity.json");
                runner::write_luminosity_json(&result, &json_path)?;
            }

            println!("Emission calculation complete.");
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            job.validate()?;
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
    }
}
