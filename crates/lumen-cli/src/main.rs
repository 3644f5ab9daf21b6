//! Lumen CLI - inspect tensor dumps, compare them, profile the engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lumen_cli::dumps::{compare_dumps, inspect_dump};
use lumen_cli::profile::{ProfileConfig, run_profile};
use lumen_runtime::Runtime;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Mixed GPU/CPU inference core tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the shape and value statistics of a tensor dump
    Inspect {
        /// Path to the dump file
        #[arg(value_name = "DUMP")]
        dump: PathBuf,

        /// Real channel count (defaults to four per plane)
        #[arg(short, long)]
        channels: Option<u32>,
    },
    /// Compare two tensor dumps element by element
    Compare {
        /// Reference dump
        #[arg(value_name = "EXPECTED")]
        expected: PathBuf,

        /// Dump under test
        #[arg(value_name = "ACTUAL")]
        actual: PathBuf,

        /// Real channel count (defaults to four per plane)
        #[arg(short, long)]
        channels: Option<u32>,

        /// Largest accepted absolute difference
        #[arg(short, long, default_value = "1e-4")]
        tolerance: f32,
    },
    /// Run a synthetic graph repeatedly and report stage timings
    Profile {
        #[arg(long, default_value = "64")]
        width: u32,

        #[arg(long, default_value = "64")]
        height: u32,

        /// Output channels of every convolution
        #[arg(long, default_value = "16")]
        channels: u32,

        /// Number of convolution layers
        #[arg(long, default_value = "3")]
        layers: u32,

        /// Classes of the host classifier head (0 = none)
        #[arg(long, default_value = "10")]
        classes: u32,

        /// Store intermediate tensors as 16-bit floats
        #[arg(long)]
        half: bool,

        /// Number of runs
        #[arg(short = 'n', long, default_value = "20")]
        runs: usize,

        /// Warm-up runs excluded from the summary
        #[arg(long, default_value = "2")]
        skip_head: usize,

        /// Trailing runs excluded from the summary
        #[arg(long, default_value = "1")]
        skip_tail: usize,

        /// Write per-stage dumps and kernels to this directory
        #[arg(long, value_name = "DIR")]
        dump_dir: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { dump, channels } => {
            let stats = inspect_dump(&dump, channels)?;
            println!("{}", dump.display());
            println!("{stats}");
        }
        Commands::Compare {
            expected,
            actual,
            channels,
            tolerance,
        } => {
            let report = compare_dumps(&expected, &actual, channels, tolerance)?;
            println!("{report}");
            if !report.is_match() {
                anyhow::bail!(
                    "{} values differ by more than {tolerance}",
                    report.mismatches
                );
            }
        }
        Commands::Profile {
            width,
            height,
            channels,
            layers,
            classes,
            half,
            runs,
            skip_head,
            skip_tail,
            dump_dir,
        } => {
            let config = ProfileConfig {
                width,
                height,
                channels,
                conv_layers: layers,
                classes,
                half_precision: half,
                runs,
                skip_head,
                skip_tail,
                dump_dir,
                ..Default::default()
            };
            cmd_profile(&config)?;
        }
    }

    Ok(())
}

fn cmd_profile(config: &ProfileConfig) -> Result<()> {
    let runtime = pollster::block_on(Runtime::new()).context("Failed to initialize GPU runtime")?;
    let report = run_profile(&runtime, config)?;

    print!("{}", report.table());
    if let Some(class) = report.classifier_output {
        println!("predicted class: {class}");
    }
    Ok(())
}
