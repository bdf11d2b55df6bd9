//! layerctl - drive a compositor session from the command line.

mod script;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use compositor::{Composer, CompositorConfig, DisplayConfig};
use script::{builtin_scenario, Script, ScriptRunner};

/// Run layer transactions against a software compositor and check the result
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Compositor configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Script to run instead of the built-in layer-update scenario
    #[arg(long)]
    script: Option<PathBuf>,

    /// Directory for captured PNG images
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Display width for the built-in scenario
    #[arg(long, default_value = "256")]
    width: u32,

    /// Display height for the built-in scenario
    #[arg(long, default_value = "256")]
    height: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Composite on a background thread
    #[arg(long)]
    threaded: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    // RUST_LOG wins over --verbose when set.
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let log_level = if verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<CompositorConfig> {
    match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(CompositorConfig::from_json(&json)?)
        }
        None => Ok(CompositorConfig::headless().with_display(DisplayConfig::new("main", args.width, args.height))),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("layerctl v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let script = match &args.script {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Script::from_json(&json)?
        }
        None => builtin_scenario(args.width, args.height, args.output_dir.is_some())?,
    };

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let composer = Composer::new(config)?;
    if args.threaded {
        composer.start()?;
    }

    let result = ScriptRunner::new(&composer, args.output_dir.clone()).run(&script);
    composer.stop();
    let summary = result?;

    let stats = composer.stats();
    info!(
        "{} steps, {} pixel checks passed, {} images written",
        summary.steps, summary.checks_passed, summary.images_written
    );
    info!(
        "{} layers, {} frames composited, {} transactions still parked",
        stats.layers, stats.frames_composited, stats.parked_transactions
    );

    Ok(())
}
