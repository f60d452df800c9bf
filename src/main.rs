//! reelbatch command-line entry point

use clap::Parser;
use reelbatch::error::exit_code;
use reelbatch::{BatchScheduler, CommandAcquirer, CommandAnalyzer, Config, Ledger, Result};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Acquire media for a list of URLs and analyze each item in one remote session
#[derive(Debug, Parser)]
#[command(name = "reelbatch", version, about)]
struct Args {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long, env = "REELBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Input list (CSV with a `url` column)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Result store (CSV)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum items in flight
    #[arg(long)]
    batch_size: Option<usize>,

    /// Only acquire; keep artifacts for a later analyze-only run
    #[arg(long, conflicts_with = "analyze_only")]
    download_only: bool,

    /// Only analyze artifacts already on disk
    #[arg(long)]
    analyze_only: bool,

    /// Keep artifacts after analysis
    #[arg(long)]
    retain_artifacts: bool,

    /// Prompt submitted with each artifact
    #[arg(long)]
    prompt: Option<String>,

    /// Run the analysis session headless
    #[arg(long)]
    headless: bool,

    /// Session credential file for the analyzer
    #[arg(long)]
    session_file: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Command-line flags take precedence over the configuration file
    fn apply(&self, config: &mut Config) {
        if let Some(input) = &self.input {
            config.paths.input_file = input.clone();
        }
        if let Some(output) = &self.output {
            config.paths.output_file = output.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.pipeline.batch_size = batch_size;
            config.pipeline.acquire_concurrency = config.pipeline.acquire_concurrency.min(batch_size);
        }
        if self.download_only {
            config.pipeline.download_only = true;
            config.pipeline.analyze_only = false;
        }
        if self.analyze_only {
            config.pipeline.analyze_only = true;
            config.pipeline.download_only = false;
        }
        if self.retain_artifacts {
            config.pipeline.retain_artifacts = true;
        }
        if let Some(prompt) = &self.prompt {
            config.prompt.prompt = prompt.clone();
        }
        if self.headless {
            config.prompt.headless = true;
        }
        if let Some(session_file) = &self.session_file {
            config.collaborators.session_file = Some(session_file.clone());
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(log_file.clone());
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(exit_code::STARTUP);
        }
    };

    let guard = match init_logging(args.verbose, args.quiet, config.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {}", e);
            process::exit(exit_code::STARTUP);
        }
    };

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };

    // Flush the file log before exiting
    drop(guard);
    process::exit(code);
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> Result<i32> {
    let stages = config.stages();
    let urls = reelbatch::input::load_urls(&config.paths.input_file)?;
    tracing::info!(
        input = %config.paths.input_file.display(),
        urls = urls.len(),
        "loaded input list"
    );

    let ledger = Arc::new(Ledger::open(&config.paths.ledger_path).await?);

    let mut scheduler = BatchScheduler::new(config.clone(), Arc::clone(&ledger));
    if stages.acquires() {
        scheduler =
            scheduler.with_acquirer(Arc::new(CommandAcquirer::from_config(&config.collaborators)?));
    }
    if stages.analyzes() {
        scheduler =
            scheduler.with_analyzer(Box::new(CommandAnalyzer::from_config(&config.collaborators)?));
    }

    let summary = reelbatch::run_until_signal(scheduler, urls).await?;

    if let Ok(ledger) = Arc::try_unwrap(ledger) {
        ledger.close().await;
    }

    let Some(outcome) = summary.outcome else {
        return Ok(exit_code::SUCCESS);
    };
    eprintln!(
        "{}: {} analyzed, {} failed, {} skipped, {} unfinished ({:.1}s)",
        outcome.as_str(),
        summary.analyzed,
        summary.failed,
        summary.skipped_done + summary.skipped_failed,
        summary.unfinished,
        summary.duration.as_secs_f64()
    );
    Ok(outcome.exit_code())
}

fn init_logging(
    verbose: bool,
    quiet: bool,
    log_file: Option<&Path>,
) -> std::io::Result<Option<WorkerGuard>> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}
