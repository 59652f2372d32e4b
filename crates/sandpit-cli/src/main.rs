//! Sandpit CLI
//!
//! A command-line tool for running submissions in pooled Docker sandboxes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandpit::{Config, EXAMPLE_CONFIG, ExecutionSpec, Runner};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(about = "A tool for running submissions in pooled container sandboxes")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: sandpit.toml)
        #[arg(short, long, default_value = "sandpit.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a submission against an exercise
    Run {
        /// Execution spec of the exercise (TOML)
        #[arg(short, long, value_name = "FILE")]
        spec: PathBuf,

        /// File holding the submission payload
        #[arg(short, long, value_name = "FILE")]
        payload: PathBuf,

        /// Number of copies of the submission to run concurrently
        #[arg(short = 'n', long, default_value = "1")]
        concurrency: usize,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            spec,
            payload,
            concurrency,
        } => run_submission(config, &spec, &payload, concurrency).await,
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run_submission(
    config: Config,
    spec_path: &Path,
    payload_path: &Path,
    concurrency: usize,
) -> Result<()> {
    let spec = ExecutionSpec::from_file(spec_path).context("failed to load execution spec")?;
    let payload = tokio::fs::read_to_string(payload_path)
        .await
        .context("failed to read payload file")?;

    let runner = Arc::new(Runner::new(config));
    runner
        .start()
        .await
        .context("failed to start runner")?;

    info!(image = %spec.image, concurrency, "running submission");

    let spec = Arc::new(spec);
    let payload = Arc::new(payload);
    let mut tasks = tokio::task::JoinSet::new();
    for index in 0..concurrency.max(1) {
        let runner = Arc::clone(&runner);
        let spec = Arc::clone(&spec);
        let payload = Arc::clone(&payload);
        tasks.spawn(async move { (index, runner.run_submission(&spec, &payload).await) });
    }

    let mut results = Vec::with_capacity(concurrency);
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("submission task panicked")?);
    }
    results.sort_by_key(|(index, _)| *index);

    if let Some(stats) = runner.pool_stats(&spec.pool_key()).await? {
        info!(
            warm = stats.warm,
            burst = stats.burst,
            free_slots = stats.free_slots,
            "pool state"
        );
    }
    runner.shutdown().await?;

    let mut exit_code = 0;
    for (index, result) in results {
        match result {
            Ok(result) => {
                if concurrency > 1 {
                    println!("--- submission {index} ---");
                }
                print!("{}", result.output);
                info!(
                    index,
                    exit_code = result.status.code,
                    error = result.status.error.as_deref(),
                    "execution result"
                );
                if !result.is_success() && exit_code == 0 {
                    exit_code = i32::try_from(result.status.code).unwrap_or(1).max(1);
                }
            }
            Err(err) => {
                eprintln!("submission {index} failed: {err}");
                exit_code = 2;
            }
        }
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn show_config(config: &Config) {
    println!(
        "Docker socket: {}",
        config
            .docker_socket
            .as_ref()
            .map_or_else(|| "local defaults".to_string(), |p| p.display().to_string())
    );
    println!("Working directory: {}", config.workdir);
    println!();
    println!("Resource limits:");
    println!("  Memory: {} MB", config.limits.memory_mb);
    println!(
        "  CPU: {}/{} us",
        config.limits.cpu_quota, config.limits.cpu_period
    );
    println!("  Max processes: {:?}", config.limits.pids_limit);
    println!();
    println!("Pool:");
    println!("  Warm capacity: {}", config.pool.warm_capacity);
    println!("  Max extension: {}", config.pool.max_extension);
    println!("  Margin: {}", config.pool.margin);
    println!("  Acquire timeout: {:?}", config.pool.acquire_timeout());
    println!("  Idle timeout: {:?}", config.pool.idle_timeout());
    println!("  Burst idle timeout: {:?}", config.pool.burst_idle_timeout());
    println!();
    println!("Execution:");
    println!("  Deadline: {:?}", config.execution.deadline());
    println!("  Max attempts: {}", config.execution.max_attempts);
    println!("  Retry backoff: {:?}", config.execution.retry_backoff());
    println!();
    println!("Warm-ups configured: {}", config.warmups.len());
    for warmup in &config.warmups {
        println!("  {:<30} {}", warmup.image, warmup.directory.display());
    }
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
