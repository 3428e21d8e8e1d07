//! linebatch CLI: run and inspect resumable JSON Lines batch jobs.
//!
//! # Commands
//! ```text
//! linebatch run    --endpoint <url> [--config <file.yaml>] [--input <path>] ...
//! linebatch status [--config <file.yaml>] [--output <path>] [--errors <path>]
//! linebatch info
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd_run;
mod cmd_status;
mod config;
mod http_transform;
mod logging;

use config::Overrides;

#[derive(Parser)]
#[command(
    name = "linebatch",
    about = "Resumable, rate-limited batch processing of JSON Lines files",
    long_about = "
linebatch reads one JSON object per line, sends each record through a
transformation and appends the results to an output file. Records already
present in the output are skipped, so an interrupted run can simply be
started again.

ENVIRONMENT VARIABLES:
  RUST_LOG    Log filter, overrides --log-level (e.g. linebatch_core=debug)
",
    version
)]
struct Cli {
    /// YAML configuration file; command-line flags take precedence
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    log_json: bool,

    /// Also append plain-text logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// POST every pending record to an HTTP endpoint and store the response
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Endpoint each record is POSTed to as JSON
        #[arg(long)]
        endpoint: String,
        /// Field of the output record that receives the JSON response
        #[arg(long, default_value = "response")]
        response_field: String,
    },

    /// Show how much of the input is already done, without running anything
    Status {
        #[command(flatten)]
        overrides: Overrides,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show effective configuration defaults
    Info,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            eprintln!("✗ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut file = config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        file.log.level = level;
    }
    file.log.json |= cli.log_json;
    if cli.log_file.is_some() {
        file.log.file = cli.log_file;
    }

    match cli.command {
        Commands::Run {
            overrides,
            endpoint,
            response_field,
        } => {
            let _log_guard = logging::init_tracing(&file.log)?;
            overrides.apply(&mut file.engine);
            cmd_run::run(file.engine, &endpoint, &response_field).await
        }

        Commands::Status { overrides, json } => {
            let _log_guard = logging::init_tracing(&file.log)?;
            overrides.apply(&mut file.engine);
            cmd_status::run(&file.engine, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Info => {
            cmd_info(&file.engine);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_info(config: &linebatch_core::EngineConfig) {
    println!("linebatch v{}", env!("CARGO_PKG_VERSION"));
    println!("  Input:              {}", config.input_path.display());
    println!("  Output:             {}", config.output_path.display());
    println!("  Error log:          {}", config.error_path.display());
    println!("  Identity key:       {}", config.id_key);
    println!(
        "  Rerun key:          {}",
        config.rerun_key.as_deref().unwrap_or("(disabled)")
    );
    println!("  Max concurrency:    {}", config.max_concurrency);
    match config.requests_per_minute {
        0 => println!("  Rate limit:         (disabled)"),
        rpm => println!("  Rate limit:         {rpm}/min"),
    }
    println!("  Write batch size:   {}", config.write_batch_size);
    println!(
        "  Retries:            {} (from {}ms, x{}, max {}ms, jitter ±{:.0}%)",
        config.max_retries,
        config.retry_initial_delay_ms,
        config.retry_multiplier,
        config.retry_max_delay_ms,
        config.retry_jitter * 100.0
    );
    println!("  HTTP timeout:       {}ms", config.http_timeout_ms);
}
