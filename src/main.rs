use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_relay::chat::telegram::TelegramClient;
use media_relay::output::LocalDelivery;
use media_relay::scheduler::SchedulerLimits;
use media_relay::{
    utils, ChatFrontend, Cli, CommandRunner, Commands, Config, JobState, Pipeline, Requester,
    Scheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run { token } => {
            warn_missing_tools(&config).await;
            run_bot(config.with_bot_token(token)).await?;
        }
        Commands::Fetch { url, output, quiet } => {
            warn_missing_tools(&config).await;
            if !fetch(config, &url, output, quiet).await? {
                std::process::exit(1);
            }
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                let path = match cli.config {
                    Some(path) => path,
                    None => Config::config_path()?,
                };
                println!("Configuration file: {}", path.display());
                println!("Run with --show to print the effective settings.");
            }
        }
        Commands::Check => {
            let missing = utils::check_dependencies(&required_tools(&config)).await;
            if missing.is_empty() {
                println!("✅ All external tools are available");
            } else {
                println!("Missing tools:");
                for dep in missing {
                    println!("  • {}", dep);
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "media_relay=debug"
    } else {
        "media_relay=info"
    };
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.into()),
    );

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn required_tools(config: &Config) -> Vec<(&str, &str)> {
    vec![
        (config.extract.program.as_str(), "required for downloading media"),
        (config.transcode.program.as_str(), "required for converting media"),
        (config.transcode.probe_program.as_str(), "used to check media duration"),
    ]
}

/// Missing tools are reported but not fatal, they may appear on PATH later
async fn warn_missing_tools(config: &Config) {
    let missing_deps = utils::check_dependencies(&required_tools(config)).await;
    if !missing_deps.is_empty() {
        eprintln!("⚠️  Dependency check warnings:");
        for dep in missing_deps {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - tools may be available)");
    }
}

async fn run_bot(config: Config) -> Result<()> {
    let telegram = Arc::new(TelegramClient::new(&config.telegram)?);
    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::new(CommandRunner::new()),
        telegram.clone(),
    ));
    let scheduler = Scheduler::start(SchedulerLimits::from(&config.pipeline), pipeline);
    let frontend = Arc::new(ChatFrontend::new(scheduler.clone(), telegram.clone()));

    let shutdown = CancellationToken::new();
    let polling = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { telegram.run_polling(frontend, shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    polling.await.context("Polling task failed")?;
    scheduler.shutdown().await;

    Ok(())
}

/// Run one link through the pipeline with local delivery.
/// Returns whether a file was produced.
async fn fetch(mut config: Config, url: &str, output: PathBuf, quiet: bool) -> Result<bool> {
    let workdir = tempfile::Builder::new()
        .prefix("media-relay-")
        .tempdir()
        .context("Failed to create working directory")?;
    config.pipeline.temp_root = Some(workdir.path().to_path_buf());
    config.pipeline.workers = 1;

    let delivery = Arc::new(LocalDelivery::new(output));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::new(CommandRunner::new()),
        delivery.clone(),
    ));
    let scheduler = Scheduler::start(SchedulerLimits::from(&config.pipeline), pipeline);

    let id = match scheduler.submit(Requester::from("local"), url) {
        Ok(id) => id,
        Err(e) => {
            scheduler.shutdown().await;
            anyhow::bail!("{}", e);
        }
    };
    let mut status = scheduler
        .watch(&id)
        .context("Job disappeared right after admission")?;

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let progress = ProgressBar::new_spinner();
        progress.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        progress.enable_steady_tick(Duration::from_millis(120));
        progress
    };

    let final_state = loop {
        let state = status.borrow_and_update().state;
        progress.set_message(match state {
            JobState::Queued => "Waiting for a worker...",
            JobState::Extracting => "Downloading media...",
            JobState::Transcoding => "Converting media...",
            _ => "Finishing...",
        });
        if state.is_terminal() {
            break state;
        }

        let closed = tokio::select! {
            changed = status.changed() => changed.is_err(),
            _ = tokio::signal::ctrl_c() => {
                progress.set_message("Cancelling...");
                scheduler.cancel(&id).await;
                false
            }
        };
        if closed {
            // the job went away without reaching a terminal state
            break status.borrow().state;
        }
    };
    progress.finish_and_clear();

    // waits for delivery and cleanup to finish
    scheduler.shutdown().await;

    match (final_state, delivery.last_file()) {
        (JobState::Succeeded, Some(_)) => Ok(true),
        (JobState::Succeeded, None) => {
            eprintln!("❌ The file could not be saved to {}", delivery.output_dir().display());
            Ok(false)
        }
        _ => Ok(false),
    }
}
