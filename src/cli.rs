//! Command-line interface for recap.
//!
//! `run` starts the long-lived service (poller, workers, metrics endpoint).
//! `process` and `poll` are one-shot operator commands; `config` prints the
//! resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::{DocStoreClient, MailerClient, SummarizerClient, WarehouseClient};
use crate::config::{self, Config, Secrets};
use crate::core::{Orchestrator, RetryExecutor, StageSet};
use crate::domain::{ItemStatus, TranscriptRef, WorkItem};
use crate::ingest::{work_queue, CatalogClient, Poller, PollerSettings, SeenSet, TranscriptSource};
use crate::metrics::Metrics;

/// recap - call transcript summarization service
#[derive(Parser, Debug)]
#[command(name = "recap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: recap.yaml in the current directory or a parent)
    #[arg(short, long, global = true, env = config::CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the service: poll the catalog and process new transcripts
    Run,

    /// Run a single transcript through the pipeline and exit
    Process {
        /// Transcript identifier
        transcript_id: String,
    },

    /// Poll the catalog once and print what would be admitted
    Poll {
        /// Override the lookback window in seconds
        #[arg(long)]
        lookback_secs: Option<u64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let (config, source) = Config::load(self.config.as_deref())?;

        match self.command {
            Commands::Run => run_service(config, &source).await,
            Commands::Process { transcript_id } => process_one(config, &transcript_id).await,
            Commands::Poll { lookback_secs } => poll_once(config, lookback_secs).await,
            Commands::Config => show_config(&config, &source),
        }
    }
}

/// Run the full service until a shutdown signal arrives.
async fn run_service(config: Config, source: &Path) -> Result<()> {
    info!(config = %source.display(), "configuration loaded");

    let secrets = Secrets::from_env()?;
    let metrics = Metrics::new().context("failed to register metrics")?;
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let executor = RetryExecutor::new(shutdown.clone());
    let stages = Arc::new(build_stage_set(&config, &secrets, executor, metrics.clone())?);

    let catalog: Arc<dyn TranscriptSource> = Arc::new(CatalogClient::new(
        config.catalog.base_url.clone(),
        secrets.catalog_api_key.clone(),
        config.catalog.request_timeout(),
    )?);

    let (sender, receiver) = work_queue(config.queue.capacity);
    let poller = Poller::new(
        catalog,
        SeenSet::new(),
        sender,
        config.poller.clone(),
        shutdown.clone(),
        metrics.clone(),
    );
    let orchestrator = Orchestrator::new(
        stages,
        receiver,
        config.queue.workers,
        shutdown.clone(),
        config.shutdown.grace(),
        metrics.clone(),
    );

    if !config.metrics.disabled {
        let addr = config.metrics_addr()?;
        let listener = crate::metrics::bind(addr).await?;
        let serve_metrics = metrics.clone();
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = crate::metrics::serve(listener, serve_metrics, serve_shutdown).await
            {
                error!(error = %error, "metrics endpoint failed");
            }
        });
    }

    let poller_handle = tokio::spawn(poller.run());
    let report = orchestrator.run().await?;

    if let Err(error) = poller_handle.await {
        warn!(error = %error, "poller task panicked");
    }

    if report.is_clean() {
        info!("shutdown complete");
        Ok(())
    } else {
        warn!(
            workers_done = report.workers_done,
            abandoned = report.abandoned,
            "shutdown incomplete"
        );
        std::process::exit(1);
    }
}

/// Run one transcript through all four stages without the poller.
async fn process_one(config: Config, transcript_id: &str) -> Result<()> {
    let secrets = Secrets::from_env()?;
    let metrics = Metrics::new().context("failed to register metrics")?;
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let executor = RetryExecutor::new(shutdown.clone());
    let stages = build_stage_set(&config, &secrets, executor, metrics)?;

    eprintln!("Processing transcript {transcript_id}...");
    let mut item = WorkItem::new(TranscriptRef::bare(transcript_id));
    stages.process(&mut item).await;

    match item.status {
        ItemStatus::Succeeded => {
            if let Some(summary) = &item.summary {
                println!("{}", summary.text);
            }
            if let Some(docs) = &item.docs {
                eprintln!();
                eprintln!("Current summary: {}", docs.current_url);
                eprintln!("History:         {}", docs.history_url);
            }
            if let Some(receipt) = &item.receipt {
                eprintln!("CS message:      {}", receipt.cs_message_id);
                eprintln!("AM message:      {}", receipt.am_message_id);
            }
            eprintln!("\n[transcript {transcript_id} processed]");
            Ok(())
        }
        ItemStatus::Failed => {
            if let Some(failure) = &item.failure {
                eprintln!(
                    "\n[transcript {} failed at {}: {} ({} failure, {} attempt(s))]",
                    transcript_id, failure.stage, failure.message, failure.class, failure.attempts
                );
            }
            std::process::exit(1);
        }
        ItemStatus::Cancelled => {
            eprintln!("\n[transcript {transcript_id} interrupted before completion]");
            std::process::exit(1);
        }
        ItemStatus::Pending | ItemStatus::InProgress => {
            eprintln!(
                "\n[transcript {} ended in unexpected state: {}]",
                transcript_id,
                item.status.name()
            );
            std::process::exit(1);
        }
    }
}

/// One catalog poll, printed instead of enqueued.
async fn poll_once(config: Config, lookback_secs: Option<u64>) -> Result<()> {
    let api_key = config::required_env(config::ENV_CATALOG_API_KEY)?;

    let mut settings = config.poller.clone();
    if let Some(secs) = lookback_secs {
        if secs == 0 || secs > PollerSettings::MAX_LOOKBACK_SECS {
            bail!(
                "--lookback-secs must be between 1 and {} (got {secs})",
                PollerSettings::MAX_LOOKBACK_SECS
            );
        }
        settings.lookback_secs = secs;
    }

    let catalog = CatalogClient::new(
        config.catalog.base_url.clone(),
        api_key,
        config.catalog.request_timeout(),
    )?;

    let to = Utc::now();
    let from = to - settings.lookback();
    let transcripts = catalog
        .poll(from, to)
        .await
        .context("catalog poll failed")?;

    if transcripts.is_empty() {
        println!(
            "No transcripts in the last {}s window",
            settings.lookback_secs
        );
        return Ok(());
    }

    let seen = SeenSet::new();
    println!(
        "{:<28} {:<20} {:<17} {:<6} {}",
        "TRANSCRIPT", "CALL", "RECORDED", "", "ACCOUNT"
    );
    println!("{}", "-".repeat(90));

    let mut admitted = 0usize;
    for t in &transcripts {
        let status = if seen.admit(&t.transcript_id) {
            admitted += 1;
            "new"
        } else {
            "dup"
        };
        let recorded = t
            .recorded_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<20} {:<17} {:<6} {}",
            t.transcript_id,
            t.call_id.as_deref().unwrap_or("-"),
            recorded,
            status,
            t.account_name.as_deref().unwrap_or("-"),
        );
    }

    println!(
        "\nTotal: {} transcript(s), {} would be admitted",
        transcripts.len(),
        admitted
    );

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(config: &Config, source: &Path) -> Result<()> {
    println!("Config file: {}", source.display());
    println!();
    println!("Queue:");
    println!("  capacity: {}", config.queue.capacity);
    println!("  workers:  {}", config.queue.workers);
    println!();
    println!("Poller:");
    println!("  interval:     {}s", config.poller.interval_secs);
    println!("  lookback:     {}s", config.poller.lookback_secs);
    println!("  enqueue wait: {}ms", config.poller.enqueue_wait_ms);
    println!();
    println!("Endpoints:");
    println!("  catalog:    {}", config.catalog.base_url);
    println!("  warehouse:  {}", config.warehouse.base_url);
    println!(
        "  summarizer: {} (model: {})",
        config.summarizer.base_url, config.summarizer.model
    );
    println!("  docstore:   {}", config.docstore.base_url);
    println!(
        "  mailer:     {} (from: {})",
        config.mailer.base_url, config.mailer.from
    );
    println!();
    println!("Retries:");
    for (stage, policy) in [
        ("enrich", &config.retries.enrich),
        ("summarize", &config.retries.summarize),
        ("document", &config.retries.document),
        ("notify", &config.retries.notify),
    ] {
        println!(
            "  {:<10} {} attempt(s), {}ms..{}ms x{}, jitter {}, attempt timeout {}ms",
            stage,
            policy.max_attempts,
            policy.initial_delay_ms,
            policy.max_delay_ms,
            policy.backoff_multiplier,
            policy.jitter,
            policy.attempt_timeout_ms,
        );
    }
    println!();
    if config.metrics.disabled {
        println!("Metrics: disabled");
    } else {
        println!("Metrics: {}", config.metrics.listen_addr);
    }
    println!("Shutdown grace: {}s", config.shutdown.grace_secs);
    println!();
    println!("Secrets (environment):");
    for name in [
        config::ENV_CATALOG_API_KEY,
        config::ENV_WAREHOUSE_TOKEN,
        config::ENV_SUMMARIZER_API_KEY,
        config::ENV_DOCSTORE_TOKEN,
        config::ENV_MAILER_TOKEN,
    ] {
        let state = match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => "set",
            _ => "missing",
        };
        println!("  {name:<30} {state}");
    }

    Ok(())
}

/// Build the production stage set from config and secrets.
fn build_stage_set(
    config: &Config,
    secrets: &Secrets,
    executor: RetryExecutor,
    metrics: Metrics,
) -> Result<StageSet> {
    let warehouse = WarehouseClient::new(
        config.warehouse.base_url.clone(),
        secrets.warehouse_token.clone(),
        config.warehouse.request_timeout(),
    )?;
    let summarizer = SummarizerClient::new(
        config.summarizer.base_url.clone(),
        secrets.summarizer_api_key.clone(),
        config.summarizer.model.clone(),
        config.summarizer.request_timeout(),
    )?;
    let docstore = DocStoreClient::new(
        config.docstore.base_url.clone(),
        secrets.docstore_token.clone(),
        config.docstore.request_timeout(),
    )?;
    let mailer = MailerClient::new(
        config.mailer.base_url.clone(),
        secrets.mailer_token.clone(),
        config.mailer.from.clone(),
        config.mailer.request_timeout(),
    )?;

    Ok(StageSet::new(
        Arc::new(warehouse),
        Arc::new(summarizer),
        Arc::new(docstore),
        Arc::new(mailer),
        config.retries.clone(),
        executor,
        metrics,
    ))
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(error) => {
            warn!(error = %error, "failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
