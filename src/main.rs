//! # Taplog CLI
//!
//! Drives a `Logger` from the command line to watch batching behave.
//!
//! Usage:
//!   taplog simulate                          # 12 clicks, default policy
//!   taplog simulate --events 3 --close       # flush on page closing
//!   taplog simulate --init-delay-ms 300      # reports wait for init
//!   taplog config show                       # Show configuration
//!   taplog config init                       # Write default config

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use taplog_core::{LogContext, SinkKind, TaplogConfig};
use taplog_scheduler::{
    FlushSink, LifecycleSignals, Logger, Phase, StdoutSink, WebhookSink, handler_fn,
    spawn_ctrl_c,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taplog",
    version,
    about = "🖱️ Taplog — batched event instrumentation",
    long_about = "Report events through a batching scheduler.\nFlushes on threshold, on interval, and on unmount / page closing."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report a stream of clicks and print every flushed batch
    Simulate {
        /// Number of click events to report
        #[arg(short, long, default_value = "12")]
        events: usize,

        /// Override batch threshold
        #[arg(short, long)]
        threshold: Option<usize>,

        /// Override flush interval (ms)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Simulated init action duration (ms)
        #[arg(long, default_value = "0")]
        init_delay_ms: u64,

        /// Delay between reports (ms)
        #[arg(long, default_value = "100")]
        spacing_ms: u64,

        /// Finish with page closing instead of unmount
        #[arg(long)]
        close: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => TaplogConfig::default_path(),
    }
}

fn load_config(cli: &Cli) -> Result<TaplogConfig> {
    let path = config_path(cli);
    if cli.config.is_some() || path.exists() {
        Ok(TaplogConfig::load_from(&path)?)
    } else {
        Ok(TaplogConfig::default())
    }
}

fn build_sink(config: &TaplogConfig) -> Result<Box<dyn FlushSink<Value>>> {
    match config.sink.kind {
        SinkKind::Stdout => Ok(Box::new(StdoutSink)),
        SinkKind::Webhook => {
            let url = config
                .sink
                .webhook_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("sink.webhook_url is required for webhook sink"))?;
            Ok(Box::new(WebhookSink::new(url)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taplog=debug,taplog_scheduler=debug,taplog_core=debug"
    } else {
        "taplog=info,taplog_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Simulate {
            events,
            threshold,
            interval_ms,
            init_delay_ms,
            spacing_ms,
            close,
        } => {
            let mut config = load_config(&cli)?;
            if let Some(threshold) = threshold {
                config.batch.threshold_size = *threshold;
            }
            if let Some(interval_ms) = interval_ms {
                config.batch.interval_ms = *interval_ms;
            }
            config.validate()?;

            simulate(
                &config,
                *events,
                Duration::from_millis(*init_delay_ms),
                Duration::from_millis(*spacing_ms),
                *close,
            )
            .await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(&cli)?;
                println!("📁 {}", config_path(&cli).display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                let path = config_path(&cli);
                if path.exists() && !force {
                    println!("⚠️  Config already exists at {} (use --force)", path.display());
                    return Ok(());
                }
                TaplogConfig::default().save_to(&path)?;
                println!("✅ Config written to {}", path.display());
            }
        },
    }

    Ok(())
}

async fn simulate(
    config: &TaplogConfig,
    events: usize,
    init_delay: Duration,
    spacing: Duration,
    close: bool,
) -> Result<()> {
    let signals = LifecycleSignals::new();
    let ctrl_c = spawn_ctrl_c(signals.clone());
    let started = tokio::time::Instant::now();

    let mut builder = Logger::builder()
        .config(config)
        .context(json!({ "session": "simulate" }))
        .handler(
            "click",
            handler_fn(move |params: Value, ctx: LogContext| async move {
                Ok(json!({
                    "type": "click",
                    "params": params,
                    "context": ctx.get(),
                    "at_ms": started.elapsed().as_millis() as u64,
                }))
            }),
        )
        .sink(build_sink(config)?)
        .lifecycle(&signals);
    if !init_delay.is_zero() {
        builder = builder.init(move || async move {
            tokio::time::sleep(init_delay).await;
            Ok(())
        });
    }
    let logger = builder.build()?;

    tracing::info!(
        "🚀 Simulating {} clicks every {}ms (threshold={}, interval={}ms)",
        events,
        spacing.as_millis(),
        config.batch.threshold_size,
        config.batch.interval_ms
    );

    let mut reports = Vec::with_capacity(events);
    for seq in 0..events {
        if logger.scheduler().phase() == Phase::Terminated {
            tracing::info!("🛑 Logger closed after {} reports", seq);
            break;
        }
        reports.push(logger.spawn_report("click", json!({ "seq": seq })));
        tokio::time::sleep(spacing).await;
    }
    for report in reports {
        // Failures were already logged by spawn_report
        let _ = report.await;
    }

    if close {
        signals.page_closing();
    } else {
        signals.unmount();
    }
    ctrl_c.abort();

    let stats = logger.stats();
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
