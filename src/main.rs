//! Dispatchbot CLI entry point.
//!
//! Replays JSON-lines inbound events from stdin against a fixture store and
//! prints every outbound send to stdout.

use anyhow::Context as _;
use clap::Parser;
use dispatchbot::config::{Config, RuntimeConfig};
use dispatchbot::events::{EventSource, MemoryEventBus};
use dispatchbot::messaging::{MessagingManager, StdoutAdapter};
use dispatchbot::storage::memory::{Fixtures, MemoryStorage};
use dispatchbot::storage::Storage;
use dispatchbot::trigger::{TracingTriggerLog, TriggerLogSink};
use dispatchbot::{ChannelType, InboundEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing_subscriber::EnvFilter;

/// Channels that get a stdout connector.
const CHANNELS: [ChannelType; 7] = [
    ChannelType::Discord,
    ChannelType::WhatsappBaileys,
    ChannelType::WhatsappCloud,
    ChannelType::Slack,
    ChannelType::Telegram,
    ChannelType::Webchat,
    ChannelType::Unknown,
];

#[derive(Parser)]
#[command(name = "dispatchbot")]
#[command(about = "Decides whether, when, and how an agent replies to channel events")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// JSON file with `instances` and `providers`
    #[arg(short, long)]
    fixtures: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries outbound sends, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration from environment")?
    };
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let fixtures = match &cli.fixtures {
        Some(path) => {
            let source = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read fixtures from {}", path.display()))?;
            Fixtures::from_json(&source).with_context(|| format!("invalid fixtures in {}", path.display()))?
        }
        None => Fixtures::default(),
    };
    tracing::info!(
        instances = fixtures.instances.len(),
        providers = fixtures.providers.len(),
        "fixtures loaded"
    );

    let bus = MemoryEventBus::default();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::from_fixtures(fixtures));
    let mut connectors = MessagingManager::new();
    for channel in CHANNELS {
        connectors.register(StdoutAdapter::new(channel));
    }
    let trigger_log: Arc<dyn TriggerLogSink> = Arc::new(TracingTriggerLog);
    let runtime_config = Arc::new(RuntimeConfig::new(config.dispatch));

    let events: Arc<dyn EventSource> = Arc::new(bus.clone());
    let handle = dispatchbot::setup(events, storage, connectors, runtime_config, trigger_log)
        .await
        .with_context(|| "failed to start dispatcher")?;

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut line_number = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(%error, "failed to read stdin");
                    break;
                }
            };
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<InboundEvent>(&line) {
                Ok(event) => {
                    let receivers = bus.publish(event);
                    tracing::trace!(line = line_number, receivers, "event published");
                }
                Err(error) => tracing::warn!(%error, line = line_number, "skipping malformed event"),
            }
        }
    });

    tracing::info!("dispatchbot started, reading events from stdin");

    tokio::select! {
        _ = reader => {
            tracing::info!("end of input");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("shutting down...");
    handle.cleanup().await.with_context(|| "dispatcher cleanup failed")?;

    tracing::info!("dispatchbot stopped");
    Ok(())
}
