//! # Herald — Notification Dispatcher
//!
//! Queues notifications and delivers them over email, Slack and ntfy with
//! bounded retries.
//!
//! Usage:
//!   herald [run]                                 # Run the dispatcher until Ctrl-C
//!   herald send --channel debug --to me --body hi
//!   herald channels                              # List configured channels
//!   herald config                                # Print the effective config (secrets redacted)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use herald_core::{ChannelType, HeraldConfig, Notification, NotificationStatus, Priority};
use herald_dispatch::DispatchService;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "herald", version, about = "📣 Herald — notification dispatcher")]
struct Cli {
    /// Config file (default: ~/.herald/config.toml)
    #[arg(short, long, env = "HERALD_CONFIG", global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher until interrupted (default)
    Run,

    /// Queue one notification and wait for its outcome
    Send {
        /// email, chat (slack), push (ntfy) or debug (stdout)
        #[arg(long)]
        channel: String,

        /// Named account within the channel type
        #[arg(long, default_value = "")]
        account: String,

        /// Recipient (repeatable)
        #[arg(long = "to")]
        to: Vec<String>,

        #[arg(long)]
        cc: Vec<String>,

        #[arg(long)]
        bcc: Vec<String>,

        #[arg(long, default_value = "")]
        subject: String,

        #[arg(long)]
        body: String,

        /// low, normal, high or critical
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Retry budget (0 = configured default)
        #[arg(long, default_value = "0")]
        max_retries: u32,

        /// Seconds to wait for a terminal status
        #[arg(long, default_value = "60")]
        wait: u64,
    },

    /// List configured channels and accounts
    Channels,

    /// Print the effective configuration with secrets redacted
    Config,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<HeraldConfig> {
    let config = match path {
        Some(p) => {
            let path = expand_path(p);
            HeraldConfig::load_from(&path)
                .with_context(|| format!("loading config {}", path.display()))?
        }
        None => HeraldConfig::load().context("loading default config")?,
    };
    Ok(config)
}

fn init_logging(config: &HeraldConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "herald={level},herald_core={level},herald_dispatch={level},herald_channels={level}"
        ))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_service(config: &HeraldConfig) -> Result<DispatchService> {
    let registry = herald_channels::registry_from_config(&config.notifiers)
        .context("building channel adapters")?;
    let service = DispatchService::from_config(&config.queue, Arc::new(registry))
        .context("building dispatcher")?;
    Ok(service)
}

fn parse_priority(raw: &str) -> Result<Priority> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .with_context(|| format!("unknown priority: {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config).await,
        Command::Send {
            channel,
            account,
            to,
            cc,
            bcc,
            subject,
            body,
            priority,
            max_retries,
            wait,
        } => {
            let channel_type: ChannelType = channel.parse()?;
            let mut notification = Notification::new(channel_type, &subject, &body)
                .with_account(&account)
                .with_priority(parse_priority(&priority)?)
                .with_max_retries(max_retries);
            notification.recipients = to;
            notification.cc = cc;
            notification.bcc = bcc;
            send_once(&config, notification, Duration::from_secs(wait)).await
        }
        Command::Channels => {
            let registry = herald_channels::registry_from_config(&config.notifiers)?;
            if registry.is_empty() {
                println!("No channels configured.");
            }
            for channel_type in registry.supported_types() {
                let default = registry.default_account(channel_type).unwrap_or("");
                for account in registry.accounts_for(channel_type) {
                    let label = if account.is_empty() { "(any)" } else { account.as_str() };
                    let marker = if !account.is_empty() && account == default { " *" } else { "" };
                    println!("{channel_type:<6} {label}{marker}");
                }
            }
            Ok(())
        }
        Command::Config => {
            let rendered = toml::to_string_pretty(&config.sanitized())?;
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn run(config: &HeraldConfig) -> Result<()> {
    tracing::debug!("Effective config: {:?}", config.sanitized());
    let service = build_service(config)?;
    service.start()?;
    tracing::info!(
        "📣 Herald running: {} worker(s), buffer {}, {} channel adapter(s)",
        config.queue.worker_count,
        config.queue.buffer_size,
        service.registry().count()
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Received Ctrl-C, shutting down");

    let stats = service.stats();
    service.shutdown().await;
    tracing::info!(
        "📊 sent={} failed={} pending={} queued={}",
        stats.total_sent,
        stats.total_failed,
        stats.total_pending,
        stats.total_queued
    );
    Ok(())
}

async fn send_once(config: &HeraldConfig, notification: Notification, wait: Duration) -> Result<()> {
    let service = build_service(config)?;
    service.start()?;

    let outcome = async {
        let receipt = service.send(notification).await?;
        let id = receipt.notification_id;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let current = service.get(&id)?;
            if current.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return anyhow::Ok(current);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    .await;
    service.shutdown().await;

    let notification = outcome?;
    println!("{}", serde_json::to_string_pretty(&notification)?);
    match notification.status {
        NotificationStatus::Sent => Ok(()),
        NotificationStatus::Failed => bail!(
            "delivery failed: {}",
            notification.last_error.unwrap_or_default()
        ),
        other => bail!("still {other} after {wait:?}"),
    }
}
