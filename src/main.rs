use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talon::config::Config;
use talon::error::Error;
use talon::limiter::Classifier;
use talon::parser::TimelineNormalizer;
use talon::pool::{EgressPool, IdentityPool};
use talon::renderer::HttpRenderer;
use talon::scheduler::{PollScheduler, SchedulerConfig};
use talon::storage::{JsonFileSink, StateStore};
use talon::watermark::WatermarkStore;

/// Exit code when every identity has been retired from rotation
const EXIT_NO_IDENTITIES: i32 = 2;

#[derive(Parser)]
#[command(
    name = "talon",
    version,
    about = "Authenticated list watcher with identity rotation and egress failover",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "talon.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured list for new items
    Watch {
        /// Override the list URL from the config
        #[arg(short, long)]
        url: Option<String>,

        /// Override the poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Override the per-poll record limit (0 for unbounded)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Establish sessions for configured accounts
    Login {
        /// Account name; all accounts when omitted
        #[arg(short, long)]
        account: Option<String>,

        /// Discard any saved session first
        #[arg(long)]
        fresh: bool,
    },

    /// Show the committed watermark and pool state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let config = load_config(&cli.config)?;

    let format = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.logging.format);
    setup_tracing(format, &config.logging.level, cli.verbose)?;
    if !config_found {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Watch {
            url,
            interval,
            limit,
            once,
        } => {
            let mut config = config;
            if let Some(url) = url {
                config.watch.list_url = url;
            }
            if let Some(interval) = interval {
                config.watch.interval_secs = interval;
            }
            if let Some(limit) = limit {
                config.watch.record_limit = limit;
            }
            config
                .validate()
                .context("invalid configuration for watch")?;

            watch_command(config, once).await?;
        }

        Commands::Login { account, fresh } => {
            config.validate().context("invalid configuration for login")?;
            login_command(config, account, fresh).await?;
        }

        Commands::Status => {
            status_command(config)?;
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::from_file(path)
    } else {
        Ok(Config::default())
    }
}

async fn watch_command(config: Config, once: bool) -> Result<()> {
    let policy = config.cooldown_policy();
    let identities = Arc::new(IdentityPool::new(config.credentials(), policy));
    let egress = if config.egress.is_empty() {
        None
    } else {
        Some(Arc::new(EgressPool::new(
            config.egress.clone(),
            config.egress_dwell(),
            config.egress_cooldown(),
        )))
    };

    let state_store = StateStore::new(&config.state.dir);
    let saved = state_store.load();
    identities.restore(&saved.identities).await;
    if let Some(pool) = &egress {
        pool.restore(&saved.egress).await;
    }

    let renderer = HttpRenderer::new(
        &config.watch.list_url,
        &config.watch.login_url,
        config.watch.max_scrolls,
        config.fetch_timeout(),
    )
    .map_err(Error::from)?;

    let ready = identities.bootstrap_all(&renderer).await;
    if ready == 0 {
        anyhow::bail!("no identity could establish a session");
    }
    tracing::info!(ready, total = config.accounts.len(), "identities ready");

    let classifier = Classifier::new(&config.limiter.markers, config.limiter.failure_threshold)
        .context("invalid rate-limit marker pattern")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop signal received");
            let _ = stop_tx.send(true);
        }
    });

    let mut scheduler = PollScheduler::new(
        SchedulerConfig::from_config(&config, once),
        identities,
        egress,
        classifier,
        renderer,
        TimelineNormalizer::new(),
        JsonFileSink::new(&config.state.output_path),
        WatermarkStore::new(config.state.dir.join("watermark.json")),
        state_store,
        stop_rx,
    );

    match scheduler.run().await {
        Ok(summary) => {
            tracing::info!(
                cycles = summary.cycles,
                records = summary.records_emitted,
                "watch finished"
            );
            Ok(())
        }
        Err(Error::IdentitiesExhausted) => {
            tracing::error!("all identities failed; manual intervention required");
            std::process::exit(EXIT_NO_IDENTITIES);
        }
        Err(err) => Err(err.into()),
    }
}

async fn login_command(config: Config, account: Option<String>, fresh: bool) -> Result<()> {
    let identities = Arc::new(IdentityPool::new(
        config.credentials(),
        config.cooldown_policy(),
    ));

    let state_store = StateStore::new(&config.state.dir);
    if !fresh {
        let saved = state_store.load();
        identities.restore(&saved.identities).await;
    }

    let renderer = HttpRenderer::new(
        &config.watch.list_url,
        &config.watch.login_url,
        config.watch.max_scrolls,
        config.fetch_timeout(),
    )
    .map_err(Error::from)?;

    let targets: Vec<String> = match account {
        Some(name) => vec![name],
        None => config.accounts.iter().map(|a| a.name.clone()).collect(),
    };

    let mut failures = 0;
    for name in &targets {
        match identities.bootstrap(name, &renderer).await {
            Ok(()) => println!("session ready for {name}"),
            Err(err) => {
                eprintln!("login failed for {name}: {err}");
                failures += 1;
            }
        }
    }

    let state = talon::storage::PoolState {
        identities: identities.snapshot().await,
        egress: Vec::new(),
    };
    state_store.save(&state).map_err(Error::from)?;

    if failures > 0 {
        anyhow::bail!("{failures}/{} logins failed", targets.len());
    }
    Ok(())
}

fn status_command(config: Config) -> Result<()> {
    let watermark = WatermarkStore::new(config.state.dir.join("watermark.json"))
        .load()
        .map_err(Error::from)?;
    match watermark {
        Some(mark) => println!("watermark: {mark}"),
        None => println!("watermark: none (first run pending)"),
    }

    let state = StateStore::new(&config.state.dir).load();
    for identity in &state.identities {
        let status = if identity.failed {
            "failed".to_string()
        } else if let Some(until) = identity.cooldown_until {
            format!("cooling until {until}")
        } else {
            "available".to_string()
        };
        println!(
            "identity {:<12} {} (failures: {}, session: {})",
            identity.id,
            status,
            identity.consecutive_failures,
            if identity.session.is_some() { "yes" } else { "no" }
        );
    }
    for path in &state.egress {
        let status = match path.cooldown_until {
            Some(until) => format!("cooling until {until}"),
            None => "available".to_string(),
        };
        println!("egress   {:<12} {}", path.id, status);
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}
