use anyhow::Context;
use clap::Parser;
use kumo_server_common::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use kumo_server_lifecycle::LifeCycle;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

mod http_server;
mod shaping_config;
mod state;

/// The Traffic Shaping Automation daemon.
///
/// Consumes log records published by kumod instances, evaluates the
/// automation rules carried in the shaping configuration, and exposes
/// the resulting suspensions and configuration overrides back to the
/// fleet.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Configuration file to load
    #[arg(long, default_value = "/opt/kumomta/etc/tsa.toml")]
    config: PathBuf,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default = "Config::default_listen")]
    listen: SocketAddr,

    /// The shaping documents holding the automation rules
    #[serde(default)]
    shaping_files: Vec<String>,

    /// Where the daemon state snapshot is kept across restarts
    #[serde(default)]
    state_path: Option<PathBuf>,

    /// How often to re-load the shaping documents
    #[serde(default = "Config::default_shaping_refresh", with = "duration_serde")]
    shaping_refresh_interval: Duration,
}

impl Config {
    fn default_listen() -> SocketAddr {
        ([127, 0, 0, 1], 8008).into()
    }

    fn default_shaping_refresh() -> Duration {
        Duration::from_secs(60)
    }

    fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing config file {}", path.display()))
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move {
            match run(opts).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    eprintln!("{err:#}");
                    std::process::exit(1);
                }
            }
        })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "KUMO_TSA_LOG",
        default_filter: "tsa_daemon=info,kumo_server_common=info",
    }
    .init()?;

    let config = Config::load(&opts.config)?;

    let mut life_cycle = LifeCycle::new();

    if let Some(path) = &config.state_path {
        state::set_state_path(path.clone());
    }
    state::load_state().await.context("loading state")?;

    shaping_config::set_shaping_sources(config.shaping_files.clone());
    shaping_config::load_shaping()
        .await
        .context("loading shaping")?;
    tokio::spawn(shaping_config::shaping_updater_task(
        config.shaping_refresh_interval,
    ));

    tokio::spawn(state::state_pruner());

    kumo_server_common::http_server::spawn_http_listener(
        config.listen,
        http_server::make_router(),
    )
    .await
    .context("starting http listener")?;

    tracing::info!("kumo-tsa-daemon started");

    life_cycle.wait_for_shutdown().await;

    // Take a final snapshot so a restart resumes with the
    // active set intact
    if let Err(err) = state::save_state().await {
        tracing::error!("failed to save state during shutdown: {err:#}");
    }

    tracing::info!("clean shutdown");
    Ok(())
}
