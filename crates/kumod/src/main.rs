use anyhow::Context;
use clap::Parser;
use kumo_api_types::shaping::{CheckLevel, ShapingMergeOptions};
use kumo_server_common::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use kumo_server_lifecycle::LifeCycle;
use std::path::PathBuf;
use std::sync::OnceLock;

mod delivery_metrics;
mod egress_source;
mod http_server;
mod logging;
mod policy;
mod queue;
mod ready_queue;
mod report_ingest;
mod shaping;
mod smtp_dispatcher;
mod spool;
mod suspend;
mod tsa_publisher;
mod tsa_subscriber;

#[cfg(test)]
mod test_support;

use crate::policy::Policy;
use crate::spool::SpoolManager;

/// The outbound Mail Transfer Agent daemon: accepts messages,
/// routes them through the scheduled and ready queue tiers, and
/// dispatches them under the configured shaping constraints.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Policy file to load
    #[arg(long, default_value = "/opt/kumomta/etc/policy.toml")]
    policy: PathBuf,

    /// Deeply validate the policy, shaping, source and queue
    /// configuration, then exit. The exit code is 0 when the
    /// configuration is valid, 2 otherwise.
    #[arg(long)]
    validate: bool,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption; json outputs machine
    /// readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

static POLICY_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Re-read and re-install the policy; used by the reload endpoint.
/// Any error leaves the previous policy installed.
pub fn reload_policy() -> anyhow::Result<()> {
    let path = POLICY_PATH
        .get()
        .ok_or_else(|| anyhow::anyhow!("policy path is not initialized"))?;
    let policy = Policy::load(path)?;
    let problems = policy.validate();
    if !problems.is_empty() {
        anyhow::bail!("policy has problems: {}", problems.join("; "));
    }
    policy::install_policy(&policy);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    register_panic_hook();

    // The number of runtime worker threads matches the CPU count
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move {
            if opts.validate {
                match validate(&opts).await {
                    Ok(true) => std::process::exit(0),
                    Ok(false) => std::process::exit(2),
                    Err(err) => {
                        eprintln!("{err:#}");
                        std::process::exit(2);
                    }
                }
            }
            match run(opts).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    eprintln!("{err:#}");
                    std::process::exit(1);
                }
            }
        })
}

async fn validate(opts: &Opt) -> anyhow::Result<bool> {
    let policy = Policy::load(&opts.policy)?;
    let mut problems = policy.validate();

    policy::install_policy(&policy);
    shaping::set_shaping_sources(policy.shaping_files.clone(), &policy.tsa.urls);

    // Elevate the shaping checks for validation mode.
    // Remote sources (such as the TSA overlay) are skipped: their
    // availability is an operational rather than configuration
    // concern.
    let options = ShapingMergeOptions {
        dns_fail: CheckLevel::Warn,
        null_mx: CheckLevel::Error,
        aliased_site: CheckLevel::Warn,
        skip_remote: true,
        local_load: CheckLevel::Error,
        ..ShapingMergeOptions::default()
    };

    match shaping::load_shaping(&options).await {
        Ok(shaping) => {
            for warning in shaping.get_warnings() {
                eprintln!("WARNING: {warning}");
            }
            for error in shaping.get_errors() {
                problems.push(format!("shaping: {error}"));
            }

            // Per-source blocks referencing sources that are not in
            // the source catalog are suspicious
            let known: std::collections::HashSet<String> = policy
                .egress_source
                .iter()
                .map(|source| source.name.clone())
                .collect();
            for (source, referenced_by) in shaping.get_referenced_sources() {
                if !known.contains(&source) {
                    problems.push(format!(
                        "shaping references source '{source}' (via {}) which is \
                         not defined in the policy",
                        referenced_by.join(", ")
                    ));
                }
            }
        }
        Err(err) => {
            problems.push(format!("shaping failed to load: {err:#}"));
        }
    }

    for problem in &problems {
        eprintln!("ERROR: {problem}");
    }
    Ok(problems.is_empty())
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "KUMOD_LOG",
        default_filter: "kumod=info,kumo_server_common=info",
    }
    .init()?;

    let policy = Policy::load(&opts.policy)?;
    let problems = policy.validate();
    if !problems.is_empty() {
        anyhow::bail!("policy has problems: {}", problems.join("; "));
    }
    POLICY_PATH.set(opts.policy.clone()).ok();

    let mut life_cycle = LifeCycle::new();

    policy::install_policy(&policy);

    if let Some(url) = &policy.cluster_coordinator {
        let conn = throttle::RedisConnection::connect(url)
            .await
            .with_context(|| format!("connecting to cluster coordinator {url}"))?;
        throttle::use_redis(conn).context("configuring shared throttles")?;
    }

    if let Some(params) = policy.logging.clone() {
        logging::Logger::init(params).context("initializing disposition logger")?;
    }

    // Startup ordering: spool first, then configuration-derived
    // state, then the subscription and listeners
    SpoolManager::define_spools(&policy).context("defining spools")?;

    shaping::set_shaping_sources(policy.shaping_files.clone(), &policy.tsa.urls);
    shaping::load_shaping(&ShapingMergeOptions::default())
        .await
        .context("loading shaping")?;
    tokio::spawn(shaping::shaping_updater_task(std::time::Duration::from_secs(
        60,
    )));

    tsa_publisher::init(&policy.tsa.urls);
    tsa_subscriber::start_subscribers(&policy.tsa.urls);

    tokio::spawn(queue::maintainer::queue_config_maintainer());

    // Reconstitute the queues from the spool before accepting
    // new work
    SpoolManager::start_spool().await.context("starting spool")?;

    http_server::start(&policy.listener)
        .await
        .context("starting http listener")?;

    tracing::info!("kumod started");

    life_cycle.wait_for_shutdown().await;

    // All activities have concluded; flush the disposition log and
    // close the spool last
    logging::Logger::signal_shutdown().await;
    SpoolManager::shutdown().await?;

    tracing::info!("clean shutdown");
    Ok(())
}

fn register_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let payload = payload.downcast_ref::<&str>().unwrap_or(&"!?");
        if let Some(loc) = info.location() {
            tracing::error!(
                "panic at {}:{}:{} - {}",
                loc.file(),
                loc.line(),
                loc.column(),
                payload,
            );
        } else {
            tracing::error!("panic - {}", payload);
        }

        default_hook(info);
    }));
}
