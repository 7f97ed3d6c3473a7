//! The declarative policy configuration for kumod.
//! A policy file is a TOML document describing the spools, the egress
//! sources and pools, per-queue configuration, shaping document list,
//! disposition logging, listeners and the TSA subscription.
use crate::egress_source::{EgressPool, EgressSource};
use crate::logging::LogFileParams;
use crate::queue::QueueConfig;
use anyhow::Context;
use arc_swap::ArcSwap;
use domain_map::DomainMap;
use message::QueueNameComponents;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

#[cfg(feature = "rocksdb")]
use spool::rocks::RocksSpoolParams;

#[derive(Deserialize, Debug, Clone, Default)]
pub enum SpoolKind {
    #[default]
    LocalDisk,
    RocksDB,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SpoolParams {
    pub path: PathBuf,
    #[serde(default)]
    pub kind: SpoolKind,
    /// Sync every write to disk before completing it
    #[serde(default)]
    pub flush: bool,
    #[cfg(feature = "rocksdb")]
    #[serde(default)]
    pub rocks_params: Option<RocksSpoolParams>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TsaParams {
    /// Base urls of the tsa-daemon instances to subscribe to
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenerParams {
    pub listen: SocketAddr,

    /// Parse received messages as out-of-band DSN reports and log them
    #[serde(default)]
    pub log_oob: bool,

    /// Parse received messages as ARF feedback reports and log them
    #[serde(default)]
    pub log_arf: bool,

    /// What to do with a successfully parsed report:
    /// discard it, or queue it onward like any other message
    #[serde(default)]
    pub deferred_queue: bool,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 8000).into(),
            log_oob: false,
            log_arf: false,
            deferred_queue: false,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub data_spool: Option<SpoolParams>,
    pub meta_spool: Option<SpoolParams>,

    #[serde(default)]
    pub listener: ListenerParams,

    #[serde(default)]
    pub logging: Option<LogFileParams>,

    /// Shaping documents, merged in order. http(s) urls are permitted;
    /// the TSA-generated overlay is appended automatically when
    /// `tsa.urls` is configured.
    #[serde(default)]
    pub shaping_files: Vec<String>,

    #[serde(default)]
    pub tsa: TsaParams,

    #[serde(default)]
    pub egress_source: Vec<EgressSource>,

    #[serde(default)]
    pub egress_pool: Vec<EgressPool>,

    /// Queue configuration, keyed by queue matcher: "default", a
    /// domain name (wildcards permitted), "tenant@domain", or
    /// "campaign:tenant@domain". The most specific match wins.
    #[serde(default)]
    pub queue: BTreeMap<String, QueueConfig>,

    /// Redis endpoint for cluster-shared throttles
    #[serde(default)]
    pub cluster_coordinator: Option<String>,
}

impl Policy {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        let policy: Policy = toml::from_str(&data)
            .with_context(|| format!("parsing policy file {}", path.display()))?;
        Ok(policy)
    }

    /// Deep validation of the policy: verifies that pools reference
    /// defined sources, that queue configs reference defined pools,
    /// and returns the accumulated problems
    pub fn validate(&self) -> Vec<String> {
        let mut problems = vec![];

        let mut source_names = std::collections::HashSet::new();
        for source in &self.egress_source {
            if !source_names.insert(source.name.clone()) {
                problems.push(format!("duplicate egress_source '{}'", source.name));
            }
        }

        let mut pool_names = std::collections::HashSet::new();
        for pool in &self.egress_pool {
            if !pool_names.insert(pool.name.clone()) {
                problems.push(format!("duplicate egress_pool '{}'", pool.name));
            }
            if pool.entries.is_empty() {
                problems.push(format!("egress_pool '{}' has no entries", pool.name));
            }
            for entry in &pool.entries {
                if !source_names.contains(&entry.name) {
                    problems.push(format!(
                        "egress_pool '{}' references undefined source '{}'",
                        pool.name, entry.name
                    ));
                }
            }
        }

        for (matcher, config) in &self.queue {
            if let Some(pool) = &config.egress_pool {
                if !pool_names.contains(pool) {
                    problems.push(format!(
                        "queue '{matcher}' references undefined egress_pool '{pool}'"
                    ));
                }
            }
        }

        if self.data_spool.is_none() {
            problems.push("no data_spool is defined".to_string());
        }
        if self.meta_spool.is_none() {
            problems.push("no meta_spool is defined".to_string());
        }

        problems
    }
}

/// Resolves queue configuration from the policy's queue table.
/// Lookup preference for a queue named campaign:tenant@domain:
/// the exact "campaign:tenant@domain" entry, then "tenant@domain",
/// then the domain (including wildcard domain matches), then
/// "default".
pub struct QueueConfigResolver {
    exact: BTreeMap<String, QueueConfig>,
    by_domain: DomainMap<QueueConfig>,
    default: QueueConfig,
}

impl QueueConfigResolver {
    pub fn new(policy: &Policy) -> Self {
        let mut exact = BTreeMap::new();
        let mut by_domain = DomainMap::new();
        let mut default = QueueConfig::default();

        for (matcher, config) in &policy.queue {
            if matcher == "default" {
                default = config.clone();
            } else if matcher.contains('@') {
                exact.insert(matcher.to_string(), config.clone());
            } else {
                by_domain.insert(matcher, config.clone());
            }
        }

        Self {
            exact,
            by_domain,
            default,
        }
    }

    pub fn resolve(&self, queue_name: &str) -> QueueConfig {
        let components = QueueNameComponents::parse(queue_name);

        if components.campaign.is_some() || components.tenant.is_some() {
            let full = QueueNameComponents::format(
                components.campaign,
                components.tenant,
                components.domain,
                None::<&str>,
            );
            if let Some(config) = self.exact.get(&full) {
                return config.clone();
            }
            if components.campaign.is_some() {
                let tenant_only = QueueNameComponents::format(
                    None::<&str>,
                    components.tenant,
                    components.domain,
                    None::<&str>,
                );
                if let Some(config) = self.exact.get(&tenant_only) {
                    return config.clone();
                }
            }
        }

        if let Some(config) = self.by_domain.get(components.domain) {
            return config.clone();
        }

        self.default.clone()
    }
}

/// The installed policy: the queue config resolver plus the source
/// and pool catalogs, swapped atomically on reload so that readers
/// always see a consistent snapshot
struct InstalledPolicy {
    resolver: QueueConfigResolver,
    sources: HashMap<String, EgressSource>,
    pools: HashMap<String, EgressPool>,
}

static INSTALLED: LazyLock<ArcSwap<InstalledPolicy>> = LazyLock::new(|| {
    ArcSwap::from_pointee(InstalledPolicy {
        resolver: QueueConfigResolver::new(&Policy::default()),
        sources: HashMap::new(),
        pools: HashMap::new(),
    })
});

/// Make the supplied policy the active one
pub fn install_policy(policy: &Policy) {
    let mut sources = HashMap::new();
    for source in &policy.egress_source {
        sources.insert(source.name.clone(), source.clone());
    }
    let mut pools = HashMap::new();
    for pool in &policy.egress_pool {
        pools.insert(pool.name.clone(), pool.clone());
    }
    INSTALLED.store(Arc::new(InstalledPolicy {
        resolver: QueueConfigResolver::new(policy),
        sources,
        pools,
    }));
}

/// Resolve the configuration for the named scheduled queue
pub fn get_queue_config(queue_name: &str) -> QueueConfig {
    INSTALLED.load().resolver.resolve(queue_name)
}

pub fn get_egress_source(name: &str) -> anyhow::Result<EgressSource> {
    if name == "unspecified" {
        return Ok(EgressSource::unspecified());
    }
    INSTALLED
        .load()
        .sources
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("egress_source '{name}' is not defined"))
}

pub fn get_egress_pool(name: Option<&str>) -> anyhow::Result<EgressPool> {
    let Some(name) = name else {
        return Ok(EgressPool::unspecified());
    };
    INSTALLED
        .load()
        .pools
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("egress_pool '{name}' is not defined"))
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy_from(text: &str) -> Policy {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn queue_resolution_preference() {
        let policy = policy_from(
            r#"
[queue.default]
retry_interval = "1 minute"

[queue."example.com"]
retry_interval = "2 minutes"

[queue."*.example.com"]
retry_interval = "3 minutes"

[queue."tenant@example.com"]
retry_interval = "4 minutes"

[queue."campaign:tenant@example.com"]
retry_interval = "5 minutes"
"#,
        );
        let resolver = QueueConfigResolver::new(&policy);

        let minutes =
            |name: &str| resolver.resolve(name).retry_interval.as_secs() / 60;

        assert_eq!(minutes("other.com"), 1);
        assert_eq!(minutes("example.com"), 2);
        assert_eq!(minutes("mail.example.com"), 3);
        assert_eq!(minutes("tenant@example.com"), 4);
        assert_eq!(minutes("othertenant@example.com"), 2);
        assert_eq!(minutes("campaign:tenant@example.com"), 5);
        assert_eq!(minutes("other:tenant@example.com"), 4);
    }

    #[test]
    fn validation_reports_dangling_references() {
        let policy = policy_from(
            r#"
[[egress_source]]
name = "ip-1"

[[egress_pool]]
name = "pool0"
entries = [{name="ip-1"}, {name="nope"}]

[queue."example.com"]
egress_pool = "ghost"
"#,
        );
        let problems = policy.validate();
        assert!(problems.iter().any(|p| p.contains("undefined source 'nope'")));
        assert!(problems
            .iter()
            .any(|p| p.contains("undefined egress_pool 'ghost'")));
        assert!(problems.iter().any(|p| p.contains("no data_spool")));
    }
}
