//! The daemon's working state: per-rule event histories for the
//! threshold triggers, and the active configuration overrides,
//! suspensions and bounce directives produced by triggered rules.
//! The state is periodically snapshotted with rmp-serde so that a
//! daemon restart resumes with the active set intact.
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kumo_api_types::shaping::{Action, EgressPathConfigValue, EgressPathConfigValueUnchecked, Rule};
use kumo_api_types::tsa::{ReadyQSuspension, SchedQBounce, SchedQSuspension};
use kumo_log_types::JsonLogRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

pub static TSA_STATE: OnceLock<TsaState> = OnceLock::new();
static STATE_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn set_state_path(path: PathBuf) {
    STATE_PATH.lock().unwrap().replace(path);
}

fn state_path() -> Option<PathBuf> {
    STATE_PATH.lock().unwrap().clone()
}

/// A helper for computing a sha256 hash of a rust struct via the
/// derived Hash trait
pub struct Sha256Hasher {
    h: Option<Sha256>,
}

impl Sha256Hasher {
    pub fn new() -> Self {
        Self {
            h: Some(Sha256::new()),
        }
    }

    fn get_binary(mut self) -> [u8; 32] {
        self.h.take().expect("finalized once").finalize().into()
    }
}

impl std::hash::Hasher for Sha256Hasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Some(h) = self.h.as_mut() {
            h.update(bytes)
        }
    }
}

/// Identifies a rule definition: the stable hash of its matcher tuple.
/// Identical rules loaded from different documents hash identically,
/// which is what de-duplicates their effects.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleHash(#[serde(with = "hex_bytes")] [u8; 32]);

impl RuleHash {
    pub fn from_rule(rule: &Rule) -> Self {
        let mut hasher = Sha256Hasher::new();
        rule.hash(&mut hasher);
        Self(hasher.get_binary())
    }
}

impl std::fmt::Display for RuleHash {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        hex::encode(self.0).fmt(fmt)
    }
}

impl std::fmt::Debug for RuleHash {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_tuple("RuleHash").field(&hex::encode(self.0)).finish()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&text, &mut bytes)
            .map_err(|err| serde::de::Error::custom(format!("invalid hash {text}: {err}")))?;
        Ok(bytes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteKey(String);

impl SiteKey {
    /// record.site identifies the egress path as `source->site_name`;
    /// effects are keyed by the mx site_name portion
    pub fn from_record(record: &JsonLogRecord) -> Self {
        let source = record.egress_source.as_deref().unwrap_or("unspecified");
        let site = record
            .site
            .strip_prefix(&format!("{source}->"))
            .unwrap_or(&record.site);
        Self(site.to_string())
    }
}

impl std::fmt::Display for SiteKey {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Identifies a (rule, action, site) effect for de-duplication:
/// a re-triggered identical effect replaces (extends) the prior one
/// rather than stacking
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionHash(#[serde(with = "hex_bytes")] [u8; 32], SiteKey);

impl std::fmt::Display for ActionHash {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}-{}", self.1 .0, hex::encode(self.0))
    }
}

impl std::fmt::Debug for ActionHash {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_tuple("ActionHash")
            .field(&hex::encode(self.0))
            .field(&self.1)
            .finish()
    }
}

impl ActionHash {
    pub fn from_rule_and_record(rule: &Rule, action: &Action, record: &JsonLogRecord) -> Self {
        let mut hasher = Sha256Hasher::new();
        rule.hash(&mut hasher);
        action.hash(&mut hasher);
        Self(hasher.get_binary(), SiteKey::from_record(record))
    }

    pub fn hash_portion(&self) -> String {
        hex::encode(self.0)
    }

    pub fn site_name(&self) -> &str {
        &self.1 .0
    }
}

/// The scope over which threshold events accumulate: a rule applied
/// to a site
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchingScope(RuleHash, SiteKey);

impl MatchingScope {
    pub fn from_rule_and_record(rule: &Rule, record: &JsonLogRecord) -> Self {
        Self(RuleHash::from_rule(rule), SiteKey::from_record(record))
    }
}

type UnixTimeStamp = i64;

fn to_unix_ts(dt: &DateTime<Utc>) -> UnixTimeStamp {
    dt.signed_duration_since(DateTime::<Utc>::UNIX_EPOCH)
        .num_seconds()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct EventData {
    /// The accumulation window, used to decide how to prune
    duration: i64,
    series: Vec<UnixTimeStamp>,
}

impl EventData {
    fn insert_and_count(&mut self, record: &JsonLogRecord) -> usize {
        let ts = to_unix_ts(&record.timestamp);
        let idx = match self.series.binary_search(&ts) {
            Ok(idx) | Err(idx) => idx,
        };

        self.series.insert(idx, ts);
        let now = Utc::now();
        let now_ts = to_unix_ts(&now);
        let report_thresh = now_ts - self.duration;
        let oldest_permitted = report_thresh - 300;

        self.series.retain(|&ts| ts > oldest_permitted);
        self.series
            .iter()
            .filter(|&&ts| ts >= report_thresh)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationOverride {
    pub domain: String,
    pub mx_rollup: bool,
    pub source: String,
    pub reason: String,
    /// Stored unchecked to accommodate version skew where a peer
    /// might not know about a value yet
    pub option: EgressPathConfigValueUnchecked,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub struct SchedQBounceKey {
    pub action_hash: ActionHash,
    pub domain: String,
    pub tenant: Option<String>,
    pub campaign: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedQBounceEntry {
    pub reason: String,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyQSuspensionEntry {
    pub reason: String,
    pub source: String,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub struct SchedQSuspensionKey {
    pub action_hash: ActionHash,
    pub domain: String,
    pub tenant: String,
    pub campaign: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedQSuspensionEntry {
    pub reason: String,
    pub expires: DateTime<Utc>,
}

#[derive(Default)]
pub struct TsaState {
    event_history: DashMap<MatchingScope, EventData>,
    config_overrides: DashMap<ActionHash, ConfigurationOverride>,
    schedq_bounces: DashMap<SchedQBounceKey, SchedQBounceEntry>,
    readyq_suspensions: DashMap<ActionHash, ReadyQSuspensionEntry>,
    schedq_suspensions: DashMap<SchedQSuspensionKey, SchedQSuspensionEntry>,
}

#[derive(Serialize, Deserialize)]
struct SerializableState {
    #[serde(default)]
    event_history: HashMap<MatchingScope, EventData>,
    #[serde(default)]
    config_overrides: HashMap<ActionHash, ConfigurationOverride>,
    #[serde(default)]
    schedq_bounces: HashMap<SchedQBounceKey, SchedQBounceEntry>,
    #[serde(default)]
    readyq_suspensions: HashMap<ActionHash, ReadyQSuspensionEntry>,
    #[serde(default)]
    schedq_suspensions: HashMap<SchedQSuspensionKey, SchedQSuspensionEntry>,
}

impl TsaState {
    /// Record the current event and return the total number of
    /// events within the time window defined by the rule
    pub fn record_event(&self, scope: &MatchingScope, rule: &Rule, record: &JsonLogRecord) -> u64 {
        let mut series = self
            .event_history
            .entry(scope.clone())
            .or_insert_with(|| EventData {
                duration: rule.duration.as_secs() as i64,
                series: vec![],
            });

        series.insert_and_count(record) as u64
    }

    pub fn insert_config_override(&self, scope: ActionHash, over: ConfigurationOverride) {
        if Utc::now() >= over.expires {
            // Skip already expired entry
            return;
        }

        tracing::debug!("new config override {scope:?} = {over:?}");
        self.config_overrides.insert(scope, over);
    }

    pub fn insert_schedq_bounce(&self, key: SchedQBounceKey, bounce: SchedQBounceEntry) {
        if Utc::now() >= bounce.expires {
            return;
        }

        tracing::debug!("new schedq bounce {key:?} = {bounce:?}");
        self.schedq_bounces.insert(key, bounce);
    }

    pub fn insert_readyq_suspension(&self, key: ActionHash, entry: ReadyQSuspensionEntry) {
        if Utc::now() >= entry.expires {
            return;
        }

        tracing::debug!("new readyq suspension {key:?} = {entry:?}");
        self.readyq_suspensions.insert(key, entry);
    }

    pub fn insert_schedq_suspension(&self, key: SchedQSuspensionKey, entry: SchedQSuspensionEntry) {
        if Utc::now() >= entry.expires {
            return;
        }

        tracing::debug!("new schedq suspension {key:?} = {entry:?}");
        self.schedq_suspensions.insert(key, entry);
    }

    pub fn export_readyq_suspensions(&self) -> Vec<ReadyQSuspension> {
        let mut entries = vec![];
        let now = Utc::now();
        for entry in self.readyq_suspensions.iter() {
            let value = entry.value();
            if now >= value.expires {
                continue;
            }
            let key = entry.key();
            entries.push(ReadyQSuspension {
                rule_hash: key.hash_portion(),
                site_name: key.site_name().to_string(),
                source: value.source.clone(),
                reason: value.reason.clone(),
                expires: value.expires,
            });
        }

        entries.sort_by_key(|over| (over.expires, over.source.clone()));

        entries
    }

    pub fn export_schedq_suspensions(&self) -> Vec<SchedQSuspension> {
        let mut entries = vec![];
        let now = Utc::now();
        for entry in self.schedq_suspensions.iter() {
            let value = entry.value();
            if now >= value.expires {
                continue;
            }
            let key = entry.key();
            entries.push(SchedQSuspension {
                rule_hash: key.action_hash.to_string(),
                domain: key.domain.clone(),
                campaign: key.campaign.clone(),
                tenant: key.tenant.clone(),
                reason: value.reason.clone(),
                expires: value.expires,
            });
        }

        entries.sort_by_key(|over| {
            (
                over.expires,
                over.tenant.clone(),
                over.domain.clone(),
                over.campaign.clone(),
            )
        });

        entries
    }

    pub fn export_schedq_bounces(&self) -> Vec<SchedQBounce> {
        let mut entries = vec![];
        let now = Utc::now();
        for entry in self.schedq_bounces.iter() {
            let value = entry.value();
            if now >= value.expires {
                continue;
            }
            let key = entry.key();
            entries.push(SchedQBounce {
                rule_hash: key.action_hash.to_string(),
                domain: key.domain.clone(),
                tenant: key.tenant.clone(),
                campaign: key.campaign.clone(),
                reason: value.reason.clone(),
                expires: value.expires,
            });
        }

        entries.sort_by_key(|over| {
            (
                over.expires,
                over.tenant.clone(),
                over.domain.clone(),
                over.campaign.clone(),
            )
        });

        entries
    }

    /// Render the active configuration overrides as the generated
    /// shaping overlay document
    pub fn export_config_override_toml(&self) -> String {
        use toml_edit::{value, Item};
        let mut doc = toml_edit::DocumentMut::new();
        let now = Utc::now();

        let mut entries = vec![];
        for entry in self.config_overrides.iter() {
            let over = entry.value();
            if now >= over.expires {
                continue;
            }
            entries.push(over.clone());
        }

        entries.sort_by_key(|over| {
            (
                over.expires,
                over.domain.clone(),
                over.source.clone(),
                over.option.name.clone(),
            )
        });
        let num_entries = entries.len();

        for over in entries {
            let Some(domain_entry) = doc
                .entry(&over.domain)
                .or_insert_with(|| {
                    let mut tbl = toml_edit::Table::new();
                    tbl["mx_rollup"] = value(over.mx_rollup);
                    Item::Table(tbl)
                })
                .as_table_mut()
            else {
                continue;
            };
            let Some(sources) = domain_entry
                .entry("sources")
                .or_insert_with(|| Item::Table(toml_edit::Table::new()))
                .as_table_mut()
            else {
                continue;
            };
            let Some(source_entry) = sources
                .entry(&over.source)
                .or_insert_with(|| Item::Table(toml_edit::Table::new()))
                .as_table_mut()
            else {
                continue;
            };

            match toml_to_toml_edit_value(over.option.value.clone()) {
                Ok(item) => {
                    source_entry.insert(&over.option.name, Item::Value(item));
                    if let Some(mut key) = source_entry.key_mut(&over.option.name) {
                        key.leaf_decor_mut().set_prefix(format!(
                            "# reason: {}\n# expires: {}\n",
                            over.reason,
                            over.expires.to_rfc3339()
                        ));
                    }
                }
                Err(err) => {
                    tracing::error!(
                        "cannot render config override {}: {err:#}",
                        over.option.name
                    );
                }
            }
        }

        format!("# Generated by tsa-daemon\n# Number of entries: {num_entries}\n\n{doc}")
    }

    fn serializable(&self) -> SerializableState {
        fn collect<K, V>(map: &DashMap<K, V>) -> HashMap<K, V>
        where
            K: Clone + Eq + Hash,
            V: Clone,
        {
            map.iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect()
        }

        SerializableState {
            event_history: collect(&self.event_history),
            config_overrides: collect(&self.config_overrides),
            schedq_bounces: collect(&self.schedq_bounces),
            readyq_suspensions: collect(&self.readyq_suspensions),
            schedq_suspensions: collect(&self.schedq_suspensions),
        }
    }

    /// Drop entries that have expired, or whose event series has
    /// aged out of its window
    pub fn prune(&self) {
        let now = Utc::now();
        let now_ts = to_unix_ts(&now);

        self.event_history.retain(|_scope, event_data| {
            event_data
                .series
                .last()
                .map(|&last_ts| last_ts >= now_ts - event_data.duration - 300)
                .unwrap_or(false)
        });
        self.config_overrides.retain(|_k, over| over.expires > now);
        self.schedq_bounces.retain(|_k, entry| entry.expires > now);
        self.readyq_suspensions
            .retain(|_k, entry| entry.expires > now);
        self.schedq_suspensions
            .retain(|_k, entry| entry.expires > now);
    }
}

pub fn toml_to_toml_edit_value(value: toml::Value) -> anyhow::Result<toml_edit::Value> {
    use toml_edit::Formatted;
    Ok(match value {
        toml::Value::Boolean(b) => toml_edit::Value::Boolean(Formatted::new(b)),
        toml::Value::String(s) => toml_edit::Value::String(Formatted::new(s)),
        toml::Value::Integer(i) => toml_edit::Value::Integer(Formatted::new(i)),
        toml::Value::Float(f) => toml_edit::Value::Float(Formatted::new(f)),
        toml::Value::Array(a) => {
            let mut res = toml_edit::Array::new();
            for item in a {
                res.push(toml_to_toml_edit_value(item)?);
            }
            toml_edit::Value::Array(res)
        }
        toml::Value::Table(t) => {
            let mut tbl = toml_edit::InlineTable::new();
            for (k, v) in t {
                tbl.insert(&k, toml_to_toml_edit_value(v)?);
            }
            toml_edit::Value::InlineTable(tbl)
        }
        toml::Value::Datetime(d) => anyhow::bail!("impossible datetime value {d:?}"),
    })
}

pub async fn load_state() -> anyhow::Result<()> {
    let state = match state_path() {
        None => TsaState::default(),
        Some(path) => match tokio::fs::read(&path).await {
            Ok(data) => {
                let state = TsaState::default();
                match rmp_serde::from_slice::<SerializableState>(&data) {
                    Ok(loaded) => {
                        for (key, value) in loaded.event_history {
                            state.event_history.insert(key, value);
                        }
                        for (key, value) in loaded.config_overrides {
                            state.config_overrides.insert(key, value);
                        }
                        for (key, value) in loaded.schedq_bounces {
                            state.schedq_bounces.insert(key, value);
                        }
                        for (key, value) in loaded.readyq_suspensions {
                            state.readyq_suspensions.insert(key, value);
                        }
                        for (key, value) in loaded.schedq_suspensions {
                            state.schedq_suspensions.insert(key, value);
                        }
                        state.prune();

                        tracing::info!(
                            "Loaded {} of state data from {}",
                            humansize::format_size(data.len(), humansize::DECIMAL),
                            path.display()
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            "Failed to deserialize {}: {err:#}, proceeding with fresh state",
                            path.display()
                        );
                    }
                }
                state
            }
            Err(err) => {
                tracing::warn!(
                    "Failed to load state from {}, proceeding with fresh state. \
                     Error was: {err:#}",
                    path.display()
                );
                TsaState::default()
            }
        },
    };

    TSA_STATE.set(state).ok();
    Ok(())
}

/// Snapshot the state, atomically replacing the prior snapshot via
/// write-rename
pub async fn save_state() -> anyhow::Result<()> {
    let Some(path) = state_path() else {
        return Ok(());
    };
    let start = Instant::now();
    let state = TSA_STATE
        .get()
        .ok_or_else(|| anyhow::anyhow!("state not initialized"))?
        .serializable();

    let data = rmp_serde::to_vec_named(&state).context("failed to serialize state")?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("failed to write to {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("failed to rename into {}", path.display()))?;

    tracing::debug!(
        "stored {} of state data to {} in {:?}",
        humansize::format_size(data.len(), humansize::DECIMAL),
        path.display(),
        start.elapsed()
    );

    Ok(())
}

pub async fn state_pruner() {
    let mut last_save = Instant::now();

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        if let Some(state) = TSA_STATE.get() {
            state.prune();
        }

        if last_save.elapsed() > std::time::Duration::from_secs(300) {
            if let Err(err) = save_state().await {
                tracing::error!("{err:#} saving state file");
            }
            last_save = Instant::now();
        }
    }
}
