use crate::egress_path::EgressPathConfig;
use anyhow::Context;
use dns_resolver::MailExchanger;
use kumo_log_types::JsonLogRecord;
use ordermap::OrderMap;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use throttle::{LimitSpec, ThrottleSpec};

/// The option names whose values are maps of name->limit that
/// accumulate across shaping layers, rather than replacing.
/// They exist to express limits that are shared beyond a single
/// egress path, so later layers add entries instead of clobbering
/// the whole map.
const UNION_MERGED_OPTIONS: &[&str] = &[
    "additional_connection_limits",
    "additional_message_rate_throttles",
];

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(try_from = "String", into = "String")]
pub struct Regex(fancy_regex::Regex);

impl TryFrom<String> for Regex {
    type Error = fancy_regex::Error;

    fn try_from(s: String) -> fancy_regex::Result<Self> {
        Ok(Self(fancy_regex::Regex::new(&s)?))
    }
}

impl From<Regex> for String {
    fn from(r: Regex) -> String {
        r.0.as_str().to_string()
    }
}

impl std::ops::Deref for Regex {
    type Target = fancy_regex::Regex;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for Regex {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.as_str().fmt(fmt)
    }
}

impl Hash for Regex {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.0.as_str().hash(hasher)
    }
}

/// A single shaping option value. toml::Value is not itself Hash
/// (floats spoil it), and rule identity hashing needs the values to
/// participate, so the wrapper hashes the canonical JSON rendering
/// of the value instead of its structure.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(transparent)]
pub struct OptionValue(toml::Value);

impl From<toml::Value> for OptionValue {
    fn from(value: toml::Value) -> Self {
        Self(value)
    }
}

impl From<OptionValue> for toml::Value {
    fn from(value: OptionValue) -> toml::Value {
        value.0
    }
}

impl std::ops::Deref for OptionValue {
    type Target = toml::Value;
    fn deref(&self) -> &toml::Value {
        &self.0
    }
}

impl Hash for OptionValue {
    fn hash<H: Hasher>(&self, h: &mut H) {
        match serde_json::to_string(&self.0) {
            Ok(text) => text.hash(h),
            Err(_) => "<unrepresentable>".hash(h),
        }
    }
}

/// An ordered accumulation of shaping options, keyed by option name.
/// This is the unit that layering operates on: each block contributes
/// one of these, and resolution folds them together in scope order.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSet {
    options: OrderMap<String, toml::Value>,
}

impl OptionSet {
    fn union_merged(name: &str) -> bool {
        UNION_MERGED_OPTIONS.contains(&name)
    }

    /// Record an option. For the union-merged map options the
    /// individual entries are added to whatever is already present;
    /// any other option replaces its prior value.
    pub fn set(&mut self, name: &str, value: toml::Value) {
        if Self::union_merged(name) {
            if let (Some(toml::Value::Table(current)), toml::Value::Table(additions)) =
                (self.options.get_mut(name), &value)
            {
                for (entry, limit) in additions {
                    current.insert(entry.clone(), limit.clone());
                }
                return;
            }
        }
        self.options.insert(name.to_string(), value);
    }

    /// Fold every option from `layer` into self, option by option
    pub fn absorb(&mut self, layer: &OptionSet) {
        for (name, value) in &layer.options {
            self.set(name, value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    fn as_table(&self) -> toml::Table {
        self.options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Interpret the accumulated options as an egress path config.
    /// This is also how option names and value types are validated:
    /// anything the config struct does not accept is a load error.
    pub fn build(&self) -> anyhow::Result<EgressPathConfig> {
        EgressPathConfig::deserialize(toml::Value::Table(self.as_table()))
            .map_err(anyhow::Error::from)
    }
}

/// An individual egress path option name and value, as used by the
/// SetConfig automation action. Deserialization proves that the
/// name/value pair is meaningful before it is accepted.
#[derive(Deserialize, Serialize, Debug, Clone, Hash)]
#[serde(
    try_from = "EgressPathConfigValueUnchecked",
    into = "EgressPathConfigValueUnchecked"
)]
pub struct EgressPathConfigValue {
    pub name: String,
    pub value: OptionValue,
}

/// The unvalidated wire shape of EgressPathConfigValue. It exists so
/// that peers can store and forward options they do not themselves
/// understand (version skew); conversion to the checked form is where
/// validity is established.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EgressPathConfigValueUnchecked {
    pub name: String,
    pub value: toml::Value,
}

impl TryFrom<EgressPathConfigValueUnchecked> for EgressPathConfigValue {
    type Error = anyhow::Error;
    fn try_from(unchecked: EgressPathConfigValueUnchecked) -> anyhow::Result<Self> {
        let mut probe = OptionSet::default();
        probe.set(&unchecked.name, unchecked.value.clone());
        probe
            .build()
            .with_context(|| format!("option '{}' is not valid", unchecked.name))?;
        Ok(Self {
            name: unchecked.name,
            value: unchecked.value.into(),
        })
    }
}

impl From<EgressPathConfigValue> for EgressPathConfigValueUnchecked {
    fn from(checked: EgressPathConfigValue) -> Self {
        Self {
            name: checked.name,
            value: checked.value.into(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Hash)]
pub enum Action {
    /// Suspend the (source, site_name) ready queue
    Suspend,
    /// Suspend all scheduled queues for the tenant of the
    /// triggering record
    SuspendTenant,
    /// Suspend the (campaign, tenant) scheduled queues
    SuspendCampaign,
    /// Produce a shaping override for an individual option
    SetConfig(EgressPathConfigValue),
    /// Bounce the matching scheduled queue contents
    Bounce,
}

#[derive(Deserialize, Serialize, Debug, Clone, Hash, Default)]
pub enum Trigger {
    /// Trigger on the first match, immediately
    #[default]
    Immediate,
    /// Trigger when a certain number of matches occur
    /// over a certain time period.
    Threshold(ThrottleSpec),
}

/// Accepts either a single element or an array of elements; both
/// `regex = "foo"` and `regex = ["foo", "bar"]` are valid documents
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[derive(Deserialize, Serialize, Debug, Hash, Clone)]
pub struct Rule {
    #[serde(deserialize_with = "one_or_many")]
    pub regex: Vec<Regex>,

    #[serde(deserialize_with = "one_or_many")]
    pub action: Vec<Action>,

    #[serde(default)]
    pub trigger: Trigger,

    #[serde(with = "duration_serde")]
    pub duration: Duration,

    #[serde(skip)]
    pub was_rollup: bool,

    /// if true, this rule can match internally generated Response
    /// messages, otherwise, the rule will skip testing against those
    #[serde(default)]
    pub match_internal: bool,
}

impl Rule {
    pub fn matches(&self, is_internal: bool, response: &str) -> bool {
        if is_internal && !self.match_internal {
            return false;
        }
        self.regex
            .iter()
            .any(|r| r.is_match(response).unwrap_or(false))
    }
}

/// One site/domain/default block from a shaping document: its
/// accumulated options, per-source option sets, and automation rules
#[derive(Debug, Clone, Serialize)]
pub struct ShapingBlock {
    #[serde(skip)]
    label: String,
    mx_rollup: bool,
    #[serde(skip)]
    replace_base: bool,
    options: OptionSet,
    per_source: OrderMap<String, OptionSet>,
    automation: Vec<Rule>,
}

impl ShapingBlock {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            mx_rollup: true,
            replace_base: false,
            options: OptionSet::default(),
            per_source: OrderMap::new(),
            automation: vec![],
        }
    }

    /// Interpret one block table. The structural keys (mx_rollup,
    /// replace_base, automation, sources) steer the block itself;
    /// everything else is an egress path option.
    fn from_table(label: &str, table: toml::Table, treat_as_site: &mut bool) -> anyhow::Result<Self> {
        let mut block = Self::new(label);

        for (key, value) in table {
            match key.as_str() {
                "mx_rollup" => {
                    block.mx_rollup = bool::deserialize(value)
                        .with_context(|| format!("{label}: mx_rollup"))?;
                }
                "replace_base" => {
                    block.replace_base = bool::deserialize(value)
                        .with_context(|| format!("{label}: replace_base"))?;
                }
                "automation" => {
                    block.automation = Vec::<Rule>::deserialize(value)
                        .with_context(|| format!("{label}: automation"))?;
                }
                "sources" => {
                    let sources = toml::Table::deserialize(value)
                        .with_context(|| format!("{label}: sources"))?;
                    for (source, sub) in sources {
                        let sub = toml::Table::deserialize(sub)
                            .with_context(|| format!("{label}: sources.{source}"))?;
                        let mut set = OptionSet::default();
                        for (name, value) in sub {
                            set.set(&name, value);
                        }
                        block.per_source.insert(source, set);
                    }
                }
                "_treat_domain_name_as_site_name" => {
                    // Testing aid: take the block label as the site
                    // name verbatim, without consulting DNS
                    *treat_as_site = bool::deserialize(value)
                        .with_context(|| format!("{label}: _treat_domain_name_as_site_name"))?;
                }
                _ => {
                    block.options.set(&key, value);
                }
            }
        }

        Ok(block)
    }

    /// Layer a later document's block over this one.
    /// replace_base discards what has accumulated so far and starts
    /// over from the incoming block.
    fn merge(&mut self, incoming: Self) {
        if incoming.replace_base {
            self.options = incoming.options;
            self.per_source = incoming.per_source;
            self.automation = incoming.automation;
            return;
        }

        self.options.absorb(&incoming.options);
        for (source, set) in incoming.per_source {
            match self.per_source.get_mut(&source) {
                Some(existing) => existing.absorb(&set),
                None => {
                    self.per_source.insert(source, set);
                }
            }
        }
        self.automation.extend(incoming.automation);
    }

    /// Round-trip every option through the egress path builder to
    /// catch unknown names and bad value types at load time
    fn validate(&self) -> anyhow::Result<()> {
        self.options
            .build()
            .with_context(|| self.label.to_string())?;
        for (source, set) in &self.per_source {
            set.build()
                .with_context(|| format!("{}: sources.{source}", self.label))?;
        }
        Ok(())
    }

    fn matching_rules(&self, is_internal: bool, response: &str, rollup: bool, out: &mut Vec<Rule>) {
        for rule in &self.automation {
            if rule.matches(is_internal, response) {
                let mut hit = rule.clone();
                hit.was_rollup = rollup;
                out.push(hit);
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Hash)]
pub enum ProviderMatch {
    MXSuffix(String),
    DomainSuffix(String),
}

/// Plain byte-suffix match, no globbing. The trailing dot that the
/// resolver leaves on host names is ignored; names are assumed to
/// already be lowercase on both sides.
fn suffix_matches(candidate: &str, suffix: &str) -> bool {
    candidate
        .strip_suffix('.')
        .unwrap_or(candidate)
        .ends_with(suffix)
}

/// A provider block: shaping shared by every destination operated by
/// one mailbox provider, matched by MX or domain suffix
#[derive(Debug, Clone, Serialize)]
pub struct ProviderBlock {
    name: String,
    matchers: Vec<ProviderMatch>,
    /// Connection limit shared across all of the provider's sites
    connection_limit: Option<LimitSpec>,
    /// Message rate shared across all of the provider's sites
    message_rate: Option<ThrottleSpec>,
    block: ShapingBlock,
}

impl ProviderBlock {
    fn from_table(name: &str, mut table: toml::Table) -> anyhow::Result<Self> {
        let label = format!("provider.{name}");

        let matchers = match table.remove("match") {
            Some(value) => Vec::<ProviderMatch>::deserialize(value)
                .with_context(|| format!("{label}: match"))?,
            None => vec![],
        };
        let connection_limit = match table.remove("provider_connection_limit") {
            Some(value) => Some(
                LimitSpec::deserialize(value)
                    .with_context(|| format!("{label}: provider_connection_limit"))?,
            ),
            None => None,
        };
        let message_rate = match table.remove("provider_max_message_rate") {
            Some(value) => Some(
                ThrottleSpec::deserialize(value)
                    .with_context(|| format!("{label}: provider_max_message_rate"))?,
            ),
            None => None,
        };

        let mut unused = false;
        let block = ShapingBlock::from_table(&label, table, &mut unused)?;

        Ok(Self {
            name: name.to_string(),
            matchers,
            connection_limit,
            message_rate,
            block,
        })
    }

    fn merge(&mut self, incoming: Self) {
        if incoming.block.replace_base {
            self.matchers = incoming.matchers;
            self.connection_limit = incoming.connection_limit;
            self.message_rate = incoming.message_rate;
        } else {
            self.matchers.extend(incoming.matchers);
            if incoming.connection_limit.is_some() {
                self.connection_limit = incoming.connection_limit;
            }
            if incoming.message_rate.is_some() {
                self.message_rate = incoming.message_rate;
            }
        }
        self.block.merge(incoming.block);
    }

    /// A provider claims a domain when any domain-suffix matcher
    /// hits, or, failing that, when every host in the domain's MX
    /// set is covered by the MX-suffix matchers. Requiring full MX
    /// coverage avoids lumping in vanity domains that blend
    /// providers.
    async fn matches_domain(&self, domain: &str) -> bool {
        if self.matchers.iter().any(|m| match m {
            ProviderMatch::DomainSuffix(suffix) => suffix_matches(domain, suffix),
            ProviderMatch::MXSuffix(_) => false,
        }) {
            return true;
        }

        let mx_suffixes: Vec<&String> = self
            .matchers
            .iter()
            .filter_map(|m| match m {
                ProviderMatch::MXSuffix(suffix) => Some(suffix),
                ProviderMatch::DomainSuffix(_) => None,
            })
            .collect();
        if mx_suffixes.is_empty() {
            return false;
        }

        match MailExchanger::resolve(domain).await {
            Ok(mx) => mx.hosts.iter().all(|host| {
                mx_suffixes
                    .iter()
                    .any(|suffix| suffix_matches(host, suffix))
            }),
            Err(err) => {
                // An unresolvable name may be legitimately routed via
                // a smart host, so this is only a trace
                tracing::trace!(
                    "Error resolving MX for {domain}: {err:#}. \
                     Provider {} match rules will be ignored",
                    self.name
                );
                false
            }
        }
    }

    /// Thread the provider-scoped limits into the accumulator as
    /// named entries of the union-merged maps, so that every site of
    /// the provider shares one limit per source
    fn stamp_shared_limits(&self, source: &str, acc: &mut OptionSet) {
        acc.set(
            "provider_name",
            toml::Value::String(self.name.to_string()),
        );

        if let Some(limit) = &self.connection_limit {
            let mut entries = toml::Table::new();
            entries.insert(
                format!("shaping-provider-{}-{source}-limit", self.name),
                if limit.force_local {
                    toml::Value::String(limit.to_string())
                } else {
                    toml::Value::Integer(limit.limit as i64)
                },
            );
            acc.set(
                "additional_connection_limits",
                toml::Value::Table(entries),
            );
        }

        if let Some(rate) = &self.message_rate {
            let mut entries = toml::Table::new();
            entries.insert(
                format!("shaping-provider-{}-{source}-rate", self.name),
                toml::Value::String(rate.as_string()),
            );
            acc.set(
                "additional_message_rate_throttles",
                toml::Value::Table(entries),
            );
        }
    }
}

/// One parsed shaping document, prior to merging
#[derive(Default)]
struct ShapingDoc {
    default: Option<ShapingBlock>,
    /// (domain, block, treat-label-as-site-name)
    domains: Vec<(String, ShapingBlock, bool)>,
    providers: Vec<ProviderBlock>,
}

impl ShapingDoc {
    fn from_table(root: toml::Table) -> anyhow::Result<Self> {
        let mut doc = Self::default();

        for (key, value) in root {
            match key.as_str() {
                "default" => {
                    let table = toml::Table::deserialize(value).context("default")?;
                    let mut unused = false;
                    doc.default
                        .replace(ShapingBlock::from_table("default", table, &mut unused)?);
                }
                "provider" => {
                    let providers = toml::Table::deserialize(value).context("provider")?;
                    for (name, sub) in providers {
                        let table = toml::Table::deserialize(sub)
                            .with_context(|| format!("provider.{name}"))?;
                        doc.providers.push(ProviderBlock::from_table(&name, table)?);
                    }
                }
                domain => {
                    let table = toml::Table::deserialize(value)
                        .with_context(|| format!("domain {domain}"))?;
                    let mut treat_as_site = false;
                    let block = ShapingBlock::from_table(domain, table, &mut treat_as_site)?;
                    doc.domains.push((domain.to_string(), block, treat_as_site));
                }
            }
        }

        Ok(doc)
    }
}

#[derive(Default, Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum CheckLevel {
    #[default]
    Ignore,
    Warn,
    Error,
}

impl std::str::FromStr for CheckLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("ignore") {
            Ok(Self::Ignore)
        } else if s.eq_ignore_ascii_case("warn") {
            Ok(Self::Warn)
        } else if s.eq_ignore_ascii_case("error") {
            Ok(Self::Error)
        } else {
            Err(format!(
                "Expected one of `Ignore`, `Warn` or `Error`, got `{s}`"
            ))
        }
    }
}

/// Problems observed while loading; whether a given class of problem
/// is a warning or an error is controlled by ShapingMergeOptions
#[derive(Default)]
struct LoadReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl LoadReport {
    fn note<S: Into<String>>(&mut self, level: CheckLevel, msg: S) {
        match level {
            CheckLevel::Ignore => {}
            CheckLevel::Warn => self.warnings.push(msg.into()),
            CheckLevel::Error => self.errors.push(msg.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShapingMergeOptions {
    #[serde(default)]
    pub dns_fail: CheckLevel,
    #[serde(default)]
    pub null_mx: CheckLevel,
    #[serde(default)]
    pub aliased_site: CheckLevel,
    #[serde(default)]
    pub skip_remote: bool,
    #[serde(default)]
    pub remote_load: CheckLevel,
    #[serde(default)]
    pub local_load: CheckLevel,
    #[serde(default, with = "duration_serde")]
    pub http_timeout: Option<Duration>,
}

impl Default for ShapingMergeOptions {
    fn default() -> Self {
        Self {
            dns_fail: CheckLevel::Ignore,
            null_mx: CheckLevel::Ignore,
            aliased_site: CheckLevel::Ignore,
            skip_remote: false,
            remote_load: CheckLevel::Ignore,
            local_load: CheckLevel::Error,
            http_timeout: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShapingInner {
    by_site: OrderMap<String, ShapingBlock>,
    by_domain: OrderMap<String, ShapingBlock>,
    by_provider: OrderMap<String, ProviderBlock>,
    warnings: Vec<String>,
    errors: Vec<String>,
    hash: String,
}

/// The merged shaping configuration. Cheap to clone; readers hold a
/// consistent snapshot
#[derive(Debug, Default, Clone)]
pub struct Shaping {
    inner: Arc<ShapingInner>,
}

/// The outcome of resolving a (domain, source, site_name) triple:
/// the folded option set, ready to be built into an EgressPathConfig
#[derive(Debug, Default)]
pub struct PathOptions {
    options: OptionSet,
}

impl PathOptions {
    pub fn finish(&self) -> anyhow::Result<EgressPathConfig> {
        self.options.build()
    }
}

impl ShapingInner {
    /// Fold the blocks that apply to (domain, source, site_name), in
    /// the fixed scope order: default, matching providers, provider
    /// source blocks, site, domain (mx_rollup=false only), site
    /// source block, domain source block
    pub async fn resolve_path_options(
        &self,
        domain: &str,
        source: &str,
        site_name: &str,
    ) -> PathOptions {
        let mut acc = OptionSet::default();

        if let Some(default) = self.by_domain.get("default") {
            acc.absorb(&default.options);
        }

        // Provider matching can involve DNS, which only makes sense
        // for plausible domain names
        if dns_resolver::Name::from_str_relaxed(domain).is_ok() {
            let mut matched = vec![];
            for provider in self.by_provider.values() {
                if provider.matches_domain(domain).await {
                    acc.absorb(&provider.block.options);
                    provider.stamp_shared_limits(source, &mut acc);
                    matched.push(provider);
                }
            }
            // All base provider layers land before any provider
            // source layer
            for provider in matched {
                if let Some(per_source) = provider.block.per_source.get(source) {
                    acc.absorb(per_source);
                    provider.stamp_shared_limits(source, &mut acc);
                }
            }
        }

        let site = self.by_site.get(site_name);
        let domain_block = self.by_domain.get(domain);

        if let Some(block) = site {
            acc.absorb(&block.options);
        }
        if let Some(block) = domain_block {
            acc.absorb(&block.options);
        }
        if let Some(per_source) = site.and_then(|block| block.per_source.get(source)) {
            acc.absorb(per_source);
        }
        if let Some(per_source) = domain_block.and_then(|block| block.per_source.get(source)) {
            acc.absorb(per_source);
        }

        PathOptions { options: acc }
    }

    pub async fn match_rules(&self, record: &JsonLogRecord) -> anyhow::Result<Vec<Rule>> {
        let domain = record
            .recipient
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
            .ok_or_else(|| {
                anyhow::anyhow!("record.recipient '{}' has no domain", record.recipient)
            })?;

        // record.site identifies the egress path as
        // `source->site_name`; the shaping blocks are keyed by the
        // site_name portion.
        // NOTE: coupled with ready queue naming.
        let source = record.egress_source.as_deref().unwrap_or("unspecified");
        let site_name = record
            .site
            .strip_prefix(&format!("{source}->"))
            .unwrap_or(&record.site)
            .to_string();

        Ok(self.match_rules_impl(record, &domain, &site_name).await)
    }

    pub async fn match_rules_impl(
        &self,
        record: &JsonLogRecord,
        domain: &str,
        site_name: &str,
    ) -> Vec<Rule> {
        let response = record.response.to_single_line();
        let is_internal = record.response.content.starts_with("Internal: ");
        tracing::trace!("Consider rules for {response}");

        let mut hits = vec![];

        // Scope order mirrors option resolution. Rules found under
        // `default` or a site block carry the rollup flag, since
        // those scopes aggregate all the domains of the site.
        if let Some(default) = self.by_domain.get("default") {
            default.matching_rules(is_internal, &response, true, &mut hits);
        }

        for provider in self.by_provider.values() {
            if provider.matches_domain(domain).await {
                provider
                    .block
                    .matching_rules(is_internal, &response, false, &mut hits);
            }
        }

        if let Some(site) = self.by_site.get(site_name) {
            site.matching_rules(is_internal, &response, true, &mut hits);
        }

        if let Some(block) = self.by_domain.get(domain) {
            block.matching_rules(is_internal, &response, false, &mut hits);
        }

        hits
    }

    fn fingerprint(warnings: &[String], errors: &[String], inner: &Self) -> String {
        let mut ctx = Sha256::new();
        let mut add = |label: &str, json: Result<String, serde_json::Error>| {
            ctx.update(label);
            ctx.update(json.unwrap_or_default());
        };
        add("sites", serde_json::to_string(&inner.by_site));
        add("domains", serde_json::to_string(&inner.by_domain));
        add("providers", serde_json::to_string(&inner.by_provider));
        add("warnings", serde_json::to_string(warnings));
        add("errors", serde_json::to_string(errors));
        hex::encode(ctx.finalize())
    }
}

/// Fetch the raw text of one shaping source. Remote sources are
/// allowed to fail (startup ordering races, a replica being down);
/// the failure is noted and the source contributes nothing this
/// round.
async fn fetch_source(
    path: &str,
    options: &ShapingMergeOptions,
    report: &mut LoadReport,
) -> Option<String> {
    let is_remote = path.starts_with("http://") || path.starts_with("https://");

    if !is_remote {
        return match std::fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(err) => {
                report.note(
                    options.local_load,
                    format!("local shaping source {path} error: {err:#}"),
                );
                None
            }
        };
    }

    if options.skip_remote {
        report.note(
            CheckLevel::Warn,
            format!("Ignoring {path} because skip_remote is set to true"),
        );
        return None;
    }

    let timeout = options.http_timeout.unwrap_or(Duration::from_secs(5));
    let fetch = async {
        reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?
            .get(path)
            .send()
            .await
            .with_context(|| format!("making HTTP request to {path}"))?
            .text()
            .await
            .with_context(|| format!("reading text from {path}"))
    };
    let outcome = match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("timeout making HTTP request to {path}")),
    };
    match outcome {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::error!("{err:#}. Ignoring this shaping source for now");
            report.note(
                options.remote_load,
                format!("remote shaping source {path} error: {err:#}"),
            );
            None
        }
    }
}

/// Parse a source as TOML or JSON, by extension when there is one,
/// trying both otherwise
fn parse_source(path: &str, text: &str) -> anyhow::Result<ShapingDoc> {
    let from_toml =
        |text: &str| -> anyhow::Result<toml::Table> { Ok(toml::from_str(text)?) };
    let from_json =
        |text: &str| -> anyhow::Result<toml::Table> { Ok(serde_json::from_str(text)?) };

    let root = if path.ends_with(".toml") {
        from_toml(text).with_context(|| format!("parsing toml from {path}"))?
    } else if path.ends_with(".json") {
        from_json(text).with_context(|| format!("parsing json from {path}"))?
    } else {
        match from_toml(text) {
            Ok(root) => root,
            Err(toml_err) => from_json(text).map_err(|json_err| {
                anyhow::anyhow!("parsing {path}: as toml: {toml_err:#}, as json: {json_err:#}")
            })?,
        }
    };

    ShapingDoc::from_table(root).with_context(|| format!("interpreting {path}"))
}

fn upsert_block(registry: &mut OrderMap<String, ShapingBlock>, key: &str, block: ShapingBlock) {
    match registry.get_mut(key) {
        Some(existing) => existing.merge(block),
        None => {
            registry.insert(key.to_string(), block);
        }
    }
}

impl Shaping {
    /// Load and merge the shaping documents named by `files`,
    /// in order
    pub async fn merge_files(
        files: &[String],
        options: &ShapingMergeOptions,
    ) -> anyhow::Result<Self> {
        let mut report = LoadReport::default();

        let mut docs = vec![];
        for path in files {
            let Some(text) = fetch_source(path, options, &mut report).await else {
                continue;
            };
            docs.push(parse_source(path, &text)?);
        }

        // Resolve the rollup domains up front, concurrently, so that
        // the merge below can stay strictly ordered
        let mut sites_for_domain = std::collections::HashMap::new();
        {
            let mut lookups = tokio::task::JoinSet::new();
            for doc in &docs {
                for (domain, block, treat_as_site) in &doc.domains {
                    if block.mx_rollup
                        && !*treat_as_site
                        && !sites_for_domain.contains_key(domain)
                    {
                        sites_for_domain
                            .insert(domain.to_string(), Err("unresolved".to_string()));
                        let domain = domain.to_string();
                        lookups.spawn(async move {
                            let result = MailExchanger::resolve(&domain)
                                .await
                                .map_err(|err| format!("{err:#}"));
                            (domain, result)
                        });
                    }
                }
            }
            while let Some(Ok((domain, result))) = lookups.join_next().await {
                sites_for_domain.insert(domain, result);
            }
        }

        let mut inner = ShapingInner::default();
        let mut rollup_aliases: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for doc in docs {
            if let Some(block) = doc.default {
                upsert_block(&mut inner.by_domain, "default", block);
            }

            for (domain, block, treat_as_site) in doc.domains {
                if dns_resolver::fully_qualify(&domain)
                    .map(|name| name.num_labels() == 1)
                    .unwrap_or(false)
                {
                    report.note(
                        CheckLevel::Warn,
                        format!(
                            "Entry for domain '{domain}' consists of a \
                             single DNS label. Domain names in TOML sections \
                             need to be quoted like '[\"{domain}.com\"]` otherwise \
                             the '.' will create a nested table rather than being \
                             added to the domain name."
                        ),
                    );
                }

                if treat_as_site {
                    upsert_block(&mut inner.by_site, &domain, block);
                    continue;
                }

                if !block.mx_rollup {
                    upsert_block(&mut inner.by_domain, &domain, block);
                    continue;
                }

                // Rollup: the block applies to the whole MX site
                let site_name = match sites_for_domain.get(&domain) {
                    Some(Ok(mx)) if mx.is_null_mx || mx.site_name.is_empty() => {
                        report.note(
                            options.null_mx,
                            format!(
                                "domain {domain} has a NULL MX and cannot be used \
                                 with mx_rollup=true. Ignoring the shaping config \
                                 for that domain."
                            ),
                        );
                        continue;
                    }
                    Some(Ok(mx)) => mx.site_name.to_string(),
                    Some(Err(err)) => {
                        report.note(
                            options.dns_fail,
                            format!(
                                "error resolving MX for {domain}: {err}. \
                                 Ignoring the shaping config for that domain."
                            ),
                        );
                        continue;
                    }
                    None => {
                        report.note(
                            options.dns_fail,
                            format!(
                                "We didn't try to resolve the MX for {domain} for \
                                 some reason!?. Ignoring the shaping config for \
                                 that domain."
                            ),
                        );
                        continue;
                    }
                };

                rollup_aliases
                    .entry(site_name.clone())
                    .or_default()
                    .push(domain);
                upsert_block(&mut inner.by_site, &site_name, block);
            }

            for provider in doc.providers {
                match inner.by_provider.get_mut(&provider.name) {
                    Some(existing) => existing.merge(provider),
                    None => {
                        inner.by_provider.insert(provider.name.clone(), provider);
                    }
                }
            }
        }

        // Validate every merged block by round-tripping through the
        // egress path builder
        for block in inner.by_site.values() {
            block.validate().context("site block")?;
        }
        for block in inner.by_domain.values() {
            block.validate().context("domain block")?;
        }
        for provider in inner.by_provider.values() {
            provider
                .block
                .validate()
                .with_context(|| format!("provider {}", provider.name))?;
        }

        if options.aliased_site != CheckLevel::Ignore {
            for (site, domains) in rollup_aliases {
                if domains.len() > 1 {
                    report.note(
                        options.aliased_site,
                        format!(
                            "multiple domain blocks alias to the same site: {site}: {}",
                            domains.join(", ")
                        ),
                    );
                }
            }
        }

        let hash = ShapingInner::fingerprint(&report.warnings, &report.errors, &inner);
        inner.hash = hash;
        inner.warnings = report.warnings;
        inner.errors = report.errors;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn get_egress_path_config(
        &self,
        domain: &str,
        egress_source: &str,
        site_name: &str,
    ) -> PathOptions {
        self.inner
            .resolve_path_options(domain, egress_source, site_name)
            .await
    }

    pub fn get_errors(&self) -> &[String] {
        &self.inner.errors
    }

    pub fn get_warnings(&self) -> &[String] {
        &self.inner.warnings
    }

    pub async fn match_rules(&self, record: &JsonLogRecord) -> anyhow::Result<Vec<Rule>> {
        self.inner.match_rules(record).await
    }

    /// The source names referenced by per-source blocks, mapped to
    /// the blocks that reference them; used to validate the shaping
    /// config against the source catalog
    pub fn get_referenced_sources(&self) -> BTreeMap<String, Vec<String>> {
        let site_refs = self
            .inner
            .by_site
            .iter()
            .flat_map(|(site, block)| {
                block
                    .per_source
                    .keys()
                    .map(move |source| (source.to_string(), format!("site:{site}")))
            });
        let domain_refs = self
            .inner
            .by_domain
            .iter()
            .flat_map(|(domain, block)| {
                block
                    .per_source
                    .keys()
                    .map(move |source| (source.to_string(), format!("domain:{domain}")))
            });

        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source, referenced_by) in site_refs.chain(domain_refs) {
            result.entry(source).or_default().push(referenced_by);
        }
        result
    }

    pub fn hash(&self) -> String {
        self.inner.hash.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kumo_log_types::{RecordType, Response};
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn make_shaping_configs(inputs: &[&str]) -> Shaping {
        let mut files = vec![];
        let mut file_names = vec![];

        for (i, content) in inputs.iter().enumerate() {
            let mut shaping_file = NamedTempFile::with_prefix(format!("file{i}")).unwrap();
            shaping_file.write_all(content.as_bytes()).unwrap();
            file_names.push(shaping_file.path().to_str().unwrap().to_string());
            files.push(shaping_file);
        }

        Shaping::merge_files(&file_names, &ShapingMergeOptions::default())
            .await
            .unwrap()
    }

    fn make_record(content: &str, recipient: &str, site: &str) -> JsonLogRecord {
        JsonLogRecord {
            kind: RecordType::TransientFailure,
            id: String::new(),
            sender: String::new(),
            recipient: recipient.to_string(),
            queue: String::new(),
            site: site.to_string(),
            size: 0,
            response: Response {
                code: 400,
                command: None,
                enhanced_code: None,
                content: content.to_string(),
            },
            peer_address: None,
            timestamp: Default::default(),
            created: Default::default(),
            num_attempts: 1,
            egress_pool: None,
            egress_source: None,
            feedback_report: None,
            oob_report: None,
            meta: Default::default(),
            headers: Default::default(),
            delivery_protocol: None,
            reception_protocol: None,
            nodeid: uuid::Uuid::default(),
            provider_name: None,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn named_limit_maps_accumulate_across_documents() {
        let shaping = make_shaping_configs(&[
            r#"
["example.com"]
mx_rollup = false
additional_connection_limits = {"first"=10}
        "#,
            r#"
["example.com"]
mx_rollup = false
additional_connection_limits = {"second"=32}
additional_message_rate_throttles = {"second"="100/hr"}
        "#,
        ])
        .await;

        let resolved = shaping
            .get_egress_path_config("example.com", "invalid.source", "invalid.site")
            .await
            .finish()
            .unwrap();

        k9::snapshot!(
            resolved.additional_connection_limits,
            r#"
{
    "first": 10,
    "second": 32,
}
"#
        );
        k9::snapshot!(
            resolved.additional_message_rate_throttles,
            r#"
{
    "second": 100/h,
}
"#
        );
    }

    #[tokio::test]
    async fn replace_base_discards_accumulated() {
        let shaping = make_shaping_configs(&[
            r#"
["example.com"]
mx_rollup = false
connection_limit = 3
max_deliveries_per_connection = 5
        "#,
            r#"
["example.com"]
mx_rollup = false
replace_base = true
connection_limit = 10
        "#,
        ])
        .await;

        let resolved = shaping
            .get_egress_path_config("example.com", "src", "site")
            .await
            .finish()
            .unwrap();

        assert_eq!(resolved.connection_limit, throttle::LimitSpec::new(10));
        // replace_base reset the earlier option back to its default
        assert_eq!(resolved.max_deliveries_per_connection, 1024);
    }

    /// default applies to everyone; the site rollup block contributes
    /// its options; the mx_rollup=false domain block layers over the
    /// site; finally the domain source block wins for its option
    #[tokio::test]
    async fn layered_resolution() {
        let shaping = make_shaping_configs(&[r#"
[default]
connection_limit = 10

["yahoo.com"]
_treat_domain_name_as_site_name = true
max_deliveries_per_connection = 20

["foo.com"]
mx_rollup = false
max_deliveries_per_connection = 50
connection_limit = 3

["foo.com".sources."ip-1"]
max_deliveries_per_connection = 5
        "#])
        .await;

        let resolved = shaping
            .get_egress_path_config("foo.com", "ip-1", "yahoo.com")
            .await
            .finish()
            .unwrap();

        assert_eq!(resolved.connection_limit, throttle::LimitSpec::new(3));
        assert_eq!(resolved.max_deliveries_per_connection, 5);
        // untouched by any layer: stays at the built-in default
        assert!(resolved.max_connection_rate.is_none());

        // a source that has no block resolves to the domain values
        let resolved = shaping
            .get_egress_path_config("foo.com", "ip-2", "yahoo.com")
            .await
            .finish()
            .unwrap();
        assert_eq!(resolved.max_deliveries_per_connection, 50);

        // an unrelated domain on the same site sees the site value
        let resolved = shaping
            .get_egress_path_config("bar.com", "ip-1", "yahoo.com")
            .await
            .finish()
            .unwrap();
        assert_eq!(resolved.connection_limit, throttle::LimitSpec::new(10));
        assert_eq!(resolved.max_deliveries_per_connection, 20);
    }

    #[tokio::test]
    async fn provider_match_and_shared_limits() {
        let shaping = make_shaping_configs(&[r#"
[provider."Office 365"]
match=[{DomainSuffix=".outlook.com"}]
enable_tls = "Required"
provider_connection_limit = 10
provider_max_message_rate = "120/s"
        "#])
        .await;

        let resolved = shaping
            .get_egress_path_config("mail.outlook.com", "my-source", "invalid.site")
            .await
            .finish()
            .unwrap();

        k9::assert_equal!(resolved.enable_tls, crate::egress_path::Tls::Required);
        k9::assert_equal!(resolved.provider_name.unwrap(), "Office 365");

        k9::snapshot!(
            resolved.additional_connection_limits,
            r#"
{
    "shaping-provider-Office 365-my-source-limit": 10,
}
"#
        );
        k9::snapshot!(
            resolved.additional_message_rate_throttles,
            r#"
{
    "shaping-provider-Office 365-my-source-rate": 120/s,
}
"#
        );

        // an unrelated domain is not claimed by the provider
        let resolved = shaping
            .get_egress_path_config("example.net", "my-source", "invalid.site")
            .await
            .finish()
            .unwrap();
        assert!(resolved.provider_name.is_none());
    }

    #[tokio::test]
    async fn rule_matching() {
        let shaping = make_shaping_configs(&[r#"
[["default".automation]]
regex="default"
action = {SetConfig={name="connection_limit", value=1}}
duration = "1hr"

["fake.site"]
_treat_domain_name_as_site_name = true

[["fake.site".automation]]
regex="fake_rollup"
action = {SetConfig={name="connection_limit", value=2}}
duration = "1hr"

["woot.example.com"]
mx_rollup = false

[["woot.example.com".automation]]
regex="woot_domain"
action = "Suspend"
duration = "1hr"

[provider."prov"]
match=[{DomainSuffix=".example.com"}]

[[provider."prov".automation]]
regex="provider"
action = {SetConfig={name="connection_limit", value=3}}
duration = "1hr"
match_internal = true
"#])
        .await;

        let matches = shaping
            .match_rules(&make_record("default", "user@example.com", "dummy_site"))
            .await
            .unwrap();
        k9::assert_equal!(matches[0].regex[0].to_string(), "default");
        assert!(matches[0].was_rollup);

        let matches = shaping
            .match_rules(&make_record(
                "Internal: default",
                "user@example.com",
                "dummy_site",
            ))
            .await
            .unwrap();
        assert!(matches.is_empty(), "internal response must not match");

        let matches = shaping
            .match_rules(&make_record(
                "woot_domain",
                "user@woot.example.com",
                "dummy_site",
            ))
            .await
            .unwrap();
        k9::assert_equal!(matches[0].regex[0].to_string(), "woot_domain");
        assert!(!matches[0].was_rollup);

        let matches = shaping
            .match_rules(&make_record("fake_rollup", "user@fake.rollup", "fake.site"))
            .await
            .unwrap();
        k9::assert_equal!(matches[0].regex[0].to_string(), "fake_rollup");

        let matches = shaping
            .match_rules(&make_record(
                "Internal: provider",
                "user@woot.example.com",
                "dummy_site",
            ))
            .await
            .unwrap();
        k9::assert_equal!(
            matches[0].regex[0].to_string(),
            "provider",
            "match_internal rule does match internal responses"
        );
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let doc = r#"
["example.com"]
mx_rollup = false
connection_limit = 7
max_deliveries_per_connection = 11
additional_connection_limits = {"x"=3}

["example.com".sources."ip-0"]
max_message_rate = "5/min"
"#;
        let once = make_shaping_configs(&[doc]).await;
        let twice = make_shaping_configs(&[doc, doc]).await;

        let a = once
            .get_egress_path_config("example.com", "ip-0", "site")
            .await
            .finish()
            .unwrap();
        let b = twice
            .get_egress_path_config("example.com", "ip-0", "site")
            .await
            .finish()
            .unwrap();

        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn invalid_option_is_rejected() {
        let mut shaping_file = NamedTempFile::new().unwrap();
        shaping_file
            .write_all(
                br#"
["example.com"]
mx_rollup = false
no_such_option = true
"#,
            )
            .unwrap();
        let err = Shaping::merge_files(
            &[shaping_file.path().to_str().unwrap().to_string()],
            &ShapingMergeOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("example.com"), "{err:#}");
    }
}
