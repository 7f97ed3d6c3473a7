use anyhow::Context;
use arc_swap::ArcSwap;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::proto::ProtoError;
pub use hickory_resolver::Name;
use kumo_log_types::ResolvedAddress;
use lruttl::LruCacheWithTtl;
use rand::prelude::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;

mod resolver;

pub use resolver::{
    ptr_host, Answer, DnsError, HickoryResolver, IpDisplay, Resolver, TestResolver,
};

// An `ArcSwap` can only hold `Sized` types, so the `dyn Resolver` is
// boxed to give it a level of indirection.
static RESOLVER: LazyLock<ArcSwap<Box<dyn Resolver>>> =
    LazyLock::new(|| ArcSwap::from_pointee(Box::new(default_resolver())));

static MX_CACHE: LazyLock<LruCacheWithTtl<Name, Result<Arc<MailExchanger>, String>>> =
    LazyLock::new(|| LruCacheWithTtl::new_named("dns_resolver_mx", 64 * 1024));
static IP_CACHE: LazyLock<LruCacheWithTtl<Name, Arc<Vec<IpAddr>>>> =
    LazyLock::new(|| LruCacheWithTtl::new_named("dns_resolver_ip", 1024));

/// Maximum number of concurrent mx resolves permitted
static MX_MAX_CONCURRENCY: AtomicUsize = AtomicUsize::new(128);
static MX_CONCURRENCY_SEMA: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(MX_MAX_CONCURRENCY.load(Ordering::SeqCst)));

/// 5 seconds in ms
static MX_TIMEOUT_MS: AtomicUsize = AtomicUsize::new(5000);

/// 5 minutes in ms
static MX_NEGATIVE_TTL: AtomicUsize = AtomicUsize::new(300 * 1000);

static MX_IN_PROGRESS: LazyLock<prometheus::IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "dns_mx_resolve_in_progress",
        "number of MailExchanger::resolve calls currently in progress"
    )
    .unwrap()
});
static MX_CACHED: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_cache_hit",
        "total number of MailExchanger::resolve calls satisfied by cache"
    )
    .unwrap()
});
static MX_QUERIES: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_cache_miss",
        "total number of MailExchanger::resolve calls that resulted in an \
        MX DNS request"
    )
    .unwrap()
});

fn default_resolver() -> impl Resolver {
    HickoryResolver::new().expect("Parsing /etc/resolv.conf failed")
}

pub fn set_mx_concurrency_limit(n: usize) {
    MX_MAX_CONCURRENCY.store(n, Ordering::SeqCst);
}

pub fn set_mx_timeout(duration: Duration) -> anyhow::Result<()> {
    let ms = duration
        .as_millis()
        .try_into()
        .context("set_mx_timeout: duration is too large")?;
    MX_TIMEOUT_MS.store(ms, Ordering::Relaxed);
    Ok(())
}

pub fn get_mx_timeout() -> Duration {
    Duration::from_millis(MX_TIMEOUT_MS.load(Ordering::Relaxed) as u64)
}

pub fn set_mx_negative_cache_ttl(duration: Duration) -> anyhow::Result<()> {
    let ms = duration
        .as_millis()
        .try_into()
        .context("set_mx_negative_cache_ttl: duration is too large")?;
    MX_NEGATIVE_TTL.store(ms, Ordering::Relaxed);
    Ok(())
}

pub fn get_mx_negative_ttl() -> Duration {
    Duration::from_millis(MX_NEGATIVE_TTL.load(Ordering::Relaxed) as u64)
}

pub fn reconfigure_resolver(resolver: impl Resolver) {
    RESOLVER.store(Arc::new(Box::new(resolver)));
}

pub fn get_resolver() -> Arc<Box<dyn Resolver>> {
    RESOLVER.load_full()
}

pub fn fully_qualify(domain_name: &str) -> Result<Name, ProtoError> {
    let mut name = Name::from_str_relaxed(domain_name)?.to_lowercase();

    // Treat it as fully qualified
    name.set_fqdn(true);

    Ok(name)
}

/// The set of mail exchangers for a destination domain, together with
/// the canonical site name that groups domains sharing the same MX set.
#[derive(Clone, Debug, Serialize)]
pub struct MailExchanger {
    pub domain_name: String,
    pub hosts: Vec<String>,
    pub site_name: String,
    pub by_pref: BTreeMap<u16, Vec<String>>,
    pub is_domain_literal: bool,
    pub is_null_mx: bool,
    #[serde(skip)]
    expires: Option<Instant>,
}

/// Compute the canonical site name for a set of MX hostnames:
/// lowercased, trailing dot trimmed, sorted ascending and joined
/// with commas. Two domains share a site name iff their MX record
/// sets are identical.
pub fn site_name<S: AsRef<str>>(hosts: &[S]) -> String {
    let mut names: Vec<String> = hosts
        .iter()
        .map(|host| {
            host.as_ref()
                .strip_suffix('.')
                .unwrap_or(host.as_ref())
                .to_ascii_lowercase()
        })
        .filter(|host| !host.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names.join(",")
}

impl MailExchanger {
    pub async fn resolve(domain_name: &str) -> anyhow::Result<Arc<Self>> {
        MX_IN_PROGRESS.inc();
        let result = Self::resolve_impl(domain_name).await;
        MX_IN_PROGRESS.dec();
        result
    }

    async fn resolve_impl(domain_name: &str) -> anyhow::Result<Arc<Self>> {
        if let Some(literal) = parse_literal(domain_name) {
            let host = literal.to_string();
            let mut by_pref = BTreeMap::new();
            by_pref.insert(1, vec![host.clone()]);
            return Ok(Arc::new(Self {
                domain_name: domain_name.to_string(),
                hosts: vec![host.clone()],
                site_name: host,
                by_pref,
                is_domain_literal: true,
                is_null_mx: false,
                expires: None,
            }));
        }

        let name_fq = fully_qualify(domain_name)?;

        let lookup_result = MX_CACHE
            .get_or_try_insert(
                &name_fq,
                |mx_result| match mx_result {
                    Ok(mx) => match mx.expires {
                        Some(exp) => exp
                            .checked_duration_since(Instant::now())
                            .unwrap_or_else(|| Duration::from_secs(10)),
                        None => get_mx_negative_ttl(),
                    },
                    Err(_) => get_mx_negative_ttl(),
                },
                async {
                    MX_QUERIES.inc();
                    let start = Instant::now();
                    let (by_pref, expires) = match lookup_mx_record(&name_fq).await {
                        Ok(result) => result,
                        Err(err) => {
                            let error = format!(
                                "MX lookup for {domain_name} failed after {elapsed:?}: {err:#}",
                                elapsed = start.elapsed()
                            );
                            return Ok::<Result<Arc<MailExchanger>, String>, anyhow::Error>(Err(
                                error,
                            ));
                        }
                    };

                    let mut hosts = vec![];
                    for pref in &by_pref {
                        for host in &pref.hosts {
                            hosts.push(host.to_string());
                        }
                    }

                    let is_null_mx = hosts.len() == 1 && hosts[0] == ".";

                    let by_pref = by_pref
                        .into_iter()
                        .map(|pref| (pref.pref, pref.hosts))
                        .collect();

                    let mx = Self {
                        site_name: site_name(&hosts),
                        hosts,
                        domain_name: name_fq.to_ascii(),
                        by_pref,
                        is_domain_literal: false,
                        is_null_mx,
                        expires: Some(expires),
                    };

                    Ok(Ok(Arc::new(mx)))
                },
            )
            .await?;

        if !lookup_result.is_fresh {
            MX_CACHED.inc();
        }

        lookup_result.item.map_err(|err| anyhow::anyhow!("{err}"))
    }

    pub fn has_expired(&self) -> bool {
        match self.expires {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }

    /// Returns the resolved MX host addresses in *reverse* preference
    /// order; the first one to try is the last element. The delivery
    /// dispatcher relies on this ordering, as it pops candidates off
    /// the end until it has exhausted its connection plan.
    pub async fn resolve_addresses(&self) -> ResolvedMxAddresses {
        let mut result = vec![];

        for hosts in self.by_pref.values().rev() {
            let mut by_pref = vec![];

            for mx_host in hosts {
                // '.' is a null mx; skip trying to resolve it
                if mx_host == "." {
                    return ResolvedMxAddresses::NullMx;
                }

                if let Ok(addr) = mx_host.parse::<IpAddr>() {
                    by_pref.push(ResolvedAddress {
                        name: mx_host.to_string(),
                        addr,
                    });
                    continue;
                }

                match ip_lookup(mx_host).await {
                    Err(err) => {
                        tracing::error!("failed to resolve {mx_host}: {err:#}");
                        continue;
                    }
                    Ok((addresses, _expires)) => {
                        for addr in addresses.iter() {
                            by_pref.push(ResolvedAddress {
                                name: mx_host.to_string(),
                                addr: *addr,
                            });
                        }
                    }
                }
            }

            // Randomize the list of addresses within this preference
            // level. This probabilistically "load balances" outgoing
            // traffic across MX hosts with equal preference value.
            let mut rng = rand::thread_rng();
            by_pref.shuffle(&mut rng);
            result.append(&mut by_pref);
        }
        ResolvedMxAddresses::Addresses(result)
    }
}

/// Interpret `[10.0.0.1]` or `[IPv6:::1]` as an address literal
fn parse_literal(domain_name: &str) -> Option<IpAddr> {
    let literal = domain_name.strip_prefix('[')?.strip_suffix(']')?;
    let lowered = literal.to_ascii_lowercase();
    if let Some(v6) = lowered.strip_prefix("ipv6:") {
        return v6.parse::<Ipv6Addr>().ok().map(IpAddr::V6);
    }
    // RFC5321 doesn't actually permit an untagged IPv6 address,
    // but we allow it as a convenience
    literal.parse::<IpAddr>().ok()
}

#[derive(Debug, Clone, Serialize)]
pub enum ResolvedMxAddresses {
    NullMx,
    Addresses(Vec<ResolvedAddress>),
}

struct ByPreference {
    hosts: Vec<String>,
    pref: u16,
}

async fn lookup_mx_record(domain_name: &Name) -> anyhow::Result<(Vec<ByPreference>, Instant)> {
    let mx_lookup = timeout(get_mx_timeout(), async {
        let _permit = MX_CONCURRENCY_SEMA.acquire().await;
        RESOLVER
            .load()
            .resolve(domain_name.clone(), RecordType::MX)
            .await
    })
    .await??;
    let mx_records = mx_lookup.records;

    if mx_records.is_empty() {
        if mx_lookup.nxdomain {
            anyhow::bail!("NXDOMAIN");
        }

        // Implicit MX: the domain itself at preference 1
        return Ok((
            vec![ByPreference {
                hosts: vec![domain_name.to_lowercase().to_ascii()],
                pref: 1,
            }],
            mx_lookup.expires,
        ));
    }

    let mut records: Vec<ByPreference> = Vec::with_capacity(mx_records.len());

    for mx_record in mx_records {
        if let Some(mx) = mx_record.as_mx() {
            let pref = mx.preference();
            let host = mx.exchange().to_lowercase().to_string();

            if let Some(record) = records.iter_mut().find(|r| r.pref == pref) {
                record.hosts.push(host);
            } else {
                records.push(ByPreference {
                    hosts: vec![host],
                    pref,
                });
            }
        }
    }

    // Sort by preference
    records.sort_unstable_by(|a, b| a.pref.cmp(&b.pref));

    // Sort the hosts at each preference level to produce the
    // overall ordered list of hosts for this site
    for mx in &mut records {
        mx.hosts.sort();
    }

    Ok((records, mx_lookup.expires))
}

pub async fn ip_lookup(key: &str) -> anyhow::Result<(Arc<Vec<IpAddr>>, Instant)> {
    let key_fq = fully_qualify(key)?;
    if let Some(lookup) = IP_CACHE.lookup(&key_fq) {
        return Ok((lookup.item, lookup.expiration));
    }

    let addrs = RESOLVER.load().resolve_ip(key).await?;
    let addrs = Arc::new(addrs);
    // The Resolver trait doesn't carry per-rr expiry for the combined
    // v4/v6 lookup, so apply a short fixed ttl
    let expires = Instant::now() + Duration::from_secs(60);
    IP_CACHE.insert(key_fq, addrs.clone(), expires);
    Ok((addrs, expires))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn site_name_canonicalization() {
        assert_eq!(
            site_name(&["ALT1.aspmx.l.google.com.", "aspmx.l.google.com."]),
            "alt1.aspmx.l.google.com,aspmx.l.google.com"
        );

        // identical sets yield identical names regardless of input
        // order, case or trailing dots
        assert_eq!(
            site_name(&["mta7.am0.yahoodns.net", "mta5.am0.yahoodns.net"]),
            site_name(&["MTA5.am0.yahoodns.net.", "mta7.am0.yahoodns.net."])
        );

        assert_eq!(site_name::<&str>(&[]), "");
    }

    #[tokio::test]
    async fn literal_domains() {
        let v4 = MailExchanger::resolve("[10.0.0.1]").await.unwrap();
        assert!(v4.is_domain_literal);
        assert_eq!(v4.site_name, "10.0.0.1");

        let v6 = MailExchanger::resolve("[IPv6:::1]").await.unwrap();
        assert!(v6.is_domain_literal);
        assert_eq!(v6.site_name, "::1");
    }

    #[tokio::test]
    async fn mx_via_test_resolver() {
        reconfigure_resolver(
            TestResolver::default()
                .with_zone(
                    r#"
$ORIGIN example.com.
example.com. 600 IN MX 10 alt1.aspmx.l.google.com.
example.com. 600 IN MX 5 aspmx.l.google.com.
"#,
                ),
        );

        let mx = MailExchanger::resolve("example.com").await.unwrap();
        assert_eq!(
            mx.site_name,
            "alt1.aspmx.l.google.com,aspmx.l.google.com"
        );
        assert_eq!(mx.by_pref.get(&5).unwrap(), &["aspmx.l.google.com."]);
        assert_eq!(mx.by_pref.get(&10).unwrap(), &["alt1.aspmx.l.google.com."]);
        assert!(!mx.is_null_mx);
    }
}
