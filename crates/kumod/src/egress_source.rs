//! Egress sources and pools: the outbound identities that messages
//! are dispatched from, and the weighted round-robin selection of a
//! source within a pool.
use gcd::Gcd;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// A named outbound identity
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct EgressSource {
    /// Friendly name for use in reporting and referencing
    /// elsewhere in the config
    pub name: String,

    /// Bind to this local address prior to issuing a connect(2) syscall
    #[serde(default)]
    pub source_address: Option<IpAddr>,

    /// The hostname to use in the EHLO greeting for this source
    #[serde(default)]
    pub ehlo_domain: Option<String>,

    /// Override the default destination port number with this value
    /// for deployments that use port mapping
    #[serde(default)]
    pub remote_port: Option<u16>,

    /// The host:port of the haproxy that should be used
    #[serde(default)]
    pub ha_proxy_server: Option<SocketAddr>,

    /// Ask ha_proxy to bind to this address when it is making
    /// a connection
    #[serde(default)]
    pub ha_proxy_source_address: Option<IpAddr>,

    /// The host:port of the SOCKS5 server that should be used
    #[serde(default)]
    pub socks5_proxy_server: Option<SocketAddr>,

    /// Ask the SOCKS5 proxy to bind to this address when it is
    /// making a connection
    #[serde(default)]
    pub socks5_proxy_source_address: Option<IpAddr>,
}

impl EgressSource {
    /// The catch-all source used when no pool has been configured
    pub fn unspecified() -> Self {
        Self {
            name: "unspecified".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EgressPoolEntry {
    /// Name of an EgressSource to include in this pool
    pub name: String,

    /// Weight of this entry in the pool. If all entries have the same
    /// weight, then they have equal chance of being selected.
    /// If one entry has a weight that is twice that of the other
    /// entry in the pool, then it is twice as likely to be selected
    /// as the other one.
    ///
    /// A weight of 0 prevents this entry from being used.
    #[serde(default = "EgressPoolEntry::default_weight")]
    pub weight: u32,
}

impl EgressPoolEntry {
    fn default_weight() -> u32 {
        1
    }
}

/// A weighted collection of egress sources
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EgressPool {
    pub name: String,

    /// The sources that constitute this pool
    #[serde(default)]
    pub entries: Vec<EgressPoolEntry>,
}

impl EgressPool {
    pub fn unspecified() -> Self {
        Self {
            name: "unspecified".to_string(),
            entries: vec![EgressPoolEntry {
                name: "unspecified".to_string(),
                weight: 1,
            }],
        }
    }
}

/// Maintains the state to manage Weighted Round Robin
/// <http://kb.linuxvirtualserver.org/wiki/Weighted_Round-Robin_Scheduling>
#[derive(Debug)]
struct RoundRobinState {
    current_index: usize,
    current_weight: u32,
}

#[derive(Debug)]
pub struct EgressPoolRoundRobin {
    pub name: String,
    entries: Vec<EgressPoolEntry>,
    max_weight: u32,
    gcd: u32,
    state: Mutex<RoundRobinState>,
}

impl EgressPoolRoundRobin {
    pub fn new(pool: &EgressPool) -> Self {
        let mut entries = vec![];
        let mut max_weight = 0;
        let mut gcd = 0;

        for entry in &pool.entries {
            if entry.weight == 0 {
                continue;
            }
            max_weight = max_weight.max(entry.weight);
            gcd = gcd.gcd(entry.weight);
            entries.push(entry.clone());
        }

        Self {
            name: pool.name.to_string(),
            entries,
            max_weight,
            gcd,
            state: Mutex::new(RoundRobinState {
                current_index: 0,
                current_weight: 0,
            }),
        }
    }

    /// True when the pool composition is unchanged, in which case the
    /// rotating cursor is retained across a config refresh
    pub fn equivalent(&self, pool: &EgressPool) -> bool {
        let live: Vec<&EgressPoolEntry> =
            pool.entries.iter().filter(|e| e.weight > 0).collect();
        self.name == pool.name
            && self.entries.len() == live.len()
            && self.entries.iter().zip(live).all(|(a, b)| a == b)
    }

    pub fn all_sources(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.name.to_string())
            .collect()
    }

    /// Select the next source, skipping any whose names appear in
    /// `skip` (eg: administratively suspended sources)
    pub fn next(&self, skip: &[String]) -> Option<String> {
        if self.entries.is_empty() || self.max_weight == 0 {
            return None;
        }
        let eligible = self
            .entries
            .iter()
            .filter(|entry| !skip.contains(&entry.name))
            .count();
        if eligible == 0 {
            return None;
        }
        if self.entries.len() == 1 {
            return self.entries.first().map(|entry| entry.name.to_string());
        }

        let mut state = self.state.lock();
        loop {
            state.current_index = (state.current_index + 1) % self.entries.len();
            if state.current_index == 0 {
                state.current_weight = state.current_weight.saturating_sub(self.gcd);
                if state.current_weight == 0 {
                    state.current_weight = self.max_weight;
                }
            }

            if let Some(entry) = self.entries.get(state.current_index) {
                if entry.weight >= state.current_weight && !skip.contains(&entry.name) {
                    return Some(entry.name.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn pool() -> EgressPool {
        EgressPool {
            name: "pool".to_string(),
            entries: vec![
                EgressPoolEntry {
                    name: "one".to_string(),
                    weight: 5,
                },
                EgressPoolEntry {
                    name: "two".to_string(),
                    weight: 2,
                },
                EgressPoolEntry {
                    name: "three".to_string(),
                    weight: 3,
                },
            ],
        }
    }

    #[test]
    fn round_robin_proportions() {
        let rr = EgressPoolRoundRobin::new(&pool());
        let mut counts = HashMap::new();

        for _ in 0..100 {
            let name = rr.next(&[]).unwrap();
            *counts.entry(name).or_insert(0) += 1;
        }

        // Counts are in the same proportion as the weights
        assert_eq!(counts["one"], 50, "one");
        assert_eq!(counts["two"], 20, "two");
        assert_eq!(counts["three"], 30, "three");
    }

    #[test]
    fn round_robin_skips_suspended() {
        let rr = EgressPoolRoundRobin::new(&pool());
        let skip = vec!["one".to_string()];
        for _ in 0..10 {
            let name = rr.next(&skip).unwrap();
            assert_ne!(name, "one");
        }

        let all = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        assert_eq!(rr.next(&all), None);
    }

    #[test]
    fn zero_weight_is_excluded() {
        let pool = EgressPool {
            name: "pool".to_string(),
            entries: vec![
                EgressPoolEntry {
                    name: "only".to_string(),
                    weight: 1,
                },
                EgressPoolEntry {
                    name: "disabled".to_string(),
                    weight: 0,
                },
            ],
        };
        let rr = EgressPoolRoundRobin::new(&pool);
        for _ in 0..5 {
            assert_eq!(rr.next(&[]).unwrap(), "only");
        }
    }

    #[test]
    fn equivalence_across_refresh() {
        let rr = EgressPoolRoundRobin::new(&pool());
        assert!(rr.equivalent(&pool()));

        let mut changed = pool();
        changed.entries[0].weight = 1;
        assert!(!rr.equivalent(&changed));

        let mut fewer = pool();
        fewer.entries.pop();
        assert!(!rr.equivalent(&fewer));
    }
}
