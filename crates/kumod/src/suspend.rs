//! Registries of active suspensions and automation bounces, fed by
//! the TSA subscriber and consulted on the promotion path.
//! Entries are deduplicated by rule hash: an identical reason
//! replaces the prior entry rather than stacking.
use chrono::{DateTime, Utc};
use kumo_api_types::tsa::{ReadyQSuspension, SchedQBounce, SchedQSuspension};
use message::QueueNameComponents;
use parking_lot::Mutex;
use std::sync::LazyLock;
use std::time::Duration;

static READYQ: LazyLock<Mutex<Vec<ReadyQSuspension>>> = LazyLock::new(Mutex::default);
static SCHEDQ: LazyLock<Mutex<Vec<SchedQSuspension>>> = LazyLock::new(Mutex::default);
static BOUNCES: LazyLock<Mutex<Vec<SchedQBounce>>> = LazyLock::new(Mutex::default);

fn upsert<T, F>(entries: &mut Vec<T>, entry: T, same_rule: F)
where
    F: Fn(&T) -> bool,
{
    entries.retain(|existing| !same_rule(existing));
    entries.push(entry);
}

pub fn suspend_ready_q(entry: ReadyQSuspension) {
    if entry.expires <= Utc::now() {
        return;
    }
    tracing::info!(
        "ready queue suspension for source={} site={}: {}",
        entry.source,
        entry.site_name,
        entry.reason
    );
    upsert(&mut READYQ.lock(), entry.clone(), |existing| {
        existing.rule_hash == entry.rule_hash
            && existing.site_name == entry.site_name
            && existing.source == entry.source
    });
}

pub fn suspend_sched_q(entry: SchedQSuspension) {
    if entry.expires <= Utc::now() {
        return;
    }
    tracing::info!(
        "scheduled queue suspension for tenant={} domain={} campaign={:?}: {}",
        entry.tenant,
        entry.domain,
        entry.campaign,
        entry.reason
    );
    upsert(&mut SCHEDQ.lock(), entry.clone(), |existing| {
        existing.rule_hash == entry.rule_hash
            && existing.tenant == entry.tenant
            && existing.domain == entry.domain
            && existing.campaign == entry.campaign
    });
}

pub fn bounce_sched_q(entry: SchedQBounce) {
    if entry.expires <= Utc::now() {
        return;
    }
    tracing::info!(
        "scheduled queue bounce for domain={} tenant={:?} campaign={:?}: {}",
        entry.domain,
        entry.tenant,
        entry.campaign,
        entry.reason
    );
    upsert(&mut BOUNCES.lock(), entry.clone(), |existing| {
        existing.rule_hash == entry.rule_hash
            && existing.tenant == entry.tenant
            && existing.domain == entry.domain
            && existing.campaign == entry.campaign
    });
}

/// The remaining duration and reason of a matching ready queue
/// suspension, if any
pub fn ready_q_suspension(site_name: &str, source: &str) -> Option<(Duration, String)> {
    let now = Utc::now();
    READYQ
        .lock()
        .iter()
        .filter(|entry| {
            entry.expires > now && entry.site_name == site_name && entry.source == source
        })
        .map(|entry| (remaining(entry.expires, now), entry.reason.clone()))
        .next()
}

fn matches_components(
    domain: &str,
    tenant: Option<&str>,
    campaign: Option<&str>,
    components: &QueueNameComponents,
) -> bool {
    if domain != components.domain {
        return false;
    }
    if let Some(tenant) = tenant {
        if components.tenant != Some(tenant) {
            return false;
        }
    }
    // A suspension without a campaign applies to every campaign of
    // the tenant; one with a campaign only applies to that campaign
    if let Some(campaign) = campaign {
        if components.campaign != Some(campaign) {
            return false;
        }
    }
    true
}

/// The remaining duration and reason of a matching scheduled queue
/// suspension, if any
pub fn sched_q_suspension(queue_name: &str) -> Option<(Duration, String)> {
    let components = QueueNameComponents::parse(queue_name);
    let now = Utc::now();
    SCHEDQ
        .lock()
        .iter()
        .filter(|entry| {
            entry.expires > now
                && matches_components(
                    &entry.domain,
                    Some(&entry.tenant),
                    entry.campaign.as_deref(),
                    &components,
                )
        })
        .map(|entry| (remaining(entry.expires, now), entry.reason.clone()))
        .next()
}

/// The reason of a matching scheduled queue bounce directive, if any
pub fn sched_q_bounce(queue_name: &str) -> Option<String> {
    let components = QueueNameComponents::parse(queue_name);
    let now = Utc::now();
    BOUNCES
        .lock()
        .iter()
        .filter(|entry| {
            entry.expires > now
                && matches_components(
                    &entry.domain,
                    entry.tenant.as_deref(),
                    entry.campaign.as_deref(),
                    &components,
                )
        })
        .map(|entry| entry.reason.clone())
        .next()
}

fn remaining(expires: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires - now).to_std().unwrap_or(Duration::from_secs(60))
}

/// Drop expired entries; called periodically
pub fn prune() {
    let now = Utc::now();
    READYQ.lock().retain(|entry| entry.expires > now);
    SCHEDQ.lock().retain(|entry| entry.expires > now);
    BOUNCES.lock().retain(|entry| entry.expires > now);
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;

    fn ready(rule_hash: &str, site: &str, source: &str, mins: i64) -> ReadyQSuspension {
        ReadyQSuspension {
            rule_hash: rule_hash.to_string(),
            site_name: site.to_string(),
            source: source.to_string(),
            reason: "451 try later".to_string(),
            expires: Utc::now() + TimeDelta::minutes(mins),
        }
    }

    #[test]
    fn ready_q_dedup_and_expiry() {
        suspend_ready_q(ready("h1", "site-a", "src-1", 60));
        // same rule hash replaces, extending the expiry rather
        // than stacking
        suspend_ready_q(ready("h1", "site-a", "src-1", 120));
        assert_eq!(
            READYQ
                .lock()
                .iter()
                .filter(|e| e.rule_hash == "h1")
                .count(),
            1
        );

        assert!(ready_q_suspension("site-a", "src-1").is_some());
        assert!(ready_q_suspension("site-a", "src-2").is_none());
        assert!(ready_q_suspension("site-b", "src-1").is_none());

        // an entry that has already expired is not admitted
        suspend_ready_q(ready("h2", "site-c", "src-1", -5));
        assert!(ready_q_suspension("site-c", "src-1").is_none());
    }

    #[test]
    fn sched_q_matching() {
        suspend_sched_q(SchedQSuspension {
            rule_hash: "h3".to_string(),
            tenant: "acme".to_string(),
            domain: "example.com".to_string(),
            campaign: None,
            reason: "tenant suspended".to_string(),
            expires: Utc::now() + TimeDelta::minutes(60),
        });

        assert!(sched_q_suspension("acme@example.com").is_some());
        assert!(sched_q_suspension("sale:acme@example.com").is_some());
        assert!(sched_q_suspension("other@example.com").is_none());
        assert!(sched_q_suspension("example.com").is_none());

        suspend_sched_q(SchedQSuspension {
            rule_hash: "h4".to_string(),
            tenant: "acme".to_string(),
            domain: "example.org".to_string(),
            campaign: Some("promo".to_string()),
            reason: "campaign suspended".to_string(),
            expires: Utc::now() + TimeDelta::minutes(60),
        });

        assert!(sched_q_suspension("promo:acme@example.org").is_some());
        assert!(sched_q_suspension("other:acme@example.org").is_none());
        assert!(sched_q_suspension("acme@example.org").is_none());
    }
}
