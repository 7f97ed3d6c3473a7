//! The daemon's HTTP surface:
//! - POST /publish_log_v1 accepts a single JSON log record for rule
//!   evaluation
//! - GET /get_config_v1/shaping.toml returns the generated shaping
//!   overlay
//! - WS /subscribe_event_v1 streams suspension/bounce events, first
//!   replaying the full active set
use crate::state::{
    ActionHash, ConfigurationOverride, MatchingScope, ReadyQSuspensionEntry, SchedQBounceEntry,
    SchedQBounceKey, SchedQSuspensionEntry, SchedQSuspensionKey, TSA_STATE,
};
use anyhow::anyhow;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use kumo_api_types::shaping::{Action, EgressPathConfigValue, Regex, Rule, Trigger};
use kumo_api_types::tsa::{ReadyQSuspension, SchedQBounce, SchedQSuspension, Suspensions, TsaEvent};
use kumo_log_types::JsonLogRecord;
use kumo_server_common::http_server::AppError;
use message::QueueNameComponents;
use std::sync::LazyLock;
use tokio::sync::broadcast::{channel, Sender};

static EVENT_TX: LazyLock<Sender<TsaEvent>> = LazyLock::new(|| channel(128).0);

pub fn make_router() -> Router {
    Router::new()
        .route("/publish_log_v1", post(publish_log_v1))
        .route("/get_config_v1/shaping.toml", get(get_config_v1))
        .route("/subscribe_event_v1", get(subscribe_event_v1))
}

fn submit_event(event: TsaEvent) {
    if EVENT_TX.receiver_count() > 0 {
        EVENT_TX.send(event).ok();
    }
}

fn regex_list_to_string(list: &[Regex]) -> String {
    if list.len() == 1 {
        list[0].to_string()
    } else {
        let mut result = "(".to_string();
        for (n, r) in list.iter().enumerate() {
            if n > 0 {
                result.push(',');
            }
            result.push_str(&r.to_string());
        }
        result.push(')');
        result
    }
}

fn create_config_override(
    rule: &Rule,
    record: &JsonLogRecord,
    config: &EgressPathConfigValue,
    domain: &str,
    source: &str,
) {
    let action_hash =
        ActionHash::from_rule_and_record(rule, &Action::SetConfig(config.clone()), record);
    let reason = format!("automation rule: {}", regex_list_to_string(&rule.regex));

    TSA_STATE
        .get()
        .expect("state initialized")
        .insert_config_override(
            action_hash,
            ConfigurationOverride {
                domain: domain.to_string(),
                mx_rollup: rule.was_rollup,
                source: source.to_string(),
                reason,
                option: config.clone().into(),
                expires: record.timestamp + rule.duration,
            },
        );
}

fn create_ready_q_suspension(rule: &Rule, record: &JsonLogRecord, source: &str) {
    let action_hash = ActionHash::from_rule_and_record(rule, &Action::Suspend, record);
    let reason = format!("automation rule: {}", regex_list_to_string(&rule.regex));
    let expires = record.timestamp + rule.duration;
    let site_name = action_hash.site_name().to_string();

    TSA_STATE
        .get()
        .expect("state initialized")
        .insert_readyq_suspension(
            action_hash.clone(),
            ReadyQSuspensionEntry {
                reason: reason.clone(),
                source: source.to_string(),
                expires,
            },
        );

    submit_event(TsaEvent::ReadyQSuspension(ReadyQSuspension {
        rule_hash: action_hash.hash_portion(),
        site_name,
        reason,
        source: source.to_string(),
        expires,
    }));
}

fn create_sched_q_suspension(
    rule: &Rule,
    record: &JsonLogRecord,
    use_campaign: bool,
) -> anyhow::Result<()> {
    let components = QueueNameComponents::parse(&record.queue);
    let Some(tenant) = components.tenant else {
        tracing::error!(
            "Cannot create tenant based suspension for {rule:?} \
             because the incoming record queue {} has no tenant component",
            record.queue
        );
        return Ok(());
    };

    let campaign = if use_campaign {
        components.campaign
    } else {
        None
    };

    let action = if use_campaign {
        Action::SuspendCampaign
    } else {
        Action::SuspendTenant
    };
    let action_hash = ActionHash::from_rule_and_record(rule, &action, record);

    let mut reason = format!(
        "automation rule: {} tenant={tenant} domain={}",
        regex_list_to_string(&rule.regex),
        components.domain
    );
    if let Some(campaign) = &campaign {
        reason.push_str(&format!(" campaign={campaign}"));
    }
    let expires = record.timestamp + rule.duration;

    TSA_STATE
        .get()
        .expect("state initialized")
        .insert_schedq_suspension(
            SchedQSuspensionKey {
                action_hash: action_hash.clone(),
                domain: components.domain.to_string(),
                tenant: tenant.to_string(),
                campaign: campaign.map(|s| s.to_string()),
            },
            SchedQSuspensionEntry {
                reason: reason.clone(),
                expires,
            },
        );

    submit_event(TsaEvent::SchedQSuspension(SchedQSuspension {
        rule_hash: action_hash.to_string(),
        domain: components.domain.to_string(),
        tenant: tenant.to_string(),
        campaign: campaign.map(|s| s.to_string()),
        reason,
        expires,
    }));

    Ok(())
}

fn create_sched_q_bounce(rule: &Rule, record: &JsonLogRecord) {
    let components = QueueNameComponents::parse(&record.queue);
    let action_hash = ActionHash::from_rule_and_record(rule, &Action::Bounce, record);
    let reason = format!("automation rule: {}", regex_list_to_string(&rule.regex));
    let expires = record.timestamp + rule.duration;

    TSA_STATE
        .get()
        .expect("state initialized")
        .insert_schedq_bounce(
            SchedQBounceKey {
                action_hash: action_hash.clone(),
                domain: components.domain.to_string(),
                tenant: components.tenant.map(|s| s.to_string()),
                campaign: components.campaign.map(|s| s.to_string()),
            },
            SchedQBounceEntry {
                reason: reason.clone(),
                expires,
            },
        );

    submit_event(TsaEvent::SchedQBounce(SchedQBounce {
        rule_hash: action_hash.to_string(),
        domain: components.domain.to_string(),
        tenant: components.tenant.map(|s| s.to_string()),
        campaign: components.campaign.map(|s| s.to_string()),
        reason,
        expires,
    }));
}

pub async fn publish_log_v1_impl(record: JsonLogRecord) -> anyhow::Result<()> {
    tracing::trace!("got record: {record:?}");

    if record.recipient.eq_ignore_ascii_case("postmaster") {
        // It doesn't make sense to apply automation on the local
        // postmaster address
        return Ok(());
    }

    // Extract the domain from the recipient
    let domain = record
        .recipient
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("record.recipient '{}' has no domain", record.recipient))?;
    let source = record.egress_source.as_deref().unwrap_or("unspecified");

    let shaping = crate::shaping_config::get_shaping();
    let matches = shaping.match_rules(&record).await?;

    let state = TSA_STATE.get().expect("state initialized");

    for rule in &matches {
        let triggered = match &rule.trigger {
            Trigger::Immediate => true,
            Trigger::Threshold(spec) => {
                let scope = MatchingScope::from_rule_and_record(rule, &record);
                let count = state.record_event(&scope, rule, &record);
                count >= spec.limit
            }
        };

        tracing::trace!("match={rule:?} triggered={triggered} for {record:?}");

        if !triggered {
            continue;
        }

        // Enact the effects. An identical (rule, action, site)
        // re-trigger replaces the prior entry, extending its expiry
        for action in &rule.action {
            tracing::info!("{action:?} for {}", record.response.to_single_line());
            match action {
                Action::Suspend => {
                    create_ready_q_suspension(rule, &record, source);
                }
                Action::SuspendTenant => {
                    create_sched_q_suspension(rule, &record, false)?;
                }
                Action::SuspendCampaign => {
                    create_sched_q_suspension(rule, &record, true)?;
                }
                Action::SetConfig(config) => {
                    create_config_override(rule, &record, config, &domain, source);
                }
                Action::Bounce => {
                    create_sched_q_bounce(rule, &record);
                }
            }
        }
    }

    Ok(())
}

async fn publish_log_v1(Json(record): Json<JsonLogRecord>) -> Result<(), AppError> {
    publish_log_v1_impl(record).await.map_err(|err| {
        tracing::error!("while processing /publish_log_v1: {err:#}");
        err.into()
    })
}

async fn get_config_v1() -> Result<String, AppError> {
    let state = TSA_STATE
        .get()
        .ok_or_else(|| anyhow!("state not initialized"))?;
    Ok(state.export_config_override_toml())
}

pub fn get_suspensions() -> anyhow::Result<Suspensions> {
    let state = TSA_STATE
        .get()
        .ok_or_else(|| anyhow!("state not initialized"))?;
    Ok(Suspensions {
        ready_q: state.export_readyq_suspensions(),
        sched_q: state.export_schedq_suspensions(),
        sched_q_bounces: state.export_schedq_bounces(),
    })
}

async fn process_event_subscription(mut socket: WebSocket) -> anyhow::Result<()> {
    let mut rx = EVENT_TX.subscribe();

    // Replay the current active set before any incremental events,
    // so that a reconnecting kumod converges to the correct state
    let suspensions = get_suspensions()?;
    for record in suspensions.ready_q {
        let json = serde_json::to_string(&TsaEvent::ReadyQSuspension(record))?;
        socket.send(WsMessage::Text(json.into())).await?;
    }
    for record in suspensions.sched_q {
        let json = serde_json::to_string(&TsaEvent::SchedQSuspension(record))?;
        socket.send(WsMessage::Text(json.into())).await?;
    }
    for record in suspensions.sched_q_bounces {
        let json = serde_json::to_string(&TsaEvent::SchedQBounce(record))?;
        socket.send(WsMessage::Text(json.into())).await?;
    }

    // Then wait for more to show up
    loop {
        let event = rx.recv().await?;
        let json = serde_json::to_string(&event)?;
        socket.send(WsMessage::Text(json.into())).await?;
    }
}

async fn subscribe_event_v1(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| async {
        if let Err(err) = process_event_subscription(socket).await {
            tracing::error!("error in websocket: {err:#}");
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use kumo_api_types::shaping::{Shaping, ShapingMergeOptions};
    use kumo_log_types::{RecordType, Response};
    use std::io::Write;

    /// Both tests share the global shaping snapshot, so the rules
    /// for all of them load together
    async fn init_shaping() {
        let doc = r#"
[["fake.example".automation]]
regex = "TS04"
trigger = {Threshold="2/1h"}
action = "Suspend"
duration = "2 hours"

[["cfg.example".automation]]
regex = "flow control"
action = {SetConfig={name="max_message_rate", value="10/min"}}
duration = "1 hour"
"#;
        // Serve the test zones so that mx_rollup resolution works
        // without touching the network
        dns_resolver::reconfigure_resolver(
            dns_resolver::TestResolver::default()
                .with_zone(
                    r#"
$ORIGIN fake.example.
fake.example. 600 IN MX 10 mx.fake.example.
"#,
                )
                .with_zone(
                    r#"
$ORIGIN cfg.example.
cfg.example. 600 IN MX 10 mx.cfg.example.
"#,
                ),
        );

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(doc.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        crate::shaping_config::set_shaping_sources(vec![path]);
        crate::shaping_config::load_shaping().await.unwrap();
        // keep the temp file alive for the duration of the test
        std::mem::forget(file);
    }

    fn make_record(content: &str, queue: &str, site: &str) -> JsonLogRecord {
        JsonLogRecord {
            kind: RecordType::TransientFailure,
            id: uuid::Uuid::new_v4().to_string(),
            sender: "sender@sender.example".to_string(),
            recipient: format!("user@{}", QueueNameComponents::parse(queue).domain),
            queue: queue.to_string(),
            site: site.to_string(),
            size: 0,
            response: Response {
                code: 451,
                command: None,
                enhanced_code: None,
                content: content.to_string(),
            },
            peer_address: None,
            timestamp: Utc::now(),
            created: Utc::now(),
            num_attempts: 1,
            egress_pool: Some("pool0".to_string()),
            egress_source: Some("ip-1".to_string()),
            feedback_report: None,
            oob_report: None,
            meta: Default::default(),
            headers: Default::default(),
            delivery_protocol: Some("ESMTP".to_string()),
            reception_protocol: Some("ESMTP".to_string()),
            nodeid: uuid::Uuid::new_v4(),
            provider_name: None,
            session_id: None,
        }
    }

    /// A threshold rule: two matches within the window trigger a
    /// suspension; a third identical match replaces rather than
    /// stacks, and the exported entry carries the extended expiry
    #[tokio::test]
    async fn threshold_suspend_with_dedup() {
        crate::state::load_state().await.unwrap();
        init_shaping().await;

        let record = make_record(
            "451 4.7.1 TS04 temporarily deferred",
            "tenant@fake.example",
            "ip-1->mx.fake.example",
        );

        // First match: below the threshold, no suspension yet
        publish_log_v1_impl(record.clone()).await.unwrap();
        let state = TSA_STATE.get().unwrap();
        assert!(
            state.export_readyq_suspensions().is_empty(),
            "one match is below the 2/1h threshold"
        );

        // Second match: the threshold fires
        publish_log_v1_impl(record.clone()).await.unwrap();
        let suspensions = state.export_readyq_suspensions();
        assert_eq!(suspensions.len(), 1);
        assert_eq!(suspensions[0].site_name, "mx.fake.example");
        assert_eq!(suspensions[0].source, "ip-1");
        let first_expiry = suspensions[0].expires;

        // Third match: deduplicated by rule hash; still one entry
        publish_log_v1_impl(record.clone()).await.unwrap();
        let suspensions = state.export_readyq_suspensions();
        assert_eq!(suspensions.len(), 1, "identical reasons replace, not stack");
        assert!(suspensions[0].expires >= first_expiry);

        // The effect persists for the rule duration
        assert!(
            suspensions[0].expires <= Utc::now() + TimeDelta::hours(2),
            "suspension expires after the configured duration"
        );
    }

    /// SetConfig actions surface through the generated shaping
    /// overlay document
    #[tokio::test]
    async fn config_override_overlay() {
        crate::state::load_state().await.unwrap();
        init_shaping().await;

        publish_log_v1_impl(make_record(
            "451 4.3.2 flow control engaged",
            "cfg.example",
            "ip-1->mx.cfg.example",
        ))
        .await
        .unwrap();

        let overlay = TSA_STATE.get().unwrap().export_config_override_toml();
        assert!(overlay.contains("Generated by tsa-daemon"), "{overlay}");
        assert!(overlay.contains("max_message_rate"), "{overlay}");
        assert!(overlay.contains("10/min"), "{overlay}");

        // The overlay is itself a valid shaping document
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(overlay.as_bytes()).unwrap();
        let shaping = Shaping::merge_files(
            &[file.path().to_str().unwrap().to_string()],
            &ShapingMergeOptions::default(),
        )
        .await
        .unwrap();
        assert!(shaping.get_errors().is_empty());
    }
}
