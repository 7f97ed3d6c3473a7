//! The HTTP API: message injection, metrics and admin operations.
use crate::logging::{log_disposition, LogDisposition};
use crate::policy::ListenerParams;
use crate::queue::QueueManager;
use crate::report_ingest::{process_report, ReportDisposition};
use crate::spool::SpoolManager;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use kumo_log_types::{RecordType, Response};
use kumo_server_common::http_server::AppError;
use message::{EnvelopeAddress, Message};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

async fn probe_handler(State(_p): State<Arc<ListenerParams>>, Json(_r): Json<InjectV1Request>) -> Json<InjectV1Response> {
    Json(InjectV1Response{success_count:0, fail_count:0, failed_recipients:vec![], message_ids:vec![]})
}

pub fn make_router(listener: ListenerParams) -> Router {
    Router::<Arc<ListenerParams>>::new()
        .route("/api/inject/v1", post(inject_v1))
        .route("/probe", post(probe_handler))
        .route("/api/admin/reload/v1", post(reload_v1))
        .route("/metrics", get(report_metrics))
        .with_state(Arc::new(listener))
}

pub async fn start(params: &ListenerParams) -> anyhow::Result<SocketAddr> {
    let router = make_router(params.clone());
    kumo_server_common::http_server::spawn_http_listener(params.listen, router).await
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct InjectV1Request {
    pub envelope_sender: String,
    pub recipients: Vec<String>,
    /// The fully formed message content
    pub content: String,
    /// Assigned to the `queue` metadata, overriding the computed
    /// queue name
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub routing_domain: Option<String>,
    /// Require the spool writes to be fully flushed before the
    /// injection response is produced
    #[serde(default)]
    pub force_sync: bool,
}

#[derive(Serialize, Debug)]
pub struct InjectV1Response {
    pub success_count: usize,
    pub fail_count: usize,
    pub failed_recipients: Vec<String>,
    pub message_ids: Vec<String>,
}

/// Accept a message for delivery.
/// The envelope is expanded to one logical message per recipient;
/// the recipients share the body buffer but are spooled, scheduled,
/// retried and retired independently.
async fn inject_v1(
    State(listener): State<Arc<ListenerParams>>,
    Json(request): Json<InjectV1Request>,
) -> Result<Json<InjectV1Response>, AppError> {
    let sender = EnvelopeAddress::parse(&request.envelope_sender)?;
    let body: Arc<Box<[u8]>> = Arc::new(request.content.clone().into_bytes().into_boxed_slice());

    let mut response = InjectV1Response {
        success_count: 0,
        fail_count: 0,
        failed_recipients: vec![],
        message_ids: vec![],
    };

    for recipient_str in &request.recipients {
        match inject_one(&listener, &request, &sender, recipient_str, body.clone()).await {
            Ok(id) => {
                response.success_count += 1;
                response.message_ids.push(id);
            }
            Err(err) => {
                tracing::error!("failed to inject for {recipient_str}: {err:#}");
                response.fail_count += 1;
                response.failed_recipients.push(recipient_str.to_string());
            }
        }
    }

    Ok(Json(response))
}

async fn inject_one(
    listener: &ListenerParams,
    request: &InjectV1Request,
    sender: &EnvelopeAddress,
    recipient: &str,
    body: Arc<Box<[u8]>>,
) -> anyhow::Result<String> {
    let recipient = EnvelopeAddress::parse(recipient)?;
    let mut meta = serde_json::json!({});
    if let Some(queue) = &request.queue {
        meta["queue"] = queue.to_string().into();
    }
    if let Some(tenant) = &request.tenant {
        meta["tenant"] = tenant.to_string().into();
    }
    if let Some(campaign) = &request.campaign {
        meta["campaign"] = campaign.to_string().into();
    }
    if let Some(routing_domain) = &request.routing_domain {
        meta["routing_domain"] = routing_domain.to_string().into();
    }

    let msg = Message::new_dirty(sender.clone(), recipient, meta, body)?;
    if request.force_sync {
        msg.set_force_sync(true);
    }
    let id = msg.id().to_string();

    // Reports are consumed (or rerouted) when the listener is
    // flagged for report ingestion
    match process_report(&msg, listener).await {
        ReportDisposition::LoggedAndDiscard => {
            return Ok(id);
        }
        ReportDisposition::NotAReport | ReportDisposition::LoggedAndQueue => {}
    }

    msg.save().await?;

    log_disposition(LogDisposition {
        kind: RecordType::Reception,
        msg: msg.clone(),
        site: "",
        peer_address: None,
        response: Response {
            code: 250,
            enhanced_code: None,
            content: "ok".to_string(),
            command: None,
        },
        egress_pool: None,
        egress_source: None,
        delivery_protocol: Some("HTTP"),
        provider: None,
        session_id: None,
    })
    .await;

    let queue_name = msg.get_queue_name()?;
    if let Err(err) = QueueManager::insert(&queue_name, msg.clone()).await {
        // We cannot accept responsibility for a message that we
        // cannot queue: unwind the spool and surface a Bounce record
        // so the logs explain what happened to it
        SpoolManager::remove_from_spool(*msg.id()).await.ok();
        log_disposition(LogDisposition {
            kind: RecordType::Bounce,
            msg: msg.clone(),
            site: "",
            peer_address: None,
            response: Response {
                code: 500,
                enhanced_code: None,
                content: format!("Internal: queue insert failed during reception: {err:#}"),
                command: None,
            },
            egress_pool: None,
            egress_source: None,
            delivery_protocol: None,
            provider: None,
            session_id: None,
        })
        .await;
        return Err(err);
    }

    Ok(id)
}

/// Re-read the policy file and bump the config epoch, purging the
/// epoch-subscribed caches. Validation errors leave the previous
/// config in effect.
async fn reload_v1() -> Result<String, AppError> {
    match crate::reload_policy() {
        Ok(()) => {
            kumo_server_common::epoch::bump_current_epoch();
            Ok("reloaded\n".to_string())
        }
        Err(err) => {
            tracing::error!("policy reload failed; keeping previous config: {err:#}");
            Err(err.into())
        }
    }
}

async fn report_metrics() -> Result<String, AppError> {
    let encoder = prometheus::TextEncoder::new();
    Ok(encoder.encode_to_string(&prometheus::gather())?)
}
