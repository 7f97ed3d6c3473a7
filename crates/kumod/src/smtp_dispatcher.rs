//! Drives the SMTP client collaborator for a ready queue.
//! The wire protocol itself lives behind the SmtpClientFactory trait;
//! this module owns the connection plan (candidate MX addresses in
//! preference order), shaping-driven throttles and the translation of
//! delivery outcomes into queue state transitions.
use crate::logging::{log_disposition, LogDisposition};
use crate::ready_queue::{Dispatcher, QueueDispatcher};
use crate::spool::SpoolManager;
use async_trait::async_trait;
use dns_resolver::ResolvedMxAddresses;
use kumo_api_types::egress_path::{SmtpClientTimeouts, Tls};
use kumo_log_types::{RecordType, ResolvedAddress, Response};
use message::Message;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// The outcome of one delivery attempt, as reported by the SMTP
/// client collaborator
#[derive(Debug, Clone)]
pub enum DeliveryResult {
    Delivered(Response),
    Transient(Response),
    Permanent(Response),
}

/// Everything the SMTP client needs in order to establish a session
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub source_name: String,
    pub source_address: Option<std::net::IpAddr>,
    pub address: ResolvedAddress,
    pub port: u16,
    pub ehlo_domain: String,
    pub enable_tls: Tls,
    pub timeouts: SmtpClientTimeouts,
}

/// An established delivery session
#[async_trait]
pub trait SmtpConnection: Send {
    /// Attempt to deliver `msg` on this session
    async fn deliver(&mut self, msg: &Message) -> anyhow::Result<DeliveryResult>;

    /// Politely close the session
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// The SMTP wire protocol collaborator.
/// Implementations own connection establishment, including the TLS
/// negotiation dictated by `enable_tls`: the Required variants must
/// fail the connection attempt when TLS cannot be established.
#[async_trait]
pub trait SmtpClientFactory: Send + Sync {
    async fn connect(&self, params: ConnectionParams) -> anyhow::Result<Box<dyn SmtpConnection>>;
}

static FACTORY: OnceLock<Arc<dyn SmtpClientFactory>> = OnceLock::new();

/// Install the SMTP client implementation.
/// May be called only once, at startup.
pub fn set_smtp_client_factory(factory: Arc<dyn SmtpClientFactory>) -> anyhow::Result<()> {
    FACTORY
        .set(factory)
        .map_err(|_| anyhow::anyhow!("smtp client factory already configured"))
}

fn get_smtp_client_factory() -> anyhow::Result<Arc<dyn SmtpClientFactory>> {
    FACTORY
        .get()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no smtp client factory has been configured"))
}

pub struct SmtpDispatcher {
    /// Remaining candidate addresses, in *reverse* preference order;
    /// we pop from the end
    addresses: Vec<ResolvedAddress>,
    connection: Option<Box<dyn SmtpConnection>>,
    peer_address: Option<ResolvedAddress>,
    session_id: Uuid,
}

impl SmtpDispatcher {
    /// Resolve the connection plan for the dispatcher's site.
    /// Returns Ok(None) when there is nothing useful a connection
    /// could do, in which case the ready queue contents have already
    /// been disposed of appropriately.
    pub async fn init(dispatcher: &mut Dispatcher) -> anyhow::Result<Option<Self>> {
        let mx = match &dispatcher.mx {
            Some(mx) => mx.clone(),
            None => {
                anyhow::bail!("smtp dispatcher requires resolved mx records");
            }
        };

        let addresses = match mx.resolve_addresses().await {
            ResolvedMxAddresses::NullMx => {
                // A null MX advertises that the domain never accepts
                // mail; that is a permanent condition
                dispatcher
                    .bulk_ready_queue_operation(Response {
                        code: 556,
                        enhanced_code: Some(kumo_log_types::EnhancedStatusCode {
                            class: 5,
                            subject: 1,
                            detail: 10,
                        }),
                        content: "Recipient address has a null MX".to_string(),
                        command: None,
                    })
                    .await;
                return Ok(None);
            }
            ResolvedMxAddresses::Addresses(addresses) => addresses,
        };

        if addresses.is_empty() {
            dispatcher
                .bulk_ready_queue_operation(Response {
                    code: 451,
                    enhanced_code: Some(kumo_log_types::EnhancedStatusCode {
                        class: 4,
                        subject: 4,
                        detail: 4,
                    }),
                    content: "MX didn't resolve to any hosts".to_string(),
                    command: None,
                })
                .await;
            return Ok(None);
        }

        Ok(Some(Self {
            addresses,
            connection: None,
            peer_address: None,
            session_id: Uuid::new_v4(),
        }))
    }
}

#[async_trait]
impl QueueDispatcher for SmtpDispatcher {
    async fn attempt_connection(&mut self, dispatcher: &mut Dispatcher) -> anyhow::Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let address = self
            .addresses
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no more connection candidates"))?;

        let path_config = dispatcher.path_config.borrow();
        let ehlo_domain = path_config
            .ehlo_domain
            .clone()
            .or_else(|| dispatcher.egress_source.ehlo_domain.clone())
            .unwrap_or_else(|| "localhost".to_string());

        let params = ConnectionParams {
            source_name: dispatcher.egress_source.name.clone(),
            source_address: dispatcher.egress_source.source_address,
            address: address.clone(),
            port: dispatcher
                .egress_source
                .remote_port
                .unwrap_or(path_config.smtp_port),
            ehlo_domain,
            enable_tls: path_config.enable_tls,
            timeouts: path_config.client_timeouts,
        };
        drop(path_config);

        let connection = get_smtp_client_factory()?.connect(params).await?;

        self.connection.replace(connection);
        self.peer_address.replace(address);
        dispatcher.metrics.connection_gauge.inc();
        Ok(())
    }

    async fn have_more_connection_candidates(&mut self, _dispatcher: &mut Dispatcher) -> bool {
        !self.addresses.is_empty()
    }

    async fn close_connection(&mut self, dispatcher: &mut Dispatcher) -> anyhow::Result<bool> {
        match self.connection.take() {
            Some(mut connection) => {
                connection.close().await.ok();
                dispatcher.metrics.connection_gauge.dec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deliver_message(
        &mut self,
        msg: Message,
        dispatcher: &mut Dispatcher,
    ) -> anyhow::Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("deliver_message called without a connection"))?;

        let result = connection.deliver(&msg).await;

        match result {
            Err(err) => {
                // A session-level error: the connection is no longer
                // usable, and the message outcome is unknown, so it is
                // treated as a transient failure of this attempt
                self.connection.take();
                dispatcher.metrics.connection_gauge.dec();
                Err(err)
            }
            Ok(DeliveryResult::Delivered(response)) => {
                dispatcher.metrics.msgs_delivered.inc();
                log_disposition(LogDisposition {
                    kind: RecordType::Delivery,
                    msg: msg.clone(),
                    site: &dispatcher.name,
                    peer_address: self.peer_address.as_ref(),
                    response,
                    egress_pool: Some(&dispatcher.egress_pool),
                    egress_source: Some(&dispatcher.egress_source.name),
                    delivery_protocol: Some("ESMTP"),
                    provider: dispatcher.path_config.borrow().provider_name.as_deref(),
                    session_id: Some(self.session_id),
                })
                .await;
                dispatcher.msg.take();
                let id = *msg.id();
                tokio::spawn(async move { SpoolManager::remove_from_spool(id).await });
                Ok(())
            }
            Ok(DeliveryResult::Transient(response)) => {
                dispatcher.metrics.msgs_transfail.inc();
                log_disposition(LogDisposition {
                    kind: RecordType::TransientFailure,
                    msg: msg.clone(),
                    site: &dispatcher.name,
                    peer_address: self.peer_address.as_ref(),
                    response,
                    egress_pool: Some(&dispatcher.egress_pool),
                    egress_source: Some(&dispatcher.egress_source.name),
                    delivery_protocol: Some("ESMTP"),
                    provider: dispatcher.path_config.borrow().provider_name.as_deref(),
                    session_id: Some(self.session_id),
                })
                .await;
                dispatcher.msg.take();
                if let Err(err) =
                    Dispatcher::requeue_message(msg, true, None).await
                {
                    tracing::error!("error requeuing message: {err:#}");
                }
                Ok(())
            }
            Ok(DeliveryResult::Permanent(response)) => {
                dispatcher.metrics.msgs_fail.inc();
                log_disposition(LogDisposition {
                    kind: RecordType::Bounce,
                    msg: msg.clone(),
                    site: &dispatcher.name,
                    peer_address: self.peer_address.as_ref(),
                    response,
                    egress_pool: Some(&dispatcher.egress_pool),
                    egress_source: Some(&dispatcher.egress_source.name),
                    delivery_protocol: Some("ESMTP"),
                    provider: dispatcher.path_config.borrow().provider_name.as_deref(),
                    session_id: Some(self.session_id),
                })
                .await;
                dispatcher.msg.take();
                let id = *msg.id();
                tokio::spawn(async move { SpoolManager::remove_from_spool(id).await });
                Ok(())
            }
        }
    }
}
