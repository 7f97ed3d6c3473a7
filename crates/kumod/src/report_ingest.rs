//! Ingestion of out-of-band DSN reports (RFC 3464) and abuse/feedback
//! reports (RFC 5965) on listeners that are declared to log them.
use crate::logging::{log_disposition, LogDisposition};
use crate::policy::ListenerParams;
use kumo_log_types::rfc3464::Report;
use kumo_log_types::rfc5965::ARFReport;
use kumo_log_types::{RecordType, Response};
use message::Message;
use parking_lot::Mutex;
use spool::SpoolId;
use std::collections::HashMap;
use std::sync::LazyLock;

// Parsed reports are handed to the logging layer out-of-band of the
// LogDisposition arguments; the entry is consumed when the record is
// composed
static PENDING_ARF: LazyLock<Mutex<HashMap<SpoolId, Box<ARFReport>>>> =
    LazyLock::new(Mutex::default);
static PENDING_OOB: LazyLock<Mutex<HashMap<SpoolId, Box<Report>>>> =
    LazyLock::new(Mutex::default);

pub fn take_arf_report(msg: &Message) -> Option<Box<ARFReport>> {
    PENDING_ARF.lock().remove(msg.id())
}

pub fn take_oob_report(msg: &Message) -> Option<Box<Report>> {
    PENDING_OOB.lock().remove(msg.id())
}

/// What reception should do with the message after report processing
#[derive(Debug, PartialEq, Eq)]
pub enum ReportDisposition {
    /// Not parseable as a report; queue normally
    NotAReport,
    /// Parsed and logged; the message has served its purpose
    LoggedAndDiscard,
    /// Parsed and logged, and the listener wants it queued onward
    LoggedAndQueue,
}

/// Inspect a received message according to the listener's report
/// flags. On parse success a Feedback or OOB record is logged; on
/// parse failure the message is accepted and queued normally.
pub async fn process_report(msg: &Message, listener: &ListenerParams) -> ReportDisposition {
    if !listener.log_oob && !listener.log_arf {
        return ReportDisposition::NotAReport;
    }

    let data = msg.get_data();

    if listener.log_arf {
        match ARFReport::parse(&data) {
            Ok(Some(report)) => {
                PENDING_ARF.lock().insert(*msg.id(), Box::new(report));
                log_disposition(LogDisposition {
                    kind: RecordType::Feedback,
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
                    delivery_protocol: None,
                    provider: None,
                    session_id: None,
                })
                .await;
                return if listener.deferred_queue {
                    ReportDisposition::LoggedAndQueue
                } else {
                    ReportDisposition::LoggedAndDiscard
                };
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(
                    "unable to parse message from {} as ARF report: {err:#}. raw body: {:?}",
                    msg.sender()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| "<unknown>".to_string()),
                    String::from_utf8_lossy(&data)
                );
            }
        }
    }

    if listener.log_oob {
        match Report::parse(&data) {
            Ok(Some(report)) => {
                PENDING_OOB.lock().insert(*msg.id(), Box::new(report));
                log_disposition(LogDisposition {
                    kind: RecordType::OOB,
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
                    delivery_protocol: None,
                    provider: None,
                    session_id: None,
                })
                .await;
                return if listener.deferred_queue {
                    ReportDisposition::LoggedAndQueue
                } else {
                    ReportDisposition::LoggedAndDiscard
                };
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(
                    "unable to parse message as OOB report: {err:#}. raw body: {:?}",
                    String::from_utf8_lossy(&data)
                );
            }
        }
    }

    ReportDisposition::NotAReport
}
