use crate::rfc3464::Report;
use crate::rfc5965::ARFReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

pub mod rfc3464;
pub mod rfc5965;

/// The SMTP-shaped response that concluded a delivery attempt, or a
/// synthesized internal response describing a local decision.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_enhanced_code"
    )]
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }

        for c in self.content.chars() {
            match c {
                '\r' => line.push_str("\\r"),
                '\n' => line.push_str("\\n"),
                c => line.push(c),
            }
        }

        line
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

mod opt_enhanced_code {
    use super::EnhancedStatusCode;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        code: &Option<EnhancedStatusCode>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match code {
            Some(code) => s.serialize_str(&format!(
                "{}.{}.{}",
                code.class, code.subject, code.detail
            )),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<EnhancedStatusCode>, D::Error> {
        let text = Option::<String>::deserialize(d)?;
        match text {
            None => Ok(None),
            Some(text) => {
                let mut fields = text.split('.');
                let invalid = || serde::de::Error::custom("invalid enhanced status code");
                let class = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(invalid)?;
                let subject = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(invalid)?;
                let detail = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(invalid)?;
                Ok(Some(EnhancedStatusCode {
                    class,
                    subject,
                    detail,
                }))
            }
        }
    }
}

/// The address of a peer, along with our sense of its hostname
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub name: String,
    pub addr: IpAddr,
}

impl std::fmt::Display for ResolvedAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let addr = self.addr.to_string();
        if addr == self.name {
            write!(fmt, "{addr}")
        } else {
            write!(fmt, "{}/{addr}", self.name)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RecordType {
    /// Recorded by a receiving listener
    Reception,
    /// Recorded by the delivery side, most likely as a
    /// result of attempting a delivery to a remote host
    Delivery,
    Bounce,
    TransientFailure,
    /// Recorded when a message is expiring from the queue
    Expiration,
    /// Administratively failed
    AdminBounce,
    /// Contains information about an OOB bounce
    OOB,
    /// Contains a feedback report
    Feedback,
    /// Listener responded with a 4xx or 5xx
    Rejection,
    /// Administratively rebound from one queue to another
    AdminRebind,
    /// Recorded when a message is delayed into its scheduled queue
    Delayed,
    /// Special for matching anything in the logging config
    Any,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonLogRecord {
    /// What kind of record this is
    #[serde(rename = "type")]
    pub kind: RecordType,
    /// The message id
    pub id: String,
    /// The envelope sender
    pub sender: String,
    /// The envelope recipient
    pub recipient: String,
    /// Which named queue the message was associated with
    pub queue: String,
    /// Which MX site the message was being delivered to
    pub site: String,
    /// The size of the message, in bytes
    pub size: u64,
    /// The response from/to the peer
    pub response: Response,
    /// The address of the peer, and our sense of its
    /// hostname or EHLO domain
    pub peer_address: Option<ResolvedAddress>,
    /// The time at which we are logging this event
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// The time at which the message was initially received and created
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    /// The number of delivery attempts that have been made.
    /// Note that this may be approximate after a restart; use the
    /// number of logged events to determine the true number
    pub num_attempts: u16,

    pub egress_pool: Option<String>,
    pub egress_source: Option<String>,

    pub feedback_report: Option<Box<ARFReport>>,
    pub oob_report: Option<Box<Report>>,

    pub meta: HashMap<String, Value>,
    pub headers: HashMap<String, Value>,

    /// The protocol used to deliver, or attempt to deliver, this message
    pub delivery_protocol: Option<String>,

    /// The protocol used to receive this message
    pub reception_protocol: Option<String>,

    /// The id of the node on which the event occurred
    pub nodeid: Uuid,

    /// The provider name, if any; a way of grouping destination
    /// sites operated by the same provider
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider_name: Option<String>,

    /// Uuid identifying the delivery session, when applicable.
    /// Useful to correlate a series of messages sent on the
    /// same connection
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<Uuid>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_single_line() {
        let response = Response {
            code: 451,
            enhanced_code: Some(EnhancedStatusCode {
                class: 4,
                subject: 7,
                detail: 1,
            }),
            content: "try again\r\nlater".to_string(),
            command: None,
        };
        k9::assert_equal!(response.to_single_line(), "451 4.7.1 try again\\rlater");
        assert!(response.is_transient());
        assert!(!response.is_permanent());
    }

    #[test]
    fn response_serde() {
        let response = Response {
            code: 550,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 1,
                detail: 1,
            }),
            content: "no such user".to_string(),
            command: Some("RCPT TO".to_string()),
        };
        let json = serde_json::to_string(&response).unwrap();
        k9::snapshot!(
            &json,
            r#"{"code":550,"enhanced_code":"5.1.1","content":"no such user","command":"RCPT TO"}"#
        );
        let round: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(round, response);
    }
}
