//! Parsing of RFC 3464 delivery status notifications from an
//! email message
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use mailparse::ParsedMail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ReportAction {
    Failed,
    Delayed,
    Delivered,
    Relayed,
    Expanded,
}

impl FromStr for ReportAction {
    type Err = anyhow::Error;
    fn from_str(input: &str) -> anyhow::Result<Self> {
        Ok(match input {
            "failed" => Self::Failed,
            "delayed" => Self::Delayed,
            "delivered" => Self::Delivered,
            "relayed" => Self::Relayed,
            "expanded" => Self::Expanded,
            _ => anyhow::bail!("invalid action type {input}"),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct ReportStatus {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
    pub comment: Option<String>,
}

impl FromStr for ReportStatus {
    type Err = anyhow::Error;
    fn from_str(input: &str) -> anyhow::Result<Self> {
        let (code, comment) = match input.split_once(' ') {
            Some((code, comment)) => (code, Some(comment.to_string())),
            None => (input, None),
        };

        let mut status = code.split('.');
        let class = status
            .next()
            .ok_or_else(|| anyhow!("invalid Status: {input}"))?
            .parse()
            .context("parsing status.class")?;
        let subject = status
            .next()
            .ok_or_else(|| anyhow!("invalid Status: {input}"))?
            .parse()
            .context("parsing status.subject")?;
        let detail = status
            .next()
            .ok_or_else(|| anyhow!("invalid Status: {input}"))?
            .parse()
            .context("parsing status.detail")?;

        Ok(Self {
            class,
            subject,
            detail,
            comment,
        })
    }
}

/// An "mta-name-type; mta-name" pair, eg: "dns; mx.example.com"
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct RemoteMta {
    pub mta_type: String,
    pub name: String,
}

impl FromStr for RemoteMta {
    type Err = anyhow::Error;
    fn from_str(input: &str) -> anyhow::Result<Self> {
        let (mta_type, name) = input
            .split_once(';')
            .ok_or_else(|| anyhow!("expected 'name-type; name', got {input}"))?;
        Ok(Self {
            mta_type: mta_type.trim().to_string(),
            name: name.trim().to_string(),
        })
    }
}

/// A "diagnostic-type; text" pair, eg: "smtp; 550 5.1.1 no such user"
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct DiagnosticCode {
    pub diagnostic_type: String,
    pub diagnostic: String,
}

impl FromStr for DiagnosticCode {
    type Err = anyhow::Error;
    fn from_str(input: &str) -> anyhow::Result<Self> {
        let (diagnostic_type, diagnostic) = input
            .split_once(';')
            .ok_or_else(|| anyhow!("expected 'diagnostic-type; text', got {input}"))?;
        Ok(Self {
            diagnostic_type: diagnostic_type.trim().to_string(),
            diagnostic: diagnostic.trim().to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct PerMessageReportEntry {
    pub reporting_mta: RemoteMta,
    #[serde(default)]
    pub original_envelope_id: Option<String>,
    #[serde(default)]
    pub dsn_gateway: Option<RemoteMta>,
    #[serde(default)]
    pub received_from_mta: Option<RemoteMta>,
    #[serde(default)]
    pub arrival_date: Option<DateTime<Utc>>,
    pub extensions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct PerRecipientReportEntry {
    pub final_recipient: String,
    pub action: ReportAction,
    pub status: ReportStatus,
    #[serde(default)]
    pub original_recipient: Option<String>,
    #[serde(default)]
    pub remote_mta: Option<RemoteMta>,
    #[serde(default)]
    pub diagnostic_code: Option<DiagnosticCode>,
    #[serde(default)]
    pub last_attempt_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_log_id: Option<String>,
    #[serde(default)]
    pub will_retry_until: Option<DateTime<Utc>>,
    pub extensions: BTreeMap<String, Vec<String>>,
}

/// An RFC 3464 delivery status report
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct Report {
    pub per_message: PerMessageReportEntry,
    pub per_recipient: Vec<PerRecipientReportEntry>,
    pub original_message: Option<String>,
}

pub(crate) fn content_type(mail: &ParsedMail) -> String {
    mail.ctype.mimetype.to_ascii_lowercase()
}

impl Report {
    /// Attempt to parse `input` as a delivery status report.
    /// Returns Ok(None) when the message is well formed but is not
    /// a DSN.
    pub fn parse(input: &[u8]) -> anyhow::Result<Option<Self>> {
        let mail = mailparse::parse_mail(input).context("parsing message")?;

        let status_part = match content_type(&mail).as_str() {
            "multipart/report" => {
                if mail.ctype.params.get("report-type").map(|s| s.as_str())
                    != Some("delivery-status")
                {
                    return Ok(None);
                }
                match mail
                    .subparts
                    .iter()
                    .find(|part| content_type(part) == "message/delivery-status")
                {
                    Some(part) => part,
                    None => return Ok(None),
                }
            }
            "message/delivery-status" => &mail,
            _ => return Ok(None),
        };

        let original_message = mail
            .subparts
            .iter()
            .find(|part| {
                matches!(
                    content_type(part).as_str(),
                    "message/rfc822" | "text/rfc822-headers"
                )
            })
            .and_then(|part| part.get_body().ok());

        let body = status_part
            .get_body()
            .context("decoding delivery-status body")?;
        let mut groups = header_groups(&body);
        anyhow::ensure!(
            !groups.is_empty(),
            "delivery-status part contains no fields"
        );

        let per_message = parse_per_message(groups.remove(0))?;
        let mut per_recipient = vec![];
        for group in groups {
            per_recipient.push(parse_per_recipient(group)?);
        }

        Ok(Some(Self {
            per_message,
            per_recipient,
            original_message,
        }))
    }
}

type FieldGroup = BTreeMap<String, Vec<String>>;

/// Split the body of a delivery-status (or feedback-report) part into
/// its blank-line separated groups of header-style fields
pub(crate) fn header_groups(body: &str) -> Vec<FieldGroup> {
    let mut groups = vec![];
    let mut current = FieldGroup::new();
    let mut last_name: Option<String> = None;

    for line in body.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            last_name = None;
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the prior field
            if let Some(name) = &last_name {
                if let Some(values) = current.get_mut(name) {
                    if let Some(value) = values.last_mut() {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                }
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        current
            .entry(name.clone())
            .or_default()
            .push(value.trim().to_string());
        last_name = Some(name);
    }

    if !current.is_empty() {
        groups.push(current);
    }

    groups
}

pub(crate) fn extract_single<T>(name: &str, group: &mut FieldGroup) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match group.remove(name) {
        None => Ok(None),
        Some(mut values) => {
            anyhow::ensure!(
                values.len() == 1,
                "expected exactly one {name} field, got {values:?}"
            );
            let value = values.remove(0);
            value
                .parse::<T>()
                .map(Some)
                .map_err(|err| anyhow!("invalid {name} value '{value}': {err}"))
        }
    }
}

pub(crate) fn extract_single_req<T>(name: &str, group: &mut FieldGroup) -> anyhow::Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    extract_single(name, group)?.ok_or_else(|| anyhow!("missing required field {name}"))
}

pub(crate) fn extract_date(
    name: &str,
    group: &mut FieldGroup,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    match extract_single::<String>(name, group)? {
        None => Ok(None),
        Some(value) => {
            let epoch = mailparse::dateparse(&value)
                .map_err(|err| anyhow!("invalid {name} date '{value}': {err}"))?;
            Ok(DateTime::<Utc>::from_timestamp(epoch, 0))
        }
    }
}

fn parse_per_message(mut group: FieldGroup) -> anyhow::Result<PerMessageReportEntry> {
    Ok(PerMessageReportEntry {
        reporting_mta: extract_single_req("reporting-mta", &mut group)?,
        original_envelope_id: extract_single("original-envelope-id", &mut group)?,
        dsn_gateway: extract_single("dsn-gateway", &mut group)?,
        received_from_mta: extract_single("received-from-mta", &mut group)?,
        arrival_date: extract_date("arrival-date", &mut group)?,
        extensions: group,
    })
}

fn parse_per_recipient(mut group: FieldGroup) -> anyhow::Result<PerRecipientReportEntry> {
    let final_recipient: String = extract_single_req("final-recipient", &mut group)?;
    // "rfc822; user@example.com" -> "user@example.com"
    let final_recipient = match final_recipient.split_once(';') {
        Some((_type, addr)) => addr.trim().to_string(),
        None => final_recipient,
    };
    let original_recipient: Option<String> = extract_single("original-recipient", &mut group)?;
    let original_recipient = original_recipient.map(|addr| match addr.split_once(';') {
        Some((_type, addr)) => addr.trim().to_string(),
        None => addr,
    });

    Ok(PerRecipientReportEntry {
        final_recipient,
        action: extract_single_req("action", &mut group)?,
        status: extract_single_req("status", &mut group)?,
        original_recipient,
        remote_mta: extract_single("remote-mta", &mut group)?,
        diagnostic_code: extract_single("diagnostic-code", &mut group)?,
        last_attempt_date: extract_date("last-attempt-date", &mut group)?,
        final_log_id: extract_single("final-log-id", &mut group)?,
        will_retry_until: extract_date("will-retry-until", &mut group)?,
        extensions: group,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const DSN: &str = concat!(
        "Subject: Returned mail\r\n",
        "From: MAILER-DAEMON@example.net\r\n",
        "To: sender@example.com\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/report; report-type=delivery-status;\r\n",
        "\tboundary=\"JAA13167.773673707/example.net\"\r\n",
        "\r\n",
        "--JAA13167.773673707/example.net\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "Your message could not be delivered.\r\n",
        "\r\n",
        "--JAA13167.773673707/example.net\r\n",
        "Content-Type: message/delivery-status\r\n",
        "\r\n",
        "Reporting-MTA: dns; mx.example.net\r\n",
        "Arrival-Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n",
        "\r\n",
        "Final-Recipient: rfc822; louisl@larry.slip.umd.edu\r\n",
        "Action: failed\r\n",
        "Status: 4.0.0\r\n",
        "Diagnostic-Code: smtp; 426 connection timed out\r\n",
        "Last-Attempt-Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n",
        "\r\n",
        "--JAA13167.773673707/example.net\r\n",
        "Content-Type: message/rfc822\r\n",
        "\r\n",
        "Subject: original\r\n",
        "\r\n",
        "body\r\n",
        "--JAA13167.773673707/example.net--\r\n",
    );

    #[test]
    fn parse_dsn() {
        let report = Report::parse(DSN.as_bytes()).unwrap().unwrap();
        assert_eq!(
            report.per_message.reporting_mta,
            RemoteMta {
                mta_type: "dns".to_string(),
                name: "mx.example.net".to_string(),
            }
        );
        assert_eq!(report.per_recipient.len(), 1);
        let recip = &report.per_recipient[0];
        assert_eq!(recip.final_recipient, "louisl@larry.slip.umd.edu");
        assert_eq!(recip.action, ReportAction::Failed);
        assert_eq!(
            recip.status,
            ReportStatus {
                class: 4,
                subject: 0,
                detail: 0,
                comment: None,
            }
        );
        assert_eq!(
            recip.diagnostic_code,
            Some(DiagnosticCode {
                diagnostic_type: "smtp".to_string(),
                diagnostic: "426 connection timed out".to_string(),
            })
        );
        assert!(report.original_message.is_some());
    }

    #[test]
    fn not_a_dsn() {
        let plain = b"Subject: hello\r\n\r\njust a message\r\n";
        assert!(Report::parse(plain).unwrap().is_none());
    }

    #[test]
    fn status_with_comment() {
        let status: ReportStatus = "5.1.1 (no such user)".parse().unwrap();
        assert_eq!(status.class, 5);
        assert_eq!(status.comment.as_deref(), Some("(no such user)"));
    }
}
