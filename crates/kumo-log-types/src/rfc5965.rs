//! Parsing of RFC 5965 Abuse Reporting Format (ARF) messages,
//! as used by feedback loops
use crate::rfc3464::{
    content_type, extract_date, extract_single, extract_single_req, header_groups, RemoteMta,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct ARFReport {
    pub feedback_type: String,
    pub user_agent: String,
    pub version: String,

    #[serde(default)]
    pub arrival_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub incidents: Option<u32>,
    #[serde(default)]
    pub original_envelope_id: Option<String>,
    #[serde(default)]
    pub original_mail_from: Option<String>,
    #[serde(default)]
    pub reporting_mta: Option<RemoteMta>,
    #[serde(default)]
    pub source_ip: Option<String>,

    #[serde(default)]
    pub authentication_results: Vec<String>,
    #[serde(default)]
    pub original_rcpt_to: Vec<String>,
    #[serde(default)]
    pub reported_domain: Vec<String>,
    #[serde(default)]
    pub reported_uri: Vec<String>,

    pub extensions: BTreeMap<String, Vec<String>>,

    pub original_message: Option<String>,
}

impl ARFReport {
    /// Attempt to parse `input` as a feedback report.
    /// Returns Ok(None) when the message is well formed but is not
    /// an ARF report.
    pub fn parse(input: &[u8]) -> anyhow::Result<Option<Self>> {
        let mail = mailparse::parse_mail(input).context("parsing message")?;

        if content_type(&mail) != "multipart/report"
            || mail.ctype.params.get("report-type").map(|s| s.as_str())
                != Some("feedback-report")
        {
            return Ok(None);
        }

        let report_part = match mail
            .subparts
            .iter()
            .find(|part| content_type(part) == "message/feedback-report")
        {
            Some(part) => part,
            None => return Ok(None),
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

        let body = report_part
            .get_body()
            .context("decoding feedback-report body")?;
        let mut groups = header_groups(&body);
        anyhow::ensure!(!groups.is_empty(), "feedback-report part has no fields");
        let mut group = groups.remove(0);

        Ok(Some(Self {
            feedback_type: extract_single_req("feedback-type", &mut group)?,
            user_agent: extract_single_req("user-agent", &mut group)?,
            version: extract_single_req("version", &mut group)?,
            arrival_date: extract_date("arrival-date", &mut group)?,
            incidents: extract_single("incidents", &mut group)?,
            original_envelope_id: extract_single("original-envelope-id", &mut group)?,
            original_mail_from: extract_single("original-mail-from", &mut group)?,
            reporting_mta: extract_single("reporting-mta", &mut group)?,
            source_ip: extract_single("source-ip", &mut group)?,
            authentication_results: group.remove("authentication-results").unwrap_or_default(),
            original_rcpt_to: group.remove("original-rcpt-to").unwrap_or_default(),
            reported_domain: group.remove("reported-domain").unwrap_or_default(),
            reported_uri: group.remove("reported-uri").unwrap_or_default(),
            extensions: group,
            original_message,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ARF: &str = concat!(
        "From: <abusedesk@example.com>\r\n",
        "To: <report@mailprovider.example.net>\r\n",
        "Subject: FW: Earn money\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/report; report-type=feedback-report;\r\n",
        "\tboundary=\"part1_13d.2e68ed54_boundary\"\r\n",
        "\r\n",
        "--part1_13d.2e68ed54_boundary\r\n",
        "Content-Type: text/plain; charset=US-ASCII\r\n",
        "\r\n",
        "This is an email abuse report.\r\n",
        "\r\n",
        "--part1_13d.2e68ed54_boundary\r\n",
        "Content-Type: message/feedback-report\r\n",
        "\r\n",
        "Feedback-Type: abuse\r\n",
        "User-Agent: SomeGenerator/1.0\r\n",
        "Version: 1\r\n",
        "Original-Mail-From: <somespammer@example.net>\r\n",
        "Original-Rcpt-To: <user@example.com>\r\n",
        "Arrival-Date: Thu, 8 Mar 2005 14:00:00 EST\r\n",
        "Reporting-MTA: dns; mail.example.com\r\n",
        "Source-IP: 192.0.2.1\r\n",
        "Authentication-Results: mail.example.com; spf=fail\r\n",
        "Reported-Domain: example.net\r\n",
        "\r\n",
        "--part1_13d.2e68ed54_boundary\r\n",
        "Content-Type: message/rfc822\r\n",
        "\r\n",
        "Subject: Earn money\r\n",
        "\r\n",
        "spam spam spam\r\n",
        "--part1_13d.2e68ed54_boundary--\r\n",
    );

    #[test]
    fn parse_arf() {
        let report = ARFReport::parse(ARF.as_bytes()).unwrap().unwrap();
        assert_eq!(report.feedback_type, "abuse");
        assert_eq!(report.user_agent, "SomeGenerator/1.0");
        assert_eq!(report.version, "1");
        assert_eq!(
            report.original_mail_from.as_deref(),
            Some("<somespammer@example.net>")
        );
        assert_eq!(report.original_rcpt_to, vec!["<user@example.com>"]);
        assert_eq!(report.source_ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(report.reported_domain, vec!["example.net"]);
        assert!(report.original_message.is_some());
    }

    #[test]
    fn not_an_arf() {
        let plain = b"Subject: hello\r\n\r\nnothing to see\r\n";
        assert!(ARFReport::parse(plain).unwrap().is_none());
    }
}
