use ordermap::OrderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use throttle::{LimitSpec, ThrottleSpec};

/// How the TLS handshake on an outbound connection is negotiated
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Copy)]
pub enum Tls {
    /// Use it if available. If the peer has invalid or self-signed
    /// certificates, then delivery will fail. Will NOT fall back to
    /// clear text if the peer advertises STARTTLS.
    Opportunistic,
    /// Use it if available, and allow self-signed or otherwise invalid
    /// server certs. Not recommended for sending to the public internet.
    OpportunisticInsecure,
    /// TLS with valid certs is required
    Required,
    /// Required, but allow self-signed or otherwise invalid server certs
    RequiredInsecure,
    /// Do not try to use TLS
    Disabled,
}

impl Tls {
    pub fn allow_insecure(&self) -> bool {
        matches!(self, Self::OpportunisticInsecure | Self::RequiredInsecure)
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required | Self::RequiredInsecure)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self::Opportunistic
    }
}

/// Governs when a cached config value is refreshed: after its ttl
/// expires, or when the config epoch changes
#[derive(Deserialize, Serialize, Debug, Clone, Default, Copy, PartialEq, Eq)]
pub enum ConfigRefreshStrategy {
    #[default]
    Ttl,
    Epoch,
}

/// Timeouts for the stages of an outbound delivery session
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SmtpClientTimeouts {
    #[serde(
        default = "SmtpClientTimeouts::default_connect_timeout",
        with = "duration_serde"
    )]
    pub connect_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_banner_timeout",
        with = "duration_serde"
    )]
    pub banner_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_ehlo_timeout",
        with = "duration_serde"
    )]
    pub ehlo_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_mail_from_timeout",
        with = "duration_serde"
    )]
    pub mail_from_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_rcpt_to_timeout",
        with = "duration_serde"
    )]
    pub rcpt_to_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_data_timeout",
        with = "duration_serde"
    )]
    pub data_timeout: Duration,

    #[serde(
        default = "SmtpClientTimeouts::default_starttls_timeout",
        with = "duration_serde"
    )]
    pub starttls_timeout: Duration,

    /// How long a connection may sit idle, waiting for another
    /// message to deliver, before it is closed
    #[serde(
        default = "SmtpClientTimeouts::default_idle_timeout",
        with = "duration_serde"
    )]
    pub idle_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            banner_timeout: Self::default_banner_timeout(),
            ehlo_timeout: Self::default_ehlo_timeout(),
            mail_from_timeout: Self::default_mail_from_timeout(),
            rcpt_to_timeout: Self::default_rcpt_to_timeout(),
            data_timeout: Self::default_data_timeout(),
            starttls_timeout: Self::default_starttls_timeout(),
            idle_timeout: Self::default_idle_timeout(),
        }
    }
}

impl SmtpClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_banner_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_ehlo_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_mail_from_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rcpt_to_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_starttls_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

/// The effective configuration for an egress path: the collection of
/// options that shape traffic for a (source, site_name) pair.
/// Every option in a shaping document must correspond to a field here;
/// shaping load round-trips each block through this struct to catch
/// typos and type errors early.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EgressPathConfig {
    #[serde(default = "EgressPathConfig::default_connection_limit")]
    pub connection_limit: LimitSpec,

    /// Additional connection limits, keyed by name. Unlike
    /// `connection_limit` these merge across shaping layers, allowing
    /// broader scoped limits that cut across sites
    #[serde(default)]
    pub additional_connection_limits: OrderMap<String, LimitSpec>,

    #[serde(default)]
    pub enable_tls: Tls,

    #[serde(flatten)]
    pub client_timeouts: SmtpClientTimeouts,

    /// Maximum number of messages that can sit in the ready queue
    /// awaiting dispatch
    #[serde(default = "EgressPathConfig::default_max_ready")]
    pub max_ready: usize,

    #[serde(default = "EgressPathConfig::default_consecutive_connection_failures_before_delay")]
    pub consecutive_connection_failures_before_delay: usize,

    #[serde(default = "EgressPathConfig::default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub max_message_rate: Option<ThrottleSpec>,

    /// Additional message rate throttles, keyed by name; these merge
    /// across shaping layers like additional_connection_limits
    #[serde(default)]
    pub additional_message_rate_throttles: OrderMap<String, ThrottleSpec>,

    #[serde(default)]
    pub max_connection_rate: Option<ThrottleSpec>,

    #[serde(default = "EgressPathConfig::default_max_deliveries_per_connection")]
    pub max_deliveries_per_connection: usize,

    #[serde(default)]
    pub ehlo_domain: Option<String>,

    /// How long to wait between re-resolving the egress path config
    /// for any given ready queue
    #[serde(
        default = "EgressPathConfig::default_refresh_interval",
        with = "duration_serde"
    )]
    pub refresh_interval: Duration,

    #[serde(default)]
    pub refresh_strategy: ConfigRefreshStrategy,

    /// An explicit provider name applying to this path, used when
    /// grouping metrics by provider
    #[serde(default)]
    pub provider_name: Option<String>,
}

impl Default for EgressPathConfig {
    fn default() -> Self {
        Self {
            connection_limit: Self::default_connection_limit(),
            additional_connection_limits: OrderMap::default(),
            enable_tls: Tls::default(),
            client_timeouts: SmtpClientTimeouts::default(),
            max_ready: Self::default_max_ready(),
            consecutive_connection_failures_before_delay:
                Self::default_consecutive_connection_failures_before_delay(),
            smtp_port: Self::default_smtp_port(),
            max_message_rate: None,
            additional_message_rate_throttles: OrderMap::default(),
            max_connection_rate: None,
            max_deliveries_per_connection: Self::default_max_deliveries_per_connection(),
            ehlo_domain: None,
            refresh_interval: Self::default_refresh_interval(),
            refresh_strategy: ConfigRefreshStrategy::default(),
            provider_name: None,
        }
    }
}

impl EgressPathConfig {
    fn default_connection_limit() -> LimitSpec {
        LimitSpec::new(32)
    }

    fn default_max_ready() -> usize {
        1024
    }

    fn default_consecutive_connection_failures_before_delay() -> usize {
        100
    }

    fn default_smtp_port() -> u16 {
        25
    }

    fn default_max_deliveries_per_connection() -> usize {
        1024
    }

    fn default_refresh_interval() -> Duration {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config: EgressPathConfig = toml::from_str("").unwrap();
        assert_eq!(config, EgressPathConfig::default());
        assert_eq!(config.connection_limit, LimitSpec::new(32));
        assert_eq!(config.enable_tls, Tls::Opportunistic);
    }

    #[test]
    fn parse_options() {
        let config: EgressPathConfig = toml::from_str(
            r#"
connection_limit = 10
enable_tls = "Required"
max_deliveries_per_connection = 50
max_message_rate = "120/s"
idle_timeout = "90s"
additional_connection_limits = {"shared-limit"=32}
"#,
        )
        .unwrap();
        assert_eq!(config.connection_limit, LimitSpec::new(10));
        assert_eq!(config.enable_tls, Tls::Required);
        assert_eq!(config.max_deliveries_per_connection, 50);
        assert_eq!(
            config.max_message_rate,
            Some(ThrottleSpec::try_from("120/s").unwrap())
        );
        assert_eq!(
            config.client_timeouts.idle_timeout,
            Duration::from_secs(90)
        );
        assert_eq!(
            config.additional_connection_limits.get("shared-limit"),
            Some(&LimitSpec::new(32))
        );
    }

    #[test]
    fn unknown_options_are_rejected() {
        let err = toml::from_str::<EgressPathConfig>("no_such_option = true").unwrap_err();
        assert!(err.to_string().contains("no_such_option"), "{err:#}");
    }
}
