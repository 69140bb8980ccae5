//! Relay configuration.
//!
//! [`RelayConfigBuilder`] collects broker connection parameters, the fallback
//! store location, and the reconnect/reconcile timings, then validates them
//! into a [`RelayConfig`]. Configuration may also be loaded from an INI file
//! with `[relay]`, `[broker]`, `[fallback]`, and `[reconcile]` sections.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};

use ini::Ini;
use thiserror::Error;

use crate::{
    codec::WireFormat, rate_limited_warner::DEFAULT_WARN_INTERVAL,
    transport::ReconnectPolicy,
};

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;
/// Default timeout for establishing the broker connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default time to wait for a publisher confirm.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Default AMQP heartbeat in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u16 = 60;
/// Default interval between reconciler ticks.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Errors raised while building or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to parse ini: {0}")]
    Ini(String),
}

/// Broker connection parameters.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Exchange to publish to. Empty selects the default exchange.
    pub exchange: String,
    /// Queue declared (and bound) when `declare_topology` is set.
    pub queue: String,
    pub routing_key: String,
    /// Connect with `amqps`.
    pub tls: bool,
    pub connect_timeout: Duration,
    /// Upper bound on a single publish, including the confirm round-trip.
    pub publish_timeout: Duration,
    pub heartbeat: u16,
    pub declare_topology: bool,
    pub wire_format: WireFormat,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            username: "guest".into(),
            password: "guest".into(),
            virtual_host: "/".into(),
            exchange: String::new(),
            queue: String::new(),
            routing_key: String::new(),
            tls: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            declare_topology: true,
            wire_format: WireFormat::default(),
        }
    }
}

impl BrokerConfig {
    /// Routing key used on publish.
    ///
    /// With the default exchange and no explicit key, messages are routed
    /// straight to `queue`.
    pub fn effective_routing_key(&self) -> &str {
        if self.routing_key.is_empty() && self.exchange.is_empty() {
            &self.queue
        } else {
            &self.routing_key
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .field("heartbeat", &self.heartbeat)
            .field("declare_topology", &self.declare_topology)
            .field("wire_format", &self.wire_format)
            .finish()
    }
}

/// Validated configuration for a [`FemtoRelay`](crate::relay::FemtoRelay).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// When false, [`FemtoRelay::start`](crate::relay::FemtoRelay::start)
    /// does nothing.
    pub enabled: bool,
    pub broker: BrokerConfig,
    pub fallback_path: PathBuf,
    pub sync_on_append: bool,
    pub reconcile_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub warn_interval: Duration,
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    /// Load configuration from an INI file.
    pub fn from_ini_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ini_str(&text)
    }

    /// Load configuration from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Ini(e.to_string()))?;
        let mut builder = RelayConfigBuilder::new();
        for (section, props) in ini.iter() {
            let section = section.unwrap_or_default();
            for (key, value) in props.iter() {
                builder = builder.apply_ini_key(section, key, value)?;
            }
        }
        builder.build()
    }
}

/// Builder for [`RelayConfig`].
#[derive(Clone, Debug)]
pub struct RelayConfigBuilder {
    enabled: bool,
    broker: BrokerConfig,
    fallback_path: Option<PathBuf>,
    sync_on_append: bool,
    reconcile_interval: Duration,
    reconnect: ReconnectPolicy,
    warn_interval: Duration,
}

impl Default for RelayConfigBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: BrokerConfig::default(),
            fallback_path: None,
            sync_on_append: false,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            warn_interval: DEFAULT_WARN_INTERVAL,
        }
    }
}

impl RelayConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.broker.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.broker.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.broker.username = username.into();
        self.broker.password = password.into();
        self
    }

    pub fn with_virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.broker.virtual_host = vhost.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.broker.exchange = exchange.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.broker.queue = queue.into();
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.broker.routing_key = key.into();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.broker.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.broker.connect_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.broker.publish_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, secs: u16) -> Self {
        self.broker.heartbeat = secs;
        self
    }

    pub fn with_declare_topology(mut self, declare: bool) -> Self {
        self.broker.declare_topology = declare;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.broker.wire_format = format;
        self
    }

    pub fn with_fallback_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_path = Some(path.into());
        self
    }

    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect.base_delay = delay;
        self
    }

    pub fn with_warn_interval(mut self, interval: Duration) -> Self {
        self.warn_interval = interval;
        self
    }

    fn apply_ini_key(self, section: &str, key: &str, value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        let builder = match (section, key) {
            ("relay", "enabled") => self.enabled(parse_bool(key, value)?),
            ("broker", "host") => self.with_host(value),
            ("broker", "port") => self.with_port(parse_num(key, value)?),
            ("broker", "username") => {
                let password = self.broker.password.clone();
                self.with_credentials(value, password)
            }
            ("broker", "password") => {
                let username = self.broker.username.clone();
                self.with_credentials(username, value)
            }
            ("broker", "virtual_host") => self.with_virtual_host(value),
            ("broker", "exchange") => self.with_exchange(value),
            ("broker", "queue") => self.with_queue(value),
            ("broker", "routing_key") => self.with_routing_key(value),
            ("broker", "tls") => self.with_tls(parse_bool(key, value)?),
            ("broker", "connect_timeout_ms") => {
                self.with_connect_timeout(Duration::from_millis(parse_num(key, value)?))
            }
            ("broker", "publish_timeout_ms") => {
                self.with_publish_timeout(Duration::from_millis(parse_num(key, value)?))
            }
            ("broker", "heartbeat_secs") => self.with_heartbeat(parse_num(key, value)?),
            ("broker", "declare_topology") => self.with_declare_topology(parse_bool(key, value)?),
            ("broker", "wire_format") => self.with_wire_format(
                value.parse().map_err(ConfigError::InvalidConfig)?,
            ),
            ("fallback", "path") => self.with_fallback_path(value),
            ("fallback", "sync_on_append") => self.with_sync_on_append(parse_bool(key, value)?),
            ("reconcile", "interval_secs") => {
                self.with_reconcile_interval(Duration::from_secs(parse_num(key, value)?))
            }
            ("reconcile", "max_reconnect_attempts") => {
                self.with_max_reconnect_attempts(parse_num(key, value)?)
            }
            ("reconcile", "reconnect_base_delay_ms") => {
                self.with_reconnect_base_delay(Duration::from_millis(parse_num(key, value)?))
            }
            ("reconcile", "warn_interval_secs") => {
                self.with_warn_interval(Duration::from_secs(parse_num(key, value)?))
            }
            _ => {
                return Err(ConfigError::InvalidConfig(format!(
                    "unknown key {key} in section [{section}]"
                )));
            }
        };
        Ok(builder)
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_owned()));
        if self.broker.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.broker.port == 0 {
            return invalid("port must be greater than zero");
        }
        if self.broker.exchange.is_empty() && self.broker.queue.is_empty() {
            return invalid("an exchange or a queue must be configured");
        }
        let Some(fallback_path) = self.fallback_path.filter(|p| !p.as_os_str().is_empty())
        else {
            return invalid("fallback path must be set");
        };
        if self.reconcile_interval.is_zero() {
            return invalid("reconcile interval must be greater than zero");
        }
        if self.reconnect.max_attempts == 0 {
            return invalid("max reconnect attempts must be greater than zero");
        }
        if self.broker.publish_timeout.is_zero() || self.broker.connect_timeout.is_zero() {
            return invalid("timeouts must be greater than zero");
        }
        Ok(RelayConfig {
            enabled: self.enabled,
            broker: self.broker,
            fallback_path,
            sync_on_append: self.sync_on_append,
            reconcile_interval: self.reconcile_interval,
            reconnect: self.reconnect,
            warn_interval: self.warn_interval,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidConfig(format!(
            "{key} must be a boolean, got {value:?}"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidConfig(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn minimal() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
            .with_queue("logs")
            .with_fallback_path("/tmp/femtorelay.log")
    }

    #[rstest]
    fn defaults_match_documented_values() {
        let cfg = minimal().build().expect("valid config");
        assert!(cfg.enabled);
        assert_eq!(cfg.broker.port, DEFAULT_PORT);
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(60));
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(100));
        assert_eq!(cfg.broker.effective_routing_key(), "logs");
    }

    #[rstest]
    #[case(minimal().with_host(" "), "host")]
    #[case(minimal().with_port(0), "port")]
    #[case(RelayConfigBuilder::new().with_fallback_path("x.log"), "exchange or a queue")]
    #[case(RelayConfigBuilder::new().with_queue("logs"), "fallback path")]
    #[case(minimal().with_reconcile_interval(Duration::ZERO), "reconcile interval")]
    #[case(minimal().with_max_reconnect_attempts(0), "max reconnect")]
    #[case(minimal().with_publish_timeout(Duration::ZERO), "timeouts")]
    fn build_rejects_invalid_values(#[case] builder: RelayConfigBuilder, #[case] needle: &str) {
        let err = builder.build().expect_err("config must be rejected");
        assert!(
            matches!(&err, ConfigError::InvalidConfig(msg) if msg.contains(needle)),
            "unexpected error: {err}"
        );
    }

    #[rstest]
    fn explicit_routing_key_wins() {
        let cfg = minimal()
            .with_exchange("logs-x")
            .with_routing_key("app.logs")
            .build()
            .expect("valid config");
        assert_eq!(cfg.broker.effective_routing_key(), "app.logs");
    }

    #[rstest]
    fn debug_output_redacts_password() {
        let cfg = minimal()
            .with_credentials("svc", "hunter2")
            .build()
            .expect("valid config");
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[rstest]
    fn loads_from_ini() {
        let text = "\
[relay]
enabled = yes

[broker]
host = rabbit.internal
port = 5671
username = svc
password = secret
exchange = logs-x
queue = logs
routing_key = app
tls = true
publish_timeout_ms = 250
wire_format = msgpack

[fallback]
path = /var/log/app/fallback.log

[reconcile]
interval_secs = 30
max_reconnect_attempts = 3
reconnect_base_delay_ms = 50
";
        let cfg = RelayConfig::from_ini_str(text).expect("parse ini");
        assert_eq!(cfg.broker.host, "rabbit.internal");
        assert_eq!(cfg.broker.port, 5671);
        assert_eq!(cfg.broker.username, "svc");
        assert_eq!(cfg.broker.password, "secret");
        assert!(cfg.broker.tls);
        assert_eq!(cfg.broker.publish_timeout, Duration::from_millis(250));
        assert_eq!(cfg.broker.wire_format, WireFormat::MessagePack);
        assert_eq!(cfg.fallback_path, PathBuf::from("/var/log/app/fallback.log"));
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(30));
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(50));
    }

    #[rstest]
    #[case("[broker]\nqueue = logs\ncolour = blue\n", "unknown key colour")]
    #[case("[broker]\nport = many\n", "port must be a number")]
    #[case("[relay]\nenabled = maybe\n", "enabled must be a boolean")]
    fn ini_rejects_bad_entries(#[case] text: &str, #[case] needle: &str) {
        let err = RelayConfig::from_ini_str(text).expect_err("ini must be rejected");
        assert!(err.to_string().contains(needle), "unexpected error: {err}");
    }

    #[rstest]
    fn ini_disabled_relay_still_validates() {
        let text = "[relay]\nenabled = false\n[broker]\nqueue = q\n[fallback]\npath = f.log\n";
        let cfg = RelayConfig::from_ini_str(text).expect("parse ini");
        assert!(!cfg.enabled);
    }
}
