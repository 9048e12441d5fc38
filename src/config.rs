use concread::cowcell::asynch::{CowCell, CowCellReadTxn, CowCellWriteTxn};
use config::{Config as ConfigSource, Environment};
use flexi_logger::filter::{LogLineFilter, LogLineWriter};
use flexi_logger::{DeferredNow, LoggerHandle};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::error::KnaryError;

/// Which ACME directory we talk to, from `LE_ENV`.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone, Copy, Default)]
pub enum LeEnv {
    #[default]
    Production,
    Staging,
    Dev,
}

impl LeEnv {
    pub fn directory_url(&self) -> &'static str {
        match self {
            LeEnv::Production => "https://acme-v02.api.letsencrypt.org/directory",
            LeEnv::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
            // a local pebble/boulder dev stack
            LeEnv::Dev => "http://127.0.0.1:4001/directory",
        }
    }
}

impl From<&str> for LeEnv {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "staging" => LeEnv::Staging,
            "dev" => LeEnv::Dev,
            _ => LeEnv::Production,
        }
    }
}

/// The immutable runtime configuration, materialised from the environment
/// once at startup. Nothing reads `std::env` after this is built; the two
/// sanctioned mutations (clearing `LETS_ENCRYPT` on conflict, installing the
/// acquired certificate paths) happen through a CowCell write transaction
/// before any listener starts.
#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
pub struct Config {
    /// Comma-separated apex list, required
    pub canary_domains: String,
    /// Overrides glue-record self-discovery
    pub ext_ip: Option<IpAddr>,
    /// Listener bind address, default 0.0.0.0
    pub bind_addr: String,
    /// Enable the DNS listener
    pub dns: bool,
    /// Enable the HTTP(S) listeners
    pub http: bool,
    /// PEM paths; both set enables HTTPS
    pub tls_crt: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// ACME account email; set enables certificate management
    pub lets_encrypt: Option<String>,
    pub le_env: LeEnv,
    /// Gate DNS notifications to `*.<sub>.<apex>`
    pub dns_subdomain: Option<String>,
    /// The apex routed to the reverse-proxy upstreams
    pub reverse_proxy_domain: Option<String>,
    /// Upstream `host:port` values
    pub reverse_proxy_http: Option<String>,
    pub reverse_proxy_https: Option<String>,
    pub reverse_proxy_dns: Option<String>,
    /// One entry per line
    pub allowlist_file: Option<PathBuf>,
    pub denylist_file: Option<PathBuf>,
    /// Disable allowlist suffix matching
    pub allowlist_strict: bool,
    /// Denylist aging reminders, on by default
    pub denylist_alerting: bool,
    /// RFC 1035 master format
    pub zone_file: Option<PathBuf>,
    pub debug: bool,
    /// Include the raw request text in HTTP notifications
    pub full_http_request: bool,
    /// Append-only event log
    pub log_file: Option<PathBuf>,
    /// HTTP read deadline in seconds
    pub timeout: u64,
    /// (label, url) pairs for the JSON-posting webhook sinks
    pub webhooks: Vec<(String, Url)>,
    // Listener ports are fixed in production; configurable so tests can bind
    // ephemeral ports.
    pub dns_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    /// Loopback capture ports used in reverse-proxy front mode
    pub proxy_inner_http_port: u16,
    pub proxy_inner_https_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            canary_domains: String::new(),
            ext_ip: None,
            bind_addr: "0.0.0.0".to_string(),
            dns: false,
            http: false,
            tls_crt: None,
            tls_key: None,
            lets_encrypt: None,
            le_env: LeEnv::Production,
            dns_subdomain: None,
            reverse_proxy_domain: None,
            reverse_proxy_http: None,
            reverse_proxy_https: None,
            reverse_proxy_dns: None,
            allowlist_file: None,
            denylist_file: None,
            allowlist_strict: false,
            denylist_alerting: true,
            zone_file: None,
            debug: false,
            full_http_request: false,
            log_file: None,
            timeout: 2,
            webhooks: vec![],
            dns_port: 53,
            http_port: 80,
            https_port: 443,
            proxy_inner_http_port: 8880,
            proxy_inner_https_port: 8843,
        }
    }
}

impl Config {
    /// Build from the process environment. Per-key fallbacks keep the
    /// defaults when a variable is unset or unparseable.
    pub fn from_env() -> Result<Config, KnaryError> {
        let source = ConfigSource::builder()
            .add_source(Environment::default())
            .build()
            .map_err(|e| KnaryError::Config(format!("failed to read environment: {e}")))?;

        // a present-but-malformed EXT_IP is fatal, not a silent fallback to
        // glue discovery
        let ext_ip = match source.get::<String>("ext_ip") {
            Ok(raw) => Some(IpAddr::from_str(&raw).map_err(|e| {
                KnaryError::Config(format!("EXT_IP {raw:?} is not an IP address: {e}"))
            })?),
            Err(_) => None,
        };

        let mut config = Config::from(source);
        config.ext_ip = ext_ip;
        Ok(config)
    }

    /// Uses [Self::from_env] and wraps it in a CowCell (moo)
    pub fn try_as_cowcell() -> Result<CowCell<Config>, KnaryError> {
        Ok(CowCell::new(Config::from_env()?))
    }

    /// Get a bindable SocketAddr for the DNS listener
    pub fn dns_listener_address(&self) -> Result<SocketAddr, KnaryError> {
        format!("{}:{}", self.bind_addr, self.dns_port)
            .parse()
            .map_err(|e| KnaryError::Config(format!("failed to parse bind address: {e}")))
    }

    pub fn http_listener_address(&self, port: u16) -> Result<SocketAddr, KnaryError> {
        format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| KnaryError::Config(format!("failed to parse bind address: {e}")))
    }

    /// HTTPS is active when a certificate pair is on disk (whether operator
    /// supplied or ACME acquired).
    pub fn tls_enabled(&self) -> bool {
        self.tls_crt.is_some() && self.tls_key.is_some()
    }

    pub fn reverse_proxy_front(&self) -> bool {
        self.reverse_proxy_http.is_some() || self.reverse_proxy_https.is_some()
    }

    /// Startup validation. Mutations (conflicting `LETS_ENCRYPT` cleared)
    /// are committed through the write transaction; hard errors are
    /// collected and fatal to startup.
    pub async fn check_config(
        mut config: CowCellWriteTxn<'_, Config>,
    ) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = vec![];

        if config.canary_domains.trim().is_empty() {
            errors.push("CANARY_DOMAIN is required and must name at least one domain".to_string());
        }

        if config.lets_encrypt.is_some() && (config.tls_crt.is_some() || config.tls_key.is_some())
        {
            log::warn!(
                "Ignoring LETS_ENCRYPT because TLS_CRT/TLS_KEY are set - remove one or the other"
            );
            config.lets_encrypt = None;
        }

        if config.tls_crt.is_some() != config.tls_key.is_some() {
            errors.push("TLS_CRT and TLS_KEY must be set together".to_string());
        }

        if config.tls_enabled() && config.lets_encrypt.is_none() {
            for path in [&config.tls_crt, &config.tls_key].into_iter().flatten() {
                if !path.exists() {
                    errors.push(format!("Failed to find TLS material: {path:?}"));
                }
            }
        }

        if config.reverse_proxy_front() && config.reverse_proxy_domain.is_none() {
            errors.push(
                "REVERSE_PROXY_HTTP/HTTPS need REVERSE_PROXY_DOMAIN to route by".to_string(),
            );
        }

        config.commit().await;
        match errors.is_empty() {
            true => Ok(()),
            false => Err(errors),
        }
    }
}

impl From<ConfigSource> for Config {
    fn from(config: ConfigSource) -> Self {
        let defaults = Config::default();

        let le_env = config
            .get::<String>("le_env")
            .map(|raw| LeEnv::from(raw.as_str()))
            .unwrap_or_default();

        let mut webhooks: Vec<(String, Url)> = vec![];
        for label in ["slack_webhook", "discord_webhook", "teams_webhook"] {
            if let Ok(raw) = config.get::<String>(label) {
                match Url::parse(&raw) {
                    Ok(url) => webhooks.push((label.to_string(), url)),
                    Err(error) => {
                        log::warn!("Ignoring unparseable {label}: {error}")
                    }
                }
            }
        }

        Config {
            canary_domains: config.get("canary_domain").unwrap_or_default(),
            ext_ip: None,
            bind_addr: config.get("bind_addr").unwrap_or(defaults.bind_addr),
            dns: config.get("dns").unwrap_or_default(),
            http: config.get("http").unwrap_or_default(),
            tls_crt: config.get("tls_crt").ok(),
            tls_key: config.get("tls_key").ok(),
            lets_encrypt: config.get("lets_encrypt").ok(),
            le_env,
            dns_subdomain: config.get("dns_subdomain").ok(),
            reverse_proxy_domain: config.get("reverse_proxy_domain").ok(),
            reverse_proxy_http: config.get("reverse_proxy_http").ok(),
            reverse_proxy_https: config.get("reverse_proxy_https").ok(),
            reverse_proxy_dns: config.get("reverse_proxy_dns").ok(),
            allowlist_file: config.get("allowlist_file").ok(),
            denylist_file: config.get("denylist_file").ok(),
            allowlist_strict: config.get("allowlist_strict").unwrap_or_default(),
            denylist_alerting: config
                .get("denylist_alerting")
                .unwrap_or(defaults.denylist_alerting),
            zone_file: config.get("zone_file").ok(),
            debug: config.get("debug").unwrap_or_default(),
            full_http_request: config.get("full_http_request").unwrap_or_default(),
            log_file: config.get("log_file").ok(),
            timeout: config.get("timeout").unwrap_or(defaults.timeout),
            webhooks,
            dns_port: defaults.dns_port,
            http_port: defaults.http_port,
            https_port: defaults.https_port,
            proxy_inner_http_port: defaults.proxy_inner_http_port,
            proxy_inner_https_port: defaults.proxy_inner_https_port,
        }
    }
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let https = match self.tls_enabled() {
            true => format!(" tls_cert={:?} tls_key={:?}", self.tls_crt, self.tls_key),
            false => String::new(),
        };
        f.write_fmt(format_args!(
            "domains=\"{}\" bind_addr=\"{}\" dns={} http={}{https} lets_encrypt={:?} webhooks={}",
            self.canary_domains,
            self.bind_addr,
            self.dns,
            self.http,
            self.lets_encrypt,
            self.webhooks.len(),
        ))
    }
}

pub fn setup_logging(
    config: CowCellReadTxn<Config>,
    config_check: bool,
) -> Result<LoggerHandle, KnaryError> {
    // force the log level to info if we're testing config
    let log_level = match (config_check, config.debug) {
        (true, _) => "info",
        (false, true) => "debug",
        (false, false) => "info",
    };

    flexi_logger::Logger::try_with_str(log_level)
        .map_err(|e| KnaryError::Startup(format!("failed to start logger: {e}")))?
        .write_mode(flexi_logger::WriteMode::Async)
        .filter(Box::new(LogFilter {
            filters: vec!["h2", "hyper", "rustls", "reqwest"],
        }))
        .set_palette("b1;3;2;6;5".to_string())
        .start()
        .map_err(|e| KnaryError::Startup(format!("failed to start logger: {e}")))
}

pub struct LogFilter {
    filters: Vec<&'static str>,
}

impl LogLineFilter for LogFilter {
    fn write(
        &self,
        now: &mut DeferredNow,
        record: &log::Record,
        log_line_writer: &dyn LogLineWriter,
    ) -> std::io::Result<()> {
        if self
            .filters
            .iter()
            .any(|r| record.metadata().target().starts_with(r))
        {
            return Ok(());
        }
        log_line_writer.write(now, record)?;
        Ok(())
    }
}
