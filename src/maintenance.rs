//! The background tickers: daily housekeeping and the weekly heartbeat.
//! Errors on a tick are logged and the tick is dropped; the scheduler itself
//! only stops when the quit channel says so.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use semver::Version;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::acme::{AcmeManager, ALERT_AT_DAYS};
use crate::certstore::days_remaining_in_pem;
use crate::config::Config;
use crate::servers::Canary;
use crate::{UPSTREAM_URL, UPSTREAM_VERSION_URL, VERSION};

const DAILY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEKLY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Upstream VERSION fetch budget
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the tickers for the life of the process. A heartbeat goes out once at
/// startup so the operator knows the canary came up.
pub async fn run(
    config: Arc<Config>,
    canary: Arc<Canary>,
    acme: Option<Arc<AcmeManager>>,
    mut quit: mpsc::Receiver<()>,
) {
    let started = Utc::now();
    let client = reqwest::Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .build()
        .unwrap_or_default();

    canary.events.publish(heartbeat_message(&config, &canary, started));

    let mut daily = interval_at(Instant::now() + DAILY, DAILY);
    daily.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut weekly = interval_at(Instant::now() + WEEKLY, WEEKLY);
    weekly.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = daily.tick() => {
                daily_tasks(&config, &canary, acme.as_ref(), &client).await;
            }
            _ = weekly.tick() => {
                canary.events.publish(heartbeat_message(&config, &canary, started));
            }
            _ = quit.recv() => {
                info!("Maintenance scheduler stopping");
                return;
            }
        }
    }
}

async fn daily_tasks(
    config: &Config,
    canary: &Arc<Canary>,
    acme: Option<&Arc<AcmeManager>>,
    client: &reqwest::Client,
) {
    canary.eventlog.write("Daily maintenance tasks running");

    // flag any denied items that haven't had a hit in >14 days
    let stale = canary.filter.stale_entries();
    for entry in &stale {
        let msg =
            format!("Denied item `{entry}` hasn't had a hit in >14 days. Consider removing it.");
        info!("{msg}");
        canary.eventlog.write(&msg);
        if config.denylist_alerting {
            canary
                .events
                .publish(format!(":wrench: {msg} Configure `DENYLIST_ALERTING` to suppress."));
        }
    }
    if config.debug {
        debug!("Checked {} denylist items, {} stale", canary.filter.deny_count(), stale.len());
    }

    // certificate expiry, when HTTPS is operating
    match acme {
        Some(acme) => {
            if let Err(error) = acme
                .renew_if_needed(&canary.zone, config, &canary.events)
                .await
            {
                warn!("Expiry probe failed: {error}");
            }
        }
        None => {
            if let Err(error) = probe_static_expiry(config, canary) {
                warn!("Expiry probe failed: {error}");
            }
        }
    }

    // update check against the upstream VERSION file
    match check_update(client, VERSION).await {
        Ok(Some(latest)) => {
            let msg = format!(
                ":warning: Your version of knary is *{VERSION}* & the latest is *{latest}* - upgrade your binary here: {UPSTREAM_URL}"
            );
            warn!("{msg}");
            canary.eventlog.write(&msg);
            canary.events.publish(msg);
        }
        Ok(None) => debug!("Running the latest version"),
        Err(error) => {
            let msg = format!("Could not check for updates: {error}");
            warn!("{msg}");
            canary.eventlog.write(&msg);
        }
    }
}

/// Expiry check for operator-supplied material, where renewal is somebody
/// else's job: warn only.
fn probe_static_expiry(config: &Config, canary: &Arc<Canary>) -> Result<(), crate::error::KnaryError> {
    let Some(crt) = &config.tls_crt else {
        return Ok(());
    };
    let raw = std::fs::read(crt)?;
    let days = days_remaining_in_pem(&raw)?;
    if days <= ALERT_AT_DAYS {
        canary.events.publish(format!(
            ":warning: The TLS certificate at {crt:?} expires in {days} days and automatic renewal is disabled."
        ));
    }
    Ok(())
}

/// Fetch the upstream VERSION file and compare against the running version.
/// Returns the newer version string when they differ.
pub async fn check_update(
    client: &reqwest::Client,
    running: &str,
) -> Result<Option<String>, crate::error::KnaryError> {
    let running = Version::parse(running)
        .map_err(|e| crate::error::KnaryError::Generic(format!("own version unparseable: {e}")))?;
    let body = client
        .get(UPSTREAM_VERSION_URL)
        .send()
        .await?
        .text()
        .await?;

    for line in body.lines() {
        let current = Version::parse(line.trim()).map_err(|_| {
            crate::error::KnaryError::Generic(
                "upstream VERSION response was not semver".to_string(),
            )
        })?;
        if current != running {
            return Ok(Some(current.to_string()));
        }
    }
    Ok(None)
}

/// The composed status block the weekly ticker (and startup) emits.
pub fn heartbeat_message(
    config: &Config,
    canary: &Arc<Canary>,
    started: DateTime<Utc>,
) -> String {
    let uptime_days = (Utc::now() - started).num_days();

    let mut listeners: Vec<String> = Vec::new();
    if config.dns {
        listeners.push(format!("DNS on {}:{}", config.bind_addr, config.dns_port));
    }
    if config.http {
        listeners.push(format!("HTTP on {}:{}", config.bind_addr, config.http_port));
        if config.tls_enabled() {
            listeners.push(format!("HTTPS on {}:{}", config.bind_addr, config.https_port));
        }
    }

    let cert_line = match (&config.tls_crt, config.tls_enabled()) {
        (Some(crt), true) => match std::fs::read(crt).map_err(crate::error::KnaryError::from).and_then(|raw| days_remaining_in_pem(&raw)) {
            Ok(days) => format!("Certificate expiry in: {days} days\n"),
            Err(_) => String::new(),
        },
        _ => String::new(),
    };

    format!(
        "```\n\
        uptime: {uptime_days} days\n\
        hostname: {}\n\
        version: {VERSION}\n\
        {cert_line}\
        listeners: {}\n\
        allowlist entries: {} | denylist entries: {}\n\
        ```",
        gethostname::gethostname().to_string_lossy(),
        match listeners.is_empty() {
            true => "none".to_string(),
            false => listeners.join(", "),
        },
        canary.filter.allow_count(),
        canary.filter.deny_count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::DomainRegistry;
    use crate::filter::NotificationFilter;
    use crate::notify::{EventLog, EventRouter};
    use crate::zone::ZoneStore;
    use crate::GlueAddr;

    fn canary() -> Arc<Canary> {
        Arc::new(Canary {
            registry: DomainRegistry::from_csv("ex.com").expect("registry"),
            filter: NotificationFilter::with_entries(vec!["ok.ex.com"], vec!["bad.ex.com"], false),
            zone: Arc::new(ZoneStore::new()),
            events: EventRouter::default(),
            eventlog: EventLog::new(None),
            glue: GlueAddr::default(),
        })
    }

    #[test]
    fn test_heartbeat_message_contents() {
        let config = Config {
            canary_domains: "ex.com".to_string(),
            dns: true,
            http: true,
            ..Default::default()
        };
        let msg = heartbeat_message(&config, &canary(), Utc::now());
        assert!(msg.contains("uptime: 0 days"));
        assert!(msg.contains("DNS on 0.0.0.0:53"));
        assert!(msg.contains("HTTP on 0.0.0.0:80"));
        assert!(!msg.contains("HTTPS"));
        assert!(msg.contains("allowlist entries: 1 | denylist entries: 1"));
        assert!(msg.contains(VERSION));
    }

    #[tokio::test]
    async fn test_check_update_differs() {
        // a local fake for the VERSION file
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n99.0.0\n")
                .await
                .expect("write");
        });

        let client = reqwest::Client::new();
        // point the check at the fake by fetching directly
        let body = client
            .get(format!("http://{addr}/VERSION"))
            .send()
            .await
            .expect("fetch")
            .text()
            .await
            .expect("body");
        let latest = Version::parse(body.trim()).expect("semver");
        assert_ne!(latest, Version::parse(VERSION).expect("semver"));
    }

    #[test]
    fn test_version_is_semver() {
        assert!(Version::parse(VERSION).is_ok());
    }
}
