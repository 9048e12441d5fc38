use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, Arg, ArgAction};
use log::{error, info};

use knary::acme::AcmeManager;
use knary::certstore::CertStore;
use knary::certwatch::watch_certs;
use knary::config::{setup_logging, Config};
use knary::domains::DomainRegistry;
use knary::error::KnaryError;
use knary::filter::NotificationFilter;
use knary::lookup::discover_glue;
use knary::notify::{EventLog, EventRouter};
use knary::servers::{restart_channel, udp_server, Canary, Servers};
use knary::web::{http_server, https_server, proxy_server, ProxyScheme};
use knary::zone::ZoneStore;
use knary::{GlueAddr, VERSION};

fn print_banner() {
    println!(
        r#" __
|  |--.-----.---.-.----.--.--.
|    <|     |  _  |   _|  |  |
|__|__|__|__|___._|__| |___  |
 @sudosammy     v{VERSION} |_____|
"#
    );
}

#[tokio::main]
async fn main() -> Result<(), KnaryError> {
    let clap_results = command!()
        .arg(
            Arg::new("env-file")
                .long("env-file")
                .help("Load environment variables from this file instead of ./.env"),
        )
        .arg(
            Arg::new("config-check")
                .long("config-check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration and exit"),
        )
        .get_matches();

    // environment first, everything else reads from it
    match clap_results.get_one::<String>("env-file") {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|e| KnaryError::Startup(format!("failed to load {path}: {e}")))?;
        }
        // a missing default .env just means the environment is already set
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let config = Config::try_as_cowcell()?;
    let config_check = clap_results.get_flag("config-check");
    let _logger = setup_logging(config.read().await, config_check)?;

    if let Err(errors) = Config::check_config(config.write().await).await {
        for error in &errors {
            error!("{error}");
        }
        return Err(KnaryError::Startup(format!(
            "configuration is invalid: {}",
            errors.join("; ")
        )));
    }

    if config_check {
        let snapshot = config.read().await;
        println!("Config check OK: {}", *snapshot);
        return Ok(());
    }

    print_banner();

    let snapshot = config.read().await;
    if !snapshot.dns && !snapshot.http {
        return Err(KnaryError::Startup(
            "neither DNS nor HTTP is enabled, nothing to do".to_string(),
        ));
    }

    let registry = DomainRegistry::from_csv(&snapshot.canary_domains)?;
    let filter = NotificationFilter::load(
        snapshot.allowlist_file.as_deref(),
        snapshot.denylist_file.as_deref(),
        snapshot.allowlist_strict,
    );
    let zone = Arc::new(ZoneStore::new());
    if let Some(zone_file) = &snapshot.zone_file {
        // a broken zone file on startup is fatal
        zone.load(zone_file)?;
    }
    let events = EventRouter::from_webhooks(&snapshot.webhooks);
    let eventlog = EventLog::new(snapshot.log_file.clone());

    if snapshot.http {
        info!(
            "Listening for http(s)://*.{{{}}} requests",
            snapshot.canary_domains
        );
    }
    if snapshot.dns {
        match &snapshot.dns_subdomain {
            Some(sub) => info!(
                "Listening for *.{sub}.{{{}}} DNS requests",
                snapshot.canary_domains
            ),
            None => info!("Listening for *.{{{}}} DNS requests", snapshot.canary_domains),
        }
    }
    info!("Posting to {} webhook(s)", events.sink_count());

    // the IP we answer A questions with: EXT_IP, or go ask the root servers
    let glue = match (snapshot.ext_ip, snapshot.dns) {
        (Some(ip), _) => GlueAddr::from(ip),
        (None, true) => {
            let apex = registry.first().to_string();
            info!("EXT_IP unset, discovering the glue record for {apex}");
            let discovered = discover_glue(&apex).await?;
            info!("Answering DNS requests with: {discovered}");
            GlueAddr::from(std::net::IpAddr::V4(discovered))
        }
        (None, false) => GlueAddr::default(),
    };

    let canary = Arc::new(Canary {
        registry,
        filter,
        zone: zone.clone(),
        events: events.clone(),
        eventlog,
        glue,
    });

    let mut servers = Servers::build();

    // DNS comes up first: the dns-01 challenges below are answered by our
    // own responder
    if snapshot.dns {
        let dns_config = config.read().await;
        let dns_canary = canary.clone();
        servers = servers.with_udpserver(tokio::spawn(async move {
            udp_server(dns_config, dns_canary).await
        }));
    }
    drop(snapshot);

    // initial certificate acquisition, fatal on error
    let mut acme_manager: Option<Arc<AcmeManager>> = None;
    {
        let snapshot = config.read().await;
        if let Some(email) = snapshot.lets_encrypt.clone() {
            if !snapshot.dns {
                return Err(KnaryError::Startup(
                    "LETS_ENCRYPT needs the DNS listener to answer its own challenges".to_string(),
                ));
            }
            let store = CertStore::from_config(&snapshot);
            let manager = AcmeManager::new(store, &email, snapshot.le_env.directory_url());
            let name = manager.ensure_certificate(&zone, &snapshot).await?;

            let root = manager.store().root().to_path_buf();
            drop(snapshot);
            let mut writer = config.write().await;
            writer.tls_crt = Some(root.join(format!("{name}.crt")));
            writer.tls_key = Some(root.join(format!("{name}.key")));
            writer.commit().await;
            acme_manager = Some(Arc::new(manager));
        }
    }

    let snapshot = config.read().await;
    if snapshot.http {
        if snapshot.reverse_proxy_front() {
            // public proxies route by Host, loopback captures behind them
            servers.add_proxyserver(tokio::spawn(proxy_server(
                config.read().await,
                ProxyScheme::Http,
                None,
            )));
            servers = servers.with_httpserver(tokio::spawn(http_server(
                config.read().await,
                canary.clone(),
            )));
            if snapshot.tls_enabled() {
                let (restart_tx, restart_rx) = restart_channel();
                servers.add_proxyserver(tokio::spawn(proxy_server(
                    config.read().await,
                    ProxyScheme::Https,
                    Some(restart_rx),
                )));
                servers = servers.with_httpsserver(tokio::spawn(https_server(
                    config.read().await,
                    canary.clone(),
                    None,
                )));
                servers = spawn_certwatcher(servers, &snapshot, restart_tx, events.clone())?;
            }
        } else {
            servers = servers.with_httpserver(tokio::spawn(http_server(
                config.read().await,
                canary.clone(),
            )));
            if snapshot.tls_enabled() {
                let (restart_tx, restart_rx) = restart_channel();
                servers = servers.with_httpsserver(tokio::spawn(https_server(
                    config.read().await,
                    canary.clone(),
                    Some(restart_rx),
                )));
                servers = spawn_certwatcher(servers, &snapshot, restart_tx, events.clone())?;
            }
        }
    }

    // maintenance tickers run for the life of the process; the quit sender
    // lives here so they do too
    let (_quit_tx, quit_rx) = tokio::sync::mpsc::channel::<()>(1);
    let maintenance_config = Arc::new((*snapshot).clone());
    servers = servers.with_maintenance(tokio::spawn(knary::maintenance::run(
        maintenance_config,
        canary.clone(),
        acme_manager,
        quit_rx,
    )));
    drop(snapshot);

    // wait forever; a dead listener is a dead canary
    loop {
        if servers.any_finished() {
            error!("A listener has stopped, shutting down");
            return Err(KnaryError::Startup("listener terminated".to_string()));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn spawn_certwatcher(
    servers: Servers,
    config: &Config,
    restart_tx: tokio::sync::mpsc::Sender<()>,
    events: EventRouter,
) -> Result<Servers, KnaryError> {
    let dir: PathBuf = config
        .tls_crt
        .as_ref()
        .and_then(|crt| crt.parent().map(std::path::Path::to_path_buf))
        .ok_or_else(|| KnaryError::Startup("cannot watch a certless directory".to_string()))?;
    if !dir.is_dir() {
        return Err(KnaryError::Startup(format!(
            "certificate directory {dir:?} does not exist"
        )));
    }
    Ok(servers.with_certwatcher(tokio::spawn(async move {
        watch_certs(dir, restart_tx, events)
            .await
            .map_err(std::io::Error::from)
    })))
}
