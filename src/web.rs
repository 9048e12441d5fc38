//! The HTTP(S) side of the canary. Not a web framework in sight: the capture
//! path reads one buffer off the socket, splits header lines and replies with
//! a single space. In reverse-proxy front mode a public-facing proxy routes
//! by Host suffix and the capture path listens on loopback behind it.

use concread::cowcell::asynch::CowCellReadTxn;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::error::KnaryError;
use crate::servers::Canary;
use crate::{domains::DomainRegistry, HTTP_BUFFER_SIZE};

const METHOD_TOKENS: [&str; 8] = [
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT",
];

/// The header subset pulled out of one captured request.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HttpInteraction {
    /// visible host:port, reconstructed against the external port
    pub host: String,
    /// the request line, eg `GET / HTTP/1.1`
    pub query: String,
    /// the whole `User-Agent:` header line
    pub user_agent: String,
    /// the whole `Cookie:` header line
    pub cookie: String,
    /// the X-Forwarded-For chain, filtered to entries containing a colon
    pub forwarded_for: String,
}

/// Split a raw request on LF and pull the interesting headers if any line
/// mentions one of our apexes. Returns None for traffic that isn't ours.
pub fn parse_interaction(
    raw: &str,
    external_port: u16,
    registry: &DomainRegistry,
) -> Option<HttpInteraction> {
    let lines: Vec<&str> = raw.split('\n').map(|l| l.trim_end_matches('\r')).collect();

    let ours = lines.iter().any(|line| {
        let lowered = line.to_lowercase();
        registry.all().iter().any(|apex| lowered.contains(apex))
    });
    if !ours {
        return None;
    }

    let mut interaction = HttpInteraction::default();
    for line in &lines {
        let lowered = line.to_lowercase();
        if let Some(value) = lowered.strip_prefix("host:") {
            // reconstruct the visible host:port from the Host value plus the
            // actual external port, not the proxy-internal one
            let host = value.trim().split(':').next().unwrap_or_default().to_string();
            interaction.host = format!("{host}:{external_port}");
        } else if METHOD_TOKENS
            .iter()
            .any(|method| line.starts_with(&format!("{method} ")))
        {
            interaction.query = line.to_string();
        } else if lowered.starts_with("user-agent:") {
            interaction.user_agent = line.to_string();
        } else if lowered.starts_with("cookie:") {
            interaction.cookie = line.to_string();
        } else if let Some(value) = lowered.strip_prefix("x-forwarded-for:") {
            // upstream proxies are assumed to append host:port entries;
            // entries without a colon get dropped
            let chain: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|entry| entry.contains(':'))
                .collect();
            interaction.forwarded_for = chain.join(",");
        }
    }
    Some(interaction)
}

/// value part of the User-Agent line, for filter needles
fn user_agent_value(interaction: &HttpInteraction) -> &str {
    interaction
        .user_agent
        .split_once(':')
        .map(|(_, v)| v.trim())
        .unwrap_or_default()
}

/// Read one request off the socket, maybe notify, always answer. A zero byte
/// reply triggers some clients to resend the request, so the body is a
/// single space no matter what happened.
pub async fn handle_capture<S>(
    mut stream: S,
    remote: SocketAddr,
    external_port: u16,
    config: &Config,
    canary: &Arc<Canary>,
) -> Result<(), KnaryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; HTTP_BUFFER_SIZE];
    let len = match timeout(Duration::from_secs(config.timeout), stream.read(&mut buf)).await {
        Ok(Ok(len)) => len,
        Ok(Err(error)) => {
            debug!("Failed to read from {remote}: {error}");
            0
        }
        Err(_) => {
            debug!("Read from {remote} timed out after {}s", config.timeout);
            0
        }
    };

    let raw = String::from_utf8_lossy(&buf[..len]);
    if config.debug {
        trace!("raddr {remote}");
        trace!("{raw}");
    }

    if let Some(interaction) = parse_interaction(&raw, external_port, &canary.registry) {
        notify_http(config, canary, &interaction, remote, &raw);
    }

    stream.write_all(b" ").await?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn notify_http(
    config: &Config,
    canary: &Arc<Canary>,
    interaction: &HttpInteraction,
    remote: SocketAddr,
    raw: &str,
) {
    let remote_ip = remote.ip().to_string();
    let agent = user_agent_value(interaction);
    let needles = [
        interaction.host.as_str(),
        remote_ip.as_str(),
        interaction.forwarded_for.as_str(),
        agent,
    ];
    if !canary.filter.should_notify(&needles) {
        return;
    }

    let mut body = format!(
        "{}\n```\nQuery: {}\n{}\nFrom: {}",
        interaction.host, interaction.query, interaction.user_agent, remote
    );
    if !interaction.cookie.is_empty() {
        body.push_str(&format!("\n{}", interaction.cookie));
    }
    if !interaction.forwarded_for.is_empty() {
        body.push_str(&format!("\nX-Forwarded-For: {}", interaction.forwarded_for));
    }
    if config.full_http_request {
        body.push_str(&format!("\n\n{}", raw.trim_end()));
    }
    body.push_str("\n```");

    canary.events.publish(body);
    canary.eventlog.write(&format!("[{remote}]\n{raw}"));
}

/// The port 80 capture listener. Direct mode binds the public address; in
/// reverse-proxy front mode this sits on loopback behind the proxy.
pub async fn http_server(
    config: CowCellReadTxn<Config>,
    canary: Arc<Canary>,
) -> io::Result<()> {
    let config = Arc::new((*config).clone());
    let bind = match config.reverse_proxy_front() {
        true => format!("127.0.0.1:{}", config.proxy_inner_http_port)
            .parse()
            .map_err(|e| KnaryError::Config(format!("bad loopback address: {e}")))?,
        false => config.http_listener_address(config.http_port)?,
    };
    let external_port = config.http_port;
    let listener = bind_or_die(bind, "HTTP").await?;
    accept_captures(listener, external_port, None, config, canary).await
}

/// The port 443 capture listener. Direct mode terminates TLS itself and
/// rebinds when the cert watcher says so; front mode is plain loopback
/// because the proxy already terminated TLS.
pub async fn https_server(
    config: CowCellReadTxn<Config>,
    canary: Arc<Canary>,
    mut restart_rx: Option<mpsc::Receiver<()>>,
) -> io::Result<()> {
    let config = Arc::new((*config).clone());
    let external_port = config.https_port;

    if config.reverse_proxy_front() {
        let bind = format!("127.0.0.1:{}", config.proxy_inner_https_port)
            .parse()
            .map_err(|e| KnaryError::Config(format!("bad loopback address: {e}")))?;
        let listener = bind_or_die(bind, "HTTPS capture").await?;
        return accept_captures(listener, external_port, None, config, canary).await;
    }

    let bind = config.http_listener_address(config.https_port)?;
    loop {
        let acceptor = load_tls_acceptor(&config)?;
        let listener = bind_or_die(bind, "HTTPS").await?;

        // an inner accept loop that a restart signal can break out of;
        // in-flight connections on the old socket drain on their own tasks
        loop {
            match next_accept(&listener, &mut restart_rx).await {
                AcceptEvent::Rebind => {
                    info!("Restart signal received, rebinding the HTTPS listener");
                    break;
                }
                AcceptEvent::WatcherGone => {
                    restart_rx = None;
                }
                AcceptEvent::Conn(Ok((stream, remote))) => {
                    spawn_capture(
                        stream,
                        remote,
                        external_port,
                        Some(acceptor.clone()),
                        config.clone(),
                        canary.clone(),
                    );
                }
                AcceptEvent::Conn(Err(error)) => {
                    error!("Couldn't accept HTTPS connection: {error:?}");
                }
            }
        }
        drop(listener);
    }
}

enum AcceptEvent {
    Conn(io::Result<(TcpStream, SocketAddr)>),
    Rebind,
    WatcherGone,
}

/// Wait for either an inbound connection or a restart signal.
async fn next_accept(
    listener: &TcpListener,
    restart_rx: &mut Option<mpsc::Receiver<()>>,
) -> AcceptEvent {
    match restart_rx {
        Some(rx) => {
            tokio::select! {
                accepted = listener.accept() => AcceptEvent::Conn(accepted),
                signal = rx.recv() => match signal {
                    Some(()) => AcceptEvent::Rebind,
                    None => AcceptEvent::WatcherGone,
                },
            }
        }
        None => AcceptEvent::Conn(listener.accept().await),
    }
}

async fn bind_or_die(bind: SocketAddr, label: &str) -> io::Result<TcpListener> {
    match TcpListener::bind(bind).await {
        Ok(listener) => {
            info!("Started {label} listener on {bind}");
            Ok(listener)
        }
        Err(error) => {
            error!("Failed to start {label} listener on {bind}: {error:?}");
            Err(error)
        }
    }
}

async fn accept_captures(
    listener: TcpListener,
    external_port: u16,
    acceptor: Option<TlsAcceptor>,
    config: Arc<Config>,
    canary: Arc<Canary>,
) -> io::Result<()> {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(value) => value,
            Err(error) => {
                error!("Couldn't accept connection: {error:?}");
                continue;
            }
        };
        spawn_capture(
            stream,
            remote,
            external_port,
            acceptor.clone(),
            config.clone(),
            canary.clone(),
        );
    }
}

fn spawn_capture(
    stream: TcpStream,
    remote: SocketAddr,
    external_port: u16,
    acceptor: Option<TlsAcceptor>,
    config: Arc<Config>,
    canary: Arc<Canary>,
) {
    tokio::spawn(async move {
        let result = match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    handle_capture(tls_stream, remote, external_port, &config, &canary).await
                }
                Err(error) => {
                    debug!("TLS handshake with {remote} failed: {error}");
                    return;
                }
            },
            None => handle_capture(stream, remote, external_port, &config, &canary).await,
        };
        if let Err(error) = result {
            debug!("Connection from {remote} ended badly: {error}");
        }
    });
}

/// Build a TLS acceptor from the configured PEM pair. Malformed material is
/// fatal - quietly losing HTTPS would defeat the point.
pub fn load_tls_acceptor(config: &Config) -> Result<TlsAcceptor, KnaryError> {
    let (Some(crt), Some(key)) = (&config.tls_crt, &config.tls_key) else {
        return Err(KnaryError::Certificate(
            "TLS_CRT and TLS_KEY are required for HTTPS".to_string(),
        ));
    };
    build_tls_acceptor(crt, key)
}

pub fn build_tls_acceptor(crt: &Path, key: &Path) -> Result<TlsAcceptor, KnaryError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(crt)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(std::fs::File::open(key)?))?
        .ok_or_else(|| KnaryError::Certificate(format!("no private key found in {key:?}")))?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| KnaryError::Certificate(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Which scheme a reverse-proxy front listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
}

/// The public-facing reverse proxy. Requests whose Host sits under
/// `REVERSE_PROXY_DOMAIN` go to the configured upstream; everything else goes
/// to the loopback capture port. Both directions get `X-Forwarded-For`
/// appended so the capture path still sees the real client.
pub async fn proxy_server(
    config: CowCellReadTxn<Config>,
    scheme: ProxyScheme,
    mut restart_rx: Option<mpsc::Receiver<()>>,
) -> io::Result<()> {
    let config = Arc::new((*config).clone());
    let proxy_apex = config
        .reverse_proxy_domain
        .clone()
        .ok_or_else(|| KnaryError::Config("proxy front needs REVERSE_PROXY_DOMAIN".to_string()))?;

    let (bind_port, upstream, inner_port) = match scheme {
        ProxyScheme::Http => (
            config.http_port,
            config.reverse_proxy_http.clone(),
            config.proxy_inner_http_port,
        ),
        ProxyScheme::Https => (
            config.https_port,
            config.reverse_proxy_https.clone(),
            config.proxy_inner_https_port,
        ),
    };
    let bind = config.http_listener_address(bind_port)?;

    loop {
        let acceptor = match scheme {
            ProxyScheme::Https => Some(load_tls_acceptor(&config)?),
            ProxyScheme::Http => None,
        };
        let listener = bind_or_die(bind, "reverse-proxy front").await?;

        loop {
            let (stream, remote) = match next_accept(&listener, &mut restart_rx).await {
                AcceptEvent::Rebind => {
                    info!("Restart signal received, rebinding the proxy front");
                    break;
                }
                AcceptEvent::WatcherGone => {
                    restart_rx = None;
                    continue;
                }
                AcceptEvent::Conn(Ok(value)) => value,
                AcceptEvent::Conn(Err(error)) => {
                    error!("Couldn't accept proxy connection: {error:?}");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let proxy_apex = proxy_apex.clone();
            let upstream = upstream.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            proxy_connection(
                                tls_stream,
                                remote,
                                &proxy_apex,
                                upstream.as_deref(),
                                inner_port,
                                config.timeout,
                            )
                            .await
                        }
                        Err(error) => {
                            debug!("TLS handshake with {remote} failed: {error}");
                            return;
                        }
                    },
                    None => {
                        proxy_connection(
                            stream,
                            remote,
                            &proxy_apex,
                            upstream.as_deref(),
                            inner_port,
                            config.timeout,
                        )
                        .await
                    }
                };
                if let Err(error) = result {
                    debug!("Proxied connection from {remote} ended badly: {error}");
                }
            });
        }
        drop(listener);
    }
}

async fn proxy_connection<S>(
    mut client: S,
    remote: SocketAddr,
    proxy_apex: &str,
    upstream: Option<&str>,
    inner_port: u16,
    read_timeout: u64,
) -> Result<(), KnaryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; HTTP_BUFFER_SIZE];
    let len = timeout(Duration::from_secs(read_timeout), client.read(&mut buf))
        .await
        .map_err(|_| KnaryError::Generic(format!("read from {remote} timed out")))??;
    let head = String::from_utf8_lossy(&buf[..len]).to_string();

    let target = match host_under_apex(&head, proxy_apex) {
        true => match upstream {
            Some(upstream) => upstream.to_string(),
            // proxy apex hit but no upstream for this scheme: capture it
            None => format!("127.0.0.1:{inner_port}"),
        },
        false => format!("127.0.0.1:{inner_port}"),
    };
    trace!("proxying {remote} -> {target}");

    let mut server = TcpStream::connect(&target).await?;
    let rewritten = append_forwarded_for(&buf[..len], remote);
    server.write_all(&rewritten).await?;
    let _ = io::copy_bidirectional(&mut client, &mut server).await;
    Ok(())
}

fn host_under_apex(head: &str, proxy_apex: &str) -> bool {
    let apex = proxy_apex.trim_end_matches('.').to_lowercase();
    head.split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter_map(|l| l.to_lowercase().strip_prefix("host:").map(str::to_string))
        .any(|value| {
            let host = value.trim().split(':').next().unwrap_or_default().to_string();
            host == apex || host.ends_with(&format!(".{apex}"))
        })
}

/// Append `X-Forwarded-For: <client>` to the request head: onto an existing
/// chain if there is one, as a fresh header otherwise.
pub fn append_forwarded_for(head: &[u8], remote: SocketAddr) -> Vec<u8> {
    let text = String::from_utf8_lossy(head);
    let entry = remote.to_string();

    if let Some(idx) = text.to_lowercase().find("x-forwarded-for:") {
        let line_end = text[idx..].find("\r\n").map(|e| idx + e).unwrap_or(text.len());
        let mut out = String::with_capacity(text.len() + entry.len() + 2);
        out.push_str(&text[..line_end]);
        out.push_str(", ");
        out.push_str(&entry);
        out.push_str(&text[line_end..]);
        return out.into_bytes();
    }

    match text.find("\r\n\r\n") {
        Some(idx) => {
            let mut out = String::with_capacity(text.len() + entry.len() + 20);
            out.push_str(&text[..idx]);
            out.push_str(&format!("\r\nX-Forwarded-For: {entry}"));
            out.push_str(&text[idx..]);
            out.into_bytes()
        }
        None => {
            warn!("No header terminator in proxied request from {remote}, passing through");
            head.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::NotificationFilter;
    use crate::notify::test_sink::MemorySink;
    use crate::notify::{EventLog, EventRouter, EventSink};
    use crate::zone::ZoneStore;
    use crate::GlueAddr;

    const REQUEST: &str = "GET / HTTP/1.1\r\nHost: x.ex.com:80\r\nUser-Agent: curl/8\r\nCookie: session=1\r\nX-Forwarded-For: 10.0.0.1:1234, 2001:db8::1\r\n\r\n";

    fn registry() -> DomainRegistry {
        DomainRegistry::from_csv("ex.com").expect("registry")
    }

    #[test]
    fn test_parse_interaction() {
        let interaction =
            parse_interaction(REQUEST, 80, &registry()).expect("our apex is in there");
        assert_eq!(interaction.host, "x.ex.com:80");
        assert_eq!(interaction.query, "GET / HTTP/1.1");
        assert_eq!(interaction.user_agent, "User-Agent: curl/8");
        assert_eq!(interaction.cookie, "Cookie: session=1");
        // both entries carry a colon so both survive the chain filter
        assert_eq!(interaction.forwarded_for, "10.0.0.1:1234,2001:db8::1");
    }

    #[test]
    fn test_parse_interaction_foreign_traffic() {
        let raw = "GET / HTTP/1.1\r\nHost: other.net\r\n\r\n";
        assert!(parse_interaction(raw, 80, &registry()).is_none());
    }

    #[test]
    fn test_parse_interaction_rewrites_inner_port() {
        let raw = "GET / HTTP/1.1\r\nHost: x.ex.com:8843\r\n\r\n";
        let interaction = parse_interaction(raw, 443, &registry()).expect("ours");
        assert_eq!(interaction.host, "x.ex.com:443");
    }

    #[test]
    fn test_forwarded_for_filters_portless_entries() {
        let raw = "GET / HTTP/1.1\r\nHost: x.ex.com\r\nX-Forwarded-For: 10.0.0.1, 10.0.0.2:80\r\n\r\n";
        let interaction = parse_interaction(raw, 80, &registry()).expect("ours");
        assert_eq!(interaction.forwarded_for, "10.0.0.2:80");
    }

    fn capture_fixture(config: Config) -> (Arc<Canary>, Arc<MemorySink>, Arc<Config>) {
        let sink = Arc::new(MemorySink::default());
        struct Fwd(Arc<MemorySink>);
        #[async_trait::async_trait]
        impl EventSink for Fwd {
            async fn publish(&self, text: &str) {
                self.0.publish(text).await
            }
            fn name(&self) -> &str {
                "fwd"
            }
        }
        let canary = Arc::new(Canary {
            registry: registry(),
            filter: NotificationFilter::new(false),
            zone: Arc::new(ZoneStore::new()),
            events: EventRouter::new(vec![Box::new(Fwd(sink.clone()))]),
            eventlog: EventLog::new(None),
            glue: GlueAddr::default(),
        });
        (canary, sink, Arc::new(config))
    }

    #[tokio::test]
    async fn test_handle_capture_replies_and_notifies() {
        let (canary, sink, config) = capture_fixture(Config::default());
        let (mut client, server) = io::duplex(HTTP_BUFFER_SIZE);
        client.write_all(REQUEST.as_bytes()).await.expect("write");

        let remote: SocketAddr = "198.51.100.1:40000".parse().expect("addr");
        handle_capture(server, remote, 80, &config, &canary)
            .await
            .expect("capture path never errors on good input");

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("read");
        assert_eq!(reply, b" ");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sink.events.lock().expect("lock");
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("x.ex.com:80"));
        assert!(events[0].contains("Query: GET / HTTP/1.1"));
        assert!(events[0].contains("curl/8"));
        assert!(events[0].contains("From: 198.51.100.1:40000"));
    }

    #[tokio::test]
    async fn test_handle_capture_always_replies_a_space() {
        let (canary, sink, config) = capture_fixture(Config::default());
        let (mut client, server) = io::duplex(HTTP_BUFFER_SIZE);
        client
            .write_all(b"\x00\x01 not http at all")
            .await
            .expect("write");

        let remote: SocketAddr = "198.51.100.1:40001".parse().expect("addr");
        handle_capture(server, remote, 80, &config, &canary)
            .await
            .expect("still fine");

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("read");
        assert_eq!(reply, b" ");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.events.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_full_http_request_includes_raw() {
        let config = Config {
            full_http_request: true,
            ..Default::default()
        };
        let (canary, sink, config) = capture_fixture(config);
        let (mut client, server) = io::duplex(HTTP_BUFFER_SIZE);
        client.write_all(REQUEST.as_bytes()).await.expect("write");

        let remote: SocketAddr = "198.51.100.1:40002".parse().expect("addr");
        handle_capture(server, remote, 80, &config, &canary)
            .await
            .expect("capture");
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("read");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sink.events.lock().expect("lock");
        assert!(events[0].contains("Cookie: session=1"));
        assert!(events[0].contains("GET / HTTP/1.1\r\nHost: x.ex.com:80"));
    }

    #[test]
    fn test_append_forwarded_for_fresh_header() {
        let head = b"GET / HTTP/1.1\r\nHost: app.rp.ex.com\r\n\r\n";
        let remote: SocketAddr = "203.0.113.5:9999".parse().expect("addr");
        let out = String::from_utf8(append_forwarded_for(head, remote)).expect("utf8");
        assert!(out.contains("\r\nX-Forwarded-For: 203.0.113.5:9999\r\n\r\n"));
    }

    #[test]
    fn test_append_forwarded_for_extends_chain() {
        let head = b"GET / HTTP/1.1\r\nHost: a.ex.com\r\nX-Forwarded-For: 10.0.0.1:1\r\n\r\n";
        let remote: SocketAddr = "203.0.113.5:9999".parse().expect("addr");
        let out = String::from_utf8(append_forwarded_for(head, remote)).expect("utf8");
        assert!(out.contains("X-Forwarded-For: 10.0.0.1:1, 203.0.113.5:9999\r\n"));
    }

    #[test]
    fn test_host_under_apex() {
        let head = "GET / HTTP/1.1\r\nHost: app.rp.ex.com\r\n\r\n";
        assert!(host_under_apex(head, "rp.ex.com"));
        assert!(!host_under_apex(head, "other.ex.com"));
        let exact = "GET / HTTP/1.1\r\nHost: rp.ex.com:443\r\n\r\n";
        assert!(host_under_apex(exact, "rp.ex.com"));
    }

    #[tokio::test]
    async fn test_proxy_connection_routes_to_upstream() {
        // a fake upstream that records what it got and answers
        let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let upstream_addr = upstream.local_addr().expect("addr");
        let received = Arc::new(tokio::sync::Mutex::new(String::new()));
        let received_clone = received.clone();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.expect("accept");
            let mut buf = vec![0u8; HTTP_BUFFER_SIZE];
            let len = stream.read(&mut buf).await.expect("read");
            *received_clone.lock().await = String::from_utf8_lossy(&buf[..len]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nhi")
                .await
                .expect("write");
        });

        let (mut client, server) = io::duplex(HTTP_BUFFER_SIZE);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: app.rp.ex.com\r\n\r\n")
            .await
            .expect("write");
        client.shutdown().await.expect("shutdown");

        let remote: SocketAddr = "203.0.113.5:9999".parse().expect("addr");
        proxy_connection(
            server,
            remote,
            "rp.ex.com",
            Some(&upstream_addr.to_string()),
            18880,
            2,
        )
        .await
        .expect("proxying works");

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("read");
        assert!(String::from_utf8_lossy(&reply).contains("200 OK"));

        let seen = received.lock().await;
        assert!(seen.contains("Host: app.rp.ex.com"));
        assert!(seen.contains("X-Forwarded-For: 203.0.113.5:9999"));
    }
}
