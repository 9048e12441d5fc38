//! The authoritative DNS side of the canary: one UDP socket, a reply per
//! packet, a notification per interesting question.

use concread::cowcell::asynch::CowCellReadTxn;
use std::io::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use log::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::enums::{OpCode, PacketType, Rcode, RecordType};
use crate::error::KnaryError;
use crate::lookup::forward_question;
use crate::notify::{EventLog, EventRouter};
use crate::reply::{reply_builder, Reply};
use crate::resourcerecord::{DomainName, InternalResourceRecord};
use crate::utils::reverse_addr;
use crate::{
    domains::DomainRegistry, filter::NotificationFilter, zone::ZoneStore, GlueAddr, Header,
    Question, HEADER_BYTES, REPLY_TIMEOUT_MS, UDP_BUFFER_SIZE,
};

/// Synthesized SOA counters: serial refresh retry expire minimum
const SOA_SERIAL: u32 = 2021041401;
const SOA_REFRESH: u32 = 7200;
const SOA_RETRY: u32 = 3600;
const SOA_EXPIRE: u32 = 604800;
const SOA_MINIMUM: u32 = 300;
/// TTL on synthesized glue answers
const GLUE_TTL: u32 = 60;
/// TTL on synthesized SOA/NS answers
const STATIC_TTL: u32 = 3600;

/// Everything the capture paths share: the registry, the filter, the zone
/// and the sinks. One per process, handed around as an Arc so tests can
/// build isolated instances.
pub struct Canary {
    pub registry: DomainRegistry,
    pub filter: NotificationFilter,
    pub zone: Arc<ZoneStore>,
    pub events: EventRouter,
    pub eventlog: EventLog,
    pub glue: GlueAddr,
}

pub async fn udp_server(
    config: CowCellReadTxn<Config>,
    canary: Arc<Canary>,
) -> io::Result<()> {
    let bind_address = config.dns_listener_address()?;
    let udp_sock = match UdpSocket::bind(bind_address).await {
        Ok(value) => {
            info!("Started DNS listener on {bind_address}");
            value
        }
        Err(error) => {
            error!("Failed to start DNS listener on {bind_address}: {error:?}");
            return Err(error);
        }
    };
    serve_udp(udp_sock, config, canary).await
}

/// The recv loop, split from the bind so tests can hand in their own socket.
pub async fn serve_udp(
    udp_sock: UdpSocket,
    config: CowCellReadTxn<Config>,
    canary: Arc<Canary>,
) -> io::Result<()> {
    let mut udp_buffer = [0; UDP_BUFFER_SIZE];

    loop {
        let (len, addr) = match udp_sock.recv_from(&mut udp_buffer).await {
            Ok(value) => value,
            Err(error) => {
                error!("Error accepting connection via UDP: {error:?}");
                continue;
            }
        };
        trace!("{len} bytes received from {addr:?}");

        let result = match timeout(
            Duration::from_millis(REPLY_TIMEOUT_MS),
            handle_query(&config, &canary, &udp_buffer[..len], addr),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => {
                error!("No response from handle_query within {REPLY_TIMEOUT_MS} ms");
                continue;
            }
        };

        match result {
            Ok(reply) => {
                let reply_bytes = match reply.as_bytes_udp() {
                    Ok(value) => value,
                    Err(error) => {
                        error!("Failed to serialise reply {reply:?}: {error:?}");
                        continue;
                    }
                };
                trace!("reply_bytes: {reply_bytes:?}");
                if let Err(error) = udp_sock.send_to(&reply_bytes, addr).await {
                    error!("Failed to send reply to {addr:?}: {error:?}");
                }
            }
            // a parse failure is the client's problem, the server carries on
            Err(error) => debug!("Dropping request from {addr:?}: {error}"),
        }
    }
}

/// Parse a query packet and assemble the authoritative reply. There can be
/// multiple questions in one request; each is answered independently.
pub async fn handle_query(
    config: &Config,
    canary: &Arc<Canary>,
    buf: &[u8],
    addr: SocketAddr,
) -> Result<Reply, KnaryError> {
    let header = Header::from_packets(buf)?;
    trace!("parsed header: {header}");

    // if we get something other than a query, yeah nah.
    if header.opcode != OpCode::Query {
        return Ok(reply_builder(header.id, Rcode::NotImplemented));
    }

    let mut questions: Vec<Question> = Vec::with_capacity(header.qdcount as usize);
    let mut offset = HEADER_BYTES;
    for _ in 0..header.qdcount {
        match Question::from_packets(buf, offset) {
            Ok((question, consumed)) => {
                trace!("parsed question: {question}");
                offset += consumed;
                questions.push(question);
            }
            Err(error) => {
                debug!("Failed to parse question id={}: {error}", header.id);
                return Ok(reply_builder(header.id, Rcode::ServFail));
            }
        }
    }

    let mut reply = Reply {
        header: Header {
            id: header.id,
            qr: PacketType::Answer,
            opcode: header.opcode,
            authoritative: true,
            recursion_desired: header.recursion_desired,
            rcode: Rcode::NoError,
            ..Default::default()
        },
        questions: questions.clone(),
        answers: vec![],
        authorities: vec![],
        additional: vec![],
    };

    for question in &questions {
        answer_question(config, canary, &mut reply, question, addr).await;
    }

    Ok(reply)
}

async fn answer_question(
    config: &Config,
    canary: &Arc<Canary>,
    reply: &mut Reply,
    question: &Question,
    addr: SocketAddr,
) {
    if config.debug {
        debug!("DNS question for: {} ({})", question.qname, question.qtype);
    }

    // zone hits first - the zone is authoritative over synthesized answers
    let zone_hits = canary.zone.query(&question.qname, question.qtype);
    let has_zone_hit = !zone_hits.is_empty();
    for entry in &zone_hits {
        match InternalResourceRecord::try_from(entry) {
            Ok(record) => match record.as_wire(&entry.owner) {
                Ok(wire) => reply.answers.push(wire),
                Err(error) => warn!("Failed to serialise zone record {entry:?}: {error}"),
            },
            Err(error) => warn!("Unusable zone record {entry:?}: {error}"),
        }
    }

    // reverse-proxy branch: questions under the proxy apex go upstream and
    // nothing else happens for them
    if let Some(proxy_apex) = &config.reverse_proxy_domain {
        if name_under(&question.qname, proxy_apex) {
            match &config.reverse_proxy_dns {
                Some(upstream) => {
                    match forward_question(upstream, question).await {
                        Ok(answers) => {
                            for upstream_record in answers {
                                if let Some(record) = upstream_record.record {
                                    match record.as_wire(&upstream_record.owner) {
                                        Ok(wire) => reply.answers.push(wire),
                                        Err(error) => {
                                            warn!("Failed to re-serialise upstream answer: {error}")
                                        }
                                    }
                                }
                            }
                        }
                        Err(error) => warn!("Reverse-proxy DNS upstream failed: {error}"),
                    }
                    return;
                }
                // no upstream configured, fall through to normal handling
                None => {}
            }
        }
    }

    match question.qtype {
        RecordType::A => {
            // an IPv6-only canary truthfully has no A record, RFC 4074 says
            // answer empty rather than lie
            let Some(glue) = canary.glue.v4 else {
                return;
            };
            notify_dns(config, canary, question, addr);
            if !has_zone_hit {
                push_answer(
                    reply,
                    &question.qname,
                    InternalResourceRecord::A {
                        address: glue,
                        ttl: GLUE_TTL,
                    },
                );
            }
        }
        RecordType::AAAA => {
            let Some(glue) = canary.glue.v6 else {
                return;
            };
            notify_dns(config, canary, question, addr);
            if !has_zone_hit {
                push_answer(
                    reply,
                    &question.qname,
                    InternalResourceRecord::AAAA {
                        address: glue,
                        ttl: GLUE_TTL,
                    },
                );
            }
        }
        RecordType::CNAME => {
            if canary.registry.is_root(&question.qname) {
                return;
            }
            notify_dns(config, canary, question, addr);
            if !has_zone_hit {
                // minimal but syntactically valid: the name is its own alias
                push_answer(
                    reply,
                    &question.qname,
                    InternalResourceRecord::CNAME {
                        cname: DomainName::from(question.qname.as_str()),
                        ttl: GLUE_TTL,
                    },
                );
            }
        }
        RecordType::TXT => {
            // no zone hit means a truthful empty answer
            notify_dns(config, canary, question, addr);
        }
        RecordType::SOA => {
            if let Some(apex) = canary.registry.suffix_match(&question.qname) {
                let apex = apex.to_string();
                push_answer(
                    reply,
                    &question.qname,
                    InternalResourceRecord::SOA {
                        mname: DomainName::from(format!("ns.{apex}.")),
                        rname: DomainName::from(format!("admin.{apex}.")),
                        serial: SOA_SERIAL,
                        refresh: SOA_REFRESH,
                        retry: SOA_RETRY,
                        expire: SOA_EXPIRE,
                        minimum: SOA_MINIMUM,
                        ttl: STATIC_TTL,
                    },
                );
            }
        }
        RecordType::NS => {
            if let Some(apex) = canary.registry.suffix_match(&question.qname) {
                let nsdname = format!("ns.{apex}.");
                push_answer(
                    reply,
                    &question.qname,
                    InternalResourceRecord::NS {
                        nsdname: DomainName::from(nsdname),
                        ttl: STATIC_TTL,
                    },
                );
            }
        }
        // everything else gets whatever the zone had and nothing synthesized
        _ => {}
    }
}

fn push_answer(reply: &mut Reply, owner: &str, record: InternalResourceRecord) {
    match record.as_wire(owner) {
        Ok(wire) => reply.answers.push(wire),
        Err(error) => warn!("Failed to serialise answer for {owner}: {error}"),
    }
}

/// true when `qname` sits at or under `apex` (label boundary, trailing dot
/// tolerated on either side)
fn name_under(qname: &str, apex: &str) -> bool {
    let qname = qname.trim_end_matches('.');
    let apex = apex.trim_end_matches('.').to_lowercase();
    qname == apex || qname.ends_with(&format!(".{apex}"))
}

/// The notification pipeline: subdomain gating, then the allow/deny filter,
/// then the sinks. Answer assembly never depends on this.
fn notify_dns(config: &Config, canary: &Arc<Canary>, question: &Question, addr: SocketAddr) {
    // operators can keep a wildcard A record but only alert on a targeted
    // zone
    if let Some(sub) = &config.dns_subdomain {
        let Some(apex) = canary.registry.suffix_match(&question.qname) else {
            return;
        };
        if !name_under(&question.qname, &format!("{sub}.{apex}")) {
            return;
        }
    }

    let source_ip = addr.ip().to_string();
    let needles = [question.qname.as_str(), source_ip.as_str()];
    if !canary.filter.should_notify(&needles) {
        return;
    }

    let ptr = reverse_addr(addr.ip());
    canary.events.publish(format!(
        "DNS ({}): {}\n```\nFrom: {}\nPTR: {}\n```",
        question.qtype, question.qname, addr, ptr
    ));
    canary
        .eventlog
        .write(&format!("{} - {} - {}", addr, ptr, question.qname));
}

/// The long-running halves of the process: hold the join handles and notice
/// when any of them dies.
#[derive(Debug, Default)]
pub struct Servers {
    pub udpserver: Option<JoinHandle<Result<(), Error>>>,
    pub httpserver: Option<JoinHandle<Result<(), Error>>>,
    pub httpsserver: Option<JoinHandle<Result<(), Error>>>,
    pub proxyservers: Vec<JoinHandle<Result<(), Error>>>,
    pub certwatcher: Option<JoinHandle<Result<(), Error>>>,
    pub maintenance: Option<JoinHandle<()>>,
}

impl Servers {
    pub fn build() -> Self {
        Self::default()
    }

    pub fn with_udpserver(self, udpserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            udpserver: Some(udpserver),
            ..self
        }
    }

    pub fn with_httpserver(self, httpserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            httpserver: Some(httpserver),
            ..self
        }
    }

    pub fn with_httpsserver(self, httpsserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            httpsserver: Some(httpsserver),
            ..self
        }
    }

    pub fn with_certwatcher(self, certwatcher: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            certwatcher: Some(certwatcher),
            ..self
        }
    }

    pub fn with_maintenance(self, maintenance: JoinHandle<()>) -> Self {
        Self {
            maintenance: Some(maintenance),
            ..self
        }
    }

    pub fn add_proxyserver(&mut self, proxyserver: JoinHandle<Result<(), Error>>) {
        self.proxyservers.push(proxyserver);
    }

    /// true once any listener has died - losing one is an operator-visible
    /// failure, not something to limp through
    pub fn any_finished(&self) -> bool {
        let mut results = vec![];
        for server in [
            &self.udpserver,
            &self.httpserver,
            &self.httpsserver,
            &self.certwatcher,
        ]
        .into_iter()
        .flatten()
        {
            results.push(server.is_finished());
        }
        for server in &self.proxyservers {
            results.push(server.is_finished());
        }
        results.iter().any(|&r| r)
    }
}

/// A restart channel pair for the HTTPS listener rebind signal.
pub fn restart_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::RecordClass;
    use crate::notify::test_sink::MemorySink;
    use crate::notify::EventSink;
    use packed_struct::PackedStruct;
    use std::net::Ipv4Addr;

    pub(crate) struct TestHarness {
        pub canary: Arc<Canary>,
        pub config: Config,
        pub sink: Arc<MemorySink>,
    }

    pub(crate) fn harness(config: Config) -> TestHarness {
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
            registry: DomainRegistry::from_csv("ex.com").expect("registry"),
            filter: NotificationFilter::new(false),
            zone: Arc::new(ZoneStore::new()),
            events: EventRouter::new(vec![Box::new(Fwd(sink.clone()))]),
            eventlog: EventLog::new(None),
            glue: GlueAddr {
                v4: Some(Ipv4Addr::new(203, 0, 113, 9)),
                v6: None,
            },
        });
        TestHarness {
            canary,
            config,
            sink,
        }
    }

    fn question_packet(id: u16, questions: &[(&str, RecordType)]) -> Vec<u8> {
        let header = Header {
            id,
            qdcount: questions.len() as u16,
            qr: PacketType::Query,
            authoritative: false,
            ..Default::default()
        };
        let mut packet = header.pack().expect("pack").to_vec();
        for (qname, qtype) in questions {
            let question = Question {
                qname: qname.to_string(),
                qtype: *qtype,
                qclass: RecordClass::Internet,
            };
            packet.extend(question.to_bytes().expect("serialise"));
        }
        packet
    }

    fn source() -> SocketAddr {
        "198.51.100.1:5353".parse().expect("addr")
    }

    async fn drain_events(harness: &TestHarness) -> Vec<String> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.sink.events.lock().expect("lock").clone()
    }

    #[tokio::test]
    async fn test_a_question_answers_glue_and_notifies() {
        let harness = harness(Config::default());
        let packet = question_packet(7, &[("a.ex.com.", RecordType::A)]);
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");

        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].ttl, 60);
        assert_eq!(reply.answers[0].rdata, vec![203, 0, 113, 9]);
        assert!(reply.header.authoritative);

        let events = drain_events(&harness).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("DNS (A): a.ex.com."));
        assert!(events[0].contains("From: 198.51.100.1:5353"));
        assert!(events[0].contains("PTR: 1.100.51.198.in-addr.arpa."));
    }

    #[tokio::test]
    async fn test_denied_source_still_gets_an_answer() {
        let mut harness = harness(Config::default());
        let canary = Arc::get_mut(&mut harness.canary).expect("sole owner");
        canary.filter = NotificationFilter::with_entries(vec![], vec!["bad.ex.com"], false);

        let packet = question_packet(8, &[("bad.ex.com.", RecordType::A)]);
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");

        // we are authoritative: the A record still goes out
        assert_eq!(reply.answers.len(), 1);
        // but nobody gets woken up
        assert!(drain_events(&harness).await.is_empty());
    }

    #[tokio::test]
    async fn test_zone_hit_suppresses_synthesized_answer() {
        let harness = harness(Config::default());
        harness
            .canary
            .zone
            .add("pinned.ex.com", 300, RecordType::A, "192.0.2.77");

        let packet = question_packet(9, &[("pinned.ex.com.", RecordType::A)]);
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");

        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rdata, vec![192, 0, 2, 77]);
        assert_eq!(reply.answers[0].ttl, 300);
    }

    #[tokio::test]
    async fn test_multiple_questions_answered_independently() {
        let harness = harness(Config::default());
        let packet = question_packet(
            10,
            &[
                ("one.ex.com.", RecordType::A),
                ("two.ex.com.", RecordType::TXT),
            ],
        );
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");

        // one glue A for the A question, truthful empty for TXT
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.questions.len(), 2);
        let events = drain_events(&harness).await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_subdomain_gating() {
        let config = Config {
            dns_subdomain: Some("dns".to_string()),
            ..Default::default()
        };
        let harness = harness(config);

        let gated_out = question_packet(11, &[("plain.ex.com.", RecordType::A)]);
        let reply = handle_query(&harness.config, &harness.canary, &gated_out, source())
            .await
            .expect("should answer");
        // still answered, silently
        assert_eq!(reply.answers.len(), 1);
        assert!(drain_events(&harness).await.is_empty());

        let gated_in = question_packet(12, &[("x.dns.ex.com.", RecordType::A)]);
        handle_query(&harness.config, &harness.canary, &gated_in, source())
            .await
            .expect("should answer");
        assert_eq!(drain_events(&harness).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cname_skips_roots_and_self_references() {
        let harness = harness(Config::default());

        let root = question_packet(13, &[("ex.com.", RecordType::CNAME)]);
        let reply = handle_query(&harness.config, &harness.canary, &root, source())
            .await
            .expect("should answer");
        assert!(reply.answers.is_empty());
        assert!(drain_events(&harness).await.is_empty());

        let sub = question_packet(14, &[("cb.ex.com.", RecordType::CNAME)]);
        let reply = handle_query(&harness.config, &harness.canary, &sub, source())
            .await
            .expect("should answer");
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].record_type, RecordType::CNAME);
    }

    #[tokio::test]
    async fn test_soa_and_ns_are_synthesized() {
        let harness = harness(Config::default());

        let soa = question_packet(15, &[("ex.com.", RecordType::SOA)]);
        let reply = handle_query(&harness.config, &harness.canary, &soa, source())
            .await
            .expect("should answer");
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].record_type, RecordType::SOA);

        let ns = question_packet(16, &[("sub.ex.com.", RecordType::NS)]);
        let reply = handle_query(&harness.config, &harness.canary, &ns, source())
            .await
            .expect("should answer");
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].record_type, RecordType::NS);
        // no notifications for the plumbing types
        assert!(drain_events(&harness).await.is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_only_glue_answers_a_empty() {
        let mut harness = harness(Config::default());
        let canary = Arc::get_mut(&mut harness.canary).expect("sole owner");
        canary.glue = GlueAddr {
            v4: None,
            v6: Some("2001:db8::9".parse().expect("addr")),
        };

        let packet = question_packet(17, &[("a.ex.com.", RecordType::A)]);
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");
        assert!(reply.answers.is_empty());
        assert!(drain_events(&harness).await.is_empty());

        let packet = question_packet(18, &[("a.ex.com.", RecordType::AAAA)]);
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rdata.len(), 16);
    }

    #[tokio::test]
    async fn test_reverse_proxy_branch_short_circuits() {
        use crate::reply::reply_builder;
        use crate::ResourceRecord;

        // fake upstream resolver
        let upstream = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let upstream_addr = upstream.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = upstream.recv_from(&mut buf).await.expect("recv");
            let header = Header::from_packets(&buf[..len]).expect("parse");
            let (question, _) =
                Question::from_packets(&buf[..len], HEADER_BYTES).expect("question");
            let mut reply = reply_builder(header.id, Rcode::NoError);
            reply.questions.push(question.clone());
            reply.answers.push(ResourceRecord {
                name: question.qname.clone(),
                record_type: RecordType::A,
                class: RecordClass::Internet,
                ttl: 30,
                rdata: vec![10, 0, 0, 2],
            });
            let bytes = reply.as_bytes().expect("serialise");
            upstream.send_to(&bytes, peer).await.expect("send");
        });

        let config = Config {
            reverse_proxy_domain: Some("rp.ex.com".to_string()),
            reverse_proxy_dns: Some(upstream_addr.to_string()),
            ..Default::default()
        };
        let harness = harness(config);

        let packet = question_packet(19, &[("app.rp.ex.com.", RecordType::A)]);
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("should answer");

        // the upstream's answer, not our glue
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rdata, vec![10, 0, 0, 2]);
        // and no notification for proxied traffic
        assert!(drain_events(&harness).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_query_opcode_is_refused() {
        let harness = harness(Config::default());
        let mut packet = question_packet(20, &[("a.ex.com.", RecordType::A)]);
        // flip the opcode bits to STATUS
        packet[2] |= 0b0001_0000;
        let reply = handle_query(&harness.config, &harness.canary, &packet, source())
            .await
            .expect("builds a refusal");
        assert_eq!(reply.header.rcode, Rcode::NotImplemented);
    }
}
