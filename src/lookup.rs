//! A small stub resolver over the same wire codec the responder uses. Three
//! callers: glue-record self-discovery at startup, the recursive-proxy branch
//! of the DNS responder, and tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::debug;
use packed_struct::PackedStruct;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::enums::{OpCode, PacketType, Rcode, RecordClass, RecordType};
use crate::error::KnaryError;
use crate::resourcerecord::{DNSCharString, DomainName, InternalResourceRecord};
use crate::utils::{expand_name, get_u16_from_packets, get_u32_from_packets};
use crate::{Header, Question, HEADER_BYTES, IANA_ROOT_NS};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
/// Big enough for a referral with a full additional section
const RESPONSE_BUFFER: usize = 4096;

/// One record parsed out of an upstream response. Only the types the canary
/// can re-serve get an internal representation; everything else keeps its
/// owner and type so referral walking still works.
#[derive(Debug, Clone)]
pub struct UpstreamRecord {
    pub owner: String,
    pub rtype: RecordType,
    pub record: Option<InternalResourceRecord>,
}

/// The three record sections of an upstream answer.
#[derive(Debug, Default)]
pub struct UpstreamAnswer {
    pub rcode: Rcode,
    pub answers: Vec<UpstreamRecord>,
    pub authorities: Vec<UpstreamRecord>,
    pub additionals: Vec<UpstreamRecord>,
}

impl UpstreamAnswer {
    /// First A record in the additional section - where a TLD referral puts
    /// its glue.
    pub fn glue_a(&self) -> Option<Ipv4Addr> {
        self.additionals.iter().find_map(|r| match r.record {
            Some(InternalResourceRecord::A { address, .. }) => Some(address),
            _ => None,
        })
    }
}

/// Send one question to `server` and parse the response sections.
pub async fn query_upstream(
    server: SocketAddr,
    qname: &str,
    qtype: RecordType,
    recursion_desired: bool,
) -> Result<UpstreamAnswer, KnaryError> {
    let id: u16 = rand::rng().random();
    let header = Header {
        id,
        qr: PacketType::Query,
        opcode: OpCode::Query,
        authoritative: false,
        recursion_desired,
        qdcount: 1,
        ..Default::default()
    };
    let question = Question {
        qname: qname.to_lowercase(),
        qtype,
        qclass: RecordClass::Internet,
    };
    let mut packet = header
        .pack()
        .map_err(|e| KnaryError::BytePacking(e.to_string()))?
        .to_vec();
    packet.extend(question.to_bytes()?);

    let bind_addr = match server.ip() {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(&packet, server).await?;

    let mut buf = [0u8; RESPONSE_BUFFER];
    let (len, _addr) = timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| KnaryError::Upstream(format!("no response from {server} within 5s")))??;

    let response = parse_response(&buf[..len], id)?;
    debug!(
        "upstream {server} answered {qname} {qtype}: {} answers, {} authority, {} additional",
        response.answers.len(),
        response.authorities.len(),
        response.additionals.len()
    );
    Ok(response)
}

/// Parse a response packet into its sections, checking the transaction id.
pub fn parse_response(buf: &[u8], expect_id: u16) -> Result<UpstreamAnswer, KnaryError> {
    let header = Header::from_packets(buf)?;
    if header.id != expect_id {
        return Err(KnaryError::Upstream(format!(
            "transaction id mismatch: sent {expect_id}, got {}",
            header.id
        )));
    }

    let mut offset = HEADER_BYTES;
    // skip over the echoed questions
    for _ in 0..header.qdcount {
        let (_name, consumed) = expand_name(buf, offset)?;
        offset += consumed + 4;
    }

    let mut response = UpstreamAnswer {
        rcode: header.rcode,
        ..Default::default()
    };
    for (count, section) in [
        (header.ancount, 0usize),
        (header.nscount, 1),
        (header.arcount, 2),
    ] {
        for _ in 0..count {
            let (record, consumed) = parse_record(buf, offset)?;
            offset += consumed;
            match section {
                0 => response.answers.push(record),
                1 => response.authorities.push(record),
                _ => response.additionals.push(record),
            }
        }
    }
    Ok(response)
}

fn parse_record(buf: &[u8], offset: usize) -> Result<(UpstreamRecord, usize), KnaryError> {
    let (owner, name_len) = expand_name(buf, offset)?;
    let fixed = offset + name_len;
    let rtype_raw = get_u16_from_packets(buf, fixed)
        .ok_or_else(|| KnaryError::Upstream("record ran off the packet".to_string()))?;
    let ttl = get_u32_from_packets(buf, fixed + 4)
        .ok_or_else(|| KnaryError::Upstream("record ran off the packet".to_string()))?;
    let rdlength = get_u16_from_packets(buf, fixed + 8)
        .ok_or_else(|| KnaryError::Upstream("record ran off the packet".to_string()))?
        as usize;
    let rdata_start = fixed + 10;
    let rdata = buf
        .get(rdata_start..rdata_start + rdlength)
        .ok_or_else(|| KnaryError::Upstream("rdata ran off the packet".to_string()))?;

    let rtype = RecordType::from(&rtype_raw);
    let record = match rtype {
        RecordType::A if rdlength == 4 => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| {
                KnaryError::Upstream("A rdata was not 4 bytes".to_string())
            })?;
            Some(InternalResourceRecord::A {
                address: octets.into(),
                ttl,
            })
        }
        RecordType::AAAA if rdlength == 16 => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| {
                KnaryError::Upstream("AAAA rdata was not 16 bytes".to_string())
            })?;
            Some(InternalResourceRecord::AAAA {
                address: octets.into(),
                ttl,
            })
        }
        RecordType::NS => {
            // target may be compressed against the whole packet
            let (nsdname, _) = expand_name(buf, rdata_start)?;
            Some(InternalResourceRecord::NS {
                nsdname: DomainName::from(nsdname),
                ttl,
            })
        }
        RecordType::CNAME => {
            let (cname, _) = expand_name(buf, rdata_start)?;
            Some(InternalResourceRecord::CNAME {
                cname: DomainName::from(cname),
                ttl,
            })
        }
        RecordType::TXT => rdata.split_first().map(|(len, rest)| {
            let text = rest.get(..*len as usize).unwrap_or(rest);
            InternalResourceRecord::TXT {
                txtdata: DNSCharString {
                    data: text.to_vec(),
                },
                ttl,
            }
        }),
        _ => None,
    };

    Ok((
        UpstreamRecord {
            owner,
            rtype,
            record,
        },
        name_len + 10 + rdlength,
    ))
}

/// Glue-record self-discovery: ask the IANA root for the apex's TLD servers,
/// then ask a TLD server for the apex NS and pull the glue A out of the
/// additional section. Used at startup when `EXT_IP` is unset.
pub async fn discover_glue(apex: &str) -> Result<Ipv4Addr, KnaryError> {
    let root: SocketAddr = IANA_ROOT_NS
        .parse()
        .map_err(|e| KnaryError::Upstream(format!("bad root server address: {e}")))?;
    let apex_fqdn = format!("{}.", apex.trim_end_matches('.'));

    let referral = query_upstream(root, &apex_fqdn, RecordType::NS, false).await?;
    let tld_server = referral.glue_a().ok_or_else(|| {
        KnaryError::Upstream(format!(
            "the root referral for {apex} carried no TLD glue. Are you sure your DNS is configured correctly? Consider setting EXT_IP"
        ))
    })?;

    let answer = query_upstream(
        SocketAddr::from((tld_server, 53)),
        &apex_fqdn,
        RecordType::NS,
        false,
    )
    .await?;
    answer.glue_a().ok_or_else(|| {
        KnaryError::Upstream(format!(
            "no glue A record for {apex} at the TLD nameserver. Are you sure your DNS is configured correctly? Consider setting EXT_IP"
        ))
    })
}

/// Forward one question verbatim to a configured upstream and hand back its
/// answer section. The recursive-proxy branch of the responder copies these
/// straight into its reply.
pub async fn forward_question(
    upstream: &str,
    question: &Question,
) -> Result<Vec<UpstreamRecord>, KnaryError> {
    let server: SocketAddr = match upstream.parse() {
        Ok(value) => value,
        // a bare host means port 53
        Err(_) => format!("{upstream}:53")
            .parse()
            .map_err(|e| KnaryError::Upstream(format!("bad upstream {upstream:?}: {e}")))?,
    };
    let response = query_upstream(server, &question.qname, question.qtype, true).await?;
    Ok(response.answers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::reply_builder;
    use crate::ResourceRecord;

    fn answer_packet(id: u16) -> Vec<u8> {
        let mut reply = reply_builder(id, Rcode::NoError);
        reply.questions.push(Question {
            qname: "a.ex.com.".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        });
        reply.answers.push(ResourceRecord {
            name: "a.ex.com.".to_string(),
            record_type: RecordType::A,
            class: RecordClass::Internet,
            ttl: 60,
            rdata: vec![203, 0, 113, 9],
        });
        reply.additional.push(ResourceRecord {
            name: "ns.ex.com.".to_string(),
            record_type: RecordType::A,
            class: RecordClass::Internet,
            ttl: 60,
            rdata: vec![203, 0, 113, 10],
        });
        reply.as_bytes().expect("should serialise")
    }

    #[test]
    fn test_parse_response_sections() {
        let packet = answer_packet(99);
        let response = parse_response(&packet, 99).expect("should parse");
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.additionals.len(), 1);
        assert_eq!(
            response.glue_a(),
            Some(Ipv4Addr::new(203, 0, 113, 10))
        );
        match &response.answers[0].record {
            Some(InternalResourceRecord::A { address, ttl }) => {
                assert_eq!(*address, Ipv4Addr::new(203, 0, 113, 9));
                assert_eq!(*ttl, 60);
            }
            other => panic!("expected an A record, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_checks_id() {
        let packet = answer_packet(99);
        assert!(parse_response(&packet, 100).is_err());
    }

    #[tokio::test]
    async fn test_query_upstream_roundtrip() {
        // a tiny fake upstream that answers everything with one A record
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = server.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.expect("recv");
            let header = Header::from_packets(&buf[..len]).expect("parse");
            let (question, _) =
                Question::from_packets(&buf[..len], HEADER_BYTES).expect("question");
            let mut reply = reply_builder(header.id, Rcode::NoError);
            reply.questions.push(question.clone());
            reply.answers.push(ResourceRecord {
                name: question.qname.clone(),
                record_type: RecordType::A,
                class: RecordClass::Internet,
                ttl: 60,
                rdata: vec![198, 51, 100, 7],
            });
            let bytes = reply.as_bytes().expect("serialise");
            server.send_to(&bytes, peer).await.expect("send");
        });

        let response = query_upstream(server_addr, "glue.ex.com.", RecordType::A, false)
            .await
            .expect("should answer");
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].owner, "glue.ex.com.");
    }
}
