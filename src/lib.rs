use packed_struct::prelude::*;
use std::fmt::Display;

use crate::enums::*;
use crate::error::KnaryError;
use crate::utils::{expand_name, name_as_bytes};

pub mod acme;
pub mod certstore;
pub mod certwatch;
/// Configuration handling for the server
pub mod config;
pub mod domains;
pub mod enums;
pub mod error;
pub mod filter;
pub mod lookup;
pub mod maintenance;
pub mod notify;
pub mod reply;
pub mod resourcerecord;
pub mod servers;
pub mod utils;
pub mod web;
/// The in-memory zone store and master-file parser
pub mod zone;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const UPSTREAM_URL: &str = "https://github.com/sudosammy/knary";
pub const UPSTREAM_VERSION_URL: &str =
    "https://raw.githubusercontent.com/sudosammy/knary/master/VERSION";

/// The size of a DNS request header
pub const HEADER_BYTES: usize = 12;
/// The default "cancel a server response" timeout. Generous enough to cover
/// the recursive-proxy branch, which waits on an upstream.
pub const REPLY_TIMEOUT_MS: u64 = 6000;
/// The maximum size of a UDP packet <https://dnsflagday.net/2020/#dns-flag-day-2020>
pub const UDP_BUFFER_SIZE: usize = 1232;
/// How much of an HTTP request we bother reading
pub const HTTP_BUFFER_SIZE: usize = 4096;
/// The IANA root server we bootstrap glue discovery from (a.root-servers.net)
pub const IANA_ROOT_NS: &str = "198.41.0.4:53";

/// The address(es) A and AAAA questions are answered with: either `EXT_IP`
/// or the glue record discovered at startup. A missing family means that
/// family truthfully has no answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlueAddr {
    pub v4: Option<std::net::Ipv4Addr>,
    pub v6: Option<std::net::Ipv6Addr>,
}

impl From<std::net::IpAddr> for GlueAddr {
    fn from(ip: std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(v4) => GlueAddr {
                v4: Some(v4),
                v6: None,
            },
            std::net::IpAddr::V6(v6) => GlueAddr {
                v4: None,
                v6: Some(v6),
            },
        }
    }
}

/// The header of a DNS transmission, either a Query or Reply.
/// Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    // Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType, // bit 16
    #[packed_field(bits = "17..=20", ty = "enum")]
    pub opcode: OpCode, // 17-20 actually 4 bits
    #[packed_field(bits = "21")]
    pub authoritative: bool, // 21
    #[packed_field(bits = "22")]
    pub truncated: bool, // 22
    // RD - Recursion Desired - this bit may be set in a query and is copied into the response.
    #[packed_field(bits = "23")]
    pub recursion_desired: bool, // 23
    #[packed_field(bits = "24")]
    pub recursion_available: bool, // 24
    /// reserved, must be all 0's
    #[packed_field(bits = "25")]
    pub z: bool,
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    pub rcode: Rcode, // bits 28-31
    /// an unsigned 16 bit integer specifying the number of entries in the question section.
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16, // bits 32-47
    /// an unsigned 16 bit integer specifying the number of entries in the answer section.
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16, // 48-63
    /// an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16, // 64-79
    /// an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16, // 80-95
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            // we *are* an authoritative DNS server after all
            authoritative: true,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Header {
    pub fn as_answer(self) -> Header {
        let mut response = self;
        response.qr = PacketType::Answer;
        response
    }

    pub fn from_packets(buf: &[u8]) -> Result<Self, KnaryError> {
        let split_header: [u8; HEADER_BYTES] = buf
            .get(0..HEADER_BYTES)
            .ok_or_else(|| KnaryError::InvalidName("packet shorter than a header".to_string()))?
            .try_into()
            .map_err(|_| KnaryError::InvalidName("failed to split header".to_string()))?;
        Ok(Header::unpack(&split_header)?)
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "id={} qr={:?} opcode={:?} rcode={:?} qdcount={} ancount={}",
            self.id, self.qr, self.opcode, self.rcode, self.qdcount, self.ancount
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A DNS Question section, from Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2 "Question section format".
pub struct Question {
    /// The name which is being queried, lowercased, with a trailing dot
    pub qname: String,
    /// The Record type that is being requested, eg A, NS, TXT etc.
    pub qtype: RecordType,
    /// The class, (typically IN for "Internet")
    pub qclass: RecordClass,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={:?} QCLASS={}",
            self.qname, self.qtype, self.qclass,
        ))
    }
}

impl Question {
    /// Parse one question starting at `offset` into the packet. Returns the
    /// question and the number of bytes it occupied, so a multi-question
    /// packet can be walked question by question.
    pub fn from_packets(buf: &[u8], offset: usize) -> Result<(Self, usize), KnaryError> {
        let (qname, name_len) = expand_name(buf, offset)?;

        let read_pointer = offset + name_len;
        let qtype_raw = utils::get_u16_from_packets(buf, read_pointer).ok_or_else(|| {
            KnaryError::InvalidName("packet too short to read QTYPE".to_string())
        })?;
        let qclass_raw = utils::get_u16_from_packets(buf, read_pointer + 2).ok_or_else(|| {
            KnaryError::InvalidName("packet too short to read QCLASS".to_string())
        })?;

        Ok((
            Question {
                qname,
                qtype: RecordType::from(&qtype_raw),
                qclass: RecordClass::from(&qclass_raw),
            },
            name_len + 4,
        ))
    }

    /// turn a question into a vec of bytes to send back to the user
    pub fn to_bytes(&self) -> Result<Vec<u8>, KnaryError> {
        let mut retval = name_as_bytes(&self.qname)?;
        retval.extend((self.qtype as u16).to_be_bytes());
        retval.extend((self.qclass as u16).to_be_bytes());
        Ok(retval)
    }
}

/// The answer, authority, and additional sections all share the same
/// format: a variable number of resource records, where the number of
/// records is specified in the corresponding count field in the header.
///
/// Ref [RFC1035 Section 4.1.3](https://www.rfc-editor.org/rfc/rfc1035.html#section-4.1.3)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    /// A domain name to which this resource record pertains.
    pub name: String,
    /// Two octets containing one of the RR type codes. This field specifies the meaning of the data in the RDATA field.
    pub record_type: RecordType,
    /// Two octets which specify the class of the data in the RDATA field.
    pub class: RecordClass,
    /// A 32 bit unsigned integer that specifies the time interval (in seconds) that the resource record may be cached.
    pub ttl: u32,
    /// A variable length string of octets that describes the resource.
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, KnaryError> {
        let mut retval = name_as_bytes(&self.name)?;
        // type
        retval.extend((self.record_type as u16).to_be_bytes());
        // class
        retval.extend((self.class as u16).to_be_bytes());
        // reply ttl
        retval.extend(self.ttl.to_be_bytes());
        // reply data length
        retval.extend((self.rdata.len() as u16).to_be_bytes());
        // rdata
        retval.extend(self.rdata.iter());
        Ok(retval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pack_roundtrip() {
        let header = Header {
            id: 0xbeef,
            qr: PacketType::Answer,
            authoritative: true,
            qdcount: 1,
            ancount: 2,
            ..Default::default()
        };
        let packed = header.pack().expect("should pack");
        assert_eq!(packed.len(), HEADER_BYTES);
        let unpacked = Header::unpack(&packed).expect("should unpack");
        assert_eq!(header, unpacked);
    }

    #[test]
    fn test_question_roundtrip() {
        let question = Question {
            qname: "a.ex.com.".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let bytes = question.to_bytes().expect("should serialise");
        let (parsed, consumed) = Question::from_packets(&bytes, 0).expect("should parse");
        assert_eq!(parsed, question);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_question_mixed_case_normalised() {
        let question = Question {
            qname: "A.Ex.Com.".to_string(),
            qtype: RecordType::TXT,
            qclass: RecordClass::Internet,
        };
        let bytes = question.to_bytes().expect("should serialise");
        let (parsed, _) = Question::from_packets(&bytes, 0).expect("should parse");
        assert_eq!(parsed.qname, "a.ex.com.");
    }
}
