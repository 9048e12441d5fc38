use packed_struct::prelude::*;

use crate::enums::{PacketType, Rcode};
use crate::error::KnaryError;
use crate::{Header, Question, ResourceRecord, UDP_BUFFER_SIZE};

/// A reply under assembly. Counts in the header are derived from the section
/// lengths when the bytes are produced.
#[derive(Debug, Clone)]
pub struct Reply {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Reply {
    /// Turn the reply into a series of bytes to yeet back to the client.
    pub fn as_bytes(&self) -> Result<Vec<u8>, KnaryError> {
        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additional.len() as u16;

        let mut retval: Vec<u8> = header.pack()?.to_vec();
        for question in &self.questions {
            retval.extend(question.to_bytes()?);
        }
        for record in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additional.iter())
        {
            retval.extend(record.to_bytes()?);
        }
        Ok(retval)
    }

    /// UDP replies over the buffer limit are truncated to the header and
    /// question with TC set, so the client retries elsewhere.
    pub fn as_bytes_udp(&self) -> Result<Vec<u8>, KnaryError> {
        let full = self.as_bytes()?;
        if full.len() <= UDP_BUFFER_SIZE {
            return Ok(full);
        }
        let mut truncated = self.clone();
        truncated.header.truncated = true;
        truncated.answers.clear();
        truncated.authorities.clear();
        truncated.additional.clear();
        truncated.as_bytes()
    }
}

/// A minimal reply for when all we can usefully say is an rcode.
pub fn reply_builder(id: u16, rcode: Rcode) -> Reply {
    Reply {
        header: Header {
            id,
            qr: PacketType::Answer,
            rcode,
            ..Default::default()
        },
        questions: vec![],
        answers: vec![],
        authorities: vec![],
        additional: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{RecordClass, RecordType};

    #[test]
    fn test_reply_counts_follow_sections() {
        let mut reply = reply_builder(7, Rcode::NoError);
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
        let bytes = reply.as_bytes().expect("should serialise");
        let header = Header::from_packets(&bytes).expect("should parse");
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.ancount, 1);
        assert_eq!(header.id, 7);
        assert_eq!(header.qr, PacketType::Answer);
    }

    #[test]
    fn test_udp_truncation() {
        let mut reply = reply_builder(1, Rcode::NoError);
        reply.questions.push(Question {
            qname: "big.ex.com.".to_string(),
            qtype: RecordType::TXT,
            qclass: RecordClass::Internet,
        });
        for _ in 0..20 {
            reply.answers.push(ResourceRecord {
                name: "big.ex.com.".to_string(),
                record_type: RecordType::TXT,
                class: RecordClass::Internet,
                ttl: 60,
                rdata: vec![0x41; 200],
            });
        }
        let bytes = reply.as_bytes_udp().expect("should serialise");
        assert!(bytes.len() <= UDP_BUFFER_SIZE);
        let header = Header::from_packets(&bytes).expect("should parse");
        assert!(header.truncated);
        assert_eq!(header.ancount, 0);
    }
}
