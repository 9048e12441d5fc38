use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::enums::{RecordClass, RecordType};
use crate::error::KnaryError;
use crate::utils::name_as_bytes;
use crate::zone::ZoneEntry;
use crate::ResourceRecord;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainName {
    pub name: String,
}

impl DomainName {
    /// wire-format label bytes
    pub fn as_bytes(&self) -> Result<Vec<u8>, KnaryError> {
        name_as_bytes(&self.name)
    }
}

impl From<&str> for DomainName {
    fn from(input: &str) -> Self {
        // SOA RNAMEs are mailboxes, `admin@ex.com` is `admin.ex.com` on the wire
        let name = match input.contains('@') {
            false => String::from(input),
            true => input.replace('@', "."),
        };
        DomainName { name }
    }
}

impl From<String> for DomainName {
    fn from(name: String) -> Self {
        DomainName { name }
    }
}

/// <character-string> is a single length octet followed by that number of
/// characters, up to 255 of them.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DNSCharString {
    pub data: Vec<u8>,
}

impl From<&str> for DNSCharString {
    fn from(input: &str) -> Self {
        DNSCharString { data: input.into() }
    }
}

impl DNSCharString {
    /// Returns the bytes for a packet: the length then the string, truncated
    /// to the 255-byte limit.
    fn as_bytes(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        data.truncate(255);
        let mut res: Vec<u8> = vec![data.len() as u8];
        res.extend(&data);
        res
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum InternalResourceRecord {
    /// A single host address
    A { address: Ipv4Addr, ttl: u32 },
    /// IPv6 host address <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA { address: Ipv6Addr, ttl: u32 },
    /// The canonical name for an alias
    CNAME { cname: DomainName, ttl: u32 },
    /// An authoritative name server
    NS { nsdname: DomainName, ttl: u32 },
    /// Text strings
    TXT { txtdata: DNSCharString, ttl: u32 },
    /// Marks the start of a zone of authority
    SOA {
        /// The <domain-name> of the name server that was the original or primary source of data for this zone.
        mname: DomainName,
        /// A <domain-name> which specifies the mailbox of the person responsible for this zone.
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    },
}

impl InternalResourceRecord {
    pub fn rtype(&self) -> RecordType {
        match self {
            InternalResourceRecord::A { .. } => RecordType::A,
            InternalResourceRecord::AAAA { .. } => RecordType::AAAA,
            InternalResourceRecord::CNAME { .. } => RecordType::CNAME,
            InternalResourceRecord::NS { .. } => RecordType::NS,
            InternalResourceRecord::TXT { .. } => RecordType::TXT,
            InternalResourceRecord::SOA { .. } => RecordType::SOA,
        }
    }

    pub fn ttl(&self) -> u32 {
        match self {
            InternalResourceRecord::A { ttl, .. }
            | InternalResourceRecord::AAAA { ttl, .. }
            | InternalResourceRecord::CNAME { ttl, .. }
            | InternalResourceRecord::NS { ttl, .. }
            | InternalResourceRecord::TXT { ttl, .. }
            | InternalResourceRecord::SOA { ttl, .. } => *ttl,
        }
    }

    /// The type-specific RDATA payload bytes.
    pub fn rdata_bytes(&self) -> Result<Vec<u8>, KnaryError> {
        match self {
            InternalResourceRecord::A { address, .. } => Ok(address.octets().to_vec()),
            InternalResourceRecord::AAAA { address, .. } => Ok(address.octets().to_vec()),
            InternalResourceRecord::CNAME { cname, .. } => cname.as_bytes(),
            InternalResourceRecord::NS { nsdname, .. } => nsdname.as_bytes(),
            InternalResourceRecord::TXT { txtdata, .. } => Ok(txtdata.as_bytes()),
            InternalResourceRecord::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                let mut bytes = mname.as_bytes()?;
                bytes.extend(rname.as_bytes()?);
                bytes.extend(serial.to_be_bytes());
                bytes.extend(refresh.to_be_bytes());
                bytes.extend(retry.to_be_bytes());
                bytes.extend(expire.to_be_bytes());
                bytes.extend(minimum.to_be_bytes());
                Ok(bytes)
            }
        }
    }

    /// Assemble a wire-format record for the given owner name.
    pub fn as_wire(&self, owner: &str) -> Result<ResourceRecord, KnaryError> {
        Ok(ResourceRecord {
            name: owner.to_string(),
            record_type: self.rtype(),
            class: RecordClass::Internet,
            ttl: self.ttl(),
            rdata: self.rdata_bytes()?,
        })
    }
}

/// tests to ensure that no label in the name is longer than 63 octets (bytes)
pub fn check_long_labels(testval: &str) -> bool {
    testval.split('.').any(|x| x.len() > 63)
}

impl TryFrom<&ZoneEntry> for InternalResourceRecord {
    type Error = KnaryError;

    /// This is where zone-file text becomes an internal representation of the
    /// record.
    fn try_from(entry: &ZoneEntry) -> Result<Self, Self::Error> {
        if check_long_labels(&entry.owner) {
            return Err(KnaryError::InvalidName(format!(
                "at least one label is over 63 octets in {}, refusing to serve it",
                entry.owner
            )));
        }
        if entry.owner.len() > 255 {
            return Err(KnaryError::InvalidName(format!(
                "name {} is over 255 octets, refusing to serve it",
                entry.owner
            )));
        }

        match entry.rtype {
            RecordType::A => {
                let address = Ipv4Addr::from_str(&entry.rdata).map_err(|error| {
                    KnaryError::ZoneFile(format!(
                        "failed to parse {:?} into an IPv4 address: {error}",
                        entry.rdata
                    ))
                })?;
                Ok(InternalResourceRecord::A {
                    address,
                    ttl: entry.ttl,
                })
            }
            RecordType::AAAA => {
                let address = Ipv6Addr::from_str(&entry.rdata).map_err(|error| {
                    KnaryError::ZoneFile(format!(
                        "failed to parse {:?} into an IPv6 address: {error}",
                        entry.rdata
                    ))
                })?;
                Ok(InternalResourceRecord::AAAA {
                    address,
                    ttl: entry.ttl,
                })
            }
            RecordType::CNAME => Ok(InternalResourceRecord::CNAME {
                cname: DomainName::from(entry.rdata.as_str()),
                ttl: entry.ttl,
            }),
            RecordType::NS => Ok(InternalResourceRecord::NS {
                nsdname: DomainName::from(entry.rdata.as_str()),
                ttl: entry.ttl,
            }),
            RecordType::TXT => Ok(InternalResourceRecord::TXT {
                txtdata: DNSCharString::from(entry.rdata.as_str()),
                ttl: entry.ttl,
            }),
            RecordType::SOA => {
                let fields: Vec<&str> = entry.rdata.split_whitespace().collect();
                if fields.len() != 7 {
                    return Err(KnaryError::ZoneFile(format!(
                        "SOA rdata needs 7 fields, got {:?}",
                        entry.rdata
                    )));
                }
                let numbers: Vec<u32> = fields[2..]
                    .iter()
                    .map(|f| u32::from_str(f))
                    .collect::<Result<Vec<u32>, _>>()
                    .map_err(|error| {
                        KnaryError::ZoneFile(format!("bad SOA counter: {error}"))
                    })?;
                Ok(InternalResourceRecord::SOA {
                    mname: DomainName::from(fields[0]),
                    rname: DomainName::from(fields[1]),
                    serial: numbers[0],
                    refresh: numbers[1],
                    retry: numbers[2],
                    expire: numbers[3],
                    minimum: numbers[4],
                    ttl: entry.ttl,
                })
            }
            other => Err(KnaryError::ZoneFile(format!(
                "record type {other} has no internal representation"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_long_labels() {
        assert!(!check_long_labels("hello."));
        assert!(!check_long_labels("hello.world"));
        assert!(check_long_labels(&format!("foo.{}", "a".repeat(64))));
    }

    #[test]
    fn test_a_record_from_zone_entry() {
        let entry = ZoneEntry {
            owner: "www.ex.com.".to_string(),
            ttl: 60,
            rtype: RecordType::A,
            rdata: "192.0.2.5".to_string(),
        };
        let record = InternalResourceRecord::try_from(&entry).expect("should convert");
        assert_eq!(
            record,
            InternalResourceRecord::A {
                address: Ipv4Addr::new(192, 0, 2, 5),
                ttl: 60
            }
        );
        let wire = record.as_wire("www.ex.com.").expect("should serialise");
        assert_eq!(wire.rdata, vec![192, 0, 2, 5]);
        assert_eq!(wire.ttl, 60);
    }

    #[test]
    fn test_bad_address_is_an_error() {
        let entry = ZoneEntry {
            owner: "www.ex.com.".to_string(),
            ttl: 60,
            rtype: RecordType::A,
            rdata: "not-an-ip".to_string(),
        };
        assert!(InternalResourceRecord::try_from(&entry).is_err());
    }

    #[test]
    fn test_txt_charstring_truncates() {
        let long = "x".repeat(300);
        let txt = DNSCharString::from(long.as_str());
        let bytes = txt.as_bytes();
        assert_eq!(bytes[0], 255);
        assert_eq!(bytes.len(), 256);
    }

    #[test]
    fn test_soa_from_zone_entry() {
        let entry = ZoneEntry {
            owner: "ex.com.".to_string(),
            ttl: 300,
            rtype: RecordType::SOA,
            rdata: "ns.ex.com. admin.ex.com. 2021041401 7200 3600 604800 300".to_string(),
        };
        let record = InternalResourceRecord::try_from(&entry).expect("should convert");
        match record {
            InternalResourceRecord::SOA { serial, minimum, .. } => {
                assert_eq!(serial, 2021041401);
                assert_eq!(minimum, 300);
            }
            other => panic!("expected SOA, got {other:?}"),
        }
    }
}
