use std::net::IpAddr;

use crate::error::KnaryError;

/// Longest allowed label in a name
const MAX_LABEL_LEN: usize = 63;
/// Longest allowed dotted name
const MAX_NAME_LEN: usize = 255;

/// Encode a dotted name (with or without trailing dot) into wire-format
/// labels. Replies are never compressed, so there is no pointer handling here.
pub fn name_as_bytes(name: &str) -> Result<Vec<u8>, KnaryError> {
    if name.len() > MAX_NAME_LEN {
        return Err(KnaryError::InvalidName(format!(
            "name over {MAX_NAME_LEN} octets: {name:?}"
        )));
    }
    let mut retval: Vec<u8> = Vec::with_capacity(name.len() + 2);
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(KnaryError::InvalidName(format!(
                "label over {MAX_LABEL_LEN} octets in {name:?}"
            )));
        }
        retval.push(label.len() as u8);
        retval.extend_from_slice(label.as_bytes());
    }
    retval.push(0);
    Ok(retval)
}

/// Decode a possibly-compressed name starting at `offset` inside the whole
/// packet. Returns the lowercased dotted name with a trailing dot and the
/// number of bytes the name occupied at `offset` (a pointer counts as two).
///
/// Upstream servers compress aggressively, so this gets exercised by glue
/// discovery and the recursive-proxy branch.
pub fn expand_name(buf: &[u8], offset: usize) -> Result<(String, usize), KnaryError> {
    let mut name = String::new();
    let mut pos = offset;
    let mut consumed: usize = 0;
    let mut jumped = false;
    let mut jumps = 0u8;

    loop {
        let len_byte = *buf
            .get(pos)
            .ok_or_else(|| KnaryError::InvalidName("name ran off the packet".to_string()))?;

        if len_byte & 0xC0 == 0xC0 {
            // compression pointer, ref RFC1035 4.1.4
            let next = *buf.get(pos + 1).ok_or_else(|| {
                KnaryError::InvalidName("truncated compression pointer".to_string())
            })?;
            let target = (((len_byte & 0x3F) as usize) << 8) | next as usize;
            if !jumped {
                consumed += 2;
            }
            jumps += 1;
            if jumps > 16 {
                return Err(KnaryError::InvalidName(
                    "compression pointer loop".to_string(),
                ));
            }
            if target >= pos {
                return Err(KnaryError::InvalidName(
                    "forward compression pointer".to_string(),
                ));
            }
            pos = target;
            jumped = true;
            continue;
        }

        if !jumped {
            consumed += 1 + len_byte as usize;
        }
        if len_byte == 0 {
            break;
        }
        let label_len = len_byte as usize;
        if label_len > MAX_LABEL_LEN {
            return Err(KnaryError::InvalidName(format!(
                "label length {label_len} over {MAX_LABEL_LEN}"
            )));
        }
        let label = buf.get(pos + 1..pos + 1 + label_len).ok_or_else(|| {
            KnaryError::InvalidName("label ran off the packet".to_string())
        })?;
        name.push_str(&String::from_utf8_lossy(label).to_lowercase());
        name.push('.');
        if name.len() > MAX_NAME_LEN {
            return Err(KnaryError::InvalidName(format!(
                "name over {MAX_NAME_LEN} octets while expanding"
            )));
        }
        pos += 1 + label_len;
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok((name, consumed))
}

/// The PTR name of an address, eg `198.51.100.1` becomes
/// `1.100.51.198.in-addr.arpa.`. A computation only, no lookup is made.
pub fn reverse_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(74);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0F, byte >> 4));
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}

/// gets a u16 based on the byte start point
pub fn get_u16_from_packets(packets: &[u8], start_point: usize) -> Option<u16> {
    let end_point = start_point + 2;
    let bytes: [u8; 2] = packets.get(start_point..end_point)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// gets a u32 based on the byte start point
pub fn get_u32_from_packets(packets: &[u8], start_point: usize) -> Option<u32> {
    let end_point = start_point + 4;
    let bytes: [u8; 4] = packets.get(start_point..end_point)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
