//! Utility functions for DNS operations.
//!
//! This module provides helper functions for reading and patching DNS
//! messages in wire format without a full decode.

use std::str;

use chrono::{TimeZone, Utc};

/// Size of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// RCODE values we act on.
pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;
pub const RCODE_REFUSED: u8 = 5;

/// Record types we act on.
pub const TYPE_A: u16 = 1;
pub const TYPE_OPT: u16 = 41;

/// A resource record located inside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSpan {
    /// Record type.
    pub rtype: u16,

    /// Record TTL.
    pub ttl: u32,

    /// Offset of the TTL field.
    pub ttl_offset: usize,

    /// Offset of the RDATA.
    pub rdata_offset: usize,

    /// RDATA length.
    pub rdlength: usize,
}

/// Read the transaction id.
pub fn packet_id(packet: &[u8]) -> Option<u16> {
    (packet.len() >= 2).then(|| u16::from_be_bytes([packet[0], packet[1]]))
}

/// Overwrite the transaction id in place.
pub fn set_packet_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Whether the QR bit is set.
pub fn is_response(packet: &[u8]) -> bool {
    packet.len() > 2 && packet[2] & 0x80 != 0
}

/// Whether the TC bit is set.
pub fn is_truncated(packet: &[u8]) -> bool {
    packet.len() > 2 && packet[2] & 0x02 != 0
}

/// Extract the OPCODE.
pub fn opcode(packet: &[u8]) -> u8 {
    if packet.len() > 2 {
        (packet[2] & 0x78) >> 3
    } else {
        0
    }
}

/// Extract the RCODE.
pub fn rcode(packet: &[u8]) -> u8 {
    if packet.len() > 3 {
        packet[3] & 0x0f
    } else {
        0
    }
}

fn count(packet: &[u8], offset: usize) -> usize {
    ((packet[offset] as usize) << 8) | packet[offset + 1] as usize
}

/// Skip a possibly-compressed name.
///
/// # Returns
/// The offset just past the name, or `None` if the name runs off the end.
pub fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)? as usize;
        if len & 0xC0 == 0xC0 {
            return (pos + 2 <= packet.len()).then_some(pos + 2);
        }
        if len == 0 {
            return Some(pos + 1);
        }
        pos += len + 1;
    }
}

/// Offset just past the first question (QNAME, QTYPE, QCLASS).
pub fn question_end(packet: &[u8]) -> Option<usize> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let end = skip_name(packet, HEADER_LEN)? + 4;
    (end <= packet.len()).then_some(end)
}

/// Extract the domain name from a DNS query packet.
///
/// # Arguments
/// * `query` - The DNS query packet.
///
/// # Returns
/// An `Option` containing the lowercased domain name if successfully extracted.
pub fn extract_domain(query: &[u8]) -> Option<String> {
    if query.len() < HEADER_LEN {
        return None; // DNS header is 12 bytes
    }

    let mut pos = HEADER_LEN;
    let mut domain = String::new();

    loop {
        let len = *query.get(pos)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return None; // No compression in a question we are asked
        }
        pos += 1;

        if pos + len > query.len() {
            return None;
        }

        if !domain.is_empty() {
            domain.push('.');
        }

        let label = str::from_utf8(&query[pos..pos + len]).ok()?;
        domain.push_str(label);
        pos += len;
    }

    // QTYPE and QCLASS must follow
    if pos + 5 > query.len() {
        return None;
    }

    Some(domain.to_ascii_lowercase())
}

/// Extract the query type from a DNS query packet.
///
/// # Arguments
/// * `query` - The DNS query packet.
///
/// # Returns
/// An `Option` containing the query type as a u16 if successfully extracted.
pub fn extract_query_type(query: &[u8]) -> Option<u16> {
    let end = question_end(query)?;
    Some(((query[end - 4] as u16) << 8) | query[end - 3] as u16)
}

/// Locate every record in the answer, authority and additional sections.
///
/// Stops quietly at the first malformed record; whatever was located before
/// it is returned.
pub fn records(packet: &[u8]) -> Vec<RecordSpan> {
    let mut found = Vec::new();
    let Some(mut pos) = question_end(packet) else {
        return found;
    };
    let total = count(packet, 6) + count(packet, 8) + count(packet, 10);

    for _ in 0..total {
        let Some(after_name) = skip_name(packet, pos) else {
            break;
        };
        // TYPE, CLASS, TTL, RDLENGTH
        if after_name + 10 > packet.len() {
            break;
        }
        let rtype = count(packet, after_name) as u16;
        let ttl = u32::from_be_bytes([
            packet[after_name + 4],
            packet[after_name + 5],
            packet[after_name + 6],
            packet[after_name + 7],
        ]);
        let rdlength = count(packet, after_name + 8);
        let rdata_offset = after_name + 10;
        if rdata_offset + rdlength > packet.len() {
            break;
        }
        found.push(RecordSpan {
            rtype,
            ttl,
            ttl_offset: after_name + 4,
            rdata_offset,
            rdlength,
        });
        pos = rdata_offset + rdlength;
    }

    found
}

/// Smallest TTL over all records except OPT.
pub fn min_ttl(packet: &[u8]) -> Option<u32> {
    records(packet)
        .iter()
        .filter(|r| r.rtype != TYPE_OPT)
        .map(|r| r.ttl)
        .min()
}

/// Check if a DNS query packet has an OPT record (EDNS).
///
/// # Arguments
/// * `query` - The DNS query packet.
///
/// # Returns
/// A boolean indicating whether the query has an OPT record.
pub fn has_opt_record(query: &[u8]) -> bool {
    records(query).iter().any(|r| r.rtype == TYPE_OPT)
}

/// Encode a domain name in DNS wire format.
///
/// # Arguments
/// * `name` - The domain name to encode.
///
/// # Returns
/// A vector of bytes containing the encoded domain name.
pub fn encode_dns_name(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for part in name.trim_end_matches('.').split('.') {
        if part.is_empty() || part.len() > 63 {
            continue; // Skip invalid labels
        }
        out.push(part.len() as u8);
        out.extend_from_slice(part.as_bytes());
    }
    out.push(0); // Null terminator
    out
}

/// Render unix seconds as a UTC timestamp for logs.
pub fn format_unix_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}
