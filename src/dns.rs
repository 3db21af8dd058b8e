//! DNS protocol implementation.
//!
//! This module provides functions for building locally generated DNS
//! messages and for moving messages over TCP with the two-byte length prefix.

use std::io;
use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::DnsError;
use crate::utils::{has_opt_record, question_end, HEADER_LEN, TYPE_A, TYPE_OPT};

/// Append an OPT record advertising `payload_size`.
fn push_opt(response: &mut Vec<u8>, payload_size: u16) {
    response.push(0x00); // Root domain
    response.extend_from_slice(&TYPE_OPT.to_be_bytes());
    response.extend_from_slice(&payload_size.to_be_bytes()); // UDP payload size
    response.extend_from_slice(&[0x00, 0x00]); // Extended RCODE, version
    response.extend_from_slice(&[0x00, 0x00]); // Flags
    response.extend_from_slice(&[0x00, 0x00]); // RDATA length
}

/// Build a DNS response carrying A records.
///
/// # Arguments
/// * `query` - The DNS query.
/// * `addrs` - The addresses to answer with.
/// * `ttl` - Time-to-live in seconds.
/// * `edns_size` - Payload size advertised when the query carried EDNS.
///
/// # Returns
/// A `Result` containing the response or an error.
pub fn build_a_response(
    query: &[u8],
    addrs: &[Ipv4Addr],
    ttl: u32,
    edns_size: u16,
) -> Result<Vec<u8>, DnsError> {
    let qend = question_end(query)
        .ok_or_else(|| DnsError::Protocol("Invalid question format".into()))?;
    let has_edns = has_opt_record(query);
    let mut response = Vec::with_capacity(512);

    // Copy transaction ID from query
    response.extend_from_slice(&query[..2]);

    // QR = 1, AA = 1, RD copied, RA = 1, RCODE = 0
    response.extend_from_slice(&[0x84 | (query[2] & 0x01), 0x80]);

    // QDCOUNT = 1
    response.extend_from_slice(&[0x00, 0x01]);
    response.extend_from_slice(&(addrs.len() as u16).to_be_bytes());
    response.extend_from_slice(&[0x00, 0x00]);
    response.extend_from_slice(&[0x00, if has_edns { 0x01 } else { 0x00 }]);

    // Copy question section from query
    response.extend_from_slice(&query[HEADER_LEN..qend]);

    for addr in addrs {
        // Name pointer to question
        response.extend_from_slice(&[0xc0, 0x0c]);
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x01]); // Class IN
        response.extend_from_slice(&ttl.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x04]);
        response.extend_from_slice(&addr.octets());
    }

    if has_edns {
        push_opt(&mut response, edns_size);
    }

    Ok(response)
}

/// Build an empty response with the given RCODE.
///
/// Used for NOTIMP, NXDOMAIN, SERVFAIL and REFUSED answers.
///
/// # Arguments
/// * `query` - The DNS query.
/// * `rcode` - The response code to set.
///
/// # Returns
/// An `Option` containing the response if the query had a readable header.
pub fn build_error_response(query: &[u8], rcode: u8) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let mut resp = Vec::with_capacity(512);

    // Copy transaction ID from query
    resp.extend_from_slice(&query[0..2]);

    // QR = 1, OPCODE and RD copied, RA = 1
    let opcode = query[2] & 0x78;
    let rd = query[2] & 0x01;
    resp.extend_from_slice(&[0x80 | opcode | rd, 0x80 | (rcode & 0x0f)]);

    match question_end(query) {
        Some(qend) => {
            resp.extend_from_slice(&[0x00, 0x01]);
            resp.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
            resp.extend_from_slice(&query[HEADER_LEN..qend]);
        }
        None => {
            resp.extend_from_slice(&[0x00; 8]);
        }
    }

    Some(resp)
}

/// Replace an upstream answer with NXDOMAIN, keeping its question.
pub fn nxdomain_from(answer: &[u8]) -> Option<Vec<u8>> {
    let mut resp = build_error_response(answer, crate::utils::RCODE_NXDOMAIN)?;
    // keep the upstream's header flags
    resp[2] = answer[2];
    Some(resp)
}

/// Read one length-prefixed DNS message from a TCP stream.
///
/// # Arguments
/// * `stream` - The TCP stream.
///
/// # Returns
/// The message bytes, or an error if the stream closed early.
pub async fn read_tcp_message<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    // Read the 2-byte length prefix
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

/// Send a DNS message over TCP.
///
/// # Arguments
/// * `stream` - The TCP stream to send the message on.
/// * `message` - The DNS message to send.
///
/// # Returns
/// A `Result` indicating success or failure.
pub async fn write_tcp_message<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::query;
    use crate::utils::{extract_domain, rcode, records, RCODE_NOTIMP, RCODE_NXDOMAIN};

    #[test]
    fn a_response_answers_question() {
        let q = query(42, "router.lan", TYPE_A);
        let r = build_a_response(&q, &[Ipv4Addr::new(192, 168, 0, 1)], 60, 1280).unwrap();
        assert_eq!(&r[..2], &q[..2]);
        assert_eq!(extract_domain(&r).as_deref(), Some("router.lan"));
        let spans = records(&r);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].ttl, 60);
        assert_eq!(&r[spans[0].rdata_offset..], &[192, 168, 0, 1]);
    }

    #[test]
    fn error_response_carries_rcode() {
        let q = query(9, "example.com", TYPE_A);
        let r = build_error_response(&q, RCODE_NOTIMP).unwrap();
        assert_eq!(rcode(&r), RCODE_NOTIMP);
        assert_eq!(r.len(), q.len());
        assert!(build_error_response(&q[..5], RCODE_NOTIMP).is_none());
    }

    #[test]
    fn nxdomain_keeps_upstream_flags() {
        let q = query(9, "example.com", TYPE_A);
        let mut upstream = q.clone();
        upstream[2] = 0x81;
        let r = nxdomain_from(&upstream).unwrap();
        assert_eq!(r[2], 0x81);
        assert_eq!(rcode(&r), RCODE_NXDOMAIN);
    }

    #[tokio::test]
    async fn tcp_framing_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let q = query(3, "example.com", TYPE_A);
        write_tcp_message(&mut a, &q).await.unwrap();
        assert_eq!(read_tcp_message(&mut b).await.unwrap(), q);
    }
}
