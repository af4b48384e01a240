//! DNS wire codec for the A/IN subset.
//!
//! Parses the 12-octet header and a single question, and assembles the three
//! reply shapes this server ever sends: an A answer, a header-only error, and
//! (for the upstream client) a plain query. Everything is hand-assembled so
//! the hot paths never touch a general-purpose message parser.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// A-record query type.
pub const QTYPE_A: u16 = 1;
/// Internet class.
pub const QCLASS_IN: u16 = 1;
/// NOTIMP response code.
pub const RCODE_NOTIMP: u16 = 4;
/// SERVFAIL response code.
pub const RCODE_SERVFAIL: u16 = 2;
/// Largest datagram we receive or send.
pub const MAX_PACKET_SIZE: usize = 512;
/// Fixed DNS header length.
pub const HEADER_LEN: usize = 12;

/// QR=1, RD=1, RA=1, RCODE=0.
const FLAGS_RESPONSE: u16 = 0x8180;
/// RD=1 query flags, used by the upstream client.
const FLAGS_QUERY: u16 = 0x0100;
/// Answers always carry a 300 second TTL regardless of cache freshness.
const ANSWER_TTL: u32 = 300;
/// Pointer to the question name at offset 12.
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
/// Pointer-chase bound; legitimate questions use at most one jump.
const MAX_JUMPS: u8 = 5;

/// Why a datagram was rejected. Everything here is dropped without a reply;
/// the unsupported-qtype case is decided by the dispatcher after a successful
/// parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram shorter than the 12-octet header")]
    Truncated,
    #[error("expected exactly one question, got {0}")]
    QuestionCount(u16),
    #[error("label length {0} exceeds 63 octets")]
    LabelTooLong(u8),
    #[error("name or question runs past the end of the datagram")]
    Overrun,
    #[error("label contains non-ascii octets")]
    NotAscii,
    #[error("name longer than 253 octets")]
    NameTooLong,
    #[error("zero-length name")]
    EmptyName,
    #[error("compression pointer loop")]
    PointerLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

/// A parsed question. `qname` keeps the case exactly as it appeared on the
/// wire; callers lowercase separately when they need a lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: u16,
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

pub fn parse_header(packet: &[u8]) -> Result<Header, ParseError> {
    if packet.len() < HEADER_LEN {
        return Err(ParseError::Truncated);
    }
    Ok(Header {
        id: u16::from_be_bytes([packet[0], packet[1]]),
        flags: u16::from_be_bytes([packet[2], packet[3]]),
        qdcount: u16::from_be_bytes([packet[4], packet[5]]),
        ancount: u16::from_be_bytes([packet[6], packet[7]]),
        nscount: u16::from_be_bytes([packet[8], packet[9]]),
        arcount: u16::from_be_bytes([packet[10], packet[11]]),
    })
}

/// Parse the header plus the single question that must follow it.
///
/// The name decoder accepts uncompressed labels and compression pointers
/// (`0xC0..`). After a jump the read cursor resumes at the octet following
/// the two-octet pointer, so the qtype/qclass fields are read from the right
/// place even when the name lives elsewhere in the message.
pub fn parse_question(packet: &[u8]) -> Result<Question, ParseError> {
    let header = parse_header(packet)?;
    if header.qdcount != 1 {
        return Err(ParseError::QuestionCount(header.qdcount));
    }

    let mut cursor = HEADER_LEN;
    let mut resume = 0usize;
    let mut jumped = false;
    let mut jumps_left = MAX_JUMPS;
    let mut qname = String::new();

    loop {
        let len = *packet.get(cursor).ok_or(ParseError::Overrun)?;

        if len == 0 {
            if !jumped {
                resume = cursor + 1;
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *packet.get(cursor + 1).ok_or(ParseError::Overrun)?;
            if !jumped {
                resume = cursor + 2;
                jumped = true;
            }
            if jumps_left == 0 {
                return Err(ParseError::PointerLoop);
            }
            jumps_left -= 1;
            cursor = ((len as usize & 0x3F) << 8) | low as usize;
            continue;
        }

        // Top bits 01/10 are reserved; anything that is not a pointer must
        // be a plain label of at most 63 octets.
        if len & 0xC0 != 0 {
            return Err(ParseError::LabelTooLong(len));
        }

        let start = cursor + 1;
        let end = start + len as usize;
        if end > packet.len() {
            return Err(ParseError::Overrun);
        }
        let label = &packet[start..end];
        if !label.is_ascii() {
            return Err(ParseError::NotAscii);
        }

        if !qname.is_empty() {
            qname.push('.');
        }
        for &b in label {
            qname.push(b as char);
        }
        if qname.len() > MAX_NAME_LEN {
            return Err(ParseError::NameTooLong);
        }
        cursor = end;
    }

    if qname.is_empty() {
        return Err(ParseError::EmptyName);
    }
    if packet.len() < resume + 4 {
        return Err(ParseError::Overrun);
    }

    Ok(Question {
        id: header.id,
        qname,
        qtype: u16::from_be_bytes([packet[resume], packet[resume + 1]]),
        qclass: u16::from_be_bytes([packet[resume + 2], packet[resume + 3]]),
    })
}

fn put_name(buf: &mut BytesMut, qname: &str) {
    for label in qname.split('.').filter(|l| !l.is_empty()) {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
}

/// Build a one-answer A reply. The question section re-encodes `qname` as
/// given (preserving the client's case), and the answer names it through the
/// fixed pointer to offset 12.
pub fn build_answer(id: u16, qname: &str, ip: Ipv4Addr) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + qname.len() + 2 + 4 + 16);
    buf.put_u16(id);
    buf.put_u16(FLAGS_RESPONSE);
    buf.put_u16(1); // questions
    buf.put_u16(1); // answers
    buf.put_u16(0); // authority
    buf.put_u16(0); // additional

    put_name(&mut buf, qname);
    buf.put_u16(QTYPE_A);
    buf.put_u16(QCLASS_IN);

    buf.put_slice(&NAME_POINTER);
    buf.put_u16(QTYPE_A);
    buf.put_u16(QCLASS_IN);
    buf.put_u32(ANSWER_TTL);
    buf.put_u16(4);
    buf.put_slice(&ip.octets());

    buf.freeze()
}

/// Header-only error reply: echoed id, response flags with `rcode` or'ed in,
/// all section counts zero.
pub fn build_error(id: u16, rcode: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16(id);
    buf.put_u16(FLAGS_RESPONSE | rcode);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.freeze()
}

/// Build a recursion-desired A/IN query, used by the upstream client and the
/// test suites.
pub fn build_query(id: u16, qname: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + qname.len() + 2 + 4);
    buf.put_u16(id);
    buf.put_u16(FLAGS_QUERY);
    buf.put_u16(1);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    put_name(&mut buf, qname);
    buf.put_u16(QTYPE_A);
    buf.put_u16(QCLASS_IN);
    buf.freeze()
}

fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

/// Scan a NOERROR reply and return the RDATA of its first A/IN record.
/// Used to lift an address out of whatever an upstream resolver sends back.
pub fn first_a_record(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < HEADER_LEN || packet[3] & 0x0F != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);
    if ancount == 0 {
        return None;
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)? + 4;
    }

    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        let rdata = pos + 10;
        if rdata + rdlength > packet.len() {
            return None;
        }
        if rtype == QTYPE_A && rclass == QCLASS_IN && rdlength == 4 {
            return Some(Ipv4Addr::new(
                packet[rdata],
                packet[rdata + 1],
                packet[rdata + 2],
                packet[rdata + 3],
            ));
        }
        pos = rdata + rdlength;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips_through_parser() {
        let packet = build_query(0xBEEF, "www.Example.COM");
        let q = parse_question(&packet).expect("parse");
        assert_eq!(q.id, 0xBEEF);
        assert_eq!(q.qname, "www.Example.COM"); // case preserved
        assert_eq!(q.qtype, QTYPE_A);
        assert_eq!(q.qclass, QCLASS_IN);

        // Re-encoding the parsed question reproduces the original buffer.
        let rebuilt = build_query(q.id, &q.qname);
        assert_eq!(&rebuilt[..], &packet[..]);
    }

    #[test]
    fn short_datagram_is_truncated() {
        assert_eq!(parse_question(&[0u8; 5]), Err(ParseError::Truncated));
    }

    #[test]
    fn question_count_must_be_one() {
        let mut packet = build_query(1, "a.com").to_vec();
        packet[5] = 2;
        assert_eq!(parse_question(&packet), Err(ParseError::QuestionCount(2)));
        packet[5] = 0;
        assert_eq!(parse_question(&packet), Err(ParseError::QuestionCount(0)));
    }

    #[test]
    fn oversized_label_is_rejected() {
        let mut packet = vec![0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.push(0x40); // reserved top bits, not a pointer
        packet.extend_from_slice(b"x");
        packet.push(0);
        packet.extend_from_slice(&[0, 1, 0, 1]);
        assert_eq!(parse_question(&packet), Err(ParseError::LabelTooLong(0x40)));
    }

    #[test]
    fn truncated_label_overruns() {
        let mut packet = vec![0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.push(9); // label claims 9 octets, only 2 follow
        packet.extend_from_slice(b"ab");
        assert_eq!(parse_question(&packet), Err(ParseError::Overrun));
    }

    #[test]
    fn missing_qtype_overruns() {
        let mut packet = vec![0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[1, b'a', 0]); // name only, no qtype/qclass
        assert_eq!(parse_question(&packet), Err(ParseError::Overrun));
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut packet = vec![0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0, 0, 1, 0, 1]); // root name, then A/IN
        assert_eq!(parse_question(&packet), Err(ParseError::EmptyName));
    }

    #[test]
    fn pointer_jump_restores_cursor() {
        // Question name is a single pointer at offset 12 referring to labels
        // stored after the fixed fields; qtype/qclass sit right behind the
        // pointer and must still be read from there.
        let mut packet = vec![0x12, 0x34, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xC0, 18]); // pointer to offset 18
        packet.extend_from_slice(&[0, 1, 0, 1]); // qtype=A qclass=IN
        packet.extend_from_slice(&[3, b'f', b'o', b'o', 0]); // offset 18
        let q = parse_question(&packet).expect("parse");
        assert_eq!(q.qname, "foo");
        assert_eq!(q.qtype, QTYPE_A);
        assert_eq!(q.qclass, QCLASS_IN);
    }

    #[test]
    fn pointer_loop_is_bounded() {
        let mut packet = vec![0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xC0, 12]); // points at itself
        packet.extend_from_slice(&[0, 1, 0, 1]);
        assert_eq!(parse_question(&packet), Err(ParseError::PointerLoop));
    }

    #[test]
    fn answer_bytes_are_exact() {
        let packet = build_answer(0x1234, "router.local", Ipv4Addr::new(192, 168, 1, 1));
        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x12, 0x34,             // id
            0x81, 0x80,             // flags
            0, 1, 0, 1, 0, 0, 0, 0, // counts
            6, b'r', b'o', b'u', b't', b'e', b'r',
            5, b'l', b'o', b'c', b'a', b'l', 0,
            0, 1, 0, 1,             // qtype, qclass
            0xC0, 0x0C,             // name pointer
            0, 1, 0, 1,             // type, class
            0, 0, 1, 0x2C,          // ttl 300
            0, 4,                   // rdlength
            192, 168, 1, 1,
        ];
        assert_eq!(&packet[..], expected);
    }

    #[test]
    fn error_reply_is_header_only() {
        let packet = build_error(0xABCD, RCODE_NOTIMP);
        assert_eq!(packet.len(), HEADER_LEN);
        assert_eq!(&packet[..4], &[0xAB, 0xCD, 0x81, 0x84]);
        assert!(packet[4..].iter().all(|&b| b == 0));

        let servfail = build_error(1, RCODE_SERVFAIL);
        assert_eq!(&servfail[2..4], &[0x81, 0x82]);
    }

    #[test]
    fn first_a_record_reads_own_answers() {
        let packet = build_answer(7, "example.com", Ipv4Addr::new(203, 0, 113, 5));
        assert_eq!(first_a_record(&packet), Some(Ipv4Addr::new(203, 0, 113, 5)));
    }

    #[test]
    fn first_a_record_ignores_errors_and_empty_replies() {
        assert_eq!(first_a_record(&build_error(7, RCODE_SERVFAIL)), None);
        let query = build_query(7, "example.com");
        assert_eq!(first_a_record(&query), None);
    }
}
