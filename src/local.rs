//! Pre-compiled answers for fixed local domains.
//!
//! Every registration stores a complete reply packet with a zeroed id, so
//! serving a hit is a memcpy plus a two-byte id patch. The table is built
//! before workers start and frozen behind an `Arc`, which is why lookups
//! take no lock.

use std::net::Ipv4Addr;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::codec;

#[derive(Default)]
pub struct PrecompiledTable {
    responses: FxHashMap<String, Bytes>,
}

impl PrecompiledTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local domain. Later registrations of the same name win.
    pub fn add(&mut self, domain: &str, ip: Ipv4Addr) {
        let key = domain.to_ascii_lowercase();
        let packet = codec::build_answer(0, &key, ip);
        self.responses.insert(key, packet);
    }

    /// Return a copy of the stored reply with the caller's query id patched
    /// into octets 0-1. `domain` must already be lowercased.
    pub fn lookup(&self, domain: &str, query_id: u16) -> Option<Vec<u8>> {
        self.responses.get(domain).map(|packet| {
            let mut reply = packet.to_vec();
            reply[..2].copy_from_slice(&query_id.to_be_bytes());
            reply
        })
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}
