//! Blocking upstream resolution.
//!
//! The dispatcher only needs `resolve(domain) -> Option<Ipv4Addr>`, captured
//! by the [`Resolve`] trait so tests can substitute a stub. The production
//! implementation sends an A/IN query to each configured resolver in order
//! over plain UDP and takes the first usable answer.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

pub trait Resolve: Send + Sync {
    fn resolve(&self, domain: &str) -> Option<Ipv4Addr>;
}

pub struct UdpResolver {
    resolvers: Vec<SocketAddr>,
    timeout: Duration,
    next_id: AtomicU16,
}

impl UdpResolver {
    pub fn new(resolvers: Vec<SocketAddr>) -> Self {
        Self::with_timeout(resolvers, UPSTREAM_TIMEOUT)
    }

    pub fn with_timeout(resolvers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            resolvers,
            timeout,
            next_id: AtomicU16::new(1),
        }
    }

    fn query_one(&self, addr: SocketAddr, query: &[u8], id: u16) -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.set_read_timeout(Some(self.timeout)).ok()?;
        socket.send_to(query, addr).ok()?;

        let mut buf = [0u8; codec::MAX_PACKET_SIZE];
        let (len, _) = socket.recv_from(&mut buf).ok()?;
        let reply = &buf[..len];
        if len < codec::HEADER_LEN || reply[..2] != id.to_be_bytes() {
            return None;
        }
        codec::first_a_record(reply)
    }
}

impl Resolve for UdpResolver {
    fn resolve(&self, domain: &str) -> Option<Ipv4Addr> {
        if self.resolvers.is_empty() {
            warn!("no upstream resolvers configured");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = codec::build_query(id, domain);

        for &addr in &self.resolvers {
            match self.query_one(addr, &query, id) {
                Some(ip) => return Some(ip),
                None => {
                    debug!(upstream = %addr, qname = %domain, "upstream attempt failed");
                }
            }
        }
        None
    }
}
