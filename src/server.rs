//! UDP server: socket setup, worker threads, and the per-query dispatcher.
//!
//! Every datagram is classified into one of three serving paths: a
//! pre-compiled local answer, a cache hit, or blocking upstream resolution.
//! Workers are plain threads sharing one socket; a short receive timeout
//! lets them notice the running flag going false.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, DnsCache};
use crate::codec::{self, QCLASS_IN, QTYPE_A, RCODE_NOTIMP, RCODE_SERVFAIL};
use crate::config::Config;
use crate::local::PrecompiledTable;
use crate::stats::{PerformanceStats, ServerStats};
use crate::upstream::{Resolve, UdpResolver};

/// How long a worker blocks in recv before re-checking the running flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);
/// Local-domain replies slower than this get logged.
const SLOW_LOCAL_US: u128 = 100;

pub struct DnsServer {
    config: Config,
    upstreams: Vec<SocketAddr>,
    local_domains: Vec<(String, Ipv4Addr)>,
    resolver: Option<Arc<dyn Resolve>>,
    cache: Arc<DnsCache>,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    socket: Option<UdpSocket>,
    workers: Vec<JoinHandle<()>>,
}

impl DnsServer {
    pub fn new(config: Config) -> Self {
        let cache = Arc::new(DnsCache::with_capacity(
            config.cache_total_capacity,
            config.cache_shards,
        ));
        let stats = Arc::new(ServerStats::new(
            config.reservoir_cap,
            config.reservoir_trim,
        ));
        let upstreams = config
            .upstream_resolvers
            .iter()
            .map(|u| SocketAddr::new(u.ip, u.port))
            .collect();
        let local_domains = config
            .local_domains
            .iter()
            .map(|l| (l.domain.clone(), l.ip))
            .collect();
        Self {
            config,
            upstreams,
            local_domains,
            resolver: None,
            cache,
            stats,
            running: Arc::new(AtomicBool::new(false)),
            socket: None,
            workers: Vec::new(),
        }
    }

    /// Append an upstream resolver to the ordered list tried on cache miss.
    pub fn add_upstream(&mut self, ip: IpAddr, port: u16) {
        self.upstreams.push(SocketAddr::new(ip, port));
    }

    /// Register a fixed local domain. The table is frozen at `start`;
    /// registrations after that are ignored.
    pub fn add_local(&mut self, domain: &str, ip: Ipv4Addr) {
        if self.running.load(Ordering::Relaxed) {
            warn!(qname = %domain, "local domain registered after start, ignoring");
            return;
        }
        self.local_domains.push((domain.to_owned(), ip));
    }

    /// Replace the upstream resolution step; used by embedders and tests.
    pub fn set_resolver(&mut self, resolver: Arc<dyn Resolve>) {
        self.resolver = Some(resolver);
    }

    /// Bind the socket and spawn one worker per hardware thread.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.running.load(Ordering::Relaxed) {
            anyhow::bail!("server already running");
        }

        let socket = bind_socket(self.config.port)
            .with_context(|| format!("bind udp port {}", self.config.port))?;

        let mut table = PrecompiledTable::new();
        for (domain, ip) in &self.local_domains {
            table.add(domain, *ip);
        }
        let table = Arc::new(table);

        let resolver = match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(UdpResolver::new(self.upstreams.clone())) as Arc<dyn Resolve>,
        };

        self.running.store(true, Ordering::Relaxed);

        let num_workers = match num_cpus::get() {
            0 => 4,
            n => n,
        };
        for worker_id in 0..num_workers {
            let worker = Worker {
                socket: socket
                    .try_clone()
                    .with_context(|| format!("clone socket for worker {worker_id}"))?,
                table: Arc::clone(&table),
                cache: Arc::clone(&self.cache),
                resolver: Arc::clone(&resolver),
                stats: Arc::clone(&self.stats),
                running: Arc::clone(&self.running),
                default_ttl: Duration::from_secs(u64::from(self.config.default_ttl_seconds)),
            };
            self.workers
                .push(std::thread::spawn(move || worker.run(worker_id)));
        }

        info!(
            port = self.config.port,
            workers = num_workers,
            local_domains = table.len(),
            upstreams = self.upstreams.len(),
            "dns server started"
        );
        self.socket = Some(socket);
        Ok(())
    }

    /// Flip the running flag and join the workers. In-flight queries finish;
    /// idle workers return within the receive timeout.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.socket = None;
        info!("dns server stopped");
    }

    /// Address the listener actually bound, once started. Useful when the
    /// configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn stats(&self) -> PerformanceStats {
        self.stats.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_socket(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("create socket")?;
    socket.set_reuse_address(true).context("set reuse_address")?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .context("set read timeout")?;
    let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into()).context("bind")?;
    Ok(socket.into())
}

struct Worker {
    socket: UdpSocket,
    table: Arc<PrecompiledTable>,
    cache: Arc<DnsCache>,
    resolver: Arc<dyn Resolve>,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    default_ttl: Duration,
}

impl Worker {
    fn run(self, worker_id: usize) {
        let mut buf = [0u8; codec::MAX_PACKET_SIZE];
        while self.running.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => self.handle_query(&buf[..len], peer),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        error!(worker_id, error = %e, "recv failed");
                    }
                }
            }
        }
    }

    fn handle_query(&self, packet: &[u8], peer: SocketAddr) {
        let t_start = Instant::now();
        self.stats.record_query();

        let question = match codec::parse_question(packet) {
            Ok(q) => q,
            Err(err) => {
                // Malformed datagrams never get a reply.
                debug!(peer = %peer, error = %err, "dropped malformed query");
                return;
            }
        };

        if question.qtype != QTYPE_A || question.qclass != QCLASS_IN {
            let reply = codec::build_error(question.id, RCODE_NOTIMP);
            let _ = self.socket.send_to(&reply, peer);
            debug!(qname = %question.qname, qtype = question.qtype, "unsupported query type");
            return;
        }

        let key = question.qname.to_ascii_lowercase();

        // Path A: pre-compiled local answer.
        if let Some(reply) = self.table.lookup(&key, question.id) {
            let _ = self.socket.send_to(&reply, peer);
            self.stats.record_local_hit();
            let elapsed = t_start.elapsed();
            if elapsed.as_micros() > SLOW_LOCAL_US {
                warn!(qname = %key, elapsed_us = elapsed.as_micros() as u64, "slow local-domain reply");
            }
            return;
        }

        // Path B: cached resolution; the answer echoes the query's case.
        if let Some(ip) = self.cache.get(&key) {
            let reply = codec::build_answer(question.id, &question.qname, ip);
            let _ = self.socket.send_to(&reply, peer);
            self.stats.record_cache_hit();
            self.stats
                .record_response_time(t_start.elapsed().as_secs_f64() * 1000.0);
            debug!(qname = %key, path = "cache", "served");
            return;
        }

        // Path C: blocking upstream resolution. Failures answer SERVFAIL
        // and are never cached.
        match self.resolver.resolve(&key) {
            Some(ip) => {
                self.cache.set(&key, ip, self.default_ttl);
                let reply = codec::build_answer(question.id, &question.qname, ip);
                let _ = self.socket.send_to(&reply, peer);
                debug!(qname = %key, path = "upstream", "served");
            }
            None => {
                let reply = codec::build_error(question.id, RCODE_SERVFAIL);
                let _ = self.socket.send_to(&reply, peer);
                debug!(qname = %key, "upstream resolution failed");
            }
        }
        self.stats
            .record_response_time(t_start.elapsed().as_secs_f64() * 1000.0);
    }
}
