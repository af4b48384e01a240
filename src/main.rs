use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flashdns::config::{self, Config, LocalDomain, UpstreamAddr};
use flashdns::server::DnsServer;

/// Interval between performance reports.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "flashdns latency-first A-record resolver", long_about = None)]
struct Args {
    /// Config file path (JSON)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// UDP listen port (overrides the config file)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    /// Comma-separated upstream resolvers, ip or ip:port
    #[arg(short = 'u', long = "upstream")]
    upstream: Option<String>,
    /// Extra local domain, repeatable: --local router.local=192.168.1.1
    #[arg(long = "local", value_name = "DOMAIN=IP")]
    local: Vec<String>,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut cfg, &args)?;
    cfg.validate()?;

    if cfg.upstream_resolvers.is_empty() {
        cfg.upstream_resolvers = default_upstreams();
    }
    if cfg.local_domains.is_empty() {
        cfg.local_domains = stock_local_domains();
    }

    let mut server = DnsServer::new(cfg);
    server.start().context("start dns server")?;

    // Periodic performance report; the workers carry all query traffic.
    loop {
        std::thread::sleep(STATS_INTERVAL);
        let stats = server.stats();
        let cache = server.cache_stats();
        info!(
            total_queries = stats.total_queries,
            cache_hits = stats.cache_hits,
            local_domain_hits = stats.local_domain_hits,
            hit_ratio = stats.hit_ratio,
            avg_ms = stats.avg_response_ms,
            p95_ms = stats.p95_response_ms,
            p99_ms = stats.p99_response_ms,
            cache_size = cache.size,
            evictions = cache.evictions,
            "performance stats"
        );
    }
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn apply_overrides(cfg: &mut Config, args: &Args) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(upstream) = &args.upstream {
        cfg.upstream_resolvers = parse_upstreams(upstream)?;
    }
    for entry in &args.local {
        let (domain, ip) = entry
            .split_once('=')
            .with_context(|| format!("expected DOMAIN=IP, got '{entry}'"))?;
        let ip: Ipv4Addr = ip
            .parse()
            .with_context(|| format!("bad local domain address '{ip}'"))?;
        cfg.local_domains.push(LocalDomain {
            domain: domain.to_owned(),
            ip,
        });
    }
    Ok(())
}

fn parse_upstreams(list: &str) -> anyhow::Result<Vec<UpstreamAddr>> {
    list.split(',')
        .map(|entry| {
            let entry = entry.trim();
            let (ip, port) = match entry.split_once(':') {
                Some((ip, port)) => (
                    ip,
                    port.parse::<u16>()
                        .with_context(|| format!("bad upstream port in '{entry}'"))?,
                ),
                None => (entry, 53),
            };
            let ip: IpAddr = ip
                .parse()
                .with_context(|| format!("bad upstream address '{entry}'"))?;
            Ok(UpstreamAddr { ip, port })
        })
        .collect()
}

fn default_upstreams() -> Vec<UpstreamAddr> {
    [
        "8.8.8.8",       // Google
        "1.1.1.1",       // Cloudflare
        "208.67.222.222", // OpenDNS
    ]
    .iter()
    .map(|ip| UpstreamAddr {
        ip: ip.parse().expect("static upstream address"),
        port: 53,
    })
    .collect()
}

fn stock_local_domains() -> Vec<LocalDomain> {
    [
        ("localhost", Ipv4Addr::new(127, 0, 0, 1)),
        ("router.local", Ipv4Addr::new(192, 168, 1, 1)),
        ("dns.local", Ipv4Addr::new(192, 168, 1, 1)),
        ("server.local", Ipv4Addr::new(192, 168, 1, 100)),
    ]
    .iter()
    .map(|(domain, ip)| LocalDomain {
        domain: (*domain).to_owned(),
        ip: *ip,
    })
    .collect()
}
