//! # flashdns — latency-first A-record resolver
//!
//! Serves A/IN queries in microseconds from a table of pre-compiled local
//! answers or a sharded in-process cache, falling back to blocking upstream
//! resolution only on miss.
//!
//! ```text
//! [Client] → UDP → [worker thread]
//!                      │
//!                      ├── PrecompiledTable → HIT → prebuilt packet, id patched
//!                      │
//!                      └── MISS → [DnsCache 16×TTL+LRU] → HIT → assembled answer
//!                                      │
//!                                      └── MISS → upstream resolve → cache + answer
//! ```
//!
//! ## Modules
//!
//! - **codec**: wire parsing and byte-exact reply assembly (RFC 1035 subset)
//! - **cache**: sharded TTL+LRU map, one mutex per shard
//! - **local**: frozen domain → reply-packet table
//! - **server**: worker pool and the three-path query dispatcher
//! - **upstream**: blocking resolver client behind the `Resolve` trait
//! - **stats**: counters and the response-time reservoir
//! - **config**: JSON config with defaults and validation

pub mod cache;
pub mod codec;
pub mod config;
pub mod local;
pub mod server;
pub mod stats;
pub mod upstream;

pub use cache::{CacheStats, DnsCache};
pub use config::Config;
pub use local::PrecompiledTable;
pub use server::DnsServer;
pub use stats::PerformanceStats;
pub use upstream::{Resolve, UdpResolver};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
