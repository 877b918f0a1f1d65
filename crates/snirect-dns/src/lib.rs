mod cache;
mod ecs;
mod resolver;
mod upstream;

use std::time::Duration;

use thiserror::Error;

pub use ecs::EcsState;
pub use resolver::{probe_fastest, Resolver};
pub use upstream::{build_upstreams, DnsUpstream};

/// qtype tag for entries produced by the OS resolver, which has no record
/// type of its own.
pub(crate) const QTYPE_SYSTEM: u16 = 0;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS wire format error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DoH transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("DoH status {0}")]
    HttpStatus(u16),
    #[error("upstream {upstream} answered rcode {rcode}")]
    Rcode { rcode: String, upstream: String },
    #[error("no records of type {qtype} for {host}")]
    NoRecords { host: String, qtype: &'static str },
    #[error("exchange timed out")]
    Timeout,
    #[error("all upstreams failed: {0}")]
    AllUpstreamsFailed(String),
    #[error("could not resolve {0}")]
    Unresolvable(String),
}

/// How the resolver picks an address when several are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferenceMode {
    #[default]
    Standard,
    Fastest,
    Ipv6,
    Ipv4,
}

impl PreferenceMode {
    pub fn parse(text: &str) -> PreferenceMode {
        match text {
            "fastest" => PreferenceMode::Fastest,
            "ipv6" => PreferenceMode::Ipv6,
            "ipv4" => PreferenceMode::Ipv4,
            _ => PreferenceMode::Standard,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreferenceConfig {
    pub mode: PreferenceMode,
    /// Per-IP connect budget in fastest mode.
    pub test_timeout: Duration,
    /// Cap on how many answers get latency-tested per query.
    pub max_test_ips: usize,
    /// Zero means derive from the DNS TTL (TTL/2, floor five minutes).
    pub cache_ttl: Duration,
    pub cache_size: usize,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        PreferenceConfig {
            mode: PreferenceMode::Standard,
            test_timeout: Duration::from_millis(500),
            max_test_ips: 10,
            cache_ttl: Duration::ZERO,
            cache_size: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upstream URLs: `https://…`, `tls://…`, `tcp://…`, `udp://…` or bare
    /// host(:port).
    pub nameservers: Vec<String>,
    /// Plain resolvers used to look up the upstream hostnames themselves.
    pub bootstrap: Vec<String>,
    pub ipv6: bool,
    /// "" (omit), "auto", or an explicit CIDR.
    pub ecs: String,
    pub dns_timeout: Duration,
    pub dns_cache_size: usize,
    pub preference: PreferenceConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            nameservers: Vec::new(),
            bootstrap: Vec::new(),
            ipv6: false,
            ecs: String::new(),
            dns_timeout: Duration::from_secs(5),
            dns_cache_size: 10_000,
            preference: PreferenceConfig::default(),
        }
    }
}
