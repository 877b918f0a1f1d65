use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, RData, RecordType};
use snirect_rules::RuleSet;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cache::{DnsCache, PreferenceCache};
use crate::ecs::{self, EcsState};
use crate::upstream::{build_upstreams, exchange_parallel, DnsUpstream};
use crate::{DnsError, PreferenceMode, ResolverConfig, QTYPE_SYSTEM};

const CACHE_SWEEP_PERIOD: Duration = Duration::from_secs(10 * 60);
const SYSTEM_TTL_SECS: u32 = 300;
const LATENCY_TEST_PORT: u16 = 443;
const MIN_PREFERENCE_TTL: Duration = Duration::from_secs(5 * 60);
const EDNS_PAYLOAD_SIZE: u16 = 1232;

/// Recursive resolver over encrypted upstreams with rules overrides, two
/// caches, ECS and latency-based IP preference. The single external entry
/// point is [`Resolver::resolve`].
pub struct Resolver {
    config: ResolverConfig,
    rules: Arc<RuleSet>,
    upstreams: Vec<Arc<DnsUpstream>>,
    cache: DnsCache,
    preference_cache: PreferenceCache,
    ecs: Arc<EcsState>,
}

impl Resolver {
    pub async fn new(config: ResolverConfig, rules: Arc<RuleSet>) -> Arc<Resolver> {
        let upstreams =
            build_upstreams(&config.nameservers, &config.bootstrap, config.dns_timeout).await;
        if upstreams.is_empty() && !config.nameservers.is_empty() {
            warn!("no DNS upstream could be constructed, using the system resolver");
        }
        Resolver::with_upstreams(config, rules, upstreams)
    }

    /// Construction with prebuilt upstreams; the public path is
    /// [`Resolver::new`].
    pub fn with_upstreams(
        config: ResolverConfig,
        rules: Arc<RuleSet>,
        upstreams: Vec<Arc<DnsUpstream>>,
    ) -> Arc<Resolver> {
        Arc::new(Resolver {
            cache: DnsCache::new(config.dns_cache_size),
            preference_cache: PreferenceCache::new(config.preference.cache_size),
            ecs: Arc::new(EcsState::from_config(&config.ecs)),
            config,
            rules,
            upstreams,
        })
    }

    /// Spawns the periodic cache sweep and, in auto-ECS mode, the public
    /// address probe. Tasks run until the process exits and own nothing
    /// that leaks on abort.
    pub fn start_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let resolver = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                resolver.cache.evict_expired();
                resolver.preference_cache.evict_expired();
            }
        }));

        if self.ecs.is_auto() {
            handles.push(ecs::spawn_auto_probe(Arc::clone(&self.ecs)));
        }

        handles
    }

    /// Resolves `host` to one address. `client_ip` is only a hint for ECS.
    pub async fn resolve(
        &self,
        host: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<IpAddr, DnsError> {
        let mut target = host.to_string();
        if let Some(replacement) = self.rules.host_override_for(host) {
            if !replacement.is_empty() {
                if let Ok(ip) = replacement.parse::<IpAddr>() {
                    debug!(host, ip = %ip, "static hosts override");
                    return Ok(ip);
                }
                target = replacement.to_string();
            }
        }

        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(ip) = self.preference_cache.get(&target) {
            debug!(host = %target, ip = %ip, "preference cache hit");
            return Ok(ip);
        }

        if self.upstreams.is_empty() {
            return self.resolve_system(host, &target).await;
        }

        match self.resolve_with_preference(&target, client_ip).await {
            Ok((ip, ttl)) => {
                self.preference_cache
                    .insert(&target, ip, self.preference_ttl(ttl));
                Ok(ip)
            }
            Err(error) => {
                debug!(host = %target, %error, "encrypted upstreams failed, trying the system resolver");
                self.resolve_system(host, &target).await
            }
        }
    }

    /// Drops every cached answer for `host` (all qtypes plus the preferred
    /// address). Callers invoke this whenever a dial to the host fails so
    /// the next resolution cannot stick to a poisoned or stale address.
    pub fn invalidate(&self, host: &str) {
        self.invalidate_name(host);
        if let Some(replacement) = self.rules.host_override_for(host) {
            if !replacement.is_empty() && replacement.parse::<IpAddr>().is_err() {
                self.invalidate_name(replacement);
            }
        }
        debug!(host, "resolver cache invalidated");
    }

    fn invalidate_name(&self, name: &str) {
        self.cache.remove(name, u16::from(RecordType::A));
        self.cache.remove(name, u16::from(RecordType::AAAA));
        self.cache.remove(name, QTYPE_SYSTEM);
        self.preference_cache.remove(name);
    }

    async fn resolve_with_preference(
        &self,
        target: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<(IpAddr, u32), DnsError> {
        match self.config.preference.mode {
            PreferenceMode::Ipv4 => {
                self.resolve_qtype_cached(target, RecordType::A, client_ip)
                    .await
            }
            PreferenceMode::Ipv6 => self.resolve_v6_first(target, client_ip).await,
            PreferenceMode::Standard => self.resolve_standard(target, client_ip).await,
            PreferenceMode::Fastest => self.resolve_fastest(target, client_ip).await,
        }
    }

    async fn resolve_standard(
        &self,
        target: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<(IpAddr, u32), DnsError> {
        if self.config.ipv6 {
            self.resolve_v6_first(target, client_ip).await
        } else {
            self.resolve_qtype_cached(target, RecordType::A, client_ip)
                .await
        }
    }

    async fn resolve_v6_first(
        &self,
        target: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<(IpAddr, u32), DnsError> {
        match self
            .resolve_qtype_cached(target, RecordType::AAAA, client_ip)
            .await
        {
            Ok(found) => Ok(found),
            Err(error) => {
                debug!(host = %target, %error, "AAAA lookup failed, falling back to A");
                self.resolve_qtype_cached(target, RecordType::A, client_ip)
                    .await
            }
        }
    }

    async fn resolve_qtype_cached(
        &self,
        target: &str,
        qtype: RecordType,
        client_ip: Option<IpAddr>,
    ) -> Result<(IpAddr, u32), DnsError> {
        let qtype_num = u16::from(qtype);
        if let Some((ip, remaining)) = self.cache.get(target, qtype_num) {
            debug!(host = %target, ip = %ip, ?qtype, "dns cache hit");
            return Ok((ip, remaining));
        }

        let records = self.lookup_all(target, qtype, client_ip).await?;
        let (ip, ttl) = records[0];
        self.cache.insert(target, qtype_num, ip, ttl);
        Ok((ip, ttl))
    }

    /// Queries AAAA and A in parallel, latency-tests every distinct answer
    /// by opening a TCP connection to port 443, and settles on the fastest
    /// successful connect. Zero successes fall back to standard selection.
    async fn resolve_fastest(
        &self,
        target: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<(IpAddr, u32), DnsError> {
        let v6_lookup = async {
            if self.config.ipv6 {
                self.lookup_all(target, RecordType::AAAA, client_ip)
                    .await
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        };
        let v4_lookup = async {
            self.lookup_all(target, RecordType::A, client_ip)
                .await
                .unwrap_or_default()
        };
        let (v6_records, v4_records) = tokio::join!(v6_lookup, v4_lookup);

        let mut candidates: Vec<(IpAddr, u32)> = Vec::new();
        for record in v6_records.into_iter().chain(v4_records) {
            if !candidates.iter().any(|(ip, _)| *ip == record.0) {
                candidates.push(record);
            }
        }
        candidates.truncate(self.config.preference.max_test_ips.max(1));

        if candidates.is_empty() {
            return self.resolve_standard(target, client_ip).await;
        }

        match probe_fastest(
            &candidates,
            LATENCY_TEST_PORT,
            self.config.preference.test_timeout,
        )
        .await
        {
            Some((ip, ttl, latency)) => {
                debug!(host = %target, %ip, ?latency, "fastest address selected");
                let qtype_num = if ip.is_ipv6() {
                    u16::from(RecordType::AAAA)
                } else {
                    u16::from(RecordType::A)
                };
                self.cache.insert(target, qtype_num, ip, ttl);
                Ok((ip, ttl))
            }
            None => {
                debug!(host = %target, "no address passed the latency test, using standard selection");
                self.resolve_standard(target, client_ip).await
            }
        }
    }

    async fn lookup_all(
        &self,
        target: &str,
        qtype: RecordType,
        client_ip: Option<IpAddr>,
    ) -> Result<Vec<(IpAddr, u32)>, DnsError> {
        let query = self.build_query(target, qtype, client_ip)?;
        let (reply, upstream) = exchange_parallel(&self.upstreams, &query).await?;

        if reply.response_code() != ResponseCode::NoError {
            return Err(DnsError::Rcode {
                rcode: reply.response_code().to_string(),
                upstream,
            });
        }

        let records = parse_addresses(&reply, qtype);
        if records.is_empty() {
            return Err(DnsError::NoRecords {
                host: target.to_string(),
                qtype: qtype_label(qtype),
            });
        }

        debug!(
            host = %target,
            ip = %records[0].0,
            ttl = records[0].1,
            qtype = qtype_label(qtype),
            upstream = %upstream,
            "resolved via upstream"
        );
        Ok(records)
    }

    fn build_query(
        &self,
        target: &str,
        qtype: RecordType,
        client_ip: Option<IpAddr>,
    ) -> Result<Message, DnsError> {
        let mut name = Name::from_utf8(target)?;
        name.set_fqdn(true);

        let mut message = Message::new();
        message.set_id(rand::random());
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name, qtype));

        if let Some(payload) = self.ecs.option_payload(qtype, client_ip) {
            let edns = message.extensions_mut().get_or_insert_with(Edns::new);
            edns.set_max_payload(EDNS_PAYLOAD_SIZE);
            edns.options_mut()
                .insert(EdnsOption::Unknown(u16::from(EdnsCode::Subnet), payload));
        }

        Ok(message)
    }

    /// The OS resolver exposes no TTL, so its answers get a flat five
    /// minutes under the reserved qtype 0.
    async fn resolve_system(&self, host: &str, target: &str) -> Result<IpAddr, DnsError> {
        if let Some((ip, _)) = self.cache.get(target, QTYPE_SYSTEM) {
            return Ok(ip);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((target, 0u16))
            .await
            .map_err(|_| DnsError::Unresolvable(host.to_string()))?
            .map(|addr| addr.ip())
            .collect();
        let Some(first) = addrs.first().copied() else {
            return Err(DnsError::Unresolvable(host.to_string()));
        };

        let selected = if self.config.ipv6 {
            addrs.iter().copied().find(IpAddr::is_ipv6).unwrap_or(first)
        } else {
            addrs.iter().copied().find(IpAddr::is_ipv4).unwrap_or(first)
        };

        debug!(host = %target, ip = %selected, "resolved via system resolver");
        self.cache.insert(target, QTYPE_SYSTEM, selected, SYSTEM_TTL_SECS);
        Ok(selected)
    }

    fn preference_ttl(&self, dns_ttl: u32) -> Duration {
        if self.config.preference.cache_ttl > Duration::ZERO {
            return self.config.preference.cache_ttl;
        }
        MIN_PREFERENCE_TTL.max(Duration::from_secs(u64::from(dns_ttl) / 2))
    }
}

/// Latency-tests every candidate concurrently: a TCP connect to
/// `ip:port`, each bounded by `budget`. The lowest measured connect time
/// wins. `None` when nothing accepted in time.
pub async fn probe_fastest(
    candidates: &[(IpAddr, u32)],
    port: u16,
    budget: Duration,
) -> Option<(IpAddr, u32, Duration)> {
    let mut probes = tokio::task::JoinSet::new();
    for (ip, ttl) in candidates.iter().copied() {
        probes.spawn(async move {
            let started = Instant::now();
            match tokio::time::timeout(budget, TcpStream::connect((ip, port))).await {
                Ok(Ok(_stream)) => Some((ip, ttl, started.elapsed())),
                _ => None,
            }
        });
    }

    let mut best: Option<(IpAddr, u32, Duration)> = None;
    while let Some(joined) = probes.join_next().await {
        let Ok(Some(result)) = joined else {
            continue;
        };
        let faster = best
            .map(|(_, _, best_latency)| result.2 < best_latency)
            .unwrap_or(true);
        if faster {
            best = Some(result);
        }
    }
    best
}

fn parse_addresses(reply: &Message, qtype: RecordType) -> Vec<(IpAddr, u32)> {
    reply
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) if qtype == RecordType::A => {
                Some((IpAddr::V4(a.0), record.ttl()))
            }
            Some(RData::AAAA(aaaa)) if qtype == RecordType::AAAA => {
                Some((IpAddr::V6(aaaa.0), record.ttl()))
            }
            _ => None,
        })
        .collect()
}

fn qtype_label(qtype: RecordType) -> &'static str {
    match qtype {
        RecordType::A => "A",
        RecordType::AAAA => "AAAA",
        _ => "other",
    }
}
