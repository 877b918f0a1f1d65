use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const MIN_TTL_SECS: u64 = 60;
const MAX_TTL_SECS: u64 = 86_400;

/// Resolved-address cache keyed by `(hostname, qtype)`. TTLs are clamped to
/// [60 s, 24 h]; when full, a random victim makes room.
pub(crate) struct DnsCache {
    entries: RwLock<HashMap<(String, u16), CacheSlot>>,
    limit: usize,
}

struct CacheSlot {
    ip: IpAddr,
    expires_at: Instant,
}

impl DnsCache {
    pub(crate) fn new(limit: usize) -> DnsCache {
        DnsCache {
            entries: RwLock::new(HashMap::new()),
            limit,
        }
    }

    /// Returns the cached address and the seconds left before it expires.
    pub(crate) fn get(&self, host: &str, qtype: u16) -> Option<(IpAddr, u32)> {
        let entries = self.entries.read().expect("dns cache lock");
        let slot = entries.get(&(host.to_string(), qtype))?;
        let remaining = slot.expires_at.checked_duration_since(Instant::now())?;
        Some((slot.ip, remaining.as_secs() as u32))
    }

    pub(crate) fn insert(&self, host: &str, qtype: u16, ip: IpAddr, ttl_secs: u32) {
        let ttl = (ttl_secs as u64).clamp(MIN_TTL_SECS, MAX_TTL_SECS);
        let mut entries = self.entries.write().expect("dns cache lock");

        if self.limit > 0 && entries.len() >= self.limit {
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }

        entries.insert(
            (host.to_string(), qtype),
            CacheSlot {
                ip,
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
    }

    pub(crate) fn remove(&self, host: &str, qtype: u16) {
        self.entries
            .write()
            .expect("dns cache lock")
            .remove(&(host.to_string(), qtype));
    }

    pub(crate) fn evict_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .expect("dns cache lock")
            .retain(|_, slot| slot.expires_at > now);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().expect("dns cache lock").len()
    }
}

/// Preferred-address cache: one entry per hostname holding the address the
/// last resolution settled on.
pub(crate) struct PreferenceCache {
    entries: RwLock<HashMap<String, CacheSlot>>,
    limit: usize,
}

impl PreferenceCache {
    pub(crate) fn new(limit: usize) -> PreferenceCache {
        PreferenceCache {
            entries: RwLock::new(HashMap::new()),
            limit,
        }
    }

    pub(crate) fn get(&self, host: &str) -> Option<IpAddr> {
        let entries = self.entries.read().expect("preference cache lock");
        let slot = entries.get(host)?;
        (slot.expires_at > Instant::now()).then_some(slot.ip)
    }

    pub(crate) fn insert(&self, host: &str, ip: IpAddr, ttl: Duration) {
        let mut entries = self.entries.write().expect("preference cache lock");

        if self.limit > 0 && entries.len() >= self.limit {
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }

        entries.insert(
            host.to_string(),
            CacheSlot {
                ip,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub(crate) fn remove(&self, host: &str) {
        self.entries
            .write()
            .expect("preference cache lock")
            .remove(host);
    }

    pub(crate) fn evict_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .expect("preference cache lock")
            .retain(|_, slot| slot.expires_at > now);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().expect("preference cache lock").len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::{DnsCache, PreferenceCache};

    const IP1: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));
    const IP2: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 2));

    #[test]
    fn ttl_is_clamped_to_floor() {
        let cache = DnsCache::new(10);
        cache.insert("example.com", 1, IP1, 0);
        let (ip, remaining) = cache.get("example.com", 1).expect("cached");
        assert_eq!(ip, IP1);
        assert!(remaining >= 59, "zero TTL must clamp up to a minute");
    }

    #[test]
    fn ttl_is_clamped_to_ceiling() {
        let cache = DnsCache::new(10);
        cache.insert("example.com", 1, IP1, u32::MAX);
        let (_, remaining) = cache.get("example.com", 1).expect("cached");
        assert!(remaining <= 86_400);
    }

    #[test]
    fn qtypes_are_independent() {
        let cache = DnsCache::new(10);
        cache.insert("example.com", 1, IP1, 300);
        cache.insert("example.com", 28, IP2, 300);
        assert_eq!(cache.get("example.com", 1).map(|(ip, _)| ip), Some(IP1));
        assert_eq!(cache.get("example.com", 28).map(|(ip, _)| ip), Some(IP2));
        cache.remove("example.com", 1);
        assert!(cache.get("example.com", 1).is_none());
        assert!(cache.get("example.com", 28).is_some());
    }

    #[test]
    fn full_cache_evicts_one_victim() {
        let cache = DnsCache::new(2);
        cache.insert("a.example", 1, IP1, 300);
        cache.insert("b.example", 1, IP1, 300);
        cache.insert("c.example", 1, IP1, 300);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn preference_cache_respects_ttl_and_limit() {
        let cache = PreferenceCache::new(2);
        cache.insert("a.example", IP1, Duration::from_secs(60));
        cache.insert("b.example", IP1, Duration::from_secs(60));
        cache.insert("c.example", IP1, Duration::from_secs(60));
        assert_eq!(cache.len(), 2);

        let expiring = PreferenceCache::new(0);
        expiring.insert("fast.example", IP2, Duration::ZERO);
        assert_eq!(expiring.get("fast.example"), None);
    }
}
