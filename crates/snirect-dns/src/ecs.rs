use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hickory_proto::rr::RecordType;
use tracing::{debug, info, warn};

const V4_PREFIX: u8 = 24;
const V6_PREFIX: u8 = 48;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Three echo endpoints per family; the first that answers wins.
const V4_ECHO_SERVICES: [&str; 3] = [
    "https://v4.ident.me",
    "https://api4.ipify.org",
    "https://ifconfig.me/ip",
];
const V6_ECHO_SERVICES: [&str; 3] = [
    "https://v6.ident.me",
    "https://api6.ipify.org",
    "https://ifconfig.co/ip",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum EcsMode {
    Off,
    Auto,
    Explicit { network: IpAddr, prefix: u8 },
}

/// EDNS Client Subnet state. In auto mode the detected networks are written
/// once by the startup probe and read per query.
pub struct EcsState {
    mode: EcsMode,
    auto_v4: RwLock<Option<Ipv4Addr>>,
    auto_v6: RwLock<Option<Ipv6Addr>>,
}

impl EcsState {
    /// `setting` is the raw config value: empty (disable), `"auto"`, or an
    /// explicit CIDR used verbatim.
    pub fn from_config(setting: &str) -> EcsState {
        let mode = match setting {
            "" => EcsMode::Off,
            "auto" => EcsMode::Auto,
            cidr => match parse_cidr(cidr) {
                Some((network, prefix)) => EcsMode::Explicit { network, prefix },
                None => {
                    warn!(ecs = cidr, "unparseable ecs setting, disabling ECS");
                    EcsMode::Off
                }
            },
        };
        EcsState {
            mode,
            auto_v4: RwLock::new(None),
            auto_v6: RwLock::new(None),
        }
    }

    pub fn is_auto(&self) -> bool {
        self.mode == EcsMode::Auto
    }

    /// RFC 7871 option payload for a query of `qtype`, or `None` when no
    /// usable network is known. Prefers the ECS family matching the query
    /// type; in auto mode the advertised source prefix is the full address
    /// length even though the carried address is masked, because some
    /// upstreams localize better on full-prefix requests.
    pub fn option_payload(&self, qtype: RecordType, client_ip: Option<IpAddr>) -> Option<Vec<u8>> {
        match &self.mode {
            EcsMode::Off => None,
            EcsMode::Explicit { network, prefix } => Some(encode_subnet(*network, *prefix, false)),
            EcsMode::Auto => {
                let network = self
                    .auto_network_for(qtype)
                    .or_else(|| client_ip.and_then(masked_public_network))?;
                Some(encode_subnet(network, full_prefix(network), true))
            }
        }
    }

    fn auto_network_for(&self, qtype: RecordType) -> Option<IpAddr> {
        let v4 = *self.auto_v4.read().expect("ecs v4 lock");
        let v6 = *self.auto_v6.read().expect("ecs v6 lock");
        if qtype == RecordType::AAAA {
            v6.map(IpAddr::V6).or(v4.map(IpAddr::V4))
        } else {
            v4.map(IpAddr::V4).or(v6.map(IpAddr::V6))
        }
    }

    fn store_detected(&self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                *self.auto_v4.write().expect("ecs v4 lock") = Some(mask_v4(v4, V4_PREFIX));
            }
            IpAddr::V6(v6) => {
                *self.auto_v6.write().expect("ecs v6 lock") = Some(mask_v6(v6, V6_PREFIX));
            }
        }
        info!(network = %ip, "auto ECS network detected");
    }
}

/// Startup probe for auto mode: query the echo services for both families
/// concurrently and store whatever answers first per family.
pub(crate) fn spawn_auto_probe(state: Arc<EcsState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
            Ok(client) => client,
            Err(error) => {
                warn!(%error, "auto ECS probe client could not be built");
                return;
            }
        };

        let v4 = detect_public_ip(&client, &V4_ECHO_SERVICES, false);
        let v6 = detect_public_ip(&client, &V6_ECHO_SERVICES, true);
        let (v4, v6) = tokio::join!(v4, v6);

        match v4 {
            Some(ip) => state.store_detected(ip),
            None => warn!("failed to detect a public IPv4 address for auto ECS"),
        }
        match v6 {
            Some(ip) => state.store_detected(ip),
            None => debug!("no public IPv6 address detected for auto ECS"),
        }
    })
}

async fn detect_public_ip(
    client: &reqwest::Client,
    services: &[&str],
    want_v6: bool,
) -> Option<IpAddr> {
    for service in services {
        let Ok(response) = client.get(*service).send().await else {
            continue;
        };
        let Ok(body) = response.text().await else {
            continue;
        };
        if let Ok(ip) = body.trim().parse::<IpAddr>() {
            if ip.is_ipv6() == want_v6 {
                return Some(ip);
            }
        }
    }
    None
}

/// Masked /24 (v4) or /48 (v6) network derived from a client address, when
/// that address is public enough to be useful to an upstream.
fn masked_public_network(client_ip: IpAddr) -> Option<IpAddr> {
    if !is_public(client_ip) {
        return None;
    }
    Some(match client_ip {
        IpAddr::V4(v4) => IpAddr::V4(mask_v4(v4, V4_PREFIX)),
        IpAddr::V6(v6) => IpAddr::V6(mask_v6(v6, V6_PREFIX)),
    })
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || link_local || unique_local)
        }
    }
}

fn full_prefix(network: IpAddr) -> u8 {
    if network.is_ipv4() {
        32
    } else {
        128
    }
}

/// RFC 7871 wire layout: family (2 bytes), source prefix, scope prefix,
/// then the address truncated to the prefix. With `full_address` set, the
/// whole masked address is carried even though the prefix says otherwise.
fn encode_subnet(network: IpAddr, prefix: u8, full_address: bool) -> Vec<u8> {
    let (family, octets): (u16, Vec<u8>) = match network {
        IpAddr::V4(v4) => (1, mask_v4(v4, prefix.min(32)).octets().to_vec()),
        IpAddr::V6(v6) => (2, mask_v6(v6, prefix.min(128)).octets().to_vec()),
    };

    let address_len = if full_address {
        octets.len()
    } else {
        (prefix as usize).div_ceil(8)
    };

    let mut payload = Vec::with_capacity(4 + address_len);
    payload.extend_from_slice(&family.to_be_bytes());
    payload.push(prefix);
    payload.push(0);
    payload.extend_from_slice(&octets[..address_len]);
    payload
}

fn parse_cidr(text: &str) -> Option<(IpAddr, u8)> {
    let (address, prefix) = text.split_once('/')?;
    let prefix = prefix.parse::<u8>().ok()?;
    match address.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) if prefix <= 32 => Some((IpAddr::V4(mask_v4(v4, prefix)), prefix)),
        IpAddr::V6(v6) if prefix <= 128 => Some((IpAddr::V6(mask_v6(v6, prefix)), prefix)),
        _ => None,
    }
}

fn mask_v4(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    Ipv4Addr::from(u32::from(ip) & mask)
}

fn mask_v6(ip: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    };
    Ipv6Addr::from(u128::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use hickory_proto::rr::RecordType;

    use super::{encode_subnet, is_public, mask_v4, EcsState};

    #[test]
    fn explicit_cidr_is_used_verbatim() {
        let state = EcsState::from_config("203.0.113.0/24");
        let payload = state
            .option_payload(RecordType::A, None)
            .expect("explicit payload");
        // family=1, source=/24, scope=0, three address bytes.
        assert_eq!(payload, vec![0, 1, 24, 0, 203, 0, 113]);
    }

    #[test]
    fn empty_setting_omits_the_option() {
        let state = EcsState::from_config("");
        assert_eq!(state.option_payload(RecordType::A, None), None);
    }

    #[test]
    fn auto_mode_derives_from_public_client_address() {
        let state = EcsState::from_config("auto");
        let client = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 77));
        let payload = state
            .option_payload(RecordType::A, Some(client))
            .expect("derived payload");
        // Advertised /32 over a /24-masked address.
        assert_eq!(payload, vec![0, 1, 32, 0, 198, 51, 100, 0]);
    }

    #[test]
    fn auto_mode_ignores_private_client_addresses() {
        let state = EcsState::from_config("auto");
        let client = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(state.option_payload(RecordType::A, Some(client)), None);
    }

    #[test]
    fn detected_network_beats_client_derivation() {
        let state = EcsState::from_config("auto");
        state.store_detected(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 200)));
        let client = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 77));
        let payload = state
            .option_payload(RecordType::A, Some(client))
            .expect("detected payload");
        assert_eq!(payload, vec![0, 1, 32, 0, 203, 0, 113, 0]);
    }

    #[test]
    fn publicness_checks() {
        assert!(is_public("203.0.113.1".parse().unwrap()));
        assert!(!is_public("10.0.0.1".parse().unwrap()));
        assert!(!is_public("127.0.0.1".parse().unwrap()));
        assert!(!is_public("169.254.0.1".parse().unwrap()));
        assert!(!is_public("fe80::1".parse().unwrap()));
        assert!(!is_public("fd00::1".parse().unwrap()));
        assert!(is_public("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn masking() {
        assert_eq!(
            mask_v4(Ipv4Addr::new(198, 51, 100, 77), 24),
            Ipv4Addr::new(198, 51, 100, 0)
        );
        let payload = encode_subnet("2001:db8:abcd:1234::1".parse().unwrap(), 48, false);
        assert_eq!(payload[..4], [0, 2, 48, 0]);
        assert_eq!(payload.len(), 4 + 6);
    }
}
