use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::DnsError;

const DEFAULT_DNS_PORT: u16 = 53;
const DEFAULT_DOT_PORT: u16 = 853;
const DEFAULT_DOH_PORT: u16 = 443;
const UDP_RECV_BUFFER: usize = 4096;
const DNS_MESSAGE_MEDIA_TYPE: &str = "application/dns-message";

/// One upstream DNS server with a single capability: exchange a query for a
/// reply. Hostnames inside `tls://` and `https://` upstreams are resolved
/// through the bootstrap path once, at construction, and pinned for the
/// upstream's lifetime.
pub enum DnsUpstream {
    Udp {
        addr: SocketAddr,
        origin: String,
        timeout: Duration,
    },
    Tcp {
        addr: SocketAddr,
        origin: String,
        timeout: Duration,
    },
    Tls {
        addr: SocketAddr,
        server_name: ServerName<'static>,
        connector: TlsConnector,
        origin: String,
        timeout: Duration,
    },
    Https {
        url: String,
        client: reqwest::Client,
        timeout: Duration,
    },
}

impl DnsUpstream {
    pub fn address(&self) -> &str {
        match self {
            DnsUpstream::Udp { origin, .. } => origin,
            DnsUpstream::Tcp { origin, .. } => origin,
            DnsUpstream::Tls { origin, .. } => origin,
            DnsUpstream::Https { url, .. } => url,
        }
    }

    pub async fn exchange(&self, query: &Message) -> Result<Message, DnsError> {
        match self {
            DnsUpstream::Udp { addr, timeout, .. } => {
                with_timeout(*timeout, exchange_udp(*addr, query)).await
            }
            DnsUpstream::Tcp { addr, timeout, .. } => {
                with_timeout(*timeout, exchange_tcp_stream(TcpStream::connect(*addr), query))
                    .await
            }
            DnsUpstream::Tls {
                addr,
                server_name,
                connector,
                timeout,
                ..
            } => {
                let server_name = server_name.clone();
                let connector = connector.clone();
                let addr = *addr;
                with_timeout(*timeout, async move {
                    let tcp = TcpStream::connect(addr).await?;
                    let tls = connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(DnsError::Io)?;
                    exchange_framed(tls, query).await
                })
                .await
            }
            DnsUpstream::Https {
                url,
                client,
                timeout,
            } => with_timeout(*timeout, exchange_doh(client, url, query)).await,
        }
    }
}

async fn with_timeout<T>(
    budget: Duration,
    work: impl std::future::Future<Output = Result<T, DnsError>>,
) -> Result<T, DnsError> {
    tokio::time::timeout(budget, work)
        .await
        .map_err(|_| DnsError::Timeout)?
}

async fn exchange_udp(addr: SocketAddr, query: &Message) -> Result<Message, DnsError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("ipv4 wildcard")
    } else {
        "[::]:0".parse().expect("ipv6 wildcard")
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(&query.to_vec()?).await?;

    let mut buffer = [0u8; UDP_RECV_BUFFER];
    loop {
        let received = socket.recv(&mut buffer).await?;
        let reply = Message::from_vec(&buffer[..received])?;
        // Stray datagrams with a different id belong to another exchange.
        if reply.id() == query.id() {
            return Ok(reply);
        }
    }
}

async fn exchange_tcp_stream(
    connect: impl std::future::Future<Output = std::io::Result<TcpStream>>,
    query: &Message,
) -> Result<Message, DnsError> {
    let stream = connect.await?;
    exchange_framed(stream, query).await
}

/// RFC 1035 stream framing: two-byte big-endian length prefix on both the
/// query and the reply.
async fn exchange_framed<S>(mut stream: S, query: &Message) -> Result<Message, DnsError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let wire = query.to_vec()?;
    let mut framed = Vec::with_capacity(wire.len() + 2);
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);
    stream.write_all(&framed).await?;

    let mut length_prefix = [0u8; 2];
    stream.read_exact(&mut length_prefix).await?;
    let length = u16::from_be_bytes(length_prefix) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;

    Ok(Message::from_vec(&body)?)
}

async fn exchange_doh(
    client: &reqwest::Client,
    url: &str,
    query: &Message,
) -> Result<Message, DnsError> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_MEDIA_TYPE)
        .header(reqwest::header::ACCEPT, DNS_MESSAGE_MEDIA_TYPE)
        .body(query.to_vec()?)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(DnsError::HttpStatus(response.status().as_u16()));
    }

    let body = response.bytes().await?;
    Ok(Message::from_vec(&body)?)
}

/// Races the query across every upstream and returns the first successful
/// reply with the address it came from.
pub async fn exchange_parallel(
    upstreams: &[Arc<DnsUpstream>],
    query: &Message,
) -> Result<(Message, String), DnsError> {
    if upstreams.is_empty() {
        return Err(DnsError::AllUpstreamsFailed("no upstreams".to_string()));
    }
    if upstreams.len() == 1 {
        let upstream = &upstreams[0];
        let reply = upstream.exchange(query).await?;
        return Ok((reply, upstream.address().to_string()));
    }

    let mut tasks = tokio::task::JoinSet::new();
    for upstream in upstreams {
        let upstream = Arc::clone(upstream);
        let query = query.clone();
        tasks.spawn(async move {
            let address = upstream.address().to_string();
            upstream.exchange(&query).await.map(|reply| (reply, address))
        });
    }

    let mut last_error: Option<DnsError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(success)) => {
                tasks.abort_all();
                return Ok(success);
            }
            Ok(Err(error)) => last_error = Some(error),
            Err(_) => {}
        }
    }

    Err(DnsError::AllUpstreamsFailed(
        last_error
            .map(|error| error.to_string())
            .unwrap_or_else(|| "no reply".to_string()),
    ))
}

/// Parses the configured nameserver URLs into upstreams, resolving any
/// hostnames through `bootstrap` (plain UDP resolvers; OS resolver when the
/// list is empty) and pinning the addresses.
pub async fn build_upstreams(
    nameservers: &[String],
    bootstrap: &[String],
    timeout: Duration,
) -> Vec<Arc<DnsUpstream>> {
    let bootstrap_addrs = bootstrap_addresses(bootstrap);
    let mut upstreams = Vec::with_capacity(nameservers.len());

    for entry in nameservers {
        match parse_upstream(entry, &bootstrap_addrs, timeout).await {
            Ok(upstream) => upstreams.push(Arc::new(upstream)),
            Err(error) => {
                warn!(upstream = %entry, %error, "skipping unusable DNS upstream");
            }
        }
    }

    upstreams
}

fn bootstrap_addresses(bootstrap: &[String]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .filter_map(|entry| {
            let entry = entry.strip_prefix("udp://").unwrap_or(entry);
            host_port_to_addr(entry, DEFAULT_DNS_PORT)
        })
        .collect()
}

fn host_port_to_addr(entry: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    None
}

async fn parse_upstream(
    entry: &str,
    bootstrap: &[SocketAddr],
    timeout: Duration,
) -> Result<DnsUpstream, DnsError> {
    if entry.starts_with("https://") {
        return build_doh_upstream(entry, bootstrap, timeout).await;
    }

    if let Some(rest) = entry.strip_prefix("tls://") {
        let (host, port) = split_host_port(rest, DEFAULT_DOT_PORT)?;
        let ip = resolve_pinned(&host, bootstrap, timeout).await?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| DnsError::Unresolvable(host.clone()))?;
        return Ok(DnsUpstream::Tls {
            addr: SocketAddr::new(ip, port),
            server_name,
            connector: dot_connector(),
            origin: entry.to_string(),
            timeout,
        });
    }

    if let Some(rest) = entry.strip_prefix("tcp://") {
        let (host, port) = split_host_port(rest, DEFAULT_DNS_PORT)?;
        let ip = resolve_pinned(&host, bootstrap, timeout).await?;
        return Ok(DnsUpstream::Tcp {
            addr: SocketAddr::new(ip, port),
            origin: entry.to_string(),
            timeout,
        });
    }

    let rest = entry.strip_prefix("udp://").unwrap_or(entry);
    let (host, port) = split_host_port(rest, DEFAULT_DNS_PORT)?;
    let ip = resolve_pinned(&host, bootstrap, timeout).await?;
    Ok(DnsUpstream::Udp {
        addr: SocketAddr::new(ip, port),
        origin: entry.to_string(),
        timeout,
    })
}

async fn build_doh_upstream(
    entry: &str,
    bootstrap: &[SocketAddr],
    timeout: Duration,
) -> Result<DnsUpstream, DnsError> {
    let parsed = url::Url::parse(entry).map_err(|_| DnsError::Unresolvable(entry.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| DnsError::Unresolvable(entry.to_string()))?
        .to_string();
    let port = parsed.port().unwrap_or(DEFAULT_DOH_PORT);

    let mut builder = reqwest::Client::builder().timeout(timeout);
    if host.parse::<IpAddr>().is_err() {
        let ip = resolve_pinned(&host, bootstrap, timeout).await?;
        builder = builder.resolve(&host, SocketAddr::new(ip, port));
    }
    let client = builder.build()?;

    Ok(DnsUpstream::Https {
        url: entry.to_string(),
        client,
        timeout,
    })
}

fn split_host_port(entry: &str, default_port: u16) -> Result<(String, u16), DnsError> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if entry.parse::<IpAddr>().is_ok() {
        return Ok((entry.to_string(), default_port));
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| DnsError::Unresolvable(entry.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((entry.to_string(), default_port)),
    }
}

/// Resolves an upstream's hostname once so its address can be pinned. Tries
/// the bootstrap resolvers in order, then the OS resolver.
async fn resolve_pinned(
    host: &str,
    bootstrap: &[SocketAddr],
    timeout: Duration,
) -> Result<IpAddr, DnsError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    for bootstrap_addr in bootstrap {
        let query = bootstrap_query(host)?;
        let upstream = DnsUpstream::Udp {
            addr: *bootstrap_addr,
            origin: bootstrap_addr.to_string(),
            timeout,
        };
        match upstream.exchange(&query).await {
            Ok(reply) => {
                for record in reply.answers() {
                    if let Some(RData::A(a)) = record.data() {
                        debug!(host, ip = %a.0, bootstrap = %bootstrap_addr, "pinned upstream address");
                        return Ok(IpAddr::V4(a.0));
                    }
                }
            }
            Err(error) => {
                debug!(host, bootstrap = %bootstrap_addr, %error, "bootstrap lookup failed");
            }
        }
    }

    let mut addrs = tokio::net::lookup_host((host, 0)).await?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| DnsError::Unresolvable(host.to_string()))
}

fn bootstrap_query(host: &str) -> Result<Message, DnsError> {
    let mut name = Name::from_utf8(host)?;
    name.set_fqdn(true);
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, RecordType::A));
    Ok(message)
}

fn dot_connector() -> TlsConnector {
    // Pin one provider before the first config build; reqwest may pull a
    // second rustls backend into the graph.
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });

    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::split_host_port;

    #[test]
    fn host_port_splitting() {
        assert_eq!(
            split_host_port("1.1.1.1", 53).expect("bare ip"),
            ("1.1.1.1".to_string(), 53)
        );
        assert_eq!(
            split_host_port("1.1.1.1:5353", 53).expect("ip with port"),
            ("1.1.1.1".to_string(), 5353)
        );
        assert_eq!(
            split_host_port("dns.example", 853).expect("bare host"),
            ("dns.example".to_string(), 853)
        );
        assert_eq!(
            split_host_port("dns.example:8853", 853).expect("host with port"),
            ("dns.example".to_string(), 8853)
        );
        assert_eq!(
            split_host_port("[2606:4700:4700::1111]:53", 853).expect("bracketed ipv6"),
            ("2606:4700:4700::1111".to_string(), 53)
        );
    }
}
