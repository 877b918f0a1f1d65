use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use snirect_dns::{DnsUpstream, Resolver};
use snirect_proxy::{Config, ProxyServer};
use snirect_rules::{RawPolicyValue, RawRules, RuleSet};
use snirect_tls::CertificateAuthority;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct TestProxy {
    addr: SocketAddr,
    authority: Arc<CertificateAuthority>,
    resolver: Arc<Resolver>,
}

async fn start_proxy(
    mut config: Config,
    rules: RawRules,
    intercept_port: Option<u16>,
    resolver: Option<Arc<Resolver>>,
) -> TestProxy {
    config.server.address = "127.0.0.1".to_string();
    config.server.port = 0;

    let rules = Arc::new(RuleSet::compile(rules));
    let authority = Arc::new(CertificateAuthority::ephemeral().expect("ephemeral CA"));
    let resolver = resolver.unwrap_or_else(|| {
        Resolver::with_upstreams(config.resolver_config(), Arc::clone(&rules), Vec::new())
    });

    let mut server = ProxyServer::new(
        config,
        rules,
        Arc::clone(&authority),
        Arc::clone(&resolver),
    );
    if let Some(port) = intercept_port {
        server.override_intercept_port(port);
    }

    let listener = server.bind().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(server.run_with_listener(listener));

    TestProxy {
        addr,
        authority,
        resolver,
    }
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buffer = [0u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.expect("read head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
    }
    data
}

async fn connect_through(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.expect("connect proxy");
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("CONNECT");
    let head = read_head(&mut stream).await;
    let text = String::from_utf8_lossy(&head);
    assert!(
        text.starts_with("HTTP/1.1 200"),
        "unexpected CONNECT response: {text}"
    );
    stream
}

/// TLS origin serving one canned HTTP response; records the SNI each
/// handshake presented.
async fn start_tls_origin(
    cert_host: &str,
) -> (SocketAddr, Arc<Mutex<Vec<Option<String>>>>) {
    snirect_tls::install_default_crypto_provider();
    let key = KeyPair::generate().expect("origin key");
    let params =
        CertificateParams::new(vec![cert_host.to_string()]).expect("origin cert params");
    let cert = params.self_signed(&key).expect("origin cert");
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .expect("origin TLS config");
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let seen_snis = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&seen_snis);
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                recorded
                    .lock()
                    .expect("sni log lock")
                    .push(tls.get_ref().1.server_name().map(str::to_string));

                let mut head = Vec::new();
                let mut buffer = [0u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    match tls.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => head.extend_from_slice(&buffer[..read]),
                    }
                }
                let _ = tls
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nhello-origin",
                    )
                    .await;
                let _ = tls.shutdown().await;
            });
        }
    });

    (addr, seen_snis)
}

fn tls_client_for(authority: &CertificateAuthority) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots
        .add(authority.root_cert_der())
        .expect("trust proxy root");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn rules_with_host(host: &str, ip: &str) -> RawRules {
    let mut rules = RawRules::default();
    rules.hosts.insert(host.to_string(), ip.to_string());
    rules
}

fn verify_off_config() -> Config {
    let mut config = Config::default();
    config.check_hostname = RawPolicyValue::Bool(false);
    config
}

async fn spawn_mock_dns(answer: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock dns");
    let addr = socket.local_addr().expect("mock dns addr");
    let queries = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&queries);
    tokio::spawn(async move {
        let mut buffer = [0u8; 4096];
        loop {
            let Ok((received, peer)) = socket.recv_from(&mut buffer).await else {
                return;
            };
            let Ok(request) = Message::from_vec(&buffer[..received]) else {
                continue;
            };
            let Some(query) = request.queries().first().cloned() else {
                continue;
            };

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.set_recursion_available(true);
            response.set_response_code(ResponseCode::NoError);
            response.add_query(query.clone());
            if query.query_type() == RecordType::A {
                counter.fetch_add(1, Ordering::SeqCst);
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    300,
                    RData::A(A(answer)),
                ));
            }
            if let Ok(wire) = response.to_vec() {
                let _ = socket.send_to(&wire, peer).await;
            }
        }
    });

    (addr, queries)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_443_connect_is_a_transparent_byte_tunnel() {
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let echo_addr = echo_listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        let (mut stream, _) = echo_listener.accept().await.expect("accept echo");
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.expect("echo read");
        stream.write_all(&data).await.expect("echo write");
        stream.write_all(b"\x00trailing\xff").await.expect("tail");
    });

    // Rules exist for the host, but a non-HTTPS port must still bypass
    // interception.
    let mut rules = RawRules::default();
    rules
        .alter_hostname
        .insert("127.0.0.1".to_string(), "other.example".to_string());
    let proxy = start_proxy(Config::default(), rules, None, None).await;

    let target = format!("127.0.0.1:{}", echo_addr.port());
    let mut tunnel = connect_through(proxy.addr, &target).await;

    let payload: Vec<u8> = (0u16..512).map(|value| (value % 251) as u8).collect();
    tunnel.write_all(&payload).await.expect("send payload");
    tunnel.shutdown().await.expect("half close");

    let mut returned = Vec::new();
    tunnel.read_to_end(&mut returned).await.expect("read back");

    let mut expected = payload.clone();
    expected.extend_from_slice(b"\x00trailing\xff");
    assert_eq!(returned, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mitm_round_trip_with_verification_off() {
    let (origin_addr, _snis) = start_tls_origin("origin.test").await;
    let rules = rules_with_host("origin.test", "127.0.0.1");
    let proxy = start_proxy(
        verify_off_config(),
        rules,
        Some(origin_addr.port()),
        None,
    )
    .await;

    let target = format!("origin.test:{}", origin_addr.port());
    let tunnel = connect_through(proxy.addr, &target).await;

    let connector = tls_client_for(&proxy.authority);
    let server_name = ServerName::try_from("origin.test").expect("server name");
    let mut tls = connector
        .connect(server_name, tunnel)
        .await
        .expect("TLS through proxy");

    tls.write_all(b"GET / HTTP/1.1\r\nHost: origin.test\r\nConnection: close\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(text.ends_with("hello-origin"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sni_rewrite_reaches_the_origin() {
    let (origin_addr, snis) = start_tls_origin("www.youtube.com").await;

    let mut rules = rules_with_host("www.google.com", "127.0.0.1");
    rules
        .alter_hostname
        .insert("*.google.com".to_string(), "www.youtube.com".to_string());
    let proxy = start_proxy(
        verify_off_config(),
        rules,
        Some(origin_addr.port()),
        None,
    )
    .await;

    let target = format!("www.google.com:{}", origin_addr.port());
    let tunnel = connect_through(proxy.addr, &target).await;

    let connector = tls_client_for(&proxy.authority);
    let server_name = ServerName::try_from("www.google.com").expect("server name");
    let mut tls = connector
        .connect(server_name, tunnel)
        .await
        .expect("TLS through proxy");
    tls.write_all(b"GET / HTTP/1.1\r\nHost: www.google.com\r\nConnection: close\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;

    let recorded = snis.lock().expect("sni log lock");
    assert_eq!(
        recorded.as_slice(),
        &[Some("www.youtube.com".to_string())],
        "origin must see the rewritten SNI"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sni_strip_sends_no_server_name() {
    let (origin_addr, snis) = start_tls_origin("blocked.example").await;

    let mut rules = rules_with_host("blocked.example", "127.0.0.1");
    rules
        .alter_hostname
        .insert("blocked.example".to_string(), String::new());
    let proxy = start_proxy(
        verify_off_config(),
        rules,
        Some(origin_addr.port()),
        None,
    )
    .await;

    let target = format!("blocked.example:{}", origin_addr.port());
    let tunnel = connect_through(proxy.addr, &target).await;

    let connector = tls_client_for(&proxy.authority);
    let server_name = ServerName::try_from("blocked.example").expect("server name");
    let mut tls = connector
        .connect(server_name, tunnel)
        .await
        .expect("TLS through proxy");
    tls.write_all(b"GET / HTTP/1.1\r\nHost: blocked.example\r\nConnection: close\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;

    let recorded = snis.lock().expect("sni log lock");
    assert_eq!(
        recorded.as_slice(),
        &[None],
        "origin must see no SNI extension"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dial_failure_invalidates_the_resolver_cache() {
    let (dns_addr, queries) = spawn_mock_dns(Ipv4Addr::new(127, 0, 0, 1)).await;
    let config = Config::default();
    let rules = Arc::new(RuleSet::compile(RawRules::default()));
    let upstream = Arc::new(DnsUpstream::Udp {
        addr: dns_addr,
        origin: dns_addr.to_string(),
        timeout: Duration::from_secs(2),
    });
    let resolver = Resolver::with_upstreams(
        config.resolver_config(),
        Arc::clone(&rules),
        vec![upstream],
    );

    let proxy = start_proxy(config, RawRules::default(), None, Some(resolver)).await;

    // A port that is known-closed: bind then drop.
    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let closed_port = closed.local_addr().expect("addr").port();
    drop(closed);

    let target = format!("dialfail.example:{closed_port}");
    let mut tunnel = connect_through(proxy.addr, &target).await;
    let mut rest = Vec::new();
    // The dial fails after the 200; the proxy closes silently.
    let _ = tunnel.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    // The dial failure must have invalidated the cache: this resolve goes
    // upstream again instead of reusing the poisoned answer.
    proxy
        .resolver
        .resolve("dialfail.example", None)
        .await
        .expect("fresh resolve");
    assert_eq!(queries.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pac_file_substitutes_the_listener_port() {
    let proxy = start_proxy(Config::default(), RawRules::default(), None, None).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream
        .write_all(b"GET /pac/?t=123 HTTP/1.1\r\nHost: proxy\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("response");
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(
        text.contains("Content-Type: application/x-ns-proxy-autoconfig"),
        "{text}"
    );
    assert!(
        text.contains(&format!("127.0.0.1:{}", proxy.addr.port())),
        "PAC body must carry the live listener port: {text}"
    );
    assert!(!text.contains("{{port}}"), "{text}");
    assert!(!text.contains("{{host}}"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn root_certificate_download() {
    let proxy = start_proxy(Config::default(), RawRules::default(), None, None).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream
        .write_all(b"GET /CERT/root.crt HTTP/1.1\r\nHost: proxy\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("response");
    let text = String::from_utf8_lossy(&response);

    assert!(text.contains("Content-Type: application/x-x509-ca-cert"), "{text}");
    assert!(text.contains("-----BEGIN CERTIFICATE-----"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_http_redirects_to_https() {
    let proxy = start_proxy(Config::default(), RawRules::default(), None, None).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream
        .write_all(b"GET http://example.com/path?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("response");
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 301"), "{text}");
    assert!(
        text.contains("Location: https://example.com/path?q=1"),
        "{text}"
    );
}
