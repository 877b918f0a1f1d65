use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ServerConfig;
use snirect_tls::{verify_origin_cert, SniCertResolver};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::bridge::{bridge, Rewind};
use crate::server::{ProxyContext, RequestHead};

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const DEFAULT_CONNECT_PORT: u16 = 443;

/// The CONNECT state machine: admit, parse, 200, intercept decision, then
/// either a transparent byte tunnel or the MITM path. Everything after the
/// 200 is silent to the client; failures terminate the connection and are
/// only logged.
pub(crate) async fn handle_connect(
    ctx: &Arc<ProxyContext>,
    mut client: TcpStream,
    head: RequestHead,
) -> io::Result<()> {
    let _permit = match &ctx.semaphore {
        Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return Ok(()),
        },
        None => None,
    };

    let (host, port) = split_connect_target(&head.target);

    client.write_all(ESTABLISHED).await?;

    if !should_intercept(ctx, &host, port) {
        return tunnel(ctx, client, head, &host, port).await;
    }
    intercept(ctx, client, head, &host, port).await
}

/// MITM only when there is something to gain: an SNI rewrite rule for the
/// host, or a verification policy of Off (origin certificate errors are to
/// be swallowed). Non-HTTPS ports are never intercepted.
fn should_intercept(ctx: &ProxyContext, host: &str, port: u16) -> bool {
    if port != ctx.intercept_port {
        return false;
    }
    if ctx.rules.alter_hostname_for(host).is_some() {
        return true;
    }
    let policy = ctx
        .rules
        .cert_policy_for(host)
        .unwrap_or(&ctx.global_policy);
    !policy.is_enabled()
}

async fn tunnel(
    ctx: &Arc<ProxyContext>,
    mut client: TcpStream,
    head: RequestHead,
    host: &str,
    port: u16,
) -> io::Result<()> {
    let Some(mut origin) = dial_origin(ctx, host, port, head.peer.ip()).await else {
        return Ok(());
    };

    if !head.leftover.is_empty() {
        origin.write_all(&head.leftover).await?;
    }

    info!(client = %head.peer, host, port, "direct tunnel");
    match bridge(&mut client, &mut origin).await {
        Ok((from_client, from_origin)) => {
            debug!(host, from_client, from_origin, "tunnel closed");
            Ok(())
        }
        Err(error) => {
            debug!(host, %error, "tunnel ended with error");
            Ok(())
        }
    }
}

async fn intercept(
    ctx: &Arc<ProxyContext>,
    client: TcpStream,
    head: RequestHead,
    host: &str,
    port: u16,
) -> io::Result<()> {
    // Server half: terminate the client's TLS with a leaf minted for the
    // SNI it asserts (falling back to the CONNECT host).
    let cert_resolver = Arc::new(SniCertResolver::new(
        Arc::clone(&ctx.authority),
        host.to_string(),
    ));
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_resolver);
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let rewound = Rewind::new(head.leftover.clone(), client);
    let mut client_tls = match acceptor.accept(rewound).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(client = %head.peer, host, %error, "client TLS handshake failed");
            return Ok(());
        }
    };

    let client_sni = client_tls
        .get_ref()
        .1
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| host.to_string());

    let target_sni = select_target_sni(ctx, host, &client_sni);

    let Some(origin_tcp) = dial_origin(ctx, host, port, head.peer.ip()).await else {
        let _ = client_tls.shutdown().await;
        return Ok(());
    };

    // Client half: library verification stays off, the policy check below
    // is authoritative.
    let origin_ip = origin_tcp.peer_addr()?.ip();
    let (tls_config, server_name) = match &target_sni {
        Some(sni) => {
            let name = match ServerName::try_from(sni.clone()) {
                Ok(name) => name,
                Err(_) => {
                    warn!(host, sni = %sni, "rewritten SNI is not a valid server name");
                    let _ = client_tls.shutdown().await;
                    return Ok(());
                }
            };
            (Arc::clone(&ctx.origin_tls), name)
        }
        None => (
            Arc::clone(&ctx.origin_tls_no_sni),
            ServerName::IpAddress(origin_ip.into()),
        ),
    };

    let connector = TlsConnector::from(tls_config);
    let mut origin_tls = match connector.connect(server_name, origin_tcp).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(host, %error, "origin TLS handshake failed");
            let _ = client_tls.shutdown().await;
            return Ok(());
        }
    };

    if !origin_cert_acceptable(ctx, &origin_tls, host) {
        warn!(host, "origin certificate verification failed");
        let _ = client_tls.shutdown().await;
        let _ = origin_tls.shutdown().await;
        return Ok(());
    }

    info!(
        client = %head.peer,
        host,
        sni = target_sni.as_deref().unwrap_or("<none>"),
        "intercepted tunnel"
    );

    match bridge(&mut client_tls, &mut origin_tls).await {
        Ok((from_client, from_origin)) => {
            debug!(host, from_client, from_origin, "intercepted tunnel closed");
            Ok(())
        }
        Err(error) => {
            debug!(host, %error, "intercepted tunnel ended with error");
            Ok(())
        }
    }
}

/// `None` means the origin handshake omits SNI entirely.
fn select_target_sni(ctx: &ProxyContext, host: &str, client_sni: &str) -> Option<String> {
    match ctx.rules.alter_hostname_for(client_sni) {
        Some("") => {
            debug!(host, "stripping SNI");
            None
        }
        Some(replacement) => {
            if replacement != client_sni {
                debug!(host, from = client_sni, to = replacement, "rewriting SNI");
            }
            Some(replacement.to_string())
        }
        None => Some(client_sni.to_string()),
    }
}

/// Resolve-and-dial with the configured timeout. A dial failure invalidates
/// the resolver cache for the host so the next attempt can pick another
/// address; the current connection is terminated either way.
async fn dial_origin(
    ctx: &Arc<ProxyContext>,
    host: &str,
    port: u16,
    client_ip: IpAddr,
) -> Option<TcpStream> {
    let ip = match ctx.resolver.resolve(host, Some(client_ip)).await {
        Ok(ip) => ip,
        Err(error) => {
            warn!(host, %error, "DNS resolution failed");
            return None;
        }
    };

    match tokio::time::timeout(ctx.config.dial_timeout(), TcpStream::connect((ip, port))).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(error)) => {
            warn!(host, %ip, port, %error, "origin dial failed");
            ctx.resolver.invalidate(host);
            None
        }
        Err(_) => {
            warn!(host, %ip, port, "origin dial timed out");
            ctx.resolver.invalidate(host);
            None
        }
    }
}

fn origin_cert_acceptable<S>(
    ctx: &ProxyContext,
    origin_tls: &tokio_rustls::client::TlsStream<S>,
    host: &str,
) -> bool {
    let policy = ctx
        .rules
        .cert_policy_for(host)
        .unwrap_or(&ctx.global_policy);
    if !policy.is_enabled() {
        return true;
    }

    let Some(leaf) = origin_tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
    else {
        return false;
    };
    verify_origin_cert(leaf, host, policy)
}

/// CONNECT authority form, port defaulting to 443. IPv6 literals arrive
/// bracketed.
fn split_connect_target(target: &str) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_CONNECT_PORT);
            return (host.to_string(), port);
        }
    }

    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host.to_string(), DEFAULT_CONNECT_PORT),
        },
        _ => (target.to_string(), DEFAULT_CONNECT_PORT),
    }
}
