use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use rustls::ClientConfig;
use snirect_dns::Resolver;
use snirect_rules::{CertPolicy, RuleSet};
use snirect_tls::{build_origin_client_config, CertificateAuthority};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::{connect, http, ProxyError};

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Shared state for every connection task.
pub(crate) struct ProxyContext {
    pub(crate) config: Config,
    pub(crate) rules: Arc<RuleSet>,
    pub(crate) authority: Arc<CertificateAuthority>,
    pub(crate) resolver: Arc<Resolver>,
    pub(crate) semaphore: Option<Arc<Semaphore>>,
    pub(crate) global_policy: CertPolicy,
    pub(crate) origin_tls: Arc<ClientConfig>,
    pub(crate) origin_tls_no_sni: Arc<ClientConfig>,
    pub(crate) actual_port: AtomicU16,
    pub(crate) intercept_port: u16,
}

/// The listener: one TCP socket accepting HTTP/1.1, with CONNECT dispatched
/// to the interception state machine and everything else to the plain
/// handler.
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(
        config: Config,
        rules: Arc<RuleSet>,
        authority: Arc<CertificateAuthority>,
        resolver: Arc<Resolver>,
    ) -> ProxyServer {
        let semaphore = (config.limit.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.limit.max_connections)));
        let global_policy = config.global_cert_policy();
        let actual_port = AtomicU16::new(config.server.port);

        ProxyServer {
            ctx: Arc::new(ProxyContext {
                rules,
                authority,
                resolver,
                semaphore,
                global_policy,
                origin_tls: build_origin_client_config(true),
                origin_tls_no_sni: build_origin_client_config(false),
                actual_port,
                intercept_port: 443,
                config,
            }),
        }
    }

    /// Test support: treat `port` as the HTTPS port for the intercept
    /// decision instead of 443.
    #[doc(hidden)]
    pub fn override_intercept_port(&mut self, port: u16) {
        let ctx = Arc::get_mut(&mut self.ctx)
            .expect("intercept port can only change before the server runs");
        ctx.intercept_port = port;
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.server.address, self.ctx.config.server.port
        );
        let listener = TcpListener::bind(&addr).await.map_err(ProxyError::Bind)?;
        Ok(listener)
    }

    pub fn local_port(&self) -> u16 {
        self.ctx.actual_port.load(Ordering::Relaxed)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;
        self.ctx
            .actual_port
            .store(local_addr.port(), Ordering::Relaxed);
        info!(addr = %local_addr, "serving");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(error) = handle_connection(ctx, stream, peer).await {
                    debug!(client = %peer, %error, "connection ended with error");
                }
            });
        }
    }
}

pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: Vec<(String, String)>,
    /// Bytes read past the head terminator; they belong to the next
    /// protocol layer.
    pub(crate) leftover: Vec<u8>,
    pub(crate) peer: SocketAddr,
}

impl RequestHead {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

async fn handle_connection(
    ctx: Arc<ProxyContext>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let head = match read_request_head(&mut stream, peer).await {
        Ok(head) => head,
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            // Port scans and health checks close without sending a request.
            return Ok(());
        }
        Err(error) => {
            let status = if error.kind() == io::ErrorKind::InvalidData {
                "431 Request Header Fields Too Large"
            } else {
                "400 Bad Request"
            };
            let _ = http::write_error(&mut stream, status).await;
            return Err(error);
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        connect::handle_connect(&ctx, stream, head).await
    } else {
        http::handle_plain(&ctx, stream, &head).await
    }
}

/// Reads and parses one request head, capped at 64 KiB.
async fn read_request_head(stream: &mut TcpStream, peer: SocketAddr) -> io::Result<RequestHead> {
    let mut data = Vec::with_capacity(1024);
    let mut buffer = [0u8; 1024];

    let head_end = loop {
        if let Some(index) = find_head_end(&data) {
            break index;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        data.extend_from_slice(&buffer[..read]);
    };

    let leftover = data[head_end..].to_vec();
    let head_text = std::str::from_utf8(&data[..head_end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "request head is not UTF-8"))?;

    let mut lines = head_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty request"))?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "malformed request line",
        ));
    };

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        leftover,
        peer,
    })
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

#[cfg(test)]
mod tests {
    use super::find_head_end;

    #[test]
    fn head_end_includes_terminator() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nTLS"), Some(18));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }
}
