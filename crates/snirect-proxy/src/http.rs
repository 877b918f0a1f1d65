use std::io;
use std::sync::atomic::Ordering;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::DEFAULT_PAC_TEMPLATE;
use crate::server::{ProxyContext, RequestHead};

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";
const CA_CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

/// Non-CONNECT requests: PAC delivery, root-CA download, and a 301 to the
/// HTTPS equivalent for everything else.
pub(crate) async fn handle_plain(
    ctx: &ProxyContext,
    mut stream: TcpStream,
    head: &RequestHead,
) -> io::Result<()> {
    let path = request_path(&head.target);

    if path.starts_with("/pac/") || path == "/pac" {
        let body = pac_body(ctx);
        debug!(client = %head.peer, "serving PAC file");
        return write_response(&mut stream, "200 OK", PAC_CONTENT_TYPE, body.as_bytes()).await;
    }

    if path.starts_with("/CERT/root.") {
        let body = ctx.authority.root_cert_pem();
        debug!(client = %head.peer, "serving root CA certificate");
        return write_response(&mut stream, "200 OK", CA_CERT_CONTENT_TYPE, body.as_bytes())
            .await;
    }

    let location = https_equivalent(head, path);
    debug!(client = %head.peer, %location, "redirecting plain HTTP");
    write_redirect(&mut stream, &location).await
}

/// PAC template from disk when present, embedded default otherwise, with
/// `{{host}}` and `{{port}}` substituted against the live listener.
fn pac_body(ctx: &ProxyContext) -> String {
    let template = std::fs::read_to_string(ctx.config.pac_path())
        .unwrap_or_else(|_| DEFAULT_PAC_TEMPLATE.to_string());
    let port = ctx.actual_port.load(Ordering::Relaxed);
    template
        .replace("{{port}}", &port.to_string())
        .replace("{{host}}", &ctx.config.server.pac_host)
}

fn request_path(target: &str) -> &str {
    // Proxy clients send absolute-form URLs; direct clients send
    // origin-form paths.
    if let Some(rest) = target.strip_prefix("http://") {
        match rest.find('/') {
            Some(index) => &rest[index..],
            None => "/",
        }
    } else {
        target
    }
}

fn https_equivalent(head: &RequestHead, path: &str) -> String {
    if let Some(rest) = head.target.strip_prefix("http://") {
        return format!("https://{rest}");
    }
    let host = head.header("host").unwrap_or("localhost");
    format!("https://{host}{path}")
}

pub(crate) async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await
}

async fn write_redirect(stream: &mut TcpStream, location: &str) -> io::Result<()> {
    let header = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes()).await?;
    stream.shutdown().await
}

pub(crate) async fn write_error(stream: &mut TcpStream, status: &str) -> io::Result<()> {
    write_response(stream, status, "text/plain", status.as_bytes()).await
}
