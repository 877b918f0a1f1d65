mod bridge;
pub mod config;
mod connect;
mod http;
pub mod logging;
mod server;

use thiserror::Error;

pub use config::Config;
pub use server::ProxyServer;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("listener bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("certificate authority error: {0}")]
    Ca(#[from] snirect_tls::TlsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
