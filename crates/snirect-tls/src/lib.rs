mod authority;
mod verify;

use thiserror::Error;

pub use authority::{
    effective_sni, spawn_expiry_sweep, AuthorityMetricsSnapshot, CertificateAuthority, IssuedLeaf,
    SniCertResolver,
};
pub use verify::{build_origin_client_config, verify_origin_cert, AcceptAnyServerCert};

/// Pins aws-lc-rs as the process-level rustls provider. Idempotent; must
/// run before the first TLS config is built when several provider
/// backends end up in the dependency graph.
pub fn install_default_crypto_provider() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("no certificate available for this connection")]
    NoCertificate,
}
