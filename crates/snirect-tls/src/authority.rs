use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::TlsError;

const ROOT_COMMON_NAME: &str = "Snirect Root CA";
const ROOT_ORGANIZATION: &str = "Snirect";
const LEAF_ORGANIZATION: &str = "Snirect Proxy";
const ROOT_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_BACKDATE: time::Duration = time::Duration::hours(1);
const LEAF_VALIDITY: time::Duration = time::Duration::hours(24);
const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

/// A leaf minted for one SNI: DER certificate plus its PKCS#8 private key.
pub struct IssuedLeaf {
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub not_after: OffsetDateTime,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

struct CachedLeaf {
    certified_key: Arc<CertifiedKey>,
    not_after: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorityMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

/// Owns the root keypair and the per-SNI leaf cache.
///
/// Leaf issuance is at-most-once per SNI: the first arrival signs under the
/// cache entry lock, later arrivals for the same SNI block on that entry and
/// reuse the stored leaf.
pub struct CertificateAuthority {
    ca: Mutex<CaMaterial>,
    leaf_cache: DashMap<String, CachedLeaf>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_leaves", &self.leaf_cache.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Adopts the root material at `cert_path`/`key_path` when both parse
    /// and the key's public half equals the certificate's subject public
    /// key; otherwise generates a fresh root and persists it (key file mode
    /// 0600). Idempotent.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        crate::install_default_crypto_provider();
        if let (Ok(cert_pem), Ok(key_pem)) =
            (fs::read_to_string(cert_path), fs::read_to_string(key_path))
        {
            match adopt_material(&cert_pem, &key_pem) {
                Ok(material) => return Ok(Self::from_material(material)),
                Err(error) => {
                    warn!(%error, "stored root CA rejected, generating a fresh one");
                }
            }
        }

        let material = generate_material()?;
        persist_material(cert_path, key_path, &material)?;
        Ok(Self::from_material(material))
    }

    /// A root that lives only in memory. Used by tests and by callers that
    /// manage persistence themselves.
    pub fn ephemeral() -> Result<Self, TlsError> {
        crate::install_default_crypto_provider();
        Ok(Self::from_material(generate_material()?))
    }

    fn from_material(material: CaMaterial) -> Self {
        CertificateAuthority {
            ca: Mutex::new(material),
            leaf_cache: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn root_cert_pem(&self) -> String {
        self.ca.lock().expect("ca material lock").cert_pem.clone()
    }

    pub fn root_cert_der(&self) -> CertificateDer<'static> {
        self.ca.lock().expect("ca material lock").cert_der.clone()
    }

    /// Mints a fresh leaf for `host` without touching the cache.
    pub fn sign_leaf(&self, host: &str) -> Result<IssuedLeaf, TlsError> {
        let not_before = OffsetDateTime::now_utc() - LEAF_BACKDATE;
        let not_after = OffsetDateTime::now_utc() + LEAF_VALIDITY;
        let params = build_leaf_params(host, not_before, not_after)?;
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        let ca = self.ca.lock().expect("ca material lock");
        let leaf_cert = params.signed_by(&leaf_key, &ca.issuer)?;
        drop(ca);

        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        debug!(host, "issued leaf certificate");

        Ok(IssuedLeaf {
            cert_der: leaf_cert.der().clone(),
            key_der: leaf_key.serialize_der(),
            not_after,
        })
    }

    /// Returns the cached leaf for `sni`, signing one if missing or past
    /// its NotAfter.
    pub fn certified_key_for(&self, sni: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        let normalized = normalize_host(sni);
        let now = OffsetDateTime::now_utc();

        match self.leaf_cache.entry(normalized) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().not_after > now {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(&occupied.get().certified_key));
                }
                let fresh = self.issue_cached_leaf(occupied.key())?;
                let certified_key = Arc::clone(&fresh.certified_key);
                occupied.insert(fresh);
                Ok(certified_key)
            }
            Entry::Vacant(vacant) => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                let fresh = self.issue_cached_leaf(vacant.key())?;
                let certified_key = Arc::clone(&fresh.certified_key);
                vacant.insert(fresh);
                Ok(certified_key)
            }
        }
    }

    fn issue_cached_leaf(&self, host: &str) -> Result<CachedLeaf, TlsError> {
        let leaf = self.sign_leaf(host)?;
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf.key_der));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(|error| TlsError::InvalidMaterial(error.to_string()))?;
        let chain = vec![leaf.cert_der, self.root_cert_der()];
        Ok(CachedLeaf {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_after: leaf.not_after,
        })
    }

    /// Removes leaves whose NotAfter has passed. Returns how many were
    /// evicted.
    pub fn evict_expired(&self, now: OffsetDateTime) -> usize {
        let before = self.leaf_cache.len();
        self.leaf_cache.retain(|_, leaf| leaf.not_after > now);
        before - self.leaf_cache.len()
    }

    pub fn cached_leaf_count(&self) -> usize {
        self.leaf_cache.len()
    }

    pub fn metrics_snapshot(&self) -> AuthorityMetricsSnapshot {
        AuthorityMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

/// Hourly background sweep over the leaf cache.
pub fn spawn_expiry_sweep(authority: Arc<CertificateAuthority>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_PERIOD);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = authority.evict_expired(OffsetDateTime::now_utc());
            if evicted > 0 {
                debug!(evicted, "expired leaf certificates evicted");
            }
        }
    })
}

/// rustls certificate selection callback for the client-facing handshake.
///
/// Falls back to the CONNECT host when the ClientHello carries no SNI. When
/// that fallback is itself an IP literal there is no name the client has
/// asserted, so no certificate is returned and the handshake fails.
pub struct SniCertResolver {
    authority: Arc<CertificateAuthority>,
    fallback_host: String,
}

impl SniCertResolver {
    pub fn new(authority: Arc<CertificateAuthority>, fallback_host: impl Into<String>) -> Self {
        SniCertResolver {
            authority,
            fallback_host: fallback_host.into(),
        }
    }
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("fallback_host", &self.fallback_host)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = match effective_sni(client_hello.server_name(), &self.fallback_host) {
            Some(name) => name,
            None => {
                debug!(
                    host = %self.fallback_host,
                    "no SNI and IP-literal CONNECT host, refusing to mint a certificate"
                );
                return None;
            }
        };

        match self.authority.certified_key_for(&name) {
            Ok(certified_key) => Some(certified_key),
            Err(error) => {
                warn!(host = %name, %error, "leaf issuance failed during handshake");
                None
            }
        }
    }
}

/// Name the minted certificate will assert. With no SNI the CONNECT host
/// stands in, unless it is an IP literal: the client asserted no name at
/// all then, and the handshake is allowed to fail.
pub fn effective_sni(sni: Option<&str>, fallback_host: &str) -> Option<String> {
    match sni {
        Some(name) if !name.is_empty() => Some(name.to_string()),
        _ if fallback_host.parse::<IpAddr>().is_ok() => None,
        _ => Some(fallback_host.to_string()),
    }
}

fn generate_material() -> Result<CaMaterial, TlsError> {
    // RSA first for the widest client compatibility; ECDSA where the
    // backend cannot generate RSA keys.
    let ca_key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .or_else(|_| KeyPair::generate())?;

    let params = build_root_params();
    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let key_pem = ca_key.serialize_pem();
    let issuer = Issuer::new(params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn adopt_material(cert_pem: &str, key_pem: &str) -> Result<CaMaterial, TlsError> {
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
        .map_err(|error| TlsError::InvalidMaterial(format!("root certificate PEM: {error}")))?;
    let key_pair = KeyPair::from_pem(key_pem)
        .map_err(|error| TlsError::InvalidMaterial(format!("root key PEM: {error}")))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
        .map_err(|error| TlsError::InvalidMaterial(format!("root certificate DER: {error}")))?;
    if parsed.public_key().raw != key_pair.subject_public_key_info().as_slice() {
        return Err(TlsError::InvalidMaterial(
            "private key does not match certificate public key".to_string(),
        ));
    }

    let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
        .map_err(|error| TlsError::InvalidMaterial(format!("root issuer metadata: {error}")))?;

    Ok(CaMaterial {
        issuer,
        cert_pem: cert_pem.to_string(),
        cert_der,
        key_pem: key_pem.to_string(),
    })
}

fn build_root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = OffsetDateTime::now_utc() - LEAF_BACKDATE;
    params.not_after = OffsetDateTime::now_utc() + time::Duration::days(ROOT_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
    distinguished_name.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(
    host: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.serial_number = Some(random_serial());
    params.not_before = not_before;
    params.not_after = not_after;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    distinguished_name.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from(bytes.to_vec())
}

fn persist_material(
    cert_path: &Path,
    key_path: &Path,
    material: &CaMaterial,
) -> Result<(), TlsError> {
    ensure_parent_dir(cert_path)?;
    ensure_parent_dir(key_path)?;
    fs::write(cert_path, material.cert_pem.as_bytes())?;
    fs::write(key_path, material.key_pem.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<(), TlsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
            }
        }
    }
    Ok(())
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
