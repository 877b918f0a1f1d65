use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use snirect_rules::CertPolicy;
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::X509Certificate;

/// Checks the origin's leaf against the effective verification policy.
///
/// The origin handshake runs with library verification disabled; this is
/// the only identity check an intercepted connection gets.
pub fn verify_origin_cert(leaf: &CertificateDer<'_>, host: &str, policy: &CertPolicy) -> bool {
    if matches!(policy, CertPolicy::Off) {
        return true;
    }

    let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf.as_ref()) else {
        debug!(host, "origin certificate failed to parse");
        return false;
    };
    let names = CertNames::from_cert(&cert);

    match policy {
        CertPolicy::Off => true,
        CertPolicy::Strict => names.matches_host(host, true),
        CertPolicy::Loose => names.matches_host(host, false),
        CertPolicy::AllowList(allowed) => {
            let accepted = allowed.iter().any(|name| names.matches_host(name, false));
            if !accepted {
                debug!(
                    host,
                    cert_names = ?names.dns_names,
                    allowlist = ?allowed,
                    "origin certificate matched no allowlisted name"
                );
            }
            accepted
        }
    }
}

/// DNS identities carried by a certificate: the SANs, plus the subject CN
/// which only counts when the certificate has no SANs at all.
struct CertNames {
    dns_names: Vec<String>,
    common_name: Option<String>,
}

impl CertNames {
    fn from_cert(cert: &X509Certificate<'_>) -> CertNames {
        let dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(value) => Some(value.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);

        CertNames {
            dns_names,
            common_name,
        }
    }

    /// `target` is normally a hostname; allowlist entries may also be
    /// patterns (`*`, `?`, `$`), which are matched against the certificate
    /// names instead.
    fn matches_host(&self, target: &str, strict: bool) -> bool {
        if target.contains(['*', '?', '$']) {
            if self
                .dns_names
                .iter()
                .any(|name| snirect_rules::matches(target, name))
            {
                return true;
            }
            if self.dns_names.is_empty() {
                if let Some(cn) = &self.common_name {
                    if snirect_rules::matches(target, cn) {
                        return true;
                    }
                }
            }
        }

        if self
            .dns_names
            .iter()
            .any(|san| dns_name_matches(san, target))
        {
            return true;
        }

        if strict {
            return false;
        }

        self.loosely_matches(target)
    }

    /// Shared-certificate CDN fronting: accept when the registrable domain
    /// (eTLD+1) of the target equals that of any SAN, or of the CN when the
    /// certificate carries no SANs.
    fn loosely_matches(&self, target: &str) -> bool {
        let Some(target_domain) = registrable_domain(target) else {
            return false;
        };

        if self
            .dns_names
            .iter()
            .any(|san| registrable_domain(san).as_deref() == Some(target_domain.as_str()))
        {
            return true;
        }

        if self.dns_names.is_empty() {
            if let Some(cn) = &self.common_name {
                return registrable_domain(cn).as_deref() == Some(target_domain.as_str());
            }
        }

        false
    }
}

fn registrable_domain(name: &str) -> Option<String> {
    let name = name.trim_start_matches("*.");
    psl::domain_str(name).map(str::to_string)
}

/// RFC 6125 presented-identifier match: a `*.` wildcard covers exactly one
/// left-most label; everything else is case-insensitive equality.
fn dns_name_matches(san: &str, host: &str) -> bool {
    let san = san.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if let Some(parent) = san.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == parent,
            None => false,
        };
    }
    san == host
}

/// Client config for the origin handshake: certificate checks are skipped
/// at the library level because `verify_origin_cert` re-runs them under the
/// configured policy, and SNI can be suppressed entirely for the
/// strip-SNI rewrite.
pub fn build_origin_client_config(send_sni: bool) -> Arc<ClientConfig> {
    crate::install_default_crypto_provider();
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    config.enable_sni = send_sni;
    Arc::new(config)
}

#[derive(Debug)]
pub struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::CertificateDer;
    use snirect_rules::CertPolicy;

    use super::{dns_name_matches, verify_origin_cert};

    fn self_signed_cert(sans: &[&str]) -> CertificateDer<'static> {
        let key = KeyPair::generate().expect("generate key");
        let params = CertificateParams::new(
            sans.iter().map(|san| san.to_string()).collect::<Vec<_>>(),
        )
        .expect("leaf params");
        params.self_signed(&key).expect("self signed").der().clone()
    }

    #[test]
    fn wildcard_san_accepts_one_subdomain_label() {
        let cert = self_signed_cert(&["*.example.com"]);
        assert!(verify_origin_cert(
            &cert,
            "evil.example.com",
            &CertPolicy::Strict
        ));
        assert!(verify_origin_cert(
            &cert,
            "evil.example.com",
            &CertPolicy::Loose
        ));
        assert!(!verify_origin_cert(
            &cert,
            "a.b.example.com",
            &CertPolicy::Strict
        ));
    }

    #[test]
    fn strict_rejects_sibling_under_public_suffix_and_loose_agrees() {
        let cert = self_signed_cert(&["a.co.uk"]);
        assert!(!verify_origin_cert(&cert, "b.co.uk", &CertPolicy::Strict));
        // eTLD+1 of a.co.uk is a.co.uk itself, which differs from b.co.uk.
        assert!(!verify_origin_cert(&cert, "b.co.uk", &CertPolicy::Loose));
    }

    #[test]
    fn loose_accepts_shared_registrable_domain() {
        let cert = self_signed_cert(&["static.example.com"]);
        assert!(!verify_origin_cert(
            &cert,
            "www.example.com",
            &CertPolicy::Strict
        ));
        assert!(verify_origin_cert(
            &cert,
            "www.example.com",
            &CertPolicy::Loose
        ));
    }

    #[test]
    fn off_accepts_anything() {
        let cert = self_signed_cert(&["whatever.invalid"]);
        assert!(verify_origin_cert(&cert, "example.com", &CertPolicy::Off));
    }

    #[test]
    fn allowlist_matches_any_listed_name() {
        let cert = self_signed_cert(&["cdn.example.net"]);
        let policy = CertPolicy::AllowList(vec![
            "unrelated.example".to_string(),
            "cdn.example.net".to_string(),
        ]);
        assert!(verify_origin_cert(&cert, "fronted.example", &policy));

        let rejecting = CertPolicy::AllowList(vec!["unrelated.example".to_string()]);
        assert!(!verify_origin_cert(&cert, "fronted.example", &rejecting));
    }

    #[test]
    fn allowlist_entries_may_be_patterns() {
        let cert = self_signed_cert(&["edge7.cdn.example.net"]);
        let policy = CertPolicy::AllowList(vec!["*.cdn.example.net".to_string()]);
        assert!(verify_origin_cert(&cert, "fronted.example", &policy));
    }

    #[test]
    fn presented_identifier_rules() {
        assert!(dns_name_matches("www.example.com", "WWW.example.com"));
        assert!(dns_name_matches("*.example.com", "www.example.com"));
        assert!(!dns_name_matches("*.example.com", "example.com"));
        assert!(!dns_name_matches("*.example.com", "a.b.example.com"));
        assert!(!dns_name_matches("www.example.com", "example.com"));
    }
}
