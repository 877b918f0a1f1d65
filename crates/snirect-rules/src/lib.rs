mod pattern;

use std::collections::HashMap;

use serde::Deserialize;

pub use pattern::matches;

/// Certificate verification policy for origin connections.
///
/// Config renders this heterogeneously (`false`, `true`, `"strict"`, or a
/// list of hostnames); normalization happens once at load and the rest of
/// the system only ever sees this sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertPolicy {
    /// Accept any origin certificate.
    Off,
    /// Accept a strict hostname match, or a certificate whose eTLD+1
    /// overlaps the target host (shared-certificate CDN fronting).
    Loose,
    /// Require a strict hostname match.
    Strict,
    /// Accept a certificate matching any of these names instead of the
    /// target host.
    AllowList(Vec<String>),
}

impl CertPolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CertPolicy::Off)
    }
}

impl Default for CertPolicy {
    fn default() -> Self {
        CertPolicy::Loose
    }
}

/// Raw config value for a verification policy, before normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPolicyValue {
    Bool(bool),
    Text(String),
    List(Vec<String>),
}

impl RawPolicyValue {
    pub fn normalize(&self) -> CertPolicy {
        match self {
            RawPolicyValue::Bool(true) => CertPolicy::Loose,
            RawPolicyValue::Bool(false) => CertPolicy::Off,
            RawPolicyValue::Text(text) => match text.as_str() {
                "strict" => CertPolicy::Strict,
                "false" => CertPolicy::Off,
                "true" => CertPolicy::Loose,
                other => CertPolicy::AllowList(vec![other.to_string()]),
            },
            RawPolicyValue::List(names) => CertPolicy::AllowList(names.clone()),
        }
    }
}

/// Rule document as it appears on disk: three host-pattern maps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRules {
    #[serde(default)]
    pub alter_hostname: HashMap<String, String>,
    #[serde(default)]
    pub cert_verify: HashMap<String, RawPolicyValue>,
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

impl RawRules {
    /// Overlays `other` on top of this document, key by key. Used to merge
    /// user rules over the embedded defaults.
    pub fn merge(mut self, other: RawRules) -> RawRules {
        self.alter_hostname.extend(other.alter_hostname);
        self.cert_verify.extend(other.cert_verify);
        self.hosts.extend(other.hosts);
        self
    }
}

/// Compiled rule set. Built once per config load, immutable afterwards and
/// shared by reference across connection tasks.
#[derive(Debug, Default)]
pub struct RuleSet {
    alter_hostname: HashMap<String, String>,
    cert_verify: HashMap<String, CertPolicy>,
    hosts: HashMap<String, String>,
    alter_hostname_globs: Vec<String>,
    cert_verify_globs: Vec<String>,
    hosts_globs: Vec<String>,
}

impl RuleSet {
    pub fn compile(raw: RawRules) -> RuleSet {
        let alter_hostname = strip_markers(raw.alter_hostname);
        let cert_verify = strip_markers(raw.cert_verify)
            .into_iter()
            .map(|(key, value)| (key, value.normalize()))
            .collect();
        let hosts = strip_markers(raw.hosts);

        let alter_hostname_globs = glob_keys(&alter_hostname);
        let cert_verify_globs = glob_keys(&cert_verify);
        let hosts_globs = glob_keys(&hosts);

        RuleSet {
            alter_hostname,
            cert_verify,
            hosts,
            alter_hostname_globs,
            cert_verify_globs,
            hosts_globs,
        }
    }

    /// Target SNI for `host`: `Some("")` means strip the SNI entirely.
    pub fn alter_hostname_for(&self, host: &str) -> Option<&str> {
        lookup(&self.alter_hostname, &self.alter_hostname_globs, host).map(String::as_str)
    }

    pub fn cert_policy_for(&self, host: &str) -> Option<&CertPolicy> {
        lookup(&self.cert_verify, &self.cert_verify_globs, host)
    }

    /// Static address override for `host`. The value may be an IP literal
    /// or another hostname to resolve instead.
    pub fn host_override_for(&self, host: &str) -> Option<&str> {
        lookup(&self.hosts, &self.hosts_globs, host).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.alter_hostname.is_empty() && self.cert_verify.is_empty() && self.hosts.is_empty()
    }
}

/// Exact key first, then glob keys in descending pattern length so the
/// longest (most specific) pattern wins ties deterministically.
fn lookup<'a, V>(
    map: &'a HashMap<String, V>,
    globs: &[String],
    host: &str,
) -> Option<&'a V> {
    if let Some(value) = map.get(host) {
        return Some(value);
    }
    globs
        .iter()
        .find(|key| pattern::matches(key, host))
        .and_then(|key| map.get(key))
}

fn strip_markers<V>(map: HashMap<String, V>) -> HashMap<String, V> {
    map.into_iter()
        .map(|(key, value)| match key.strip_prefix('$') {
            Some(stripped) => (stripped.to_string(), value),
            None => (key, value),
        })
        .collect()
}

fn glob_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map
        .keys()
        .filter(|key| key.contains(['*', '?']))
        .cloned()
        .collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    keys
}
