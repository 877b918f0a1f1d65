use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snirect_dns::{PreferenceConfig, PreferenceMode, ResolverConfig};
use snirect_rules::{CertPolicy, RawPolicyValue, RawRules, RuleSet};
use tracing::info;

use crate::ProxyError;

pub const SAMPLE_CONFIG_TOML: &str = include_str!("../assets/config.toml");
pub const SAMPLE_RULES_TOML: &str = include_str!("../assets/rules.toml");
pub const DEFAULT_PAC_TEMPLATE: &str = include_str!("../assets/pac");

pub const CONFIG_FILE: &str = "config.toml";
pub const RULES_FILE: &str = "rules.toml";
pub const PAC_FILE: &str = "pac";
pub const CERTS_DIR: &str = "certs";
pub const ROOT_CERT_FILE: &str = "root.crt";
pub const ROOT_KEY_FILE: &str = "root.key";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub check_hostname: RawPolicyValue,
    pub set_proxy: bool,
    #[serde(alias = "importca")]
    pub ca_install: String,
    pub ipv6: bool,
    pub ecs: String,
    #[serde(alias = "DNS")]
    pub dns: DnsSection,
    pub timeout: TimeoutSection,
    pub limit: LimitSection,
    pub log: LogSection,
    pub server: ServerSection,
    pub preference: PreferenceSection,

    #[serde(skip)]
    pub app_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    pub nameserver: Vec<String>,
    pub bootstrap_dns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// Origin TCP dial budget, seconds.
    pub dial: u64,
    /// Per-upstream DNS exchange budget, seconds.
    pub dns: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSection {
    /// Concurrent CONNECT bound; zero means unbounded.
    pub max_connections: usize,
    pub dns_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub loglevel: String,
    pub logfile: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub address: String,
    pub port: u16,
    pub pac_host: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreferenceSection {
    pub mode: String,
    pub test_timeout_ms: u64,
    pub max_test_ips: usize,
    pub cache_ttl: u64,
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            check_hostname: RawPolicyValue::Bool(true),
            set_proxy: false,
            ca_install: "auto".to_string(),
            ipv6: false,
            ecs: String::new(),
            dns: DnsSection::default(),
            timeout: TimeoutSection::default(),
            limit: LimitSection::default(),
            log: LogSection::default(),
            server: ServerSection::default(),
            preference: PreferenceSection::default(),
            app_dir: PathBuf::new(),
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        TimeoutSection { dial: 30, dns: 5 }
    }
}

impl Default for LimitSection {
    fn default() -> Self {
        LimitSection {
            max_connections: 0,
            dns_cache_size: 10_000,
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            loglevel: "info".to_string(),
            logfile: String::new(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            address: "127.0.0.1".to_string(),
            port: 7654,
            pac_host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for PreferenceSection {
    fn default() -> Self {
        PreferenceSection {
            mode: "standard".to_string(),
            test_timeout_ms: 500,
            max_test_ips: 10,
            cache_ttl: 0,
            cache_size: 0,
        }
    }
}

impl Config {
    /// Loads `<app_dir>/config.toml`. A missing file yields the defaults;
    /// a present but malformed file is a startup error.
    pub fn load(app_dir: &Path) -> Result<Config, ProxyError> {
        let path = app_dir.join(CONFIG_FILE);
        let mut config = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<Config>(&text)
                .map_err(|error| ProxyError::Config(format!("{}: {error}", path.display())))?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(error) => {
                return Err(ProxyError::Config(format!("{}: {error}", path.display())))
            }
        };

        config.app_dir = app_dir.to_path_buf();
        if config.log.logfile.is_empty() {
            config.log.logfile = default_log_path().to_string_lossy().into_owned();
        }
        Ok(config)
    }

    pub fn global_cert_policy(&self) -> CertPolicy {
        self.check_hostname.normalize()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout.dial == 0 {
            30
        } else {
            self.timeout.dial
        })
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            nameservers: self.dns.nameserver.clone(),
            bootstrap: self.dns.bootstrap_dns.clone(),
            ipv6: self.ipv6,
            ecs: self.ecs.clone(),
            dns_timeout: Duration::from_secs(if self.timeout.dns == 0 {
                5
            } else {
                self.timeout.dns
            }),
            dns_cache_size: self.limit.dns_cache_size,
            preference: PreferenceConfig {
                mode: PreferenceMode::parse(&self.preference.mode),
                test_timeout: Duration::from_millis(if self.preference.test_timeout_ms == 0 {
                    500
                } else {
                    self.preference.test_timeout_ms
                }),
                max_test_ips: if self.preference.max_test_ips == 0 {
                    10
                } else {
                    self.preference.max_test_ips
                },
                cache_ttl: Duration::from_secs(self.preference.cache_ttl),
                cache_size: self.preference.cache_size,
            },
        }
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.app_dir.join(CERTS_DIR).join(ROOT_CERT_FILE)
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.app_dir.join(CERTS_DIR).join(ROOT_KEY_FILE)
    }

    pub fn pac_path(&self) -> PathBuf {
        self.app_dir.join(PAC_FILE)
    }
}

/// Loads `<app_dir>/rules.toml` merged over the embedded defaults.
pub fn load_rules(app_dir: &Path) -> Result<RuleSet, ProxyError> {
    let defaults: RawRules = toml::from_str(SAMPLE_RULES_TOML)
        .map_err(|error| ProxyError::Config(format!("embedded rules: {error}")))?;

    let path = app_dir.join(RULES_FILE);
    let merged = match fs::read_to_string(&path) {
        Ok(text) => {
            let user: RawRules = toml::from_str(&text)
                .map_err(|error| ProxyError::Config(format!("{}: {error}", path.display())))?;
            defaults.merge(user)
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => defaults,
        Err(error) => return Err(ProxyError::Config(format!("{}: {error}", path.display()))),
    };

    Ok(RuleSet::compile(merged))
}

/// Per-user application directory holding config, rules, the PAC template
/// and the CA material.
pub fn app_dir() -> Result<PathBuf, ProxyError> {
    if let Ok(dir) = std::env::var("SNIRECT_CONFIG_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let base = platform_config_dir()
        .ok_or_else(|| ProxyError::Config("cannot determine a config directory".to_string()))?;
    Ok(base.join("snirect"))
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(PathBuf::from)
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join("Library").join("Application Support"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Some(PathBuf::from(xdg));
            }
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    }
}

pub fn default_log_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("snirect").join("Logs").join("snirect.log")
    }
    #[cfg(target_os = "macos")]
    {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("Library").join("Logs").join("snirect").join("snirect.log")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_STATE_HOME")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".local").join("state"))
            })
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("snirect").join("snirect.log")
    }
}

/// First-run setup: creates the app directory and writes the sample
/// config, rules and PAC files where missing.
pub fn ensure_files(app_dir: &Path) -> Result<(), ProxyError> {
    fs::create_dir_all(app_dir)
        .map_err(|error| ProxyError::Config(format!("{}: {error}", app_dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(app_dir, fs::Permissions::from_mode(0o700));
    }

    ensure_file(&app_dir.join(CONFIG_FILE), SAMPLE_CONFIG_TOML)?;
    ensure_file(&app_dir.join(RULES_FILE), SAMPLE_RULES_TOML)?;
    ensure_file(&app_dir.join(PAC_FILE), DEFAULT_PAC_TEMPLATE)?;
    Ok(())
}

fn ensure_file(path: &Path, content: &str) -> Result<(), ProxyError> {
    if path.exists() {
        return Ok(());
    }
    info!(path = %path.display(), "creating default file");
    fs::write(path, content)
        .map_err(|error| ProxyError::Config(format!("{}: {error}", path.display())))
}
