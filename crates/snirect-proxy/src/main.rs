use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use snirect_dns::Resolver;
use snirect_proxy::{config, logging, Config, ProxyError, ProxyServer};
use snirect_tls::{spawn_expiry_sweep, CertificateAuthority};
use tracing::{debug, info};

/// Local forward proxy that defeats SNI-based censorship by re-originating
/// TLS with a rewritten or stripped server name.
#[derive(Debug, Parser)]
#[command(name = "snirect", version)]
struct Cli {
    /// Configuration directory (default: the per-user app directory).
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Listen address override.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Listen port override (0 picks an ephemeral port).
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level override: debug, info, warn or error.
    #[arg(long, value_name = "LEVEL")]
    loglevel: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("snirect: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ProxyError> {
    snirect_tls::install_default_crypto_provider();

    let app_dir = match cli.config_dir {
        Some(dir) => dir,
        None => config::app_dir()?,
    };
    config::ensure_files(&app_dir)?;

    let mut cfg = Config::load(&app_dir)?;
    if let Some(listen) = cli.listen {
        cfg.server.address = listen;
    }
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }
    if let Some(level) = cli.loglevel {
        cfg.log.loglevel = level;
    }

    logging::init(&cfg.log.loglevel, &cfg.log.logfile);

    if cfg.set_proxy {
        debug!("set_proxy is handled by the system-proxy collaborator, not the core");
    }
    if cfg.ca_install != "never" {
        debug!(policy = %cfg.ca_install, "trust-store installation is handled by the installer collaborator");
    }

    let rules = Arc::new(config::load_rules(&app_dir)?);

    let authority = Arc::new(CertificateAuthority::load_or_generate(
        &cfg.root_cert_path(),
        &cfg.root_key_path(),
    )?);
    spawn_expiry_sweep(Arc::clone(&authority));
    info!(dir = %app_dir.display(), "certificate authority ready");

    let resolver = Resolver::new(cfg.resolver_config(), Arc::clone(&rules)).await;
    resolver.start_background_tasks();

    let server = ProxyServer::new(cfg, rules, authority, resolver);
    server.run().await
}
