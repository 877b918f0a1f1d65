use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Console logging on stderr plus an optional non-ANSI file writer.
/// `RUST_LOG` overrides the configured level when set.
pub fn init(level: &str, logfile: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = open_log_file(logfile).map(|file| {
        fmt::layer()
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .with_target(false)
    });

    let registry = tracing_subscriber::registry().with(filter).with(console);
    if let Some(file_layer) = file_layer {
        registry.with(file_layer).init();
    } else {
        registry.init();
    }
}

fn open_log_file(logfile: &str) -> Option<fs::File> {
    if logfile.is_empty() {
        return None;
    }
    let path = Path::new(logfile);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).ok()?;
        }
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}
