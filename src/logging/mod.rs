//! Logging setup
//!
//! Human-readable output on stdout by default. With `LOG_FILE` set, events are
//! written as JSON lines to that file instead (opened append-only, mode 0600
//! on unix).

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Args;

/// Install the global tracing subscriber
pub fn init(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(args.effective_log_level()).into());

    let (json_layer, fmt_layer) = match &args.log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Filter used when `RUST_LOG` is not set
pub fn default_directives(level: &str) -> String {
    format!("instance_registrar={},info", level)
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
