//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync>;

const LOG_FILE_PREFIX: &str = "bmp.log";

pub struct LogOptions<'a> {
    pub verbose: bool,
    pub json: bool,
    pub dir: Option<&'a Path>,
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    })
}

/// Install the global subscriber. Console output goes to stderr so command
/// output on stdout stays machine-readable.
///
/// The returned guard flushes the file appender and must outlive the program.
pub fn init_tracing(opts: LogOptions<'_>) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if opts.json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(fmt::layer().with_target(false).with_writer(std::io::stderr).boxed());
    }

    let mut guard = None;
    if let Some(dir) = opts.dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("Failed to create log directory {}: {}", dir.display(), e))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(env_filter(opts.verbose))
        .with(layers)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
    Ok(guard)
}
