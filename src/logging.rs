use anyhow::{Context, Result, anyhow};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, fmt, reload};

/// Runtime handle on the global log level.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<LevelFilter, Registry>,
}

/// Installs the global subscriber at `level`.
pub fn init(level: &str) -> Result<LogControl> {
    let level = parse_level(level).ok_or_else(|| anyhow!("unknown log level '{level}'"))?;
    let (control, subscriber) = LogControl::with_subscriber(level);
    subscriber
        .try_init()
        .context("unable to install log subscriber")?;
    Ok(control)
}

impl LogControl {
    /// Builds a subscriber whose level this control can change. The
    /// control only works while the subscriber is alive.
    pub fn with_subscriber(
        level: LevelFilter,
    ) -> (Self, impl Subscriber + Send + Sync + 'static) {
        let (filter, handle) = reload::Layer::new(level);
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        );
        (Self { handle }, subscriber)
    }

    pub fn set_level(&self, name: &str) -> Result<LevelFilter> {
        let level = parse_level(name).ok_or_else(|| anyhow!("unknown log level '{name}'"))?;
        self.handle
            .modify(|filter| *filter = level)
            .context("log subscriber is gone")?;
        Ok(level)
    }

    pub fn current_level(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Accepts the tracing level names and the older names still found in
/// client scripts (`severe`, `warning`, `config`, `fine`, `finer`, `finest`,
/// `all`).
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    let level = match name.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" | "severe" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" | "config" | "fine" => LevelFilter::DEBUG,
        "trace" | "finer" | "finest" | "all" => LevelFilter::TRACE,
        _ => return None,
    };
    Some(level)
}
