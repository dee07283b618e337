//! Tracing bootstrap shared by the workspace binaries.

use clap::{Parser, ValueEnum};
use is_terminal::IsTerminal;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
pub struct LoggingOpts {
    #[clap(long, env = "XFER_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "XFER_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        LoggingOpts { log_format: LogFormat::Text, log_color: LogColor::Auto }
    }
}

/// Install the global subscriber. Log levels come from `RUST_LOG`; the
/// default is `info`.
pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let color = match opts.log_color {
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match opts.log_format {
        LogFormat::Text => builder.with_ansi(color).try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}
