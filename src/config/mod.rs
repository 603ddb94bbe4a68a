#[allow(clippy::module_inception)]
pub mod config;
mod logging_config;
mod proxy_config;
mod proxy_configuration;
mod tests;

pub use config::{Config, ConfigError};
pub use logging_config::LoggingConfig;
pub use proxy_config::ProxyConfig;
pub use proxy_configuration::{Mode, ProxyConfiguration, ProxyConfigurationHandle};

use clap::Parser;

/// Startup arguments. `--config` points at the TOML file; `--port`,
/// `--ae-title` and `--bind` override the corresponding entries after the
/// file is loaded (§4.8's `config_changed` refresh applies the same
/// precedence at runtime).
#[derive(Debug, Parser)]
#[command(name = "pacsproxyd", version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long = "config", short = 'c', default_value = "pacsproxy.toml")]
    pub config_path: String,

    /// Override the DICOM SCP listen port.
    #[arg(long = "port")]
    pub port: Option<u16>,

    /// Override the advertised AE title.
    #[arg(long = "ae-title")]
    pub ae_title: Option<String>,

    /// Override the bind address.
    #[arg(long = "bind")]
    pub bind: Option<String>,
}

impl Cli {
    /// Non-clap constructor kept for callers (and tests) that already have a
    /// config path in hand.
    pub fn new(config_path: String) -> Self {
        Self {
            config_path,
            port: None,
            ae_title: None,
            bind: None,
        }
    }
}
