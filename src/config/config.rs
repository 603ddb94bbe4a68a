use crate::config::logging_config::LoggingConfig;
use crate::config::proxy_config::ProxyConfig;
use crate::config::Cli;
use serde::Deserialize;

/// Top-level, TOML-loaded deployment configuration. Seeds the
/// [`super::ProxyConfiguration`] RCU singleton and the [`crate::nodes`]
/// registry on startup; everything that can change at runtime after that
/// (node list, PHI anonymization toggle, AE title, listen port) lives in
/// those, not here.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse `cli.config_path`, apply CLI overrides, then validate.
    pub fn from_args(cli: Cli) -> Self {
        let contents =
            std::fs::read_to_string(&cli.config_path).expect("Failed to read config file");
        let mut config: Config = toml::from_str(&contents).expect("Failed to parse config");

        if let Some(port) = cli.port {
            config.proxy.port = port;
        }
        if let Some(ae_title) = cli.ae_title {
            config.proxy.ae_title = ae_title;
        }
        if let Some(bind) = cli.bind {
            config.proxy.bind_address = bind;
        }

        config.validate().expect("Configuration validation failed");
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_proxy()?;
        self.validate_log_level()?;
        Ok(())
    }

    fn validate_proxy(&self) -> Result<(), ConfigError> {
        if self.proxy.id.trim().is_empty() {
            return Err(ConfigError::InvalidProxy {
                name: self.proxy.id.clone(),
                reason: "No proxy id provided".to_string(),
            });
        }

        if !(1024..=65535).contains(&self.proxy.port) {
            return Err(ConfigError::InvalidProxy {
                name: self.proxy.id.clone(),
                reason: format!("port {} is outside the 1024-65535 range", self.proxy.port),
            });
        }

        if self.proxy.ae_title.is_empty() || self.proxy.ae_title.len() > 16 {
            return Err(ConfigError::InvalidProxy {
                name: self.proxy.id.clone(),
                reason: format!(
                    "ae_title '{}' must be 1-16 characters",
                    self.proxy.ae_title
                ),
            });
        }

        match self.proxy.mode.as_str() {
            "public" | "private" => {}
            other => {
                return Err(ConfigError::InvalidProxy {
                    name: self.proxy.id.clone(),
                    reason: format!("mode must be 'public' or 'private', got '{}'", other),
                })
            }
        }

        Ok(())
    }

    fn validate_log_level(&self) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.proxy.log_level.as_str()) {
            return Err(ConfigError::InvalidProxy {
                name: self.proxy.id.clone(),
                reason: format!(
                    "Invalid log_level '{}'. Valid options are: {:?}",
                    self.proxy.log_level, valid_log_levels
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidProxy { name: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidProxy { name, reason } => {
                write!(f, "invalid proxy config '{}': {}", name, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
