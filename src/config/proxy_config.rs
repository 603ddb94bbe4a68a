use serde::Deserialize;

/// Static, TOML-loaded deployment settings: `[proxy]` section.
///
/// Distinct from [`super::ProxyConfiguration`], which is the in-memory RCU
/// singleton seeded from this struct and then kept live by control-channel
/// refreshes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    #[serde(default = "default_archive_root")]
    pub archive_root: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ae_title")]
    pub ae_title: String,
    #[serde(default)]
    pub resolver_api_url: String,
    #[serde(default)]
    pub proxy_key: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub enable_phi_anonymization: bool,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            id: "".to_string(),
            log_level: default_log_level(),
            store_dir: default_store_dir(),
            archive_root: default_archive_root(),
            bind_address: default_bind_address(),
            port: default_port(),
            ae_title: default_ae_title(),
            resolver_api_url: String::new(),
            proxy_key: String::new(),
            mode: default_mode(),
            enable_phi_anonymization: false,
            health_interval_secs: default_health_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_store_dir() -> String {
    "/var/lib/pacsproxy/store".to_string()
}

fn default_archive_root() -> String {
    "/var/lib/pacsproxy/archive".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    11112
}

fn default_ae_title() -> String {
    "PACSPROXY".to_string()
}

fn default_mode() -> String {
    "private".to_string()
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 11112);
        assert_eq!(config.mode, "private");
        assert!(!config.enable_phi_anonymization);
    }
}
