//! In-memory `ProxyConfiguration` singleton (spec.md §3/§5): a read-copy-
//! update snapshot. Writers build a new `ProxyConfiguration` and swap it into
//! the `ArcSwap`; readers load a cheap `Arc` clone and never block on a
//! writer. Mutating the listen port or AE title is the DICOM-server-restart
//! trigger referenced in §4.9's `proxy.config_changed` handling; callers
//! compare the previous and new snapshots to decide whether to restart.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Public,
    Private,
}

/// One immutable snapshot of the proxy's runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfiguration {
    pub observed_ip_address: Option<String>,
    pub port: u16,
    pub ae_title: String,
    pub resolver_api_url: String,
    pub proxy_key: String,
    pub mode: Mode,
    pub enable_phi_anonymization: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyConfiguration {
    /// Seed a snapshot from the static TOML-loaded `ProxyConfig`, at the
    /// instant given by `now` (callers pass `Utc::now()`; kept as a
    /// parameter so this stays deterministic under test).
    pub fn from_static(config: &ProxyConfig, now: DateTime<Utc>) -> Self {
        let mode = match config.mode.as_str() {
            "public" => Mode::Public,
            _ => Mode::Private,
        };
        Self {
            observed_ip_address: None,
            port: config.port,
            ae_title: config.ae_title.clone(),
            resolver_api_url: config.resolver_api_url.clone(),
            proxy_key: config.proxy_key.clone(),
            mode,
            enable_phi_anonymization: config.enable_phi_anonymization,
            created_at: now,
            updated_at: now,
        }
    }

    /// Listen port must fall in the dynamic/private range (§3).
    pub fn port_is_valid(&self) -> bool {
        (1024..=65535).contains(&self.port)
    }

    pub fn ae_title_is_valid(&self) -> bool {
        !self.ae_title.is_empty() && self.ae_title.len() <= 16
    }

    /// Whether `other` would require restarting the DICOM AE in place
    /// (§4.9: "a change to listen port or AE title MUST restart the DICOM
    /// server").
    pub fn requires_server_restart(&self, other: &ProxyConfiguration) -> bool {
        self.port != other.port || self.ae_title != other.ae_title
    }
}

/// RCU handle wrapping the shared singleton. Cloning the handle is cheap
/// (an `Arc<ArcSwap<_>>` clone); every clone observes the same swaps.
#[derive(Clone)]
pub struct ProxyConfigurationHandle {
    inner: Arc<ArcSwap<ProxyConfiguration>>,
}

impl ProxyConfigurationHandle {
    pub fn new(initial: ProxyConfiguration) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Load the current snapshot. Never blocks on a concurrent `swap`.
    pub fn load(&self) -> Arc<ProxyConfiguration> {
        self.inner.load_full()
    }

    /// Atomically publish a new snapshot, returning the one it replaced.
    pub fn swap(&self, new: ProxyConfiguration) -> Arc<ProxyConfiguration> {
        self.inner.swap(Arc::new(new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> ProxyConfiguration {
        ProxyConfiguration::from_static(&ProxyConfig::default(), now)
    }

    #[test]
    fn port_validity_follows_the_dynamic_range() {
        let now = Utc::now();
        let mut config = sample(now);
        config.port = 80;
        assert!(!config.port_is_valid());
        config.port = 11112;
        assert!(config.port_is_valid());
        config.port = 65535;
        assert!(config.port_is_valid());
    }

    #[test]
    fn restart_is_required_only_for_port_or_ae_title_changes() {
        let now = Utc::now();
        let original = sample(now);
        let mut same_else_changed = original.clone();
        same_else_changed.enable_phi_anonymization = !original.enable_phi_anonymization;
        assert!(!original.requires_server_restart(&same_else_changed));

        let mut port_changed = original.clone();
        port_changed.port += 1;
        assert!(original.requires_server_restart(&port_changed));

        let mut ae_changed = original.clone();
        ae_changed.ae_title = "OTHERAE".to_string();
        assert!(original.requires_server_restart(&ae_changed));
    }

    #[test]
    fn handle_swap_is_visible_to_all_clones() {
        let now = Utc::now();
        let handle = ProxyConfigurationHandle::new(sample(now));
        let clone = handle.clone();

        let mut updated = sample(now);
        updated.ae_title = "SWAPPED".to_string();
        handle.swap(updated);

        assert_eq!(clone.load().ae_title, "SWAPPED");
    }
}
