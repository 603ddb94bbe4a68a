#![cfg(test)]

use toml; // bring the toml crate into scope

use crate::config::config::{Config, ConfigError};

/// Parse a TOML string into a `Config` and run the project's validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    // `toml::from_str` deserialises the string according to the `Config` struct.
    let cfg: Config = toml::from_str(toml_str).expect("TOML parse error");
    // Validate cross‑references, required fields, etc.
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_basic_config() {
    let toml = r#"
        [proxy]
        id = "proxy-test"
        log_level = "info"
        store_dir = "/tmp/store"
        archive_root = "/tmp/archive"
        bind_address = "127.0.0.1"
        port = 11112
        ae_title = "TESTPROXY"
        resolver_api_url = "https://backend.example.com"
        proxy_key = "secret"
        mode = "private"
        enable_phi_anonymization = true
    "#;

    let result = load_config_from_str(toml);
    assert!(result.is_ok(), "Configuration should parse and validate");

    let config = result.unwrap();
    assert_eq!(config.proxy.id, "proxy-test");
    assert_eq!(config.proxy.port, 11112);
    assert_eq!(config.proxy.ae_title, "TESTPROXY");
    assert!(config.proxy.enable_phi_anonymization);
}

#[test]
fn test_rejects_out_of_range_port() {
    let toml = r#"
        [proxy]
        id = "proxy-test"
        log_level = "info"
        port = 80
    "#;
    assert!(load_config_from_str(toml).is_err());
}

#[test]
fn test_rejects_invalid_mode() {
    let toml = r#"
        [proxy]
        id = "proxy-test"
        log_level = "info"
        mode = "sometimes"
    "#;
    assert!(load_config_from_str(toml).is_err());
}
