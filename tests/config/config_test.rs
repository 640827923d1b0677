//! Coverage for config parsing, overrides and validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use wxoa::config::{config_dir, load_config, Config, ConfigError};
use wxoa::types::MessageType;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

const FULL: &str = r#"
[account]
app_id = "wx_app"
app_secret = "s3cr3t-value"
token = "mytoken"

[webhook]
host = "127.0.0.1"
port = 8080
dispatch_types = ["text", "image", "voice"]

[credentials]
refresh_interval_secs = 600

[store]
cache_dir = "/tmp/wxoa-cache"
"#;

fn parse(toml_str: &str) -> Config {
    match toml::from_str::<Config>(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err}"),
    }
}

#[test]
fn config_dir_resolves() {
    let path = match config_dir() {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with(".wxoa"));
}

#[test]
fn full_config_validates() {
    let settings = parse(FULL).validate().expect("should validate");
    assert_eq!(settings.app_id, "wx_app");
    assert_eq!(settings.host, "127.0.0.1");
    assert_eq!(settings.port, 8080);
    assert_eq!(settings.dispatch_types.len(), 3);
    assert!(settings.dispatch_types.contains(&MessageType::Voice));
    assert_eq!(settings.refresh_interval, Duration::from_secs(600));
    assert_eq!(settings.request_timeout, Duration::from_secs(10));
    assert_eq!(settings.api_base_url, "https://api.weixin.qq.com/cgi-bin");
    assert_eq!(settings.cache_dir, PathBuf::from("/tmp/wxoa-cache"));
}

#[test]
fn defaults_dispatch_text_and_image() {
    let mut config = parse(FULL);
    config.webhook = wxoa::config::WebhookConfig::default();
    config.webhook.port = Some(80);
    let settings = config.validate().expect("should validate");
    assert_eq!(settings.host, "0.0.0.0");
    assert!(settings.dispatch_types.contains(&MessageType::Text));
    assert!(settings.dispatch_types.contains(&MessageType::Image));
    assert_eq!(settings.dispatch_types.len(), 2);
}

#[test]
fn missing_secret_is_named() {
    let config = parse(&FULL.replace("app_secret = \"s3cr3t-value\"\n", ""));
    match config.validate() {
        Err(ConfigError::Missing { field, env }) => {
            assert_eq!(field, "account.app_secret");
            assert_eq!(env, "WXOA_APP_SECRET");
        }
        other => panic!("expected Missing, got: {other:?}"),
    }
}

#[test]
fn missing_port_is_named() {
    let config = parse(&FULL.replace("port = 8080\n", ""));
    match config.validate() {
        Err(err @ ConfigError::Missing { .. }) => {
            assert!(err.to_string().contains("webhook.port"));
        }
        other => panic!("expected Missing, got: {other:?}"),
    }
}

#[test]
fn env_overrides_file_values() {
    let mut config = parse(FULL);
    config
        .apply_overrides(env_from(&[
            ("WXOA_APP_ID", "wx_env"),
            ("WXOA_PORT", "9090"),
            ("WXOA_API_BASE_URL", "http://127.0.0.1:1/cgi-bin"),
        ]))
        .expect("overrides should apply");
    let settings = config.validate().expect("should validate");
    assert_eq!(settings.app_id, "wx_env");
    assert_eq!(settings.port, 9090);
    assert_eq!(settings.api_base_url, "http://127.0.0.1:1/cgi-bin");
    assert_eq!(settings.token, "mytoken");
}

#[test]
fn env_alone_satisfies_required_fields() {
    let mut config = Config::default();
    config
        .apply_overrides(env_from(&[
            ("WXOA_APP_ID", "wx_env"),
            ("WXOA_APP_SECRET", "secret"),
            ("WXOA_TOKEN", "tok"),
            ("WXOA_PORT", "80"),
            ("WXOA_CACHE_DIR", "/tmp/wxoa-env"),
        ]))
        .expect("overrides should apply");
    let settings = config.validate().expect("should validate");
    assert_eq!(settings.cache_dir, PathBuf::from("/tmp/wxoa-env"));
}

#[test]
fn non_numeric_port_override_is_invalid() {
    let mut config = Config::default();
    let result = config.apply_overrides(env_from(&[("WXOA_PORT", "eighty")]));
    assert!(matches!(
        result,
        Err(ConfigError::Invalid {
            field: "webhook.port",
            ..
        })
    ));
}

#[test]
fn zero_refresh_interval_is_invalid() {
    let config = parse(&FULL.replace("refresh_interval_secs = 600", "refresh_interval_secs = 0"));
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid { .. })
    ));
}

#[test]
fn unknown_dispatch_type_fails_to_parse() {
    let result = toml::from_str::<Config>(&FULL.replace("\"voice\"", "\"event\""));
    assert!(result.is_err());
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = load_config(&tmp.path().join("absent.toml")).expect("defaults");
    assert!(config.account.app_id.is_none());
    assert!(config.webhook.port.is_none());
}

#[test]
fn broken_file_is_parse_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[account\napp_id = ").expect("write config");
    assert!(matches!(
        load_config(&path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn debug_output_redacts_secrets() {
    let config = parse(FULL);
    let config_debug = format!("{config:?}");
    assert!(!config_debug.contains("s3cr3t-value"));
    assert!(!config_debug.contains("mytoken"));

    let settings = config.validate().expect("should validate");
    let settings_debug = format!("{settings:?}");
    assert!(!settings_debug.contains("mytoken"));
    assert!(!settings_debug.contains("s3cr3t-value"));
    assert!(settings_debug.contains("[REDACTED]"));
}
