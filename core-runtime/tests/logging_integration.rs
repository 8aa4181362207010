//! Integration tests for logging and the redaction of backend settings

use core_runtime::config::BackendSettings;
use core_runtime::logging::{
    init_logging, redact_if_sensitive, redact_settings, LogFormat, LogLevel, LoggingConfig,
};
use core_runtime::Error;

#[test]
fn test_invalid_filter_is_a_config_error() {
    // Filter parsing fails before any global subscriber is installed
    let config = LoggingConfig::default().with_filter("core_sync=loudest");
    match init_logging(config) {
        Err(Error::Config(message)) => assert!(message.contains("log filter")),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_backend_settings_debug_is_redacted() {
    let settings = BackendSettings::new("subsonic", "subsonic")
        .with_setting("url", "https://music.example.org")
        .with_setting("password", "hunter2")
        .with_setting("api_token", "abc123");

    let rendered = format!("{:?}", settings);
    assert!(rendered.contains("https://music.example.org"));
    assert!(!rendered.contains("hunter2"));
    assert!(!rendered.contains("abc123"));
}

#[test]
fn test_redact_settings_keeps_keys() {
    let settings = BackendSettings::new("git", "git")
        .with_setting("remote", "ssh://host/music.git")
        .with_setting("ssh_passphrase", "correct horse");

    let redacted = redact_settings(&settings.settings);
    assert_eq!(redacted["remote"], "ssh://host/music.git");
    assert_eq!(redacted["ssh_passphrase"], "[REDACTED]");
}

#[test]
fn test_plain_values_pass_through() {
    assert_eq!(redact_if_sensitive("source", "git"), "git");
    assert_eq!(redact_if_sensitive("kind", "META_ADD"), "META_ADD");
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}
