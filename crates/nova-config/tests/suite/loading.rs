use std::path::PathBuf;
use std::time::Duration;

use nova_config::{ConfigError, NovaConfig};
use tempfile::tempdir;

#[test]
fn loads_debug_and_logging_sections_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nova.toml");
    std::fs::write(
        &path,
        r#"
[logging]
level = "nova.dap.client=trace,info"
stderr = false
file = "/tmp/nova-debug.log"

[debug]
initialize_timeout_ms = 30000
client_id = "nova-test"
locale = "de-de"
"#,
    )
    .unwrap();

    let config = NovaConfig::load_from_path(&path).unwrap();
    assert!(!config.logging.stderr);
    assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/nova-debug.log")));
    assert_eq!(config.debug.initialize_timeout(), Duration::from_secs(30));
    assert_eq!(config.debug.request_timeout(), Duration::from_secs(10));
    assert_eq!(config.debug.client_id, "nova-test");
    assert_eq!(config.debug.client_name, "Nova");
    assert_eq!(config.debug.locale, "de-de");
}

#[test]
fn serialized_defaults_load_back_unchanged() {
    let text = toml::to_string(&NovaConfig::default()).unwrap();
    assert_eq!(NovaConfig::load_from_str(&text).unwrap(), NovaConfig::default());
}

#[test]
fn unreadable_paths_name_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = NovaConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"), "{err}");
}

#[test]
fn unknown_sections_are_rejected() {
    let err = NovaConfig::load_from_str("[jdk]\nhome = \"/opt/jdk\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}
